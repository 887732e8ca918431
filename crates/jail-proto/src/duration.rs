//! The time-interval grammar.
//!
//! Accepted forms: a signed integer number of seconds (`"600"`, `"-30"`),
//! or one or more `<number><suffix>` terms optionally separated by spaces
//! (`"15d 5h 30m"`, `"1h30m"`). Suffixes: `s m h d w mo y` with `mo` a
//! 30-day month and `y` a 365-day year.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::space0,
    combinator::{map_res, opt},
    multi::many1,
    sequence::{pair, terminated},
    IResult,
};

use crate::error::ProtocolError;

/// Seconds per suffix unit.
fn unit_seconds(unit: &str) -> i64 {
    match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        "mo" => 2_592_000,
        "y" => 31_536_000,
        _ => unreachable!("parser only yields known units"),
    }
}

fn number(input: &str) -> IResult<&str, i64> {
    map_res(take_while1(|c: char| c.is_ascii_digit()), str::parse)(input)
}

/// One `<number><suffix>` term. `mo` must be tried before `m`.
fn term(input: &str) -> IResult<&str, i64> {
    let (rest, (n, unit)) = pair(
        number,
        alt((tag("mo"), tag("s"), tag("m"), tag("h"), tag("d"), tag("w"), tag("y"))),
    )(input)?;
    Ok((rest, n * unit_seconds(unit)))
}

fn terms(input: &str) -> IResult<&str, i64> {
    let (rest, parts) = many1(terminated(term, space0))(input)?;
    Ok((rest, parts.iter().sum()))
}

fn interval(input: &str) -> IResult<&str, i64> {
    let (rest, sign) = opt(alt((tag("-"), tag("+"))))(input)?;
    let (rest, _) = space0(rest)?;
    let (rest, total) = alt((terms, number))(rest)?;
    Ok((rest, if sign == Some("-") { -total } else { total }))
}

/// Parse a time interval into seconds.
pub fn parse_interval(text: &str) -> Result<i64, ProtocolError> {
    let trimmed = text.trim().to_ascii_lowercase();
    match interval(&trimmed) {
        Ok(("", total)) => Ok(total),
        _ => Err(ProtocolError::InvalidInterval(text.to_string())),
    }
}

/// Format seconds back into the largest-unit-first interval form.
///
/// `format_interval(1315800) == "15d 5h 30m"`. Zero formats as `"0"`.
pub fn format_interval(mut seconds: i64) -> String {
    if seconds == 0 {
        return "0".to_string();
    }
    let mut out = String::new();
    if seconds < 0 {
        out.push('-');
        seconds = -seconds;
    }
    let units: [(&str, i64); 7] = [
        ("y", 31_536_000),
        ("mo", 2_592_000),
        ("w", 604_800),
        ("d", 86_400),
        ("h", 3_600),
        ("m", 60),
        ("s", 1),
    ];
    let mut first = true;
    for (suffix, size) in units {
        let n = seconds / size;
        if n > 0 {
            if !first {
                out.push(' ');
            }
            out.push_str(&format!("{}{}", n, suffix));
            seconds -= n * size;
            first = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_seconds() {
        assert_eq!(parse_interval("600").unwrap(), 600);
        assert_eq!(parse_interval("-30").unwrap(), -30);
        assert_eq!(parse_interval("+45").unwrap(), 45);
    }

    #[test]
    fn test_suffixed_terms() {
        assert_eq!(parse_interval("15d 5h 30m").unwrap(), 1_315_800);
        assert_eq!(parse_interval("15d 5h 30m 10s").unwrap(), 1_315_810);
        assert_eq!(parse_interval("1h30m").unwrap(), 5_400);
        assert_eq!(parse_interval("2w").unwrap(), 1_209_600);
        assert_eq!(parse_interval("1mo").unwrap(), 2_592_000);
        assert_eq!(parse_interval("1y").unwrap(), 31_536_000);
        assert_eq!(parse_interval("-30m").unwrap(), -1_800);
    }

    #[test]
    fn test_case_and_whitespace() {
        assert_eq!(parse_interval(" 15D 5H 30M ").unwrap(), 1_315_800);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_interval("").is_err());
        assert!(parse_interval("15x").is_err());
        assert!(parse_interval("d15").is_err());
        assert!(parse_interval("15d foo").is_err());
    }

    #[test]
    fn test_format_round_trip() {
        for secs in [0, 1, 59, 60, 3_661, 1_315_800, 31_536_000] {
            let formatted = format_interval(secs);
            assert_eq!(parse_interval(&formatted).unwrap(), secs, "{}", formatted);
        }
        assert_eq!(format_interval(1_315_800), "15d 5h 30m");
    }
}
