//! Date/time recovery from log lines.
//!
//! The default detector tries a handful of widespread timestamp shapes
//! (ISO 8601, syslog, CLF). `datepattern` reconfigures it: the shorthands
//! `Epoch` and `TAI64N` are recognized, anything else is a strftime-style
//! template, optionally anchored at line begin with a leading `^`.
//! Times without a timezone are interpreted as UTC.

use std::ops::Range;
use std::sync::OnceLock;

use chrono::{Datelike, NaiveDateTime};
use regex::Regex;

use crate::error::{Error, Result};
use crate::mytime::MyTime;

/// A detected timestamp: epoch seconds plus the matched span.
#[derive(Debug, Clone, PartialEq)]
pub struct DateMatch {
    /// Unix time in seconds.
    pub time: f64,
    /// The byte range of the timestamp inside the line.
    pub span: Range<usize>,
}

#[derive(Debug, Clone)]
enum Pattern {
    /// Built-in format list.
    Default,
    /// `Epoch`: leading unix seconds, optionally bracketed/fractional.
    Epoch,
    /// `TAI64N`: `@` + 24 hex digits.
    Tai64n,
    /// A strftime template translated to a search regex.
    Custom(CustomPattern),
}

#[derive(Debug, Clone)]
struct CustomPattern {
    original: String,
    regex: Regex,
    format: String,
    has_year: bool,
}

/// Recovers event times from lines.
#[derive(Debug, Clone)]
pub struct DateDetector {
    pattern: Pattern,
}

struct BuiltinFormat {
    regex: Regex,
    format: &'static str,
    has_year: bool,
}

fn builtin_formats() -> &'static [BuiltinFormat] {
    static FORMATS: OnceLock<Vec<BuiltinFormat>> = OnceLock::new();
    FORMATS.get_or_init(|| {
        vec![
            // 2005-08-14 12:00:01 / 2005-08-14T12:00:01.123
            BuiltinFormat {
                regex: Regex::new(
                    r"\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}(?:[.,]\d{1,6})?",
                )
                .expect("static regex"),
                format: "%Y-%m-%d %H:%M:%S",
                has_year: true,
            },
            // Aug 14 12:00:01 (syslog, no year)
            BuiltinFormat {
                regex: Regex::new(
                    r"(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec) {1,2}\d{1,2} \d{2}:\d{2}:\d{2}",
                )
                .expect("static regex"),
                format: "%b %d %H:%M:%S",
                has_year: false,
            },
            // 14/Aug/2005:12:00:01 (common log format)
            BuiltinFormat {
                regex: Regex::new(r"\d{2}/(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)/\d{4}:\d{2}:\d{2}:\d{2}")
                    .expect("static regex"),
                format: "%d/%b/%Y:%H:%M:%S",
                has_year: true,
            },
        ]
    })
}

fn epoch_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[?(\d{10,11})(?:\.(\d{1,6}))?\]?").expect("static regex"))
}

fn tai64n_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([0-9a-f]{24})").expect("static regex"))
}

impl Default for DateDetector {
    fn default() -> Self {
        DateDetector {
            pattern: Pattern::Default,
        }
    }
}

impl DateDetector {
    /// Detector with the built-in format list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconfigure from a `datepattern` value.
    pub fn set_pattern(&mut self, pattern: &str) -> Result<()> {
        self.pattern = match pattern {
            "" | "Default" => Pattern::Default,
            "Epoch" => Pattern::Epoch,
            "TAI64N" => Pattern::Tai64n,
            template => Pattern::Custom(CustomPattern::compile(template)?),
        };
        Ok(())
    }

    /// The configured pattern, as handed to `set_pattern`.
    pub fn pattern_description(&self) -> String {
        match &self.pattern {
            Pattern::Default => "Default".to_string(),
            Pattern::Epoch => "Epoch".to_string(),
            Pattern::Tai64n => "TAI64N".to_string(),
            Pattern::Custom(custom) => custom.original.clone(),
        }
    }

    /// Find the event time in `line`, if any.
    pub fn get_time(&self, line: &str) -> Option<DateMatch> {
        match &self.pattern {
            Pattern::Default => {
                for fmt in builtin_formats() {
                    // only the first candidate of each format is considered
                    let Some(m) = fmt.regex.find(line) else {
                        continue;
                    };
                    if let Some(time) = parse_with_format(m.as_str(), fmt.format, fmt.has_year) {
                        return Some(DateMatch {
                            time,
                            span: m.range(),
                        });
                    }
                }
                None
            }
            Pattern::Epoch => {
                let caps = epoch_regex().captures(line)?;
                let whole = caps.get(0)?;
                let seconds: f64 = caps.get(1)?.as_str().parse().ok()?;
                let frac = caps
                    .get(2)
                    .and_then(|m| format!("0.{}", m.as_str()).parse::<f64>().ok())
                    .unwrap_or(0.0);
                Some(DateMatch {
                    time: seconds + frac,
                    span: whole.range(),
                })
            }
            Pattern::Tai64n => {
                let caps = tai64n_regex().captures(line)?;
                let whole = caps.get(0)?;
                let hex = caps.get(1)?.as_str();
                let seconds = u64::from_str_radix(&hex[..16], 16).ok()?;
                let nanos = u32::from_str_radix(&hex[16..24], 16).ok()?;
                // TAI64 labels offset seconds by 2^62.
                let seconds = seconds.checked_sub(1u64 << 62)?;
                Some(DateMatch {
                    time: seconds as f64 + nanos as f64 / 1e9,
                    span: whole.range(),
                })
            }
            Pattern::Custom(custom) => {
                let m = custom.regex.find(line)?;
                let time = parse_with_format(m.as_str(), &custom.format, custom.has_year)?;
                Some(DateMatch {
                    time,
                    span: m.range(),
                })
            }
        }
    }
}

/// Parse a matched timestamp with a chrono format string.
///
/// Fractional seconds and a `T` separator are normalized away first; a
/// missing year is filled from the current clock, falling back one year
/// when the result would lie in the future.
fn parse_with_format(text: &str, format: &str, has_year: bool) -> Option<f64> {
    let mut cleaned = text.replace('T', " ");
    let mut frac = 0.0;
    if let Some(at) = cleaned.find([',', '.']) {
        if cleaned[at + 1..].chars().all(|c| c.is_ascii_digit()) {
            frac = format!("0.{}", &cleaned[at + 1..]).parse().unwrap_or(0.0);
            cleaned.truncate(at);
        }
    }

    if has_year {
        let dt = NaiveDateTime::parse_from_str(&cleaned, format).ok()?;
        return Some(dt.and_utc().timestamp() as f64 + frac);
    }

    let now = MyTime::time();
    let this_year = chrono::DateTime::from_timestamp(now as i64, 0)?.year();
    for year in [this_year, this_year - 1] {
        let candidate = format!("{} {}", year, cleaned);
        let with_year = format!("%Y {}", format);
        if let Ok(dt) = NaiveDateTime::parse_from_str(&candidate, &with_year) {
            let time = dt.and_utc().timestamp() as f64 + frac;
            if time <= now + 86_400.0 {
                return Some(time);
            }
        }
    }
    None
}

impl CustomPattern {
    /// Translate a strftime template into a search regex + parse format.
    fn compile(template: &str) -> Result<CustomPattern> {
        let (anchored, body) = match template.strip_prefix('^') {
            Some(rest) => (true, rest),
            None => (false, template),
        };

        let mut regex = String::new();
        if anchored {
            regex.push('^');
        }
        let mut format = String::new();
        let mut has_year = false;
        let mut chars = body.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '%' {
                regex.push_str(&regex::escape(&c.to_string()));
                format.push(c);
                continue;
            }
            let Some(directive) = chars.next() else {
                return Err(Error::InvalidArgument(format!(
                    "invalid datepattern {:?}: trailing '%'",
                    template
                )));
            };
            let piece = match directive {
                'Y' => {
                    has_year = true;
                    r"\d{4}"
                }
                'y' => {
                    has_year = true;
                    r"\d{2}"
                }
                'm' => r"\d{2}",
                'd' => r"\d{1,2}",
                'H' => r"\d{2}",
                'M' => r"\d{2}",
                'S' => r"\d{2}",
                'f' => r"\d{1,6}",
                'b' => r"(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)",
                'a' => r"(?:Mon|Tue|Wed|Thu|Fri|Sat|Sun)",
                'z' => r"(?:[+-]\d{4}|Z)",
                '%' => {
                    regex.push('%');
                    format.push('%');
                    continue;
                }
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "invalid datepattern {:?}: unsupported directive %{}",
                        template, other
                    )));
                }
            };
            regex.push_str(piece);
            format.push('%');
            format.push(directive);
        }

        let regex = Regex::new(&regex).map_err(|e| {
            Error::InvalidArgument(format!("invalid datepattern {:?}: {}", template, e))
        })?;
        Ok(CustomPattern {
            original: template.to_string(),
            regex,
            format,
            has_year,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mytime::AlternateNowGuard;

    #[test]
    fn test_iso_format() {
        let detector = DateDetector::new();
        let m = detector
            .get_time("2005-08-14 12:00:01 sshd[123]: failed")
            .unwrap();
        assert_eq!(m.time, 1_124_020_801.0);
        assert_eq!(m.span, 0..19);
    }

    #[test]
    fn test_syslog_format_injects_year() {
        // Pin the clock into 2005 so the year injection is deterministic.
        let _guard = AlternateNowGuard::set(1_124_020_900.0);
        let detector = DateDetector::new();
        let m = detector
            .get_time("Aug 14 12:00:01 host sshd[123]: failed")
            .unwrap();
        assert_eq!(m.time, 1_124_020_801.0);
    }

    #[test]
    fn test_epoch_pattern() {
        let mut detector = DateDetector::new();
        detector.set_pattern("Epoch").unwrap();
        let m = detector.get_time("1124020801 failed login").unwrap();
        assert_eq!(m.time, 1_124_020_801.0);

        let m = detector.get_time("[1124020801.500] failed login").unwrap();
        assert_eq!(m.time, 1_124_020_801.5);
    }

    #[test]
    fn test_tai64n_pattern() {
        let mut detector = DateDetector::new();
        detector.set_pattern("TAI64N").unwrap();
        // 2^62 + 1124020801 = 4000000043006141 hex-ish; compute directly:
        let label = format!("@{:016x}{:08x}", (1u64 << 62) + 1_124_020_801, 0);
        let m = detector.get_time(&format!("{} failed", label)).unwrap();
        assert_eq!(m.time, 1_124_020_801.0);
    }

    #[test]
    fn test_custom_anchored_pattern() {
        let mut detector = DateDetector::new();
        detector.set_pattern("^%Y/%m/%d %H:%M:%S").unwrap();
        let m = detector.get_time("2005/08/14 12:00:01 oops").unwrap();
        assert_eq!(m.time, 1_124_020_801.0);
        // anchored: a mid-line date must not match
        assert!(detector.get_time("x 2005/08/14 12:00:01").is_none());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut detector = DateDetector::new();
        assert!(detector.set_pattern("%Q").is_err());
        assert!(detector.set_pattern("%").is_err());
    }

    #[test]
    fn test_no_date() {
        let detector = DateDetector::new();
        assert!(detector.get_time("no timestamp here").is_none());
    }
}
