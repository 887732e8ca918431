//! Failure regex templates and host extraction.
//!
//! Before compilation the template tags are expanded into named groups:
//!
//! | tag | group |
//! |---|---|
//! | `<HOST>` | alternation of `ip6` / `ip4` / `dns` |
//! | `<IP4>` / `<IP6>` / `<DNS>` | `ip4` / `ip6` / `dns` |
//! | `<F-ID>...</F-ID>` | `fid` (raw identifier, never resolved) |
//! | `<F-NAME>...</F-NAME>` | `name` lowercased, lands in ticket data |
//!
//! The inline IPv6 pattern is permissive; extracted candidates are
//! validated by the address parser afterwards.

use regex::Regex;

use crate::error::{Error, Result};

const IP4_PATTERN: &str = r"(?:\d{1,3}\.){3}\d{1,3}";
const IP6_PATTERN: &str =
    r"(?:[0-9a-fA-F]{1,4}::?){1,7}[0-9a-fA-F]{0,4}|::(?:[0-9a-fA-F]{1,4}:?){1,7}|::";
const DNS_PATTERN: &str = r"[\w\-.^_]*\w";

/// Everything a failure regex pulled out of one line.
#[derive(Debug, Default, Clone)]
pub struct FailMatch {
    /// Explicit raw identifier (`fid` group).
    pub fid: Option<String>,
    /// IPv4 candidate.
    pub ip4: Option<String>,
    /// IPv6 candidate.
    pub ip6: Option<String>,
    /// DNS name candidate.
    pub dns: Option<String>,
    /// User-supplied `host` group, tried as IP then as name.
    pub host: Option<String>,
    /// Remaining named groups (port, user, ...).
    pub data: Vec<(String, String)>,
}

impl FailMatch {
    /// Whether any identifier was captured at all.
    pub fn has_id(&self) -> bool {
        self.fid.is_some()
            || self.ip4.is_some()
            || self.ip6.is_some()
            || self.dns.is_some()
            || self.host.is_some()
    }
}

/// One compiled failure regex, keeping the original template for `get`.
#[derive(Debug, Clone)]
pub struct FailRegex {
    original: String,
    regex: Regex,
}

impl FailRegex {
    /// Expand template tags and compile.
    pub fn compile(template: &str) -> Result<FailRegex> {
        let expanded = expand_template(template);
        let regex = Regex::new(&expanded)
            .map_err(|e| Error::InvalidArgument(format!("unable to compile regular expression {:?}: {}", template, e)))?;
        Ok(FailRegex {
            original: template.to_string(),
            regex,
        })
    }

    /// The template as configured.
    pub fn original(&self) -> &str {
        &self.original
    }

    /// Apply to a line; `None` when it does not match.
    pub fn search(&self, line: &str) -> Option<FailMatch> {
        let caps = self.regex.captures(line)?;
        let mut found = FailMatch::default();
        for name in self.regex.capture_names().flatten() {
            let Some(value) = caps.name(name) else {
                continue;
            };
            let value = value.as_str().to_string();
            match name {
                "fid" => found.fid = Some(value),
                "ip4" => found.ip4 = Some(value),
                "ip6" => found.ip6 = Some(value),
                "dns" => found.dns = Some(value),
                "host" => found.host = Some(value),
                other => found.data.push((other.to_string(), value)),
            }
        }
        Some(found)
    }
}

/// A plain regex list entry (ignoreregex, prefregex).
#[derive(Debug, Clone)]
pub struct PlainRegex {
    original: String,
    regex: Regex,
}

impl PlainRegex {
    /// Compile, surfacing bad patterns as configuration errors.
    pub fn compile(pattern: &str) -> Result<PlainRegex> {
        let regex = Regex::new(pattern).map_err(|e| {
            Error::InvalidArgument(format!("unable to compile regular expression {:?}: {}", pattern, e))
        })?;
        Ok(PlainRegex {
            original: pattern.to_string(),
            regex,
        })
    }

    /// The pattern as configured.
    pub fn original(&self) -> &str {
        &self.original
    }

    /// Whether the line matches.
    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }

    /// Text after the match end (used by prefregex to pass its tail on).
    pub fn tail<'a>(&self, line: &'a str) -> Option<&'a str> {
        let m = self.regex.find(line)?;
        Some(line[m.end()..].trim_start())
    }
}

/// Expand `<HOST>`-style tags into named-group regex fragments.
fn expand_template(template: &str) -> String {
    let expanded = template
        .replace(
            "<HOST>",
            &format!(
                r"(?:\[?(?P<ip6>{})\]?|(?P<ip4>{})|(?P<dns>{}))",
                IP6_PATTERN, IP4_PATTERN, DNS_PATTERN
            ),
        )
        .replace("<IP4>", &format!(r"(?P<ip4>{})", IP4_PATTERN))
        .replace("<IP6>", &format!(r"\[?(?P<ip6>{})\]?", IP6_PATTERN))
        .replace("<DNS>", &format!(r"(?P<dns>{})", DNS_PATTERN));

    // <F-NAME> ... </F-NAME> pairs become named groups.
    let tag_re = Regex::new(r"</?F-([A-Za-z0-9]+)>").expect("static regex");
    let mut rewritten = String::with_capacity(expanded.len());
    let mut last = 0;
    for caps in tag_re.captures_iter(&expanded) {
        let whole = caps.get(0).expect("group 0");
        rewritten.push_str(&expanded[last..whole.start()]);
        let name = caps.get(1).expect("tag name").as_str().to_ascii_lowercase();
        if whole.as_str().starts_with("</") {
            rewritten.push(')');
        } else if name == "id" {
            rewritten.push_str("(?P<fid>");
        } else {
            rewritten.push_str(&format!("(?P<{}>", name));
        }
        last = whole.end();
    }
    rewritten.push_str(&expanded[last..]);
    rewritten
}
