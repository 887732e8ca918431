//! Log level names and their numeric values.
//!
//! The protocol accepts the symbolic names `CRITICAL ERROR WARNING NOTICE
//! INFO DEBUG TRACEDEBUG HEAVYDEBUG` or their numeric values 50..5. The
//! daemon maps them onto `tracing` filter directives, which have fewer
//! levels, so several names collapse onto one directive.

use crate::error::ProtocolError;

/// A protocol log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Numeric 5: everything, including per-line trace output.
    HeavyDebug,
    /// Numeric 7: tracing of internal decisions.
    TraceDebug,
    /// Numeric 10.
    Debug,
    /// Numeric 20.
    Info,
    /// Numeric 25.
    Notice,
    /// Numeric 30.
    Warning,
    /// Numeric 40.
    Error,
    /// Numeric 50.
    Critical,
}

impl LogLevel {
    /// All levels, most severe first.
    pub const ALL: [LogLevel; 8] = [
        LogLevel::Critical,
        LogLevel::Error,
        LogLevel::Warning,
        LogLevel::Notice,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::TraceDebug,
        LogLevel::HeavyDebug,
    ];

    /// The canonical protocol name.
    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Critical => "CRITICAL",
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARNING",
            LogLevel::Notice => "NOTICE",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::TraceDebug => "TRACEDEBUG",
            LogLevel::HeavyDebug => "HEAVYDEBUG",
        }
    }

    /// The numeric protocol value.
    pub fn number(&self) -> u8 {
        match self {
            LogLevel::Critical => 50,
            LogLevel::Error => 40,
            LogLevel::Warning => 30,
            LogLevel::Notice => 25,
            LogLevel::Info => 20,
            LogLevel::Debug => 10,
            LogLevel::TraceDebug => 7,
            LogLevel::HeavyDebug => 5,
        }
    }

    /// The `tracing` env-filter directive this level maps to.
    pub fn tracing_directive(&self) -> &'static str {
        match self {
            LogLevel::Critical | LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Notice | LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::TraceDebug | LogLevel::HeavyDebug => "trace",
        }
    }

    /// Parse a symbolic name or numeric value.
    pub fn parse(token: &str) -> Result<LogLevel, ProtocolError> {
        let upper = token.to_ascii_uppercase();
        for level in LogLevel::ALL {
            if level.name() == upper {
                return Ok(level);
            }
        }
        if let Ok(n) = token.parse::<u8>() {
            for level in LogLevel::ALL {
                if level.number() == n {
                    return Ok(level);
                }
            }
        }
        Err(ProtocolError::InvalidLogLevel(token.to_string()))
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names_and_numbers() {
        assert_eq!(LogLevel::parse("INFO").unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::parse("notice").unwrap(), LogLevel::Notice);
        assert_eq!(LogLevel::parse("50").unwrap(), LogLevel::Critical);
        assert_eq!(LogLevel::parse("5").unwrap(), LogLevel::HeavyDebug);
        assert!(LogLevel::parse("verbose").is_err());
        assert!(LogLevel::parse("42").is_err());
    }

    #[test]
    fn test_tracing_mapping() {
        assert_eq!(LogLevel::Critical.tracing_directive(), "error");
        assert_eq!(LogLevel::Notice.tracing_directive(), "info");
        assert_eq!(LogLevel::HeavyDebug.tracing_directive(), "trace");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(LogLevel::Critical > LogLevel::Debug);
        assert!(LogLevel::HeavyDebug < LogLevel::TraceDebug);
    }
}
