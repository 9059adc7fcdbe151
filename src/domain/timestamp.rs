//! Timestamp formats for stored messages
//!
//! Tables are configured with custom date/time patterns such as
//! `yyyy-MM-dd HH:mm:ss`. Each pattern is translated once into a chrono
//! strftime pattern and validated by formatting a fixed sample and parsing
//! it back.

use chrono::format::{parse, Item, Parsed, StrftimeItems};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::fmt::{self, Display, Write};

/// Pattern applied when a table entry does not name one.
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "yyyy-MM-dd HH:mm:ss";

/// A validated timestamp pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimestampFormat {
    /// Pattern as written in the configuration
    pattern: String,
    /// Equivalent chrono strftime pattern
    strftime: String,
}

impl TimestampFormat {
    /// Parse and validate a pattern. Returns `None` for blank, malformed or
    /// information-free patterns.
    pub fn parse(pattern: &str) -> Option<Self> {
        if pattern.trim().is_empty() {
            return None;
        }

        let strftime = translate(pattern)?;
        if StrftimeItems::new(&strftime).any(|item| matches!(item, Item::Error)) {
            return None;
        }

        let sample = sample_datetime();
        let mut rendered = String::new();
        write!(rendered, "{}", sample.format(&strftime)).ok()?;

        let mut parsed = Parsed::new();
        parse(&mut parsed, &rendered, StrftimeItems::new(&strftime)).ok()?;

        Some(Self { pattern: pattern.to_string(), strftime })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn strftime(&self) -> &str {
        &self.strftime
    }

    /// Render a timestamp with this pattern
    pub fn format<Tz>(&self, timestamp: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let mut out = String::with_capacity(self.strftime.len() + 8);
        if write!(out, "{}", timestamp.format(&self.strftime)).is_err() {
            // Validated patterns always render; keep the row rather than lose it.
            out.clear();
            out.push_str(&timestamp.to_rfc3339());
        }
        out
    }
}

impl Default for TimestampFormat {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_TIMESTAMP_FORMAT.to_string(),
            strftime: "%Y-%m-%d %H:%M:%S".to_string(),
        }
    }
}

impl Display for TimestampFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

fn sample_datetime() -> DateTime<Utc> {
    let naive = NaiveDate::from_ymd_opt(2022, 4, 26)
        .and_then(|date| date.and_hms_milli_opt(16, 10, 30, 500))
        .unwrap_or_default();
    Utc.from_utc_datetime(&naive)
}

fn push_literal(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}

/// Translate a custom date/time pattern into strftime.
///
/// Returns `None` on unterminated quotes, dangling escapes, over-long
/// fraction runs, or when the pattern carries no date/time field at all.
fn translate(pattern: &str) -> Option<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut has_field = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let run = chars[i..].iter().take_while(|&&x| x == c).count();

        let spec = match c {
            'y' => Some(match run {
                1 => "%-y",
                2 => "%y",
                _ => "%Y",
            }),
            'M' => Some(match run {
                1 => "%-m",
                2 => "%m",
                3 => "%b",
                _ => "%B",
            }),
            'd' => Some(match run {
                1 => "%-d",
                2 => "%d",
                3 => "%a",
                _ => "%A",
            }),
            'H' => Some(if run == 1 { "%-H" } else { "%H" }),
            'h' => Some(if run == 1 { "%-I" } else { "%I" }),
            'm' => Some(if run == 1 { "%-M" } else { "%M" }),
            's' => Some(if run == 1 { "%-S" } else { "%S" }),
            'f' | 'F' => Some(match run {
                1..=3 => "%3f",
                4..=6 => "%6f",
                7..=9 => "%9f",
                _ => return None,
            }),
            't' => Some("%p"),
            'z' | 'K' => Some("%:z"),
            _ => None,
        };

        if let Some(spec) = spec {
            out.push_str(spec);
            has_field = true;
            i += run;
            continue;
        }

        match c {
            '\'' | '"' => {
                let end = chars[i + 1..].iter().position(|&x| x == c)?;
                for &literal in &chars[i + 1..i + 1 + end] {
                    push_literal(&mut out, literal);
                }
                i += end + 2;
            }
            '\\' => {
                let escaped = *chars.get(i + 1)?;
                push_literal(&mut out, escaped);
                i += 2;
            }
            // "%d" selects the single-letter form of a specifier
            '%' => {
                chars.get(i + 1)?;
                i += 1;
            }
            'g' => {
                out.push_str("A.D.");
                i += run;
            }
            _ => {
                push_literal(&mut out, c);
                i += 1;
            }
        }
    }

    has_field.then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Local};

    #[test]
    fn test_default_pattern_is_valid() {
        let format = TimestampFormat::parse(DEFAULT_TIMESTAMP_FORMAT).unwrap();
        assert_eq!(format.strftime(), "%Y-%m-%d %H:%M:%S");
        assert_eq!(format, TimestampFormat::default());
    }

    #[test]
    fn test_blank_patterns_rejected() {
        assert!(TimestampFormat::parse("").is_none());
        assert!(TimestampFormat::parse("   ").is_none());
    }

    #[test]
    fn test_literal_only_patterns_rejected() {
        // Parses back to nothing
        assert!(TimestampFormat::parse("'hello'").is_none());
        assert!(TimestampFormat::parse("abc").is_none());
        assert!(TimestampFormat::parse("---").is_none());
    }

    #[test]
    fn test_malformed_patterns_rejected() {
        assert!(TimestampFormat::parse("yyyy 'unterminated").is_none());
        assert!(TimestampFormat::parse("yyyy\\").is_none());
        assert!(TimestampFormat::parse("ss.ffffffffff").is_none());
    }

    #[test]
    fn test_common_patterns_accepted() {
        for pattern in [
            "yyyy-MM-dd HH:mm:ss",
            "yyyy-MM-dd HH:mm:ss.fff",
            "yyyy-MM-ddTHH:mm:ss",
            "yyyyMMddTHHmmssfff",
            "yyyyMMddHHmmss",
            "dd/MM/yyyy hh:mm:ss tt",
            "dddd, MMMM d yyyy",
            "HH:mm",
            "yyyy",
        ] {
            assert!(TimestampFormat::parse(pattern).is_some(), "{pattern} should be valid");
        }
    }

    #[test]
    fn test_format_renders_sample() {
        let sample = sample_datetime();
        let format = TimestampFormat::parse("yyyy-MM-ddTHH:mm:ss.fff").unwrap();
        assert_eq!(format.format(&sample), "2022-04-26T16:10:30.500");

        let compact = TimestampFormat::parse("yyyyMMddHHmmss").unwrap();
        assert_eq!(compact.format(&sample), "20220426161030");

        let named = TimestampFormat::parse("ddd, dd MMM yyyy").unwrap();
        assert_eq!(named.format(&sample), "Tue, 26 Apr 2022");
    }

    #[test]
    fn test_quoted_literals_and_escapes() {
        let sample = sample_datetime();
        let format = TimestampFormat::parse("'at' HH\\h mm \"min\"").unwrap();
        assert_eq!(format.format(&sample), "at 16h 10 min");
        assert!(TimestampFormat::parse("HH%").is_none());
    }

    #[test]
    fn test_offset_rendering() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let ts = sample_datetime().with_timezone(&offset);
        let format = TimestampFormat::parse("HH:mm zzz").unwrap();
        assert_eq!(format.format(&ts), "18:10 +02:00");
    }

    #[test]
    fn test_format_local_time() {
        let format = TimestampFormat::default();
        let rendered = format.format(&Local::now());
        assert_eq!(rendered.len(), "2022-04-26 16:10:30".len());
    }
}
