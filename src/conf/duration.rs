//! Human-readable durations in the configuration file
//!
//! Values are written the way operators expect ("10s", "1m30s", "250ms") and
//! serialized back in the same shape, so a load/serialize/load round trip is
//! the identity.

use std::fmt;
use std::ops::Deref;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// A `Duration` that (de)serializes as a compact string like `10s` or `1m30s`.
///
/// A bare number is accepted and interpreted as seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StringDuration(pub Duration);

impl StringDuration {
    pub const fn from_secs(secs: u64) -> Self {
        StringDuration(Duration::from_secs(secs))
    }

    pub const fn from_millis(millis: u64) -> Self {
        StringDuration(Duration::from_millis(millis))
    }
}

impl Deref for StringDuration {
    type Target = Duration;

    fn deref(&self) -> &Duration {
        &self.0
    }
}

impl From<Duration> for StringDuration {
    fn from(d: Duration) -> Self {
        StringDuration(d)
    }
}

impl From<StringDuration> for Duration {
    fn from(d: StringDuration) -> Self {
        d.0
    }
}

fn parse(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".into());
    }

    // bare number = seconds
    if let Ok(secs) = s.parse::<f64>() {
        if secs < 0.0 {
            return Err(format!("negative duration: '{s}'"));
        }
        return Ok(Duration::from_secs_f64(secs));
    }

    let mut total = Duration::ZERO;
    let mut num = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
            continue;
        }

        let unit = if c == 'm' && chars.peek() == Some(&'s') {
            chars.next();
            "ms"
        } else {
            match c {
                'h' => "h",
                'm' => "m",
                's' => "s",
                _ => return Err(format!("invalid duration: '{s}'")),
            }
        };

        let value: f64 = num
            .parse()
            .map_err(|_| format!("invalid duration: '{s}'"))?;
        num.clear();

        let secs = match unit {
            "h" => value * 3600.0,
            "m" => value * 60.0,
            "s" => value,
            _ => value / 1000.0,
        };
        total += Duration::from_secs_f64(secs);
    }

    if !num.is_empty() {
        return Err(format!("invalid duration: '{s}' (missing unit)"));
    }

    Ok(total)
}

fn format(d: Duration) -> String {
    let total_ms = d.as_millis();
    if total_ms == 0 {
        return "0s".into();
    }
    if total_ms % 1000 != 0 {
        return format!("{total_ms}ms");
    }

    let mut secs = d.as_secs();
    let mut out = String::new();
    let hours = secs / 3600;
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
        secs %= 3600;
    }
    let mins = secs / 60;
    if mins > 0 {
        out.push_str(&format!("{mins}m"));
        secs %= 60;
    }
    if secs > 0 || out.is_empty() {
        out.push_str(&format!("{secs}s"));
    }
    out
}

impl fmt::Display for StringDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format(self.0))
    }
}

impl Serialize for StringDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(self.0))
    }
}

impl<'de> Deserialize<'de> for StringDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl serde::de::Visitor<'_> for Visitor {
            type Value = StringDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string like '10s' or a number of seconds")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                parse(v).map(StringDuration).map_err(de::Error::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(StringDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                if v < 0 {
                    return Err(de::Error::custom("negative duration"));
                }
                Ok(StringDuration(Duration::from_secs(v as u64)))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                if v < 0.0 {
                    return Err(de::Error::custom("negative duration"));
                }
                Ok(StringDuration(Duration::from_secs_f64(v)))
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse("5").unwrap(), Duration::from_secs(5));
        assert_eq!(parse("0.5s").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse("").is_err());
        assert!(parse("10x").is_err());
        assert!(parse("10s5").is_err());
        assert!(parse("-3s").is_err());
    }

    #[test]
    fn test_format_round_trip() {
        for s in ["10s", "250ms", "1m30s", "2h", "1h2m3s", "0s"] {
            let d = parse(s).unwrap();
            assert_eq!(format(d), s, "round trip of {s}");
        }
    }

    #[test]
    fn test_serde() {
        let d: StringDuration = serde_yaml::from_str("10s").unwrap();
        assert_eq!(d, StringDuration::from_secs(10));

        let d: StringDuration = serde_yaml::from_str("7").unwrap();
        assert_eq!(d, StringDuration::from_secs(7));

        assert_eq!(serde_yaml::to_string(&StringDuration::from_secs(90)).unwrap().trim(), "1m30s");
    }
}
