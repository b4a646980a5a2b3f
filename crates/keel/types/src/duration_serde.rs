//! Serde helpers for configuration durations
//!
//! Durations accept either integer seconds (`300`) or an ISO-8601 time
//! duration (`PT5M`, `PT1M30S`, `PT0.5S`). They are always written back in
//! the ISO-8601 form so persisted snapshots round-trip.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> Result<Duration, String> {
        match self {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(text) => parse_iso8601(&text),
        }
    }
}

/// Parse an ISO-8601 time duration such as `PT1H2M3.5S`.
pub fn parse_iso8601(text: &str) -> Result<Duration, String> {
    let body = text
        .trim()
        .strip_prefix("PT")
        .ok_or_else(|| format!("duration '{}' must start with 'PT'", text))?;

    if body.is_empty() {
        return Err(format!("duration '{}' has no components", text));
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut last_unit_rank = 0u8;

    for ch in body.chars() {
        match ch {
            '0'..='9' | '.' => number.push(ch),
            'H' | 'M' | 'S' => {
                let rank = match ch {
                    'H' => 1,
                    'M' => 2,
                    _ => 3,
                };
                if rank <= last_unit_rank {
                    return Err(format!("duration '{}' has out-of-order components", text));
                }
                last_unit_rank = rank;

                if number.is_empty() {
                    return Err(format!("duration '{}' has a unit without a value", text));
                }
                let value: f64 = number
                    .parse()
                    .map_err(|_| format!("duration '{}' has an invalid number '{}'", text, number))?;
                if ch != 'S' && number.contains('.') {
                    return Err(format!(
                        "duration '{}' only allows fractions on seconds",
                        text
                    ));
                }
                let secs = match ch {
                    'H' => value * 3600.0,
                    'M' => value * 60.0,
                    _ => value,
                };
                total += Duration::from_secs_f64(secs);
                number.clear();
            }
            other => {
                return Err(format!(
                    "duration '{}' has an unexpected character '{}'",
                    text, other
                ))
            }
        }
    }

    if !number.is_empty() {
        return Err(format!("duration '{}' ends without a unit", text));
    }

    Ok(total)
}

/// Render a duration as ISO-8601 (`PT90S`, `PT0.250S`).
pub fn format_iso8601(duration: &Duration) -> String {
    let millis = duration.subsec_millis();
    if millis == 0 {
        format!("PT{}S", duration.as_secs())
    } else {
        format!("PT{}.{:03}S", duration.as_secs(), millis)
    }
}

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_iso8601(duration))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    RawDuration::deserialize(deserializer)?
        .into_duration()
        .map_err(serde::de::Error::custom)
}

/// Same encoding for optional durations.
pub mod option {
    use super::{format_iso8601, RawDuration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&format_iso8601(d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<RawDuration>::deserialize(deserializer)?
            .map(|raw| raw.into_duration().map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_iso8601() {
        assert_eq!(parse_iso8601("PT5M").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_iso8601("PT1H2M3S").unwrap(), Duration::from_secs(3723));
        assert_eq!(parse_iso8601("PT0.5S").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_iso8601("5M").is_err());
        assert!(parse_iso8601("PT").is_err());
        assert!(parse_iso8601("PT5").is_err());
        assert!(parse_iso8601("PT5S1M").is_err());
        assert!(parse_iso8601("PT1.5M").is_err());
    }

    #[test]
    fn test_format_round_trips() {
        for d in [Duration::from_secs(0), Duration::from_secs(61), Duration::from_millis(1250)] {
            assert_eq!(parse_iso8601(&format_iso8601(&d)).unwrap(), d);
        }
    }
}
