use std::time::Duration;

use crate::error::SqlmeterError;

/// Parse a short duration literal like `500ms`, `5s`, `2m`, `1h`
/// (spec.md §4.1 `idle: <duration>`, §4.2 client-group `runtime`).
///
/// spec.md §1's Non-goals exclude fully general calendar/duration
/// parsing; this covers `ms`/`s`/`m`/`h` suffixes only.
pub fn parse_duration(input: &str) -> Result<Duration, SqlmeterError> {
    let input = input.trim();
    let split_at = input
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| SqlmeterError::Validation(format!("duration '{input}' has no unit")))?;
    let (number, unit) = input.split_at(split_at);
    let value: f64 = number
        .parse()
        .map_err(|_| SqlmeterError::Validation(format!("invalid duration number in '{input}'")))?;

    let millis = match unit {
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        other => {
            return Err(SqlmeterError::Validation(format!(
                "unknown duration unit '{other}' in '{input}'"
            )))
        }
    };
    Ok(Duration::from_millis(millis.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_milliseconds() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn parses_seconds() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn parses_minutes_and_hours() {
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_duration("5x").is_err());
    }

    #[test]
    fn rejects_missing_unit() {
        assert!(parse_duration("500").is_err());
    }
}
