use std::time::Duration;

/// Parses a duration that operators may have written either as a bare
/// integer (seconds) or with a trailing unit suffix (`s`, `m`, `h`).
///
/// Returns `None` for empty/unparsable input rather than erroring — callers
/// treat a missing value as "no override configured".
pub fn parse_flexible_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let (number, unit) = value.split_at(value.len() - 1);
    let scale = match unit {
        "s" => 1u64,
        "m" => 60,
        "h" => 3_600,
        _ => return None,
    };
    let count: u64 = number.trim().parse().ok()?;
    Some(Duration::from_secs(count.saturating_mul(scale)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_seconds() {
        assert_eq!(parse_flexible_duration("30"), Some(Duration::from_secs(30)));
    }

    #[test]
    fn parses_suffixed_units() {
        assert_eq!(parse_flexible_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_flexible_duration("2h"), Some(Duration::from_secs(7_200)));
        assert_eq!(parse_flexible_duration("45s"), Some(Duration::from_secs(45)));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_flexible_duration(""), None);
        assert_eq!(parse_flexible_duration("soon"), None);
    }
}
