//! Utility functions for trinode

use std::time::{SystemTime, UNIX_EPOCH};

/// Parse duration string (e.g., "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else {
        let last = s.char_indices().last().map(|(i, _)| i).unwrap_or(0);
        s.split_at(last)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let secs_per_unit = match unit {
        "ms" => return Ok(std::time::Duration::from_millis(num)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    num.checked_mul(secs_per_unit)
        .map(std::time::Duration::from_secs)
        .ok_or_else(|| crate::Error::InvalidConfig(format!("duration out of range: {}", s)))
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Validate a title id (`tt` followed by digits, e.g. `tt0000001`)
pub fn validate_tconst(tconst: &str) -> crate::Result<()> {
    let digits = tconst.strip_prefix("tt").unwrap_or("");
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(crate::Error::InvalidRequest(format!(
            "invalid tconst: {:?}",
            tconst
        )));
    }
    if tconst.len() > 16 {
        return Err(crate::Error::InvalidRequest("tconst too long".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(
            parse_duration("30s").unwrap(),
            std::time::Duration::from_secs(30)
        );
        assert_eq!(
            parse_duration("15m").unwrap(),
            std::time::Duration::from_secs(900)
        );
        assert_eq!(
            parse_duration("250ms").unwrap(),
            std::time::Duration::from_millis(250)
        );
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_overflow() {
        let huge = format!("{}d", u64::MAX / 2);
        assert!(matches!(
            parse_duration(&huge),
            Err(crate::Error::InvalidConfig(_))
        ));
        assert_eq!(
            parse_duration(&format!("{}s", u64::MAX)).unwrap(),
            std::time::Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_validate_tconst() {
        assert!(validate_tconst("tt0000001").is_ok());
        assert!(validate_tconst("tt").is_err());
        assert!(validate_tconst("0000001").is_err());
        assert!(validate_tconst("tt00a1").is_err());
    }
}
