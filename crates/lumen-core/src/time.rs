use crate::error::{CoreError, Result};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Format a timestamp as RFC 3339, the wire form used in resource metadata
/// and notification bundles.
pub fn format_rfc3339(datetime: OffsetDateTime) -> String {
    datetime.format(&Rfc3339).unwrap_or_default()
}

pub fn parse_rfc3339(s: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339)
        .map_err(|e| CoreError::InvalidDateTime(format!("Failed to parse timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_format_rfc3339() {
        let dt = datetime!(2023-05-15 14:30:00 UTC);
        assert_eq!(format_rfc3339(dt), "2023-05-15T14:30:00Z");
    }

    #[test]
    fn test_parse_rfc3339() {
        let dt = parse_rfc3339("2023-05-15T14:30:00Z").unwrap();
        assert_eq!(dt, datetime!(2023-05-15 14:30:00 UTC));
    }

    #[test]
    fn test_parse_rfc3339_with_offset() {
        let dt = parse_rfc3339("2023-05-15T14:30:00+02:00").unwrap();
        assert_eq!(
            dt.to_offset(time::UtcOffset::UTC),
            datetime!(2023-05-15 12:30:00 UTC)
        );
    }

    #[test]
    fn test_parse_rfc3339_invalid() {
        assert!(parse_rfc3339("not-a-date").is_err());
        assert!(parse_rfc3339("2023-13-01T00:00:00Z").is_err());
        assert!(parse_rfc3339("").is_err());
    }

    #[test]
    fn test_roundtrip() {
        let dt = datetime!(2024-02-29 23:59:59 UTC);
        assert_eq!(parse_rfc3339(&format_rfc3339(dt)).unwrap(), dt);
    }

    #[test]
    fn test_now_utc_is_monotonic_enough() {
        let a = now_utc();
        let b = now_utc();
        assert!(b >= a);
    }
}
