use chrono::{DateTime, Local, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use tlm_schemas::TIME_LAYOUT;

use crate::MappingError;

/// Zone used to read naive message timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Local,
    Utc,
    Named(Tz),
}

impl Zone {
    pub fn parse(name: &str) -> Result<Self, MappingError> {
        match name.trim() {
            "" | "Local" | "local" => Ok(Zone::Local),
            "UTC" | "utc" | "Z" => Ok(Zone::Utc),
            other => other
                .parse::<Tz>()
                .map(Zone::Named)
                .map_err(|_| MappingError::UnknownTimezone(other.to_string())),
        }
    }

    fn resolve(&self, naive: &NaiveDateTime) -> LocalResult<DateTime<Utc>> {
        fn to_utc<T: TimeZone>(r: LocalResult<DateTime<T>>) -> LocalResult<DateTime<Utc>> {
            r.map(|t| t.with_timezone(&Utc))
        }
        match self {
            Zone::Local => to_utc(Local.from_local_datetime(naive)),
            Zone::Utc => LocalResult::Single(Utc.from_utc_datetime(naive)),
            Zone::Named(tz) => to_utc(tz.from_local_datetime(naive)),
        }
    }

    /// Parse `raw` and normalize to UTC.
    ///
    /// Strings carrying an offset (RFC 3339) are taken as-is. Naive strings
    /// in [`TIME_LAYOUT`] are read in this zone; an ambiguous local time
    /// (DST fall-back) resolves to the earlier instant, a skipped one
    /// (spring-forward) is rejected.
    pub fn parse_time(&self, source: &str, raw: &str) -> Result<DateTime<Utc>, MappingError> {
        let raw = raw.trim();
        if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
            return Ok(t.with_timezone(&Utc));
        }
        let naive = NaiveDateTime::parse_from_str(raw, TIME_LAYOUT).map_err(|e| {
            MappingError::BadTime {
                source: source.to_string(),
                raw: raw.to_string(),
                reason: e.to_string(),
            }
        })?;
        match self.resolve(&naive) {
            LocalResult::Single(t) => Ok(t),
            LocalResult::Ambiguous(a, b) => Ok(a.min(b)),
            LocalResult::None => Err(MappingError::BadTime {
                source: source.to_string(),
                raw: raw.to_string(),
                reason: "local time does not exist in this zone".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_zone_normalizes_to_utc() {
        let zone = Zone::parse("Europe/Berlin").unwrap();
        let t = zone.parse_time("Time", "2024-01-15T10:00:00").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap());
    }

    #[test]
    fn offset_strings_ignore_zone() {
        let zone = Zone::parse("Europe/Berlin").unwrap();
        let t = zone.parse_time("Time", "2024-01-15T10:00:00Z").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap());
    }

    #[test]
    fn skipped_local_time_rejected() {
        let zone = Zone::parse("Europe/Berlin").unwrap();
        let err = zone.parse_time("Time", "2024-03-31T02:30:00").unwrap_err();
        assert!(matches!(err, MappingError::BadTime { .. }));
    }

    #[test]
    fn ambiguous_local_time_takes_earlier() {
        let zone = Zone::parse("Europe/Berlin").unwrap();
        let t = zone.parse_time("Time", "2024-10-27T02:30:00").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 10, 27, 0, 30, 0).unwrap());
    }

    #[test]
    fn unknown_zone_name() {
        assert_eq!(
            Zone::parse("Mars/Olympus").unwrap_err(),
            MappingError::UnknownTimezone("Mars/Olympus".to_string())
        );
    }

    #[test]
    fn garbage_is_bad_time() {
        let err = Zone::Utc.parse_time("Time", "yesterday").unwrap_err();
        assert!(err.to_string().contains("'Time' time 'yesterday' rejected"));
    }
}
