use crate::error::{SchemaError, SchemaResult};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// RFC 3339, always `Z`. Fractional seconds are written only when present.
pub fn format_rfc3339(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn parse_rfc3339(raw: &str) -> SchemaResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| SchemaError::InvalidTimestamp(raw.to_string()))
}

/// Midnight UTC of the day containing `ts`.
pub fn day_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    date_start(ts.date_naive())
}

pub fn date_start(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::default()))
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> SchemaResult<Self> {
        let window = Self { start, end };
        window.validate()?;
        Ok(window)
    }

    /// The single UTC day starting at midnight of `day`.
    pub fn day(day: DateTime<Utc>) -> Self {
        let start = day_start(day);
        Self {
            start,
            end: start + Duration::days(1),
        }
    }

    pub fn validate(&self) -> SchemaResult<()> {
        if self.end <= self.start {
            return Err(SchemaError::InvalidWindow(format!(
                "end {} must be after start {}",
                format_rfc3339(&self.end),
                format_rfc3339(&self.start)
            )));
        }
        Ok(())
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Every UTC day overlapping the window, as midnight timestamps.
    pub fn days(&self) -> Vec<DateTime<Utc>> {
        let mut days = Vec::new();
        let mut day = day_start(self.start);
        while day < self.end {
            days.push(day);
            day += Duration::days(1);
        }
        days
    }
}

#[derive(Serialize, Deserialize)]
struct WindowWire {
    start: String,
    end: String,
}

impl Serialize for Window {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WindowWire {
            start: format_rfc3339(&self.start),
            end: format_rfc3339(&self.end),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Window {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WindowWire::deserialize(deserializer)?;
        let start = parse_rfc3339(&wire.start).map_err(serde::de::Error::custom)?;
        let end = parse_rfc3339(&wire.end).map_err(serde::de::Error::custom)?;
        Ok(Window { start, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(raw: &str) -> DateTime<Utc> {
        parse_rfc3339(raw).unwrap()
    }

    #[test]
    fn test_day_window() {
        let w = Window::day(ts("2024-03-05T13:45:00Z"));
        assert_eq!(w.start, ts("2024-03-05T00:00:00Z"));
        assert_eq!(w.end, ts("2024-03-06T00:00:00Z"));
        assert!(w.contains(ts("2024-03-05T23:59:59Z")));
        assert!(!w.contains(ts("2024-03-06T00:00:00Z")));
    }

    #[test]
    fn test_days_cover_partial_edges() {
        let w = Window::new(ts("2024-03-05T12:00:00Z"), ts("2024-03-07T06:00:00Z")).unwrap();
        let days: Vec<String> = w.days().iter().map(format_rfc3339).collect();
        assert_eq!(
            days,
            vec![
                "2024-03-05T00:00:00Z",
                "2024-03-06T00:00:00Z",
                "2024-03-07T00:00:00Z"
            ]
        );
    }

    #[test]
    fn test_rejects_empty_window() {
        let t = ts("2024-03-05T00:00:00Z");
        assert!(Window::new(t, t).is_err());
    }

    #[test]
    fn test_wire_format() {
        let w = Window::day(ts("2024-03-05T00:00:00Z"));
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(
            json,
            r#"{"start":"2024-03-05T00:00:00Z","end":"2024-03-06T00:00:00Z"}"#
        );
        let back: Window = serde_json::from_str(&json).unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn test_sub_second_window_keeps_precision() {
        let w = Window::new(ts("2024-03-05T00:00:00.250Z"), ts("2024-03-05T00:00:01.5Z")).unwrap();
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(
            json,
            r#"{"start":"2024-03-05T00:00:00.250Z","end":"2024-03-05T00:00:01.500Z"}"#
        );
        let back: Window = serde_json::from_str(&json).unwrap();
        assert_eq!(back, w);
    }
}
