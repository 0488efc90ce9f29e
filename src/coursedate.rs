use std::fmt::{Display, Formatter};
use std::str::FromStr;
use anyhow::anyhow;
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Start time of a lesson, stored and displayed as `HH:MM`.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub struct LessonTime(pub NaiveTime);
impl LessonTime {
    pub const DEFAULT_HOUR: u32 = 10;

    pub fn new(hour: u32, min: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, min, 0).map(Self)
    }
    pub fn parse(time_str: &str) -> anyhow::Result<Self> {
        let time_str = time_str.trim();
        for format in ["%H:%M", "%H:%M:%S", "%H:%M:%S%.f"] {
            if let Ok(tm) = NaiveTime::parse_from_str(time_str, format) {
                return Ok(Self(tm));
            }
        }
        Err(anyhow!("Unrecognized lesson time: '{time_str}'"))
    }
    /// Lessons without an explicit start time begin at 10:00.
    pub fn or_default(start_time: Option<LessonTime>) -> LessonTime {
        start_time.unwrap_or_default()
    }
}
impl Default for LessonTime {
    fn default() -> Self {
        Self::new(Self::DEFAULT_HOUR, 0).unwrap_or(Self(NaiveTime::MIN))
    }
}
impl Display for LessonTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}
impl FromStr for LessonTime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
impl Serialize for LessonTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
impl<'de> Deserialize<'de> for LessonTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
impl<DB: sqlx::Database> sqlx::Type<DB> for LessonTime
where
    str: sqlx::Type<DB>,
{
    fn type_info() -> <DB as sqlx::Database>::TypeInfo {
        // TEXT columns only
        <&str as sqlx::Type<DB>>::type_info()
    }
}
impl<'r, DB: sqlx::Database> sqlx::Decode<'r, DB> for LessonTime
where
    &'r str: sqlx::Decode<'r, DB>,
{
    fn decode(value: <DB as sqlx::Database>::ValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let value = <&str as sqlx::Decode<DB>>::decode(value)?;
        Ok(LessonTime::parse(value)?)
    }
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}
pub fn parse_date(date_str: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(date_str.trim(), "%Y-%m-%d")
        .map_err(|e| anyhow!("Unrecognized date: '{date_str}', error: {e}"))
}
/// Whole days from `today` to `date`, never negative.
pub fn days_until(date: NaiveDate, today: NaiveDate) -> i64 {
    date.signed_duration_since(today).num_days().max(0)
}
pub(crate) fn datestr(iso_date_str: Option<&str>) -> String {
    let Some(s) = iso_date_str else {
        return "—".to_string()
    };
    match parse_date(s) {
        Ok(date) => date.format("%d/%m/%Y").to_string(),
        Err(_) => s.to_string(),
    }
}

#[test]
fn test_parse_lesson_time() {
    for (tmstr, tmstr2) in &[
        ("10:00", "10:00"),
        ("09:30:00", "09:30"),
        (" 18:45 ", "18:45"),
        ("07:05:00.000", "07:05"),
    ] {
        let tm = LessonTime::parse(tmstr)
            .map_err(|e| println!("parse {tmstr} error: {e}")).unwrap();
        assert_eq!(&tm.to_string(), tmstr2)
    }
    assert!(LessonTime::parse("25:00").is_err());
    assert!(LessonTime::parse("noon").is_err());
}

#[test]
fn test_default_start_time() {
    assert_eq!(LessonTime::or_default(None).to_string(), "10:00");
    assert_eq!(LessonTime::or_default(LessonTime::new(8, 15)).to_string(), "08:15");
}

#[test]
fn test_days_until() {
    let today = NaiveDate::from_ymd_opt(2025, 3, 5).unwrap();
    assert_eq!(days_until(NaiveDate::from_ymd_opt(2025, 3, 8).unwrap(), today), 3);
    assert_eq!(days_until(today, today), 0);
    assert_eq!(days_until(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(), today), 0);
}

#[test]
fn test_datestr() {
    assert_eq!(datestr(Some("2025-03-05")), "05/03/2025");
    assert_eq!(datestr(Some("garbage")), "garbage");
    assert_eq!(datestr(None), "—");
}
