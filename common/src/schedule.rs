use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("weekday index {0} is out of range (0 = Monday .. 6 = Sunday)")]
    InvalidDay(u8),
    #[error("time {hour:02}:{minute:02} is not a valid time of day")]
    InvalidTime { hour: u8, minute: u8 },
}

/// Weekday in the persisted index form, Monday = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        Self::Mon,
        Self::Tue,
        Self::Wed,
        Self::Thu,
        Self::Fri,
        Self::Sat,
        Self::Sun,
    ];

    pub fn index(self) -> u8 {
        match self {
            Self::Mon => 0,
            Self::Tue => 1,
            Self::Wed => 2,
            Self::Thu => 3,
            Self::Fri => 4,
            Self::Sat => 5,
            Self::Sun => 6,
        }
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }
}

impl TryFrom<u8> for DayOfWeek {
    type Error = ScheduleError;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(index as usize)
            .copied()
            .ok_or(ScheduleError::InvalidDay(index))
    }
}

impl From<DayOfWeek> for u8 {
    fn from(day: DayOfWeek) -> Self {
        day.index()
    }
}

/// Wall-clock time with minute resolution, persisted as `[hour, minute]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "(u8, u8)", into = "(u8, u8)")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Result<Self, ScheduleError> {
        if hour > 23 || minute > 59 {
            return Err(ScheduleError::InvalidTime { hour, minute });
        }
        Ok(Self { hour, minute })
    }

    pub fn minute_of_day(self) -> u16 {
        self.hour as u16 * 60 + self.minute as u16
    }
}

impl TryFrom<(u8, u8)> for TimeOfDay {
    type Error = ScheduleError;

    fn try_from((hour, minute): (u8, u8)) -> Result<Self, Self::Error> {
        Self::new(hour, minute)
    }
}

impl From<TimeOfDay> for (u8, u8) {
    fn from(time: TimeOfDay) -> Self {
        (time.hour, time.minute)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub days: BTreeSet<DayOfWeek>,
    pub on: TimeOfDay,
    pub off: TimeOfDay,
    pub enabled: bool,
}

impl ScheduleEntry {
    /// `on < off` is a same-day `[on, off)` window, anything else wraps past midnight.
    pub fn contains_minute(&self, minute_of_day: u16) -> bool {
        let on = self.on.minute_of_day();
        let off = self.off.minute_of_day();
        if on < off {
            (on..off).contains(&minute_of_day)
        } else {
            minute_of_day >= on || minute_of_day < off
        }
    }

    fn matches(&self, day: DayOfWeek, minute_of_day: u16) -> bool {
        self.enabled && self.days.contains(&day) && self.contains_minute(minute_of_day)
    }
}

/// The persisted weekly policy. Replaced only as a whole document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schedule {
    pub enabled: bool,
    pub entries: Vec<ScheduleEntry>,
}

impl Schedule {
    /// Index of the first entry covering `now`, earlier entries take precedence.
    pub fn active_entry(&self, now: &DateTime<FixedOffset>) -> Option<usize> {
        let day = DayOfWeek::from_chrono(now.weekday());
        let minute = minute_of_day(now);
        self.entries
            .iter()
            .position(|entry| entry.matches(day, minute))
    }

    /// Desired relay output at `now`, or `None` while the policy is disabled
    /// (the relay is then left wherever it is).
    pub fn relay_state(&self, now: &DateTime<FixedOffset>) -> Option<bool> {
        if !self.enabled {
            return None;
        }
        Some(self.active_entry(now).is_some())
    }
}

fn minute_of_day(now: &DateTime<FixedOffset>) -> u16 {
    (now.hour() * 60 + now.minute()) as u16 % MINUTES_PER_DAY
}
