use std::{sync::OnceLock, time::Instant};

use chrono::{DateTime, Datelike, FixedOffset, Offset, Utc};
use chrono_tz::Tz;

/// Clocks that have never been set boot somewhere in 1970.
const EARLIEST_PLAUSIBLE_YEAR: i32 = 2024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Zone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl Zone {
    pub fn localize(&self, utc: DateTime<Utc>) -> DateTime<FixedOffset> {
        match self {
            Self::Named(tz) => {
                let local = utc.with_timezone(tz);
                local.with_timezone(&local.offset().fix())
            }
            Self::Fixed(offset) => utc.with_timezone(offset),
        }
    }
}

/// Accepts IANA names (`Europe/Helsinki`) and fixed offsets (`UTC`, `UTC+2`, `UTC-05:30`).
pub fn parse_timezone(value: &str) -> Option<Zone> {
    let value = value.trim();
    if let Some(offset) = value.strip_prefix("UTC").filter(|rest| !rest.is_empty()) {
        return parse_fixed_offset(offset).map(Zone::Fixed);
    }
    value.parse::<Tz>().ok().map(Zone::Named)
}

fn parse_fixed_offset(value: &str) -> Option<FixedOffset> {
    let (sign, rest) = match value.as_bytes().first()? {
        b'+' => (1, &value[1..]),
        b'-' => (-1, &value[1..]),
        _ => return None,
    };

    let (hours, minutes) = match rest.split_once(':') {
        Some((hours, minutes)) => (hours, minutes),
        None => (rest, "0"),
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Local wall-clock time, or `None` if the zone is unknown or the clock has
/// not been set yet.
pub fn local_now(timezone: &str) -> Option<DateTime<FixedOffset>> {
    local_at(timezone, Utc::now())
}

pub fn local_at(timezone: &str, utc: DateTime<Utc>) -> Option<DateTime<FixedOffset>> {
    if utc.year() < EARLIEST_PLAUSIBLE_YEAR {
        return None;
    }
    parse_timezone(timezone).map(|zone| zone.localize(utc))
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Timelike};

    use super::*;

    fn utc(year: i32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, 6, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn fixed_offsets() {
        assert_eq!(
            parse_timezone("UTC+2"),
            Some(Zone::Fixed(FixedOffset::east_opt(7_200).unwrap()))
        );
        assert_eq!(
            parse_timezone("UTC-05:30"),
            Some(Zone::Fixed(FixedOffset::west_opt(19_800).unwrap()))
        );
        assert_eq!(parse_timezone("UTC+15"), None);
        assert_eq!(parse_timezone("UTC2"), None);
    }

    #[test]
    fn named_zones() {
        assert!(matches!(parse_timezone("UTC"), Some(Zone::Named(_))));
        assert!(matches!(
            parse_timezone("Europe/Helsinki"),
            Some(Zone::Named(_))
        ));
        assert_eq!(parse_timezone("Nowhere/Special"), None);
    }

    #[test]
    fn localizes_with_offset() {
        let local = local_at("UTC+2", utc(2026, 22)).unwrap();
        assert_eq!(local.hour(), 0);

        // Helsinki is on summer time (+3) in June.
        let local = local_at("Europe/Helsinki", utc(2026, 22)).unwrap();
        assert_eq!(local.hour(), 1);
    }

    #[test]
    fn unset_clock_is_not_wall_time() {
        assert_eq!(local_at("UTC", utc(1970, 12)), None);
    }
}
