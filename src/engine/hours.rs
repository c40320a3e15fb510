use std::fmt;

use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::validate::validate_schedule;
use super::{Engine, EngineError};

// ── Working-hours resolution ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedReason {
    /// A special period covers the date but not its weekday.
    SpecialPeriod,
    /// The weekday is one of the park's regular closed days.
    RegularClosedDay,
    /// The applicable hours carry the `closed` flag.
    MarkedClosed,
}

impl fmt::Display for ClosedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClosedReason::SpecialPeriod => f.write_str("closed during special period for this weekday"),
            ClosedReason::RegularClosedDay => f.write_str("regular closed day"),
            ClosedReason::MarkedClosed => f.write_str("marked closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayStatus {
    Open(OpeningHours),
    Closed(ClosedReason),
}

fn open_unless_flagged(hours: &DayHours) -> Result<DayStatus, ParseError> {
    if hours.closed {
        return Ok(DayStatus::Closed(ClosedReason::MarkedClosed));
    }
    hours.parse().map(DayStatus::Open)
}

/// Decide whether a park is open on `date` and with which hours.
///
/// Precedence: the first special period containing the date (its open days
/// and hours replace everything else), then regular closed days, then the
/// weekday's custom hours, then the default hours.
pub fn resolve_day(park: &ParkProfile, date: NaiveDate) -> Result<DayStatus, ParseError> {
    let weekday = date.weekday();
    let schedule = &park.schedule;

    if let Some(period) = schedule.special_periods.iter().find(|p| p.contains(date)) {
        if !period.open_days.contains(&weekday) {
            return Ok(DayStatus::Closed(ClosedReason::SpecialPeriod));
        }
        return open_unless_flagged(&period.hours);
    }

    if schedule.closed_days.contains(&weekday) {
        return Ok(DayStatus::Closed(ClosedReason::RegularClosedDay));
    }

    let hours = schedule
        .custom_hours
        .get(&weekday)
        .unwrap_or(&schedule.default_hours);
    open_unless_flagged(hours)
}

impl Engine {
    pub async fn save_park(&self, park: ParkProfile) -> Result<(), EngineError> {
        if park.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("park name too long"));
        }
        if park.schedule.special_periods.len() > MAX_SPECIAL_PERIODS {
            return Err(EngineError::LimitExceeded("too many special periods"));
        }
        if self.store.park(&park.id).is_none() && self.store.park_count() >= MAX_PARKS {
            return Err(EngineError::LimitExceeded("too many parks"));
        }
        validate_schedule(&park.schedule)?;

        let event = Event::ParkSaved { park };
        self.wal_append(&event).await?;
        self.store.apply_event(&event);
        Ok(())
    }

    pub fn get_park(&self, park_id: Ulid) -> Result<ParkProfile, EngineError> {
        self.store
            .park(&park_id)
            .ok_or(EngineError::not_found("park", park_id))
    }

    pub fn list_parks(&self) -> Vec<ParkProfile> {
        self.store.parks()
    }

    /// Open/closed verdict for a date. Closed is a value here, not an error.
    pub fn day_status(&self, park_id: Ulid, date: NaiveDate) -> Result<DayStatus, EngineError> {
        let park = self.get_park(park_id)?;
        Ok(resolve_day(&park, date)?)
    }

    /// Opening hours for a date, or `ClosedDay` explaining why there are none.
    pub fn resolve_hours(&self, park_id: Ulid, date: NaiveDate) -> Result<OpeningHours, EngineError> {
        match self.day_status(park_id, date)? {
            DayStatus::Open(hours) => Ok(hours),
            DayStatus::Closed(reason) => Err(EngineError::ClosedDay {
                park_id,
                date,
                reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn park(schedule: ParkSchedule) -> ParkProfile {
        ParkProfile {
            id: Ulid::new(),
            name: "Treetop Park".into(),
            schedule,
        }
    }

    fn open(open: &str, close: &str) -> DayStatus {
        DayStatus::Open(DayHours::new(open, close).parse().unwrap())
    }

    // 2026-10-19 is a Monday, 2026-10-20 a Tuesday, 2026-10-24 a Saturday.

    #[test]
    fn default_hours_apply() {
        let p = park(ParkSchedule::with_default_hours("09:00", "18:00"));
        assert_eq!(resolve_day(&p, date("2026-10-20")).unwrap(), open("09:00", "18:00"));
    }

    #[test]
    fn regular_closed_day() {
        let mut schedule = ParkSchedule::with_default_hours("09:00", "18:00");
        schedule.closed_days = vec![Weekday::Mon];
        let p = park(schedule);
        assert_eq!(
            resolve_day(&p, date("2026-10-19")).unwrap(),
            DayStatus::Closed(ClosedReason::RegularClosedDay)
        );
        assert_eq!(resolve_day(&p, date("2026-10-20")).unwrap(), open("09:00", "18:00"));
    }

    #[test]
    fn custom_hours_override_default() {
        let mut schedule = ParkSchedule::with_default_hours("09:00", "18:00");
        schedule
            .custom_hours
            .insert(Weekday::Sat, DayHours::new("08:00", "20:00"));
        let p = park(schedule);
        assert_eq!(resolve_day(&p, date("2026-10-24")).unwrap(), open("08:00", "20:00"));
        assert_eq!(resolve_day(&p, date("2026-10-20")).unwrap(), open("09:00", "18:00"));
    }

    #[test]
    fn closed_flag_on_hours() {
        let mut schedule = ParkSchedule::with_default_hours("09:00", "18:00");
        schedule.custom_hours.insert(Weekday::Tue, DayHours::closed());
        let p = park(schedule);
        assert_eq!(
            resolve_day(&p, date("2026-10-20")).unwrap(),
            DayStatus::Closed(ClosedReason::MarkedClosed)
        );
    }

    #[test]
    fn special_period_weekday_not_open() {
        let mut schedule = ParkSchedule::with_default_hours("09:00", "18:00");
        schedule.special_periods.push(SpecialPeriod {
            start_date: date("2026-12-20"),
            end_date: date("2027-01-05"),
            open_days: vec![Weekday::Sat, Weekday::Sun],
            hours: DayHours::new("10:00", "16:00"),
        });
        let p = park(schedule);
        // Tuesday inside the period
        assert_eq!(
            resolve_day(&p, date("2026-12-22")).unwrap(),
            DayStatus::Closed(ClosedReason::SpecialPeriod)
        );
        // Saturday inside the period
        assert_eq!(resolve_day(&p, date("2026-12-26")).unwrap(), open("10:00", "16:00"));
        // Tuesday after the period
        assert_eq!(resolve_day(&p, date("2027-01-12")).unwrap(), open("09:00", "18:00"));
    }

    #[test]
    fn special_period_beats_closed_days_and_custom_hours() {
        let mut schedule = ParkSchedule::with_default_hours("09:00", "18:00");
        schedule.closed_days = vec![Weekday::Mon];
        schedule
            .custom_hours
            .insert(Weekday::Mon, DayHours::new("12:00", "13:00"));
        schedule.special_periods.push(SpecialPeriod {
            start_date: date("2026-10-19"),
            end_date: date("2026-10-19"),
            open_days: vec![Weekday::Mon],
            hours: DayHours::new("07:00", "00:00"),
        });
        let p = park(schedule);
        let status = resolve_day(&p, date("2026-10-19")).unwrap();
        match status {
            DayStatus::Open(h) => {
                assert_eq!(h.open.minutes(), 420);
                assert_eq!(h.close.minutes(), END_OF_DAY);
            }
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[test]
    fn overlapping_periods_first_match_wins() {
        let mut schedule = ParkSchedule::with_default_hours("09:00", "18:00");
        schedule.special_periods.push(SpecialPeriod {
            start_date: date("2026-07-01"),
            end_date: date("2026-07-31"),
            open_days: vec![Weekday::Sat],
            hours: DayHours::new("08:00", "21:00"),
        });
        schedule.special_periods.push(SpecialPeriod {
            start_date: date("2026-07-15"),
            end_date: date("2026-08-15"),
            open_days: vec![Weekday::Sat],
            hours: DayHours::new("10:00", "14:00"),
        });
        let p = park(schedule);
        assert_eq!(resolve_day(&p, date("2026-07-18")).unwrap(), open("08:00", "21:00"));
        assert_eq!(resolve_day(&p, date("2026-08-01")).unwrap(), open("10:00", "14:00"));
    }

    #[test]
    fn malformed_hours_surface_parse_error() {
        let p = park(ParkSchedule::with_default_hours("9:00", "18:00"));
        assert!(resolve_day(&p, date("2026-10-20")).is_err());
    }
}
