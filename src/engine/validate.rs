use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_quantity(quantity: u32) -> Result<(), EngineError> {
    if quantity == 0 {
        return Err(EngineError::InvalidInput("quantity must be positive".into()));
    }
    if quantity > MAX_QUANTITY_PER_LINE {
        return Err(EngineError::LimitExceeded("quantity too large"));
    }
    Ok(())
}

/// Wire quantities arrive signed; anything not strictly positive is rejected.
pub fn quantity_from_i64(quantity: i64) -> Result<u32, EngineError> {
    if quantity <= 0 {
        return Err(EngineError::InvalidInput(format!(
            "quantity must be positive, got {quantity}"
        )));
    }
    u32::try_from(quantity).map_err(|_| EngineError::LimitExceeded("quantity too large"))
}

/// Every time string must parse and every period must be well-ordered.
pub(crate) fn validate_schedule(schedule: &ParkSchedule) -> Result<(), EngineError> {
    schedule.default_hours.parse()?;
    for hours in schedule.custom_hours.values() {
        hours.parse()?;
    }
    for period in &schedule.special_periods {
        if period.start_date > period.end_date {
            return Err(EngineError::InvalidInput(format!(
                "special period ends ({}) before it starts ({})",
                period.end_date, period.start_date
            )));
        }
        period.hours.parse()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_bounds() {
        assert!(matches!(validate_quantity(0), Err(EngineError::InvalidInput(_))));
        assert!(validate_quantity(1).is_ok());
        assert!(matches!(
            validate_quantity(MAX_QUANTITY_PER_LINE + 1),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn signed_quantities() {
        assert_eq!(quantity_from_i64(3).unwrap(), 3);
        assert!(matches!(quantity_from_i64(0), Err(EngineError::InvalidInput(_))));
        assert!(matches!(quantity_from_i64(-2), Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn schedule_with_bad_custom_hours_rejected() {
        let mut schedule = ParkSchedule::with_default_hours("09:00", "18:00");
        schedule
            .custom_hours
            .insert(chrono::Weekday::Fri, DayHours::new("09:00", "24:00"));
        assert!(matches!(
            validate_schedule(&schedule),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn schedule_with_reversed_period_rejected() {
        let mut schedule = ParkSchedule::with_default_hours("09:00", "18:00");
        schedule.special_periods.push(SpecialPeriod {
            start_date: parse_date("2026-12-31").unwrap(),
            end_date: parse_date("2026-12-01").unwrap(),
            open_days: vec![],
            hours: DayHours::new("10:00", "12:00"),
        });
        assert!(validate_schedule(&schedule).is_err());
    }
}
