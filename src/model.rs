use std::collections::HashMap;
use std::fmt;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only wall-clock type.
pub type Ms = i64;

/// Minor currency units (cents).
pub type Money = i64;

pub const MINUTES_PER_DAY: u16 = 1440;

/// Last minute of the day. A closing time of "00:00" means this, not midnight.
pub const END_OF_DAY: u16 = MINUTES_PER_DAY - 1;

// ── Parsing ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {what}: {value:?}")]
pub struct ParseError {
    pub what: &'static str,
    pub value: String,
}

impl ParseError {
    pub fn new(what: &'static str, value: impl Into<String>) -> Self {
        Self {
            what,
            value: value.into(),
        }
    }
}

/// Strict `HH:MM`: exactly two digits, a colon, two digits; hours 0–23, minutes 0–59.
fn parse_hhmm(s: &str) -> Result<u16, ParseError> {
    let b = s.as_bytes();
    let well_formed = b.len() == 5
        && b[2] == b':'
        && [0, 1, 3, 4].iter().all(|&i| b[i].is_ascii_digit());
    if !well_formed {
        return Err(ParseError::new("time (expected HH:MM)", s));
    }
    let digit = |i: usize| u16::from(b[i] - b'0');
    let hours = digit(0) * 10 + digit(1);
    let minutes = digit(3) * 10 + digit(4);
    if hours > 23 || minutes > 59 {
        return Err(ParseError::new("time (out of range)", s));
    }
    Ok(hours * 60 + minutes)
}

pub fn parse_date(s: &str) -> Result<NaiveDate, ParseError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| ParseError::new("date (expected YYYY-MM-DD)", s))
}

/// Accepts full or abbreviated English weekday names, any case.
pub fn parse_weekday(s: &str) -> Result<Weekday, ParseError> {
    s.trim().parse::<Weekday>().map_err(|_| ParseError::new("weekday", s))
}

/// Day-of-week index as stored on templates: 0 = Sunday … 6 = Saturday.
pub fn weekday_index(day: Weekday) -> u8 {
    day.num_days_from_sunday() as u8
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

// ── Time of day ──────────────────────────────────────────────────

/// Minutes since midnight, 0..=1439.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes < MINUTES_PER_DAY).then_some(Self(minutes))
    }

    /// Parse a time used as the start of a range.
    pub fn parse_start(s: &str) -> Result<Self, ParseError> {
        parse_hhmm(s).map(Self)
    }

    /// Parse a time used as the end of a range; "00:00" becomes 1439.
    pub fn parse_end(s: &str) -> Result<Self, ParseError> {
        match parse_hhmm(s)? {
            0 => Ok(Self(END_OF_DAY)),
            m => Ok(Self(m)),
        }
    }

    pub fn minutes(self) -> u16 {
        self.0
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

// ── Park operating profile ───────────────────────────────────────

/// Opening hours as entered by park staff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHours {
    pub open: String,
    pub close: String,
    #[serde(default)]
    pub closed: bool,
}

impl DayHours {
    pub fn new(open: &str, close: &str) -> Self {
        Self {
            open: open.to_string(),
            close: close.to_string(),
            closed: false,
        }
    }

    pub fn closed() -> Self {
        Self {
            open: "00:00".to_string(),
            close: "00:00".to_string(),
            closed: true,
        }
    }

    pub fn parse(&self) -> Result<OpeningHours, ParseError> {
        Ok(OpeningHours {
            open: TimeOfDay::parse_start(&self.open)?,
            close: TimeOfDay::parse_end(&self.close)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpeningHours {
    pub open: TimeOfDay,
    pub close: TimeOfDay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialPeriod {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub open_days: Vec<Weekday>,
    pub hours: DayHours,
}

impl SpecialPeriod {
    /// Inclusive on both ends.
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}

/// Everything that decides whether and when a park is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkSchedule {
    pub default_hours: DayHours,
    #[serde(default)]
    pub custom_hours: HashMap<Weekday, DayHours>,
    #[serde(default)]
    pub closed_days: Vec<Weekday>,
    /// Checked in stored order; the first period containing a date wins.
    #[serde(default)]
    pub special_periods: Vec<SpecialPeriod>,
}

impl ParkSchedule {
    pub fn with_default_hours(open: &str, close: &str) -> Self {
        Self {
            default_hours: DayHours::new(open, close),
            custom_hours: HashMap::new(),
            closed_days: Vec::new(),
            special_periods: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkProfile {
    pub id: Ulid,
    pub name: String,
    pub schedule: ParkSchedule,
}

// ── Templates ────────────────────────────────────────────────────

/// Recurring bookable window. Source of truth for template-driven instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlotTemplate {
    pub id: Ulid,
    pub park_id: Ulid,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    /// Sorted, deduplicated, 0 = Sunday.
    pub days_of_week: Vec<u8>,
    pub valid_from: NaiveDate,
    pub valid_until: Option<NaiveDate>,
    pub ticket_limit: u32,
    pub price_adjustment: Money,
    pub pricing_ids: Vec<Ulid>,
}

impl TimeSlotTemplate {
    pub fn is_valid_on(&self, date: NaiveDate) -> bool {
        self.valid_from <= date && self.valid_until.is_none_or(|until| date <= until)
    }

    pub fn runs_on(&self, date: NaiveDate) -> bool {
        self.days_of_week.contains(&weekday_index(date.weekday()))
    }

    /// Active on `date`: inside the validity window and scheduled for that weekday.
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.is_valid_on(date) && self.runs_on(date)
    }

    /// Same window on at least one shared weekday.
    pub fn collides_with(&self, other: &TimeSlotTemplate) -> bool {
        self.park_id == other.park_id
            && self.start_time == other.start_time
            && self.end_time == other.end_time
            && self.days_of_week.iter().any(|d| other.days_of_week.contains(d))
    }
}

// ── Instances ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotSource {
    Template(Ulid),
    AutoFill,
}

/// A date-stamped sellable unit with its own ticket counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInstance {
    pub id: Ulid,
    pub park_id: Ulid,
    pub date: NaiveDate,
    pub source: SlotSource,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    /// Fixed at creation; template edits never reach an existing instance.
    pub ticket_limit: u32,
    pub available_tickets: u32,
    pub price_adjustment: Money,
    pub pricing_ids: Vec<Ulid>,
    pub created_at: Ms,
}

impl SlotInstance {
    pub fn template_id(&self) -> Option<Ulid> {
        match self.source {
            SlotSource::Template(id) => Some(id),
            SlotSource::AutoFill => None,
        }
    }

    /// Uniqueness key enforced by the store.
    pub fn identity(&self) -> InstanceKey {
        match self.source {
            SlotSource::Template(template_id) => InstanceKey::Template {
                template_id,
                date: self.date,
            },
            SlotSource::AutoFill => InstanceKey::Block {
                park_id: self.park_id,
                date: self.date,
                start: self.start,
                end: self.end,
            },
        }
    }

    pub fn availability(&self) -> Availability {
        Availability {
            instance_id: self.id,
            available_tickets: self.available_tickets,
            ticket_limit: self.ticket_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceKey {
    Template {
        template_id: Ulid,
        date: NaiveDate,
    },
    Block {
        park_id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
        end: TimeOfDay,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    pub instance_id: Ulid,
    pub available_tickets: u32,
    pub ticket_limit: u32,
}

// ── Cart lines ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineStatus {
    Held,
    Confirmed,
    Released,
    Cancelled,
}

impl LineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LineStatus::Held => "held",
            LineStatus::Confirmed => "confirmed",
            LineStatus::Released => "released",
            LineStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for LineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tickets a cart holds (or has bought) against one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub id: Ulid,
    pub cart_id: Ulid,
    pub instance_id: Ulid,
    pub pricing_id: Ulid,
    pub quantity: u32,
    pub unit_price: Money,
    pub status: LineStatus,
    pub used: bool,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub expires_at: Ms,
}

impl CartLine {
    pub fn total_price(&self) -> Money {
        self.unit_price * Money::from(self.quantity)
    }

    /// Nothing can happen to this line any more.
    pub fn is_settled(&self) -> bool {
        match self.status {
            LineStatus::Released | LineStatus::Cancelled => true,
            LineStatus::Confirmed => self.used,
            LineStatus::Held => false,
        }
    }

    /// Capacity this line currently keeps out of its instance.
    pub fn committed_tickets(&self) -> u32 {
        match self.status {
            LineStatus::Held | LineStatus::Confirmed => self.quantity,
            LineStatus::Released | LineStatus::Cancelled => 0,
        }
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
///
/// Counter-affecting events carry their quantities so replay never needs
/// to consult other state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ParkSaved {
        park: ParkProfile,
    },
    TemplateCreated {
        template: TimeSlotTemplate,
    },
    TemplateUpdated {
        template: TimeSlotTemplate,
    },
    TemplateDeleted {
        id: Ulid,
        park_id: Ulid,
    },
    /// Inserts the instance exactly as given, counter included.
    InstanceCreated {
        instance: SlotInstance,
    },
    TicketsReserved {
        instance_id: Ulid,
        quantity: u32,
    },
    TicketsReleased {
        instance_id: Ulid,
        quantity: u32,
    },
    LineHeld {
        line: CartLine,
    },
    LineResized {
        id: Ulid,
        instance_id: Ulid,
        from: u32,
        to: u32,
        at: Ms,
    },
    LineReleased {
        id: Ulid,
        instance_id: Ulid,
        quantity: u32,
        at: Ms,
    },
    LineConfirmed {
        id: Ulid,
        at: Ms,
    },
    LineCancelled {
        id: Ulid,
        instance_id: Ulid,
        quantity: u32,
        at: Ms,
    },
    LineUsed {
        id: Ulid,
        at: Ms,
    },
    /// Compaction snapshot of a line; no counter effect.
    LineRestored {
        line: CartLine,
    },
    /// A settled line dropped from memory after its retention window.
    LinePurged {
        id: Ulid,
        cart_id: Ulid,
    },
}
