//! Schedule translation module for RadioGrab
//!
//! Turns structured airing descriptions or short natural-language phrases
//! ("Tuesdays at 7 PM", "Mon, Wed, Fri at 6:30am") into validated five-field
//! cron expressions, and regenerates a human description from the structured form.

use chrono::{DateTime, TimeZone, Weekday};
use croner::Cron;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Error type for schedule parsing
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleParseError {
    #[error("Schedule description is empty")]
    Empty,

    #[error("Unrecognized token in schedule: '{token}'")]
    UnrecognizedToken { token: String },

    #[error("Cron expression must have 5 fields, found {0}")]
    WrongFieldCount(usize),

    #[error("Invalid {field} field: '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("Schedule names a day but no time")]
    MissingTime,

    #[error("Schedule names a time but no day")]
    MissingDay,
}

/// Scheduler weekdays in scheduler numbering order (0 = Monday)
const SCHEDULER_WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Converts a cron weekday (0 = Sunday) into scheduler numbering (0 = Monday).
///
/// This and [`scheduler_to_cron_weekday`] are the only places the two
/// numbering conventions meet.
pub fn cron_to_scheduler_weekday(cron_day: u8) -> u8 {
    (cron_day % 7 + 6) % 7
}

/// Inverse of [`cron_to_scheduler_weekday`].
pub fn scheduler_to_cron_weekday(scheduler_day: u8) -> u8 {
    (scheduler_day % 7 + 1) % 7
}

fn cron_day_to_weekday(cron_day: u8) -> Weekday {
    SCHEDULER_WEEKDAYS[cron_to_scheduler_weekday(cron_day) as usize]
}

fn weekday_to_cron_day(day: Weekday) -> u8 {
    scheduler_to_cron_weekday(day.num_days_from_monday() as u8)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    Weekday,
}

impl FieldKind {
    fn name(self) -> &'static str {
        match self {
            FieldKind::Minute => "minute",
            FieldKind::Hour => "hour",
            FieldKind::DayOfMonth => "day-of-month",
            FieldKind::Month => "month",
            FieldKind::Weekday => "weekday",
        }
    }

    fn bounds(self) -> (u8, u8) {
        match self {
            FieldKind::Minute => (0, 59),
            FieldKind::Hour => (0, 23),
            FieldKind::DayOfMonth => (1, 31),
            FieldKind::Month => (1, 12),
            FieldKind::Weekday => (0, 6),
        }
    }
}

/// One cron field: either unrestricted or an explicit sorted set of values
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CronField {
    Any,
    Values(Vec<u8>),
}

impl CronField {
    fn single(value: u8) -> Self {
        CronField::Values(vec![value])
    }

    fn parse(text: &str, kind: FieldKind) -> Result<Self, ScheduleParseError> {
        let invalid = || ScheduleParseError::InvalidField {
            field: kind.name(),
            value: text.to_string(),
        };
        let (min, max) = kind.bounds();

        if text == "*" {
            return Ok(CronField::Any);
        }

        let mut values = BTreeSet::new();
        for part in text.split(',') {
            let (base, step) = match part.split_once('/') {
                Some((base, step)) => {
                    let step: u8 = step.parse().map_err(|_| invalid())?;
                    if step == 0 {
                        return Err(invalid());
                    }
                    (base, step)
                }
                None => (part, 1),
            };

            let (start, end) = if base == "*" {
                (min, max)
            } else if let Some((a, b)) = base.split_once('-') {
                let a: u8 = a.parse().map_err(|_| invalid())?;
                let b: u8 = b.parse().map_err(|_| invalid())?;
                (a, b)
            } else {
                let a: u8 = base.parse().map_err(|_| invalid())?;
                // "5/15" means from 5 to the end of the range
                if part.contains('/') {
                    (a, max)
                } else {
                    (a, a)
                }
            };

            if start < min || end > max || start > end {
                return Err(invalid());
            }

            let mut v = start;
            loop {
                values.insert(v);
                match v.checked_add(step) {
                    Some(next) if next <= end => v = next,
                    _ => break,
                }
            }
        }

        if values.len() == (max - min + 1) as usize {
            return Ok(CronField::Any);
        }
        Ok(CronField::Values(values.into_iter().collect()))
    }

    fn single_value(&self) -> Option<u8> {
        match self {
            CronField::Values(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }
}

impl fmt::Display for CronField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = match self {
            CronField::Any => return write!(f, "*"),
            CronField::Values(values) => values,
        };

        // Runs of three or more consecutive values collapse to a range
        let mut parts = Vec::new();
        let mut i = 0;
        while i < values.len() {
            let mut j = i;
            while j + 1 < values.len() && values[j + 1] == values[j] + 1 {
                j += 1;
            }
            if j - i >= 2 {
                parts.push(format!("{}-{}", values[i], values[j]));
            } else {
                for v in &values[i..=j] {
                    parts.push(v.to_string());
                }
            }
            i = j + 1;
        }
        write!(f, "{}", parts.join(","))
    }
}

/// Validated five-field cron expression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CronExpr {
    pub minute: CronField,
    pub hour: CronField,
    pub day_of_month: CronField,
    pub month: CronField,
    /// Cron numbering, 0 = Sunday
    pub weekday: CronField,
}

impl CronExpr {
    /// Parse and validate a cron expression field by field.
    pub fn parse(expr: &str) -> Result<Self, ScheduleParseError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.is_empty() {
            return Err(ScheduleParseError::Empty);
        }
        if fields.len() != 5 {
            return Err(ScheduleParseError::WrongFieldCount(fields.len()));
        }

        Ok(Self {
            minute: CronField::parse(fields[0], FieldKind::Minute)?,
            hour: CronField::parse(fields[1], FieldKind::Hour)?,
            day_of_month: CronField::parse(fields[2], FieldKind::DayOfMonth)?,
            month: CronField::parse(fields[3], FieldKind::Month)?,
            weekday: CronField::parse(fields[4], FieldKind::Weekday)?,
        })
    }

    /// Weekdays this expression fires on, Monday first
    pub fn weekdays(&self) -> Vec<Weekday> {
        match &self.weekday {
            CronField::Any => SCHEDULER_WEEKDAYS.to_vec(),
            CronField::Values(days) => {
                let mut out: Vec<Weekday> = days.iter().map(|d| cron_day_to_weekday(*d)).collect();
                out.sort_by_key(|d| d.num_days_from_monday());
                out
            }
        }
    }

    /// First fire instant strictly after `after`, evaluated in `after`'s timezone
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let cron = Cron::new(&self.to_string()).parse().ok()?;
        cron.find_next_occurrence(after, false).ok()
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month, self.weekday
        )
    }
}

impl std::str::FromStr for CronExpr {
    type Err = ScheduleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

/// Structured description of one weekly airing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiringSpec {
    pub weekdays: Vec<Weekday>,
    pub hour: u8,
    pub minute: u8,
}

/// One translated airing: the cron trigger and its display text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedAiring {
    pub expr: CronExpr,
    pub description: String,
}

impl TranslatedAiring {
    fn new(expr: CronExpr) -> Self {
        let description = describe(&expr);
        Self { expr, description }
    }
}

fn weekly_expr(cron_days: &BTreeSet<u8>, hour: u8, minute: u8) -> CronExpr {
    let weekday = if cron_days.len() == 7 {
        CronField::Any
    } else {
        CronField::Values(cron_days.iter().copied().collect())
    };
    CronExpr {
        minute: CronField::single(minute),
        hour: CronField::single(hour),
        day_of_month: CronField::Any,
        month: CronField::Any,
        weekday,
    }
}

/// Translate structured airings, one cron expression per airing.
pub fn translate_spec(airings: &[AiringSpec]) -> Result<Vec<TranslatedAiring>, ScheduleParseError> {
    if airings.is_empty() {
        return Err(ScheduleParseError::Empty);
    }

    let mut out: Vec<TranslatedAiring> = Vec::with_capacity(airings.len());
    for airing in airings {
        if airing.weekdays.is_empty() {
            return Err(ScheduleParseError::MissingDay);
        }
        if airing.hour > 23 {
            return Err(ScheduleParseError::InvalidField {
                field: "hour",
                value: airing.hour.to_string(),
            });
        }
        if airing.minute > 59 {
            return Err(ScheduleParseError::InvalidField {
                field: "minute",
                value: airing.minute.to_string(),
            });
        }
        let days: BTreeSet<u8> = airing.weekdays.iter().map(|d| weekday_to_cron_day(*d)).collect();
        let expr = weekly_expr(&days, airing.hour, airing.minute);
        if !out.iter().any(|a| a.expr == expr) {
            out.push(TranslatedAiring::new(expr));
        }
    }
    Ok(out)
}

/// Clause under construction: a day set with the times it airs at
#[derive(Default)]
struct Clause {
    days: BTreeSet<u8>,
    times: Vec<(u8, u8)>,
}

impl Clause {
    fn is_empty(&self) -> bool {
        self.days.is_empty() && self.times.is_empty()
    }
}

fn tokenize(phrase: &str) -> Vec<String> {
    let normalized = phrase
        .to_lowercase()
        .replace("p.m.", "pm")
        .replace("a.m.", "am")
        .replace("p.m", "pm")
        .replace("a.m", "am")
        .replace(',', " , ")
        .replace('&', " & ");
    normalized.split_whitespace().map(str::to_string).collect()
}

fn parse_day_token(token: &str) -> Option<Vec<Weekday>> {
    match token {
        "daily" | "everyday" => return Some(SCHEDULER_WEEKDAYS.to_vec()),
        "weekdays" | "weekday" => return Some(SCHEDULER_WEEKDAYS[..5].to_vec()),
        "weekends" | "weekend" => return Some(SCHEDULER_WEEKDAYS[5..].to_vec()),
        _ => {}
    }
    if let Ok(day) = token.parse::<Weekday>() {
        return Some(vec![day]);
    }
    token
        .strip_suffix('s')
        .and_then(|singular| singular.parse::<Weekday>().ok())
        .map(|day| vec![day])
}

fn apply_meridiem(hour: u8, meridiem: &str) -> Option<u8> {
    if !(1..=12).contains(&hour) {
        return None;
    }
    match meridiem {
        "am" => Some(hour % 12),
        "pm" => Some(hour % 12 + 12),
        _ => None,
    }
}

/// Parse a time token, possibly consuming a following "am"/"pm" token.
///
/// Returns `(hour, minute, consumed_next)`.
fn parse_time_token(token: &str, next: Option<&str>) -> Option<(u8, u8, bool)> {
    match token {
        "noon" => return Some((12, 0, false)),
        "midnight" => return Some((0, 0, false)),
        _ => {}
    }

    let (clock, suffix) = if let Some(c) = token.strip_suffix("am") {
        (c, Some("am"))
    } else if let Some(c) = token.strip_suffix("pm") {
        (c, Some("pm"))
    } else {
        (token, None)
    };

    let (hour, minute) = match clock.split_once(':') {
        Some((h, m)) if m.len() == 2 => (h.parse::<u8>().ok()?, m.parse::<u8>().ok()?),
        Some(_) => return None,
        None => (clock.parse::<u8>().ok()?, 0),
    };
    if minute > 59 {
        return None;
    }

    let (meridiem, consumed) = match (suffix, next) {
        (Some(m), _) => (Some(m), false),
        (None, Some(m)) if m == "am" || m == "pm" => (Some(m), true),
        _ => (None, false),
    };

    let hour = match meridiem {
        Some(m) => apply_meridiem(hour, m)?,
        None if hour <= 23 => hour,
        None => return None,
    };
    Some((hour, minute, consumed))
}

fn close_clause(clause: Clause, out: &mut Vec<TranslatedAiring>) -> Result<(), ScheduleParseError> {
    if clause.days.is_empty() {
        return Err(ScheduleParseError::MissingDay);
    }
    if clause.times.is_empty() {
        return Err(ScheduleParseError::MissingTime);
    }
    for (hour, minute) in clause.times {
        let expr = weekly_expr(&clause.days, hour, minute);
        if !out.iter().any(|a| a.expr == expr) {
            out.push(TranslatedAiring::new(expr));
        }
    }
    Ok(())
}

/// Translate a natural-language schedule phrase.
///
/// Grammar: day names (full, abbreviated or plural), `weekdays`, `weekends`,
/// `daily`, `every day`, times like `7pm`, `7:30 p.m.`, `19:00`, `noon`,
/// `midnight`, joined by `every`, `on`, `at`, `and`, `&` and commas.
/// A day list followed by times forms one clause; each clause and each time
/// within it yields its own airing.
pub fn translate_phrase(phrase: &str) -> Result<Vec<TranslatedAiring>, ScheduleParseError> {
    let tokens = tokenize(phrase);
    if tokens.is_empty() {
        return Err(ScheduleParseError::Empty);
    }

    let mut out = Vec::new();
    let mut clause = Clause::default();
    let mut i = 0;

    while i < tokens.len() {
        let token = tokens[i].as_str();
        let next = tokens.get(i + 1).map(String::as_str);

        if token == "every" && next == Some("day") {
            clause.days.extend(SCHEDULER_WEEKDAYS.iter().map(|d| weekday_to_cron_day(*d)));
            i += 2;
            continue;
        }

        if matches!(token, "every" | "each" | "on" | "at" | "and" | "&" | ",") {
            i += 1;
            continue;
        }

        if let Some(days) = parse_day_token(token) {
            // A day after a complete clause starts the next airing
            if !clause.days.is_empty() && !clause.times.is_empty() {
                close_clause(std::mem::take(&mut clause), &mut out)?;
            }
            clause.days.extend(days.into_iter().map(weekday_to_cron_day));
            i += 1;
            continue;
        }

        if let Some((hour, minute, consumed)) = parse_time_token(token, next) {
            clause.times.push((hour, minute));
            i += if consumed { 2 } else { 1 };
            continue;
        }

        return Err(ScheduleParseError::UnrecognizedToken {
            token: token.to_string(),
        });
    }

    if !clause.is_empty() || out.is_empty() {
        close_clause(clause, &mut out)?;
    }
    Ok(out)
}

fn weekday_name(day: Weekday) -> &'static str {
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

fn format_clock(hour: u8, minute: u8) -> String {
    let (display_hour, meridiem) = match hour {
        0 => (12, "AM"),
        1..=11 => (hour, "AM"),
        12 => (12, "PM"),
        _ => (hour - 12, "PM"),
    };
    format!("{}:{:02} {}", display_hour, minute, meridiem)
}

/// Regenerate a human description from the structured expression.
///
/// Weekly single-time expressions read like "Every Tuesday at 7:00 PM" and
/// parse back through [`translate_phrase`]; anything else is shown verbatim.
pub fn describe(expr: &CronExpr) -> String {
    let (Some(hour), Some(minute)) = (expr.hour.single_value(), expr.minute.single_value()) else {
        return format!("Custom schedule ({})", expr);
    };
    if expr.day_of_month != CronField::Any || expr.month != CronField::Any {
        return format!("Custom schedule ({})", expr);
    }

    let days = expr.weekdays();
    let time = format_clock(hour, minute);
    let day_part = if days.len() == 7 {
        "Every day".to_string()
    } else if days == SCHEDULER_WEEKDAYS[..5] {
        "Weekdays".to_string()
    } else if days == SCHEDULER_WEEKDAYS[5..] {
        "Weekends".to_string()
    } else {
        let names: Vec<&str> = days.iter().map(|d| weekday_name(*d)).collect();
        match names.split_last() {
            Some((last, rest)) if !rest.is_empty() => {
                format!("Every {} and {}", rest.join(", "), last)
            }
            _ => format!("Every {}", names.join("")),
        }
    };
    format!("{} at {}", day_part, time)
}
