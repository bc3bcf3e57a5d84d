//! Calendar schedules: date masks, cron syntax and per-day planning.

use std::fmt;

use chrono::{DateTime, Datelike, LocalResult, NaiveDate, TimeZone, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// Constraint set over calendar fields. An empty list allows every value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DateMask {
    /// 0..=59
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub minutes: Vec<u32>,
    /// 0..=23
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hours: Vec<u32>,
    /// Day of month, 1..=31
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub days: Vec<u32>,
    /// 1..=12
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub months: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub weekdays: Vec<Weekday>,
}

impl DateMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn minutes(mut self, minutes: impl IntoIterator<Item = u32>) -> Self {
        self.minutes = normalize(minutes);
        self
    }

    pub fn hours(mut self, hours: impl IntoIterator<Item = u32>) -> Self {
        self.hours = normalize(hours);
        self
    }

    pub fn days(mut self, days: impl IntoIterator<Item = u32>) -> Self {
        self.days = normalize(days);
        self
    }

    pub fn months(mut self, months: impl IntoIterator<Item = u32>) -> Self {
        self.months = normalize(months);
        self
    }

    pub fn weekdays(mut self, weekdays: impl IntoIterator<Item = Weekday>) -> Self {
        let mut days: Vec<Weekday> = Vec::new();
        for day in weekdays {
            if !days.contains(&day) {
                days.push(day);
            }
        }
        days.sort_by_key(|d| d.num_days_from_sunday());
        self.weekdays = days;
        self
    }

    /// True when no dimension is constrained.
    pub fn is_any(&self) -> bool {
        self.minutes.is_empty()
            && self.hours.is_empty()
            && self.days.is_empty()
            && self.months.is_empty()
            && self.weekdays.is_empty()
    }

    /// Reject values outside each field's calendar range.
    pub fn validate(&self) -> Result<()> {
        check_range("minute", &self.minutes, 0, 59)?;
        check_range("hour", &self.hours, 0, 23)?;
        check_range("day", &self.days, 1, 31)?;
        check_range("month", &self.months, 1, 12)?;
        Ok(())
    }

    pub fn matches_day(&self, date: NaiveDate) -> bool {
        allows(&self.days, date.day())
            && allows(&self.months, date.month())
            && (self.weekdays.is_empty() || self.weekdays.contains(&date.weekday()))
    }

    pub fn matches_hour(&self, hour: u32) -> bool {
        allows(&self.hours, hour)
    }

    pub fn matches_minute(&self, minute: u32) -> bool {
        allows(&self.minutes, minute)
    }

    /// Parse a five-field cron expression (`min hour dom month dow`).
    ///
    /// Fields accept `*`, values, ranges `a-b`, steps `*/n` / `a-b/n` and
    /// comma lists. Month and weekday fields also accept three-letter names.
    /// Unlike classic cron, day-of-month and weekday constraints are both
    /// required to match.
    pub fn from_cron(expression: &str) -> Result<Self> {
        let expanded = match expression.trim() {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SchedulerError::InvalidSchedule(format!(
                "cron expression {expression:?} must have 5 fields, found {}",
                fields.len()
            )));
        }

        let weekdays = parse_field(fields[4], 0, 7, &WEEKDAY_NAMES)?
            .into_iter()
            .map(weekday_from_sunday)
            .collect::<Vec<_>>();

        Ok(DateMask::new()
            .minutes(parse_field(fields[0], 0, 59, &[])?)
            .hours(parse_field(fields[1], 0, 23, &[])?)
            .days(parse_field(fields[2], 1, 31, &[])?)
            .months(parse_field(fields[3], 1, 12, &MONTH_NAMES)?)
            .weekdays(weekdays))
    }
}

impl fmt::Display for DateMask {
    /// Renders the mask in cron syntax, e.g. `0 2 * * 1,5`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let weekdays: Vec<u32> = self
            .weekdays
            .iter()
            .map(|d| d.num_days_from_sunday())
            .collect();
        write!(
            f,
            "{} {} {} {} {}",
            render_field(&self.minutes),
            render_field(&self.hours),
            render_field(&self.days),
            render_field(&self.months),
            render_field(&weekdays)
        )
    }
}

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

fn normalize(values: impl IntoIterator<Item = u32>) -> Vec<u32> {
    let mut values: Vec<u32> = values.into_iter().collect();
    values.sort_unstable();
    values.dedup();
    values
}

fn allows(set: &[u32], value: u32) -> bool {
    set.is_empty() || set.contains(&value)
}

fn check_range(field: &str, values: &[u32], min: u32, max: u32) -> Result<()> {
    match values.iter().find(|v| **v < min || **v > max) {
        Some(v) => Err(SchedulerError::InvalidSchedule(format!(
            "{field} {v} out of range {min}-{max}"
        ))),
        None => Ok(()),
    }
}

fn weekday_from_sunday(n: u32) -> Weekday {
    match n % 7 {
        0 => Weekday::Sun,
        1 => Weekday::Mon,
        2 => Weekday::Tue,
        3 => Weekday::Wed,
        4 => Weekday::Thu,
        5 => Weekday::Fri,
        _ => Weekday::Sat,
    }
}

fn render_field(values: &[u32]) -> String {
    if values.is_empty() {
        return "*".to_string();
    }
    values
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Expand one cron field into its explicit value list; `*` expands to empty.
fn parse_field(field: &str, min: u32, max: u32, names: &[&str]) -> Result<Vec<u32>> {
    if field == "*" {
        return Ok(Vec::new());
    }

    let invalid = |why: &str| SchedulerError::InvalidSchedule(format!("cron field {field:?}: {why}"));
    let value = |raw: &str| -> Result<u32> {
        if let Some(pos) = names.iter().position(|n| n.eq_ignore_ascii_case(raw)) {
            // name tables start at the field minimum
            return Ok(min + pos as u32);
        }
        let v: u32 = raw.parse().map_err(|_| invalid("not a number"))?;
        if v < min || v > max {
            return Err(invalid(&format!("{v} out of range {min}-{max}")));
        }
        Ok(v)
    };

    let mut out = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid("bad step"))?;
                if step == 0 {
                    return Err(invalid("step must be positive"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (value(a)?, value(b)?)
        } else {
            let v = value(range)?;
            // `a/n` runs from a to the field maximum
            if step > 1 {
                (v, max)
            } else {
                (v, v)
            }
        };
        if lo > hi {
            return Err(invalid("range start after end"));
        }
        out.extend((lo..=hi).step_by(step as usize));
    }

    Ok(normalize(out))
}

/// Calendar trigger built from one or more date masks; an instant matches
/// when it satisfies every mask.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ScheduleDef", into = "ScheduleDef")]
pub struct Schedule {
    masks: Vec<DateMask>,
}

impl Schedule {
    /// A schedule with no constraint: every minute of every day.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cron(expression: &str) -> Result<Self> {
        Ok(Self::new().with_date_mask(DateMask::from_cron(expression)?))
    }

    /// Returns a new schedule further restricted by `mask`.
    pub fn with_date_mask(&self, mask: DateMask) -> Schedule {
        let mut masks = self.masks.clone();
        masks.push(mask);
        Schedule { masks }
    }

    pub fn masks(&self) -> &[DateMask] {
        &self.masks
    }

    /// Minute-granularity match; seconds are ignored.
    pub fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        let local = at.naive_local();
        self.masks.iter().all(|m| {
            m.matches_day(local.date())
                && m.matches_hour(local.hour())
                && m.matches_minute(local.minute())
        })
    }

    /// Every instant of `date`'s local calendar day matching the schedule,
    /// ascending.
    ///
    /// Local times skipped by a DST transition are absent; local times
    /// repeated by one yield both instants.
    pub fn plan_for_date<Tz: TimeZone>(&self, date: &DateTime<Tz>) -> Vec<DateTime<Tz>> {
        let day = date.date_naive();
        let tz = date.timezone();

        if !self.masks.iter().all(|m| m.matches_day(day)) {
            return Vec::new();
        }

        let mut plan = Vec::new();
        for hour in 0..24 {
            if !self.masks.iter().all(|m| m.matches_hour(hour)) {
                continue;
            }
            for minute in 0..60 {
                if !self.masks.iter().all(|m| m.matches_minute(minute)) {
                    continue;
                }
                let Some(local) = day.and_hms_opt(hour, minute, 0) else {
                    continue;
                };
                match tz.from_local_datetime(&local) {
                    LocalResult::Single(t) => plan.push(t),
                    LocalResult::Ambiguous(first, second) => {
                        plan.push(first);
                        plan.push(second);
                    }
                    LocalResult::None => {}
                }
            }
        }

        plan.sort();
        plan.dedup();
        plan
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.masks.is_empty() {
            return write!(f, "{}", DateMask::default());
        }
        let parts: Vec<String> = self.masks.iter().map(DateMask::to_string).collect();
        write!(f, "{}", parts.join(" & "))
    }
}

/// Config-file shape of a [`Schedule`]: mask fields inline, an optional
/// cron expression, and optional extra masks under `also`. Unknown keys are
/// rejected so a misspelt field cannot widen the schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScheduleDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cron: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    minutes: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    hours: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    days: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    months: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    weekdays: Vec<Weekday>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    also: Vec<DateMask>,
}

impl TryFrom<ScheduleDef> for Schedule {
    type Error = SchedulerError;

    fn try_from(def: ScheduleDef) -> Result<Self> {
        let mask = DateMask {
            minutes: def.minutes,
            hours: def.hours,
            days: def.days,
            months: def.months,
            weekdays: def.weekdays,
        };
        let mut schedule = Schedule::new();
        if !mask.is_any() {
            mask.validate()?;
            schedule = schedule.with_date_mask(mask);
        }
        if let Some(ref expr) = def.cron {
            schedule = schedule.with_date_mask(DateMask::from_cron(expr)?);
        }
        for mask in def.also {
            mask.validate()?;
            schedule = schedule.with_date_mask(mask);
        }
        Ok(schedule)
    }
}

impl From<Schedule> for ScheduleDef {
    fn from(schedule: Schedule) -> Self {
        let mut masks = schedule.masks.into_iter();
        let first = masks.next().unwrap_or_default();
        ScheduleDef {
            cron: None,
            minutes: first.minutes,
            hours: first.hours,
            days: first.days,
            months: first.months,
            weekdays: first.weekdays,
            also: masks.collect(),
        }
    }
}

/// First existing local instant of the calendar day after `date`.
pub fn next_midnight<Tz: TimeZone>(date: &DateTime<Tz>) -> DateTime<Tz> {
    let tz = date.timezone();
    let day = date.date_naive();
    if let Some(next) = day.succ_opt() {
        // midnight itself may be skipped by a DST jump
        for minute in 0..24 * 60 {
            let Some(local) = next.and_hms_opt(minute / 60, minute % 60, 0) else {
                continue;
            };
            if let Some(t) = tz.from_local_datetime(&local).earliest() {
                return t;
            }
        }
    }
    date.clone() + chrono::Duration::days(1)
}
