//! Cron expression parsing and next-fire computation.
//!
//! Accepts 5-field (`min hour dom month dow`) and 6-field
//! (`sec min hour dom month dow`) expressions with `*`, lists, ranges, and
//! steps. Day-of-month and day-of-week combine with OR when both are
//! restricted, matching the classic cron convention.

use crate::error::{Result, StratumError};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

#[derive(Debug, Clone)]
struct FieldSet {
    allowed: Vec<bool>,
    restricted: bool,
    min: u32,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        self.allowed
            .get((value - self.min) as usize)
            .copied()
            .unwrap_or(false)
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    has_seconds: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let (has_seconds, offset) = match fields.len() {
            5 => (false, 0),
            6 => (true, 1),
            n => {
                return Err(StratumError::InvalidCron {
                    expr: expr.to_string(),
                    detail: format!("expected 5 or 6 fields, got {}", n),
                })
            }
        };
        let parse = |spec: &str, min: u32, max: u32| parse_field(expr, spec, min, max);
        let seconds = if has_seconds {
            parse(fields[0], 0, 59)?
        } else {
            // Without a seconds field the expression fires at second zero.
            exact_field(0, 0, 59)
        };
        Ok(Self {
            source: expr.to_string(),
            seconds,
            minutes: parse(fields[offset], 0, 59)?,
            hours: parse(fields[offset + 1], 0, 23)?,
            days_of_month: parse(fields[offset + 2], 1, 31)?,
            months: parse(fields[offset + 3], 1, 12)?,
            days_of_week: parse_dow(expr, fields[offset + 4])?,
            has_seconds,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (self.days_of_month.restricted, self.days_of_week.restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// The next instant strictly after `from` matching the expression, or
    /// `None` when no match exists within roughly four years.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = if self.has_seconds {
            from + Duration::seconds(1)
        } else {
            from
                .with_second(0)
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(from)
                + Duration::minutes(1)
        };
        t = t.with_nanosecond(0).unwrap_or(t);
        let horizon = from + Duration::days(4 * 366);

        // Field-wise stepping: on a mismatch jump to the start of the next
        // month/day/hour/minute instead of scanning every second.
        let mut guard = 0u32;
        while t <= horizon {
            guard += 1;
            if guard > 5_000_000 {
                return None;
            }
            if !self.months.contains(t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                let next = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
                t = Utc.from_utc_datetime(&next);
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                let next = t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?;
                t = Utc.from_utc_datetime(&next);
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t
                    .with_minute(0)
                    .and_then(|t| t.with_second(0))
                    .unwrap_or(t)
                    + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t = t.with_second(0).unwrap_or(t) + Duration::minutes(1);
                continue;
            }
            if !self.seconds.contains(t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

fn exact_field(value: u32, min: u32, max: u32) -> FieldSet {
    let mut allowed = vec![false; (max - min + 1) as usize];
    allowed[(value - min) as usize] = true;
    FieldSet {
        allowed,
        restricted: true,
        min,
    }
}

fn parse_field(expr: &str, spec: &str, min: u32, max: u32) -> Result<FieldSet> {
    let mut allowed = vec![false; (max - min + 1) as usize];
    let mut restricted = false;
    for part in spec.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid(expr, part))?;
                if step == 0 {
                    return Err(invalid(expr, part));
                }
                (range, step)
            }
            None => (part, 1),
        };
        let (low, high) = if range == "*" {
            (min, max)
        } else {
            restricted = true;
            match range.split_once('-') {
                Some((a, b)) => {
                    let low: u32 = a.parse().map_err(|_| invalid(expr, part))?;
                    let high: u32 = b.parse().map_err(|_| invalid(expr, part))?;
                    (low, high)
                }
                None => {
                    let v: u32 = range.parse().map_err(|_| invalid(expr, part))?;
                    (v, v)
                }
            }
        };
        if low < min || high > max || low > high {
            return Err(invalid(expr, part));
        }
        // A step over `*` still restricts the field.
        if step > 1 {
            restricted = true;
        }
        let mut v = low;
        while v <= high {
            allowed[(v - min) as usize] = true;
            v += step;
        }
    }
    Ok(FieldSet {
        allowed,
        restricted,
        min,
    })
}

/// Day-of-week accepts 0-7, both 0 and 7 meaning Sunday.
fn parse_dow(expr: &str, spec: &str) -> Result<FieldSet> {
    // Ranges like "5-7" must keep the 7 so the bounds stay ordered; a bare 7
    // simply aliases 0.
    if spec.contains('7') && spec.contains('-') {
        let set = parse_field(expr, spec, 0, 7)?;
        let mut allowed = set.allowed;
        if allowed.len() == 8 && allowed[7] {
            allowed[0] = true;
        }
        allowed.truncate(7);
        return Ok(FieldSet {
            allowed,
            restricted: set.restricted,
            min: 0,
        });
    }
    parse_field(expr, &spec.replace('7', "0"), 0, 6)
}

fn invalid(expr: &str, part: &str) -> StratumError {
    StratumError::InvalidCron {
        expr: expr.to_string(),
        detail: format!("invalid field part '{}'", part),
    }
}
