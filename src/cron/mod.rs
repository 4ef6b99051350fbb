use crate::{PerchError, Result};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use std::collections::BTreeSet;
use std::fmt;

/// A parsed standard 5-field cron expression
/// (minute, hour, day-of-month, month, day-of-week)
///
/// Each field accepts `*`, comma lists, `a-b` ranges, `*/n` or `a-b/n`
/// steps, and single values. Day-of-week runs 0-6 with 0 = Sunday. When
/// both day fields are restricted, a day matches if either does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CronField {
    raw: String,
    wildcard: bool,
    values: BTreeSet<u32>,
}

impl CronField {
    fn parse(raw: &str, min: u32, max: u32) -> Result<Self> {
        if raw.is_empty() {
            return Err(PerchError::Cron("empty cron field".to_string()));
        }
        let mut values = BTreeSet::new();
        let mut wildcard = true;
        for term in raw.split(',') {
            let (range, step) = match term.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().map_err(|_| {
                        PerchError::Cron(format!("invalid step in {term:?}"))
                    })?;
                    if step == 0 {
                        return Err(PerchError::Cron(format!("zero step in {term:?}")));
                    }
                    (range, step)
                }
                None => (term, 1),
            };

            let (lo, hi) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                wildcard = false;
                let a: u32 = a
                    .parse()
                    .map_err(|_| PerchError::Cron(format!("invalid range in {term:?}")))?;
                let b: u32 = b
                    .parse()
                    .map_err(|_| PerchError::Cron(format!("invalid range in {term:?}")))?;
                if a > b {
                    return Err(PerchError::Cron(format!("inverted range in {term:?}")));
                }
                (a, b)
            } else {
                wildcard = false;
                let v: u32 = range
                    .parse()
                    .map_err(|_| PerchError::Cron(format!("invalid value {term:?}")))?;
                (v, v)
            };

            if lo < min || hi > max {
                return Err(PerchError::Cron(format!(
                    "value out of range in {term:?} (allowed {min}-{max})"
                )));
            }
            // A stepped wildcard restricts the field.
            if step > 1 {
                wildcard = false;
            }
            let mut v = lo;
            while v <= hi {
                values.insert(v);
                v += step;
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            wildcard,
            values,
        })
    }

    fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(PerchError::Cron(format!(
                "expected 5 cron fields, found {} in {expr:?}",
                fields.len()
            )));
        }
        Ok(Self {
            minute: CronField::parse(fields[0], 0, 59)?,
            hour: CronField::parse(fields[1], 0, 23)?,
            day_of_month: CronField::parse(fields[2], 1, 31)?,
            month: CronField::parse(fields[3], 1, 12)?,
            day_of_week: CronField::parse(fields[4], 0, 6)?,
        })
    }

    /// Re-emits the expression as its five original fields.
    pub fn emit(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.minute.raw,
            self.hour.raw,
            self.day_of_month.raw,
            self.month.raw,
            self.day_of_week.raw
        )
    }

    /// The first matching instant strictly after `from`.
    ///
    /// Returns `None` when no match exists within roughly four years, which
    /// callers surface as a cron error instead of scheduling at a bogus
    /// instant.
    pub fn next(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let horizon = from + Duration::minutes(crate::constants::CRON_SEARCH_HORIZON_MINUTES);
        // Truncate to the minute, then advance: "strictly after".
        let mut t = Utc
            .with_ymd_and_hms(
                from.year(),
                from.month(),
                from.day(),
                from.hour(),
                from.minute(),
                0,
            )
            .single()?
            + Duration::minutes(1);

        while t <= horizon {
            if !self.month.matches(t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = Utc
                    .with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
                    .single()?
                    + Duration::days(1);
                continue;
            }
            if !self.hour.matches(t.hour()) {
                t = Utc
                    .with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0)
                    .single()?
                    + Duration::hours(1);
                continue;
            }
            if !self.minute.matches(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    /// Does the expression match this instant (minute precision)?
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.month.matches(t.month())
            && self.day_matches(t)
    }

    // Standard day handling: with both day fields restricted, either may
    // match; otherwise the restricted one (or both wildcards) governs.
    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.day_of_month.matches(t.day());
        let dow = self
            .day_of_week
            .matches(t.weekday().num_days_from_sunday());
        match (self.day_of_month.wildcard, self.day_of_week.wildcard) {
            (false, false) => dom || dow,
            (false, true) => dom,
            (true, false) => dow,
            (true, true) => true,
        }
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.emit())
    }
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn weekday_morning_skips_the_weekend() {
        let expr = CronExpr::parse("0 8 * * 1-5").unwrap();
        // Saturday 09:00 rolls to Monday 08:00.
        assert_eq!(
            expr.next(at(2026, 2, 7, 9, 0)).unwrap(),
            at(2026, 2, 9, 8, 0)
        );
    }

    #[test]
    fn next_is_strictly_after_an_exact_match() {
        let expr = CronExpr::parse("30 10 * * *").unwrap();
        assert_eq!(
            expr.next(at(2026, 2, 7, 10, 30)).unwrap(),
            at(2026, 2, 8, 10, 30)
        );
    }

    #[test]
    fn every_minute_advances_by_one() {
        let expr = CronExpr::parse("* * * * *").unwrap();
        let from = at(2026, 2, 7, 9, 0);
        assert_eq!(expr.next(from).unwrap(), at(2026, 2, 7, 9, 1));
    }

    #[test]
    fn next_always_matches_and_nothing_in_between() {
        let expr = CronExpr::parse("*/15 9-17 * * *").unwrap();
        let mut from = at(2026, 3, 1, 0, 0);
        for _ in 0..10 {
            let next = expr.next(from).unwrap();
            assert!(next > from);
            assert!(expr.matches(next));
            // No earlier matching minute between from and next.
            let mut probe = from + Duration::minutes(1);
            while probe < next {
                assert!(!expr.matches(probe));
                probe += Duration::minutes(1);
            }
            from = next;
        }
    }

    #[test]
    fn month_boundaries_roll_over() {
        let expr = CronExpr::parse("0 0 1 * *").unwrap();
        assert_eq!(
            expr.next(at(2026, 12, 15, 3, 0)).unwrap(),
            at(2027, 1, 1, 0, 0)
        );
    }

    #[test]
    fn comma_lists_ranges_and_steps() {
        let expr = CronExpr::parse("0,30 8-10 * 2 *").unwrap();
        assert_eq!(
            expr.next(at(2026, 1, 20, 0, 0)).unwrap(),
            at(2026, 2, 1, 8, 0)
        );
        assert_eq!(
            expr.next(at(2026, 2, 1, 8, 0)).unwrap(),
            at(2026, 2, 1, 8, 30)
        );
    }

    #[test]
    fn restricted_day_fields_match_either() {
        // The 15th OR any Monday.
        let expr = CronExpr::parse("0 0 15 * 1").unwrap();
        // 2026-03-02 is a Monday before the 15th.
        assert_eq!(
            expr.next(at(2026, 3, 1, 0, 0)).unwrap(),
            at(2026, 3, 2, 0, 0)
        );
        // From the 3rd, the following Monday (the 9th) precedes the 15th.
        assert_eq!(
            expr.next(at(2026, 3, 3, 0, 0)).unwrap(),
            at(2026, 3, 9, 0, 0)
        );
    }

    #[test]
    fn impossible_expression_returns_none() {
        // February 30th never exists.
        let expr = CronExpr::parse("0 0 30 2 *").unwrap();
        assert!(expr.next(at(2026, 1, 1, 0, 0)).is_none());
    }

    #[test]
    fn parse_rejects_malformed_expressions() {
        for bad in [
            "",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 7",
            "a * * * *",
            "1-0 * * * *",
            "*/0 * * * *",
        ] {
            assert!(CronExpr::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn emit_round_trips_field_for_field() {
        for expr in ["* * * * *", "0 8 * * 1-5", "*/15 9-17 1,15 2-4/2 0"] {
            let parsed = CronExpr::parse(expr).unwrap();
            assert_eq!(parsed.emit(), expr);
            assert_eq!(CronExpr::parse(&parsed.emit()).unwrap(), parsed);
        }
    }
}
