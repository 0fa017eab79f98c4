//! History buckets and deadline arithmetic
//!
//! All calendar math is done in UTC. Timestamps are unix seconds.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDateTime, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

/// Width unit of a history bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryUnit {
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

/// Configured history granularity, e.g. `5m`, `1h`, `1M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct History {
    pub unit: HistoryUnit,
    pub howmany: u32,
}

/// Direction of a variable-width (monthly) step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Add,
    Sub,
}

impl History {
    /// Bucket width starting (`Add`) or ending (`Sub`) at `at`.
    pub fn timeslot(&self, at: i64, step: Step) -> i64 {
        let n = i64::from(self.howmany);
        match self.unit {
            HistoryUnit::Minutely => n * 60,
            HistoryUnit::Hourly => n * 3600,
            HistoryUnit::Daily => n * 86400,
            HistoryUnit::Weekly => n * 86400 * 7,
            HistoryUnit::Monthly => monthly_timeslot(at, self.howmany, step),
        }
    }

    pub fn is_monthly(&self) -> bool {
        self.unit == HistoryUnit::Monthly
    }

    /// Roundoff letter matching the bucket unit.
    pub fn unit_letter(&self) -> char {
        match self.unit {
            HistoryUnit::Minutely => 'm',
            HistoryUnit::Hourly => 'h',
            HistoryUnit::Daily => 'd',
            HistoryUnit::Weekly => 'w',
            HistoryUnit::Monthly => 'M',
        }
    }
}

impl FromStr for History {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (num, unit) = s.split_at(s.len().saturating_sub(1));
        let howmany = if num.is_empty() {
            1
        } else {
            num.parse::<u32>()
                .map_err(|_| format!("invalid history multiplier in '{}'", s))?
        };
        if howmany == 0 {
            return Err(format!("history multiplier must be positive in '{}'", s));
        }
        let unit = match unit {
            "m" => HistoryUnit::Minutely,
            "h" => HistoryUnit::Hourly,
            "d" => HistoryUnit::Daily,
            "w" => HistoryUnit::Weekly,
            "M" => HistoryUnit::Monthly,
            _ => return Err(format!("invalid history unit in '{}'", s)),
        };
        Ok(Self { unit, howmany })
    }
}

impl fmt::Display for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.howmany, self.unit_letter())
    }
}

/// An active history bucket: `[basetime, basetime + timeslot)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub basetime: i64,
    pub timeslot: i64,
}

impl Bucket {
    /// Initial bucket for a worker starting at `now`.
    pub fn initial(history: &History, now: i64, roundoff: &str) -> Self {
        let mut basetime = now;
        let mut timeslot = history.timeslot(basetime, Step::Add);
        if history.is_monthly() {
            basetime = roundoff_time(basetime, "d");
            timeslot = history.timeslot(basetime, Step::Add);
        }

        let mut t = roundoff_time(basetime, roundoff);
        while t + timeslot < basetime {
            t += timeslot;
            if history.is_monthly() {
                timeslot = history.timeslot(t, Step::Add);
            }
        }

        Self {
            basetime: t,
            timeslot,
        }
    }

    pub fn end(&self) -> i64 {
        self.basetime + self.timeslot
    }

    pub fn contains(&self, t: i64) -> bool {
        t >= self.basetime && t < self.end()
    }

    /// Step from this bucket until `t` falls inside the result.
    pub fn resolve(&self, history: &History, t: i64) -> Self {
        let mut basetime = self.basetime;
        let mut timeslot = self.timeslot;

        while basetime > t {
            if history.is_monthly() {
                timeslot = history.timeslot(basetime, Step::Sub);
            }
            basetime -= timeslot;
        }
        while basetime + timeslot <= t {
            basetime += timeslot;
            if history.is_monthly() {
                timeslot = history.timeslot(basetime, Step::Add);
            }
        }

        Self { basetime, timeslot }
    }

    /// The bucket immediately following this one.
    pub fn next(&self, history: &History) -> Self {
        let basetime = self.end();
        Self {
            basetime,
            timeslot: history.timeslot(basetime, Step::Add),
        }
    }
}

/// First refresh deadline after `now`.
pub fn refresh_deadline(now: i64, refresh_time: i64, roundoff: &str, startup_delay: i64) -> i64 {
    let mut t = roundoff_time(now, roundoff);
    while t + refresh_time < now {
        t += refresh_time;
    }
    t + refresh_time + startup_delay
}

/// First trigger deadline after `now` and the width of the trigger slot.
///
/// Without a trigger history the refresh interval is used, so the trigger
/// fires after every purge.
pub fn trigger_deadline(
    now: i64,
    trigger: Option<&History>,
    refresh_time: i64,
    roundoff: &str,
) -> (i64, i64) {
    let mut deadline = now;
    let mut slot = match trigger {
        Some(h) if h.is_monthly() => {
            deadline = roundoff_time(deadline, "d");
            h.timeslot(deadline, Step::Add)
        }
        Some(h) => h.timeslot(deadline, Step::Add),
        None => refresh_time,
    };

    let mut t = roundoff_time(deadline, roundoff);
    while t + slot < deadline {
        t += slot;
        if let Some(h) = trigger.filter(|h| h.is_monthly()) {
            slot = h.timeslot(t, Step::Add);
        }
    }

    let deadline = t + slot;
    if let Some(h) = trigger.filter(|h| h.is_monthly()) {
        slot = h.timeslot(t, Step::Add);
    }
    (deadline, slot)
}

/// Truncate `t` according to the roundoff letters in `spec`.
///
/// `m` clears seconds, `h` clears minutes, `d` clears hours, `w` goes back to
/// Monday, `M` goes back to the first day of the month. Unknown letters are
/// ignored.
pub fn roundoff_time(t: i64, spec: &str) -> i64 {
    let Some(mut dt) = to_naive(t) else {
        return t;
    };

    for c in spec.chars() {
        dt = match c {
            'm' => dt.with_second(0).unwrap_or(dt),
            'h' => dt
                .with_second(0)
                .and_then(|d| d.with_minute(0))
                .unwrap_or(dt),
            'd' => start_of_day(dt),
            'w' => {
                let back = i64::from(dt.weekday().num_days_from_monday());
                start_of_day(dt) - Duration::days(back)
            }
            'M' => start_of_day(dt).with_day(1).unwrap_or(dt),
            _ => dt,
        };
    }

    dt.and_utc().timestamp()
}

/// Seconds between `t` and the same instant `howmany` months later (`Add`)
/// or earlier (`Sub`).
pub fn monthly_timeslot(t: i64, howmany: u32, step: Step) -> i64 {
    let Some(dt) = to_naive(t) else {
        return 0;
    };
    let months = Months::new(howmany);
    let other = match step {
        Step::Add => dt.checked_add_months(months),
        Step::Sub => dt.checked_sub_months(months),
    };
    match other {
        Some(o) => (o.and_utc().timestamp() - t).abs(),
        None => 0,
    }
}

fn to_naive(t: i64) -> Option<NaiveDateTime> {
    DateTime::<Utc>::from_timestamp(t, 0).map(|d| d.naive_utc())
}

fn start_of_day(dt: NaiveDateTime) -> NaiveDateTime {
    dt.date().and_hms_opt(0, 0, 0).unwrap_or(dt)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-15 10:27:33 UTC, a Friday
    const T: i64 = 1_710_498_453;

    #[test]
    fn test_parse_history() {
        let h: History = "5m".parse().unwrap();
        assert_eq!(h.unit, HistoryUnit::Minutely);
        assert_eq!(h.howmany, 5);
        assert_eq!("M".parse::<History>().unwrap().howmany, 1);
        assert!("0h".parse::<History>().is_err());
        assert!("3x".parse::<History>().is_err());
        assert_eq!(h.to_string(), "5m");
    }

    #[test]
    fn test_roundoff() {
        assert_eq!(roundoff_time(T, "m"), 1_710_498_420);
        assert_eq!(roundoff_time(T, "h"), 1_710_496_800);
        assert_eq!(roundoff_time(T, "d"), 1_710_460_800);
        // Monday 2024-03-11
        assert_eq!(roundoff_time(T, "w"), 1_710_115_200);
        // 2024-03-01
        assert_eq!(roundoff_time(T, "M"), 1_709_251_200);
        assert_eq!(roundoff_time(T, ""), T);
    }

    #[test]
    fn test_monthly_timeslot() {
        // March 2024 has 31 days, February 2024 has 29
        let march = 1_709_251_200;
        assert_eq!(monthly_timeslot(march, 1, Step::Add), 31 * 86400);
        assert_eq!(monthly_timeslot(march, 1, Step::Sub), 29 * 86400);
    }

    #[test]
    fn test_initial_bucket_is_aligned() {
        let h: History = "5m".parse().unwrap();
        let b = Bucket::initial(&h, T, "m");
        assert_eq!(b.timeslot, 300);
        assert!(b.contains(T));
        assert_eq!(b.basetime % 60, 0);
    }

    #[test]
    fn test_resolve_steps_both_ways() {
        let h: History = "1h".parse().unwrap();
        let b = Bucket::initial(&h, T, "h");
        assert_eq!(b.basetime, 1_710_496_800);

        let later = b.resolve(&h, T + 2 * 3600);
        assert_eq!(later.basetime, b.basetime + 2 * 3600);
        assert!(later.contains(T + 2 * 3600));

        let earlier = b.resolve(&h, T - 3600);
        assert_eq!(earlier.basetime, b.basetime - 3600);

        // half-open: the end of the bucket belongs to the next one
        assert_eq!(b.resolve(&h, b.end()).basetime, b.end());
    }

    #[test]
    fn test_resolve_monthly() {
        let h: History = "1M".parse().unwrap();
        let b = Bucket::initial(&h, T, "M");
        assert_eq!(b.basetime, 1_709_251_200);
        // 2024-04-10
        let april = b.resolve(&h, 1_712_707_200);
        assert_eq!(april.basetime, 1_711_929_600);
        assert_eq!(april.timeslot, 30 * 86400);
    }

    #[test]
    fn test_refresh_deadline() {
        let d = refresh_deadline(T, 60, "m", 0);
        assert_eq!(d, 1_710_498_480);
        assert!(d > T);
        assert_eq!(refresh_deadline(T, 60, "m", 10), d + 10);
    }

    #[test]
    fn test_trigger_deadline_defaults_to_refresh() {
        let (deadline, slot) = trigger_deadline(T, None, 300, "h");
        assert_eq!(slot, 300);
        assert!(deadline > T);
        assert_eq!((deadline - 1_710_496_800) % 300, 0);
    }
}
