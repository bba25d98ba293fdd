use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuotaUsage {
    pub day: NaiveDate,
    pub reads: u64,
    pub writes: u64,
    pub read_budget: u64,
    pub write_budget: u64,
}

impl QuotaUsage {
    pub fn remaining_reads(&self) -> u64 {
        self.read_budget.saturating_sub(self.reads)
    }

    pub fn remaining_writes(&self) -> u64 {
        self.write_budget.saturating_sub(self.writes)
    }
}

/// Daily document read/write budget. Counters reset at UTC midnight.
#[derive(Debug)]
pub struct QuotaMeter {
    read_budget: u64,
    write_budget: u64,
    usage: Mutex<(NaiveDate, u64, u64)>,
}

impl QuotaMeter {
    pub fn new(read_budget: u64, write_budget: u64) -> Self {
        Self {
            read_budget,
            write_budget,
            usage: Mutex::new((NaiveDate::MIN, 0, 0)),
        }
    }

    /// Reserves `count` reads; false when the budget for today is spent.
    pub fn try_read(&self, now: DateTime<Utc>, count: u64) -> bool {
        let mut usage = self.roll(now);
        if usage.1 + count > self.read_budget {
            return false;
        }
        usage.1 += count;
        true
    }

    pub fn try_write(&self, now: DateTime<Utc>, count: u64) -> bool {
        let mut usage = self.roll(now);
        if usage.2 + count > self.write_budget {
            return false;
        }
        usage.2 += count;
        true
    }

    pub fn usage(&self, now: DateTime<Utc>) -> QuotaUsage {
        let usage = self.roll(now);
        QuotaUsage {
            day: usage.0,
            reads: usage.1,
            writes: usage.2,
            read_budget: self.read_budget,
            write_budget: self.write_budget,
        }
    }

    fn roll(&self, now: DateTime<Utc>) -> std::sync::MutexGuard<'_, (NaiveDate, u64, u64)> {
        let mut usage = self.usage.lock().unwrap();
        let today = now.date_naive();
        if usage.0 != today {
            *usage = (today, 0, 0);
        }
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn budget_resets_at_midnight() {
        let meter = QuotaMeter::new(2, 1);
        let evening = Utc.with_ymd_and_hms(2026, 5, 4, 23, 59, 0).unwrap();
        assert!(meter.try_read(evening, 2));
        assert!(!meter.try_read(evening, 1));
        assert!(meter.try_write(evening, 1));
        assert!(!meter.try_write(evening, 1));
        assert_eq!(meter.usage(evening).remaining_writes(), 0);

        let morning = evening + Duration::minutes(2);
        assert!(meter.try_write(morning, 1));
        assert_eq!(meter.usage(morning).reads, 0);
    }
}
