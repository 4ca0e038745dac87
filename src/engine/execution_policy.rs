//! Market-hours calendar classifier.
//!
//! No direct teacher precedent exists for a trading calendar (the teacher
//! crate's markets trade continuously); this module is grounded only on
//! the `chrono-tz` dependency choice carried over from the `chapaty`
//! example repo's Cargo.toml, used the way that crate's timezone-aware
//! backtesting code does - converting a UTC instant into exchange-local
//! wall time before classifying it.

use chrono::{Datelike, NaiveTime, TimeZone, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::engine::clock::{nanos_to_datetime, Nanos};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketSession {
    Closed,
    PreMarket,
    Regular,
    AfterHours,
}

/// Exchange trading calendar: weekday session boundaries in exchange-local
/// time, plus a holiday list of exchange-local dates the exchange is fully
/// closed.
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    pub timezone: Tz,
    pub premarket_open: NaiveTime,
    pub regular_open: NaiveTime,
    pub regular_close: NaiveTime,
    pub afterhours_close: NaiveTime,
    /// Exchange-local dates (ISO 8601, e.g. "2026-01-01") the exchange does
    /// not trade at all.
    pub holidays: Vec<chrono::NaiveDate>,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::America::New_York,
            premarket_open: NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
            regular_open: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            regular_close: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            afterhours_close: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            holidays: Vec::new(),
        }
    }
}

impl ExecutionPolicy {
    fn is_trading_day(&self, date: chrono::NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    /// Classifies `t` against the exchange-local calendar, correctly
    /// handling DST transitions by converting through `chrono_tz` rather
    /// than applying a fixed UTC offset.
    pub fn classify(&self, t: Nanos) -> MarketSession {
        let utc = nanos_to_datetime(t);
        let local = utc.with_timezone(&self.timezone);
        if !self.is_trading_day(local.date_naive()) {
            return MarketSession::Closed;
        }
        let time = local.time();
        if time < self.premarket_open || time >= self.afterhours_close {
            MarketSession::Closed
        } else if time < self.regular_open {
            MarketSession::PreMarket
        } else if time < self.regular_close {
            MarketSession::Regular
        } else {
            MarketSession::AfterHours
        }
    }

    pub fn is_regular_session(&self, t: Nanos) -> bool {
        self.classify(t) == MarketSession::Regular
    }

    /// First instant strictly after `t` at which the regular session opens,
    /// walking forward day by day over the holiday/weekend calendar.
    pub fn next_market_open_after(&self, t: Nanos) -> Nanos {
        let utc = nanos_to_datetime(t);
        let mut local = utc.with_timezone(&self.timezone);
        loop {
            let candidate_date = local.date_naive();
            let candidate_open = self
                .timezone
                .from_local_datetime(&candidate_date.and_time(self.regular_open))
                .single();
            if let Some(open_dt) = candidate_open {
                if open_dt > local && self.is_trading_day(candidate_date) {
                    return crate::engine::clock::datetime_to_nanos(&open_dt.with_timezone(&chrono::Utc));
                }
            }
            // Advance to midnight of the next local day and retry.
            let next_date = candidate_date.succ_opt().expect("date overflow");
            local = self
                .timezone
                .from_local_datetime(&next_date.and_hms_opt(0, 0, 0).unwrap())
                .single()
                .expect("midnight is unambiguous");
        }
    }

    /// The regular-session close boundary for the trading day containing
    /// `t`, used by the matching engine to expire DAY orders.
    pub fn market_close_for_day_of(&self, t: Nanos) -> Nanos {
        let utc = nanos_to_datetime(t);
        let local = utc.with_timezone(&self.timezone);
        let close_dt = self
            .timezone
            .from_local_datetime(&local.date_naive().and_time(self.regular_close))
            .single()
            .expect("regular close is unambiguous");
        crate::engine::clock::datetime_to_nanos(&close_dt.with_timezone(&chrono::Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ts(y: i32, m: u32, d: u32, h: u32, mi: u32) -> Nanos {
        crate::engine::clock::datetime_to_nanos(
            &chrono_tz::America::New_York
                .with_ymd_and_hms(y, m, d, h, mi, 0)
                .unwrap()
                .with_timezone(&Utc),
        )
    }

    #[test]
    fn classifies_regular_session() {
        let policy = ExecutionPolicy::default();
        assert_eq!(policy.classify(ts(2026, 1, 6, 10, 0)), MarketSession::Regular);
    }

    #[test]
    fn classifies_premarket_and_afterhours() {
        let policy = ExecutionPolicy::default();
        assert_eq!(policy.classify(ts(2026, 1, 6, 5, 0)), MarketSession::PreMarket);
        assert_eq!(policy.classify(ts(2026, 1, 6, 17, 0)), MarketSession::AfterHours);
        assert_eq!(policy.classify(ts(2026, 1, 6, 22, 0)), MarketSession::Closed);
    }

    #[test]
    fn weekend_is_closed_regardless_of_time() {
        let policy = ExecutionPolicy::default();
        // 2026-01-10 is a Saturday.
        assert_eq!(policy.classify(ts(2026, 1, 10, 10, 0)), MarketSession::Closed);
    }

    #[test]
    fn next_market_open_skips_weekend() {
        let policy = ExecutionPolicy::default();
        // Friday 2026-01-09 at 17:00 -> next open is Monday 2026-01-12 09:30.
        let next = policy.next_market_open_after(ts(2026, 1, 9, 17, 0));
        assert_eq!(next, ts(2026, 1, 12, 9, 30));
    }
}
