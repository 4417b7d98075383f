//! Trading calendar
//!
//! Weekend and holiday logic per market. Trading days are Monday through
//! Friday minus the market's holiday set. The built-in holiday sets are
//! minimal; production deployments override them through configuration.

use std::collections::BTreeSet;

use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// Trading calendar for a single market
#[derive(Debug, Clone)]
pub struct TradingCalendar {
    market_id: String,
    holidays: BTreeSet<NaiveDate>,
}

impl TradingCalendar {
    /// Create a calendar with an explicit holiday set
    pub fn new(market_id: &str, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            market_id: market_id.to_string(),
            holidays: holidays.into_iter().collect(),
        }
    }

    /// Create a calendar with the built-in holiday set for the market
    pub fn with_defaults(market_id: &str) -> Self {
        Self::new(market_id, default_holidays(market_id))
    }

    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    /// True if `date` is a weekday and not a holiday for this market
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    /// Next trading day strictly after `date`
    pub fn next_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date + Duration::days(1);
        while !self.is_trading_day(d) {
            d += Duration::days(1);
        }
        d
    }

    /// Previous trading day strictly before `date`
    pub fn previous_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date - Duration::days(1);
        while !self.is_trading_day(d) {
            d -= Duration::days(1);
        }
        d
    }

    /// All trading days in `[start, end]`, ascending
    pub fn trading_days_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut d = start;
        while d <= end {
            if self.is_trading_day(d) {
                days.push(d);
            }
            d += Duration::days(1);
        }
        days
    }
}

/// Minimal built-in holiday sets (full exchange calendars come from config)
fn default_holidays(market_id: &str) -> Vec<NaiveDate> {
    let ymd = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).expect("valid holiday date");
    match market_id {
        "US_EQ" => vec![
            ymd(2024, 1, 1),
            ymd(2024, 7, 4),
            ymd(2024, 12, 25),
            ymd(2025, 1, 1),
            ymd(2025, 7, 4),
            ymd(2025, 12, 25),
        ],
        "EU_EQ" => vec![
            ymd(2024, 1, 1),
            ymd(2024, 12, 25),
            ymd(2024, 12, 26),
            ymd(2025, 1, 1),
            ymd(2025, 12, 25),
            ymd(2025, 12, 26),
        ],
        "ASIA_EQ" => vec![
            ymd(2024, 1, 1),
            ymd(2024, 1, 2),
            ymd(2024, 1, 3),
            ymd(2025, 1, 1),
            ymd(2025, 1, 2),
            ymd(2025, 1, 3),
        ],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_weekends_are_not_trading_days() {
        let cal = TradingCalendar::with_defaults("US_EQ");
        assert!(!cal.is_trading_day(ymd(2024, 3, 2))); // Saturday
        assert!(!cal.is_trading_day(ymd(2024, 3, 3))); // Sunday
        assert!(cal.is_trading_day(ymd(2024, 3, 4))); // Monday
    }

    #[test]
    fn test_holidays_are_not_trading_days() {
        let cal = TradingCalendar::with_defaults("US_EQ");
        assert!(!cal.is_trading_day(ymd(2024, 1, 1)));
        assert!(!cal.is_trading_day(ymd(2024, 12, 25)));
    }

    #[test]
    fn test_next_trading_day_skips_weekend() {
        let cal = TradingCalendar::with_defaults("US_EQ");
        // Friday -> Monday
        assert_eq!(cal.next_trading_day(ymd(2024, 3, 1)), ymd(2024, 3, 4));
    }

    #[test]
    fn test_next_trading_day_skips_holiday() {
        let cal = TradingCalendar::with_defaults("US_EQ");
        // Dec 24 2024 is a Tuesday; Dec 25 is a holiday -> Dec 26
        assert_eq!(cal.next_trading_day(ymd(2024, 12, 24)), ymd(2024, 12, 26));
    }

    #[test]
    fn test_previous_trading_day() {
        let cal = TradingCalendar::with_defaults("US_EQ");
        // Monday -> previous Friday
        assert_eq!(cal.previous_trading_day(ymd(2024, 3, 4)), ymd(2024, 3, 1));
    }

    #[test]
    fn test_trading_days_between() {
        let cal = TradingCalendar::with_defaults("US_EQ");
        let days = cal.trading_days_between(ymd(2024, 3, 1), ymd(2024, 3, 8));
        assert_eq!(
            days,
            vec![
                ymd(2024, 3, 1),
                ymd(2024, 3, 4),
                ymd(2024, 3, 5),
                ymd(2024, 3, 6),
                ymd(2024, 3, 7),
                ymd(2024, 3, 8),
            ]
        );
    }

    #[test]
    fn test_unknown_market_has_no_holidays() {
        let cal = TradingCalendar::with_defaults("XX_EQ");
        assert!(cal.is_trading_day(ymd(2024, 1, 1)));
    }
}
