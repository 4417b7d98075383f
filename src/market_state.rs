//! Market session state machine
//!
//! Resolves a discrete trading-session state for any (market, instant) pair.
//! Each market cycles through OVERNIGHT -> PRE_OPEN -> SESSION -> POST_CLOSE
//! -> OVERNIGHT on trading days and reports HOLIDAY otherwise.
//!
//! Session times are configured already converted to UTC. Daylight-saving
//! shifts are handled by updating configuration, not by runtime timezone
//! arithmetic.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::TradingCalendar;
use crate::error::{ConductorError, Result};

/// Discrete trading-session states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketState {
    Holiday,
    Overnight,
    PreOpen,
    Session,
    PostClose,
}

impl std::fmt::Display for MarketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketState::Holiday => write!(f, "HOLIDAY"),
            MarketState::Overnight => write!(f, "OVERNIGHT"),
            MarketState::PreOpen => write!(f, "PRE_OPEN"),
            MarketState::Session => write!(f, "SESSION"),
            MarketState::PostClose => write!(f, "POST_CLOSE"),
        }
    }
}

impl std::str::FromStr for MarketState {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "HOLIDAY" => Ok(MarketState::Holiday),
            "OVERNIGHT" => Ok(MarketState::Overnight),
            "PRE_OPEN" => Ok(MarketState::PreOpen),
            "SESSION" => Ok(MarketState::Session),
            "POST_CLOSE" => Ok(MarketState::PostClose),
            other => Err(ConductorError::Internal(format!(
                "unknown market state: {other}"
            ))),
        }
    }
}

/// Session open/close times in UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketSessionTimes {
    pub session_open_utc: NaiveTime,
    pub session_close_utc: NaiveTime,
}

/// Per-market state detection config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketStateConfig {
    /// Market identifier (e.g. "US_EQ")
    pub market_id: String,
    /// Downstream engine-run region this market feeds (e.g. "US")
    pub region: String,
    pub session_times: MarketSessionTimes,
    pub preopen_buffer_minutes: u32,
    pub postclose_buffer_minutes: u32,
}

impl MarketStateConfig {
    pub fn new(
        market_id: &str,
        region: &str,
        open: NaiveTime,
        close: NaiveTime,
        preopen_buffer_minutes: u32,
        postclose_buffer_minutes: u32,
    ) -> Result<Self> {
        if open >= close {
            return Err(ConductorError::ConfigValidation(format!(
                "market {market_id}: session_open_utc ({open}) must be before session_close_utc ({close})"
            )));
        }
        Ok(Self {
            market_id: market_id.to_string(),
            region: region.to_string(),
            session_times: MarketSessionTimes {
                session_open_utc: open,
                session_close_utc: close,
            },
            preopen_buffer_minutes,
            postclose_buffer_minutes,
        })
    }

    /// PRE_OPEN boundary; may wrap to the previous evening for markets
    /// whose session opens at or shortly after midnight UTC
    fn preopen_start(&self) -> NaiveTime {
        sub_minutes(
            self.session_times.session_open_utc,
            self.preopen_buffer_minutes,
        )
    }

    fn postclose_end(&self) -> NaiveTime {
        add_minutes(
            self.session_times.session_close_utc,
            self.postclose_buffer_minutes,
        )
    }
}

fn add_minutes(t: NaiveTime, minutes: u32) -> NaiveTime {
    let (t, _wrapped) = t.overflowing_add_signed(Duration::minutes(minutes as i64));
    t
}

fn sub_minutes(t: NaiveTime, minutes: u32) -> NaiveTime {
    let (t, _wrapped) = t.overflowing_sub_signed(Duration::minutes(minutes as i64));
    t
}

/// Built-in market configs (UTC session times)
pub fn default_market_configs() -> Vec<MarketStateConfig> {
    let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).expect("valid session time");
    vec![
        // NYSE/NASDAQ regular hours, 9:30-16:00 ET as EST
        MarketStateConfig::new("US_EQ", "US", t(14, 30), t(21, 0), 60, 120)
            .expect("US_EQ default config"),
        // Euronext/LSE/XETRA approximate regular hours
        MarketStateConfig::new("EU_EQ", "EU", t(8, 0), t(16, 30), 60, 120)
            .expect("EU_EQ default config"),
        // TSE regular hours, 9:00-15:00 JST
        MarketStateConfig::new("ASIA_EQ", "ASIA", t(0, 0), t(6, 0), 60, 120)
            .expect("ASIA_EQ default config"),
    ]
}

/// Market state machine over a set of configured markets
#[derive(Debug, Clone)]
pub struct MarketStateMachine {
    configs: HashMap<String, MarketStateConfig>,
    calendars: HashMap<String, TradingCalendar>,
}

impl MarketStateMachine {
    pub fn new(configs: Vec<MarketStateConfig>) -> Self {
        let calendars = configs
            .iter()
            .map(|c| {
                (
                    c.market_id.clone(),
                    TradingCalendar::with_defaults(&c.market_id),
                )
            })
            .collect();
        let configs = configs
            .into_iter()
            .map(|c| (c.market_id.clone(), c))
            .collect();
        Self { configs, calendars }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_market_configs())
    }

    pub fn config(&self, market_id: &str) -> Result<&MarketStateConfig> {
        self.configs
            .get(market_id)
            .ok_or_else(|| ConductorError::UnknownMarket(market_id.to_string()))
    }

    pub fn market_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.configs.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn calendar(&self, market_id: &str) -> Result<&TradingCalendar> {
        self.calendars
            .get(market_id)
            .ok_or_else(|| ConductorError::UnknownMarket(market_id.to_string()))
    }

    /// Current state for a market at `at` (UTC)
    pub fn state_for(&self, market_id: &str, at: DateTime<Utc>) -> Result<MarketState> {
        let config = self.config(market_id)?;
        let calendar = self.calendar(market_id)?;

        if !calendar.is_trading_day(at.date_naive()) {
            return Ok(MarketState::Holiday);
        }

        let t = at.time();
        let open = config.session_times.session_open_utc;
        let close = config.session_times.session_close_utc;
        let preopen_start = config.preopen_start();
        let postclose_end = config.postclose_end();

        if preopen_start > open {
            // PRE_OPEN wraps midnight (session opens at/near 00:00 UTC):
            // the late-evening tail of the day belongs to the next session.
            if t >= preopen_start {
                Ok(MarketState::PreOpen)
            } else if t < open {
                Ok(MarketState::Overnight)
            } else if t < close {
                Ok(MarketState::Session)
            } else if t < postclose_end {
                Ok(MarketState::PostClose)
            } else {
                Ok(MarketState::Overnight)
            }
        } else if t < preopen_start {
            Ok(MarketState::Overnight)
        } else if t < open {
            Ok(MarketState::PreOpen)
        } else if t < close {
            Ok(MarketState::Session)
        } else if t < postclose_end {
            Ok(MarketState::PostClose)
        } else {
            Ok(MarketState::Overnight)
        }
    }

    /// Next state change strictly after `at`: returns the instant of the
    /// next boundary and the state in effect there. Rolls forward over
    /// holidays and weekends.
    pub fn next_transition(
        &self,
        market_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(MarketState, DateTime<Utc>)> {
        let config = self.config(market_id)?;
        let calendar = self.calendar(market_id)?;
        let current = self.state_for(market_id, at)?;

        let date = at.date_naive();
        let open = config.session_times.session_open_utc;
        let close = config.session_times.session_close_utc;
        let preopen_start = config.preopen_start();
        let postclose_end = config.postclose_end();

        let when = match current {
            MarketState::Holiday => {
                let next_day = calendar.next_trading_day(date);
                at_time(next_day, preopen_start)
            }
            MarketState::Overnight => {
                if at.time() < preopen_start || preopen_start > open {
                    // PRE_OPEN later today (wrap case: 23:00 on the same day)
                    at_time(date, preopen_start)
                } else {
                    let next_day = calendar.next_trading_day(date);
                    at_time(next_day, preopen_start)
                }
            }
            MarketState::PreOpen => at_time(date, open),
            MarketState::Session => at_time(date, close),
            MarketState::PostClose => at_time(date, postclose_end),
        };

        // Boundaries that land on the next calendar day (wrapped PRE_OPEN,
        // or an OVERNIGHT tail after the day's boundaries) resolve to a
        // timestamp <= `at`; push them forward a day.
        let mut when = when;
        while when <= at {
            when += Duration::days(1);
        }

        // The instant may land on a weekend or holiday (wrapped PRE_OPEN on
        // a Friday evening); report the state actually in effect there
        let next_state = self.state_for(market_id, when)?;

        Ok((next_state, when))
    }

    /// State of every configured market at `at`
    pub fn all_states(&self, at: DateTime<Utc>) -> BTreeMap<String, MarketState> {
        self.configs
            .keys()
            .filter_map(|market_id| {
                self.state_for(market_id, at)
                    .ok()
                    .map(|state| (market_id.clone(), state))
            })
            .collect()
    }
}

fn at_time(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    date.and_time(time).and_utc()
}
