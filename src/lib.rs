pub mod calendar;
pub mod config;
pub mod daemon;
pub mod dag;
pub mod engine_run;
pub mod error;
pub mod executor;
pub mod market_state;
pub mod store;

pub use calendar::TradingCalendar;
pub use config::AppConfig;
pub use daemon::{derive_job_sets, JobSets, MarketAwareDaemon, ThrottledLog};
pub use dag::{
    build_global_dag, build_market_dag, Dag, JobMetadata, JobPriority, RetryPolicy,
};
pub use engine_run::{validate_transition, EngineRun, EngineRunStore, RunPhase};
pub use error::{ConductorError, Result};
pub use executor::{JobBody, JobRegistry, PhaseAdvanceBody};
pub use market_state::{
    default_market_configs, MarketState, MarketStateConfig, MarketStateMachine,
};
pub use store::{
    capped_backoff, retry_delay, should_retry, JobExecution, JobExecutionStore, JobStatus,
};
