//! Job bodies and the job-type registry
//!
//! The daemon treats job bodies as opaque: it only observes success,
//! error, or timeout. The business layer registers one body per job_type
//! at daemon construction.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::debug;

use crate::engine_run::{EngineRunStore, RunPhase};
use crate::error::{ConductorError, Result};

/// One unit of schedulable work. Implementations MUST be idempotent:
/// the daemon guarantees at-least-once dispatch, not exactly-once.
#[async_trait]
pub trait JobBody: Send + Sync {
    async fn run(&self, market_id: &str, as_of_date: NaiveDate) -> Result<()>;
}

/// Blanket impl so plain async closures can be registered in tests and
/// lightweight wiring
#[async_trait]
impl<F, Fut> JobBody for F
where
    F: Fn(String, NaiveDate) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    async fn run(&self, market_id: &str, as_of_date: NaiveDate) -> Result<()> {
        self(market_id.to_string(), as_of_date).await
    }
}

/// job_type -> body mapping, fixed at daemon construction
#[derive(Clone, Default)]
pub struct JobRegistry {
    bodies: HashMap<String, Arc<dyn JobBody>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: &str, body: Arc<dyn JobBody>) {
        self.bodies.insert(job_type.to_string(), body);
    }

    pub fn get(&self, job_type: &str) -> Result<Arc<dyn JobBody>> {
        self.bodies
            .get(job_type)
            .cloned()
            .ok_or_else(|| ConductorError::UnregisteredJobType(job_type.to_string()))
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.bodies.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.bodies.keys().cloned().collect();
        types.sort();
        types
    }
}

/// A job body that advances the market's engine run to a target phase.
///
/// Used for the engine-chain jobs (run_signals/run_universes/run_books and
/// the data-readiness marker): the body's only observable effect on the
/// core is the phase move. Re-invocation is a no-op once the run has moved
/// at or past the target phase, preserving idempotency.
pub struct PhaseAdvanceBody {
    runs: EngineRunStore,
    region_for: Arc<dyn Fn(&str) -> Result<String> + Send + Sync>,
    target: RunPhase,
}

impl PhaseAdvanceBody {
    pub fn new(
        runs: EngineRunStore,
        region_for: Arc<dyn Fn(&str) -> Result<String> + Send + Sync>,
        target: RunPhase,
    ) -> Self {
        Self {
            runs,
            region_for,
            target,
        }
    }
}

#[async_trait]
impl JobBody for PhaseAdvanceBody {
    async fn run(&self, market_id: &str, as_of_date: NaiveDate) -> Result<()> {
        let region = (self.region_for)(market_id)?;
        let run = self.runs.get_or_create(as_of_date, &region).await?;

        if !advance_needed(run.phase, self.target)? {
            debug!(
                run_id = %run.run_id,
                phase = %run.phase,
                target = %self.target,
                "run already at or past target phase"
            );
            return Ok(());
        }

        self.runs.update_phase(run.run_id, self.target, None).await?;
        Ok(())
    }
}

/// Whether a phase-advance dispatch must write.
///
/// A run that already moved at or past `target` is a no-op (re-dispatch
/// of an idempotent job). A FAILED run is an error: the dispatch must be
/// recorded as a failure, not silently succeed against a dead run.
fn advance_needed(current: RunPhase, target: RunPhase) -> Result<bool> {
    if current == RunPhase::Failed {
        return Err(ConductorError::InvalidPhaseTransition {
            from: current.to_string(),
            to: target.to_string(),
        });
    }
    Ok(phase_rank(current) < phase_rank(target))
}

fn phase_rank(phase: RunPhase) -> u8 {
    match phase {
        RunPhase::WaitingForData => 0,
        RunPhase::DataReady => 1,
        RunPhase::SignalsDone => 2,
        RunPhase::UniversesDone => 3,
        RunPhase::BooksDone => 4,
        RunPhase::Completed => 5,
        RunPhase::Failed => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut registry = JobRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        registry.register(
            "noop",
            Arc::new(move |_market: String, _date: NaiveDate| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        assert!(registry.contains("noop"));
        assert_eq!(registry.job_types(), vec!["noop"]);

        let body = registry.get("noop").unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        body.run("US_EQ", date).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregistered_job_type_errors() {
        let registry = JobRegistry::new();
        assert!(matches!(
            registry.get("missing"),
            Err(ConductorError::UnregisteredJobType(_))
        ));
    }

    #[test]
    fn test_failed_run_rejects_phase_advance() {
        // A dead run must surface as a dispatch failure for every target
        for target in [
            RunPhase::DataReady,
            RunPhase::SignalsDone,
            RunPhase::UniversesDone,
            RunPhase::BooksDone,
            RunPhase::Completed,
        ] {
            assert!(matches!(
                advance_needed(RunPhase::Failed, target),
                Err(ConductorError::InvalidPhaseTransition { .. })
            ));
        }
    }

    #[test]
    fn test_advance_noop_at_or_past_target() {
        assert!(!advance_needed(RunPhase::SignalsDone, RunPhase::SignalsDone).unwrap());
        assert!(!advance_needed(RunPhase::BooksDone, RunPhase::DataReady).unwrap());
        assert!(!advance_needed(RunPhase::Completed, RunPhase::BooksDone).unwrap());
    }

    #[test]
    fn test_advance_needed_behind_target() {
        assert!(advance_needed(RunPhase::WaitingForData, RunPhase::DataReady).unwrap());
        assert!(advance_needed(RunPhase::DataReady, RunPhase::SignalsDone).unwrap());
        assert!(advance_needed(RunPhase::BooksDone, RunPhase::Completed).unwrap());
    }
}
