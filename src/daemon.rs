//! Market-aware orchestration daemon
//!
//! The control loop: one worker per configured market polls on a fixed
//! interval, reads the market's session state, derives completed/running
//! sets from persisted executions, asks the DAG what is runnable, and
//! dispatches through the job registry with retry/backoff/timeout policy.
//!
//! The daemon holds no authoritative state. A fresh process reconstructs
//! everything from the store plus the immutable DAG definition, so
//! restarts are safe: dispatch is at-least-once with duplicate
//! suppression via the SUCCEEDED check, never exactly-once.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::dag::{build_market_dag, Dag, JobMetadata};
use crate::error::{ConductorError, Result};
use crate::executor::JobRegistry;
use crate::market_state::MarketStateMachine;
use crate::store::{retry_delay, should_retry, JobExecution, JobExecutionStore, JobStatus};

/// Rate-limited log sink for warnings a poll loop would otherwise repeat
/// every cycle. Explicitly constructed and injected, never process-global.
pub struct ThrottledLog {
    min_interval: Duration,
    last_emit: Mutex<HashMap<String, Instant>>,
}

impl ThrottledLog {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: Mutex::new(HashMap::new()),
        }
    }

    /// True when enough time has passed since the last emit for `key`;
    /// records the emit when allowed
    pub fn allow(&self, key: &str) -> bool {
        let mut last_emit = match self.last_emit.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        // Expired entries would be allowed anyway; drop them so per-day
        // job_id keys do not accumulate across date rollovers
        last_emit.retain(|_, last| now.duration_since(*last) < self.min_interval);
        match last_emit.get(key) {
            Some(last) if now.duration_since(*last) < self.min_interval => false,
            _ => {
                last_emit.insert(key.to_string(), now);
                true
            }
        }
    }
}

/// Scheduling view derived from a DAG's execution rows
#[derive(Debug, Default)]
pub struct JobSets {
    /// job_ids whose latest execution SUCCEEDED
    pub completed: HashSet<String>,
    /// job_ids whose latest execution is RUNNING and within its timeout
    pub running: HashSet<String>,
    /// Latest executions that are RUNNING but past their timeout
    pub timed_out: Vec<JobExecution>,
}

/// Derive completed/running/timed-out sets from execution rows
/// (newest-first, as returned by the store). `timeout_for` maps a job_id
/// to its configured execution timeout.
pub fn derive_job_sets(
    executions: &[JobExecution],
    timeout_for: impl Fn(&str) -> Option<u64>,
    now: DateTime<Utc>,
) -> JobSets {
    let mut sets = JobSets::default();
    let mut seen: HashSet<&str> = HashSet::new();

    for execution in executions {
        // Rows are newest-first; only the latest row per job_id counts
        if !seen.insert(&execution.job_id) {
            continue;
        }
        match execution.status {
            JobStatus::Succeeded => {
                sets.completed.insert(execution.job_id.clone());
            }
            JobStatus::Running => {
                let timed_out = match (timeout_for(&execution.job_id), execution.started_at) {
                    (Some(timeout_secs), Some(started_at)) => {
                        now.signed_duration_since(started_at).num_seconds() > timeout_secs as i64
                    }
                    _ => false,
                };
                if timed_out {
                    sets.timed_out.push(execution.clone());
                } else {
                    sets.running.insert(execution.job_id.clone());
                }
            }
            JobStatus::Pending | JobStatus::Failed | JobStatus::Retrying => {}
        }
    }

    sets
}

/// Market-aware DAG orchestration daemon
pub struct MarketAwareDaemon {
    config: DaemonConfig,
    states: Arc<MarketStateMachine>,
    executions: JobExecutionStore,
    registry: JobRegistry,
    throttle: ThrottledLog,
    /// Explicit DAG cache keyed by (market, date); entries for a market
    /// are replaced when its trading date rolls over
    dags: Mutex<HashMap<(String, NaiveDate), Dag>>,
}

impl MarketAwareDaemon {
    /// Create a daemon. Fails fast on unknown markets so configuration
    /// errors never surface at poll time.
    pub fn new(
        config: DaemonConfig,
        states: Arc<MarketStateMachine>,
        executions: JobExecutionStore,
        registry: JobRegistry,
    ) -> Result<Self> {
        for market_id in &config.markets {
            states.config(market_id)?;
        }
        Ok(Self {
            config,
            states,
            executions,
            registry,
            throttle: ThrottledLog::new(Duration::from_secs(300)),
            dags: Mutex::new(HashMap::new()),
        })
    }

    /// Build and cache one DAG per configured market for `as_of_date`.
    /// Malformed DAGs fail here, at startup.
    pub fn initialize_dags(&self, as_of_date: NaiveDate) -> Result<()> {
        for market_id in &self.config.markets {
            self.dag_for(market_id, as_of_date)?;
        }
        Ok(())
    }

    /// Cached DAG for (market, date), building on first access and
    /// dropping the market's entries for other dates (date rollover)
    fn dag_for(&self, market_id: &str, as_of_date: NaiveDate) -> Result<Dag> {
        let key = (market_id.to_string(), as_of_date);
        let mut dags = match self.dags.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(dag) = dags.get(&key) {
            return Ok(dag.clone());
        }

        let dag = build_market_dag(market_id, as_of_date)?;
        dags.retain(|(market, _), _| market != market_id);
        dags.insert(key, dag.clone());
        info!(market_id, %as_of_date, dag_id = %dag.dag_id, "initialized DAG");
        Ok(dag)
    }

    fn effective_date(&self, now: DateTime<Utc>) -> NaiveDate {
        self.config.as_of_date.unwrap_or_else(|| now.date_naive())
    }

    /// Flip RUNNING rows left behind by a crashed process to
    /// FAILED/RETRYING once they are past their job's timeout. Called on
    /// startup before any polling begins.
    pub async fn recover_orphans(&self, dag: &Dag, now: DateTime<Utc>) -> Result<()> {
        let executions = self.executions.for_dag(&dag.dag_id).await?;
        let sets = derive_job_sets(
            &executions,
            |job_id| dag.job(job_id).map(|j| j.retry.timeout_secs),
            now,
        );

        for orphan in &sets.timed_out {
            let Some(job) = dag.job(&orphan.job_id) else {
                continue;
            };
            warn!(
                job_id = %orphan.job_id,
                execution_id = %orphan.execution_id,
                "recovering orphaned execution"
            );
            self.fail_or_retry(
                job,
                orphan,
                &format!("orphaned: RUNNING past {}s timeout", job.retry.timeout_secs),
                now,
            )
            .await?;
        }
        Ok(())
    }

    /// Record a failure outcome: RETRYING with a backoff deadline while
    /// attempts remain, terminal FAILED otherwise
    async fn fail_or_retry(
        &self,
        job: &JobMetadata,
        execution: &JobExecution,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if should_retry(JobStatus::Failed, execution.attempt, job.retry.max_attempts) {
            let delay = retry_delay(
                execution.attempt,
                job.retry.base_backoff_secs,
                job.retry.max_backoff_secs,
            );
            let next_retry_at = now + chrono::Duration::milliseconds((delay * 1000.0) as i64);
            info!(
                job_id = %job.job_id,
                attempt = execution.attempt,
                max_attempts = job.retry.max_attempts,
                delay_secs = format!("{delay:.1}"),
                "job failed, retry scheduled"
            );
            self.executions
                .update_status(
                    execution.execution_id,
                    JobStatus::Retrying,
                    Some(reason),
                    Some(next_retry_at),
                )
                .await
        } else {
            error!(
                job_id = %job.job_id,
                attempt = execution.attempt,
                reason,
                "job permanently failed; manual re-dispatch required"
            );
            self.executions
                .update_status(execution.execution_id, JobStatus::Failed, Some(reason), None)
                .await
        }
    }

    /// Dispatch one job: bump attempt, mark RUNNING, invoke the body under
    /// its timeout, record the outcome
    async fn execute_job(&self, dag: &Dag, job: &JobMetadata) -> Result<()> {
        let mut execution = self
            .executions
            .create(
                &dag.dag_id,
                &job.job_id,
                &job.job_type,
                &job.market_id,
                dag.as_of_date,
            )
            .await?;

        execution.attempt = self
            .executions
            .increment_attempt(execution.execution_id)
            .await?;
        self.executions
            .update_status(execution.execution_id, JobStatus::Running, None, None)
            .await?;

        info!(
            job_id = %job.job_id,
            execution_id = %execution.execution_id,
            attempt = execution.attempt,
            "dispatching job"
        );

        let body = match self.registry.get(&job.job_type) {
            Ok(body) => body,
            Err(e) => {
                // Configuration error: no retries will fix a missing body
                let reason = e.to_string();
                error!(job_id = %job.job_id, reason, "job permanently failed");
                return self
                    .executions
                    .update_status(
                        execution.execution_id,
                        JobStatus::Failed,
                        Some(&reason),
                        None,
                    )
                    .await;
            }
        };

        let timeout = Duration::from_secs(job.retry.timeout_secs);
        let outcome = tokio::time::timeout(timeout, body.run(&job.market_id, dag.as_of_date)).await;

        match outcome {
            Ok(Ok(())) => {
                info!(job_id = %job.job_id, attempt = execution.attempt, "job succeeded");
                self.executions
                    .update_status(execution.execution_id, JobStatus::Succeeded, None, None)
                    .await
            }
            Ok(Err(e)) => {
                self.fail_or_retry(job, &execution, &e.to_string(), Utc::now())
                    .await
            }
            Err(_) => {
                let reason = ConductorError::JobTimeout {
                    job_id: job.job_id.clone(),
                    timeout_secs: job.retry.timeout_secs,
                }
                .to_string();
                self.fail_or_retry(job, &execution, &reason, Utc::now())
                    .await
            }
        }
    }

    /// One poll iteration for one market
    async fn run_market_cycle(&self, market_id: &str, now: DateTime<Utc>) -> Result<()> {
        let as_of_date = self.effective_date(now);
        let dag = self.dag_for(market_id, as_of_date)?;
        let current_state = self.states.state_for(market_id, now)?;

        let executions = self.executions.for_dag(&dag.dag_id).await?;
        let sets = derive_job_sets(
            &executions,
            |job_id| dag.job(job_id).map(|j| j.retry.timeout_secs),
            now,
        );

        // RUNNING rows past their timeout flip to FAILED/RETRYING; the
        // body itself cannot be interrupted, a future retry supersedes it
        for timed_out in &sets.timed_out {
            if let Some(job) = dag.job(&timed_out.job_id) {
                warn!(job_id = %timed_out.job_id, "job exceeded timeout");
                self.fail_or_retry(
                    job,
                    timed_out,
                    &format!("timed out after {}s", job.retry.timeout_secs),
                    now,
                )
                .await?;
            }
        }

        let runnable = dag.runnable_jobs(&sets.completed, &sets.running, current_state);
        if runnable.is_empty() {
            return Ok(());
        }

        debug!(
            market_id,
            state = %current_state,
            runnable = runnable.len(),
            completed = sets.completed.len(),
            running = sets.running.len(),
            "poll cycle"
        );

        for job in runnable {
            // Honor a pending backoff deadline
            if let Some(latest) = self.executions.latest(&dag.dag_id, &job.job_id).await? {
                if latest.status == JobStatus::Retrying {
                    if let Some(next_retry_at) = latest.next_retry_at {
                        if now < next_retry_at {
                            if self.throttle.allow(&job.job_id) {
                                debug!(
                                    job_id = %job.job_id,
                                    %next_retry_at,
                                    "job in retry backoff"
                                );
                            }
                            continue;
                        }
                    }
                }
                if latest.status == JobStatus::Failed {
                    // Exhausted retries stay failed until manual re-dispatch
                    if self.throttle.allow(&job.job_id) {
                        warn!(job_id = %job.job_id, "job permanently failed, skipping");
                    }
                    continue;
                }
            }

            self.execute_job(&dag, job).await?;
        }

        Ok(())
    }

    /// Poll loop for one market. Markets never block each other: this
    /// worker reads and writes only its own dag_id's executions.
    async fn run_market_worker(
        self: Arc<Self>,
        market_id: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut cycles: u64 = 0;
        info!(market_id, "market worker started");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            cycles += 1;
            let now = Utc::now();
            if let Err(e) = self.run_market_cycle(&market_id, now).await {
                // Keep polling: a transient store error on one cycle must
                // not kill the worker
                error!(market_id, cycle = cycles, error = %e, "poll cycle failed");
            }

            if let Some(max_cycles) = self.config.max_cycles {
                if cycles >= max_cycles {
                    info!(market_id, cycles, "max cycles reached");
                    break;
                }
            }
        }

        info!(market_id, cycles, "market worker stopped");
        Ok(())
    }

    /// Run the daemon until `shutdown` flips to true (or every worker
    /// reaches `max_cycles`). In-flight dispatches finish; RUNNING rows
    /// left behind by a hard kill reconcile as orphans on next startup.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let now = Utc::now();
        let as_of_date = self.effective_date(now);

        self.initialize_dags(as_of_date)?;
        for market_id in self.config.markets.clone() {
            let dag = self.dag_for(&market_id, as_of_date)?;
            self.recover_orphans(&dag, now).await?;
        }

        info!(
            markets = ?self.config.markets,
            %as_of_date,
            poll_interval_secs = self.config.poll_interval_secs,
            "daemon starting"
        );

        let mut workers = JoinSet::new();
        for market_id in self.config.markets.clone() {
            let daemon = Arc::clone(&self);
            let shutdown = shutdown.clone();
            workers.spawn(daemon.run_market_worker(market_id, shutdown));
        }

        let mut first_error: Option<ConductorError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "market worker failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "market worker panicked");
                    first_error
                        .get_or_insert(ConductorError::Internal(format!("worker join: {e}")));
                }
            }
        }

        info!("daemon shutdown complete");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::job_id_for;
    use uuid::Uuid;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    fn execution(job_id: &str, status: JobStatus, started_secs_ago: i64) -> JobExecution {
        let now = Utc::now();
        JobExecution {
            execution_id: Uuid::new_v4(),
            dag_id: "us_eq_2024-03-04".to_string(),
            job_id: job_id.to_string(),
            job_type: "x".to_string(),
            market_id: "US_EQ".to_string(),
            as_of_date: date(),
            status,
            attempt: 1,
            started_at: Some(now - chrono::Duration::seconds(started_secs_ago)),
            completed_at: None,
            last_error: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_derive_sets_partitions_by_status() {
        let now = Utc::now();
        let executions = vec![
            execution("a", JobStatus::Succeeded, 100),
            execution("b", JobStatus::Running, 100),
            execution("c", JobStatus::Retrying, 100),
            execution("d", JobStatus::Failed, 100),
        ];
        let sets = derive_job_sets(&executions, |_| Some(3600), now);
        assert_eq!(sets.completed, HashSet::from(["a".to_string()]));
        assert_eq!(sets.running, HashSet::from(["b".to_string()]));
        assert!(sets.timed_out.is_empty());
    }

    #[test]
    fn test_derive_sets_flags_timed_out_running_rows() {
        let now = Utc::now();
        let executions = vec![
            execution("fresh", JobStatus::Running, 10),
            execution("stale", JobStatus::Running, 7200),
        ];
        let sets = derive_job_sets(&executions, |_| Some(3600), now);
        assert_eq!(sets.running, HashSet::from(["fresh".to_string()]));
        assert_eq!(sets.timed_out.len(), 1);
        assert_eq!(sets.timed_out[0].job_id, "stale");
    }

    #[test]
    fn test_derive_sets_uses_latest_row_per_job() {
        let now = Utc::now();
        // Newest-first: the SUCCEEDED row shadows the older FAILED one
        let executions = vec![
            execution("a", JobStatus::Succeeded, 10),
            execution("a", JobStatus::Failed, 7200),
        ];
        let sets = derive_job_sets(&executions, |_| Some(3600), now);
        assert_eq!(sets.completed, HashSet::from(["a".to_string()]));
        assert!(sets.timed_out.is_empty());
    }

    #[test]
    fn test_throttled_log_suppresses_repeats() {
        let throttle = ThrottledLog::new(Duration::from_secs(60));
        assert!(throttle.allow("key"));
        assert!(!throttle.allow("key"));
        assert!(throttle.allow("other"));
    }

    #[test]
    fn test_throttled_log_prunes_expired_keys() {
        let throttle = ThrottledLog::new(Duration::from_millis(10));
        assert!(throttle.allow("old"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(throttle.allow("new"));

        let map = throttle.last_emit.lock().unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("new"));
    }

    #[tokio::test]
    async fn test_daemon_rejects_unknown_market() {
        // Construction must fail fast, not at poll time
        let config = DaemonConfig {
            markets: vec!["XX_EQ".to_string()],
            poll_interval_secs: 60,
            as_of_date: None,
            max_cycles: None,
        };
        let states = Arc::new(MarketStateMachine::with_defaults());
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/conductor_test")
            .expect("lazy pool");
        let result = MarketAwareDaemon::new(
            config,
            states,
            JobExecutionStore::new(pool),
            JobRegistry::new(),
        );
        assert!(matches!(result, Err(ConductorError::UnknownMarket(_))));
    }

    #[tokio::test]
    async fn test_dag_cache_rolls_over_by_date() {
        let config = DaemonConfig {
            markets: vec!["US_EQ".to_string()],
            poll_interval_secs: 60,
            as_of_date: None,
            max_cycles: None,
        };
        let states = Arc::new(MarketStateMachine::with_defaults());
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/conductor_test")
            .expect("lazy pool");
        let daemon = MarketAwareDaemon::new(
            config,
            states,
            JobExecutionStore::new(pool),
            JobRegistry::new(),
        )
        .unwrap();

        let day1 = date();
        let day2 = day1 + chrono::Duration::days(1);
        let dag1 = daemon.dag_for("US_EQ", day1).unwrap();
        let dag2 = daemon.dag_for("US_EQ", day2).unwrap();
        assert_ne!(dag1.dag_id, dag2.dag_id);

        // Rollover evicted the day1 entry
        let dags = daemon.dags.lock().unwrap();
        assert_eq!(dags.len(), 1);
        assert!(dags.contains_key(&("US_EQ".to_string(), day2)));
    }

    #[test]
    fn test_job_id_helper_consistency() {
        assert_eq!(
            job_id_for("US_EQ", "ingest_prices", date()),
            "us_eq_ingest_prices_2024-03-04"
        );
    }
}
