//! Job execution store
//!
//! Persisted record of job attempts in the `job_executions` table, keyed by
//! (dag_id, job_id). The daemon derives its completed/running sets entirely
//! from these rows, so a fresh process can reconstruct scheduling state
//! after a restart.

use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ConductorError, Result};

/// Lifecycle status of a job execution row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
}

impl JobStatus {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Succeeded => write!(f, "SUCCEEDED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Retrying => write!(f, "RETRYING"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            "RETRYING" => Ok(JobStatus::Retrying),
            other => Err(ConductorError::Internal(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

/// A job execution row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub execution_id: Uuid,
    pub dag_id: String,
    pub job_id: String,
    pub job_type: String,
    pub market_id: String,
    pub as_of_date: NaiveDate,
    pub status: JobStatus,
    pub attempt: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const EXECUTION_COLUMNS: &str = "execution_id, dag_id, job_id, job_type, market_id, as_of_date, \
     status, attempt, started_at, completed_at, last_error, next_retry_at, \
     created_at, updated_at";

fn row_to_execution(row: &PgRow) -> Result<JobExecution> {
    let status: String = row.get("status");
    Ok(JobExecution {
        execution_id: row.get("execution_id"),
        dag_id: row.get("dag_id"),
        job_id: row.get("job_id"),
        job_type: row.get("job_type"),
        market_id: row.get("market_id"),
        as_of_date: row.get("as_of_date"),
        status: status.parse()?,
        attempt: row.get("attempt"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        last_error: row.get("last_error"),
        next_retry_at: row.get("next_retry_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// CRUD and retry-eligibility queries over `job_executions`
#[derive(Clone)]
pub struct JobExecutionStore {
    pool: PgPool,
}

impl JobExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `job_executions` table and indexes if absent
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_executions (
                execution_id UUID PRIMARY KEY,
                dag_id TEXT NOT NULL,
                job_id TEXT NOT NULL,
                job_type TEXT NOT NULL,
                market_id TEXT NOT NULL,
                as_of_date DATE NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING'
                    CHECK (status IN ('PENDING', 'RUNNING', 'SUCCEEDED', 'FAILED', 'RETRYING')),
                attempt INT NOT NULL DEFAULT 0,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                last_error TEXT,
                next_retry_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // At most one live (non-terminal) row per (dag_id, job_id); retries
        // reuse it, terminal rows accumulate as history
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS uq_job_executions_active
            ON job_executions(dag_id, job_id)
            WHERE status NOT IN ('SUCCEEDED', 'FAILED')
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_job_executions_dag_time \
             ON job_executions(dag_id, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Create a PENDING execution for (dag_id, job_id), or return the
    /// existing non-terminal row. Idempotent so daemon restarts and
    /// concurrent replicas never double-create.
    pub async fn create(
        &self,
        dag_id: &str,
        job_id: &str,
        job_type: &str,
        market_id: &str,
        as_of_date: NaiveDate,
    ) -> Result<JobExecution> {
        if let Some(existing) = self.latest(dag_id, job_id).await? {
            if !existing.status.is_terminal() {
                return Ok(existing);
            }
        }

        let execution_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO job_executions (
                execution_id, dag_id, job_id, job_type, market_id, as_of_date,
                status, attempt
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'PENDING', 0)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(execution_id)
        .bind(dag_id)
        .bind(job_id)
        .bind(job_type)
        .bind(market_id)
        .bind(as_of_date)
        .execute(&self.pool)
        .await?;

        // Re-select: either our insert or a concurrent replica's row
        let row = self.latest(dag_id, job_id).await?.ok_or_else(|| {
            ConductorError::ExecutionNotFound(format!("{dag_id}/{job_id} after insert"))
        })?;

        debug!(
            execution_id = %row.execution_id,
            dag_id, job_id, "created job execution"
        );
        Ok(row)
    }

    /// Most recent execution for a job in a DAG
    pub async fn latest(&self, dag_id: &str, job_id: &str) -> Result<Option<JobExecution>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM job_executions
            WHERE dag_id = $1 AND job_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(dag_id)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_execution).transpose()
    }

    /// All executions for a DAG, newest first
    pub async fn for_dag(&self, dag_id: &str) -> Result<Vec<JobExecution>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM job_executions
            WHERE dag_id = $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(dag_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_execution).collect()
    }

    /// Atomically bump the attempt counter before a (re)dispatch and
    /// return the new value. Safe under concurrent daemon replicas: the
    /// increment happens entirely inside one UPDATE.
    pub async fn increment_attempt(&self, execution_id: Uuid) -> Result<i32> {
        let row = sqlx::query(
            r#"
            UPDATE job_executions
            SET attempt = attempt + 1, updated_at = NOW()
            WHERE execution_id = $1
            RETURNING attempt
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ConductorError::ExecutionNotFound(execution_id.to_string()))?;

        Ok(row.get("attempt"))
    }

    /// Transition an execution's status, stamping the timestamps the new
    /// status implies: `started_at` on RUNNING, `completed_at` on
    /// SUCCEEDED/FAILED, `next_retry_at` on RETRYING.
    pub async fn update_status(
        &self,
        execution_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = match status {
            JobStatus::Running => {
                sqlx::query(
                    r#"
                    UPDATE job_executions
                    SET status = $2, started_at = NOW(), next_retry_at = NULL,
                        updated_at = NOW()
                    WHERE execution_id = $1
                    "#,
                )
                .bind(execution_id)
                .bind(status.to_string())
                .execute(&self.pool)
                .await?
            }
            JobStatus::Succeeded | JobStatus::Failed => {
                sqlx::query(
                    r#"
                    UPDATE job_executions
                    SET status = $2, completed_at = NOW(), last_error = $3,
                        next_retry_at = NULL, updated_at = NOW()
                    WHERE execution_id = $1
                    "#,
                )
                .bind(execution_id)
                .bind(status.to_string())
                .bind(error)
                .execute(&self.pool)
                .await?
            }
            JobStatus::Retrying => {
                sqlx::query(
                    r#"
                    UPDATE job_executions
                    SET status = $2, last_error = $3, next_retry_at = $4,
                        updated_at = NOW()
                    WHERE execution_id = $1
                    "#,
                )
                .bind(execution_id)
                .bind(status.to_string())
                .bind(error)
                .bind(next_retry_at)
                .execute(&self.pool)
                .await?
            }
            JobStatus::Pending => {
                sqlx::query(
                    r#"
                    UPDATE job_executions
                    SET status = $2, last_error = $3, updated_at = NOW()
                    WHERE execution_id = $1
                    "#,
                )
                .bind(execution_id)
                .bind(status.to_string())
                .bind(error)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(ConductorError::ExecutionNotFound(execution_id.to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Retry policy helpers (pure)
// ============================================================================

/// True iff a FAILED execution still has attempts left
pub fn should_retry(status: JobStatus, attempt: i32, max_attempts: u32) -> bool {
    status == JobStatus::Failed && (attempt as i64) < max_attempts as i64
}

/// Capped exponential backoff without jitter: min(base * 2^(attempt-1), max)
pub fn capped_backoff(attempt: i32, base_secs: u64, max_secs: u64) -> f64 {
    let attempt = attempt.max(1) as u32;
    let exp = attempt.saturating_sub(1).min(32);
    let delay = (base_secs as f64) * f64::from(2u32.saturating_pow(exp));
    delay.min(max_secs as f64)
}

/// Backoff with a uniform jitter factor in [0.5, 1.5] so many jobs failing
/// together do not retry in lockstep
pub fn retry_delay(attempt: i32, base_secs: u64, max_secs: u64) -> f64 {
    let jitter = rand::thread_rng().gen_range(0.5..=1.5);
    capped_backoff(attempt, base_secs, max_secs) * jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_requires_failed_status() {
        assert!(should_retry(JobStatus::Failed, 1, 3));
        assert!(!should_retry(JobStatus::Succeeded, 1, 3));
        assert!(!should_retry(JobStatus::Running, 1, 3));
        assert!(!should_retry(JobStatus::Retrying, 1, 3));
        assert!(!should_retry(JobStatus::Pending, 1, 3));
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        assert!(should_retry(JobStatus::Failed, 2, 3));
        assert!(!should_retry(JobStatus::Failed, 3, 3));
        assert!(!should_retry(JobStatus::Failed, 4, 3));
    }

    #[test]
    fn test_capped_backoff_is_exponential_then_flat() {
        assert_eq!(capped_backoff(1, 300, 3600), 300.0);
        assert_eq!(capped_backoff(2, 300, 3600), 600.0);
        assert_eq!(capped_backoff(3, 300, 3600), 1200.0);
        assert_eq!(capped_backoff(4, 300, 3600), 2400.0);
        assert_eq!(capped_backoff(5, 300, 3600), 3600.0);
        assert_eq!(capped_backoff(50, 300, 3600), 3600.0);
    }

    #[test]
    fn test_capped_backoff_is_non_decreasing() {
        let mut prev = 0.0;
        for attempt in 1..=40 {
            let delay = capped_backoff(attempt, 300, 3600);
            assert!(delay >= prev);
            assert!(delay >= 0.0);
            prev = delay;
        }
    }

    #[test]
    fn test_retry_delay_jitter_bounds() {
        for attempt in 1..=6 {
            let raw = capped_backoff(attempt, 300, 3600);
            for _ in 0..100 {
                let jittered = retry_delay(attempt, 300, 3600);
                assert!(jittered >= raw * 0.5);
                assert!(jittered <= raw * 1.5);
            }
        }
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Retrying,
        ] {
            let parsed: JobStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("BOGUS".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
    }
}
