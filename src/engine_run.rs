//! Engine run state machine
//!
//! Tracks a downstream pipeline run per (as_of_date, region) in the
//! `engine_runs` table. Phases advance linearly:
//!
//! ```text
//! WAITING_FOR_DATA -> DATA_READY -> SIGNALS_DONE
//! -> UNIVERSES_DONE -> BOOKS_DONE -> COMPLETED
//! ```
//!
//! Every non-terminal phase may also move to FAILED. COMPLETED and FAILED
//! are terminal, with no outgoing transitions (including to themselves).
//! Job bodies advance phases as a side effect; external pollers read runs
//! through `list_active`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::error::{ConductorError, Result};

/// Discrete phases for an engine run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunPhase {
    WaitingForData,
    DataReady,
    SignalsDone,
    UniversesDone,
    BooksDone,
    Completed,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed)
    }

    /// The single forward successor on the happy path, if any
    pub fn next(&self) -> Option<RunPhase> {
        match self {
            RunPhase::WaitingForData => Some(RunPhase::DataReady),
            RunPhase::DataReady => Some(RunPhase::SignalsDone),
            RunPhase::SignalsDone => Some(RunPhase::UniversesDone),
            RunPhase::UniversesDone => Some(RunPhase::BooksDone),
            RunPhase::BooksDone => Some(RunPhase::Completed),
            RunPhase::Completed | RunPhase::Failed => None,
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::WaitingForData => write!(f, "WAITING_FOR_DATA"),
            RunPhase::DataReady => write!(f, "DATA_READY"),
            RunPhase::SignalsDone => write!(f, "SIGNALS_DONE"),
            RunPhase::UniversesDone => write!(f, "UNIVERSES_DONE"),
            RunPhase::BooksDone => write!(f, "BOOKS_DONE"),
            RunPhase::Completed => write!(f, "COMPLETED"),
            RunPhase::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for RunPhase {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "WAITING_FOR_DATA" => Ok(RunPhase::WaitingForData),
            "DATA_READY" => Ok(RunPhase::DataReady),
            "SIGNALS_DONE" => Ok(RunPhase::SignalsDone),
            "UNIVERSES_DONE" => Ok(RunPhase::UniversesDone),
            "BOOKS_DONE" => Ok(RunPhase::BooksDone),
            "COMPLETED" => Ok(RunPhase::Completed),
            "FAILED" => Ok(RunPhase::Failed),
            other => Err(ConductorError::Internal(format!(
                "unknown run phase: {other}"
            ))),
        }
    }
}

/// Validate a requested phase transition.
///
/// A self-transition is a permitted no-op only for non-terminal phases.
pub fn validate_transition(current: RunPhase, new: RunPhase) -> Result<()> {
    if current == new && !current.is_terminal() {
        return Ok(());
    }

    let allowed = match current.next() {
        Some(successor) => new == successor || new == RunPhase::Failed,
        None => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(ConductorError::InvalidPhaseTransition {
            from: current.to_string(),
            to: new.to_string(),
        })
    }
}

/// Snapshot of an engine run row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineRun {
    pub run_id: Uuid,
    pub as_of_date: NaiveDate,
    pub region: String,
    pub phase: RunPhase,
    pub error: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phase_started_at: Option<DateTime<Utc>>,
    pub phase_completed_at: Option<DateTime<Utc>>,
}

const RUN_COLUMNS: &str = "run_id, as_of_date, region, phase, error, created_at, updated_at, \
     phase_started_at, phase_completed_at";

fn row_to_run(row: &PgRow) -> Result<EngineRun> {
    let phase: String = row.get("phase");
    Ok(EngineRun {
        run_id: row.get("run_id"),
        as_of_date: row.get("as_of_date"),
        region: row.get("region"),
        phase: phase.parse()?,
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        phase_started_at: row.get("phase_started_at"),
        phase_completed_at: row.get("phase_completed_at"),
    })
}

/// Persistence for engine runs
#[derive(Clone)]
pub struct EngineRunStore {
    pool: PgPool,
}

impl EngineRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `engine_runs` table if absent
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS engine_runs (
                run_id UUID PRIMARY KEY,
                as_of_date DATE NOT NULL,
                region TEXT NOT NULL,
                phase TEXT NOT NULL DEFAULT 'WAITING_FOR_DATA'
                    CHECK (phase IN (
                        'WAITING_FOR_DATA', 'DATA_READY', 'SIGNALS_DONE',
                        'UNIVERSES_DONE', 'BOOKS_DONE', 'COMPLETED', 'FAILED'
                    )),
                error JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                phase_started_at TIMESTAMPTZ,
                phase_completed_at TIMESTAMPTZ,
                UNIQUE (as_of_date, region)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_engine_runs_phase ON engine_runs(phase)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load a run by id
    pub async fn load(&self, run_id: Uuid) -> Result<EngineRun> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM engine_runs WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ConductorError::RunNotFound(run_id.to_string()))?;

        row_to_run(&row)
    }

    /// Return the run for (as_of_date, region), creating it in
    /// WAITING_FOR_DATA if absent. Idempotent under concurrent callers via
    /// the unique (as_of_date, region) constraint.
    pub async fn get_or_create(&self, as_of_date: NaiveDate, region: &str) -> Result<EngineRun> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO engine_runs (run_id, as_of_date, region, phase, phase_started_at)
            VALUES ($1, $2, $3, 'WAITING_FOR_DATA', NOW())
            ON CONFLICT (as_of_date, region) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(as_of_date)
        .bind(region)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            info!(%as_of_date, region, "created engine run");
        }

        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM engine_runs WHERE as_of_date = $1 AND region = $2"
        ))
        .bind(as_of_date)
        .bind(region)
        .fetch_one(&self.pool)
        .await?;

        row_to_run(&row)
    }

    /// Advance a run's phase under a row lock.
    ///
    /// Invalid transitions error and leave the row untouched. Valid
    /// transitions persist the phase, reset `phase_started_at`, and stamp
    /// `phase_completed_at` when the new phase is terminal.
    pub async fn update_phase(
        &self,
        run_id: Uuid,
        new_phase: RunPhase,
        error: Option<serde_json::Value>,
    ) -> Result<EngineRun> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM engine_runs WHERE run_id = $1 FOR UPDATE"
        ))
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ConductorError::RunNotFound(run_id.to_string()))?;

        let current = row_to_run(&row)?;
        validate_transition(current.phase, new_phase)?;

        let phase_completed = new_phase.is_terminal();
        let updated = sqlx::query(&format!(
            r#"
            UPDATE engine_runs
            SET phase = $2,
                error = $3,
                updated_at = NOW(),
                phase_started_at = NOW(),
                phase_completed_at = CASE WHEN $4 THEN NOW() ELSE NULL END
            WHERE run_id = $1
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(new_phase.to_string())
        .bind(error)
        .bind(phase_completed)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let run = row_to_run(&updated)?;
        info!(
            %run_id,
            region = %run.region,
            from = %current.phase,
            to = %new_phase,
            "engine run phase updated"
        );
        Ok(run)
    }

    /// All runs not yet COMPLETED/FAILED, ordered by (as_of_date, region)
    pub async fn list_active(&self) -> Result<Vec<EngineRun>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM engine_runs
            WHERE phase NOT IN ('COMPLETED', 'FAILED')
            ORDER BY as_of_date, region
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_run).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [RunPhase; 7] = [
        RunPhase::WaitingForData,
        RunPhase::DataReady,
        RunPhase::SignalsDone,
        RunPhase::UniversesDone,
        RunPhase::BooksDone,
        RunPhase::Completed,
        RunPhase::Failed,
    ];

    #[test]
    fn test_linear_chain_is_allowed() {
        let mut phase = RunPhase::WaitingForData;
        while let Some(next) = phase.next() {
            assert!(validate_transition(phase, next).is_ok());
            phase = next;
        }
        assert_eq!(phase, RunPhase::Completed);
    }

    #[test]
    fn test_every_non_terminal_may_fail() {
        for phase in ALL {
            let result = validate_transition(phase, RunPhase::Failed);
            if phase.is_terminal() {
                assert!(result.is_err(), "{phase} -> FAILED should be rejected");
            } else {
                assert!(result.is_ok(), "{phase} -> FAILED should be allowed");
            }
        }
    }

    #[test]
    fn test_terminal_phases_have_no_exits() {
        for terminal in [RunPhase::Completed, RunPhase::Failed] {
            for target in ALL {
                assert!(
                    validate_transition(terminal, target).is_err(),
                    "{terminal} -> {target} should be rejected"
                );
            }
        }
    }

    #[test]
    fn test_self_transition_is_noop_for_non_terminal() {
        for phase in ALL {
            let result = validate_transition(phase, phase);
            if phase.is_terminal() {
                assert!(result.is_err());
            } else {
                assert!(result.is_ok());
            }
        }
    }

    #[test]
    fn test_exact_transition_table() {
        // Exhaustive check: only successor, FAILED, or non-terminal self
        for from in ALL {
            for to in ALL {
                let expect_ok = (!from.is_terminal() && from == to)
                    || from.next() == Some(to)
                    || (!from.is_terminal() && to == RunPhase::Failed);
                assert_eq!(
                    validate_transition(from, to).is_ok(),
                    expect_ok,
                    "transition {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_no_skipping_or_backwards_moves() {
        assert!(validate_transition(RunPhase::WaitingForData, RunPhase::SignalsDone).is_err());
        assert!(validate_transition(RunPhase::DataReady, RunPhase::WaitingForData).is_err());
        assert!(validate_transition(RunPhase::BooksDone, RunPhase::DataReady).is_err());
    }

    #[test]
    fn test_phase_roundtrip() {
        for phase in ALL {
            let parsed: RunPhase = phase.to_string().parse().unwrap();
            assert_eq!(parsed, phase);
        }
        assert!("BOGUS".parse::<RunPhase>().is_err());
    }
}
