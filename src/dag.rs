//! Job DAG definitions
//!
//! Declarative per-market-day job graphs. A DAG only describes structure:
//! which jobs exist, what they depend on, which market state gates them,
//! and how they retry. The daemon decides when anything actually runs.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{ConductorError, Result};
use crate::market_state::MarketState;

/// Priority tiers; higher dispatches first within a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// Retry/backoff/timeout policy for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_secs: 300,
            max_backoff_secs: 3600,
            timeout_secs: 3600,
        }
    }
}

/// Metadata for a single job in a DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Stable within one DAG instance: "{market}_{job_type}_{date}"
    pub job_id: String,
    /// Logical type, reused across dates and markets
    pub job_type: String,
    pub market_id: String,
    /// Market state required to dispatch (None = any state)
    pub required_state: Option<MarketState>,
    /// Job types that must have a SUCCEEDED execution in this DAG first
    pub dependencies: Vec<String>,
    pub priority: JobPriority,
    pub retry: RetryPolicy,
}

/// Directed acyclic graph of jobs for one market-day
#[derive(Debug, Clone)]
pub struct Dag {
    pub dag_id: String,
    pub market_id: String,
    pub as_of_date: NaiveDate,
    jobs: BTreeMap<String, JobMetadata>,
}

pub fn dag_id_for(market_id: &str, as_of_date: NaiveDate) -> String {
    format!("{}_{}", market_id.to_lowercase(), as_of_date)
}

pub fn job_id_for(market_id: &str, job_type: &str, as_of_date: NaiveDate) -> String {
    format!("{}_{}_{}", market_id.to_lowercase(), job_type, as_of_date)
}

impl Dag {
    fn new(
        dag_id: String,
        market_id: String,
        as_of_date: NaiveDate,
        jobs: Vec<JobMetadata>,
    ) -> Result<Self> {
        let jobs: BTreeMap<String, JobMetadata> =
            jobs.into_iter().map(|j| (j.job_id.clone(), j)).collect();
        let dag = Self {
            dag_id,
            market_id,
            as_of_date,
            jobs,
        };
        let errors = dag.validate();
        if !errors.is_empty() {
            return Err(ConductorError::InvalidDag {
                dag_id: dag.dag_id,
                errors,
            });
        }
        Ok(dag)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobMetadata> {
        self.jobs.values()
    }

    pub fn job(&self, job_id: &str) -> Option<&JobMetadata> {
        self.jobs.get(job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Translate a dependency job_type into the job_id it resolves to
    /// inside this DAG instance
    fn dep_job_id(&self, job: &JobMetadata, dep_type: &str) -> String {
        job_id_for(&job.market_id, dep_type, self.as_of_date)
    }

    /// Jobs eligible to dispatch right now.
    ///
    /// A job qualifies iff it is in neither `completed` nor `running`, every
    /// dependency has a completed job_id, and its `required_state` (if any)
    /// matches `current_state`. Output is ordered by priority descending,
    /// then job_id ascending, so dispatch order is deterministic.
    pub fn runnable_jobs(
        &self,
        completed: &HashSet<String>,
        running: &HashSet<String>,
        current_state: MarketState,
    ) -> Vec<&JobMetadata> {
        let mut runnable: Vec<&JobMetadata> = self
            .jobs
            .values()
            .filter(|job| !completed.contains(&job.job_id) && !running.contains(&job.job_id))
            .filter(|job| {
                job.dependencies
                    .iter()
                    .all(|dep| completed.contains(&self.dep_job_id(job, dep)))
            })
            .filter(|job| {
                job.required_state
                    .map_or(true, |required| required == current_state)
            })
            .collect();

        runnable.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        runnable
    }

    /// All transitive dependencies of a job, as sorted job_ids
    pub fn dependency_chain(&self, job_id: &str) -> Vec<String> {
        let Some(root) = self.jobs.get(job_id) else {
            return Vec::new();
        };

        let mut visited: HashSet<String> = HashSet::new();
        let mut to_visit: Vec<String> = root
            .dependencies
            .iter()
            .map(|dep| self.dep_job_id(root, dep))
            .collect();

        while let Some(current) = to_visit.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(job) = self.jobs.get(&current) {
                to_visit.extend(job.dependencies.iter().map(|dep| self.dep_job_id(job, dep)));
            }
        }

        let mut chain: Vec<String> = visited.into_iter().collect();
        chain.sort();
        chain
    }

    /// Structural validation: dangling dependency types and cycles.
    /// Runs once at construction; per-call scheduling never re-checks.
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for job in self.jobs.values() {
            for dep in &job.dependencies {
                if !self.jobs.contains_key(&self.dep_job_id(job, dep)) {
                    errors.push(format!(
                        "job {} depends on unknown job_type {}",
                        job.job_id, dep
                    ));
                }
            }
        }

        // DFS cycle detection over dependency edges
        for start in self.jobs.keys() {
            let mut stack = vec![(start.clone(), false)];
            let mut on_path: HashSet<String> = HashSet::new();
            let mut done: HashSet<String> = HashSet::new();
            let mut cyclic = false;

            while let Some((node, expanded)) = stack.pop() {
                if expanded {
                    on_path.remove(&node);
                    done.insert(node);
                    continue;
                }
                if done.contains(&node) {
                    continue;
                }
                if !on_path.insert(node.clone()) {
                    cyclic = true;
                    break;
                }
                stack.push((node.clone(), true));
                if let Some(job) = self.jobs.get(&node) {
                    for dep in &job.dependencies {
                        let dep_id = self.dep_job_id(job, dep);
                        if on_path.contains(&dep_id) {
                            cyclic = true;
                        }
                        stack.push((dep_id, false));
                    }
                }
            }

            if cyclic {
                errors.push(format!("circular dependency involving job {start}"));
                break;
            }
        }

        errors
    }
}

/// Build the standard daily DAG for one market.
///
/// Shape is static configuration: ingestion (POST_CLOSE gated) feeds derived
/// features, which feed profiles and the engine chain
/// signals -> universes -> books.
pub fn build_market_dag(market_id: &str, as_of_date: NaiveDate) -> Result<Dag> {
    let job = |job_type: &str,
               required_state: Option<MarketState>,
               dependencies: &[&str],
               priority: JobPriority,
               retry: RetryPolicy| JobMetadata {
        job_id: job_id_for(market_id, job_type, as_of_date),
        job_type: job_type.to_string(),
        market_id: market_id.to_string(),
        required_state,
        dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        priority,
        retry,
    };

    let default = RetryPolicy::default();
    let jobs = vec![
        job(
            "ingest_prices",
            Some(MarketState::PostClose),
            &[],
            JobPriority::Critical,
            // Extra retries for upstream vendor/API flakiness
            RetryPolicy {
                max_attempts: 5,
                ..default
            },
        ),
        job(
            "ingest_factors",
            Some(MarketState::PostClose),
            &[],
            JobPriority::Medium,
            default,
        ),
        job(
            "compute_returns",
            None,
            &["ingest_prices"],
            JobPriority::High,
            default,
        ),
        job(
            "compute_volatility",
            None,
            &["ingest_prices"],
            JobPriority::High,
            default,
        ),
        job(
            "build_numeric_windows",
            None,
            &["compute_returns", "compute_volatility"],
            JobPriority::High,
            RetryPolicy {
                timeout_secs: 7200,
                ..default
            },
        ),
        job(
            "update_profiles",
            Some(MarketState::PostClose),
            &["build_numeric_windows"],
            JobPriority::Medium,
            default,
        ),
        job(
            "run_signals",
            None,
            &["build_numeric_windows", "update_profiles"],
            JobPriority::Critical,
            default,
        ),
        job(
            "run_universes",
            None,
            &["run_signals"],
            JobPriority::Critical,
            default,
        ),
        job(
            "run_books",
            None,
            &["run_universes"],
            JobPriority::Critical,
            default,
        ),
    ];

    let dag = Dag::new(
        dag_id_for(market_id, as_of_date),
        market_id.to_string(),
        as_of_date,
        jobs,
    )?;

    tracing::info!(
        dag_id = %dag.dag_id,
        jobs = dag.len(),
        "built market DAG"
    );

    Ok(dag)
}

/// Union of all markets' DAGs with zero cross-market edges. Inspection and
/// reporting only; scheduling always works per-market.
pub fn build_global_dag(as_of_date: NaiveDate, markets: &[String]) -> Result<Dag> {
    let mut jobs = Vec::new();
    for market_id in markets {
        let dag = build_market_dag(market_id, as_of_date)?;
        jobs.extend(dag.jobs().cloned());
    }
    Dag::new(
        format!("global_{as_of_date}"),
        "GLOBAL".to_string(),
        as_of_date,
        jobs,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    fn toy_dag() -> Dag {
        // A (no deps), B (dep A), C (dep B, POST_CLOSE required)
        let job = |job_type: &str, deps: &[&str], required: Option<MarketState>| JobMetadata {
            job_id: job_id_for("US_EQ", job_type, date()),
            job_type: job_type.to_string(),
            market_id: "US_EQ".to_string(),
            required_state: required,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            priority: JobPriority::Medium,
            retry: RetryPolicy::default(),
        };
        Dag::new(
            dag_id_for("US_EQ", date()),
            "US_EQ".to_string(),
            date(),
            vec![
                job("a", &[], None),
                job("b", &["a"], None),
                job("c", &["b"], Some(MarketState::PostClose)),
            ],
        )
        .unwrap()
    }

    fn ids(jobs: &[&JobMetadata]) -> Vec<String> {
        jobs.iter().map(|j| j.job_type.clone()).collect()
    }

    #[test]
    fn test_runnable_respects_dependencies_and_state() {
        let dag = toy_dag();
        let none = HashSet::new();

        let runnable = dag.runnable_jobs(&none, &none, MarketState::PostClose);
        assert_eq!(ids(&runnable), vec!["a"]);

        let completed: HashSet<String> = [job_id_for("US_EQ", "a", date())].into();
        let runnable = dag.runnable_jobs(&completed, &none, MarketState::PostClose);
        assert_eq!(ids(&runnable), vec!["b"]);

        let completed: HashSet<String> = [
            job_id_for("US_EQ", "a", date()),
            job_id_for("US_EQ", "b", date()),
        ]
        .into();
        let runnable = dag.runnable_jobs(&completed, &none, MarketState::PostClose);
        assert_eq!(ids(&runnable), vec!["c"]);

        // c is gated on POST_CLOSE
        let runnable = dag.runnable_jobs(&completed, &none, MarketState::Session);
        assert!(runnable.is_empty());
    }

    #[test]
    fn test_runnable_excludes_running_jobs() {
        let dag = toy_dag();
        let none = HashSet::new();
        let running: HashSet<String> = [job_id_for("US_EQ", "a", date())].into();
        let runnable = dag.runnable_jobs(&none, &running, MarketState::Session);
        assert!(runnable.is_empty());
    }

    #[test]
    fn test_runnable_never_returns_completed() {
        let dag = build_market_dag("US_EQ", date()).unwrap();
        let completed: HashSet<String> = dag.jobs().map(|j| j.job_id.clone()).collect();
        let none = HashSet::new();
        assert!(dag
            .runnable_jobs(&completed, &none, MarketState::PostClose)
            .is_empty());
    }

    #[test]
    fn test_runnable_ordering_is_priority_then_job_id() {
        let dag = build_market_dag("US_EQ", date()).unwrap();
        let none = HashSet::new();
        let runnable = dag.runnable_jobs(&none, &none, MarketState::PostClose);
        // ingest_prices is Critical, ingest_factors Medium
        assert_eq!(ids(&runnable), vec!["ingest_prices", "ingest_factors"]);
    }

    #[test]
    fn test_market_dag_shape() {
        let dag = build_market_dag("US_EQ", date()).unwrap();
        assert_eq!(dag.dag_id, "us_eq_2024-03-04");
        assert_eq!(dag.len(), 9);

        let books = dag.job(&job_id_for("US_EQ", "run_books", date())).unwrap();
        let chain = dag.dependency_chain(&books.job_id);
        // Everything except run_books itself is upstream of it
        assert_eq!(chain.len(), 8);
        assert!(!chain.contains(&books.job_id));
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let bad = JobMetadata {
            job_id: job_id_for("US_EQ", "x", date()),
            job_type: "x".to_string(),
            market_id: "US_EQ".to_string(),
            required_state: None,
            dependencies: vec!["does_not_exist".to_string()],
            priority: JobPriority::Medium,
            retry: RetryPolicy::default(),
        };
        let result = Dag::new(
            dag_id_for("US_EQ", date()),
            "US_EQ".to_string(),
            date(),
            vec![bad],
        );
        assert!(matches!(result, Err(ConductorError::InvalidDag { .. })));
    }

    #[test]
    fn test_cycle_rejected() {
        let job = |job_type: &str, deps: &[&str]| JobMetadata {
            job_id: job_id_for("US_EQ", job_type, date()),
            job_type: job_type.to_string(),
            market_id: "US_EQ".to_string(),
            required_state: None,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            priority: JobPriority::Medium,
            retry: RetryPolicy::default(),
        };
        let result = Dag::new(
            dag_id_for("US_EQ", date()),
            "US_EQ".to_string(),
            date(),
            vec![job("a", &["b"]), job("b", &["a"])],
        );
        assert!(matches!(result, Err(ConductorError::InvalidDag { .. })));
    }

    #[test]
    fn test_global_dag_has_no_cross_market_edges() {
        let markets = vec!["US_EQ".to_string(), "EU_EQ".to_string()];
        let dag = build_global_dag(date(), &markets).unwrap();
        assert_eq!(dag.len(), 18);
        for job in dag.jobs() {
            for dep in &job.dependencies {
                let dep_id = job_id_for(&job.market_id, dep, date());
                let dep_job = dag.job(&dep_id).unwrap();
                assert_eq!(dep_job.market_id, job.market_id);
            }
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(JobPriority::Critical > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Medium);
        assert!(JobPriority::Medium > JobPriority::Low);
    }
}
