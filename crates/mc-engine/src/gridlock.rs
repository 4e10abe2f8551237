use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use mc_core::config::GridlockConfig;
use mc_core::types::{Task, TaskStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

/// Refusals from the same agent within this window collapse to one.
const SAME_AGENT_DEDUP_MS: i64 = 1_000;

/// Blocked tasks named in a diagnosis, at most.
const TOP_BLOCKED: usize = 5;

// ---------------------------------------------------------------------------
// Diagnosis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedTask {
    pub task_id: String,
    pub name: String,
    pub unmet_dependencies: Vec<String>,
    /// How many other todo tasks wait on this one.
    pub dependents: usize,
}

/// Deterministic description of an all-blocked state, stable for test
/// snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridlockDiagnosis {
    pub symptoms: Vec<String>,
    pub root_causes: Vec<String>,
    pub top_blocked: Vec<BlockedTask>,
    pub refusals_in_window: usize,
    pub detected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// GridlockDetector
// ---------------------------------------------------------------------------

struct DetectorState {
    refusals: VecDeque<(DateTime<Utc>, String)>,
    last_alert: Option<DateTime<Utc>>,
}

/// Counts refused pulls over a sliding window and diagnoses the
/// all-blocked state. One alert per cooldown period.
pub struct GridlockDetector {
    config: GridlockConfig,
    state: Mutex<DetectorState>,
}

impl GridlockDetector {
    pub fn new(config: GridlockConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DetectorState {
                refusals: VecDeque::new(),
                last_alert: None,
            }),
        }
    }

    /// Record one refused pull. Refusals from the same agent within one
    /// second count once; otherwise every refusal counts.
    pub async fn record_refusal(&self, agent_id: &str, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        let window = Duration::seconds(self.config.window_secs as i64);
        while state
            .refusals
            .front()
            .is_some_and(|(ts, _)| now - *ts > window)
        {
            state.refusals.pop_front();
        }
        let dedup = state.refusals.iter().any(|(ts, agent)| {
            agent == agent_id && (now - *ts) < Duration::milliseconds(SAME_AGENT_DEDUP_MS)
        });
        if !dedup {
            state.refusals.push_back((now, agent_id.to_string()));
        }
    }

    pub async fn refusals_in_window(&self, now: DateTime<Utc>) -> usize {
        let state = self.state.lock().await;
        let window = Duration::seconds(self.config.window_secs as i64);
        state
            .refusals
            .iter()
            .filter(|(ts, _)| now - *ts <= window)
            .count()
    }

    pub async fn last_alert(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_alert
    }

    /// Evaluate the alert conditions against the project's tasks. Returns a
    /// diagnosis exactly once per cooldown window when all conditions hold:
    /// enough refusals, at least one todo task, every todo task blocked,
    /// and at most one task in progress.
    pub async fn check(&self, tasks: &[Task], now: DateTime<Utc>) -> Option<GridlockDiagnosis> {
        let mut state = self.state.lock().await;

        if let Some(last) = state.last_alert {
            if now - last < Duration::seconds(self.config.cooldown_secs as i64) {
                return None;
            }
        }

        let window = Duration::seconds(self.config.window_secs as i64);
        let refusals = state
            .refusals
            .iter()
            .filter(|(ts, _)| now - *ts <= window)
            .count();
        if refusals < self.config.refusal_threshold {
            return None;
        }

        let done: HashSet<&str> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .map(|t| t.id.as_str())
            .collect();
        let todo: Vec<&Task> = tasks.iter().filter(|t| t.status == TaskStatus::Todo).collect();
        if todo.is_empty() {
            return None;
        }

        let blocked: Vec<&&Task> = todo
            .iter()
            .filter(|t| t.dependencies.iter().any(|d| !done.contains(d.as_str())))
            .collect();
        if blocked.len() != todo.len() {
            // Some todo task is pullable; agents will get it eventually.
            return None;
        }

        let in_progress = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count();
        if in_progress > 1 {
            return None;
        }

        let diagnosis = diagnose(tasks, &todo, refusals, now);
        state.last_alert = Some(now);
        info!(
            refusals,
            todo = todo.len(),
            in_progress,
            "gridlock detected"
        );
        Some(diagnosis)
    }
}

/// Build the deterministic diagnosis: blocked tasks ranked by how many
/// other todo tasks they hold up, ties broken by id.
fn diagnose(
    tasks: &[Task],
    todo: &[&Task],
    refusals: usize,
    now: DateTime<Utc>,
) -> GridlockDiagnosis {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let done: HashSet<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Done)
        .map(|t| t.id.as_str())
        .collect();

    // dependent count: how many todo tasks name each task among their
    // unmet dependencies.
    let mut dependents: HashMap<&str, usize> = HashMap::new();
    for task in todo {
        for dep in &task.dependencies {
            if !done.contains(dep.as_str()) {
                *dependents.entry(dep.as_str()).or_insert(0) += 1;
            }
        }
    }

    let mut blocked: Vec<BlockedTask> = todo
        .iter()
        .map(|t| BlockedTask {
            task_id: t.id.clone(),
            name: t.name.clone(),
            unmet_dependencies: t
                .dependencies
                .iter()
                .filter(|d| !done.contains(d.as_str()))
                .cloned()
                .collect(),
            dependents: dependents.get(t.id.as_str()).copied().unwrap_or(0),
        })
        .collect();
    blocked.sort_by(|a, b| b.dependents.cmp(&a.dependents).then(a.task_id.cmp(&b.task_id)));
    blocked.truncate(TOP_BLOCKED);

    let root_causes = blocked
        .iter()
        .filter(|b| b.dependents > 0)
        .map(|b| {
            let unmet: Vec<String> = b
                .unmet_dependencies
                .iter()
                .map(|d| {
                    by_id
                        .get(d.as_str())
                        .map(|t| t.name.clone())
                        .unwrap_or_else(|| d.clone())
                })
                .collect();
            format!(
                "'{}' blocks {} task(s) and is itself waiting on: {}",
                b.name,
                b.dependents,
                unmet.join(", ")
            )
        })
        .collect();

    GridlockDiagnosis {
        symptoms: vec![
            format!("{} pull(s) refused in the detection window", refusals),
            format!("all {} todo task(s) have unmet dependencies", todo.len()),
        ],
        root_causes,
        top_blocked: blocked,
        refusals_in_window: refusals,
        detected_at: now,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
