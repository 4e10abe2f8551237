use std::collections::HashSet;

use chrono::{DateTime, Utc};
use mc_core::config::SchedulerConfig;
use mc_core::types::{Subtask, Task, TaskStatus, WorkerStatus, DESTRUCTIVE_LABEL};
use mc_intelligence::Prediction;
use tracing::debug;

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

/// A piece of work the scheduler can hand to an agent. Subtasks are
/// first-class and preferred over top-level tasks whenever any is
/// available.
#[derive(Debug, Clone)]
pub enum Candidate {
    Task(Task),
    Subtask { subtask: Subtask, parent: Task },
}

impl Candidate {
    pub fn work_id(&self) -> &str {
        match self {
            Candidate::Task(t) => &t.id,
            Candidate::Subtask { subtask, .. } => &subtask.id,
        }
    }

    /// The task whose labels/priority drive scoring: the task itself, or
    /// the parent for a subtask.
    fn scoring_task(&self) -> &Task {
        match self {
            Candidate::Task(t) => t,
            Candidate::Subtask { parent, .. } => parent,
        }
    }

    fn estimated_hours(&self) -> f64 {
        match self {
            Candidate::Task(t) => t.estimated_hours,
            Candidate::Subtask { subtask, .. } => subtask.estimated_hours,
        }
    }

    fn created_at(&self) -> DateTime<Utc> {
        match self {
            Candidate::Task(t) => t.created_at,
            Candidate::Subtask { subtask, .. } => subtask.created_at,
        }
    }

    fn subtask_order(&self) -> u32 {
        match self {
            Candidate::Task(_) => u32::MAX,
            Candidate::Subtask { subtask, .. } => subtask.order,
        }
    }
}

/// Hook for policies layered above the engine; returning `true` marks the
/// task as restricted the same way the `destructive` label does.
pub type PolicyHook<'a> = &'a (dyn Fn(&Task) -> bool + Sync);

// ---------------------------------------------------------------------------
// select
// ---------------------------------------------------------------------------

/// Pick the best piece of work for `worker`, or `None` when nothing is
/// pullable.
///
/// `subtasks` carries every subtask of the project's undone decomposed
/// parents (any status) paired with its parent; `decomposed` names those
/// parents, which are reached only through their subtasks and never
/// assigned whole. `predict` is the outcome learner's estimate for the
/// scoring task. The decision is deterministic: score, then subtask order,
/// then parent priority, then id.
pub fn select(
    tasks: &[Task],
    subtasks: &[(Subtask, Task)],
    decomposed: &HashSet<String>,
    worker: &WorkerStatus,
    config: &SchedulerConfig,
    policy: Option<PolicyHook<'_>>,
    predict: impl Fn(&Task) -> Prediction,
    now: DateTime<Utc>,
) -> Option<Candidate> {
    let done_subtasks: HashSet<&str> = subtasks
        .iter()
        .filter(|(s, _)| s.status == TaskStatus::Done)
        .map(|(s, _)| s.id.as_str())
        .collect();

    // Subtasks first: any available subtask shadows the top-level set.
    let mut candidates: Vec<Candidate> = subtasks
        .iter()
        .filter(|(s, _)| s.status == TaskStatus::Todo)
        .filter(|(s, _)| {
            s.dependencies
                .iter()
                .all(|d| done_subtasks.contains(d.as_str()))
        })
        .map(|(s, parent)| Candidate::Subtask {
            subtask: s.clone(),
            parent: parent.clone(),
        })
        .collect();

    if candidates.is_empty() {
        let done_tasks: HashSet<&str> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .map(|t| t.id.as_str())
            .collect();
        candidates = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Todo && !decomposed.contains(&t.id))
            .filter(|t| t.dependencies.iter().all(|d| done_tasks.contains(d.as_str())))
            .map(|t| Candidate::Task(t.clone()))
            .collect();
    }

    // Safety filter: destructive work only for allow-listed roles.
    candidates.retain(|c| {
        let task = c.scoring_task();
        let restricted =
            task.has_label(DESTRUCTIVE_LABEL) || policy.map(|p| p(task)).unwrap_or(false);
        !restricted || config.destructive_allow_roles.iter().any(|r| *r == worker.role)
    });

    if candidates.is_empty() {
        return None;
    }

    let mut scored: Vec<(bool, f64, Candidate)> = candidates
        .into_iter()
        .map(|candidate| {
            let task = candidate.scoring_task();
            let fit = skill_fit(task, worker);
            // Disjoint skills demote the candidate; they never remove it.
            let demoted = !task.labels.is_empty() && fit == 0.0;
            let prediction = predict(task);
            let age_hours = (now - candidate.created_at()).num_minutes() as f64 / 60.0;
            let score = config.w_priority * task.priority.rank() as f64
                + config.w_age * age_hours.max(0.0)
                + config.w_fit * fit
                + config.w_success * prediction.success_probability
                - config.w_estimate * candidate.estimated_hours();
            (demoted, score, candidate)
        })
        .collect();

    scored.sort_by(|(a_dem, a_score, a), (b_dem, b_score, b)| {
        a_dem
            .cmp(b_dem)
            .then(b_score.partial_cmp(a_score).unwrap_or(std::cmp::Ordering::Equal))
            .then(a.subtask_order().cmp(&b.subtask_order()))
            .then(
                b.scoring_task()
                    .priority
                    .rank()
                    .cmp(&a.scoring_task().priority.rank()),
            )
            .then(a.work_id().cmp(b.work_id()))
    });

    let (_, score, winner) = scored.into_iter().next()?;
    debug!(work_id = %winner.work_id(), score, "candidate selected");
    Some(winner)
}

/// Fraction of the task's labels covered by the worker's skills; tasks
/// without labels fit everyone.
fn skill_fit(task: &Task, worker: &WorkerStatus) -> f64 {
    if task.labels.is_empty() {
        return 1.0;
    }
    let matched = task.labels.iter().filter(|l| worker.has_skill(l)).count();
    matched as f64 / task.labels.len() as f64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mc_core::types::Priority;
    use std::collections::BTreeSet;

    fn worker(skills: &[&str]) -> WorkerStatus {
        let mut w = WorkerStatus::new("a1", "coder");
        w.skills = skills.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>();
        w
    }

    fn task(id: &str, status: TaskStatus, deps: &[&str], labels: &[&str]) -> Task {
        let mut t = Task::new(id, "p1");
        t.id = id.to_string();
        t.status = status;
        t.estimated_hours = 2.0;
        for d in deps {
            t.add_dependency(*d);
        }
        t.labels = labels.iter().map(|l| l.to_string()).collect();
        t
    }

    fn subtask(id: &str, parent: &str, order: u32, status: TaskStatus, deps: &[&str]) -> Subtask {
        let mut s = Subtask::new(parent, id, order);
        s.id = id.to_string();
        s.status = status;
        s.estimated_hours = 1.0;
        s.dependencies = deps.iter().map(|d| d.to_string()).collect();
        s
    }

    fn prior(task: &Task) -> Prediction {
        Prediction {
            success_probability: 0.7,
            estimated_hours: task.estimated_hours,
            confidence: 0.0,
        }
    }

    fn cfg() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    fn nod() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn picks_available_task_over_blocked_ones() {
        let tasks = vec![
            task("blocked", TaskStatus::Todo, &["free"], &[]),
            task("free", TaskStatus::Todo, &[], &[]),
        ];
        let picked = select(&tasks, &[], &nod(), &worker(&[]), &cfg(), None, prior, Utc::now()).unwrap();
        assert_eq!(picked.work_id(), "free");
    }

    #[test]
    fn dependencies_satisfied_by_done_tasks() {
        let tasks = vec![
            task("dep", TaskStatus::Done, &[], &[]),
            task("next", TaskStatus::Todo, &["dep"], &[]),
        ];
        let picked = select(&tasks, &[], &nod(), &worker(&[]), &cfg(), None, prior, Utc::now()).unwrap();
        assert_eq!(picked.work_id(), "next");
    }

    #[test]
    fn nothing_pullable_returns_none() {
        let tasks = vec![task("blocked", TaskStatus::Todo, &["missing"], &[])];
        assert!(select(&tasks, &[], &nod(), &worker(&[]), &cfg(), None, prior, Utc::now()).is_none());
    }

    #[test]
    fn subtasks_shadow_top_level_tasks() {
        let parent = task("pt", TaskStatus::InProgress, &[], &[]);
        let tasks = vec![task("simple", TaskStatus::Todo, &[], &[]), parent.clone()];
        let subtasks = vec![
            (subtask("s1", "pt", 1, TaskStatus::Todo, &[]), parent.clone()),
            (subtask("s2", "pt", 2, TaskStatus::Todo, &["s1"]), parent.clone()),
        ];
        let picked = select(&tasks, &subtasks, &nod(), &worker(&[]), &cfg(), None, prior, Utc::now()).unwrap();
        assert_eq!(picked.work_id(), "s1");
    }

    #[test]
    fn subtask_deps_must_be_done_siblings() {
        let parent = task("pt", TaskStatus::InProgress, &[], &[]);
        let subtasks = vec![
            (subtask("s1", "pt", 1, TaskStatus::Done, &[]), parent.clone()),
            (subtask("s2", "pt", 2, TaskStatus::Todo, &["s1"]), parent.clone()),
            (subtask("s3", "pt", 3, TaskStatus::Todo, &["s2"]), parent.clone()),
        ];
        let picked = select(&[], &subtasks, &nod(), &worker(&[]), &cfg(), None, prior, Utc::now()).unwrap();
        assert_eq!(picked.work_id(), "s2");
    }

    #[test]
    fn destructive_tasks_need_an_allowed_role() {
        let tasks = vec![task("wipe", TaskStatus::Todo, &[], &["destructive"])];
        assert!(select(&tasks, &[], &nod(), &worker(&[]), &cfg(), None, prior, Utc::now()).is_none());

        let mut operator = worker(&[]);
        operator.role = "operator".into();
        let picked = select(&tasks, &[], &nod(), &operator, &cfg(), None, prior, Utc::now()).unwrap();
        assert_eq!(picked.work_id(), "wipe");
    }

    #[test]
    fn policy_hook_restricts_like_the_label() {
        let tasks = vec![task("risky", TaskStatus::Todo, &[], &[])];
        let flag_all: PolicyHook<'_> = &|_t: &Task| true;
        assert!(select(&tasks, &[], &nod(), &worker(&[]), &cfg(), Some(flag_all), prior, Utc::now()).is_none());
    }

    #[test]
    fn disjoint_skills_demote_but_do_not_remove() {
        let tasks = vec![
            task("api-task", TaskStatus::Todo, &[], &["api"]),
            task("db-task", TaskStatus::Todo, &[], &["db"]),
        ];
        let picked = select(&tasks, &[], &nod(), &worker(&["api"]), &cfg(), None, prior, Utc::now()).unwrap();
        assert_eq!(picked.work_id(), "api-task");

        // A worker with neither skill still gets work.
        let picked = select(&tasks, &[], &nod(), &worker(&["ux"]), &cfg(), None, prior, Utc::now()).unwrap();
        assert_eq!(picked.work_id(), "api-task");
    }

    #[test]
    fn priority_dominates_equal_fit() {
        let mut low = task("low", TaskStatus::Todo, &[], &[]);
        low.priority = Priority::Low;
        let mut urgent = task("urgent", TaskStatus::Todo, &[], &[]);
        urgent.priority = Priority::Urgent;
        let picked = select(
            &[low, urgent],
            &[],
            &nod(),
            &worker(&[]),
            &cfg(),
            None,
            prior,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(picked.work_id(), "urgent");
    }

    #[test]
    fn success_probability_breaks_priority_ties() {
        let tasks = vec![
            task("good-fit", TaskStatus::Todo, &[], &["api"]),
            task("bad-fit", TaskStatus::Todo, &[], &["api"]),
        ];
        let predict = |t: &Task| Prediction {
            success_probability: if t.id == "good-fit" { 0.95 } else { 0.2 },
            estimated_hours: t.estimated_hours,
            confidence: 0.5,
        };
        let picked = select(&tasks, &[], &nod(), &worker(&["api"]), &cfg(), None, predict, Utc::now()).unwrap();
        assert_eq!(picked.work_id(), "good-fit");
    }

    #[test]
    fn large_estimates_are_penalized() {
        let mut small = task("small", TaskStatus::Todo, &[], &[]);
        small.estimated_hours = 1.0;
        let mut huge = task("huge", TaskStatus::Todo, &[], &[]);
        huge.estimated_hours = 40.0;
        let picked = select(
            &[huge, small],
            &[],
            &nod(),
            &worker(&[]),
            &cfg(),
            None,
            prior,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(picked.work_id(), "small");
    }

    #[test]
    fn deterministic_id_tiebreak() {
        let tasks = vec![
            task("b-task", TaskStatus::Todo, &[], &[]),
            task("a-task", TaskStatus::Todo, &[], &[]),
        ];
        // Same priority, same age (within a minute), same fit: id wins.
        let picked = select(&tasks, &[], &nod(), &worker(&[]), &cfg(), None, prior, Utc::now()).unwrap();
        assert_eq!(picked.work_id(), "a-task");
    }
}
