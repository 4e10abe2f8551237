use std::collections::HashMap;

use mc_core::config::MemoryOptions;
use mc_core::types::{Outcome, Task};
use serde::{Deserialize, Serialize};

/// Confidence never exceeds this, no matter the sample count.
const MAX_CONFIDENCE: f64 = 0.95;

/// Samples needed for full confidence.
const CONFIDENCE_RAMP: f64 = 20.0;

/// Prior returned below the sample floor.
const PRIOR_SUCCESS: f64 = 0.7;

// ---------------------------------------------------------------------------
// Prediction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub success_probability: f64,
    pub estimated_hours: f64,
    pub confidence: f64,
}

impl Prediction {
    fn prior(task: &Task) -> Self {
        Self {
            success_probability: PRIOR_SUCCESS,
            estimated_hours: task.estimated_hours,
            confidence: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// OutcomeLearner
// ---------------------------------------------------------------------------

/// Per-agent rolling outcome statistics. Outcomes are append-only; the
/// engine persists them to the `outcomes` collection and feeds this
/// in-memory view, which is rebuilt from persistence at startup.
///
/// Predictions are advisory scheduler inputs; they never gate assignment.
#[derive(Debug, Default)]
pub struct OutcomeLearner {
    options: MemoryOptions,
    /// agent_id -> outcomes in arrival order (oldest first).
    by_agent: HashMap<String, Vec<Outcome>>,
}

impl OutcomeLearner {
    pub fn new(options: MemoryOptions) -> Self {
        Self {
            options,
            by_agent: HashMap::new(),
        }
    }

    /// Rebuild the learner from previously persisted outcomes.
    pub fn from_outcomes(options: MemoryOptions, outcomes: Vec<Outcome>) -> Self {
        let mut learner = Self::new(options);
        for outcome in outcomes {
            learner.record(outcome);
        }
        learner
    }

    pub fn record(&mut self, outcome: Outcome) {
        self.by_agent
            .entry(outcome.agent_id.clone())
            .or_default()
            .push(outcome);
    }

    pub fn sample_count(&self, agent_id: &str) -> usize {
        self.by_agent.get(agent_id).map(|v| v.len()).unwrap_or(0)
    }

    /// Unweighted success fraction over every outcome of the agent.
    pub fn success_rate(&self, agent_id: &str) -> Option<f64> {
        let outcomes = self.by_agent.get(agent_id)?;
        if outcomes.is_empty() {
            return None;
        }
        let successes = outcomes.iter().filter(|o| o.success).count();
        Some(successes as f64 / outcomes.len() as f64)
    }

    /// Mean actual hours over every outcome of the agent.
    pub fn avg_hours(&self, agent_id: &str) -> Option<f64> {
        let outcomes = self.by_agent.get(agent_id)?;
        if outcomes.is_empty() {
            return None;
        }
        Some(outcomes.iter().map(|o| o.actual_hours).sum::<f64>() / outcomes.len() as f64)
    }

    /// Estimate how agent `agent_id` will fare on `task`.
    ///
    /// Samples are the agent's outcomes filtered by label overlap with the
    /// task (all of them when the task is unlabeled). Below `min_samples`
    /// the prior `(0.7, task.estimated_hours, 0.0)` is returned. More
    /// recent outcomes carry more weight via the configured decay rate.
    pub fn predict(&self, agent_id: &str, task: &Task) -> Prediction {
        let Some(outcomes) = self.by_agent.get(agent_id) else {
            return Prediction::prior(task);
        };

        let relevant: Vec<&Outcome> = if task.labels.is_empty() {
            outcomes.iter().collect()
        } else {
            outcomes
                .iter()
                .filter(|o| !o.labels.is_disjoint(&task.labels))
                .collect()
        };

        let n = relevant.len();
        if n < self.options.min_samples {
            return Prediction::prior(task);
        }

        // Exponentially decayed weights, newest sample heaviest.
        let retain = 1.0 - self.options.decay_rate.clamp(0.0, 1.0);
        let mut weight_sum = 0.0;
        let mut success_sum = 0.0;
        let mut hours_sum = 0.0;
        for (i, outcome) in relevant.iter().rev().enumerate() {
            let weight = retain.powi(i as i32);
            weight_sum += weight;
            if outcome.success {
                success_sum += weight;
            }
            hours_sum += weight * outcome.actual_hours;
        }

        let success_probability = success_sum / weight_sum;
        let estimated_hours = if task.estimated_hours > 0.0 {
            // Blend the task's own estimate with the observed hours.
            (task.estimated_hours + hours_sum / weight_sum) / 2.0
        } else {
            hours_sum / weight_sum
        };
        let confidence = (n as f64 / CONFIDENCE_RAMP).min(MAX_CONFIDENCE);

        Prediction {
            success_probability,
            estimated_hours,
            confidence,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn outcome(agent: &str, success: bool, hours: f64, labels: &[&str]) -> Outcome {
        Outcome {
            agent_id: agent.into(),
            task_id: uuid::Uuid::new_v4().to_string(),
            success,
            actual_hours: hours,
            blocker_kinds: vec![],
            labels: labels.iter().map(|l| l.to_string()).collect::<BTreeSet<_>>(),
            completed_at: Utc::now(),
        }
    }

    fn labeled_task(labels: &[&str], estimated: f64) -> Task {
        let mut t = Task::new("scored task", "p1");
        t.estimated_hours = estimated;
        t.labels = labels.iter().map(|l| l.to_string()).collect();
        t
    }

    #[test]
    fn unknown_agent_gets_the_prior() {
        let learner = OutcomeLearner::new(MemoryOptions::default());
        let task = labeled_task(&["api"], 3.0);
        let p = learner.predict("ghost", &task);
        assert_eq!(p.success_probability, 0.7);
        assert_eq!(p.estimated_hours, 3.0);
        assert_eq!(p.confidence, 0.0);
    }

    #[test]
    fn below_min_samples_gets_the_prior() {
        let mut learner = OutcomeLearner::new(MemoryOptions::default());
        for _ in 0..4 {
            learner.record(outcome("a1", true, 1.0, &["api"]));
        }
        let p = learner.predict("a1", &labeled_task(&["api"], 2.0));
        assert_eq!(p.confidence, 0.0);
        assert_eq!(p.success_probability, 0.7);
    }

    #[test]
    fn all_successes_score_high() {
        let mut learner = OutcomeLearner::new(MemoryOptions::default());
        for _ in 0..10 {
            learner.record(outcome("a1", true, 2.0, &["api"]));
        }
        let p = learner.predict("a1", &labeled_task(&["api"], 2.0));
        assert!((p.success_probability - 1.0).abs() < 1e-9);
        assert!((p.confidence - 0.5).abs() < 1e-9); // 10 / 20
    }

    #[test]
    fn label_overlap_filters_samples() {
        let mut learner = OutcomeLearner::new(MemoryOptions::default());
        // Plenty of db failures, but the api record is clean.
        for _ in 0..10 {
            learner.record(outcome("a1", false, 4.0, &["db"]));
        }
        for _ in 0..10 {
            learner.record(outcome("a1", true, 1.0, &["api"]));
        }
        let p = learner.predict("a1", &labeled_task(&["api"], 1.0));
        assert!(p.success_probability > 0.9);
    }

    #[test]
    fn unlabeled_task_uses_all_samples() {
        let mut learner = OutcomeLearner::new(MemoryOptions::default());
        for i in 0..10 {
            learner.record(outcome("a1", i % 2 == 0, 2.0, &["api"]));
        }
        let p = learner.predict("a1", &labeled_task(&[], 2.0));
        assert!(p.confidence > 0.0);
        assert!(p.success_probability > 0.3 && p.success_probability < 0.8);
    }

    #[test]
    fn confidence_caps_at_095() {
        let mut learner = OutcomeLearner::new(MemoryOptions::default());
        for _ in 0..100 {
            learner.record(outcome("a1", true, 1.0, &["api"]));
        }
        let p = learner.predict("a1", &labeled_task(&["api"], 1.0));
        assert_eq!(p.confidence, 0.95);
    }

    #[test]
    fn recency_outweighs_history() {
        let mut opts = MemoryOptions::default();
        opts.decay_rate = 0.5;
        let mut learner = OutcomeLearner::new(opts);
        // Old failures followed by recent successes.
        for _ in 0..5 {
            learner.record(outcome("a1", false, 4.0, &["api"]));
        }
        for _ in 0..5 {
            learner.record(outcome("a1", true, 1.0, &["api"]));
        }
        let p = learner.predict("a1", &labeled_task(&["api"], 2.0));
        assert!(p.success_probability > 0.8);
    }

    #[test]
    fn rebuild_from_persisted_outcomes() {
        let outcomes: Vec<Outcome> = (0..6).map(|_| outcome("a1", true, 1.0, &["api"])).collect();
        let learner = OutcomeLearner::from_outcomes(MemoryOptions::default(), outcomes);
        assert_eq!(learner.sample_count("a1"), 6);
        let p = learner.predict("a1", &labeled_task(&["api"], 1.0));
        assert!(p.confidence > 0.0);
    }
}
