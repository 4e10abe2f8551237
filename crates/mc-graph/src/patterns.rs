use std::collections::HashSet;

use mc_core::types::Task;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// CandidateEdge
// ---------------------------------------------------------------------------

/// A directed dependency candidate: `from` depends on `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEdge {
    pub from: String,
    pub to: String,
    pub confidence: f64,
    pub reason: String,
}

/// A pair the pattern pass could not settle: shared vocabulary but either
/// no rule or a below-threshold one. The weak edge, when present, feeds the
/// combination step of the hybrid inferer.
#[derive(Debug, Clone, PartialEq)]
pub struct AmbiguousPair {
    pub task_a: String,
    pub task_b: String,
    pub weak_edge: Option<CandidateEdge>,
}

/// Result of the pattern pass: edges confident enough to accept outright,
/// and pairs that need the AI pass.
#[derive(Debug, Clone, Default)]
pub struct PatternOutcome {
    pub accepted: Vec<CandidateEdge>,
    /// Pairs with shared vocabulary but no confident rule, in input order.
    pub ambiguous: Vec<AmbiguousPair>,
}

// ---------------------------------------------------------------------------
// Action vocabulary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Action {
    Design,
    Implement,
    Test,
    Document,
    Deploy,
}

/// Keywords mapped to canonical actions. First match in the task name wins.
const ACTION_KEYWORDS: &[(&str, Action)] = &[
    ("design", Action::Design),
    ("plan", Action::Design),
    ("implement", Action::Implement),
    ("build", Action::Implement),
    ("create", Action::Implement),
    ("add", Action::Implement),
    ("develop", Action::Implement),
    ("test", Action::Test),
    ("verify", Action::Test),
    ("qa", Action::Test),
    ("document", Action::Document),
    ("docs", Action::Document),
    ("deploy", Action::Deploy),
    ("release", Action::Deploy),
    ("ship", Action::Deploy),
];

/// Rule catalog: `(dependent_action, prerequisite_action, confidence)`.
/// "test X depends on implement X", "deploy Y depends on test Y", etc.
const RULES: &[(Action, Action, f64)] = &[
    (Action::Implement, Action::Design, 0.85),
    (Action::Test, Action::Implement, 0.90),
    (Action::Deploy, Action::Test, 0.90),
    (Action::Document, Action::Implement, 0.80),
    (Action::Deploy, Action::Implement, 0.75),
    (Action::Test, Action::Design, 0.60),
];

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "for", "to", "of", "and", "in", "on", "with", "new",
];

fn classify(name: &str) -> (Option<Action>, HashSet<String>) {
    let lower = name.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let mut action = None;
    for word in &words {
        if let Some((_, a)) = ACTION_KEYWORDS.iter().find(|(kw, _)| kw == word) {
            action = Some(*a);
            break;
        }
    }

    let entity: HashSet<String> = words
        .iter()
        .filter(|w| {
            !STOP_WORDS.contains(w) && !ACTION_KEYWORDS.iter().any(|(kw, _)| kw == *w)
        })
        .map(|w| w.to_string())
        .collect();

    (action, entity)
}

fn entity_overlap(a: &HashSet<String>, b: &HashSet<String>) -> bool {
    !a.is_disjoint(b)
}

// ---------------------------------------------------------------------------
// pattern_pass
// ---------------------------------------------------------------------------

/// Pass A of the hybrid inferer. Scans every unordered task pair; pairs
/// matching a rule at or above `confidence_threshold` yield an accepted
/// edge, pairs with shared vocabulary but no confident rule go to the
/// ambiguous list for the AI pass.
pub fn pattern_pass(tasks: &[Task], confidence_threshold: f64) -> PatternOutcome {
    let classified: Vec<(&Task, Option<Action>, HashSet<String>)> = tasks
        .iter()
        .map(|t| {
            let (action, entity) = classify(&t.name);
            (t, action, entity)
        })
        .collect();

    let mut outcome = PatternOutcome::default();

    for i in 0..classified.len() {
        for j in (i + 1)..classified.len() {
            let (ta, act_a, ent_a) = &classified[i];
            let (tb, act_b, ent_b) = &classified[j];

            if !entity_overlap(ent_a, ent_b) {
                continue;
            }

            let edge = match (act_a, act_b) {
                (Some(a), Some(b)) => best_rule(*a, *b).map(|(dependent_is_a, conf)| {
                    let (from, to) = if dependent_is_a {
                        (ta.id.clone(), tb.id.clone())
                    } else {
                        (tb.id.clone(), ta.id.clone())
                    };
                    CandidateEdge {
                        from,
                        to,
                        confidence: conf,
                        reason: format!("{:?} follows {:?}", if dependent_is_a { a } else { b }, if dependent_is_a { b } else { a }),
                    }
                }),
                _ => None,
            };

            match edge {
                Some(edge) if edge.confidence >= confidence_threshold => {
                    outcome.accepted.push(edge);
                }
                // Shared keywords, but the catalog is either silent or not
                // confident enough: hand the pair to the AI pass.
                weak => outcome.ambiguous.push(AmbiguousPair {
                    task_a: ta.id.clone(),
                    task_b: tb.id.clone(),
                    weak_edge: weak,
                }),
            }
        }
    }

    outcome
}

/// Look up the rule for an action pair in either direction. Returns
/// `(dependent_is_first, confidence)`.
fn best_rule(a: Action, b: Action) -> Option<(bool, f64)> {
    let forward = RULES
        .iter()
        .find(|(dep, pre, _)| *dep == a && *pre == b)
        .map(|(_, _, c)| (true, *c));
    let backward = RULES
        .iter()
        .find(|(dep, pre, _)| *dep == b && *pre == a)
        .map(|(_, _, c)| (false, *c));
    match (forward, backward) {
        (Some(f), Some(r)) => Some(if f.1 >= r.1 { f } else { r }),
        (Some(f), None) => Some(f),
        (None, Some(r)) => Some(r),
        (None, None) => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, name: &str) -> Task {
        let mut t = Task::new(name, "p1");
        t.id = id.to_string();
        t
    }

    #[test]
    fn test_depends_on_implement() {
        let tasks = vec![task("t1", "Implement user login"), task("t2", "Test user login")];
        let out = pattern_pass(&tasks, 0.80);
        assert_eq!(out.accepted.len(), 1);
        let edge = &out.accepted[0];
        assert_eq!(edge.from, "t2");
        assert_eq!(edge.to, "t1");
        assert!(edge.confidence >= 0.80);
    }

    #[test]
    fn deploy_depends_on_test() {
        let tasks = vec![task("t1", "Test payment flow"), task("t2", "Deploy payment flow")];
        let out = pattern_pass(&tasks, 0.80);
        assert_eq!(out.accepted.len(), 1);
        assert_eq!(out.accepted[0].from, "t2");
        assert_eq!(out.accepted[0].to, "t1");
    }

    #[test]
    fn implement_depends_on_design() {
        let tasks = vec![task("t1", "Design schema"), task("t2", "Implement schema")];
        let out = pattern_pass(&tasks, 0.80);
        assert_eq!(out.accepted.len(), 1);
        assert_eq!(out.accepted[0].from, "t2");
        assert_eq!(out.accepted[0].to, "t1");
    }

    #[test]
    fn disjoint_entities_produce_nothing() {
        let tasks = vec![task("t1", "Implement login"), task("t2", "Test billing")];
        let out = pattern_pass(&tasks, 0.80);
        assert!(out.accepted.is_empty());
        assert!(out.ambiguous.is_empty());
    }

    #[test]
    fn below_threshold_rule_goes_to_ambiguous_with_weak_edge() {
        // deploy <- implement is 0.75, below the 0.80 threshold.
        let tasks = vec![task("t1", "Implement search"), task("t2", "Deploy search")];
        let out = pattern_pass(&tasks, 0.80);
        assert!(out.accepted.is_empty());
        assert_eq!(out.ambiguous.len(), 1);
        let pair = &out.ambiguous[0];
        assert_eq!((pair.task_a.as_str(), pair.task_b.as_str()), ("t1", "t2"));
        let weak = pair.weak_edge.as_ref().unwrap();
        assert_eq!(weak.from, "t2");
        assert_eq!(weak.to, "t1");
        assert!((weak.confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn shared_keywords_without_actions_are_ambiguous() {
        let tasks = vec![task("t1", "User profile page"), task("t2", "User profile cache")];
        let out = pattern_pass(&tasks, 0.80);
        assert!(out.accepted.is_empty());
        assert_eq!(out.ambiguous.len(), 1);
    }

    #[test]
    fn action_keyword_aliases() {
        let tasks = vec![task("t1", "Build order service"), task("t2", "Verify order service")];
        let out = pattern_pass(&tasks, 0.80);
        // build == implement, verify == test.
        assert_eq!(out.accepted.len(), 1);
        assert_eq!(out.accepted[0].from, "t2");
    }
}
