use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use mc_core::config::InferenceConfig;
use mc_core::types::Task;
use mc_graph::{pattern_pass, AmbiguousPair, CandidateEdge};
use mc_providers::{with_deadline, AIProvider, DependencyQuery, Direction, InferenceVerdict, TaskBrief};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Confidence boost applied when the pattern and AI passes agree on a
/// direction, capped at 1.0.
const AGREEMENT_BOOST: f64 = 0.15;

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

type CacheKey = (String, String, u64);

fn description_hash(a: &Task, b: &Task) -> u64 {
    let mut hasher = ahash::AHasher::default();
    a.name.hash(&mut hasher);
    a.description.hash(&mut hasher);
    b.name.hash(&mut hasher);
    b.description.hash(&mut hasher);
    hasher.finish()
}

// ---------------------------------------------------------------------------
// HybridInferer
// ---------------------------------------------------------------------------

/// Two-pass dependency inference. Pass A applies the pattern rule catalog;
/// pass B batches the ambiguous pairs to the AI provider. When the AI is
/// unreachable the inferer degrades to patterns only.
///
/// AI verdicts are cached in memory by `(task_a, task_b, description_hash)`;
/// the cache does not survive a restart.
pub struct HybridInferer {
    ai: Arc<dyn AIProvider>,
    config: InferenceConfig,
    ai_deadline: Duration,
    cache: Mutex<HashMap<CacheKey, InferenceVerdict>>,
}

impl HybridInferer {
    pub fn new(ai: Arc<dyn AIProvider>, config: InferenceConfig, ai_deadline: Duration) -> Self {
        Self {
            ai,
            config,
            ai_deadline,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Infer directed dependency edges between the given tasks. The result
    /// set is handed to the graph validator before any of it is applied.
    pub async fn infer(&self, tasks: &[Task]) -> Vec<CandidateEdge> {
        let outcome = pattern_pass(tasks, self.config.pattern_confidence_threshold);
        let mut edges = outcome.accepted;

        if outcome.ambiguous.is_empty() {
            return edges;
        }

        let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let verdicts = self.resolve_ambiguous(&outcome.ambiguous, &by_id).await;

        for pair in &outcome.ambiguous {
            let verdict = verdicts.get(&(pair.task_a.clone(), pair.task_b.clone()));
            if let Some(edge) = combine(pair, verdict, self.config.ai_confidence_threshold) {
                edges.push(edge);
            }
        }

        edges
    }

    /// Fetch AI verdicts for ambiguous pairs, via the cache, in batches of
    /// at most `batch_size`. AI failures leave the affected pairs without a
    /// verdict; the combination step then treats them as pattern-only.
    async fn resolve_ambiguous(
        &self,
        ambiguous: &[AmbiguousPair],
        by_id: &HashMap<&str, &Task>,
    ) -> HashMap<(String, String), InferenceVerdict> {
        let mut resolved = HashMap::new();
        let mut uncached: Vec<(&AmbiguousPair, CacheKey)> = Vec::new();

        {
            let cache = self.cache.lock().await;
            for pair in ambiguous {
                let (Some(a), Some(b)) = (by_id.get(pair.task_a.as_str()), by_id.get(pair.task_b.as_str()))
                else {
                    continue;
                };
                let key = (pair.task_a.clone(), pair.task_b.clone(), description_hash(a, b));
                if let Some(verdict) = cache.get(&key) {
                    resolved.insert((pair.task_a.clone(), pair.task_b.clone()), verdict.clone());
                } else {
                    uncached.push((pair, key));
                }
            }
        }

        for chunk in uncached.chunks(self.config.batch_size.max(1)) {
            let queries: Vec<DependencyQuery> = chunk
                .iter()
                .filter_map(|(pair, _)| {
                    let a = by_id.get(pair.task_a.as_str())?;
                    let b = by_id.get(pair.task_b.as_str())?;
                    Some(DependencyQuery {
                        task_a: TaskBrief::from_task(a),
                        task_b: TaskBrief::from_task(b),
                    })
                })
                .collect();

            let result = with_deadline(self.ai_deadline, self.ai.infer_dependencies(&queries)).await;
            match result {
                Ok(verdicts) if verdicts.len() == queries.len() => {
                    let mut cache = self.cache.lock().await;
                    for ((pair, key), verdict) in chunk.iter().zip(verdicts) {
                        cache.insert(key.clone(), verdict.clone());
                        resolved.insert((pair.task_a.clone(), pair.task_b.clone()), verdict);
                    }
                }
                Ok(verdicts) => {
                    warn!(
                        expected = queries.len(),
                        got = verdicts.len(),
                        "ai returned wrong verdict count; discarding batch"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "ai dependency inference unavailable; using patterns only");
                    break;
                }
            }
        }

        resolved
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

// ---------------------------------------------------------------------------
// Combination rules
// ---------------------------------------------------------------------------

/// Merge the weak pattern edge with the AI verdict for one pair.
///
/// Agreement on direction boosts confidence by 0.15 (capped at 1.0); a
/// conflict resolves to the higher-confidence source; a single-source edge
/// is accepted only at or above `ai_threshold`.
fn combine(
    pair: &AmbiguousPair,
    verdict: Option<&InferenceVerdict>,
    ai_threshold: f64,
) -> Option<CandidateEdge> {
    let ai_edge = verdict.and_then(|v| match v.direction {
        Direction::FirstOnSecond => Some(CandidateEdge {
            from: pair.task_a.clone(),
            to: pair.task_b.clone(),
            confidence: v.confidence,
            reason: v.reason.clone(),
        }),
        Direction::SecondOnFirst => Some(CandidateEdge {
            from: pair.task_b.clone(),
            to: pair.task_a.clone(),
            confidence: v.confidence,
            reason: v.reason.clone(),
        }),
        Direction::None => None,
    });

    match (&pair.weak_edge, ai_edge) {
        (Some(pattern), Some(ai)) if pattern.from == ai.from && pattern.to == ai.to => {
            let confidence = (pattern.confidence.max(ai.confidence) + AGREEMENT_BOOST).min(1.0);
            let edge = CandidateEdge {
                confidence,
                reason: format!("pattern+ai: {}", ai.reason),
                ..pattern.clone()
            };
            debug!(from = %edge.from, to = %edge.to, confidence, "sources agree");
            (confidence >= ai_threshold).then_some(edge)
        }
        (Some(pattern), Some(ai)) => {
            let winner = if pattern.confidence >= ai.confidence {
                pattern.clone()
            } else {
                ai
            };
            (winner.confidence >= ai_threshold).then_some(winner)
        }
        (Some(pattern), None) => (pattern.confidence >= ai_threshold).then(|| pattern.clone()),
        (None, Some(ai)) => (ai.confidence >= ai_threshold).then_some(ai),
        (None, None) => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
