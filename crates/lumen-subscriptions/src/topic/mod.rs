//! Topic registry: compiled topics with fast lookup and deterministic
//! trigger evaluation.
//!
//! Topics are compiled once at registration (query predicates parsed, path
//! expressions lexed and parsed); evaluation per change touches only the
//! compiled forms. The registry is read-mostly: lookups go through a
//! lock-free snapshot, mutations serialize on an exclusive lock.

pub mod loader;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde_json::Value;

use lumen_core::ResourceChange;

use crate::error::{SubscriptionError, SubscriptionResult};
use crate::path::{self, EvalContext, PathExpr};
use crate::query::QueryPredicate;
use crate::types::{
    MatchReason, QueryCriteria, QueryResultBehavior, TopicDef, TopicMatch, TriggerDef,
    TriggerInteraction,
};
use crate::valueset::ValueSetService;

/// A topic with its predicates compiled for evaluation.
#[derive(Debug)]
pub struct CompiledTopic {
    pub def: TopicDef,
    triggers: Vec<CompiledTrigger>,
}

#[derive(Debug)]
struct CompiledTrigger {
    def: TriggerDef,
    previous: Option<QueryPredicate>,
    current: Option<QueryPredicate>,
    path: Option<PathExpr>,
}

impl CompiledTopic {
    fn compile(def: TopicDef) -> SubscriptionResult<Self> {
        if def.url.is_empty() {
            return Err(SubscriptionError::validation("topic has no canonical URL"));
        }
        if def.triggers.is_empty() {
            return Err(SubscriptionError::validation(format!(
                "topic '{}' declares no triggers",
                def.url
            )));
        }

        let triggers = def
            .triggers
            .iter()
            .map(|trigger| {
                let (previous, current) = match &trigger.query_criteria {
                    Some(criteria) => (
                        criteria.previous.as_deref().map(QueryPredicate::parse),
                        criteria.current.as_deref().map(QueryPredicate::parse),
                    ),
                    None => (None, None),
                };
                let path = trigger
                    .path_criteria
                    .as_deref()
                    .map(path::compile)
                    .transpose()?;
                Ok(CompiledTrigger {
                    def: trigger.clone(),
                    previous,
                    current,
                    path,
                })
            })
            .collect::<SubscriptionResult<Vec<_>>>()?;

        Ok(Self { def, triggers })
    }

    pub fn url(&self) -> &str {
        &self.def.url
    }

    fn has_trigger_for(&self, resource_type: &str, interaction: TriggerInteraction) -> bool {
        self.triggers.iter().any(|t| {
            t.def.resource_type == resource_type && t.def.interactions.contains(&interaction)
        })
    }
}

/// Registry of compiled subscription topics.
pub struct TopicRegistry {
    topics: ArcSwap<HashMap<String, Arc<CompiledTopic>>>,
    write_lock: Mutex<()>,
    value_sets: Arc<dyn ValueSetService>,
}

impl TopicRegistry {
    pub fn new(value_sets: Arc<dyn ValueSetService>) -> Self {
        Self {
            topics: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
            value_sets,
        }
    }

    /// Compile and insert a topic, replacing any topic with the same
    /// canonical URL. Idempotent by URL.
    pub fn register(&self, def: TopicDef) -> SubscriptionResult<Arc<CompiledTopic>> {
        let compiled = Arc::new(CompiledTopic::compile(def)?);

        let _guard = self.write_lock.lock();
        let mut topics: HashMap<String, Arc<CompiledTopic>> = (**self.topics.load()).clone();
        topics.insert(compiled.url().to_string(), compiled.clone());
        self.topics.store(Arc::new(topics));

        tracing::info!(url = compiled.url(), "Subscription topic registered");
        Ok(compiled)
    }

    pub fn get(&self, url: &str) -> Option<Arc<CompiledTopic>> {
        self.topics.load().get(url).cloned()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.load().len()
    }

    /// Topics with at least one trigger matching the change's resource type
    /// and interaction. Deterministic order (sorted by URL).
    pub fn lookup_for_change(
        &self,
        resource_type: &str,
        interaction: TriggerInteraction,
    ) -> Vec<Arc<CompiledTopic>> {
        let snapshot = self.topics.load();
        let mut matching: Vec<Arc<CompiledTopic>> = snapshot
            .values()
            .filter(|topic| topic.has_trigger_for(resource_type, interaction))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.url().cmp(b.url()));
        matching
    }

    /// Evaluate a compiled topic against a change. Triggers are disjunctive:
    /// the first matching trigger decides the reported reason.
    pub fn evaluate(&self, topic: &CompiledTopic, change: &ResourceChange) -> TopicMatch {
        let interaction = TriggerInteraction::from(change.kind);

        for trigger in &topic.triggers {
            if trigger.def.resource_type != change.resource_type
                || !trigger.def.interactions.contains(&interaction)
            {
                continue;
            }

            let result = self.evaluate_trigger(trigger, change, interaction);
            if result.matched {
                return result;
            }
        }

        TopicMatch::no_match()
    }

    fn evaluate_trigger(
        &self,
        trigger: &CompiledTrigger,
        change: &ResourceChange,
        interaction: TriggerInteraction,
    ) -> TopicMatch {
        let query_result = trigger
            .def
            .query_criteria
            .as_ref()
            .map(|criteria| evaluate_query(criteria, trigger, change, interaction));

        let path_result = trigger.path.as_ref().map(|expr| {
            let ctx = EvalContext {
                previous: change.previous.as_ref(),
                current: change.current.as_ref(),
                value_sets: self.value_sets.as_ref(),
            };
            path::evaluate(expr, &ctx)
        });

        let require_both = trigger
            .def
            .query_criteria
            .as_ref()
            .map(|c| c.require_both)
            .unwrap_or(true);

        let (matched, reason) = match (query_result, path_result) {
            // No criteria at all: the interaction alone fires the trigger.
            (None, None) => (true, MatchReason::Both),
            (Some(q), None) => (q, if q { MatchReason::Query } else { MatchReason::None }),
            (None, Some(p)) => (p, if p { MatchReason::Path } else { MatchReason::None }),
            (Some(q), Some(p)) => {
                let matched = if require_both { q && p } else { q || p };
                let reason = match (matched, q, p) {
                    (false, ..) => MatchReason::None,
                    (true, true, true) => MatchReason::Both,
                    (true, true, false) => MatchReason::Query,
                    (true, false, true) => MatchReason::Path,
                    (true, false, false) => unreachable!("match requires a passing side"),
                };
                (matched, reason)
            }
        };

        TopicMatch { matched, reason }
    }
}

/// Query-criteria evaluation per interaction kind. An absent query string
/// is vacuously true; the `resultForCreate`/`resultForDelete` gates decide
/// the side the interaction removed.
fn evaluate_query(
    criteria: &QueryCriteria,
    trigger: &CompiledTrigger,
    change: &ResourceChange,
    interaction: TriggerInteraction,
) -> bool {
    match interaction {
        TriggerInteraction::Create => {
            let current_ok = predicate_matches(&trigger.current, change.current.as_ref());
            current_ok && criteria.result_for_create == QueryResultBehavior::Passes
        }
        TriggerInteraction::Delete => {
            let previous_ok = predicate_matches(&trigger.previous, change.previous.as_ref());
            previous_ok && criteria.result_for_delete == QueryResultBehavior::Passes
        }
        TriggerInteraction::Update => {
            let previous_ok = predicate_matches(&trigger.previous, change.previous.as_ref());
            let current_ok = predicate_matches(&trigger.current, change.current.as_ref());
            if criteria.require_both {
                previous_ok && current_ok
            } else {
                previous_ok || current_ok
            }
        }
    }
}

fn predicate_matches(predicate: &Option<QueryPredicate>, body: Option<&Value>) -> bool {
    match predicate {
        None => true,
        Some(predicate) => match body {
            Some(body) => predicate.matches(body),
            // A missing body carries no field values.
            None => predicate.matches(&Value::Null),
        },
    }
}
