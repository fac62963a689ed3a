//! Per-subscription filter evaluation.
//!
//! Filters are grouped by parameter name: a candidate passes iff every
//! name-group passes, and a group passes iff at least one of its clauses
//! matches. Clauses for the candidate's resource type and for the `"*"`
//! wildcard both apply.

use serde_json::Value;
use std::collections::HashMap;

use crate::error::{SubscriptionError, SubscriptionResult};
use crate::fieldpath;
use crate::types::{FilterClause, FilterComparator, FilterModifier, SubscriptionDef, TopicDef};

/// Reject registrations whose filters name parameters the topic does not
/// declare in `canFilterBy`. Never silently drops a filter.
pub fn validate_filters(def: &SubscriptionDef, topic: &TopicDef) -> SubscriptionResult<()> {
    for (resource_type, clauses) in &def.filters {
        let allowed = if resource_type == "*" {
            topic
                .can_filter_by
                .iter()
                .map(|f| f.filter_parameter.as_str())
                .collect()
        } else {
            topic.allowed_filter_params(resource_type)
        };

        for clause in clauses {
            if !allowed.contains(&clause.name.as_str()) {
                return Err(SubscriptionError::rejected(format!(
                    "filter '{}' is not declared by topic '{}' for resource type '{}'",
                    clause.name, topic.url, resource_type
                )));
            }
        }
    }
    Ok(())
}

/// Evaluate a subscription's filters against a candidate resource.
pub fn matches_filters(
    filters: &HashMap<String, Vec<FilterClause>>,
    resource_type: &str,
    resource: &Value,
) -> bool {
    let applicable: Vec<&FilterClause> = filters
        .get(resource_type)
        .into_iter()
        .chain(filters.get("*"))
        .flatten()
        .collect();

    if applicable.is_empty() {
        return true;
    }

    // Group clauses by name: conjunctive across names, disjunctive within.
    let mut groups: HashMap<&str, Vec<&FilterClause>> = HashMap::new();
    for clause in applicable {
        groups.entry(clause.name.as_str()).or_default().push(clause);
    }

    groups
        .values()
        .all(|group| group.iter().any(|clause| clause_matches(clause, resource)))
}

fn clause_matches(clause: &FilterClause, resource: &Value) -> bool {
    if clause.modifier == Some(FilterModifier::Missing) {
        let absent = fieldpath::lookup(resource, &clause.name).is_empty();
        let want_absent = clause.value != "false";
        return absent == want_absent;
    }

    let actual = fieldpath::string_values(resource, &clause.name);

    match clause.comparator {
        FilterComparator::Eq => actual.iter().any(|a| value_eq(a, clause)),
        FilterComparator::Ne => {
            !actual.is_empty() && !actual.iter().any(|a| value_eq(a, clause))
        }
        ordering => actual
            .iter()
            .any(|a| numeric_compare(a, &clause.value, ordering)),
    }
}

fn value_eq(actual: &str, clause: &FilterClause) -> bool {
    match clause.modifier {
        Some(FilterModifier::Contains) => actual.contains(&clause.value),
        _ => actual == clause.value,
    }
}

/// Ordering comparators apply only when both sides are numbers; a
/// non-numeric operand fails the clause rather than guessing an order.
fn numeric_compare(actual: &str, expected: &str, comparator: FilterComparator) -> bool {
    let (Ok(a), Ok(b)) = (actual.parse::<f64>(), expected.parse::<f64>()) else {
        return false;
    };

    match comparator {
        FilterComparator::Gt => a > b,
        FilterComparator::Ge => a >= b,
        FilterComparator::Lt => a < b,
        FilterComparator::Le => a <= b,
        FilterComparator::Eq => (a - b).abs() < f64::EPSILON,
        FilterComparator::Ne => (a - b).abs() >= f64::EPSILON,
    }
}
