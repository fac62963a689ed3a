//! Query-string predicates for topic triggers.
//!
//! A predicate like `status:not=completed&class=inpatient,emergency` is a
//! conjunction of atoms; each atom is disjunctive over its comma-separated
//! values. Predicates are compiled once at topic registration and evaluated
//! against resource JSON per change.

use serde_json::Value;

use crate::fieldpath;

/// A compiled query predicate: conjunctive list of atoms.
#[derive(Debug, Clone, Default)]
pub struct QueryPredicate {
    atoms: Vec<QueryAtom>,
}

#[derive(Debug, Clone)]
struct QueryAtom {
    field: String,
    modifier: AtomModifier,
    values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum AtomModifier {
    /// Plain equality against any of the values
    Equals,
    /// No field value may equal any of the listed values
    Not,
    /// Set membership (alias of equality over a value list)
    In,
    /// Negated set membership
    NotIn,
    /// Field absence test; value "true" = must be absent
    Missing,
    /// Retained verbatim; always evaluates false
    Unknown(String),
}

impl QueryPredicate {
    /// Compile a query string. Parsing never fails: empty atoms are skipped
    /// and unknown modifiers are retained to evaluate as `false` (with a
    /// warning at evaluation time), so a typo cannot take a topic offline.
    pub fn parse(query: &str) -> Self {
        let atoms = query
            .split('&')
            .filter_map(parse_atom)
            .collect();
        Self { atoms }
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Evaluate against a resource body. An empty predicate matches
    /// everything; a missing resource matches nothing unless the predicate
    /// is empty.
    pub fn matches(&self, resource: &Value) -> bool {
        self.atoms.iter().all(|atom| atom.matches(resource))
    }
}

fn parse_atom(part: &str) -> Option<QueryAtom> {
    let part = part.trim();
    if part.is_empty() {
        return None;
    }

    let (lhs, rhs) = part.split_once('=')?;
    let (field, modifier) = match lhs.split_once(':') {
        Some((field, modifier)) => (field, parse_modifier(modifier)),
        None => (lhs, AtomModifier::Equals),
    };

    if field.is_empty() {
        return None;
    }

    let values: Vec<String> = rhs.split(',').map(|v| v.trim().to_string()).collect();

    Some(QueryAtom {
        field: field.trim().to_string(),
        modifier,
        values,
    })
}

fn parse_modifier(modifier: &str) -> AtomModifier {
    match modifier.trim() {
        "not" => AtomModifier::Not,
        "in" => AtomModifier::In,
        "not-in" => AtomModifier::NotIn,
        "missing" => AtomModifier::Missing,
        other => AtomModifier::Unknown(other.to_string()),
    }
}

impl QueryAtom {
    fn matches(&self, resource: &Value) -> bool {
        match &self.modifier {
            AtomModifier::Equals | AtomModifier::In => {
                let actual = fieldpath::string_values(resource, &self.field);
                actual.iter().any(|a| self.values.iter().any(|v| v == a))
            }
            AtomModifier::Not | AtomModifier::NotIn => {
                let actual = fieldpath::string_values(resource, &self.field);
                !actual.iter().any(|a| self.values.iter().any(|v| v == a))
            }
            AtomModifier::Missing => {
                let absent = fieldpath::lookup(resource, &self.field).is_empty();
                let want_absent = self
                    .values
                    .first()
                    .map(|v| v != "false")
                    .unwrap_or(true);
                absent == want_absent
            }
            AtomModifier::Unknown(name) => {
                tracing::warn!(
                    field = %self.field,
                    modifier = %name,
                    "Unknown query modifier, atom evaluates to false"
                );
                false
            }
        }
    }
}
