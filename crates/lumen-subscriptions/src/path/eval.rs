//! Interpreter for compiled path expressions.

use serde_json::Value;

use super::parser::{Accessor, CompareOp, Literal, Operand, PathExpr, Variable};
use crate::fieldpath;
use crate::valueset::ValueSetService;

/// Bindings and collaborators for one evaluation.
pub struct EvalContext<'a> {
    pub previous: Option<&'a Value>,
    pub current: Option<&'a Value>,
    pub value_sets: &'a dyn ValueSetService,
}

/// Evaluate a compiled expression. Pure and deterministic; `and`/`or`
/// short-circuit left to right.
pub fn evaluate(expr: &PathExpr, ctx: &EvalContext<'_>) -> bool {
    match expr {
        PathExpr::Or(left, right) => evaluate(left, ctx) || evaluate(right, ctx),
        PathExpr::And(left, right) => evaluate(left, ctx) && evaluate(right, ctx),
        PathExpr::Compare { left, op, right } => {
            let lhs = operand_values(left, ctx);
            let rhs = operand_values(right, ctx);
            match op {
                // True iff some pair of yielded values is equal.
                CompareOp::Eq => lhs
                    .iter()
                    .any(|l| rhs.iter().any(|r| literal_eq(l, r))),
                // Asserts only over non-empty collections: a missing field
                // is "no statement", not "different".
                CompareOp::Ne => {
                    !lhs.is_empty()
                        && !rhs.is_empty()
                        && !lhs.iter().any(|l| rhs.iter().any(|r| literal_eq(l, r)))
                }
            }
        }
        PathExpr::In { operand, choices } => {
            let values = operand_values(operand, ctx);
            values
                .iter()
                .any(|v| choices.iter().any(|c| literal_eq(v, c)))
        }
        PathExpr::Empty(accessor) => accessor_values(accessor, ctx).is_empty(),
        PathExpr::MemberOf {
            accessor,
            value_set,
        } => {
            let values = accessor_values(accessor, ctx);
            values.iter().any(|v| {
                let code = match v {
                    Literal::Str(s) => s.clone(),
                    Literal::Int(n) => n.to_string(),
                    Literal::Bool(b) => b.to_string(),
                };
                match ctx.value_sets.contains(value_set, &code) {
                    Ok(member) => member,
                    Err(e) => {
                        tracing::warn!(
                            value_set = %value_set,
                            code = %code,
                            error = %e,
                            "memberOf() could not consult the value-set service, treating as false"
                        );
                        false
                    }
                }
            })
        }
        PathExpr::Truthy(operand) => {
            let values = operand_values(operand, ctx);
            !values.is_empty() && values.iter().any(|v| !matches!(v, Literal::Bool(false)))
        }
    }
}

fn operand_values(operand: &Operand, ctx: &EvalContext<'_>) -> Vec<Literal> {
    match operand {
        Operand::Literal(lit) => vec![lit.clone()],
        Operand::Accessor(accessor) => accessor_values(accessor, ctx),
    }
}

/// Resolve an accessor to scalar literals. A missing binding yields the
/// empty collection, as do object-valued leaves.
fn accessor_values(accessor: &Accessor, ctx: &EvalContext<'_>) -> Vec<Literal> {
    let root = match accessor.var {
        Variable::Previous => ctx.previous,
        Variable::Current => ctx.current,
    };
    let Some(root) = root else {
        return Vec::new();
    };

    let segments: Vec<&str> = accessor.segments.iter().map(String::as_str).collect();
    fieldpath::lookup_segments(root, &segments)
        .into_iter()
        .filter_map(json_to_literal)
        .collect()
}

fn json_to_literal(value: &Value) -> Option<Literal> {
    match value {
        Value::String(s) => Some(Literal::Str(s.clone())),
        Value::Bool(b) => Some(Literal::Bool(*b)),
        Value::Number(n) => n.as_i64().map(Literal::Int).or_else(|| {
            // Non-integral numbers compare through their string form.
            Some(Literal::Str(n.to_string()))
        }),
        _ => None,
    }
}

fn literal_eq(a: &Literal, b: &Literal) -> bool {
    match (a, b) {
        (Literal::Str(x), Literal::Str(y)) => x == y,
        (Literal::Int(x), Literal::Int(y)) => x == y,
        (Literal::Bool(x), Literal::Bool(y)) => x == y,
        // Mixed types: compare canonical string forms, so '1' matches 1.
        (x, y) => literal_string(x) == literal_string(y),
    }
}

fn literal_string(lit: &Literal) -> String {
    match lit {
        Literal::Str(s) => s.clone(),
        Literal::Int(n) => n.to_string(),
        Literal::Bool(b) => b.to_string(),
    }
}
