//! Minimal path-expression predicate language for topic triggers.
//!
//! Expressions reference the change's `%previous` and `%current` bindings,
//! chain field accessors, and combine relations with `and`/`or`:
//!
//! ```text
//! %previous.status != 'completed' and %current.status = 'completed'
//! %current.class in ('inpatient' | 'emergency')
//! %current.code.memberOf('http://example.org/ValueSet/vitals')
//! %previous.period.empty() or %current.priority = 1
//! ```
//!
//! Expressions are compiled at topic registration (lex + parse) and
//! interpreted per change. Evaluation is pure and deterministic: `and`/`or`
//! short-circuit, a missing `%previous` makes its accessors yield nothing,
//! and an unavailable value-set service turns `memberOf` into `false` with
//! a logged diagnostic.

mod eval;
mod lexer;
mod parser;

pub use eval::{EvalContext, evaluate};
pub use parser::{Accessor, CompareOp, Literal, Operand, PathExpr, Variable};

use crate::error::{SubscriptionError, SubscriptionResult};

/// Compile an expression string into its AST.
pub fn compile(input: &str) -> SubscriptionResult<PathExpr> {
    let tokens = lexer::tokenize(input)
        .map_err(|e| SubscriptionError::Validation(format!("path expression: {e}")))?;
    parser::parse(&tokens)
        .map_err(|e| SubscriptionError::Validation(format!("path expression: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::valueset::{StaticValueSetService, UnavailableValueSetService};
    use serde_json::json;

    fn eval_expr(
        input: &str,
        previous: Option<&serde_json::Value>,
        current: Option<&serde_json::Value>,
    ) -> bool {
        let expr = compile(input).expect("expression should compile");
        let service = UnavailableValueSetService;
        let ctx = EvalContext {
            previous,
            current,
            value_sets: &service,
        };
        evaluate(&expr, &ctx)
    }

    #[test]
    fn test_equality() {
        let current = json!({"status": "completed"});
        assert!(eval_expr("%current.status = 'completed'", None, Some(&current)));
        assert!(!eval_expr("%current.status = 'planned'", None, Some(&current)));
    }

    #[test]
    fn test_inequality_requires_a_value() {
        let current = json!({"status": "planned"});
        assert!(eval_expr("%current.status != 'completed'", None, Some(&current)));
        // A missing binding yields no values, so != asserts nothing.
        assert!(!eval_expr("%previous.status != 'completed'", None, Some(&current)));
    }

    #[test]
    fn test_and_or_short_circuit() {
        let prev = json!({"status": "planned"});
        let curr = json!({"status": "completed"});
        assert!(eval_expr(
            "%previous.status != 'completed' and %current.status = 'completed'",
            Some(&prev),
            Some(&curr),
        ));
        assert!(!eval_expr(
            "%previous.status != 'completed' and %current.status = 'completed'",
            Some(&curr),
            Some(&curr),
        ));
        assert!(eval_expr(
            "%current.status = 'nope' or %current.status = 'completed'",
            None,
            Some(&curr),
        ));
    }

    #[test]
    fn test_parentheses() {
        let curr = json!({"status": "completed", "class": "inpatient"});
        assert!(eval_expr(
            "(%current.status = 'draft' or %current.status = 'completed') and %current.class = 'inpatient'",
            None,
            Some(&curr),
        ));
    }

    #[test]
    fn test_in_list() {
        let curr = json!({"class": "emergency"});
        assert!(eval_expr(
            "%current.class in ('inpatient' | 'emergency')",
            None,
            Some(&curr),
        ));
        assert!(!eval_expr(
            "%current.class in ('inpatient' | 'virtual')",
            None,
            Some(&curr),
        ));
    }

    #[test]
    fn test_empty() {
        let with_period = json!({"period": {"start": "2024-01-01"}});
        let without = json!({"status": "final"});
        assert!(eval_expr("%current.period.empty()", None, Some(&without)));
        assert!(!eval_expr("%current.period.empty()", None, Some(&with_period)));
        // All accessors on a missing %previous are empty.
        assert!(eval_expr("%previous.period.empty()", None, Some(&without)));
    }

    #[test]
    fn test_integer_and_boolean_literals() {
        let curr = json!({"priority": 1, "active": true});
        assert!(eval_expr("%current.priority = 1", None, Some(&curr)));
        assert!(!eval_expr("%current.priority = 2", None, Some(&curr)));
        assert!(eval_expr("%current.active = true", None, Some(&curr)));
        assert!(eval_expr("true", None, Some(&curr)));
        assert!(!eval_expr("false", None, Some(&curr)));
    }

    #[test]
    fn test_member_of_with_unavailable_service_is_false() {
        let curr = json!({"code": "8867-4"});
        // Diagnostic is logged; the atom itself is simply false.
        assert!(!eval_expr(
            "%current.code.memberOf('http://example.org/ValueSet/vitals')",
            None,
            Some(&curr),
        ));
    }

    #[test]
    fn test_member_of_with_static_service() {
        let expr =
            compile("%current.code.memberOf('http://example.org/ValueSet/vitals')").unwrap();
        let service = StaticValueSetService::new()
            .with_set("http://example.org/ValueSet/vitals", ["8867-4", "8480-6"]);
        let curr = json!({"code": "8867-4"});
        let ctx = EvalContext {
            previous: None,
            current: Some(&curr),
            value_sets: &service,
        };
        assert!(evaluate(&expr, &ctx));

        let other = json!({"code": "1234-5"});
        let ctx = EvalContext {
            previous: None,
            current: Some(&other),
            value_sets: &service,
        };
        assert!(!evaluate(&expr, &ctx));
    }

    #[test]
    fn test_compile_errors() {
        assert!(compile("%current.status =").is_err());
        assert!(compile("%current.status = 'unterminated").is_err());
        assert!(compile("%nope.status = 'x'").is_err());
        assert!(compile("(%current.status = 'x'").is_err());
        assert!(compile("%current.status in ()").is_err());
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let expr = compile("%current.status = 'completed' or %current.status = 'planned'")
            .unwrap();
        let service = UnavailableValueSetService;
        let curr = json!({"status": "planned"});
        let ctx = EvalContext {
            previous: None,
            current: Some(&curr),
            value_sets: &service,
        };
        let first = evaluate(&expr, &ctx);
        for _ in 0..10 {
            assert_eq!(evaluate(&expr, &ctx), first);
        }
    }
}
