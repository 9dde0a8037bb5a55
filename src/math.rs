//! Arithmetic expressions for `math.<expr>` sources.
//!
//! Expressions are evaluated with a sandboxed rhai engine: expression syntax
//! only (no statements), bounded operation count and nesting depth. Integer
//! operands give integer results (`7/2` is `3`), any float operand gives a
//! float result.

use crate::value::TypedValue;
use rhai::{Dynamic, Engine};

const MAX_OPERATIONS: u64 = 10_000;
const MAX_EXPR_DEPTH: usize = 64;

pub struct MathEvaluator {
    engine: Engine,
}

impl MathEvaluator {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(MAX_OPERATIONS);
        engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_EXPR_DEPTH);
        Self { engine }
    }

    pub fn eval(&self, expression: &str) -> Result<TypedValue, String> {
        let result: Dynamic = self
            .engine
            .eval_expression::<Dynamic>(expression)
            .map_err(|e| e.to_string())?;

        if result.is_int() {
            return result
                .as_int()
                .map(TypedValue::Integer)
                .map_err(str::to_string);
        }
        if result.is_float() {
            return result
                .as_float()
                .map(TypedValue::Float)
                .map_err(str::to_string);
        }
        if result.is_bool() {
            return result
                .as_bool()
                .map(TypedValue::Boolean)
                .map_err(str::to_string);
        }
        if result.is_unit() {
            return Err("expression has no value".to_string());
        }
        Ok(TypedValue::String(result.to_string()))
    }
}

impl Default for MathEvaluator {
    fn default() -> Self {
        Self::new()
    }
}
