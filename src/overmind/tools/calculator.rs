//! Calculator tool.
//!
//! Evaluates a mathematical expression and returns the numeric result.
//! Supports arithmetic (`+ - * / % ^`), the `math::` function namespace
//! provided by `evalexpr` (`sqrt`, `sin`, `ln`, ...), and the constants `pi`
//! and `e`.
//!
//! The tool is stateless and synchronous; async callers reach it through the
//! registry's blocking-pool bridge.

use crate::overmind::tool_protocol::{Tool, ToolError};
use async_trait::async_trait;
use evalexpr::ContextWithMutableVariables;
use serde_json::{json, Value};

/// Evaluates mathematical expressions for agents and workflow tool nodes.
pub struct CalculatorTool;

impl CalculatorTool {
    pub fn new() -> Self {
        CalculatorTool
    }

    fn evaluate(&self, expression: &str) -> Result<f64, ToolError> {
        let prepared = prepare_expression(expression);

        let mut context: evalexpr::HashMapContext = evalexpr::HashMapContext::new();
        let _ = context.set_value(
            "pi".to_string(),
            evalexpr::Value::Float(std::f64::consts::PI),
        );
        let _ = context.set_value("e".to_string(), evalexpr::Value::Float(std::f64::consts::E));

        match evalexpr::eval_with_context(&prepared, &context) {
            Ok(value) => value
                .as_number()
                .map_err(|_| ToolError::ExecutionFailed("result is not a number".to_string())),
            Err(e) => Err(ToolError::ExecutionFailed(format!(
                "evaluation error: {}",
                e
            ))),
        }
    }
}

impl Default for CalculatorTool {
    fn default() -> Self {
        Self::new()
    }
}

/// Map common math spellings onto evalexpr's `math::` namespace.
fn prepare_expression(expr: &str) -> String {
    let mut prepared = expr.trim().to_string();
    prepared = prepared.replace("**", "^");
    for func in &[
        "sqrt", "abs", "floor", "ceil", "round", "ln", "exp", "sin", "cos", "tan", "asin",
        "acos", "atan",
    ] {
        let call = format!("{}(", func);
        let namespaced = format!("math::{}(", func);
        if prepared.contains(&call) && !prepared.contains(&namespaced) {
            prepared = prepared.replace(&call, &namespaced);
        }
    }
    prepared
}

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate a mathematical expression and return the numeric result."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "The expression to evaluate, e.g. \"2 + 2 * 3\""
                }
            },
            "required": ["expression"]
        })
    }

    fn run(&self, args: Value) -> Result<Value, ToolError> {
        let expression = args
            .get("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ToolError::InvalidArguments("missing required field 'expression'".to_string())
            })?;
        let result = self.evaluate(expression)?;
        Ok(json!({ "expression": expression, "result": result }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_arithmetic() {
        let calc = CalculatorTool::new();
        let out = calc.run(json!({"expression": "2 + 2 * 3"})).unwrap();
        assert_eq!(out["result"], 8.0);
    }

    #[test]
    fn test_functions_and_constants() {
        let calc = CalculatorTool::new();
        let out = calc.run(json!({"expression": "sqrt(16) + pi * 0"})).unwrap();
        assert_eq!(out["result"], 4.0);
    }

    #[test]
    fn test_missing_expression_is_invalid_arguments() {
        let calc = CalculatorTool::new();
        assert!(matches!(
            calc.run(json!({})),
            Err(ToolError::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_garbage_expression_is_execution_failure() {
        let calc = CalculatorTool::new();
        assert!(matches!(
            calc.run(json!({"expression": "this is not math"})),
            Err(ToolError::ExecutionFailed(_))
        ));
    }
}
