//! Skip-condition evaluation against the ambiance

use crate::core::Ambiance;
use crate::execution::EngineError;

/// Evaluates boolean expressions in the scope of an ambiance
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate_bool(&self, ambiance: &Ambiance, expression: &str) -> Result<bool, EngineError>;
}

/// Literal `true`/`false`, or `<key> == 'value'` / `<key> != 'value'`
///
/// Keys: `plan_id`, `account_id`, `org`, `project`, `step.identifier`,
/// `step.type`, `stage`. An absent value compares as the empty string.
#[derive(Debug, Clone, Default)]
pub struct AmbianceEvaluator;

impl AmbianceEvaluator {
    fn lookup<'a>(ambiance: &'a Ambiance, key: &str) -> Result<&'a str, EngineError> {
        let value = match key {
            "plan_id" => Some(ambiance.plan_id.as_str()),
            "account_id" => ambiance.account_id(),
            "org" => ambiance.org_identifier(),
            "project" => ambiance.project_identifier(),
            "step.identifier" => ambiance.step_identifier(),
            "step.type" => ambiance.current_step_type(),
            "stage" => ambiance.stage_execution_id.and_then(|stage_id| {
                ambiance
                    .levels
                    .iter()
                    .find(|level| level.runtime_id == stage_id)
                    .map(|level| level.identifier.as_str())
            }),
            other => return Err(EngineError::Expression(format!("unknown key '{}'", other))),
        };
        Ok(value.unwrap_or_default())
    }

    fn unquote(literal: &str) -> Result<&str, EngineError> {
        let literal = literal.trim();
        let quoted = literal.len() >= 2
            && ((literal.starts_with('\'') && literal.ends_with('\''))
                || (literal.starts_with('"') && literal.ends_with('"')));
        if !quoted {
            return Err(EngineError::Expression(format!("expected a quoted value, got {}", literal)));
        }
        Ok(&literal[1..literal.len() - 1])
    }
}

impl ExpressionEvaluator for AmbianceEvaluator {
    fn evaluate_bool(&self, ambiance: &Ambiance, expression: &str) -> Result<bool, EngineError> {
        let expression = expression.trim();
        match expression.to_ascii_lowercase().as_str() {
            "true" => return Ok(true),
            "false" => return Ok(false),
            _ => {}
        }

        let (key, literal, negate) = if let Some((key, literal)) = expression.split_once("!=") {
            (key, literal, true)
        } else if let Some((key, literal)) = expression.split_once("==") {
            (key, literal, false)
        } else {
            return Err(EngineError::Expression(format!("cannot evaluate '{}'", expression)));
        };

        let actual = Self::lookup(ambiance, key.trim())?;
        let expected = Self::unquote(literal)?;
        Ok((actual == expected) != negate)
    }
}
