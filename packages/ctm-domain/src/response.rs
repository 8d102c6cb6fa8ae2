use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::{Error, Result};

/// Parses model output that should be a single JSON object, tolerating markdown fences and
/// surrounding prose.
pub fn parse_json_object(raw: &str) -> Result<Value> {
	let unfenced = strip_code_fence(raw);

	if let Ok(value) = serde_json::from_str::<Value>(unfenced) {
		return require_object(value);
	}

	let (Some(start), Some(end)) = (unfenced.find('{'), unfenced.rfind('}')) else {
		return Err(Error::InvalidJson { message: "No JSON object found.".to_string() });
	};

	if end <= start {
		return Err(Error::InvalidJson { message: "No JSON object found.".to_string() });
	}

	let value = serde_json::from_str::<Value>(&unfenced[start..=end])
		.map_err(|err| Error::InvalidJson { message: err.to_string() })?;

	require_object(value)
}

pub fn strip_code_fence(raw: &str) -> &str {
	static FENCE: OnceLock<Option<Regex>> = OnceLock::new();

	let trimmed = raw.trim();
	let fence = FENCE.get_or_init(|| Regex::new(r"(?s)^```[A-Za-z]*\s*(.*?)\s*```$").ok());

	match fence.as_ref().and_then(|re| re.captures(trimmed)).and_then(|caps| caps.get(1)) {
		Some(inner) => inner.as_str(),
		None => trimmed,
	}
}

/// Reads a number that models sometimes emit as a string.
pub fn lenient_f64(value: &Value) -> Option<f64> {
	let number = match value {
		Value::Number(number) => number.as_f64(),
		Value::String(text) => text.trim().parse::<f64>().ok(),
		_ => None,
	}?;

	number.is_finite().then_some(number)
}

fn require_object(value: Value) -> Result<Value> {
	if value.is_object() {
		Ok(value)
	} else {
		Err(Error::UnexpectedShape { message: "Expected a JSON object.".to_string() })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_fenced_json() {
		let raw = "```json\n{\"0\": [\"ok\", [1], \"included\"]}\n```";
		let value = parse_json_object(raw).expect("parse failed");

		assert!(value.get("0").is_some());
	}

	#[test]
	fn parses_json_wrapped_in_prose() {
		let raw = "Here you go: {\"relevance_score_R\": 80} Hope this helps.";
		let value = parse_json_object(raw).expect("parse failed");

		assert_eq!(value["relevance_score_R"], 80);
	}

	#[test]
	fn rejects_non_object_json() {
		assert!(matches!(parse_json_object("[1, 2]"), Err(Error::UnexpectedShape { .. })));
		assert!(matches!(parse_json_object("no json here"), Err(Error::InvalidJson { .. })));
	}

	#[test]
	fn lenient_numbers_accept_numeric_strings() {
		assert_eq!(lenient_f64(&serde_json::json!("42.5")), Some(42.5));
		assert_eq!(lenient_f64(&serde_json::json!(-10)), Some(-10.0));
		assert_eq!(lenient_f64(&serde_json::json!("high")), None);
		assert_eq!(lenient_f64(&Value::Null), None);
	}
}
