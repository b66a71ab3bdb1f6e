//! Model output grammar
//!
//! A response is one JSON object, either the whole text or inside a single
//! fenced block:
//!
//! ```text
//! {"thought": "...", "action": "<name>", "params": {...}}
//! {"thought": "...", "final_answer": "..."}
//! ```
//!
//! `arguments` is accepted as an alias of `params`. Anything else, including
//! an object carrying both `action` and `final_answer`, is unparsable.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\n?(.*?)```").expect("invalid regex")
});

/// A requested action invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ActionCall {
    pub name: String,
    /// Always a JSON object
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    FinalAnswer {
        thought: Option<String>,
        answer: String,
    },
    ActionCall {
        thought: Option<String>,
        call: ActionCall,
    },
    Unparsable {
        reason: String,
    },
}

impl ParsedResponse {
    fn unparsable(reason: impl Into<String>) -> Self {
        ParsedResponse::Unparsable {
            reason: reason.into(),
        }
    }
}

/// Classify one model response. Never fails; bad input is `Unparsable`.
pub fn parse_response(text: &str) -> ParsedResponse {
    let object = match extract_object(text) {
        Ok(object) => object,
        Err(reason) => return ParsedResponse::unparsable(reason),
    };

    let thought = match object.get("thought") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(_) => return ParsedResponse::unparsable("\"thought\" must be a string"),
    };

    let action = object.get("action").filter(|v| !v.is_null());
    let answer = object.get("final_answer").filter(|v| !v.is_null());

    match (action, answer) {
        (Some(_), Some(_)) => {
            ParsedResponse::unparsable("response has both \"action\" and \"final_answer\"")
        }
        (None, None) => {
            ParsedResponse::unparsable("response has neither \"action\" nor \"final_answer\"")
        }
        (None, Some(answer)) => match answer {
            Value::String(answer) => ParsedResponse::FinalAnswer {
                thought,
                answer: answer.clone(),
            },
            _ => ParsedResponse::unparsable("\"final_answer\" must be a string"),
        },
        (Some(action), None) => {
            let name = match action.as_str().map(str::trim) {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => return ParsedResponse::unparsable("\"action\" must be a non-empty string"),
            };
            if object.contains_key("params") && object.contains_key("arguments") {
                return ParsedResponse::unparsable("give either \"params\" or \"arguments\", not both");
            }
            let arguments = match object.get("params").or_else(|| object.get("arguments")) {
                None | Some(Value::Null) => Value::Object(Map::new()),
                Some(Value::Object(args)) => Value::Object(args.clone()),
                Some(_) => return ParsedResponse::unparsable("\"params\" must be an object"),
            };
            ParsedResponse::ActionCall {
                thought,
                call: ActionCall { name, arguments },
            }
        }
    }
}

fn extract_object(text: &str) -> Result<Map<String, Value>, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("response is empty".to_string());
    }

    let candidate = if trimmed.starts_with('{') {
        trimmed
    } else {
        let mut blocks = FENCED_JSON.captures_iter(trimmed);
        let first = blocks
            .next()
            .and_then(|c| c.get(1))
            .ok_or_else(|| "no JSON object found in response".to_string())?;
        if blocks.next().is_some() {
            return Err("response contains more than one JSON block".to_string());
        }
        first.as_str().trim()
    };

    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err("response JSON is not an object".to_string()),
        Err(e) => Err(format!("response is not valid JSON: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_final_answer() {
        let parsed = parse_response(r#"{"thought": "easy", "final_answer": "42"}"#);
        assert_eq!(
            parsed,
            ParsedResponse::FinalAnswer {
                thought: Some("easy".to_string()),
                answer: "42".to_string()
            }
        );
    }

    #[test]
    fn test_action_call_in_fence() {
        let text = "Let me check.\n```json\n{\"action\": \"weather\", \"params\": {\"city\": \"Paris\"}}\n```";
        match parse_response(text) {
            ParsedResponse::ActionCall { thought, call } => {
                assert!(thought.is_none());
                assert_eq!(call.name, "weather");
                assert_eq!(call.arguments, json!({"city": "Paris"}));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_arguments_alias_and_missing_params() {
        match parse_response(r#"{"action": "time", "arguments": {"tz": "UTC"}}"#) {
            ParsedResponse::ActionCall { call, .. } => assert_eq!(call.arguments, json!({"tz": "UTC"})),
            other => panic!("unexpected {:?}", other),
        }
        match parse_response(r#"{"action": "time"}"#) {
            ParsedResponse::ActionCall { call, .. } => assert_eq!(call.arguments, json!({})),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ambiguous_and_unrecognized() {
        let both = r#"{"action": "time", "final_answer": "noon"}"#;
        assert!(matches!(parse_response(both), ParsedResponse::Unparsable { reason } if reason.contains("both")));

        let neither = r#"{"thought": "hmm"}"#;
        assert!(matches!(parse_response(neither), ParsedResponse::Unparsable { reason } if reason.contains("neither")));

        for text in [
            "",
            "just prose",
            "{not json",
            "[1, 2]",
            r#"{"action": 7}"#,
            r#"{"action": "  "}"#,
            r#"{"action": "x", "params": [1]}"#,
            r#"{"final_answer": {"text": "hi"}}"#,
            "```json\n{\"final_answer\": \"a\"}\n```\n```json\n{\"final_answer\": \"b\"}\n```",
        ] {
            assert!(
                matches!(parse_response(text), ParsedResponse::Unparsable { .. }),
                "accepted {:?}",
                text
            );
        }
    }

    #[test]
    fn test_null_fields_are_absent() {
        let parsed = parse_response(r#"{"action": null, "final_answer": "done", "thought": null}"#);
        assert_eq!(
            parsed,
            ParsedResponse::FinalAnswer {
                thought: None,
                answer: "done".to_string()
            }
        );
    }
}
