//! Turns decoded agent output objects into short display lines.
//!
//! Classification is an ordered list of rules. The first rule whose
//! predicate accepts an object summarizes it; objects no rule claims get the
//! generic `label: message` rendering.

use serde_json::{Map, Value};
use tracing::trace;

type Object = Map<String, Value>;

/// One entry in the classifier table
pub struct Rule {
    pub name: &'static str,
    /// Receives the object and its normalized `type`/`event`/`kind` value
    pub matches: fn(&Object, Option<&str>) -> bool,
    pub summarize: fn(&Object, Option<&str>) -> Vec<String>,
}

pub struct EventClassifier {
    rules: Vec<Rule>,
}

impl Default for EventClassifier {
    fn default() -> Self {
        Self { rules: Vec::new() }
            .with_rule(Rule {
                name: "lifecycle",
                matches: |_, kind| matches!(kind, Some("thread.started" | "turn.started")),
                summarize: |_, kind| vec![format_event_line(kind.unwrap_or_default(), None, ": ")],
            })
            .with_rule(Rule {
                name: "turn_completed",
                matches: |_, kind| kind == Some("turn.completed"),
                summarize: |obj, _| {
                    let usage = obj.get("usage").and_then(summarize_usage);
                    vec![format_event_line("turn.completed", usage.as_deref(), "  ")]
                },
            })
            .with_rule(Rule {
                name: "item_completed",
                matches: |obj, kind| {
                    kind == Some("item.completed") && obj.get("item").is_some_and(Value::is_object)
                },
                summarize: |obj, _| match obj.get("item").and_then(Value::as_object) {
                    Some(item) => summarize_item(item),
                    None => Vec::new(),
                },
            })
    }
}

impl EventClassifier {
    /// Append a rule; earlier rules take precedence
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn summarize(&self, payload: &Value) -> Vec<String> {
        let obj = match payload.as_object() {
            Some(obj) => obj,
            None => return vec![compact(payload)],
        };

        let event_type = ["type", "event", "kind"]
            .iter()
            .find_map(|key| stringify_value(obj.get(*key)?));
        let normalized = event_type.as_deref().map(|t| t.trim().to_lowercase());

        if let Some(rule) = self
            .rules
            .iter()
            .find(|rule| (rule.matches)(obj, normalized.as_deref()))
        {
            trace!(rule = rule.name, "classified event");
            let lines = (rule.summarize)(obj, normalized.as_deref());
            if !lines.is_empty() {
                return lines;
            }
        }

        let mut lines: Vec<String> = match extract_message(obj) {
            Some(message) => message.lines().map(str::to_string).collect(),
            None => vec![compact(payload)],
        };
        if lines.is_empty() {
            lines.push(String::new());
        }
        if let Some(event_type) = event_type {
            lines[0] = format_event_line(&event_type, Some(&lines[0]), ": ");
        }
        lines
    }
}

fn summarize_item(item: &Object) -> Vec<String> {
    let item_type = ["type", "kind", "role"]
        .iter()
        .find_map(|key| stringify_value(item.get(*key)?));
    let message = ["text", "content", "message"]
        .iter()
        .find_map(|key| stringify_value(item.get(*key)?))
        .or_else(|| extract_message(item));

    let raw_label = item_type.unwrap_or_else(|| "item".to_string()).trim().to_lowercase();
    let label = match raw_label.as_str() {
        "assistant" | "assistant_message" | "agent_message" | "message" | "output_text" => "message",
        "reasoning" | "thought" => "reasoning",
        "tool" | "tool_call" | "tool_use" => "tool",
        other => other,
    };
    vec![format_event_line(label, message.as_deref(), ": ")]
}

/// `<emoji> <label><separator><message>`
pub fn format_event_line(label: &str, message: Option<&str>, separator: &str) -> String {
    let title = match event_emoji(label) {
        Some(emoji) => format!("{} {}", emoji, label),
        None => label.to_string(),
    };
    match message {
        Some(message) if !message.is_empty() => format!("{}{}{}", title, separator, message),
        _ => title,
    }
}

pub fn event_emoji(label: &str) -> Option<&'static str> {
    let emoji = match label.trim().to_lowercase().as_str() {
        "thread.started" => "🧵",
        "turn.started" => "▶️",
        "turn.completed" | "done" => "✅",
        "thinking" | "thought" | "reasoning" => "🧠",
        "tool" | "tool_use" | "tool_call" => "🛠",
        "command" | "cmd" | "input" => "⌨️",
        "output" | "text" | "message" | "agent_message" | "content" => "💬",
        "error" | "warning" => "⚠️",
        "system" => "📌",
        _ => return None,
    };
    Some(emoji)
}

/// Label of a rendered event line, used for coloring
pub fn line_label(line: &str) -> Option<String> {
    let stripped = line.trim();
    if stripped.is_empty() {
        return None;
    }
    if stripped.starts_with("raw:") {
        return Some("raw".to_string());
    }
    let head = stripped.split(':').next().unwrap_or(stripped).trim();
    let label = head.split_whitespace().last().unwrap_or(head);
    if label.is_empty() {
        None
    } else {
        Some(label.to_lowercase())
    }
}

fn summarize_usage(usage: &Value) -> Option<String> {
    let usage = usage.as_object()?;
    let int = |key: &str| {
        usage.get(key).and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        })
    };
    let parts: Vec<String> = [
        ("in", int("input_tokens")),
        (
            "cached",
            int("cached_input_tokens").or_else(|| int("cache_input_tokens")),
        ),
        ("out", int("output_tokens")),
    ]
    .into_iter()
    .filter_map(|(name, value)| value.map(|v| format!("{} {}", name, v)))
    .collect();

    if parts.is_empty() {
        None
    } else {
        Some(format!("📊 {}", parts.join(" / ")))
    }
}

fn extract_message(obj: &Object) -> Option<String> {
    for key in ["message", "content", "text", "delta", "output", "data"] {
        if let Some(found) = obj.get(key).and_then(stringify_value) {
            return Some(found);
        }
    }

    const CHOICE_PATHS: &[&[&str]] = &[
        &["delta", "content"],
        &["message", "content"],
        &["message"],
        &["delta"],
        &["text"],
    ];
    let choices = obj.get("choices")?.as_array()?;
    choices
        .iter()
        .filter_map(Value::as_object)
        .find_map(|choice| {
            CHOICE_PATHS.iter().find_map(|path| {
                let (first, rest) = path.split_first()?;
                let mut current = choice.get(*first)?;
                for key in rest {
                    current = current.get(*key)?;
                }
                stringify_value(current)
            })
        })
}

/// Render any JSON value as display text; empty results read as absent
fn stringify_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(stringify_value).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(" "))
            }
        }
        Value::Object(map) => ["text", "content", "message"]
            .iter()
            .find_map(|key| map.get(*key).and_then(stringify_value))
            .or_else(|| Some(compact(value))),
        other => Some(other.to_string()),
    }
}

fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn summarize(value: Value) -> Vec<String> {
        EventClassifier::default().summarize(&value)
    }

    #[test]
    fn test_lifecycle_markers() {
        assert_eq!(summarize(json!({"type": "thread.started", "thread_id": "t1"})), vec!["🧵 thread.started"]);
        assert_eq!(summarize(json!({"type": "Turn.Started"})), vec!["▶️ turn.started"]);
    }

    #[test]
    fn test_turn_completed_usage() {
        let lines = summarize(json!({
            "type": "turn.completed",
            "usage": {"input_tokens": 120, "cached_input_tokens": "40", "output_tokens": 7}
        }));
        assert_eq!(lines, vec!["✅ turn.completed  📊 in 120 / cached 40 / out 7"]);

        let lines = summarize(json!({"type": "turn.completed"}));
        assert_eq!(lines, vec!["✅ turn.completed"]);
    }

    #[test]
    fn test_item_completed_labels() {
        let lines = summarize(json!({
            "type": "item.completed",
            "item": {"type": "agent_message", "text": "All tests pass"}
        }));
        assert_eq!(lines, vec!["💬 message: All tests pass"]);

        let lines = summarize(json!({
            "type": "item.completed",
            "item": {"type": "reasoning", "content": [{"text": "thinking"}, {"text": "hard"}]}
        }));
        assert_eq!(lines, vec!["🧠 reasoning: thinking hard"]);

        let lines = summarize(json!({"type": "item.completed", "item": {"id": 4}}));
        assert_eq!(lines, vec!["item"]);
    }

    #[test]
    fn test_generic_message_with_type_prefix() {
        let lines = summarize(json!({"type": "output", "content": "line one\nline two"}));
        assert_eq!(lines, vec!["💬 output: line one", "line two"]);
    }

    #[test]
    fn test_openai_style_choices() {
        let lines = summarize(json!({"choices": [{"delta": {"content": "partial"}}]}));
        assert_eq!(lines, vec!["partial"]);
    }

    #[test]
    fn test_fallback_compact_json() {
        let lines = summarize(json!({"kind": "status", "code": 3}));
        assert_eq!(lines, vec![r#"status: {"code":3,"kind":"status"}"#]);
        assert_eq!(summarize(json!([1, 2])), vec!["[1,2]"]);
    }

    #[test]
    fn test_custom_rule_takes_effect() {
        let classifier = EventClassifier::default().with_rule(Rule {
            name: "heartbeat",
            matches: |_, kind| kind == Some("heartbeat"),
            summarize: |_, _| vec!["♥".to_string()],
        });
        assert_eq!(classifier.summarize(&json!({"type": "heartbeat"})), vec!["♥"]);
        assert_eq!(
            classifier.summarize(&json!({"type": "turn.started"})),
            EventClassifier::default().summarize(&json!({"type": "turn.started"}))
        );
    }

    #[test]
    fn test_line_label() {
        assert_eq!(line_label("🧠 reasoning: hmm").as_deref(), Some("reasoning"));
        assert_eq!(line_label("raw: plain text").as_deref(), Some("raw"));
        assert_eq!(line_label("   "), None);
    }
}
