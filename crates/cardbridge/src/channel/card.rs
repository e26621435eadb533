use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde_json::{Value, json};

use crate::stream::{PendingQuestion, Snapshot, TaskStatus, ToolCall, ToolCallStatus};
use crate::util::truncate_with_ellipsis;

/// Card body ceiling for the response text.
const RESPONSE_MAX_BYTES: usize = 8000;

/// Longest prompt echoed back at the top of a card.
const PROMPT_MAX_BYTES: usize = 300;

/// Turns a snapshot into the platform's serialized card content.
pub trait Renderer: Send + Sync {
    fn render(&self, snapshot: &Snapshot) -> String;
}

/// Default renderer producing a JSON card: header, prompt, tool list,
/// response body, pending question and a cost/duration footer.
#[derive(Debug, Clone, Copy, Default)]
pub struct CardRenderer;

impl Renderer for CardRenderer {
    fn render(&self, snapshot: &Snapshot) -> String {
        let (title, template) = header(snapshot.status);
        let mut elements = vec![json!({
            "tag": "prompt",
            "text": truncate_with_ellipsis(&snapshot.original_prompt, PROMPT_MAX_BYTES),
        })];

        if !snapshot.tool_calls.is_empty() {
            elements.push(json!({
                "tag": "tools",
                "items": snapshot.tool_calls.iter().map(tool_item).collect::<Vec<_>>(),
            }));
        }

        if !snapshot.response_text.is_empty() {
            elements.push(json!({
                "tag": "markdown",
                "content": truncate_with_ellipsis(&snapshot.response_text, RESPONSE_MAX_BYTES),
            }));
        }

        if let Some(question) = &snapshot.pending_question {
            elements.push(question_element(question));
        }

        if let Some(message) = &snapshot.error_message {
            elements.push(json!({"tag": "error", "content": message}));
        }

        if let Some(footer) = footer(snapshot) {
            elements.push(json!({"tag": "note", "content": footer}));
        }

        json!({
            "header": {"title": title, "template": template},
            "status": snapshot.status,
            "elements": elements,
        })
        .to_string()
    }
}

fn header(status: TaskStatus) -> (&'static str, &'static str) {
    match status {
        TaskStatus::Thinking => ("Thinking…", "blue"),
        TaskStatus::Running => ("Working…", "indigo"),
        TaskStatus::WaitingForInput => ("Waiting for your answer", "orange"),
        TaskStatus::Complete => ("Done", "green"),
        TaskStatus::Error => ("Failed", "red"),
    }
}

fn tool_item(call: &ToolCall) -> Value {
    let marker = match call.status {
        ToolCallStatus::Running => "⏳",
        ToolCallStatus::Done => "✓",
    };
    json!({
        "marker": marker,
        "name": call.name,
        "detail": call.detail,
        "status": call.status,
    })
}

fn question_element(pending: &PendingQuestion) -> Value {
    let questions: Vec<Value> = pending
        .questions
        .iter()
        .map(|q| {
            json!({
                "header": q.header,
                "question": q.question,
                "multi_select": q.multi_select,
                "options": q.options.iter().map(|o| json!({
                    "label": o.label,
                    "description": o.description,
                })).collect::<Vec<_>>(),
            })
        })
        .collect();
    json!({
        "tag": "question",
        "hint": "Reply with your answer to continue.",
        "questions": questions,
    })
}

fn footer(snapshot: &Snapshot) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(cost) = snapshot.cost_usd {
        parts.push(format!("${cost:.4}"));
    }
    if let Some(ms) = snapshot.duration_ms {
        parts.push(format!("{:.1}s", ms as f64 / 1000.0));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" · "))
    }
}

/// Fingerprint of rendered content, used to skip identical frames.
pub fn content_hash(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}
