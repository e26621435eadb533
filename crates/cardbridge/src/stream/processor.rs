use std::path::PathBuf;

use serde_json::Value;

use crate::agent::events::{
    AgentEvent, BlockDelta, ContentBlock, MessageEvent, ResultEvent, StreamDelta,
};
use crate::util::{single_line, truncate_with_ellipsis};

use super::images::has_image_extension;
use super::snapshot::{
    PendingQuestion, Question, Snapshot, TaskStatus, ToolCall, ToolCallStatus, derive_status,
};

/// Tool the agent uses to ask the user a structured question.
pub const QUESTION_TOOL: &str = "AskUserQuestion";

/// Tool whose `file_path` input is tracked for image output.
const WRITE_TOOL: &str = "Write";

/// Longest tool detail shown on a card.
const TOOL_DETAIL_MAX_BYTES: usize = 120;

#[derive(Debug, Clone)]
struct Outcome {
    status: TaskStatus,
    error_message: Option<String>,
}

/// Folds agent events into a [`Snapshot`], one event at a time.
///
/// Holds no I/O: the same event sequence always produces the same snapshot.
#[derive(Debug, Clone)]
pub struct StreamProcessor {
    prompt: String,
    session_id: Option<String>,
    response_text: String,
    tool_calls: Vec<ToolCall>,
    open_tool: Option<usize>,
    pending_question: Option<PendingQuestion>,
    outcome: Option<Outcome>,
    cost_usd: Option<f64>,
    duration_ms: Option<u64>,
    image_paths: Vec<PathBuf>,
}

impl StreamProcessor {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            session_id: None,
            response_text: String::new(),
            tool_calls: Vec::new(),
            open_tool: None,
            pending_question: None,
            outcome: None,
            cost_usd: None,
            duration_ms: None,
            image_paths: Vec::new(),
        }
    }

    /// Apply one event and return the resulting snapshot.
    pub fn process_event(&mut self, event: &AgentEvent) -> Snapshot {
        if self.session_id.is_none()
            && let Some(id) = event.session_id()
        {
            self.session_id = Some(id.to_string());
        }

        if self.outcome.is_some() {
            return self.snapshot();
        }

        match event {
            AgentEvent::System { .. } | AgentEvent::Unknown => {}
            AgentEvent::Assistant(msg) => self.apply_message(msg, true),
            AgentEvent::User(msg) => self.apply_message(msg, false),
            AgentEvent::StreamEvent {
                event,
                parent_tool_use_id: None,
                ..
            } => self.apply_delta(event),
            AgentEvent::StreamEvent { .. } => {}
            AgentEvent::Result(result) => self.apply_result(result),
        }
        self.snapshot()
    }

    /// Current state, with status derived fresh from the accumulated fields.
    pub fn snapshot(&self) -> Snapshot {
        let (status, error_message) = match &self.outcome {
            Some(outcome) => (outcome.status, outcome.error_message.clone()),
            None => (
                derive_status(
                    self.pending_question.is_some(),
                    &self.tool_calls,
                    &self.response_text,
                ),
                None,
            ),
        };
        Snapshot {
            status,
            original_prompt: self.prompt.clone(),
            response_text: self.response_text.clone(),
            tool_calls: self.tool_calls.clone(),
            pending_question: self.pending_question.clone(),
            cost_usd: self.cost_usd,
            duration_ms: self.duration_ms,
            error_message,
        }
    }

    /// First backend session id seen in the stream.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Absolute image paths the agent wrote with the file-write tool.
    pub fn image_paths(&self) -> &[PathBuf] {
        &self.image_paths
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    /// Settle a stream that ended without a result event as complete.
    pub fn finish(&mut self) -> Snapshot {
        if self.outcome.is_none() {
            self.close_all_tools();
            self.pending_question = None;
            self.outcome = Some(Outcome {
                status: TaskStatus::Complete,
                error_message: None,
            });
        }
        self.snapshot()
    }

    /// Settle the run as failed, keeping whatever progress was shown.
    ///
    /// Used for backend errors, user stops and timeouts. A run that already
    /// reached a terminal event keeps its outcome.
    pub fn finish_with_error(&mut self, message: impl Into<String>) -> Snapshot {
        if self.outcome.is_none() {
            self.close_all_tools();
            self.pending_question = None;
            self.outcome = Some(Outcome {
                status: TaskStatus::Error,
                error_message: Some(message.into()),
            });
        }
        self.snapshot()
    }

    fn apply_message(&mut self, msg: &MessageEvent, from_assistant: bool) {
        // Whole messages are cumulative: the latest top-level text wins.
        if from_assistant
            && msg.is_top_level()
            && let Some(text) = msg.message.content.text()
            && !text.is_empty()
        {
            self.response_text = text;
        }

        for block in msg.message.content.blocks() {
            match block {
                ContentBlock::ToolUse { id, name, input } => self.on_tool_use(id, name, input),
                ContentBlock::ToolResult { tool_use_id, .. } => self.on_tool_result(tool_use_id),
                _ => {}
            }
        }
    }

    fn apply_delta(&mut self, delta: &StreamDelta) {
        match delta {
            StreamDelta::ContentBlockStart {
                content_block: ContentBlock::ToolUse { id, name, .. },
                ..
            } => {
                if name != QUESTION_TOOL && self.find_tool(id).is_none() {
                    self.open_tool_entry(Some(id.clone()), name.clone(), None);
                }
            }
            StreamDelta::ContentBlockStart {
                content_block: ContentBlock::Text { text },
                ..
            } => self.response_text.push_str(text),
            StreamDelta::ContentBlockDelta {
                delta: BlockDelta::TextDelta { text },
                ..
            } => self.response_text.push_str(text),
            // Block stops are not completion signals; message events close tools.
            _ => {}
        }
    }

    fn apply_result(&mut self, result: &ResultEvent) {
        self.cost_usd = result.total_cost_usd;
        self.duration_ms = result.duration_ms;
        self.close_all_tools();
        self.pending_question = None;

        if let Some(text) = &result.result
            && !text.is_empty()
        {
            self.response_text = text.clone();
        }

        self.outcome = Some(if result.is_success() {
            Outcome {
                status: TaskStatus::Complete,
                error_message: None,
            }
        } else {
            let message = if result.errors.is_empty() {
                format!("ended with {}", result.subtype)
            } else {
                result.errors.join("; ")
            };
            Outcome {
                status: TaskStatus::Error,
                error_message: Some(message),
            }
        });
    }

    fn on_tool_use(&mut self, id: &str, name: &str, input: &Value) {
        if name == QUESTION_TOOL {
            self.open_question(id, input);
            return;
        }

        if name == WRITE_TOOL
            && let Some(path) = input.get("file_path").and_then(Value::as_str)
        {
            let path = PathBuf::from(path);
            if path.is_absolute() && has_image_extension(&path) && !self.image_paths.contains(&path)
            {
                self.image_paths.push(path);
            }
        }

        let detail = describe_tool_input(name, input);
        match self.find_tool(id) {
            // Opened earlier by a streamed block start; fill in what we now know.
            Some(idx) => {
                if self.tool_calls[idx].detail.is_none() {
                    self.tool_calls[idx].detail = detail;
                }
            }
            None => self.open_tool_entry(Some(id.to_string()), name.to_string(), detail),
        }
    }

    fn on_tool_result(&mut self, tool_use_id: &str) {
        if self
            .pending_question
            .as_ref()
            .is_some_and(|q| q.tool_use_id == tool_use_id)
        {
            self.pending_question = None;
            return;
        }

        match self.find_tool(tool_use_id) {
            Some(idx) => self.close_tool(idx),
            None => {
                if let Some(idx) = self.open_tool {
                    self.close_tool(idx);
                }
            }
        }
    }

    fn open_question(&mut self, id: &str, input: &Value) {
        let questions = match input.get("questions") {
            Some(value) => match serde_json::from_value::<Vec<Question>>(value.clone()) {
                Ok(questions) => questions,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed question tool input");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        self.pending_question = Some(PendingQuestion {
            tool_use_id: id.to_string(),
            questions,
        });
    }

    fn open_tool_entry(&mut self, id: Option<String>, name: String, detail: Option<String>) {
        if let Some(idx) = self.open_tool {
            self.close_tool(idx);
        }
        self.tool_calls.push(ToolCall {
            id,
            name,
            detail,
            status: ToolCallStatus::Running,
        });
        self.open_tool = Some(self.tool_calls.len() - 1);
    }

    fn close_tool(&mut self, idx: usize) {
        if let Some(call) = self.tool_calls.get_mut(idx) {
            call.status = ToolCallStatus::Done;
        }
        if self.open_tool == Some(idx) {
            self.open_tool = None;
        }
    }

    fn close_all_tools(&mut self) {
        for call in &mut self.tool_calls {
            call.status = ToolCallStatus::Done;
        }
        self.open_tool = None;
    }

    fn find_tool(&self, id: &str) -> Option<usize> {
        self.tool_calls
            .iter()
            .position(|call| call.id.as_deref() == Some(id))
    }
}

/// One-line summary of a tool's input for display.
pub fn describe_tool_input(name: &str, input: &Value) -> Option<String> {
    let key = match name {
        "Bash" => Some("command"),
        "Read" | "Write" | "Edit" | "MultiEdit" => Some("file_path"),
        "NotebookEdit" => Some("notebook_path"),
        "Grep" | "Glob" => Some("pattern"),
        "WebFetch" => Some("url"),
        "WebSearch" => Some("query"),
        "Task" => Some("description"),
        _ => None,
    };

    let text = match key.and_then(|k| input.get(k)).and_then(Value::as_str) {
        Some(text) => text.to_string(),
        None => match input {
            Value::Null => return None,
            Value::Object(map) if map.is_empty() => return None,
            other => other.to_string(),
        },
    };

    let text = single_line(&text);
    if text.is_empty() {
        return None;
    }
    Some(truncate_with_ellipsis(&text, TOOL_DETAIL_MAX_BYTES))
}
