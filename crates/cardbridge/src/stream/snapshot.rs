use serde::{Deserialize, Serialize};

/// Where a task stands, as shown on its card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Thinking,
    Running,
    WaitingForInput,
    Complete,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Running,
    Done,
}

/// One tool invocation as displayed on the card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Backend invocation id, used to correlate results. Not rendered.
    #[serde(skip)]
    pub id: Option<String>,
    pub name: String,
    /// Short human summary of the input (command, path, pattern...).
    pub detail: Option<String>,
    pub status: ToolCallStatus,
}

/// A structured question the agent is waiting on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingQuestion {
    /// Invocation id of the question tool, so the answer can be correlated.
    pub tool_use_id: String,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub question: String,
    #[serde(default)]
    pub header: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default, rename = "multiSelect", alias = "multiple")]
    pub multi_select: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default)]
    pub description: String,
}

/// Render-ready state of one task at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub status: TaskStatus,
    pub original_prompt: String,
    pub response_text: String,
    pub tool_calls: Vec<ToolCall>,
    pub pending_question: Option<PendingQuestion>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
}

impl Snapshot {
    /// The card shown before the agent has produced anything.
    pub fn thinking(prompt: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Thinking,
            original_prompt: prompt.into(),
            response_text: String::new(),
            tool_calls: Vec::new(),
            pending_question: None,
            cost_usd: None,
            duration_ms: None,
            error_message: None,
        }
    }
}

/// Status for a run that has not reached a terminal event.
///
/// A pending question wins; otherwise any visible progress (a tool call, open
/// or finished, or response text) means running.
pub fn derive_status(
    pending_question: bool,
    tool_calls: &[ToolCall],
    response_text: &str,
) -> TaskStatus {
    if pending_question {
        TaskStatus::WaitingForInput
    } else if !tool_calls.is_empty() || !response_text.is_empty() {
        TaskStatus::Running
    } else {
        TaskStatus::Thinking
    }
}
