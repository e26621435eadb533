use serde::{Deserialize, Serialize};

/// One line of the agent's `stream-json` output.
///
/// Variants are discriminated by the `type` field. Anything the bridge does
/// not understand lands in [`AgentEvent::Unknown`] and is ignored by the fold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Session bookkeeping. `init` is the first event of every run.
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// A complete assistant message (cumulative, not a delta).
    Assistant(MessageEvent),

    /// A user-role message, which is how tool results come back.
    User(MessageEvent),

    /// Raw streaming delta from the model API.
    StreamEvent {
        event: StreamDelta,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Terminal event. Always the last one of a finished run.
    Result(ResultEvent),

    #[serde(other)]
    Unknown,
}

impl AgentEvent {
    /// The backend session this event belongs to, if it says.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            AgentEvent::System { session_id, .. } | AgentEvent::StreamEvent { session_id, .. } => {
                session_id.as_deref()
            }
            AgentEvent::Assistant(m) | AgentEvent::User(m) => m.session_id.as_deref(),
            AgentEvent::Result(r) => r.session_id.as_deref(),
            AgentEvent::Unknown => None,
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, AgentEvent::Result(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub message: MessageBody,
    /// Set when the message belongs to a sub-agent spawned by a tool call.
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl MessageEvent {
    pub fn is_top_level(&self) -> bool {
        self.parent_tool_use_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub content: MessageContent,
}

/// Message content is either a bare string or a list of typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Blocks(Vec::new())
    }
}

impl MessageContent {
    /// Concatenated text of all text blocks. `None` when there are none.
    pub fn text(&self) -> Option<String> {
        match self {
            MessageContent::Text(t) => Some(t.clone()),
            MessageContent::Blocks(blocks) => {
                let parts: Vec<&str> = blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.concat())
                }
            }
        }
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        match self {
            MessageContent::Text(_) => &[],
            MessageContent::Blocks(blocks) => blocks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

/// Inner event of a `stream_event` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamDelta {
    ContentBlockStart {
        #[serde(default)]
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        #[serde(default)]
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        #[serde(default)]
        index: usize,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        #[serde(default)]
        partial_json: String,
    },
    ThinkingDelta {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    /// `"success"` or an error subtype such as `"error_max_turns"`.
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    /// Authoritative final answer text.
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ResultEvent {
    pub fn is_success(&self) -> bool {
        self.subtype == "success" && !self.is_error
    }
}
