//! Folding the agent's event stream into render-ready snapshots.

pub mod images;
pub mod processor;
pub mod snapshot;

pub use images::{extract_image_paths, has_image_extension};
pub use processor::{QUESTION_TOOL, StreamProcessor, describe_tool_input};
pub use snapshot::{
    PendingQuestion, Question, QuestionOption, Snapshot, TaskStatus, ToolCall, ToolCallStatus,
};
