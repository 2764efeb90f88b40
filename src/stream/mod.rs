use serde::Deserialize;
use serde_json::Value;

use crate::generation::ToolCall;

/// Events from Claude CLI's stream-json output format
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    /// Tool results echoed back to the model; nothing in them is needed.
    #[serde(rename = "user")]
    User,

    #[serde(rename = "result")]
    Result {
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(rename = "system")]
    System { subtype: String },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// Something worth forwarding while a response is still streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    Text(String),
    Tool(ToolCall),
}

/// Folds stream-json lines into the final response.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    tool_calls: Vec<ToolCall>,
    result: Option<String>,
    error: Option<String>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one output line. Lines that are not stream events are ignored.
    pub fn push_line(&mut self, line: &str) -> Vec<StreamUpdate> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<StreamEvent>(line) {
            Ok(event) => self.push_event(event),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_event(&mut self, event: StreamEvent) -> Vec<StreamUpdate> {
        let mut updates = Vec::new();
        match event {
            StreamEvent::Assistant { message, .. } => {
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            if !self.text.is_empty() && !self.text.ends_with('\n') {
                                self.text.push('\n');
                            }
                            self.text.push_str(&text);
                            updates.push(StreamUpdate::Text(text));
                        }
                        ContentBlock::ToolUse { name, input, .. } => {
                            let call = ToolCall { name, input };
                            self.tool_calls.push(call.clone());
                            updates.push(StreamUpdate::Tool(call));
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            StreamEvent::Result {
                result, is_error, ..
            } => {
                if is_error {
                    self.error = Some(result.unwrap_or_else(|| "unknown provider error".into()));
                } else {
                    self.result = result;
                }
            }
            StreamEvent::User | StreamEvent::System { .. } => {}
        }
        updates
    }

    /// Error text reported by the terminal `result` event, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Response text and tool calls. The `result` summary is used when no
    /// assistant text was streamed.
    pub fn finish(self) -> (String, Vec<ToolCall>) {
        let text = if self.text.trim().is_empty() {
            self.result.unwrap_or_default()
        } else {
            self.text
        };
        (text, self.tool_calls)
    }
}
