use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::preview::Framework;

use super::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// One role-tagged entry in a session's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// An approvable breakdown of a generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// The request text that produced this plan
    pub request: String,
    /// Full plan text as returned by the planner
    pub text: String,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    /// Ordered implementation steps
    pub steps: Vec<String>,
    #[serde(default)]
    pub approved: bool,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn is_pending(&self) -> bool {
        !self.approved
    }

    /// Short summary handed to every coding step.
    pub fn summary(&self) -> String {
        let mut out = format!("Request: {}", self.request);
        if !self.components.is_empty() {
            out.push_str(&format!("\nComponents: {}", self.components.join(", ")));
        }
        if !self.files.is_empty() {
            out.push_str(&format!("\nFiles: {}", self.files.join(", ")));
        }
        out
    }
}

/// Persisted state of one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub framework: Option<Framework>,
    #[serde(default)]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub history: Vec<Message>,
}

impl Session {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }
}
