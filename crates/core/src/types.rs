use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for a node within a workflow definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Branch feeding an aggregator, identified by the upstream node that delivered it
pub type BranchId = NodeId;

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    WaitingApproval,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::WaitingApproval => "waiting_approval",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Human decision on a gated run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    #[serde(alias = "approve")]
    Approved,
    #[serde(alias = "reject")]
    Rejected,
}

impl Verdict {
    /// Every verdict a gate can produce
    pub const ALL: [Verdict; 2] = [Verdict::Approved, Verdict::Rejected];
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Approved => f.write_str("APPROVED"),
            Verdict::Rejected => f.write_str("REJECTED"),
        }
    }
}

/// Label reported when a run finishes at a terminal node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Approved,
    Rejected,
    Completed,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Approved => "APPROVED",
            Outcome::Rejected => "REJECTED",
            Outcome::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}

/// Payload passed along an edge. The engine only inspects `Decision` when routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Message {
    Text(String),
    Json(serde_json::Value),
    /// Fan-in result, ordered by branch id
    Merged(BTreeMap<BranchId, Message>),
    Decision(Decision),
    Artifact(Artifact),
}

impl Message {
    pub fn text(content: impl Into<String>) -> Self {
        Message::Text(content.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_decision(&self) -> Option<&Decision> {
        match self {
            Message::Decision(d) => Some(d),
            _ => None,
        }
    }

    /// Short name of the variant, used in logs and routing errors
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Text(_) => "text",
            Message::Json(_) => "json",
            Message::Merged(_) => "merged",
            Message::Decision(_) => "decision",
            Message::Artifact(_) => "artifact",
        }
    }

    /// Human-readable rendering of the payload
    pub fn render(&self) -> String {
        match self {
            Message::Text(s) => s.clone(),
            Message::Json(v) => serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string()),
            Message::Merged(branches) => branches
                .iter()
                .map(|(branch, msg)| format!("## {}\n\n{}", branch, msg.render()))
                .collect::<Vec<_>>()
                .join("\n\n"),
            Message::Decision(d) => d.to_string(),
            Message::Artifact(a) => a.content.clone(),
        }
    }
}

/// Gate output constructed from a human response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub feedback: Option<String>,
    /// The message that was put up for approval
    pub subject: Box<Message>,
    pub decided_at: DateTime<Utc>,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Decision: {}", self.verdict)?;
        if let Some(feedback) = &self.feedback {
            write!(f, " - {}", feedback)?;
        }
        Ok(())
    }
}

/// Text artifact produced by a report task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Final artifact and outcome of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalResult {
    pub node: NodeId,
    pub outcome: Outcome,
    pub artifact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl TerminalResult {
    pub(crate) fn from_output(node: NodeId, outcome: Outcome, output: &Message) -> Self {
        let (artifact, filename) = match output {
            Message::Artifact(a) => (a.content.clone(), a.filename.clone()),
            other => (other.render(), None),
        };
        Self {
            node,
            outcome,
            artifact,
            filename,
        }
    }
}
