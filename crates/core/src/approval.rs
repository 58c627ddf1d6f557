use crate::types::{Message, Verdict};
use serde::{Deserialize, Serialize};

const APPROVE_WORDS: &[&str] = &["yes", "y", "approve", "approved"];
const REJECT_WORDS: &[&str] = &["no", "n", "reject", "rejected", "deny", "denied"];

/// Question put to the human approver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub question: String,
    pub context: String,
}

/// Human answer to an approval request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub decision: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl ApprovalResponse {
    pub fn approve() -> Self {
        Self {
            decision: Verdict::Approved,
            feedback: None,
        }
    }

    pub fn reject(feedback: impl Into<String>) -> Self {
        Self {
            decision: Verdict::Rejected,
            feedback: Some(feedback.into()),
        }
    }

    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        let feedback = feedback.into();
        self.feedback = if feedback.trim().is_empty() {
            None
        } else {
            Some(feedback.trim().to_string())
        };
        self
    }

    /// Interpret a free-form decision word.
    ///
    /// Anything that is neither a recognised approval nor a recognised
    /// rejection is treated as a rejection, and the feedback says so.
    pub fn from_decision(decision: &str, feedback: Option<&str>) -> Self {
        let word = decision.trim().to_lowercase();
        let feedback = feedback
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string);

        if APPROVE_WORDS.contains(&word.as_str()) {
            Self {
                decision: Verdict::Approved,
                feedback,
            }
        } else if REJECT_WORDS.contains(&word.as_str()) {
            Self {
                decision: Verdict::Rejected,
                feedback,
            }
        } else {
            tracing::warn!("Unclear approval reply '{}', treating as rejection", decision.trim());
            Self {
                decision: Verdict::Rejected,
                feedback: Some(format!(
                    "Unclear response '{}' interpreted as rejection",
                    decision.trim()
                )),
            }
        }
    }

    /// Parse a reply whose first line is the decision and the rest feedback
    pub fn from_reply(reply: &str) -> Self {
        let mut parts = reply.splitn(2, '\n');
        let decision = parts.next().unwrap_or_default();
        Self::from_decision(decision, parts.next())
    }
}

/// Builds the approval request shown to the human from a gate's input
pub trait ApprovalPrompt: Send + Sync {
    fn request(&self, input: &Message) -> ApprovalRequest;
}

/// Asks a fixed question and passes the rendered input as context
#[derive(Debug, Clone)]
pub struct FixedQuestion {
    pub question: String,
    /// Context longer than this many characters is cut and marked with `...`
    pub max_context: Option<usize>,
}

impl FixedQuestion {
    pub const DEFAULT_MAX_CONTEXT: usize = 2000;

    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            max_context: Some(Self::DEFAULT_MAX_CONTEXT),
        }
    }

    pub fn full_context(mut self) -> Self {
        self.max_context = None;
        self
    }
}

impl Default for FixedQuestion {
    fn default() -> Self {
        Self::new("Should this submission be approved?")
    }
}

impl ApprovalPrompt for FixedQuestion {
    fn request(&self, input: &Message) -> ApprovalRequest {
        let rendered = input.render();
        let context = match self.max_context {
            Some(limit) if rendered.chars().count() > limit => {
                let mut cut: String = rendered.chars().take(limit).collect();
                cut.push_str("...");
                cut
            }
            _ => rendered,
        };

        ApprovalRequest {
            question: self.question.clone(),
            context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_words() {
        assert_eq!(ApprovalResponse::from_reply("yes").decision, Verdict::Approved);
        assert_eq!(ApprovalResponse::from_reply(" Approved ").decision, Verdict::Approved);
        assert_eq!(ApprovalResponse::from_reply("deny").decision, Verdict::Rejected);
        assert_eq!(ApprovalResponse::from_reply("N").decision, Verdict::Rejected);
    }

    #[test]
    fn test_reply_feedback_on_following_lines() {
        let response = ApprovalResponse::from_reply("no\nthe timing is off\nfor this season");
        assert_eq!(response.decision, Verdict::Rejected);
        assert_eq!(
            response.feedback.as_deref(),
            Some("the timing is off\nfor this season")
        );
    }

    #[test]
    fn test_unclear_reply_is_rejection() {
        let response = ApprovalResponse::from_reply("maybe later");
        assert_eq!(response.decision, Verdict::Rejected);
        assert!(response.feedback.unwrap().contains("maybe later"));
    }

    #[test]
    fn test_fixed_question_uses_input_as_context() {
        let request = FixedQuestion::default().request(&Message::text("report body"));
        assert_eq!(request.context, "report body");
    }

    #[test]
    fn test_long_context_is_truncated() {
        let long = "x".repeat(2500);
        let request = FixedQuestion::default().request(&Message::text(long.clone()));
        assert_eq!(request.context.chars().count(), 2003);
        assert!(request.context.ends_with("..."));

        let request = FixedQuestion::default()
            .full_context()
            .request(&Message::text(long.clone()));
        assert_eq!(request.context, long);
    }

    #[test]
    fn test_blank_feedback_is_dropped() {
        let response = ApprovalResponse::approve().with_feedback("   ");
        assert!(response.feedback.is_none());
    }
}
