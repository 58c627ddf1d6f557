use crate::error::ExecutorError;
use crate::events::OutputKind;
use crate::ingest::mentions_any;
use crate::types::Message;
use crate::workflow::{NodeContext, TaskHandler};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Something that can turn an analysis prompt into prose.
///
/// Model-backed implementations live outside the core; `KeywordAnalyst`
/// works offline.
#[async_trait]
pub trait AnalysisAgent: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, prompt: &str, context: &str) -> Result<String, ExecutorError>;
}

/// Viewpoint of one analysis branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Perspective {
    Market,
    Design,
    Production,
}

impl Perspective {
    pub const ALL: [Perspective; 3] = [
        Perspective::Market,
        Perspective::Design,
        Perspective::Production,
    ];

    /// Node id of the branch in the analysis subworkflow
    pub fn node_id(&self) -> &'static str {
        match self {
            Perspective::Market => "market_research",
            Perspective::Design => "design_evaluation",
            Perspective::Production => "production_feasibility",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Perspective::Market => "Market Analysis & Trends",
            Perspective::Design => "Design & Aesthetic Evaluation",
            Perspective::Production => "Production & Manufacturing Assessment",
        }
    }

    pub fn agent_label(&self) -> &'static str {
        match self {
            Perspective::Market => "Market Research",
            Perspective::Design => "Design Evaluation",
            Perspective::Production => "Production Feasibility",
        }
    }

    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            Perspective::Market => &[
                "target",
                "audience",
                "market",
                "customer",
                "demographic",
                "price",
                "competitor",
                "trend",
                "season",
            ],
            Perspective::Design => &["design", "aesthetic", "style", "color", "fabric", "material"],
            Perspective::Production => &[
                "fabric",
                "material",
                "manufacturing",
                "cost",
                "supplier",
                "production",
                "quality",
                "sizes",
                "fit",
            ],
        }
    }

    /// Instructions handed to the agent for this perspective
    pub fn instructions(&self) -> &'static str {
        match self {
            Perspective::Market => {
                "You are a senior market research analyst. Assess trend alignment, target \
                 audience, competitive position, demand indicators, market timing and price \
                 potential. Name concrete risks and recommend positioning."
            }
            Perspective::Design => {
                "You are a senior design director. Assess design innovation, aesthetic appeal, \
                 brand fit, technical feasibility, material choices and versatility. Suggest \
                 refinements."
            }
            Perspective::Production => {
                "You are a production director. Assess manufacturing complexity, cost structure, \
                 material sourcing, quality standards, production volume and timeline. Flag \
                 anything that threatens viable production."
            }
        }
    }
}

impl std::fmt::Display for Perspective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.agent_label())
    }
}

/// Offline analyst that scores keyword signals for one perspective
#[derive(Debug, Clone)]
pub struct KeywordAnalyst {
    perspective: Perspective,
    name: String,
}

impl KeywordAnalyst {
    pub fn new(perspective: Perspective) -> Self {
        Self {
            perspective,
            name: format!("keyword_{}", perspective.node_id()),
        }
    }

    fn assessment(hits: usize, total: usize) -> &'static str {
        match hits * 3 {
            0 => "limited",
            n if n < total => "limited",
            n if n < total * 2 => "moderate",
            _ => "strong",
        }
    }
}

#[async_trait]
impl AnalysisAgent for KeywordAnalyst {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _prompt: &str, context: &str) -> Result<String, ExecutorError> {
        let keywords = self.perspective.keywords();
        let lower = context.to_lowercase();
        let found: Vec<&str> = keywords
            .iter()
            .copied()
            .filter(|k| lower.contains(k))
            .collect();
        let missing: Vec<&str> = keywords
            .iter()
            .copied()
            .filter(|k| !lower.contains(k))
            .collect();

        let evidence: Vec<&str> = context
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && mentions_any(line, keywords))
            .take(5)
            .collect();

        let mut analysis = format!(
            "{} signal: {} ({} of {} indicators present).",
            self.perspective.agent_label(),
            Self::assessment(found.len(), keywords.len()),
            found.len(),
            keywords.len()
        );
        if !found.is_empty() {
            analysis.push_str(&format!("\n\nCovered: {}.", found.join(", ")));
        }
        if !evidence.is_empty() {
            analysis.push_str("\n\nEvidence:");
            for line in evidence {
                analysis.push_str(&format!("\n- {}", line));
            }
        }
        if !missing.is_empty() {
            analysis.push_str(&format!("\n\nNot addressed: {}.", missing.join(", ")));
        }

        Ok(analysis)
    }
}

/// The three agents consulted for every concept
#[derive(Clone)]
pub struct AnalysisPanel {
    pub market: Arc<dyn AnalysisAgent>,
    pub design: Arc<dyn AnalysisAgent>,
    pub production: Arc<dyn AnalysisAgent>,
}

impl AnalysisPanel {
    /// Panel of offline keyword analysts
    pub fn keyword() -> Self {
        Self {
            market: Arc::new(KeywordAnalyst::new(Perspective::Market)),
            design: Arc::new(KeywordAnalyst::new(Perspective::Design)),
            production: Arc::new(KeywordAnalyst::new(Perspective::Production)),
        }
    }

    pub fn agent(&self, perspective: Perspective) -> Arc<dyn AnalysisAgent> {
        match perspective {
            Perspective::Market => self.market.clone(),
            Perspective::Design => self.design.clone(),
            Perspective::Production => self.production.clone(),
        }
    }
}

/// Task node that asks one agent for its analysis of the prompt
pub struct AgentTask {
    perspective: Perspective,
    agent: Arc<dyn AnalysisAgent>,
}

impl AgentTask {
    pub fn new(perspective: Perspective, agent: Arc<dyn AnalysisAgent>) -> Self {
        Self { perspective, agent }
    }
}

#[async_trait]
impl TaskHandler for AgentTask {
    async fn run(&self, input: Message, ctx: &NodeContext) -> Result<Message, ExecutorError> {
        let context = match &input {
            Message::Json(value) => value
                .get("prompt")
                .and_then(|p| p.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| input.render()),
            other => other.render(),
        };

        ctx.emit(
            OutputKind::Info,
            format!("{} agent analyzing concept", self.perspective),
        );
        tracing::debug!(
            "Invoking agent {} for {} on run {}",
            self.agent.name(),
            self.perspective.node_id(),
            ctx.run_id()
        );

        let analysis = self
            .agent
            .invoke(self.perspective.instructions(), &context)
            .await
            .map_err(|e| match e {
                ExecutorError::Agent { .. } => e,
                other => ExecutorError::Agent {
                    agent: self.agent.name().to_string(),
                    message: other.to_string(),
                },
            })?;

        ctx.emit(OutputKind::Text, analysis.clone());
        Ok(Message::text(analysis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keyword_analyst_scores_signals() {
        let analyst = KeywordAnalyst::new(Perspective::Market);
        let context = "Target audience: commuters\nCompetitor pricing is high\nPrice around 90\nLaunch next season";

        let analysis = analyst.invoke("", context).await.unwrap();
        assert!(analysis.starts_with("Market Research signal: moderate (5 of 9 indicators present)."));
        assert!(analysis.contains("- Target audience: commuters"));
        assert!(analysis.contains("Not addressed: market, customer, demographic, trend."));
    }

    #[tokio::test]
    async fn test_keyword_analyst_without_signals() {
        let analyst = KeywordAnalyst::new(Perspective::Production);
        let analysis = analyst.invoke("", "A poem about the sea").await.unwrap();
        assert!(analysis.starts_with("Production Feasibility signal: limited (0 of 9"));
        assert!(!analysis.contains("Evidence"));
    }

    #[test]
    fn test_perspective_node_ids_are_distinct() {
        let mut ids: Vec<&str> = Perspective::ALL.iter().map(|p| p.node_id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }
}
