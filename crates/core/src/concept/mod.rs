//! The concept review workflow.
//!
//! A submitted concept is parsed, prepared for analysis, analysed from three
//! perspectives in parallel (inside a nested workflow), written up as a single
//! report and put in front of a human. Approval produces a development report,
//! rejection a feedback email draft.

pub mod agents;
pub mod report;

pub use agents::{AgentTask, AnalysisAgent, AnalysisPanel, KeywordAnalyst, Perspective};
pub use report::{report_title, ConceptReports};

use crate::approval::FixedQuestion;
use crate::error::{ExecutorError, ValidationError};
use crate::events::OutputKind;
use crate::ingest::{mentions_any, ConceptDocument};
use crate::storage::ArtifactStore;
use crate::types::{Artifact, Message, NodeId, Outcome, Verdict};
use crate::workflow::{
    Condition, Executor, NodeContext, TaskHandler, WorkflowBuilder, WorkflowDefinition,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const CONCEPT_WORKFLOW: &str = "concept_review";
pub const ANALYSIS_WORKFLOW: &str = "concurrent_analysis";
pub const APPROVAL_QUESTION: &str = "Do you approve this concept for development?";

/// Node ids of the concept workflows
pub mod nodes {
    pub const PARSER: &str = "concept_parser";
    pub const ADAPTER: &str = "concept_adapter";
    pub const ANALYSIS: &str = "concept_analysis";
    pub const REPORT: &str = "report_writer";
    pub const GATE: &str = "approval_gate";
    pub const APPROVED: &str = "approved_report";
    pub const REJECTED: &str = "rejection_draft";

    pub const DISPATCH: &str = "analysis_dispatch";
    pub const OVERVIEW: &str = "concept_overview";
    pub const CONSOLIDATOR: &str = "analysis_consolidator";
}

const MAX_OVERVIEW_ELEMENTS: usize = 10;

const MARKET_SIGNALS: &[&str] = &[
    "market", "target", "audience", "customer", "price", "competitor", "trend",
];
const PRODUCTION_SIGNALS: &[&str] = &[
    "production", "manufactur", "cost", "supplier", "material", "fabric", "quality",
];

/// What the analysis branches receive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub title: String,
    pub prompt: String,
    pub elements: Vec<String>,
    pub market_signals: Vec<String>,
    pub production_notes: Vec<String>,
}

impl AnalysisRequest {
    pub fn from_document(document: &ConceptDocument) -> Self {
        let elements: Vec<String> = document
            .concept_elements()
            .into_iter()
            .map(str::to_string)
            .collect();

        let lines_mentioning = |keywords: &[&str]| -> Vec<String> {
            document
                .text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && mentions_any(line, keywords))
                .map(str::to_string)
                .collect()
        };

        let prompt = format!(
            "CONCEPT ANALYSIS REQUEST\n\n\
             Concept: {}\n\
             Elements identified: {}\n\n\
             CONCEPT CONTENT:\n{}\n\n\
             Cover market potential and trend alignment, design innovation and aesthetic appeal, \
             production feasibility and cost, brand fit and competitive differentiation.",
            document.title,
            elements.len(),
            document.text.trim()
        );

        Self {
            title: document.title.clone(),
            prompt,
            market_signals: lines_mentioning(MARKET_SIGNALS),
            production_notes: lines_mentioning(PRODUCTION_SIGNALS),
            elements,
        }
    }

    fn from_message(message: &Message) -> Option<Self> {
        match message {
            Message::Json(value) => serde_json::from_value(value.clone()).ok(),
            _ => None,
        }
    }
}

/// Checks the submission and normalises it to a JSON document
struct ParseConcept;

#[async_trait]
impl TaskHandler for ParseConcept {
    async fn run(&self, input: Message, ctx: &NodeContext) -> Result<Message, ExecutorError> {
        let document = ConceptDocument::from_message(&input)
            .ok_or_else(|| ctx.fail(format!("expected a concept document, got {}", input.kind())))?;
        if document.text.trim().is_empty() {
            return Err(ctx.fail("concept document is empty"));
        }

        let assessment = document.assess();
        if assessment.is_valid {
            ctx.emit(
                OutputKind::Success,
                format!(
                    "Parsed concept '{}' ({} elements, confidence {:.0}%)",
                    document.title,
                    document.structured_elements.len(),
                    assessment.confidence * 100.0
                ),
            );
        } else {
            ctx.emit(
                OutputKind::Warning,
                format!("'{}' may not be a concept pitch", document.title),
            );
        }
        for recommendation in &assessment.recommendations {
            ctx.emit(OutputKind::Warning, recommendation.clone());
        }

        Ok(document.to_message())
    }
}

/// Turns the document into an `AnalysisRequest`
struct PrepareAnalysis;

#[async_trait]
impl TaskHandler for PrepareAnalysis {
    async fn run(&self, input: Message, ctx: &NodeContext) -> Result<Message, ExecutorError> {
        let document = ConceptDocument::from_message(&input)
            .ok_or_else(|| ctx.fail("expected a parsed concept document"))?;
        let request = AnalysisRequest::from_document(&document);

        ctx.emit(
            OutputKind::Info,
            format!(
                "Prepared analysis: {} elements, {} market signals, {} production notes",
                request.elements.len(),
                request.market_signals.len(),
                request.production_notes.len()
            ),
        );

        serde_json::to_value(&request)
            .map(Message::Json)
            .map_err(|e| ctx.fail(format!("failed to encode analysis request: {}", e)))
    }
}

/// Branch that summarises the concept next to the agent analyses
struct ConceptOverview;

#[async_trait]
impl TaskHandler for ConceptOverview {
    async fn run(&self, input: Message, ctx: &NodeContext) -> Result<Message, ExecutorError> {
        let request = AnalysisRequest::from_message(&input)
            .ok_or_else(|| ctx.fail("expected an analysis request"))?;

        let mut overview = format!(
            "**Concept:** {}\n**Elements Identified:** {}\n\n### Key Elements\n",
            request.title,
            request.elements.len()
        );
        if request.elements.is_empty() {
            overview.push_str("- No specific concept elements identified");
        } else {
            let listed = request
                .elements
                .iter()
                .take(MAX_OVERVIEW_ELEMENTS)
                .enumerate()
                .map(|(i, element)| format!("{}. {}", i + 1, element))
                .collect::<Vec<_>>()
                .join("\n");
            overview.push_str(&listed);
        }

        Ok(Message::Json(serde_json::json!({
            "title": request.title,
            "overview": overview,
        })))
    }
}

/// Assembles the merged branch outputs into one markdown report
struct WriteReport;

impl WriteReport {
    fn branch<'a>(
        branches: &'a BTreeMap<NodeId, Message>,
        id: &str,
        ctx: &NodeContext,
    ) -> Result<&'a Message, ExecutorError> {
        branches
            .get(&NodeId::new(id))
            .ok_or_else(|| ctx.fail(format!("missing analysis branch '{}'", id)))
    }
}

#[async_trait]
impl TaskHandler for WriteReport {
    async fn run(&self, input: Message, ctx: &NodeContext) -> Result<Message, ExecutorError> {
        let branches = match input {
            Message::Merged(branches) => branches,
            other => {
                return Err(ctx.fail(format!("expected merged analyses, got {}", other.kind())))
            }
        };

        let overview = match Self::branch(&branches, nodes::OVERVIEW, ctx)? {
            Message::Json(value) => value.clone(),
            other => return Err(ctx.fail(format!("unexpected overview {}", other.kind()))),
        };
        let title = overview["title"].as_str().unwrap_or("Untitled Concept");

        let mut report = format!(
            "# Concept Analysis: {}\n\n## Concept Overview\n\n{}",
            title,
            overview["overview"].as_str().unwrap_or_default()
        );
        for perspective in Perspective::ALL {
            let analysis = Self::branch(&branches, perspective.node_id(), ctx)?;
            report.push_str(&format!(
                "\n\n## {}\n\n{}",
                perspective.title(),
                analysis.render()
            ));
        }

        ctx.emit(
            OutputKind::Success,
            format!("Analysis report generated ({} characters)", report.len()),
        );
        Ok(Message::text(report))
    }
}

/// Renders the document for a decided concept and optionally persists it
struct FinalReport {
    verdict: Verdict,
    reports: ConceptReports,
    store: Option<Arc<dyn ArtifactStore>>,
}

impl FinalReport {
    fn prefix(&self) -> &'static str {
        match self.verdict {
            Verdict::Approved => "approved_concept",
            Verdict::Rejected => "concept_rejection",
        }
    }
}

#[async_trait]
impl TaskHandler for FinalReport {
    async fn run(&self, input: Message, ctx: &NodeContext) -> Result<Message, ExecutorError> {
        let decision = input
            .as_decision()
            .ok_or_else(|| ctx.fail(format!("expected a decision, got {}", input.kind())))?;
        let analysis = decision.subject.render();
        let feedback = decision.feedback.as_deref();

        let content = match self.verdict {
            Verdict::Approved => {
                self.reports
                    .approved_report(&analysis, feedback, decision.decided_at)
            }
            Verdict::Rejected => {
                self.reports
                    .rejection_draft(&analysis, feedback, decision.decided_at)
            }
        };

        let filename = match &self.store {
            Some(store) => {
                let name = store
                    .save(self.prefix(), &content)
                    .await
                    .map_err(|e| ctx.fail(format!("failed to save report: {:#}", e)))?;
                ctx.emit(OutputKind::Success, format!("Saved {}", name));
                Some(name)
            }
            None => None,
        };

        let summary = match self.verdict {
            Verdict::Approved => "Development report generated",
            Verdict::Rejected => "Rejection email drafted",
        };
        ctx.emit(OutputKind::Success, summary);

        Ok(Message::Artifact(Artifact { content, filename }))
    }
}

/// Nested workflow that runs the three perspectives and the overview in parallel
pub fn build_analysis_workflow(
    panel: &AnalysisPanel,
) -> Result<Arc<WorkflowDefinition>, ValidationError> {
    let mut builder = WorkflowBuilder::new(ANALYSIS_WORKFLOW);
    builder
        .add_node(nodes::DISPATCH, Executor::fanout())
        .add_node(nodes::OVERVIEW, Executor::task(ConceptOverview))
        .add_node(
            nodes::CONSOLIDATOR,
            Executor::aggregator().with_arity(Perspective::ALL.len() + 1),
        )
        .add_edge(nodes::DISPATCH, nodes::OVERVIEW)
        .add_edge(nodes::OVERVIEW, nodes::CONSOLIDATOR)
        .set_start(nodes::DISPATCH);

    for perspective in Perspective::ALL {
        builder
            .add_node(
                perspective.node_id(),
                Executor::task(AgentTask::new(perspective, panel.agent(perspective))),
            )
            .describe(perspective.node_id(), perspective.agent_label(), 0)
            .add_edge(nodes::DISPATCH, perspective.node_id())
            .add_edge(perspective.node_id(), nodes::CONSOLIDATOR);
    }

    Ok(Arc::new(builder.build()?))
}

/// Full concept review workflow.
///
/// Reports are saved to `store` when one is given; otherwise they only travel
/// in the terminal result.
pub fn build_concept_workflow(
    panel: &AnalysisPanel,
    reports: ConceptReports,
    store: Option<Arc<dyn ArtifactStore>>,
) -> Result<Arc<WorkflowDefinition>, ValidationError> {
    let analysis = build_analysis_workflow(panel)?;

    let mut builder = WorkflowBuilder::new(CONCEPT_WORKFLOW);
    builder
        .add_node(nodes::PARSER, Executor::task(ParseConcept))
        .add_node(nodes::ADAPTER, Executor::task(PrepareAnalysis))
        .add_node(nodes::ANALYSIS, Executor::subworkflow(analysis))
        .add_node(nodes::REPORT, Executor::task(WriteReport))
        .add_node(
            nodes::GATE,
            Executor::approval_gate(FixedQuestion::new(APPROVAL_QUESTION)),
        )
        .add_node(
            nodes::APPROVED,
            Executor::task(FinalReport {
                verdict: Verdict::Approved,
                reports: reports.clone(),
                store: store.clone(),
            }),
        )
        .add_node(
            nodes::REJECTED,
            Executor::task(FinalReport {
                verdict: Verdict::Rejected,
                reports,
                store,
            }),
        )
        .describe(nodes::PARSER, "Parse Concept", 15)
        .describe(nodes::ADAPTER, "Prepare Analysis", 30)
        .describe(nodes::ANALYSIS, "Comprehensive Analysis", 60)
        .describe(nodes::REPORT, "Generate Analysis Report", 80)
        .describe(nodes::GATE, "Human Review", 90)
        .describe(nodes::APPROVED, "Development Report", 95)
        .describe(nodes::REJECTED, "Rejection Email", 95)
        .add_edge(nodes::PARSER, nodes::ADAPTER)
        .add_edge(nodes::ADAPTER, nodes::ANALYSIS)
        .add_edge(nodes::ANALYSIS, nodes::REPORT)
        .add_edge(nodes::REPORT, nodes::GATE)
        .add_conditional_edge(nodes::GATE, nodes::APPROVED, Condition::approved())
        .add_conditional_edge(nodes::GATE, nodes::REJECTED, Condition::rejected())
        .set_start(nodes::PARSER)
        .set_terminal(nodes::APPROVED, Outcome::Approved)
        .set_terminal(nodes::REJECTED, Outcome::Rejected);

    Ok(Arc::new(builder.build()?))
}
