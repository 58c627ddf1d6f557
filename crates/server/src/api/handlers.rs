use super::{ApiError, ApiResult};
use crate::config::AppState;
use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use conclave_core::{
    approval::ApprovalResponse,
    ingest::ConceptDocument,
    types::RunId,
    workflow::RunSnapshot,
};
use serde::{Deserialize, Serialize};
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

pub(crate) fn parse_run_id(run_id: &str) -> ApiResult<RunId> {
    run_id
        .parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid run ID: {}", run_id)))
}

/// Submit a concept for review
pub async fn submit_concept(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitConceptRequest>,
) -> ApiResult<Json<SubmitConceptResponse>> {
    let document = match (req.path, req.text) {
        (Some(path), _) => {
            let path = resolve_upload(&state.uploads, &path)?;
            state.parser.parse(&path)?
        }
        (None, Some(text)) => {
            let title = req
                .title
                .or_else(|| {
                    text.lines()
                        .find_map(|line| line.trim().strip_prefix("# "))
                        .map(|t| t.trim().to_string())
                })
                .unwrap_or_else(|| "Untitled Concept".to_string());
            if text.trim().is_empty() {
                return Err(ApiError::bad_request("Concept text is empty"));
            }
            ConceptDocument::from_text(title, text)
        }
        (None, None) => {
            return Err(ApiError::bad_request(
                "Provide either 'text' or 'path' for the concept",
            ))
        }
    };

    let title = document.title.clone();
    let run_id = state
        .runner
        .start_run(state.workflow.clone(), document.to_message())
        .await?;

    tracing::info!("Submitted concept '{}' for review: run_id={}", title, run_id);

    Ok(Json(SubmitConceptResponse {
        run_id,
        title,
        message: "Concept review started".to_string(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitConceptRequest {
    pub title: Option<String>,
    pub text: Option<String>,
    /// Concept file inside the upload directory
    pub path: Option<PathBuf>,
}

/// Resolve a submitted path against the upload directory. Anything that does
/// not exist or escapes the directory is reported the same way.
fn resolve_upload(uploads: &FsPath, requested: &FsPath) -> ApiResult<PathBuf> {
    let not_found = || {
        ApiError::bad_request(format!(
            "Concept file not found in the upload directory: {}",
            requested.display()
        ))
    };

    let resolved = uploads
        .join(requested)
        .canonicalize()
        .map_err(|_| not_found())?;
    if !resolved.starts_with(uploads) || !resolved.is_file() {
        tracing::warn!("Refused concept path outside uploads: {}", requested.display());
        return Err(not_found());
    }
    Ok(resolved)
}

/// Store a concept file in the upload directory for a later submission
pub async fn upload_concept(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
    body: Bytes,
) -> ApiResult<Json<UploadResponse>> {
    let plain_name = !filename.is_empty()
        && !filename.starts_with('.')
        && !filename.contains(['/', '\\']);
    if !plain_name {
        return Err(ApiError::bad_request(format!("Invalid upload name: {}", filename)));
    }
    if body.is_empty() {
        return Err(ApiError::bad_request("Uploaded file is empty"));
    }

    let dest = state.uploads.join(&filename);
    tokio::fs::write(&dest, &body)
        .await
        .with_context(|| format!("Failed to store upload {}", dest.display()))?;

    tracing::info!("Stored concept upload '{}' ({} bytes)", filename, body.len());

    Ok(Json(UploadResponse {
        size: body.len(),
        filename,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Pass as `path` when submitting the concept
    pub filename: String,
    pub size: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitConceptResponse {
    pub run_id: RunId,
    pub title: String,
    pub message: String,
}

/// List all runs
pub async fn list_runs(State(state): State<Arc<AppState>>) -> ApiResult<Json<ListRunsResponse>> {
    let runs = state.runner.list_runs().await;
    Ok(Json(ListRunsResponse { runs }))
}

#[derive(Debug, Serialize)]
pub struct ListRunsResponse {
    pub runs: Vec<RunSnapshot>,
}

/// Get a specific run
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunSnapshot>> {
    let run_id = parse_run_id(&run_id)?;
    let run = state.runner.snapshot(run_id).await?;
    Ok(Json(run))
}

/// Answer the approval request of a suspended run
pub async fn submit_approval(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Json(req): Json<ApprovalRequestBody>,
) -> ApiResult<Json<ApprovalResponseBody>> {
    let run_id = parse_run_id(&run_id)?;

    let response = match (req.decision, req.reply) {
        (Some(decision), _) => ApprovalResponse::from_decision(&decision, req.feedback.as_deref()),
        (None, Some(reply)) => ApprovalResponse::from_reply(&reply),
        (None, None) => {
            return Err(ApiError::bad_request(
                "Provide either 'decision' or 'reply'",
            ))
        }
    };

    let decision = response.decision;
    state
        .runner
        .submit_approval_response(run_id, response)
        .await?;

    tracing::info!("Recorded approval decision for run {}: {}", run_id, decision);

    Ok(Json(ApprovalResponseBody {
        run_id,
        decision: decision.to_string(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApprovalRequestBody {
    /// `approve`, `reject` and their synonyms
    pub decision: Option<String>,
    pub feedback: Option<String>,
    /// Free-form reply: first line is the decision, the rest feedback
    pub reply: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApprovalResponseBody {
    pub run_id: RunId,
    pub decision: String,
}
