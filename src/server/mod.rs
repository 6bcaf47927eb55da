//! HTTP surface for scanforge.
//!
//! ```text
//! GET    /health              capacity snapshot
//! POST   /submit-job          multipart upload -> {job_id}, returns post-intake
//! GET    /job-status/{id}     record projection; 404 unknown
//! GET    /download/{id}       result archive; whole-file or streamed by size
//! DELETE /delete-job/{id}     remove record + workspace
//! POST   /cleanup             wipe the workspace root (legacy single-job mode)
//! GET    /ws/log-stream       live tool output broadcast
//! ```
//!
//! Validation failures surface synchronously as 400s (and mark the job
//! Failed if a record exists); execution failures only ever show up on
//! status polls.

mod logstream;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{StatusCode, header};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::bundle::{self, Workspace};
use crate::config::{Config, ToolConfig};
use crate::error::{ApiError, ValidationError};
use crate::package::{self, Delivery};
use crate::runner::{LogLine, RunnerPool};
use crate::store::{JobParams, JobRecord, JobState, JobTracker};

/// Modalities assumed when a submission doesn't name any.
const DEFAULT_MODALITIES: &[&str] = &["T1w", "T2w", "bold"];

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub tracker: JobTracker,
    pub runner: Arc<RunnerPool>,
    pub log_tx: broadcast::Sender<LogLine>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/submit-job", post(submit_job))
        .route("/job-status/{job_id}", get(job_status))
        .route("/download/{job_id}", get(download))
        .route("/delete-job/{job_id}", delete(delete_job))
        .route("/cleanup", post(cleanup))
        .route("/ws/log-stream", get(logstream::ws_log_stream))
        .layer(DefaultBodyLimit::disable())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until shutdown.
pub async fn serve(
    state: AppState,
    host: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: std::net::SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("scanforge listening on {addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// -- Handlers --

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let tool = &state.config.tool;
    Json(serde_json::json!({
        "status": "ok",
        "resources": {
            "cpus": std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            "max_concurrent_jobs": tool.max_concurrent_jobs,
            "active_jobs": state.runner.active_jobs(),
            "default_nprocs": tool.default_nprocs,
            "default_mem_gb": tool.default_mem_gb,
            "tool_image": tool.image,
        },
    }))
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    job_id: Uuid,
}

/// Receive an uploaded bundle, validate it, and hand it to the runner.
///
/// Returns as soon as intake finishes; the tool run proceeds in the
/// background. The upload is streamed to disk chunk-by-chunk so large
/// datasets never sit in memory.
async fn submit_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<SubmitResponse>, ApiError> {
    let job_id = Uuid::new_v4();
    let workspace = Workspace::create(&state.config.workspace.root, job_id)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to create workspace: {e}")))?;

    let bad_part = |reason: String| {
        ApiError::Validation(ValidationError::InvalidParameter {
            name: "multipart".to_string(),
            reason,
        })
    };

    let mut saw_archive = false;
    let mut fields: HashMap<String, String> = HashMap::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                let _ = workspace.remove().await;
                return Err(bad_part(e.to_string()));
            }
        };

        let name = field.name().unwrap_or_default().to_string();
        if name == "dataset_zip" {
            saw_archive = true;
            if let Err(e) = spool_upload(field, &workspace).await {
                let _ = workspace.remove().await;
                return Err(e);
            }
        } else {
            match field.text().await {
                Ok(value) => {
                    fields.insert(name, value);
                }
                Err(e) => {
                    let _ = workspace.remove().await;
                    return Err(bad_part(e.to_string()));
                }
            }
        }
    }

    if !saw_archive {
        let _ = workspace.remove().await;
        return Err(ApiError::Validation(ValidationError::InvalidParameter {
            name: "dataset_zip".to_string(),
            reason: "missing archive upload".to_string(),
        }));
    }

    let params = match parse_params(&fields, &state.config.tool) {
        Ok(params) => params,
        Err(e) => {
            let _ = workspace.remove().await;
            return Err(e.into());
        }
    };

    // From here on a record exists, so failures become a Failed job rather
    // than a bare rejection.
    let record = JobRecord::new(job_id, params, workspace.root().to_path_buf());
    state.tracker.insert(record.clone()).await?;
    state.tracker.advance(job_id, JobState::Extracting).await;

    match bundle::unpack_and_locate(&workspace, &state.config.tool.marker_file).await {
        Ok(data_root) => {
            tracing::info!(
                job_id = %job_id,
                root = %data_root.display(),
                "bundle accepted, dataset root located"
            );
            state.runner.spawn(record, data_root);
            Ok(Json(SubmitResponse { job_id }))
        }
        Err(validation) => {
            tracing::warn!(job_id = %job_id, "bundle rejected: {validation}");
            state.tracker.fail(job_id, validation.to_string()).await;
            Err(validation.into())
        }
    }
}

/// Stream one multipart field to `input.zip`.
async fn spool_upload(
    mut field: axum::extract::multipart::Field<'_>,
    workspace: &Workspace,
) -> Result<(), ApiError> {
    use tokio::io::AsyncWriteExt;

    let mut out = tokio::fs::File::create(workspace.input_zip())
        .await
        .map_err(|e| ApiError::Internal(format!("failed to create upload file: {e}")))?;

    loop {
        let chunk = field.chunk().await.map_err(|e| {
            ApiError::Validation(ValidationError::InvalidParameter {
                name: "dataset_zip".to_string(),
                reason: format!("upload interrupted: {e}"),
            })
        })?;
        match chunk {
            Some(bytes) => out
                .write_all(&bytes)
                .await
                .map_err(|e| ApiError::Internal(format!("failed to write upload: {e}")))?,
            None => break,
        }
    }
    out.flush()
        .await
        .map_err(|e| ApiError::Internal(format!("failed to flush upload: {e}")))?;
    Ok(())
}

fn parse_params(
    fields: &HashMap<String, String>,
    tool: &ToolConfig,
) -> Result<JobParams, ValidationError> {
    let participant_label = fields
        .get("participant_label")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    if participant_label.is_empty() {
        return Err(ValidationError::InvalidParameter {
            name: "participant_label".to_string(),
            reason: "must not be empty".to_string(),
        });
    }

    let modalities: Vec<String> = fields
        .get("modalities")
        .map(|s| s.split_whitespace().map(String::from).collect::<Vec<_>>())
        .filter(|mods| !mods.is_empty())
        .unwrap_or_else(|| DEFAULT_MODALITIES.iter().map(|m| m.to_string()).collect());

    let session_id = fields
        .get("session_id")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let nprocs = parse_numeric_field(fields, "n_procs", tool.default_nprocs)?;
    let mem_gb = parse_numeric_field(fields, "mem_gb", tool.default_mem_gb)?;
    if nprocs == 0 {
        return Err(ValidationError::InvalidParameter {
            name: "n_procs".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    if mem_gb == 0 {
        return Err(ValidationError::InvalidParameter {
            name: "mem_gb".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }

    let timeout_secs = match fields.get("timeout_secs").map(|s| s.trim()).filter(|s| !s.is_empty()) {
        Some(raw) => {
            let secs: u64 = raw.parse().map_err(|_| ValidationError::InvalidParameter {
                name: "timeout_secs".to_string(),
                reason: format!("'{raw}' is not a valid number of seconds"),
            })?;
            if secs == 0 {
                return Err(ValidationError::InvalidParameter {
                    name: "timeout_secs".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            Some(secs)
        }
        None => None,
    };

    Ok(JobParams {
        participant_label,
        modalities,
        session_id,
        nprocs,
        mem_gb,
        timeout_secs,
    })
}

fn parse_numeric_field(
    fields: &HashMap<String, String>,
    name: &str,
    default: u32,
) -> Result<u32, ValidationError> {
    match fields.get(name).map(|s| s.trim()).filter(|s| !s.is_empty()) {
        Some(raw) => raw.parse().map_err(|_| ValidationError::InvalidParameter {
            name: name.to_string(),
            reason: format!("'{raw}' is not a valid number"),
        }),
        None => Ok(default),
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    job_id: Uuid,
    state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<StatusResponse>, ApiError> {
    let record = state
        .tracker
        .get(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id} not found")))?;

    Ok(Json(StatusResponse {
        job_id: record.id,
        state: record.state,
        error: record.error,
        submitted_at: record.submitted_at,
        started_at: record.started_at,
        finished_at: record.finished_at,
    }))
}

/// Serve the packaged result archive.
///
/// Availability is checked on disk, never assumed from the job state: a
/// Complete record with a missing or empty archive is a 404.
async fn download(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let record = state
        .tracker
        .get(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id} not found")))?;

    if record.state != JobState::Complete {
        return Err(ApiError::NotReady(job_id));
    }

    let workspace = Workspace::open(record.workspace);
    let archive = workspace.result_zip();
    let meta = tokio::fs::metadata(&archive)
        .await
        .map_err(|_| ApiError::NotFound(format!("result archive for job {job_id} not found")))?;
    if meta.len() == 0 {
        return Err(ApiError::NotFound(format!(
            "result archive for job {job_id} is empty"
        )));
    }

    let disposition = format!("attachment; filename=\"mriqc_results_{job_id}.zip\"");
    let response = match package::delivery_for(meta.len()) {
        Delivery::Whole => {
            let bytes = tokio::fs::read(&archive)
                .await
                .map_err(|e| ApiError::Internal(format!("failed to read archive: {e}")))?;
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/zip")
                .header(header::CONTENT_DISPOSITION, disposition)
                .body(axum::body::Body::from(bytes))
        }
        Delivery::Streamed => {
            let file = tokio::fs::File::open(&archive)
                .await
                .map_err(|e| ApiError::Internal(format!("failed to open archive: {e}")))?;
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/zip")
                .header(header::CONTENT_LENGTH, meta.len())
                .header(header::CONTENT_DISPOSITION, disposition)
                .body(axum::body::Body::from_stream(ReaderStream::new(file)))
        }
    };

    response.map_err(|e| ApiError::Internal(format!("failed to build response: {e}")))
}

/// Remove a job's record and workspace, in that order, for any state. A
/// runner still holding file handles sees late I/O errors, which it treats
/// as late failures against an already-deleted record (no-ops).
async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state
        .tracker
        .remove(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id} not found")))?;

    let workspace = Workspace::open(record.workspace);
    if let Err(e) = workspace.remove().await {
        tracing::warn!(job_id = %job_id, "failed to remove workspace: {e}");
    }

    tracing::info!(job_id = %job_id, "job deleted");
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

/// Legacy single-job deployment escape hatch: wipe every entry under the
/// workspace root. Job records are untouched.
async fn cleanup(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let root = &state.config.workspace.root;
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Json(serde_json::json!({ "status": "cleared" })));
        }
        Err(e) => {
            return Err(ApiError::Internal(format!(
                "failed to read workspace root: {e}"
            )));
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let removed = if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        if let Err(e) = removed {
            tracing::warn!("cleanup: failed to remove {}: {e}", path.display());
        }
    }

    tracing::info!("workspace root cleared");
    Ok(Json(serde_json::json!({ "status": "cleared" })))
}
