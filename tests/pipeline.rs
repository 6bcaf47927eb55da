//! End-to-end pipeline tests over the HTTP surface.
//!
//! The container runtime is replaced by a small shell script that parses the
//! `-v {dir}:/out` bind from its arguments and behaves like the real tool:
//! writes results, produces no output, sleeps past the timeout, or fails.
//! Everything else (intake, state walk, packaging, download) is the real
//! pipeline.

#![cfg(unix)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use tower::ServiceExt;
use uuid::Uuid;

use scanforge::config::{Config, HttpConfig, StoreConfig, ToolConfig, WorkspaceConfig};
use scanforge::runner::RunnerPool;
use scanforge::server::{AppState, router};
use scanforge::store::{JobTracker, MemoryJobStore};

const BOUNDARY: &str = "scanforge-pipeline-boundary";

/// Write an executable shim that stands in for `docker`.
fn write_runtime_shim(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-runtime");
    let script = format!(
        "#!/bin/sh\n\
         out=\"\"\n\
         for a in \"$@\"; do\n\
           case \"$a\" in\n\
             *:/out) out=\"${{a%:/out}}\" ;;\n\
           esac\n\
         done\n\
         {body}\n"
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn test_state(workspace_root: PathBuf, runtime: &Path) -> AppState {
    let tool = ToolConfig {
        runtime: runtime.to_string_lossy().into_owned(),
        ..ToolConfig::default()
    };
    let config = Config {
        http: HttpConfig::default(),
        workspace: WorkspaceConfig {
            root: workspace_root,
        },
        store: StoreConfig::default(),
        tool: tool.clone(),
    };
    let tracker = JobTracker::new(Arc::new(MemoryJobStore::new()));
    let (log_tx, _) = tokio::sync::broadcast::channel(256);
    let runner = Arc::new(RunnerPool::new(tool, tracker.clone(), log_tx.clone()));
    AppState {
        config: Arc::new(config),
        tracker,
        runner,
        log_tx,
    }
}

/// A well-formed bundle with the marker two levels deep.
fn dataset_zip_bytes() -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buf);
        let options = zip::write::SimpleFileOptions::default();
        for (name, contents) in [
            ("root/group/dataset_description.json", r#"{"Name": "demo"}"#),
            ("root/group/sub-01/anat/sub-01_T1w.nii", "not really nifti"),
            ("root/group/sub-01/func/sub-01_bold.nii", "bold data"),
        ] {
            writer.start_file(name.to_string(), options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }
    buf.into_inner()
}

fn submit_request(fields: &[(&str, &str)], zip_bytes: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"dataset_zip\"; filename=\"dataset.zip\"\r\n\
          Content-Type: application/zip\r\n\r\n",
    );
    body.extend_from_slice(zip_bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/submit-job")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn response_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), 100 * 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn submit(router: &Router, fields: &[(&str, &str)], zip_bytes: &[u8]) -> Uuid {
    let resp = router
        .clone()
        .oneshot(submit_request(fields, zip_bytes))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = response_json(resp).await;
    json["job_id"].as_str().unwrap().parse().unwrap()
}

/// Poll `/job-status` until the job reaches a terminal state.
async fn wait_for_terminal(router: &Router, job_id: Uuid) -> serde_json::Value {
    for _ in 0..300 {
        let resp = router
            .clone()
            .oneshot(
                Request::get(format!("/job-status/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = response_json(resp).await;
        let state = json["state"].as_str().unwrap();
        if state == "complete" || state == "failed" {
            return json;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

#[tokio::test]
async fn test_submit_run_download_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let shim = write_runtime_shim(
        tmp.path(),
        "echo \"processing dataset\"\n\
         echo \"one warning\" >&2\n\
         mkdir -p \"$out/sub-01\"\n\
         echo '{\"snr\": 12.5}' > \"$out/sub-01/metrics.json\"",
    );
    let state = test_state(tmp.path().join("workspaces"), &shim);
    let router = router(state);

    let job_id = submit(
        &router,
        &[
            ("participant_label", "01"),
            ("modalities", "T1w bold"),
            ("n_procs", "4"),
            ("mem_gb", "16"),
        ],
        &dataset_zip_bytes(),
    )
    .await;

    let status = wait_for_terminal(&router, job_id).await;
    assert_eq!(status["state"], "complete", "status was: {status}");
    assert!(status["error"].is_null());
    assert!(status["started_at"].is_string());
    assert!(status["finished_at"].is_string());

    // Download and inspect the packaged archive.
    let resp = router
        .clone()
        .oneshot(
            Request::get(format!("/download/{job_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/zip"
    );
    let bytes = axum::body::to_bytes(resp.into_body(), 100 * 1024 * 1024)
        .await
        .unwrap();
    assert!(!bytes.is_empty());

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
    let names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    assert!(names.contains(&"run.log".to_string()), "names: {names:?}");
    assert!(names.contains(&"sub-01/metrics.json".to_string()));

    // The run log records the invocation verbatim, read-only data mount and
    // captured output included.
    let mut log = String::new();
    std::io::Read::read_to_string(&mut archive.by_name("run.log").unwrap(), &mut log).unwrap();
    assert!(log.contains(":/data:ro"), "log was: {log}");
    assert!(log.contains("--participant_label 01"));
    assert!(log.contains("processing dataset"));
    assert!(log.contains("one warning"));
}

#[tokio::test]
async fn test_timeout_kills_run_and_fails_job() {
    let tmp = tempfile::tempdir().unwrap();
    let shim = write_runtime_shim(tmp.path(), "sleep 30");
    let state = test_state(tmp.path().join("workspaces"), &shim);
    let router = router(state);

    let job_id = submit(
        &router,
        &[("participant_label", "01"), ("timeout_secs", "1")],
        &dataset_zip_bytes(),
    )
    .await;

    let started = std::time::Instant::now();
    let status = wait_for_terminal(&router, job_id).await;
    assert_eq!(status["state"], "failed");
    assert!(
        status["error"].as_str().unwrap().contains("timeout"),
        "error was: {}",
        status["error"]
    );
    // Far less than the shim's sleep: the process was killed, not awaited.
    assert!(started.elapsed() < Duration::from_secs(15));

    // No partial result is ever packaged.
    let resp = router
        .clone()
        .oneshot(
            Request::get(format!("/download/{job_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_exit_zero_without_output_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let shim = write_runtime_shim(tmp.path(), "echo \"did nothing\"");
    let state = test_state(tmp.path().join("workspaces"), &shim);
    let router = router(state);

    let job_id = submit(&router, &[("participant_label", "01")], &dataset_zip_bytes()).await;

    let status = wait_for_terminal(&router, job_id).await;
    assert_eq!(status["state"], "failed");
    assert!(
        status["error"].as_str().unwrap().contains("no output"),
        "error was: {}",
        status["error"]
    );
}

#[tokio::test]
async fn test_tool_failure_surfaces_stderr_tail() {
    let tmp = tempfile::tempdir().unwrap();
    let shim = write_runtime_shim(
        tmp.path(),
        "echo \"dataset unreadable\" >&2\n\
         exit 2",
    );
    let state = test_state(tmp.path().join("workspaces"), &shim);
    let router = router(state);

    let job_id = submit(&router, &[("participant_label", "01")], &dataset_zip_bytes()).await;

    let status = wait_for_terminal(&router, job_id).await;
    assert_eq!(status["state"], "failed");
    let error = status["error"].as_str().unwrap();
    assert!(error.contains("code 2"), "error was: {error}");
    assert!(error.contains("dataset unreadable"), "error was: {error}");
}

#[tokio::test]
async fn test_delete_after_completion_removes_everything() {
    let tmp = tempfile::tempdir().unwrap();
    let shim = write_runtime_shim(
        tmp.path(),
        "mkdir -p \"$out\"\n\
         echo done > \"$out/report.txt\"",
    );
    let workspaces = tmp.path().join("workspaces");
    let state = test_state(workspaces.clone(), &shim);
    let router = router(state);

    let job_id = submit(&router, &[("participant_label", "01")], &dataset_zip_bytes()).await;
    let status = wait_for_terminal(&router, job_id).await;
    assert_eq!(status["state"], "complete");

    let resp = router
        .clone()
        .oneshot(
            Request::delete(format!("/delete-job/{job_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(!workspaces.join(job_id.to_string()).exists());

    for uri in [
        format!("/job-status/{job_id}"),
        format!("/download/{job_id}"),
    ] {
        let resp = router
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn test_session_qualifier_passed_through_verbatim() {
    let tmp = tempfile::tempdir().unwrap();
    // The shim records its own arguments so the test can inspect the
    // invocation the runner actually built.
    let shim = write_runtime_shim(
        tmp.path(),
        "mkdir -p \"$out\"\n\
         echo \"$@\" > \"$out/argv.txt\"",
    );
    let state = test_state(tmp.path().join("workspaces"), &shim);
    let tracker = state.tracker.clone();
    let router = router(state);

    let job_id = submit(
        &router,
        &[("participant_label", "01"), ("session_id", "Baseline")],
        &dataset_zip_bytes(),
    )
    .await;

    let status = wait_for_terminal(&router, job_id).await;
    assert_eq!(status["state"], "complete");

    let record = tracker.get(job_id).await.unwrap().unwrap();
    let argv = std::fs::read_to_string(
        Path::new(&record.workspace).join("output").join("argv.txt"),
    )
    .unwrap();
    assert!(argv.contains("--session-id Baseline"), "argv was: {argv}");
    assert!(argv.contains("--no-sub"));
}
