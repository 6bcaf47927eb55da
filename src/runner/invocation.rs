//! Construction of the external tool invocation.
//!
//! The container runtime is driven through its CLI as a plain child process:
//! resource limits become `--memory`/`--cpus` flags, the dataset root is
//! bind-mounted read-only at `/data`, the job's output directory read-write
//! at `/out`, and everything after the image reference belongs to the tool
//! itself.

use std::path::Path;

use crate::config::ToolConfig;
use crate::store::JobParams;

/// A fully resolved command line, ready to spawn and to record verbatim in
/// the run log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl std::fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.chars().any(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Build the `docker run` command line for one job.
///
/// The dataset mount is read-only; the session qualifier is passed through
/// with its case preserved.
pub fn build_tool_invocation(
    tool: &ToolConfig,
    params: &JobParams,
    data_root: &Path,
    output_dir: &Path,
) -> ToolInvocation {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--memory".to_string(),
        format!("{}g", params.mem_gb),
        "--memory-swap".to_string(),
        format!("{}g", params.mem_gb),
        "--cpus".to_string(),
        params.nprocs.to_string(),
        "-v".to_string(),
        format!("{}:/data:ro", data_root.display()),
        "-v".to_string(),
        format!("{}:/out", output_dir.display()),
        tool.image.clone(),
        "/data".to_string(),
        "/out".to_string(),
        "participant".to_string(),
        "--participant_label".to_string(),
        params.participant_label.clone(),
    ];

    if !params.modalities.is_empty() {
        args.push("-m".to_string());
        args.extend(params.modalities.iter().cloned());
    }

    args.push("--nprocs".to_string());
    args.push(params.nprocs.to_string());
    args.push("--omp-nthreads".to_string());
    args.push(params.nprocs.min(tool.omp_threads_cap).to_string());
    args.push("--no-sub".to_string());
    args.push("--verbose-reports".to_string());

    if let Some(ref session) = params.session_id {
        args.push("--session-id".to_string());
        args.push(session.clone());
    }

    ToolInvocation {
        program: tool.runtime.clone(),
        args,
    }
}
