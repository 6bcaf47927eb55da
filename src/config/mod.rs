//! Configuration for scanforge.
//!
//! Everything resolves from environment variables with sensible defaults;
//! `.env` files are loaded via dotenvy early in startup. Per-area structs
//! each carry a `resolve()` constructor so `Config::from_env` stays a plain
//! composition.

pub(crate) mod helpers;

use std::path::PathBuf;

use crate::error::ConfigError;

use self::helpers::{optional_env, parse_optional_env, parse_string_env};

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub http: HttpConfig,
    pub workspace: WorkspaceConfig,
    pub store: StoreConfig,
    pub tool: ToolConfig,
}

impl Config {
    /// Load configuration from the environment (and `.env`, if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Ok(Self {
            http: HttpConfig::resolve()?,
            workspace: WorkspaceConfig::resolve(),
            store: StoreConfig::resolve(),
            tool: ToolConfig::resolve()?,
        })
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl HttpConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: parse_string_env("HTTP_HOST", defaults.host),
            port: parse_optional_env("HTTP_PORT", defaults.port)?,
        })
    }
}

/// Where per-job workspaces live on disk.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    pub root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/scanforge"),
        }
    }
}

impl WorkspaceConfig {
    pub(crate) fn resolve() -> Self {
        Self {
            root: optional_env("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(Self::default().root),
        }
    }
}

/// Job store backing. When `redis_url` is set but the server is unreachable
/// at startup, the service degrades to the in-memory store and keeps going.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub redis_url: Option<String>,
}

impl StoreConfig {
    pub(crate) fn resolve() -> Self {
        Self {
            redis_url: optional_env("REDIS_URL"),
        }
    }
}

/// The containerized QC tool and its resource defaults.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// Container runtime binary invoked as an external process.
    pub runtime: String,
    /// Tool image reference, version-pinned.
    pub image: String,
    /// Marker file identifying the dataset root inside an uploaded bundle.
    pub marker_file: String,
    /// Default CPU count passed to the tool when the submission omits one.
    pub default_nprocs: u32,
    /// Default memory budget in GiB.
    pub default_mem_gb: u32,
    /// Wall-clock timeout for one tool run, in seconds.
    pub timeout_secs: u64,
    /// Upper bound on concurrently running jobs.
    pub max_concurrent_jobs: usize,
    /// Cap on per-process OpenMP threads passed to the tool.
    pub omp_threads_cap: u32,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "nipreps/mriqc:22.0.6".to_string(),
            marker_file: "dataset_description.json".to_string(),
            default_nprocs: 4,
            default_mem_gb: 16,
            timeout_secs: 7200,
            max_concurrent_jobs: 2,
            omp_threads_cap: 4,
        }
    }
}

impl ToolConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            runtime: parse_string_env("TOOL_RUNTIME", defaults.runtime),
            image: parse_string_env("TOOL_IMAGE", defaults.image),
            marker_file: parse_string_env("MARKER_FILE", defaults.marker_file),
            default_nprocs: parse_optional_env("TOOL_DEFAULT_NPROCS", defaults.default_nprocs)?,
            default_mem_gb: parse_optional_env("TOOL_DEFAULT_MEM_GB", defaults.default_mem_gb)?,
            timeout_secs: parse_optional_env("TOOL_TIMEOUT_SECS", defaults.timeout_secs)?,
            max_concurrent_jobs: parse_optional_env(
                "MAX_CONCURRENT_JOBS",
                defaults.max_concurrent_jobs,
            )?,
            omp_threads_cap: parse_optional_env("TOOL_OMP_THREADS_CAP", defaults.omp_threads_cap)?,
        })
    }
}
