//! Sandbox provider abstraction.
//!
//! A sandbox is a per-project execution environment. One sandbox per
//! project is sufficient; multiple agent execs may share a running sandbox,
//! each with its own stop-file. Two backends ship: Docker containers
//! ([`docker::DockerProvider`]) and plain host processes
//! ([`local::LocalProvider`], used by development setups and the test
//! suite).

pub mod docker;
pub mod local;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use corral_db::models::SandboxStatus;

use crate::error::CoreResult;

/// A stream of lines (stdout or stderr of a sandboxed process).
pub type LineStream = Pin<Box<dyn Stream<Item = std::io::Result<String>> + Send>>;

/// Configuration for creating a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Container image (ignored by the local backend).
    pub image: String,
    /// Extra flags passed to the container runtime at create time.
    pub extra_flags: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "ubuntu:24.04".to_string(),
            extra_flags: Vec::new(),
        }
    }
}

/// Output of a blocking, small-output exec.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Specification for a long-running streamed exec.
#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    pub cmd: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub workdir: Option<String>,
}

/// Handle to a streamed exec: wait for exit or kill it.
#[async_trait]
pub trait ExecHandle: Send + Sync {
    /// Wait for the process to exit; returns the exit code.
    async fn wait(&mut self) -> Result<i32>;

    /// Terminate the process. Should attempt a graceful stop first where
    /// the backend supports it.
    async fn kill(&mut self) -> Result<()>;
}

/// A running streamed exec.
pub struct ExecStream {
    pub stdout: LineStream,
    pub stderr: LineStream,
    pub handle: Box<dyn ExecHandle>,
}

impl std::fmt::Debug for ExecStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecStream").finish_non_exhaustive()
    }
}

/// A per-project sandbox.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Stable identity of this sandbox instance.
    fn id(&self) -> &str;

    /// Current lifecycle status.
    async fn status(&self) -> SandboxStatus;

    /// Run a command to completion and capture its output.
    async fn exec(&self, cmd: &str, args: &[&str], workdir: Option<&str>) -> Result<ExecOutput>;

    /// Launch a long-running command with line-streamed stdout/stderr.
    ///
    /// A sandbox in `stopped`/`failed` status rejects this with
    /// `SANDBOX_UNAVAILABLE` so callers can distinguish "sandbox gone" from
    /// a failed spawn.
    async fn exec_stream(&self, spec: ExecSpec) -> CoreResult<ExecStream>;

    /// Write a file inside the sandbox (used for stop-file coordination).
    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()>;

    /// Whether a path exists inside the sandbox.
    async fn exists(&self, path: &str) -> Result<bool>;
}

/// Provider of per-project sandboxes.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// The sandbox for a project, if one was already created.
    async fn get(&self, project_id: &str) -> Result<Option<Arc<dyn Sandbox>>>;

    /// Create (and start) a sandbox for a project.
    async fn create(&self, project_id: &str, config: &SandboxConfig) -> Result<Arc<dyn Sandbox>>;

    /// Check that the backend is reachable.
    async fn health_check(&self) -> Result<()>;
}

/// Turn an async reader into a [`LineStream`].
pub fn line_stream<R>(reader: R) -> LineStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    Box::pin(async_stream::stream! {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => yield Ok(line),
                Ok(None) => break,
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    })
}
