//! Host-process sandbox backend.
//!
//! Runs agent processes directly on the host with no containment. Intended
//! for development setups where the project already lives in a controlled
//! environment, and for the test suite, which drives the orchestrator with
//! scripted fake agents. `write_file`/`exists` operate on the host
//! filesystem, so stop-file coordination behaves identically to the
//! container backend.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::debug;

use corral_db::models::SandboxStatus;

use crate::error::{CoreError, CoreResult, ErrorCode};

use super::{
    line_stream, ExecHandle, ExecOutput, ExecSpec, ExecStream, Sandbox, SandboxConfig,
    SandboxProvider,
};

/// Sandbox that executes on the host.
pub struct LocalSandbox {
    id: String,
    status: Mutex<SandboxStatus>,
}

impl LocalSandbox {
    fn new(project_id: &str) -> Self {
        Self {
            id: format!("local-{project_id}"),
            status: Mutex::new(SandboxStatus::Running),
        }
    }

    /// Force the status. Test hook for exercising the unavailable path.
    pub fn set_status(&self, status: SandboxStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

struct LocalExecHandle {
    child: Child,
}

#[async_trait]
impl ExecHandle for LocalExecHandle {
    async fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait().await.context("failed to wait on process")?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) -> Result<()> {
        // SIGTERM first so the process can flush, then SIGKILL.
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: pid comes from a child we spawned.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret == 0 {
                let exited = tokio::time::timeout(
                    std::time::Duration::from_millis(500),
                    self.child.wait(),
                )
                .await;
                if exited.is_ok() {
                    return Ok(());
                }
                debug!(pid, "process ignored SIGTERM, sending SIGKILL");
            }
        }
        self.child.kill().await.context("failed to kill process")?;
        Ok(())
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn status(&self) -> SandboxStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn exec(&self, cmd: &str, args: &[&str], workdir: Option<&str>) -> Result<ExecOutput> {
        let mut command = Command::new(cmd);
        command.args(args);
        if let Some(dir) = workdir {
            command.current_dir(dir);
        }
        let output = command
            .output()
            .await
            .with_context(|| format!("failed to run {cmd}"))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn exec_stream(&self, spec: ExecSpec) -> CoreResult<ExecStream> {
        let status = self.status().await;
        if matches!(status, SandboxStatus::Stopped | SandboxStatus::Failed) {
            return Err(CoreError::new(
                ErrorCode::SandboxUnavailable,
                format!("sandbox {} is {status}", self.id),
            ));
        }

        let mut command = Command::new(&spec.cmd);
        command.args(&spec.args);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        if let Some(dir) = &spec.workdir {
            command.current_dir(dir);
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            CoreError::new(
                ErrorCode::ExecStreamFailed,
                format!("failed to spawn {}: {e}", spec.cmd),
            )
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            CoreError::new(ErrorCode::ExecStreamFailed, "child has no stdout pipe")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            CoreError::new(ErrorCode::ExecStreamFailed, "child has no stderr pipe")
        })?;

        Ok(ExecStream {
            stdout: line_stream(stdout),
            stderr: line_stream(stderr),
            handle: Box::new(LocalExecHandle { child }),
        })
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("failed to write {path}"))?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await.unwrap_or(false))
    }
}

/// Provider handing out one [`LocalSandbox`] per project.
#[derive(Default)]
pub struct LocalProvider {
    sandboxes: Mutex<HashMap<String, Arc<LocalSandbox>>>,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct access to a project's sandbox. Test hook.
    pub fn sandbox(&self, project_id: &str) -> Option<Arc<LocalSandbox>> {
        self.sandboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(project_id)
            .cloned()
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    async fn get(&self, project_id: &str) -> Result<Option<Arc<dyn Sandbox>>> {
        let sandboxes = self.sandboxes.lock().unwrap_or_else(|e| e.into_inner());
        Ok(sandboxes
            .get(project_id)
            .cloned()
            .map(|sandbox| sandbox as Arc<dyn Sandbox>))
    }

    async fn create(&self, project_id: &str, _config: &SandboxConfig) -> Result<Arc<dyn Sandbox>> {
        let mut sandboxes = self.sandboxes.lock().unwrap_or_else(|e| e.into_inner());
        let sandbox = sandboxes
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(LocalSandbox::new(project_id)))
            .clone();
        Ok(sandbox as Arc<dyn Sandbox>)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn exec_captures_output() {
        let sandbox = LocalSandbox::new("p");
        let output = sandbox.exec("echo", &["hello"], None).await.unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn exec_stream_yields_lines_and_exit_code() {
        let sandbox = LocalSandbox::new("p");
        let mut spec = ExecSpec {
            cmd: "sh".to_string(),
            args: vec!["-c".to_string(), "echo one; echo two".to_string()],
            ..Default::default()
        };
        spec.env.insert("UNUSED".to_string(), "1".to_string());

        let mut stream = sandbox.exec_stream(spec).await.unwrap();
        let lines: Vec<String> = (&mut stream.stdout)
            .map(|line| line.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(stream.handle.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exec_stream_env_and_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::new("p");
        let mut env = HashMap::new();
        env.insert("CORRAL_TEST_VALUE".to_string(), "42".to_string());

        let spec = ExecSpec {
            cmd: "sh".to_string(),
            args: vec!["-c".to_string(), "echo $CORRAL_TEST_VALUE; pwd".to_string()],
            env,
            workdir: Some(dir.path().to_string_lossy().into_owned()),
        };
        let mut stream = sandbox.exec_stream(spec).await.unwrap();
        let lines: Vec<String> = (&mut stream.stdout)
            .map(|line| line.unwrap())
            .collect()
            .await;
        assert_eq!(lines[0], "42");
        let reported = std::fs::canonicalize(&lines[1]).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn exec_stream_rejected_when_stopped() {
        let sandbox = LocalSandbox::new("p");
        sandbox.set_status(SandboxStatus::Stopped);
        let err = sandbox
            .exec_stream(ExecSpec {
                cmd: "true".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SandboxUnavailable);
    }

    #[tokio::test]
    async fn kill_terminates_long_running_process() {
        let sandbox = LocalSandbox::new("p");
        let mut stream = sandbox
            .exec_stream(ExecSpec {
                cmd: "sleep".to_string(),
                args: vec!["3600".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        stream.handle.kill().await.unwrap();
        let code = stream.handle.wait().await.unwrap();
        assert_ne!(code, 0);
    }

    #[tokio::test]
    async fn write_file_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/stop-file");
        let path_str = path.to_string_lossy().into_owned();

        let sandbox = LocalSandbox::new("p");
        assert!(!sandbox.exists(&path_str).await.unwrap());
        sandbox.write_file(&path_str, b"stop").await.unwrap();
        assert!(sandbox.exists(&path_str).await.unwrap());
    }

    #[tokio::test]
    async fn provider_reuses_sandbox_per_project() {
        let provider = LocalProvider::new();
        assert!(provider.get("p").await.unwrap().is_none());

        let first = provider.create("p", &SandboxConfig::default()).await.unwrap();
        let second = provider.create("p", &SandboxConfig::default()).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert!(provider.get("p").await.unwrap().is_some());
    }
}
