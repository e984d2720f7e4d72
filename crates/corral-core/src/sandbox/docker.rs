//! Docker sandbox backend.
//!
//! One container per project, created without bind-mounting the host
//! repository and kept alive with `sleep infinity`. Agent execs run inside
//! via `docker exec`; stop-files are written through an stdin-piped `cat`
//! so no host path is shared with the container.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use corral_db::models::SandboxStatus;

use crate::error::{CoreError, CoreResult, ErrorCode};

use super::{
    line_stream, ExecHandle, ExecOutput, ExecSpec, ExecStream, Sandbox, SandboxConfig,
    SandboxProvider,
};

/// Escape a string for single-quoted use in `sh -c`.
fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Sanitize an id for use in a Docker container name.
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// A per-project Docker container.
pub struct DockerSandbox {
    container_id: String,
    container_name: String,
    status: Mutex<SandboxStatus>,
}

impl DockerSandbox {
    fn set_status(&self, status: SandboxStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

struct DockerExecHandle {
    /// The `docker exec` client process. Its lifetime tracks the
    /// in-container process: exec'd processes die with their client on
    /// kill because we run them without a detached tty.
    child: Child,
}

#[async_trait]
impl ExecHandle for DockerExecHandle {
    async fn wait(&mut self) -> Result<i32> {
        let status = self
            .child
            .wait()
            .await
            .context("failed to wait on docker exec")?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) -> Result<()> {
        self.child
            .kill()
            .await
            .context("failed to kill docker exec")?;
        Ok(())
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.container_id
    }

    async fn status(&self) -> SandboxStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn exec(&self, cmd: &str, args: &[&str], workdir: Option<&str>) -> Result<ExecOutput> {
        let mut docker_args = vec!["exec".to_string()];
        if let Some(dir) = workdir {
            docker_args.push("-w".to_string());
            docker_args.push(dir.to_string());
        }
        docker_args.push(self.container_id.clone());
        docker_args.push(cmd.to_string());
        docker_args.extend(args.iter().map(|a| a.to_string()));

        let output = Command::new("docker")
            .args(&docker_args)
            .output()
            .await
            .context("failed to run docker exec")?;

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
                format!("container {} is {status}", self.container_name),
            ));
        }

        let mut command = Command::new("docker");
        command.arg("exec");
        for (key, value) in &spec.env {
            command.arg("-e");
            command.arg(format!("{key}={value}"));
        }
        if let Some(dir) = &spec.workdir {
            command.arg("-w");
            command.arg(dir);
        }
        command.arg(&self.container_id);
        command.arg(&spec.cmd);
        command.args(&spec.args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            CoreError::new(
                ErrorCode::ExecStreamFailed,
                format!("failed to spawn docker exec: {e}"),
            )
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            CoreError::new(ErrorCode::ExecStreamFailed, "docker exec has no stdout pipe")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            CoreError::new(ErrorCode::ExecStreamFailed, "docker exec has no stderr pipe")
        })?;

        Ok(ExecStream {
            stdout: line_stream(stdout),
            stderr: line_stream(stderr),
            handle: Box::new(DockerExecHandle { child }),
        })
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let script = format!(
            "mkdir -p \"$(dirname {path})\" && cat > {path}",
            path = shell_escape(path),
        );

        let mut child = Command::new("docker")
            .args(["exec", "-i", &self.container_id, "sh", "-c", &script])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn docker exec for write_file")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(contents)
                .await
                .context("failed to pipe file contents into container")?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .context("failed to wait on docker exec write_file")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("write_file inside container failed: {stderr}");
        }

        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let output = Command::new("docker")
            .args(["exec", &self.container_id, "test", "-e", path])
            .output()
            .await
            .context("failed to run docker exec test")?;
        Ok(output.status.success())
    }
}

/// Provider managing one Docker container per project.
#[derive(Default)]
pub struct DockerProvider {
    containers: Mutex<HashMap<String, Arc<DockerSandbox>>>,
}

impl DockerProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn container_name(project_id: &str) -> String {
        format!("corral-{}", sanitize(project_id))
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    async fn get(&self, project_id: &str) -> Result<Option<Arc<dyn Sandbox>>> {
        let containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        Ok(containers
            .get(project_id)
            .cloned()
            .map(|sandbox| sandbox as Arc<dyn Sandbox>))
    }

    async fn create(&self, project_id: &str, config: &SandboxConfig) -> Result<Arc<dyn Sandbox>> {
        {
            let containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = containers.get(project_id) {
                return Ok(Arc::clone(existing) as Arc<dyn Sandbox>);
            }
        }

        let container_name = Self::container_name(project_id);

        // Remove any stale container left by a previous process.
        let _ = Command::new("docker")
            .args(["rm", "-f", &container_name])
            .output()
            .await;

        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            container_name.clone(),
            "-w".to_string(),
            "/workspace".to_string(),
        ];
        args.extend(config.extra_flags.iter().cloned());
        args.push(config.image.clone());
        args.push("sleep".to_string());
        args.push("infinity".to_string());

        let output = Command::new("docker")
            .args(&args)
            .output()
            .await
            .context("failed to run docker create")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("docker create failed: {stderr}");
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let start = Command::new("docker")
            .args(["start", &container_id])
            .output()
            .await
            .context("failed to run docker start")?;
        if !start.status.success() {
            let stderr = String::from_utf8_lossy(&start.stderr).into_owned();
            let _ = Command::new("docker")
                .args(["rm", "-f", &container_id])
                .output()
                .await;
            bail!("docker start failed: {stderr}");
        }

        debug!(project_id, container_id = %container_id, "sandbox container started");

        let sandbox = Arc::new(DockerSandbox {
            container_id,
            container_name,
            status: Mutex::new(SandboxStatus::Running),
        });

        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        containers.insert(project_id.to_string(), Arc::clone(&sandbox));
        Ok(sandbox as Arc<dyn Sandbox>)
    }

    async fn health_check(&self) -> Result<()> {
        let output = Command::new("docker")
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await
            .context("failed to run docker version")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("docker daemon unreachable: {stderr}");
            bail!("docker daemon unreachable: {stderr}");
        }
        Ok(())
    }
}

impl DockerProvider {
    /// Stop and remove a project's container, marking it stopped.
    pub async fn teardown(&self, project_id: &str) -> Result<()> {
        let sandbox = {
            let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
            containers.remove(project_id)
        };
        if let Some(sandbox) = sandbox {
            sandbox.set_status(SandboxStatus::Stopped);
            let output = Command::new("docker")
                .args(["rm", "-f", &sandbox.container_id])
                .output()
                .await
                .context("failed to run docker rm")?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.contains("No such container") {
                    bail!("docker rm failed: {stderr}");
                }
            }
        }
        Ok(())
    }
}
