// src/worker/mod.rs

//! Build sandboxes
//!
//! A sandbox is an isolated place to run one stage of a build (SRPM or a
//! single arch) on a host of the right architecture. Provisioners create and
//! tear sandboxes down; a [`CommandRunner`] executes tools inside them. The
//! sandbox work directory is shared with the host at the same path, so
//! tools hand files in and out through it.
//!
//! Command output is appended to `sandbox.log` in the work directory, which
//! [`logs::ingest`] follows into the task log stream.

mod local;
pub mod logs;
mod podman;

pub use local::{LocalProvisioner, LocalRunner};
pub use podman::PodmanProvisioner;

use crate::config::{BuilderConfig, Environment, ProvisionerKind};
use crate::error::{Error, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const LOG_FILE: &str = "sandbox.log";
pub const EXT_ARCHES_QUEUE: &str = "peridot-provision-only-extarches";
pub const DEFAULT_QUEUE: &str = "peridot-provision";

/// What to provision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub task_id: String,
    pub parent_task_id: String,
    pub project_id: String,
    /// Short tag such as `srpm` or `b-x86_64`
    pub purpose: String,
    /// Concrete arch (never `noarch`)
    pub arch: String,
    pub high_resource: bool,
    pub privileged: bool,
}

/// A provisioned sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sandbox {
    pub name: String,
    pub queue: String,
    pub arch: String,
    pub work_dir: PathBuf,
}

impl Sandbox {
    pub fn log_path(&self) -> PathBuf {
        self.work_dir.join(LOG_FILE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// A command to run inside a sandbox
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// `program arg1 arg2` for log lines
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Executes commands in a sandbox
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput>;

    /// Run and turn a non-zero exit into a tool error
    async fn run_checked(&self, tool: &str, cmd: &CommandSpec) -> Result<CommandOutput> {
        let output = self.run(cmd).await?;
        if !output.success() {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            return Err(Error::tool(
                tool,
                format!("{} exited with {}: {}", cmd.display(), output.status, detail),
            ));
        }
        Ok(output)
    }
}

/// Creates and destroys sandboxes
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, spec: &SandboxSpec) -> Result<Sandbox>;

    async fn phase(&self, sandbox: &Sandbox) -> Result<SandboxPhase>;

    /// Remove the sandbox; a sandbox that no longer exists is not an error
    async fn destroy(&self, sandbox: &Sandbox) -> Result<()>;

    fn runner(&self, sandbox: &Sandbox) -> Arc<dyn CommandRunner>;

    /// Log lines appended since byte `offset`, and the new offset
    async fn read_logs(&self, sandbox: &Sandbox, offset: u64) -> Result<(Vec<String>, u64)> {
        read_log_file(&sandbox.log_path(), offset)
    }
}

/// Open the provisioner selected in configuration
pub fn open(config: &BuilderConfig, env: &Environment) -> Result<Arc<dyn Provisioner>> {
    Ok(match config.worker.provisioner {
        ProvisionerKind::Local => Arc::new(LocalProvisioner::new(&config.worker.work_dir)?),
        ProvisionerKind::Podman => Arc::new(PodmanProvisioner::new(config, env.clone())?),
    })
}

/// Complete lines of a log file from `offset`
pub fn read_log_file(path: &Path, offset: u64) -> Result<(Vec<String>, u64)> {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), offset)),
        Err(e) => return Err(e.into()),
    };
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    // Keep a trailing partial line for the next read
    let complete = match buf.iter().rposition(|b| *b == b'\n') {
        Some(pos) => pos + 1,
        None => return Ok((Vec::new(), offset)),
    };
    let lines = String::from_utf8_lossy(&buf[..complete])
        .lines()
        .map(str::to_string)
        .collect();
    Ok((lines, offset + complete as u64))
}

/// Container platform arch for an RPM arch
pub fn goarch(arch: &str) -> &str {
    match arch {
        "aarch64" => "arm64",
        "i686" | "i386" | "x86_64" => "amd64",
        other => other,
    }
}

/// Resolve the arch a sandbox actually runs on.
///
/// `noarch` picks at random from the preferred arches the project builds
/// for, falling back to any project arch; `i686` runs on `x86_64`.
pub fn placement_arch(requested: &str, project_archs: &[String], preferred: &[String]) -> Result<String> {
    let arch = if requested == "noarch" {
        let mut candidates: Vec<&String> = project_archs
            .iter()
            .filter(|a| preferred.contains(a))
            .collect();
        if candidates.is_empty() {
            candidates = project_archs.iter().filter(|a| *a != "noarch").collect();
        }
        let mut rng = rand::thread_rng();
        candidates.shuffle(&mut rng);
        candidates
            .first()
            .map(|a| a.to_string())
            .ok_or_else(|| Error::InvalidArgument("project has no arches to place noarch work".to_string()))?
    } else {
        requested.to_string()
    };

    Ok(if arch == "i686" { "x86_64".to_string() } else { arch })
}

/// Queue serving an arch; some arches only exist on a dedicated site
pub fn queue_for(arch: &str, ext_arches: &[String]) -> &'static str {
    if ext_arches.iter().any(|a| a == arch) {
        EXT_ARCHES_QUEUE
    } else {
        DEFAULT_QUEUE
    }
}

/// Sandbox name for a task and purpose
pub fn sandbox_name(task_id: &str, purpose: &str) -> String {
    format!("pb-{}-{}", task_id, purpose).replace('_', "-")
}

/// Environment passed into every sandbox
pub fn sandbox_env(env: &Environment, spec: &SandboxSpec, queue: &str) -> Vec<(String, String)> {
    let mut vars = vec![
        ("RESF_ENV".to_string(), env.resf_env.clone()),
        ("RESF_NS".to_string(), env.namespace()),
        ("REAL_BUILD_ARCH".to_string(), spec.arch.clone()),
        ("PERIDOTBUILDER_TASK_QUEUE".to_string(), queue.to_string()),
        ("PROJECT_ID".to_string(), spec.project_id.clone()),
        ("TASK_ID".to_string(), spec.task_id.clone()),
        ("PARENT_TASK_ID".to_string(), spec.parent_task_id.clone()),
    ];
    let optional = [
        ("RESF_FORCE_NS", &env.force_namespace),
        ("LOCALSTACK_ENDPOINT", &env.localstack_endpoint),
        ("KEYKEEPER_GRPC_ENDPOINT_OVERRIDE", &env.keykeeper_endpoint_override),
        ("YUMREPOFS_HTTP_ENDPOINT_OVERRIDE", &env.yumrepofs_endpoint_override),
        ("AWS_ACCESS_KEY_ID", &env.aws_access_key_id),
        ("AWS_SECRET_ACCESS_KEY", &env.aws_secret_access_key),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            vars.push((key.to_string(), value.clone()));
        }
    }
    vars
}
