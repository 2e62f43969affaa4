// src/worker/local.rs

//! Sandboxes as plain directories on this host

use super::{
    CommandOutput, CommandRunner, CommandSpec, LOG_FILE, Provisioner, Sandbox, SandboxPhase,
    SandboxSpec, sandbox_name,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Runs every sandbox on the local machine
pub struct LocalProvisioner {
    root: PathBuf,
    phases: Mutex<HashMap<String, SandboxPhase>>,
}

impl LocalProvisioner {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            phases: Mutex::new(HashMap::new()),
        })
    }

    fn set_phase(&self, name: &str, phase: SandboxPhase) {
        if let Ok(mut phases) = self.phases.lock() {
            phases.insert(name.to_string(), phase);
        }
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    async fn provision(&self, spec: &SandboxSpec) -> Result<Sandbox> {
        let name = sandbox_name(&spec.task_id, &spec.purpose);
        let work_dir = self.root.join(&name);
        tokio::fs::create_dir_all(&work_dir).await?;
        self.set_phase(&name, SandboxPhase::Running);
        info!("Provisioned local sandbox {} ({})", name, spec.arch);
        Ok(Sandbox {
            name,
            queue: "local".to_string(),
            arch: spec.arch.clone(),
            work_dir,
        })
    }

    async fn phase(&self, sandbox: &Sandbox) -> Result<SandboxPhase> {
        let phases = self
            .phases
            .lock()
            .map_err(|_| Error::InternalError("sandbox phase lock poisoned".to_string()))?;
        Ok(phases.get(&sandbox.name).copied().unwrap_or(SandboxPhase::Unknown))
    }

    async fn destroy(&self, sandbox: &Sandbox) -> Result<()> {
        match tokio::fs::remove_dir_all(&sandbox.work_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.set_phase(&sandbox.name, SandboxPhase::Succeeded);
        debug!("Destroyed local sandbox {}", sandbox.name);
        Ok(())
    }

    fn runner(&self, sandbox: &Sandbox) -> Arc<dyn CommandRunner> {
        Arc::new(LocalRunner {
            work_dir: sandbox.work_dir.clone(),
        })
    }
}

/// Runs commands directly, logging into the sandbox log
pub struct LocalRunner {
    work_dir: PathBuf,
}

impl LocalRunner {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }
}

/// Append a command and its output to a sandbox log
pub(crate) async fn append_log(work_dir: &Path, cmd: &CommandSpec, output: &CommandOutput) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(work_dir.join(LOG_FILE))
        .await?;
    let mut text = format!("+ {}\n", cmd.display());
    for line in output.stdout.lines().chain(output.stderr.lines()) {
        text.push_str(line);
        text.push('\n');
    }
    file.write_all(text.as_bytes()).await?;
    Ok(())
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let cwd = cmd.cwd.clone().unwrap_or_else(|| self.work_dir.clone());
        debug!("Running {} in {}", cmd.display(), cwd.display());

        let output = tokio::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .current_dir(&cwd)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .await
            .map_err(|e| Error::tool(&cmd.program, format!("failed to spawn: {e}")))?;

        let output = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if self.work_dir.exists() {
            append_log(&self.work_dir, cmd, &output).await?;
        }
        Ok(output)
    }
}
