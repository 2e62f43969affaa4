// src/worker/podman.rs

//! Sandboxes as long-running containers driven through a container CLI
//!
//! Each sandbox is a detached container that sleeps until destroyed; tools
//! run in it through `exec`. The work directory is bind-mounted at the same
//! path so host and container agree on file locations.

use super::local::append_log;
use super::{
    CommandOutput, CommandRunner, CommandSpec, Provisioner, Sandbox, SandboxPhase, SandboxSpec,
    goarch, queue_for, sandbox_env, sandbox_name,
};
use crate::config::{BuilderConfig, Environment};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub struct PodmanProvisioner {
    cli: PathBuf,
    image: String,
    root: PathBuf,
    ext_arches: Vec<String>,
    env: Environment,
}

impl PodmanProvisioner {
    pub fn new(config: &BuilderConfig, env: Environment) -> Result<Self> {
        let cli = which::which(&config.worker.container_cli).map_err(|e| {
            Error::ConfigError(format!(
                "container CLI {} not found: {}",
                config.worker.container_cli, e
            ))
        })?;
        std::fs::create_dir_all(&config.worker.work_dir)?;
        Ok(Self {
            cli,
            image: config.worker.image.clone(),
            root: config.worker.work_dir.clone(),
            ext_arches: config.worker.ext_arches.clone(),
            env,
        })
    }

    async fn cli(&self, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(&self.cli)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::tool("podman", format!("failed to spawn: {e}")))?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn run_args(&self, spec: &SandboxSpec, name: &str, work_dir: &std::path::Path) -> Vec<String> {
        let queue = queue_for(&spec.arch, &self.ext_arches);
        let dir = work_dir.display().to_string();
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--platform".to_string(),
            format!("linux/{}", goarch(&spec.arch)),
            "--label".to_string(),
            format!("peridot.rockylinux.org/task-id={}", spec.task_id),
            "--volume".to_string(),
            format!("{dir}:{dir}:Z"),
            "--workdir".to_string(),
            dir.clone(),
        ];
        if spec.privileged {
            args.extend(["--privileged".to_string(), "--user".to_string(), "0".to_string()]);
        }
        if spec.high_resource && self.env.localstack_endpoint.is_none() {
            args.extend([
                "--cpus".to_string(),
                "1".to_string(),
                "--memory".to_string(),
                "4g".to_string(),
            ]);
        }
        if self.env.pin_dns() {
            args.extend([
                "--dns".to_string(),
                "1.1.1.1".to_string(),
                "--dns".to_string(),
                "1.0.0.1".to_string(),
            ]);
        }
        for (key, value) in sandbox_env(&self.env, spec, queue) {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        args.extend([self.image.clone(), "sleep".to_string(), "infinity".to_string()]);
        args
    }
}

#[async_trait]
impl Provisioner for PodmanProvisioner {
    async fn provision(&self, spec: &SandboxSpec) -> Result<Sandbox> {
        let name = sandbox_name(&spec.task_id, &spec.purpose);
        let work_dir = self.root.join(&name);
        tokio::fs::create_dir_all(&work_dir).await?;

        let out = self.cli(&self.run_args(spec, &name, &work_dir)).await?;
        if !out.success() && !out.stderr.contains("already in use") {
            return Err(Error::tool("podman", format!("run {}: {}", name, out.stderr.trim())));
        }

        info!("Provisioned container sandbox {} ({})", name, spec.arch);
        Ok(Sandbox {
            name,
            queue: queue_for(&spec.arch, &self.ext_arches).to_string(),
            arch: spec.arch.clone(),
            work_dir,
        })
    }

    async fn phase(&self, sandbox: &Sandbox) -> Result<SandboxPhase> {
        let out = self
            .cli(&[
                "inspect".to_string(),
                "--format".to_string(),
                "{{.State.Status}} {{.State.ExitCode}}".to_string(),
                sandbox.name.clone(),
            ])
            .await?;
        if !out.success() {
            return Ok(SandboxPhase::Unknown);
        }
        let mut fields = out.stdout.split_whitespace();
        let state = fields.next().unwrap_or_default();
        let code = fields.next().unwrap_or("0");
        Ok(match state {
            "created" | "configured" | "initialized" => SandboxPhase::Pending,
            "running" | "paused" => SandboxPhase::Running,
            "exited" | "stopped" if code == "0" => SandboxPhase::Succeeded,
            "exited" | "stopped" => SandboxPhase::Failed,
            _ => SandboxPhase::Unknown,
        })
    }

    async fn destroy(&self, sandbox: &Sandbox) -> Result<()> {
        let out = self
            .cli(&["rm".to_string(), "--force".to_string(), sandbox.name.clone()])
            .await?;
        if !out.success() {
            let stderr = out.stderr.to_lowercase();
            if !stderr.contains("no such container") && !stderr.contains("not found") {
                return Err(Error::tool(
                    "podman",
                    format!("rm {}: {}", sandbox.name, out.stderr.trim()),
                ));
            }
            debug!("Sandbox {} already gone", sandbox.name);
        }
        if let Err(e) = tokio::fs::remove_dir_all(&sandbox.work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", sandbox.work_dir.display(), e);
            }
        }
        Ok(())
    }

    fn runner(&self, sandbox: &Sandbox) -> Arc<dyn CommandRunner> {
        Arc::new(ExecRunner {
            cli: self.cli.clone(),
            container: sandbox.name.clone(),
            work_dir: sandbox.work_dir.clone(),
        })
    }
}

/// Runs commands through `exec` in a container
pub struct ExecRunner {
    cli: PathBuf,
    container: String,
    work_dir: PathBuf,
}

impl ExecRunner {
    fn exec_args(&self, cmd: &CommandSpec) -> Vec<String> {
        let cwd = cmd.cwd.clone().unwrap_or_else(|| self.work_dir.clone());
        let mut args = vec![
            "exec".to_string(),
            "--workdir".to_string(),
            cwd.display().to_string(),
        ];
        for (key, value) in &cmd.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(self.container.clone());
        args.push(cmd.program.clone());
        args.extend(cmd.args.iter().cloned());
        args
    }
}

#[async_trait]
impl CommandRunner for ExecRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        debug!("Exec in {}: {}", self.container, cmd.display());
        let output = Command::new(&self.cli)
            .args(self.exec_args(cmd))
            .output()
            .await
            .map_err(|e| Error::tool("podman", format!("failed to spawn exec: {e}")))?;
        let output = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        append_log(&self.work_dir, cmd, &output).await?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provisioner(env: Environment) -> PodmanProvisioner {
        PodmanProvisioner {
            cli: PathBuf::from("/usr/bin/podman"),
            image: "builder:1".to_string(),
            root: PathBuf::from("/var/lib/peridot"),
            ext_arches: vec!["s390x".to_string()],
            env,
        }
    }

    fn spec(arch: &str) -> SandboxSpec {
        SandboxSpec {
            task_id: "t1".to_string(),
            parent_task_id: "p1".to_string(),
            project_id: "proj".to_string(),
            purpose: format!("b-{arch}"),
            arch: arch.to_string(),
            high_resource: true,
            privileged: true,
        }
    }

    #[test]
    fn test_run_args_for_arch_build() {
        let env = Environment::from_lookup(|k| (k == "PERIDOT_SITE").then(|| "extarches".to_string()));
        let p = provisioner(env);
        let args = p.run_args(&spec("aarch64"), "pb-t1-b-aarch64", std::path::Path::new("/w"));
        let joined = args.join(" ");
        assert!(joined.contains("--platform linux/arm64"));
        assert!(joined.contains("--privileged --user 0"));
        assert!(joined.contains("--cpus 1 --memory 4g"));
        assert!(joined.contains("--dns 1.1.1.1 --dns 1.0.0.1"));
        assert!(joined.contains("--env REAL_BUILD_ARCH=aarch64"));
        assert!(joined.contains("--env PERIDOTBUILDER_TASK_QUEUE=peridot-provision"));
        assert!(joined.ends_with("builder:1 sleep infinity"));
    }

    #[test]
    fn test_localstack_disables_resource_requests() {
        let env = Environment::from_lookup(|k| {
            (k == "LOCALSTACK_ENDPOINT").then(|| "http://localstack:4566".to_string())
        });
        let args = provisioner(env).run_args(&spec("s390x"), "n", std::path::Path::new("/w"));
        let joined = args.join(" ");
        assert!(!joined.contains("--cpus"));
        assert!(joined.contains("PERIDOTBUILDER_TASK_QUEUE=peridot-provision-only-extarches"));
    }

    #[test]
    fn test_exec_args() {
        let runner = ExecRunner {
            cli: PathBuf::from("podman"),
            container: "pb-x".to_string(),
            work_dir: PathBuf::from("/w"),
        };
        let args = runner.exec_args(&CommandSpec::new("mock").arg("--help").env("A", "b"));
        assert_eq!(
            args,
            vec!["exec", "--workdir", "/w", "--env", "A=b", "pb-x", "mock", "--help"]
        );
    }
}
