//! Sandbox drivers — mechanism only. A driver can start, exec into, stop,
//! and enumerate isolated runtimes; it knows nothing about idle timeouts,
//! quotas, or threads.

use std::time::Duration;

use chrono::{DateTime, Utc};

use sp_domain::error::{Error, Result};

/// Resource ceilings for a runtime.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub cpus: f64,
    pub memory_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: 1.0,
            memory_mb: 1024,
        }
    }
}

/// Output of one command run inside a runtime.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// A runtime discovered by [`SandboxDriver::list_all`].
#[derive(Debug, Clone)]
pub struct RuntimeListing {
    pub name: String,
    /// `None` when the backend didn't report a parseable start time.
    pub created_at: Option<DateTime<Utc>>,
}

#[async_trait::async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Boot a runtime under the given name. Idempotence is not required;
    /// the manager never creates the same name twice.
    async fn create(&self, name: &str, image: &str, limits: &ResourceLimits) -> Result<()>;

    /// Run a command inside the runtime, bounded by `timeout`.
    async fn exec(&self, name: &str, command: &[String], timeout: Duration) -> Result<ExecOutput>;

    /// Stop and remove the runtime. Removing an already-gone runtime is ok.
    async fn terminate(&self, name: &str) -> Result<()>;

    /// Every runtime (running or not) whose name starts with `prefix`.
    async fn list_all(&self, prefix: &str) -> Result<Vec<RuntimeListing>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Docker CLI driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drives sandboxes through the `docker` binary.
///
/// Containers run detached with `sleep infinity` as PID 1 and no network by
/// default; tool commands go through `docker exec`.
pub struct DockerCliDriver {
    docker_bin: String,
    network: Option<String>,
}

impl DockerCliDriver {
    pub fn new() -> Self {
        Self {
            docker_bin: "docker".into(),
            network: None,
        }
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    async fn run_docker(&self, args: &[String], timeout: Duration) -> Result<ExecOutput> {
        let mut cmd = tokio::process::Command::new(&self.docker_bin);
        cmd.args(args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| Error::Sandbox(format!("failed to spawn docker: {e}")))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout(format!("docker {} timed out", args.first().map(String::as_str).unwrap_or(""))))?
            .map_err(|e| Error::Sandbox(format!("docker wait failed: {e}")))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl Default for DockerCliDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse docker's `{{.CreatedAt}}` format, e.g.
/// `2026-07-30 11:22:33 +0000 UTC`. Unknown formats become `None`.
fn parse_docker_created_at(raw: &str) -> Option<DateTime<Utc>> {
    let parts: Vec<&str> = raw.split_whitespace().take(3).collect();
    if parts.len() < 3 {
        return None;
    }
    let joined = parts.join(" ");
    DateTime::parse_from_str(&joined, "%Y-%m-%d %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait::async_trait]
impl SandboxDriver for DockerCliDriver {
    async fn create(&self, name: &str, image: &str, limits: &ResourceLimits) -> Result<()> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "--cpus".into(),
            format!("{}", limits.cpus),
            "--memory".into(),
            format!("{}m", limits.memory_mb),
        ];
        match &self.network {
            Some(net) => {
                args.push("--network".into());
                args.push(net.clone());
            }
            None => args.push("--network=none".into()),
        }
        args.extend(["--workdir".into(), "/workspace".into()]);
        args.push(image.into());
        args.extend(["sleep".into(), "infinity".into()]);

        let out = self.run_docker(&args, Duration::from_secs(120)).await?;
        if !out.succeeded() {
            return Err(Error::Sandbox(format!(
                "docker run {name} failed: {}",
                out.stderr.trim()
            )));
        }
        tracing::info!(sandbox = name, image, "sandbox container started");
        Ok(())
    }

    async fn exec(&self, name: &str, command: &[String], timeout: Duration) -> Result<ExecOutput> {
        let mut args: Vec<String> = vec!["exec".into(), name.into()];
        args.extend(command.iter().cloned());
        self.run_docker(&args, timeout).await
    }

    async fn terminate(&self, name: &str) -> Result<()> {
        let out = self
            .run_docker(
                &["rm".into(), "-f".into(), name.into()],
                Duration::from_secs(30),
            )
            .await?;
        // "No such container" is success for our purposes.
        if !out.succeeded() && !out.stderr.contains("No such container") {
            return Err(Error::Sandbox(format!(
                "docker rm {name} failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn list_all(&self, prefix: &str) -> Result<Vec<RuntimeListing>> {
        let out = self
            .run_docker(
                &[
                    "ps".into(),
                    "-a".into(),
                    "--format".into(),
                    "{{.Names}}\t{{.CreatedAt}}".into(),
                ],
                Duration::from_secs(30),
            )
            .await?;
        if !out.succeeded() {
            return Err(Error::Sandbox(format!(
                "docker ps failed: {}",
                out.stderr.trim()
            )));
        }

        // The docker name filter is substring-based; filter on the exact
        // prefix here so nothing outside our namespace is ever listed.
        let mut listings = Vec::new();
        for line in out.stdout.lines() {
            let mut cols = line.splitn(2, '\t');
            let name = cols.next().unwrap_or("").trim();
            if name.is_empty() || !name.starts_with(prefix) {
                continue;
            }
            listings.push(RuntimeListing {
                name: name.to_string(),
                created_at: cols.next().and_then(parse_docker_created_at),
            });
        }
        Ok(listings)
    }
}
