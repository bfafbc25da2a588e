//! Build supervision.
//!
//! A [`Builder`] owns one build job: it runs the build tool in a fresh
//! temporary directory, enforces the wall-clock limit, collects the log and
//! the produced wheels, and deletes everything again on [`Builder::clean`].

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use wheelwright_proto::BuildReport;

use crate::artifact::{Artifact, DependencyInspector};
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::host::HostSupervisor;
use crate::process;

const LOG_NAME: &str = "build.log";

/// How a supervised run of the build tool ended.
#[derive(Debug)]
enum ToolOutcome {
    Exited(ExitStatus),
    TimedOut { killed: bool },
    Interrupted,
}

/// Everything a build needs besides the package itself.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub build_tool: PathBuf,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub terminate_grace: Duration,
    pub memory_limit_bytes: u64,
}

impl BuildSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            build_tool: config.build_tool.clone(),
            timeout: config.build_timeout(),
            poll_interval: config.timings.build_poll(),
            terminate_grace: config.timings.terminate_grace(),
            memory_limit_bytes: config.memory_limit_bytes,
        }
    }
}

/// One build job and its outputs.
#[derive(Debug)]
pub struct Builder {
    package: String,
    version: String,
    wheel_dir: Option<TempDir>,
    duration: Duration,
    output: String,
    status: bool,
    artifacts: Vec<Artifact>,
}

impl Builder {
    pub fn new(package: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            version: version.into(),
            wheel_dir: None,
            duration: Duration::ZERO,
            output: String::new(),
            status: false,
            artifacts: Vec::new(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn status(&self) -> bool {
        self.status
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    /// Working directory, while it exists
    pub fn wheel_dir(&self) -> Option<&Path> {
        self.wheel_dir.as_ref().map(|d| d.path())
    }

    /// Run the build to completion and return whether it succeeded.
    ///
    /// Failures of the build tool itself (including a missing executable
    /// and an enforced timeout) are not errors: they produce an
    /// unsuccessful build whose log says what happened.
    pub fn build(
        &mut self,
        settings: &BuildSettings,
        index_url: &str,
        host: &dyn HostSupervisor,
    ) -> Result<bool> {
        let dir = tempfile::Builder::new()
            .prefix("wheelwright-build-")
            .tempdir()?;
        let wheel_dir = dir.path().to_path_buf();
        self.wheel_dir = Some(dir);
        let log_path = wheel_dir.join(LOG_NAME);

        tracing::debug!(
            package = %self.package,
            version = %self.version,
            dir = %wheel_dir.display(),
            "Starting build"
        );

        let start = Instant::now();
        let mut error: Option<String> = None;
        match self.run_tool(settings, index_url, &wheel_dir, &log_path, start, host) {
            Ok(ToolOutcome::Exited(status)) => self.status = status.success(),
            Ok(ToolOutcome::TimedOut { killed }) => {
                self.status = false;
                error = Some(format!(
                    "Build timed out after {}s and was {}",
                    settings.timeout.as_secs(),
                    if killed { "killed" } else { "terminated" }
                ));
            }
            Ok(ToolOutcome::Interrupted) => {
                self.status = false;
                self.duration = start.elapsed();
                return Err(WorkerError::Interrupted);
            }
            Err(e) => {
                self.status = false;
                error = Some(format!("Failed to run {}: {}", settings.build_tool.display(), e));
            }
        }
        self.duration = start.elapsed();

        self.output = match fs::read(&log_path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        };
        if let Some(error) = error {
            self.output.push('\n');
            self.output.push_str(&error);
        }

        self.artifacts.clear();
        if self.status {
            for path in find_wheels(&wheel_dir)? {
                self.artifacts.push(Artifact::new(path)?);
            }
        }
        Ok(self.status)
    }

    /// Spawn and supervise the build tool.
    ///
    /// The tool runs in its own process group so a timeout or an interrupt
    /// stops everything it started, not just the tool itself.
    fn run_tool(
        &self,
        settings: &BuildSettings,
        index_url: &str,
        wheel_dir: &Path,
        log_path: &Path,
        start: Instant,
        host: &dyn HostSupervisor,
    ) -> std::io::Result<ToolOutcome> {
        let mut cmd = Command::new(&settings.build_tool);
        cmd.args(build_args(
            index_url,
            wheel_dir,
            log_path,
            &self.package,
            &self.version,
        ))
        .env("GIT_ALLOW_PROTOCOL", "file")
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
        process::apply_memory_limit(&mut cmd, settings.memory_limit_bytes);
        process::isolate_process_group(&mut cmd);

        let mut child = cmd.spawn()?;
        loop {
            host.watchdog_ping();
            if let Some(status) = process::wait_timeout(&mut child, settings.poll_interval)? {
                return Ok(ToolOutcome::Exited(status));
            }
            if process::interrupted() {
                tracing::warn!(
                    package = %self.package,
                    version = %self.version,
                    "Interrupted; stopping build"
                );
                process::terminate(&mut child, settings.terminate_grace)?;
                return Ok(ToolOutcome::Interrupted);
            }
            if start.elapsed() > settings.timeout {
                tracing::warn!(
                    package = %self.package,
                    version = %self.version,
                    "Build exceeded its time limit; terminating"
                );
                let (_, killed) = process::terminate(&mut child, settings.terminate_grace)?;
                return Ok(ToolOutcome::TimedOut { killed });
            }
        }
    }

    /// The artifact whose filename is exactly `filename`.
    ///
    /// Zero or several matches break the coordinator's contract.
    pub fn find_artifact(&self, filename: &str) -> Result<&Artifact> {
        let mut matches = self.artifacts.iter().filter(|a| a.filename() == filename);
        match (matches.next(), matches.next()) {
            (Some(artifact), None) => Ok(artifact),
            (None, _) => Err(WorkerError::Protocol(format!(
                "Send for unknown artifact {}",
                filename
            ))),
            (Some(_), Some(_)) => Err(WorkerError::Protocol(format!(
                "Send for ambiguous artifact {}",
                filename
            ))),
        }
    }

    /// Wire report of the finished build
    pub fn report(
        &mut self,
        inspector: &DependencyInspector,
        host: &dyn HostSupervisor,
    ) -> Result<BuildReport> {
        let artifacts = self
            .artifacts
            .iter_mut()
            .map(|a| a.summary(inspector, host))
            .collect::<Result<Vec<_>>>()?;
        Ok(BuildReport {
            package: self.package.clone(),
            version: self.version.clone(),
            success: self.status,
            duration_secs: self.duration.as_secs_f64(),
            log: self.output.clone(),
            artifacts,
        })
    }

    /// Delete the working directory and everything in it. Safe to repeat.
    pub fn clean(&mut self) {
        self.artifacts.clear();
        if let Some(dir) = self.wheel_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!(dir = %path.display(), error = %e, "Failed to remove build directory");
            }
        }
    }
}

impl Drop for Builder {
    fn drop(&mut self) {
        self.clean();
    }
}

/// Arguments passed to the build tool
pub fn build_args(
    index_url: &str,
    wheel_dir: &Path,
    log_path: &Path,
    package: &str,
    version: &str,
) -> Vec<String> {
    vec![
        "wheel".to_string(),
        format!("--index-url={}", index_url),
        format!("--wheel-dir={}", wheel_dir.display()),
        format!("--log={}", log_path.display()),
        "--no-deps".to_string(),
        "--no-cache-dir".to_string(),
        "--exists-action=w".to_string(),
        "--disable-pip-version-check".to_string(),
        format!("{}=={}", package, version),
    ]
}

/// Wheels in `dir`, sorted by path
fn find_wheels(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/*.whl",
        glob::Pattern::escape(&dir.display().to_string())
    );
    let paths = glob::glob(&pattern)
        .map_err(|e| WorkerError::Config(format!("Bad wheel pattern {}: {}", pattern, e)))?;
    let mut wheels = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) => wheels.push(path),
            Err(e) => tracing::warn!(error = %e, "Skipping unreadable build output"),
        }
    }
    wheels.sort();
    Ok(wheels)
}
