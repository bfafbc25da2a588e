//! The build worker's session with the coordinator.
//!
//! The worker is deliberately brittle: anything unexpected from the
//! coordinator ends the process after a farewell, and only a lost or silent
//! session connection is recovered from (by discarding all session state and
//! starting over with a fresh `HELLO`). Every exchange is strictly
//! request/reply; the worker never has more than one request outstanding.

use std::fs::File;
use std::time::Duration;

use rand::Rng;
use wheelwright_proto::{SessionMessage, TransferMessage, WireMessage};

use crate::artifact::{DependencyInspector, PackageDatabase};
use crate::builder::{BuildSettings, Builder};
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::host::HostSupervisor;
use crate::process;
use crate::target::BuildTarget;
use crate::transfer;
use crate::transport::Connection;

/// Where the worker is in its conversation with the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No session connection
    Disconnected,
    /// `HELLO` sent, waiting for the coordinator to assign an id
    AwaitHelloAck,
    /// Asking for (or waiting on a reply about) work
    Idle,
    /// Running a build
    Building,
    /// Serving an artifact on the transfer channel
    Sending,
    /// Finished; the process is about to exit
    Terminated,
}

/// How a session ended without a fatal error
enum SessionEnd {
    /// Coordinator said goodbye
    Terminated,
    /// No reply within the round-trip limit
    TimedOut,
}

/// A build worker.
pub struct Slave {
    config: WorkerConfig,
    target: BuildTarget,
    settings: BuildSettings,
    host: Box<dyn HostSupervisor>,
    inspector: DependencyInspector,
    slave_id: Option<u32>,
    index_url: Option<String>,
    builder: Option<Builder>,
    phase: Phase,
}

impl Slave {
    pub fn new(config: WorkerConfig, target: BuildTarget, host: Box<dyn HostSupervisor>) -> Self {
        let inspector = DependencyInspector::new(
            config.linker_tool.clone(),
            config.timings.inspect_timeout(),
            PackageDatabase::new(config.dpkg_info_dir.clone()),
        );
        Self {
            settings: BuildSettings::from_config(&config),
            config,
            target,
            host,
            inspector,
            slave_id: None,
            index_url: None,
            builder: None,
            phase: Phase::Disconnected,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Identifier assigned by the coordinator in the current session
    pub fn slave_id(&self) -> Option<u32> {
        self.slave_id
    }

    /// Serve the coordinator until it says goodbye or something goes wrong.
    ///
    /// Whatever the outcome, the host supervisor is told the worker is
    /// stopping, any build is removed, and a `BYE` is offered on a live
    /// session connection.
    pub fn run(&mut self) -> Result<()> {
        let (result, conn) = self.run_sessions();

        self.phase = Phase::Terminated;
        self.host.stopping();
        if let Some(mut builder) = self.builder.take() {
            tracing::info!(slave_id = self.slave_id, "Removing temporary build directories");
            builder.clean();
        }
        if let Some(conn) = conn {
            conn.close_with(&SessionMessage::Bye, self.config.timings.farewell_linger());
        }

        match &result {
            Err(WorkerError::Interrupted) => {
                tracing::info!(slave_id = self.slave_id, "Interrupted; worker stopped")
            }
            Err(e) => tracing::error!(slave_id = self.slave_id, error = %e, "Worker stopped"),
            Ok(()) => {}
        }
        result
    }

    fn run_sessions(&mut self) -> (Result<()>, Option<Connection<SessionMessage>>) {
        loop {
            self.phase = Phase::Disconnected;
            let addr = self.config.session_addr();
            let mut conn = match Connection::connect(&addr) {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(addr = %addr, error = %e, "Unable to reach coordinator");
                    if !process::sleep_interruptible(self.config.timings.reconnect_delay()) {
                        return (Err(WorkerError::Interrupted), None);
                    }
                    continue;
                }
            };
            tracing::debug!(addr = %addr, "Connected to session channel");
            self.host.ready();

            match self.serve(&mut conn) {
                Ok(SessionEnd::Terminated) => return (Ok(()), Some(conn)),
                Ok(SessionEnd::TimedOut) => {
                    tracing::warn!(slave_id = self.slave_id, "Timed out waiting for coordinator");
                }
                Err(e) if e.is_network_error() => {
                    tracing::warn!(slave_id = self.slave_id, error = %e, "Lost connection to coordinator");
                }
                Err(e) => return (Err(e), Some(conn)),
            }

            self.reset_session();
            conn.close();
            tracing::warn!("Resetting connection");
            self.host.reloading();
        }
    }

    /// One connection's worth of request/reply exchanges
    fn serve(&mut self, conn: &mut Connection<SessionMessage>) -> Result<SessionEnd> {
        self.phase = Phase::AwaitHelloAck;
        let mut request = Some(SessionMessage::Hello {
            timeout_secs: self.config.build_timeout_secs,
            impl_tag: self.target.impl_tag.clone(),
            abi_tag: self.target.abi_tag.clone(),
            platform_tag: self.target.platform_tag.clone(),
        });

        while let Some(msg) = request {
            tracing::trace!(tag = msg.tag(), "Sending request");
            conn.send(&msg)?;
            let Some(reply) = conn.recv_timeout(self.config.timings.reply_timeout())? else {
                return Ok(SessionEnd::TimedOut);
            };
            tracing::trace!(tag = reply.tag(), "Received reply");
            request = self.handle_reply(reply)?;
        }
        Ok(SessionEnd::Terminated)
    }

    /// Forget everything tied to the lost session
    fn reset_session(&mut self) {
        if let Some(mut builder) = self.builder.take() {
            tracing::warn!(
                package = builder.package(),
                version = builder.version(),
                "Discarding current build"
            );
            builder.clean();
        }
        self.slave_id = None;
        self.index_url = None;
    }

    /// Dispatch one coordinator reply; `None` ends the session.
    fn handle_reply(&mut self, reply: SessionMessage) -> Result<Option<SessionMessage>> {
        match reply {
            SessionMessage::Ack {
                worker_id,
                index_url,
            } => self.do_ack(worker_id, index_url),
            SessionMessage::Sleep => self.do_sleep(),
            SessionMessage::Build { package, version } => self.do_build(package, version),
            SessionMessage::Send { filename } => self.do_send(&filename),
            SessionMessage::Done => self.do_done(),
            SessionMessage::Bye => self.do_bye(),
            other @ (SessionMessage::Hello { .. }
            | SessionMessage::Idle
            | SessionMessage::Built(_)
            | SessionMessage::Sent) => Err(WorkerError::Protocol(format!(
                "Invalid message from coordinator: {}",
                other.tag()
            ))),
        }
    }

    fn require_hello(&self, what: &str) -> Result<u32> {
        self.slave_id
            .ok_or_else(|| WorkerError::Protocol(format!("{} before hello", what)))
    }

    fn do_ack(&mut self, worker_id: u32, index_url: String) -> Result<Option<SessionMessage>> {
        if self.slave_id.is_some() {
            return Err(WorkerError::Protocol("Duplicate hello".to_string()));
        }
        if worker_id == 0 {
            return Err(WorkerError::Protocol("Invalid worker id 0".to_string()));
        }
        self.slave_id = Some(worker_id);
        self.index_url = Some(index_url);
        self.phase = Phase::Idle;
        tracing::info!(slave_id = worker_id, "Connected to coordinator");
        Ok(Some(SessionMessage::Idle))
    }

    fn do_sleep(&mut self) -> Result<Option<SessionMessage>> {
        let slave_id = self.require_hello("Sleep")?;
        let timings = &self.config.timings;
        let (lo, hi) = (
            timings.sleep_min_ms.min(timings.sleep_max_ms),
            timings.sleep_min_ms.max(timings.sleep_max_ms),
        );
        let pause = Duration::from_millis(rand::rng().random_range(lo..=hi));
        tracing::info!(slave_id, pause_ms = pause.as_millis() as u64, "No available jobs; sleeping");
        if !process::sleep_interruptible(pause) {
            return Err(WorkerError::Interrupted);
        }
        Ok(Some(SessionMessage::Idle))
    }

    fn do_build(&mut self, package: String, version: String) -> Result<Option<SessionMessage>> {
        let slave_id = self.require_hello("Build")?;
        if self.builder.is_some() {
            return Err(WorkerError::Protocol("Last build still exists".to_string()));
        }
        let index_url = self.index_url.clone().unwrap_or_default();

        tracing::warn!(slave_id, package = %package, version = %version, "Building package");
        self.phase = Phase::Building;
        let builder = self.builder.insert(Builder::new(package, version));
        if builder.build(&self.settings, &index_url, self.host.as_ref())? {
            tracing::info!(slave_id, duration_secs = builder.duration().as_secs_f64(), "Build succeeded");
        } else {
            tracing::warn!(slave_id, duration_secs = builder.duration().as_secs_f64(), "Build failed");
        }
        let report = builder.report(&self.inspector, self.host.as_ref())?;
        self.phase = Phase::Idle;
        Ok(Some(SessionMessage::Built(report)))
    }

    fn do_send(&mut self, filename: &str) -> Result<Option<SessionMessage>> {
        let slave_id = self.require_hello("Send")?;
        let builder = self
            .builder
            .as_ref()
            .ok_or_else(|| WorkerError::Protocol("Send before build".to_string()))?;
        if !builder.status() {
            return Err(WorkerError::Protocol("Send after failed build".to_string()));
        }
        let artifact = builder.find_artifact(filename)?;

        tracing::info!(slave_id, filename, "Sending {} to coordinator", filename);
        self.phase = Phase::Sending;
        let mut file = File::open(artifact.path())?;
        let mut channel: Connection<TransferMessage> =
            Connection::connect(&self.config.transfer_addr())?;
        let stats = transfer::serve(
            &mut channel,
            &mut file,
            slave_id,
            self.config.timings.transfer_retry(),
            self.host.as_ref(),
        )?;
        channel.close();
        tracing::debug!(
            slave_id,
            filename,
            chunks = stats.chunks,
            bytes = stats.bytes,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "Transfer complete"
        );

        self.phase = Phase::Idle;
        Ok(Some(SessionMessage::Sent))
    }

    fn do_done(&mut self) -> Result<Option<SessionMessage>> {
        let slave_id = self.require_hello("Done")?;
        let mut builder = self
            .builder
            .take()
            .ok_or_else(|| WorkerError::Protocol("Done before build".to_string()))?;
        tracing::info!(slave_id, "Removing temporary build directories");
        builder.clean();
        Ok(Some(SessionMessage::Idle))
    }

    fn do_bye(&mut self) -> Result<Option<SessionMessage>> {
        tracing::warn!(slave_id = self.slave_id, "Coordinator requested termination");
        if let Some(mut builder) = self.builder.take() {
            tracing::info!(slave_id = self.slave_id, "Removing temporary build directories");
            builder.clean();
        }
        self.phase = Phase::Terminated;
        Ok(None)
    }
}
