//! End-to-end sessions against a scripted coordinator on localhost.
#![cfg(unix)]

use std::fs;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use wheelwright::artifact::checksum::checksum_reader;
use wheelwright::config::{Timings, WorkerConfig};
use wheelwright::error::WorkerError;
use wheelwright::host::HostSupervisor;
use wheelwright::transport::Connection;
use wheelwright::{BuildTarget, Slave};
use wheelwright_proto::{frame_body, SessionMessage, TransferMessage};

const WHEEL: &str = "foo-0.1-cp34-cp34m-linux_armv7l.whl";
const WHEEL_BYTES: &[u8] = b"wheel-bytes-0123456789";
const WAIT: Duration = Duration::from_secs(30);

// Tests write executables and then spawn them; forks from a parallel test
// could hold the script open for writing and make exec fail.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

/// Host supervisor that records every notification
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<&'static str>>>);

impl Recorder {
    fn events(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }

    fn push(&self, event: &'static str) {
        self.0.lock().unwrap().push(event);
    }
}

impl HostSupervisor for Recorder {
    fn ready(&self) {
        self.push("ready");
    }
    fn reloading(&self) {
        self.push("reloading");
    }
    fn stopping(&self) {
        self.push("stopping");
    }
    fn watchdog_ping(&self) {}
}

enum Tool {
    Succeeds,
    Fails,
}

/// Listeners standing in for the coordinator, plus scratch space for the
/// fake build tool
struct Coordinator {
    session: TcpListener,
    transfer: TcpListener,
    scratch: TempDir,
}

impl Coordinator {
    fn new() -> Self {
        Self {
            session: TcpListener::bind("127.0.0.1:0").unwrap(),
            transfer: TcpListener::bind("127.0.0.1:0").unwrap(),
            scratch: tempfile::tempdir().unwrap(),
        }
    }

    /// File the build tool writes its working directory into
    fn marker(&self) -> PathBuf {
        self.scratch.path().join("wheel-dir")
    }

    fn built_dir(&self) -> PathBuf {
        PathBuf::from(fs::read_to_string(self.marker()).unwrap().trim())
    }

    fn write_tool(&self, tool: Tool) -> PathBuf {
        let body = match tool {
            Tool::Succeeds => format!(
                "printf '{}' > \"$dir/{}\"",
                String::from_utf8_lossy(WHEEL_BYTES),
                WHEEL
            ),
            Tool::Fails => "echo 'error: no matching distribution' >> \"$log\"\nexit 1".to_string(),
        };
        let script = format!(
            "#!/bin/sh\n\
             for arg in \"$@\"; do\n\
             case \"$arg\" in\n\
             --wheel-dir=*) dir=\"${{arg#--wheel-dir=}}\" ;;\n\
             --log=*) log=\"${{arg#--log=}}\" ;;\n\
             esac\n\
             done\n\
             echo \"$dir\" > \"{}\"\n\
             echo \"building $*\" > \"$log\"\n\
             {}\n",
            self.marker().display(),
            body
        );
        let path = self.scratch.path().join("fake-pip");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config(&self, tool: Tool) -> WorkerConfig {
        WorkerConfig {
            master: "127.0.0.1".to_string(),
            session_port: self.session.local_addr().unwrap().port(),
            transfer_port: self.transfer.local_addr().unwrap().port(),
            build_timeout_secs: 60,
            build_tool: self.write_tool(tool),
            dpkg_info_dir: self.scratch.path().join("no-dpkg"),
            timings: Timings {
                reply_timeout_ms: 10_000,
                sleep_min_ms: 100,
                sleep_max_ms: 200,
                build_poll_ms: 50,
                terminate_grace_ms: 200,
                reconnect_delay_ms: 50,
                farewell_linger_ms: 500,
                ..Timings::default()
            },
            ..Default::default()
        }
    }

    fn accept(&self) -> Connection<SessionMessage> {
        Connection::from_stream(self.accept_raw()).unwrap()
    }

    fn accept_raw(&self) -> TcpStream {
        self.session.accept().unwrap().0
    }

    fn accept_transfer(&self) -> Connection<TransferMessage> {
        Connection::from_stream(self.transfer.accept().unwrap().0).unwrap()
    }
}

fn target() -> BuildTarget {
    BuildTarget {
        impl_tag: "34".to_string(),
        abi_tag: "cp34m".to_string(),
        platform_tag: "linux_armv7l".to_string(),
    }
}

fn spawn_worker(config: WorkerConfig, host: Recorder) -> JoinHandle<wheelwright::Result<()>> {
    thread::spawn(move || Slave::new(config, target(), Box::new(host)).run())
}

fn recv<M: wheelwright_proto::WireMessage>(conn: &mut Connection<M>) -> M {
    conn.recv_timeout(WAIT).unwrap().expect("no message from worker")
}

/// Accept a connection and complete the handshake
fn handshake(coord: &Coordinator, worker_id: u32) -> Connection<SessionMessage> {
    let mut conn = coord.accept();
    assert!(matches!(recv(&mut conn), SessionMessage::Hello { .. }));
    conn.send(&SessionMessage::Ack {
        worker_id,
        index_url: "http://127.0.0.1/simple".to_string(),
    })
    .unwrap();
    assert_eq!(recv(&mut conn), SessionMessage::Idle);
    conn
}

/// Say goodbye and expect the worker to answer in kind and exit cleanly
fn finish(mut conn: Connection<SessionMessage>, worker: JoinHandle<wheelwright::Result<()>>) {
    conn.send(&SessionMessage::Bye).unwrap();
    assert_eq!(recv(&mut conn), SessionMessage::Bye);
    worker.join().unwrap().unwrap();
}

/// Expect a farewell followed by a fatal protocol error
fn expect_fatal(
    mut conn: Connection<SessionMessage>,
    worker: JoinHandle<wheelwright::Result<()>>,
) -> WorkerError {
    assert_eq!(recv(&mut conn), SessionMessage::Bye);
    let err = worker.join().unwrap().unwrap_err();
    assert!(err.is_protocol_violation(), "unexpected error: {}", err);
    err
}

fn build(conn: &mut Connection<SessionMessage>) -> wheelwright_proto::BuildReport {
    conn.send(&SessionMessage::Build {
        package: "foo".to_string(),
        version: "1.0".to_string(),
    })
    .unwrap();
    match recv(conn) {
        SessionMessage::Built(report) => report,
        other => panic!("expected BUILT, got {:?}", other),
    }
}

#[test]
fn test_hello_ack_idle_bye() {
    let _guard = serial();
    let coord = Coordinator::new();
    let host = Recorder::default();
    let worker = spawn_worker(coord.config(Tool::Fails), host.clone());

    let mut conn = coord.accept();
    assert_eq!(
        recv(&mut conn),
        SessionMessage::Hello {
            timeout_secs: 60,
            impl_tag: "34".to_string(),
            abi_tag: "cp34m".to_string(),
            platform_tag: "linux_armv7l".to_string(),
        }
    );
    conn.send(&SessionMessage::Ack {
        worker_id: 1,
        index_url: "http://127.0.0.1/simple".to_string(),
    })
    .unwrap();
    assert_eq!(recv(&mut conn), SessionMessage::Idle);

    finish(conn, worker);
    assert_eq!(host.events(), vec!["ready", "stopping"]);
}

#[test]
fn test_sleep_pauses_then_idles() {
    let _guard = serial();
    let coord = Coordinator::new();
    let worker = spawn_worker(coord.config(Tool::Fails), Recorder::default());
    let mut conn = handshake(&coord, 1);

    let start = Instant::now();
    conn.send(&SessionMessage::Sleep).unwrap();
    assert_eq!(recv(&mut conn), SessionMessage::Idle);
    let paused = start.elapsed();
    assert!(paused >= Duration::from_millis(100), "paused {:?}", paused);
    assert!(paused < Duration::from_secs(10), "paused {:?}", paused);

    finish(conn, worker);
}

#[test]
fn test_failed_build_is_reported() {
    let _guard = serial();
    let coord = Coordinator::new();
    let worker = spawn_worker(coord.config(Tool::Fails), Recorder::default());
    let mut conn = handshake(&coord, 1);

    let report = build(&mut conn);
    assert_eq!(report.package, "foo");
    assert_eq!(report.version, "1.0");
    assert!(!report.success);
    assert!(report.artifacts.is_empty());
    assert!(report.log.contains("foo==1.0"), "log: {}", report.log);
    assert!(report.log.contains("no matching distribution"));

    conn.send(&SessionMessage::Done).unwrap();
    assert_eq!(recv(&mut conn), SessionMessage::Idle);
    finish(conn, worker);
}

#[test]
fn test_build_send_done() {
    let _guard = serial();
    let coord = Coordinator::new();
    let worker = spawn_worker(coord.config(Tool::Succeeds), Recorder::default());
    let mut conn = handshake(&coord, 3);

    let report = build(&mut conn);
    assert!(report.success);
    assert_eq!(report.package, "foo");
    assert_eq!(report.version, "1.0");
    assert_eq!(report.artifacts.len(), 1);
    let summary = &report.artifacts[0];
    assert_eq!(summary.filename, WHEEL);
    assert_eq!(summary.filesize, WHEEL_BYTES.len() as u64);
    assert_eq!(summary.filehash, checksum_reader(WHEEL_BYTES).unwrap());
    assert_eq!(summary.package_tag, "foo");
    assert_eq!(summary.version_tag, "0.1");
    assert_eq!(summary.py_version_tag, "cp34");
    assert_eq!(summary.abi_tag, "cp34m");
    assert_eq!(summary.platform_tag, "linux_armv7l");
    assert!(summary.dependencies.is_empty());

    let wheel_dir = coord.built_dir();
    assert!(wheel_dir.join(WHEEL).exists());

    conn.send(&SessionMessage::Send {
        filename: WHEEL.to_string(),
    })
    .unwrap();

    let mut transfer = coord.accept_transfer();
    assert_eq!(recv(&mut transfer), TransferMessage::Hello { worker_id: 3 });

    let mut received = Vec::new();
    for (offset, size) in [(0u64, 10u32), (10, 100)] {
        transfer
            .send(&TransferMessage::Fetch { offset, size })
            .unwrap();
        match recv(&mut transfer) {
            TransferMessage::Chunk { offset: got, data } => {
                assert_eq!(got, offset);
                received.extend(data);
            }
            other => panic!("expected CHUNK, got {:?}", other),
        }
    }
    assert_eq!(received, WHEEL_BYTES);

    // SENT only follows the coordinator's DONE on the transfer channel
    assert!(conn
        .recv_timeout(Duration::from_millis(300))
        .unwrap()
        .is_none());
    transfer.send(&TransferMessage::Done).unwrap();
    assert_eq!(recv(&mut conn), SessionMessage::Sent);

    conn.send(&SessionMessage::Done).unwrap();
    assert_eq!(recv(&mut conn), SessionMessage::Idle);
    assert!(!wheel_dir.exists());

    finish(conn, worker);
}

#[test]
fn test_unknown_message_is_fatal() {
    let _guard = serial();
    let coord = Coordinator::new();
    let worker = spawn_worker(coord.config(Tool::Fails), Recorder::default());

    let mut raw = coord.accept_raw();
    let mut conn: Connection<SessionMessage> =
        Connection::from_stream(raw.try_clone().unwrap()).unwrap();
    assert!(matches!(recv(&mut conn), SessionMessage::Hello { .. }));
    conn.send(&SessionMessage::Ack {
        worker_id: 1,
        index_url: String::new(),
    })
    .unwrap();
    assert_eq!(recv(&mut conn), SessionMessage::Idle);

    raw.write_all(&frame_body(br#"{"msg":"FOO"}"#).unwrap())
        .unwrap();
    expect_fatal(conn, worker);
}

#[test]
fn test_second_build_is_fatal() {
    let _guard = serial();
    let coord = Coordinator::new();
    let worker = spawn_worker(coord.config(Tool::Succeeds), Recorder::default());
    let mut conn = handshake(&coord, 1);

    build(&mut conn);
    let wheel_dir = coord.built_dir();
    conn.send(&SessionMessage::Build {
        package: "bar".to_string(),
        version: "2.0".to_string(),
    })
    .unwrap();

    let err = expect_fatal(conn, worker);
    assert_eq!(err.to_string(), "Protocol violation: Last build still exists");
    assert!(!wheel_dir.exists());
}

#[test]
fn test_send_for_unknown_file_is_fatal() {
    let _guard = serial();
    let coord = Coordinator::new();
    let worker = spawn_worker(coord.config(Tool::Succeeds), Recorder::default());
    let mut conn = handshake(&coord, 1);

    assert!(build(&mut conn).success);
    conn.send(&SessionMessage::Send {
        filename: "bar-1.0-py3-none-any.whl".to_string(),
    })
    .unwrap();
    expect_fatal(conn, worker);
}

#[test]
fn test_send_after_failed_build_is_fatal() {
    let _guard = serial();
    let coord = Coordinator::new();
    let worker = spawn_worker(coord.config(Tool::Fails), Recorder::default());
    let mut conn = handshake(&coord, 1);

    assert!(!build(&mut conn).success);
    conn.send(&SessionMessage::Send {
        filename: WHEEL.to_string(),
    })
    .unwrap();
    let err = expect_fatal(conn, worker);
    assert_eq!(err.to_string(), "Protocol violation: Send after failed build");
}

#[test]
fn test_reply_other_than_ack_is_fatal() {
    let _guard = serial();
    let coord = Coordinator::new();
    let worker = spawn_worker(coord.config(Tool::Fails), Recorder::default());

    let mut conn = coord.accept();
    assert!(matches!(recv(&mut conn), SessionMessage::Hello { .. }));
    conn.send(&SessionMessage::Sleep).unwrap();
    let err = expect_fatal(conn, worker);
    assert_eq!(err.to_string(), "Protocol violation: Sleep before hello");
}

#[test]
fn test_timeout_reconnects_with_fresh_hello() {
    let _guard = serial();
    let coord = Coordinator::new();
    let host = Recorder::default();
    let mut config = coord.config(Tool::Fails);
    config.timings.reply_timeout_ms = 500;
    let worker = spawn_worker(config, host.clone());

    // Leave the worker's IDLE unanswered
    let _first = handshake(&coord, 1);

    let mut second = coord.accept();
    assert!(matches!(recv(&mut second), SessionMessage::Hello { .. }));

    // A fresh id is accepted: the old one was forgotten
    second
        .send(&SessionMessage::Ack {
            worker_id: 2,
            index_url: String::new(),
        })
        .unwrap();
    assert_eq!(recv(&mut second), SessionMessage::Idle);

    finish(second, worker);
    assert_eq!(
        host.events(),
        vec!["ready", "reloading", "ready", "stopping"]
    );
}

#[test]
fn test_timeout_discards_build() {
    let _guard = serial();
    let coord = Coordinator::new();
    let mut config = coord.config(Tool::Succeeds);
    config.timings.reply_timeout_ms = 500;
    let worker = spawn_worker(config, Recorder::default());

    let mut first = handshake(&coord, 1);
    assert!(build(&mut first).success);
    let wheel_dir = coord.built_dir();

    // BUILT goes unanswered; the worker gives up and starts over
    let mut second = coord.accept();
    assert!(matches!(recv(&mut second), SessionMessage::Hello { .. }));
    assert!(!wheel_dir.exists());

    // A DONE now has no build to refer to
    second
        .send(&SessionMessage::Ack {
            worker_id: 1,
            index_url: String::new(),
        })
        .unwrap();
    assert_eq!(recv(&mut second), SessionMessage::Idle);
    second.send(&SessionMessage::Done).unwrap();
    let err = expect_fatal(second, worker);
    assert_eq!(err.to_string(), "Protocol violation: Done before build");
}

#[test]
fn test_worker_waits_for_coordinator() {
    let _guard = serial();
    // Reserve a port, then release it so the first attempts are refused
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let coord = Coordinator::new();
    let mut config = coord.config(Tool::Fails);
    config.session_port = port;
    let worker = spawn_worker(config, Recorder::default());

    thread::sleep(Duration::from_millis(300));
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    let mut conn: Connection<SessionMessage> =
        Connection::from_stream(listener.accept().unwrap().0).unwrap();
    assert!(matches!(recv(&mut conn), SessionMessage::Hello { .. }));
    conn.send(&SessionMessage::Bye).unwrap();
    assert_eq!(recv(&mut conn), SessionMessage::Bye);
    worker.join().unwrap().unwrap();
}
