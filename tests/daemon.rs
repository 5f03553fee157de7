use cpacfstatsd::backend::{Backend, MemoryBackend};
use cpacfstatsd::counters::{Command, CounterId, CounterState, Scope};
use cpacfstatsd::daemon::protocol::{Answer, Query, PROTOCOL_VERSION};
use cpacfstatsd::daemon::{stop_on_signal, DaemonClient, DaemonServer, PidFile, Shutdown};
use cpacfstatsd::{BackendError, DaemonConfig, DaemonError};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    dir: TempDir,
    socket: PathBuf,
    backend: Arc<MemoryBackend>,
    shutdown: Shutdown,
    server: JoinHandle<cpacfstatsd::Result<Option<i32>>>,
}

impl Harness {
    fn start(backend: MemoryBackend) -> Self {
        let dir = TempDir::new().unwrap();
        let config = DaemonConfig {
            socket_path: dir.path().join("cpacfstatsd_socket"),
            pid_path: dir.path().join("cpacfstatsd.pid"),
            socket_group: None,
            recv_timeout_ms: 2_000,
            send_timeout_ms: 2_000,
            ..Default::default()
        };

        let backend = Arc::new(backend);
        let shared: Arc<dyn Backend> = backend.clone();
        let server = DaemonServer::bind(&config, shared).unwrap();
        let shutdown = server.shutdown_handle();

        Self {
            dir,
            socket: config.socket_path,
            backend,
            shutdown,
            server: tokio::spawn(server.run()),
        }
    }

    fn client(&self) -> DaemonClient {
        DaemonClient::new(&self.socket).with_timeout(CLIENT_TIMEOUT)
    }

    async fn query(&self, scope: Scope, command: Command) -> Vec<Answer> {
        let client = self.client();
        tokio::task::spawn_blocking(move || client.query(scope, command))
            .await
            .unwrap()
            .unwrap()
    }

    async fn stop(self) -> Option<i32> {
        self.shutdown.request(libc::SIGTERM);
        let signal = self.server.await.unwrap().unwrap();
        assert!(!self.socket.exists());
        drop(self.dir);
        signal
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_print_all_over_socket() {
    let harness = Harness::start(MemoryBackend::new());

    let answers = harness.query(Scope::All, Command::Print).await;

    assert_eq!(answers.len(), 8);
    for (answer, id) in answers.iter().zip(CounterId::ENUMERATION) {
        assert_eq!(*answer, Answer::counter(id, CounterState::Disabled, 0));
    }
    assert_eq!(answers[7], Answer::hotplug(Ok(0)));

    assert_eq!(harness.stop().await, Some(libc::SIGTERM));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_state_persists_across_connections() {
    let harness = Harness::start(MemoryBackend::new());

    let enabled = harness.query(Scope::One(CounterId::Sha), Command::Enable).await;
    assert_eq!(enabled[0], Answer::counter(CounterId::Sha, CounterState::Enabled, 0));

    harness.backend.set_value(CounterId::Sha, 4096);
    let printed = harness.query(Scope::One(CounterId::Sha), Command::Print).await;
    assert_eq!(printed[0], Answer::counter(CounterId::Sha, CounterState::Enabled, 4096));

    let reset = harness.query(Scope::One(CounterId::Sha), Command::Reset).await;
    assert_eq!(reset[0].value, 4096);
    let printed = harness.query(Scope::One(CounterId::Sha), Command::Print).await;
    assert_eq!(printed[0].value, 0);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_version_gets_no_answer() {
    let harness = Harness::start(MemoryBackend::new());

    let mut frame = Query::new(Scope::All, Command::Enable).encode();
    frame[0..4].copy_from_slice(&(PROTOCOL_VERSION + 1).to_ne_bytes());
    let client = harness.client();
    let answers = tokio::task::spawn_blocking(move || client.send_frame(&frame))
        .await
        .unwrap()
        .unwrap();

    assert!(answers.is_empty());
    assert_eq!(harness.backend.calls().len(), 0);

    // the daemon keeps serving
    let answers = harness.query(Scope::One(CounterId::Des), Command::Print).await;
    assert_eq!(answers.len(), 2);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_short_frame_is_dropped() {
    let harness = Harness::start(MemoryBackend::new());

    let socket = harness.socket.clone();
    let reply = tokio::task::spawn_blocking(move || {
        let mut stream = UnixStream::connect(socket).unwrap();
        stream.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();
        stream.write_all(&[0u8; 10]).unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).unwrap();
        reply
    })
    .await
    .unwrap();

    assert!(reply.is_empty());

    let answers = harness.query(Scope::All, Command::Print).await;
    assert_eq!(answers.len(), 8);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_signal_releases_blocked_read() {
    let harness = Harness::start(
        MemoryBackend::new()
            .with_state(CounterId::Aes, CounterState::Enabled)
            .with_blocking_reads(),
    );
    let pid_path = harness.dir.path().join("cpacfstatsd.pid");
    let pid = PidFile::new(&pid_path).write().unwrap();

    let client = harness.client();
    let pending = tokio::task::spawn_blocking(move || client.query(Scope::One(CounterId::Aes), Command::Print));

    while harness.backend.blocked_readers() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    stop_on_signal(harness.backend.as_ref(), &harness.shutdown, libc::SIGTERM);

    let answers = pending.await.unwrap().unwrap();
    assert_eq!(answers, vec![Answer::failure(1, BackendError::interrupted())]);
    assert_eq!(answers[0].status, -libc::EINTR);

    let Harness {
        dir,
        socket,
        backend,
        server,
        ..
    } = harness;
    assert_eq!(server.await.unwrap().unwrap(), Some(libc::SIGTERM));
    assert!(!socket.exists());
    assert!(backend.is_stopped());

    drop(pid);
    assert!(!pid_path.exists());
    drop(dir);
}

#[tokio::test]
async fn test_running_instance_blocks_startup() {
    let dir = TempDir::new().unwrap();
    let config = DaemonConfig {
        socket_path: dir.path().join("cpacfstatsd_socket"),
        pid_path: dir.path().join("cpacfstatsd.pid"),
        socket_group: None,
        ..Default::default()
    };
    std::fs::write(&config.pid_path, format!("{}\n", std::process::id())).unwrap();

    // startup order: pid check, then bind
    let started = PidFile::new(&config.pid_path)
        .check()
        .and_then(|()| DaemonServer::bind(&config, Arc::new(MemoryBackend::new())));

    match started {
        Err(DaemonError::AlreadyRunning { pid }) => assert_eq!(pid as u32, std::process::id()),
        Err(e) => panic!("Expected AlreadyRunning, got {}", e),
        Ok(_) => panic!("Expected AlreadyRunning, got a bound server"),
    }
    assert!(!config.socket_path.exists());
    assert!(config.pid_path.exists());
}
