//! A real self-update: the built daemon upgrades to a copy of itself.
//!
//! The release server is a local TLS endpoint pinned through
//! `update.ca_cert`. The test drives the upgrade over the operator socket
//! while a client keeps hitting `/health` on fresh connections, then checks
//! that the successor holds the port, the instance lock, the PID file and
//! the operator socket after the predecessor has exited.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use adnode_core::ipc::{IpcRequest, IpcResponse};
use adnode_core::lock::{LockError, NodeInstanceLock};
use adnode_core::update::{UpdateManifest, Version};
use adnode_daemon::endpoint::{
    ConnectionLimits, EndpointControl, SecureEndpoint, bind_listener, load_acceptor,
};
use adnode_daemon::operator::operator_codec;
use adnode_daemon::pidfile::read_pid_file;
use axum::Router;
use axum::routing::get;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use rustls::pki_types::ServerName;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;

const DAEMON: &str = env!("CARGO_BIN_EXE_adnode-daemon");

fn init_crypto() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

struct Paths {
    dir: TempDir,
}

impl Paths {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn join(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn log(&self) -> String {
        std::fs::read_to_string(self.join("daemon.log")).unwrap_or_default()
    }
}

/// Self-signed certificate for 127.0.0.1, used by the node, by the release
/// server, and as the pinned update root.
fn write_certificate(paths: &Paths) -> rustls::ClientConfig {
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["127.0.0.1".to_string()])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    std::fs::write(paths.join("cert.pem"), cert.pem()).unwrap();
    std::fs::write(paths.join("key.pem"), key.serialize_pem()).unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.der().clone()).unwrap();
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Serves a manifest advertising version 99.0.0 whose artifact is the
/// daemon binary under test.
fn start_release_server(paths: &Paths) -> (SocketAddr, watch::Sender<bool>) {
    let artifact = Bytes::from(std::fs::read(DAEMON).unwrap());
    let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    let manifest = UpdateManifest {
        version: Version::parse("99.0.0").unwrap(),
        artifact_reference: format!("https://{addr}/adnode-daemon"),
        checksum: hex::encode(Sha256::digest(&artifact)),
    };
    let manifest = serde_json::to_string(&manifest).unwrap();

    let app = Router::new()
        .route("/manifest.json", get(move || async move { manifest }))
        .route("/adnode-daemon", get(move || async move { artifact }));
    let endpoint = SecureEndpoint::new(
        listener,
        load_acceptor(&paths.join("cert.pem"), &paths.join("key.pem")).unwrap(),
        app,
        EndpointControl::new(true),
        ConnectionLimits {
            max_connections: 8,
            handshake_timeout: Duration::from_secs(5),
        },
    )
    .unwrap();
    let (stop, stop_rx) = watch::channel(false);
    tokio::spawn(endpoint.serve(stop_rx));
    (addr, stop)
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn write_config(paths: &Paths, port: u16, release: SocketAddr) -> PathBuf {
    let config = format!(
        r#"
        [identity]
        wallet_name = "miner"
        hotkey = "default"

        [daemon]
        lock_file = "{lock}"
        pid_file = "{pid}"
        operator_socket = "{socket}"
        state_dir = "{state}"

        [endpoint]
        bind_address = "127.0.0.1"
        port = {port}
        cert_path = "{cert}"
        key_path = "{key}"

        [forward]
        backend_url = "https://127.0.0.1:9"

        [update]
        enabled = true
        manifest_url = "https://{release}/manifest.json"
        ca_cert = "{cert}"
        check_interval = "1h"
        drain_grace = "2s"
        fetch_timeout = "2m"
        health_timeout = "1m"
        "#,
        lock = paths.join("adnode.lock").display(),
        pid = paths.join("adnode.pid").display(),
        socket = paths.join("operator.sock").display(),
        state = paths.join("state").display(),
        cert = paths.join("cert.pem").display(),
        key = paths.join("key.pem").display(),
    );
    let path = paths.join("adnode.toml");
    std::fs::write(&path, config).unwrap();
    path
}

/// `GET /health` on a fresh TLS connection. Returns whether it answered 200.
async fn health(addr: SocketAddr, tls: &TlsConnector) -> bool {
    let exchange = async {
        let tcp = TcpStream::connect(addr).await.ok()?;
        let mut stream = tls
            .connect(ServerName::try_from("127.0.0.1").unwrap(), tcp)
            .await
            .ok()?;
        stream
            .write_all(b"GET /health HTTP/1.1\r\nhost: 127.0.0.1\r\nconnection: close\r\n\r\n")
            .await
            .ok()?;
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
        Some(response.starts_with(b"HTTP/1.1 200"))
    };
    // Connections made while accept is paused wait in the backlog.
    tokio::time::timeout(Duration::from_secs(30), exchange)
        .await
        .ok()
        .flatten()
        .unwrap_or(false)
}

async fn operator_call(socket: &Path, request: &IpcRequest) -> Option<IpcResponse> {
    let stream = UnixStream::connect(socket).await.ok()?;
    let mut framed = Framed::new(stream, operator_codec());
    framed
        .send(Bytes::from(serde_json::to_vec(request).unwrap()))
        .await
        .ok()?;
    let frame = framed.next().await?.ok()?;
    serde_json::from_slice(&frame).ok()
}

async fn wait_until<F, Fut>(what: &str, paths: &Paths, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}\n--- daemon log ---\n{}", paths.log());
}

fn is_alive(pid: u32) -> bool {
    i32::try_from(pid).is_ok_and(|pid| kill(Pid::from_raw(pid), None).is_ok())
}

/// Kills whatever node process is left when the test ends.
struct Reaper(PathBuf);

impl Drop for Reaper {
    fn drop(&mut self) {
        if let Some(pid) = read_pid_file(&self.0).and_then(|pid| i32::try_from(pid).ok()) {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upgrade_hands_port_and_lock_to_successor() {
    init_crypto();
    let paths = Paths::new();
    let client = TlsConnector::from(Arc::new(write_certificate(&paths)));
    let (release, _release_stop) = start_release_server(&paths);
    let port = free_port();
    let config = write_config(&paths, port, release);
    let node: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let socket = paths.join("operator.sock");
    let pid_file = paths.join("adnode.pid");
    let _reaper = Reaper(pid_file.clone());

    let mut predecessor = Command::new(DAEMON)
        .arg("--config")
        .arg(&config)
        .arg("--no-metrics")
        .arg("--log-file")
        .arg(paths.join("daemon.log"))
        .env_remove("ADNODE_HANDOVER_SOCKET")
        .env_remove("ADNODE_HANDOVER_LISTEN_FD")
        .env_remove("ADNODE_HANDOVER_LOCK_FD")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    let predecessor_pid = predecessor.id().unwrap();

    wait_until("the node to serve", &paths, || health(node, &client)).await;
    wait_until("the PID file", &paths, || {
        let pid_file = pid_file.clone();
        async move { read_pid_file(&pid_file) == Some(predecessor_pid) }
    })
    .await;

    // Keep traffic flowing for the whole handover.
    let stop = Arc::new(AtomicBool::new(false));
    let answered = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let poller = tokio::spawn({
        let (stop, answered, failed) = (stop.clone(), answered.clone(), failed.clone());
        let client = client.clone();
        async move {
            while !stop.load(Ordering::SeqCst) {
                if health(node, &client).await {
                    answered.fetch_add(1, Ordering::SeqCst);
                } else {
                    failed.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    });

    // The predecessor may exit before its reply is flushed; the process
    // state below is what counts.
    let reply = tokio::time::timeout(
        Duration::from_secs(180),
        operator_call(&socket, &IpcRequest::CheckForUpdate),
    )
    .await
    .unwrap_or_else(|_| panic!("update check hung\n{}", paths.log()));
    if let Some(reply) = &reply {
        assert!(
            matches!(reply, IpcResponse::UpdateCheck { outcome, .. } if outcome == "handed_over"),
            "unexpected reply {reply:?}\n{}",
            paths.log()
        );
    }

    let status = tokio::time::timeout(Duration::from_secs(60), predecessor.wait())
        .await
        .unwrap_or_else(|_| panic!("predecessor did not exit\n{}", paths.log()))
        .unwrap();
    assert!(status.success(), "predecessor exited with {status}\n{}", paths.log());

    wait_until("the successor PID", &paths, || {
        let pid_file = pid_file.clone();
        async move { read_pid_file(&pid_file).is_some_and(|pid| pid != predecessor_pid) }
    })
    .await;
    let successor_pid = read_pid_file(&pid_file).unwrap();
    assert!(is_alive(successor_pid));

    match NodeInstanceLock::acquire(&paths.join("adnode.lock")) {
        Err(LockError::InstanceConflict { .. }) => {},
        Err(e) => panic!("unexpected lock error: {e}"),
        Ok(_) => panic!("instance lock was released by the handover\n{}", paths.log()),
    }

    assert!(health(node, &client).await, "{}", paths.log());
    stop.store(true, Ordering::SeqCst);
    poller.await.unwrap();
    assert!(answered.load(Ordering::SeqCst) > 0);
    assert_eq!(
        failed.load(Ordering::SeqCst),
        0,
        "health checks failed during handover\n{}",
        paths.log()
    );

    wait_until("the successor operator socket", &paths, || {
        let socket = socket.clone();
        async move {
            matches!(
                operator_call(&socket, &IpcRequest::Status).await,
                Some(IpcResponse::Status(status)) if status.pid == successor_pid
            )
        }
    })
    .await;
    assert!(
        paths
            .join("state")
            .join("artifacts")
            .join("adnode-daemon-99.0.0")
            .exists()
    );

    assert!(matches!(
        operator_call(&socket, &IpcRequest::Shutdown).await,
        Some(IpcResponse::Ok { .. })
    ));
    wait_until("the successor to exit", &paths, || async move {
        !is_alive(successor_pid)
    })
    .await;
}
