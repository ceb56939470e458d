//! End-to-end attach/detach/takeover scenarios over real Unix sockets,
//! matching the numbered scenarios in spec.md §8 that need more than one
//! connection to exercise (concurrent-attach denial, force-takeover,
//! remote-disconnect-mid-stream). Placed under `tests/` the way
//! `huntwj-tinyfugue/tests/compat_tests.rs` sits outside `src/`.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UnixListener, UnixStream};

use xtelnet::config::SessionConfig;
use xtelnet::frame::{self, Opcode};
use xtelnet::session::Session;
use xtelnet::{attach, shell::Shell};

fn test_config() -> SessionConfig {
    SessionConfig {
        scrollback_cap: 100,
        keepalive: Duration::from_secs(3600),
        connect_timeout: Duration::from_secs(5),
        runtime_dir: None,
        debug_iac: false,
        ga_visible: false,
    }
}

async fn spawn_session(name: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("s.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();
    let session = Session::new(name.into(), socket_path.clone(), test_config());
    tokio::spawn(attach::serve(session, listener));
    (dir, socket_path)
}

#[tokio::test]
async fn concurrent_attach_denial_then_force_takeover() {
    let (_dir, socket_path) = spawn_session("t.concurrent").await;

    // First client attaches cleanly.
    let mut a = UnixStream::connect(&socket_path).await.unwrap();
    frame::write(&mut a, Opcode::AttachReq, &[0]).await.unwrap();
    let (op, payload) = frame::read(&mut a).await.unwrap();
    assert_eq!(op, Opcode::AttachAck);
    assert_eq!(payload, vec![1]);
    let _ = frame::read(&mut a).await.unwrap(); // replay burst

    tokio::time::sleep(Duration::from_millis(20)).await;

    // A second client without force is refused.
    let mut b = UnixStream::connect(&socket_path).await.unwrap();
    frame::write(&mut b, Opcode::AttachReq, &[0]).await.unwrap();
    let (op, payload) = frame::read(&mut b).await.unwrap();
    assert_eq!(op, Opcode::AttachAck);
    assert_eq!(payload[0], 0);

    // A third client with force displaces the first.
    let mut c = UnixStream::connect(&socket_path).await.unwrap();
    frame::write(&mut c, Opcode::AttachReq, &[1]).await.unwrap();
    let (op, payload) = frame::read(&mut c).await.unwrap();
    assert_eq!(op, Opcode::AttachAck);
    assert_eq!(payload, vec![1]);

    let displaced = frame::read(&mut a).await;
    assert!(displaced.is_err(), "displaced client should observe EOF");
}

#[tokio::test]
async fn user_input_round_trips_through_shell_to_remote() {
    // A fake remote server that records what it receives.
    let remote_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote_listener.local_addr().unwrap();
    let received = std::sync::Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let received2 = received.clone();
    tokio::spawn(async move {
        let (mut sock, _) = remote_listener.accept().await.unwrap();
        let mut buf = [0u8; 256];
        loop {
            match tokio::io::AsyncReadExt::read(&mut sock, &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received2.lock().await.extend_from_slice(&buf[..n]),
            }
        }
    });

    let (_dir, socket_path) = spawn_session("t.roundtrip").await;
    let mut ui = UnixStream::connect(&socket_path).await.unwrap();
    frame::write(&mut ui, Opcode::AttachReq, &[0]).await.unwrap();
    let _ = frame::read(&mut ui).await.unwrap(); // AttachAck
    let _ = frame::read(&mut ui).await.unwrap(); // replay burst

    let open_cmd = format!("/open 127.0.0.1 {}", remote_addr.port());
    frame::write(&mut ui, Opcode::UserInput, open_cmd.as_bytes()).await.unwrap();
    let (op, payload) = frame::read(&mut ui).await.unwrap();
    assert_eq!(op, Opcode::Push);
    assert!(String::from_utf8_lossy(&payload).contains("connected"));

    frame::write(&mut ui, Opcode::UserInput, b"look").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(&received.lock().await[..], b"look\r\n");
}

#[tokio::test]
async fn remote_disconnect_mid_stream_leaves_session_detachable() {
    let remote_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = remote_listener.accept().await.unwrap();
        sock.write_all(b"hi\r\n").await.unwrap();
        drop(sock);
    });

    let (_dir, socket_path) = spawn_session("t.discmid").await;
    let mut ui = UnixStream::connect(&socket_path).await.unwrap();
    frame::write(&mut ui, Opcode::AttachReq, &[0]).await.unwrap();
    let _ = frame::read(&mut ui).await.unwrap();
    let _ = frame::read(&mut ui).await.unwrap();

    let open_cmd = format!("/open 127.0.0.1 {}", remote_addr.port());
    frame::write(&mut ui, Opcode::UserInput, open_cmd.as_bytes()).await.unwrap();
    let _ = frame::read(&mut ui).await.unwrap(); // "connected to ..."

    tokio::time::sleep(Duration::from_millis(150)).await;

    // The session remains attachable (detach status reports the UI, not
    // the remote connection state): query a second connection.
    let mut q = UnixStream::connect(&socket_path).await.unwrap();
    frame::write(&mut q, Opcode::QueryDetachStatus, &[]).await.unwrap();
    let (op, payload) = frame::read(&mut q).await.unwrap();
    assert_eq!(op, Opcode::DetachStatus);
    assert_eq!(payload, vec![0]); // still attached, per scenario 6
}

#[tokio::test]
async fn shell_root_listing_is_stable_for_help_style_fallback() {
    // Exercises the no-arg child-listing fallback end to end, grounded on
    // the original's GetRootCmd() introspection behavior.
    let shell = Shell::new();
    let session = Session::new(
        "t.help".into(),
        tempfile::tempdir().unwrap().path().join("s.sock"),
        test_config(),
    );
    let result = shell.dispatch(&session, "/").await;
    let listing = result.message.unwrap();
    for expected in ["open", "close", "detach", "exit", "debug", "set"] {
        assert!(listing.contains(expected), "listing missing {expected}: {listing}");
    }
}
