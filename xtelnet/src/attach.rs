//! Local attach control plane: per-session Unix socket accept loop, the
//! query-status/attach-req handshake with takeover, and the attached
//! handler's frame read/dispatch loop.
//!
//! Grounded on `shell-pool-shpool/libshpool/src/daemon/server.rs`'s
//! accept-loop / `handle_attach` split and its single-attached-session
//! invariant (a new attach takes over by closing the prior connection),
//! and on `original_source/session/session.go`'s `Create` (Unix listener +
//! accept loop dispatching to a terminal handler) — translated from
//! shpool's `std::thread`-per-connection model to `tokio::net::UnixListener`
//! + `tokio::spawn`, matching `huntwj-tinyfugue`'s async-everywhere style.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::XtelnetError;
use crate::frame::{self, Opcode};
use crate::session::Session;

const REPLAY_TAIL: usize = 25;
const TAKEOVER_POLL: Duration = Duration::from_millis(10);

/// Serve the session's local socket until the whole-daemon close fires.
pub async fn serve(session: Arc<Session>, listener: UnixListener) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let session = session.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(session, stream).await {
                                warn!(error = %e, "attach connection ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept on local socket failed"),
                }
            }
            _ = session.closing.fired() => break,
        }
    }
    info!(session = %session.name, "attach plane stopped accepting");
}

/// Pre-attach handshake loop: handles `CM_QUERY_DETACH_STATUS` and
/// `CM_ATTACH_REQ` repeatedly (a client may query before attaching),
/// tolerating unknown opcodes, until an attach is accepted or the
/// connection ends.
async fn handle_connection(session: Arc<Session>, mut stream: UnixStream) -> std::io::Result<()> {
    loop {
        let (opcode, payload) = match frame::read(&mut stream).await {
            Ok(v) => v,
            Err(_) => return Ok(()),
        };
        match opcode {
            Opcode::QueryDetachStatus => {
                let status: u8 = if session.is_attached() { 0 } else { 1 };
                let _ = frame::write(&mut stream, Opcode::DetachStatus, &[status]).await;
            }
            Opcode::AttachReq => {
                let force = payload.first() == Some(&1);
                if session.is_attached() {
                    if force {
                        session.kick_current_ui();
                        wait_until_detached(&session).await;
                    } else {
                        let mut reply = vec![0u8];
                        reply.extend_from_slice(XtelnetError::AlreadyAttached.to_string().as_bytes());
                        let _ = frame::write(&mut stream, Opcode::AttachAck, &reply).await;
                        return Ok(());
                    }
                }
                let _ = frame::write(&mut stream, Opcode::AttachAck, &[1]).await;
                return run_attached(session, stream).await;
            }
            _ => {} // unknown opcode before attach: tolerate
        }
    }
}

async fn wait_until_detached(session: &Arc<Session>) {
    while session.is_attached() {
        tokio::select! {
            _ = session.ui_detached.notified() => {}
            _ = tokio::time::sleep(TAKEOVER_POLL) => {}
        }
    }
}

/// The attached handler: replay burst, then loop reading frames until
/// disconnect, read error, or a force-takeover kick. Exiting this function
/// never closes the session itself.
async fn run_attached(session: Arc<Session>, stream: UnixStream) -> std::io::Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();

    let tail = session.scrollback.get_tail(REPLAY_TAIL);
    if tail.is_empty() {
        let _ = frame::write(&mut write_half, Opcode::Push, b"No buffered message").await;
    } else {
        for chunk in tail {
            if frame::write(&mut write_half, Opcode::Push, &chunk).await.is_err() {
                break;
            }
        }
    }

    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    session.set_ui_sink(Some(ui_tx));
    session.set_attached(true);

    let writer_task = tokio::spawn(async move {
        while let Some(chunk) = ui_rx.recv().await {
            if frame::write(&mut write_half, Opcode::Push, &chunk).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = frame::read(&mut read_half) => {
                match frame {
                    Ok((Opcode::UserInput, payload)) => {
                        let line = String::from_utf8_lossy(&payload).into_owned();
                        let result = session.shell.dispatch(&session, &line).await;
                        if let Some(msg) = result.message {
                            session.fan_out(msg.into_bytes());
                        }
                        if let Some(bytes) = result.bytes {
                            session.send(bytes).await;
                        }
                        if let Some(err) = result.error {
                            session.fan_out(format!("error: {err}").into_bytes());
                        }
                    }
                    Ok((Opcode::ScreenSize, _payload)) => {
                        // Reserved for future NAWS negotiation; stored nowhere yet.
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            _ = session.kick_ui.notified() => break,
        }
    }

    writer_task.abort();
    session.set_attached(false);
    session.set_ui_sink(None);
    session.ui_detached.notify_waiters();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use std::path::PathBuf;

    fn test_session(name: &str) -> Arc<Session> {
        Session::new(name.into(), PathBuf::from(format!("/tmp/xtelnet-attach-{name}.sock")), SessionConfig::default())
    }

    async fn spawn_listener(session: Arc<Session>) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve(session, listener));
        (dir, path)
    }

    #[tokio::test]
    async fn query_detach_status_on_fresh_session_is_detached() {
        let session = test_session("query");
        let (_dir, path) = spawn_listener(session).await;
        let mut stream = UnixStream::connect(&path).await.unwrap();
        frame::write(&mut stream, Opcode::QueryDetachStatus, &[]).await.unwrap();
        let (op, payload) = frame::read(&mut stream).await.unwrap();
        assert_eq!(op, Opcode::DetachStatus);
        assert_eq!(payload, vec![1]);
    }

    #[tokio::test]
    async fn attach_without_force_is_accepted_when_detached() {
        let session = test_session("attach1");
        let (_dir, path) = spawn_listener(session).await;
        let mut stream = UnixStream::connect(&path).await.unwrap();
        frame::write(&mut stream, Opcode::AttachReq, &[0]).await.unwrap();
        let (op, payload) = frame::read(&mut stream).await.unwrap();
        assert_eq!(op, Opcode::AttachAck);
        assert_eq!(payload, vec![1]);
        // Initial replay burst: empty scrollback -> "No buffered message".
        let (op, payload) = frame::read(&mut stream).await.unwrap();
        assert_eq!(op, Opcode::Push);
        assert_eq!(payload, b"No buffered message".to_vec());
    }

    #[tokio::test]
    async fn second_attach_without_force_is_denied() {
        let session = test_session("attach2");
        let (_dir, path) = spawn_listener(session).await;

        let mut first = UnixStream::connect(&path).await.unwrap();
        frame::write(&mut first, Opcode::AttachReq, &[0]).await.unwrap();
        let _ = frame::read(&mut first).await.unwrap(); // AttachAck(1)
        let _ = frame::read(&mut first).await.unwrap(); // replay burst

        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut second = UnixStream::connect(&path).await.unwrap();
        frame::write(&mut second, Opcode::AttachReq, &[0]).await.unwrap();
        let (op, payload) = frame::read(&mut second).await.unwrap();
        assert_eq!(op, Opcode::AttachAck);
        assert_eq!(payload[0], 0);
    }

    #[tokio::test]
    async fn force_takeover_displaces_prior_attach() {
        let session = test_session("attach3");
        let (_dir, path) = spawn_listener(session).await;

        let mut first = UnixStream::connect(&path).await.unwrap();
        frame::write(&mut first, Opcode::AttachReq, &[0]).await.unwrap();
        let _ = frame::read(&mut first).await.unwrap();
        let _ = frame::read(&mut first).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut second = UnixStream::connect(&path).await.unwrap();
        frame::write(&mut second, Opcode::AttachReq, &[1]).await.unwrap();
        let (op, payload) = frame::read(&mut second).await.unwrap();
        assert_eq!(op, Opcode::AttachAck);
        assert_eq!(payload, vec![1]);

        // The displaced connection observes EOF on its next read.
        let result = frame::read(&mut first).await;
        assert!(result.is_err());
    }
}
