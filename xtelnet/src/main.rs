use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use xtelnet::cli::{self, Command};
use xtelnet::config::SessionConfig;
use xtelnet::error::XtelnetError;
use xtelnet::frame::{self, Opcode};
use xtelnet::{attach, daemon, session::Session};

fn main() {
    let cli = cli::parse();
    let code = match cli.command {
        Command::New { name, detach, file } => cmd_new(name, detach, file),
        Command::Attach { name } => cmd_attach(name),
        Command::List => cmd_list(),
    };
    std::process::exit(code);
}

/// Daemonize and serve a new session. Must fork *before* any Tokio runtime
/// exists (a multi-threaded runtime cannot safely survive a fork), so the
/// runtime is built only in the grandchild process after `daemonize`
/// returns.
fn cmd_new(name: String, _detach: bool, file: Option<PathBuf>) -> i32 {
    let config = match file {
        Some(path) => match SessionConfig::load_file(&path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("xtelnet: {e}");
                return 1;
            }
        },
        None => SessionConfig::load_default(),
    };

    let pid = std::process::id();
    let session_name = format!("{pid}.{name}");
    let run_dir = config.resolve_runtime_dir().join("run");
    if let Err(e) = std::fs::create_dir_all(&run_dir) {
        eprintln!("xtelnet: {e}");
        return 1;
    }
    let socket_path = run_dir.join(format!("{session_name}.sock"));
    let log_path = run_dir.join(format!("{session_name}.log"));

    if let Err(e) = daemon::daemonize(&log_path) {
        eprintln!("xtelnet: daemonize: {e}");
        return 1;
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    runtime.block_on(async move {
        let listener = match tokio::net::UnixListener::bind(&socket_path) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = %e, path = %socket_path.display(), "bind local socket");
                return;
            }
        };
        let session = Session::new(session_name, socket_path, config);
        attach::serve(session, listener).await;
    });
    0
}

fn cmd_attach(name: String) -> i32 {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    runtime.block_on(run_attach_client(name))
}

async fn run_attach_client(name: String) -> i32 {
    let config = SessionConfig::load_default();
    let run_dir = config.resolve_runtime_dir().join("run");
    let Some(socket_path) = find_session_socket(&run_dir, &name) else {
        eprintln!("xtelnet: {}", XtelnetError::NoSuchSession(name));
        return 1;
    };

    let mut stream = match tokio::net::UnixStream::connect(&socket_path).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("xtelnet: connect {}: {e}", socket_path.display());
            return 1;
        }
    };

    if frame::write(&mut stream, Opcode::AttachReq, &[0]).await.is_err() {
        eprintln!("xtelnet: attach handshake failed");
        return 1;
    }
    let (opcode, payload) = match frame::read(&mut stream).await {
        Ok(v) => v,
        Err(e) => {
            eprintln!("xtelnet: attach handshake failed: {e}");
            return 1;
        }
    };
    if opcode != Opcode::AttachAck || payload.first() != Some(&1) {
        let reason = String::from_utf8_lossy(payload.get(1..).unwrap_or(&[]));
        eprintln!("xtelnet: attach refused: {reason}");
        return 1;
    }

    let (mut read_half, mut write_half) = stream.into_split();
    let writer = tokio::spawn(async move {
        let stdin = tokio::io::stdin();
        let mut lines = tokio::io::BufReader::new(stdin).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if frame::write(&mut write_half, Opcode::UserInput, line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    loop {
        match frame::read(&mut read_half).await {
            Ok((Opcode::Push, payload)) => {
                let mut stdout = tokio::io::stdout();
                if stdout.write_all(&payload).await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    writer.abort();
    0
}

fn cmd_list() -> i32 {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    runtime.block_on(run_list());
    0
}

async fn run_list() {
    let config = SessionConfig::load_default();
    let run_dir = config.resolve_runtime_dir().join("run");
    let Ok(entries) = std::fs::read_dir(&run_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sock") {
            continue;
        }
        let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("?").to_string();
        let status = match query_status(&path).await {
            Some(true) => "Attached",
            Some(false) => "Detached",
            None => "Unknown",
        };
        println!("{name} ({status})");
    }
}

async fn query_status(path: &Path) -> Option<bool> {
    let mut stream = tokio::net::UnixStream::connect(path).await.ok()?;
    frame::write(&mut stream, Opcode::QueryDetachStatus, &[]).await.ok()?;
    let (opcode, payload) = frame::read(&mut stream).await.ok()?;
    if opcode != Opcode::DetachStatus {
        return None;
    }
    match payload.first() {
        Some(0) => Some(true),
        Some(1) => Some(false),
        _ => None,
    }
}

/// Resolve the shortest-matching session socket by suffix or prefix,
/// per spec.md §6.
fn find_session_socket(run_dir: &Path, name: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(run_dir).ok()?;
    let mut candidates: Vec<PathBuf> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sock") {
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        if stem.ends_with(name) || stem.starts_with(name) {
            candidates.push(path);
        }
    }
    candidates.sort_by_key(|p| p.as_os_str().len());
    candidates.into_iter().next()
}
