//! Double-fork daemonization for the `new` CLI verb.
//!
//! Spec.md's design notes call for double-fork (not the single `fork`
//! `original_source/cmd/new.go` does) to fully detach from the controlling
//! terminal and avoid a zombie on exit. Built on `libc`, already part of
//! `huntwj-tinyfugue`'s dependency set (used there for `isatty`/
//! `setlocale`); the general shape — fork, exit the parent, `setsid`,
//! fork again — follows the daemonization idiom `shell-pool-shpool`'s
//! `daemonize.rs` exists to provide, adapted here to a real double-fork
//! rather than shpool's re-exec-and-poll approach.

use std::path::Path;

/// Fork twice and detach from the controlling terminal. The original
/// process (and the intermediate child) call `process::exit(0)` and never
/// return; only the final grandchild returns from this function, with
/// stdio redirected to `/dev/null` and stdout/stderr instead wired to
/// `log_path`.
///
/// # Safety
/// Uses raw `libc::fork`/`setsid` per the standard double-fork idiom. Must
/// be called before any other threads are spawned (Tokio runtime included).
pub fn daemonize(log_path: &Path) -> std::io::Result<()> {
    // First fork: exit the parent so the shell that launched `new` sees it
    // return immediately.
    match unsafe { libc::fork() } {
        -1 => return Err(std::io::Error::last_os_error()),
        0 => {} // first child continues
        _ => std::process::exit(0),
    }

    if unsafe { libc::setsid() } == -1 {
        return Err(std::io::Error::last_os_error());
    }

    // Second fork: the first child (now a session leader) exits, so the
    // grandchild can never reacquire a controlling terminal.
    match unsafe { libc::fork() } {
        -1 => return Err(std::io::Error::last_os_error()),
        0 => {} // grandchild continues: this is the daemon
        _ => std::process::exit(0),
    }

    redirect_stdio(log_path)
}

fn redirect_stdio(log_path: &Path) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let devnull = std::fs::OpenOptions::new().read(true).open("/dev/null")?;
    let log_file = std::fs::OpenOptions::new().create(true).append(true).open(log_path)?;

    unsafe {
        libc::dup2(devnull.as_raw_fd(), libc::STDIN_FILENO);
        libc::dup2(log_file.as_raw_fd(), libc::STDOUT_FILENO);
        libc::dup2(log_file.as_raw_fd(), libc::STDERR_FILENO);
    }
    Ok(())
}
