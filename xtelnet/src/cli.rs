//! Command-line argument parsing for the three verbs: `new`, `attach`,
//! `list`.
//!
//! `clap` (derive) replaces `huntwj-tinyfugue`'s hand-rolled flag parser —
//! the pack's dominant CLI crate (`shell-pool-shpool`, `tobias-walle-
//! agency`), and the closest idiomatic match to the original's `cobra`-based
//! parser (see `original_source/cmd/new.go`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "xtelnet", about = "Detachable telnet client daemon for GB18030 MUD-style servers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Daemonize and create a new session with identifier `<pid>.<name>`.
    New {
        name: String,
        /// Stay detached after creation instead of attaching immediately.
        #[arg(short, long)]
        detach: bool,
        /// Load session configuration from this TOML file.
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Attach a terminal UI to a live session, resolved by name suffix/prefix.
    Attach {
        name: String,
    },
    /// List known session sockets and their attach status.
    List,
}

pub fn parse() -> Cli {
    Cli::parse()
}
