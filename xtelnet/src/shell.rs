//! Slash-command tree: turns one line of UI input into either raw bytes
//! sent to the remote or a session-control side effect.
//!
//! Tree shape (forest rooted at `"/"`, handler XOR child-map per node) and
//! the no-argument child-listing fallback are grounded on
//! `original_source/session/command.go`'s `GetRootCmd()` introspection.
//! Tokenization reuses `huntwj-tinyfugue`'s `config.rs` `split_args`
//! quoted-argument-aware whitespace splitter.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::session::Session;

/// What a handler (or the top-level dispatch) produced, funneled per
/// spec.md §4.10: `message` to the output fan-out, `bytes` to the
/// session's `send`, `error` to the output fan-out prefixed as an error.
#[derive(Debug, Default)]
pub struct CommandResult {
    pub message: Option<String>,
    pub bytes: Option<Vec<u8>>,
    pub error: Option<String>,
}

impl CommandResult {
    fn msg(s: impl Into<String>) -> Self {
        Self { message: Some(s.into()), ..Default::default() }
    }

    fn err(s: impl Into<String>) -> Self {
        Self { error: Some(s.into()), ..Default::default() }
    }
}

type Handler = Arc<dyn Fn(&Arc<Session>, &[String]) -> CommandResultFuture + Send + Sync>;

/// Handlers are synchronous-returning-a-future so `open`/`close`, which
/// need `.await`, and the purely synchronous toggles share one signature.
type CommandResultFuture = std::pin::Pin<Box<dyn std::future::Future<Output = CommandResult> + Send>>;

enum Node {
    Handler { handler: Handler, usage: &'static str, description: &'static str },
    Children { children: BTreeMap<&'static str, Node>, description: &'static str },
}

/// The command tree plus the line-level tokenizer/dispatcher.
pub struct Shell {
    root: Node,
}

impl Shell {
    pub fn new() -> Self {
        let mut root_children: BTreeMap<&'static str, Node> = BTreeMap::new();

        root_children.insert(
            "open",
            Node::Handler {
                handler: Arc::new(|session, args| Box::pin(open_handler(session.clone(), args.to_vec()))),
                usage: "open <host> <port>",
                description: "connect to a remote host",
            },
        );
        root_children.insert(
            "close",
            Node::Handler {
                handler: Arc::new(|session, _args| {
                    let session = session.clone();
                    Box::pin(async move {
                        session.close_nvt();
                        CommandResult::msg("connection closed")
                    })
                }),
                usage: "close",
                description: "close the current connection",
            },
        );
        root_children.insert(
            "detach",
            Node::Handler {
                handler: Arc::new(|_session, _args| {
                    Box::pin(async { CommandResult::err("use the UI's detach key to detach") })
                }),
                usage: "detach",
                description: "detach the UI (handled by the terminal frontend)",
            },
        );
        root_children.insert(
            "exit",
            Node::Handler {
                handler: Arc::new(|session, _args| {
                    let session = session.clone();
                    Box::pin(async move {
                        session.close_daemon();
                        CommandResult::msg("session exiting")
                    })
                }),
                usage: "exit",
                description: "terminate the whole session daemon",
            },
        );

        let mut debug_children: BTreeMap<&'static str, Node> = BTreeMap::new();
        debug_children.insert("iac", toggle_node("iac", "show raw IAC negotiation", |s| &s.debug_iac));
        debug_children.insert("color", toggle_node("color", "show raw color codes", |s| &s.debug_color));
        debug_children.insert(
            "ansicolor",
            toggle_node("ansicolor", "show raw ANSI color escapes", |s| &s.debug_ansicolor),
        );
        root_children.insert("debug", Node::Children { children: debug_children, description: "debug toggles" });

        let mut set_children: BTreeMap<&'static str, Node> = BTreeMap::new();
        set_children.insert("GA", toggle_node("GA", "show literal IAC GA markers", |s| &s.ga_visible));
        root_children.insert("set", Node::Children { children: set_children, description: "session settings" });

        Self { root: Node::Children { children: root_children, description: "root" } }
    }

    /// Dispatch one line of UI input. Raw (non-`/`) input is turned into
    /// `bytes` directly; slash-prefixed input descends the command tree.
    pub async fn dispatch(&self, session: &Arc<Session>, line: &str) -> CommandResult {
        if line.is_empty() || !line.starts_with('/') {
            let mut bytes = line.as_bytes().to_vec();
            bytes.extend_from_slice(b"\r\n");
            return CommandResult { bytes: Some(bytes), ..Default::default() };
        }

        let tokens = split_args(&line[1..]);
        if tokens.is_empty() {
            return Self::describe(&self.root);
        }

        let mut node = &self.root;
        let mut i = 0;
        while let Node::Children { children, .. } = node {
            let Some(name) = tokens.get(i) else { return Self::describe(node) };
            let Some(child) = children.get(name.as_str()) else {
                let mut result = Self::describe(node);
                result.error = Some(format!("command not found: {name}"));
                return result;
            };
            node = child;
            i += 1;
        }

        match node {
            Node::Handler { handler, .. } => handler(session, &tokens[i..]).await,
            Node::Children { .. } => Self::describe(node),
        }
    }

    fn describe(node: &Node) -> CommandResult {
        match node {
            Node::Handler { usage, description, .. } => CommandResult::msg(format!("{description}\nusage: {usage}")),
            Node::Children { children, .. } => {
                let listing: Vec<String> = children
                    .iter()
                    .map(|(name, child)| {
                        let desc = match child {
                            Node::Handler { description, .. } => description,
                            Node::Children { description, .. } => description,
                        };
                        format!("{name} - {desc}")
                    })
                    .collect();
                CommandResult::msg(listing.join("\n"))
            }
        }
    }
}

impl Default for Shell {
    fn default() -> Self {
        Self::new()
    }
}

fn toggle_node(
    name: &'static str,
    description: &'static str,
    flag: fn(&Session) -> &std::sync::atomic::AtomicBool,
) -> Node {
    Node::Handler {
        handler: Arc::new(move |session, _args| {
            let session = session.clone();
            Box::pin(async move {
                let f = flag(&session);
                let now = !f.load(Ordering::SeqCst);
                f.store(now, Ordering::SeqCst);
                CommandResult::msg(format!("{} = {}", name, now))
            })
        }),
        usage: name,
        description,
    }
}

async fn open_handler(session: Arc<Session>, args: Vec<String>) -> CommandResult {
    let [host, port_str] = args.as_slice() else {
        return CommandResult::err("usage: open <host> <port>");
    };
    let Ok(port) = port_str.parse::<u16>() else {
        return CommandResult::err("port must be an integer in 1..65535");
    };
    if port == 0 {
        return CommandResult::err("port must be an integer in 1..65535");
    }
    match session.open(host, port).await {
        Ok(()) => CommandResult::msg(format!("connected to {host}:{port}")),
        Err(e) => CommandResult::err(e),
    }
}

/// Quoted-argument-aware whitespace tokenizer, same shape as
/// `huntwj-tinyfugue`'s `config.rs::split_args`.
fn split_args(s: &str) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut chars = s.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if !in_quotes => in_quotes = true,
            '"' if in_quotes => in_quotes = false,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    cur.push(escaped);
                }
            }
            c if c.is_ascii_whitespace() && !in_quotes => {
                if !cur.is_empty() {
                    args.push(std::mem::take(&mut cur));
                }
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        args.push(cur);
    }
    args
}
