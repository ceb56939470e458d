//! TELNET/NVT byte-stream engine: incremental IAC packet scanner plus the
//! option-negotiation reactor.
//!
//! Adapted from `huntwj-tinyfugue`'s `TelnetParser`/`NegotiationState` byte
//! FSM (see that crate's `telnet.rs`), but reworked into the incremental
//! one-byte-at-a-time contract the specification requires: the receiver
//! task in `session.rs` must interleave IAC parsing with the ANSI scanner
//! and raw data bytes on the same inbound stream, so the parser here can't
//! own the whole buffer the way `TelnetParser::feed` does.

use std::collections::HashMap;

pub const IAC: u8 = 0xFF;
pub const SE: u8 = 0xF0;
pub const NOP: u8 = 0xF1;
pub const GA: u8 = 0xF9;
pub const SB: u8 = 0xFA;
pub const WILL: u8 = 0xFB;
pub const WONT: u8 = 0xFC;
pub const DO: u8 = 0xFD;
pub const DONT: u8 = 0xFE;
pub const EC: u8 = 0xF7;
pub const EL: u8 = 0xF8;
pub const AYT: u8 = 0xF6;

/// Well-known option codes (others are tolerated, just not named).
pub mod opt {
    pub const BINARY: u8 = 0;
    pub const ECHO: u8 = 1;
    pub const TTYPE: u8 = 24;
    pub const NAWS: u8 = 31;
    pub const NENV: u8 = 39;
    pub const MSSP: u8 = 70;
    pub const MXP: u8 = 91;
    pub const ZMP: u8 = 93;
    pub const GMCP: u8 = 201;
}

/// The set of commands a completed [`IacPacket`] can carry. `IAC` itself is
/// a framing marker, never stored as a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IacCommand {
    Will,
    Wont,
    Do,
    Dont,
    Sb,
    Ga,
    El,
    Ec,
    Ayt,
    Nop,
}

impl IacCommand {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            WILL => IacCommand::Will,
            WONT => IacCommand::Wont,
            DO => IacCommand::Do,
            DONT => IacCommand::Dont,
            SB => IacCommand::Sb,
            GA => IacCommand::Ga,
            EL => IacCommand::El,
            EC => IacCommand::Ec,
            AYT => IacCommand::Ayt,
            NOP => IacCommand::Nop,
            _ => return None,
        })
    }

    /// The raw byte for this command, used when building outbound packets.
    pub fn to_byte(self) -> u8 {
        match self {
            IacCommand::Will => WILL,
            IacCommand::Wont => WONT,
            IacCommand::Do => DO,
            IacCommand::Dont => DONT,
            IacCommand::Sb => SB,
            IacCommand::Ga => GA,
            IacCommand::El => EL,
            IacCommand::Ec => EC,
            IacCommand::Ayt => AYT,
            IacCommand::Nop => NOP,
        }
    }

    fn takes_option(self) -> bool {
        matches!(
            self,
            IacCommand::Will | IacCommand::Wont | IacCommand::Do | IacCommand::Dont | IacCommand::Sb
        )
    }
}

/// A completed IAC packet: command, option, and (only for `Sb`) payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IacPacket {
    pub command: IacCommand,
    pub option: u8,
    pub data: Vec<u8>,
}

impl IacPacket {
    /// Serialize back to wire bytes, *not* including the leading `IAC` that
    /// the outer receiver already consumed to discover this packet.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.command.to_byte()];
        if self.command == IacCommand::Sb {
            out.push(self.option);
            for &b in &self.data {
                if b == IAC {
                    out.push(IAC); // escape embedded IAC per RFC 855
                }
                out.push(b);
            }
            out.push(IAC);
            out.push(SE);
        } else if self.command.takes_option() {
            out.push(self.option);
        }
        out
    }

    /// Build `IAC || packet.to_bytes()`, the form placed on the wire or the
    /// outbound channel.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = vec![IAC];
        out.extend(self.to_bytes());
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WantCmd,
    WantOpt,
    WantData,
    /// Saw IAC while accumulating subnegotiation data: could be an escaped
    /// IAC (followed by another IAC) or the IAC of a terminating `IAC SE`.
    WantDataIac,
    Done,
}

/// Incremental byte-level IAC packet scanner.
///
/// Construct fresh for each packet (on seeing a bare `IAC` byte in the
/// inbound stream) and [`feed`](Self::feed) successive bytes until it
/// returns `false` ("no more bytes wanted"); the packet is then complete.
/// Never fails on malformed input — the outer receiver owns I/O errors, and
/// this parser always reaches `Done` eventually.
#[derive(Debug)]
pub struct IacParser {
    state: State,
    command: Option<IacCommand>,
    option: u8,
    data: Vec<u8>,
}

impl Default for IacParser {
    fn default() -> Self {
        Self::new()
    }
}

impl IacParser {
    pub fn new() -> Self {
        Self { state: State::WantCmd, command: None, option: 0, data: Vec::new() }
    }

    /// Feed one byte. Returns `true` if more bytes are wanted, `false` once
    /// the packet is complete (the byte just fed was the one that finished
    /// it).
    pub fn feed(&mut self, b: u8) -> bool {
        match self.state {
            State::WantCmd => {
                // A literal IAC mid-packet here is the escaped-IAC framing
                // marker already consumed by the outer receiver; skip it
                // and keep waiting for the real command byte.
                if b == IAC {
                    return true;
                }
                match IacCommand::from_byte(b) {
                    Some(cmd) if cmd.takes_option() => {
                        self.command = Some(cmd);
                        self.state = State::WantOpt;
                        true
                    }
                    Some(cmd) => {
                        self.command = Some(cmd);
                        self.state = State::Done;
                        false
                    }
                    None => {
                        // Unrecognised single-byte command: tolerate, done.
                        self.command = None;
                        self.state = State::Done;
                        false
                    }
                }
            }
            State::WantOpt => {
                self.option = b;
                if self.command == Some(IacCommand::Sb) {
                    self.state = State::WantData;
                    true
                } else {
                    self.state = State::Done;
                    false
                }
            }
            State::WantData => {
                if b == IAC {
                    self.state = State::WantDataIac;
                } else {
                    self.data.push(b);
                }
                true
            }
            State::WantDataIac => {
                if b == SE {
                    self.state = State::Done;
                    false
                } else if b == IAC {
                    // Escaped literal 0xFF inside the subnegotiation payload.
                    self.data.push(IAC);
                    self.state = State::WantData;
                    true
                } else {
                    // Tolerate a bare SE without a preceding IAC by treating
                    // any other byte as data that happened to follow a
                    // (non-escaping) IAC, then resume collecting.
                    self.data.push(b);
                    self.state = State::WantData;
                    true
                }
            }
            State::Done => false,
        }
    }

    /// Also treat a bare `SE` (not preceded by `IAC`) as terminating a
    /// subnegotiation, per spec.md's tolerance note. Call this instead of
    /// [`feed`](Self::feed) when the outer receiver sees a raw `SE` byte
    /// while in `WantData` state without having seen `IAC` first.
    pub fn feed_bare_se(&mut self) -> bool {
        if self.state == State::WantData {
            self.state = State::Done;
            false
        } else {
            true
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Consume the parser, yielding the completed packet. Only meaningful
    /// once [`feed`](Self::feed) has returned `false`.
    pub fn finish(self) -> IacPacket {
        IacPacket {
            command: self.command.unwrap_or(IacCommand::Nop),
            option: self.option,
            data: self.data,
        }
    }
}

/// Tracks which options we will accept the server asking us to enable
/// (`local-supported`) and which options the peer has confirmed active
/// (`remote-enabled`). Mutated only by [`Reactor::react`].
#[derive(Debug, Clone)]
pub struct OptionTable {
    local_supported: HashMap<u8, bool>,
    remote_enabled: HashMap<u8, bool>,
}

impl Default for OptionTable {
    fn default() -> Self {
        let mut local_supported = HashMap::new();
        local_supported.insert(opt::ECHO, true);
        local_supported.insert(opt::TTYPE, true);
        Self { local_supported, remote_enabled: HashMap::new() }
    }
}

impl OptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_supports(&self, option: u8) -> bool {
        *self.local_supported.get(&option).unwrap_or(&false)
    }

    pub fn set_local_supported(&mut self, option: u8, supported: bool) {
        self.local_supported.insert(option, supported);
    }

    pub fn remote_enabled(&self, option: u8) -> bool {
        *self.remote_enabled.get(&option).unwrap_or(&false)
    }
}

/// Stateful only through the [`OptionTable`]; safe to invoke serially from a
/// single task (the IAC-processor loop in `session.rs`).
pub struct Reactor;

impl Reactor {
    /// Consume one inbound packet against `table`, returning the outbound
    /// reply packet (if any) and mutating `table` as spec.md §4.3 dictates.
    pub fn react(table: &mut OptionTable, packet: &IacPacket) -> Option<IacPacket> {
        match packet.command {
            IacCommand::Will => {
                let supported = table.local_supports(packet.option);
                table.remote_enabled.insert(packet.option, supported);
                Some(IacPacket {
                    command: if supported { IacCommand::Do } else { IacCommand::Dont },
                    option: packet.option,
                    data: Vec::new(),
                })
            }
            IacCommand::Wont => {
                table.remote_enabled.insert(packet.option, false);
                Some(IacPacket { command: IacCommand::Dont, option: packet.option, data: Vec::new() })
            }
            IacCommand::Do => {
                let supported = table.local_supports(packet.option);
                Some(IacPacket {
                    command: if supported { IacCommand::Will } else { IacCommand::Wont },
                    option: packet.option,
                    data: Vec::new(),
                })
            }
            IacCommand::Dont => {
                Some(IacPacket { command: IacCommand::Wont, option: packet.option, data: Vec::new() })
            }
            IacCommand::Sb if packet.option == opt::TTYPE => {
                if packet.data.first() == Some(&1) {
                    let mut data = vec![0u8]; // IS
                    data.extend_from_slice(b"xtelnet");
                    Some(IacPacket { command: IacCommand::Sb, option: opt::TTYPE, data })
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

/// Build an `IAC SB <opt> <data> IAC SE` payload with embedded IAC escaped.
pub fn build_subneg(option: u8, data: &[u8]) -> Vec<u8> {
    IacPacket { command: IacCommand::Sb, option, data: data.to_vec() }.to_wire()
}
