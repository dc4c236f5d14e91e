//! Request/reply control plane
//!
//! Requests are ASCII lines: a 7-character command, a space, and an
//! argument written as a C integer literal (`0x` hex, leading `0` octal,
//! otherwise decimal). Replies are `OK`, `ERR`, or for `GETSTAT` the two
//! counters as `"<starts> <stops>"`.
//!
//! | Command   | Argument          | Action                                   |
//! |-----------|-------------------|------------------------------------------|
//! | `SETFREQ` | kHz               | program the clock divider                |
//! | `SNDWORD` | raw 64-bit word   | send to every channel                    |
//! | `SYRESET` | ignored           | pulse system reset                       |
//! | `GETSTAT` | channel index     | read the start/stop counters             |
//! | `SETCONF` | `chip reg data`   | encode a register write, send everywhere |

use crate::board::Board;
use crate::channel::{ChannelId, RegisterChannel};
use crate::error::{LinkError, Result};
use std::fmt;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use uart54_chip::{ParityKind, Word, WordCodec};

const COMMAND_LEN: usize = 7;
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// A parsed control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// `SETFREQ`: output clock in kHz
    SetFrequency(u64),
    /// `SNDWORD`: raw word for every channel
    SendWord(u64),
    /// `SYRESET`
    SystemReset,
    /// `GETSTAT`: channel index
    GetStats(u64),
    /// `SETCONF`: register write for every channel
    SetConfig {
        /// Chip id
        chip: u64,
        /// Register address
        register: u64,
        /// Payload
        data: u64,
    },
    /// Well-formed but unrecognized command
    Unknown(String),
}

impl ControlRequest {
    /// Parse one request
    ///
    /// A missing argument reads as 0.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidRequest`] if the command is shorter than
    /// seven characters or not ASCII.
    pub fn parse(request: &str) -> Result<Self> {
        let request = request.trim_end_matches(['\r', '\n', '\0']);
        let command = request
            .get(..COMMAND_LEN)
            .filter(|c| c.is_ascii())
            .ok_or_else(|| LinkError::invalid_request(format!("malformed request {request:?}")))?;
        let arg = request.get(COMMAND_LEN + 1..).unwrap_or("");

        Ok(match command {
            "SETFREQ" => Self::SetFrequency(strtoull(arg).0),
            "SNDWORD" => Self::SendWord(strtoull(arg).0),
            "SYRESET" => Self::SystemReset,
            "GETSTAT" => Self::GetStats(strtoull(arg).0),
            "SETCONF" => {
                let (chip, rest) = strtoull(arg);
                let (register, rest) = strtoull(rest);
                let (data, _) = strtoull(rest);
                Self::SetConfig { chip, register, data }
            }
            other => Self::Unknown(other.to_string()),
        })
    }
}

/// Parse a leading C integer literal, returning the value and the rest
///
/// Leading whitespace and a `+` are skipped; no digits yields 0; overflow
/// saturates.
fn strtoull(s: &str) -> (u64, &str) {
    let s = s.trim_start();
    let s = s.strip_prefix('+').unwrap_or(s);
    let (radix, body) = match s.as_bytes() {
        [b'0', b'x' | b'X', next, ..] if next.is_ascii_hexdigit() => (16, &s[2..]),
        [b'0', ..] => (8, s),
        _ => (10, s),
    };
    let end = body
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(body.len());
    let value = body[..end].chars().fold(0u64, |acc, c| {
        let digit = u64::from(c.to_digit(radix).unwrap_or(0));
        acc.saturating_mul(u64::from(radix)).saturating_add(digit)
    });
    (value, &body[end..])
}

/// Reply to a control request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    /// Done
    Ok,
    /// Rejected or failed
    Err,
    /// `GETSTAT` counters
    Stats {
        /// Start-bit count
        starts: u32,
        /// Stop-bit count
        stops: u32,
    },
}

impl fmt::Display for ControlReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("OK"),
            Self::Err => f.write_str("ERR"),
            Self::Stats { starts, stops } => write!(f, "{starts} {stops}"),
        }
    }
}

/// Executes control requests against the board and channels
#[derive(Debug)]
pub struct ControlHandler {
    board: Board,
    channels: Vec<Arc<RegisterChannel>>,
    codec: WordCodec<ParityKind>,
    send_timeout: Duration,
}

impl ControlHandler {
    /// Handler driving `board` and broadcasting to `channels`
    pub fn new(
        board: Board,
        channels: Vec<Arc<RegisterChannel>>,
        codec: WordCodec<ParityKind>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            board,
            channels,
            codec,
            send_timeout,
        }
    }

    /// Parse and execute one request line
    pub fn handle_line(&self, line: &str) -> ControlReply {
        match ControlRequest::parse(line) {
            Ok(request) => self.handle(&request),
            Err(e) => {
                tracing::warn!("{e}");
                ControlReply::Err
            }
        }
    }

    /// Execute a parsed request
    pub fn handle(&self, request: &ControlRequest) -> ControlReply {
        tracing::info!("Control request {request:?}");
        match self.execute(request) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Control request {request:?} failed: {e}");
                ControlReply::Err
            }
        }
    }

    fn execute(&self, request: &ControlRequest) -> Result<ControlReply> {
        match *request {
            ControlRequest::SetFrequency(khz) => {
                let khz = u32::try_from(khz)
                    .map_err(|_| LinkError::invalid_request(format!("{khz} kHz out of range")))?;
                self.board.set_clock_khz(khz)?;
            }
            ControlRequest::SendWord(raw) => self.broadcast(Word::from_raw(raw))?,
            ControlRequest::SystemReset => self.board.system_reset()?,
            ControlRequest::GetStats(index) => {
                let stats = self.channel(index)?.read_stats()?;
                return Ok(ControlReply::Stats {
                    starts: stats.starts,
                    stops: stats.stops,
                });
            }
            ControlRequest::SetConfig { chip, register, data } => {
                let word = self.codec.encode_config_command(chip, register, data)?;
                self.broadcast(word)?;
            }
            ControlRequest::Unknown(ref command) => {
                return Err(LinkError::invalid_request(format!("unknown command {command}")));
            }
        }
        Ok(ControlReply::Ok)
    }

    fn channel(&self, index: u64) -> Result<&RegisterChannel> {
        usize::try_from(index)
            .ok()
            .and_then(ChannelId::from_index)
            .and_then(|id| self.channels.iter().find(|ch| ch.id() == id))
            .map(|ch| &**ch)
            .ok_or_else(|| LinkError::unknown_channel(index.to_string()))
    }

    /// Send `word` to every channel, attempting all of them before failing
    fn broadcast(&self, word: Word) -> Result<()> {
        tracing::info!("Sending {word} to all channels");
        let mut failed = Vec::new();
        for channel in &self.channels {
            if let Err(e) = channel.send_word(word, self.send_timeout) {
                tracing::warn!("Channel {}: {e}", channel.id());
                failed.push(channel.id().letter());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(LinkError::transport(format!(
                "send failed on channels {}",
                failed.iter().collect::<String>()
            )))
        }
    }
}

/// TCP front end for a [`ControlHandler`]
///
/// Each connection may send any number of newline-terminated requests and
/// receives one reply line per request.
#[derive(Debug)]
pub struct ControlServer {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind `addr` and start serving
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Transport`] if the address cannot be bound.
    pub fn spawn(addr: impl ToSocketAddrs, handler: Arc<ControlHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| LinkError::transport(format!("Cannot bind control port: {e}")))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));

        let acceptor = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("uart54-control".into())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        match listener.accept() {
                            Ok((stream, peer)) => {
                                let handler = Arc::clone(&handler);
                                let spawned = std::thread::Builder::new()
                                    .name(format!("uart54-control-{peer}"))
                                    .spawn(move || serve_connection(stream, &handler));
                                if let Err(e) = spawned {
                                    tracing::error!("Cannot serve {peer}: {e}");
                                }
                            }
                            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                                std::thread::sleep(ACCEPT_POLL);
                            }
                            Err(e) => {
                                tracing::error!("Control accept failed: {e}");
                                return;
                            }
                        }
                    }
                })?
        };

        tracing::info!("Control server listening on tcp://{local_addr}");
        Ok(Self {
            local_addr,
            stop,
            acceptor: Some(acceptor),
        })
    }

    /// Address actually bound
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                tracing::error!("Control acceptor panicked");
            }
        }
    }
}

fn serve_connection(stream: TcpStream, handler: &ControlHandler) {
    let peer = stream.peer_addr().ok();
    let result = (|| -> std::io::Result<()> {
        stream.set_nonblocking(false)?;
        let mut writer = stream.try_clone()?;
        for line in BufReader::new(stream).lines() {
            let reply = handler.handle_line(&line?);
            writeln!(writer, "{reply}")?;
        }
        Ok(())
    })();
    if let Err(e) = result {
        tracing::debug!("Control connection {peer:?} closed: {e}");
    }
}

/// Send one request to a control server and return the reply line
///
/// # Errors
///
/// Returns an error if the server cannot be reached or does not answer
/// within `timeout`.
pub fn request(addr: impl ToSocketAddrs, line: &str, timeout: Duration) -> Result<String> {
    let stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(timeout))?;
    let mut writer = stream.try_clone()?;
    writeln!(writer, "{line}")?;

    let mut reply = String::new();
    BufReader::new(stream)
        .read_line(&mut reply)
        .map_err(|e| match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => LinkError::timeout("control reply", timeout),
            _ => e.into(),
        })?;
    if reply.is_empty() {
        return Err(LinkError::transport("control server closed the connection"));
    }
    Ok(reply.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_literals_follow_c_rules() {
        assert_eq!(strtoull("42").0, 42);
        assert_eq!(strtoull("0x2a").0, 42);
        assert_eq!(strtoull("052").0, 42);
        assert_eq!(strtoull("  +7 rest"), (7, " rest"));
        assert_eq!(strtoull("zzz").0, 0);
        assert_eq!(strtoull("0x").0, 0);
        assert_eq!(strtoull("99999999999999999999999").0, u64::MAX);
    }

    #[test]
    fn requests_parse() {
        assert_eq!(
            ControlRequest::parse("SETFREQ 10000").unwrap(),
            ControlRequest::SetFrequency(10_000)
        );
        assert_eq!(
            ControlRequest::parse("SNDWORD 0xdeadbeef\n").unwrap(),
            ControlRequest::SendWord(0xdead_beef)
        );
        assert_eq!(ControlRequest::parse("SYRESET").unwrap(), ControlRequest::SystemReset);
        assert_eq!(ControlRequest::parse("GETSTAT 1").unwrap(), ControlRequest::GetStats(1));
        assert_eq!(
            ControlRequest::parse("SETCONF 3 0x10 0777").unwrap(),
            ControlRequest::SetConfig {
                chip: 3,
                register: 0x10,
                data: 0o777
            }
        );
        assert_eq!(
            ControlRequest::parse("GET_SCR 0").unwrap(),
            ControlRequest::Unknown("GET_SCR".into())
        );
        assert!(ControlRequest::parse("SET").is_err());
    }

    #[test]
    fn replies_render() {
        assert_eq!(ControlReply::Ok.to_string(), "OK");
        assert_eq!(ControlReply::Err.to_string(), "ERR");
        assert_eq!(ControlReply::Stats { starts: 12, stops: 11 }.to_string(), "12 11");
    }
}
