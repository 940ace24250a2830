//! Parent/child control channel.
//!
//! The child inherits one end of a Unix socket pair as file descriptor
//! [`CHANNEL_FD`] and finds its number in [`CHANNEL_FD_ENV`]. Each message is one
//! line of JSON. A line that does not parse as JSON is taken as a plain string,
//! so a shell script can simply `echo RESTART >&3`.
//!
//! Three string messages are lifecycle commands for the supervisor itself
//! (see [`ControlCommand`]); everything else is application payload.

use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::stat::{fstat, SFlag};
use nix::unistd::dup2;
use serde::Serialize;
use serde_json::Value;
use tokio::net::UnixStream;

pub const CHANNEL_FD: RawFd = 3;
pub const CHANNEL_FD_ENV: &str = "SUPERVISOR_CHANNEL_FD";

static CHANNEL_CLAIMED: AtomicBool = AtomicBool::new(false);

/// Lifecycle requests a child can make about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Stop,
    Start,
    Restart,
}

impl ControlCommand {
    /// Matches string payloads `STOP`, `START` and `RESTART`, ignoring case and
    /// surrounding whitespace. Any other value is not a command.
    pub fn parse(msg: &Value) -> Option<Self> {
        let Value::String(text) = msg else {
            return None;
        };
        let token = text.trim();
        if token.eq_ignore_ascii_case("STOP") {
            Some(Self::Stop)
        } else if token.eq_ignore_ascii_case("START") {
            Some(Self::Start)
        } else if token.eq_ignore_ascii_case("RESTART") {
            Some(Self::Restart)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "STOP",
            Self::Start => "START",
            Self::Restart => "RESTART",
        }
    }
}

/// Decodes one received line. Invalid JSON becomes a string payload.
pub fn decode_line(line: &str) -> Value {
    let line = line.trim_end_matches(&['\r', '\n'][..]);
    serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string()))
}

/// Encodes a payload as a single newline-terminated JSON line.
pub fn encode_line<T: Serialize + ?Sized>(msg: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Creates the socket pair for one child: the supervisor's async end and the
/// end handed to the child.
pub fn channel_pair() -> io::Result<(UnixStream, OwnedFd)> {
    let (ours, theirs) = StdUnixStream::pair()?;
    ours.set_nonblocking(true)?;
    Ok((UnixStream::from_std(ours)?, OwnedFd::from(theirs)))
}

/// Arranges for `child_end` to appear as [`CHANNEL_FD`] in the spawned child.
///
/// The caller keeps `child_end` alive until `spawn` returns, then drops it.
pub fn install_child_end(cmd: &mut tokio::process::Command, child_end: &OwnedFd) {
    let raw = child_end.as_raw_fd();
    cmd.env(CHANNEL_FD_ENV, CHANNEL_FD.to_string());
    // SAFETY: only async-signal-safe calls (dup2, fcntl) run between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if raw == CHANNEL_FD {
                let flags = FdFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFD)?);
                fcntl(raw, FcntlArg::F_SETFD(flags - FdFlag::FD_CLOEXEC))?;
            } else {
                dup2(raw, CHANNEL_FD)?;
            }
            Ok(())
        });
    }
}

/// The child's side of the channel, for supervised programs written in Rust.
///
/// Blocking on purpose: the child need not run an async runtime.
pub struct ChildChannel {
    reader: BufReader<StdUnixStream>,
    writer: StdUnixStream,
}

impl ChildChannel {
    /// Opens the inherited channel, or `None` when not running under a supervisor.
    ///
    /// The descriptor is claimed once per process: [`CHANNEL_FD_ENV`] is removed
    /// and later calls return `None`. A descriptor that is not an open socket is
    /// an error.
    pub fn from_env() -> Option<io::Result<Self>> {
        let fd: RawFd = std::env::var(CHANNEL_FD_ENV).ok()?.parse().ok()?;
        if CHANNEL_CLAIMED.swap(true, Ordering::SeqCst) {
            return None;
        }
        std::env::remove_var(CHANNEL_FD_ENV);

        let stat = match fstat(fd) {
            Ok(stat) => stat,
            Err(errno) => return Some(Err(errno.into())),
        };
        if stat.st_mode & SFlag::S_IFMT.bits() != SFlag::S_IFSOCK.bits() {
            return Some(Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{CHANNEL_FD_ENV}={fd} is not a socket"),
            )));
        }
        // SAFETY: the descriptor is open, is a socket, and CHANNEL_CLAIMED makes
        // this the only owner created in this process.
        let stream = unsafe { StdUnixStream::from_raw_fd(fd) };
        Some(Self::from_stream(stream))
    }

    pub fn from_stream(stream: StdUnixStream) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    pub fn send<T: Serialize + ?Sized>(&mut self, msg: &T) -> io::Result<()> {
        let line = encode_line(msg).map_err(io::Error::other)?;
        self.writer.write_all(line.as_bytes())
    }

    pub fn send_command(&mut self, cmd: ControlCommand) -> io::Result<()> {
        self.send(cmd.as_str())
    }

    /// Next message from the supervisor; `Ok(None)` once the supervisor hung up.
    pub fn recv(&mut self) -> io::Result<Option<Value>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(decode_line(&line)))
    }
}
