//! TinCan Client Core
//!
//! The connect-and-send API a chat front-end sits on:
//! - Connects to a TinCan server
//! - Answers the username handshake
//! - Sends global, direct and group messages
//! - Polls for incoming server lines with a timeout
//!
//! Front-ends (console, GUI) own the read/print loop; this crate only moves
//! lines.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

// ============================================================================
// Constants (MUST match tincan-server)
// ============================================================================

/// Server asks for a username
const REQ_USERNAME: &str = "REQ_USERNAME";

/// Server has no free slot
const SERVER_FULL: &str = "SERVER_FULL";

/// Handshake rejection codes
const BAD_USERNAME: &str = "BAD_USERNAME";
const NOT_ALLOWED: &str = "NOT_ALLOWED";

/// Handshake success prefix
const WELCOME_PREFIX: &str = "Welcome, ";

/// mio token for the server connection
const SERVER_TOKEN: Token = Token(0);

// ============================================================================
// Types
// ============================================================================

/// Result of polling for a server line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// One complete line, without its terminator
    Line(String),
    /// Nothing arrived before the timeout
    Timeout,
    /// The server closed the connection
    Closed,
}

/// Result of the username handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Login {
    /// `Welcome, <username>!`
    Welcome(String),
    /// `BAD_USERNAME` or `NOT_ALLOWED`, with the reason line
    Rejected { code: String, reason: String },
    /// The server had no free slot
    ServerFull,
}

/// Protocol violations seen by the client
#[derive(Debug)]
pub struct ProtocolError(String);

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol error: {}", self.0)
    }
}

impl std::error::Error for ProtocolError {}

fn protocol_error(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, ProtocolError(msg.into()))
}

// ============================================================================
// ChatClient
// ============================================================================

pub struct ChatClient {
    /// mio poll instance
    poll: Poll,
    /// Event storage reused across polls
    events: Events,
    /// Connection to the server
    stream: TcpStream,
    /// Received bytes not yet returned as lines
    inbound: Vec<u8>,
    /// Server closed its side
    closed: bool,
}

impl ChatClient {
    /// Connect to a server, giving up after `timeout`.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let std_stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;
        std_stream.set_nonblocking(true)?;
        std_stream.set_nodelay(true)?;

        let poll = Poll::new()?;
        let mut stream = TcpStream::from_std(std_stream);
        poll.registry().register(
            &mut stream,
            SERVER_TOKEN,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        log::info!("Connected to TinCan server at {}", addr);

        Ok(ChatClient {
            poll,
            events: Events::with_capacity(16),
            stream,
            inbound: Vec::new(),
            closed: false,
        })
    }

    /// Run the handshake: wait for `REQ_USERNAME`, send the name, read the verdict.
    pub fn login(&mut self, username: &str, timeout: Duration) -> io::Result<Login> {
        let deadline = Instant::now() + timeout;

        match self.expect_line(deadline)?.as_str() {
            REQ_USERNAME => {}
            SERVER_FULL => return Ok(Login::ServerFull),
            other => return Err(protocol_error(format!("expected {}, got {:?}", REQ_USERNAME, other))),
        }

        self.send_username(username)?;

        let reply = self.expect_line(deadline)?;
        if reply.starts_with(WELCOME_PREFIX) {
            return Ok(Login::Welcome(reply));
        }
        if reply == BAD_USERNAME || reply == NOT_ALLOWED {
            let reason = match self.recv_line(remaining(deadline))? {
                Incoming::Line(reason) => reason,
                Incoming::Timeout | Incoming::Closed => String::new(),
            };
            return Ok(Login::Rejected { code: reply, reason });
        }
        Err(protocol_error(format!("unexpected handshake reply {:?}", reply)))
    }

    /// Answer `REQ_USERNAME`
    pub fn send_username(&mut self, username: &str) -> io::Result<()> {
        self.send_line(username)
    }

    /// Send a global chat message
    pub fn send_global(&mut self, message: &str) -> io::Result<()> {
        self.send_line(message)
    }

    /// Send a direct message
    pub fn send_dm(&mut self, recipient: &str, message: &str) -> io::Result<()> {
        check_target("recipient", recipient)?;
        self.send_line(&format!("PRIVMSG {} {}", recipient, message))
    }

    /// Send a group message
    pub fn send_group(&mut self, group: &str, message: &str) -> io::Result<()> {
        check_target("group", group)?;
        self.send_line(&format!("GROUPMSG {} {}", group, message))
    }

    /// Send one raw protocol line
    pub fn send_line(&mut self, line: &str) -> io::Result<()> {
        if line.contains('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "line must not contain a newline",
            ));
        }
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.write_all(&data)
    }

    /// Wait up to `timeout` for the next line from the server.
    pub fn recv_line(&mut self, timeout: Duration) -> io::Result<Incoming> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(line) = self.take_line() {
                return Ok(Incoming::Line(line));
            }
            if self.closed {
                return Ok(Incoming::Closed);
            }

            self.fill()?;
            if self.closed || self.has_line() {
                continue;
            }

            let left = remaining(deadline);
            if left.is_zero() {
                return Ok(Incoming::Timeout);
            }
            self.wait(left)?;
        }
    }

    /// Close the connection
    pub fn disconnect(self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            log::debug!("Shutdown error: {}", e);
        }
        log::info!("Disconnected from TinCan server");
    }

    fn expect_line(&mut self, deadline: Instant) -> io::Result<String> {
        match self.recv_line(remaining(deadline))? {
            Incoming::Line(line) => Ok(line),
            Incoming::Timeout => Err(io::Error::new(io::ErrorKind::TimedOut, "no reply from server")),
            Incoming::Closed => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )),
        }
    }

    fn write_all(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            match self.stream.write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait(Duration::from_millis(100))?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Read everything currently available
    fn fill(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.closed = true;
                    return Ok(());
                }
                Ok(n) => self.inbound.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    self.closed = true;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn has_line(&self) -> bool {
        self.inbound.contains(&b'\n')
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.inbound.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.inbound.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn check_target(what: &str, name: &str) -> io::Result<()> {
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} must be a single non-empty word", what),
        ));
    }
    Ok(())
}
