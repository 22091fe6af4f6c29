//! Line protocol: framing, command parsing and reply text
//!
//! # Wire Format
//!
//! ```text
//! client -> server   <username>                 (once, after REQ_USERNAME)
//!                    PRIVMSG <user> <text>      direct message
//!                    GROUPMSG <group> <text>    group message
//!                    <anything else>            global broadcast
//! ```
//!
//! Every line is terminated by `\n`; a preceding `\r` is ignored.

use std::fmt;

// ============================================================================
// Fixed Lines
// ============================================================================

/// Sent to every accepted connection
pub const REQ_USERNAME: &str = "REQ_USERNAME";

/// Sent when the connection table has no free slot
pub const SERVER_FULL: &str = "SERVER_FULL";

const PRIVMSG_PREFIX: &str = "PRIVMSG ";
const GROUPMSG_PREFIX: &str = "GROUPMSG ";

// ============================================================================
// Line Framing
// ============================================================================

/// An inbound line grew past the configured limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTooLong {
    pub limit: usize,
}

impl fmt::Display for LineTooLong {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line exceeds {} bytes", self.limit)
    }
}

impl std::error::Error for LineTooLong {}

/// Accumulates bytes from non-blocking reads and hands out complete lines
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    max_line_len: usize,
}

impl LineBuffer {
    pub fn new(max_line_len: usize) -> Self {
        LineBuffer {
            buf: Vec::new(),
            max_line_len: max_line_len.max(1),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Take the next complete line, without its terminator.
    ///
    /// Returns `Ok(None)` when no full line is buffered yet. Invalid UTF-8 is
    /// replaced rather than rejected.
    pub fn next_line(&mut self) -> Result<Option<String>, LineTooLong> {
        let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
            if self.buf.len() > self.max_line_len {
                return Err(LineTooLong { limit: self.max_line_len });
            }
            return Ok(None);
        };

        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.len() > self.max_line_len {
            return Err(LineTooLong { limit: self.max_line_len });
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }
}

// ============================================================================
// Commands
// ============================================================================

/// A chat line from an active client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// `PRIVMSG <recipient> <text>`
    Direct { recipient: &'a str, text: &'a str },
    /// `GROUPMSG <group> <text>`
    Group { group: &'a str, text: &'a str },
    /// Any other non-empty line
    Broadcast { text: &'a str },
}

/// A `PRIVMSG` or `GROUPMSG` line that cannot be routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// No text after the recipient
    DirectFormat,
    /// Recipient empty or too long
    DirectRecipient,
    /// No text after the group
    GroupFormat,
    /// Group name empty or too long
    GroupName,
}

impl CommandError {
    /// The system notice returned to the sender
    pub fn notice(self) -> String {
        let text = match self {
            CommandError::DirectFormat => "Invalid DM format. Use: PRIVMSG <user> <message>",
            CommandError::DirectRecipient => "Invalid recipient in DM command.",
            CommandError::GroupFormat => "Invalid GM format. Use: GROUPMSG <group> <message>",
            CommandError::GroupName => "Invalid group name in GM command.",
        };
        system(text)
    }
}

/// Classify one line from an active client.
///
/// `Ok(None)` means the line is empty and should be ignored. Names of
/// `name_max_len` bytes or more are rejected.
pub fn parse_command(line: &str, name_max_len: usize) -> Result<Option<Command<'_>>, CommandError> {
    if let Some(rest) = line.strip_prefix(PRIVMSG_PREFIX) {
        let (recipient, text) = split_target(rest, name_max_len).map_err(|e| match e {
            SplitError::Format => CommandError::DirectFormat,
            SplitError::BadTarget => CommandError::DirectRecipient,
        })?;
        return Ok(Some(Command::Direct { recipient, text }));
    }

    if let Some(rest) = line.strip_prefix(GROUPMSG_PREFIX) {
        let (group, text) = split_target(rest, name_max_len).map_err(|e| match e {
            SplitError::Format => CommandError::GroupFormat,
            SplitError::BadTarget => CommandError::GroupName,
        })?;
        return Ok(Some(Command::Group { group, text }));
    }

    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(Command::Broadcast { text: line }))
}

enum SplitError {
    Format,
    BadTarget,
}

/// Split `<target> <text>` on the first space.
///
/// A missing separator or empty text is a format error; an empty or
/// over-long target is a bad target.
fn split_target(rest: &str, name_max_len: usize) -> Result<(&str, &str), SplitError> {
    let (target, text) = rest.split_once(' ').ok_or(SplitError::Format)?;
    if target.is_empty() || target.len() >= name_max_len {
        return Err(SplitError::BadTarget);
    }
    if text.is_empty() {
        return Err(SplitError::Format);
    }
    Ok((target, text))
}

// ============================================================================
// Reply Text
// ============================================================================

pub fn system(text: &str) -> String {
    format!("System: {}", text)
}

pub fn welcome(username: &str) -> String {
    format!("Welcome, {}!", username)
}

pub fn joined(username: &str) -> String {
    system(&format!("{} has joined the chat.", username))
}

pub fn left(username: &str) -> String {
    system(&format!("{} has left the chat.", username))
}

pub fn broadcast(sender: &str, text: &str) -> String {
    format!("{}: {}", sender, text)
}

pub fn dm_from(sender: &str, text: &str) -> String {
    format!("(DM from {}): {}", sender, text)
}

pub fn dm_to(recipient: &str, text: &str) -> String {
    format!("(DM to {}): {}", recipient, text)
}

pub fn dm_record(sender: &str, recipient: &str, text: &str) -> String {
    format!("DM from {} to {}: {}", sender, recipient, text)
}

pub fn user_not_found(username: &str) -> String {
    system(&format!("User '{}' not found or is offline.", username))
}

pub fn group_from(group: &str, sender: &str, text: &str) -> String {
    format!("(#{} from {}): {}", group, sender, text)
}

pub fn group_to(group: &str, text: &str) -> String {
    format!("(To #{}): {}", group, text)
}

pub fn group_record(group: &str, sender: &str, text: &str) -> String {
    format!("GROUPMSG to #{} from {}: {}", group, sender, text)
}

pub fn group_not_found(group: &str) -> String {
    system(&format!("Group '#{}' not found.", group))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_splits_lines() {
        let mut lb = LineBuffer::new(64);
        lb.extend(b"hel");
        assert_eq!(lb.next_line(), Ok(None));
        lb.extend(b"lo\r\nworld\n\npart");
        assert_eq!(lb.next_line(), Ok(Some("hello".to_string())));
        assert_eq!(lb.next_line(), Ok(Some("world".to_string())));
        assert_eq!(lb.next_line(), Ok(Some(String::new())));
        assert_eq!(lb.next_line(), Ok(None));
        lb.extend(b"\n");
        assert_eq!(lb.next_line(), Ok(Some("part".to_string())));
    }

    #[test]
    fn test_line_buffer_byte_at_a_time() {
        let mut lb = LineBuffer::new(64);
        for b in b"alice\n" {
            assert_eq!(lb.next_line(), Ok(None));
            lb.extend(&[*b]);
        }
        assert_eq!(lb.next_line(), Ok(Some("alice".to_string())));
    }

    #[test]
    fn test_line_buffer_too_long() {
        let mut lb = LineBuffer::new(4);
        lb.extend(b"abcd\n");
        assert_eq!(lb.next_line(), Ok(Some("abcd".to_string())));
        lb.extend(b"abcde");
        assert_eq!(lb.next_line(), Err(LineTooLong { limit: 4 }));
    }

    #[test]
    fn test_line_buffer_too_long_with_terminator() {
        let mut lb = LineBuffer::new(4);
        lb.extend(b"abcdef\n");
        assert!(lb.next_line().is_err());
    }

    #[test]
    fn test_parse_privmsg() {
        assert_eq!(
            parse_command("PRIVMSG bob hi there", 50),
            Ok(Some(Command::Direct { recipient: "bob", text: "hi there" }))
        );
    }

    #[test]
    fn test_parse_privmsg_malformed() {
        assert_eq!(parse_command("PRIVMSG bob", 50), Err(CommandError::DirectFormat));
        assert_eq!(parse_command("PRIVMSG bob ", 50), Err(CommandError::DirectFormat));
        assert_eq!(parse_command("PRIVMSG ", 50), Err(CommandError::DirectFormat));
        let long = format!("PRIVMSG {} hi", "x".repeat(50));
        assert_eq!(parse_command(&long, 50), Err(CommandError::DirectRecipient));
    }

    #[test]
    fn test_parse_empty_target() {
        assert_eq!(parse_command("PRIVMSG  hi", 50), Err(CommandError::DirectRecipient));
        assert_eq!(parse_command("GROUPMSG  hi", 50), Err(CommandError::GroupName));
        assert_eq!(
            CommandError::DirectRecipient.notice(),
            "System: Invalid recipient in DM command."
        );
    }

    #[test]
    fn test_parse_groupmsg() {
        assert_eq!(
            parse_command("GROUPMSG devs ship it", 50),
            Ok(Some(Command::Group { group: "devs", text: "ship it" }))
        );
        assert_eq!(parse_command("GROUPMSG devs", 50), Err(CommandError::GroupFormat));
        let long = format!("GROUPMSG {} hi", "g".repeat(60));
        assert_eq!(parse_command(&long, 50), Err(CommandError::GroupName));
    }

    #[test]
    fn test_parse_broadcast() {
        assert_eq!(
            parse_command("hello all", 50),
            Ok(Some(Command::Broadcast { text: "hello all" }))
        );
        // Prefix match is exact and case-sensitive
        assert_eq!(
            parse_command("privmsg bob hi", 50),
            Ok(Some(Command::Broadcast { text: "privmsg bob hi" }))
        );
        assert_eq!(
            parse_command("PRIVMSG", 50),
            Ok(Some(Command::Broadcast { text: "PRIVMSG" }))
        );
        assert_eq!(parse_command("", 50), Ok(None));
    }

    #[test]
    fn test_error_notices() {
        assert_eq!(
            CommandError::DirectFormat.notice(),
            "System: Invalid DM format. Use: PRIVMSG <user> <message>"
        );
        assert_eq!(
            CommandError::GroupName.notice(),
            "System: Invalid group name in GM command."
        );
    }

    #[test]
    fn test_reply_text() {
        assert_eq!(welcome("alice"), "Welcome, alice!");
        assert_eq!(joined("alice"), "System: alice has joined the chat.");
        assert_eq!(left("alice"), "System: alice has left the chat.");
        assert_eq!(dm_from("a", "x"), "(DM from a): x");
        assert_eq!(dm_to("b", "x"), "(DM to b): x");
        assert_eq!(group_from("g", "a", "x"), "(#g from a): x");
        assert_eq!(group_to("g", "x"), "(To #g): x");
        assert_eq!(user_not_found("zed"), "System: User 'zed' not found or is offline.");
        assert_eq!(group_not_found("nope"), "System: Group '#nope' not found.");
    }
}
