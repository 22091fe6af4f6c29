//! Username handshake
//!
//! A pending connection sends exactly one line: the username it wants. The
//! outcome is terminal either way:
//!   empty                         → BAD_USERNAME, closed
//!   too long                      → BAD_USERNAME, closed
//!   not on the allow-list         → NOT_ALLOWED, closed
//!   already active (if enforced)  → BAD_USERNAME, closed
//!   otherwise                     → Active

use std::fmt;

use crate::directory::AllowList;
use crate::slots::ConnectionTable;

// ============================================================================
// Types
// ============================================================================

/// Why a username was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Empty,
    TooLong,
    NotAllowed,
    AlreadyInUse,
}

impl Rejection {
    /// Terminal reply sent before the connection is closed
    pub fn reply(self) -> &'static str {
        match self {
            Rejection::Empty => "BAD_USERNAME\nUsername cannot be empty.",
            Rejection::TooLong => "BAD_USERNAME\nUsername too long.",
            Rejection::NotAllowed => "NOT_ALLOWED\nUsername not on allowed list.",
            Rejection::AlreadyInUse => "BAD_USERNAME\nUsername already in use.",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Empty => write!(f, "empty username"),
            Rejection::TooLong => write!(f, "username too long"),
            Rejection::NotAllowed => write!(f, "username not on allow-list"),
            Rejection::AlreadyInUse => write!(f, "username already in use"),
        }
    }
}

/// Rules applied to every handshake
#[derive(Debug, Clone, Copy)]
pub struct HandshakePolicy {
    /// Names of this many bytes or more are refused
    pub username_max_len: usize,
    /// Refuse a name that is already active on another slot
    pub reject_duplicates: bool,
}

// ============================================================================
// Evaluation
// ============================================================================

/// Decide whether `line` completes the handshake.
///
/// Returns the accepted username; the caller performs the state change.
pub fn evaluate<S>(
    line: &str,
    allow_list: &AllowList,
    table: &ConnectionTable<S>,
    policy: HandshakePolicy,
) -> Result<String, Rejection> {
    let username = line.trim();

    if username.is_empty() {
        return Err(Rejection::Empty);
    }
    if username.len() >= policy.username_max_len {
        return Err(Rejection::TooLong);
    }
    if !allow_list.contains(username) {
        return Err(Rejection::NotAllowed);
    }
    if policy.reject_duplicates && table.is_name_active(username) {
        return Err(Rejection::AlreadyInUse);
    }

    Ok(username.to_string())
}

// ============================================================================
// Unit Tests
// ============================================================================
