//! Message routing for active connections
//!
//! Routing is pure: it reads the connection table and group table and returns
//! the lines to deliver plus the record to append to the chat log. The server
//! loop performs the actual sends, so every rule here is testable without
//! sockets.

use crate::directory::GroupTable;
use crate::protocol::{self, Command};
use crate::slots::{ConnectionTable, SlotId};

/// One line for one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: SlotId,
    pub line: String,
}

impl Delivery {
    fn new(to: SlotId, line: String) -> Self {
        Delivery { to, line }
    }
}

/// What kind of routing took place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Empty line, or the sender is not active
    Ignored,
    /// Delivered to every active slot
    Broadcast,
    /// Delivered to an online recipient
    Direct,
    /// Recipient offline or unknown
    DirectUndeliverable,
    /// Delivered to the online members of a group
    Group { members_reached: usize },
    /// No such group
    UnknownGroup,
    /// Bad PRIVMSG/GROUPMSG syntax
    Malformed,
}

/// Result of routing one line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub outcome: Outcome,
    /// Lines to send, in send order
    pub deliveries: Vec<Delivery>,
    /// Chat log record, if the message is logged
    pub record: Option<String>,
}

impl Dispatch {
    fn ignored() -> Self {
        Dispatch {
            outcome: Outcome::Ignored,
            deliveries: Vec::new(),
            record: None,
        }
    }

    /// A single reply to the sender, nothing logged
    fn notice(outcome: Outcome, sender: SlotId, line: String) -> Self {
        Dispatch {
            outcome,
            deliveries: vec![Delivery::new(sender, line)],
            record: None,
        }
    }
}

/// Route one line received from `sender`.
pub fn route<S>(
    sender: SlotId,
    line: &str,
    table: &ConnectionTable<S>,
    groups: &GroupTable,
    name_max_len: usize,
) -> Dispatch {
    let Some(sender_name) = table.username(sender) else {
        return Dispatch::ignored();
    };

    let command = match protocol::parse_command(line, name_max_len) {
        Ok(Some(command)) => command,
        Ok(None) => return Dispatch::ignored(),
        Err(e) => return Dispatch::notice(Outcome::Malformed, sender, e.notice()),
    };

    match command {
        Command::Direct { recipient, text } => match table.find_active(recipient) {
            Some(to) => Dispatch {
                outcome: Outcome::Direct,
                deliveries: vec![
                    Delivery::new(to, protocol::dm_from(sender_name, text)),
                    Delivery::new(sender, protocol::dm_to(recipient, text)),
                ],
                record: Some(protocol::dm_record(sender_name, recipient, text)),
            },
            None => Dispatch::notice(
                Outcome::DirectUndeliverable,
                sender,
                protocol::user_not_found(recipient),
            ),
        },

        Command::Group { group, text } => {
            let Some(group) = groups.get(group) else {
                return Dispatch::notice(
                    Outcome::UnknownGroup,
                    sender,
                    protocol::group_not_found(group),
                );
            };

            let line = protocol::group_from(&group.name, sender_name, text);
            let mut deliveries: Vec<Delivery> = group
                .members
                .iter()
                .filter_map(|member| table.find_active(member))
                .map(|to| Delivery::new(to, line.clone()))
                .collect();
            let members_reached = deliveries.len();
            deliveries.push(Delivery::new(sender, protocol::group_to(&group.name, text)));

            Dispatch {
                outcome: Outcome::Group { members_reached },
                deliveries,
                record: Some(protocol::group_record(&group.name, sender_name, text)),
            }
        }

        Command::Broadcast { text } => {
            let line = protocol::broadcast(sender_name, text);
            Dispatch {
                outcome: Outcome::Broadcast,
                deliveries: table
                    .active_ids()
                    .into_iter()
                    .map(|to| Delivery::new(to, line.clone()))
                    .collect(),
                record: Some(line),
            }
        }
    }
}
