//! Static user directory: the allow-list and group definitions
//!
//! Both tables are loaded once at startup and never change while serving.
//! A missing file is not fatal; it yields an empty table and a warning.

use std::collections::{HashMap, HashSet};
use std::path::Path;

// ============================================================================
// Allow-List
// ============================================================================

/// Usernames permitted to complete the handshake
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    names: HashSet<String>,
}

impl AllowList {
    /// Parse one username per line. Blank lines and names of
    /// `max_len` bytes or more are skipped.
    pub fn parse(text: &str, max_len: usize) -> Self {
        let mut names = HashSet::new();
        for line in text.lines() {
            let name = line.trim();
            if name.is_empty() {
                continue;
            }
            if name.len() >= max_len {
                log::warn!("Allow-list entry '{}' exceeds max length, ignored", name);
                continue;
            }
            names.insert(name.to_string());
        }
        AllowList { names }
    }

    pub fn load(path: &Path, max_len: usize) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let list = AllowList::parse(&text, max_len);
                log::info!("Loaded {} allowed usernames from {}", list.len(), path.display());
                list
            }
            Err(e) => {
                log::warn!(
                    "Could not open {}: {}. No users will be allowed.",
                    path.display(),
                    e
                );
                AllowList::default()
            }
        }
    }

    pub fn contains(&self, username: &str) -> bool {
        self.names.contains(username)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for AllowList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        AllowList {
            names: iter.into_iter().map(Into::into).collect(),
        }
    }
}

// ============================================================================
// Groups
// ============================================================================

/// A named, static list of member usernames
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub name: String,
    /// Members in file order, without duplicates
    pub members: Vec<String>,
}

/// All groups, keyed by exact name
#[derive(Debug, Clone, Default)]
pub struct GroupTable {
    groups: HashMap<String, Group>,
}

impl GroupTable {
    /// Parse `name:member1,member2,...` lines.
    ///
    /// Lines without a `:`, with an empty or over-long name, or without any
    /// valid member are skipped.
    pub fn parse(text: &str, max_len: usize) -> Self {
        let mut table = GroupTable::default();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some((name, members)) = line.split_once(':') else {
                log::warn!("Skipping malformed group line: {}", line);
                continue;
            };
            let name = name.trim();
            if name.is_empty() || name.len() >= max_len {
                log::warn!("Skipping group with empty or over-long name: {}", line);
                continue;
            }

            let mut group = Group {
                name: name.to_string(),
                members: Vec::new(),
            };
            for member in members.split(',').map(str::trim) {
                if member.is_empty() {
                    continue;
                }
                if member.len() >= max_len {
                    log::warn!("Member '{}' of group '{}' exceeds max length, ignored", member, name);
                    continue;
                }
                if !group.members.iter().any(|m| m == member) {
                    group.members.push(member.to_string());
                }
            }

            if group.members.is_empty() {
                log::warn!("Group '{}' has no valid members, ignored", name);
                continue;
            }
            table.insert(group);
        }

        table
    }

    pub fn load(path: &Path, max_len: usize) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let table = GroupTable::parse(&text, max_len);
                log::info!("Loaded {} groups from {}", table.len(), path.display());
                for group in table.groups.values() {
                    log::debug!("  - Group '{}': {} members", group.name, group.members.len());
                }
                table
            }
            Err(e) => {
                log::warn!(
                    "Could not open {}: {}. No groups will be available.",
                    path.display(),
                    e
                );
                GroupTable::default()
            }
        }
    }

    /// Add or replace a group
    pub fn insert(&mut self, group: Group) {
        self.groups.insert(group.name.clone(), group);
    }

    pub fn get(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
