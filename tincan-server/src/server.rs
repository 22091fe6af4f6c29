//! The connection multiplexer loop
//!
//! One thread owns everything: the listener, the connection table, the
//! allow-list and groups, and the chat log. Each iteration waits for the ready
//! set, accepts new connections first, then services ready slots in table
//! order. Sends never block: output is queued per slot and flushed when the
//! socket is writable. Slots that fail are closed only after the event that
//! discovered the failure has been handled, so a broadcast never has its
//! recipient list change underneath it.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};

use crate::config::ServerConfig;
use crate::directory::{AllowList, GroupTable};
use crate::handshake::{self, HandshakePolicy};
use crate::history::{HistoryLog, HISTORY_BEGIN, HISTORY_END};
use crate::metrics::Metrics;
use crate::multiplexer::{MioMultiplexer, Multiplexer, Readiness};
use crate::protocol;
use crate::router::{self, Outcome};
use crate::slots::{ConnectionTable, SlotId, SlotState};

// ============================================================================
// Constants
// ============================================================================

/// Longest wait before the shutdown flag is checked again
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Size of a single socket read
const RECV_CHUNK: usize = 4096;

// ============================================================================
// Shutdown Handle
// ============================================================================

/// Asks a running server to stop at its next loop iteration
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// The underlying flag, for signal registration
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

// ============================================================================
// Server Structure
// ============================================================================

pub struct Server<M: Multiplexer = MioMultiplexer> {
    /// Readiness source
    mux: M,
    /// Listening socket
    listener: TcpListener,
    /// Connection slots
    table: ConnectionTable<TcpStream>,
    /// Usernames permitted to log in
    allow_list: AllowList,
    /// Static group definitions
    groups: GroupTable,
    /// Append-only chat log
    history: HistoryLog,
    config: ServerConfig,
    metrics: Metrics,
    shutdown: Arc<AtomicBool>,
    /// Slots to free once the current event is handled
    closing: VecDeque<SlotId>,
    /// Receive buffer
    recv_buf: Vec<u8>,
}

impl Server<MioMultiplexer> {
    /// Load the allow-list and groups named in `config`, then bind.
    pub fn bind(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let allow_list = AllowList::load(&config.allowed_users, config.username_max_len);
        if allow_list.is_empty() {
            log::warn!("Allow-list is empty; every login will be refused");
        }
        let groups = GroupTable::load(&config.groups, config.username_max_len);
        if groups.is_empty() {
            log::info!("No groups defined; GROUPMSG will report unknown groups");
        }
        Server::with_tables(config, allow_list, groups)
    }

    /// Bind with already-parsed tables
    pub fn with_tables(
        config: ServerConfig,
        allow_list: AllowList,
        groups: GroupTable,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        Server::with_multiplexer(MioMultiplexer::new()?, config, allow_list, groups)
    }
}

impl<M: Multiplexer> Server<M> {
    pub fn with_multiplexer(
        mut mux: M,
        config: ServerConfig,
        allow_list: AllowList,
        groups: GroupTable,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        config.validate()?;

        let history = HistoryLog::open(&config.chat_log).map_err(|e| {
            format!("cannot open chat log {}: {}", config.chat_log.display(), e)
        })?;

        let mut listener = TcpListener::bind(config.bind_addr)?;
        mux.watch_listener(&mut listener)?;
        log::info!("Server listening on {}", listener.local_addr()?);

        Ok(Server {
            mux,
            listener,
            table: ConnectionTable::new(config.max_clients, config.max_line_len),
            allow_list,
            groups,
            history,
            config,
            metrics: Metrics::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            closing: VecDeque::new(),
            recv_buf: vec![0u8; RECV_CHUNK],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
        }
    }

    /// Serve until shutdown is requested or the multiplexer fails.
    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut ready = Vec::new();

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.mux.wait(&mut ready, Some(POLL_INTERVAL)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Readiness wait failed: {}", e);
                    return Err(e.into());
                }
            }
            self.process_ready(&ready);
        }

        log::info!("Server shutting down");
        self.close_all();
        log::info!("Final metrics:\n{}", self.metrics.render());
        Ok(())
    }

    /// Handle one ready set: listener first, then slots in table order.
    fn process_ready(&mut self, ready: &[Readiness]) {
        let mut listener_ready = false;
        let mut slots: BTreeMap<SlotId, (bool, bool)> = BTreeMap::new();

        for r in ready {
            match *r {
                Readiness::Listener => listener_ready = true,
                Readiness::Slot { id, readable, writable } => {
                    let entry = slots.entry(id).or_default();
                    entry.0 |= readable;
                    entry.1 |= writable;
                }
            }
        }

        if listener_ready {
            self.accept_pending();
        }

        for (id, (readable, writable)) in slots {
            if writable {
                self.flush(id);
            }
            if readable {
                self.receive(id);
            }
            self.process_closing();
        }
    }

    // ------------------------------------------------------------------------
    // Acceptance
    // ------------------------------------------------------------------------

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept() failed: {}", e);
                    break;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        log::info!("New connection attempt from {}", peer);

        let id = match self.table.occupy(stream, peer) {
            Ok(id) => id,
            Err(mut stream) => {
                log::info!("Max clients reached. Rejecting new connection from {}", peer);
                Metrics::incr(&self.metrics.connections_rejected_full_total);
                let line = format!("{}\n", protocol::SERVER_FULL);
                if let Err(e) = stream.write_all(line.as_bytes()) {
                    log::debug!("Failed to send SERVER_FULL to {}: {}", peer, e);
                }
                return;
            }
        };

        let watched = match self.table.get_mut(id) {
            Some(slot) => self.mux.watch(&mut slot.conn, id, false),
            None => return,
        };
        if let Err(e) = watched {
            log::warn!("Cannot watch connection from {}: {}", peer, e);
            self.table.free(id);
            return;
        }

        Metrics::incr(&self.metrics.connections_accepted_total);
        Metrics::incr(&self.metrics.connected_clients);
        self.send_line(id, protocol::REQ_USERNAME);
        log::info!(
            "Sent REQ_USERNAME to {}. Slot {} assigned ({}/{} in use).",
            peer,
            id,
            self.table.occupied(),
            self.table.capacity()
        );
    }

    // ------------------------------------------------------------------------
    // Receive Path
    // ------------------------------------------------------------------------

    /// Drain the socket, handling each complete line as it arrives.
    fn receive(&mut self, id: SlotId) {
        loop {
            let Some(slot) = self.table.get_mut(id) else {
                return;
            };
            if slot.closing {
                return;
            }

            let read = slot.conn.read(&mut self.recv_buf);
            match read {
                Ok(0) => {
                    log::debug!("Peer {} closed (slot {})", slot.peer_addr, id);
                    self.mark_closing(id);
                    return;
                }
                Ok(n) => slot.inbound.extend(&self.recv_buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("Receive error on slot {}: {}", id, e);
                    self.mark_closing(id);
                    return;
                }
            }

            self.drain_lines(id);
        }
    }

    fn drain_lines(&mut self, id: SlotId) {
        loop {
            let next = match self.table.get_mut(id) {
                Some(slot) if !slot.closing => slot.inbound.next_line(),
                _ => return,
            };
            match next {
                Ok(Some(line)) => self.handle_line(id, &line),
                Ok(None) => return,
                Err(e) => {
                    log::warn!("Dropping slot {}: {}", id, e);
                    self.mark_closing(id);
                    return;
                }
            }
        }
    }

    fn handle_line(&mut self, id: SlotId, line: &str) {
        log::trace!("Slot {} <- {:?}", id, line);
        match self.table.get(id).map(|s| s.state) {
            Some(SlotState::Pending) => self.handshake(id, line),
            Some(SlotState::Active) => self.route(id, line),
            None => {}
        }
    }

    // ------------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------------

    fn handshake(&mut self, id: SlotId, line: &str) {
        let policy = HandshakePolicy {
            username_max_len: self.config.username_max_len,
            reject_duplicates: self.config.reject_duplicate_usernames,
        };

        match handshake::evaluate(line, &self.allow_list, &self.table, policy) {
            Ok(username) => self.login(id, &username),
            Err(rejection) => {
                let peer = self.table.get(id).map(|s| s.peer_addr);
                log::info!(
                    "Rejecting {:?} from {:?} (slot {}): {}",
                    line.trim(),
                    peer,
                    id,
                    rejection
                );
                Metrics::incr(&self.metrics.handshake_rejections_total);
                self.send_line(id, rejection.reply());
                self.mark_closing(id);
            }
        }
    }

    fn login(&mut self, id: SlotId, username: &str) {
        if !self.table.activate(id, username) {
            return;
        }
        log::info!("Username '{}' (allowed) logged in on slot {}", username, id);
        Metrics::incr(&self.metrics.logins_total);

        self.send_line(id, &protocol::welcome(username));

        // Snapshot before the join record below is appended
        match self.history.recent(self.config.history_lines) {
            Ok(lines) if !lines.is_empty() => {
                self.send_line(id, HISTORY_BEGIN);
                for line in &lines {
                    self.send_line(id, line);
                }
                self.send_line(id, HISTORY_END);
            }
            Ok(_) => {}
            Err(e) => log::warn!("Could not read chat history for {}: {}", username, e),
        }

        let notice = protocol::joined(username);
        self.record(&notice);
        for other in self.table.active_ids() {
            if other != id {
                self.send_line(other, &notice);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    fn route(&mut self, id: SlotId, line: &str) {
        let dispatch = router::route(
            id,
            line,
            &self.table,
            &self.groups,
            self.config.username_max_len,
        );

        match dispatch.outcome {
            Outcome::Ignored => return,
            Outcome::Broadcast => Metrics::incr(&self.metrics.broadcasts_total),
            Outcome::Direct => Metrics::incr(&self.metrics.direct_messages_total),
            Outcome::Group { members_reached } => {
                Metrics::incr(&self.metrics.group_messages_total);
                log::debug!("Group message from slot {} reached {} members", id, members_reached);
            }
            Outcome::DirectUndeliverable | Outcome::UnknownGroup | Outcome::Malformed => {
                Metrics::incr(&self.metrics.command_errors_total);
            }
        }
        log::debug!("Slot {} -> {:?}: {}", id, dispatch.outcome, line);

        if let Some(record) = &dispatch.record {
            self.record(record);
        }
        for delivery in dispatch.deliveries {
            self.send_line(delivery.to, &delivery.line);
        }
    }

    fn record(&mut self, message: &str) {
        if let Err(e) = self.history.append(message) {
            log::error!("Error writing to chat log: {}", e);
        }
    }

    // ------------------------------------------------------------------------
    // Send Path
    // ------------------------------------------------------------------------

    /// Queue one line for a slot and try to send it right away.
    fn send_line(&mut self, id: SlotId, line: &str) {
        let Some(slot) = self.table.get_mut(id) else {
            return;
        };
        if slot.closing {
            return;
        }

        slot.outbound.extend_from_slice(line.as_bytes());
        slot.outbound.push(b'\n');
        if slot.outbound.len() > self.config.max_outbound_bytes {
            log::warn!(
                "Slot {} ({}) has {} unsent bytes, disconnecting",
                id,
                slot.display_name(),
                slot.outbound.len()
            );
            self.mark_closing(id);
            return;
        }
        self.flush(id);
    }

    /// Write queued output until the socket would block.
    fn flush(&mut self, id: SlotId) {
        let Some(slot) = self.table.get_mut(id) else {
            return;
        };
        if slot.closing {
            return;
        }

        while !slot.outbound.is_empty() {
            match slot.conn.write(&slot.outbound) {
                Ok(0) => {
                    self.mark_closing(id);
                    return;
                }
                Ok(n) => {
                    slot.outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("Send error on slot {}: {}", id, e);
                    self.mark_closing(id);
                    return;
                }
            }
        }

        let want_write = !slot.outbound.is_empty();
        if want_write != slot.write_interest {
            match self.mux.rewatch(&mut slot.conn, id, want_write) {
                Ok(()) => slot.write_interest = want_write,
                Err(e) => {
                    log::debug!("Cannot update interest for slot {}: {}", id, e);
                    self.mark_closing(id);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Disconnects
    // ------------------------------------------------------------------------

    fn mark_closing(&mut self, id: SlotId) {
        if let Some(slot) = self.table.get_mut(id) {
            if !slot.closing {
                slot.closing = true;
                self.closing.push_back(id);
            }
        }
    }

    /// Free every slot marked for closing; leave notices may mark more.
    fn process_closing(&mut self) {
        while let Some(id) = self.closing.pop_front() {
            let Some(mut slot) = self.table.free(id) else {
                continue;
            };
            if let Err(e) = self.mux.unwatch(&mut slot.conn) {
                log::debug!("Failed to unwatch slot {}: {}", id, e);
            }
            // Last attempt at queued output such as a rejection reply
            if !slot.outbound.is_empty() {
                let _ = slot.conn.write(&slot.outbound);
            }
            Metrics::incr(&self.metrics.disconnects_total);
            Metrics::decr(&self.metrics.connected_clients);

            if slot.is_active() {
                log::info!(
                    "{} ({}, slot {}) disconnected",
                    slot.username,
                    slot.peer_addr,
                    id
                );
                let notice = protocol::left(&slot.username);
                self.record(&notice);
                for other in self.table.active_ids() {
                    self.send_line(other, &notice);
                }
            } else {
                log::info!(
                    "Connection from {} (slot {}) closed before completing login",
                    slot.peer_addr,
                    id
                );
            }
        }
    }

    fn close_all(&mut self) {
        for id in self.table.occupied_ids() {
            if let Some(mut slot) = self.table.free(id) {
                let _ = self.mux.unwatch(&mut slot.conn);
                if !slot.outbound.is_empty() {
                    let _ = slot.conn.write(&slot.outbound);
                }
                Metrics::decr(&self.metrics.connected_clients);
                log::debug!("Closed slot {} ({}) at shutdown", id, slot.display_name());
            }
        }
        self.closing.clear();
    }
}
