//! Readiness multiplexing
//!
//! The server loop only needs "tell me which of my sockets are ready". The
//! `Multiplexer` trait is that seam; `MioMultiplexer` implements it on top of
//! mio (epoll, kqueue or IOCP depending on the platform). Anything that is a
//! `mio::event::Source` can be watched, so the listener and slot connections
//! are not tied to TCP.

use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

use crate::slots::SlotId;

/// mio token for the listening socket; slot `n` uses `Token(n + 1)`
const LISTENER_TOKEN: Token = Token(0);

/// Upper bound on events handled per wait
const EVENTS_CAPACITY: usize = 1024;

/// One member of the ready set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The listener has connections to accept
    Listener,
    /// A connection slot can be read and/or written
    Slot {
        id: SlotId,
        readable: bool,
        writable: bool,
    },
}

/// Wait-for-ready-set interface used by the server loop
pub trait Multiplexer {
    /// Start watching the listener for incoming connections
    fn watch_listener<L: Source + ?Sized>(&mut self, listener: &mut L) -> io::Result<()>;

    /// Start watching a newly occupied slot
    fn watch<C: Source + ?Sized>(&mut self, conn: &mut C, id: SlotId, writable: bool) -> io::Result<()>;

    /// Change the interest of a watched slot
    fn rewatch<C: Source + ?Sized>(&mut self, conn: &mut C, id: SlotId, writable: bool)
        -> io::Result<()>;

    /// Stop watching a slot before it is freed
    fn unwatch<C: Source + ?Sized>(&mut self, conn: &mut C) -> io::Result<()>;

    /// Block until something is ready or `timeout` passes, then fill `ready`.
    ///
    /// An interrupted wait surfaces as `ErrorKind::Interrupted`.
    fn wait(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()>;
}

fn interest(writable: bool) -> Interest {
    if writable {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

// ============================================================================
// mio Implementation
// ============================================================================

pub struct MioMultiplexer {
    poll: Poll,
    events: Events,
}

impl MioMultiplexer {
    pub fn new() -> io::Result<Self> {
        Ok(MioMultiplexer {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
        })
    }
}

impl Multiplexer for MioMultiplexer {
    fn watch_listener<L: Source + ?Sized>(&mut self, listener: &mut L) -> io::Result<()> {
        self.poll
            .registry()
            .register(listener, LISTENER_TOKEN, Interest::READABLE)
    }

    fn watch<C: Source + ?Sized>(&mut self, conn: &mut C, id: SlotId, writable: bool) -> io::Result<()> {
        self.poll
            .registry()
            .register(conn, Token(id + 1), interest(writable))
    }

    fn rewatch<C: Source + ?Sized>(
        &mut self,
        conn: &mut C,
        id: SlotId,
        writable: bool,
    ) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(conn, Token(id + 1), interest(writable))
    }

    fn unwatch<C: Source + ?Sized>(&mut self, conn: &mut C) -> io::Result<()> {
        self.poll.registry().deregister(conn)
    }

    fn wait(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        ready.clear();
        self.poll.poll(&mut self.events, timeout)?;

        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => ready.push(Readiness::Listener),
                Token(n) => ready.push(Readiness::Slot {
                    id: n - 1,
                    // Closed and errored sockets are reported as readable so
                    // the following read observes the EOF or error
                    readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                    writable: event.is_writable(),
                }),
            }
        }
        Ok(())
    }
}
