//! Readiness reactor
//!
//! One mio `Poll` shared by every task. A registration ties a socket to the
//! task (by cuid) that wants to hear about it; after each poll the reactor
//! holds the readiness seen per task until the next poll.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

use crate::types::Cuid;

const EVENT_CAPACITY: usize = 1024;

/// Readiness observed for one task during the last poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        !(self.readable || self.writable || self.error)
    }
}

#[derive(Debug)]
struct TokenGenerator {
    next_token: usize,
}

impl TokenGenerator {
    fn new() -> Self {
        Self { next_token: 1 }
    }

    fn next(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }
}

/// Socket registration table plus the poll instance
pub struct Reactor {
    poll: Poll,
    events: Events,
    tokens: TokenGenerator,
    /// token -> owning task
    owners: HashMap<Token, Cuid>,
    ready: HashMap<Cuid, Readiness>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("registrations", &self.owners.len())
            .field("ready", &self.ready.len())
            .finish()
    }
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            tokens: TokenGenerator::new(),
            owners: HashMap::new(),
            ready: HashMap::new(),
        })
    }

    /// Register `source` for `interest`, waking task `cuid`
    pub fn register<S>(&mut self, source: &mut S, cuid: Cuid, interest: Interest) -> io::Result<Token>
    where
        S: Source + ?Sized,
    {
        let token = self.tokens.next();
        self.poll.registry().register(source, token, interest)?;
        self.owners.insert(token, cuid);
        Ok(token)
    }

    /// Change the interest of an existing registration
    pub fn reregister<S>(&mut self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Remove a registration
    pub fn deregister<S>(&mut self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.owners.remove(&token);
        self.poll.registry().deregister(source)
    }

    /// Drop every table entry owned by `cuid`.
    ///
    /// Called when a task is destroyed so that a late event cannot be
    /// attributed to a dead task.
    pub fn forget_task(&mut self, cuid: Cuid) {
        self.owners.retain(|_, owner| *owner != cuid);
        self.ready.remove(&cuid);
    }

    /// Wait for readiness, at most `timeout`
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.ready.clear();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        let mut count = 0;
        for event in self.events.iter() {
            let Some(&cuid) = self.owners.get(&event.token()) else {
                continue;
            };
            let entry = self.ready.entry(cuid).or_default();
            entry.readable |= event.is_readable() || event.is_read_closed();
            entry.writable |= event.is_writable() || event.is_write_closed();
            entry.error |= event.is_error();
            count += 1;
        }
        Ok(count)
    }

    /// Readiness seen for `cuid` in the last poll
    pub fn readiness(&self, cuid: Cuid) -> Readiness {
        self.ready.get(&cuid).copied().unwrap_or_default()
    }

    pub fn is_registered(&self, cuid: Cuid) -> bool {
        self.owners.values().any(|&owner| owner == cuid)
    }

    pub fn registration_count(&self) -> usize {
        self.owners.len()
    }
}
