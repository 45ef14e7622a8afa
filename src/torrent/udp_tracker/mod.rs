//! UDP tracker client (BEP 15)
//!
//! A sans-IO client: it never touches a socket. The DHT interaction task
//! owns the shared UDP socket, asks [`UdpTrackerClient::create_request`] for
//! the next datagram to send, reports the outcome, and hands back every
//! non-DHT datagram it receives.
//!
//! Announces to a tracker without a cached connection id wait behind a
//! connect exchange. Each announce is a shared handle; whoever added it
//! watches its `outcome` and calls [`UdpTrackerClient::decrease_watchers`]
//! once done with it.

pub mod packet;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

pub use packet::{AnnounceParams, AnnounceReply, UdpAnnounceEvent, UdpTrackerReply};

use crate::config::TorrentConfig;
use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Why an announce did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UdpTrackerError {
    #[error("network error")]
    Network,
    #[error("timed out")]
    Timeout,
    #[error("tracker error: {0}")]
    TrackerError(String),
    #[error("shut down")]
    Shutdown,
}

/// One announce and, once complete, its outcome
#[derive(Debug, Clone)]
pub struct UdpTrackerRequest {
    pub remote: SocketAddr,
    pub params: AnnounceParams,
    pub outcome: Option<std::result::Result<AnnounceReply, UdpTrackerError>>,
    connection_id: u64,
    transaction_id: u32,
    dispatched: Option<Instant>,
    fail_count: u32,
}

impl UdpTrackerRequest {
    pub fn new(remote: SocketAddr, params: AnnounceParams) -> Self {
        Self {
            remote,
            params,
            outcome: None,
            connection_id: 0,
            transaction_id: 0,
            dispatched: None,
            fail_count: 0,
        }
    }

    pub fn into_handle(self) -> UdpTrackerRequestHandle {
        Rc::new(RefCell::new(self))
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn fail_count(&self) -> u32 {
        self.fail_count
    }
}

pub type UdpTrackerRequestHandle = Rc<RefCell<UdpTrackerRequest>>;

#[derive(Debug, Clone)]
struct ConnectRequest {
    remote: SocketAddr,
    transaction_id: u32,
    dispatched: Option<Instant>,
    fail_count: u32,
}

#[derive(Debug, Clone)]
enum Outgoing {
    Connect(ConnectRequest),
    Announce(UdpTrackerRequestHandle),
}

impl Outgoing {
    fn remote(&self) -> SocketAddr {
        match self {
            Outgoing::Connect(c) => c.remote,
            Outgoing::Announce(r) => r.borrow().remote,
        }
    }

    fn transaction_id(&self) -> u32 {
        match self {
            Outgoing::Connect(c) => c.transaction_id,
            Outgoing::Announce(r) => r.borrow().transaction_id,
        }
    }

    fn dispatched(&self) -> Option<Instant> {
        match self {
            Outgoing::Connect(c) => c.dispatched,
            Outgoing::Announce(r) => r.borrow().dispatched,
        }
    }

    fn set_dispatched(&mut self, now: Instant) {
        match self {
            Outgoing::Connect(c) => c.dispatched = Some(now),
            Outgoing::Announce(r) => r.borrow_mut().dispatched = Some(now),
        }
    }

    /// Bump the failure count, returning the new value
    fn count_failure(&mut self) -> u32 {
        match self {
            Outgoing::Connect(c) => {
                c.fail_count += 1;
                c.fail_count
            }
            Outgoing::Announce(r) => {
                let mut r = r.borrow_mut();
                r.fail_count += 1;
                r.fail_count
            }
        }
    }
}

/// Connection ids, pending and in-flight requests for every UDP tracker
#[derive(Debug)]
pub struct UdpTrackerClient {
    pending: VecDeque<Outgoing>,
    /// Announces waiting for a connect exchange with their tracker
    connect_waiting: VecDeque<UdpTrackerRequestHandle>,
    inflight: Vec<Outgoing>,
    connection_ids: HashMap<SocketAddr, (u64, Instant)>,
    num_watchers: usize,
    timeout: Duration,
    max_retries: u32,
    connection_id_ttl: Duration,
}

impl UdpTrackerClient {
    pub fn new(timeout: Duration, max_retries: u32, connection_id_ttl: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            connect_waiting: VecDeque::new(),
            inflight: Vec::new(),
            connection_ids: HashMap::new(),
            num_watchers: 0,
            timeout,
            max_retries,
            connection_id_ttl,
        }
    }

    pub fn from_config(config: &TorrentConfig) -> Self {
        Self::new(
            Duration::from_secs(config.udp_tracker_timeout_secs),
            config.udp_tracker_max_retries,
            Duration::from_secs(config.udp_tracker_connection_id_ttl_secs),
        )
    }

    /// Queue an announce; the caller becomes a watcher
    pub fn add_request(&mut self, request: UdpTrackerRequestHandle) {
        {
            let mut r = request.borrow_mut();
            r.outcome = None;
            r.fail_count = 0;
            r.dispatched = None;
        }
        self.pending.push_back(Outgoing::Announce(request));
        self.num_watchers += 1;
    }

    pub fn decrease_watchers(&mut self) {
        self.num_watchers = self.num_watchers.saturating_sub(1);
    }

    pub fn num_watchers(&self) -> usize {
        self.num_watchers
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn num_inflight(&self) -> usize {
        self.inflight.len()
    }

    pub fn connection_id(&self, remote: SocketAddr, now: Instant) -> Option<u64> {
        self.connection_ids
            .get(&remote)
            .filter(|(_, at)| now.saturating_duration_since(*at) < self.connection_id_ttl)
            .map(|(id, _)| *id)
    }

    fn connect_in_progress(&self, remote: SocketAddr) -> bool {
        self.pending
            .iter()
            .chain(self.inflight.iter())
            .any(|o| matches!(o, Outgoing::Connect(c) if c.remote == remote))
    }

    /// Build the next datagram into `buf`. The request stays at the head
    /// of the queue until [`request_sent`](Self::request_sent) or
    /// [`request_fail`](Self::request_fail) is called. None if nothing is
    /// sendable or `buf` is too small.
    pub fn create_request(&mut self, buf: &mut [u8], now: Instant) -> Option<(usize, SocketAddr)> {
        loop {
            let (remote, is_connect) = {
                let front = self.pending.front()?;
                (front.remote(), matches!(front, Outgoing::Connect(_)))
            };
            let transaction_id = rand::random();
            if is_connect {
                let len = packet::encode_connect(transaction_id, buf)?;
                if let Some(Outgoing::Connect(c)) = self.pending.front_mut() {
                    c.transaction_id = transaction_id;
                }
                return Some((len, remote));
            }
            if let Some(connection_id) = self.connection_id(remote, now) {
                let Some(Outgoing::Announce(request)) = self.pending.front() else {
                    return None;
                };
                let mut r = request.borrow_mut();
                let len = packet::encode_announce(connection_id, transaction_id, &r.params, buf)?;
                r.connection_id = connection_id;
                r.transaction_id = transaction_id;
                return Some((len, remote));
            }

            // No usable connection id: park the announce behind a connect
            let connecting = self.connect_in_progress(remote);
            if let Some(Outgoing::Announce(request)) = self.pending.pop_front() {
                self.connect_waiting.push_back(request);
            }
            if !connecting {
                self.pending.push_front(Outgoing::Connect(ConnectRequest {
                    remote,
                    transaction_id: 0,
                    dispatched: None,
                    fail_count: 0,
                }));
            }
        }
    }

    /// The datagram from `create_request` went out
    pub fn request_sent(&mut self, now: Instant) {
        if let Some(mut out) = self.pending.pop_front() {
            out.set_dispatched(now);
            self.inflight.push(out);
        }
    }

    /// The datagram from `create_request` could not be sent
    pub fn request_fail(&mut self, error: UdpTrackerError) {
        match self.pending.pop_front() {
            Some(Outgoing::Connect(c)) => self.fail_waiting(c.remote, error),
            Some(Outgoing::Announce(r)) => complete(&r, Err(error)),
            None => {}
        }
    }

    /// Handle a datagram that did not look like DHT traffic
    pub fn receive_reply(&mut self, data: &[u8], from: SocketAddr, now: Instant) -> Result<()> {
        let reply = packet::parse_reply(data)?;
        let tid = reply.transaction_id();
        let Some(pos) = self
            .inflight
            .iter()
            .position(|o| o.transaction_id() == tid && o.remote() == from)
        else {
            return Err(EngineError::protocol(
                ProtocolErrorKind::UdpTracker,
                format!("No UDP tracker request matches transaction id {} from {}", tid, from),
            ));
        };

        match (self.inflight.swap_remove(pos), reply) {
            (Outgoing::Connect(c), UdpTrackerReply::Connect { connection_id, .. }) => {
                debug!("UDP tracker {} connected", c.remote);
                self.connection_ids.insert(c.remote, (connection_id, now));
                self.resume_waiting(c.remote);
            }
            (Outgoing::Announce(r), UdpTrackerReply::Announce { reply, .. }) => {
                info!(
                    "UDP tracker {} announce: {} peers, interval {}s",
                    from,
                    reply.peers.len(),
                    reply.interval
                );
                complete(&r, Ok(reply));
            }
            (Outgoing::Connect(c), UdpTrackerReply::Error { message, .. }) => {
                self.fail_waiting(c.remote, UdpTrackerError::TrackerError(message));
            }
            (Outgoing::Announce(r), UdpTrackerReply::Error { message, .. }) => {
                complete(&r, Err(UdpTrackerError::TrackerError(message)));
            }
            (out, _) => {
                let error = "reply action does not match the request".to_string();
                match out {
                    Outgoing::Connect(c) => {
                        self.fail_waiting(c.remote, UdpTrackerError::TrackerError(error.clone()))
                    }
                    Outgoing::Announce(r) => {
                        complete(&r, Err(UdpTrackerError::TrackerError(error.clone())))
                    }
                }
                return Err(EngineError::protocol(ProtocolErrorKind::UdpTracker, error));
            }
        }
        Ok(())
    }

    /// Retry or fail requests whose reply is overdue
    pub fn handle_timeout(&mut self, now: Instant) {
        let timeout = self.timeout;
        let (expired, live): (Vec<_>, Vec<_>) =
            self.inflight.drain(..).partition(|o| {
                o.dispatched()
                    .is_some_and(|at| now.saturating_duration_since(at) >= timeout)
            });
        self.inflight = live;

        for mut out in expired {
            let failures = out.count_failure();
            if failures <= self.max_retries {
                debug!(
                    "UDP tracker {} timed out, retry {}/{}",
                    out.remote(),
                    failures,
                    self.max_retries
                );
                self.pending.push_back(out);
                continue;
            }
            match out {
                Outgoing::Connect(c) => self.fail_waiting(c.remote, UdpTrackerError::Timeout),
                Outgoing::Announce(r) => complete(&r, Err(UdpTrackerError::Timeout)),
            }
        }
    }

    /// Complete every outstanding announce with `Shutdown`
    pub fn fail_all(&mut self) {
        let outstanding = self
            .pending
            .drain(..)
            .chain(self.inflight.drain(..))
            .filter_map(|o| match o {
                Outgoing::Announce(r) => Some(r),
                Outgoing::Connect(_) => None,
            })
            .chain(self.connect_waiting.drain(..))
            .collect::<Vec<_>>();
        if !outstanding.is_empty() {
            info!("Failing {} UDP tracker request(s)", outstanding.len());
        }
        for r in outstanding {
            complete(&r, Err(UdpTrackerError::Shutdown));
        }
    }

    fn resume_waiting(&mut self, remote: SocketAddr) {
        let (ready, waiting): (VecDeque<_>, VecDeque<_>) = self
            .connect_waiting
            .drain(..)
            .partition(|r| r.borrow().remote == remote);
        self.connect_waiting = waiting;
        for r in ready.into_iter().rev() {
            self.pending.push_front(Outgoing::Announce(r));
        }
    }

    fn fail_waiting(&mut self, remote: SocketAddr, error: UdpTrackerError) {
        debug!("UDP tracker {} connect failed: {}", remote, error);
        let (failed, waiting): (VecDeque<_>, VecDeque<_>) = self
            .connect_waiting
            .drain(..)
            .partition(|r| r.borrow().remote == remote);
        self.connect_waiting = waiting;
        for r in failed {
            complete(&r, Err(error.clone()));
        }
    }
}

fn complete(
    request: &UdpTrackerRequestHandle,
    outcome: std::result::Result<AnnounceReply, UdpTrackerError>,
) {
    let mut r = request.borrow_mut();
    r.dispatched = None;
    r.outcome = Some(outcome);
}
