//! Download Engine
//!
//! The single-threaded cooperative event loop. Each turn:
//!
//! 1. polls registered sockets, waiting no longer than the soonest task
//!    deadline (capped by the refresh interval);
//! 2. samples the wall clock;
//! 3. runs every live task once, in FIFO order.
//!
//! Tasks spawned during a turn join the queue after the turn, so no task
//! observes another task's half-finished turn. A task error is logged and
//! the task is dropped; it never escapes the turn.

pub mod reactor;
pub mod task;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

pub use reactor::{Readiness, Reactor};
pub use task::{Execute, Task, TaskStatus};

use crate::auth::AuthConfigFactory;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::group::activation::GroupActivationTask;
use crate::group::context::DownloadContext;
use crate::group::man::{DownloadResults, RequestGroupMan};
use crate::group::RequestGroup;
use crate::stream::StreamSourceFactory;
use crate::torrent::dht;
use crate::torrent::udp_tracker::UdpTrackerClient;
use crate::torrent::BtRegistry;
use crate::types::{Cuid, GroupId, HaltReason};

/// Wall clock sampled once per turn
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    now: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn advance(&mut self) {
        self.now = Instant::now();
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic cuid allocator
#[derive(Debug, Default)]
pub struct CuidCounter {
    last: Cuid,
}

impl CuidCounter {
    pub fn next(&mut self) -> Cuid {
        self.last += 1;
        self.last
    }
}

/// Engine-wide halt state
#[derive(Debug, Clone, Copy, Default)]
struct HaltState {
    halt_requested: bool,
    force_halt_requested: bool,
    reason: HaltReason,
}

/// Everything a task may touch during its turn
pub struct EngineContext {
    pub(crate) config: EngineConfig,
    pub(crate) clock: WallClock,
    pub(crate) reactor: Reactor,
    pub(crate) groups: RequestGroupMan,
    pub(crate) bt_registry: BtRegistry,
    pub(crate) auth: AuthConfigFactory,
    pub(crate) stream_factory: Option<Rc<dyn StreamSourceFactory>>,
    /// Set once the DHT socket is up; announces share it
    pub(crate) udp_tracker: Option<Rc<RefCell<UdpTrackerClient>>>,
    pub(crate) cuids: CuidCounter,
    pub(crate) activation_running: bool,
    halt: HaltState,
    spawned: Vec<Task>,
}

impl EngineContext {
    fn new(config: EngineConfig) -> Result<Self> {
        let groups = RequestGroupMan::new(config.max_concurrent_downloads);
        Ok(Self {
            config,
            clock: WallClock::new(),
            reactor: Reactor::new()?,
            groups,
            bt_registry: BtRegistry::new(),
            auth: AuthConfigFactory::new(),
            stream_factory: None,
            udp_tracker: None,
            cuids: CuidCounter::default(),
            activation_running: false,
            halt: HaltState::default(),
            spawned: Vec::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Wall-clock time of the current turn
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn reactor_mut(&mut self) -> &mut Reactor {
        &mut self.reactor
    }

    pub fn groups(&self) -> &RequestGroupMan {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut RequestGroupMan {
        &mut self.groups
    }

    pub fn bt_registry(&self) -> &BtRegistry {
        &self.bt_registry
    }

    pub fn bt_registry_mut(&mut self) -> &mut BtRegistry {
        &mut self.bt_registry
    }

    pub fn auth_mut(&mut self) -> &mut AuthConfigFactory {
        &mut self.auth
    }

    /// UDP tracker client, available once DHT is enabled
    pub fn udp_tracker(&self) -> Option<&Rc<RefCell<UdpTrackerClient>>> {
        self.udp_tracker.as_ref()
    }

    pub fn new_cuid(&mut self) -> Cuid {
        self.cuids.next()
    }

    /// Queue a task to start at the next turn
    pub fn spawn(&mut self, task: impl Into<Task>) {
        self.spawned.push(task.into());
    }

    pub fn is_halt_requested(&self) -> bool {
        self.halt.halt_requested
    }

    pub fn is_force_halt_requested(&self) -> bool {
        self.halt.force_halt_requested
    }

    pub fn halt_reason(&self) -> HaltReason {
        self.halt.reason
    }

    fn take_spawned(&mut self) -> Vec<Task> {
        std::mem::take(&mut self.spawned)
    }
}

/// The download engine
pub struct DownloadEngine {
    cx: EngineContext,
    tasks: VecDeque<Task>,
}

impl DownloadEngine {
    /// Create an engine; the configuration is validated first
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "Engine starting: max {} downloads, split {}",
            config.max_concurrent_downloads, config.split
        );
        Ok(Self {
            cx: EngineContext::new(config)?,
            tasks: VecDeque::new(),
        })
    }

    /// Install the backend used by stream (HTTP/FTP) downloads
    pub fn with_stream_factory(mut self, factory: impl StreamSourceFactory + 'static) -> Self {
        self.cx.stream_factory = Some(Rc::new(factory));
        self
    }

    /// Replace the credential factory (e.g. one loaded with a netrc)
    pub fn with_auth(mut self, auth: AuthConfigFactory) -> Self {
        self.cx.auth = auth;
        self
    }

    pub fn context(&self) -> &EngineContext {
        &self.cx
    }

    pub fn context_mut(&mut self) -> &mut EngineContext {
        &mut self.cx
    }

    /// Register a download; it starts once a slot is free and its
    /// dependency is resolved
    pub fn add_group(&mut self, group: RequestGroup) -> Result<GroupId> {
        let gid = self.cx.groups.add_reserved_group(group)?;
        self.ensure_activation();
        Ok(gid)
    }

    /// Register a stream download for `uris` (mirrors of one file)
    pub fn add_uri(&mut self, uris: Vec<String>) -> Result<GroupId> {
        let name = uris
            .first()
            .and_then(|u| url::Url::parse(u).ok())
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut s| s.next_back().map(str::to_string))
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "index.html".to_string());
        let ctx = DownloadContext::unknown_length(
            self.cx.config.download_dir.join(name),
            self.cx.config.min_split_size,
        );
        let group = RequestGroup::new(ctx.into_handle())
            .with_uris(uris)
            .with_config(&self.cx.config);
        self.add_group(group)
    }

    /// Queue a task built outside the engine
    pub fn add_task(&mut self, task: impl Into<Task>) {
        self.tasks.push_back(task.into());
    }

    /// Bind the DHT socket and start the DHT/UDP tracker task
    pub fn enable_dht(&mut self) -> Result<()> {
        let task = dht::setup(&mut self.cx)?;
        self.tasks.push_back(task.into());
        Ok(())
    }

    /// Cooperative halt of the engine and every download
    pub fn request_halt(&mut self, reason: HaltReason) {
        info!("Halt requested ({:?})", reason);
        self.cx.halt.halt_requested = true;
        self.cx.halt.reason = reason;
        self.cx.groups.halt(false, reason);
    }

    /// Immediate halt: outstanding protocol requests are failed
    pub fn request_force_halt(&mut self, reason: HaltReason) {
        info!("Force halt requested ({:?})", reason);
        self.cx.halt.halt_requested = true;
        self.cx.halt.force_halt_requested = true;
        self.cx.halt.reason = reason;
        self.cx.groups.halt(true, reason);
    }

    /// Remove one download at the user's request
    pub fn remove_group(&mut self, gid: GroupId, force: bool) -> Result<()> {
        self.cx.groups.remove_group(gid, force)
    }

    pub fn results(&self) -> &DownloadResults {
        self.cx.groups.results()
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    fn ensure_activation(&mut self) {
        if !self.cx.activation_running {
            let cuid = self.cx.new_cuid();
            self.cx.activation_running = true;
            self.tasks.push_back(GroupActivationTask::new(cuid).into());
        }
    }

    fn poll_timeout(&self) -> Duration {
        let cap = self.cx.config.refresh_interval();
        let now = Instant::now();
        self.tasks
            .iter()
            .filter_map(|t| t.deadline(&self.cx))
            .min()
            .map(|deadline| deadline.saturating_duration_since(now).min(cap))
            .unwrap_or(cap)
    }

    /// Run one turn
    pub fn turn(&mut self) {
        let timeout = self.poll_timeout();
        if let Err(e) = self.cx.reactor.poll(Some(timeout)) {
            warn!("Readiness poll failed: {}", e);
        }
        self.cx.clock.advance();

        let mut queue = std::mem::take(&mut self.tasks);
        while let Some(mut task) = queue.pop_front() {
            match task.execute(&mut self.cx) {
                Ok(TaskStatus::Continue) => self.tasks.push_back(task),
                Ok(TaskStatus::Finished) => {
                    debug!("{:?} finished", task);
                    task.release(&mut self.cx);
                }
                Err(e) => {
                    warn!("{:?} failed: {}", task, e);
                    task.fail(&mut self.cx, &e);
                    task.release(&mut self.cx);
                }
            }
        }

        self.tasks.extend(self.cx.take_spawned());
    }

    /// Run until no task is left
    pub fn run(&mut self) {
        while !self.tasks.is_empty() {
            self.turn();
        }
        info!("Engine stopped: {} results", self.results().len());
    }

    /// Run at most `max_turns` turns; true if the engine drained
    pub fn run_for(&mut self, max_turns: usize) -> bool {
        for _ in 0..max_turns {
            if self.tasks.is_empty() {
                return true;
            }
            self.turn();
        }
        self.tasks.is_empty()
    }
}
