//! Request Groups
//!
//! A [`RequestGroup`] is one logical download: its file layout, its piece
//! storage and segment allocator, the URIs it may use and the bookkeeping
//! that decides when it is done. Groups live in the
//! [`RequestGroupMan`](man::RequestGroupMan) arena and refer to each other
//! by [`GroupId`] only.

pub mod activation;
pub mod context;
pub mod dependency;
pub mod handler;
pub mod man;
pub mod piece_storage;
pub mod segment;
pub mod stat;
pub mod uri;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::{CuidCounter, Task};
use crate::error::{EngineError, ErrorCode, Result};
use crate::stream::StreamInitiateTask;
use crate::torrent::peer::PeerStorage;
use crate::torrent::registry::{BtObject, BtRegistry};
use crate::types::{GroupId, GroupState, HaltReason};

use context::DownloadContextHandle;
use dependency::{Dependency, DependencyState};
use handler::{PostDownloadHandler, PreDownloadHandler};
use man::{DownloadResult, DownloadResults};
use piece_storage::{
    DiskWriterFactory, MemoryDiskWriterFactory, PieceStorage, PieceStorageHandle,
};
use segment::SegmentMan;
use stat::{SpeedCalc, TransferStat};
use uri::UriSelector;

/// Piece storage and its segment allocator; they exist together or not at all
#[derive(Debug)]
struct StorageSlot {
    piece_storage: PieceStorageHandle,
    segment_man: SegmentMan,
}

/// One logical download
pub struct RequestGroup {
    gid: GroupId,
    state: GroupState,
    download_context: DownloadContextHandle,
    storage: Option<StorageSlot>,
    disk_writer_factory: Rc<dyn DiskWriterFactory>,
    uri_selector: UriSelector,
    dependency: Option<Box<dyn Dependency>>,
    pre_download_handlers: Vec<Rc<dyn PreDownloadHandler>>,
    post_download_handlers: Vec<Rc<dyn PostDownloadHandler>>,

    halt_requested: bool,
    force_halt_requested: bool,
    halt_reason: HaltReason,
    pause_requested: bool,

    num_command: usize,
    num_stream_command: usize,
    num_stream_connection: usize,
    num_concurrent_command: usize,

    max_download_speed_limit: u64,
    max_upload_speed_limit: u64,
    timeout: Duration,

    last_error_code: Option<ErrorCode>,
    resume_failure_count: u32,
    file_not_found_count: u32,
    max_file_not_found: u32,

    expected_filename: Option<String>,
    expected_total_length: Option<u64>,
    in_memory_download: bool,

    download_speed: SpeedCalc,
    upload_speed: SpeedCalc,

    followed_by: Vec<GroupId>,
    belongs_to: Option<GroupId>,
}

impl std::fmt::Debug for RequestGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGroup")
            .field("gid", &self.gid)
            .field("state", &self.state)
            .field("storage", &self.storage.is_some())
            .field("num_command", &self.num_command)
            .field("halt_requested", &self.halt_requested)
            .field("last_error_code", &self.last_error_code)
            .finish()
    }
}

impl RequestGroup {
    /// Create a waiting group for `ctx` with default limits
    pub fn new(ctx: DownloadContextHandle) -> Self {
        let defaults = EngineConfig::default();
        Self {
            gid: GroupId::random(),
            state: GroupState::Waiting,
            download_context: ctx,
            storage: None,
            disk_writer_factory: Rc::new(MemoryDiskWriterFactory),
            uri_selector: UriSelector::new(Vec::new()),
            dependency: None,
            pre_download_handlers: Vec::new(),
            post_download_handlers: Vec::new(),
            halt_requested: false,
            force_halt_requested: false,
            halt_reason: HaltReason::None,
            pause_requested: false,
            num_command: 0,
            num_stream_command: 0,
            num_stream_connection: 0,
            num_concurrent_command: defaults.split,
            max_download_speed_limit: 0,
            max_upload_speed_limit: 0,
            timeout: defaults.timeout(),
            last_error_code: None,
            resume_failure_count: 0,
            file_not_found_count: 0,
            max_file_not_found: 0,
            expected_filename: None,
            expected_total_length: None,
            in_memory_download: false,
            download_speed: SpeedCalc::default(),
            upload_speed: SpeedCalc::default(),
            followed_by: Vec::new(),
            belongs_to: None,
        }
    }

    /// Apply per-download settings from the engine configuration
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.num_concurrent_command = config.split;
        self.max_download_speed_limit = config.max_download_limit;
        self.max_upload_speed_limit = config.max_upload_limit;
        self.timeout = config.timeout();
        self.max_file_not_found = config.max_file_not_found;
        self
    }

    pub fn with_uris(mut self, uris: Vec<String>) -> Self {
        self.uri_selector = UriSelector::new(uris);
        self
    }

    pub fn with_split(mut self, split: usize) -> Self {
        self.num_concurrent_command = split.max(1);
        self
    }

    pub fn with_speed_limits(mut self, download: u64, upload: u64) -> Self {
        self.max_download_speed_limit = download;
        self.max_upload_speed_limit = upload;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_disk_writer_factory(mut self, factory: Rc<dyn DiskWriterFactory>) -> Self {
        self.disk_writer_factory = factory;
        self
    }

    /// Abort unless the source reports exactly this file name
    pub fn with_expected_filename(mut self, name: impl Into<String>) -> Self {
        self.expected_filename = Some(name.into());
        self
    }

    /// Abort unless the source reports exactly this length
    pub fn with_expected_total_length(mut self, length: u64) -> Self {
        self.expected_total_length = Some(length);
        self
    }

    pub fn add_pre_download_handler(&mut self, handler: Rc<dyn PreDownloadHandler>) {
        self.pre_download_handlers.push(handler);
    }

    pub fn add_post_download_handler(&mut self, handler: Rc<dyn PostDownloadHandler>) {
        self.post_download_handlers.push(handler);
    }

    pub fn gid(&self) -> GroupId {
        self.gid
    }

    pub(crate) fn set_gid(&mut self, gid: GroupId) {
        self.gid = gid;
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn download_context(&self) -> &DownloadContextHandle {
        &self.download_context
    }

    /// Swap the download context; storage must be re-initialised afterwards
    pub fn set_download_context(&mut self, ctx: DownloadContextHandle) {
        self.drop_piece_storage();
        self.download_context = ctx;
        self.download_context.borrow_mut().set_owner(self.gid);
    }

    pub fn uri_selector(&self) -> &UriSelector {
        &self.uri_selector
    }

    pub fn uri_selector_mut(&mut self) -> &mut UriSelector {
        &mut self.uri_selector
    }

    /// Download driven by the peer-to-peer layer rather than stream tasks
    pub fn p2p_involved(&self) -> bool {
        self.download_context.borrow().torrent().is_some()
    }

    pub fn mark_in_memory_download(&mut self) {
        self.in_memory_download = true;
    }

    pub fn in_memory_download(&self) -> bool {
        self.in_memory_download
    }

    // Storage

    /// Create piece storage and segment allocator as one unit
    pub fn init_piece_storage(&mut self) -> Result<()> {
        let storage = {
            let ctx = self.download_context.borrow();
            let writer = if self.in_memory_download {
                MemoryDiskWriterFactory.new_disk_writer(&ctx)?
            } else {
                self.disk_writer_factory.new_disk_writer(&ctx)?
            };
            let total = ctx.is_length_known().then(|| ctx.total_length());
            PieceStorage::new(total, ctx.piece_length(), writer)
        };
        let piece_storage = Rc::new(RefCell::new(storage));
        {
            let mut ctx = self.download_context.borrow_mut();
            ctx.set_owner(self.gid);
            ctx.publish_piece_storage(Some(&piece_storage));
        }
        debug!("[{}] Piece storage initialised", self.gid);
        self.storage = Some(StorageSlot {
            segment_man: SegmentMan::new(Rc::clone(&piece_storage)),
            piece_storage,
        });
        Ok(())
    }

    /// Drop piece storage and segment allocator together
    pub fn drop_piece_storage(&mut self) {
        if self.storage.take().is_some() {
            self.download_context
                .borrow_mut()
                .publish_piece_storage(None);
            debug!("[{}] Piece storage dropped", self.gid);
        }
    }

    pub fn is_storage_initialized(&self) -> bool {
        self.storage.is_some()
    }

    pub fn piece_storage(&self) -> Option<&PieceStorageHandle> {
        self.storage.as_ref().map(|s| &s.piece_storage)
    }

    pub fn segment_man(&self) -> Option<&SegmentMan> {
        self.storage.as_ref().map(|s| &s.segment_man)
    }

    pub fn segment_man_mut(&mut self) -> Option<&mut SegmentMan> {
        self.storage.as_mut().map(|s| &mut s.segment_man)
    }

    // Task creation

    /// Move to ACTIVE and produce the first tasks
    pub fn create_initial_command(
        &mut self,
        cuids: &mut CuidCounter,
        bt_registry: &mut BtRegistry,
    ) -> Result<Vec<Task>> {
        self.pre_download_processing()?;
        self.state = GroupState::Active;
        self.download_context.borrow_mut().set_owner(self.gid);

        if self.p2p_involved() {
            self.init_piece_storage()?;
            bt_registry.put(
                self.gid,
                BtObject {
                    download_context: Rc::clone(&self.download_context),
                    peer_storage: Rc::new(RefCell::new(PeerStorage::new())),
                },
            );
            info!("[{}] Torrent download registered", self.gid);
            return Ok(Vec::new());
        }

        if self.storage.is_none() {
            let Some(uri) = self.uri_selector.select() else {
                return Err(EngineError::abort(
                    ErrorCode::ResourceNotFound,
                    "No URI available",
                ));
            };
            info!("[{}] Starting download from {}", self.gid, uri);
            let task = StreamInitiateTask::new(cuids.next(), self.gid, uri, None);
            self.increase_num_command();
            return Ok(vec![task.into()]);
        }

        self.create_next_command(self.num_concurrent_command, cuids)
    }

    /// Create up to `n` more transfer tasks, bounded by the concurrency cap
    /// and the segments still free
    pub fn create_next_command(&mut self, n: usize, cuids: &mut CuidCounter) -> Result<Vec<Task>> {
        let free = self
            .segment_man()
            .map(|sm| sm.count_free_segments())
            .unwrap_or(0);
        let count = n
            .min(self.num_concurrent_command.saturating_sub(self.num_command))
            .min(free);

        let mut tasks = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(uri) = self.uri_selector.select() else {
                break;
            };
            let cuid = cuids.next();
            let Some(segment) = self
                .segment_man_mut()
                .and_then(|sm| sm.get_segment(cuid))
            else {
                break;
            };
            tasks.push(StreamInitiateTask::new(cuid, self.gid, uri, Some(segment)).into());
            self.increase_num_command();
        }
        Ok(tasks)
    }

    /// Tasks for a stream group whose tasks all ended before it finished
    pub fn create_resume_command(
        &mut self,
        cuids: &mut CuidCounter,
        max_resume_failure_tries: u32,
    ) -> Result<Vec<Task>> {
        if !self.uri_selector.has_available() {
            return Err(EngineError::abort(
                self.last_error_code.unwrap_or(ErrorCode::ResourceNotFound),
                "No URI left to resume from",
            ));
        }
        self.resume_failure_count += 1;
        if max_resume_failure_tries > 0 && self.resume_failure_count > max_resume_failure_tries {
            return Err(EngineError::abort(
                ErrorCode::CannotResume,
                format!(
                    "Gave up after {} resume attempts",
                    max_resume_failure_tries
                ),
            ));
        }
        debug!(
            "[{}] Resuming (attempt {})",
            self.gid, self.resume_failure_count
        );

        if self.storage.is_none() {
            let Some(uri) = self.uri_selector.select() else {
                return Ok(Vec::new());
            };
            self.increase_num_command();
            return Ok(vec![
                StreamInitiateTask::new(cuids.next(), self.gid, uri, None).into(),
            ]);
        }
        self.create_next_command(self.num_concurrent_command, cuids)
    }

    fn pre_download_processing(&mut self) -> Result<()> {
        let handlers = self.pre_download_handlers.clone();
        for handler in handlers {
            if handler.can_handle(self) {
                handler.execute(self)?;
            }
        }
        Ok(())
    }

    /// Groups that follow this one; records the id edges both ways
    pub fn post_download_processing(&mut self) -> Result<Vec<RequestGroup>> {
        let handlers = self.post_download_handlers.clone();
        for handler in handlers {
            if !handler.can_handle(self) {
                continue;
            }
            let mut groups = handler.get_next_groups(self)?;
            for group in &mut groups {
                group.belongs_to = Some(self.gid);
                self.followed_by.push(group.gid);
            }
            return Ok(groups);
        }
        Ok(Vec::new())
    }

    // Completion

    fn requested_ranges_finished(&self, requested_only: bool) -> bool {
        let Some(slot) = &self.storage else {
            return true;
        };
        let storage = slot.piece_storage.borrow();
        if !storage.is_length_known() {
            return false;
        }
        if storage.download_finished() {
            return true;
        }
        let ctx = self.download_context.borrow();
        ctx.file_entries()
            .iter()
            .filter(|f| !requested_only || f.requested)
            .all(|f| storage.range_finished(f.offset, f.length))
    }

    /// Every requested file is covered by completed pieces
    pub fn download_finished(&self) -> bool {
        self.requested_ranges_finished(true)
    }

    /// Every file is covered by completed pieces
    pub fn all_download_finished(&self) -> bool {
        self.requested_ranges_finished(false)
    }

    pub fn total_length(&self) -> u64 {
        if let Some(total) = self
            .piece_storage()
            .and_then(|ps| ps.borrow().total_length())
        {
            return total;
        }
        let ctx = self.download_context.borrow();
        if ctx.is_length_known() {
            ctx.total_length()
        } else {
            0
        }
    }

    pub fn completed_length(&self) -> u64 {
        self.piece_storage()
            .map(|ps| ps.borrow().completed_length())
            .unwrap_or(0)
    }

    // Halt

    pub fn set_halt_requested(&mut self, flag: bool, reason: HaltReason) {
        self.halt_requested = flag;
        if flag {
            self.halt_reason = reason;
        }
    }

    pub fn set_force_halt_requested(&mut self, flag: bool, reason: HaltReason) {
        self.set_halt_requested(flag, reason);
        self.force_halt_requested = flag;
    }

    pub fn set_pause_requested(&mut self, flag: bool) {
        self.pause_requested = flag;
        if flag {
            self.set_halt_requested(true, HaltReason::UserRequest);
        }
    }

    pub fn is_halt_requested(&self) -> bool {
        self.halt_requested
    }

    pub fn is_force_halt_requested(&self) -> bool {
        self.force_halt_requested
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause_requested
    }

    pub fn halt_reason(&self) -> HaltReason {
        self.halt_reason
    }

    // Errors

    pub fn set_last_error_code(&mut self, code: ErrorCode) {
        self.last_error_code = Some(code);
    }

    pub fn last_error_code(&self) -> Option<ErrorCode> {
        self.last_error_code
    }

    /// Record a fatal error and halt
    pub fn abort(&mut self, err: &EngineError) {
        let code = err.error_code();
        warn!("[{}] Download aborted: {}", self.gid, err);
        self.set_last_error_code(code);
        self.set_halt_requested(true, HaltReason::None);
    }

    pub fn validate_filename(&self, actual: &str) -> Result<()> {
        match &self.expected_filename {
            Some(expected) if expected != actual => Err(EngineError::abort(
                ErrorCode::FilenameMismatch,
                format!("File name mismatch: expected={}, actual={}", expected, actual),
            )),
            _ => Ok(()),
        }
    }

    pub fn validate_total_length(&self, actual: u64) -> Result<()> {
        match self.expected_total_length {
            Some(expected) if expected != actual => Err(EngineError::abort(
                ErrorCode::LengthMismatch,
                format!("Size mismatch: expected={}, actual={}", expected, actual),
            )),
            _ => Ok(()),
        }
    }

    /// Count a "not found" answer; past the limit the download is aborted
    pub fn increase_and_validate_file_not_found_count(&mut self) -> Result<()> {
        self.file_not_found_count += 1;
        if self.max_file_not_found > 0 && self.file_not_found_count >= self.max_file_not_found {
            return Err(EngineError::abort(
                ErrorCode::MaxFileNotFound,
                format!(
                    "Reached max-file-not-found count={}",
                    self.max_file_not_found
                ),
            ));
        }
        Ok(())
    }

    pub fn resume_failure_count(&self) -> u32 {
        self.resume_failure_count
    }

    // Counters

    pub fn num_command(&self) -> usize {
        self.num_command
    }

    pub fn increase_num_command(&mut self) {
        self.num_command += 1;
    }

    pub fn decrease_num_command(&mut self) {
        self.num_command = self.num_command.saturating_sub(1);
    }

    pub fn num_stream_command(&self) -> usize {
        self.num_stream_command
    }

    pub fn increase_stream_command(&mut self) {
        self.num_stream_command += 1;
    }

    pub fn decrease_stream_command(&mut self) {
        self.num_stream_command = self.num_stream_command.saturating_sub(1);
    }

    pub fn num_stream_connection(&self) -> usize {
        self.num_stream_connection
    }

    pub fn increase_stream_connection(&mut self) {
        self.num_stream_connection += 1;
    }

    pub fn decrease_stream_connection(&mut self) {
        self.num_stream_connection = self.num_stream_connection.saturating_sub(1);
    }

    pub fn num_concurrent_command(&self) -> usize {
        self.num_concurrent_command
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    // Speed

    pub fn max_download_speed_limit(&self) -> u64 {
        self.max_download_speed_limit
    }

    pub fn max_upload_speed_limit(&self) -> u64 {
        self.max_upload_speed_limit
    }

    pub fn set_max_download_speed_limit(&mut self, limit: u64) {
        self.max_download_speed_limit = limit;
    }

    pub fn set_max_upload_speed_limit(&mut self, limit: u64) {
        self.max_upload_speed_limit = limit;
    }

    pub fn record_download(&mut self, bytes: u64, now: Instant) {
        self.download_speed.add_bytes(bytes, now);
    }

    pub fn record_upload(&mut self, bytes: u64, now: Instant) {
        self.upload_speed.add_bytes(bytes, now);
    }

    pub fn does_download_speed_exceed(&self, now: Instant) -> bool {
        self.max_download_speed_limit > 0
            && self.download_speed.speed(now) > self.max_download_speed_limit
    }

    pub fn does_upload_speed_exceed(&self, now: Instant) -> bool {
        self.max_upload_speed_limit > 0
            && self.upload_speed.speed(now) > self.max_upload_speed_limit
    }

    pub fn calculate_stat(&self, now: Instant) -> TransferStat {
        TransferStat {
            download_speed: self.download_speed.speed(now),
            upload_speed: self.upload_speed.speed(now),
            session_download_length: self.download_speed.total(),
            session_upload_length: self.upload_speed.total(),
        }
    }

    // Dependencies and relations

    pub fn depends_on(&mut self, dependency: Box<dyn Dependency>) {
        self.dependency = Some(dependency);
    }

    pub fn dependency_state(&self, results: &DownloadResults) -> DependencyState {
        match &self.dependency {
            Some(dep) => dep.state(results),
            None => DependencyState::Resolved,
        }
    }

    pub fn is_dependency_resolved(&self, results: &DownloadResults) -> bool {
        self.dependency_state(results) == DependencyState::Resolved
    }

    pub fn followed_by(&self) -> &[GroupId] {
        &self.followed_by
    }

    pub fn belongs_to(&self) -> Option<GroupId> {
        self.belongs_to
    }

    // Results

    /// Final summary of this group
    pub fn create_download_result(&self) -> DownloadResult {
        let finished = self.is_storage_initialized() && self.download_finished();
        let result = if finished && !self.pause_requested {
            ErrorCode::Finished
        } else if let Some(code) = self.last_error_code {
            code
        } else if self.halt_reason == HaltReason::UserRequest && !self.pause_requested {
            ErrorCode::Removed
        } else {
            ErrorCode::InProgress
        };
        let path = self
            .download_context
            .borrow()
            .first_file_path()
            .map(|p| p.to_path_buf());
        DownloadResult {
            gid: self.gid,
            result,
            paused: self.pause_requested,
            total_length: self.total_length(),
            completed_length: self.completed_length(),
            followed_by: self.followed_by.clone(),
            belongs_to: self.belongs_to,
            uris: self.uri_selector.uris().to_vec(),
            path,
            finished_at: chrono::Utc::now(),
        }
    }

    /// Drop everything the group holds while running
    pub fn release_runtime_resource(&mut self, bt_registry: &mut BtRegistry) {
        self.drop_piece_storage();
        if bt_registry.remove(self.gid) {
            debug!("[{}] Removed from torrent registry", self.gid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use context::DownloadContext;

    fn stream_group(total: u64, piece: u64) -> RequestGroup {
        let mut ctx = DownloadContext::unknown_length("file.bin", piece);
        ctx.set_total_length(total);
        RequestGroup::new(ctx.into_handle()).with_uris(vec!["http://a/file.bin".into()])
    }

    #[test]
    fn test_storage_slot_pairing() {
        let mut group = stream_group(4096, 1024);
        assert!(group.piece_storage().is_none() && group.segment_man().is_none());
        group.init_piece_storage().unwrap();
        assert!(group.piece_storage().is_some() && group.segment_man().is_some());
        assert!(group
            .download_context()
            .borrow()
            .owner_piece_storage()
            .is_some());
        group.drop_piece_storage();
        assert!(group.piece_storage().is_none() && group.segment_man().is_none());
        assert!(group
            .download_context()
            .borrow()
            .owner_piece_storage()
            .is_none());
    }

    #[test]
    fn test_download_finished_without_storage() {
        let group = stream_group(10, 10);
        assert!(group.download_finished());
        assert!(group.all_download_finished());
    }

    #[test]
    fn test_download_finished_requested_files_only() {
        let ctx = DownloadContext::new(10, vec![("a".into(), 10), ("b".into(), 10)]);
        let mut group = RequestGroup::new(ctx.into_handle());
        group
            .download_context()
            .borrow_mut()
            .file_entries_mut()[1]
            .requested = false;
        group.init_piece_storage().unwrap();
        group.piece_storage().unwrap().borrow_mut().complete_piece(0);
        assert!(group.download_finished());
        assert!(!group.all_download_finished());
    }

    #[test]
    fn test_create_next_command_bounded() {
        let mut group = stream_group(3 * 1024, 1024).with_split(5);
        group.init_piece_storage().unwrap();
        let mut cuids = CuidCounter::default();
        let tasks = group.create_next_command(10, &mut cuids).unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(group.num_command(), 3);
        assert_eq!(group.segment_man().unwrap().count_free_segments(), 0);
        assert!(group.create_next_command(10, &mut cuids).unwrap().is_empty());
    }

    #[test]
    fn test_initial_command_for_unknown_size_is_single_initiate() {
        let ctx = DownloadContext::unknown_length("x", 1024);
        let mut group = RequestGroup::new(ctx.into_handle()).with_uris(vec!["http://h/x".into()]);
        let mut cuids = CuidCounter::default();
        let mut registry = BtRegistry::new();
        let tasks = group.create_initial_command(&mut cuids, &mut registry).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(group.state(), GroupState::Active);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_initial_command_registers_torrent() {
        let ctx = DownloadContext::for_metadata([7; 20], None);
        let mut group = RequestGroup::new(ctx.into_handle());
        let gid = group.gid();
        let mut cuids = CuidCounter::default();
        let mut registry = BtRegistry::new();
        let tasks = group.create_initial_command(&mut cuids, &mut registry).unwrap();
        assert!(tasks.is_empty());
        assert!(registry.get(gid).is_some());
        group.release_runtime_resource(&mut registry);
        assert!(registry.is_empty());
        assert!(!group.is_storage_initialized());
    }

    #[test]
    fn test_zero_limit_never_exceeds() {
        let mut group = stream_group(10, 10);
        let now = Instant::now();
        group.record_download(u64::MAX / 2, now);
        group.record_upload(u64::MAX / 2, now);
        assert!(!group.does_download_speed_exceed(now));
        assert!(!group.does_upload_speed_exceed(now));

        group.set_max_download_speed_limit(100);
        assert!(group.does_download_speed_exceed(now));
    }

    #[test]
    fn test_validation_errors_carry_codes() {
        let group = stream_group(10, 10)
            .with_expected_filename("a.iso")
            .with_expected_total_length(10);
        assert!(group.validate_filename("a.iso").is_ok());
        assert_eq!(
            group.validate_filename("b.iso").unwrap_err().error_code(),
            ErrorCode::FilenameMismatch
        );
        assert_eq!(
            group.validate_total_length(11).unwrap_err().error_code(),
            ErrorCode::LengthMismatch
        );
    }

    #[test]
    fn test_file_not_found_limit() {
        let mut config = EngineConfig::default();
        config.max_file_not_found = 2;
        let mut group = stream_group(10, 10).with_config(&config);
        assert!(group.increase_and_validate_file_not_found_count().is_ok());
        let err = group.increase_and_validate_file_not_found_count().unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::MaxFileNotFound);
    }

    #[test]
    fn test_force_halt_implies_halt() {
        let mut group = stream_group(10, 10);
        group.set_force_halt_requested(true, HaltReason::ShutdownSignal);
        assert!(group.is_halt_requested());
        assert_eq!(group.halt_reason(), HaltReason::ShutdownSignal);
    }

    #[test]
    fn test_result_codes() {
        let mut group = stream_group(10, 10);
        assert_eq!(group.create_download_result().result, ErrorCode::InProgress);

        group.set_halt_requested(true, HaltReason::UserRequest);
        assert_eq!(group.create_download_result().result, ErrorCode::Removed);

        group.set_last_error_code(ErrorCode::NetworkProblem);
        assert_eq!(
            group.create_download_result().result,
            ErrorCode::NetworkProblem
        );

        let mut paused = stream_group(10, 10);
        paused.set_pause_requested(true);
        let result = paused.create_download_result();
        assert!(result.paused);
        assert_eq!(result.result, ErrorCode::InProgress);
    }

    #[test]
    fn test_resume_limit() {
        let mut group = stream_group(10, 10);
        let mut cuids = CuidCounter::default();
        assert_eq!(group.create_resume_command(&mut cuids, 1).unwrap().len(), 1);
        group.decrease_num_command();
        let err = group.create_resume_command(&mut cuids, 1).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::CannotResume);
    }
}
