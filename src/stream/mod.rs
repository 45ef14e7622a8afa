//! Stream (HTTP/FTP) transfer tasks
//!
//! Wire protocols sit behind [`StreamSource`]; this module only drives them.
//! A [`StreamInitiateTask`] opens a source and waits for its response
//! headers. The first one of a group sizes the piece storage from them and
//! creates the remaining tasks. Each initiate task then hands its source
//! and segment to a [`StreamTransferTask`] under the same cuid.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::auth::{AuthConfig, AuthOptions, CredentialRequest};
use crate::engine::{EngineContext, Execute, Reactor, TaskStatus};
use crate::error::{EngineError, ErrorCode, NetworkErrorKind, Result};
use crate::group::segment::Segment;
use crate::group::RequestGroup;
use crate::types::{Cuid, GroupId};

/// Bytes read per turn by one transfer task
const CHUNK_SIZE: usize = 16 * 1024;

/// What a source learned from the response headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamProbe {
    /// Content length, if the server sent one
    pub total_length: Option<u64>,
    /// File name suggested by the server
    pub filename: Option<String>,
}

/// Outcome of a non-blocking read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRead {
    Data(usize),
    WouldBlock,
    Eof,
}

/// A byte stream from one URI
pub trait StreamSource {
    /// Response metadata; `None` until it has arrived
    fn probe(&mut self) -> Result<Option<StreamProbe>>;

    /// Continue reading from `offset`
    fn seek(&mut self, offset: u64) -> Result<()>;

    fn read(&mut self, buf: &mut [u8]) -> Result<StreamRead>;

    /// Register the source's sockets for readiness under `cuid`
    fn register(&mut self, _reactor: &mut Reactor, _cuid: Cuid) -> Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _reactor: &mut Reactor) {}
}

/// Opens sources for URIs
pub trait StreamSourceFactory {
    fn open(&self, uri: &str, auth: Option<&AuthConfig>) -> Result<Box<dyn StreamSource>>;
}

/// Book a source failure on the group
fn record_failure(group: &mut RequestGroup, cuid: Cuid, uri: &str, err: &EngineError) {
    if let Some(sm) = group.segment_man_mut() {
        sm.cancel_segment(cuid);
    }
    group.uri_selector_mut().report_failure(uri);

    if let EngineError::Abort { .. } = err {
        group.abort(err);
        return;
    }
    let code = err.error_code();
    group.set_last_error_code(code);
    if code == ErrorCode::ResourceNotFound {
        if let Err(e) = group.increase_and_validate_file_not_found_count() {
            group.abort(&e);
        }
    }
}

/// Opens a source and waits for its response headers
pub struct StreamInitiateTask {
    cuid: Cuid,
    gid: GroupId,
    uri: String,
    segment: Option<Segment>,
    source: Option<Box<dyn StreamSource>>,
    started: Option<Instant>,
    handed_off: bool,
}

impl StreamInitiateTask {
    pub fn new(cuid: Cuid, gid: GroupId, uri: String, segment: Option<Segment>) -> Self {
        Self {
            cuid,
            gid,
            uri,
            segment,
            source: None,
            started: None,
            handed_off: false,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn open_source(&mut self, cx: &mut EngineContext) -> Result<()> {
        let factory = cx
            .stream_factory
            .clone()
            .ok_or_else(|| EngineError::Internal("No stream source factory installed".into()))?;
        let request = CredentialRequest::from_uri(&self.uri)?;
        let options = AuthOptions::from_config(&cx.config);
        let auth = cx.auth.create_auth_config(&request, &options);

        let mut source = factory.open(&self.uri, auth.as_ref())?;
        source.register(&mut cx.reactor, self.cuid)?;
        if let Some(group) = cx.groups.get_mut(self.gid) {
            group.increase_stream_connection();
        }
        debug!("[{}] #{} connecting to {}", self.gid, self.cuid, self.uri);
        self.source = Some(source);
        self.started = Some(cx.now());
        Ok(())
    }
}

impl Execute for StreamInitiateTask {
    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn name(&self) -> &'static str {
        "StreamInitiate"
    }

    fn execute(&mut self, cx: &mut EngineContext) -> Result<TaskStatus> {
        match cx.groups.get(self.gid) {
            Some(group) if !group.is_halt_requested() => {}
            _ => return Ok(TaskStatus::Finished),
        }
        if self.source.is_none() {
            self.open_source(cx)?;
        }
        let now = cx.now();
        let Some(source) = self.source.as_mut() else {
            return Ok(TaskStatus::Finished);
        };
        let Some(group) = cx.groups.get_mut(self.gid) else {
            return Ok(TaskStatus::Finished);
        };

        let Some(probe) = source.probe()? else {
            let waited = self
                .started
                .map(|s| now.saturating_duration_since(s))
                .unwrap_or_default();
            if waited > group.timeout() {
                return Err(EngineError::network(
                    NetworkErrorKind::Timeout,
                    format!("No response from {} within {:?}", self.uri, group.timeout()),
                ));
            }
            return Ok(TaskStatus::Continue);
        };

        if let Some(name) = &probe.filename {
            group.validate_filename(name)?;
        }
        if let Some(length) = probe.total_length {
            group.validate_total_length(length)?;
        }

        let mut next_tasks = Vec::new();
        if !group.is_storage_initialized() {
            if let Some(length) = probe.total_length {
                group.download_context().borrow_mut().set_total_length(length);
            }
            group.init_piece_storage()?;
            info!(
                "[{}] Size {}",
                self.gid,
                probe
                    .total_length
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| "unknown".into())
            );
            self.segment = group
                .segment_man_mut()
                .and_then(|sm| sm.get_segment(self.cuid));
            let n = group.num_concurrent_command();
            next_tasks = group.create_next_command(n, &mut cx.cuids)?;
        } else if let (Some(length), true) = (probe.total_length, group.total_length() > 0) {
            if length != group.total_length() {
                return Err(EngineError::abort(
                    ErrorCode::LengthMismatch,
                    format!(
                        "Size mismatch: expected={}, actual={}",
                        group.total_length(),
                        length
                    ),
                ));
            }
        }

        let Some(segment) = self.segment.take() else {
            debug!("[{}] #{} has no segment to fetch", self.gid, self.cuid);
            for task in next_tasks {
                cx.spawn(task);
            }
            return Ok(TaskStatus::Finished);
        };
        source.seek(segment.write_position())?;
        group.increase_stream_command();

        let Some(source) = self.source.take() else {
            return Ok(TaskStatus::Finished);
        };
        let transfer = StreamTransferTask::new(
            self.cuid,
            self.gid,
            std::mem::take(&mut self.uri),
            source,
            segment,
            now,
        );
        self.handed_off = true;
        cx.spawn(transfer);
        for task in next_tasks {
            cx.spawn(task);
        }
        Ok(TaskStatus::Finished)
    }

    fn deadline(&self, cx: &EngineContext) -> Option<Instant> {
        self.source.is_none().then(|| cx.now())
    }

    fn fail(&mut self, cx: &mut EngineContext, err: &EngineError) {
        self.segment = None;
        if let Some(group) = cx.groups.get_mut(self.gid) {
            record_failure(group, self.cuid, &self.uri, err);
        }
    }

    fn release(&mut self, cx: &mut EngineContext) {
        if self.handed_off {
            return;
        }
        if let Some(mut source) = self.source.take() {
            source.deregister(&mut cx.reactor);
            if let Some(group) = cx.groups.get_mut(self.gid) {
                group.decrease_stream_connection();
            }
        }
        if let Some(group) = cx.groups.get_mut(self.gid) {
            if let Some(segment) = self.segment.take() {
                if let Some(sm) = group.segment_man_mut() {
                    sm.cancel_segment(self.cuid);
                }
                debug!("[{}] segment {} returned", self.gid, segment.index);
            }
            group.decrease_num_command();
        }
        cx.reactor.forget_task(self.cuid);
    }
}

/// Moves bytes from a source into the group's piece storage
pub struct StreamTransferTask {
    cuid: Cuid,
    gid: GroupId,
    uri: String,
    source: Box<dyn StreamSource>,
    segment: Segment,
    buf: Vec<u8>,
    last_progress: Instant,
    busy: bool,
}

impl StreamTransferTask {
    pub fn new(
        cuid: Cuid,
        gid: GroupId,
        uri: String,
        source: Box<dyn StreamSource>,
        segment: Segment,
        now: Instant,
    ) -> Self {
        Self {
            cuid,
            gid,
            uri,
            source,
            segment,
            buf: vec![0u8; CHUNK_SIZE],
            last_progress: now,
            busy: true,
        }
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }
}

impl Execute for StreamTransferTask {
    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn name(&self) -> &'static str {
        "StreamTransfer"
    }

    fn execute(&mut self, cx: &mut EngineContext) -> Result<TaskStatus> {
        let now = cx.now();
        let Some(group) = cx.groups.get_mut(self.gid) else {
            return Ok(TaskStatus::Finished);
        };
        if group.is_halt_requested() {
            if let Some(sm) = group.segment_man_mut() {
                sm.cancel_segment(self.cuid);
            }
            return Ok(TaskStatus::Finished);
        }
        if group.does_download_speed_exceed(now) {
            self.busy = false;
            return Ok(TaskStatus::Continue);
        }
        let Some(storage) = group.piece_storage().cloned() else {
            return Ok(TaskStatus::Finished);
        };

        let want = match self.segment.remaining() {
            Some(remaining) => self.buf.len().min(remaining as usize),
            None => self.buf.len(),
        };
        match self.source.read(&mut self.buf[..want])? {
            StreamRead::WouldBlock => {
                self.busy = false;
                if now.saturating_duration_since(self.last_progress) > group.timeout() {
                    return Err(EngineError::network(
                        NetworkErrorKind::Timeout,
                        format!("Transfer from {} stalled", self.uri),
                    ));
                }
                Ok(TaskStatus::Continue)
            }
            StreamRead::Data(n) => {
                self.busy = true;
                self.last_progress = now;
                storage
                    .borrow_mut()
                    .write_data(&self.buf[..n], self.segment.write_position())?;
                self.segment.written += n as u64;
                group.record_download(n as u64, now);

                if !self.segment.is_complete() {
                    return Ok(TaskStatus::Continue);
                }
                let end = self.segment.write_position();
                let Some(sm) = group.segment_man_mut() else {
                    return Ok(TaskStatus::Finished);
                };
                sm.complete_segment(self.cuid, &self.segment);
                let next = sm.get_segment(self.cuid);
                group.uri_selector_mut().report_success(&self.uri);
                match next {
                    Some(next) => {
                        if next.position != end {
                            self.source.seek(next.position)?;
                        }
                        self.segment = next;
                        Ok(TaskStatus::Continue)
                    }
                    None => Ok(TaskStatus::Finished),
                }
            }
            StreamRead::Eof => {
                if !self.segment.is_open_ended() {
                    return Err(EngineError::network(
                        NetworkErrorKind::Receive,
                        format!(
                            "Connection closed with {} bytes of segment {} missing",
                            self.segment.remaining().unwrap_or(0),
                            self.segment.index
                        ),
                    ));
                }
                let total = self.segment.written;
                storage.borrow_mut().finish_stream(total);
                group
                    .download_context()
                    .borrow_mut()
                    .set_total_length(total);
                if let Some(sm) = group.segment_man_mut() {
                    sm.complete_segment(self.cuid, &self.segment);
                }
                group.uri_selector_mut().report_success(&self.uri);
                debug!("[{}] stream ended after {} bytes", self.gid, total);
                Ok(TaskStatus::Finished)
            }
        }
    }

    fn deadline(&self, cx: &EngineContext) -> Option<Instant> {
        self.busy.then(|| cx.now())
    }

    fn fail(&mut self, cx: &mut EngineContext, err: &EngineError) {
        if let Some(group) = cx.groups.get_mut(self.gid) {
            if err.is_retryable() {
                debug!("[{}] #{} will be retried: {}", self.gid, self.cuid, err);
            } else {
                warn!("[{}] #{} {}", self.gid, self.cuid, err);
            }
            record_failure(group, self.cuid, &self.uri, err);
        }
    }

    fn release(&mut self, cx: &mut EngineContext) {
        self.source.deregister(&mut cx.reactor);
        if let Some(group) = cx.groups.get_mut(self.gid) {
            group.decrease_stream_connection();
            group.decrease_stream_command();
            group.decrease_num_command();
        }
        cx.reactor.forget_task(self.cuid);
    }
}
