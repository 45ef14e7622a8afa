//! Request group manager
//!
//! Arena of every download the engine knows about. Reserved groups wait in
//! FIFO order; active groups are keyed by [`GroupId`]. When a group leaves
//! the arena its [`DownloadResult`] is recorded.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::dependency::DependencyState;
use super::RequestGroup;
use crate::engine::{CuidCounter, Task};
use crate::error::{EngineError, ErrorCode, Result};
use crate::torrent::registry::BtRegistry;
use crate::types::{GroupId, GroupState, HaltReason};

/// Final outcome of a download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResult {
    pub gid: GroupId,
    pub result: ErrorCode,
    /// Stopped by a pause request rather than finished or removed
    pub paused: bool,
    pub total_length: u64,
    pub completed_length: u64,
    pub followed_by: Vec<GroupId>,
    pub belongs_to: Option<GroupId>,
    pub uris: Vec<String>,
    pub path: Option<PathBuf>,
    pub finished_at: DateTime<Utc>,
}

/// Results in the order the groups left the arena
#[derive(Debug, Clone, Default)]
pub struct DownloadResults {
    results: Vec<DownloadResult>,
}

impl DownloadResults {
    pub fn push(&mut self, result: DownloadResult) {
        self.results.push(result);
    }

    pub fn get(&self, gid: GroupId) -> Option<&DownloadResult> {
        self.results.iter().rev().find(|r| r.gid == gid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DownloadResult> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Arena of download groups
#[derive(Debug)]
pub struct RequestGroupMan {
    active: HashMap<GroupId, RequestGroup>,
    reserved: VecDeque<RequestGroup>,
    results: DownloadResults,
    max_concurrent_downloads: usize,
    halt_requested: bool,
}

impl RequestGroupMan {
    pub fn new(max_concurrent_downloads: usize) -> Self {
        Self {
            active: HashMap::new(),
            reserved: VecDeque::new(),
            results: DownloadResults::default(),
            max_concurrent_downloads: max_concurrent_downloads.max(1),
            halt_requested: false,
        }
    }

    fn contains(&self, gid: GroupId) -> bool {
        self.active.contains_key(&gid) || self.reserved.iter().any(|g| g.gid() == gid)
    }

    fn assign_unique_gid(&self, group: &mut RequestGroup) {
        while self.contains(group.gid()) {
            group.set_gid(GroupId::random());
        }
    }

    /// Queue a group at the back of the reserved list
    pub fn add_reserved_group(&mut self, mut group: RequestGroup) -> Result<GroupId> {
        if self.halt_requested {
            return Err(EngineError::Shutdown);
        }
        self.assign_unique_gid(&mut group);
        let gid = group.gid();
        group.download_context().borrow_mut().set_owner(gid);
        debug!("[{}] Group reserved", gid);
        self.reserved.push_back(group);
        Ok(gid)
    }

    /// Queue groups at the front of the reserved list, keeping their order
    fn insert_reserved_front(&mut self, groups: Vec<RequestGroup>) {
        for mut group in groups.into_iter().rev() {
            self.assign_unique_gid(&mut group);
            let gid = group.gid();
            group.download_context().borrow_mut().set_owner(gid);
            self.reserved.push_front(group);
        }
    }

    pub fn get(&self, gid: GroupId) -> Option<&RequestGroup> {
        self.active
            .get(&gid)
            .or_else(|| self.reserved.iter().find(|g| g.gid() == gid))
    }

    pub fn get_mut(&mut self, gid: GroupId) -> Option<&mut RequestGroup> {
        if let Some(group) = self.active.get_mut(&gid) {
            return Some(group);
        }
        self.reserved.iter_mut().find(|g| g.gid() == gid)
    }

    pub fn contains_group(&self, gid: GroupId) -> bool {
        self.contains(gid)
    }

    /// User removal: a reserved group leaves at once, an active one is
    /// halted and leaves once its tasks are gone
    pub fn remove_group(&mut self, gid: GroupId, force: bool) -> Result<()> {
        if let Some(pos) = self.reserved.iter().position(|g| g.gid() == gid) {
            if let Some(mut group) = self.reserved.remove(pos) {
                group.set_halt_requested(true, HaltReason::UserRequest);
                info!("[{}] Removed before start", gid);
                self.results.push(group.create_download_result());
            }
            return Ok(());
        }
        let group = self.active.get_mut(&gid).ok_or(EngineError::NotFound(gid))?;
        if force {
            group.set_force_halt_requested(true, HaltReason::UserRequest);
        } else {
            group.set_halt_requested(true, HaltReason::UserRequest);
        }
        Ok(())
    }

    /// Halt every group; reserved ones are reported as in progress
    pub fn halt(&mut self, force: bool, reason: HaltReason) {
        self.halt_requested = true;
        for group in self.active.values_mut() {
            if force {
                group.set_force_halt_requested(true, reason);
            } else {
                group.set_halt_requested(true, reason);
            }
        }
        while let Some(mut group) = self.reserved.pop_front() {
            group.set_halt_requested(true, reason);
            self.results.push(group.create_download_result());
        }
    }

    /// No group is left, reserved or active
    pub fn download_finished(&self) -> bool {
        self.active.is_empty() && self.reserved.is_empty()
    }

    pub fn num_active(&self) -> usize {
        self.active.len()
    }

    pub fn num_reserved(&self) -> usize {
        self.reserved.len()
    }

    pub fn results(&self) -> &DownloadResults {
        &self.results
    }

    pub fn download_result(&self, gid: GroupId) -> Option<&DownloadResult> {
        self.results.get(gid)
    }

    pub fn active_groups(&self) -> impl Iterator<Item = &RequestGroup> {
        self.active.values()
    }

    /// True if the next activation pass has work: a reserved group that
    /// can start in a free slot, or one whose dependency failed
    pub fn has_activatable(&self) -> bool {
        if self.halt_requested {
            return false;
        }
        let slot_free = self.active.len() < self.max_concurrent_downloads;
        self.reserved
            .iter()
            .any(|g| match g.dependency_state(&self.results) {
                DependencyState::Pending => false,
                DependencyState::Resolved => slot_free,
                DependencyState::Failed(_) => true,
            })
    }

    /// Remove active groups that are done and have no task left.
    ///
    /// Finished groups run their post-download handlers first; the groups
    /// those produce go to the front of the reserved list.
    pub fn retire_groups(&mut self, bt_registry: &mut BtRegistry) {
        let done: Vec<GroupId> = self
            .active
            .values()
            .filter(|g| {
                g.num_command() == 0
                    && (g.is_halt_requested()
                        || (g.is_storage_initialized() && g.download_finished()))
            })
            .map(|g| g.gid())
            .collect();

        for gid in done {
            let Some(mut group) = self.active.remove(&gid) else {
                continue;
            };
            let finished = !group.is_halt_requested()
                && group.is_storage_initialized()
                && group.download_finished();
            if finished {
                info!("[{}] Download complete", gid);
                match group.post_download_processing() {
                    Ok(next) if !next.is_empty() => {
                        debug!("[{}] {} follow-up group(s)", gid, next.len());
                        self.insert_reserved_front(next);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("[{}] Post-download processing failed: {}", gid, e);
                        group.set_last_error_code(e.error_code());
                    }
                }
            } else {
                info!("[{}] Download stopped", gid);
            }
            let result = group.create_download_result();
            group.release_runtime_resource(bt_registry);
            self.results.push(result);
        }
    }

    /// Restart stream groups whose tasks all ended before completion
    pub fn resume_groups(
        &mut self,
        cuids: &mut CuidCounter,
        max_resume_failure_tries: u32,
    ) -> Vec<Task> {
        let mut tasks = Vec::new();
        for group in self.active.values_mut() {
            if group.num_command() > 0
                || group.is_halt_requested()
                || group.p2p_involved()
                || group.state() != GroupState::Active
                || (group.is_storage_initialized() && group.download_finished())
            {
                continue;
            }
            match group.create_resume_command(cuids, max_resume_failure_tries) {
                Ok(new_tasks) => tasks.extend(new_tasks),
                Err(e) => group.abort(&e),
            }
        }
        tasks
    }

    /// Start reserved groups in FIFO order while slots are free
    pub fn activate_groups(
        &mut self,
        cuids: &mut CuidCounter,
        bt_registry: &mut BtRegistry,
    ) -> Vec<Task> {
        let mut tasks = Vec::new();
        if self.halt_requested {
            return tasks;
        }
        self.fail_blocked_groups();

        let mut waiting = VecDeque::new();
        while self.active.len() < self.max_concurrent_downloads {
            let Some(mut group) = self.reserved.pop_front() else {
                break;
            };
            if !group.is_dependency_resolved(&self.results) {
                waiting.push_back(group);
                continue;
            }
            let gid = group.gid();
            match group.create_initial_command(cuids, bt_registry) {
                Ok(new_tasks) => {
                    info!("[{}] Download activated", gid);
                    tasks.extend(new_tasks);
                }
                Err(e) => group.abort(&e),
            }
            self.active.insert(gid, group);
        }
        while let Some(group) = waiting.pop_back() {
            self.reserved.push_front(group);
        }
        tasks
    }

    /// Report reserved groups whose dependency can never resolve
    fn fail_blocked_groups(&mut self) {
        let mut kept = VecDeque::with_capacity(self.reserved.len());
        while let Some(mut group) = self.reserved.pop_front() {
            match group.dependency_state(&self.results) {
                DependencyState::Failed(code) => {
                    let gid = group.gid();
                    warn!("[{}] Dependency failed, download not started", gid);
                    group.set_last_error_code(code);
                    self.results.push(group.create_download_result());
                }
                _ => kept.push_back(group),
            }
        }
        self.reserved = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::context::DownloadContext;
    use crate::group::dependency::{GroupDependency, ManualDependency};

    fn stream_group(name: &str) -> RequestGroup {
        let ctx = DownloadContext::unknown_length(name, 1024);
        RequestGroup::new(ctx.into_handle()).with_uris(vec![format!("http://host/{}", name)])
    }

    #[test]
    fn test_activation_respects_concurrency() {
        let mut man = RequestGroupMan::new(2);
        for name in ["a", "b", "c"] {
            man.add_reserved_group(stream_group(name)).unwrap();
        }
        let mut cuids = CuidCounter::default();
        let mut registry = BtRegistry::new();
        let tasks = man.activate_groups(&mut cuids, &mut registry);
        assert_eq!(tasks.len(), 2);
        assert_eq!(man.num_active(), 2);
        assert_eq!(man.num_reserved(), 1);
    }

    #[test]
    fn test_unresolved_dependency_keeps_order() {
        let mut man = RequestGroupMan::new(5);
        let mut first = stream_group("a");
        let dep = ManualDependency::new();
        let flag = dep.flag();
        first.depends_on(Box::new(dep));
        let a = man.add_reserved_group(first).unwrap();
        let b = man.add_reserved_group(stream_group("b")).unwrap();

        let mut cuids = CuidCounter::default();
        let mut registry = BtRegistry::new();
        man.activate_groups(&mut cuids, &mut registry);
        assert!(man.active.contains_key(&b));
        assert_eq!(man.reserved.front().map(|g| g.gid()), Some(a));

        flag.set(true);
        man.activate_groups(&mut cuids, &mut registry);
        assert!(man.active.contains_key(&a));
    }

    #[test]
    fn test_group_dependency_waits_for_result() {
        let mut man = RequestGroupMan::new(5);
        let first = stream_group("a");
        let first_gid = first.gid();
        let mut second = stream_group("b");
        second.depends_on(Box::new(GroupDependency::new(first_gid)));
        man.add_reserved_group(second).unwrap();

        let mut cuids = CuidCounter::default();
        let mut registry = BtRegistry::new();
        assert!(man.activate_groups(&mut cuids, &mut registry).is_empty());
        assert_eq!(man.num_reserved(), 1);
    }

    #[test]
    fn test_pending_dependency_is_not_activatable() {
        let mut man = RequestGroupMan::new(5);
        let mut group = stream_group("a");
        let dep = ManualDependency::new();
        let flag = dep.flag();
        group.depends_on(Box::new(dep));
        man.add_reserved_group(group).unwrap();
        assert!(!man.has_activatable());

        flag.set(true);
        assert!(man.has_activatable());
    }

    #[test]
    fn test_failed_dependee_fails_dependent() {
        let mut man = RequestGroupMan::new(5);
        let a = man.add_reserved_group(stream_group("a")).unwrap();
        let mut second = stream_group("b");
        second.depends_on(Box::new(GroupDependency::new(a)));
        let b = man.add_reserved_group(second).unwrap();

        let mut cuids = CuidCounter::default();
        let mut registry = BtRegistry::new();
        man.activate_groups(&mut cuids, &mut registry);
        assert_eq!(man.num_active(), 1);
        assert_eq!(man.num_reserved(), 1);
        assert!(!man.has_activatable());

        let group = man.get_mut(a).unwrap();
        group.abort(&EngineError::abort(ErrorCode::NetworkProblem, "connection reset"));
        group.decrease_num_command();
        man.retire_groups(&mut registry);
        assert_eq!(
            man.download_result(a).unwrap().result,
            ErrorCode::NetworkProblem
        );
        assert!(man.has_activatable());

        assert!(man.activate_groups(&mut cuids, &mut registry).is_empty());
        assert!(man.download_finished());
        assert!(!man.has_activatable());
        let result = man.download_result(b).unwrap();
        assert_eq!(result.result, ErrorCode::NetworkProblem);
        assert_eq!(result.completed_length, 0);
    }

    #[test]
    fn test_remove_reserved_group_reports_removed() {
        let mut man = RequestGroupMan::new(1);
        let gid = man.add_reserved_group(stream_group("a")).unwrap();
        man.remove_group(gid, false).unwrap();
        assert!(man.download_finished());
        assert_eq!(man.download_result(gid).unwrap().result, ErrorCode::Removed);
        assert!(matches!(
            man.remove_group(gid, false),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_halt_flushes_reserved() {
        let mut man = RequestGroupMan::new(1);
        let a = man.add_reserved_group(stream_group("a")).unwrap();
        let b = man.add_reserved_group(stream_group("b")).unwrap();
        let mut cuids = CuidCounter::default();
        let mut registry = BtRegistry::new();
        man.activate_groups(&mut cuids, &mut registry);

        man.halt(false, HaltReason::ShutdownSignal);
        assert!(man.get(a).unwrap().is_halt_requested());
        assert_eq!(man.download_result(b).unwrap().result, ErrorCode::InProgress);
        assert!(man.add_reserved_group(stream_group("c")).is_err());
    }

    #[test]
    fn test_retire_waits_for_tasks() {
        let mut man = RequestGroupMan::new(1);
        let gid = man.add_reserved_group(stream_group("a")).unwrap();
        let mut cuids = CuidCounter::default();
        let mut registry = BtRegistry::new();
        man.activate_groups(&mut cuids, &mut registry);
        man.remove_group(gid, false).unwrap();

        man.retire_groups(&mut registry);
        assert_eq!(man.num_active(), 1);

        man.get_mut(gid).unwrap().decrease_num_command();
        man.retire_groups(&mut registry);
        assert!(man.download_finished());
        assert_eq!(man.download_result(gid).unwrap().result, ErrorCode::Removed);
    }
}
