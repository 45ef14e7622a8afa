//! Group dependencies
//!
//! A reserved group with a pending dependency is never activated. A group
//! whose dependency failed leaves the arena without starting.

use std::cell::Cell;
use std::rc::Rc;

use super::man::DownloadResults;
use crate::error::ErrorCode;
use crate::types::GroupId;

/// Where a dependency stands against the recorded results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    Pending,
    Resolved,
    /// The group can never start; it is reported with this code
    Failed(ErrorCode),
}

/// Gate in front of a group's activation
pub trait Dependency {
    fn state(&self, results: &DownloadResults) -> DependencyState;
}

/// Waits for another group to finish successfully
#[derive(Debug, Clone, Copy)]
pub struct GroupDependency {
    dependee: GroupId,
}

impl GroupDependency {
    pub fn new(dependee: GroupId) -> Self {
        Self { dependee }
    }

    pub fn dependee(&self) -> GroupId {
        self.dependee
    }
}

impl Dependency for GroupDependency {
    fn state(&self, results: &DownloadResults) -> DependencyState {
        let Some(result) = results.get(self.dependee) else {
            return DependencyState::Pending;
        };
        match result.result {
            ErrorCode::Finished => DependencyState::Resolved,
            // A paused dependee may still be re-added and finish
            _ if result.paused => DependencyState::Pending,
            ErrorCode::InProgress => DependencyState::Failed(ErrorCode::UnknownError),
            code => DependencyState::Failed(code),
        }
    }
}

/// Resolved by flipping a shared flag from outside the engine
#[derive(Debug, Clone, Default)]
pub struct ManualDependency {
    flag: Rc<Cell<bool>>,
}

impl ManualDependency {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle the caller keeps to resolve the dependency later
    pub fn flag(&self) -> Rc<Cell<bool>> {
        Rc::clone(&self.flag)
    }
}

impl Dependency for ManualDependency {
    fn state(&self, _results: &DownloadResults) -> DependencyState {
        if self.flag.get() {
            DependencyState::Resolved
        } else {
            DependencyState::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::man::DownloadResult;

    fn result(gid: GroupId, code: ErrorCode) -> DownloadResult {
        DownloadResult {
            gid,
            result: code,
            paused: false,
            total_length: 0,
            completed_length: 0,
            followed_by: Vec::new(),
            belongs_to: None,
            uris: Vec::new(),
            path: None,
            finished_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_group_dependency_needs_success() {
        let dependee = GroupId::random();
        let dep = GroupDependency::new(dependee);
        let mut results = DownloadResults::default();
        assert_eq!(dep.state(&results), DependencyState::Pending);

        results.push(result(dependee, ErrorCode::Finished));
        assert_eq!(dep.state(&results), DependencyState::Resolved);
    }

    #[test]
    fn test_group_dependency_fails_with_dependee() {
        let dependee = GroupId::random();
        let dep = GroupDependency::new(dependee);

        let mut results = DownloadResults::default();
        results.push(result(dependee, ErrorCode::NetworkProblem));
        assert_eq!(
            dep.state(&results),
            DependencyState::Failed(ErrorCode::NetworkProblem)
        );

        let mut results = DownloadResults::default();
        results.push(result(dependee, ErrorCode::InProgress));
        assert_eq!(
            dep.state(&results),
            DependencyState::Failed(ErrorCode::UnknownError)
        );
    }

    #[test]
    fn test_paused_dependee_keeps_waiting() {
        let dependee = GroupId::random();
        let dep = GroupDependency::new(dependee);
        let mut paused = result(dependee, ErrorCode::InProgress);
        paused.paused = true;
        let mut results = DownloadResults::default();
        results.push(paused);
        assert_eq!(dep.state(&results), DependencyState::Pending);

        // The latest result for a gid wins
        results.push(result(dependee, ErrorCode::Finished));
        assert_eq!(dep.state(&results), DependencyState::Resolved);
    }

    #[test]
    fn test_manual_dependency() {
        let dep = ManualDependency::new();
        let flag = dep.flag();
        let results = DownloadResults::default();
        assert_eq!(dep.state(&results), DependencyState::Pending);
        flag.set(true);
        assert_eq!(dep.state(&results), DependencyState::Resolved);
    }
}
