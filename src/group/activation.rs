//! Group housekeeping task
//!
//! Runs once per turn while any group exists: retires finished or halted
//! groups, restarts stalled stream groups and activates reserved ones.

use std::time::Instant;

use tracing::debug;

use crate::engine::{EngineContext, Execute, TaskStatus};
use crate::error::Result;
use crate::types::Cuid;

#[derive(Debug)]
pub struct GroupActivationTask {
    cuid: Cuid,
}

impl GroupActivationTask {
    pub fn new(cuid: Cuid) -> Self {
        Self { cuid }
    }
}

impl Execute for GroupActivationTask {
    fn cuid(&self) -> Cuid {
        self.cuid
    }

    fn name(&self) -> &'static str {
        "GroupActivation"
    }

    fn execute(&mut self, cx: &mut EngineContext) -> Result<TaskStatus> {
        cx.groups.retire_groups(&mut cx.bt_registry);

        let max_tries = cx.config.max_resume_failure_tries;
        let resumed = cx.groups.resume_groups(&mut cx.cuids, max_tries);
        let activated = cx
            .groups
            .activate_groups(&mut cx.cuids, &mut cx.bt_registry);
        for task in resumed.into_iter().chain(activated) {
            cx.spawn(task);
        }

        if cx.groups.download_finished() {
            debug!("No download left, housekeeping stops");
            return Ok(TaskStatus::Finished);
        }
        Ok(TaskStatus::Continue)
    }

    fn deadline(&self, cx: &EngineContext) -> Option<Instant> {
        cx.groups.has_activatable().then(|| cx.now())
    }

    fn release(&mut self, cx: &mut EngineContext) {
        cx.activation_running = false;
        cx.reactor_mut().forget_task(self.cuid);
    }
}
