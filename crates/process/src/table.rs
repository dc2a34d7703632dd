//! The fixed-size task table.

use alloc::vec::Vec;

use crate::{
    Pid, Slot, Task, TaskState,
    config::{COOPERATIVE_SLOTS, TASK_MAX},
};

pub(crate) struct TaskTable {
    tasks: Vec<Task>,
    next_pid: u32,
}

impl TaskTable {
    pub(crate) fn new() -> Self {
        let mut tasks = Vec::with_capacity(TASK_MAX);
        tasks.resize_with(TASK_MAX, Task::unused);
        Self { tasks, next_pid: 1 }
    }

    /// The occupied slot, or `None` if it is out of range or unused.
    pub(crate) fn get(&self, slot: Slot) -> Option<&Task> {
        self.tasks.get(slot).filter(|t| t.state != TaskState::Unused)
    }

    pub(crate) fn get_mut(&mut self, slot: Slot) -> Option<&mut Task> {
        self.tasks
            .get_mut(slot)
            .filter(|t| t.state != TaskState::Unused)
    }

    pub(crate) fn find_pid(&self, pid: Pid) -> Option<Slot> {
        self.iter()
            .find(|(_, t)| t.pid == Some(pid))
            .map(|(slot, _)| slot)
    }

    /// Occupied slots in index order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (Slot, &Task)> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.state != TaskState::Unused)
    }

    /// The lowest unused preemptive slot. Nothing is claimed until `occupy`.
    pub(crate) fn free_slot(&self) -> Option<Slot> {
        (COOPERATIVE_SLOTS..TASK_MAX).find(|&slot| self.tasks[slot].state == TaskState::Unused)
    }

    /// Stores `task` in `slot` under a fresh pid.
    pub(crate) fn occupy(&mut self, slot: Slot, mut task: Task) -> Pid {
        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;
        task.pid = Some(pid);
        if task.group.is_none() {
            task.group = Some(pid);
        }
        if task.session.is_none() {
            task.session = Some(pid);
        }
        self.tasks[slot] = task;
        pid
    }

    /// Returns the slot to the unused state. Freeing an unused slot does nothing.
    ///
    /// Resources must have been released already; anything still held is leaked.
    pub(crate) fn free(&mut self, slot: Slot) -> bool {
        let Some(task) = self.get(slot) else {
            return false;
        };
        if task.holds_resources() {
            log::warn!("freeing slot {} that still holds resources", slot);
        }
        self.tasks[slot] = Task::unused();
        true
    }
}
