//! Termination, stopping and collecting children.

use crate::{
    ExitStatus, Kernel, Pid, Signal, SignalSet, Slot, TaskError, TaskState,
    address_space,
    config::TASK_MAX,
    signal::Disposition,
};

/// Which children `wait` looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Any,
    Pid(Pid),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitOptions {
    /// Fail with `WouldBlock` instead of blocking the caller.
    pub no_hang: bool,
}

impl Kernel {
    /// Terminates the current task with exit code `code`.
    pub fn exit(&mut self, code: i32) {
        self.terminate(self.scheduler.current, ExitStatus::Exited(code));
    }

    /// Makes the task a zombie holding `status`.
    ///
    /// Its children are orphaned and its parent gets `CHLD`. Unless the task is
    /// the one executing, its stack, address space and files are released at
    /// once. The executing task keeps them until the scheduler has moved on.
    pub(crate) fn terminate(&mut self, slot: Slot, status: ExitStatus) {
        let Some(task) = self.tasks.get_mut(slot).filter(|t| t.state.is_alive()) else {
            return;
        };
        task.state = TaskState::Zombie;
        task.exit_status = Some(status);
        task.signals.clear_pending(SignalSet::from_bits(u64::MAX));
        task.signals.set_alarm(0);
        let pid = task.pid;
        log::debug!("slot {} ({:?}) terminated: {:?}", slot, pid, status);

        self.orphan_children(slot);
        if slot != self.scheduler.current {
            self.release_resources(slot);
        }
        self.notify_parent(slot);
    }

    /// Releases everything a task owns except its slot.
    pub(crate) fn release_resources(&mut self, slot: Slot) {
        let Some(task) = self.tasks.get_mut(slot) else {
            return;
        };
        let stack = task.kernel_stack.take();
        let space = task.space.take();
        let files = task.files.take();
        task.user_stack = None;
        task.saved_frame = None;
        let pid = task.pid;

        if let Some(stack) = stack {
            stack.free(&mut *self.frames);
        }
        if let Some(space) = space {
            address_space::release(space, &self.mapper, &mut *self.frames);
        }
        drop(files);
        if let Some(pid) = pid {
            self.ipc.release_task(pid);
        }
    }

    fn orphan_children(&mut self, slot: Slot) {
        let Some(pid) = self.tasks.get(slot).and_then(|t| t.pid) else {
            return;
        };
        for child in 0..TASK_MAX {
            if let Some(task) = self
                .tasks
                .get_mut(child)
                .filter(|t| t.parent == Some((slot, pid)))
            {
                task.parent = None;
            }
        }
    }

    /// Raises `CHLD` on the parent and wakes it if it is blocked, waiting.
    pub(crate) fn notify_parent(&mut self, slot: Slot) {
        let Some((parent, pid)) = self.tasks.get(slot).and_then(|t| t.parent) else {
            return;
        };
        if !self
            .tasks
            .get(parent)
            .is_some_and(|p| p.pid == Some(pid) && p.state.is_alive())
        {
            return;
        }
        self.post(parent, Signal::CHLD);
        if let Some(task) = self
            .tasks
            .get_mut(parent)
            .filter(|t| t.state == TaskState::Blocked)
        {
            task.state = TaskState::Ready;
        }
    }

    pub(crate) fn stop(&mut self, slot: Slot) {
        let Some(task) = self
            .tasks
            .get_mut(slot)
            .filter(|t| t.state.is_alive() && t.state != TaskState::Stopped)
        else {
            return;
        };
        task.state = TaskState::Stopped;
        log::debug!("slot {} stopped", slot);
        self.notify_parent(slot);
    }

    /// Continues a stopped task and discards pending stop signals. A handler for
    /// `CONT` still runs afterwards.
    pub(crate) fn resume(&mut self, slot: Slot) {
        let Some(task) = self.tasks.get_mut(slot).filter(|t| t.state.is_alive()) else {
            return;
        };
        task.signals.clear_pending(SignalSet::STOP_CLASS);
        if matches!(task.signals.disposition(Signal::CONT), Disposition::Handler(_)) {
            task.signals.set_pending(Signal::CONT);
            if !task.signals.blocked().contains(Signal::CONT)
                && matches!(task.state, TaskState::Blocked | TaskState::Sleeping)
            {
                task.state = TaskState::Ready;
            }
        }
        if task.state != TaskState::Stopped {
            return;
        }
        task.state = TaskState::Ready;
        log::debug!("slot {} continued", slot);
        self.notify_parent(slot);
    }

    /// Collects a terminated child of `parent`, returning its pid and wait
    /// status.
    ///
    /// If a matching child exists but none has terminated, the call fails with
    /// `WouldBlock`; without `no_hang` the parent is also blocked, to be woken
    /// when a child terminates.
    pub fn wait(
        &mut self,
        parent: Slot,
        target: WaitTarget,
        options: WaitOptions,
    ) -> Result<(Pid, i32), TaskError> {
        let parent_pid = self
            .tasks
            .get(parent)
            .and_then(|t| t.pid)
            .ok_or(TaskError::NoSuchTask)?;

        let mut found = false;
        for slot in 0..TASK_MAX {
            let Some(child) = self.tasks.get_mut(slot) else {
                continue;
            };
            let Some(pid) = child.pid else {
                continue;
            };
            if child.parent != Some((parent, parent_pid)) || child.collected {
                continue;
            }
            if matches!(target, WaitTarget::Pid(wanted) if wanted != pid) {
                continue;
            }
            found = true;
            if let (TaskState::Zombie, Some(status)) = (child.state, child.exit_status) {
                child.collected = true;
                log::debug!("slot {} collected child {}", parent, pid);
                return Ok((pid, status.wait_status()));
            }
        }

        if !found {
            return Err(TaskError::NoChildren);
        }
        if !options.no_hang {
            self.block(parent)?;
        }
        Err(TaskError::WouldBlock)
    }
}
