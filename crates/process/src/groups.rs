//! Process groups and sessions for job control.

use crate::{Kernel, Pid, Slot, TaskError, config::TASK_MAX};

impl Kernel {
    /// Moves the task into group `pgid`, or into a group of its own when
    /// `pgid` is zero.
    pub fn set_group(&mut self, slot: Slot, pgid: u32) -> Result<(), TaskError> {
        let task = self.tasks.get_mut(slot).ok_or(TaskError::NoSuchTask)?;
        let own = task.pid.ok_or(TaskError::NoSuchTask)?;
        task.group = Some(if pgid == 0 { own } else { Pid::new(pgid) });
        Ok(())
    }

    pub fn get_group(&self, slot: Slot) -> Result<Pid, TaskError> {
        let task = self.tasks.get(slot).ok_or(TaskError::NoSuchTask)?;
        task.group.or(task.pid).ok_or(TaskError::NoSuchTask)
    }

    /// Starts a new session, and a new group in it, both led by the task.
    /// A group leader cannot do this.
    pub fn set_session(&mut self, slot: Slot) -> Result<Pid, TaskError> {
        let task = self.tasks.get_mut(slot).ok_or(TaskError::NoSuchTask)?;
        let pid = task.pid.ok_or(TaskError::NoSuchTask)?;
        if task.group == Some(pid) {
            return Err(TaskError::NotPermitted);
        }
        task.session = Some(pid);
        task.group = Some(pid);
        Ok(pid)
    }

    /// Raises `number` on every live member of group `pgid` that accepts it.
    /// Returns how many did.
    pub fn raise_group(&mut self, pgid: Pid, number: u8) -> Result<usize, TaskError> {
        let members: alloc::vec::Vec<Slot> = (0..TASK_MAX)
            .filter(|&slot| {
                self.tasks
                    .get(slot)
                    .is_some_and(|t| t.group == Some(pgid) && t.state.is_alive())
            })
            .collect();
        if members.is_empty() {
            return Err(TaskError::NoSuchTask);
        }

        let mut raised = 0;
        for slot in members {
            match self.raise(slot, number) {
                Ok(()) => raised += 1,
                Err(TaskError::NotPermitted) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(raised)
    }
}
