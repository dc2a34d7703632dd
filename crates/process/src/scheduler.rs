//! Priority round-robin scheduling on top of the cooperative boot slots.
//!
//! The cooperative slots share the boot stack and hand the CPU to each other
//! voluntarily through [`Kernel::enter_cooperative`]. To the timer they look like
//! one task: a tick may interrupt whichever of them is executing to run a ready
//! preemptive task, and control goes back to where they left off once no
//! preemptive task is ready.

use crate::{
    FramePointer, Kernel, Priority, Slot, TaskError, TaskState,
    config::{COOPERATIVE_SLOTS, TASK_MAX},
};

pub(crate) struct Scheduler {
    pub(crate) current: Slot,
    /// Last slot run at each priority level; the next scan starts after it.
    last_run: [Slot; Priority::LEVELS],
    /// Where cooperative execution was interrupted, and by which slot.
    cooperative_frame: Option<FramePointer>,
    cooperative_slot: Slot,
}

impl Scheduler {
    pub(crate) fn new(current: Slot) -> Self {
        Self {
            current,
            last_run: [TASK_MAX - 1; Priority::LEVELS],
            cooperative_frame: None,
            cooperative_slot: current,
        }
    }
}

impl Kernel {
    /// The timer path: charges the tick to the running task and returns the
    /// frame to resume.
    pub fn schedule(&mut self, frame: FramePointer) -> FramePointer {
        self.run_scheduler(frame, true)
    }

    /// Gives up the rest of the current quantum.
    pub fn yield_now(&mut self, frame: FramePointer) -> FramePointer {
        if let Some(task) = self.tasks.get_mut(self.scheduler.current) {
            task.remaining = 0;
        }
        self.run_scheduler(frame, false)
    }

    /// Runs the interrupt-return sequence: tick bookkeeping, scheduling, then
    /// signal delivery for the task about to resume. Delivery that stops or
    /// kills that task schedules again.
    pub fn interrupt_return(&mut self, frame: FramePointer, tick: bool) -> FramePointer {
        if tick {
            self.ticks += 1;
            self.tick_alarms();
        }
        let mut frame = self.run_scheduler(frame, tick);
        for _ in 0..TASK_MAX {
            let current = self.scheduler.current;
            if !self.deliver_signals(current, frame).must_reschedule() {
                break;
            }
            frame = self.run_scheduler(frame, false);
        }
        frame
    }

    /// Records that cooperative execution moved on to `slot`. The cooperative
    /// world switches its own stacks and calls this when it hands over.
    pub fn enter_cooperative(&mut self, slot: Slot) -> Result<(), TaskError> {
        if slot >= COOPERATIVE_SLOTS {
            return Err(TaskError::NotPermitted);
        }
        let current = self.scheduler.current;
        if !self.tasks.get(current).is_some_and(|t| t.cooperative) {
            return Err(TaskError::NotPermitted);
        }
        let target = self.tasks.get_mut(slot).ok_or(TaskError::NoSuchTask)?;
        if !matches!(target.state, TaskState::Ready | TaskState::Running) {
            return Err(TaskError::WouldBlock);
        }
        target.state = TaskState::Running;
        if current != slot {
            if let Some(task) = self.tasks.get_mut(current).filter(|t| t.state == TaskState::Running) {
                task.state = TaskState::Ready;
            }
            self.scheduler.current = slot;
            self.scheduler.cooperative_slot = slot;
        }
        Ok(())
    }

    pub(crate) fn run_scheduler(&mut self, frame: FramePointer, tick: bool) -> FramePointer {
        let current = self.scheduler.current;
        self.reap_zombies(current);
        self.wake_sleepers();

        let (cooperative, running, priority) = match self.tasks.get_mut(current) {
            Some(task) => {
                let running = task.state == TaskState::Running;
                if !task.cooperative && running && tick {
                    task.remaining = task.remaining.saturating_sub(1);
                }
                (task.cooperative, running, task.priority)
            }
            None => (false, false, Priority::Idle),
        };

        if running && !cooperative {
            let remaining = self.tasks.get(current).map_or(0, |t| t.remaining);
            if remaining > 0 && !self.ready_above(priority) {
                return frame;
            }
            if let Some(task) = self.tasks.get_mut(current) {
                task.state = TaskState::Ready;
            }
        }

        match self.select() {
            Some((next, _)) if next == current => {
                self.start_quantum(next);
                frame
            }
            Some((next, next_frame)) => self.switch_to(current, frame, next, next_frame),
            None if cooperative => frame,
            None => self.return_to_cooperative(current, frame),
        }
    }

    /// Frees the zombies nobody is going to collect and releases what the
    /// others still hold. The executing slot is left alone: its stack is in use.
    fn reap_zombies(&mut self, current: Slot) {
        for slot in 0..TASK_MAX {
            if slot == current {
                continue;
            }
            let Some(task) = self.tasks.get(slot).filter(|t| t.state == TaskState::Zombie) else {
                continue;
            };
            let orphaned = match task.parent {
                None => true,
                Some((parent, pid)) => self
                    .tasks
                    .get(parent)
                    .is_none_or(|p| p.pid != Some(pid) || !p.state.is_alive()),
            };
            let collect = orphaned || task.collected;
            if task.holds_resources() {
                self.release_resources(slot);
            }
            if collect {
                let pid = self.tasks.get(slot).and_then(|t| t.pid);
                self.tasks.free(slot);
                log::debug!("reaped {:?} from slot {}", pid, slot);
            }
        }
    }

    fn wake_sleepers(&mut self) {
        let now = self.ticks;
        for slot in 0..TASK_MAX {
            if let Some(task) = self
                .tasks
                .get_mut(slot)
                .filter(|t| t.state == TaskState::Sleeping && t.wake_tick <= now)
            {
                task.state = TaskState::Ready;
            }
        }
    }

    fn ready_above(&self, priority: Priority) -> bool {
        self.tasks
            .iter()
            .any(|(slot, t)| slot >= COOPERATIVE_SLOTS && t.state == TaskState::Ready && t.priority > priority)
    }

    /// The next preemptive task: highest level first, round-robin within it.
    fn select(&self) -> Option<(Slot, FramePointer)> {
        Priority::ALL.iter().rev().find_map(|&priority| {
            let after = self.scheduler.last_run[priority.level()];
            (1..=TASK_MAX)
                .map(|offset| (after + offset) % TASK_MAX)
                .filter(|&slot| slot >= COOPERATIVE_SLOTS)
                .find_map(|slot| {
                    let task = self.tasks.get(slot)?;
                    if task.state != TaskState::Ready
                        || task.priority != priority
                        || task.kernel_stack.is_none()
                    {
                        return None;
                    }
                    task.saved_frame.map(|frame| (slot, frame))
                })
        })
    }

    fn start_quantum(&mut self, slot: Slot) {
        if let Some(task) = self.tasks.get_mut(slot) {
            task.state = TaskState::Running;
            task.remaining = task.time_slice;
            self.scheduler.last_run[task.priority.level()] = slot;
        }
        self.scheduler.current = slot;
    }

    fn switch_to(
        &mut self,
        current: Slot,
        frame: FramePointer,
        next: Slot,
        next_frame: FramePointer,
    ) -> FramePointer {
        self.save_outgoing(current, frame);
        self.start_quantum(next);

        let Some(task) = self.tasks.get(next) else {
            return frame;
        };
        if let Some(stack) = task.kernel_stack {
            self.processor.set_kernel_stack(stack.top());
        }
        if let Some(base) = task.thread_pointer {
            self.processor.set_thread_pointer(base);
        }
        if let Some(space) = &task.space {
            let directory = space.directory(&self.mapper);
            if !directory.is_active() {
                // SAFETY: every directory shares the kernel mappings, so the code
                // and stack executing now stay mapped.
                unsafe { directory.activate() };
            }
        }
        trace_switch(current, next);
        next_frame
    }

    fn save_outgoing(&mut self, current: Slot, frame: FramePointer) {
        let Some(task) = self.tasks.get_mut(current) else {
            return;
        };
        if task.cooperative {
            if task.state == TaskState::Running {
                task.state = TaskState::Ready;
            }
            self.scheduler.cooperative_frame = Some(frame);
            self.scheduler.cooperative_slot = current;
        } else {
            task.saved_frame = Some(frame);
        }
    }

    /// Resumes cooperative execution where it was interrupted. With nothing to
    /// go back to, the interrupted context simply continues.
    fn return_to_cooperative(&mut self, current: Slot, frame: FramePointer) -> FramePointer {
        let Some(cooperative_frame) = self.scheduler.cooperative_frame.take() else {
            return frame;
        };
        self.save_outgoing(current, frame);

        let slot = self.scheduler.cooperative_slot;
        if let Some(task) = self.tasks.get_mut(slot) {
            task.state = TaskState::Running;
        }
        self.scheduler.current = slot;
        let directory = self.mapper.kernel_directory();
        if !directory.is_active() {
            // SAFETY: the kernel directory maps everything the kernel runs on.
            unsafe { directory.activate() };
        }
        trace_switch(current, slot);
        cooperative_frame
    }
}

#[cfg(feature = "detailed-logging")]
fn trace_switch(from: Slot, to: Slot) {
    log::trace!("switch slot {} -> {}", from, to);
}

#[cfg(not(feature = "detailed-logging"))]
fn trace_switch(_from: Slot, _to: Slot) {}
