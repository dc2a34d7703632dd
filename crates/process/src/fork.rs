//! Duplicating a task: fork and clone.

use alloc::sync::Arc;

use bitflags::bitflags;
use mm::VirtualAddress;
use spin::Mutex;

use crate::{
    AddressSpace, FramePointer, Kernel, KernelStack, Mode, Pid, Slot, Task, TaskError, TaskState,
    UserSpace,
};

bitflags! {
    /// What a child shares with its parent rather than copies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloneFlags: u32 {
        /// Share the address space, as a thread does. Without it the child gets
        /// a copy-on-write copy.
        const VM = 1 << 0;
        /// Share the file table instead of copying it.
        const FILES = 1 << 1;
        /// Accepted for compatibility. Dispositions are always copied.
        const SIGHAND = 1 << 2;
    }
}

impl Kernel {
    /// Creates a child of the user task in `parent`, whose registers are saved
    /// at `frame`. Returns the child's pid.
    ///
    /// The child resumes at the same instruction with a return value of zero,
    /// on `stack` if one is given and on the parent's stack pointer otherwise.
    ///
    /// A copy-on-write duplication that fails part way may leave ranges of the
    /// parent read-only and copy-on-write. That is harmless: the next write
    /// simply takes a fault and gets its private copy back.
    pub fn duplicate(
        &mut self,
        parent: Slot,
        flags: CloneFlags,
        frame: FramePointer,
        stack: Option<VirtualAddress>,
    ) -> Result<Pid, TaskError> {
        let source = self.tasks.get(parent).ok_or(TaskError::NoSuchTask)?;
        if source.mode != Mode::User || !source.state.is_alive() {
            return Err(TaskError::NotPermitted);
        }
        let template = Task {
            name: source.name.clone(),
            parent: source.pid.map(|pid| (parent, pid)),
            group: source.group,
            session: source.session,
            umask: source.umask,
            state: TaskState::Ready,
            priority: source.priority,
            time_slice: source.time_slice,
            user_stack: source.user_stack,
            thread_pointer: source.thread_pointer,
            mode: Mode::User,
            killable: source.killable,
            signals: source.signals.for_child(),
            ..Task::unused()
        };
        let parent_files = source.files.clone();
        let parent_space = self.user_space(parent)?;

        let slot = self.tasks.free_slot().ok_or(TaskError::NoFreeSlot)?;
        let kernel_stack = KernelStack::allocate(&mut *self.frames)?;
        let space = if flags.contains(CloneFlags::VM) {
            Ok(parent_space)
        } else {
            self.copy_space(&parent_space).map(Arc::new)
        };
        let space = match space {
            Ok(space) => space,
            Err(e) => {
                kernel_stack.free(&mut *self.frames);
                log::debug!("fork of slot {} failed: {}", parent, e);
                return Err(e);
            }
        };

        // SAFETY: the frame belongs to the parent, which is not running while it
        // is in the kernel.
        let mut context = unsafe { *frame.context() };
        context.set_return_value(0);
        if let Some(stack) = stack {
            context.rsp = stack.as_u64();
        }
        let child_frame = kernel_stack.push_context(context, kernel_stack.top());

        let files = parent_files.map(|files| {
            if flags.contains(CloneFlags::FILES) {
                files
            } else {
                let copy = files.lock().duplicate(&mut *self.ipc);
                Arc::new(Mutex::new(copy))
            }
        });
        let child = Task {
            saved_frame: Some(child_frame),
            kernel_stack: Some(kernel_stack),
            space: Some(AddressSpace::User(space)),
            files,
            ..template
        };

        let pid = self.tasks.occupy(slot, child);
        log::debug!(
            "slot {} {} into slot {} as {}",
            parent,
            if flags.contains(CloneFlags::VM) { "cloned" } else { "forked" },
            slot,
            pid
        );
        Ok(pid)
    }

    /// A new address space holding the parent's areas, every present page shared
    /// copy-on-write. The parent's translations are flushed once at the end.
    fn copy_space(&mut self, parent: &UserSpace) -> Result<UserSpace, TaskError> {
        let directory = self.mapper.create_user_directory(&mut *self.frames)?;
        let vmas = parent.vmas().clone();
        let mut result = Ok(());
        for vma in vmas.iter() {
            result = self
                .mapper
                .share_copy_on_write(
                    parent.directory(),
                    directory,
                    vma.start,
                    vma.end,
                    &mut *self.frames,
                )
                .map(|_| ());
            if result.is_err() {
                break;
            }
        }
        self.mapper.flush(parent.directory());

        let child = UserSpace::new(directory, vmas);
        match result {
            Ok(()) => Ok(child),
            Err(e) => {
                child.tear_down(&self.mapper, &mut *self.frames);
                Err(e.into())
            }
        }
    }
}
