//! The process core state and the operations other subsystems call.

use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};

use mm::{
    AddressSpaceMapper, FrameAllocator, PAGE_SIZE, PhysicalAddress, VirtualAddress, VmaFlags,
    VmaKind, VmaTable,
    layout::{USER_STACK_BASE, USER_STACK_PAGES},
};
use spin::Mutex;

use crate::{
    AddressSpace, FileTable, IpcHooks, KernelStack, Mode, Pid, Priority, Processor, SavedContext,
    Signal, Slot, Task, TaskError, TaskInfo, TaskState, UserSpace,
    config::{BOOT_SLOT, COOPERATIVE_SLOTS, FILE_TABLE_SIZE},
    scheduler::Scheduler,
    table::TaskTable,
};

/// No area of a user address space reaches above this.
const USER_STACK_TOP: usize = USER_STACK_BASE + USER_STACK_PAGES * PAGE_SIZE;

/// Values the embedding kernel supplies at start-up.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// User code that issues `sigreturn`; handlers return into it.
    pub signal_trampoline: VirtualAddress,
    /// Kernel code a thread's entry function returns into; it must call `exit`.
    pub thread_exit: VirtualAddress,
    pub cooperative_names: [&'static str; COOPERATIVE_SLOTS],
}

impl KernelConfig {
    pub fn new(signal_trampoline: VirtualAddress, thread_exit: VirtualAddress) -> Self {
        Self {
            signal_trampoline,
            thread_exit,
            cooperative_names: ["idle", "kernel", "compositor", "shell"],
        }
    }
}

pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) frames: Box<dyn FrameAllocator + Send>,
    pub(crate) mapper: AddressSpaceMapper,
    pub(crate) processor: Box<dyn Processor + Send>,
    pub(crate) ipc: Box<dyn IpcHooks + Send>,
    pub(crate) tasks: TaskTable,
    pub(crate) scheduler: Scheduler,
    pub(crate) ticks: u64,
}

impl Kernel {
    /// Creates the core with the cooperative slots occupied. The caller is
    /// running as [`BOOT_SLOT`].
    pub fn new(
        config: KernelConfig,
        frames: Box<dyn FrameAllocator + Send>,
        mapper: AddressSpaceMapper,
        processor: Box<dyn Processor + Send>,
        ipc: Box<dyn IpcHooks + Send>,
    ) -> Self {
        let mut tasks = TaskTable::new();
        for (slot, name) in config.cooperative_names.iter().enumerate() {
            let priority = if slot == 0 { Priority::Idle } else { Priority::Normal };
            let task = Task {
                name: String::from(*name),
                state: if slot == BOOT_SLOT {
                    TaskState::Running
                } else {
                    TaskState::Ready
                },
                priority,
                time_slice: priority.default_time_slice(),
                mode: Mode::Kernel,
                cooperative: true,
                killable: false,
                space: Some(AddressSpace::Kernel),
                ..Task::unused()
            };
            tasks.occupy(slot, task);
        }
        log::info!("process core ready with {} cooperative slots", COOPERATIVE_SLOTS);

        Self {
            config,
            frames,
            mapper,
            processor,
            ipc,
            tasks,
            scheduler: Scheduler::new(BOOT_SLOT),
            ticks: 0,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn mapper(&self) -> &AddressSpaceMapper {
        &self.mapper
    }

    pub fn frames(&self) -> &dyn FrameAllocator {
        &*self.frames
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// The slot whose context is executing.
    pub fn current(&self) -> Slot {
        self.scheduler.current
    }

    pub fn task(&self, slot: Slot) -> Option<&Task> {
        self.tasks.get(slot)
    }

    pub fn find_pid(&self, pid: Pid) -> Option<Slot> {
        self.tasks.find_pid(pid)
    }

    pub fn task_info(&self, slot: Slot) -> Option<TaskInfo> {
        let task = self.tasks.get(slot)?;
        Some(TaskInfo {
            slot,
            pid: task.pid?,
            parent: task.parent.map(|(_, pid)| pid),
            name: task.name.clone(),
            state: task.state,
            priority: task.priority,
            mode: task.mode,
            group: task.group,
            session: task.session,
            memory: task.memory_footprint(),
        })
    }

    /// Snapshots of every occupied slot.
    pub fn tasks(&self) -> impl Iterator<Item = TaskInfo> + '_ {
        self.tasks.iter().filter_map(|(slot, _)| self.task_info(slot))
    }

    /// Fields a new task inherits from the one creating it.
    fn inherit(&self, name: &str, mode: Mode, killable: bool) -> Task {
        let creator = self.scheduler.current;
        let parent = self.tasks.get(creator);
        Task {
            name: String::from(name),
            parent: parent.and_then(|p| Some((creator, p.pid?))),
            group: parent.and_then(|p| p.group),
            session: parent.and_then(|p| p.session),
            umask: parent.map_or(crate::config::DEFAULT_UMASK, |p| p.umask),
            state: TaskState::Ready,
            mode,
            killable,
            ..Task::unused()
        }
    }

    /// Starts a preemptive kernel thread at `entry`. Returning from `entry`
    /// lands in the configured thread-exit trampoline.
    pub fn create_thread(
        &mut self,
        name: &str,
        entry: VirtualAddress,
        killable: bool,
    ) -> Result<Pid, TaskError> {
        let slot = self.tasks.free_slot().ok_or(TaskError::NoFreeSlot)?;
        let stack = KernelStack::allocate(&mut *self.frames)?;
        let ret = stack.push_return_address(self.config.thread_exit);
        let frame = stack.push_context(SavedContext::kernel(entry, ret), ret);

        let task = Task {
            saved_frame: Some(frame),
            kernel_stack: Some(stack),
            space: Some(AddressSpace::Kernel),
            ..self.inherit(name, Mode::Kernel, killable)
        };
        let pid = self.tasks.occupy(slot, task);
        log::debug!("created kernel thread {} '{}' in slot {}", pid, name, slot);
        Ok(pid)
    }

    /// Starts a ring-3 task at `entry` in a fresh address space with a one-page
    /// stack at [`USER_STACK_BASE`] and an empty file table.
    pub fn create_user_thread(
        &mut self,
        name: &str,
        entry: VirtualAddress,
        killable: bool,
    ) -> Result<Pid, TaskError> {
        let slot = self.tasks.free_slot().ok_or(TaskError::NoFreeSlot)?;
        let stack = KernelStack::allocate(&mut *self.frames)?;
        let (space, user_stack) = match self.build_user_space() {
            Ok(built) => built,
            Err(e) => {
                stack.free(&mut *self.frames);
                return Err(e);
            }
        };

        let top = VirtualAddress::new(USER_STACK_TOP);
        let frame = stack.push_context(SavedContext::user(entry, top), stack.top());
        let task = Task {
            saved_frame: Some(frame),
            kernel_stack: Some(stack),
            user_stack: Some(user_stack),
            space: Some(AddressSpace::User(Arc::new(space))),
            files: Some(Arc::new(Mutex::new(FileTable::new(FILE_TABLE_SIZE)))),
            ..self.inherit(name, Mode::User, killable)
        };
        let pid = self.tasks.occupy(slot, task);
        log::debug!("created user task {} '{}' in slot {}", pid, name, slot);
        Ok(pid)
    }

    /// A new directory with only the user stack mapped. Returns the stack's
    /// lowest frame alongside it.
    fn build_user_space(&mut self) -> Result<(UserSpace, PhysicalAddress), TaskError> {
        let directory = self.mapper.create_user_directory(&mut *self.frames)?;
        let space = UserSpace::new(directory, VmaTable::new());
        match self.populate_stack(&space) {
            Ok(frame) => Ok((space, frame)),
            Err(e) => {
                space.tear_down(&self.mapper, &mut *self.frames);
                Err(e)
            }
        }
    }

    fn populate_stack(&mut self, space: &UserSpace) -> Result<PhysicalAddress, TaskError> {
        let flags = VmaFlags::READ | VmaFlags::WRITE | VmaFlags::GROWSDOWN;
        space.vmas().insert(
            VirtualAddress::new(USER_STACK_BASE),
            VirtualAddress::new(USER_STACK_TOP),
            flags,
            VmaKind::Stack,
        )?;
        let mut lowest = None;
        for page in (USER_STACK_BASE..USER_STACK_TOP).step_by(PAGE_SIZE) {
            let frame = self.mapper.map_zeroed(
                space.directory(),
                VirtualAddress::new(page),
                flags.page_flags(),
                &mut *self.frames,
            )?;
            lowest.get_or_insert(frame);
        }
        lowest.ok_or(TaskError::OutOfFrames)
    }

    /// The user address space of the task in `slot`.
    pub(crate) fn user_space(&self, slot: Slot) -> Result<Arc<UserSpace>, TaskError> {
        let task = self.tasks.get(slot).ok_or(TaskError::NoSuchTask)?;
        task.space
            .as_ref()
            .and_then(AddressSpace::user)
            .cloned()
            .ok_or(TaskError::NotPermitted)
    }

    pub fn set_priority(&mut self, slot: Slot, priority: Priority) -> Result<(), TaskError> {
        let task = self.tasks.get_mut(slot).ok_or(TaskError::NoSuchTask)?;
        task.priority = priority;
        task.time_slice = priority.default_time_slice();
        Ok(())
    }

    /// Sets the quantum in ticks. Zero is raised to one.
    pub fn set_time_slice(&mut self, slot: Slot, ticks: u32) -> Result<(), TaskError> {
        let task = self.tasks.get_mut(slot).ok_or(TaskError::NoSuchTask)?;
        task.time_slice = ticks.max(1);
        Ok(())
    }

    /// Sets the thread-local storage base, installed whenever the task is
    /// switched in.
    pub fn set_thread_pointer(&mut self, slot: Slot, base: VirtualAddress) -> Result<(), TaskError> {
        let task = self.tasks.get_mut(slot).ok_or(TaskError::NoSuchTask)?;
        task.thread_pointer = Some(base);
        if slot == self.scheduler.current {
            self.processor.set_thread_pointer(base);
        }
        Ok(())
    }

    pub fn set_umask(&mut self, slot: Slot, umask: u16) -> Result<u16, TaskError> {
        let task = self.tasks.get_mut(slot).ok_or(TaskError::NoSuchTask)?;
        Ok(core::mem::replace(&mut task.umask, umask & 0o777))
    }

    /// The file table of the task, shared with its threads.
    pub fn files(&self, slot: Slot) -> Option<Arc<Mutex<FileTable>>> {
        self.tasks.get(slot)?.files.clone()
    }

    /// Takes the task off the CPU until [`Kernel::unblock`]. The switch happens
    /// at the next scheduling point.
    pub fn block(&mut self, slot: Slot) -> Result<(), TaskError> {
        let task = self.tasks.get_mut(slot).ok_or(TaskError::NoSuchTask)?;
        if matches!(task.state, TaskState::Ready | TaskState::Running) {
            task.state = TaskState::Blocked;
        }
        Ok(())
    }

    /// Makes a blocked or sleeping task ready. Any other state is left alone.
    pub fn unblock(&mut self, slot: Slot) -> Result<(), TaskError> {
        let task = self.tasks.get_mut(slot).ok_or(TaskError::NoSuchTask)?;
        if matches!(task.state, TaskState::Blocked | TaskState::Sleeping) {
            task.state = TaskState::Ready;
        }
        Ok(())
    }

    /// Puts the task to sleep until `ticks` more timer ticks have passed.
    pub fn sleep(&mut self, slot: Slot, ticks: u64) -> Result<(), TaskError> {
        let now = self.ticks;
        let task = self.tasks.get_mut(slot).ok_or(TaskError::NoSuchTask)?;
        if matches!(task.state, TaskState::Ready | TaskState::Running) {
            task.wake_tick = now.saturating_add(ticks);
            task.state = TaskState::Sleeping;
        }
        Ok(())
    }

    /// Maps `length` bytes of zeroed anonymous memory into the task and
    /// returns where.
    pub fn map_anonymous(
        &mut self,
        slot: Slot,
        length: usize,
        flags: VmaFlags,
    ) -> Result<VirtualAddress, TaskError> {
        let space = self.user_space(slot)?;
        let mut vmas = space.vmas();
        let start = vmas.find_free(length).ok_or(TaskError::NoAddressSpace)?;
        let end = VirtualAddress::new(start.as_usize() + length.next_multiple_of(PAGE_SIZE));
        let flags = flags | VmaFlags::ANON;
        vmas.insert(start, end, flags, VmaKind::Anonymous)?;

        for addr in (start.as_usize()..end.as_usize()).step_by(PAGE_SIZE) {
            let mapped = self.mapper.map_zeroed(
                space.directory(),
                VirtualAddress::new(addr),
                flags.page_flags(),
                &mut *self.frames,
            );
            if let Err(e) = mapped {
                self.mapper
                    .release_range(space.directory(), start, end, &mut *self.frames);
                // Removing a whole area never needs a spare slot.
                let _ = vmas.remove(start, end);
                return Err(e.into());
            }
        }
        Ok(start)
    }

    /// Unmaps `[start, start + length)` from the task. Returns the pages no
    /// longer covered by any area.
    pub fn unmap(&mut self, slot: Slot, start: VirtualAddress, length: usize) -> Result<usize, TaskError> {
        if !start.is_page_aligned() {
            return Err(TaskError::BadAddress);
        }
        let end = start
            .checked_add(length)
            .filter(|end| end.as_usize() <= USER_STACK_TOP)
            .ok_or(TaskError::BadAddress)?;
        let space = self.user_space(slot)?;
        let mut vmas = space.vmas();
        let covered: Vec<(VirtualAddress, VirtualAddress)> = vmas
            .iter()
            .filter(|vma| vma.overlaps(start, end))
            .map(|vma| (vma.start.max(start), vma.end.min(end)))
            .collect();
        let removed = vmas.remove(start, end)?;
        for (from, to) in covered {
            self.mapper
                .release_range(space.directory(), from, to, &mut *self.frames);
        }
        Ok(removed)
    }

    /// Copies bytes out of the task's memory.
    pub fn read_user(&self, slot: Slot, addr: VirtualAddress, buffer: &mut [u8]) -> Result<(), TaskError> {
        let space = self.user_space(slot)?;
        Ok(self.mapper.read_user(space.directory(), addr, buffer)?)
    }

    /// Copies bytes into the task's memory, breaking copy-on-write sharing.
    pub fn write_user(&mut self, slot: Slot, addr: VirtualAddress, data: &[u8]) -> Result<(), TaskError> {
        let space = self.user_space(slot)?;
        Ok(self
            .mapper
            .write_user(space.directory(), addr, data, &mut *self.frames)?)
    }

    /// Handles a page fault the task took at `addr`.
    ///
    /// A write to a copy-on-write page inside a writable area gets a private
    /// copy. Any other fault is an access violation and raises `SEGV`.
    pub fn handle_page_fault(
        &mut self,
        slot: Slot,
        addr: VirtualAddress,
        write: bool,
    ) -> Result<(), TaskError> {
        let space = self.user_space(slot)?;
        let vma = space.vmas().find(addr).copied();
        let allowed = vma.is_some_and(|v| !write || v.flags.contains(VmaFlags::WRITE));
        let resolved = if !allowed {
            Err(mm::MapError::NotMapped)
        } else if write {
            self.mapper
                .resolve_copy_on_write(space.directory(), addr, &mut *self.frames)
                .map(|_| ())
        } else {
            space
                .directory()
                .translate(addr)
                .map(|_| ())
                .ok_or(mm::MapError::NotMapped)
        };

        match resolved {
            Ok(()) => Ok(()),
            Err(mm::MapError::OutOfFrames) => Err(TaskError::OutOfFrames),
            Err(e) => {
                log::debug!("slot {}: fault at {} ({}): {}", slot, addr, if write { "write" } else { "read" }, e);
                self.post(slot, Signal::SEGV);
                Err(TaskError::BadAddress)
            }
        }
    }
}
