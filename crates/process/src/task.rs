//! Control blocks.

use alloc::{string::String, sync::Arc};
use core::fmt;

use mm::{PhysicalAddress, VirtualAddress};
use spin::Mutex;

use crate::{
    AddressSpace, FileTable, FramePointer, KernelStack, Signal, SignalState, config::DEFAULT_UMASK,
};

/// Index of a control block in the task table. Stable for the block's lifetime.
pub type Slot = usize;

/// Process id. Assigned from a monotonic counter when a slot is occupied.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    pub const fn new(pid: u32) -> Self {
        Self(pid)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({})", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Unused,
    Ready,
    Running,
    /// Waiting for an event some other subsystem signals with `unblock`.
    Blocked,
    /// Waiting for the tick count to reach the wake tick.
    Sleeping,
    Stopped,
    /// Terminated; keeps its exit status until the parent collects it.
    Zombie,
}

impl TaskState {
    /// True for states the scheduler may pick or that may pick up a signal.
    pub fn is_alive(self) -> bool {
        !matches!(self, Self::Unused | Self::Zombie)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Idle,
    Background,
    Normal,
    Realtime,
}

impl Priority {
    pub const LEVELS: usize = 4;

    pub const ALL: [Priority; Self::LEVELS] =
        [Self::Idle, Self::Background, Self::Normal, Self::Realtime];

    pub fn level(self) -> usize {
        self as usize
    }

    /// Ticks a task of this priority runs before it is preempted.
    pub fn default_time_slice(self) -> u32 {
        match self {
            Self::Idle => 1,
            Self::Background => 2,
            Self::Normal => 4,
            Self::Realtime => 8,
        }
    }
}

/// Privilege level the task's code runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Kernel,
    User,
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(Signal),
}

impl ExitStatus {
    /// The status word `wait` reports: the low byte of the exit code in bits
    /// 8..16, or the signal number in the low bits.
    pub fn wait_status(self) -> i32 {
        match self {
            Self::Exited(code) => (code & 0xff) << 8,
            Self::Signaled(signal) => i32::from(signal.number()),
        }
    }
}

/// One slot of the task table.
pub struct Task {
    pub(crate) name: String,
    pub(crate) pid: Option<Pid>,
    /// Slot and pid of the parent. The pid tells a reused slot apart.
    pub(crate) parent: Option<(Slot, Pid)>,
    pub(crate) group: Option<Pid>,
    pub(crate) session: Option<Pid>,
    pub(crate) umask: u16,

    pub(crate) state: TaskState,
    pub(crate) priority: Priority,
    pub(crate) time_slice: u32,
    pub(crate) remaining: u32,
    pub(crate) wake_tick: u64,

    /// Where the task's registers were saved the last time it stopped running.
    pub(crate) saved_frame: Option<FramePointer>,
    pub(crate) kernel_stack: Option<KernelStack>,
    pub(crate) user_stack: Option<PhysicalAddress>,
    pub(crate) thread_pointer: Option<VirtualAddress>,
    pub(crate) mode: Mode,
    pub(crate) cooperative: bool,
    pub(crate) killable: bool,

    pub(crate) space: Option<AddressSpace>,
    pub(crate) files: Option<Arc<Mutex<FileTable>>>,
    pub(crate) signals: SignalState,

    pub(crate) exit_status: Option<ExitStatus>,
    pub(crate) collected: bool,
}

impl Task {
    pub(crate) fn unused() -> Self {
        Self {
            name: String::new(),
            pid: None,
            parent: None,
            group: None,
            session: None,
            umask: DEFAULT_UMASK,
            state: TaskState::Unused,
            priority: Priority::Normal,
            time_slice: Priority::Normal.default_time_slice(),
            remaining: 0,
            wake_tick: 0,
            saved_frame: None,
            kernel_stack: None,
            user_stack: None,
            thread_pointer: None,
            mode: Mode::Kernel,
            cooperative: false,
            killable: true,
            space: None,
            files: None,
            signals: SignalState::new(),
            exit_status: None,
            collected: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_cooperative(&self) -> bool {
        self.cooperative
    }

    pub fn is_killable(&self) -> bool {
        self.killable
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    pub fn signals(&self) -> &SignalState {
        &self.signals
    }

    pub fn address_space(&self) -> Option<&AddressSpace> {
        self.space.as_ref()
    }

    pub fn kernel_stack(&self) -> Option<KernelStack> {
        self.kernel_stack
    }

    pub fn saved_frame(&self) -> Option<FramePointer> {
        self.saved_frame
    }

    /// True if the task owns resources a reaper still has to release.
    pub(crate) fn holds_resources(&self) -> bool {
        self.kernel_stack.is_some() || self.space.is_some() || self.files.is_some()
    }

    /// Bytes of memory charged to the task.
    pub fn memory_footprint(&self) -> usize {
        let stack = self.kernel_stack.map_or(0, |_| mm::PAGE_SIZE);
        let mapped = match &self.space {
            Some(AddressSpace::User(space)) => space.vmas().total_mapped(),
            _ => 0,
        };
        stack + mapped
    }
}

/// A read-only snapshot of a control block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub slot: Slot,
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub name: String,
    pub state: TaskState,
    pub priority: Priority,
    pub mode: Mode,
    pub group: Option<Pid>,
    pub session: Option<Pid>,
    pub memory: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_status_encoding() {
        assert_eq!(ExitStatus::Exited(3).wait_status(), 0x300);
        assert_eq!(ExitStatus::Exited(0x1ff).wait_status(), 0xff00);
        assert_eq!(ExitStatus::Signaled(Signal::KILL).wait_status(), 9);
    }

    #[test]
    fn priorities_are_ordered() {
        assert!(Priority::Realtime > Priority::Normal);
        assert_eq!(Priority::ALL[Priority::Background.level()], Priority::Background);
    }

    #[test]
    fn unused_slot_holds_nothing() {
        let task = Task::unused();
        assert_eq!(task.state(), TaskState::Unused);
        assert!(!task.holds_resources());
        assert_eq!(task.memory_footprint(), 0);
        assert!(!task.state().is_alive());
    }
}
