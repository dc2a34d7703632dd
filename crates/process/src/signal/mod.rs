//! Signals: numbering, per-task state and raising.
//!
//! Raising a signal either acts at once (kill, stop, continue, and anything
//! aimed at a kernel task) or marks it pending. Pending signals are delivered by
//! [`Kernel::deliver_signals`] just before the task returns to ring 3.

mod delivery;

use core::fmt;

use mm::VirtualAddress;

use crate::{
    ExitStatus, Kernel, Mode, Slot, TaskError, TaskState,
    config::{NSIG, TASK_MAX},
};

pub use delivery::{Delivery, SIGNAL_FRAME_SIZE, SignalContext};

/// A signal number in `1..NSIG`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signal(u8);

impl Signal {
    pub const HUP: Self = Self(1);
    pub const INT: Self = Self(2);
    pub const QUIT: Self = Self(3);
    pub const ILL: Self = Self(4);
    pub const TRAP: Self = Self(5);
    pub const ABRT: Self = Self(6);
    pub const BUS: Self = Self(7);
    pub const FPE: Self = Self(8);
    pub const KILL: Self = Self(9);
    pub const USR1: Self = Self(10);
    pub const SEGV: Self = Self(11);
    pub const USR2: Self = Self(12);
    pub const PIPE: Self = Self(13);
    pub const ALRM: Self = Self(14);
    pub const TERM: Self = Self(15);
    pub const CHLD: Self = Self(17);
    pub const CONT: Self = Self(18);
    pub const STOP: Self = Self(19);
    pub const TSTP: Self = Self(20);
    pub const TTIN: Self = Self(21);
    pub const TTOU: Self = Self(22);

    pub const fn new(number: u8) -> Option<Self> {
        if number >= 1 && (number as usize) < NSIG {
            Some(Self(number))
        } else {
            None
        }
    }

    pub const fn number(self) -> u8 {
        self.0
    }

    /// Kill and stop can be neither caught, ignored nor blocked.
    pub fn is_catchable(self) -> bool {
        self != Self::KILL && self != Self::STOP
    }

    pub fn default_action(self) -> DefaultAction {
        match self {
            Self::HUP | Self::INT | Self::QUIT | Self::ILL | Self::TRAP | Self::ABRT
            | Self::BUS | Self::FPE | Self::KILL | Self::USR1 | Self::SEGV | Self::USR2
            | Self::PIPE | Self::ALRM | Self::TERM => DefaultAction::Terminate,
            Self::STOP | Self::TSTP | Self::TTIN | Self::TTOU => DefaultAction::Stop,
            Self::CONT => DefaultAction::Continue,
            _ => DefaultAction::Ignore,
        }
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signal({})", self.0)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    Stop,
    Continue,
    Ignore,
}

/// What a task has asked to happen when a signal arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Default,
    Ignore,
    /// Run the user function at this address.
    Handler(VirtualAddress),
}

/// A set of signals as a 64-bit mask, bit `n` for signal `n`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SignalSet(u64);

impl SignalSet {
    pub const EMPTY: Self = Self(0);

    /// Signals that stop a task by default.
    pub const STOP_CLASS: Self = Self(
        1 << Signal::STOP.0 | 1 << Signal::TSTP.0 | 1 << Signal::TTIN.0 | 1 << Signal::TTOU.0,
    );

    const UNCATCHABLE: Self = Self(1 << Signal::KILL.0 | 1 << Signal::STOP.0);

    /// Bit 0 does not name a signal and is dropped.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits & !1)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, signal: Signal) -> bool {
        self.0 & (1 << signal.0) != 0
    }

    pub fn insert(&mut self, signal: Signal) {
        self.0 |= 1 << signal.0;
    }

    pub fn remove(&mut self, signal: Signal) {
        self.0 &= !(1 << signal.0);
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// The lowest-numbered signal in the set.
    pub fn lowest(self) -> Option<Signal> {
        (self.0 != 0).then(|| Signal(self.0.trailing_zeros() as u8))
    }
}

impl From<Signal> for SignalSet {
    fn from(signal: Signal) -> Self {
        Self(1 << signal.0)
    }
}

impl fmt::Debug for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignalSet({:#x})", self.0)
    }
}

/// How `set_signal_mask` combines the given set with the current mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskHow {
    Block,
    Unblock,
    SetMask,
}

/// Per-task signal state.
#[derive(Clone)]
pub struct SignalState {
    handlers: [Disposition; NSIG],
    pending: SignalSet,
    blocked: SignalSet,
    in_handler: bool,
    /// Ticks until `ALRM` is raised; zero when no alarm is set.
    alarm: u64,
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalState {
    pub const fn new() -> Self {
        Self {
            handlers: [Disposition::Default; NSIG],
            pending: SignalSet::EMPTY,
            blocked: SignalSet::EMPTY,
            in_handler: false,
            alarm: 0,
        }
    }

    /// The state a forked child starts with: the same dispositions and mask,
    /// nothing pending, not in a handler and no alarm.
    pub fn for_child(&self) -> Self {
        Self {
            handlers: self.handlers,
            blocked: self.blocked,
            ..Self::new()
        }
    }

    pub fn disposition(&self, signal: Signal) -> Disposition {
        self.handlers[usize::from(signal.0)]
    }

    pub fn pending(&self) -> SignalSet {
        self.pending
    }

    pub fn blocked(&self) -> SignalSet {
        self.blocked
    }

    pub fn in_handler(&self) -> bool {
        self.in_handler
    }

    pub fn alarm(&self) -> u64 {
        self.alarm
    }

    /// The lowest pending signal that is not blocked.
    pub fn next_deliverable(&self) -> Option<Signal> {
        self.pending.difference(self.blocked).lowest()
    }

    pub(crate) fn set_disposition(&mut self, signal: Signal, disposition: Disposition) -> Disposition {
        core::mem::replace(&mut self.handlers[usize::from(signal.0)], disposition)
    }

    pub(crate) fn set_pending(&mut self, signal: Signal) {
        self.pending.insert(signal);
    }

    pub(crate) fn take_pending(&mut self, signal: Signal) {
        self.pending.remove(signal);
    }

    pub(crate) fn clear_pending(&mut self, set: SignalSet) {
        self.pending = self.pending.difference(set);
    }

    pub(crate) fn set_in_handler(&mut self, in_handler: bool) {
        self.in_handler = in_handler;
    }

    pub(crate) fn set_alarm(&mut self, ticks: u64) -> u64 {
        core::mem::replace(&mut self.alarm, ticks)
    }

    /// Counts the alarm down by one tick. Returns true when it expires.
    pub(crate) fn tick_alarm(&mut self) -> bool {
        if self.alarm == 0 {
            return false;
        }
        self.alarm -= 1;
        self.alarm == 0
    }

    /// Applies `how` and returns the previous mask. Kill and stop are never
    /// blocked.
    pub(crate) fn apply_mask(&mut self, how: MaskHow, set: SignalSet) -> SignalSet {
        let old = self.blocked;
        self.blocked = match how {
            MaskHow::Block => self.blocked.union(set),
            MaskHow::Unblock => self.blocked.difference(set),
            MaskHow::SetMask => set,
        }
        .difference(SignalSet::UNCATCHABLE);
        old
    }
}

impl Kernel {
    /// Raises signal `number` on the task in `slot`.
    ///
    /// Zero only checks that the task exists. Raising a signal on a task that
    /// has already terminated succeeds and does nothing.
    pub fn raise(&mut self, slot: Slot, number: u8) -> Result<(), TaskError> {
        let task = self.tasks.get(slot).ok_or(TaskError::NoSuchTask)?;
        if number == 0 {
            return Ok(());
        }
        let signal = Signal::new(number).ok_or(TaskError::InvalidSignal)?;
        if !task.killable {
            return Err(TaskError::NotPermitted);
        }
        if task.state == TaskState::Zombie {
            return Ok(());
        }
        self.post(slot, signal);
        Ok(())
    }

    pub fn raise_pid(&mut self, pid: crate::Pid, number: u8) -> Result<(), TaskError> {
        let slot = self.tasks.find_pid(pid).ok_or(TaskError::NoSuchTask)?;
        self.raise(slot, number)
    }

    /// Sends `signal` without permission checks.
    pub(crate) fn post(&mut self, slot: Slot, signal: Signal) {
        let Some(task) = self.tasks.get_mut(slot).filter(|t| t.state.is_alive()) else {
            return;
        };
        trace_signal("raise", slot, signal);

        match signal {
            Signal::KILL => self.terminate(slot, ExitStatus::Signaled(signal)),
            Signal::STOP => self.stop(slot),
            Signal::CONT => self.resume(slot),
            _ if task.mode == Mode::Kernel => {
                // Kernel tasks cannot run handlers: settle the signal right here.
                if task.signals.disposition(signal) == Disposition::Ignore {
                    return;
                }
                match signal.default_action() {
                    DefaultAction::Terminate => self.terminate(slot, ExitStatus::Signaled(signal)),
                    DefaultAction::Stop => self.stop(slot),
                    DefaultAction::Continue | DefaultAction::Ignore => {}
                }
            }
            _ => {
                task.signals.set_pending(signal);
                if !task.signals.blocked().contains(signal)
                    && matches!(task.state, TaskState::Blocked | TaskState::Sleeping)
                {
                    task.state = TaskState::Ready;
                }
            }
        }
    }

    /// Sets the disposition of `number` for the task, returning the previous
    /// one. Kill and stop keep their default and report it.
    pub fn set_handler(
        &mut self,
        slot: Slot,
        number: u8,
        disposition: Disposition,
    ) -> Result<Disposition, TaskError> {
        let signal = Signal::new(number).ok_or(TaskError::InvalidSignal)?;
        let task = self.tasks.get_mut(slot).ok_or(TaskError::NoSuchTask)?;
        if !signal.is_catchable() {
            return Ok(Disposition::Default);
        }
        Ok(task.signals.set_disposition(signal, disposition))
    }

    pub fn set_signal_mask(
        &mut self,
        slot: Slot,
        how: MaskHow,
        set: SignalSet,
    ) -> Result<SignalSet, TaskError> {
        let task = self.tasks.get_mut(slot).ok_or(TaskError::NoSuchTask)?;
        Ok(task.signals.apply_mask(how, set))
    }

    /// Arms the alarm to raise `ALRM` after `ticks` ticks, or disarms it with
    /// zero. Returns the ticks that were left on the previous alarm.
    pub fn set_alarm(&mut self, slot: Slot, ticks: u64) -> Result<u64, TaskError> {
        let task = self.tasks.get_mut(slot).ok_or(TaskError::NoSuchTask)?;
        Ok(task.signals.set_alarm(ticks))
    }

    /// Counts every alarm down by one tick and raises the ones that expire.
    pub(crate) fn tick_alarms(&mut self) {
        for slot in 0..TASK_MAX {
            let expired = self
                .tasks
                .get_mut(slot)
                .filter(|t| t.state.is_alive())
                .is_some_and(|t| t.signals.tick_alarm());
            if expired {
                self.post(slot, Signal::ALRM);
            }
        }
    }
}

#[cfg(feature = "detailed-logging")]
fn trace_signal(what: &str, slot: Slot, signal: Signal) {
    log::trace!("{} signal {} for slot {}", what, signal, slot);
}

#[cfg(not(feature = "detailed-logging"))]
fn trace_signal(_what: &str, _slot: Slot, _signal: Signal) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, spawn_user};

    mod numbering {
        use super::*;

        #[test]
        fn range() {
            assert_eq!(Signal::new(0), None);
            assert_eq!(Signal::new(63).map(Signal::number), Some(63));
            assert_eq!(Signal::new(64), None);
        }

        #[test]
        fn default_actions() {
            assert_eq!(Signal::TERM.default_action(), DefaultAction::Terminate);
            assert_eq!(Signal::TTIN.default_action(), DefaultAction::Stop);
            assert_eq!(Signal::CONT.default_action(), DefaultAction::Continue);
            assert_eq!(Signal::CHLD.default_action(), DefaultAction::Ignore);
            assert_eq!(Signal::new(40).unwrap().default_action(), DefaultAction::Ignore);
        }

        #[test]
        fn set_operations() {
            let mut set = SignalSet::from(Signal::USR2);
            set.insert(Signal::HUP);
            assert_eq!(set.lowest(), Some(Signal::HUP));
            set.remove(Signal::HUP);
            assert_eq!(set.lowest(), Some(Signal::USR2));
            assert!(SignalSet::STOP_CLASS.contains(Signal::TTOU));
            assert!(!SignalSet::STOP_CLASS.contains(Signal::CONT));
            assert_eq!(SignalSet::from_bits(1).lowest(), None);
        }
    }

    mod state {
        use super::*;

        #[test]
        fn mask_never_blocks_kill_or_stop() {
            let mut state = SignalState::new();
            let old = state.apply_mask(MaskHow::SetMask, SignalSet::from_bits(u64::MAX));
            assert!(old.is_empty());
            assert!(!state.blocked().contains(Signal::KILL));
            assert!(!state.blocked().contains(Signal::STOP));
            assert!(state.blocked().contains(Signal::TERM));

            let old = state.apply_mask(MaskHow::Unblock, Signal::TERM.into());
            assert!(old.contains(Signal::TERM));
            assert!(!state.blocked().contains(Signal::TERM));
            state.apply_mask(MaskHow::Block, Signal::KILL.into());
            assert!(!state.blocked().contains(Signal::KILL));
        }

        #[test]
        fn child_state_starts_clean() {
            let mut state = SignalState::new();
            state.set_disposition(Signal::USR1, Disposition::Ignore);
            state.set_pending(Signal::USR2);
            state.set_in_handler(true);
            state.set_alarm(5);
            state.apply_mask(MaskHow::Block, Signal::INT.into());

            let child = state.for_child();
            assert_eq!(child.disposition(Signal::USR1), Disposition::Ignore);
            assert!(child.pending().is_empty());
            assert!(!child.in_handler());
            assert_eq!(child.alarm(), 0);
            assert!(child.blocked().contains(Signal::INT));
        }

        #[test]
        fn blocked_signals_are_not_deliverable() {
            let mut state = SignalState::new();
            state.set_pending(Signal::INT);
            state.set_pending(Signal::TERM);
            state.apply_mask(MaskHow::Block, Signal::INT.into());
            assert_eq!(state.next_deliverable(), Some(Signal::TERM));
        }
    }

    mod raising {
        use super::*;

        #[test]
        fn blocked_signal_stays_pending_without_waking() {
            let mut h = harness();
            let slot = spawn_user(&mut h);
            h.kernel.sleep(slot, 100).unwrap();
            h.kernel
                .set_signal_mask(slot, MaskHow::Block, Signal::USR1.into())
                .unwrap();

            h.kernel.raise(slot, Signal::USR1.number()).unwrap();
            let task = h.kernel.task(slot).unwrap();
            assert_eq!(task.state(), TaskState::Sleeping);
            assert!(task.signals().pending().contains(Signal::USR1));

            h.kernel.raise(slot, Signal::USR2.number()).unwrap();
            assert_eq!(h.kernel.task(slot).unwrap().state(), TaskState::Ready);
        }

        #[test]
        fn invalid_targets_and_numbers() {
            let mut h = harness();
            let slot = spawn_user(&mut h);
            assert_eq!(h.kernel.raise(slot, 64), Err(TaskError::InvalidSignal));
            assert_eq!(h.kernel.raise(TASK_MAX - 1, 1), Err(TaskError::NoSuchTask));
            assert_eq!(h.kernel.raise(slot, 0), Ok(()));
            // Cooperative boot slots are not killable.
            assert_eq!(
                h.kernel.raise(crate::config::BOOT_SLOT, Signal::KILL.number()),
                Err(TaskError::NotPermitted)
            );
        }

        #[test]
        fn stop_and_continue() {
            let mut h = harness();
            let slot = spawn_user(&mut h);
            h.kernel.raise(slot, Signal::TSTP.number()).unwrap();
            h.kernel.raise(slot, Signal::STOP.number()).unwrap();
            assert_eq!(h.kernel.task(slot).unwrap().state(), TaskState::Stopped);

            h.kernel.raise(slot, Signal::CONT.number()).unwrap();
            let task = h.kernel.task(slot).unwrap();
            assert_eq!(task.state(), TaskState::Ready);
            assert!(!task.signals().pending().contains(Signal::TSTP));
        }

        #[test]
        fn kernel_thread_resolves_signals_at_once() {
            let mut h = harness();
            let pid = h
                .kernel
                .create_thread("worker", VirtualAddress::new(0x1000), true)
                .unwrap();
            let slot = h.kernel.find_pid(pid).unwrap();

            h.kernel.raise(slot, Signal::USR1.number()).unwrap();
            let task = h.kernel.task(slot).unwrap();
            assert_eq!(task.state(), TaskState::Zombie);
            assert!(task.signals().pending().is_empty());
            assert_eq!(task.exit_status(), Some(ExitStatus::Signaled(Signal::USR1)));
        }

        #[test]
        fn kernel_thread_ignores_chld() {
            let mut h = harness();
            let pid = h
                .kernel
                .create_thread("worker", VirtualAddress::new(0x1000), true)
                .unwrap();
            let slot = h.kernel.find_pid(pid).unwrap();
            h.kernel.raise(slot, Signal::CHLD.number()).unwrap();
            assert_eq!(h.kernel.task(slot).unwrap().state(), TaskState::Ready);
        }

        #[test]
        fn handlers_for_kill_cannot_be_set() {
            let mut h = harness();
            let slot = spawn_user(&mut h);
            let handler = Disposition::Handler(VirtualAddress::new(0x2000_0000));
            assert_eq!(
                h.kernel.set_handler(slot, Signal::KILL.number(), handler),
                Ok(Disposition::Default)
            );
            assert_eq!(
                h.kernel.task(slot).unwrap().signals().disposition(Signal::KILL),
                Disposition::Default
            );
            assert_eq!(
                h.kernel.set_handler(slot, Signal::USR1.number(), handler),
                Ok(Disposition::Default)
            );
            assert_eq!(
                h.kernel.set_handler(slot, Signal::USR1.number(), Disposition::Ignore),
                Ok(handler)
            );
        }

        #[test]
        fn alarm_fires_after_countdown() {
            let mut h = harness();
            let slot = spawn_user(&mut h);
            assert_eq!(h.kernel.set_alarm(slot, 2), Ok(0));
            h.kernel.tick_alarms();
            assert!(!h.kernel.task(slot).unwrap().signals().pending().contains(Signal::ALRM));
            h.kernel.tick_alarms();
            assert!(h.kernel.task(slot).unwrap().signals().pending().contains(Signal::ALRM));
            assert_eq!(h.kernel.set_alarm(slot, 0), Ok(0));
            assert_eq!(h.kernel.set_alarm(slot, 7), Ok(0));
            assert_eq!(h.kernel.set_alarm(slot, 0), Ok(7));
        }
    }
}
