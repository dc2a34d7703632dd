//! Delivering pending signals on the way back to user mode.
//!
//! A handler runs on the interrupted user stack. Below the red zone the kernel
//! writes a signal frame and points the saved context at the handler:
//!
//! ```text
//!   rsp + 16  SignalContext       registers to restore on sigreturn
//!   rsp + 8   signal number
//!   rsp       trampoline address  the handler returns into it
//! ```
//!
//! The trampoline issues `sigreturn`, which finds the snapshot eight bytes above
//! its stack pointer.

use core::mem::size_of;

use mm::VirtualAddress;

use super::{DefaultAction, Disposition, Signal};
use crate::{
    ExitStatus, FramePointer, Kernel, Mode, SavedContext, Slot, TaskError, config::RED_ZONE,
};

/// Registers a handler may not clobber, in the order they are written to the
/// user stack.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalContext {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

const CONTEXT_WORDS: usize = size_of::<SignalContext>() / size_of::<u64>();

/// Bytes of user stack one delivery consumes: return address, signal number
/// and the snapshot.
pub const SIGNAL_FRAME_SIZE: usize = 2 * size_of::<u64>() + size_of::<SignalContext>();

impl SignalContext {
    pub fn capture(context: &SavedContext) -> Self {
        Self {
            rip: context.rip,
            cs: context.cs,
            rflags: context.rflags,
            rsp: context.rsp,
            ss: context.ss,
            rax: context.rax,
            rcx: context.rcx,
            rdx: context.rdx,
            rbx: context.rbx,
            rsi: context.rsi,
            rdi: context.rdi,
            rbp: context.rbp,
            r8: context.r8,
            r9: context.r9,
            r10: context.r10,
            r11: context.r11,
            r12: context.r12,
            r13: context.r13,
            r14: context.r14,
            r15: context.r15,
            ds: context.ds,
            es: context.es,
            fs: context.fs,
            gs: context.gs,
        }
    }

    /// Writes the snapshot back into `context`. The snapshot lived in user memory,
    /// so the privilege-relevant fields are forced back to ring 3 values.
    pub fn restore_into(&self, context: &mut SavedContext) {
        context.rip = self.rip;
        context.cs = self.cs;
        context.rflags = self.rflags;
        context.rsp = self.rsp;
        context.ss = self.ss;
        context.rax = self.rax;
        context.rcx = self.rcx;
        context.rdx = self.rdx;
        context.rbx = self.rbx;
        context.rsi = self.rsi;
        context.rdi = self.rdi;
        context.rbp = self.rbp;
        context.r8 = self.r8;
        context.r9 = self.r9;
        context.r10 = self.r10;
        context.r11 = self.r11;
        context.r12 = self.r12;
        context.r13 = self.r13;
        context.r14 = self.r14;
        context.r15 = self.r15;
        context.ds = self.ds;
        context.es = self.es;
        context.fs = self.fs;
        context.gs = self.gs;
        context.sanitize_user();
    }

    fn words(&self) -> [u64; CONTEXT_WORDS] {
        [
            self.rip, self.cs, self.rflags, self.rsp, self.ss, self.rax, self.rcx, self.rdx,
            self.rbx, self.rsi, self.rdi, self.rbp, self.r8, self.r9, self.r10, self.r11,
            self.r12, self.r13, self.r14, self.r15, self.ds, self.es, self.fs, self.gs,
        ]
    }

    fn from_words(w: [u64; CONTEXT_WORDS]) -> Self {
        let [
            rip, cs, rflags, rsp, ss, rax, rcx, rdx, rbx, rsi, rdi, rbp,
            r8, r9, r10, r11, r12, r13, r14, r15, ds, es, fs, gs,
        ] = w;
        Self {
            rip, cs, rflags, rsp, ss, rax, rcx, rdx, rbx, rsi, rdi, rbp,
            r8, r9, r10, r11, r12, r13, r14, r15, ds, es, fs, gs,
        }
    }

    /// Little-endian image of the snapshot as it appears on the user stack.
    pub fn to_bytes(&self) -> [u8; size_of::<SignalContext>()] {
        let mut bytes = [0; size_of::<SignalContext>()];
        for (chunk, word) in bytes.chunks_exact_mut(8).zip(self.words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8; size_of::<SignalContext>()]) -> Self {
        let mut words = [0; CONTEXT_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }
        Self::from_words(words)
    }
}

/// What delivery did to the current task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The task resumes where it was interrupted.
    Resume,
    /// The frame now enters the handler for this signal.
    Handler(Signal),
    Stopped,
    Terminated,
}

impl Delivery {
    /// True if the task can no longer run and another must be scheduled.
    pub fn must_reschedule(self) -> bool {
        matches!(self, Self::Stopped | Self::Terminated)
    }
}

impl Kernel {
    /// Acts on the pending, unblocked signals of the user task in `slot`, whose
    /// registers are saved at `frame`.
    ///
    /// Signals are taken lowest number first. Ignored ones are discarded and
    /// the next is tried. At most one handler is entered per call, and none while
    /// the task is already inside one.
    pub fn deliver_signals(&mut self, slot: Slot, frame: FramePointer) -> Delivery {
        loop {
            let Some(task) = self.tasks.get_mut(slot) else {
                return Delivery::Terminated;
            };
            if !task.state.is_alive() {
                return Delivery::Terminated;
            }
            // SAFETY: the frame belongs to the task and nothing else holds it.
            let user_frame = unsafe { frame.context() }.is_user();
            if task.mode != Mode::User || !user_frame || task.signals.in_handler() {
                return Delivery::Resume;
            }
            let Some(signal) = task.signals.next_deliverable() else {
                return Delivery::Resume;
            };
            task.signals.take_pending(signal);

            match task.signals.disposition(signal) {
                Disposition::Ignore => continue,
                Disposition::Handler(handler) => return self.enter_handler(slot, frame, signal, handler),
                Disposition::Default => match signal.default_action() {
                    DefaultAction::Terminate => {
                        self.terminate(slot, ExitStatus::Signaled(signal));
                        return Delivery::Terminated;
                    }
                    DefaultAction::Stop => {
                        self.stop(slot);
                        return Delivery::Stopped;
                    }
                    DefaultAction::Continue | DefaultAction::Ignore => continue,
                },
            }
        }
    }

    fn enter_handler(
        &mut self,
        slot: Slot,
        frame: FramePointer,
        signal: Signal,
        handler: VirtualAddress,
    ) -> Delivery {
        let Ok(space) = self.user_space(slot) else {
            return Delivery::Resume;
        };
        // SAFETY: the frame belongs to the task and nothing else holds it.
        let context = unsafe { frame.context() };
        let snapshot = SignalContext::capture(context);

        // The handler starts as if called: its return address sits at an address
        // that is 8 modulo 16.
        let sp = (context.rsp as usize)
            .checked_sub(RED_ZONE + SIGNAL_FRAME_SIZE)
            .and_then(|sp| (sp & !15).checked_sub(8))
            // SAFETY: only used after the user range check.
            .map(|sp| unsafe { VirtualAddress::new_unchecked(sp) })
            .filter(|sp| sp.is_user());

        let mut bytes = [0; SIGNAL_FRAME_SIZE];
        bytes[..8].copy_from_slice(&self.config.signal_trampoline.as_u64().to_le_bytes());
        bytes[8..16].copy_from_slice(&u64::from(signal.number()).to_le_bytes());
        bytes[16..].copy_from_slice(&snapshot.to_bytes());

        let written = sp.ok_or(mm::MapError::NotMapped).and_then(|sp| {
            self.mapper
                .write_user(space.directory(), sp, &bytes, &mut *self.frames)
                .map(|()| sp)
        });
        let sp = match written {
            Ok(sp) => sp,
            Err(e) => {
                log::warn!(
                    "slot {}: cannot push frame for signal {} below {:#x}: {}",
                    slot,
                    signal,
                    context.rsp,
                    e
                );
                self.terminate(slot, ExitStatus::Signaled(Signal::SEGV));
                return Delivery::Terminated;
            }
        };

        context.rip = handler.as_u64();
        context.rsp = sp.as_u64();
        context.rdi = u64::from(signal.number());
        if let Some(task) = self.tasks.get_mut(slot) {
            task.signals.set_in_handler(true);
        }
        trace_delivery(slot, signal, handler, sp);
        Delivery::Handler(signal)
    }

    /// Restores the registers saved when the current handler was entered.
    ///
    /// Called by the trampoline after the handler returned, so the stack
    /// pointer in `frame` points at the signal number. A snapshot that can no
    /// longer be read kills the task with `SEGV`.
    pub fn sigreturn(&mut self, slot: Slot, frame: FramePointer) -> Result<(), TaskError> {
        let space = self.user_space(slot)?;
        // SAFETY: the frame belongs to the task and nothing else holds it.
        let context = unsafe { frame.context() };

        let mut bytes = [0; size_of::<SignalContext>()];
        let read = (context.rsp as usize)
            .checked_add(size_of::<u64>())
            // SAFETY: only used after the user range check.
            .map(|addr| unsafe { VirtualAddress::new_unchecked(addr) })
            .filter(|addr| addr.is_user())
            .ok_or(mm::MapError::NotMapped)
            .and_then(|addr| self.mapper.read_user(space.directory(), addr, &mut bytes));
        if let Err(e) = read {
            log::warn!("slot {}: bad signal frame at {:#x}: {}", slot, context.rsp, e);
            self.terminate(slot, ExitStatus::Signaled(Signal::SEGV));
            return Err(TaskError::BadAddress);
        }

        SignalContext::from_bytes(&bytes).restore_into(context);
        if let Some(task) = self.tasks.get_mut(slot) {
            task.signals.set_in_handler(false);
        }
        Ok(())
    }
}

#[cfg(feature = "detailed-logging")]
fn trace_delivery(slot: Slot, signal: Signal, handler: VirtualAddress, sp: VirtualAddress) {
    log::trace!("slot {} enters handler {} for signal {} with sp {}", slot, handler, signal, sp);
}

#[cfg(not(feature = "detailed-logging"))]
fn trace_delivery(_slot: Slot, _signal: Signal, _handler: VirtualAddress, _sp: VirtualAddress) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        MaskHow, Task, TaskState,
        testing::{TRAMPOLINE, harness, spawn_user},
    };

    const HANDLER: usize = 0x0040_2000;

    fn user_context(kernel: &Kernel, slot: Slot) -> SavedContext {
        let frame = kernel.task(slot).and_then(Task::saved_frame).unwrap();
        unsafe { *frame.context() }
    }

    mod snapshot {
        use super::*;

        #[test]
        fn bytes_follow_field_order() {
            let context = SignalContext {
                rip: 0x1111,
                gs: 0x2222,
                ..SignalContext::default()
            };
            let bytes = context.to_bytes();
            assert_eq!(bytes.len(), 24 * 8);
            assert_eq!(&bytes[..8], &0x1111u64.to_le_bytes());
            assert_eq!(&bytes[23 * 8..], &0x2222u64.to_le_bytes());
            assert_eq!(SignalContext::from_bytes(&bytes), context);
        }

        #[test]
        fn restore_cannot_raise_privilege() {
            let forged = SignalContext {
                cs: crate::context::KERNEL_CODE_SELECTOR,
                ss: crate::context::KERNEL_DATA_SELECTOR,
                rflags: 0x3000,
                rip: 0x1234,
                ..SignalContext::default()
            };
            let mut context = SavedContext::default();
            forged.restore_into(&mut context);
            assert!(context.is_user());
            assert_eq!(context.rip, 0x1234);
            assert_eq!(context.rflags & 0x3000, 0);
        }
    }

    mod delivery {
        use super::*;

        #[test]
        fn handler_frame_and_sigreturn() {
            let mut h = harness();
            let slot = spawn_user(&mut h);
            let handler = Disposition::Handler(VirtualAddress::new(HANDLER));
            h.kernel.set_handler(slot, Signal::USR1.number(), handler).unwrap();
            h.kernel.raise(slot, Signal::USR1.number()).unwrap();

            let before = user_context(&h.kernel, slot);
            let frame = h.kernel.interrupt_return(h.boot, true);
            assert_eq!(h.kernel.current(), slot);

            let context = unsafe { *frame.context() };
            assert_eq!(context.rip, HANDLER as u64);
            assert_eq!(context.rdi, u64::from(Signal::USR1.number()));
            assert_eq!(context.rsp % 16, 8);
            assert!(context.rsp + (RED_ZONE + SIGNAL_FRAME_SIZE) as u64 <= before.rsp);
            assert!(h.kernel.task(slot).unwrap().signals().in_handler());

            let mut stored = [0; SIGNAL_FRAME_SIZE];
            h.kernel
                .read_user(slot, VirtualAddress::new(context.rsp as usize), &mut stored)
                .unwrap();
            assert_eq!(&stored[..8], &(TRAMPOLINE as u64).to_le_bytes());
            assert_eq!(&stored[8..16], &10u64.to_le_bytes());
            let snapshot: [u8; size_of::<SignalContext>()] = stored[16..].try_into().unwrap();
            assert_eq!(SignalContext::from_bytes(&snapshot), SignalContext::capture(&before));

            // The handler returns into the trampoline, popping the return address.
            unsafe { frame.context() }.rsp += 8;
            unsafe { frame.context() }.rax = 77;
            h.kernel.sigreturn(slot, frame).unwrap();
            let restored = unsafe { *frame.context() };
            assert_eq!(restored.rip, before.rip);
            assert_eq!(restored.rsp, before.rsp);
            assert_eq!(restored.rax, before.rax);
            assert!(!h.kernel.task(slot).unwrap().signals().in_handler());
        }

        #[test]
        fn sleeping_task_wakes_runs_handler_and_returns() {
            let mut h = harness();
            let slot = spawn_user(&mut h);
            let handler = Disposition::Handler(VirtualAddress::new(HANDLER));
            h.kernel.set_handler(slot, Signal::USR1.number(), handler).unwrap();
            h.kernel.sleep(slot, 1000).unwrap();
            assert_eq!(h.kernel.task(slot).unwrap().state(), TaskState::Sleeping);

            h.kernel.raise(slot, Signal::USR1.number()).unwrap();
            assert_eq!(h.kernel.task(slot).unwrap().state(), TaskState::Ready);

            let before = user_context(&h.kernel, slot);
            let frame = h.kernel.interrupt_return(h.boot, true);
            assert_eq!(h.kernel.current(), slot);
            let context = unsafe { *frame.context() };
            assert_eq!(context.rip, HANDLER as u64);
            assert_eq!(context.rdi, u64::from(Signal::USR1.number()));
            assert!(!h.kernel.task(slot).unwrap().signals().pending().contains(Signal::USR1));

            unsafe { frame.context() }.rsp += 8;
            h.kernel.sigreturn(slot, frame).unwrap();
            let restored = unsafe { *frame.context() };
            assert_eq!(restored.rip, before.rip);
            assert_eq!(restored.rsp, before.rsp);
            assert!(!h.kernel.task(slot).unwrap().signals().in_handler());
        }

        #[test]
        fn no_nested_handlers() {
            let mut h = harness();
            let slot = spawn_user(&mut h);
            let handler = Disposition::Handler(VirtualAddress::new(HANDLER));
            h.kernel.set_handler(slot, Signal::USR1.number(), handler).unwrap();
            h.kernel.set_handler(slot, Signal::USR2.number(), handler).unwrap();
            h.kernel.raise(slot, Signal::USR1.number()).unwrap();
            h.kernel.raise(slot, Signal::USR2.number()).unwrap();

            let frame = h.kernel.interrupt_return(h.boot, true);
            assert_eq!(h.kernel.deliver_signals(slot, frame), Delivery::Resume);
            let task = h.kernel.task(slot).unwrap();
            assert!(task.signals().pending().contains(Signal::USR2));
            assert!(!task.signals().pending().contains(Signal::USR1));
        }

        #[test]
        fn ignored_signals_are_skipped() {
            let mut h = harness();
            let slot = spawn_user(&mut h);
            h.kernel
                .set_handler(slot, Signal::HUP.number(), Disposition::Ignore)
                .unwrap();
            h.kernel
                .set_handler(slot, Signal::INT.number(), Disposition::Handler(VirtualAddress::new(HANDLER)))
                .unwrap();
            h.kernel.raise(slot, Signal::HUP.number()).unwrap();
            h.kernel.raise(slot, Signal::INT.number()).unwrap();
            h.kernel.raise(slot, Signal::CHLD.number()).unwrap();

            let frame = h.kernel.interrupt_return(h.boot, true);
            assert_eq!(unsafe { frame.context() }.rdi, u64::from(Signal::INT.number()));
            assert!(h.kernel.task(slot).unwrap().signals().pending().contains(Signal::CHLD));
        }

        #[test]
        fn default_terminate_switches_away() {
            let mut h = harness();
            let slot = spawn_user(&mut h);
            h.kernel.raise(slot, Signal::TERM.number()).unwrap();

            let frame = h.kernel.interrupt_return(h.boot, true);
            let task = h.kernel.task(slot).unwrap();
            assert_eq!(task.state(), TaskState::Zombie);
            assert_eq!(task.exit_status(), Some(ExitStatus::Signaled(Signal::TERM)));
            assert_eq!(h.kernel.current(), crate::config::BOOT_SLOT);
            assert_eq!(frame, h.boot);
        }

        #[test]
        fn blocked_signal_waits_for_unmask() {
            let mut h = harness();
            let slot = spawn_user(&mut h);
            h.kernel
                .set_signal_mask(slot, MaskHow::Block, Signal::TERM.into())
                .unwrap();
            h.kernel.raise(slot, Signal::TERM.number()).unwrap();

            let frame = h.kernel.interrupt_return(h.boot, true);
            assert_eq!(h.kernel.current(), slot);
            assert_eq!(h.kernel.deliver_signals(slot, frame), Delivery::Resume);

            h.kernel
                .set_signal_mask(slot, MaskHow::Unblock, Signal::TERM.into())
                .unwrap();
            assert_eq!(h.kernel.deliver_signals(slot, frame), Delivery::Terminated);
        }

        #[test]
        fn unwritable_stack_kills_with_segv() {
            let mut h = harness();
            let slot = spawn_user(&mut h);
            h.kernel
                .set_handler(slot, Signal::USR1.number(), Disposition::Handler(VirtualAddress::new(HANDLER)))
                .unwrap();
            h.kernel.raise(slot, Signal::USR1.number()).unwrap();
            let frame = h.kernel.task(slot).and_then(Task::saved_frame).unwrap();
            unsafe { frame.context() }.rsp = 0x1000_0000;

            assert_eq!(h.kernel.deliver_signals(slot, frame), Delivery::Terminated);
            assert_eq!(
                h.kernel.task(slot).unwrap().exit_status(),
                Some(ExitStatus::Signaled(Signal::SEGV))
            );
        }

        #[test]
        fn bad_sigreturn_kills_with_segv() {
            let mut h = harness();
            let slot = spawn_user(&mut h);
            let frame = h.kernel.task(slot).and_then(Task::saved_frame).unwrap();
            unsafe { frame.context() }.rsp = 0x1000_0000;
            assert_eq!(h.kernel.sigreturn(slot, frame), Err(TaskError::BadAddress));
            assert_eq!(h.kernel.task(slot).unwrap().state(), TaskState::Zombie);
        }
    }
}
