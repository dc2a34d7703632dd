//! The single process core instance that interrupt handlers reach.

use spin::{Mutex, Once};

use crate::{FramePointer, Kernel, arch};

static KERNEL: Once<Mutex<Kernel>> = Once::new();

/// Makes `kernel` the global instance. Hands it back if one is installed
/// already. Called once during boot, before interrupts are enabled.
pub fn install(kernel: Kernel) -> Result<(), Kernel> {
    if KERNEL.is_completed() {
        return Err(kernel);
    }
    KERNEL.call_once(move || Mutex::new(kernel));
    log::info!("process core installed");
    Ok(())
}

/// Runs `f` on the global instance with interrupts masked. `None` before
/// [`install`].
pub fn with_kernel<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut Kernel) -> R,
{
    let kernel = KERNEL.get()?;
    Some(arch::without_interrupts(|| f(&mut *kernel.lock())))
}

/// The common tail of every interrupt and system call. Returns the frame to
/// restore, which is `frame` itself until a kernel is installed.
pub fn on_interrupt_return(frame: FramePointer, tick: bool) -> FramePointer {
    with_kernel(|kernel| kernel.interrupt_return(frame, tick)).unwrap_or(frame)
}
