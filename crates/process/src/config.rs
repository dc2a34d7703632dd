//! Compile-time limits of the process core.

/// Number of control blocks in the task table.
pub const TASK_MAX: usize = 16;

/// Slots `0..COOPERATIVE_SLOTS` share the boot stack and yield to each other
/// voluntarily. Every other slot owns a kernel stack and is preempted.
pub const COOPERATIVE_SLOTS: usize = 4;

/// The cooperative slot executing when the kernel is created.
pub const BOOT_SLOT: usize = 1;

/// Signals are numbered `1..NSIG`; bit 0 of a mask is unused.
pub const NSIG: usize = 64;

/// Bytes below the interrupted user stack pointer that signal delivery leaves
/// untouched.
pub const RED_ZONE: usize = 128;

/// File descriptors in a new task's file table.
pub const FILE_TABLE_SIZE: usize = 32;

/// Default file-creation mask of the first tasks.
pub const DEFAULT_UMASK: u16 = 0o022;
