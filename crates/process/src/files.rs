//! Per-task file descriptor tables and the IPC collaborator interface.
//!
//! The process core does not implement files or pipes. It only tracks which
//! descriptor slots a task holds, so fork can duplicate them and tell the IPC
//! layer about every pipe end that gained a holder.

use alloc::vec::Vec;

use crate::Pid;

/// One end of a pipe owned by the IPC layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeEnd {
    pub pipe: u32,
    pub write: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileDescriptor {
    /// An open file, by the file layer's handle.
    File(u32),
    Pipe(PipeEnd),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTable {
    entries: Vec<Option<FileDescriptor>>,
}

impl FileTable {
    pub fn new(size: usize) -> Self {
        Self {
            entries: alloc::vec![None; size],
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Stores `descriptor` in the lowest free slot and returns its number.
    pub fn install(&mut self, descriptor: FileDescriptor) -> Option<usize> {
        let fd = self.entries.iter().position(Option::is_none)?;
        self.entries[fd] = Some(descriptor);
        Some(fd)
    }

    pub fn get(&self, fd: usize) -> Option<FileDescriptor> {
        self.entries.get(fd).copied().flatten()
    }

    pub fn close(&mut self, fd: usize) -> Option<FileDescriptor> {
        self.entries.get_mut(fd).and_then(Option::take)
    }

    pub fn pipes(&self) -> impl Iterator<Item = PipeEnd> + '_ {
        self.entries.iter().filter_map(|e| match e {
            Some(FileDescriptor::Pipe(end)) => Some(*end),
            _ => None,
        })
    }

    /// An independent copy of the same size, as a forked child receives.
    pub fn duplicate(&self, ipc: &mut dyn IpcHooks) -> Self {
        for end in self.pipes() {
            ipc.pipe_duplicated(end);
        }
        self.clone()
    }
}

/// Calls out to the IPC layer.
pub trait IpcHooks {
    /// A fork copied a descriptor for `end`; it has one more holder.
    fn pipe_duplicated(&mut self, _end: PipeEnd) {}

    /// `pid` terminated: release its pipes, shared-memory attachments and any
    /// other IPC state it held.
    fn release_task(&mut self, _pid: Pid) {}
}

/// Hooks for a kernel without IPC.
pub struct NoIpc;

impl IpcHooks for NoIpc {}
