//! Processes: named containers of threads.
//!
//! A process is alive while it has at least one live thread; when the last
//! thread exits the process transitions to `Terminated` and its slot is
//! released.

use alloc::string::String;

use muon_core::id::{Pid, Tid};
use planck_noalloc::vec::ArrayVec;

use crate::SchedError;

/// Maximum number of processes.
pub const MAX_PROCESSES: usize = 32;

/// Maximum threads a single process may own.
pub const MAX_THREADS_PER_PROCESS: usize = 16;

/// Process lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Has at least one live thread.
    Active,
    /// Last thread has exited.
    Terminated,
}

/// A named collection of threads.
pub struct Process {
    /// Process id.
    pub pid: Pid,
    /// Human-readable name.
    pub name: String,
    /// Lifecycle state.
    pub state: ProcessState,
    threads: ArrayVec<Tid, MAX_THREADS_PER_PROCESS>,
}

impl Process {
    /// Number of live threads.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Ids of the process's threads.
    pub fn threads(&self) -> &[Tid] {
        self.threads.as_slice()
    }
}

/// Fixed-size table of processes.
pub struct ProcessTable {
    slots: [Option<Process>; MAX_PROCESSES],
    next_pid: u32,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    /// Creates an empty table. Pids start at 1.
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_PROCESSES],
            next_pid: 1,
        }
    }

    /// Creates a process with no threads yet.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::NoFreeSlot`] when the table is full.
    pub fn create(&mut self, name: &str) -> Result<Pid, SchedError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(SchedError::NoFreeSlot)?;
        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;
        *slot = Some(Process {
            pid,
            name: String::from(name),
            state: ProcessState::Active,
            threads: ArrayVec::new(),
        });
        Ok(pid)
    }

    /// Looks up a process by id.
    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots
            .iter()
            .flatten()
            .find(|p| p.pid == pid)
    }

    /// Records a new thread belonging to `pid`.
    ///
    /// # Errors
    ///
    /// [`SchedError::NoSuchProcess`] if `pid` is unknown,
    /// [`SchedError::TooManyThreads`] at the per-process limit.
    pub fn attach_thread(&mut self, pid: Pid, tid: Tid) -> Result<(), SchedError> {
        let proc = self
            .slots
            .iter_mut()
            .flatten()
            .find(|p| p.pid == pid)
            .ok_or(SchedError::NoSuchProcess)?;
        proc.threads
            .try_push(tid)
            .map_err(|_| SchedError::TooManyThreads)
    }

    /// Removes a thread from its process; the last removal terminates the
    /// process and frees its slot.
    pub fn detach_thread(&mut self, pid: Pid, tid: Tid) {
        for slot in &mut self.slots {
            let Some(proc) = slot else { continue };
            if proc.pid != pid {
                continue;
            }
            if let Some(idx) = proc.threads.iter().position(|&t| t == tid) {
                proc.threads.remove(idx);
            }
            if proc.threads.is_empty() {
                proc.state = ProcessState::Terminated;
                *slot = None;
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_thread_terminates_the_process() {
        let mut table = ProcessTable::new();
        let pid = table.create("netd").unwrap();
        table.attach_thread(pid, Tid::new(1)).unwrap();
        table.attach_thread(pid, Tid::new(2)).unwrap();
        assert_eq!(table.get(pid).unwrap().thread_count(), 2);

        table.detach_thread(pid, Tid::new(1));
        assert_eq!(table.get(pid).unwrap().thread_count(), 1);

        table.detach_thread(pid, Tid::new(2));
        assert!(table.get(pid).is_none(), "slot must be released");
    }

    #[test]
    fn thread_limit_is_enforced() {
        let mut table = ProcessTable::new();
        let pid = table.create("spawner").unwrap();
        for i in 0..MAX_THREADS_PER_PROCESS {
            table.attach_thread(pid, Tid::new(i as u32)).unwrap();
        }
        assert_eq!(
            table.attach_thread(pid, Tid::new(99)),
            Err(SchedError::TooManyThreads)
        );
    }

    #[test]
    fn pids_are_unique_and_increasing() {
        let mut table = ProcessTable::new();
        let a = table.create("a").unwrap();
        let b = table.create("b").unwrap();
        assert!(b > a);
    }
}
