//! The scheduler proper: thread table, FIFO ready queue, and the one place
//! the current-thread pointer ever changes.
//!
//! `schedule` and its relatives never touch registers. They update states
//! and return a [`Switch`] naming the outgoing and incoming contexts; the
//! kernel's arch layer performs the swap. Terminated threads stay in their
//! slots until the next scheduling decision reaps them, because the exiting
//! thread's stack is still in use until the switch away from it completes.

use alloc::boxed::Box;

use muon_core::id::{Pid, Tid};

use crate::SchedError;
use crate::context::CpuContext;
use crate::process::ProcessTable;
use crate::thread::{SchedParams, Thread, ThreadEntry, ThreadState};

/// Size of the thread table.
pub const MAX_THREADS: usize = 64;

/// A pending context switch: save into `prev`, load from `next`.
///
/// Both point into scheduler-owned storage that stays valid until the next
/// scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Switch {
    /// Context of the outgoing thread (or the boot context).
    pub prev: *mut CpuContext,
    /// Context of the incoming thread.
    pub next: *const CpuContext,
}

/// Cooperative round-robin scheduler.
pub struct Scheduler {
    threads: [Option<Box<Thread>>; MAX_THREADS],
    processes: ProcessTable,
    /// FIFO ready queue, linked through `Thread::next`.
    head: Option<Tid>,
    tail: Option<Tid>,
    current: Option<Tid>,
    next_tid: u32,
    /// Address the first switch into a new thread jumps to.
    trampoline: u64,
    /// Re-entrancy guard around scheduling decisions.
    in_schedule: bool,
    /// Most recent exiter; its stack is live until the switch completes, so
    /// reaping skips it for one round.
    pending_exit: Option<Tid>,
    /// Where the boot flow's registers go on the first switch.
    boot_context: CpuContext,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Creates an empty scheduler. Tids start at 1.
    pub const fn new() -> Self {
        Self {
            threads: [const { None }; MAX_THREADS],
            processes: ProcessTable::new(),
            head: None,
            tail: None,
            current: None,
            next_tid: 1,
            trampoline: 0,
            in_schedule: false,
            pending_exit: None,
            boot_context: CpuContext::zeroed(),
        }
    }

    /// Sets the trampoline address new threads start at.
    pub fn set_trampoline(&mut self, addr: u64) {
        self.trampoline = addr;
    }

    /// Creates a process.
    ///
    /// # Errors
    ///
    /// Propagates [`ProcessTable::create`] failures.
    pub fn create_process(&mut self, name: &str) -> Result<Pid, SchedError> {
        self.processes.create(name)
    }

    /// Read access to the process table.
    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    /// Creates a thread in `pid`, ready to run.
    ///
    /// # Errors
    ///
    /// Fails if the thread table or the process is full, the process is
    /// unknown, or the stack cannot be allocated.
    pub fn spawn(
        &mut self,
        pid: Pid,
        entry: ThreadEntry,
        stack_size: usize,
        params: SchedParams,
    ) -> Result<Tid, SchedError> {
        let slot = self
            .threads
            .iter()
            .position(|s| s.is_none())
            .ok_or(SchedError::NoFreeSlot)?;

        if self.processes.get(pid).is_none() {
            return Err(SchedError::NoSuchProcess);
        }

        let tid = Tid::new(self.next_tid);
        let thread = Thread::new(tid, pid, entry, stack_size, params, self.trampoline)?;
        self.processes.attach_thread(pid, tid)?;
        self.next_tid += 1;
        self.threads[slot] = Some(Box::new(thread));
        self.queue_push(tid);
        Ok(tid)
    }

    /// The thread currently holding the CPU.
    pub fn current(&self) -> Option<Tid> {
        self.current
    }

    /// State of a thread, if it exists.
    pub fn thread_state(&self, tid: Tid) -> Option<ThreadState> {
        self.thread(tid).map(|t| t.state)
    }

    /// Owning process of a thread, if it exists.
    pub fn thread_pid(&self, tid: Tid) -> Option<Pid> {
        self.thread(tid).map(|t| t.pid)
    }

    /// Stack range of a thread, for diagnostics.
    pub fn stack_range(&self, tid: Tid) -> Option<(usize, usize)> {
        self.thread(tid).map(Thread::stack_range)
    }

    /// Takes the current thread's entry closure (trampoline helper).
    pub fn take_current_entry(&mut self) -> Option<ThreadEntry> {
        let cur = self.current?;
        self.thread_mut(cur)?.take_entry()
    }

    /// Picks the next thread to run.
    ///
    /// Returns `None` (no switch) when the current thread is still `Running`,
    /// when the ready queue is empty, or when the only candidate is the
    /// current thread itself. Guarded against re-entry from interrupt
    /// context by the in-progress flag.
    pub fn schedule(&mut self) -> Option<Switch> {
        if self.in_schedule {
            return None;
        }
        self.in_schedule = true;
        self.pending_exit = None;
        self.reap();
        let decision = self.pick_next();
        self.in_schedule = false;
        decision
    }

    /// Re-queues the current thread and schedules.
    pub fn yield_current(&mut self) -> Option<Switch> {
        if let Some(cur) = self.current {
            if let Some(th) = self.thread_mut(cur) {
                if th.state == ThreadState::Running {
                    th.state = ThreadState::Ready;
                    self.queue_push(cur);
                }
            }
        }
        self.schedule()
    }

    /// Moves a thread out of the runnable set.
    ///
    /// Blocking the current thread does not switch by itself; the caller
    /// must invoke [`schedule`](Self::schedule) (and act on the decision)
    /// right after, which is what the kernel's `block_current` does.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::NoSuchThread`] for an unknown tid.
    pub fn block(&mut self, tid: Tid) -> Result<(), SchedError> {
        let state = self
            .thread_state(tid)
            .ok_or(SchedError::NoSuchThread)?;
        match state {
            ThreadState::Running => {
                if let Some(th) = self.thread_mut(tid) {
                    th.state = ThreadState::Blocked;
                }
            }
            ThreadState::Ready => {
                if let Some(th) = self.thread_mut(tid) {
                    th.state = ThreadState::Blocked;
                }
                self.queue_remove(tid);
            }
            ThreadState::Blocked | ThreadState::Terminated => {}
        }
        Ok(())
    }

    /// Makes a blocked thread runnable again, at the tail of the queue.
    /// Unblocking a thread that is not blocked is a no-op.
    pub fn unblock(&mut self, tid: Tid) {
        if self.thread_state(tid) == Some(ThreadState::Blocked) {
            if let Some(th) = self.thread_mut(tid) {
                th.state = ThreadState::Ready;
            }
            self.queue_push(tid);
        }
    }

    /// Terminates the current thread and picks a successor.
    ///
    /// The dying thread's slot (and stack) survive until the *next*
    /// scheduling decision, since the switch away from it has not happened
    /// when this returns. Returns `None` only if nothing is runnable, which
    /// means the kernel lost its idle thread.
    pub fn exit_current(&mut self) -> Option<Switch> {
        let cur = self.current.take()?;
        let pid = self.thread_pid(cur)?;
        if let Some(th) = self.thread_mut(cur) {
            th.state = ThreadState::Terminated;
        }
        self.processes.detach_thread(pid, cur);

        // The previous exiter (if any) has long since been switched away
        // from; replace it as the protected zombie and reap it.
        self.pending_exit = Some(cur);
        self.reap();

        let next = self.pop_runnable()?;
        if let Some(th) = self.thread_mut(next) {
            th.state = ThreadState::Running;
        }
        self.current = Some(next);

        let prev = &mut self.thread_mut(cur)?.context as *mut CpuContext;
        let next_ctx = &self.thread(next)?.context as *const CpuContext;
        Some(Switch {
            prev,
            next: next_ctx,
        })
    }

    /// Removes a thread that has never run (still `Ready`, never current).
    ///
    /// Used to roll back a spawn when a dependent resource (e.g. the job
    /// slot) could not be created. The stack is freed immediately, which is
    /// safe precisely because the thread never held the CPU.
    ///
    /// # Errors
    ///
    /// [`SchedError::NoSuchThread`] for unknown tids or threads that have
    /// already run.
    pub fn retract(&mut self, tid: Tid) -> Result<(), SchedError> {
        if self.current == Some(tid) || self.thread_state(tid) != Some(ThreadState::Ready) {
            return Err(SchedError::NoSuchThread);
        }
        let pid = self.thread_pid(tid).ok_or(SchedError::NoSuchThread)?;
        self.queue_remove(tid);
        self.processes.detach_thread(pid, tid);
        let slot = self.slot_of(tid).ok_or(SchedError::NoSuchThread)?;
        self.threads[slot] = None;
        Ok(())
    }

    // ── internals ───────────────────────────────────────────────────────

    fn pick_next(&mut self) -> Option<Switch> {
        // A thread that is still Running has not yielded; it keeps the CPU.
        if let Some(cur) = self.current {
            if self.thread_state(cur) == Some(ThreadState::Running) {
                return None;
            }
        }

        let next = self.pop_runnable()?;
        if Some(next) == self.current {
            // Only runnable thread is the one already on the CPU.
            if let Some(th) = self.thread_mut(next) {
                th.state = ThreadState::Running;
            }
            return None;
        }

        let prev: *mut CpuContext = match self.current {
            Some(cur) => &mut self.thread_mut(cur)?.context,
            None => &mut self.boot_context,
        };
        if let Some(th) = self.thread_mut(next) {
            th.state = ThreadState::Running;
        }
        self.current = Some(next);
        let next_ctx = &self.thread(next)?.context as *const CpuContext;
        Some(Switch {
            prev,
            next: next_ctx,
        })
    }

    /// Pops queue entries until one is actually Ready.
    fn pop_runnable(&mut self) -> Option<Tid> {
        loop {
            let tid = self.queue_pop()?;
            if self.thread_state(tid) == Some(ThreadState::Ready) {
                return Some(tid);
            }
        }
    }

    /// Frees the slots of terminated threads, except the protected zombie
    /// whose stack may still be live.
    fn reap(&mut self) {
        for slot in &mut self.threads {
            let Some(th) = slot else { continue };
            if th.state == ThreadState::Terminated && Some(th.tid) != self.pending_exit {
                *slot = None;
            }
        }
    }

    fn slot_of(&self, tid: Tid) -> Option<usize> {
        self.threads
            .iter()
            .position(|s| s.as_ref().is_some_and(|t| t.tid == tid))
    }

    fn thread(&self, tid: Tid) -> Option<&Thread> {
        let slot = self.slot_of(tid)?;
        self.threads[slot].as_deref()
    }

    fn thread_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        let slot = self.slot_of(tid)?;
        self.threads[slot].as_deref_mut()
    }

    fn queue_push(&mut self, tid: Tid) {
        if let Some(th) = self.thread_mut(tid) {
            th.next = None;
        } else {
            return;
        }
        match self.tail {
            None => {
                self.head = Some(tid);
                self.tail = Some(tid);
            }
            Some(t) => {
                if let Some(th) = self.thread_mut(t) {
                    th.next = Some(tid);
                }
                self.tail = Some(tid);
            }
        }
    }

    fn queue_pop(&mut self) -> Option<Tid> {
        let head = self.head?;
        let next = self.thread(head).and_then(|t| t.next);
        self.head = next;
        if next.is_none() {
            self.tail = None;
        }
        if let Some(th) = self.thread_mut(head) {
            th.next = None;
        }
        Some(head)
    }

    fn queue_remove(&mut self, tid: Tid) {
        let mut prev: Option<Tid> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            let link = self.thread(c).and_then(|t| t.next);
            if c == tid {
                match prev {
                    None => self.head = link,
                    Some(p) => {
                        if let Some(th) = self.thread_mut(p) {
                            th.next = link;
                        }
                    }
                }
                if self.tail == Some(tid) {
                    self.tail = prev;
                }
                if let Some(th) = self.thread_mut(tid) {
                    th.next = None;
                }
                return;
            }
            prev = cur;
            cur = link;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::DEFAULT_STACK_SIZE;

    fn sched_with_threads(n: usize) -> (Scheduler, Pid, Vec<Tid>) {
        let mut s = Scheduler::new();
        s.set_trampoline(0x1000);
        let pid = s.create_process("test").unwrap();
        let tids = (0..n)
            .map(|_| {
                s.spawn(pid, Box::new(|| {}), DEFAULT_STACK_SIZE, SchedParams::default())
                    .unwrap()
            })
            .collect();
        (s, pid, tids)
    }

    #[test]
    fn first_schedule_runs_the_first_spawned_thread() {
        let (mut s, _, tids) = sched_with_threads(2);
        let sw = s.schedule().expect("a switch");
        assert_eq!(s.current(), Some(tids[0]));
        assert_eq!(s.thread_state(tids[0]), Some(ThreadState::Running));
        assert_eq!(s.thread_state(tids[1]), Some(ThreadState::Ready));
        // Switching out of boot saves into the boot context.
        assert!(!sw.prev.is_null());
    }

    #[test]
    fn yield_rotates_round_robin() {
        let (mut s, _, tids) = sched_with_threads(3);
        s.schedule().unwrap();
        assert_eq!(s.current(), Some(tids[0]));

        s.yield_current().unwrap();
        assert_eq!(s.current(), Some(tids[1]));
        assert_eq!(s.thread_state(tids[0]), Some(ThreadState::Ready));

        s.yield_current().unwrap();
        assert_eq!(s.current(), Some(tids[2]));

        // Full circle.
        s.yield_current().unwrap();
        assert_eq!(s.current(), Some(tids[0]));
    }

    #[test]
    fn sole_thread_yield_keeps_the_cpu_without_a_switch() {
        let (mut s, _, tids) = sched_with_threads(1);
        s.schedule().unwrap();
        assert!(s.yield_current().is_none());
        assert_eq!(s.current(), Some(tids[0]));
        assert_eq!(s.thread_state(tids[0]), Some(ThreadState::Running));
    }

    #[test]
    fn running_thread_keeps_cpu_when_schedule_called_without_yield() {
        let (mut s, _, tids) = sched_with_threads(2);
        s.schedule().unwrap();
        assert!(s.schedule().is_none());
        assert_eq!(s.current(), Some(tids[0]));
    }

    #[test]
    fn block_and_unblock_round_trip() {
        let (mut s, _, tids) = sched_with_threads(2);
        s.schedule().unwrap();

        // Block the current thread, then schedule away from it.
        s.block(tids[0]).unwrap();
        let sw = s.schedule();
        assert!(sw.is_some());
        assert_eq!(s.current(), Some(tids[1]));
        assert_eq!(s.thread_state(tids[0]), Some(ThreadState::Blocked));

        // Unblock appends at the tail.
        s.unblock(tids[0]);
        assert_eq!(s.thread_state(tids[0]), Some(ThreadState::Ready));
        s.yield_current().unwrap();
        assert_eq!(s.current(), Some(tids[0]));
    }

    #[test]
    fn blocking_a_ready_thread_removes_it_from_the_queue() {
        let (mut s, _, tids) = sched_with_threads(3);
        s.schedule().unwrap();
        s.block(tids[1]).unwrap();
        s.yield_current().unwrap();
        // tids[1] skipped, tids[2] runs.
        assert_eq!(s.current(), Some(tids[2]));
    }

    #[test]
    fn unblock_of_non_blocked_thread_is_a_no_op() {
        let (mut s, _, tids) = sched_with_threads(2);
        s.schedule().unwrap();
        s.unblock(tids[1]); // Ready, not Blocked
        s.yield_current().unwrap();
        assert_eq!(s.current(), Some(tids[1]));
        s.yield_current().unwrap();
        // No duplicate entry: back to tids[0], not tids[1] again.
        assert_eq!(s.current(), Some(tids[0]));
    }

    #[test]
    fn exit_reaps_slot_and_process_on_next_decision() {
        let (mut s, pid, tids) = sched_with_threads(2);
        s.schedule().unwrap();

        let sw = s.exit_current().expect("successor exists");
        assert_eq!(s.current(), Some(tids[1]));
        assert!(!sw.prev.is_null());
        // Slot still present (stack may be live) ...
        assert_eq!(s.thread_state(tids[0]), Some(ThreadState::Terminated));

        // ... and gone after the next decision.
        s.yield_current();
        assert_eq!(s.thread_state(tids[0]), None);

        // Process stays alive until its last thread exits.
        assert!(s.processes().get(pid).is_some());
    }

    #[test]
    fn last_exit_terminates_the_process() {
        let (mut s, pid, _) = sched_with_threads(1);
        s.schedule().unwrap();
        assert!(s.exit_current().is_none(), "no successor to switch to");
        assert!(s.processes().get(pid).is_none());
    }

    #[test]
    fn retract_undoes_a_spawn_that_never_ran() {
        let (mut s, pid, tids) = sched_with_threads(2);
        s.schedule().unwrap();

        // tids[1] is Ready and never ran.
        s.retract(tids[1]).unwrap();
        assert_eq!(s.thread_state(tids[1]), None);
        assert_eq!(s.processes().get(pid).unwrap().thread_count(), 1);
        assert!(s.yield_current().is_none(), "queue no longer holds it");

        // The running thread cannot be retracted.
        assert_eq!(s.retract(tids[0]), Err(SchedError::NoSuchThread));
    }

    #[test]
    fn spawned_threads_have_disjoint_stacks() {
        let (s, _, tids) = sched_with_threads(4);
        for (i, &a) in tids.iter().enumerate() {
            for &b in tids.iter().skip(i + 1) {
                let (a0, a1) = s.stack_range(a).unwrap();
                let (b0, b1) = s.stack_range(b).unwrap();
                assert!(a1 <= b0 || b1 <= a0);
            }
        }
    }

    #[test]
    fn take_current_entry_runs_the_captured_closure() {
        use std::sync::atomic::{AtomicBool, Ordering};
        static RAN: AtomicBool = AtomicBool::new(false);

        let mut s = Scheduler::new();
        let pid = s.create_process("shell").unwrap();
        s.spawn(
            pid,
            Box::new(|| RAN.store(true, Ordering::SeqCst)),
            4096,
            SchedParams::default(),
        )
        .unwrap();
        s.schedule().unwrap();

        let entry = s.take_current_entry().expect("entry present");
        entry();
        assert!(RAN.load(Ordering::SeqCst));
        assert!(s.take_current_entry().is_none());
    }
}
