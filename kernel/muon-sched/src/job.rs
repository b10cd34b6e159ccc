//! Shell-level job control.
//!
//! A job is a handle over one thread: id, command line, foreground flag,
//! and a wake time for sleepers. The table is fixed-size and stores the
//! command in an inline buffer, so the timer-tick sweep can run from
//! interrupt context without allocating, printing, or freeing heap memory.

use core::fmt;

use muon_core::id::{JobId, Pid, Tid};
use planck_noalloc::vec::ArrayVec;

use crate::SchedError;
use crate::scheduler::{Scheduler, Switch};
use crate::thread::ThreadState;

/// Size of the job table.
pub const MAX_JOBS: usize = 16;

/// Longest stored command line; the rest is truncated.
pub const MAX_COMMAND_LEN: usize = 64;

/// What a job is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Thread is runnable or running.
    Running,
    /// Suspended by the shell.
    Stopped,
    /// Blocked until its wake time.
    Sleeping,
    /// Underlying thread has terminated.
    Done,
}

impl JobState {
    /// Fixed-width label for listings.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Running => "Running ",
            Self::Stopped => "Stopped ",
            Self::Sleeping => "Sleeping",
            Self::Done => "Done    ",
        }
    }
}

/// One entry in the job table.
pub struct Job {
    /// Job id, as printed by the shell.
    pub id: JobId,
    /// Owning process.
    pub pid: Pid,
    /// The thread this job tracks.
    pub tid: Tid,
    /// Current state.
    pub state: JobState,
    /// Background jobs were started with `&` or moved with `bg`.
    pub background: bool,
    /// Absolute wake time in ms-since-boot; zero when not sleeping.
    pub wake_at_ms: u64,
    command: ArrayVec<u8, MAX_COMMAND_LEN>,
}

impl Job {
    /// The recorded command line.
    pub fn command(&self) -> &str {
        core::str::from_utf8(self.command.as_slice()).unwrap_or("")
    }
}

/// Copies a command into an inline buffer, truncating on char boundaries.
fn store_command(cmd: &str) -> ArrayVec<u8, MAX_COMMAND_LEN> {
    let mut buf = ArrayVec::new();
    for ch in cmd.chars() {
        let mut utf8 = [0u8; 4];
        let bytes = ch.encode_utf8(&mut utf8).as_bytes();
        if buf.len() + bytes.len() > MAX_COMMAND_LEN {
            break;
        }
        for &b in bytes {
            buf.push(b);
        }
    }
    buf
}

/// Fixed-size table of jobs.
pub struct JobTable {
    slots: [Option<Job>; MAX_JOBS],
    next_id: u32,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    /// Creates an empty table. Job ids start at 1.
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_JOBS],
            next_id: 1,
        }
    }

    /// Creates a foreground job for `(pid, tid)`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::NoFreeSlot`] when the table is full.
    pub fn add_foreground(&mut self, cmd: &str, pid: Pid, tid: Tid) -> Result<JobId, SchedError> {
        self.add(cmd, pid, tid, false)
    }

    /// Creates a background job for `(pid, tid)`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::NoFreeSlot`] when the table is full.
    pub fn add_background(&mut self, cmd: &str, pid: Pid, tid: Tid) -> Result<JobId, SchedError> {
        self.add(cmd, pid, tid, true)
    }

    fn add(&mut self, cmd: &str, pid: Pid, tid: Tid, background: bool) -> Result<JobId, SchedError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(SchedError::NoFreeSlot)?;
        let id = JobId::new(self.next_id);
        self.next_id += 1;
        *slot = Some(Job {
            id,
            pid,
            tid,
            state: JobState::Running,
            background,
            wake_at_ms: 0,
            command: store_command(cmd),
        });
        Ok(id)
    }

    /// Looks up a job by id.
    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.slots.iter().flatten().find(|j| j.id == id)
    }

    /// Looks up a job by its thread.
    pub fn by_tid_mut(&mut self, tid: Tid) -> Option<&mut Job> {
        self.slots.iter_mut().flatten().find(|j| j.tid == tid)
    }

    /// Releases a job slot.
    pub fn remove(&mut self, id: JobId) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|j| j.id == id) {
                *slot = None;
                return;
            }
        }
    }

    /// Brings a job to the foreground.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::NoJob`] for an unknown id.
    pub fn bring_foreground(&mut self, id: JobId) -> Result<(), SchedError> {
        self.set_background(id, false)
    }

    /// Sends a job to the background.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::NoJob`] for an unknown id.
    pub fn send_background(&mut self, id: JobId) -> Result<(), SchedError> {
        self.set_background(id, true)
    }

    fn set_background(&mut self, id: JobId, background: bool) -> Result<(), SchedError> {
        let job = self
            .slots
            .iter_mut()
            .flatten()
            .find(|j| j.id == id)
            .ok_or(SchedError::NoJob)?;
        job.background = background;
        Ok(())
    }

    /// Records a wake time and flips the job to `Sleeping`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::NoJob`] if the thread has no job entry.
    pub fn mark_sleeping(&mut self, tid: Tid, wake_at_ms: u64) -> Result<(), SchedError> {
        let job = self.by_tid_mut(tid).ok_or(SchedError::NoJob)?;
        job.state = JobState::Sleeping;
        job.wake_at_ms = wake_at_ms;
        Ok(())
    }

    /// Number of used slots.
    pub fn used(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Timer-tick sweep: wakes due sleepers and reaps jobs whose thread has
    /// terminated. Interrupt-safe: no allocation, no output.
    pub fn sweep(&mut self, sched: &mut Scheduler, now_ms: u64) {
        for slot in &mut self.slots {
            let Some(job) = slot else { continue };

            if job.state == JobState::Sleeping && job.wake_at_ms > 0 && now_ms >= job.wake_at_ms {
                job.wake_at_ms = 0;
                job.state = JobState::Running;
                sched.unblock(job.tid);
            }

            match sched.thread_state(job.tid) {
                None | Some(ThreadState::Terminated) => {
                    job.state = JobState::Done;
                    *slot = None;
                }
                Some(_) => {}
            }
        }
    }

    /// Writes a listing of all jobs to `out`.
    ///
    /// # Errors
    ///
    /// Propagates formatter errors.
    pub fn list(&self, out: &mut impl fmt::Write) -> fmt::Result {
        for job in self.slots.iter().flatten() {
            writeln!(
                out,
                "[{}]{} {}  {}",
                job.id,
                if job.background { '&' } else { ' ' },
                job.state.name(),
                job.command(),
            )?;
        }
        Ok(())
    }
}

/// Puts the current thread to sleep for `ms` milliseconds.
///
/// Records the wake time in the caller's job entry, blocks the thread, and
/// asks the scheduler for a successor. The caller (the kernel's `sleep_ms`)
/// performs the returned switch.
///
/// # Errors
///
/// Returns [`SchedError::NoJob`] when the current thread has no job entry —
/// the kernel falls back to a busy wait in that case — or
/// [`SchedError::NoSuchThread`] when called outside any thread.
pub fn sleep_current(
    sched: &mut Scheduler,
    jobs: &mut JobTable,
    ms: u64,
    now_ms: u64,
) -> Result<Option<Switch>, SchedError> {
    let cur = sched.current().ok_or(SchedError::NoSuchThread)?;
    jobs.mark_sleeping(cur, now_ms + ms)?;
    sched.block(cur)?;
    Ok(sched.schedule())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::SchedParams;
    use alloc::boxed::Box;
    use alloc::string::String;

    fn sched_with(n: usize) -> (Scheduler, Pid, Vec<Tid>) {
        let mut s = Scheduler::new();
        let pid = s.create_process("shell").unwrap();
        let tids = (0..n)
            .map(|_| {
                s.spawn(pid, Box::new(|| {}), 4096, SchedParams::default())
                    .unwrap()
            })
            .collect();
        (s, pid, tids)
    }

    #[test]
    fn two_sleepers_wake_together_and_finish() {
        let (mut sched, pid, tids) = sched_with(2);
        let mut jobs = JobTable::new();
        jobs.add_background("sleep 100", pid, tids[0]).unwrap();
        jobs.add_background("sleep 100", pid, tids[1]).unwrap();

        // Both threads go to sleep at t=0 with a 100 ms wake.
        sched.schedule().unwrap();
        sleep_current(&mut sched, &mut jobs, 100, 0).unwrap();
        sleep_current(&mut sched, &mut jobs, 100, 0).unwrap();

        // t=50: both still sleeping, wake times pending.
        jobs.sweep(&mut sched, 50);
        assert_eq!(jobs.used(), 2);
        for tid in [tids[0], tids[1]] {
            let job = jobs.by_tid_mut(tid).unwrap();
            assert_eq!(job.state, JobState::Sleeping);
            assert_eq!(job.wake_at_ms, 100);
        }

        // t=150: the sweep wakes both; jobs run, threads are ready.
        jobs.sweep(&mut sched, 150);
        for tid in &tids {
            assert_eq!(sched.thread_state(*tid), Some(ThreadState::Ready));
            let job = jobs.by_tid_mut(*tid).unwrap();
            assert_eq!(job.state, JobState::Running);
            assert_eq!(job.wake_at_ms, 0);
        }

        // Threads finish; the next sweep reaps both jobs.
        sched.schedule().unwrap();
        sched.exit_current();
        sched.schedule();
        sched.exit_current();
        jobs.sweep(&mut sched, 200);
        assert_eq!(jobs.used(), 0);
    }

    #[test]
    fn sweep_before_wake_time_does_nothing() {
        let (mut sched, pid, tids) = sched_with(1);
        let mut jobs = JobTable::new();
        jobs.add_background("sleep 10", pid, tids[0]).unwrap();

        sched.schedule().unwrap();
        sleep_current(&mut sched, &mut jobs, 10, 0).unwrap();
        jobs.sweep(&mut sched, 9);
        assert_eq!(sched.thread_state(tids[0]), Some(ThreadState::Blocked));
        jobs.sweep(&mut sched, 10);
        assert_eq!(sched.thread_state(tids[0]), Some(ThreadState::Ready));
    }

    #[test]
    fn sleep_without_a_job_entry_is_refused() {
        let (mut sched, _, tids) = sched_with(1);
        let mut jobs = JobTable::new();
        sched.schedule().unwrap();
        assert_eq!(
            sleep_current(&mut sched, &mut jobs, 5, 0),
            Err(SchedError::NoJob)
        );
        // The thread must not have been blocked.
        assert_eq!(sched.thread_state(tids[0]), Some(ThreadState::Running));
    }

    #[test]
    fn foreground_background_moves() {
        let (_sched, pid, tids) = sched_with(1);
        let mut jobs = JobTable::new();
        let id = jobs.add_background("wget http://example.test/", pid, tids[0]).unwrap();
        assert!(jobs.get(id).unwrap().background);

        jobs.bring_foreground(id).unwrap();
        assert!(!jobs.get(id).unwrap().background);

        jobs.send_background(id).unwrap();
        assert!(jobs.get(id).unwrap().background);

        assert_eq!(
            jobs.bring_foreground(JobId::new(99)),
            Err(SchedError::NoJob)
        );
    }

    #[test]
    fn listing_shows_state_and_command() {
        let (_sched, pid, tids) = sched_with(1);
        let mut jobs = JobTable::new();
        jobs.add_background("ping 10.0.2.2", pid, tids[0]).unwrap();

        let mut out = String::new();
        jobs.list(&mut out).unwrap();
        assert!(out.contains("ping 10.0.2.2"));
        assert!(out.contains("Running"));
        assert!(out.contains("[1]&"));
    }

    #[test]
    fn long_commands_truncate_on_char_boundaries() {
        let long: String = "é".repeat(100);
        let buf = store_command(&long);
        assert!(buf.len() <= MAX_COMMAND_LEN);
        assert!(core::str::from_utf8(buf.as_slice()).is_ok());
    }
}
