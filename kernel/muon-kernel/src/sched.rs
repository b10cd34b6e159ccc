//! Global scheduler glue: the scheduler and job-table instances, the thread
//! trampoline, and the voluntary suspension points.
//!
//! Locking discipline: every acquisition of the scheduler or job lock from
//! thread context happens with interrupts disabled, and the timer interrupt
//! only uses `try_lock`, so the single CPU can never deadlock against
//! itself.

use alloc::boxed::Box;
use alloc::string::String;

use muon_core::id::{JobId, Pid, Tid};
use muon_core::sync::SpinLock;
use muon_core::time;
use muon_sched::scheduler::Switch;
use muon_sched::{JobTable, SchedError, SchedParams, Scheduler, ThreadEntry, job};

use crate::arch::{self, interrupts};
use crate::config;

static SCHED: SpinLock<Scheduler> = SpinLock::new(Scheduler::new());
static JOBS: SpinLock<JobTable> = SpinLock::new(JobTable::new());

/// Installs the trampoline and creates the kernel's own process with its
/// idle thread.
///
/// # Panics
///
/// Panics if the tables are too small for the kernel process, which would
/// be a configuration bug.
pub fn init() {
    let kernel_pid = interrupts::without(|| {
        let mut sched = SCHED.lock();
        sched.set_trampoline(thread_trampoline as usize as u64);
        sched.create_process("kernel").expect("process table empty at boot")
    });

    // The idle thread keeps the ready queue non-empty so every blocking
    // thread has somewhere to switch to.
    spawn(kernel_pid, Box::new(idle_loop)).expect("spawning the idle thread");
    muon_core::kinfo!("sched: cooperative scheduler ready (pid {kernel_pid})");
}

fn idle_loop() {
    loop {
        arch::halt_once();
        yield_now();
    }
}

/// Every new thread starts here: enable interrupts, run the entry closure,
/// then exit.
extern "C" fn thread_trampoline() -> ! {
    interrupts::enable();
    let entry = with_scheduler(Scheduler::take_current_entry);
    if let Some(entry) = entry {
        entry();
    }
    exit_thread();
}

/// Runs a closure on the global scheduler with interrupts disabled.
pub fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    interrupts::without(|| f(&mut SCHED.lock()))
}

/// Runs a closure on the global job table with interrupts disabled.
pub fn with_jobs<R>(f: impl FnOnce(&mut JobTable) -> R) -> R {
    interrupts::without(|| f(&mut JOBS.lock()))
}

/// Creates a process.
///
/// # Errors
///
/// Table-full errors from the scheduler.
pub fn create_process(name: &str) -> Result<Pid, SchedError> {
    with_scheduler(|s| s.create_process(name))
}

/// Spawns a thread with the default stack size.
///
/// # Errors
///
/// Propagates scheduler errors (bad pid, full tables, no stack memory).
pub fn spawn(pid: Pid, entry: ThreadEntry) -> Result<Tid, SchedError> {
    with_scheduler(|s| s.spawn(pid, entry, config::THREAD_STACK_SIZE, SchedParams::default()))
}

/// Spawns a background job: a thread plus a job-table entry carrying the
/// command line, which the shell's `jobs` listing shows.
///
/// # Errors
///
/// Scheduler or job-table errors; the thread is not left behind when the
/// job slot cannot be created.
pub fn spawn_background_job(
    pid: Pid,
    command: &str,
    entry: ThreadEntry,
) -> Result<JobId, SchedError> {
    interrupts::disable();
    let result = {
        let mut sched = SCHED.lock();
        let mut jobs = JOBS.lock();
        match sched.spawn(pid, entry, config::THREAD_STACK_SIZE, SchedParams::default()) {
            Ok(tid) => match jobs.add_background(command, pid, tid) {
                Ok(id) => Ok(id),
                Err(e) => {
                    // Roll the thread back; it has not run yet.
                    let _ = sched.retract(tid);
                    Err(e)
                }
            },
            Err(e) => Err(e),
        }
    };
    interrupts::enable();
    result
}

/// Performs a context switch decided by the scheduler.
///
/// Must be called with interrupts disabled; returns when this thread is
/// next resumed (with the interrupt flag restored from its saved state).
fn perform(decision: Option<Switch>) {
    #[cfg(target_arch = "x86_64")]
    if let Some(switch) = decision {
        // SAFETY: The pointers come from the scheduler, which keeps both
        // contexts alive until the next decision; interrupts are disabled.
        unsafe { crate::arch::x86_64::switch_context(switch.prev, switch.next) };
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = decision;
}

/// Voluntarily gives up the CPU.
pub fn yield_now() {
    interrupts::disable();
    let decision = SCHED.lock().yield_current();
    perform(decision);
    interrupts::enable();
}

/// Blocks a thread; if it is the current one, switches away immediately.
pub fn block(tid: Tid) {
    interrupts::disable();
    let decision = {
        let mut sched = SCHED.lock();
        let _ = sched.block(tid);
        if sched.current() == Some(tid) {
            sched.schedule()
        } else {
            None
        }
    };
    perform(decision);
    interrupts::enable();
}

/// Makes a blocked thread runnable.
pub fn unblock(tid: Tid) {
    with_scheduler(|s| s.unblock(tid));
}

/// Sleeps the current thread for `ms` milliseconds.
///
/// Threads without a job entry (kernel-internal ones) fall back to a
/// halting busy-wait, as does the boot flow before threading is up.
pub fn sleep_ms(ms: u64) {
    interrupts::disable();
    let decision = {
        let mut sched = SCHED.lock();
        let mut jobs = JOBS.lock();
        job::sleep_current(&mut sched, &mut jobs, ms, time::uptime_ms())
    };
    match decision {
        Ok(switch) => {
            // With the idle thread always runnable `switch` is always Some;
            // a None here just means we resume once the sweep wakes us.
            perform(switch);
            interrupts::enable();
        }
        Err(_) => {
            interrupts::enable();
            busy_sleep(ms);
        }
    }
}

/// Halting busy-wait used before threading is up.
fn busy_sleep(ms: u64) {
    let deadline = time::ticks() + time::ms_to_ticks(ms);
    while time::ticks() < deadline {
        arch::halt_once();
        core::hint::spin_loop();
    }
}

/// Terminates the current thread. Never returns.
pub fn exit_thread() -> ! {
    interrupts::disable();
    let decision = SCHED.lock().exit_current();
    perform(decision);
    // Only reachable when nothing else was runnable.
    muon_core::kinfo!("sched: last thread exited, halting");
    arch::halt_forever()
}

/// Hands the boot flow over to the scheduler. Never returns.
pub fn enter() -> ! {
    interrupts::disable();
    let decision = SCHED.lock().schedule();
    perform(decision);
    // The boot context is never scheduled again.
    arch::halt_forever()
}

/// Timer-interrupt entry point.
///
/// Counts the tick and runs the job sweep (wake due sleepers, reap dead
/// jobs). Interrupt-safe: no allocation, no output, and `try_lock` only —
/// if the interrupted code holds a scheduler lock the sweep simply waits
/// for the next tick.
pub fn timer_tick() {
    time::tick();

    let Some(mut sched) = SCHED.try_lock() else {
        return;
    };
    let Some(mut jobs) = JOBS.try_lock() else {
        return;
    };
    jobs.sweep(&mut sched, time::uptime_ms());
}

/// Formats the job listing into `out` (the `jobs` shell command).
pub fn list_jobs(out: &mut String) {
    with_jobs(|jobs| {
        let _ = jobs.list(out);
    });
}
