use crate::jail::Jail;
use crate::shared::ProtoResult;
use flux::logging;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};
use std::thread;

/// How workers are scheduled onto the host. Chosen once from config.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SchedulingMode {
    /// One forked process per context.
    Subprocess,
    /// One forked process per context, entering the jail before dispatch.
    SandboxedSubprocess,
    /// One thread per context inside the server process.
    Thread,
}

impl SchedulingMode {
    /// True when workers share the server address space.
    #[inline]
    pub fn shares_address_space(self) -> bool {
        self == SchedulingMode::Thread
    }
}

enum Backing {
    Process(Pid),
    Thread(Option<thread::JoinHandle<()>>),
}

/// A single unit of isolation running the dispatch loop for one context.
/// Only the supervisor side holds the record; `kill`, `reap` and drop are
/// supervisor operations.
pub struct Worker {
    backing: Backing,
    owner: Pid,
    reaped: bool,
    status: Option<WaitStatus>,
}

impl Worker {
    /// Spawns a worker running `entry(args)`. `args` moves into the worker
    /// before dispatch begins (into the child's copy of the address space for
    /// subprocess modes, into the thread closure otherwise), so the caller's
    /// buffers are never shared with the worker.
    pub fn create<T: Send + 'static>(
        mode: SchedulingMode,
        jail: &Jail,
        entry: fn(T),
        args: T,
        log: &logging::Logger,
    ) -> ProtoResult<Worker> {
        match mode {
            SchedulingMode::Thread => {
                let handle = thread::Builder::new()
                    .name("render-worker".into())
                    .spawn(move || entry(args))
                    .map_err(crate::shared::ProtoError::from)?;

                Ok(Worker {
                    backing: Backing::Thread(Some(handle)),
                    owner: getpid(),
                    reaped: false,
                    status: None,
                })
            }
            SchedulingMode::Subprocess | SchedulingMode::SandboxedSubprocess => {
                let owner = getpid();

                match unsafe { fork() }? {
                    ForkResult::Child => {
                        if mode == SchedulingMode::SandboxedSubprocess {
                            if let Err(err) = jail.enter() {
                                logging::error!(log, "worker failed to enter jail"; "error" => ?err);
                                unsafe { libc::_exit(126) };
                            }
                        }

                        entry(args);

                        // Skip parent-owned destructors and exit handlers.
                        unsafe { libc::_exit(0) };
                    }
                    ForkResult::Parent { child } => {
                        logging::debug!(log, "worker forked"; "pid" => child.as_raw());

                        Ok(Worker {
                            backing: Backing::Process(child),
                            owner,
                            reaped: false,
                            status: None,
                        })
                    }
                }
            }
        }
    }

    /// True iff the caller is the supervisor rather than the worker itself.
    #[inline]
    pub fn is_supervisor_side(&self) -> bool {
        getpid() == self.owner
    }

    /// Forcefully terminates a subprocess worker. Thread workers cannot be
    /// killed and must leave their dispatch loop on their own.
    pub fn kill(&self) {
        if let Backing::Process(pid) = self.backing {
            if !self.reaped {
                // ESRCH races with a worker that already exited.
                let _ = kill(pid, Signal::SIGKILL);
            }
        }
    }

    /// Collects the worker. `wait` blocks until the worker exits; otherwise
    /// the call reports whether the worker was collectable right now.
    /// Idempotent: once collected, further calls succeed without syscalls.
    pub fn reap(&mut self, wait: bool) -> ProtoResult<bool> {
        if self.reaped {
            return Ok(true);
        }

        match &mut self.backing {
            Backing::Process(pid) => {
                let mut flags = WaitPidFlag::WEXITED;
                if !wait {
                    flags |= WaitPidFlag::WNOHANG;
                }

                match waitid(Id::Pid(*pid), flags)? {
                    WaitStatus::StillAlive => Ok(false),
                    status => {
                        self.status = Some(status);
                        self.reaped = true;
                        Ok(true)
                    }
                }
            }
            Backing::Thread(handle) => {
                match handle.take() {
                    Some(running) => {
                        if !wait && !running.is_finished() {
                            *handle = Some(running);
                            return Ok(false);
                        }

                        // A worker that panicked still counts as collected.
                        let _ = running.join();
                    }
                    None => (),
                }

                self.reaped = true;
                Ok(true)
            }
        }
    }

    /// Exit information recorded by a successful reap of a subprocess worker.
    #[inline]
    pub fn status(&self) -> Option<WaitStatus> {
        self.status
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if !thread::panicking() {
            debug_assert!(
                self.reaped || !self.is_supervisor_side(),
                "worker record dropped before reap"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux::logging;
    use std::sync::mpsc;
    use std::time::Duration;

    fn discard() -> logging::Logger {
        logging::child(None)
    }

    fn notify_entry(tx: mpsc::Sender<u32>) {
        tx.send(42).unwrap();
    }

    fn exit_entry(_: ()) {}

    fn pause_entry(_: ()) {
        loop {
            unsafe { libc::pause() };
        }
    }

    #[test]
    fn test_thread_worker_runs_entry() {
        let (tx, rx) = mpsc::channel();

        let mut worker =
            Worker::create(SchedulingMode::Thread, &Jail::none(), notify_entry, tx, &discard())
                .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        assert!(worker.reap(false).unwrap());
    }

    #[test]
    fn test_reap_is_idempotent() {
        let (tx, _rx) = mpsc::channel();

        let mut worker =
            Worker::create(SchedulingMode::Thread, &Jail::none(), notify_entry, tx, &discard())
                .unwrap();

        assert!(worker.reap(true).unwrap());
        assert!(worker.reap(true).unwrap());
        assert!(worker.reap(false).unwrap());
    }

    #[test]
    fn test_kill_thread_worker_is_noop() {
        let (tx, rx) = mpsc::channel();

        let mut worker =
            Worker::create(SchedulingMode::Thread, &Jail::none(), notify_entry, tx, &discard())
                .unwrap();

        worker.kill();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        assert!(worker.reap(true).unwrap());
    }

    #[test]
    fn test_subprocess_worker_exits_cleanly() {
        let mut worker = Worker::create(
            SchedulingMode::Subprocess,
            &Jail::none(),
            exit_entry,
            (),
            &discard(),
        )
        .unwrap();

        assert!(worker.is_supervisor_side());
        assert!(worker.reap(true).unwrap());

        match worker.status() {
            Some(WaitStatus::Exited(_, 0)) => (),
            status => panic!("Unexpected exit status {:?}", status),
        }
    }

    #[test]
    fn test_subprocess_worker_killed() {
        let mut worker = Worker::create(
            SchedulingMode::Subprocess,
            &Jail::none(),
            pause_entry,
            (),
            &discard(),
        )
        .unwrap();

        worker.kill();

        assert!(worker.reap(true).unwrap());

        match worker.status() {
            Some(WaitStatus::Signaled(_, Signal::SIGKILL, _)) => (),
            status => panic!("Unexpected exit status {:?}", status),
        }
    }
}
