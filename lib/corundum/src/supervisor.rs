use crate::dispatch::{context_main, DispatchArgs};
use crate::jail::Jail;
use crate::net::transport::Transport;
use crate::net::wire::Handshake;
use crate::render::backend::RendererBackend;
use crate::render::state::RenderState;
use crate::shared::{CtxId, ErrorType, ErrorUtils, ProtoError, ProtoResult};
use crate::worker::{SchedulingMode, Worker};
use flux::logging;
use indexmap::IndexMap;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{
    accept4, bind, listen, socket, AddressFamily, SockFlag, SockType, UnixAddr,
};
use std::fs;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

const LISTEN_BACKLOG: usize = 8;

/// Owns the listening socket and the worker records. Each proxy connection
/// delivers one handshake naming a context and carrying its pre-connected
/// socket; the supervisor spawns a worker around it and keeps reaping
/// finished workers as it goes.
pub struct Supervisor {
    listener: OwnedFd,
    mode: SchedulingMode,
    jail: Jail,
    state: RenderState,
    backend: fn() -> Box<dyn RendererBackend>,
    workers: IndexMap<CtxId, Worker>,
    log: logging::Logger,
}

impl Supervisor {
    const POLL_INTERVAL_MS: libc::c_int = 200;

    /// Binds the listening socket at `path`, replacing a stale socket file
    /// from an earlier run.
    pub fn bind<'a, P, L>(
        path: P,
        mode: SchedulingMode,
        jail: Jail,
        state: RenderState,
        backend: fn() -> Box<dyn RendererBackend>,
        log: L,
    ) -> ProtoResult<Supervisor>
    where
        P: AsRef<Path>,
        L: Into<Option<&'a logging::Logger>>,
    {
        let log = logging::child(log);
        let path = path.as_ref();

        let _ = fs::remove_file(path);

        let listener = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let listener = unsafe { OwnedFd::from_raw_fd(listener) };

        let addr = UnixAddr::new(path)?;
        bind(listener.as_raw_fd(), &addr)?;
        listen(listener.as_raw_fd(), LISTEN_BACKLOG)?;

        logging::info!(log, "listening for proxy connections";
                       "path" => %path.display(),
                       "mode" => ?mode);

        Ok(Supervisor {
            listener,
            mode,
            jail,
            state,
            backend,
            workers: IndexMap::new(),
            log,
        })
    }

    /// Serves connections until accept fails.
    pub fn run(&mut self) -> ProtoResult<()> {
        loop {
            self.poll_once()?;
        }
    }

    /// One pass: wait briefly for a connection, admit it if one arrived,
    /// then sweep finished workers.
    pub fn poll_once(&mut self) -> ProtoResult<()> {
        let mut fds = [PollFd::new(self.listener.as_raw_fd(), PollFlags::POLLIN)];

        let ready = match poll(&mut fds, Self::POLL_INTERVAL_MS) {
            Ok(ready) => ready,
            Err(Errno::EINTR) => 0,
            Err(errno) => return Err(errno.into()),
        };

        if ready > 0 {
            match accept4(self.listener.as_raw_fd(), SockFlag::SOCK_CLOEXEC) {
                Ok(conn) => {
                    let conn = unsafe { OwnedFd::from_raw_fd(conn) };
                    self.admit(conn);
                }
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => (),
                Err(errno) => return Err(errno.into()),
            }
        }

        self.housekeeping();

        Ok(())
    }

    /// Live worker records, reaped or not.
    #[inline]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Reads the handshake off a fresh connection and spawns its worker. A
    /// bad handshake costs the connection and nothing else.
    fn admit(&mut self, conn: OwnedFd) {
        let handoff = Transport::from_fd(conn, &self.log);

        let result = self.admit_inner(&handoff);
        if result.has_failed() {
            logging::warn!(self.log, "context handshake rejected"; "result" => ?result);
        }
    }

    fn admit_inner(&mut self, handoff: &Transport) -> ProtoResult<()> {
        let (frame, mut fds) = handoff.receive(Handshake::SIZE, 1)?;

        let handshake = Handshake::read(&frame)?;

        if fds.len() != 1 {
            return Err(ProtoError::Fatal(ErrorType::MissingFd));
        }

        let ctx_socket = fds.pop().expect("Checked length above");
        let name = handshake.name()?.to_string();

        if self.workers.contains_key(&handshake.ctx_id) {
            logging::warn!(self.log, "duplicate context id"; "ctx_id" => handshake.ctx_id);
            return Err(ProtoError::Fatal(ErrorType::BadHandshake));
        }

        let args = DispatchArgs {
            ctx_id: handshake.ctx_id,
            capset_id: handshake.capset_id,
            flags: handshake.flags,
            name,
            socket: ctx_socket,
            mode: self.mode,
            state: self.state.clone(),
            backend: self.backend,
            log: self.log.clone(),
        };

        // A spawn failure drops `args`, closing the context socket; there
        // is no record to free yet.
        let worker = Worker::create(self.mode, &self.jail, context_main, args, &self.log)?;

        logging::info!(self.log, "context worker started";
                       "ctx_id" => handshake.ctx_id,
                       "capset_id" => handshake.capset_id);

        self.workers.insert(handshake.ctx_id, worker);

        Ok(())
    }

    /// Collects finished workers and frees their records. Records survive
    /// until their worker has actually been reaped; abnormal exits are a
    /// successful reap with a loggable status.
    fn housekeeping(&mut self) {
        let log = &self.log;

        self.workers.retain(|&ctx_id, worker| match worker.reap(false) {
            Ok(true) => {
                logging::info!(log, "context worker reaped";
                               "ctx_id" => ctx_id,
                               "status" => ?worker.status());
                false
            }
            Ok(false) => true,
            Err(err) => {
                logging::warn!(log, "worker reap failed";
                               "ctx_id" => ctx_id,
                               "error" => ?err);
                true
            }
        });
    }

    /// Kills and collects every remaining worker. Thread workers cannot be
    /// killed; they are joined, so their dispatch loops must already be
    /// winding down.
    pub fn shutdown(mut self) {
        for (&ctx_id, worker) in self.workers.iter_mut() {
            worker.kill();

            if let Err(err) = worker.reap(true) {
                logging::warn!(self.log, "worker reap failed at shutdown";
                               "ctx_id" => ctx_id,
                               "error" => ?err);
            }
        }

        self.workers.clear();
    }
}
