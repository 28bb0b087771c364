use crate::context::{expand_app_name, install_app_name, Context};
use crate::net::transport::{Transport, MAX_FDS_PER_FRAME};
use crate::net::wire::{
    op_limits, split_frame, CreateResourceReply, CreateResourceRequest, DestroyResourceRequest,
    ImportResourceRequest, InitRequest, SubmitCmdRequest, SubmitFenceRequest, CMD_INLINE_SIZE,
    FENCE_MERGEABLE, MAX_REQUEST_SIZE, OP_CREATE_RESOURCE, OP_DESTROY_RESOURCE,
    OP_IMPORT_RESOURCE, OP_INIT, OP_NOP, OP_SUBMIT_CMD, OP_SUBMIT_FENCE,
};
use crate::render::backend::{FdType, MapCache, RendererBackend, RendererFlags};
use crate::render::state::RenderState;
use crate::shared::{CtxId, ErrorType, ProtoError, ProtoResult};
use crate::timeline::Timeline;
use crate::worker::SchedulingMode;
use flux::logging;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::Arc;

/// Everything a worker needs to serve one context, delivered by the
/// supervisor. The whole record moves into the worker before dispatch
/// starts.
pub struct DispatchArgs {
    pub ctx_id: CtxId,
    pub capset_id: u32,
    pub flags: u32,
    pub name: String,
    pub socket: OwnedFd,
    pub mode: SchedulingMode,
    pub state: RenderState,
    pub backend: fn() -> Box<dyn RendererBackend>,
    pub log: logging::Logger,
}

/// Worker entry point: joins the render state, runs the dispatch loop until
/// the connection closes or a request fails validation, and tears the
/// context down. Leaving this function is the only way a worker ends.
pub fn context_main(args: DispatchArgs) {
    let DispatchArgs {
        ctx_id,
        capset_id,
        flags,
        name,
        socket,
        mode,
        state,
        backend,
        log,
    } = args;

    let log = log.new(logging::o!("ctx_id" => ctx_id));

    let name = expand_app_name(&name).to_string();
    install_app_name(&name);

    let requested = RendererFlags::from_bits(flags);
    if let Err(err) = state.init(requested, mode, &log, backend) {
        logging::error!(log, "render state unavailable"; "error" => ?err);
        return;
    }

    let mut dispatcher = Dispatcher {
        transport: Transport::from_fd(socket, &log),
        state: state.clone(),
        ctx_id,
        capset_id,
        name,
        ctx: None,
        log: log.new(logging::o!()),
    };

    match dispatcher.run() {
        Ok(()) | Err(ProtoError::Disconnect) => {
            logging::debug!(log, "context disconnected");
        }
        Err(ProtoError::Fatal(err)) => {
            logging::warn!(log, "context terminated on protocol error"; "error" => ?err);
        }
    }

    dispatcher.teardown();

    let _ = state.fini();
}

struct Dispatcher {
    transport: Transport,
    state: RenderState,
    ctx_id: CtxId,
    capset_id: u32,
    name: String,
    ctx: Option<Arc<Context>>,
    log: logging::Logger,
}

impl Dispatcher {
    fn run(&mut self) -> ProtoResult<()> {
        loop {
            self.dispatch_one()?;
        }
    }

    /// Receives and executes exactly one request. Any error return ends the
    /// worker; descriptors received with a rejected frame are closed on the
    /// way out.
    fn dispatch_one(&mut self) -> ProtoResult<()> {
        let (frame, fds) = self
            .transport
            .receive(MAX_REQUEST_SIZE, MAX_FDS_PER_FRAME)?;

        let (op, body) = split_frame(&frame)?;

        let (body_size, max_fds) = match op_limits(op) {
            Some(limits) => limits,
            None => {
                logging::warn!(self.log, "unknown operation"; "op" => op);
                return Err(ProtoError::Fatal(ErrorType::UnknownOp));
            }
        };

        if body.len() != body_size {
            logging::warn!(self.log, "request body size mismatch";
                           "op" => op,
                           "expected" => body_size,
                           "received" => body.len());
            return Err(ProtoError::Fatal(ErrorType::SizeMismatch));
        }

        if fds.len() > max_fds {
            logging::warn!(self.log, "request carries too many descriptors";
                           "op" => op,
                           "max" => max_fds,
                           "received" => fds.len());
            return Err(ProtoError::Fatal(ErrorType::TooManyFds));
        }

        match op {
            OP_NOP => Ok(()),
            OP_INIT => self.op_init(body, fds),
            OP_CREATE_RESOURCE => self.op_create_resource(body),
            OP_IMPORT_RESOURCE => self.op_import_resource(body, fds),
            OP_DESTROY_RESOURCE => self.op_destroy_resource(body),
            OP_SUBMIT_CMD => self.op_submit_cmd(body),
            OP_SUBMIT_FENCE => self.op_submit_fence(body),
            _ => unreachable!(),
        }
    }

    /// The context bound by INIT; every later op requires it.
    #[inline]
    fn bound(&self) -> ProtoResult<&Arc<Context>> {
        self.ctx
            .as_ref()
            .ok_or(ProtoError::Fatal(ErrorType::NotReady))
    }

    fn op_init(&mut self, body: &[u8], mut fds: Vec<OwnedFd>) -> ProtoResult<()> {
        if self.ctx.is_some() {
            return Err(ProtoError::Fatal(ErrorType::AlreadyInit));
        }

        let request = InitRequest::read(body)?;

        if fds.is_empty() {
            return Err(ProtoError::Fatal(ErrorType::MissingFd));
        }

        let wake = if fds.len() > 1 { fds.pop() } else { None };
        let shmem = fds.pop().expect("Checked non-empty above");

        // The mapping survives the shmem descriptor, which closes with this
        // scope.
        let timeline = Timeline::map(shmem.as_raw_fd(), request.shmem_size as usize)?;

        logging::debug!(self.log, "context initialized";
                        "shmem_size" => request.shmem_size,
                        "timelines" => timeline.count(),
                        "wake" => wake.is_some());

        let ctx = Arc::new(Context::new(
            self.ctx_id,
            self.capset_id,
            self.name.clone(),
            timeline,
            wake,
            &self.log,
        ));

        if let Err(err) = self.state.create_context(self.ctx_id, &self.name) {
            logging::error!(self.log, "renderer context creation failed"; "error" => ?err);
            return Err(ProtoError::Fatal(ErrorType::Resource));
        }

        if let Err(err) = self.state.add_context(ctx.clone()) {
            logging::error!(self.log, "context registration failed"; "error" => ?err);
            self.state.destroy_context(self.ctx_id);
            return Err(ProtoError::Fatal(ErrorType::Resource));
        }

        self.ctx = Some(ctx);
        Ok(())
    }

    fn op_create_resource(&mut self, body: &[u8]) -> ProtoResult<()> {
        self.bound()?;

        let request = CreateResourceRequest::read(body)?;

        let export = self.state.create_resource(
            self.ctx_id,
            request.res_id,
            request.blob_id,
            request.blob_size,
            request.blob_flags,
        );

        // The reply goes out either way; failure is tagged with the invalid
        // descriptor type and carries no descriptor.
        let mut reply = Vec::with_capacity(CreateResourceReply::SIZE);

        match export {
            Ok((fd_type, map_info, fd)) => {
                CreateResourceReply {
                    fd_type: fd_type.into(),
                    map_info: map_info.into(),
                }
                .write(&mut reply)?;

                self.transport.send(&reply, &[fd.as_raw_fd()])?;

                // The peer owns the exported descriptor now; our copy closes
                // here.
                drop(fd);
            }
            Err(err) => {
                logging::debug!(self.log, "resource creation rejected";
                                "res_id" => request.res_id,
                                "error" => ?err);

                CreateResourceReply {
                    fd_type: FdType::Invalid.into(),
                    map_info: MapCache::None.into(),
                }
                .write(&mut reply)?;

                self.transport.send(&reply, &[])?;
            }
        }

        Ok(())
    }

    fn op_import_resource(&mut self, body: &[u8], mut fds: Vec<OwnedFd>) -> ProtoResult<()> {
        self.bound()?;

        let request = ImportResourceRequest::read(body)?;

        if fds.len() != 1 {
            return Err(ProtoError::Fatal(ErrorType::MissingFd));
        }

        if request.size == 0 {
            return Err(ProtoError::Fatal(ErrorType::ZeroSize));
        }

        let fd_type = match FdType::from_wire(request.fd_type) {
            Some(fd_type) => fd_type,
            None => return Err(ProtoError::Fatal(ErrorType::IllegalFlags)),
        };

        let fd = fds.pop().expect("Checked length above");

        if let Err(err) =
            self.state
                .import_resource(self.ctx_id, request.res_id, fd_type, fd, request.size)
        {
            // The renderer said no; the context stays usable.
            logging::debug!(self.log, "resource import rejected";
                            "res_id" => request.res_id,
                            "error" => ?err);
        }

        Ok(())
    }

    fn op_destroy_resource(&mut self, body: &[u8]) -> ProtoResult<()> {
        self.bound()?;

        let request = DestroyResourceRequest::read(body)?;

        self.state.destroy_resource(self.ctx_id, request.res_id);

        Ok(())
    }

    fn op_submit_cmd(&mut self, body: &[u8]) -> ProtoResult<()> {
        self.bound()?;

        let request = SubmitCmdRequest::read(body)?;
        let size = request.size as usize;

        if size <= CMD_INLINE_SIZE {
            // The whole command fits the inline region; nothing follows on
            // the wire.
            if let Err(err) = self.state.submit_cmd(self.ctx_id, &request.cmd[..size]) {
                logging::debug!(self.log, "command submission rejected"; "error" => ?err);
            }

            return Ok(());
        }

        let mut cmd = Vec::new();
        if cmd.try_reserve_exact(size).is_err() {
            // Not a protocol error: drop the submission but keep the
            // connection alive. The tail still has to leave the socket.
            logging::warn!(self.log, "command allocation failed, submission dropped";
                           "size" => size);
            self.transport.drain_bytes(size - CMD_INLINE_SIZE)?;
            return Ok(());
        }

        cmd.extend_from_slice(&request.cmd);
        cmd.resize(size, 0);

        // A failed tail read leaves the connection unframed and is fatal.
        self.transport.receive_exact(&mut cmd[CMD_INLINE_SIZE..])?;

        if let Err(err) = self.state.submit_cmd(self.ctx_id, &cmd) {
            logging::debug!(self.log, "command submission rejected"; "error" => ?err);
        }

        Ok(())
    }

    fn op_submit_fence(&mut self, body: &[u8]) -> ProtoResult<()> {
        let ctx = self.bound()?;

        let request = SubmitFenceRequest::read(body)?;

        if request.flags & !FENCE_MERGEABLE != 0 {
            logging::warn!(self.log, "fence carries unknown flags"; "flags" => request.flags);
            return Err(ProtoError::Fatal(ErrorType::IllegalFlags));
        }

        if request.ring_idx as usize >= ctx.timeline_count() {
            logging::warn!(self.log, "fence ring out of range";
                           "ring_idx" => request.ring_idx,
                           "timelines" => ctx.timeline_count());
            return Err(ProtoError::Fatal(ErrorType::RingOutOfRange));
        }

        let mergeable = request.flags & FENCE_MERGEABLE != 0;

        if let Err(err) =
            self.state
                .submit_fence(self.ctx_id, request.ring_idx, request.fence_id, mergeable)
        {
            // The guest sees no progress on the slot; dispatch continues.
            logging::debug!(self.log, "fence submission rejected";
                            "ring_idx" => request.ring_idx,
                            "fence_id" => request.fence_id,
                            "error" => ?err);
        }

        Ok(())
    }

    /// Context teardown in dependency order: the renderer context goes
    /// first (joining the backend's per-context threads), then the record
    /// leaves the fence path, then the mapping, eventfd and name fall with
    /// the record. The socket closes when the dispatcher drops.
    fn teardown(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.state.destroy_context(self.ctx_id);
            let _ = self.state.remove_context(self.ctx_id);
            drop(ctx);
        }
    }
}
