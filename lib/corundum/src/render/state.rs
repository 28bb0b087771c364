use super::backend::{BackendError, FdType, FenceSink, MapCache, RendererBackend, RendererFlags};
use crate::context::Context;
use crate::shared::{CtxId, ResId, RingIdx};
use crate::worker::SchedulingMode;
use flux::logging;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::os::unix::io::OwnedFd;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Eq, PartialEq)]
pub enum StateError {
    NotInit,
    FlagMismatch,
    DuplicateContext,
    UnknownContext,
    LockPoisoned,
    Backend(i32),
}

impl From<BackendError> for StateError {
    #[inline]
    fn from(err: BackendError) -> Self {
        StateError::Backend(err.0)
    }
}

struct StateInner {
    init_count: u32,
    flags: Option<RendererFlags>,
    mode: Option<SchedulingMode>,
    contexts: HashMap<CtxId, Arc<Context>>,
}

struct RendererSlot {
    backend: Option<Box<dyn RendererBackend>>,
    log: logging::Logger,
}

// Lock order: state first, then renderer, whenever both are needed. Most
// paths hold exactly one. The fence path takes only the state lock.
struct Shared {
    state: Mutex<StateInner>,
    renderer: Mutex<RendererSlot>,
}

/// Process-wide renderer façade. Reference-counted init/fini with flags
/// frozen by the first successful init, a context table for the fence path,
/// and serialized access to the backend, which is not thread-safe.
///
/// Worker dispatch loops share one instance per address space; in
/// subprocess modes the table therefore never holds more than the worker's
/// own context.
#[derive(Clone)]
pub struct RenderState {
    shared: Arc<Shared>,
}

lazy_static! {
    static ref INSTANCE: RenderState = RenderState::new();
}

/// The render state shared by every worker in this address space.
#[inline]
pub fn instance() -> &'static RenderState {
    &INSTANCE
}

impl RenderState {
    pub fn new() -> RenderState {
        RenderState {
            shared: Arc::new(Shared {
                state: Mutex::new(StateInner {
                    init_count: 0,
                    flags: None,
                    mode: None,
                    contexts: HashMap::new(),
                }),
                renderer: Mutex::new(RendererSlot {
                    backend: None,
                    log: logging::child(None),
                }),
            }),
        }
    }

    #[inline]
    fn lock_state(&self) -> StateResult<MutexGuard<StateInner>> {
        self.shared.state.lock().map_err(|_| StateError::LockPoisoned)
    }

    #[inline]
    fn lock_renderer(&self) -> StateResult<MutexGuard<RendererSlot>> {
        self.shared
            .renderer
            .lock()
            .map_err(|_| StateError::LockPoisoned)
    }

    /// Initializes the singleton or joins an existing initialization.
    ///
    /// The first successful call composes the mandatory flags into
    /// `requested`, starts the backend produced by `factory`, hands it the
    /// fence sink and a child logger, and freezes `requested`. Subsequent
    /// calls must request identical flags; a mismatch fails and leaves the
    /// singleton untouched. Each success adds one reference.
    pub fn init<F>(
        &self,
        requested: RendererFlags,
        mode: SchedulingMode,
        log: &logging::Logger,
        factory: F,
    ) -> StateResult<()>
    where
        F: FnOnce() -> Box<dyn RendererBackend>,
    {
        let mut state = self.lock_state()?;

        if state.init_count > 0 {
            if state.flags != Some(requested) {
                return Err(StateError::FlagMismatch);
            }

            state.init_count += 1;
            return Ok(());
        }

        let composed = requested | RendererFlags::MANDATORY;
        let sink = self.fence_sink();

        {
            let mut slot = self.lock_renderer()?;

            let mut backend = factory();
            backend.init(composed, sink, log.new(logging::o!("subsystem" => "renderer")))?;

            slot.backend = Some(backend);
            slot.log = log.new(logging::o!());
        }

        logging::info!(log, "renderer initialized";
                       "requested" => requested.bits(),
                       "composed" => composed.bits());

        state.flags = Some(requested);
        state.mode = Some(mode);
        state.init_count = 1;

        Ok(())
    }

    /// Drops one reference; the last one cleans the backend up, exactly
    /// once, under the renderer lock.
    pub fn fini(&self) -> StateResult<()> {
        let mut state = self.lock_state()?;

        match state.init_count {
            0 => Err(StateError::NotInit),
            1 => {
                {
                    let mut slot = self.lock_renderer()?;

                    if let Some(mut backend) = slot.backend.take() {
                        backend.cleanup();
                    }
                }

                state.init_count = 0;
                state.flags = None;
                state.mode = None;

                Ok(())
            }
            _ => {
                state.init_count -= 1;
                Ok(())
            }
        }
    }

    /// Registers a context for fence retirement. At most one context per id.
    pub fn add_context(&self, ctx: Arc<Context>) -> StateResult<()> {
        let mut state = self.lock_state()?;

        if state.contexts.contains_key(&ctx.ctx_id()) {
            return Err(StateError::DuplicateContext);
        }

        state.contexts.insert(ctx.ctx_id(), ctx);
        Ok(())
    }

    pub fn remove_context(&self, ctx_id: CtxId) -> StateResult<Arc<Context>> {
        let mut state = self.lock_state()?;

        state
            .contexts
            .remove(&ctx_id)
            .ok_or(StateError::UnknownContext)
    }

    /// Finds a context by id under the state lock. Both scheduling regimes
    /// share this scan; when workers are processes the table holds at most
    /// this worker's own context and the assertion keeps that honest.
    pub fn lookup_context(&self, ctx_id: CtxId) -> Option<Arc<Context>> {
        let state = self.shared.state.lock().ok()?;

        if let Some(mode) = state.mode {
            if !mode.shares_address_space() {
                debug_assert!(
                    state.contexts.len() <= 1
                        && state.contexts.keys().all(|id| *id == ctx_id),
                    "context table must be singular in subprocess modes"
                );
            }
        }

        state
            .contexts
            .iter()
            .find(|(id, _)| **id == ctx_id)
            .map(|(_, ctx)| ctx.clone())
    }

    /// Fence completion entry point, called on backend-owned threads. Looks
    /// the context up under the state lock and publishes outside it; the
    /// renderer lock is never taken here.
    pub fn retire_fence(&self, ctx_id: CtxId, ring_idx: RingIdx, fence_id: u64) {
        if let Some(ctx) = self.lookup_context(ctx_id) {
            ctx.retire_fence(ring_idx, fence_id);
        }
    }

    fn fence_sink(&self) -> FenceSink {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);

        FenceSink::new(move |ctx_id, ring_idx, fence_id| {
            if let Some(shared) = weak.upgrade() {
                RenderState { shared }.retire_fence(ctx_id, ring_idx, fence_id);
            }
        })
    }

    fn with_backend<R, F>(&self, op: &'static str, f: F) -> StateResult<R>
    where
        F: FnOnce(&mut dyn RendererBackend) -> StateResult<R>,
    {
        let mut slot = self.lock_renderer()?;
        let slot = &mut *slot;

        let backend = slot.backend.as_mut().ok_or(StateError::NotInit)?;
        let result = f(backend.as_mut());

        if let Err(err) = &result {
            logging::warn!(slot.log, "renderer call failed"; "op" => op, "error" => ?err);
        }

        result
    }

    pub fn create_context(&self, ctx_id: CtxId, name: &str) -> StateResult<()> {
        self.with_backend("create_context", |backend| {
            backend.create_context(ctx_id, name).map_err(Into::into)
        })
    }

    pub fn destroy_context(&self, ctx_id: CtxId) {
        let _ = self.with_backend("destroy_context", |backend| {
            backend.destroy_context(ctx_id);
            Ok(())
        });
    }

    pub fn submit_cmd(&self, ctx_id: CtxId, cmd: &[u8]) -> StateResult<()> {
        self.with_backend("submit_cmd", |backend| {
            backend.submit_cmd(ctx_id, cmd).map_err(Into::into)
        })
    }

    pub fn submit_fence(
        &self,
        ctx_id: CtxId,
        ring_idx: RingIdx,
        fence_id: u64,
        mergeable: bool,
    ) -> StateResult<()> {
        self.with_backend("submit_fence", |backend| {
            backend
                .submit_fence(ctx_id, ring_idx, fence_id, mergeable)
                .map_err(Into::into)
        })
    }

    /// Allocates a blob, queries its map hint (advisory; `None` when the
    /// backend has no answer), exports it and attaches it to the context.
    /// An export or attach failure unrefs the blob before reporting.
    pub fn create_resource(
        &self,
        ctx_id: CtxId,
        res_id: ResId,
        blob_id: u64,
        size: u64,
        blob_flags: u32,
    ) -> StateResult<(FdType, MapCache, OwnedFd)> {
        self.with_backend("create_resource", |backend| {
            backend.create_blob(ctx_id, res_id, blob_id, size, blob_flags)?;

            let map_info = backend.map_info(res_id).unwrap_or(MapCache::None);

            let (fd_type, fd) = match backend.export_blob(res_id) {
                Ok(export) => export,
                Err(err) => {
                    backend.unref_resource(res_id);
                    return Err(err.into());
                }
            };

            if let Err(err) = backend.attach_resource(ctx_id, res_id) {
                backend.unref_resource(res_id);
                return Err(err.into());
            }

            Ok((fd_type, map_info, fd))
        })
    }

    /// Adopts a guest-supplied descriptor as a context resource.
    pub fn import_resource(
        &self,
        ctx_id: CtxId,
        res_id: ResId,
        fd_type: FdType,
        fd: OwnedFd,
        size: u64,
    ) -> StateResult<()> {
        if fd_type == FdType::Invalid || size == 0 {
            return Err(StateError::Backend(-libc::EINVAL));
        }

        self.with_backend("import_resource", |backend| {
            backend.import_blob(res_id, fd_type, fd, size)?;

            if let Err(err) = backend.attach_resource(ctx_id, res_id) {
                backend.unref_resource(res_id);
                return Err(err.into());
            }

            Ok(())
        })
    }

    pub fn destroy_resource(&self, ctx_id: CtxId, res_id: ResId) {
        let _ = self.with_backend("destroy_resource", |backend| {
            backend.detach_resource(ctx_id, res_id);
            backend.unref_resource(res_id);
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backend::BackendResult;
    use crate::timeline::Timeline;
    use std::os::unix::io::{AsRawFd, FromRawFd};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Calls {
        init: AtomicUsize,
        cleanup: AtomicUsize,
        unref: AtomicUsize,
        attach: AtomicUsize,
    }

    struct TestBackend {
        calls: Arc<Calls>,
        sink: Option<FenceSink>,
        fail_export: bool,
        fail_map_info: bool,
        fail_attach: bool,
    }

    impl TestBackend {
        fn stub(calls: &Arc<Calls>) -> TestBackend {
            TestBackend {
                calls: calls.clone(),
                sink: None,
                fail_export: false,
                fail_map_info: false,
                fail_attach: false,
            }
        }

        fn memfd() -> OwnedFd {
            let fd = unsafe { libc::memfd_create(b"state-test\0".as_ptr().cast(), 0) };
            assert!(fd >= 0);
            unsafe { OwnedFd::from_raw_fd(fd) }
        }
    }

    impl RendererBackend for TestBackend {
        fn init(
            &mut self,
            _flags: RendererFlags,
            fences: FenceSink,
            _log: logging::Logger,
        ) -> BackendResult<()> {
            self.calls.init.fetch_add(1, Ordering::SeqCst);
            self.sink = Some(fences);
            Ok(())
        }

        fn cleanup(&mut self) {
            self.calls.cleanup.fetch_add(1, Ordering::SeqCst);
        }

        fn create_context(
            &mut self,
            _ctx_id: CtxId,
            _name: &str,
        ) -> BackendResult<()> {
            Ok(())
        }

        fn destroy_context(&mut self, _ctx_id: CtxId) {}

        fn submit_cmd(
            &mut self,
            _ctx_id: CtxId,
            _cmd: &[u8],
        ) -> BackendResult<()> {
            Ok(())
        }

        fn submit_fence(
            &mut self,
            ctx_id: CtxId,
            ring_idx: RingIdx,
            fence_id: u64,
            _mergeable: bool,
        ) -> BackendResult<()> {
            // Synchronous retirement is enough for the façade tests.
            self.sink
                .as_ref()
                .expect("Backend not initialized")
                .retire(ctx_id, ring_idx, fence_id);
            Ok(())
        }

        fn create_blob(
            &mut self,
            _ctx_id: CtxId,
            _res_id: ResId,
            _blob_id: u64,
            _size: u64,
            _flags: u32,
        ) -> BackendResult<()> {
            Ok(())
        }

        fn export_blob(
            &mut self,
            _res_id: ResId,
        ) -> BackendResult<(FdType, OwnedFd)> {
            if self.fail_export {
                return Err(BackendError(-libc::EIO));
            }

            Ok((FdType::Shm, Self::memfd()))
        }

        fn map_info(&mut self, _res_id: ResId) -> BackendResult<MapCache> {
            if self.fail_map_info {
                return Err(BackendError(-libc::ENOSYS));
            }

            Ok(MapCache::WriteCombined)
        }

        fn import_blob(
            &mut self,
            _res_id: ResId,
            _fd_type: FdType,
            _fd: OwnedFd,
            _size: u64,
        ) -> BackendResult<()> {
            Ok(())
        }

        fn attach_resource(
            &mut self,
            _ctx_id: CtxId,
            _res_id: ResId,
        ) -> BackendResult<()> {
            if self.fail_attach {
                return Err(BackendError(-libc::ENOENT));
            }

            self.calls.attach.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn detach_resource(&mut self, _ctx_id: CtxId, _res_id: ResId) {}

        fn unref_resource(&mut self, _res_id: ResId) {
            self.calls.unref.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn discard() -> logging::Logger {
        logging::child(None)
    }

    fn init_with(
        state: &RenderState,
        calls: &Arc<Calls>,
        flags: RendererFlags,
        mode: SchedulingMode,
    ) -> StateResult<()> {
        let calls = calls.clone();
        state.init(flags, mode, &discard(), move || {
            Box::new(TestBackend::stub(&calls))
        })
    }

    fn shared_context(ctx_id: CtxId, shmem_size: usize) -> Arc<Context> {
        let fd = unsafe { libc::memfd_create(b"state-ctx\0".as_ptr().cast(), 0) };
        assert!(fd >= 0);
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        assert_eq!(
            unsafe { libc::ftruncate(fd.as_raw_fd(), shmem_size as libc::off_t) },
            0
        );

        let timeline = Timeline::map(fd.as_raw_fd(), shmem_size).unwrap();

        Arc::new(Context::new(
            ctx_id,
            0,
            "guest".to_string(),
            timeline,
            None,
            None,
        ))
    }

    #[test]
    fn test_refcounted_init_cleans_up_exactly_once() {
        let state = RenderState::new();
        let calls = Arc::new(Calls::default());

        for _ in 0..3 {
            init_with(&state, &calls, RendererFlags::empty(), SchedulingMode::Thread).unwrap();
        }

        assert_eq!(calls.init.load(Ordering::SeqCst), 1);

        state.fini().unwrap();
        state.fini().unwrap();
        assert_eq!(calls.cleanup.load(Ordering::SeqCst), 0);

        state.fini().unwrap();
        assert_eq!(calls.cleanup.load(Ordering::SeqCst), 1);

        assert_eq!(state.fini().unwrap_err(), StateError::NotInit);
        assert_eq!(calls.cleanup.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_init_flag_mismatch_leaves_state_untouched() {
        let state = RenderState::new();
        let calls = Arc::new(Calls::default());

        init_with(&state, &calls, RendererFlags::VENUS, SchedulingMode::Thread).unwrap();
        init_with(&state, &calls, RendererFlags::VENUS, SchedulingMode::Thread).unwrap();

        let result = init_with(&state, &calls, RendererFlags::NO_VIRGL, SchedulingMode::Thread);
        assert_eq!(result.unwrap_err(), StateError::FlagMismatch);

        // The failed call did not add a reference: one fini keeps the
        // renderer alive, the second releases it.
        state.fini().unwrap();
        assert_eq!(calls.cleanup.load(Ordering::SeqCst), 0);

        state.fini().unwrap();
        assert_eq!(calls.cleanup.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fresh_init_after_teardown_accepts_new_flags() {
        let state = RenderState::new();
        let calls = Arc::new(Calls::default());

        init_with(&state, &calls, RendererFlags::VENUS, SchedulingMode::Thread).unwrap();
        state.fini().unwrap();

        init_with(&state, &calls, RendererFlags::NO_VIRGL, SchedulingMode::Thread).unwrap();

        assert_eq!(calls.init.load(Ordering::SeqCst), 2);
        state.fini().unwrap();
    }

    #[test]
    fn test_ops_before_init_fail() {
        let state = RenderState::new();

        assert_eq!(
            state.submit_cmd(1, &[0u8; 4]).unwrap_err(),
            StateError::NotInit
        );
    }

    #[test]
    fn test_context_table_add_lookup_remove() {
        let state = RenderState::new();
        let calls = Arc::new(Calls::default());
        init_with(&state, &calls, RendererFlags::empty(), SchedulingMode::Thread).unwrap();

        state.add_context(shared_context(1, 8)).unwrap();
        state.add_context(shared_context(2, 8)).unwrap();

        assert_eq!(
            state.add_context(shared_context(1, 8)).unwrap_err(),
            StateError::DuplicateContext
        );

        assert_eq!(state.lookup_context(2).unwrap().ctx_id(), 2);
        assert!(state.lookup_context(3).is_none());

        state.remove_context(1).unwrap();
        assert!(state.lookup_context(1).is_none());
        assert_eq!(
            state.remove_context(1).unwrap_err(),
            StateError::UnknownContext
        );

        state.remove_context(2).unwrap();
        state.fini().unwrap();
    }

    #[test]
    fn test_fence_retirement_reaches_the_timeline() {
        let state = RenderState::new();
        let calls = Arc::new(Calls::default());
        init_with(&state, &calls, RendererFlags::empty(), SchedulingMode::Thread).unwrap();

        let ctx = shared_context(7, 16);
        state.add_context(ctx.clone()).unwrap();

        state.submit_fence(7, 3, 0x1_0000_0007, false).unwrap();

        assert_eq!(ctx.timeline_seq(3), Some(0x0000_0007));
        assert_eq!(ctx.timeline_seq(0), Some(0));

        state.remove_context(7).unwrap();
        state.fini().unwrap();
    }

    #[test]
    fn test_retire_for_unknown_context_is_dropped() {
        let state = RenderState::new();

        // No context table entry; nothing to update and nothing to do.
        state.retire_fence(9, 0, 1);
    }

    #[test]
    fn test_create_resource_success() {
        let state = RenderState::new();
        let calls = Arc::new(Calls::default());
        init_with(&state, &calls, RendererFlags::empty(), SchedulingMode::Thread).unwrap();

        let (fd_type, map_info, _fd) = state.create_resource(1, 5, 100, 4096, 0).unwrap();

        assert_eq!(fd_type, FdType::Shm);
        assert_eq!(map_info, MapCache::WriteCombined);
        assert_eq!(calls.attach.load(Ordering::SeqCst), 1);
        assert_eq!(calls.unref.load(Ordering::SeqCst), 0);

        state.fini().unwrap();
    }

    #[test]
    fn test_create_resource_map_info_failure_is_advisory() {
        let state = RenderState::new();
        let calls = Arc::new(Calls::default());

        {
            let calls = calls.clone();
            state
                .init(RendererFlags::empty(), SchedulingMode::Thread, &discard(), move || {
                    let mut backend = TestBackend::stub(&calls);
                    backend.fail_map_info = true;
                    Box::new(backend)
                })
                .unwrap();
        }

        let (_, map_info, _fd) = state.create_resource(1, 5, 100, 4096, 0).unwrap();

        assert_eq!(map_info, MapCache::None);

        state.fini().unwrap();
    }

    #[test]
    fn test_create_resource_export_failure_unrefs() {
        let state = RenderState::new();
        let calls = Arc::new(Calls::default());

        {
            let calls = calls.clone();
            state
                .init(RendererFlags::empty(), SchedulingMode::Thread, &discard(), move || {
                    let mut backend = TestBackend::stub(&calls);
                    backend.fail_export = true;
                    Box::new(backend)
                })
                .unwrap();
        }

        let result = state.create_resource(1, 5, 100, 4096, 0);

        assert_eq!(result.unwrap_err(), StateError::Backend(-libc::EIO));
        assert_eq!(calls.unref.load(Ordering::SeqCst), 1);
        assert_eq!(calls.attach.load(Ordering::SeqCst), 0);

        state.fini().unwrap();
    }

    #[test]
    fn test_create_resource_attach_failure_unrefs() {
        let state = RenderState::new();
        let calls = Arc::new(Calls::default());

        {
            let calls = calls.clone();
            state
                .init(RendererFlags::empty(), SchedulingMode::Thread, &discard(), move || {
                    let mut backend = TestBackend::stub(&calls);
                    backend.fail_attach = true;
                    Box::new(backend)
                })
                .unwrap();
        }

        let result = state.create_resource(1, 5, 100, 4096, 0);

        assert_eq!(result.unwrap_err(), StateError::Backend(-libc::ENOENT));
        assert_eq!(calls.unref.load(Ordering::SeqCst), 1);

        state.fini().unwrap();
    }

    #[test]
    fn test_import_resource_rejects_invalid_type_and_zero_size() {
        let state = RenderState::new();
        let calls = Arc::new(Calls::default());
        init_with(&state, &calls, RendererFlags::empty(), SchedulingMode::Thread).unwrap();

        let result =
            state.import_resource(1, 5, FdType::Invalid, TestBackend::memfd(), 64);
        assert_eq!(result.unwrap_err(), StateError::Backend(-libc::EINVAL));

        let result = state.import_resource(1, 5, FdType::DmaBuf, TestBackend::memfd(), 0);
        assert_eq!(result.unwrap_err(), StateError::Backend(-libc::EINVAL));

        state
            .import_resource(1, 5, FdType::DmaBuf, TestBackend::memfd(), 64)
            .unwrap();
        assert_eq!(calls.attach.load(Ordering::SeqCst), 1);

        state.fini().unwrap();
    }

    #[test]
    fn test_subprocess_lookup_asserts_singular_table() {
        let state = RenderState::new();
        let calls = Arc::new(Calls::default());
        init_with(&state, &calls, RendererFlags::empty(), SchedulingMode::Subprocess).unwrap();

        let ctx = shared_context(4, 8);
        state.add_context(ctx).unwrap();

        assert_eq!(state.lookup_context(4).unwrap().ctx_id(), 4);

        state.remove_context(4).unwrap();
        state.fini().unwrap();
    }
}
