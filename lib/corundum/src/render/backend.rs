use crate::shared::{CtxId, ResId, RingIdx};
use flux::logging;
use std::fmt;
use std::ops::BitOr;
use std::os::unix::io::OwnedFd;
use std::sync::Arc;

/// Renderer init bit flags. The façade composes the mandatory set into
/// whatever the proxy requested.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RendererFlags(u32);

impl RendererFlags {
    pub const VENUS: RendererFlags = RendererFlags(1 << 0);
    pub const NO_VIRGL: RendererFlags = RendererFlags(1 << 1);
    pub const THREAD_SYNC: RendererFlags = RendererFlags(1 << 2);
    pub const ASYNC_FENCE_CB: RendererFlags = RendererFlags(1 << 3);
    pub const EXTERNAL_BLOB: RendererFlags = RendererFlags(1 << 4);

    /// Flags every renderer instance runs with regardless of the request.
    pub const MANDATORY: RendererFlags = RendererFlags(
        Self::THREAD_SYNC.0 | Self::ASYNC_FENCE_CB.0 | Self::EXTERNAL_BLOB.0,
    );

    #[inline]
    pub fn empty() -> RendererFlags {
        RendererFlags(0)
    }

    #[inline]
    pub fn from_bits(bits: u32) -> RendererFlags {
        RendererFlags(bits)
    }

    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn contains(self, other: RendererFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for RendererFlags {
    type Output = RendererFlags;

    #[inline]
    fn bitor(self, rhs: RendererFlags) -> RendererFlags {
        RendererFlags(self.0 | rhs.0)
    }
}

/// Descriptor type tag travelling with every exported resource.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FdType {
    DmaBuf = 0,
    OpaqueHandle = 1,
    Shm = 2,
    Invalid = 3,
}

impl FdType {
    #[inline]
    pub fn from_wire(raw: u32) -> Option<FdType> {
        Some(match raw {
            0 => FdType::DmaBuf,
            1 => FdType::OpaqueHandle,
            2 => FdType::Shm,
            3 => FdType::Invalid,
            _ => return None,
        })
    }
}

impl From<FdType> for u32 {
    #[inline]
    fn from(fd_type: FdType) -> Self {
        fd_type as u32
    }
}

/// Map-cache hint reported for a blob resource.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MapCache {
    None = 0,
    Cached = 1,
    WriteCombined = 2,
    Uncached = 3,
}

impl From<MapCache> for u32 {
    #[inline]
    fn from(map: MapCache) -> Self {
        map as u32
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Nonzero integer error code surfaced by the renderer library.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BackendError(pub i32);

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "renderer error {}", self.0)
    }
}

/// Where the backend reports fence completion. Invoked on renderer-owned
/// threads; implementations must not call back into the backend.
#[derive(Clone)]
pub struct FenceSink(Arc<dyn Fn(CtxId, RingIdx, u64) + Send + Sync>);

impl FenceSink {
    #[inline]
    pub fn new<F: Fn(CtxId, RingIdx, u64) + Send + Sync + 'static>(retire: F) -> FenceSink {
        FenceSink(Arc::new(retire))
    }

    #[inline]
    pub fn retire(&self, ctx_id: CtxId, ring_idx: RingIdx, fence_id: u64) {
        (self.0)(ctx_id, ring_idx, fence_id)
    }
}

impl fmt::Debug for FenceSink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("FenceSink")
    }
}

/// The renderer library behind a seam. One instance per process, driven
/// exclusively through the state façade, which serializes every call.
pub trait RendererBackend: Send {
    /// Process-wide startup with the composed flag set. `fences` is where
    /// completed fences surface, possibly from threads the backend owns;
    /// `log` receives the backend's debug output.
    fn init(
        &mut self,
        flags: RendererFlags,
        fences: FenceSink,
        log: logging::Logger,
    ) -> BackendResult<()>;

    /// Process-wide teardown. Called exactly once, after the last `fini`.
    fn cleanup(&mut self);

    fn create_context(&mut self, ctx_id: CtxId, name: &str) -> BackendResult<()>;

    /// Destroys a context and joins whatever per-context threads the backend
    /// runs for it.
    fn destroy_context(&mut self, ctx_id: CtxId);

    fn submit_cmd(&mut self, ctx_id: CtxId, cmd: &[u8]) -> BackendResult<()>;

    fn submit_fence(
        &mut self,
        ctx_id: CtxId,
        ring_idx: RingIdx,
        fence_id: u64,
        mergeable: bool,
    ) -> BackendResult<()>;

    fn create_blob(
        &mut self,
        ctx_id: CtxId,
        res_id: ResId,
        blob_id: u64,
        size: u64,
        flags: u32,
    ) -> BackendResult<()>;

    /// Exports a blob to a descriptor. The caller owns the returned
    /// descriptor.
    fn export_blob(&mut self, res_id: ResId) -> BackendResult<(FdType, OwnedFd)>;

    fn map_info(&mut self, res_id: ResId) -> BackendResult<MapCache>;

    /// Adopts an externally created descriptor as a blob resource.
    fn import_blob(
        &mut self,
        res_id: ResId,
        fd_type: FdType,
        fd: OwnedFd,
        size: u64,
    ) -> BackendResult<()>;

    fn attach_resource(&mut self, ctx_id: CtxId, res_id: ResId) -> BackendResult<()>;

    fn detach_resource(&mut self, ctx_id: CtxId, res_id: ResId);

    fn unref_resource(&mut self, res_id: ResId);
}
