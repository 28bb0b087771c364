use super::backend::{
    BackendError, BackendResult, FdType, FenceSink, MapCache, RendererBackend, RendererFlags,
};
use crate::shared::{CtxId, ResId, RingIdx};
use flux::logging;
use hashbrown::{HashMap, HashSet};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::unistd::ftruncate;
use std::ffi::CStr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::mpsc;
use std::thread;

const ERR_INVAL: i32 = -libc::EINVAL;
const ERR_NOENT: i32 = -libc::ENOENT;
const ERR_EXIST: i32 = -libc::EEXIST;

struct Blob {
    size: u64,
    fd_type: FdType,
    map: MapCache,
    fd: OwnedFd,
}

enum SyncMsg {
    Retire {
        ctx_id: CtxId,
        ring_idx: RingIdx,
        fence_id: u64,
    },
    Shutdown,
}

/// Software renderer backend: contexts and blob resources are bookkeeping
/// entries, blobs are memfd-backed shared memory, and fences retire
/// asynchronously on a dedicated sync thread so completion reaches the fence
/// sink from a foreign thread exactly like a hardware backend.
pub struct HeadlessRenderer {
    contexts: HashMap<CtxId, HashSet<ResId>>,
    resources: HashMap<ResId, Blob>,
    sync: Option<(mpsc::Sender<SyncMsg>, thread::JoinHandle<()>)>,
    log: logging::Logger,
}

impl HeadlessRenderer {
    pub fn new() -> HeadlessRenderer {
        HeadlessRenderer {
            contexts: HashMap::new(),
            resources: HashMap::new(),
            sync: None,
            log: logging::child(None),
        }
    }

    fn blob_fd(size: u64) -> BackendResult<OwnedFd> {
        let name = CStr::from_bytes_with_nul(b"render-blob\0").expect("Static name");

        let fd = memfd_create(name, MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(|errno| BackendError(-(errno as i32)))?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        ftruncate(fd.as_raw_fd(), size as libc::off_t)
            .map_err(|errno| BackendError(-(errno as i32)))?;

        Ok(fd)
    }
}

impl RendererBackend for HeadlessRenderer {
    fn init(
        &mut self,
        flags: RendererFlags,
        fences: FenceSink,
        log: logging::Logger,
    ) -> BackendResult<()> {
        if self.sync.is_some() {
            return Err(BackendError(ERR_EXIST));
        }

        logging::debug!(log, "headless renderer starting"; "flags" => flags.bits());

        let (tx, rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("fence-sync".into())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        SyncMsg::Retire {
                            ctx_id,
                            ring_idx,
                            fence_id,
                        } => fences.retire(ctx_id, ring_idx, fence_id),
                        SyncMsg::Shutdown => break,
                    }
                }
            })
            .map_err(|err| BackendError(-err.raw_os_error().unwrap_or(libc::EAGAIN)))?;

        self.sync = Some((tx, handle));
        self.log = log;

        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some((tx, handle)) = self.sync.take() {
            let _ = tx.send(SyncMsg::Shutdown);
            let _ = handle.join();
        }

        self.contexts.clear();
        self.resources.clear();

        logging::debug!(self.log, "headless renderer stopped");
    }

    fn create_context(&mut self, ctx_id: CtxId, name: &str) -> BackendResult<()> {
        if self.contexts.contains_key(&ctx_id) {
            return Err(BackendError(ERR_EXIST));
        }

        logging::debug!(self.log, "context created"; "ctx_id" => ctx_id, "name" => name);

        self.contexts.insert(ctx_id, HashSet::new());
        Ok(())
    }

    fn destroy_context(&mut self, ctx_id: CtxId) {
        if let Some(attached) = self.contexts.remove(&ctx_id) {
            // Resources owned by the departing context go with it.
            for res_id in attached {
                self.resources.remove(&res_id);
            }
        }
    }

    fn submit_cmd(&mut self, ctx_id: CtxId, cmd: &[u8]) -> BackendResult<()> {
        if !self.contexts.contains_key(&ctx_id) {
            return Err(BackendError(ERR_NOENT));
        }

        logging::trace!(self.log, "command consumed"; "ctx_id" => ctx_id, "size" => cmd.len());

        Ok(())
    }

    fn submit_fence(
        &mut self,
        ctx_id: CtxId,
        ring_idx: RingIdx,
        fence_id: u64,
        _mergeable: bool,
    ) -> BackendResult<()> {
        if !self.contexts.contains_key(&ctx_id) {
            return Err(BackendError(ERR_NOENT));
        }

        let (tx, _) = self.sync.as_ref().ok_or(BackendError(ERR_INVAL))?;

        tx.send(SyncMsg::Retire {
            ctx_id,
            ring_idx,
            fence_id,
        })
        .map_err(|_| BackendError(ERR_INVAL))
    }

    fn create_blob(
        &mut self,
        ctx_id: CtxId,
        res_id: ResId,
        blob_id: u64,
        size: u64,
        flags: u32,
    ) -> BackendResult<()> {
        if !self.contexts.contains_key(&ctx_id) {
            return Err(BackendError(ERR_NOENT));
        }

        if self.resources.contains_key(&res_id) {
            return Err(BackendError(ERR_EXIST));
        }

        if size == 0 {
            return Err(BackendError(ERR_INVAL));
        }

        logging::trace!(self.log, "blob allocated";
                        "ctx_id" => ctx_id,
                        "res_id" => res_id,
                        "blob_id" => blob_id,
                        "size" => size,
                        "flags" => flags);

        let fd = Self::blob_fd(size)?;

        self.resources.insert(
            res_id,
            Blob {
                size,
                fd_type: FdType::Shm,
                map: MapCache::Cached,
                fd,
            },
        );

        Ok(())
    }

    fn export_blob(&mut self, res_id: ResId) -> BackendResult<(FdType, OwnedFd)> {
        let blob = self.resources.get(&res_id).ok_or(BackendError(ERR_NOENT))?;

        let fd = blob
            .fd
            .try_clone()
            .map_err(|err| BackendError(-err.raw_os_error().unwrap_or(libc::EIO)))?;

        Ok((blob.fd_type, fd))
    }

    fn map_info(&mut self, res_id: ResId) -> BackendResult<MapCache> {
        self.resources
            .get(&res_id)
            .map(|blob| blob.map)
            .ok_or(BackendError(ERR_NOENT))
    }

    fn import_blob(
        &mut self,
        res_id: ResId,
        fd_type: FdType,
        fd: OwnedFd,
        size: u64,
    ) -> BackendResult<()> {
        if self.resources.contains_key(&res_id) {
            return Err(BackendError(ERR_EXIST));
        }

        if fd_type == FdType::Invalid || size == 0 {
            return Err(BackendError(ERR_INVAL));
        }

        self.resources.insert(
            res_id,
            Blob {
                size,
                fd_type,
                map: MapCache::None,
                fd,
            },
        );

        Ok(())
    }

    fn attach_resource(&mut self, ctx_id: CtxId, res_id: ResId) -> BackendResult<()> {
        if !self.resources.contains_key(&res_id) {
            return Err(BackendError(ERR_NOENT));
        }

        let attached = self.contexts.get_mut(&ctx_id).ok_or(BackendError(ERR_NOENT))?;
        attached.insert(res_id);

        Ok(())
    }

    fn detach_resource(&mut self, ctx_id: CtxId, res_id: ResId) {
        if let Some(attached) = self.contexts.get_mut(&ctx_id) {
            attached.remove(&res_id);
        }
    }

    fn unref_resource(&mut self, res_id: ResId) {
        self.resources.remove(&res_id);

        for attached in self.contexts.values_mut() {
            attached.remove(&res_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn started() -> (HeadlessRenderer, mpsc::Receiver<(CtxId, RingIdx, u64)>) {
        let (tx, rx) = mpsc::channel();

        let sink = FenceSink::new(move |ctx_id, ring_idx, fence_id| {
            let _ = tx.send((ctx_id, ring_idx, fence_id));
        });

        let mut backend = HeadlessRenderer::new();
        backend
            .init(RendererFlags::MANDATORY, sink, logging::child(None))
            .unwrap();

        (backend, rx)
    }

    #[test]
    fn test_fence_retires_on_sync_thread() {
        let (mut backend, rx) = started();

        backend.create_context(1, "guest").unwrap();
        backend.submit_fence(1, 2, 0xf00d, false).unwrap();

        let retired = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(retired, (1, 2, 0xf00d));

        backend.cleanup();
    }

    #[test]
    fn test_fences_retire_in_submission_order() {
        let (mut backend, rx) = started();

        backend.create_context(1, "guest").unwrap();
        for fence_id in 1..=4u64 {
            backend.submit_fence(1, 0, fence_id, true).unwrap();
        }

        for fence_id in 1..=4u64 {
            let retired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(retired, (1, 0, fence_id));
        }

        backend.cleanup();
    }

    #[test]
    fn test_submit_to_unknown_context_fails() {
        let (mut backend, _rx) = started();

        assert!(backend.submit_cmd(9, &[0u8; 4]).is_err());
        assert!(backend.submit_fence(9, 0, 1, false).is_err());

        backend.cleanup();
    }

    #[test]
    fn test_blob_create_export_lifecycle() {
        let (mut backend, _rx) = started();

        backend.create_context(1, "guest").unwrap();
        backend.create_blob(1, 5, 100, 4096, 0).unwrap();

        let (fd_type, fd) = backend.export_blob(5).unwrap();

        assert_eq!(fd_type, FdType::Shm);

        // The exported descriptor is a real 4096-byte object.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        assert_eq!(unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) }, 0);
        assert_eq!(stat.st_size, 4096);

        assert_eq!(backend.map_info(5).unwrap(), MapCache::Cached);

        backend.unref_resource(5);

        assert!(backend.export_blob(5).is_err());

        backend.cleanup();
    }

    #[test]
    fn test_duplicate_blob_id_fails() {
        let (mut backend, _rx) = started();

        backend.create_context(1, "guest").unwrap();
        backend.create_blob(1, 5, 100, 64, 0).unwrap();

        assert_eq!(
            backend.create_blob(1, 5, 101, 64, 0).unwrap_err(),
            BackendError(ERR_EXIST)
        );

        backend.cleanup();
    }

    #[test]
    fn test_zero_size_blob_fails() {
        let (mut backend, _rx) = started();

        backend.create_context(1, "guest").unwrap();

        assert_eq!(
            backend.create_blob(1, 5, 100, 0, 0).unwrap_err(),
            BackendError(ERR_INVAL)
        );

        backend.cleanup();
    }

    #[test]
    fn test_import_preserves_fd_type() {
        let (mut backend, _rx) = started();

        backend.create_context(1, "guest").unwrap();

        let fd = HeadlessRenderer::blob_fd(64).unwrap();
        backend.import_blob(8, FdType::DmaBuf, fd, 64).unwrap();
        backend.attach_resource(1, 8).unwrap();

        let (fd_type, _fd) = backend.export_blob(8).unwrap();

        assert_eq!(fd_type, FdType::DmaBuf);

        backend.cleanup();
    }

    #[test]
    fn test_import_rejects_invalid_type_and_zero_size() {
        let (mut backend, _rx) = started();

        let fd = HeadlessRenderer::blob_fd(64).unwrap();
        assert_eq!(
            backend.import_blob(8, FdType::Invalid, fd, 64).unwrap_err(),
            BackendError(ERR_INVAL)
        );

        let fd = HeadlessRenderer::blob_fd(64).unwrap();
        assert_eq!(
            backend.import_blob(8, FdType::DmaBuf, fd, 0).unwrap_err(),
            BackendError(ERR_INVAL)
        );

        backend.cleanup();
    }

    #[test]
    fn test_destroy_context_releases_attached_resources() {
        let (mut backend, _rx) = started();

        backend.create_context(1, "guest").unwrap();
        backend.create_blob(1, 5, 100, 64, 0).unwrap();
        backend.attach_resource(1, 5).unwrap();

        backend.destroy_context(1);

        assert!(backend.export_blob(5).is_err());

        backend.cleanup();
    }

    #[test]
    fn test_fence_after_cleanup_fails() {
        let (mut backend, _rx) = started();

        backend.create_context(1, "guest").unwrap();
        backend.cleanup();

        // Cleanup dropped the context table along with the sync thread.
        assert!(backend.submit_fence(1, 0, 1, false).is_err());
    }
}
