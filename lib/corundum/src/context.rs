use crate::shared::{CtxId, RingIdx};
use crate::timeline::Timeline;
use flux::logging;
use nix::errno::Errno;
use nix::unistd::write;
use std::env;
use std::os::unix::io::{AsRawFd, OwnedFd};

/// Environment variable carrying the guest application name, consumed by
/// driver configuration lookups inside the renderer stack.
pub const GUEST_APP_ENV: &str = "RENDER_GUEST_APP";

/// Guest process names arrive truncated to the kernel comm limit.
const COMM_TRUNCATION_LEN: usize = 15;

// Full application names recovered from their comm-truncated prefixes.
const KNOWN_APPS: &[&str] = &[
    "com.android.settings",
    "com.android.systemui",
    "org.libretro.RetroArch",
];

/// Recovers the full application name from a comm-truncated one. Names that
/// are not exactly at the truncation boundary, or that match no known
/// application, pass through unchanged. Expanding an already-full name is a
/// no-op.
pub fn expand_app_name(name: &str) -> &str {
    if name.len() != COMM_TRUNCATION_LEN {
        return name;
    }

    for &full in KNOWN_APPS {
        if full.as_bytes().starts_with(name.as_bytes()) {
            return full;
        }
    }

    name
}

/// Publishes the resolved application name for driver configuration lookups
/// and, in debug builds, names the worker after the guest application.
/// Release builds keep the generic worker thread name so guest process
/// identifiers do not leak into host tooling.
pub fn install_app_name(name: &str) {
    env::set_var(GUEST_APP_ENV, name);

    #[cfg(debug_assertions)]
    {
        if let Ok(name) = std::ffi::CString::new(name) {
            // The kernel truncates to the comm limit on its own.
            unsafe { libc::prctl(libc::PR_SET_NAME, name.as_ptr()) };
        }
    }
}

/// Per-context state shared between the dispatch loop and the fence path:
/// everything a fence retirement touches and nothing it must not. The
/// record becomes visible to fence callbacks only after INIT has bound the
/// timeline, and is immutable from then on.
#[derive(Debug)]
pub struct Context {
    ctx_id: CtxId,
    capset_id: u32,
    name: String,
    timeline: Timeline,
    wake: Option<OwnedFd>,
    log: logging::Logger,
}

impl Context {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        ctx_id: CtxId,
        capset_id: u32,
        name: String,
        timeline: Timeline,
        wake: Option<OwnedFd>,
        log: L,
    ) -> Context {
        Context {
            ctx_id,
            capset_id,
            name,
            timeline,
            wake,
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn ctx_id(&self) -> CtxId {
        self.ctx_id
    }

    #[inline]
    pub fn capset_id(&self) -> u32 {
        self.capset_id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn timeline_count(&self) -> usize {
        self.timeline.count()
    }

    /// Reads a ring's current sequence number, the guest-visible view.
    #[inline]
    pub fn timeline_seq(&self, ring: RingIdx) -> Option<u32> {
        self.timeline.load(ring)
    }

    /// Publishes fence completion: stores the low 32 bits of `fence_id` on
    /// the ring's slot and pokes the wake eventfd when one is configured.
    ///
    /// Runs on renderer-owned threads. Must stay free of any lock the
    /// dispatch loop can hold and must never call back into the renderer;
    /// the slot update is a single release store for that reason.
    pub fn retire_fence(&self, ring: RingIdx, fence_id: u64) {
        let seq = fence_id as u32;

        if !self.timeline.store(ring, seq) {
            logging::warn!(self.log, "fence retired on unmapped ring";
                           "ctx_id" => self.ctx_id,
                           "ring" => ring,
                           "fence_id" => fence_id);
            return;
        }

        if let Some(wake) = &self.wake {
            let value = 1u64.to_ne_bytes();

            loop {
                match write(wake.as_raw_fd(), &value) {
                    Ok(_) => break,
                    Err(Errno::EINTR) => continue,
                    Err(errno) => {
                        logging::warn!(self.log, "wake eventfd write failed";
                                       "ctx_id" => self.ctx_id,
                                       "errno" => ?errno);
                        break;
                    }
                }
            }
        }
    }
}
