use crate::shared::{ProtoResult, RingIdx};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::num::NonZeroUsize;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

/// Bytes per timeline slot.
pub const SLOT_SIZE: usize = 4;

/// Wrap-aware sequence comparison: true when `later` is ahead of `earlier`
/// on the 32-bit timeline.
#[inline]
pub fn seq_after(later: u32, earlier: u32) -> bool {
    later != earlier && later.wrapping_sub(earlier) < 1 << 31
}

/// The per-context fence timeline: a shared-memory array of 32-bit counters,
/// one slot per ring, written by the fence path with release stores and read
/// by the guest with acquire loads. Never locked.
#[derive(Debug)]
pub struct Timeline {
    ptr: Option<NonNull<AtomicU32>>,
    count: usize,
    mapped_len: usize,
}

// The mapping is plain shared memory accessed through atomics only.
unsafe impl Send for Timeline {}
unsafe impl Sync for Timeline {}

impl Timeline {
    /// Maps `size` bytes of the supplied shared-memory descriptor and zeroes
    /// every slot. A size below one slot yields an empty timeline that
    /// accepts no fences; a size that is not slot-aligned loses the tail.
    pub fn map(fd: RawFd, size: usize) -> ProtoResult<Timeline> {
        let count = size / SLOT_SIZE;

        if count == 0 {
            return Ok(Timeline {
                ptr: None,
                count: 0,
                mapped_len: 0,
            });
        }

        let len = NonZeroUsize::new(size).expect("Slot count and size disagree");

        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )?
        };

        let timeline = Timeline {
            ptr: NonNull::new(ptr as *mut AtomicU32),
            count,
            mapped_len: size,
        };

        timeline.reset();

        Ok(timeline)
    }

    /// The number of rings this timeline covers.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    fn slot(&self, ring: RingIdx) -> Option<&AtomicU32> {
        if (ring as usize) >= self.count {
            return None;
        }

        let ptr = self.ptr?.as_ptr();

        // In bounds per the check above; the mapping outlives `self`.
        Some(unsafe { &*ptr.add(ring as usize) })
    }

    /// Publishes `seq` on the ring's slot. Returns false for a ring this
    /// timeline does not cover. Callable from any thread.
    #[inline]
    pub fn store(&self, ring: RingIdx, seq: u32) -> bool {
        match self.slot(ring) {
            Some(slot) => {
                slot.store(seq, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Reads the ring's current sequence number.
    #[inline]
    pub fn load(&self, ring: RingIdx) -> Option<u32> {
        self.slot(ring).map(|slot| slot.load(Ordering::Acquire))
    }

    /// Zeroes every slot.
    pub fn reset(&self) {
        for ring in 0..self.count {
            if let Some(slot) = self.slot(ring as RingIdx) {
                slot.store(0, Ordering::Release);
            }
        }
    }
}

impl Drop for Timeline {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr {
            // Nothing useful to do about an unmap failure at teardown.
            let _ = unsafe { munmap(ptr.as_ptr().cast(), self.mapped_len) };
        }
    }
}
