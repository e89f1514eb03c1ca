//! Registered shared buffer.
//!
//! The manager allocates the buffer itself so it is page aligned and never
//! moves while the device may access it. The allocation outlives the
//! registration: it is freed only after deregistration has returned.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::device::DeviceContext;
use crate::error::{RdmaError, Result};
use crate::verbs::{AccessFlags, MrKeys};

/// Alignment of every registered buffer.
pub const REGION_ALIGNMENT: usize = 4096;

/// The part of a region a peer needs to target it remotely. This is all that
/// is ever published through the rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    /// Registered start address.
    pub addr: u64,
    /// Length in bytes.
    pub len: u64,
    /// Key the peer presents for one-sided access.
    pub rkey: u32,
}

impl RegionDescriptor {
    /// Byte offset of `[addr, addr + len)` inside this region, if it fits.
    pub fn offset_of(&self, addr: u64, len: u64) -> Option<u64> {
        let offset = addr.checked_sub(self.addr)?;
        (offset.checked_add(len)? <= self.len).then_some(offset)
    }
}

/// Zero-filled, page-aligned heap allocation.
struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is plain bytes owned by this value. It is not Sync:
// `write_at` mutates through a shared reference.
unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    fn new(size: usize) -> std::result::Result<Self, String> {
        let layout = Layout::from_size_align(size, REGION_ALIGNMENT).map_err(|e| e.to_string())?;
        // SAFETY: layout has non-zero size, checked by the caller.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| format!("allocation of {} bytes failed", size))?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout in `new`.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// A buffer registered for local and remote read/write access.
pub struct MemoryRegion {
    ctx: DeviceContext,
    keys: MrKeys,
    registered: bool,
    // Declared last so it is dropped after the registration is gone.
    buffer: AlignedBuffer,
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("addr", &format_args!("{:#x}", self.keys.addr))
            .field("len", &self.len())
            .field("lkey", &format_args!("{:#x}", self.keys.lkey))
            .field("rkey", &format_args!("{:#x}", self.keys.rkey))
            .finish()
    }
}

impl MemoryRegion {
    /// Allocates `size` bytes and registers them with `ctx`'s protection
    /// domain.
    pub fn register(ctx: &DeviceContext, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(RdmaError::RegistrationFailed {
                size,
                reason: "size must be non-zero".to_string(),
            });
        }
        let buffer = AlignedBuffer::new(size)
            .map_err(|reason| RdmaError::RegistrationFailed { size, reason })?;
        let keys = ctx
            .verbs()
            .reg_mr(ctx.pd(), buffer.ptr.as_ptr(), size, AccessFlags::ALL)
            .map_err(|e| RdmaError::RegistrationFailed {
                size,
                reason: e.to_string(),
            })?;
        ctx.region_opened();
        debug!(
            device = ctx.device_name(),
            size,
            addr = keys.addr,
            rkey = keys.rkey,
            "registered memory region"
        );
        Ok(Self {
            ctx: ctx.clone(),
            keys,
            registered: true,
            buffer,
        })
    }

    /// Deregisters the region and frees its buffer.
    pub fn deregister(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if !self.registered {
            return Ok(());
        }
        self.registered = false;
        self.ctx.region_closed();
        self.ctx
            .verbs()
            .dereg_mr(self.keys.id)
            .map_err(|e| RdmaError::RegistrationFailed {
                size: self.len(),
                reason: format!("deregistration failed: {}", e),
            })
    }

    /// Address the fabric knows the buffer by.
    pub fn addr(&self) -> u64 {
        self.keys.addr
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.buffer.layout.size()
    }

    /// Always false: zero-sized registrations are rejected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key for local scatter/gather entries.
    pub fn lkey(&self) -> u32 {
        self.keys.lkey
    }

    /// Key a peer uses to target this region.
    pub fn rkey(&self) -> u32 {
        self.keys.rkey
    }

    /// What a peer needs to reach this region.
    pub fn descriptor(&self) -> RegionDescriptor {
        RegionDescriptor {
            addr: self.keys.addr,
            len: self.len() as u64,
            rkey: self.keys.rkey,
        }
    }

    pub(crate) fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(RdmaError::OutOfBounds {
                offset,
                len,
                region_len: self.len(),
            }),
        }
    }

    /// Copies bytes out of the region.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len())?;
        // SAFETY: range checked above; dst cannot alias the region because
        // the region is never handed out as a slice.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.buffer.ptr.as_ptr().add(offset),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    /// Copies bytes into the region.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len())?;
        // SAFETY: as in `read_at`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.buffer.ptr.as_ptr().add(offset),
                src.len(),
            );
        }
        Ok(())
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "dropping memory region");
        }
    }
}
