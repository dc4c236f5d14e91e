//! Memory-mapped register windows
//!
//! [`RegisterWindow`] is the seam between the handshake logic and whatever
//! backs the registers: a physical window of `/dev/mem` ([`MmioWindow`]) or
//! an in-memory model ([`crate::sim`]).
//!
//! Accesses go through `&self`. A receive window is shared between the
//! producer that services "word ready" events and the thread that opened it,
//! and volatile single-register accesses do not need exclusive borrows.

// MMIO registers are naturally aligned by hardware, so pointer casts are safe
#![allow(clippy::cast_ptr_alignment)]

use crate::error::{LinkError, Result};
use rustix::fs::OFlags;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Bounds-checked volatile access to a small block of device registers.
pub trait RegisterWindow: Debug + Send + Sync {
    /// Length of the window in bytes
    fn len(&self) -> usize;

    /// Whether the window is zero-length
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read one byte
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::OutOfBounds`] if `offset` is outside the window.
    fn read_u8(&self, offset: usize) -> Result<u8>;

    /// Write one byte
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::OutOfBounds`] if `offset` is outside the window.
    fn write_u8(&self, offset: usize, value: u8) -> Result<()>;

    /// Read a 32-bit register
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::OutOfBounds`] if `offset + 4` exceeds the window.
    fn read_u32(&self, offset: usize) -> Result<u32>;

    /// Write a 32-bit register
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::OutOfBounds`] if `offset + 4` exceeds the window.
    fn write_u32(&self, offset: usize, value: u32) -> Result<()>;
}

/// Reject an access of `size` bytes at `offset` that leaves a window of `limit` bytes.
pub(crate) fn check_bounds(offset: usize, size: usize, limit: usize) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(LinkError::OutOfBounds {
            offset,
            size,
            limit,
        }),
    }
}

/// Physical register window mapped from a memory device
///
/// The physical base does not need to be page aligned: the mapping starts at
/// the enclosing page and accesses are shifted by the in-page offset.
#[derive(Debug)]
pub struct MmioWindow {
    ptr: NonNull<u8>,
    map_len: usize,
    page_offset: usize,
    len: usize,
    phys: u64,
    path: PathBuf,
    _file: File,
}

impl MmioWindow {
    /// Map `len` bytes of physical memory starting at `phys`
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::MapFailed`] if the memory device cannot be opened
    /// or the mmap call fails. This is fatal for the channel being opened.
    pub fn map(path: impl AsRef<Path>, phys: u64, len: usize) -> Result<Self> {
        let path = path.as_ref();
        if len == 0 {
            return Err(LinkError::map_failed(path, phys, len, "zero-length window"));
        }

        let page_size = rustix::param::page_size() as u64;
        let page_base = phys / page_size * page_size;
        let page_offset = usize::try_from(phys - page_base)
            .map_err(|_| LinkError::map_failed(path, phys, len, "page offset overflow"))?;
        let map_len = page_offset + len;

        tracing::debug!(
            "Mapping {len:#x} bytes at {phys:#x} (page {page_base:#x} + {page_offset:#x}) from {}",
            path.display()
        );

        // O_SYNC so register writes are not cached
        #[allow(clippy::cast_possible_wrap)]
        let sync_flag = OFlags::SYNC.bits() as i32;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(sync_flag)
            .open(path)
            .map_err(|e| LinkError::map_failed(path, phys, len, e.to_string()))?;

        // SAFETY: mmap is unsafe but all preconditions hold:
        // - file descriptor is valid (just opened) and kept in the struct for
        //   the lifetime of the mapping
        // - map_len is non-zero (len checked above)
        // - page_base is page aligned, as mmap requires for the offset
        // - MAP_SHARED with READ|WRITE is what device memory needs
        // - the mapping is released exactly once in Drop
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                map_len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                page_base,
            )
        }
        .map_err(|e| LinkError::map_failed(path, phys, len, format!("mmap failed: {e}")))?;

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| LinkError::map_failed(path, phys, len, "mmap returned null"))?;

        tracing::info!("Mapped {len:#x} bytes at {phys:#x} to {ptr:p}");

        Ok(Self {
            ptr,
            map_len,
            page_offset,
            len,
            phys,
            path: path.to_path_buf(),
            _file: file,
        })
    }

    /// Physical base address of the window
    #[must_use]
    pub const fn phys(&self) -> u64 {
        self.phys
    }

    /// Memory device the window was mapped from
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn at(&self, offset: usize) -> *mut u8 {
        // SAFETY: callers bounds-check offset against len, and
        // page_offset + len == map_len, so the result stays inside the mapping.
        unsafe { self.ptr.as_ptr().add(self.page_offset + offset) }
    }
}

impl RegisterWindow for MmioWindow {
    fn len(&self) -> usize {
        self.len
    }

    fn read_u8(&self, offset: usize) -> Result<u8> {
        check_bounds(offset, 1, self.len)?;
        // SAFETY: volatile read from a mapped register; bounds checked above,
        // u8 has no alignment requirement. Volatile because hardware may
        // change the value between reads.
        let value = unsafe { self.at(offset).read_volatile() };
        tracing::trace!("Read u8 @ {:#x} = {value:#x}", self.phys + offset as u64);
        Ok(value)
    }

    fn write_u8(&self, offset: usize, value: u8) -> Result<()> {
        check_bounds(offset, 1, self.len)?;
        tracing::trace!("Write u8 @ {:#x} = {value:#x}", self.phys + offset as u64);
        // SAFETY: volatile write to a mapped register; bounds checked above.
        // Volatile because the write has hardware side effects.
        unsafe { self.at(offset).write_volatile(value) };
        Ok(())
    }

    fn read_u32(&self, offset: usize) -> Result<u32> {
        check_bounds(offset, 4, self.len)?;
        // SAFETY: volatile read from a mapped register; bounds checked above.
        // Register halves sit at 4-byte aligned physical addresses.
        let value = unsafe { self.at(offset).cast::<u32>().read_volatile() };
        tracing::trace!("Read u32 @ {:#x} = {value:#x}", self.phys + offset as u64);
        Ok(value)
    }

    fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        check_bounds(offset, 4, self.len)?;
        tracing::trace!("Write u32 @ {:#x} = {value:#x}", self.phys + offset as u64);
        // SAFETY: volatile write to a mapped, 4-byte aligned register; bounds
        // checked above.
        unsafe { self.at(offset).cast::<u32>().write_volatile(value) };
        Ok(())
    }
}

impl Drop for MmioWindow {
    fn drop(&mut self) {
        tracing::debug!("Unmapping {:#x} bytes at {:#x}", self.len, self.phys);

        // SAFETY: ptr and map_len are exactly what mmap returned and was given
        // in map(); Drop runs once, so the region is unmapped once.
        unsafe {
            if let Err(e) = munmap(self.ptr.as_ptr().cast(), self.map_len) {
                tracing::error!("munmap failed during drop: {e}");
            }
        }
    }
}

// SAFETY: MmioWindow owns its mapping exclusively; moving it between threads
// does not invalidate mmap'd memory, which is process-wide.
unsafe impl Send for MmioWindow {}

// SAFETY: every access is a bounds-checked single volatile load or store of
// a register. The struct's own fields are immutable after map().
unsafe impl Sync for MmioWindow {}
