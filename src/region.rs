//! Region module: pinned anonymous memory regions backing the pool.
//!
//! Acquiring a region maps anonymous memory and tries to pin it with
//! `mlock`. This is the only place the crate asks the OS for memory after
//! setup, and it only ever runs on the worker (or during construction).

use std::io;

use memmap2::MmapMut;
use thiserror::Error;

/// Region acquisition failures.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("region {index}: zero-sized region requested")]
    Empty { index: u32 },
    #[error("region {index}: mapping {size} bytes failed: {source}")]
    Map {
        index: u32,
        size: usize,
        #[source]
        source: io::Error,
    },
}

/// One contiguous, pinned, zero-initialized memory region.
#[derive(Debug)]
pub struct Region {
    index: u32,
    map: MmapMut,
    pinned: bool,
}

impl Region {
    /// Map `size` bytes for pool slot `index` and try to pin them.
    ///
    /// A failed pin is logged and tolerated; the region stays usable but
    /// may be paged out.
    pub fn acquire(index: u32, size: usize) -> Result<Self, RegionError> {
        if size == 0 {
            return Err(RegionError::Empty { index });
        }
        let map = MmapMut::map_anon(size).map_err(|source| RegionError::Map {
            index,
            size,
            source,
        })?;
        let pinned = pin(&map);
        if pinned {
            log::debug!("region {index}: mapped and pinned {size} bytes");
        } else {
            log::warn!(
                "region {index}: mlock of {size} bytes failed ({}), continuing unpinned",
                io::Error::last_os_error()
            );
        }
        Ok(Self { index, map, pinned })
    }

    /// Pool slot this region was acquired for.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Regions are never empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Whether `mlock` succeeded.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.pinned {
            unpin(&self.map);
        }
        log::debug!("region {}: released {} bytes", self.index, self.map.len());
    }
}

#[cfg(unix)]
fn pin(map: &MmapMut) -> bool {
    // SAFETY: the range is exactly the live mapping owned by `map`.
    unsafe { libc::mlock(map.as_ptr() as *const libc::c_void, map.len()) == 0 }
}

#[cfg(unix)]
fn unpin(map: &MmapMut) {
    // SAFETY: the range was locked by `pin` and is still mapped.
    unsafe {
        libc::munlock(map.as_ptr() as *const libc::c_void, map.len());
    }
}

#[cfg(not(unix))]
fn pin(_map: &MmapMut) -> bool {
    false
}

#[cfg(not(unix))]
fn unpin(_map: &MmapMut) {}
