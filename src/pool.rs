//! Pool module: segregated-fit allocator over pinned regions.
//!
//! Region `i` is `base_size << i` bytes. Region 0 is acquired at
//! construction; later regions are acquired by the worker and handed in
//! through [`Pool::commit`]. `allocate`/`reallocate`/`free` never touch the
//! OS: they search a two-level free-list table (four sub-classes per power
//! of two, one bit per class in a `u128`), then bump from the current
//! region, and otherwise fail with [`PoolError::OutOfMemory`].
//!
//! After every call the pool compares `used` to `space / 2` and, when the
//! high-water mark is crossed, pushes one [`GrowthRequest`] onto a lock-free
//! queue for the worker. At most one request is in flight.

// IMPORTANT: allocate/reallocate/free/resize run on the audio thread. No
// assert_invariant, no logging, no heap allocation in those paths.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use rtrb::{Consumer, Producer, RingBuffer};
use thiserror::Error;

use crate::invariant_ppt::{
    assert_invariant, POOL_INITIAL_REGION, POOL_REGION_ORDER, POOL_SPACE_CONSISTENT,
};
use crate::region::{Region, RegionError};

/// Smallest block handed out, header included.
pub const MIN_BLOCK: usize = 32;
/// Per-block header: `[u32 block_size][u32 tag]`.
pub const BLOCK_HEADER: usize = 8;
/// Upper bound on `max_regions`.
pub const MAX_REGIONS: usize = 16;

const SL_SHIFT: u32 = 2;
const SL_COUNT: usize = 1 << SL_SHIFT;
const FL_MIN: u32 = MIN_BLOCK.trailing_zeros();
const CLASS_COUNT: usize = 128;
const NIL: u64 = u64::MAX;
const TAG_USED: u32 = 0x5553_4544;
const TAG_FREE: u32 = 0x4652_4545;

/// Pool failures. None of them allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("pool exhausted")]
    OutOfMemory,
    #[error("pointer does not reference a live allocation")]
    InvalidPointer,
    #[error("region {got} committed out of order, expected {expected}")]
    RegionOrder { expected: u32, got: u32 },
    #[error("region {index} has {got} bytes, expected {expected}")]
    RegionSize {
        index: u32,
        expected: usize,
        got: usize,
    },
    #[error("all {max} regions already committed")]
    FullyExtended { max: usize },
}

/// Handle to a live allocation: region index plus payload offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolPtr {
    region: u32,
    offset: u32,
}

impl PoolPtr {
    #[inline]
    pub fn region(&self) -> u32 {
        self.region
    }

    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

/// Descriptor handed from the pool to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowthRequest {
    pub region_index: u32,
}

/// Lock-free view of the pool's accounting, readable from any thread.
#[derive(Debug, Default)]
pub struct PoolCounters {
    used: AtomicUsize,
    space: AtomicUsize,
    regions: AtomicUsize,
    growth_requests: AtomicU64,
}

impl PoolCounters {
    /// Bytes requested by live allocations.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Sum of committed region sizes.
    pub fn space(&self) -> usize {
        self.space.load(Ordering::Relaxed)
    }

    /// Committed regions.
    pub fn regions(&self) -> usize {
        self.regions.load(Ordering::Relaxed)
    }

    /// Growth requests emitted over the pool's lifetime.
    pub fn growth_requests(&self) -> u64 {
        self.growth_requests.load(Ordering::Relaxed)
    }
}

/// Size of region `index` for a given base size.
pub fn region_size(base_size: usize, index: u32) -> Option<usize> {
    base_size.checked_mul(1usize.checked_shl(index)?)
}

#[derive(Debug)]
struct Slot {
    region: Region,
    top: usize,
}

/// The allocator handle.
pub struct Pool {
    slots: Vec<Slot>,
    heads: [u64; CLASS_COUNT],
    bitmap: u128,
    cursor: usize,
    base_size: usize,
    max_regions: usize,
    in_flight: bool,
    fully_extended: bool,
    growth_tx: Producer<GrowthRequest>,
    counters: Arc<PoolCounters>,
}

impl Pool {
    /// Acquire region 0 and create the growth queue.
    ///
    /// The returned consumer belongs to the worker.
    pub fn new(
        base_size: usize,
        max_regions: usize,
    ) -> Result<(Self, Consumer<GrowthRequest>), RegionError> {
        let region = Region::acquire(0, base_size)?;
        assert_invariant(
            POOL_INITIAL_REGION,
            region.len() == base_size,
            "Initial region committed at full base size",
            Some("Pool::new"),
        );

        let max_regions = max_regions.clamp(1, MAX_REGIONS);
        let (growth_tx, growth_rx) = RingBuffer::new(max_regions);
        let counters = Arc::new(PoolCounters::default());
        counters.space.store(region.len(), Ordering::Relaxed);
        counters.regions.store(1, Ordering::Relaxed);

        let mut slots = Vec::with_capacity(max_regions);
        slots.push(Slot { region, top: 0 });

        Ok((
            Self {
                slots,
                heads: [NIL; CLASS_COUNT],
                bitmap: 0,
                cursor: 0,
                base_size,
                max_regions,
                in_flight: false,
                fully_extended: false,
                growth_tx,
                counters,
            },
            growth_rx,
        ))
    }

    /// Shared accounting handle.
    pub fn counters(&self) -> &Arc<PoolCounters> {
        &self.counters
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.counters.used()
    }

    #[inline]
    pub fn space(&self) -> usize {
        self.counters.space()
    }

    pub fn region_count(&self) -> usize {
        self.slots.len()
    }

    pub fn max_regions(&self) -> usize {
        self.max_regions
    }

    pub fn base_size(&self) -> usize {
        self.base_size
    }

    /// A growth request was sent and not yet answered.
    pub fn is_growth_in_flight(&self) -> bool {
        self.in_flight
    }

    /// No further growth will be requested.
    pub fn is_fully_extended(&self) -> bool {
        self.fully_extended
    }

    /// Allocate `size` bytes.
    pub fn allocate(&mut self, size: usize) -> Result<PoolPtr, PoolError> {
        let result = self.allocate_block(size);
        if result.is_ok() {
            self.counters.used.fetch_add(size, Ordering::Relaxed);
        }
        self.check_growth();
        result
    }

    /// Resize an allocation from `old` to `new` bytes, keeping its content.
    ///
    /// On failure the original allocation is untouched.
    pub fn reallocate(&mut self, ptr: PoolPtr, old: usize, new: usize) -> Result<PoolPtr, PoolError> {
        let result = self.reallocate_block(ptr, old, new);
        if result.is_ok() {
            self.adjust_used(new, old);
        }
        self.check_growth();
        result
    }

    /// Release an allocation of `size` bytes.
    pub fn free(&mut self, ptr: PoolPtr, size: usize) -> Result<(), PoolError> {
        let result = self.free_block(ptr);
        if result.is_ok() {
            self.adjust_used(0, size);
        }
        self.check_growth();
        result
    }

    /// Interpreter-style allocator hook.
    ///
    /// `new == 0` frees, `ptr == None` allocates, anything else reallocates.
    pub fn resize(
        &mut self,
        ptr: Option<PoolPtr>,
        old: usize,
        new: usize,
    ) -> Result<Option<PoolPtr>, PoolError> {
        match (ptr, new) {
            (Some(ptr), 0) => self.free(ptr, old).map(|()| None),
            (None, 0) => Ok(None),
            (None, new) => self.allocate(new).map(Some),
            (Some(ptr), new) => self.reallocate(ptr, old, new).map(Some),
        }
    }

    /// Payload capacity of a live allocation.
    pub fn usable_size(&self, ptr: PoolPtr) -> Option<usize> {
        self.locate(ptr)
            .ok()
            .map(|(_, _, block_size)| block_size - BLOCK_HEADER)
    }

    /// Read `len` payload bytes of a live allocation.
    pub fn bytes(&self, ptr: PoolPtr, len: usize) -> Option<&[u8]> {
        let (slot, block, block_size) = self.locate(ptr).ok()?;
        if len > block_size - BLOCK_HEADER {
            return None;
        }
        let start = block + BLOCK_HEADER;
        self.slots[slot].region.as_slice().get(start..start + len)
    }

    /// Write access to `len` payload bytes of a live allocation.
    pub fn bytes_mut(&mut self, ptr: PoolPtr, len: usize) -> Option<&mut [u8]> {
        let (slot, block, block_size) = self.locate(ptr).ok()?;
        if len > block_size - BLOCK_HEADER {
            return None;
        }
        let start = block + BLOCK_HEADER;
        self.slots[slot].region.as_mut_slice().get_mut(start..start + len)
    }

    /// Register the region answering the in-flight growth request.
    ///
    /// Worker only, under the execution lock. Regions must arrive in
    /// index order at their geometric size.
    pub fn commit(&mut self, region: Region) -> Result<(), PoolError> {
        let expected = self.slots.len();
        if expected >= self.max_regions {
            return Err(PoolError::FullyExtended {
                max: self.max_regions,
            });
        }
        if region.index() as usize != expected {
            return Err(PoolError::RegionOrder {
                expected: expected as u32,
                got: region.index(),
            });
        }
        let want = region_size(self.base_size, region.index()).unwrap_or(0);
        if region.len() != want {
            return Err(PoolError::RegionSize {
                index: region.index(),
                expected: want,
                got: region.len(),
            });
        }

        self.counters
            .space
            .fetch_add(region.len(), Ordering::Relaxed);
        self.slots.push(Slot { region, top: 0 });
        self.counters
            .regions
            .store(self.slots.len(), Ordering::Relaxed);
        self.in_flight = false;

        assert_invariant(
            POOL_REGION_ORDER,
            self.slots
                .iter()
                .enumerate()
                .all(|(i, s)| s.region.index() as usize == i),
            "Regions committed in index order",
            Some("Pool::commit"),
        );
        assert_invariant(
            POOL_SPACE_CONSISTENT,
            self.slots.iter().map(|s| s.region.len()).sum::<usize>() == self.space(),
            "Space equals the sum of committed region sizes",
            Some("Pool::commit"),
        );
        Ok(())
    }

    /// Give up on the in-flight growth request; stop requesting more.
    pub fn abandon_growth(&mut self) {
        self.in_flight = false;
        self.fully_extended = true;
    }

    fn check_growth(&mut self) {
        if self.in_flight || self.fully_extended {
            return;
        }
        if self.used() <= self.space() / 2 {
            return;
        }
        let next = self.slots.len();
        if next >= self.max_regions {
            self.fully_extended = true;
            return;
        }
        let request = GrowthRequest {
            region_index: next as u32,
        };
        if self.growth_tx.push(request).is_ok() {
            self.in_flight = true;
            self.counters.growth_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn adjust_used(&self, add: usize, sub: usize) {
        let used = self.counters.used.load(Ordering::Relaxed);
        self.counters
            .used
            .store((used + add).saturating_sub(sub), Ordering::Relaxed);
    }

    fn allocate_block(&mut self, size: usize) -> Result<PoolPtr, PoolError> {
        let need = block_size(size).ok_or(PoolError::OutOfMemory)?;
        if let Some(class) = class_ceil(need) {
            let available = self.bitmap & (u128::MAX << class);
            if available != 0 {
                let class = available.trailing_zeros() as usize;
                let (slot, block) = self.pop_free(class);
                let have = get_u32(self.slots[slot].region.as_slice(), block) as usize;
                return Ok(self.carve(slot, block, have, need));
            }
        }
        self.bump(need).ok_or(PoolError::OutOfMemory)
    }

    fn reallocate_block(&mut self, ptr: PoolPtr, old: usize, new: usize) -> Result<PoolPtr, PoolError> {
        let (slot, block, have) = self.locate(ptr)?;
        let need = block_size(new).ok_or(PoolError::OutOfMemory)?;
        if need <= have {
            return Ok(ptr);
        }
        // Grow in place at the bump frontier.
        if slot == self.cursor
            && block + have == self.slots[slot].top
            && block + need <= self.slots[slot].region.len()
        {
            self.slots[slot].top = block + need;
            put_u32(self.slots[slot].region.as_mut_slice(), block, need as u32);
            return Ok(ptr);
        }
        let dst = self.allocate_block(new)?;
        self.copy_payload(ptr, dst, old.min(new).min(have - BLOCK_HEADER));
        self.free_block(ptr)?;
        Ok(dst)
    }

    fn free_block(&mut self, ptr: PoolPtr) -> Result<(), PoolError> {
        let (slot, block, size) = self.locate(ptr)?;
        if slot == self.cursor && block + size == self.slots[slot].top {
            self.slots[slot].top = block;
            put_u32(self.slots[slot].region.as_mut_slice(), block + 4, TAG_FREE);
        } else {
            self.push_free(slot, block, size);
        }
        Ok(())
    }

    fn locate(&self, ptr: PoolPtr) -> Result<(usize, usize, usize), PoolError> {
        let slot = ptr.region as usize;
        let offset = ptr.offset as usize;
        let s = self.slots.get(slot).ok_or(PoolError::InvalidPointer)?;
        if offset % BLOCK_HEADER != 0 || offset < BLOCK_HEADER || offset > s.top {
            return Err(PoolError::InvalidPointer);
        }
        let block = offset - BLOCK_HEADER;
        let buf = s.region.as_slice();
        let size = get_u32(buf, block) as usize;
        let tag = get_u32(buf, block + 4);
        if tag != TAG_USED || size < MIN_BLOCK || block + size > s.top {
            return Err(PoolError::InvalidPointer);
        }
        Ok((slot, block, size))
    }

    fn carve(&mut self, slot: usize, block: usize, have: usize, need: usize) -> PoolPtr {
        let mut size = have;
        if have - need >= MIN_BLOCK {
            self.push_free(slot, block + need, have - need);
            size = need;
        }
        let buf = self.slots[slot].region.as_mut_slice();
        put_u32(buf, block, size as u32);
        put_u32(buf, block + 4, TAG_USED);
        PoolPtr {
            region: slot as u32,
            offset: (block + BLOCK_HEADER) as u32,
        }
    }

    fn bump(&mut self, need: usize) -> Option<PoolPtr> {
        while self.cursor < self.slots.len() {
            let slot = self.cursor;
            let top = self.slots[slot].top;
            let len = self.slots[slot].region.len();
            if top + need <= len {
                self.slots[slot].top = top + need;
                return Some(self.carve(slot, top, need, need));
            }
            if self.cursor + 1 == self.slots.len() {
                // Keep the frontier open for the next committed region.
                return None;
            }
            let tail = len - top;
            self.slots[slot].top = len;
            if tail >= MIN_BLOCK {
                self.push_free(slot, top, tail);
            }
            self.cursor += 1;
        }
        None
    }

    fn push_free(&mut self, slot: usize, block: usize, size: usize) {
        let class = class_floor(size);
        let head = self.heads[class];
        let buf = self.slots[slot].region.as_mut_slice();
        put_u32(buf, block, size as u32);
        put_u32(buf, block + 4, TAG_FREE);
        put_u64(buf, block + BLOCK_HEADER, head);
        self.heads[class] = encode(slot, block);
        self.bitmap |= 1u128 << class;
    }

    fn pop_free(&mut self, class: usize) -> (usize, usize) {
        let (slot, block) = decode(self.heads[class]);
        let next = get_u64(self.slots[slot].region.as_slice(), block + BLOCK_HEADER);
        self.heads[class] = next;
        if next == NIL {
            self.bitmap &= !(1u128 << class);
        }
        (slot, block)
    }

    fn copy_payload(&mut self, src: PoolPtr, dst: PoolPtr, len: usize) {
        let (s, d) = (src.region as usize, dst.region as usize);
        let (so, dof) = (src.offset as usize, dst.offset as usize);
        if s == d {
            self.slots[s]
                .region
                .as_mut_slice()
                .copy_within(so..so + len, dof);
        } else if s < d {
            let (lo, hi) = self.slots.split_at_mut(d);
            hi[0].region.as_mut_slice()[dof..dof + len]
                .copy_from_slice(&lo[s].region.as_slice()[so..so + len]);
        } else {
            let (lo, hi) = self.slots.split_at_mut(s);
            lo[d].region.as_mut_slice()[dof..dof + len]
                .copy_from_slice(&hi[0].region.as_slice()[so..so + len]);
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Release in reverse acquisition order.
        while let Some(slot) = self.slots.pop() {
            drop(slot);
        }
    }
}

#[inline]
fn block_size(request: usize) -> Option<usize> {
    let raw = request.checked_add(BLOCK_HEADER + 7)? & !7;
    Some(raw.max(MIN_BLOCK)).filter(|&s| s <= u32::MAX as usize)
}

/// Class holding free blocks of `size` bytes (round down).
#[inline]
fn class_floor(size: usize) -> usize {
    let fl = usize::BITS - 1 - size.leading_zeros();
    let sl = (size >> (fl - SL_SHIFT)) & (SL_COUNT - 1);
    ((fl - FL_MIN) as usize * SL_COUNT + sl).min(CLASS_COUNT - 1)
}

/// Smallest size stored in class `class`.
#[inline]
fn class_lower(class: usize) -> usize {
    let fl = (class / SL_COUNT) as u32 + FL_MIN;
    let sl = class % SL_COUNT;
    (1usize << fl) + (sl << (fl - SL_SHIFT))
}

/// First class whose every block fits `size` bytes (round up).
#[inline]
fn class_ceil(size: usize) -> Option<usize> {
    let class = class_floor(size);
    if class_lower(class) >= size {
        Some(class)
    } else if class + 1 < CLASS_COUNT {
        Some(class + 1)
    } else {
        None
    }
}

#[inline]
fn encode(slot: usize, block: usize) -> u64 {
    ((slot as u64) << 32) | block as u64
}

#[inline]
fn decode(link: u64) -> (usize, usize) {
    ((link >> 32) as usize, (link & 0xFFFF_FFFF) as usize)
}

#[inline]
fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

#[inline]
fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[inline]
fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}
