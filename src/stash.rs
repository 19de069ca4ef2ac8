//! Stash module: bounded per-port holding area for contended blocks.
//!
//! While the worker holds the execution lock, each input block's events are
//! appended to a pre-allocated sequence atom with their times shifted by the
//! frames already stashed. Replaying that sequence later presents the events
//! in their original order on one continuous time line.
//!
//! Once an append fails (no room, or a shifted time out of range), every
//! later event in the same stash period is dropped and counted. The buffer
//! always holds a complete, well-formed sequence.

use crate::atom::{write_u32, Key, HEADER_SIZE};
use crate::forge::Forge;
use crate::urid::Urids;
use crate::view::View;

/// Smallest usable stash: a sequence header plus one small event.
pub const MIN_STASH_CAPACITY: usize = 64;

/// Stashed input for one port.
#[derive(Debug)]
pub struct Stash {
    buf: Box<[u8]>,
    len: usize,
    offset: i64,
    blocks: u32,
    failed: bool,
    dropped: u64,
    urids: Urids,
}

impl Stash {
    /// Pre-allocate `capacity` bytes. Not for the audio thread.
    pub fn new(capacity: usize, urids: Urids) -> Self {
        let mut stash = Self {
            buf: vec![0u8; capacity.max(MIN_STASH_CAPACITY)].into_boxed_slice(),
            len: HEADER_SIZE,
            offset: 0,
            blocks: 0,
            failed: false,
            dropped: 0,
            urids,
        };
        stash.reset();
        stash
    }

    /// Append one block's events (if `input` is a sequence) and advance the
    /// accumulated offset by `frames`.
    pub fn append_block(&mut self, input: Option<View<'_>>, frames: u32) {
        if let Some(seq) = input.filter(|v| v.type_id() == self.urids.sequence) {
            for (key, event) in seq.iter() {
                let time = match key {
                    Key::Time(t) => t,
                    _ => continue,
                };
                if self.failed {
                    self.dropped += 1;
                    continue;
                }
                let Some(shifted) = time.checked_add(self.offset) else {
                    self.failed = true;
                    self.dropped += 1;
                    continue;
                };
                let mut forge = Forge::resume(&mut self.buf, self.len, self.urids);
                let written = forge
                    .raw(&shifted.to_le_bytes())
                    .and_then(|()| forge.atom(&event.atom()));
                match written {
                    Ok(()) => self.len = forge.offset(),
                    Err(_) => {
                        self.failed = true;
                        self.dropped += 1;
                    }
                }
            }
            write_u32(&mut self.buf, 0, (self.len - HEADER_SIZE) as u32);
        }
        self.offset = self.offset.saturating_add(i64::from(frames));
        self.blocks += 1;
    }

    /// Blocks were stashed since the last reset.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.blocks > 0
    }

    /// Frames accumulated since the last reset.
    #[inline]
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Blocks stashed since the last reset.
    #[inline]
    pub fn blocks(&self) -> u32 {
        self.blocks
    }

    /// An append ran out of room during this period.
    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Events dropped during this period.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The stashed events as one sequence atom.
    pub fn sequence(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Empty the stash after a successful replay.
    pub fn reset(&mut self) {
        self.len = HEADER_SIZE;
        self.offset = 0;
        self.blocks = 0;
        self.failed = false;
        self.dropped = 0;
        write_u32(&mut self.buf, 0, 0);
        write_u32(&mut self.buf, 4, self.urids.sequence);
    }
}
