//! Forge module: append-only atom writer over a caller-owned buffer.
//!
//! Composites are written as frames: opening writes a header with a zero
//! size and remembers where it lives, closing patches the final size back.
//! Frames close in strict LIFO order.
//!
//! Every write checks the would-be cursor against the buffer length first.
//! An overflow writes nothing and latches the forge: every later call fails
//! with [`ForgeError::Overflow`] until [`Forge::reset`].

use thiserror::Error;

use crate::atom::{
    pad_size, read_u32, write_i64, write_u32, Atom, HEADER_SIZE, TIME_SIZE,
};
use crate::urid::Urids;

/// Maximum number of simultaneously open frames.
pub const MAX_DEPTH: usize = 8;

/// Forge failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ForgeError {
    /// A write would pass the end of the buffer. Latching.
    #[error("forge buffer overflow")]
    Overflow,
    /// `close` was called out of LIFO order.
    #[error("forge frame mismatch")]
    FrameMismatch,
    /// More than `MAX_DEPTH` frames opened.
    #[error("forge frame stack exhausted")]
    TooDeep,
    /// Frames still open at the end of a top-level write.
    #[error("{open} forge frame(s) left open")]
    Unbalanced { open: usize },
    /// A sequence event time went backwards.
    #[error("invalid frame time, must not decrease")]
    TimeDecreasing,
    /// An event time was written outside a sequence frame.
    #[error("event time outside a sequence")]
    NotInSequence,
    /// A vector element did not match the vector's child type or size.
    #[error("vector supports only elements of its child type")]
    VectorMismatch,
}

/// What an open frame is building.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Tuple,
    Object,
    Vector { child_type: u32, child_size: u32 },
    Sequence,
}

/// Handle to an open composite, returned by the `open` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    depth: usize,
    header: usize,
    kind: FrameKind,
}

impl Frame {
    /// Offset of the composite's header in the buffer.
    pub fn header(&self) -> usize {
        self.header
    }

    /// Kind of composite.
    pub fn kind(&self) -> FrameKind {
        self.kind
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    header: usize,
    kind: FrameKind,
    last_time: i64,
}

const EMPTY_SLOT: Slot = Slot {
    header: 0,
    kind: FrameKind::Tuple,
    last_time: 0,
};

/// A fixed-size scalar, for [`Forge::scalar`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Urid(u32),
}

/// Frame-nesting atom writer.
pub struct Forge<'b> {
    buf: &'b mut [u8],
    offset: usize,
    urids: Urids,
    stack: [Slot; MAX_DEPTH],
    depth: usize,
    failed: bool,
}

impl<'b> Forge<'b> {
    /// Start writing at the beginning of `buf`.
    pub fn new(buf: &'b mut [u8], urids: Urids) -> Self {
        Self::resume(buf, 0, urids)
    }

    /// Continue writing at `offset` into `buf`, with no frames open.
    pub fn resume(buf: &'b mut [u8], offset: usize, urids: Urids) -> Self {
        let offset = offset.min(buf.len());
        Self {
            buf,
            offset,
            urids,
            stack: [EMPTY_SLOT; MAX_DEPTH],
            depth: 0,
            failed: false,
        }
    }

    /// Rewind to the start of the buffer and clear the failure latch.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.depth = 0;
        self.failed = false;
    }

    /// Current write position.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Declared capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of open frames.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether an overflow latched the forge.
    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// The vocabulary used for type ids.
    #[inline]
    pub fn urids(&self) -> &Urids {
        &self.urids
    }

    /// Bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.offset]
    }

    /// Check the frame stack is empty and the forge intact.
    ///
    /// Returns the number of bytes written.
    pub fn finish(&self) -> Result<usize, ForgeError> {
        if self.failed {
            return Err(ForgeError::Overflow);
        }
        if self.depth != 0 {
            return Err(ForgeError::Unbalanced { open: self.depth });
        }
        Ok(self.offset)
    }

    // Claim `need` bytes or latch.
    fn reserve(&mut self, need: usize) -> Result<usize, ForgeError> {
        if self.failed {
            return Err(ForgeError::Overflow);
        }
        match self.offset.checked_add(need) {
            Some(end) if end <= self.buf.len() => {
                let start = self.offset;
                self.offset = end;
                Ok(start)
            }
            _ => {
                self.failed = true;
                Err(ForgeError::Overflow)
            }
        }
    }

    fn top(&self) -> Option<&Slot> {
        self.depth.checked_sub(1).map(|idx| &self.stack[idx])
    }

    fn write_parts(&mut self, type_id: u32, parts: &[&[u8]]) -> Result<(), ForgeError> {
        let size: usize = parts.iter().map(|p| p.len()).sum();

        if let Some(Slot {
            kind: FrameKind::Vector { child_type, child_size },
            ..
        }) = self.top().copied()
        {
            if type_id != child_type || size != child_size as usize {
                return Err(ForgeError::VectorMismatch);
            }
            let mut at = self.reserve(size)?;
            for part in parts {
                self.buf[at..at + part.len()].copy_from_slice(part);
                at += part.len();
            }
            return Ok(());
        }

        let total = pad_size(HEADER_SIZE + size);
        let start = self.reserve(total)?;
        write_u32(self.buf, start, size as u32);
        write_u32(self.buf, start + 4, type_id);
        let mut at = start + HEADER_SIZE;
        for part in parts {
            self.buf[at..at + part.len()].copy_from_slice(part);
            at += part.len();
        }
        self.buf[at..start + total].fill(0);
        Ok(())
    }

    /// Write an atom of any type with the given body.
    pub fn typed(&mut self, type_id: u32, body: &[u8]) -> Result<(), ForgeError> {
        self.write_parts(type_id, &[body])
    }

    /// Write a fixed-size scalar.
    pub fn scalar(&mut self, value: Scalar) -> Result<(), ForgeError> {
        match value {
            Scalar::Int(v) => self.int(v),
            Scalar::Long(v) => self.long(v),
            Scalar::Float(v) => self.float(v),
            Scalar::Double(v) => self.double(v),
            Scalar::Bool(v) => self.bool(v),
            Scalar::Urid(v) => self.urid(v),
        }
    }

    pub fn int(&mut self, value: i32) -> Result<(), ForgeError> {
        self.typed(self.urids.int, &value.to_le_bytes())
    }

    pub fn long(&mut self, value: i64) -> Result<(), ForgeError> {
        self.typed(self.urids.long, &value.to_le_bytes())
    }

    pub fn float(&mut self, value: f32) -> Result<(), ForgeError> {
        self.typed(self.urids.float, &value.to_le_bytes())
    }

    pub fn double(&mut self, value: f64) -> Result<(), ForgeError> {
        self.typed(self.urids.double, &value.to_le_bytes())
    }

    pub fn bool(&mut self, value: bool) -> Result<(), ForgeError> {
        self.typed(self.urids.bool, &(value as u32).to_le_bytes())
    }

    pub fn urid(&mut self, value: u32) -> Result<(), ForgeError> {
        self.typed(self.urids.urid, &value.to_le_bytes())
    }

    /// Write a NUL-terminated string.
    pub fn string(&mut self, value: &str) -> Result<(), ForgeError> {
        self.write_parts(self.urids.string, &[value.as_bytes(), &[0]])
    }

    pub fn path(&mut self, value: &str) -> Result<(), ForgeError> {
        self.write_parts(self.urids.path, &[value.as_bytes(), &[0]])
    }

    pub fn uri(&mut self, value: &str) -> Result<(), ForgeError> {
        self.write_parts(self.urids.uri, &[value.as_bytes(), &[0]])
    }

    /// Write a literal: text tagged with a datatype and a language.
    pub fn literal(&mut self, text: &str, datatype: u32, lang: u32) -> Result<(), ForgeError> {
        self.write_parts(
            self.urids.literal,
            &[
                &datatype.to_le_bytes(),
                &lang.to_le_bytes(),
                text.as_bytes(),
                &[0],
            ],
        )
    }

    /// Write opaque bytes.
    pub fn chunk(&mut self, bytes: &[u8]) -> Result<(), ForgeError> {
        self.typed(self.urids.chunk, bytes)
    }

    /// Copy an existing atom.
    pub fn atom(&mut self, atom: &Atom<'_>) -> Result<(), ForgeError> {
        self.typed(atom.type_id(), atom.body())
    }

    /// Append bytes verbatim, with no header and no padding.
    pub fn raw(&mut self, bytes: &[u8]) -> Result<(), ForgeError> {
        let at = self.reserve(bytes.len())?;
        self.buf[at..at + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Zero-fill up to the next atom boundary.
    pub fn pad(&mut self) -> Result<(), ForgeError> {
        let fill = pad_size(self.offset) - self.offset;
        let at = self.reserve(fill)?;
        self.buf[at..at + fill].fill(0);
        Ok(())
    }

    fn open(&mut self, type_id: u32, kind: FrameKind, prefix: [u32; 2], with_prefix: bool) -> Result<Frame, ForgeError> {
        if self.failed {
            return Err(ForgeError::Overflow);
        }
        if matches!(self.top().map(|s| s.kind), Some(FrameKind::Vector { .. })) {
            return Err(ForgeError::VectorMismatch);
        }
        if self.depth == MAX_DEPTH {
            return Err(ForgeError::TooDeep);
        }
        let need = if with_prefix { HEADER_SIZE + 8 } else { HEADER_SIZE };
        let header = self.reserve(need)?;
        write_u32(self.buf, header, 0);
        write_u32(self.buf, header + 4, type_id);
        if with_prefix {
            write_u32(self.buf, header + 8, prefix[0]);
            write_u32(self.buf, header + 12, prefix[1]);
        }
        let depth = self.depth;
        self.stack[depth] = Slot {
            header,
            kind,
            last_time: 0,
        };
        self.depth += 1;
        Ok(Frame {
            depth,
            header,
            kind,
        })
    }

    /// Open a tuple.
    pub fn tuple(&mut self) -> Result<Frame, ForgeError> {
        self.open(self.urids.tuple, FrameKind::Tuple, [0, 0], false)
    }

    /// Open an object; follow with `key` + value pairs.
    pub fn object(&mut self, id: u32, otype: u32) -> Result<Frame, ForgeError> {
        self.open(self.urids.object, FrameKind::Object, [id, otype], true)
    }

    /// Open a vector of fixed-size elements.
    pub fn vector(&mut self, child_type: u32, child_size: u32) -> Result<Frame, ForgeError> {
        self.open(
            self.urids.vector,
            FrameKind::Vector {
                child_type,
                child_size,
            },
            [child_type, child_size],
            true,
        )
    }

    /// Open a sequence; follow with `time` + atom pairs.
    pub fn sequence(&mut self) -> Result<Frame, ForgeError> {
        self.open(self.urids.sequence, FrameKind::Sequence, [0, 0], false)
    }

    /// Write an object property head.
    pub fn key(&mut self, key: u32, context: u32) -> Result<(), ForgeError> {
        let at = self.reserve(8)?;
        write_u32(self.buf, at, key);
        write_u32(self.buf, at + 4, context);
        Ok(())
    }

    /// Write a sequence event time. Times must not decrease within a sequence.
    pub fn time(&mut self, frames: i64) -> Result<(), ForgeError> {
        if self.failed {
            return Err(ForgeError::Overflow);
        }
        let idx = match self.depth.checked_sub(1) {
            Some(idx) if self.stack[idx].kind == FrameKind::Sequence => idx,
            _ => return Err(ForgeError::NotInSequence),
        };
        if frames < self.stack[idx].last_time {
            return Err(ForgeError::TimeDecreasing);
        }
        let at = self.reserve(TIME_SIZE)?;
        write_i64(self.buf, at, frames);
        self.stack[idx].last_time = frames;
        Ok(())
    }

    /// Close the innermost frame, patching its size back into the header.
    pub fn close(&mut self, frame: Frame) -> Result<(), ForgeError> {
        if self.failed {
            return Err(ForgeError::Overflow);
        }
        let idx = match self.depth.checked_sub(1) {
            Some(idx) if idx == frame.depth && self.stack[idx].header == frame.header => idx,
            _ => return Err(ForgeError::FrameMismatch),
        };
        let header = self.stack[idx].header;
        let size = self.offset - header - HEADER_SIZE;
        write_u32(self.buf, header, size as u32);
        self.depth = idx;
        self.pad()
    }

    /// Zero the time stamps of every event written so far into the open
    /// sequence `frame`, and allow times to restart from 0.
    ///
    /// `frame` must be the innermost open frame.
    pub fn zero_times(&mut self, frame: &Frame) -> Result<(), ForgeError> {
        if self.failed {
            return Err(ForgeError::Overflow);
        }
        let idx = match self.depth.checked_sub(1) {
            Some(idx)
                if idx == frame.depth
                    && self.stack[idx].header == frame.header
                    && self.stack[idx].kind == FrameKind::Sequence =>
            {
                idx
            }
            _ => return Err(ForgeError::FrameMismatch),
        };
        let mut at = frame.header + HEADER_SIZE;
        while at + TIME_SIZE + HEADER_SIZE <= self.offset {
            write_i64(self.buf, at, 0);
            let size = read_u32(self.buf, at + TIME_SIZE).unwrap_or(0) as usize;
            at += TIME_SIZE + pad_size(HEADER_SIZE + size);
        }
        self.stack[idx].last_time = 0;
        Ok(())
    }
}
