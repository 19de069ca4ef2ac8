//! Atom module: the binary wire layout and zero-copy atom slices.
//!
//! Every atom is `[u32 size][u32 type][size bytes body]`, padded to 8 bytes.
//! All integers are little-endian. An [`Atom`] never owns memory; it is a
//! typed window into a buffer the caller keeps alive.

/// Size of the `[size][type]` header.
pub const HEADER_SIZE: usize = 8;
/// Atoms are padded to this alignment.
pub const ALIGN: usize = 8;
/// Size of a sequence event's time stamp.
pub const TIME_SIZE: usize = 8;
/// Size of an object body's `[id][otype]` prefix.
pub const OBJECT_BODY_SIZE: usize = 8;
/// Size of a property's `[key][context]` prefix.
pub const PROPERTY_HEAD_SIZE: usize = 8;
/// Size of a vector body's `[child_type][child_size]` prefix.
pub const VECTOR_BODY_SIZE: usize = 8;
/// Size of a literal body's `[datatype][lang]` prefix.
pub const LITERAL_BODY_SIZE: usize = 8;

/// Round `n` up to the atom alignment.
#[inline]
pub const fn pad_size(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

#[inline]
pub(crate) fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub(crate) fn read_i64(buf: &[u8], at: usize) -> Option<i64> {
    let bytes = buf.get(at..at + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Some(i64::from_le_bytes(raw))
}

#[inline]
pub(crate) fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn write_i64(buf: &mut [u8], at: usize, value: i64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// A self-describing binary value borrowed from a buffer.
///
/// `body` is clamped to the bytes actually present, so a header that
/// declares more than the buffer holds yields a truncated body rather than
/// an out-of-bounds read.
#[derive(Debug, Clone, Copy)]
pub struct Atom<'a> {
    type_id: u32,
    size: u32,
    body: &'a [u8],
}

impl<'a> Atom<'a> {
    /// Build an atom from an already-split type and body.
    pub fn from_body(type_id: u32, body: &'a [u8]) -> Self {
        Self {
            type_id,
            size: body.len() as u32,
            body,
        }
    }

    /// Parse the atom at the start of `buf`.
    ///
    /// Returns `None` when not even the header fits.
    pub fn parse(buf: &'a [u8]) -> Option<Self> {
        let size = read_u32(buf, 0)?;
        let type_id = read_u32(buf, 4)?;
        let end = HEADER_SIZE.saturating_add(size as usize).min(buf.len());
        Some(Self {
            type_id,
            size,
            body: &buf[HEADER_SIZE..end],
        })
    }

    /// Parse the atom at the start of `buf`, rejecting truncated bodies.
    pub fn parse_complete(buf: &'a [u8]) -> Option<Self> {
        Self::parse(buf).filter(|atom| !atom.is_truncated())
    }

    /// Runtime type identifier.
    #[inline]
    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    /// Declared body size.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Body bytes that are actually present.
    #[inline]
    pub fn body(&self) -> &'a [u8] {
        self.body
    }

    /// True when the declared size runs past the end of the buffer.
    #[inline]
    pub fn is_truncated(&self) -> bool {
        self.body.len() < self.size as usize
    }

    /// Header plus declared body, unpadded.
    #[inline]
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.size as usize
    }

    /// Header plus declared body, padded.
    #[inline]
    pub fn padded_size(&self) -> usize {
        pad_size(self.total_size())
    }
}

impl PartialEq for Atom<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.size == other.size && self.body == other.body
    }
}

impl Eq for Atom<'_> {}

/// The key under which an iterated child was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    /// Position in a tuple or vector.
    Index(usize),
    /// Object property (or literal pseudo-property).
    Property { key: u32, context: u32 },
    /// Sequence event time offset in frames.
    Time(i64),
}

/// Terminal value of a scalar atom.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Urid(u32),
    /// String, path or URI text, without its terminating NUL.
    Str(&'a str),
    Literal {
        text: &'a str,
        datatype: u32,
        lang: u32,
    },
    /// Opaque payload.
    Bytes(&'a [u8]),
    /// Composite atoms have no scalar value.
    None,
}

/// Decode NUL-terminated UTF-8 text, dropping everything after the first NUL.
pub(crate) fn c_str(body: &[u8]) -> &str {
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    match std::str::from_utf8(&body[..end]) {
        Ok(s) => s,
        Err(e) => {
            // Keep the valid prefix rather than failing the whole read.
            let valid = e.valid_up_to();
            std::str::from_utf8(&body[..valid]).unwrap_or("")
        }
    }
}
