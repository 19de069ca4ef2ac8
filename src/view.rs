//! View module: typed, read-only views over atoms.
//!
//! A [`View`] is an atom paired with the driver its type id dispatched to.
//! Children are produced as new views over sub-slices of the same buffer;
//! nothing is copied and the source buffer is never written.

use std::fmt;

use crate::atom::{
    c_str, pad_size, read_i64, read_u32, Atom, Key, Value, LITERAL_BODY_SIZE,
    OBJECT_BODY_SIZE, PROPERTY_HEAD_SIZE, TIME_SIZE, VECTOR_BODY_SIZE,
};
use crate::driver::{Driver, Reader};

/// A typed view over one atom.
#[derive(Clone, Copy)]
pub struct View<'a> {
    atom: Atom<'a>,
    driver: Driver,
    reader: &'a Reader,
}

impl<'a> View<'a> {
    pub(crate) fn new(atom: Atom<'a>, driver: Driver, reader: &'a Reader) -> Self {
        Self {
            atom,
            driver,
            reader,
        }
    }

    /// The underlying atom.
    #[inline]
    pub fn atom(&self) -> Atom<'a> {
        self.atom
    }

    /// Runtime type id.
    #[inline]
    pub fn type_id(&self) -> u32 {
        self.atom.type_id()
    }

    /// Driver selected for the type id.
    #[inline]
    pub fn driver(&self) -> Driver {
        self.driver
    }

    /// The reader that produced this view.
    #[inline]
    pub fn reader(&self) -> &'a Reader {
        self.reader
    }

    /// Element count for composites, byte size for everything else.
    pub fn length(&self) -> usize {
        match self.driver {
            Driver::Tuple | Driver::Object | Driver::Sequence => self.iter().count(),
            Driver::Vector => self.vector_shape().map_or(0, |(_, _, count)| count),
            _ => self.atom.size() as usize,
        }
    }

    /// Text form: the value for scalars and strings, a tag for composites.
    pub fn string_form(&self) -> StringForm<'a> {
        StringForm(*self)
    }

    /// Child at `pos` (0-based) of a tuple, vector or sequence.
    pub fn index_by_position(&self, pos: usize) -> Option<View<'a>> {
        match self.driver {
            Driver::Tuple | Driver::Sequence => self.iter().nth(pos).map(|(_, child)| child),
            Driver::Vector => {
                let (child_type, child_size, count) = self.vector_shape()?;
                if pos >= count {
                    return None;
                }
                let start = VECTOR_BODY_SIZE + pos * child_size;
                let body = self.atom.body().get(start..start + child_size)?;
                Some(self.reader.view_atom(Atom::from_body(child_type, body)))
            }
            _ => None,
        }
    }

    /// Child under `key` of an object, or a literal's datatype/lang.
    pub fn index_by_key(&self, key: u32) -> Option<View<'a>> {
        match self.driver {
            Driver::Object => self.iter().find_map(|(k, child)| match k {
                Key::Property { key: found, .. } if found == key => Some(child),
                _ => None,
            }),
            Driver::Literal => {
                let urids = self.reader.urids();
                let at = if key == urids.literal_datatype {
                    0
                } else if key == urids.literal_lang {
                    4
                } else {
                    return None;
                };
                let body = self.atom.body().get(at..at + 4)?;
                Some(self.reader.view_atom(Atom::from_body(urids.urid, body)))
            }
            _ => None,
        }
    }

    /// Single-pass iteration over children with their keys.
    ///
    /// Every call starts a fresh, independent cursor.
    pub fn iter(&self) -> Iter<'a> {
        let start = match self.driver {
            Driver::Object => OBJECT_BODY_SIZE,
            Driver::Vector => VECTOR_BODY_SIZE,
            _ => 0,
        };
        Iter {
            view: *self,
            cursor: start,
            index: 0,
            done: false,
        }
    }

    /// Scalar value; composites yield [`Value::None`].
    pub fn value(&self) -> Value<'a> {
        let body = self.atom.body();
        match self.driver {
            Driver::Int => read_u32(body, 0).map_or(Value::None, |v| Value::Int(v as i32)),
            Driver::Long => read_i64(body, 0).map_or(Value::None, Value::Long),
            Driver::Float => {
                read_u32(body, 0).map_or(Value::None, |v| Value::Float(f32::from_bits(v)))
            }
            Driver::Double => read_i64(body, 0)
                .map_or(Value::None, |v| Value::Double(f64::from_bits(v as u64))),
            Driver::Bool => read_u32(body, 0).map_or(Value::None, |v| Value::Bool(v != 0)),
            Driver::Urid => read_u32(body, 0).map_or(Value::None, Value::Urid),
            Driver::String => Value::Str(c_str(body)),
            Driver::Literal => match (read_u32(body, 0), read_u32(body, 4)) {
                (Some(datatype), Some(lang)) => Value::Literal {
                    text: c_str(&body[LITERAL_BODY_SIZE..]),
                    datatype,
                    lang,
                },
                _ => Value::None,
            },
            Driver::Chunk => Value::Bytes(body),
            Driver::Tuple | Driver::Object | Driver::Vector | Driver::Sequence => Value::None,
        }
    }

    /// Text of a string, path, URI or literal.
    pub fn as_str(&self) -> Option<&'a str> {
        match self.value() {
            Value::Str(s) => Some(s),
            Value::Literal { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Byte `pos` of a chunk.
    pub fn byte(&self, pos: usize) -> Option<u8> {
        match self.driver {
            Driver::Chunk => self.atom.body().get(pos).copied(),
            _ => None,
        }
    }

    /// Object id.
    pub fn object_id(&self) -> Option<u32> {
        match self.driver {
            Driver::Object => read_u32(self.atom.body(), 0),
            _ => None,
        }
    }

    /// Object type (`otype`).
    pub fn object_type(&self) -> Option<u32> {
        match self.driver {
            Driver::Object => read_u32(self.atom.body(), 4),
            _ => None,
        }
    }

    /// Vector element type id.
    pub fn child_type(&self) -> Option<u32> {
        self.vector_shape().map(|(child_type, _, _)| child_type)
    }

    /// `(child_type, child_size, count)` clamped to the bytes present.
    fn vector_shape(&self) -> Option<(u32, usize, usize)> {
        if self.driver != Driver::Vector {
            return None;
        }
        let body = self.atom.body();
        let child_type = read_u32(body, 0)?;
        let child_size = read_u32(body, 4)? as usize;
        if child_size == 0 {
            return Some((child_type, 0, 0));
        }
        let count = body.len().saturating_sub(VECTOR_BODY_SIZE) / child_size;
        Some((child_type, child_size, count))
    }
}

impl PartialEq for View<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.atom == other.atom
    }
}

impl fmt::Debug for View<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("type_id", &self.type_id())
            .field("size", &self.atom.size())
            .field("driver", &self.driver)
            .finish()
    }
}

/// Lazily formatted text form of a view. Formatting never allocates on its own.
#[derive(Clone, Copy)]
pub struct StringForm<'a>(View<'a>);

impl fmt::Display for StringForm<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let view = self.0;
        match view.driver {
            Driver::Tuple => f.write_str("(tuple)"),
            Driver::Object => f.write_str("(object)"),
            Driver::Vector => f.write_str("(vector)"),
            Driver::Sequence => f.write_str("(sequence)"),
            Driver::Chunk => f.write_str("(chunk)"),
            _ => match view.value() {
                Value::Int(v) => write!(f, "{v}"),
                Value::Long(v) => write!(f, "{v}"),
                Value::Float(v) => write!(f, "{v}"),
                Value::Double(v) => write!(f, "{v}"),
                Value::Bool(v) => write!(f, "{v}"),
                Value::Urid(v) => write!(f, "{v}"),
                Value::Str(s) => f.write_str(s),
                Value::Literal { text, .. } => f.write_str(text),
                Value::Bytes(_) | Value::None => f.write_str("(nil)"),
            },
        }
    }
}

impl fmt::Display for View<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.string_form().fmt(f)
    }
}

/// Cursor over the children of a composite view.
///
/// Finite and bounded by the bytes present: a child whose declared size
/// runs past the parent's body ends iteration. Once exhausted it keeps
/// returning `None`.
#[derive(Clone)]
pub struct Iter<'a> {
    view: View<'a>,
    cursor: usize,
    index: usize,
    done: bool,
}

impl<'a> Iter<'a> {
    fn child_at(&self, at: usize) -> Option<(Atom<'a>, usize)> {
        let body = self.view.atom.body();
        let atom = Atom::parse_complete(body.get(at..)?)?;
        Some((atom, pad_size(atom.total_size())))
    }

    fn step(&mut self) -> Option<(Key, View<'a>)> {
        let reader = self.view.reader;
        let body = self.view.atom.body();
        match self.view.driver {
            Driver::Tuple => {
                let (atom, advance) = self.child_at(self.cursor)?;
                self.cursor += advance;
                let key = Key::Index(self.index);
                self.index += 1;
                Some((key, reader.view_atom(atom)))
            }
            Driver::Object => {
                let key = read_u32(body, self.cursor)?;
                let context = read_u32(body, self.cursor + 4)?;
                let (atom, advance) = self.child_at(self.cursor + PROPERTY_HEAD_SIZE)?;
                self.cursor += PROPERTY_HEAD_SIZE + advance;
                Some((Key::Property { key, context }, reader.view_atom(atom)))
            }
            Driver::Sequence => {
                let time = read_i64(body, self.cursor)?;
                let (atom, advance) = self.child_at(self.cursor + TIME_SIZE)?;
                self.cursor += TIME_SIZE + advance;
                Some((Key::Time(time), reader.view_atom(atom)))
            }
            Driver::Vector => {
                let child = self.view.index_by_position(self.index)?;
                let key = Key::Index(self.index);
                self.index += 1;
                Some((key, child))
            }
            Driver::Literal => {
                let urids = reader.urids();
                let key = match self.index {
                    0 => urids.literal_datatype,
                    1 => urids.literal_lang,
                    _ => return None,
                };
                self.index += 1;
                let child = self.view.index_by_key(key)?;
                Some((Key::Property { key, context: 0 }, child))
            }
            _ => None,
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = (Key, View<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.step();
        if item.is_none() {
            self.done = true;
        }
        item
    }
}

impl std::iter::FusedIterator for Iter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::Forge;
    use crate::urid::{UridMap, Urids};

    fn reader() -> Reader {
        let mut map = UridMap::new();
        Reader::new(Urids::new(&mut map))
    }

    #[test]
    fn scalar_views() {
        let reader = reader();
        let mut buf = [0u8; 64];
        let mut forge = Forge::new(&mut buf, *reader.urids());
        forge.int(-7).unwrap();
        forge.finish().unwrap();
        let view = reader.view(&buf).unwrap();
        assert_eq!(view.driver(), Driver::Int);
        assert_eq!(view.value(), Value::Int(-7));
        assert_eq!(view.length(), 4);
        assert_eq!(view.to_string(), "-7");
        assert!(view.iter().next().is_none());
    }

    #[test]
    fn sequence_iterates_in_order_then_ends() {
        let reader = reader();
        let mut buf = [0u8; 256];
        let mut forge = Forge::new(&mut buf, *reader.urids());
        let seq = forge.sequence().unwrap();
        for (t, v) in [(10, 1), (10, 2), (25, 3)] {
            forge.time(t).unwrap();
            forge.int(v).unwrap();
        }
        forge.close(seq).unwrap();
        forge.finish().unwrap();

        let view = reader.view(&buf).unwrap();
        assert_eq!(view.length(), 3);
        let mut iter = view.iter();
        let mut seen = Vec::new();
        for _ in 0..3 {
            let (key, child) = iter.next().unwrap();
            seen.push((key, child.value()));
        }
        assert_eq!(
            seen,
            vec![
                (Key::Time(10), Value::Int(1)),
                (Key::Time(10), Value::Int(2)),
                (Key::Time(25), Value::Int(3)),
            ]
        );
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());
    }

    #[test]
    fn nested_iteration_uses_independent_cursors() {
        let reader = reader();
        let mut buf = [0u8; 256];
        let mut forge = Forge::new(&mut buf, *reader.urids());
        let tup = forge.tuple().unwrap();
        forge.int(1).unwrap();
        forge.int(2).unwrap();
        forge.close(tup).unwrap();
        forge.finish().unwrap();

        let view = reader.view(&buf).unwrap();
        let mut pairs = 0;
        for (_, a) in view.iter() {
            for (_, b) in view.iter() {
                let _ = (a.value(), b.value());
                pairs += 1;
            }
        }
        assert_eq!(pairs, 4);
    }

    #[test]
    fn object_and_literal_keys() {
        let reader = reader();
        let u = *reader.urids();
        let mut buf = [0u8; 256];
        let mut forge = Forge::new(&mut buf, u);
        let obj = forge.object(5, u.message).unwrap();
        forge.key(u.code, 0).unwrap();
        forge.string("x = 1").unwrap();
        forge.key(u.trace, 0).unwrap();
        forge.literal("hallo", 0, 42).unwrap();
        forge.close(obj).unwrap();
        forge.finish().unwrap();

        let view = reader.view(&buf).unwrap();
        assert_eq!(view.object_id(), Some(5));
        assert_eq!(view.object_type(), Some(u.message));
        assert_eq!(view.length(), 2);
        assert_eq!(view.index_by_key(u.code).unwrap().as_str(), Some("x = 1"));
        let lit = view.index_by_key(u.trace).unwrap();
        assert_eq!(lit.as_str(), Some("hallo"));
        assert_eq!(lit.index_by_key(u.literal_lang).unwrap().value(), Value::Urid(42));
        assert_eq!(lit.iter().count(), 2);
        assert!(view.index_by_key(u.error).is_none());
    }

    #[test]
    fn vector_elements() {
        let reader = reader();
        let u = *reader.urids();
        let mut buf = [0u8; 256];
        let mut forge = Forge::new(&mut buf, u);
        let vec = forge.vector(u.float, 4).unwrap();
        for v in [0.5f32, 1.5, 2.5] {
            forge.float(v).unwrap();
        }
        forge.close(vec).unwrap();
        forge.finish().unwrap();

        let view = reader.view(&buf).unwrap();
        assert_eq!(view.length(), 3);
        assert_eq!(view.child_type(), Some(u.float));
        assert_eq!(view.index_by_position(1).unwrap().value(), Value::Float(1.5));
        assert!(view.index_by_position(3).is_none());
        let values: Vec<_> = view.iter().map(|(_, c)| c.value()).collect();
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn truncated_tuple_stops_at_buffer_boundary() {
        let reader = reader();
        let u = *reader.urids();
        let mut buf = [0u8; 256];
        let mut forge = Forge::new(&mut buf, u);
        let tup = forge.tuple().unwrap();
        forge.int(1).unwrap();
        forge.int(2).unwrap();
        forge.close(tup).unwrap();
        let end = forge.finish().unwrap();

        // Claim far more than is present and cut the buffer mid-child.
        let mut cut = buf[..end - 6].to_vec();
        cut[0..4].copy_from_slice(&4096u32.to_le_bytes());
        let view = reader.view(&cut).unwrap();
        let children: Vec<_> = view.iter().collect();
        assert_eq!(children.len(), 1);
    }

    #[test]
    fn unknown_type_reads_as_chunk() {
        let reader = reader();
        let mut raw = Vec::new();
        raw.extend_from_slice(&3u32.to_le_bytes());
        raw.extend_from_slice(&9999u32.to_le_bytes());
        raw.extend_from_slice(&[7, 8, 9, 0, 0, 0, 0, 0]);
        let view = reader.view(&raw).unwrap();
        assert_eq!(view.driver(), Driver::Chunk);
        assert_eq!(view.value(), Value::Bytes(&[7, 8, 9]));
        assert_eq!(view.byte(2), Some(9));
        assert_eq!(view.to_string(), "(chunk)");
    }
}
