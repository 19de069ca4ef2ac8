//! Driver module: type-id dispatch for the atom reader.
//!
//! The type set is fixed when the [`Reader`] is built. Dispatch is a binary
//! search over a sorted `(type_id, Driver)` table; any id not in the table
//! reads as an opaque chunk.

use crate::atom::Atom;
use crate::invariant_ppt::{assert_invariant, DRIVER_TABLE_SORTED};
use crate::urid::Urids;
use crate::view::View;

/// Behaviour record selected by an atom's type id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    Int,
    Long,
    Float,
    Double,
    Bool,
    Urid,
    /// String, path and URI share a driver.
    String,
    Literal,
    Tuple,
    /// Object, resource and blank share a driver.
    Object,
    Vector,
    Sequence,
    /// Opaque bytes, also the fallback for unknown ids.
    Chunk,
}

impl Driver {
    /// True for drivers whose body is a fixed-size scalar.
    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            Driver::Int | Driver::Long | Driver::Float | Driver::Double | Driver::Bool | Driver::Urid
        )
    }

    /// True for drivers whose body holds nested atoms or elements.
    pub fn is_composite(self) -> bool {
        matches!(
            self,
            Driver::Tuple | Driver::Object | Driver::Vector | Driver::Sequence
        )
    }

    /// Body size of a fixed-size scalar.
    pub fn scalar_size(self) -> Option<usize> {
        match self {
            Driver::Int | Driver::Float | Driver::Bool | Driver::Urid => Some(4),
            Driver::Long | Driver::Double => Some(8),
            _ => None,
        }
    }
}

/// Sorted dispatch table.
#[derive(Debug, Clone)]
pub struct DriverTable {
    entries: Box<[(u32, Driver)]>,
}

impl DriverTable {
    /// Build the table for a vocabulary.
    pub fn new(urids: &Urids) -> Self {
        let mut entries = vec![
            (urids.int, Driver::Int),
            (urids.long, Driver::Long),
            (urids.float, Driver::Float),
            (urids.double, Driver::Double),
            (urids.bool, Driver::Bool),
            (urids.urid, Driver::Urid),
            (urids.string, Driver::String),
            (urids.path, Driver::String),
            (urids.uri, Driver::String),
            (urids.literal, Driver::Literal),
            (urids.tuple, Driver::Tuple),
            (urids.object, Driver::Object),
            (urids.resource, Driver::Object),
            (urids.blank, Driver::Object),
            (urids.vector, Driver::Vector),
            (urids.sequence, Driver::Sequence),
            (urids.chunk, Driver::Chunk),
        ];
        entries.sort_unstable_by_key(|&(id, _)| id);
        entries.dedup_by_key(|&mut (id, _)| id);

        assert_invariant(
            DRIVER_TABLE_SORTED,
            entries.windows(2).all(|w| w[0].0 < w[1].0),
            "Driver table strictly sorted by type id",
            Some("DriverTable::new"),
        );

        Self {
            entries: entries.into_boxed_slice(),
        }
    }

    /// Dispatch a type id. Unknown ids fall back to [`Driver::Chunk`].
    #[inline]
    pub fn lookup(&self, type_id: u32) -> Driver {
        match self.entries.binary_search_by_key(&type_id, |&(id, _)| id) {
            Ok(idx) => self.entries[idx].1,
            Err(_) => Driver::Chunk,
        }
    }

    /// Whether a type id has a registered driver.
    pub fn is_registered(&self, type_id: u32) -> bool {
        self.entries
            .binary_search_by_key(&type_id, |&(id, _)| id)
            .is_ok()
    }

    /// Registered `(type_id, driver)` pairs in ascending id order.
    pub fn entries(&self) -> &[(u32, Driver)] {
        &self.entries
    }
}

/// Read side of the object model: dispatch table plus vocabulary.
#[derive(Debug, Clone)]
pub struct Reader {
    table: DriverTable,
    urids: Urids,
}

impl Reader {
    /// Create a reader for a vocabulary.
    pub fn new(urids: Urids) -> Self {
        Self {
            table: DriverTable::new(&urids),
            urids,
        }
    }

    /// The vocabulary this reader dispatches on.
    #[inline]
    pub fn urids(&self) -> &Urids {
        &self.urids
    }

    /// The dispatch table.
    pub fn table(&self) -> &DriverTable {
        &self.table
    }

    /// Dispatch a type id.
    #[inline]
    pub fn driver(&self, type_id: u32) -> Driver {
        self.table.lookup(type_id)
    }

    /// View the atom at the start of `buf`.
    pub fn view<'a>(&'a self, buf: &'a [u8]) -> Option<View<'a>> {
        Atom::parse(buf).map(|atom| self.view_atom(atom))
    }

    /// View an already-parsed atom.
    #[inline]
    pub fn view_atom<'a>(&'a self, atom: Atom<'a>) -> View<'a> {
        View::new(atom, self.driver(atom.type_id()), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::urid::UridMap;
    use proptest::prelude::*;

    fn reader() -> Reader {
        let mut map = UridMap::new();
        Reader::new(Urids::new(&mut map))
    }

    #[test]
    fn registered_ids_dispatch_exactly() {
        let reader = reader();
        let u = *reader.urids();
        assert_eq!(reader.driver(u.int), Driver::Int);
        assert_eq!(reader.driver(u.path), Driver::String);
        assert_eq!(reader.driver(u.blank), Driver::Object);
        assert_eq!(reader.driver(u.sequence), Driver::Sequence);
        for &(id, driver) in reader.table().entries() {
            assert_eq!(reader.driver(id), driver);
        }
    }

    #[test]
    fn unknown_ids_fall_back_to_chunk() {
        let reader = reader();
        assert_eq!(reader.driver(0), Driver::Chunk);
        assert_eq!(reader.driver(u32::MAX), Driver::Chunk);
        assert!(!reader.table().is_registered(9999));
    }

    #[test]
    fn scalar_sizes() {
        assert_eq!(Driver::Int.scalar_size(), Some(4));
        assert_eq!(Driver::Double.scalar_size(), Some(8));
        assert_eq!(Driver::Tuple.scalar_size(), None);
        assert!(Driver::Sequence.is_composite());
        assert!(!Driver::Chunk.is_composite());
    }

    proptest! {
        #[test]
        fn dispatch_never_fails(type_id in any::<u32>()) {
            let reader = reader();
            let driver = reader.driver(type_id);
            if reader.table().is_registered(type_id) {
                let expected = reader
                    .table()
                    .entries()
                    .iter()
                    .find(|(id, _)| *id == type_id)
                    .map(|(_, d)| *d);
                prop_assert_eq!(Some(driver), expected);
            } else {
                prop_assert_eq!(driver, Driver::Chunk);
            }
        }
    }
}
