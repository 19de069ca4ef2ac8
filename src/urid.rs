//! URID module: URI to integer mapping for atom types and message keys.
//!
//! Type identifiers are mapped once, at host-instance construction, and are
//! immutable afterwards. The RT path only ever sees the resulting integers.

use std::collections::HashMap;

/// Base URI of the atom vocabulary.
pub const ATOM_PREFIX: &str = "http://lv2plug.in/ns/ext/atom#";
/// Base URI of the host's control vocabulary.
pub const HOST_PREFIX: &str = "urn:lunahost#";

/// Map from URI to a small non-zero integer.
///
/// Id 0 is reserved and never handed out.
#[derive(Debug, Clone, Default)]
pub struct UridMap {
    ids: HashMap<String, u32>,
    uris: Vec<String>,
}

impl UridMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a URI, assigning the next id on first sight.
    pub fn map(&mut self, uri: &str) -> u32 {
        if let Some(&id) = self.ids.get(uri) {
            return id;
        }
        self.uris.push(uri.to_string());
        let id = self.uris.len() as u32;
        self.ids.insert(uri.to_string(), id);
        id
    }

    /// Reverse lookup.
    pub fn unmap(&self, id: u32) -> Option<&str> {
        let idx = (id as usize).checked_sub(1)?;
        self.uris.get(idx).map(String::as_str)
    }

    /// Number of mapped URIs.
    pub fn len(&self) -> usize {
        self.uris.len()
    }

    /// True when nothing has been mapped yet.
    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }
}

/// The pre-mapped vocabulary used by the reader, the forge and the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Urids {
    pub int: u32,
    pub long: u32,
    pub float: u32,
    pub double: u32,
    pub bool: u32,
    pub urid: u32,
    pub string: u32,
    pub path: u32,
    pub uri: u32,
    pub literal: u32,
    pub tuple: u32,
    pub object: u32,
    pub resource: u32,
    pub blank: u32,
    pub vector: u32,
    pub sequence: u32,
    pub chunk: u32,
    /// Pseudo-key addressing a literal's datatype.
    pub literal_datatype: u32,
    /// Pseudo-key addressing a literal's language.
    pub literal_lang: u32,
    /// Control message object type.
    pub message: u32,
    /// Control message key: script source.
    pub code: u32,
    /// Control message key: error text.
    pub error: u32,
    /// Control message key: trace line.
    pub trace: u32,
}

impl Urids {
    /// Map the whole vocabulary into `map`.
    pub fn new(map: &mut UridMap) -> Self {
        let mut atom = |name: &str| map.map(&format!("{ATOM_PREFIX}{name}"));
        let int = atom("Int");
        let long = atom("Long");
        let float = atom("Float");
        let double = atom("Double");
        let bool = atom("Bool");
        let urid = atom("URID");
        let string = atom("String");
        let path = atom("Path");
        let uri = atom("URI");
        let literal = atom("Literal");
        let tuple = atom("Tuple");
        let object = atom("Object");
        let resource = atom("Resource");
        let blank = atom("Blank");
        let vector = atom("Vector");
        let sequence = atom("Sequence");
        let chunk = atom("Chunk");
        let literal_datatype = atom("datatype");
        let literal_lang = atom("lang");
        let mut host = |name: &str| map.map(&format!("{HOST_PREFIX}{name}"));
        Self {
            int,
            long,
            float,
            double,
            bool,
            urid,
            string,
            path,
            uri,
            literal,
            tuple,
            object,
            resource,
            blank,
            vector,
            sequence,
            chunk,
            literal_datatype,
            literal_lang,
            message: host("message"),
            code: host("code"),
            error: host("error"),
            trace: host("trace"),
        }
    }

    /// True for the three object flavours.
    #[inline]
    pub fn is_object(&self, type_id: u32) -> bool {
        type_id == self.object || type_id == self.resource || type_id == self.blank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_is_stable_and_nonzero() {
        let mut map = UridMap::new();
        let a = map.map("urn:a");
        let b = map.map("urn:b");
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(map.map("urn:a"), a);
        assert_eq!(map.unmap(b), Some("urn:b"));
        assert_eq!(map.unmap(0), None);
    }

    #[test]
    fn vocabulary_is_distinct() {
        let mut map = UridMap::new();
        let urids = Urids::new(&mut map);
        let mut ids = vec![
            urids.int, urids.long, urids.float, urids.double, urids.bool, urids.urid,
            urids.string, urids.path, urids.uri, urids.literal, urids.tuple, urids.object,
            urids.resource, urids.blank, urids.vector, urids.sequence, urids.chunk,
        ];
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 17);
        assert!(urids.is_object(urids.blank));
        assert!(!urids.is_object(urids.tuple));
    }
}
