//! Directory database
//!
//! Maps paths to distribution sets. The persisted form is:
//!
//! ```text
//! u32 path count
//! per path:
//!     string path
//!     u32 fragment count
//!     per fragment: string fragment id, string storage node id
//! ```
//!
//! Strings are a `u32` byte length followed by UTF-8; all integers are
//! big-endian.

use crate::error::FormatError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tessera_core::fragment::{DistributionSet, Fragment};

/// Path to distribution set mapping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryDatabase {
    entries: BTreeMap<String, DistributionSet>,
}

impl DirectoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&DistributionSet> {
        self.entries.get(path)
    }

    pub fn insert(&mut self, path: impl Into<String>, set: DistributionSet) -> Option<DistributionSet> {
        self.entries.insert(path.into(), set)
    }

    pub fn remove(&mut self, path: &str) -> Option<DistributionSet> {
        self.entries.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Paths starting with `prefix` (all paths when `None`), sorted
    pub fn list(&self, prefix: Option<&str>) -> Vec<String> {
        self.entries
            .keys()
            .filter(|path| prefix.map_or(true, |p| path.starts_with(p)))
            .cloned()
            .collect()
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.entries.len() as u32);
        for (path, set) in &self.entries {
            put_string(&mut buf, path);
            buf.put_u32(set.len() as u32);
            for fragment in set.fragments() {
                put_string(&mut buf, fragment.id());
                put_string(&mut buf, fragment.node_id());
            }
        }
        buf.freeze()
    }

    /// Parse a serialized directory
    ///
    /// `known_node` decides whether a storage node id may appear; a fragment
    /// on any other node rejects the whole input.
    pub fn deserialize<F>(data: &[u8], known_node: F) -> Result<Self, FormatError>
    where
        F: Fn(&str) -> bool,
    {
        let mut buf = data;
        let count = get_u32(&mut buf)?;
        let mut entries = BTreeMap::new();

        for _ in 0..count {
            let path = get_string(&mut buf)?;
            let fragment_count = get_u32(&mut buf)?;
            let mut fragments = Vec::new();
            for _ in 0..fragment_count {
                let id = get_string(&mut buf)?;
                let node = get_string(&mut buf)?;
                if !known_node(&node) {
                    return Err(FormatError::UnknownNode { path, node });
                }
                fragments.push(Fragment::new(id, node));
            }

            let set = DistributionSet::new(fragments).map_err(|e| FormatError::InvalidSet {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            if entries.contains_key(&path) {
                return Err(FormatError::DuplicatePath(path));
            }
            entries.insert(path, set);
        }

        if buf.has_remaining() {
            return Err(FormatError::TrailingBytes(buf.remaining()));
        }
        Ok(Self { entries })
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn ensure(buf: &&[u8], needed: usize) -> Result<(), FormatError> {
    if buf.remaining() < needed {
        return Err(FormatError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, FormatError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_string(buf: &mut &[u8]) -> Result<String, FormatError> {
    let len = get_u32(buf)? as usize;
    ensure(buf, len)?;
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| FormatError::InvalidUtf8)
}
