//! Backing-store interface consumed by the tree core, plus an in-memory
//! implementation.
//!
//! The core is oblivious to how areas are laid out; it only ever allocates
//! an area, streams a node image into it and later reads it back through
//! the mirrored primitive surface. All multi-byte primitives are
//! big-endian.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;

use crate::reference::NodeReference;
use crate::TreeStoreError;

/// Sequential writer into a freshly allocated area.
///
/// The reference the finished area will be reachable under is fixed at
/// allocation time, so callers may link to an area before its payload has
/// been emitted.
pub trait AreaWriter {
    fn reference(&self) -> NodeReference;

    fn put_u8(&mut self, v: u8) -> Result<(), TreeStoreError>;
    fn put(&mut self, buf: &[u8]) -> Result<(), TreeStoreError>;
    fn put_u16(&mut self, v: u16) -> Result<(), TreeStoreError>;
    fn put_u32(&mut self, v: u32) -> Result<(), TreeStoreError>;
    fn put_u64(&mut self, v: u64) -> Result<(), TreeStoreError>;

    fn put_i64(&mut self, v: i64) -> Result<(), TreeStoreError> {
        self.put_u64(v as u64)
    }

    /// Seal the area and make it readable under [`AreaWriter::reference`].
    fn finish(self) -> Result<NodeReference, TreeStoreError>
    where
        Self: Sized;
}

/// Sequential reader over a stored area, mirroring [`AreaWriter`].
pub trait AreaReader {
    fn remaining(&self) -> usize;

    fn get_u8(&mut self) -> Result<u8, TreeStoreError>;
    fn get(&mut self, buf: &mut [u8]) -> Result<(), TreeStoreError>;
    fn get_u16(&mut self) -> Result<u16, TreeStoreError>;
    fn get_u32(&mut self) -> Result<u32, TreeStoreError>;
    fn get_u64(&mut self) -> Result<u64, TreeStoreError>;

    fn get_i64(&mut self) -> Result<i64, TreeStoreError> {
        Ok(self.get_u64()? as i64)
    }
}

/// Block-level object store the flushed node images are serialized into.
///
/// Implementations are shared between transactions and must coordinate
/// concurrent reads of immutable areas themselves; every method takes
/// `&self`.
pub trait NodeStore {
    type Writer: AreaWriter;
    type Reader: AreaReader;

    /// Allocate an area of roughly `size_hint` bytes and return a writer
    /// for it.
    fn create_area(&self, size_hint: usize) -> Result<Self::Writer, TreeStoreError>;

    /// Open the area a stored reference points at.
    fn read_area(&self, reference: &NodeReference) -> Result<Self::Reader, TreeStoreError>;

    /// Release an area. Called by commit/GC machinery, never by the tree
    /// core itself.
    fn free_area(&self, reference: &NodeReference) -> Result<(), TreeStoreError>;
}

struct StoreInner {
    areas: RwLock<HashMap<u128, Arc<[u8]>>>,
    next_address: AtomicU64,
}

/// Heap-backed [`NodeStore`]. Cloning yields another handle onto the same
/// area table.
#[derive(Clone)]
pub struct MemoryNodeStore {
    inner: Arc<StoreInner>,
}

impl MemoryNodeStore {
    pub fn new() -> MemoryNodeStore {
        MemoryNodeStore {
            inner: Arc::new(StoreInner {
                areas: RwLock::new(HashMap::new()),
                // address 0 stays unused so the nil-looking reference 0.0
                // never denotes a live area
                next_address: AtomicU64::new(1),
            }),
        }
    }

    /// Number of live areas; test observability.
    pub fn area_count(&self) -> usize {
        self.inner.areas.read().len()
    }

    /// Total bytes held across live areas.
    pub fn byte_count(&self) -> usize {
        self.inner.areas.read().values().map(|a| a.len()).sum()
    }
}

impl Default for MemoryNodeStore {
    fn default() -> Self {
        MemoryNodeStore::new()
    }
}

impl NodeStore for MemoryNodeStore {
    type Writer = MemoryAreaWriter;
    type Reader = MemoryAreaReader;

    fn create_area(&self, size_hint: usize) -> Result<MemoryAreaWriter, TreeStoreError> {
        let address = self.inner.next_address.fetch_add(1, Ordering::Relaxed) as u128;
        Ok(MemoryAreaWriter {
            inner: self.inner.clone(),
            reference: NodeReference::stored(address),
            buf: Vec::with_capacity(size_hint),
        })
    }

    fn read_area(&self, reference: &NodeReference) -> Result<MemoryAreaReader, TreeStoreError> {
        if !reference.is_stored() {
            return Err(TreeStoreError::InvalidReference(*reference));
        }
        let data = self
            .inner
            .areas
            .read()
            .get(&reference.stored_address())
            .cloned()
            .ok_or_else(|| TreeStoreError::PathNotAvailable(format!("no area at {}", reference)))?;
        Ok(MemoryAreaReader {
            cursor: Cursor::new(data),
        })
    }

    fn free_area(&self, reference: &NodeReference) -> Result<(), TreeStoreError> {
        if !reference.is_stored() {
            return Err(TreeStoreError::InvalidReference(*reference));
        }
        self.inner
            .areas
            .write()
            .remove(&reference.stored_address())
            .map(|_| ())
            .ok_or_else(|| TreeStoreError::PathNotAvailable(format!("no area at {}", reference)))
    }
}

pub struct MemoryAreaWriter {
    inner: Arc<StoreInner>,
    reference: NodeReference,
    buf: Vec<u8>,
}

impl AreaWriter for MemoryAreaWriter {
    fn reference(&self) -> NodeReference {
        self.reference
    }

    fn put_u8(&mut self, v: u8) -> Result<(), TreeStoreError> {
        self.buf.write_u8(v)?;
        Ok(())
    }

    fn put(&mut self, buf: &[u8]) -> Result<(), TreeStoreError> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    fn put_u16(&mut self, v: u16) -> Result<(), TreeStoreError> {
        self.buf.write_u16::<BigEndian>(v)?;
        Ok(())
    }

    fn put_u32(&mut self, v: u32) -> Result<(), TreeStoreError> {
        self.buf.write_u32::<BigEndian>(v)?;
        Ok(())
    }

    fn put_u64(&mut self, v: u64) -> Result<(), TreeStoreError> {
        self.buf.write_u64::<BigEndian>(v)?;
        Ok(())
    }

    fn finish(self) -> Result<NodeReference, TreeStoreError> {
        self.inner
            .areas
            .write()
            .insert(self.reference.stored_address(), self.buf.into());
        Ok(self.reference)
    }
}

#[derive(Debug)]
pub struct MemoryAreaReader {
    cursor: Cursor<Arc<[u8]>>,
}

impl AreaReader for MemoryAreaReader {
    fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len() as u64;
        (len - self.cursor.position().min(len)) as usize
    }

    fn get_u8(&mut self) -> Result<u8, TreeStoreError> {
        Ok(self.cursor.read_u8()?)
    }

    fn get(&mut self, buf: &mut [u8]) -> Result<(), TreeStoreError> {
        use std::io::Read;
        self.cursor.read_exact(buf)?;
        Ok(())
    }

    fn get_u16(&mut self) -> Result<u16, TreeStoreError> {
        Ok(self.cursor.read_u16::<BigEndian>()?)
    }

    fn get_u32(&mut self) -> Result<u32, TreeStoreError> {
        Ok(self.cursor.read_u32::<BigEndian>()?)
    }

    fn get_u64(&mut self) -> Result<u64, TreeStoreError> {
        Ok(self.cursor.read_u64::<BigEndian>()?)
    }
}
