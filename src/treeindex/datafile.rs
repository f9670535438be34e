//! Seekable byte-stream views over a single key, and key-range views.
//!
//! A [`DataFile`] is a thin cursor on top of its transaction: every
//! accessor translates the cursor into tree traversals, so any number of
//! views may coexist on one transaction. Multi-byte accessors are
//! big-endian, mirroring the store codec, and `std::io` adapters layer the
//! standard traits over the same cursor.

use std::cell::Cell;
use std::io;

use crate::key::Key;
use crate::reference::NodeReference;
use crate::store::NodeStore;
use crate::treeindex::transaction::TreeSystemTransaction;
use crate::TreeStoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    ReadOnly,
    ReadWrite,
}

/// Opaque descriptor of shareable stored content. Carries no addresses a
/// caller could interpret; its only use is to be handed back to
/// [`DataFile::replicate_from`] via the source file.
pub struct BlockLocation {
    pub(crate) segments: Vec<(NodeReference, u64)>,
    pub(crate) store_token: usize,
}

/// One key's byte stream: a cursor plus readers, writers and structural
/// mutators (`shift`, `set_size`, replication).
pub struct DataFile<'a, S: NodeStore> {
    tx: &'a TreeSystemTransaction<S>,
    key: Key,
    mode: FileMode,
    position: Cell<u64>,
}

impl<'a, S: NodeStore> DataFile<'a, S> {
    pub(crate) fn new(
        tx: &'a TreeSystemTransaction<S>,
        key: Key,
        mode: FileMode,
    ) -> DataFile<'a, S> {
        DataFile {
            tx,
            key,
            mode,
            position: Cell::new(0),
        }
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn size(&self) -> Result<u64, TreeStoreError> {
        let (start, end) = self.tx.file_extent(&self.key)?;
        Ok(end - start)
    }

    /// The cursor, clamped to `[0, size]`. The file may have shrunk
    /// through another view of the same key since the cursor was last
    /// moved, so the clamp is re-applied here.
    pub fn position(&self) -> Result<u64, TreeStoreError> {
        let (pos, _) = self.cursor()?;
        self.position.set(pos);
        Ok(pos)
    }

    /// Move the cursor; it clamps to `[0, size]`.
    pub fn set_position(&self, p: u64) -> Result<(), TreeStoreError> {
        let size = self.size()?;
        self.position.set(p.min(size));
        Ok(())
    }

    fn cursor(&self) -> Result<(u64, u64), TreeStoreError> {
        let size = self.size()?;
        Ok((self.position.get().min(size), size))
    }

    fn check_writable(&self) -> Result<(), TreeStoreError> {
        if self.mode == FileMode::ReadOnly {
            return Err(TreeStoreError::WriteViolation);
        }
        Ok(())
    }

    // ---- positional access (cursor untouched) ---------------------------

    pub fn read_at(&self, pos: u64, out: &mut [u8]) -> Result<(), TreeStoreError> {
        self.tx.read_at(&self.key, pos, out)
    }

    pub fn write_at(&self, pos: u64, data: &[u8]) -> Result<(), TreeStoreError> {
        self.check_writable()?;
        self.tx.write_at(&self.key, pos, data)
    }

    // ---- cursor readers -------------------------------------------------

    pub fn get_into(&self, out: &mut [u8]) -> Result<(), TreeStoreError> {
        let (pos, _) = self.cursor()?;
        self.tx.read_at(&self.key, pos, out)?;
        self.position.set(pos + out.len() as u64);
        Ok(())
    }

    pub fn get_u8(&self) -> Result<u8, TreeStoreError> {
        let mut buf = [0u8; 1];
        self.get_into(&mut buf)?;
        Ok(buf[0])
    }

    pub fn get_u16(&self) -> Result<u16, TreeStoreError> {
        let mut buf = [0u8; 2];
        self.get_into(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    pub fn get_u32(&self) -> Result<u32, TreeStoreError> {
        let mut buf = [0u8; 4];
        self.get_into(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn get_u64(&self) -> Result<u64, TreeStoreError> {
        let mut buf = [0u8; 8];
        self.get_into(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    pub fn get_i64(&self) -> Result<i64, TreeStoreError> {
        Ok(self.get_u64()? as i64)
    }

    /// Lazy byte iterator from the current position to the end of the
    /// file. The iterator keeps its own cursor.
    pub fn bytes(&self) -> DataFileBytes<'_, 'a, S> {
        DataFileBytes {
            file: self,
            pos: self.position.get(),
        }
    }

    // ---- cursor writers -------------------------------------------------

    /// Overwrite at the cursor, extending the file when the write runs to
    /// or past the end.
    pub fn put(&self, data: &[u8]) -> Result<(), TreeStoreError> {
        self.check_writable()?;
        let (pos, _) = self.cursor()?;
        self.tx.write_at(&self.key, pos, data)?;
        self.position.set(pos + data.len() as u64);
        Ok(())
    }

    pub fn put_u8(&self, v: u8) -> Result<(), TreeStoreError> {
        self.put(&[v])
    }

    pub fn put_u16(&self, v: u16) -> Result<(), TreeStoreError> {
        self.put(&v.to_be_bytes())
    }

    pub fn put_u32(&self, v: u32) -> Result<(), TreeStoreError> {
        self.put(&v.to_be_bytes())
    }

    pub fn put_u64(&self, v: u64) -> Result<(), TreeStoreError> {
        self.put(&v.to_be_bytes())
    }

    pub fn put_i64(&self, v: i64) -> Result<(), TreeStoreError> {
        self.put_u64(v as u64)
    }

    // ---- structural mutators --------------------------------------------

    /// Truncate or zero-fill extend to `n` bytes. A shrink pulls the
    /// cursor back to the new end.
    pub fn set_size(&self, n: u64) -> Result<(), TreeStoreError> {
        self.check_writable()?;
        self.tx.set_file_size(&self.key, n)?;
        self.position.set(self.position.get().min(n));
        Ok(())
    }

    pub fn delete(&self) -> Result<(), TreeStoreError> {
        self.set_size(0)
    }

    /// Open (`delta > 0`) or close (`delta < 0`) a gap at the cursor.
    /// Bytes at and after the cursor move by `delta`; the cursor itself
    /// does not.
    pub fn shift(&self, delta: i64) -> Result<(), TreeStoreError> {
        self.check_writable()?;
        let (pos, _) = self.cursor()?;
        self.tx.shift_at(&self.key, pos, delta)
    }

    /// Logical copy of `n` bytes from the source's cursor to this file's
    /// cursor, advancing both.
    pub fn copy_from<T: NodeStore>(
        &self,
        src: &DataFile<'_, T>,
        n: u64,
    ) -> Result<(), TreeStoreError> {
        self.check_writable()?;
        let mut buf = [0u8; 4096];
        let mut remaining = n;
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            src.get_into(&mut buf[..chunk])?;
            self.put(&buf[..chunk])?;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    pub fn copy_to<T: NodeStore>(
        &self,
        dst: &DataFile<'_, T>,
        n: u64,
    ) -> Result<(), TreeStoreError> {
        dst.copy_from(self, n)
    }

    /// Overwrite this file's entire content with the source's. When the
    /// source content is fully stored in the same backing store, the
    /// branches are re-pointed at the shared leaves instead of copying
    /// bytes; otherwise this falls back to a byte copy. Cursors keep their
    /// positions (clamped to the new size).
    pub fn replicate_from<T: NodeStore>(
        &self,
        src: &DataFile<'_, T>,
    ) -> Result<(), TreeStoreError> {
        self.check_writable()?;
        let src_size = src.size()?;

        if let Some(meta) = src.get_block_location_meta(0, src_size)? {
            if meta.store_token == self.tx.store_token() {
                self.tx.set_file_size(&self.key, 0)?;
                self.tx.graft_leaves(&self.key, &meta.segments)?;
                return self.set_position(self.position.get());
            }
        }

        self.tx.set_file_size(&self.key, 0)?;
        let mut buf = [0u8; 4096];
        let mut pos = 0u64;
        while pos < src_size {
            let chunk = (src_size - pos).min(buf.len() as u64) as usize;
            src.read_at(pos, &mut buf[..chunk])?;
            self.tx.write_at(&self.key, pos, &buf[..chunk])?;
            pos += chunk as u64;
        }
        self.set_position(self.position.get())
    }

    pub fn replicate_to<T: NodeStore>(&self, dst: &DataFile<'_, T>) -> Result<(), TreeStoreError> {
        dst.replicate_from(self)
    }

    /// Opaque descriptor of `[start, end)` when that range is exactly
    /// covered by shareable stored content; `None` when any of it lives in
    /// the transaction heap or the range is not leaf-aligned.
    pub fn get_block_location_meta(
        &self,
        start: u64,
        end: u64,
    ) -> Result<Option<BlockLocation>, TreeStoreError> {
        let (abs_start, abs_end) = self.tx.file_extent(&self.key)?;
        let size = abs_end - abs_start;
        if start > end || end > size {
            return Err(TreeStoreError::DataPositionOutOfBounds {
                position: end,
                size,
            });
        }
        if start == end {
            return Ok(Some(BlockLocation {
                segments: Vec::new(),
                store_token: self.tx.store_token(),
            }));
        }
        Ok(self
            .tx
            .block_segments(abs_start + start, abs_start + end)?
            .map(|segments| BlockLocation {
                segments,
                store_token: self.tx.store_token(),
            }))
    }
}

pub struct DataFileBytes<'f, 'a, S: NodeStore> {
    file: &'f DataFile<'a, S>,
    pos: u64,
}

impl<'f, 'a, S: NodeStore> Iterator for DataFileBytes<'f, 'a, S> {
    type Item = Result<u8, TreeStoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.file.size() {
            Ok(size) if self.pos >= size => None,
            Ok(_) => {
                let mut buf = [0u8; 1];
                match self.file.read_at(self.pos, &mut buf) {
                    Ok(()) => {
                        self.pos += 1;
                        Some(Ok(buf[0]))
                    }
                    Err(e) => Some(Err(e)),
                }
            }
            Err(e) => Some(Err(e)),
        }
    }
}

fn to_io_error(e: TreeStoreError) -> io::Error {
    match e {
        TreeStoreError::Io(io) => io,
        TreeStoreError::WriteViolation => {
            io::Error::new(io::ErrorKind::PermissionDenied, TreeStoreError::WriteViolation)
        }
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl<'a, S: NodeStore> io::Read for DataFile<'a, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (pos, size) = self.cursor().map_err(to_io_error)?;
        let n = (size - pos).min(buf.len() as u64) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.get_into(&mut buf[..n]).map_err(to_io_error)?;
        Ok(n)
    }
}

impl<'a, S: NodeStore> io::Write for DataFile<'a, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.put(buf).map_err(to_io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// View over every data file with a key in `[lower, upper)`. A lower
/// bound at or above the upper bound denotes the empty range.
pub struct DataRange<'a, S: NodeStore> {
    tx: &'a TreeSystemTransaction<S>,
    lower: Key,
    upper: Key,
}

impl<'a, S: NodeStore> DataRange<'a, S> {
    pub(crate) fn new(
        tx: &'a TreeSystemTransaction<S>,
        lower: Key,
        upper: Key,
    ) -> DataRange<'a, S> {
        DataRange { tx, lower, upper }
    }

    pub fn lower(&self) -> Key {
        self.lower
    }

    pub fn upper(&self) -> Key {
        self.upper
    }

    /// Total payload bytes across the covered keys.
    pub fn byte_size(&self) -> Result<u64, TreeStoreError> {
        if self.lower >= self.upper {
            return Ok(0);
        }
        let from = self.tx.key_boundary(&self.lower, false)?;
        let to = self.tx.key_boundary(&self.upper, false)?;
        Ok(to - from)
    }

    /// The distinct covered keys, in order.
    pub fn key_list(&self) -> Result<Vec<Key>, TreeStoreError> {
        if self.lower >= self.upper {
            return Ok(Vec::new());
        }
        self.tx.keys_in_range(&self.lower, &self.upper)
    }

    /// Remove the content of every covered key.
    pub fn delete_all(&self) -> Result<(), TreeStoreError> {
        for key in self.key_list()? {
            self.tx.set_file_size(&key, 0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryNodeStore;
    use crate::treeindex::{TreeConfig, TreeStore};

    fn new_store() -> TreeStore<MemoryNodeStore> {
        TreeStore::new(MemoryNodeStore::new(), TreeConfig::default()).unwrap()
    }

    fn small_leaf_store(max_leaf: usize) -> TreeStore<MemoryNodeStore> {
        let config = TreeConfig {
            max_leaf_byte_size: max_leaf,
            ..TreeConfig::default()
        };
        TreeStore::new(MemoryNodeStore::new(), config).unwrap()
    }

    fn k(primary: i64) -> Key {
        Key::new(10, 0, primary)
    }

    #[test]
    fn single_key_append() {
        let store = new_store();
        let tx = store.transaction();
        let df = tx.get_data_file(k(1), FileMode::ReadWrite).unwrap();

        let pattern: Vec<u8> = (0u8..0x10).collect();
        for _ in 0..16 {
            df.put(&pattern).unwrap();
        }
        assert_eq!(df.size().unwrap(), 256);
        df.set_position(0).unwrap();
        assert_eq!(df.get_u8().unwrap(), 0);
        df.set_position(255).unwrap();
        assert_eq!(df.get_u8().unwrap(), 0x0f);
        tx.check_integrity().unwrap();
    }

    #[test]
    fn cursor_clamps_and_bounds() {
        let store = new_store();
        let tx = store.transaction();
        let df = tx.get_data_file(k(1), FileMode::ReadWrite).unwrap();
        df.put(b"abcdef").unwrap();
        assert_eq!(df.position().unwrap(), 6);

        df.set_position(100).unwrap();
        assert_eq!(df.position().unwrap(), 6);

        // read past the end
        df.set_position(4).unwrap();
        let mut out = [0u8; 4];
        assert!(matches!(
            df.get_into(&mut out),
            Err(TreeStoreError::DataPositionOutOfBounds { .. })
        ));

        // positional write past the end
        assert!(matches!(
            df.write_at(7, b"x"),
            Err(TreeStoreError::DataPositionOutOfBounds { .. })
        ));
        // at the end extends
        df.write_at(6, b"gh").unwrap();
        assert_eq!(df.size().unwrap(), 8);
    }

    #[test]
    fn numeric_accessors_are_big_endian() {
        let store = new_store();
        let tx = store.transaction();
        let df = tx.get_data_file(k(1), FileMode::ReadWrite).unwrap();
        df.put_u16(0x0102).unwrap();
        df.put_u32(0xdead_beef).unwrap();
        df.put_u64(0x0102_0304_0506_0708).unwrap();
        df.put_i64(-2).unwrap();

        df.set_position(0).unwrap();
        let mut raw = [0u8; 2];
        df.get_into(&mut raw).unwrap();
        assert_eq!(raw, [0x01, 0x02]);

        df.set_position(0).unwrap();
        assert_eq!(df.get_u16().unwrap(), 0x0102);
        assert_eq!(df.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(df.get_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(df.get_i64().unwrap(), -2);
    }

    #[test]
    fn shift_insert_scenario() {
        let store = new_store();
        let tx = store.transaction();
        let df = tx.get_data_file(k(1), FileMode::ReadWrite).unwrap();
        df.put(b"ABCDEFGHIJKLMNOP").unwrap();

        df.set_position(4).unwrap();
        df.shift(2).unwrap();
        assert_eq!(df.position().unwrap(), 4);
        df.put_u8(b'X').unwrap();
        df.put_u8(b'Y').unwrap();

        assert_eq!(df.size().unwrap(), 18);
        let mut out = vec![0u8; 18];
        df.read_at(0, &mut out).unwrap();
        assert_eq!(&out, b"ABCDXYEFGHIJKLMNOP");
        tx.check_integrity().unwrap();
    }

    #[test]
    fn negative_shift_closes_gap() {
        let store = new_store();
        let tx = store.transaction();
        let df = tx.get_data_file(k(1), FileMode::ReadWrite).unwrap();
        df.put(b"ABCDXYEFGH").unwrap();
        df.set_position(6).unwrap();
        df.shift(-2).unwrap();
        assert_eq!(df.size().unwrap(), 8);
        let mut out = vec![0u8; 8];
        df.read_at(0, &mut out).unwrap();
        assert_eq!(&out, b"ABCDEFGH");
        // cannot close a gap wider than the bytes before the cursor
        df.set_position(1).unwrap();
        assert!(df.shift(-2).is_err());
    }

    #[test]
    fn set_size_zero_fills() {
        let store = new_store();
        let tx = store.transaction();
        let df = tx.get_data_file(k(1), FileMode::ReadWrite).unwrap();
        df.put(b"ab").unwrap();
        df.set_size(10).unwrap();
        let mut out = vec![0u8; 10];
        df.read_at(0, &mut out).unwrap();
        assert_eq!(&out, b"ab\0\0\0\0\0\0\0\0");

        df.set_size(1).unwrap();
        assert_eq!(df.size().unwrap(), 1);
        // the shrink pulled the cursor back with it
        assert_eq!(df.position().unwrap(), 1);
    }

    #[test]
    fn sparse_extension_reads_as_zero_and_accepts_writes() {
        let store = small_leaf_store(64);
        let tx = store.transaction();
        let df = tx.get_data_file(k(1), FileMode::ReadWrite).unwrap();
        df.put(b"start").unwrap();
        df.set_size(100_000).unwrap();
        assert_eq!(df.size().unwrap(), 100_000);

        let mut probe = [0xffu8; 16];
        df.read_at(50_000, &mut probe).unwrap();
        assert_eq!(probe, [0u8; 16]);

        // writing into the sparse middle materializes a window
        df.write_at(50_000, b"mid").unwrap();
        df.read_at(49_998, &mut probe[..7]).unwrap();
        assert_eq!(&probe[..7], b"\0\0mid\0\0");
        df.read_at(0, &mut probe[..5]).unwrap();
        assert_eq!(&probe[..5], b"start");
        tx.check_integrity().unwrap();
    }

    #[test]
    fn delete_removes_the_file() {
        let store = new_store();
        let tx = store.transaction();
        let df = tx.get_data_file(k(1), FileMode::ReadWrite).unwrap();
        df.put(b"gone soon").unwrap();
        assert!(tx.data_file_exists(&k(1)).unwrap());
        df.delete().unwrap();
        assert_eq!(df.size().unwrap(), 0);
        assert!(!tx.data_file_exists(&k(1)).unwrap());
        tx.check_integrity().unwrap();
    }

    #[test]
    fn read_only_mode_rejects_mutation() {
        let store = new_store();
        let tx = store.transaction();
        tx.get_data_file(k(1), FileMode::ReadWrite)
            .unwrap()
            .put(b"data")
            .unwrap();

        let df = tx.get_data_file(k(1), FileMode::ReadOnly).unwrap();
        assert!(matches!(df.put(b"x"), Err(TreeStoreError::WriteViolation)));
        assert!(matches!(df.shift(1), Err(TreeStoreError::WriteViolation)));
        assert!(matches!(
            df.set_size(0),
            Err(TreeStoreError::WriteViolation)
        ));
        // reads still fine
        assert_eq!(df.get_u8().unwrap(), b'd');
    }

    #[test]
    fn sentinel_keys_are_reserved() {
        let store = new_store();
        let tx = store.transaction();
        assert!(matches!(
            tx.get_data_file(Key::HEAD, FileMode::ReadOnly),
            Err(TreeStoreError::ReservedKey)
        ));
        assert!(matches!(
            tx.get_data_file(Key::TAIL, FileMode::ReadWrite),
            Err(TreeStoreError::ReservedKey)
        ));
    }

    #[test]
    fn io_adapters() {
        use std::io::{Read, Write};

        let store = new_store();
        let tx = store.transaction();
        let mut df = tx.get_data_file(k(1), FileMode::ReadWrite).unwrap();
        df.write_all(b"through std::io").unwrap();

        df.set_position(0).unwrap();
        let mut out = String::new();
        df.read_to_string(&mut out).unwrap();
        assert_eq!(out, "through std::io");

        let mut ro = tx.get_data_file(k(1), FileMode::ReadOnly).unwrap();
        let err = ro.write_all(b"nope").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn byte_iterator() {
        let store = new_store();
        let tx = store.transaction();
        let df = tx.get_data_file(k(1), FileMode::ReadWrite).unwrap();
        df.put(b"iter").unwrap();
        df.set_position(1).unwrap();
        let collected: Result<Vec<u8>, _> = df.bytes().collect();
        assert_eq!(collected.unwrap(), b"ter");
        // the iterator does not move the file cursor
        assert_eq!(df.position().unwrap(), 1);
    }

    #[test]
    fn copy_from_advances_both_cursors() {
        let store = new_store();
        let tx = store.transaction();
        let src = tx.get_data_file(k(1), FileMode::ReadWrite).unwrap();
        src.put(b"0123456789").unwrap();
        src.set_position(2).unwrap();

        let dst = tx.get_data_file(k(2), FileMode::ReadWrite).unwrap();
        dst.copy_from(&src, 5).unwrap();

        assert_eq!(src.position().unwrap(), 7);
        assert_eq!(dst.position().unwrap(), 5);
        let mut out = vec![0u8; 5];
        dst.read_at(0, &mut out).unwrap();
        assert_eq!(&out, b"23456");
    }

    #[test]
    fn replicate_is_idempotent() {
        let store = new_store();
        let tx = store.transaction();
        let a = tx.get_data_file(k(1), FileMode::ReadWrite).unwrap();
        a.put(b"replicated content").unwrap();
        let b = tx.get_data_file(k(2), FileMode::ReadWrite).unwrap();
        b.put(b"old junk that is longer than the source").unwrap();

        for _ in 0..2 {
            b.replicate_from(&a).unwrap();
            assert_eq!(b.size().unwrap(), a.size().unwrap());
            let mut got = vec![0u8; 18];
            b.read_at(0, &mut got).unwrap();
            assert_eq!(&got, b"replicated content");
        }
        tx.check_integrity().unwrap();
    }

    #[test]
    fn replicate_shares_stored_leaves() {
        let mem = MemoryNodeStore::new();
        let store = TreeStore::new(mem.clone(), TreeConfig::default()).unwrap();

        // commit the source so its leaves are stored
        let tx = store.transaction();
        let src = tx.get_data_file(k(1), FileMode::ReadWrite).unwrap();
        src.put(&vec![7u8; 20_000]).unwrap();
        store.commit(tx).unwrap();

        let tx = store.transaction();
        let src = tx.get_data_file(k(1), FileMode::ReadOnly).unwrap();
        let meta = src.get_block_location_meta(0, src.size().unwrap()).unwrap();
        assert!(meta.is_some(), "committed content should be shareable");

        let areas_before = mem.area_count();
        let dst = tx.get_data_file(k(2), FileMode::ReadWrite).unwrap();
        dst.replicate_from(&src).unwrap();
        // no leaf images were re-written during replication
        assert_eq!(mem.area_count(), areas_before);

        let mut got = vec![0u8; 20_000];
        dst.read_at(0, &mut got).unwrap();
        assert!(got.iter().all(|&b| b == 7));
        tx.check_integrity().unwrap();

        // writing through one file must not affect the other
        dst.write_at(0, b"X").unwrap();
        let mut probe = [0u8; 1];
        src.read_at(0, &mut probe).unwrap();
        assert_eq!(probe[0], 7);
        tx.check_integrity().unwrap();
    }

    #[test]
    fn uncommitted_content_has_no_block_meta() {
        let store = new_store();
        let tx = store.transaction();
        let df = tx.get_data_file(k(1), FileMode::ReadWrite).unwrap();
        df.put(b"heap only").unwrap();
        assert!(df
            .get_block_location_meta(0, df.size().unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn data_range_views() {
        let store = new_store();
        let tx = store.transaction();
        for p in 1..=5 {
            let df = tx.get_data_file(k(p), FileMode::ReadWrite).unwrap();
            df.put(&vec![p as u8; p as usize * 10]).unwrap();
        }

        let range = tx.get_data_range(k(2), k(4)).unwrap();
        assert_eq!(range.byte_size().unwrap(), 20 + 30);
        assert_eq!(range.key_list().unwrap(), vec![k(2), k(3)]);

        range.delete_all().unwrap();
        assert!(!tx.data_file_exists(&k(2)).unwrap());
        assert!(!tx.data_file_exists(&k(3)).unwrap());
        assert!(tx.data_file_exists(&k(1)).unwrap());
        assert!(tx.data_file_exists(&k(4)).unwrap());
        assert!(tx.data_file_exists(&k(5)).unwrap());
        tx.check_integrity().unwrap();

        // sentinel bounds cover the whole user key space
        let all = tx.get_data_range(Key::HEAD, Key::TAIL).unwrap();
        assert_eq!(all.key_list().unwrap(), vec![k(1), k(4), k(5)]);

        // inverted bounds are the empty range
        let none = tx.get_data_range(k(4), k(2)).unwrap();
        assert_eq!(none.byte_size().unwrap(), 0);
        assert!(none.key_list().unwrap().is_empty());
    }
}
