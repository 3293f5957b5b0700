//! Copy-on-write key/value overlay.
//!
//! A slice holds the writes of one tentative block on top of a base slice.
//! Reads walk the base chain until a hit and fall through to zero; writes
//! stay local until `merge` copies them into the base. Freezing is one-way
//! and makes the overlay safe to attach to the storage engine's tree.
//!
//! Ownership: a slice owns only its local overlay. The base relation is a
//! reference-counted handle, so sibling forks of the same base are
//! independent and a dropped fork disappears without a trace.

use crate::storage::StorageError;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Slice key length: tag byte, 32-byte address, 23 bytes of payload, 8-byte
/// index, sub-key discriminator.
pub const KEY_LEN: usize = 65;

/// Slice value length.
pub const DATA_LEN: usize = 32;

pub type Key = [u8; KEY_LEN];
pub type Value = [u8; DATA_LEN];

pub struct Slice {
    base: RwLock<Option<Arc<Slice>>>,
    height: u64,
    entries: RwLock<HashMap<Key, Value>>,
    frozen: AtomicBool,
}

impl Slice {
    /// Creates the bottom slice of a fresh chain (height 0, no base).
    pub fn empty() -> Arc<Slice> {
        Arc::new(Slice {
            base: RwLock::new(None),
            height: 0,
            entries: RwLock::new(HashMap::new()),
            frozen: AtomicBool::new(false),
        })
    }

    /// Forks `base` into a fresh writable overlay one height up.
    pub fn fork(base: &Arc<Slice>) -> Arc<Slice> {
        Arc::new(Slice {
            base: RwLock::new(Some(Arc::clone(base))),
            height: base.height + 1,
            entries: RwLock::new(HashMap::new()),
            frozen: AtomicBool::new(false),
        })
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Marks the slice immutable. One-way.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Reads a key, walking the base chain; missing keys read as all-zero.
    pub fn read(&self, key: &Key) -> Value {
        if let Some(v) = self.entries.read().unwrap().get(key) {
            return *v;
        }
        let mut cur = self.base.read().unwrap().clone();
        while let Some(slice) = cur {
            if let Some(v) = slice.entries.read().unwrap().get(key) {
                return *v;
            }
            cur = slice.base.read().unwrap().clone();
        }
        [0u8; DATA_LEN]
    }

    /// Writes a key into the local overlay; rejected once frozen.
    pub fn write(&self, key: Key, value: Value) -> Result<(), StorageError> {
        if self.is_frozen() {
            return Err(StorageError::SliceFrozenWrite);
        }
        self.entries.write().unwrap().insert(key, value);
        Ok(())
    }

    /// Copies the local overlay into the base slice. The overlay itself is
    /// left untouched, so post-merge reads through either handle agree.
    pub fn merge(&self) {
        let base = self.base.read().unwrap().clone();
        if let Some(base) = base {
            let mut dst = base.entries.write().unwrap();
            for (k, v) in self.entries.read().unwrap().iter() {
                dst.insert(*k, *v);
            }
        }
    }

    /// Collapses `parent`'s overlay into this slice and detaches the base
    /// link, making this slice the new bottom of its chain. Own entries win
    /// on conflicts. Used by the engine when finalizing toward the root.
    pub(crate) fn absorb_parent(&self, parent: &Slice) {
        let mut merged = std::mem::take(&mut *parent.entries.write().unwrap());
        for (k, v) in self.entries.read().unwrap().iter() {
            merged.insert(*k, *v);
        }
        *self.entries.write().unwrap() = merged;
        *self.base.write().unwrap() = None;
    }

    /// Number of keys in the local overlay.
    pub fn overlay_len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Serializes the overlay: height, entry count, then sorted
    /// `(key, value)` tuples.
    pub fn dump<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        let entries = self.entries.read().unwrap();
        w.write_all(&self.height.to_le_bytes())?;
        w.write_all(&(entries.len() as u64).to_le_bytes())?;
        let mut keys: Vec<&Key> = entries.keys().collect();
        keys.sort();
        for key in keys {
            w.write_all(key)?;
            w.write_all(&entries[key])?;
        }
        Ok(())
    }

    /// Reads a slice dumped by [`Slice::dump`]. The result is frozen and has
    /// no base.
    pub fn load<R: Read>(r: &mut R) -> std::io::Result<Arc<Slice>> {
        let mut buf8 = [0u8; 8];
        r.read_exact(&mut buf8)?;
        let height = u64::from_le_bytes(buf8);
        r.read_exact(&mut buf8)?;
        let count = u64::from_le_bytes(buf8);
        let mut entries = HashMap::with_capacity(count.min(1 << 20) as usize);
        for _ in 0..count {
            let mut key = [0u8; KEY_LEN];
            let mut value = [0u8; DATA_LEN];
            r.read_exact(&mut key)?;
            r.read_exact(&mut value)?;
            entries.insert(key, value);
        }
        Ok(Arc::new(Slice {
            base: RwLock::new(None),
            height,
            entries: RwLock::new(entries),
            frozen: AtomicBool::new(true),
        }))
    }

    /// Re-attaches a loaded slice to its parent. Only meaningful during
    /// engine recovery, before the slice is visible to readers.
    pub(crate) fn set_base(&self, base: Option<Arc<Slice>>) {
        *self.base.write().unwrap() = base;
    }
}
