//! Disk-backed tree of state slices with background finalization.
//!
//! The engine keeps one finalized **root** slice plus a tree of frozen
//! overlays above it, keyed by block hash. Depth-`finalize_depth` ancestors
//! of a newly attached slice become immutable: their sibling subtrees are
//! pruned and, when the dump lock is free, the chain below them collapses
//! into the root. A dedicated worker appends finalized payloads to the
//! height-indexed `perm/data` + `perm/datapos` log and atomically replaces
//! the serialized root at `perm/ss`; un-finalized overlays live as paired
//! files under `temp/` and are re-attached on start-up.
//!
//! Lock order: the tree mutex is always innermost; the dump lock is held
//! across disk writes and during root collapses, and is only try-locked from
//! the attach path so block application never waits on the disk.

use crate::storage::slice::Slice;
use crate::storage::StorageError;
use crate::{error, info};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use fs2::FileExt;

/// Slice key length; slice keys are block hashes.
pub const SLICE_KEY_LEN: usize = 32;

/// One `datapos` record: offset, length, then the slice key.
pub const DATAPOS_RECORD_LEN: u64 = 16 + SLICE_KEY_LEN as u64;

pub type SliceKey = [u8; SLICE_KEY_LEN];

#[derive(Debug, Clone)]
pub struct StorageEngineConfig {
    pub finalize_depth: u64,
    /// Fraction of wall-clock time the dump worker may spend writing,
    /// in `(0, 1]`.
    pub dump_disk_ratio: f64,
    pub path: PathBuf,
}

/// In-memory slice tree: child->parent and parent->children relations are
/// plain key tables, so collapsing toward the root is a relabelling rather
/// than a pointer splice.
struct TreeState {
    slices: HashMap<SliceKey, Arc<Slice>>,
    parent: HashMap<SliceKey, SliceKey>,
    children: HashMap<SliceKey, Vec<SliceKey>>,
    /// Per-slice payload: serialized consensus state followed by the block.
    blobs: HashMap<SliceKey, Arc<Vec<u8>>>,
    root: SliceKey,
    /// Heights merged into the root since the last dump, oldest first. The
    /// first entry is the last height already on disk.
    dump_queue: Vec<(i64, SliceKey)>,
}

struct DumpFiles {
    data_w: File,
    datapos_w: File,
}

enum Control {
    Flush(mpsc::Sender<Result<(), StorageError>>),
    Stop,
}

struct EngineInner {
    config: StorageEngineConfig,
    state: Mutex<TreeState>,
    /// Blobs of heights already collapsed into the root but not yet read
    /// back from disk; bridges the gap until the dump worker lands them.
    ldata: Mutex<HashMap<i64, Arc<Vec<u8>>>>,
    /// The dump lock: guards the log writers and pins the root while held.
    dump: Mutex<DumpFiles>,
    datapos_r: Mutex<File>,
    data_r: Mutex<File>,
    _dir_lock: File,
}

pub struct StorageEngine {
    inner: Arc<EngineInner>,
    control: mpsc::Sender<Control>,
    worker: Option<JoinHandle<()>>,
}

fn temp_file_name(path: &Path, key: &SliceKey) -> PathBuf {
    path.join("temp").join(hex::encode(key))
}

impl StorageEngine {
    /// Opens or creates an engine rooted at `config.path`.
    ///
    /// On first creation, `init_slice` (height 0) becomes the root under
    /// `init_key` with `init_blob` as its payload. On later opens the root
    /// is recovered from `perm/ss` and the `temp/` overlays are re-attached
    /// in height order; the arguments are ignored apart from validation.
    pub fn open(
        config: StorageEngineConfig,
        init_slice: Arc<Slice>,
        init_key: SliceKey,
        init_blob: Vec<u8>,
    ) -> Result<StorageEngine, StorageError> {
        if init_slice.height() != 0 {
            return Err(StorageError::InitSliceHeight);
        }
        let perm = config.path.join("perm");
        let temp = config.path.join("temp");
        std::fs::create_dir_all(&perm)?;
        std::fs::create_dir_all(&temp)?;

        let dir_lock = File::create(config.path.join(".lock"))?;
        dir_lock
            .try_lock_exclusive()
            .map_err(|e| StorageError::Io(format!("storage directory busy: {}", e)))?;

        let data_fn = perm.join("data");
        let datapos_fn = perm.join("datapos");
        let ss_fn = perm.join("ss");

        let fresh = !ss_fn.exists();
        let mut data_w = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&data_fn)?;
        let mut datapos_w = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&datapos_fn)?;
        let data_r = File::open(&data_fn)?;
        let datapos_r = File::open(&datapos_fn)?;

        let state = if fresh {
            init_slice.freeze();
            TreeState {
                slices: HashMap::from([(init_key, Arc::clone(&init_slice))]),
                parent: HashMap::new(),
                children: HashMap::new(),
                blobs: HashMap::from([(init_key, Arc::new(init_blob.clone()))]),
                root: init_key,
                dump_queue: vec![(-1, [0u8; SLICE_KEY_LEN])],
            }
        } else {
            let root_slice = Slice::load(&mut BufReader::new(File::open(&ss_fn)?))?;
            let height = root_slice.height() as i64;
            let root_key = read_key_at(&datapos_r, height)?;
            let (offset, length) = read_offset_at(&datapos_r, height)?;
            datapos_w.seek(SeekFrom::Start(
                (height + 1) as u64 * DATAPOS_RECORD_LEN,
            ))?;
            data_w.seek(SeekFrom::Start(offset + length))?;
            TreeState {
                slices: HashMap::from([(root_key, root_slice)]),
                parent: HashMap::new(),
                children: HashMap::new(),
                blobs: HashMap::new(),
                root: root_key,
                dump_queue: Vec::new(),
            }
        };

        let mut ldata = HashMap::new();
        if fresh {
            ldata.insert(0, Arc::new(init_blob));
        }

        let inner = Arc::new(EngineInner {
            config,
            state: Mutex::new(state),
            ldata: Mutex::new(ldata),
            dump: Mutex::new(DumpFiles { data_w, datapos_w }),
            datapos_r: Mutex::new(datapos_r),
            data_r: Mutex::new(data_r),
            _dir_lock: dir_lock,
        });

        inner.load_subtrees();

        if fresh {
            let mut files = inner.dump.lock().unwrap();
            inner.store_root(&mut files)?;
        }

        let (control, rx) = mpsc::channel();
        let worker_inner = Arc::clone(&inner);
        let last_root = inner.state.lock().unwrap().root;
        let worker = std::thread::spawn(move || worker_loop(worker_inner, rx, last_root));

        Ok(StorageEngine {
            inner,
            control,
            worker: Some(worker),
        })
    }

    /// Attaches a frozen slice under `key` with `parent` as its base,
    /// persists its temp files, and runs the finalization pass.
    pub fn add_frozen_slice(
        &self,
        slice: Arc<Slice>,
        key: SliceKey,
        parent: SliceKey,
        blob: Vec<u8>,
    ) -> Result<(), StorageError> {
        if !slice.is_frozen() {
            return Err(StorageError::SliceNotFrozen);
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.slices.contains_key(&key) {
                return Err(StorageError::SliceAlreadyExists);
            }
            state.slices.insert(key, Arc::clone(&slice));
            state.parent.insert(key, parent);
            state.children.entry(parent).or_default().push(key);
        }

        let path = temp_file_name(&self.inner.config.path, &key);
        let mut writer = BufWriter::new(File::create(&path)?);
        slice.dump(&mut writer)?;
        writer.flush()?;

        let mut meta = Vec::with_capacity(SLICE_KEY_LEN + blob.len());
        meta.extend_from_slice(&parent);
        meta.extend_from_slice(&blob);
        std::fs::write(path.with_extension("b"), meta)?;

        {
            let mut state = self.inner.state.lock().unwrap();
            state.blobs.insert(key, Arc::new(blob));
        }

        self.finalize_slice(key);
        Ok(())
    }

    /// Climbs `finalize_depth` ancestors of `key`; everything from there down
    /// to the root is now immutable, so sibling subtrees are pruned and, if
    /// the dump lock is free, the surviving chain collapses into the root.
    fn finalize_slice(&self, key: SliceKey) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().unwrap();
            let mut k = key;
            for _ in 0..inner.config.finalize_depth {
                match state.parent.get(&k) {
                    Some(&p) => k = p,
                    None => return,
                }
            }

            let mut t = k;
            while let Some(&fa) = state.parent.get(&t) {
                let siblings = state.children.get(&fa).cloned().unwrap_or_default();
                for sibling in siblings {
                    if sibling != t {
                        inner.discard_subtree(&mut state, sibling);
                    }
                }
                state.children.insert(fa, vec![t]);
                t = fa;
            }

            if let Ok(_files) = inner.dump.try_lock() {
                inner.merge_fa(&mut state, k);
            }
        }
    }

    /// Returns the slice stored under `key`, if attached.
    pub fn get_slice(&self, key: &SliceKey) -> Option<Arc<Slice>> {
        self.inner.state.lock().unwrap().slices.get(key).cloned()
    }

    pub fn root_key(&self) -> SliceKey {
        self.inner.state.lock().unwrap().root
    }

    /// Path from the root to the deepest leaf under the
    /// `(height desc, key lex asc)` preference.
    pub fn highest_chain(&self) -> Vec<(SliceKey, Arc<Slice>)> {
        let state = self.inner.state.lock().unwrap();

        fn best_leaf(state: &TreeState, k: &SliceKey) -> (u64, SliceKey) {
            let mut best = (state.slices[k].height(), *k);
            if let Some(kids) = state.children.get(k) {
                for kid in kids {
                    let cand = best_leaf(state, kid);
                    if cand.0 > best.0 || (cand.0 == best.0 && cand.1 < best.1) {
                        best = cand;
                    }
                }
            }
            best
        }

        let root = state.root;
        let (_, leaf) = best_leaf(&state, &root);
        let mut path = vec![leaf];
        let mut cur = leaf;
        while cur != state.root {
            cur = state.parent[&cur];
            path.push(cur);
        }
        path.reverse();
        path.into_iter()
            .map(|k| (k, Arc::clone(&state.slices[&k])))
            .collect()
    }

    /// The deepest slice on the highest chain.
    pub fn highest_slice(&self) -> (SliceKey, Arc<Slice>) {
        self.highest_chain().pop().unwrap()
    }

    /// Slice key recorded at a finalized height.
    pub fn read_key(&self, height: i64) -> Result<SliceKey, StorageError> {
        read_key_at(&self.inner.datapos_r.lock().unwrap(), height)
    }

    /// `(offset, length)` of the payload recorded at a finalized height.
    pub fn read_offset(&self, height: i64) -> Result<(u64, u64), StorageError> {
        read_offset_at(&self.inner.datapos_r.lock().unwrap(), height)
    }

    /// Payload of the slice at `height`/`key`: in-memory blobs first, then
    /// the recently finalized cache, then the disk log.
    pub fn read_data(&self, height: i64, key: &SliceKey) -> Result<Vec<u8>, StorageError> {
        if let Some(blob) = self.inner.state.lock().unwrap().blobs.get(key) {
            return Ok(blob.as_ref().clone());
        }
        if let Some(blob) = self.inner.ldata.lock().unwrap().get(&height) {
            return Ok(blob.as_ref().clone());
        }
        let (offset, length) = self.read_offset(height)?;
        let mut file = self.inner.data_r.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        let mut out = vec![0u8; length as usize];
        file.read_exact(&mut out)?;
        Ok(out)
    }

    /// Forces a synchronous dump of the current root.
    pub fn flush(&self) -> Result<(), StorageError> {
        let (ack, rx) = mpsc::channel();
        self.control
            .send(Control::Flush(ack))
            .map_err(|_| StorageError::Io("dump worker gone".into()))?;
        rx.recv()
            .map_err(|_| StorageError::Io("dump worker gone".into()))?
    }

    /// Stops the dump worker. Idempotent; also runs on drop.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.control.send(Control::Stop);
            let _ = worker.join();
        }
    }

    /// Number of slices currently attached (root included).
    pub fn slice_count(&self) -> usize {
        self.inner.state.lock().unwrap().slices.len()
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl EngineInner {
    /// Drops a subtree from memory and removes its temp files.
    fn discard_subtree(&self, state: &mut TreeState, key: SliceKey) {
        if let Some(kids) = state.children.remove(&key) {
            for kid in kids {
                self.discard_subtree(state, kid);
            }
        }
        let path = temp_file_name(&self.config.path, &key);
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("b"));
        state.slices.remove(&key);
        state.parent.remove(&key);
        state.blobs.remove(&key);
    }

    /// Collapses every ancestor of `k` into the root: overlays merge upward,
    /// the merged-away heights queue for the dump worker, and `k` becomes
    /// the new root. Caller holds the dump lock.
    fn merge_fa(&self, state: &mut TreeState, k: SliceKey) {
        let Some(&fa) = state.parent.get(&k) else {
            return;
        };
        self.merge_fa(state, fa);

        let parent_slice = Arc::clone(&state.slices[&fa]);
        let child_slice = Arc::clone(&state.slices[&k]);
        child_slice.absorb_parent(&parent_slice);

        state.slices.remove(&fa);
        state.parent.remove(&k);
        state.children.remove(&fa);
        let parent_height = parent_slice.height() as i64;
        if let Some(blob) = state.blobs.remove(&fa) {
            self.ldata.lock().unwrap().insert(parent_height, blob);
        }
        state.dump_queue.push((parent_height, fa));
        state.root = k;
    }

    /// Re-attaches `temp/` overlays whose parents exist, in height order.
    fn load_subtrees(&self) {
        let temp = self.config.path.join("temp");
        let Ok(entries) = std::fs::read_dir(&temp) else {
            return;
        };
        let mut candidates: Vec<(SliceKey, Arc<Slice>)> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.len() != SLICE_KEY_LEN * 2 {
                continue;
            }
            let Ok(raw) = hex::decode(name) else { continue };
            let Ok(key) = SliceKey::try_from(raw) else {
                continue;
            };
            let Ok(file) = File::open(entry.path()) else {
                continue;
            };
            let Ok(slice) = Slice::load(&mut BufReader::new(file)) else {
                continue;
            };
            candidates.push((key, slice));
        }
        candidates.sort_by_key(|(_, s)| s.height());

        let mut state = self.state.lock().unwrap();
        for (key, slice) in candidates {
            let meta_path = temp_file_name(&self.config.path, &key).with_extension("b");
            let Ok(meta) = std::fs::read(&meta_path) else {
                continue;
            };
            if meta.len() < SLICE_KEY_LEN {
                continue;
            }
            let mut parent = [0u8; SLICE_KEY_LEN];
            parent.copy_from_slice(&meta[..SLICE_KEY_LEN]);
            if let Some(parent_slice) = state.slices.get(&parent) {
                slice.set_base(Some(Arc::clone(parent_slice)));
                state.slices.insert(key, slice);
                state.parent.insert(key, parent);
                state.children.entry(parent).or_default().push(key);
                state
                    .blobs
                    .insert(key, Arc::new(meta[SLICE_KEY_LEN..].to_vec()));
            }
        }
    }

    /// Appends the queued heights to the data log, fsyncs, then atomically
    /// replaces `perm/ss` with the current root slice. Caller holds the dump
    /// lock, which pins the root and the queue.
    fn store_root(&self, files: &mut DumpFiles) -> Result<(), StorageError> {
        let (queue, root_key, root_height, root_blob, root_slice) = {
            let state = self.state.lock().unwrap();
            let root_slice = Arc::clone(&state.slices[&state.root]);
            (
                state.dump_queue.clone(),
                state.root,
                root_slice.height() as i64,
                state.blobs.get(&state.root).cloned().unwrap_or_default(),
                root_slice,
            )
        };

        let data_start = files.data_w.stream_position()?;
        let datapos_start = files.datapos_w.stream_position()?;
        let result = (|| -> Result<(), StorageError> {
            if !queue.is_empty() {
                if datapos_start != (queue[0].0 + 1) as u64 * DATAPOS_RECORD_LEN {
                    return Err(StorageError::Io("datapos cursor mismatch".into()));
                }
                let mut expect_height = queue[0].0 + 1;
                for i in 1..=queue.len() {
                    let (height, blob, id) = if i < queue.len() {
                        let (height, id) = queue[i];
                        let blob = self
                            .ldata
                            .lock()
                            .unwrap()
                            .get(&height)
                            .cloned()
                            .unwrap_or_default();
                        (height, blob, id)
                    } else {
                        (root_height, Arc::clone(&root_blob), root_key)
                    };
                    if height != expect_height {
                        return Err(StorageError::Io("dump queue height mismatch".into()));
                    }
                    expect_height += 1;

                    let pos = files.data_w.stream_position()?;
                    let mut record = [0u8; DATAPOS_RECORD_LEN as usize];
                    record[..8].copy_from_slice(&pos.to_le_bytes());
                    record[8..16].copy_from_slice(&(blob.len() as u64).to_le_bytes());
                    record[16..].copy_from_slice(&id);
                    files.datapos_w.write_all(&record)?;
                    files.data_w.write_all(&blob)?;
                }
                files.datapos_w.sync_all()?;
                files.data_w.sync_all()?;
            }

            let perm = self.config.path.join("perm");
            let next = perm.join("ss.next");
            let file = File::create(&next)?;
            let mut writer = BufWriter::new(file);
            root_slice.dump(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            drop(writer);
            std::fs::rename(&next, perm.join("ss"))?;
            Ok(())
        })();

        if result.is_err() {
            // Rewind so a retry appends at the same positions
            files.data_w.seek(SeekFrom::Start(data_start))?;
            files.datapos_w.seek(SeekFrom::Start(datapos_start))?;
            return result;
        }

        {
            let mut ldata = self.ldata.lock().unwrap();
            for (height, _) in &queue {
                ldata.remove(height);
            }
        }
        for (_, id) in &queue {
            let path = temp_file_name(&self.config.path, id);
            let _ = std::fs::remove_file(&path);
            let _ = std::fs::remove_file(path.with_extension("b"));
        }
        self.state.lock().unwrap().dump_queue.clear();
        Ok(())
    }
}

fn read_key_at(mut file: &File, height: i64) -> Result<SliceKey, StorageError> {
    file.seek(SeekFrom::Start(
        height as u64 * DATAPOS_RECORD_LEN + 16,
    ))?;
    let mut key = [0u8; SLICE_KEY_LEN];
    file.read_exact(&mut key)
        .map_err(|_| StorageError::KeyMissing(height as u64))?;
    Ok(key)
}

fn read_offset_at(mut file: &File, height: i64) -> Result<(u64, u64), StorageError> {
    file.seek(SeekFrom::Start(height as u64 * DATAPOS_RECORD_LEN))?;
    let mut buf = [0u8; 16];
    file.read_exact(&mut buf)
        .map_err(|_| StorageError::KeyMissing(height as u64))?;
    Ok((
        u64::from_le_bytes(buf[..8].try_into().unwrap()),
        u64::from_le_bytes(buf[8..].try_into().unwrap()),
    ))
}

fn worker_loop(inner: Arc<EngineInner>, control: mpsc::Receiver<Control>, mut last_root: SliceKey) {
    let base_sleep = Duration::from_secs(5);
    let mut sleep = base_sleep;
    let mut backoff = base_sleep;
    loop {
        match control.recv_timeout(sleep) {
            Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => return,
            Ok(Control::Flush(ack)) => {
                let result = {
                    let mut files = inner.dump.lock().unwrap();
                    inner.store_root(&mut files)
                };
                if result.is_ok() {
                    last_root = inner.state.lock().unwrap().root;
                }
                let _ = ack.send(result);
                sleep = base_sleep;
                continue;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
        sleep = base_sleep;

        let Ok(mut files) = inner.dump.try_lock() else {
            continue;
        };
        let root = inner.state.lock().unwrap().root;
        if root == last_root {
            continue;
        }
        let started = Instant::now();
        match inner.store_root(&mut files) {
            Ok(()) => {
                let height = inner
                    .state
                    .lock()
                    .unwrap()
                    .slices
                    .get(&root)
                    .map(|s| s.height())
                    .unwrap_or_default();
                info!(
                    "stored root slice {} at height {}",
                    hex::encode(root),
                    height
                );
                last_root = root;
                backoff = base_sleep;
                let ratio = inner.config.dump_disk_ratio;
                let idle = started.elapsed().as_nanos() as f64 / ratio * (1.0 - ratio);
                sleep = Duration::from_nanos(idle as u64).min(Duration::from_secs(3600));
            }
            Err(err) => {
                error!(
                    "failed to store root slice {}: {}",
                    hex::encode(root),
                    err
                );
                sleep = backoff;
                backoff = (backoff * 2).min(Duration::from_secs(300));
            }
        }
    }
}
