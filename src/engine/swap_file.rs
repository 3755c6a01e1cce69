//! Disk-backed swap space.
//!
//! Every swapped entry is a file under `<root>/<space>/<shard>/<id>.swp`; an
//! in-memory index maps `(partition, key bytes)` to the file id. Payloads are
//! optionally zstd-compressed. The index is not persisted: a restarted node
//! starts with an empty swap space.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::SwapConfig;
use crate::context::Loader;
use crate::engine::{EngineError, RemoveCallback, SwapEngine};
use crate::error::{Result as StoreResult, StoreError};
use crate::store::entry::{RawEntry, SwapKey};
use crate::store::iter::{BoxedIter, CloseableIterator};

/// Batches at least this large are removed on several threads.
const PARALLEL_REMOVE_THRESHOLD: usize = 64;
const REMOVE_THREADS: usize = 4;

const FORMAT_RAW: u8 = 0;
const FORMAT_ZSTD: u8 = 1;

#[derive(Debug, Clone, Copy)]
struct SlotMeta {
    id: u64,
    stored_size: u64,
}

/// Swap I/O counters.
#[derive(Debug, Default)]
pub struct SwapIoStats {
    pub total_writes: AtomicU64,
    pub total_reads: AtomicU64,
    pub total_bytes_written: AtomicU64,
    pub total_bytes_read: AtomicU64,
}

/// One space's directory and index.
struct SwapDir {
    path: PathBuf,
    index: DashMap<(u32, Bytes), SlotMeta>,
}

impl SwapDir {
    /// Two-level layout keeps directories small: id 12345 → 12/12345.swp
    fn file_path(&self, id: u64) -> PathBuf {
        let shard = id / 1000;
        self.path.join(format!("{shard}")).join(format!("{id}.swp"))
    }
}

/// Disk swap engine.
pub struct FileSwapSpace {
    root: PathBuf,
    zstd_level: Option<i32>,
    spaces: RwLock<HashMap<String, Arc<SwapDir>>>,
    next_id: AtomicU64,
    stats: SwapIoStats,
    open_iterators: Arc<AtomicUsize>,
}

impl FileSwapSpace {
    /// Create a swap engine rooted at `root`. `zstd_level` enables compression.
    pub fn new(root: impl Into<PathBuf>, zstd_level: Option<i32>) -> Result<Self, EngineError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        Ok(Self {
            root,
            zstd_level,
            spaces: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            stats: SwapIoStats::default(),
            open_iterators: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn from_config(config: &SwapConfig) -> Result<Self, EngineError> {
        let level = config.compression.then_some(config.zstd_level);
        Self::new(&config.path, level)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get swap I/O statistics.
    pub fn stats(&self) -> &SwapIoStats {
        &self.stats
    }

    /// Number of iterators handed out and not yet closed or dropped.
    pub fn open_iterators(&self) -> usize {
        self.open_iterators.load(Ordering::SeqCst)
    }

    fn space(&self, name: &str) -> Result<Arc<SwapDir>, EngineError> {
        if let Some(dir) = self.spaces.read().get(name) {
            return Ok(dir.clone());
        }

        let mut spaces = self.spaces.write();
        if let Some(dir) = spaces.get(name) {
            return Ok(dir.clone());
        }

        let dir_name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let path = self.root.join(dir_name);
        std::fs::create_dir_all(&path)?;

        let dir = Arc::new(SwapDir {
            path,
            index: DashMap::new(),
        });
        spaces.insert(name.to_string(), dir.clone());
        Ok(dir)
    }

    fn encode(&self, value: &[u8]) -> Result<Vec<u8>, EngineError> {
        match self.zstd_level {
            Some(level) => {
                let mut out = vec![FORMAT_ZSTD];
                out.extend(zstd::encode_all(value, level)?);
                Ok(out)
            }
            None => {
                let mut out = Vec::with_capacity(value.len() + 1);
                out.push(FORMAT_RAW);
                out.extend_from_slice(value);
                Ok(out)
            }
        }
    }

    fn write_file(&self, dir: &SwapDir, value: &[u8]) -> Result<SlotMeta, EngineError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let path = dir.file_path(id);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let payload = self.encode(value)?;
        std::fs::write(&path, &payload)?;

        self.stats.total_writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_written
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        Ok(SlotMeta {
            id,
            stored_size: payload.len() as u64,
        })
    }

    fn read_file(&self, dir: &SwapDir, id: u64) -> Result<Option<Bytes>, EngineError> {
        let value = read_payload(&dir.file_path(id))?;
        if let Some(v) = &value {
            self.stats.total_reads.fetch_add(1, Ordering::Relaxed);
            self.stats
                .total_bytes_read
                .fetch_add(v.len() as u64, Ordering::Relaxed);
        }
        Ok(value)
    }

    fn delete_file(dir: &SwapDir, id: u64) {
        let path = dir.file_path(id);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to delete swap file");
            }
        }
    }

    fn remove_one<K>(
        &self,
        dir: &SwapDir,
        key: &SwapKey<K>,
        on_removed: RemoveCallback<'_, K>,
    ) -> Result<(), EngineError> {
        match dir.index.remove(&(key.partition, key.key_bytes.clone())) {
            Some((_, slot)) => {
                let value = self.read_file(dir, slot.id)?;
                Self::delete_file(dir, slot.id);
                on_removed(key, value);
            }
            None => on_removed(key, None),
        }
        Ok(())
    }

    fn iter_over(&self, dir: Arc<SwapDir>, slots: Vec<(u32, Bytes, u64)>) -> BoxedIter<RawEntry> {
        self.open_iterators.fetch_add(1, Ordering::SeqCst);
        Box::new(SwapFileIter {
            dir,
            slots: slots.into_iter(),
            open: Some(self.open_iterators.clone()),
        })
    }
}

/// Read and decode a swap file. A missing file means the entry was removed
/// concurrently.
fn read_payload(path: &Path) -> Result<Option<Bytes>, EngineError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match data.split_first() {
        Some((&FORMAT_RAW, rest)) => Ok(Some(Bytes::copy_from_slice(rest))),
        Some((&FORMAT_ZSTD, rest)) => Ok(Some(Bytes::from(zstd::decode_all(rest)?))),
        _ => Err(EngineError::Corrupt(path.to_path_buf())),
    }
}

/// Iterator over a snapshot of a space's index, reading files lazily.
struct SwapFileIter {
    dir: Arc<SwapDir>,
    slots: std::vec::IntoIter<(u32, Bytes, u64)>,
    open: Option<Arc<AtomicUsize>>,
}

impl Iterator for SwapFileIter {
    type Item = StoreResult<RawEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.open.as_ref()?;
        for (partition, key_bytes, id) in self.slots.by_ref() {
            match read_payload(&self.dir.file_path(id)) {
                Ok(Some(value)) => return Some(Ok(RawEntry::new(partition, key_bytes, value))),
                Ok(None) => continue,
                Err(e) => return Some(Err(StoreError::Engine(e))),
            }
        }
        None
    }
}

impl CloseableIterator<RawEntry> for SwapFileIter {
    fn close(&mut self) -> StoreResult<()> {
        if let Some(open) = self.open.take() {
            open.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for SwapFileIter {
    fn drop(&mut self) {
        if let Some(open) = self.open.take() {
            open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl<K: Send + Sync> SwapEngine<K> for FileSwapSpace {
    fn read(&self, space: &str, key: &SwapKey<K>, _loader: &Loader) -> Result<Option<Bytes>, EngineError> {
        let dir = self.space(space)?;
        let index_key = (key.partition, key.key_bytes.clone());
        let slot_id = || dir.index.get(&index_key).map(|slot| slot.id);

        let Some(mut id) = slot_id() else {
            return Ok(None);
        };
        loop {
            if let Some(value) = self.read_file(&dir, id)? {
                return Ok(Some(value));
            }
            // The file is gone: either the key was removed, or an overwrite
            // replaced it and the new slot must be read instead.
            match slot_id() {
                Some(current) if current != id => id = current,
                _ => return Ok(None),
            }
        }
    }

    fn write(&self, space: &str, key: &SwapKey<K>, value: Bytes, _loader: &Loader) -> Result<(), EngineError> {
        let dir = self.space(space)?;
        let slot = self.write_file(&dir, &value)?;

        if let Some(old) = dir.index.insert((key.partition, key.key_bytes.clone()), slot) {
            Self::delete_file(&dir, old.id);
        }

        debug!(
            space,
            partition = key.partition,
            id = slot.id,
            size = value.len(),
            "Wrote swap entry"
        );
        Ok(())
    }

    fn write_all(&self, space: &str, entries: &[(SwapKey<K>, Bytes)], loader: &Loader) -> Result<(), EngineError> {
        for (key, value) in entries {
            SwapEngine::<K>::write(self, space, key, value.clone(), loader)?;
        }
        Ok(())
    }

    fn remove(
        &self,
        space: &str,
        key: &SwapKey<K>,
        on_removed: RemoveCallback<'_, K>,
        _loader: &Loader,
    ) -> Result<(), EngineError> {
        let dir = self.space(space)?;
        self.remove_one(&dir, key, on_removed)
    }

    fn remove_all(
        &self,
        space: &str,
        keys: &[SwapKey<K>],
        on_removed: RemoveCallback<'_, K>,
        _loader: &Loader,
    ) -> Result<(), EngineError> {
        let dir = self.space(space)?;

        if keys.len() < PARALLEL_REMOVE_THRESHOLD {
            for key in keys {
                self.remove_one(&dir, key, on_removed)?;
            }
            return Ok(());
        }

        let chunk = keys.len().div_ceil(REMOVE_THREADS);
        std::thread::scope(|scope| {
            let handles: Vec<_> = keys
                .chunks(chunk)
                .map(|part| {
                    let dir = &dir;
                    scope.spawn(move || -> Result<(), EngineError> {
                        for key in part {
                            self.remove_one(dir, key, on_removed)?;
                        }
                        Ok(())
                    })
                })
                .collect();

            let mut result = Ok(());
            for handle in handles {
                let outcome = handle
                    .join()
                    .unwrap_or_else(|_| Err(EngineError::Io(std::io::Error::other("swap remover panicked"))));
                if result.is_ok() {
                    result = outcome;
                }
            }
            result
        })
    }

    fn delete(&self, space: &str, partition: u32, key_bytes: &[u8]) -> Result<bool, EngineError> {
        let dir = self.space(space)?;
        match dir.index.remove(&(partition, Bytes::copy_from_slice(key_bytes))) {
            Some((_, slot)) => {
                Self::delete_file(&dir, slot.id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn clear(&self, space: &str) -> Result<(), EngineError> {
        let dir = self.space(space)?;
        dir.index.clear();

        match std::fs::remove_dir_all(&dir.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::fs::create_dir_all(&dir.path)?;

        debug!(space, "Cleared swap space");
        Ok(())
    }

    fn raw_iterator(&self, space: &str) -> Result<BoxedIter<RawEntry>, EngineError> {
        let dir = self.space(space)?;
        let slots = dir
            .index
            .iter()
            .map(|e| (e.key().0, e.key().1.clone(), e.value().id))
            .collect();
        Ok(self.iter_over(dir, slots))
    }

    fn partition_iterator(&self, space: &str, partition: u32) -> Result<BoxedIter<RawEntry>, EngineError> {
        let dir = self.space(space)?;
        let slots = dir
            .index
            .iter()
            .filter(|e| e.key().0 == partition)
            .map(|e| (e.key().0, e.key().1.clone(), e.value().id))
            .collect();
        Ok(self.iter_over(dir, slots))
    }

    fn size(&self, space: &str) -> Result<u64, EngineError> {
        let dir = self.space(space)?;
        Ok(dir.index.iter().map(|e| e.value().stored_size).sum())
    }

    fn count(&self, space: &str) -> Result<u64, EngineError> {
        Ok(self.space(space)?.index.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Deployment, StaticDeployment};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn key(part: u32, k: &'static [u8]) -> SwapKey<()> {
        SwapKey::new((), part, Bytes::from_static(k))
    }

    fn loader() -> Loader {
        StaticDeployment::new().global_loader()
    }

    #[test]
    fn test_write_and_read() {
        let tmp = TempDir::new().unwrap();
        let swap = FileSwapSpace::new(tmp.path(), Some(3)).unwrap();

        let data = Bytes::from(vec![42u8; 4096]);
        swap.write("s", &key(0, b"k"), data.clone(), &loader()).unwrap();

        assert_eq!(swap.read("s", &key(0, b"k"), &loader()).unwrap(), Some(data));
        assert_eq!(swap.read("s", &key(1, b"k"), &loader()).unwrap(), None);
        assert_eq!(SwapEngine::<()>::count(&swap, "s").unwrap(), 1);
        // Compressed well below the raw size.
        assert!(SwapEngine::<()>::size(&swap, "s").unwrap() < 4096);
    }

    #[test]
    fn test_overwrite_replaces_file() {
        let tmp = TempDir::new().unwrap();
        let swap = FileSwapSpace::new(tmp.path(), None).unwrap();

        swap.write("s", &key(0, b"k"), Bytes::from_static(b"one"), &loader()).unwrap();
        swap.write("s", &key(0, b"k"), Bytes::from_static(b"two"), &loader()).unwrap();

        assert_eq!(
            swap.read("s", &key(0, b"k"), &loader()).unwrap(),
            Some(Bytes::from_static(b"two"))
        );
        assert_eq!(SwapEngine::<()>::count(&swap, "s").unwrap(), 1);
        assert_eq!(SwapEngine::<()>::size(&swap, "s").unwrap(), 4);
    }

    #[test]
    fn test_read_during_overwrite_never_misses() {
        let tmp = TempDir::new().unwrap();
        let swap = FileSwapSpace::new(tmp.path(), None).unwrap();
        swap.write("s", &key(0, b"k"), Bytes::from_static(b"v0"), &loader()).unwrap();

        let loader = loader();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..500u32 {
                    let value = Bytes::from(format!("v{i}"));
                    swap.write("s", &key(0, b"k"), value, &loader).unwrap();
                }
            });
            for _ in 0..500 {
                let value = swap.read("s", &key(0, b"k"), &loader).unwrap();
                assert!(value.is_some(), "overwritten key read as missing");
            }
        });
        assert_eq!(SwapEngine::<()>::count(&swap, "s").unwrap(), 1);
    }

    #[test]
    fn test_delete_by_partition_and_bytes() {
        let tmp = TempDir::new().unwrap();
        let swap = FileSwapSpace::new(tmp.path(), None).unwrap();
        swap.write("s", &key(2, b"\xff\xff"), Bytes::from_static(b"v"), &loader()).unwrap();

        assert!(!SwapEngine::<()>::delete(&swap, "s", 1, b"\xff\xff").unwrap());
        assert!(SwapEngine::<()>::delete(&swap, "s", 2, b"\xff\xff").unwrap());
        assert!(!SwapEngine::<()>::delete(&swap, "s", 2, b"\xff\xff").unwrap());
        assert_eq!(SwapEngine::<()>::count(&swap, "s").unwrap(), 0);
        assert_eq!(SwapEngine::<()>::size(&swap, "s").unwrap(), 0);
    }

    #[test]
    fn test_remove_reports_through_callback() {
        let tmp = TempDir::new().unwrap();
        let swap = FileSwapSpace::new(tmp.path(), None).unwrap();
        swap.write("s", &key(0, b"k"), Bytes::from_static(b"v"), &loader()).unwrap();

        let seen = Mutex::new(Vec::new());
        let cb = |_: &SwapKey<()>, v: Option<Bytes>| seen.lock().push(v);
        swap.remove("s", &key(0, b"k"), &cb, &loader()).unwrap();
        swap.remove("s", &key(0, b"k"), &cb, &loader()).unwrap();

        assert_eq!(*seen.lock(), vec![Some(Bytes::from_static(b"v")), None]);
        assert_eq!(SwapEngine::<()>::count(&swap, "s").unwrap(), 0);
    }

    #[test]
    fn test_remove_all_in_parallel() {
        let tmp = TempDir::new().unwrap();
        let swap = FileSwapSpace::new(tmp.path(), None).unwrap();

        let keys: Vec<SwapKey<u32>> = (0..200u32)
            .map(|i| SwapKey::new(i, i % 4, Bytes::from(i.to_le_bytes().to_vec())))
            .collect();
        for k in keys.iter().filter(|k| k.key % 2 == 0) {
            swap.write("s", k, Bytes::from_static(b"v"), &loader()).unwrap();
        }

        let hits = Mutex::new(Vec::new());
        let cb = |k: &SwapKey<u32>, v: Option<Bytes>| {
            if v.is_some() {
                hits.lock().push(k.key);
            }
        };
        swap.remove_all("s", &keys, &cb, &loader()).unwrap();

        let mut hits = hits.into_inner();
        hits.sort_unstable();
        assert_eq!(hits, (0..200).filter(|i| i % 2 == 0).collect::<Vec<_>>());
        assert_eq!(SwapEngine::<u32>::count(&swap, "s").unwrap(), 0);
    }

    #[test]
    fn test_iterators_and_clear() {
        let tmp = TempDir::new().unwrap();
        let swap = FileSwapSpace::new(tmp.path(), Some(1)).unwrap();
        for (part, k) in [(0, &b"a"[..]), (1, &b"b"[..]), (1, &b"c"[..])] {
            swap.write("s", &SwapKey::new((), part, Bytes::copy_from_slice(k)), Bytes::from_static(b"v"), &loader())
                .unwrap();
        }

        let mut all = SwapEngine::<()>::raw_iterator(&swap, "s").unwrap();
        assert_eq!(swap.open_iterators(), 1);
        assert_eq!(all.by_ref().count(), 3);
        all.close().unwrap();
        assert_eq!(swap.open_iterators(), 0);

        let part = SwapEngine::<()>::partition_iterator(&swap, "s", 1).unwrap();
        let entries: Vec<_> = part.map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.partition == 1));

        let mut found: Vec<_> = SwapEngine::<()>::raw_iterator(&swap, "s")
            .unwrap()
            .map(|e| e.map(|e| (e.partition, e.key_bytes)))
            .collect::<Result<_, _>>()
            .unwrap();
        found.sort();
        assert_eq!(
            found,
            vec![
                (0, Bytes::from_static(b"a")),
                (1, Bytes::from_static(b"b")),
                (1, Bytes::from_static(b"c")),
            ]
        );
        assert_eq!(swap.open_iterators(), 0);

        SwapEngine::<()>::clear(&swap, "s").unwrap();
        assert_eq!(SwapEngine::<()>::count(&swap, "s").unwrap(), 0);
        assert!(swap.read("s", &key(0, b"a"), &loader()).unwrap().is_none());
    }
}
