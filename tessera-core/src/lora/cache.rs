use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use flate2::read::GzDecoder;
use futures::StreamExt;
use sysinfo::Disks;
use tokio::io::AsyncWriteExt;

use crate::LoraError;

/// Default amount of disk space to keep free before downloading.
pub const DEFAULT_MIN_DISK_FREE: u64 = 10 * (1 << 30);

const TEMP_PREFIX: &str = ".partial-";

/// Reports the free bytes on the disk holding a path.
pub type SpaceProbe = Arc<dyn Fn(&Path) -> u64 + Send + Sync>;

/// How a URL should be stored once downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Saved as-is.
    File,
    /// A tarball (optionally gzipped), unpacked into a directory.
    Archive,
}

/// URL-keyed download cache with least-recently-used eviction.
///
/// Each entry lives at `base_dir/<blake3 of the url>`. Entries are evicted
/// oldest first whenever the disk holding the cache drops below
/// `min_disk_free` before a new download. Entries returned since the last
/// [`WeightsCache::unpin_all`] are pinned and never evicted.
pub struct WeightsCache {
    base_dir: PathBuf,
    min_disk_free: u64,
    lru: VecDeque<PathBuf>,
    pinned: HashSet<PathBuf>,
    client: reqwest::Client,
    space_probe: SpaceProbe,
    hits: u64,
    misses: u64,
}

impl WeightsCache {
    /// Opens (or creates) a cache at `base_dir`, adopting entries left by a
    /// previous run in modification order.
    pub fn new(base_dir: impl Into<PathBuf>, min_disk_free: u64) -> Result<Self, LoraError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;

        let mut existing = Vec::new();
        for entry in std::fs::read_dir(&base_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(TEMP_PREFIX) {
                // left behind by an interrupted download
                let _ = remove_entry(&entry.path());
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            existing.push((modified, entry.path()));
        }
        existing.sort();
        if !existing.is_empty() {
            tracing::info!(
                "Adopted {} cached weight entries from {}",
                existing.len(),
                base_dir.display()
            );
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("tessera/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|source| LoraError::Request {
                url: String::new(),
                source,
            })?;

        Ok(Self {
            base_dir,
            min_disk_free,
            lru: existing.into_iter().map(|(_, path)| path).collect(),
            pinned: HashSet::new(),
            client,
            space_probe: Arc::new(available_space),
            hits: 0,
            misses: 0,
        })
    }

    /// Replaces the free-space probe, mostly useful for tests.
    pub fn with_space_probe(mut self, probe: SpaceProbe) -> Self {
        self.space_probe = probe;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Where `key` is (or would be) stored.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.base_dir
            .join(blake3::hash(key.as_bytes()).to_hex().as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        let path = self.entry_path(key);
        self.lru.contains(&path)
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn is_pinned(&self, path: &Path) -> bool {
        self.pinned.contains(path)
    }

    /// Makes every entry evictable again once its holder is done with it.
    pub fn unpin_all(&mut self) {
        self.pinned.clear();
    }

    /// Returns a local path for `url`, downloading it on a miss.
    pub async fn ensure(&mut self, url: &str, kind: EntryKind) -> Result<PathBuf, LoraError> {
        let dest = self.entry_path(url);
        if self.touch(&dest) {
            tracing::debug!("Weights cache hit for {url}");
            self.pinned.insert(dest.clone());
            return Ok(dest);
        }

        self.misses += 1;
        self.make_room();
        let start = Instant::now();
        tracing::info!("Downloading {url} to {}", dest.display());
        self.download(url, &dest, kind).await?;
        tracing::info!("Downloading took {:.2}s", start.elapsed().as_secs_f64());

        self.lru.push_back(dest.clone());
        self.pinned.insert(dest.clone());
        Ok(dest)
    }

    /// Unpacks a local tarball into the cache, keyed by its canonical path,
    /// size and modification time so an archive rewritten in place is
    /// unpacked again.
    pub async fn ensure_local_archive(&mut self, archive: &Path) -> Result<PathBuf, LoraError> {
        let archive = archive.canonicalize()?;
        let dest = self.entry_path(&local_archive_key(&archive)?);
        if self.touch(&dest) {
            self.pinned.insert(dest.clone());
            return Ok(dest);
        }

        self.misses += 1;
        self.make_room();
        let base_dir = self.base_dir.clone();
        let target = dest.clone();
        tokio::task::spawn_blocking(move || unpack_into(&archive, &base_dir, &target))
            .await
            .map_err(|e| LoraError::Io(std::io::Error::other(e)))??;

        self.lru.push_back(dest.clone());
        self.pinned.insert(dest.clone());
        Ok(dest)
    }

    /// Marks `path` as most recently used if it is a live entry.
    fn touch(&mut self, path: &Path) -> bool {
        let Some(entry) = self
            .lru
            .iter()
            .position(|p| p == path)
            .and_then(|pos| self.lru.remove(pos))
        else {
            return false;
        };
        if !entry.exists() {
            tracing::warn!("Cached entry {} vanished from disk", entry.display());
            return false;
        }
        self.lru.push_back(entry);
        self.hits += 1;
        true
    }

    fn make_room(&mut self) {
        while (self.space_probe)(&self.base_dir) < self.min_disk_free {
            let Some(oldest) = self
                .lru
                .iter()
                .position(|p| !self.pinned.contains(p))
                .and_then(|pos| self.lru.remove(pos))
            else {
                tracing::warn!(
                    "Nothing left to evict but free space is still below {} bytes",
                    self.min_disk_free
                );
                break;
            };
            tracing::info!("Evicting {} from weights cache", oldest.display());
            if let Err(e) = remove_entry(&oldest) {
                tracing::warn!("Failed to evict {}: {e}", oldest.display());
            }
        }
    }

    async fn download(&self, url: &str, dest: &Path, kind: EntryKind) -> Result<(), LoraError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| LoraError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoraError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let partial = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.base_dir)?;
        let (file, partial_path) = partial.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| LoraError::Request {
                url: url.to_string(),
                source,
            })?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);
        tracing::debug!("Fetched {written} bytes from {url}");

        if dest.exists() {
            remove_entry(dest)?;
        }
        match kind {
            EntryKind::File => {
                partial_path.persist(dest).map_err(|e| LoraError::Io(e.error))?;
            }
            EntryKind::Archive => {
                let base_dir = self.base_dir.clone();
                let target = dest.to_path_buf();
                tokio::task::spawn_blocking(move || {
                    let result = unpack_into(&partial_path, &base_dir, &target);
                    drop(partial_path);
                    result
                })
                .await
                .map_err(|e| LoraError::Io(std::io::Error::other(e)))??;
            }
        }
        Ok(())
    }
}

fn local_archive_key(archive: &Path) -> Result<String, LoraError> {
    let meta = std::fs::metadata(archive)?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    Ok(format!(
        "file://{}?size={}&mtime={modified}",
        archive.display(),
        meta.len()
    ))
}

/// Unpacks `archive` into a scratch directory next to `dest`, then renames it
/// into place so a half-extracted tree is never visible under `dest`.
fn unpack_into(archive: &Path, base_dir: &Path, dest: &Path) -> Result<(), LoraError> {
    let archive_err = |source| LoraError::Archive {
        path: archive.to_path_buf(),
        source,
    };

    let mut file = File::open(archive)?;
    let mut magic = [0u8; 2];
    let gzipped = file.read_exact(&mut magic).is_ok() && magic == [0x1f, 0x8b];
    file.seek(SeekFrom::Start(0))?;

    let scratch = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempdir_in(base_dir)?;
    let reader = BufReader::new(file);
    if gzipped {
        tar::Archive::new(GzDecoder::new(reader))
            .unpack(scratch.path())
            .map_err(archive_err)?;
    } else {
        tar::Archive::new(reader)
            .unpack(scratch.path())
            .map_err(archive_err)?;
    }

    if dest.exists() {
        remove_entry(dest)?;
    }
    std::fs::rename(scratch.into_path(), dest)?;
    Ok(())
}

fn remove_entry(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

/// Free space on the disk whose mount point is the longest prefix of `path`.
fn available_space(path: &Path) -> u64 {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
        .unwrap_or(u64::MAX)
}
