//! CAS storage engine
//!
//! Payloads live under `blocks/<shard>/<id>`, metadata under
//! `metadata/<shard>/<id>.json`, where `<shard>` is the two characters that
//! follow the identifier's format tag.

use super::{BlockMetadata, ContentId, StoreResult, StoreStats};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const BLOCKS_DIR: &str = "blocks";
const METADATA_DIR: &str = "metadata";

/// Content-addressable block store
pub struct BlockStore {
    blocks_path: PathBuf,
    metadata_path: PathBuf,
}

impl BlockStore {
    /// Open (or create) a store rooted at the specified path
    pub fn new<P: AsRef<Path>>(base_path: P) -> io::Result<Self> {
        let base_path = base_path.as_ref();
        let blocks_path = base_path.join(BLOCKS_DIR);
        let metadata_path = base_path.join(METADATA_DIR);
        fs::create_dir_all(&blocks_path)?;
        fs::create_dir_all(&metadata_path)?;
        Ok(Self {
            blocks_path,
            metadata_path,
        })
    }

    /// Store a payload and return its identifier.
    ///
    /// The payload is in place before the metadata record is written, so an
    /// interrupted store can leave an orphan payload but never a record
    /// pointing at missing bytes.
    pub fn store(
        &self,
        data: &[u8],
        filename: Option<String>,
        mime_type: Option<String>,
    ) -> StoreResult<ContentId> {
        let id = ContentId::derive(data);

        let path = self.block_path(&id);
        // Content-addressable = immutable; an existing payload is already right
        if !path.exists() {
            write_atomically(&path, data)?;
        }

        let metadata = BlockMetadata::new(id.clone(), data.len() as u64, filename, mime_type);
        let json = serde_json::to_vec_pretty(&metadata)?;
        write_atomically(&self.metadata_file(&id), &json)?;

        log::debug!("Stored block {} ({} bytes)", id, data.len());
        Ok(id)
    }

    /// Read a payload. `None` when the block is not held locally.
    pub fn retrieve(&self, id: &str) -> StoreResult<Option<Vec<u8>>> {
        let id = ContentId::parse(id)?;
        read_if_present(&self.block_path(&id))
    }

    /// Read a block's metadata record
    pub fn stat(&self, id: &str) -> StoreResult<Option<BlockMetadata>> {
        let id = ContentId::parse(id)?;
        match read_if_present(&self.metadata_file(&id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Check if a payload is held. Malformed identifiers are simply absent.
    pub fn exists(&self, id: &str) -> bool {
        match ContentId::parse(id) {
            Ok(id) => self.block_path(&id).exists(),
            Err(_) => false,
        }
    }

    /// All metadata records, newest first.
    /// Unreadable records are skipped with a warning.
    pub fn list(&self) -> StoreResult<Vec<BlockMetadata>> {
        let mut records = Vec::new();

        for shard in fs::read_dir(&self.metadata_path)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }

            for entry in fs::read_dir(shard.path())? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }

                match read_record(&path) {
                    Ok(metadata) => records.push(metadata),
                    Err(e) => log::warn!("Skipping unreadable metadata {:?}: {}", path, e),
                }
            }
        }

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    /// Delete a block and its metadata.
    /// Returns true if either existed and was removed.
    pub fn delete(&self, id: &str) -> StoreResult<bool> {
        let id = match ContentId::parse(id) {
            Ok(id) => id,
            Err(_) => return Ok(false),
        };

        let mut deleted = remove_if_present(&self.block_path(&id))?;
        deleted |= remove_if_present(&self.metadata_file(&id))?;

        if deleted {
            log::debug!("Deleted block: {}", id);
        }
        Ok(deleted)
    }

    /// Count and total size of everything in the store
    pub fn stats(&self) -> StoreResult<StoreStats> {
        Ok(StoreStats::from_records(&self.list()?))
    }

    /// Payload path (organized as blocks/XX/QmXX...)
    fn block_path(&self, id: &ContentId) -> PathBuf {
        self.blocks_path.join(id.shard()).join(id.as_str())
    }

    /// Metadata path (organized as metadata/XX/QmXX....json)
    fn metadata_file(&self, id: &ContentId) -> PathBuf {
        self.metadata_path
            .join(id.shard())
            .join(format!("{}.json", id))
    }
}

/// Write through a uniquely named temporary sibling and rename into place.
/// Concurrent writers of the same path each get their own temporary file;
/// the last rename wins.
fn write_atomically(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) => parent,
        None => return Err(io::Error::new(io::ErrorKind::InvalidInput, "path has no parent")),
    };
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn read_record(path: &Path) -> StoreResult<BlockMetadata> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn read_if_present(path: &Path) -> StoreResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
