//! # File Share Store
//!
//! Local store of shared files keyed by `file_id`. Every file is two entries in
//! the store directory:
//!
//! - `<file_id>.blob`: plaintext for public files, `[iv | AES-256-CBC]` otherwise
//! - `<file_id>.meta.json`: the [`FileShare`] record, including the at-rest key
//!
//! Writes for one `file_id` are serialized, and every file is written to a
//! temporary name and renamed into place, so a failed write never leaves a
//! half-written blob or sidecar visible.
//!
//! Sharing the same path twice yields two independent shares: the store is
//! addressed by `file_id`, never by content hash.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::crypto::{open_local, seal_local, CryptoError, LocalKey};
use crate::identity::{now_ms, random_bytes, NodeId};

const BLOB_EXT: &str = "blob";
const META_SUFFIX: &str = ".meta.json";
const TMP_EXT: &str = "tmp";

// ============================================================================
// Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Public,
    Private,
    Team,
}

impl AccessLevel {
    pub fn is_public(self) -> bool {
        self == AccessLevel::Public
    }
}

impl std::str::FromStr for AccessLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(AccessLevel::Public),
            "private" => Ok(AccessLevel::Private),
            "team" => Ok(AccessLevel::Team),
            other => Err(format!("unknown access level: {other}")),
        }
    }
}

/// Metadata for one shared file. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileShare {
    pub file_id: String,
    pub file_name: String,
    /// Hex SHA-256 of the plaintext.
    pub content_hash: String,
    pub size_bytes: u64,
    pub owner_node_id: NodeId,
    pub access_level: AccessLevel,
    /// At-rest key; present iff `access_level` is not public.
    pub encryption_key: Option<Vec<u8>>,
    pub created_at: u64,
}

impl FileShare {
    /// Copy with the encryption key removed, for anything leaving this node.
    pub fn without_key(&self) -> FileShare {
        FileShare {
            encryption_key: None,
            ..self.clone()
        }
    }

    fn local_key(&self) -> Result<Option<LocalKey>, StorageError> {
        match (&self.encryption_key, self.access_level.is_public()) {
            (_, true) => Ok(None),
            (Some(bytes), false) => Ok(Some(LocalKey::from_slice(bytes)?)),
            (None, false) => Err(StorageError::MissingKey {
                file_id: self.file_id.clone(),
            }),
        }
    }
}

#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    /// The file to share does not exist.
    NotFound(PathBuf),
    CorruptMetadata(String),
    /// Stored or received bytes do not hash to `content_hash`.
    HashMismatch { file_id: String },
    /// A non-public file arrived without its key.
    MissingKey { file_id: String },
    /// A `file_id` that is not safe to use as a file name.
    InvalidFileId(String),
    /// An import would replace a file this node owns, or one with other content.
    Conflict { file_id: String },
    Crypto(CryptoError),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "storage I/O error: {e}"),
            StorageError::NotFound(path) => write!(f, "file not found: {}", path.display()),
            StorageError::CorruptMetadata(detail) => write!(f, "corrupt metadata: {detail}"),
            StorageError::HashMismatch { file_id } => {
                write!(f, "content hash mismatch for file {file_id}")
            }
            StorageError::MissingKey { file_id } => {
                write!(f, "no encryption key for file {file_id}")
            }
            StorageError::InvalidFileId(id) => write!(f, "invalid file id {id:?}"),
            StorageError::Conflict { file_id } => {
                write!(f, "file {file_id} is already stored with a different owner or content")
            }
            StorageError::Crypto(e) => write!(f, "storage crypto error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            StorageError::Crypto(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<CryptoError> for StorageError {
    fn from(e: CryptoError) -> Self {
        StorageError::Crypto(e)
    }
}

pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn new_file_id() -> String {
    hex::encode(random_bytes::<16>())
}

/// File ids from peers end up in paths; only plain hex is accepted.
fn validate_file_id(file_id: &str) -> Result<(), StorageError> {
    let ok = !file_id.is_empty()
        && file_id.len() <= 64
        && file_id.bytes().all(|b| b.is_ascii_hexdigit());
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidFileId(file_id.to_string()))
    }
}

/// Reduce a remote-supplied name to a single path component.
pub fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if base.is_empty() || base == "." || base == ".." {
        "download".to_string()
    } else {
        base
    }
}

// ============================================================================
// Store
// ============================================================================

/// Store locations. Unset directories default to subdirectories of the node's
/// data directory.
#[derive(Clone, Debug, Default)]
pub struct StoreConfig {
    /// Blobs and sidecars. Defaults to `<data_dir>/files`.
    pub files_dir: Option<PathBuf>,
    /// Default destination of downloads. Defaults to `<data_dir>/downloads`.
    pub downloads_dir: Option<PathBuf>,
}

impl StoreConfig {
    pub fn files_dir(&self, data_dir: &Path) -> PathBuf {
        self.files_dir.clone().unwrap_or_else(|| data_dir.join("files"))
    }

    pub fn downloads_dir(&self, data_dir: &Path) -> PathBuf {
        self.downloads_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("downloads"))
    }
}

pub struct FileShareStore {
    root: PathBuf,
    owner: NodeId,
    index: RwLock<HashMap<String, FileShare>>,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileShareStore {
    /// Open the store at `root`, reloading every readable sidecar.
    pub async fn open(root: impl Into<PathBuf>, owner: NodeId) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let mut index = HashMap::new();
        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(META_SUFFIX) {
                continue;
            }
            match Self::read_sidecar(&entry.path()).await {
                Ok(share) => {
                    index.insert(share.file_id.clone(), share);
                }
                Err(e) => warn!(file = %name, error = %e, "skipping unreadable sidecar"),
            }
        }

        info!(root = %root.display(), files = index.len(), "file store opened");
        Ok(Self {
            root,
            owner,
            index: RwLock::new(index),
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    async fn read_sidecar(path: &Path) -> Result<FileShare, StorageError> {
        let bytes = tokio::fs::read(path).await?;
        let share: FileShare = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::CorruptMetadata(e.to_string()))?;
        validate_file_id(&share.file_id)?;
        Ok(share)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, file_id: &str) -> PathBuf {
        self.root.join(format!("{file_id}.{BLOB_EXT}"))
    }

    fn meta_path(&self, file_id: &str) -> PathBuf {
        self.root.join(format!("{file_id}{META_SUFFIX}"))
    }

    /// Share the file at `path`. Non-public files are encrypted at rest under a
    /// fresh key.
    pub async fn share(&self, path: &Path, access_level: AccessLevel) -> Result<FileShare, StorageError> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());

        let key = (!access_level.is_public()).then(LocalKey::generate);
        let share = FileShare {
            file_id: new_file_id(),
            file_name,
            content_hash: content_hash(&data),
            size_bytes: data.len() as u64,
            owner_node_id: self.owner,
            access_level,
            encryption_key: key.as_ref().map(|k| k.as_bytes().to_vec()),
            created_at: now_ms(),
        };

        let blob = match &key {
            Some(key) => seal_local(key, &data),
            None => data,
        };
        self.persist(&share, &blob).await?;

        debug!(
            file_id = %share.file_id,
            name = %share.file_name,
            access = ?share.access_level,
            size = share.size_bytes,
            "file shared"
        );
        Ok(share)
    }

    async fn lock_for(&self, file_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        locks
            .entry(file_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget the write lock of `file_id` once no other writer holds it.
    async fn release_lock(&self, file_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.write_locks.lock().await;
        drop(lock);
        if locks.get(file_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(file_id);
        }
    }

    async fn persist(&self, share: &FileShare, blob: &[u8]) -> Result<(), StorageError> {
        let lock = self.lock_for(&share.file_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.write_entry(share, blob).await
        };
        self.release_lock(&share.file_id, lock).await;
        result
    }

    /// Caller holds the write lock of `share.file_id`.
    async fn write_entry(&self, share: &FileShare, blob: &[u8]) -> Result<(), StorageError> {
        let meta = serde_json::to_vec_pretty(share)
            .map_err(|e| StorageError::CorruptMetadata(e.to_string()))?;

        write_atomic(&self.blob_path(&share.file_id), blob).await?;
        if let Err(e) = write_atomic(&self.meta_path(&share.file_id), &meta).await {
            let _ = tokio::fs::remove_file(self.blob_path(&share.file_id)).await;
            return Err(e);
        }

        self.index
            .write()
            .await
            .insert(share.file_id.clone(), share.clone());
        Ok(())
    }

    /// Store plaintext received from a peer, sealing it under the share's key
    /// when the file is not public.
    ///
    /// Files this node owns are never replaced. An id already held from another
    /// owner, or with another content hash, is refused as well.
    pub async fn import_plaintext(
        &self,
        file_info: FileShare,
        plaintext: &[u8],
    ) -> Result<FileShare, StorageError> {
        validate_file_id(&file_info.file_id)?;
        if content_hash(plaintext) != file_info.content_hash {
            return Err(StorageError::HashMismatch {
                file_id: file_info.file_id,
            });
        }
        let blob = match file_info.local_key()? {
            Some(key) => seal_local(&key, plaintext),
            None => plaintext.to_vec(),
        };

        let lock = self.lock_for(&file_info.file_id).await;
        let result = {
            let _guard = lock.lock().await;
            match self.get(&file_info.file_id).await {
                Some(existing)
                    if existing.owner_node_id == self.owner
                        || existing.owner_node_id != file_info.owner_node_id
                        || existing.content_hash != file_info.content_hash =>
                {
                    Err(StorageError::Conflict {
                        file_id: file_info.file_id.clone(),
                    })
                }
                _ => self.write_entry(&file_info, &blob).await,
            }
        };
        self.release_lock(&file_info.file_id, lock).await;
        result?;

        debug!(file_id = %file_info.file_id, owner = %file_info.owner_node_id, "file imported");
        Ok(file_info)
    }

    /// Decrypted, hash-checked content of a locally held file, with its record.
    pub async fn read_plaintext(
        &self,
        file_id: &str,
    ) -> Result<Option<(FileShare, Vec<u8>)>, StorageError> {
        let Some(entry) = self.get(file_id).await else {
            return Ok(None);
        };
        let Some(blob) = self.read_blob(&entry.file_id).await? else {
            return Ok(None);
        };

        let plaintext = match entry.local_key()? {
            Some(key) => open_local(&key, &blob)?,
            None => blob,
        };
        if content_hash(&plaintext) != entry.content_hash {
            return Err(StorageError::HashMismatch {
                file_id: entry.file_id,
            });
        }
        Ok(Some((entry, plaintext)))
    }

    /// Write the plaintext of a locally stored file to `destination`.
    ///
    /// Returns `Ok(None)` when this node does not hold the file. No network I/O.
    pub async fn download(
        &self,
        file_share: &FileShare,
        destination: &Path,
    ) -> Result<Option<PathBuf>, StorageError> {
        let Some((entry, plaintext)) = self.read_plaintext(&file_share.file_id).await? else {
            return Ok(None);
        };

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(destination, &plaintext).await?;
        info!(file_id = %entry.file_id, dest = %destination.display(), "file downloaded");
        Ok(Some(destination.to_path_buf()))
    }

    /// The stored form of a file, or `None` when the blob is absent.
    pub async fn read_blob(&self, file_id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_file_id(file_id)?;
        match tokio::fs::read(self.blob_path(file_id)).await {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, file_id: &str) -> Option<FileShare> {
        self.index.read().await.get(file_id).cloned()
    }

    pub async fn list(&self) -> Vec<FileShare> {
        let mut shares: Vec<_> = self.index.read().await.values().cloned().collect();
        shares.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.file_id.cmp(&b.file_id)));
        shares
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }
}

/// Temporary sibling of `path`: `.<file name>.<random>.tmp`, so neither other
/// files in the directory nor concurrent writers are touched.
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = hex::encode(random_bytes::<8>());
    path.with_file_name(format!(".{name}.{suffix}.{TMP_EXT}"))
}

/// Write to a unique temporary file then rename over `path`. Files are created
/// 0600 on unix.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    use tokio::io::AsyncWriteExt;

    let tmp = temp_path(path);
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&tmp).await?;
    let result = async {
        file.write_all(bytes).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
