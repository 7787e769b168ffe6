use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use sendq_common::internal;
use serde::Deserialize;
use tokio::{fs, io::AsyncWriteExt};

use crate::{
    error::{Result, SerializationError, StoreError, ValidationError},
    message::{Message, MessageState},
    store::{self, BackingStore, Mutator},
    types::MessageId,
};

/// File-based backing store implementation
///
/// Stores each message as two files in the store directory, named by the
/// message's ULID:
/// - `{id}.eml` — the raw payload, written once at enqueue
/// - `{id}.bin` — the metadata record (envelope, state, attempt bookkeeping)
///   as bincode, rewritten on every update
///
/// # Durability
/// All writes go to a `.tmp_` file first, are flushed to stable storage,
/// and are then renamed into place. A crash mid-write leaves only ignored
/// temporary files; an acknowledged write survives restart.
///
/// # Concurrency
/// A per-message async lock serializes read-modify-write cycles so that
/// `update` provides the compare-and-swap contract; no store-wide lock is
/// taken. The stored `revision` is checked before the write-back and a
/// mismatch fails with `Conflict`.
#[derive(Debug)]
pub struct FileBackingStore {
    path: PathBuf,
    locks: Arc<DashMap<MessageId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Default for FileBackingStore {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/spool/sendq"),
            locks: Arc::new(DashMap::new()),
        }
    }
}

// Custom Deserialize implementation with path validation
impl<'de> Deserialize<'de> for FileBackingStore {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct FileBackingStoreHelper {
            path: PathBuf,
        }

        let helper = FileBackingStoreHelper::deserialize(deserializer)?;
        Self::validate_path(&helper.path).map_err(serde::de::Error::custom)?;

        Ok(Self {
            path: helper.path,
            locks: Arc::new(DashMap::new()),
        })
    }
}

impl FileBackingStore {
    /// Create a file-backed store rooted at `path`
    ///
    /// # Errors
    /// Returns an error if the path is relative, contains `..`, or points
    /// into a system directory.
    pub fn new(path: PathBuf) -> Result<Self> {
        Self::validate_path(&path)?;
        Ok(Self {
            path,
            locks: Arc::new(DashMap::new()),
        })
    }

    /// The store directory
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate a store path
    ///
    /// Rejects paths containing `..`, relative paths, and paths into
    /// sensitive system directories.
    fn validate_path(path: &Path) -> Result<()> {
        for component in path.components() {
            if component == std::path::Component::ParentDir {
                return Err(ValidationError::InvalidPath(format!(
                    "store path cannot contain '..' components: {}",
                    path.display()
                ))
                .into());
            }
        }

        if !path.is_absolute() {
            return Err(ValidationError::InvalidPath(format!(
                "store path must be absolute: {}",
                path.display()
            ))
            .into());
        }

        let sensitive_prefixes = [
            "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
        ];

        for prefix in &sensitive_prefixes {
            if path.starts_with(prefix) {
                return Err(ValidationError::InvalidPath(format!(
                    "store path cannot be in system directory {prefix}: {}",
                    path.display()
                ))
                .into());
            }
        }

        Ok(())
    }

    /// Initialize the file-backed store
    ///
    /// Creates the store directory if it doesn't exist, validates that the
    /// path is a directory, and removes leftovers of interrupted writes and
    /// deletes from previous runs.
    ///
    /// # Errors
    /// - If the store path cannot be created
    /// - If the path exists but is not a directory
    pub fn init(&self) -> Result<()> {
        internal!("Initialising message store ...");

        let path = Path::new(&self.path);
        if !path.try_exists()? {
            internal!("{:#?} does not exist, creating...", self.path);
            std::fs::create_dir_all(path)?;
        } else if !path.is_dir() {
            return Err(
                ValidationError::NotDirectory(path.display().to_string()).into(),
            );
        }

        self.cleanup_stale_files()?;

        Ok(())
    }

    /// Remove orphaned `.deleted` and `.tmp_` files left behind by a crash
    /// during a delete or write.
    fn cleanup_stale_files(&self) -> Result<()> {
        let entries = std::fs::read_dir(&self.path)?;
        let mut cleaned = 0;

        for entry in entries {
            let entry = entry?;
            let filename = entry.file_name();
            let filename_str = filename.to_string_lossy();

            if filename_str.ends_with(".deleted") || filename_str.starts_with(".tmp_") {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} stale files from the message store"
            );
        }

        Ok(())
    }

    fn meta_path(&self, id: &MessageId) -> PathBuf {
        self.path.join(format!("{id}.bin"))
    }

    fn payload_path(&self, id: &MessageId) -> PathBuf {
        self.path.join(format!("{id}.eml"))
    }

    /// The serialization lock for one message's read-modify-write cycle.
    fn lock_for(&self, id: &MessageId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Write `contents` durably: temp file, flush to disk, rename into place.
    async fn write_atomic(&self, filename: &str, contents: &[u8]) -> Result<()> {
        let temp_path = self.path.join(format!(".tmp_{filename}"));
        let final_path = self.path.join(filename);

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &final_path).await?;

        Ok(())
    }

    fn encode_meta(message: &Message) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(message, bincode::config::legacy())
            .map_err(|e| SerializationError::Encode(e).into())
    }

    fn decode_meta(bytes: &[u8]) -> Result<Message> {
        let (message, _): (Message, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
                .map_err(SerializationError::Decode)?;
        Ok(message)
    }

    /// Read a message's metadata, mapping a missing file to `NotFound`.
    async fn read_meta(&self, id: &MessageId) -> Result<Message> {
        let meta = match fs::read(self.meta_path(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        Self::decode_meta(&meta)
    }
}

#[async_trait]
impl BackingStore for FileBackingStore {
    /// Write a new message to disk
    ///
    /// Writes the payload first, then the metadata; the message is only
    /// considered stored once both renames have completed. The payload file
    /// is never rewritten afterwards.
    async fn put(&self, message: &Message) -> Result<()> {
        let meta_path = self.meta_path(&message.id);

        if fs::try_exists(&meta_path).await.unwrap_or(false) {
            return Err(StoreError::DuplicateId(message.id.clone()));
        }

        self.write_atomic(&format!("{}.eml", message.id), &message.payload)
            .await?;
        self.write_atomic(&format!("{}.bin", message.id), &Self::encode_meta(message)?)
            .await?;

        tracing::debug!(id = %message.id, "stored message at {}", meta_path.display());

        Ok(())
    }

    async fn get(&self, id: &MessageId) -> Result<Message> {
        let mut message = self.read_meta(id).await?;
        let payload = fs::read(self.payload_path(id)).await?;
        message.payload = Arc::from(payload);

        Ok(message)
    }

    async fn update(&self, id: &MessageId, mutator: Mutator<'_>) -> Result<Message> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let current = self.get(id).await?;
        let expected_revision = current.revision;

        let mut updated = current;
        store::apply_mutation(&mut updated, mutator)?;

        // Guard against a writer that bypassed the per-message lock (e.g.
        // another process sharing the directory).
        let stored = self.read_meta(id).await?;
        if stored.revision != expected_revision {
            return Err(StoreError::Conflict(id.clone()));
        }

        self.write_atomic(&format!("{id}.bin"), &Self::encode_meta(&updated)?)
            .await?;

        Ok(updated)
    }

    /// Scan the store directory for messages in the given states
    ///
    /// Reads every metadata file whose name is a valid ULID, skipping
    /// temporary and `.deleted` files, and returns matches in FIFO order.
    async fn scan(&self, states: &[MessageState]) -> Result<Vec<Message>> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut matches = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            let filename_str = filename.to_string_lossy();

            if !filename_str.ends_with(".bin") || filename_str.starts_with(".tmp_") {
                continue;
            }

            let Some(id) = MessageId::from_filename(&filename_str) else {
                continue;
            };

            // The message may be deleted between the directory read and
            // here; skip rather than fail the whole scan.
            let message = match self.get(&id).await {
                Ok(message) => message,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };

            if states.contains(&message.state) {
                matches.push(message);
            }
        }

        store::sort_fifo(&mut matches);

        Ok(matches)
    }

    /// Delete a message from the store
    ///
    /// Uses a two-phase delete: both files are first renamed to a
    /// `.deleted` suffix, then removed. A crash between the phases leaves
    /// `.deleted` files that `init()` cleans up, and that `scan` ignores.
    async fn delete(&self, id: &MessageId) -> Result<()> {
        let lock = self.lock_for(id);
        let guard = lock.lock().await;

        let meta_path = self.meta_path(id);
        let payload_path = self.payload_path(id);

        let deleted_meta = self.path.join(format!("{id}.bin.deleted"));
        let deleted_payload = self.path.join(format!("{id}.eml.deleted"));

        for (from, to) in [(&payload_path, &deleted_payload), (&meta_path, &deleted_meta)] {
            match fs::rename(from, to).await {
                Ok(()) => {}
                // Absent files make delete a no-op (idempotency)
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        for path in [&deleted_payload, &deleted_meta] {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        drop(guard);
        self.locks.remove(id);

        tracing::debug!(id = %id, "deleted message from store");

        Ok(())
    }
}
