use chrono::{DateTime, Utc};
use confab_core::Conversation;
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub mod file_scope;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation store not found at {}", .path.display())]
    NotFound { path: PathBuf },
    #[error("malformed conversation store at {}: {detail}", .path.display())]
    Malformed { path: PathBuf, detail: String },
    #[error("maintenance lock at {} is held by another process", .path.display())]
    LockHeld { path: PathBuf },
    #[error("conversation {id} has no source document under the store tree")]
    UnmappedConversation { id: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreLayout {
    /// One JSON document holding every conversation, keyed by id
    SingleDocument,
    /// One document per conversation under `<root>/<user>/<period>/`, the
    /// conversation id being the file stem
    DirectoryTree,
}

/// The conversation store, loaded whole into memory; `save` routes each
/// conversation back to the file it came from.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    path: PathBuf,
    layout: StoreLayout,
    conversations: BTreeMap<String, Conversation>,
    sources: BTreeMap<String, PathBuf>,
}

impl ConversationStore {
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Err(StoreError::NotFound {
                path: path.to_path_buf(),
            });
        }
        if path.is_dir() {
            Self::load_tree(path)
        } else {
            Self::load_single_document(path)
        }
    }

    fn load_single_document(path: &Path) -> Result<Self, StoreError> {
        let text = fs::read_to_string(path)?;
        let conversations: BTreeMap<String, Conversation> =
            serde_json::from_str(&text).map_err(|err| StoreError::Malformed {
                path: path.to_path_buf(),
                detail: err.to_string(),
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            layout: StoreLayout::SingleDocument,
            conversations,
            sources: BTreeMap::new(),
        })
    }

    fn load_tree(root: &Path) -> Result<Self, StoreError> {
        let mut conversations = BTreeMap::new();
        let mut sources = BTreeMap::new();
        for user_dir in sorted_dir_entries(root)? {
            if !user_dir.is_dir() {
                continue;
            }
            for period_dir in sorted_dir_entries(&user_dir)? {
                if !period_dir.is_dir() {
                    continue;
                }
                for document in sorted_dir_entries(&period_dir)? {
                    if document.extension().and_then(|ext| ext.to_str()) != Some("json") {
                        continue;
                    }
                    let Some(id) = document
                        .file_stem()
                        .and_then(|stem| stem.to_str())
                        .map(str::to_string)
                    else {
                        continue;
                    };
                    let text = fs::read_to_string(&document)?;
                    let conversation: Conversation =
                        serde_json::from_str(&text).map_err(|err| StoreError::Malformed {
                            path: document.clone(),
                            detail: err.to_string(),
                        })?;
                    if conversations.insert(id.clone(), conversation).is_some() {
                        return Err(StoreError::Malformed {
                            path: document.clone(),
                            detail: format!("duplicate conversation id {id}"),
                        });
                    }
                    sources.insert(id, document);
                }
            }
        }
        Ok(Self {
            path: root.to_path_buf(),
            layout: StoreLayout::DirectoryTree,
            conversations,
            sources,
        })
    }

    pub fn save(&self) -> Result<(), StoreError> {
        match self.layout {
            StoreLayout::SingleDocument => {
                let text = serde_json::to_string_pretty(&self.conversations)?;
                atomic_write(&self.path, text.as_bytes())
            }
            StoreLayout::DirectoryTree => {
                for (id, conversation) in &self.conversations {
                    let Some(source) = self.sources.get(id) else {
                        return Err(StoreError::UnmappedConversation { id: id.clone() });
                    };
                    let text = serde_json::to_string_pretty(conversation)?;
                    atomic_write(source, text.as_bytes())?;
                }
                Ok(())
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> StoreLayout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn conversations(&self) -> &BTreeMap<String, Conversation> {
        &self.conversations
    }

    pub fn conversations_mut(&mut self) -> &mut BTreeMap<String, Conversation> {
        &mut self.conversations
    }
}

fn sorted_dir_entries(path: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut entries: Vec<PathBuf> = fs::read_dir(path)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|entry| entry.path())
        .collect();
    entries.sort();
    Ok(entries)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub timestamp: String,
    pub files: Vec<PathBuf>,
}

pub fn backup_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d_%H%M%S").to_string()
}

/// Copies the store to timestamped backup siblings before a mutating run.
/// Any failure here is fatal to the run: no backup, no write.
pub fn snapshot_store(path: &Path, now: DateTime<Utc>) -> Result<StoreSnapshot, StoreError> {
    let timestamp = backup_timestamp(now);
    if !path.exists() {
        return Err(StoreError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let mut files = Vec::new();
    if path.is_dir() {
        for user_dir in sorted_dir_entries(path)? {
            if !user_dir.is_dir() {
                continue;
            }
            for period_dir in sorted_dir_entries(&user_dir)? {
                if !period_dir.is_dir() {
                    continue;
                }
                for document in sorted_dir_entries(&period_dir)? {
                    if document.extension().and_then(|ext| ext.to_str()) != Some("json") {
                        continue;
                    }
                    files.push(copy_durable(
                        &document,
                        &appended_backup_destination(&document, &timestamp),
                    )?);
                }
            }
        }
    } else {
        files.push(copy_durable(
            path,
            &inserted_backup_destination(path, &timestamp),
        )?);
    }
    Ok(StoreSnapshot { timestamp, files })
}

// `<stem>_backup_<ts>.<ext>`; names without an extension use the appended
// form.
fn inserted_backup_destination(path: &Path, timestamp: &str) -> PathBuf {
    let name = file_name_string(path);
    match name.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => {
            path.with_file_name(format!("{stem}_backup_{timestamp}.{extension}"))
        }
        _ => appended_backup_destination(path, timestamp),
    }
}

// `<name>.backup_<ts>`
fn appended_backup_destination(path: &Path, timestamp: &str) -> PathBuf {
    let name = file_name_string(path);
    path.with_file_name(format!("{name}.backup_{timestamp}"))
}

fn file_name_string(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn copy_durable(source: &Path, destination: &Path) -> Result<PathBuf, StoreError> {
    let bytes = fs::read(source)?;
    let mut file = File::create(destination)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    Ok(destination.to_path_buf())
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Writes `bytes` through a same-directory temp file and renames it into
/// place, so the destination is never observed half-written.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&directory)?;
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let temp_path = directory.join(format!(
        ".tmp-{}-{}-{}",
        std::process::id(),
        file_name_string(path),
        seq
    ));
    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_data()?;
    drop(file);
    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(StoreError::Io(err));
    }
    Ok(())
}

/// Exclusive advisory lock held for the span of a mutating run. Mutation is
/// whole-store read-modify-write with no merge, so whoever cannot take the
/// lock must not touch the store. Releases on drop.
#[derive(Debug)]
pub struct MaintenanceLock {
    file: File,
    path: PathBuf,
}

impl MaintenanceLock {
    // `<name>.maintenance.lock` beside a single-document store,
    // `.maintenance.lock` inside a tree root.
    pub fn path_for_store(store_path: &Path) -> PathBuf {
        if store_path.is_dir() {
            store_path.join(".maintenance.lock")
        } else {
            let name = file_name_string(store_path);
            store_path.with_file_name(format!("{name}.maintenance.lock"))
        }
    }

    pub fn acquire(path: &Path, now: DateTime<Utc>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(StoreError::LockHeld {
                path: path.to_path_buf(),
            });
        }
        let metadata = format!(
            "owner_pid={}\nacquired_at={}\n",
            std::process::id(),
            now.to_rfc3339()
        );
        file.set_len(0)?;
        file.write_all(metadata.as_bytes())?;
        file.flush()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MaintenanceLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
