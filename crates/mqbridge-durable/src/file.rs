//! ---
//! mqb_section: "03-durable-subscriptions"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Durable subscription records and acknowledgement persistence."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use mqbridge_transport::{MessageId, SubscriptionKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::store::{SubscriptionInfo, SubscriptionStore, SubscriptionSummary};
use crate::{Result, StoreError};

/// Current subscription log format version.
pub const LOG_VERSION: u16 = 1;

const LOG_EXTENSION: &str = "sub";

/// First line of every subscription log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogHeader {
    version: u16,
    created_at: DateTime<Utc>,
    key_hash: String,
    key: SubscriptionKey,
    info: SubscriptionInfo,
}

/// One acknowledged message identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AckEntry {
    sequence: u64,
    timestamp: DateTime<Utc>,
    message_id: MessageId,
}

/// Store keeping one append-only JSON-lines log per subscription in a directory.
///
/// Each acknowledgement is appended and synced to disk before it is
/// reported; reopening the directory restores every record.
pub struct FileSubscriptionStore {
    directory: PathBuf,
    records: Mutex<BTreeMap<SubscriptionKey, FileRecord>>,
}

struct FileRecord {
    path: PathBuf,
    info: SubscriptionInfo,
    acknowledged: IndexSet<MessageId>,
    file: File,
    committed_len: u64,
    last_sequence: u64,
}

impl FileRecord {
    fn append(&mut self, id: &MessageId) -> Result<()> {
        let entry = AckEntry {
            sequence: self.last_sequence + 1,
            timestamp: Utc::now(),
            message_id: id.clone(),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let written = self
            .file
            .write_all(&line)
            .and_then(|()| self.file.sync_data());
        if let Err(err) = written {
            // Drop any partial line so later appends stay parseable.
            if let Err(truncate) = self.file.set_len(self.committed_len) {
                error!(path = %self.path.display(), error = %truncate, "unable to roll back partial entry");
            }
            return Err(err.into());
        }

        self.committed_len += line.len() as u64;
        self.last_sequence = entry.sequence;
        self.acknowledged.insert(entry.message_id);
        Ok(())
    }
}

impl FileSubscriptionStore {
    /// Open (creating if needed) a store rooted at `directory` and load every log in it.
    pub fn open(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;

        let mut records = BTreeMap::new();
        for entry in WalkDir::new(&directory).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|err| StoreError::Io(err.into()))?;
            let is_log = entry.file_type().is_file()
                && entry.path().extension().and_then(|ext| ext.to_str()) == Some(LOG_EXTENSION);
            if !is_log {
                continue;
            }
            let (key, record) = load_record(entry.path())?;
            debug!(subscription = %key, acknowledged = record.acknowledged.len(), "loaded subscription log");
            records.insert(key, record);
        }

        info!(directory = %directory.display(), subscriptions = records.len(), "durable subscription store opened");
        Ok(Self {
            directory,
            records: Mutex::new(records),
        })
    }

    /// Directory holding the subscription logs.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, key: &SubscriptionKey) -> PathBuf {
        self.directory
            .join(format!("{}.{LOG_EXTENSION}", key_hash(key)))
    }
}

impl std::fmt::Debug for FileSubscriptionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSubscriptionStore")
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

impl SubscriptionStore for FileSubscriptionStore {
    fn subscription(&self, key: &SubscriptionKey) -> Result<Option<SubscriptionInfo>> {
        Ok(self.records.lock().get(key).map(|record| record.info.clone()))
    }

    fn create(&self, key: &SubscriptionKey, info: SubscriptionInfo) -> Result<()> {
        let mut records = self.records.lock();
        if records.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.clone()));
        }

        let path = self.path_for(key);
        let header = LogHeader {
            version: LOG_VERSION,
            created_at: Utc::now(),
            key_hash: key_hash(key),
            key: key.clone(),
            info: info.clone(),
        };
        let mut line = serde_json::to_vec(&header)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        let written = file.write_all(&line).and_then(|()| file.sync_all());
        if let Err(err) = written {
            drop(file);
            if let Err(cleanup) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %cleanup, "unable to remove incomplete subscription log");
            }
            return Err(err.into());
        }

        debug!(subscription = %key, path = %path.display(), "subscription log created");
        records.insert(
            key.clone(),
            FileRecord {
                path,
                info,
                acknowledged: IndexSet::new(),
                file,
                committed_len: line.len() as u64,
                last_sequence: 0,
            },
        );
        Ok(())
    }

    fn is_acknowledged(&self, key: &SubscriptionKey, id: &MessageId) -> Result<bool> {
        Ok(self
            .records
            .lock()
            .get(key)
            .is_some_and(|record| record.acknowledged.contains(id)))
    }

    fn acknowledge(&self, key: &SubscriptionKey, id: &MessageId) -> Result<()> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownSubscription(key.clone()))?;
        if record.acknowledged.contains(id) {
            return Ok(());
        }
        record.append(id)
    }

    fn unsubscribe(&self, key: &SubscriptionKey) -> Result<bool> {
        let mut records = self.records.lock();
        let Some(record) = records.get(key) else {
            return Ok(false);
        };
        match fs::remove_file(&record.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(subscription = %key, path = %record.path.display(), "subscription log already gone");
            }
            Err(err) => return Err(err.into()),
        }
        records.remove(key);
        debug!(subscription = %key, "subscription log removed");
        Ok(true)
    }

    fn acknowledged_ids(&self, key: &SubscriptionKey) -> Result<Vec<MessageId>> {
        let records = self.records.lock();
        let record = records
            .get(key)
            .ok_or_else(|| StoreError::UnknownSubscription(key.clone()))?;
        Ok(record.acknowledged.iter().cloned().collect())
    }

    fn subscriptions(&self) -> Result<Vec<SubscriptionSummary>> {
        Ok(self
            .records
            .lock()
            .iter()
            .map(|(key, record)| SubscriptionSummary {
                key: key.clone(),
                info: record.info.clone(),
                acknowledged: record.acknowledged.len(),
            })
            .collect())
    }
}

fn key_hash(key: &SubscriptionKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.client_id.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(key.name.as_bytes());
    hex::encode(hasher.finalize())
}

fn corrupt(path: &Path, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn load_record(path: &Path) -> Result<(SubscriptionKey, FileRecord)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = String::new();

    let header_len = reader.read_line(&mut line)?;
    if header_len == 0 || !line.ends_with('\n') {
        return Err(corrupt(path, "missing header"));
    }
    let header: LogHeader = serde_json::from_str(line.trim_end())
        .map_err(|err| corrupt(path, format!("invalid header: {err}")))?;
    if header.version != LOG_VERSION {
        return Err(corrupt(path, format!("unsupported version {}", header.version)));
    }
    if header.key_hash != key_hash(&header.key) {
        return Err(corrupt(path, "key hash mismatch"));
    }

    let mut acknowledged = IndexSet::new();
    let mut last_sequence = 0u64;
    let mut committed_len = header_len as u64;
    let mut torn: Option<String> = None;

    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        if let Some(reason) = torn.take() {
            // Only the final line may be incomplete.
            return Err(corrupt(path, reason));
        }
        if !line.ends_with('\n') {
            torn = Some("unterminated entry".to_owned());
            continue;
        }
        if line.trim().is_empty() {
            committed_len += read as u64;
            continue;
        }
        match serde_json::from_str::<AckEntry>(line.trim_end()) {
            Ok(entry) => {
                last_sequence = entry.sequence;
                acknowledged.insert(entry.message_id);
                committed_len += read as u64;
            }
            Err(err) => torn = Some(format!("invalid entry: {err}")),
        }
    }

    let file = OpenOptions::new().append(true).open(path)?;
    if let Some(reason) = torn {
        warn!(path = %path.display(), reason = %reason, "discarding torn trailing entry");
        file.set_len(committed_len)?;
    }

    Ok((
        header.key,
        FileRecord {
            path: path.to_path_buf(),
            info: header.info,
            acknowledged,
            file,
            committed_len,
            last_sequence,
        },
    ))
}
