use rocksdb::{DB, Direction, IteratorMode, Options, WriteBatch, WriteOptions};
use serde::{Serialize, de::DeserializeOwned};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use common::constants::{
    CHECKSUM_KEY_PREFIX, FILE_KEY_PREFIX, NODE_KEY_PREFIX, PART_KEY_PREFIX, REPLOG_KEY_PREFIX,
    TASK_KEY_PREFIX, UPLOAD_KEY_PREFIX,
};
use common::error::CoreError;

use crate::core::chunked::UploadSession;
use crate::core::node::StorageNode;
use crate::core::queue::Task;
use crate::core::record::{FileRecord, FileStatus, ReplicationLogEntry};

const MAX_OPEN_FILES: i32 = 512;
const UPDATE_STRIPES: usize = 64;

/// Persistence interface consumed by the control plane. The store is the
/// system of record; in-memory state is rebuilt from it on start.
pub trait MetaStore: Send + Sync {
    fn save_file_record(&self, record: &FileRecord) -> Result<(), CoreError>;
    fn get_file_record(&self, id: &str) -> Result<Option<FileRecord>, CoreError>;
    /// Read-modify-write under a per-record lock. A mutator error aborts the
    /// update and leaves the stored record untouched.
    fn update_file_record(
        &self,
        id: &str,
        mutator: &mut dyn FnMut(&mut FileRecord) -> Result<(), CoreError>,
    ) -> Result<FileRecord, CoreError>;
    fn list_file_records(&self) -> Result<Vec<FileRecord>, CoreError>;
    fn find_by_checksum(&self, checksum: &str) -> Result<Option<FileRecord>, CoreError>;

    fn list_nodes(&self) -> Result<Vec<StorageNode>, CoreError>;
    fn save_node(&self, node: &StorageNode) -> Result<(), CoreError>;

    fn append_replication_log(&self, entry: &ReplicationLogEntry) -> Result<(), CoreError>;
    fn replication_log(&self, file_id: &str) -> Result<Vec<ReplicationLogEntry>, CoreError>;

    fn save_task(&self, task: &Task) -> Result<(), CoreError>;
    fn get_task(&self, id: &str) -> Result<Option<Task>, CoreError>;
    fn delete_task(&self, id: &str) -> Result<(), CoreError>;
    fn list_tasks(&self) -> Result<Vec<Task>, CoreError>;
    /// Task ids are `{file_id}/{uuid}`, so this is a prefix scan.
    fn list_tasks_for_file(&self, file_id: &str) -> Result<Vec<Task>, CoreError>;

    fn save_upload_session(&self, session: &UploadSession) -> Result<(), CoreError>;
    fn get_upload_session(&self, id: &str) -> Result<Option<UploadSession>, CoreError>;
    fn list_upload_sessions(&self) -> Result<Vec<UploadSession>, CoreError>;
    /// Read-modify-write of a session manifest, serialised like file records.
    fn update_upload_session(
        &self,
        id: &str,
        mutator: &mut dyn FnMut(&mut UploadSession) -> Result<(), CoreError>,
    ) -> Result<UploadSession, CoreError>;
    /// Stores one part and the manifest change describing it in a single
    /// write. A mutator error stores neither.
    fn write_upload_part(
        &self,
        session_id: &str,
        number: u32,
        content: &[u8],
        mutator: &mut dyn FnMut(&mut UploadSession) -> Result<(), CoreError>,
    ) -> Result<UploadSession, CoreError>;
    fn get_upload_part(&self, session_id: &str, number: u32) -> Result<Option<Vec<u8>>, CoreError>;
    /// Drops the manifest and every stored part.
    fn delete_upload_session(&self, id: &str) -> Result<(), CoreError>;
}

pub fn file_key(id: &str) -> String {
    format!("{}:{}", FILE_KEY_PREFIX, id)
}

fn checksum_key(checksum: &str) -> String {
    format!("{}:{}", CHECKSUM_KEY_PREFIX, checksum)
}

fn node_key(id: &str) -> String {
    format!("{}:{}", NODE_KEY_PREFIX, id)
}

fn task_key(id: &str) -> String {
    format!("{}:{}", TASK_KEY_PREFIX, id)
}

fn replog_prefix(file_id: &str) -> String {
    format!("{}:{}:", REPLOG_KEY_PREFIX, file_id)
}

fn upload_key(id: &str) -> String {
    format!("{}:{}", UPLOAD_KEY_PREFIX, id)
}

fn part_prefix(session_id: &str) -> String {
    format!("{}:{}:", PART_KEY_PREFIX, session_id)
}

/// Zero padded so a prefix scan returns parts in order.
fn part_key(session_id: &str, number: u32) -> String {
    format!("{}{:06}", part_prefix(session_id), number)
}

#[derive(Clone)]
pub struct KvDb {
    inner: Arc<DB>,
    stripes: Arc<Vec<Mutex<()>>>,
}

impl KvDb {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_level_compaction_dynamic_level_bytes(true);
        opts.set_max_open_files(MAX_OPEN_FILES);
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_background_jobs(4);

        let db = DB::open(&opts, path)?;
        Ok(Self {
            inner: Arc::new(db),
            stripes: Arc::new((0..UPDATE_STRIPES).map(|_| Mutex::new(())).collect()),
        })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CoreError> {
        let raw = self.inner.get(key.as_bytes()).map_err(anyhow::Error::from)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_slice::<T>(&raw)?)),
            None => Ok(None),
        }
    }

    /// Synced put; everything the coordinator stores is durable state.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CoreError> {
        let buf = serde_json::to_vec(value)?;
        self.inner
            .put_opt(key.as_bytes(), buf, &Self::synced())
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<(), CoreError> {
        self.inner
            .delete_opt(key.as_bytes(), &Self::synced())
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    pub fn scan_prefix<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, CoreError> {
        let mut out = Vec::new();
        let iter = self
            .inner
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for kv in iter {
            let (k, v) = kv.map_err(anyhow::Error::from)?;
            if !k.starts_with(prefix.as_bytes()) {
                break;
            }
            out.push(serde_json::from_slice::<T>(&v)?);
        }
        Ok(out)
    }

    fn synced() -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        write_opts
    }

    fn stripe_for(&self, id: &str) -> &Mutex<()> {
        let idx = blake3::hash(id.as_bytes()).as_bytes()[0] as usize % self.stripes.len();
        &self.stripes[idx]
    }

    fn write_record(&self, record: &FileRecord) -> Result<(), CoreError> {
        let mut batch = WriteBatch::default();
        batch.put(file_key(&record.id).as_bytes(), serde_json::to_vec(record)?);
        let sum_key = checksum_key(&record.checksum);
        if record.status == FileStatus::Deleted || record.status == FileStatus::Expired {
            // drop the dedup index only if it still points at this record
            let indexed: Option<String> = self.get(&sum_key)?;
            if indexed.as_deref() == Some(record.id.as_str()) {
                batch.delete(sum_key.as_bytes());
            }
        } else {
            batch.put(sum_key.as_bytes(), serde_json::to_vec(&record.id)?);
        }
        self.inner
            .write_opt(batch, &Self::synced())
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    /// Manifest update plus an optional raw part, committed together.
    fn update_session_with(
        &self,
        id: &str,
        part: Option<(u32, &[u8])>,
        mutator: &mut dyn FnMut(&mut UploadSession) -> Result<(), CoreError>,
    ) -> Result<UploadSession, CoreError> {
        let _stripe = self
            .stripe_for(id)
            .lock()
            .map_err(|e| anyhow::anyhow!("session stripe poisoned: {}", e))?;

        let mut session: UploadSession = self.get(&upload_key(id))?.ok_or(CoreError::NotFound)?;
        mutator(&mut session)?;

        let mut batch = WriteBatch::default();
        if let Some((number, content)) = part {
            batch.put(part_key(id, number).as_bytes(), content);
        }
        batch.put(upload_key(id).as_bytes(), serde_json::to_vec(&session)?);
        self.inner
            .write_opt(batch, &Self::synced())
            .map_err(anyhow::Error::from)?;
        Ok(session)
    }
}

impl MetaStore for KvDb {
    fn save_file_record(&self, record: &FileRecord) -> Result<(), CoreError> {
        let _stripe = self
            .stripe_for(&record.id)
            .lock()
            .map_err(|e| anyhow::anyhow!("record stripe poisoned: {}", e))?;
        self.write_record(record)
    }

    fn get_file_record(&self, id: &str) -> Result<Option<FileRecord>, CoreError> {
        self.get(&file_key(id))
    }

    fn update_file_record(
        &self,
        id: &str,
        mutator: &mut dyn FnMut(&mut FileRecord) -> Result<(), CoreError>,
    ) -> Result<FileRecord, CoreError> {
        let _stripe = self
            .stripe_for(id)
            .lock()
            .map_err(|e| anyhow::anyhow!("record stripe poisoned: {}", e))?;

        let mut record: FileRecord = self.get(&file_key(id))?.ok_or(CoreError::NotFound)?;
        mutator(&mut record)?;
        self.write_record(&record)?;
        Ok(record)
    }

    fn list_file_records(&self) -> Result<Vec<FileRecord>, CoreError> {
        self.scan_prefix(&format!("{}:", FILE_KEY_PREFIX))
    }

    fn find_by_checksum(&self, checksum: &str) -> Result<Option<FileRecord>, CoreError> {
        match self.get::<String>(&checksum_key(checksum))? {
            Some(id) => self.get_file_record(&id),
            None => Ok(None),
        }
    }

    fn list_nodes(&self) -> Result<Vec<StorageNode>, CoreError> {
        self.scan_prefix(&format!("{}:", NODE_KEY_PREFIX))
    }

    fn save_node(&self, node: &StorageNode) -> Result<(), CoreError> {
        self.put(&node_key(&node.id), node)
    }

    fn append_replication_log(&self, entry: &ReplicationLogEntry) -> Result<(), CoreError> {
        // time-ordered within a file; the uuid suffix keeps same-ms entries apart
        let key = format!(
            "{}{:020}:{}",
            replog_prefix(&entry.file_id),
            entry.at_ms.max(0),
            Uuid::new_v4()
        );
        self.put(&key, entry)
    }

    fn replication_log(&self, file_id: &str) -> Result<Vec<ReplicationLogEntry>, CoreError> {
        self.scan_prefix(&replog_prefix(file_id))
    }

    fn save_task(&self, task: &Task) -> Result<(), CoreError> {
        self.put(&task_key(&task.id), task)
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>, CoreError> {
        self.get(&task_key(id))
    }

    fn delete_task(&self, id: &str) -> Result<(), CoreError> {
        self.delete(&task_key(id))
    }

    fn list_tasks(&self) -> Result<Vec<Task>, CoreError> {
        self.scan_prefix(&format!("{}:", TASK_KEY_PREFIX))
    }

    fn list_tasks_for_file(&self, file_id: &str) -> Result<Vec<Task>, CoreError> {
        self.scan_prefix(&format!("{}:{}/", TASK_KEY_PREFIX, file_id))
    }

    fn save_upload_session(&self, session: &UploadSession) -> Result<(), CoreError> {
        self.put(&upload_key(&session.id), session)
    }

    fn get_upload_session(&self, id: &str) -> Result<Option<UploadSession>, CoreError> {
        self.get(&upload_key(id))
    }

    fn list_upload_sessions(&self) -> Result<Vec<UploadSession>, CoreError> {
        self.scan_prefix(&format!("{}:", UPLOAD_KEY_PREFIX))
    }

    fn update_upload_session(
        &self,
        id: &str,
        mutator: &mut dyn FnMut(&mut UploadSession) -> Result<(), CoreError>,
    ) -> Result<UploadSession, CoreError> {
        self.update_session_with(id, None, mutator)
    }

    fn write_upload_part(
        &self,
        session_id: &str,
        number: u32,
        content: &[u8],
        mutator: &mut dyn FnMut(&mut UploadSession) -> Result<(), CoreError>,
    ) -> Result<UploadSession, CoreError> {
        self.update_session_with(session_id, Some((number, content)), mutator)
    }

    fn get_upload_part(
        &self,
        session_id: &str,
        number: u32,
    ) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self
            .inner
            .get(part_key(session_id, number).as_bytes())
            .map_err(anyhow::Error::from)?)
    }

    fn delete_upload_session(&self, id: &str) -> Result<(), CoreError> {
        let _stripe = self
            .stripe_for(id)
            .lock()
            .map_err(|e| anyhow::anyhow!("session stripe poisoned: {}", e))?;

        let prefix = part_prefix(id);
        let mut batch = WriteBatch::default();
        batch.delete(upload_key(id).as_bytes());
        let iter = self
            .inner
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for kv in iter {
            let (k, _) = kv.map_err(anyhow::Error::from)?;
            if !k.starts_with(prefix.as_bytes()) {
                break;
            }
            batch.delete(&k);
        }
        self.inner
            .write_opt(batch, &Self::synced())
            .map_err(anyhow::Error::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chunked::{SessionStatus, UploadPart};
    use crate::core::record::{ReplicationOutcome, sample_record};
    use tempfile::TempDir;

    fn temp_db() -> (KvDb, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = KvDb::open(&dir.path().join("index")).unwrap();
        (db, dir)
    }

    #[test]
    fn record_roundtrip_and_checksum_index() {
        let (db, _dir) = temp_db();
        let rec = sample_record("f1", "a");
        db.save_file_record(&rec).unwrap();

        assert_eq!(db.get_file_record("f1").unwrap(), Some(rec.clone()));
        assert_eq!(db.find_by_checksum(&rec.checksum).unwrap(), Some(rec.clone()));
        assert!(db.get_file_record("f2").unwrap().is_none());

        db.update_file_record("f1", &mut |r| {
            r.status = FileStatus::Deleted;
            Ok(())
        })
        .unwrap();
        assert!(db.find_by_checksum(&rec.checksum).unwrap().is_none());
    }

    #[test]
    fn failed_mutator_leaves_record_untouched() {
        let (db, _dir) = temp_db();
        db.save_file_record(&sample_record("f1", "a")).unwrap();

        let res = db.update_file_record("f1", &mut |r| {
            r.downloads_remaining = 0;
            Err(CoreError::CounterExhausted)
        });
        assert!(matches!(res, Err(CoreError::CounterExhausted)));
        assert_eq!(db.get_file_record("f1").unwrap().unwrap().downloads_remaining, 3);

        let missing = db.update_file_record("nope", &mut |_| Ok(()));
        assert!(matches!(missing, Err(CoreError::NotFound)));
    }

    #[test]
    fn prefix_scans_do_not_bleed() {
        let (db, _dir) = temp_db();
        db.save_file_record(&sample_record("f1", "a")).unwrap();
        db.save_file_record(&sample_record("f2", "a")).unwrap();
        db.save_node(&StorageNode::new("a", "http://a", 10)).unwrap();

        assert_eq!(db.list_file_records().unwrap().len(), 2);
        assert_eq!(db.list_nodes().unwrap().len(), 1);
        assert!(db.list_tasks().unwrap().is_empty());
    }

    #[test]
    fn replication_log_is_per_file_and_ordered() {
        let (db, _dir) = temp_db();
        for (file, at) in [("f1", 20), ("f1", 10), ("f10", 5)] {
            db.append_replication_log(&ReplicationLogEntry {
                file_id: file.to_string(),
                target_node: "b".to_string(),
                source_node: Some("a".to_string()),
                attempt: 1,
                outcome: ReplicationOutcome::Succeeded,
                detail: None,
                at_ms: at,
            })
            .unwrap();
        }

        let log = db.replication_log("f1").unwrap();
        assert_eq!(log.iter().map(|e| e.at_ms).collect::<Vec<_>>(), vec![10, 20]);
    }

    fn sample_session(id: &str) -> UploadSession {
        UploadSession {
            id: id.to_string(),
            original_name: None,
            mime_type: None,
            total_size: 10,
            chunk_size: 4,
            parts_expected: 3,
            parts: Default::default(),
            status: SessionStatus::Open,
            created_at_ms: 0,
            expires_at_ms: i64::MAX,
        }
    }

    #[test]
    fn upload_parts_live_and_die_with_their_session() {
        let (db, _dir) = temp_db();
        db.save_upload_session(&sample_session("s1")).unwrap();
        db.save_upload_session(&sample_session("s10")).unwrap();

        for (number, content) in [(2u32, &b"efgh"[..]), (1, &b"abcd"[..])] {
            db.write_upload_part("s1", number, content, &mut |s| {
                s.parts.insert(
                    number,
                    UploadPart {
                        number,
                        size_bytes: content.len() as u64,
                        checksum: String::new(),
                    },
                );
                Ok(())
            })
            .unwrap();
        }
        db.write_upload_part("s10", 1, b"zzzz", &mut |_| Ok(())).unwrap();

        let session = db.get_upload_session("s1").unwrap().unwrap();
        assert_eq!(session.parts.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(db.get_upload_part("s1", 2).unwrap().unwrap(), b"efgh");

        // a rejected manifest change keeps the part out too
        let res = db.write_upload_part("s1", 3, b"ij", &mut |_| {
            Err(CoreError::Conflict("closed".into()))
        });
        assert!(matches!(res, Err(CoreError::Conflict(_))));
        assert!(db.get_upload_part("s1", 3).unwrap().is_none());

        db.delete_upload_session("s1").unwrap();
        assert!(db.get_upload_session("s1").unwrap().is_none());
        assert!(db.get_upload_part("s1", 1).unwrap().is_none());
        assert!(db.get_upload_part("s1", 2).unwrap().is_none());
        // a session sharing the id prefix is untouched
        assert_eq!(db.get_upload_part("s10", 1).unwrap().unwrap(), b"zzzz");
        assert_eq!(db.list_upload_sessions().unwrap().len(), 1);

        let missing = db.update_upload_session("s1", &mut |_| Ok(()));
        assert!(matches!(missing, Err(CoreError::NotFound)));
    }
}
