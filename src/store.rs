use std::cell::Cell;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use uuid::Uuid;

use crate::error::TxError;
use crate::files::write_atomic;
use crate::logging::Logger;
use crate::model::{StateFile, TxStatus};

pub const TRANSACTIONS_DIR: &str = "transactions";
pub const UNDONE_DIR: &str = "undone";
pub const STATE_EXT: &str = "yml";
pub const REVERT_PREFIX: &str = "Reverting transaction ";

const PENDING_SUFFIX: &str = ".pending.yml";

/// Selects a committed transaction: by uuid, or by 1-based position in the
/// newest-first history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxRef {
    Uuid(Uuid),
    Index(usize),
}

impl FromStr for TxRef {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if let Ok(uuid) = Uuid::parse_str(raw) {
            return Ok(TxRef::Uuid(uuid));
        }
        match raw.parse::<usize>() {
            Ok(index) if index >= 1 => Ok(TxRef::Index(index)),
            _ => Err(format!(
                "'{raw}' is neither a transaction uuid nor a positive index"
            )),
        }
    }
}

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxRef::Uuid(uuid) => write!(f, "{uuid}"),
            TxRef::Index(index) => write!(f, "#{index}"),
        }
    }
}

/// The write-ahead record directory for one project:
/// `transactions/<uuid>.pending.yml`, `transactions/<uuid>.yml` and
/// `transactions/undone/<uuid>.yml`.
#[derive(Debug)]
pub struct StateStore {
    state_dir: PathBuf,
    ensured: Cell<bool>,
    logger: Logger,
}

impl StateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ensured: Cell::new(false),
            logger: Logger::default(),
        }
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn transactions_dir(&self) -> PathBuf {
        self.state_dir.join(TRANSACTIONS_DIR)
    }

    fn undone_dir(&self) -> PathBuf {
        self.transactions_dir().join(UNDONE_DIR)
    }

    pub fn pending_path(&self, uuid: Uuid) -> PathBuf {
        self.transactions_dir().join(format!("{uuid}{PENDING_SUFFIX}"))
    }

    pub fn committed_path(&self, uuid: Uuid) -> PathBuf {
        self.transactions_dir().join(format!("{uuid}.{STATE_EXT}"))
    }

    pub fn undone_path(&self, uuid: Uuid) -> PathBuf {
        self.undone_dir().join(format!("{uuid}.{STATE_EXT}"))
    }

    fn ensure_dirs(&self) -> Result<(), TxError> {
        if self.ensured.get() {
            return Ok(());
        }
        let dir = self.undone_dir();
        fs::create_dir_all(&dir).map_err(|err| TxError::state_io(&dir, err))?;
        self.ensured.set(true);
        Ok(())
    }

    /// Overwrites any earlier pending record for the same uuid.
    pub fn write_pending(&self, state: &StateFile) -> Result<(), TxError> {
        self.ensure_dirs()?;
        let path = self.pending_path(state.uuid);
        write_record(&path, state)
    }

    /// Promotes the pending record. Falls back to copy + delete across devices; between
    /// those two steps the record briefly exists in both places.
    pub fn commit(&self, uuid: Uuid) -> Result<(), TxError> {
        self.ensure_dirs()?;
        let from = self.pending_path(uuid);
        let to = self.committed_path(uuid);
        match fs::rename(&from, &to) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::CrossesDevices => {
                fs::copy(&from, &to).map_err(|err| TxError::state_io(&to, err))?;
                fs::remove_file(&from).map_err(|err| TxError::state_io(&from, err))
            }
            Err(err) => Err(TxError::state_io(&from, err)),
        }
    }

    pub fn delete_pending(&self, uuid: Uuid) -> Result<(), TxError> {
        let path = self.pending_path(uuid);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(TxError::state_io(&path, err)),
        }
    }

    pub fn has_pending(&self, uuid: Uuid) -> bool {
        self.pending_path(uuid).is_file()
    }

    /// Idempotency guard. Pending records are ignored so a crashed run can be retried.
    pub fn has_been_processed(&self, uuid: Uuid) -> bool {
        self.committed_path(uuid).is_file() || self.undone_path(uuid).is_file()
    }

    /// Committed records, newest first. A record that cannot be parsed is reported
    /// and left out rather than hiding the rest of the history.
    pub fn read_all(&self, skip_reverts: bool) -> Result<Vec<StateFile>, TxError> {
        let dir = self.transactions_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(TxError::state_io(&dir, err)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| TxError::state_io(&dir, err))?.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !path.is_file()
                || name.ends_with(PENDING_SUFFIX)
                || !name.ends_with(&format!(".{STATE_EXT}"))
            {
                continue;
            }
            match read_record(&path, TxStatus::Committed) {
                Ok(record) => records.push(record),
                Err(err) => self.logger.warn(format!("skipping unreadable record: {err}")),
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        if skip_reverts {
            let reverted: HashSet<Uuid> = records.iter().filter_map(revert_target).collect();
            records.retain(|record| {
                revert_target(record).is_none() && !reverted.contains(&record.uuid)
            });
        }
        Ok(records)
    }

    pub fn read_committed(&self, uuid: Uuid) -> Result<Option<StateFile>, TxError> {
        let path = self.committed_path(uuid);
        if !path.is_file() {
            return Ok(None);
        }
        read_record(&path, TxStatus::Committed).map(Some)
    }

    pub fn find(&self, reference: TxRef, skip_reverts: bool) -> Result<Option<StateFile>, TxError> {
        match reference {
            TxRef::Uuid(uuid) => self.read_committed(uuid),
            TxRef::Index(index) => {
                let mut records = self.read_all(skip_reverts)?;
                if index == 0 || index > records.len() {
                    return Ok(None);
                }
                Ok(Some(records.swap_remove(index - 1)))
            }
        }
    }

    pub fn latest(&self) -> Result<Option<StateFile>, TxError> {
        Ok(self.read_all(false)?.into_iter().next())
    }

    /// Moves a committed record under `undone/`.
    pub fn mark_undone(&self, state: &StateFile) -> Result<(), TxError> {
        self.ensure_dirs()?;
        let mut undone = state.clone();
        undone.status = TxStatus::Undone;
        write_record(&self.undone_path(state.uuid), &undone)?;
        let committed = self.committed_path(state.uuid);
        fs::remove_file(&committed).map_err(|err| TxError::state_io(&committed, err))
    }
}

/// The transaction a record inverts: the explicit field, else the legacy reasoning prefix.
pub fn revert_target(record: &StateFile) -> Option<Uuid> {
    record.reverts_uuid.or_else(|| {
        record
            .reasoning
            .first()
            .and_then(|line| line.strip_prefix(REVERT_PREFIX))
            .and_then(|rest| Uuid::parse_str(rest.trim()).ok())
    })
}

fn write_record(path: &Path, state: &StateFile) -> Result<(), TxError> {
    let yaml = serde_yaml::to_string(state).map_err(|err| TxError::StateIo {
        path: path.to_path_buf(),
        source: std::io::Error::new(ErrorKind::InvalidData, err),
    })?;
    write_atomic(path, yaml.as_bytes()).map_err(|err| TxError::StateIo {
        path: path.to_path_buf(),
        source: std::io::Error::other(format!("{err:#}")),
    })
}

/// The location a record was read from decides its status.
fn read_record(path: &Path, status: TxStatus) -> Result<StateFile, TxError> {
    let text = fs::read_to_string(path).map_err(|err| TxError::state_io(path, err))?;
    let mut record: StateFile = serde_yaml::from_str(&text).map_err(|err| TxError::StateIo {
        path: path.to_path_buf(),
        source: std::io::Error::new(ErrorKind::InvalidData, err),
    })?;
    record.status = status;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogLevel;
    use crate::model::{ChangeSet, Control, FileOperation, FileSnapshot, Strategy};
    use tempfile::tempdir;
    use time::Duration;

    fn state(reasoning: &[&str], age_secs: i64) -> StateFile {
        let change_set = ChangeSet {
            control: Control {
                uuid: Uuid::new_v4(),
                project_id: "demo".into(),
                git_commit_msg: None,
                prompt_summary: None,
            },
            operations: vec![FileOperation::Write {
                path: "a.txt".into(),
                content: "x".into(),
                strategy: Strategy::Replace,
            }],
            reasoning: reasoning.iter().map(|line| line.to_string()).collect(),
        };
        let mut snapshot = FileSnapshot::new();
        snapshot.insert("a.txt".into(), None);
        let mut state = StateFile::pending(&change_set, snapshot);
        state.created_at -= Duration::seconds(age_secs);
        state
    }

    fn committed(store: &StateStore, state: &StateFile) {
        store.write_pending(state).expect("pending");
        store.commit(state.uuid).expect("commit");
    }

    #[test]
    fn lifecycle_moves_between_locations() {
        let temp = tempdir().expect("temp dir");
        let store = StateStore::new(temp.path().join(".safepatch"));
        let record = state(&["edit"], 0);

        store.write_pending(&record).expect("pending");
        assert!(store.has_pending(record.uuid));
        assert!(!store.has_been_processed(record.uuid));
        assert!(store.read_all(false).expect("read").is_empty());

        store.commit(record.uuid).expect("commit");
        assert!(!store.has_pending(record.uuid));
        assert!(store.has_been_processed(record.uuid));
        let loaded = store.read_committed(record.uuid).expect("read").expect("exists");
        assert_eq!(loaded.status, TxStatus::Committed);

        store.mark_undone(&loaded).expect("undo");
        assert!(store.has_been_processed(record.uuid));
        assert!(store.read_all(false).expect("read").is_empty());
        assert!(store.undone_path(record.uuid).is_file());
    }

    #[test]
    fn pending_write_is_idempotent_and_deletable() {
        let temp = tempdir().expect("temp dir");
        let store = StateStore::new(temp.path());
        let mut record = state(&["edit"], 0);
        store.write_pending(&record).expect("pending");
        record.approved = true;
        store.write_pending(&record).expect("overwrite");
        store.commit(record.uuid).expect("commit");
        assert!(store.read_committed(record.uuid).unwrap().unwrap().approved);

        store.delete_pending(record.uuid).expect("missing pending is fine");
    }

    #[test]
    fn history_is_newest_first_and_indexable() {
        let temp = tempdir().expect("temp dir");
        let store = StateStore::new(temp.path());
        let old = state(&["old"], 30);
        let new = state(&["new"], 10);
        committed(&store, &old);
        committed(&store, &new);

        let all = store.read_all(false).expect("read");
        assert_eq!(all[0].uuid, new.uuid);
        assert_eq!(all[1].uuid, old.uuid);
        assert_eq!(
            store.find(TxRef::Index(2), false).unwrap().unwrap().uuid,
            old.uuid
        );
        assert!(store.find(TxRef::Index(3), false).unwrap().is_none());
        assert_eq!(store.latest().unwrap().unwrap().uuid, new.uuid);
    }

    #[test]
    fn unreadable_record_is_left_out_of_history() {
        let temp = tempdir().expect("temp dir");
        let store = StateStore::new(temp.path()).with_logger(Logger::new(LogLevel::Silent));
        let good = state(&["edit"], 10);
        committed(&store, &good);
        fs::write(
            temp.path().join(TRANSACTIONS_DIR).join(format!("{}.yml", Uuid::new_v4())),
            "uuid: [not, a, record",
        )
        .expect("corrupt record");

        let all = store.read_all(false).expect("read");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].uuid, good.uuid);
        assert_eq!(store.find(TxRef::Index(1), true).unwrap().unwrap().uuid, good.uuid);
        assert_eq!(store.latest().unwrap().unwrap().uuid, good.uuid);
    }

    #[test]
    fn revert_filtering_skips_reverts_and_their_targets() {
        let temp = tempdir().expect("temp dir");
        let store = StateStore::new(temp.path());
        let t1 = state(&["create"], 30);
        let t2 = state(&["edit"], 20);
        let prefix = format!("{REVERT_PREFIX}{}", t2.uuid);
        let t3 = state(&[prefix.as_str(), "edit"], 10);
        committed(&store, &t1);
        committed(&store, &t2);
        committed(&store, &t3);

        let latest = store.find(TxRef::Index(1), true).unwrap().unwrap();
        assert_eq!(latest.uuid, t1.uuid);
        assert_eq!(store.read_all(false).unwrap().len(), 3);
    }

    #[test]
    fn explicit_revert_field_is_honored() {
        let temp = tempdir().expect("temp dir");
        let store = StateStore::new(temp.path());
        let target = state(&["edit"], 20);
        let mut revert = state(&["undo that"], 10);
        revert.reverts_uuid = Some(target.uuid);
        committed(&store, &target);
        committed(&store, &revert);
        assert!(store.read_all(true).unwrap().is_empty());
    }

    #[test]
    fn tx_ref_parsing() {
        let id = Uuid::new_v4();
        assert_eq!(id.to_string().parse::<TxRef>(), Ok(TxRef::Uuid(id)));
        assert_eq!("2".parse::<TxRef>(), Ok(TxRef::Index(2)));
        assert!("0".parse::<TxRef>().is_err());
        assert!("latest".parse::<TxRef>().is_err());
    }
}
