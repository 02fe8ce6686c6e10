//! JSON-directory store.
//!
//! Layout, one directory per scope:
//!
//! ```text
//! <root>/<team>/board.json
//! <root>/<team>/borrows.json
//! <root>/<scope>/audit.json
//! ```
//!
//! Files are replaced atomically (write to `.tmp`, then rename).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::{BoardSnapshot, TeamId};
use crate::orchestration::borrow::BorrowRecord;
use crate::orchestration::budget::StepRecord;
use crate::state::store::{upsert, Store};
use crate::{tlog_debug, Error, Result};

const BOARD_FILE: &str = "board.json";
const BORROWS_FILE: &str = "borrows.json";
const AUDIT_FILE: &str = "audit.json";

pub struct JsonStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles on list files.
    write_lock: Mutex<()>,
}

impl JsonStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        tlog_debug!("JsonStore::open root={}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, scope: &str, file: &str) -> PathBuf {
        self.root.join(scope).join(file)
    }

    fn read<T: DeserializeOwned>(&self, scope: &str, file: &str) -> Result<Option<T>> {
        let path = self.path(scope, file);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn write<T: Serialize + ?Sized>(&self, scope: &str, file: &str, value: &T) -> Result<()> {
        let path = self.path(scope, file);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let contents = serde_json::to_string_pretty(value)?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &contents)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn update<T, F>(&self, scope: &str, file: &str, f: F) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut Vec<T>),
    {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::Store("json store lock poisoned".to_string()))?;
        let mut items: Vec<T> = self.read(scope, file)?.unwrap_or_default();
        f(&mut items);
        self.write(scope, file, &items)
    }
}

impl Store for JsonStore {
    fn put_board(&self, snapshot: &BoardSnapshot) -> Result<()> {
        self.write(snapshot.team_id.as_str(), BOARD_FILE, snapshot)
    }

    fn get_board(&self, team: &TeamId) -> Result<Option<BoardSnapshot>> {
        self.read(team.as_str(), BOARD_FILE)
    }

    fn put_borrow(&self, record: &BorrowRecord) -> Result<()> {
        for team in [&record.source, &record.destination] {
            self.update(team.as_str(), BORROWS_FILE, |records: &mut Vec<BorrowRecord>| {
                upsert(records, record)
            })?;
        }
        Ok(())
    }

    fn list_borrows(&self, team: &TeamId) -> Result<Vec<BorrowRecord>> {
        Ok(self.read(team.as_str(), BORROWS_FILE)?.unwrap_or_default())
    }

    fn append_audit(&self, scope: &str, records: &[StepRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.update(scope, AUDIT_FILE, |audit: &mut Vec<StepRecord>| {
            audit.extend_from_slice(records)
        })
    }

    fn list_audit(&self, scope: &str) -> Result<Vec<StepRecord>> {
        Ok(self.read(scope, AUDIT_FILE)?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CapacityLimits, CardStatus, TaskBoard, TaskCard, WorkerId};
    use crate::orchestration::budget::StepName;
    use crate::state::store::RUN_SCOPE;
    use tempfile::TempDir;

    #[test]
    fn test_board_written_under_team_dir() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let web = TeamId::from("web");
        let mut board = TaskBoard::new(web.clone(), CapacityLimits::default());
        let id = board.add(TaskCard::new("login form", 3, web.clone())).unwrap();
        board.move_card(id, CardStatus::InProgress).unwrap();

        store.put_board(&board.snapshot()).unwrap();

        assert!(dir.path().join("web").join("board.json").exists());
        let loaded = store.get_board(&web).unwrap().unwrap();
        assert_eq!(loaded.cards(CardStatus::InProgress)[0].id, id);
        assert!(!dir.path().join("web").join("board.json.tmp").exists());
    }

    #[test]
    fn test_missing_board_is_none() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        assert!(store.get_board(&TeamId::from("ghost")).unwrap().is_none());
    }

    #[test]
    fn test_borrows_upserted_for_both_teams() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let mut record = BorrowRecord::new(
            WorkerId::from("cy"),
            TeamId::from("api"),
            TeamId::from("web"),
            "web blocked",
            1,
            2,
        );
        store.put_borrow(&record).unwrap();
        record.remaining = 0;
        record.ended_cycle = Some(3);
        store.put_borrow(&record).unwrap();

        let api = store.list_borrows(&TeamId::from("api")).unwrap();
        let web = store.list_borrows(&TeamId::from("web")).unwrap();
        assert_eq!(api, web);
        assert_eq!(api.len(), 1);
        assert_eq!(api[0].ended_cycle, Some(3));
    }

    #[test]
    fn test_audit_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let entry = StepRecord {
            step: "plan".to_string(),
            phase: Some(StepName::Coordination),
            cycle: 2,
            elapsed_seconds: 216.0,
            deadline_seconds: 216.0,
            timed_out: true,
            failure: None,
        };
        JsonStore::open(dir.path())
            .unwrap()
            .append_audit(RUN_SCOPE, &[entry.clone()])
            .unwrap();

        let reopened = JsonStore::open(dir.path()).unwrap();
        reopened.append_audit(RUN_SCOPE, &[entry]).unwrap();
        let audit = reopened.list_audit(RUN_SCOPE).unwrap();
        assert_eq!(audit.len(), 2);
        assert!(audit.iter().all(|r| r.timed_out));
    }

    #[test]
    fn test_corrupt_file_is_json_error() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        fs::create_dir_all(dir.path().join("web")).unwrap();
        fs::write(dir.path().join("web").join("board.json"), "{not json").unwrap();
        assert!(matches!(store.get_board(&TeamId::from("web")), Err(Error::Json(_))));
    }
}
