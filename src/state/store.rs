use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::core::{BoardSnapshot, TeamId};
use crate::orchestration::borrow::BorrowRecord;
use crate::orchestration::budget::StepRecord;
use crate::{Error, Result};

/// Audit scope for entries that belong to the whole run rather than a team.
pub const RUN_SCOPE: &str = "_run";

/// Team-scoped persistence.
///
/// Calls are synchronous; async callers go through [`crate::util::blocking`].
pub trait Store: Send + Sync {
    fn put_board(&self, snapshot: &BoardSnapshot) -> Result<()>;

    fn get_board(&self, team: &TeamId) -> Result<Option<BoardSnapshot>>;

    /// Insert or update a record (matched by id) under both teams it involves.
    fn put_borrow(&self, record: &BorrowRecord) -> Result<()>;

    fn list_borrows(&self, team: &TeamId) -> Result<Vec<BorrowRecord>>;

    fn append_audit(&self, scope: &str, records: &[StepRecord]) -> Result<()>;

    fn list_audit(&self, scope: &str) -> Result<Vec<StepRecord>>;
}

pub(crate) fn upsert(records: &mut Vec<BorrowRecord>, record: &BorrowRecord) {
    match records.iter_mut().find(|r| r.id == record.id) {
        Some(existing) => *existing = record.clone(),
        None => records.push(record.clone()),
    }
}

#[derive(Default)]
pub struct MemoryStore {
    boards: Mutex<HashMap<TeamId, BoardSnapshot>>,
    borrows: Mutex<HashMap<TeamId, Vec<BorrowRecord>>>,
    audit: Mutex<HashMap<String, Vec<StepRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Store("memory store lock poisoned".to_string()))
}

impl Store for MemoryStore {
    fn put_board(&self, snapshot: &BoardSnapshot) -> Result<()> {
        lock(&self.boards)?.insert(snapshot.team_id.clone(), snapshot.clone());
        Ok(())
    }

    fn get_board(&self, team: &TeamId) -> Result<Option<BoardSnapshot>> {
        Ok(lock(&self.boards)?.get(team).cloned())
    }

    fn put_borrow(&self, record: &BorrowRecord) -> Result<()> {
        let mut borrows = lock(&self.borrows)?;
        for team in [&record.source, &record.destination] {
            upsert(borrows.entry(team.clone()).or_default(), record);
        }
        Ok(())
    }

    fn list_borrows(&self, team: &TeamId) -> Result<Vec<BorrowRecord>> {
        Ok(lock(&self.borrows)?.get(team).cloned().unwrap_or_default())
    }

    fn append_audit(&self, scope: &str, records: &[StepRecord]) -> Result<()> {
        lock(&self.audit)?
            .entry(scope.to_string())
            .or_default()
            .extend_from_slice(records);
        Ok(())
    }

    fn list_audit(&self, scope: &str) -> Result<Vec<StepRecord>> {
        Ok(lock(&self.audit)?.get(scope).cloned().unwrap_or_default())
    }
}
