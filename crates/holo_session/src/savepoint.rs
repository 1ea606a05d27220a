//! Savepoint emulation over the buffered mutation log.
//!
//! The backend has no partial rollback, but nothing reaches it before commit:
//! a savepoint only needs to remember how long the log was when it was set.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{SessionError, SessionResult};
use crate::session::{TransactionMode, TransactionSession};

/// Process-wide counter for anonymous savepoints. Ids are unique only within
/// one running process.
static NEXT_ANONYMOUS_SAVEPOINT: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Savepoint {
    Named(String),
    Anonymous(u64),
}

impl Savepoint {
    fn next_anonymous() -> Self {
        Self::Anonymous(NEXT_ANONYMOUS_SAVEPOINT.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl fmt::Display for Savepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Anonymous(id) => write!(f, "anonymous savepoint #{id}"),
        }
    }
}

#[derive(Debug, Clone)]
struct SavepointMark {
    savepoint: Savepoint,
    log_len: usize,
    attempt_id: u64,
}

/// Ordered savepoint marks of one connection.
#[derive(Debug, Default)]
pub struct SavepointLedger {
    marks: Vec<SavepointMark>,
}

impl SavepointLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the current log length under `name`, or a fresh anonymous id.
    pub fn set_savepoint(
        &mut self,
        session: &mut TransactionSession,
        name: Option<&str>,
    ) -> SessionResult<Savepoint> {
        if session.mode() != TransactionMode::ReadWrite {
            return Err(SessionError::SavepointNotAllowed {
                reason: "the session is read-only",
            });
        }
        session.begin()?;
        let worker = session
            .read_write_worker()
            .ok_or_else(|| {
                SessionError::Worker("read/write transaction did not start".to_string())
            })?;
        let attempt_id = worker.attempt_id();
        let log_len = worker.mutation_log_len()?;

        self.marks.retain(|mark| mark.attempt_id == attempt_id);
        let savepoint = match name {
            Some(name) => Savepoint::Named(name.to_string()),
            None => Savepoint::next_anonymous(),
        };
        self.marks.push(SavepointMark {
            savepoint: savepoint.clone(),
            log_len,
            attempt_id,
        });
        Ok(savepoint)
    }

    /// Forgets `savepoint`; later references to it are unknown.
    pub fn release_savepoint(
        &mut self,
        session: &TransactionSession,
        savepoint: &Savepoint,
    ) -> SessionResult<()> {
        let idx = self.position(session, savepoint)?;
        self.marks.remove(idx);
        Ok(())
    }

    /// Truncates the log back to `savepoint`; the mark itself stays usable.
    pub fn rollback_to_savepoint(
        &mut self,
        session: &TransactionSession,
        savepoint: &Savepoint,
    ) -> SessionResult<()> {
        let idx = self.position(session, savepoint)?;
        let worker = session
            .read_write_worker()
            .ok_or_else(|| SessionError::UnknownSavepoint(savepoint.to_string()))?;
        worker.truncate_mutation_log(self.marks[idx].log_len)?;
        self.marks.truncate(idx + 1);
        Ok(())
    }

    /// Drops every mark; called when the transaction ends.
    pub fn clear(&mut self) {
        self.marks.clear();
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Latest mark for `savepoint` that belongs to the live attempt.
    fn position(
        &self,
        session: &TransactionSession,
        savepoint: &Savepoint,
    ) -> SessionResult<usize> {
        let attempt_id = session.active_attempt_id();
        self.marks
            .iter()
            .rposition(|mark| {
                Some(mark.attempt_id) == attempt_id && savepoint_matches(&mark.savepoint, savepoint)
            })
            .ok_or_else(|| SessionError::UnknownSavepoint(savepoint.to_string()))
    }
}

fn savepoint_matches(left: &Savepoint, right: &Savepoint) -> bool {
    match (left, right) {
        (Savepoint::Named(left), Savepoint::Named(right)) => left.eq_ignore_ascii_case(right),
        (Savepoint::Anonymous(left), Savepoint::Anonymous(right)) => left == right,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::memory::MemoryDatabase;
    use crate::mutation::Mutation;
    use datafusion::common::ScalarValue;
    use std::sync::Arc;
    use std::time::Duration;

    fn session(db: &MemoryDatabase) -> TransactionSession {
        let config = SessionConfig {
            wait_poll_interval: Duration::from_millis(5),
            ..SessionConfig::default()
        };
        TransactionSession::new(Arc::new(db.clone()), config)
    }

    fn insert(id: i64) -> Mutation {
        Mutation::new_insert_builder("Albums")
            .set("AlbumId", ScalarValue::Int64(Some(id)))
            .build()
    }

    fn buffer(session: &mut TransactionSession, ids: std::ops::Range<i64>) -> SessionResult<()> {
        session.buffer_all(ids.map(insert).collect())
    }

    #[test]
    fn rollback_restores_exact_log_length() -> anyhow::Result<()> {
        let db = MemoryDatabase::new();
        for (before, after) in [(0, 0), (0, 4), (3, 2), (7, 0)] {
            let mut session = session(&db);
            let mut ledger = SavepointLedger::new();
            buffer(&mut session, 0..before)?;
            let savepoint = ledger.set_savepoint(&mut session, None)?;
            buffer(&mut session, 0..after)?;
            ledger.rollback_to_savepoint(&session, &savepoint)?;
            assert_eq!(session.mutation_log_len()?, before as usize);
            session.rollback()?;
        }
        Ok(())
    }

    #[test]
    fn rollback_keeps_the_mark_and_drops_later_ones() -> anyhow::Result<()> {
        let db = MemoryDatabase::new();
        let mut session = session(&db);
        let mut ledger = SavepointLedger::new();
        buffer(&mut session, 0..1)?;
        let first = ledger.set_savepoint(&mut session, Some("first"))?;
        buffer(&mut session, 1..3)?;
        let second = ledger.set_savepoint(&mut session, Some("second"))?;
        buffer(&mut session, 3..4)?;

        ledger.rollback_to_savepoint(&session, &first)?;
        assert_eq!(session.mutation_log_len()?, 1);
        let err = ledger.rollback_to_savepoint(&session, &second).unwrap_err();
        assert!(matches!(err, SessionError::UnknownSavepoint(_)));

        buffer(&mut session, 4..6)?;
        ledger.rollback_to_savepoint(&session, &first)?;
        assert_eq!(session.mutation_log_len()?, 1);
        session.rollback()?;
        Ok(())
    }

    #[test]
    fn released_savepoint_is_unknown() -> anyhow::Result<()> {
        let db = MemoryDatabase::new();
        let mut session = session(&db);
        let mut ledger = SavepointLedger::new();
        let savepoint = ledger.set_savepoint(&mut session, None)?;
        ledger.release_savepoint(&session, &savepoint)?;
        for err in [
            ledger.release_savepoint(&session, &savepoint).unwrap_err(),
            ledger.rollback_to_savepoint(&session, &savepoint).unwrap_err(),
        ] {
            assert!(err.to_string().starts_with("unknown savepoint"));
        }
        session.rollback()?;
        Ok(())
    }

    #[test]
    fn repeated_names_resolve_to_the_latest_mark() -> anyhow::Result<()> {
        let db = MemoryDatabase::new();
        let mut session = session(&db);
        let mut ledger = SavepointLedger::new();
        ledger.set_savepoint(&mut session, Some("sp"))?;
        buffer(&mut session, 0..2)?;
        let latest = ledger.set_savepoint(&mut session, Some("SP"))?;
        buffer(&mut session, 2..5)?;
        ledger.rollback_to_savepoint(&session, &latest)?;
        assert_eq!(session.mutation_log_len()?, 2);
        session.rollback()?;
        Ok(())
    }

    #[test]
    fn marks_from_a_finished_attempt_are_stale() -> anyhow::Result<()> {
        let db = MemoryDatabase::new();
        let mut session = session(&db);
        let mut ledger = SavepointLedger::new();
        let savepoint = ledger.set_savepoint(&mut session, Some("sp"))?;
        session.commit()?;
        buffer(&mut session, 0..1)?;
        let err = ledger.rollback_to_savepoint(&session, &savepoint).unwrap_err();
        assert!(matches!(err, SessionError::UnknownSavepoint(_)));
        session.rollback()?;
        Ok(())
    }

    #[test]
    fn savepoints_are_rejected_outside_read_write_mode() -> anyhow::Result<()> {
        let db = MemoryDatabase::new();
        let mut session = session(&db);
        session.set_mode(TransactionMode::ReadOnly)?;
        let mut ledger = SavepointLedger::new();
        let err = ledger.set_savepoint(&mut session, None).unwrap_err();
        assert!(matches!(err, SessionError::SavepointNotAllowed { .. }));
        assert!(!session.is_active());
        Ok(())
    }

    #[test]
    fn anonymous_ids_are_distinct() -> anyhow::Result<()> {
        let db = MemoryDatabase::new();
        let mut session = session(&db);
        let mut ledger = SavepointLedger::new();
        let first = ledger.set_savepoint(&mut session, None)?;
        let second = ledger.set_savepoint(&mut session, None)?;
        assert_ne!(first, second);
        assert_eq!(ledger.len(), 2);
        session.rollback()?;
        Ok(())
    }
}
