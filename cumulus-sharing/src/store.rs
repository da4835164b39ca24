//! Persistent storage for sharings, the shared-document index and
//! replication checkpoints.
//!
//! Uses SQLite. Every write to the shared-document index takes a new value
//! of a monotonic sequence, which makes the `shared_refs` table the changes
//! feed of the replicator.

use crate::error::{SharingError, SharingResult};
use crate::shared::SharedRef;
use crate::sharing::Sharing;
use cumulus_types::{DocRef, MemberId, SharingId};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};

/// Which process a checkpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointKind {
    Replicator,
    Upload,
}

impl CheckpointKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replicator => "replicator",
            Self::Upload => "upload",
        }
    }
}

/// Persistent store backed by SQLite.
pub struct SharingStore {
    conn: Arc<Mutex<Connection>>,
}

impl SharingStore {
    /// Opens (or creates) a store at the given path.
    pub fn new(path: &str) -> SharingResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| SharingError::Storage(format!("failed to open sharing store: {e}")))?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory store.
    pub fn open_in_memory() -> SharingResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SharingError::Storage(format!("failed to open in-memory sharing store: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> SharingResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> SharingResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SharingError::Storage("sharing store lock poisoned".to_string()))
    }

    fn init_schema(&self) -> SharingResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sharings (
                id TEXT PRIMARY KEY,
                active INTEGER NOT NULL,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS shared_refs (
                key TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS shared_refs_seq ON shared_refs (seq);

            CREATE TABLE IF NOT EXISTS sequences (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                sharing_id TEXT NOT NULL,
                member_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                seq INTEGER NOT NULL,
                UNIQUE(sharing_id, member_id, kind)
            );
            ",
        )
        .map_err(|e| SharingError::Storage(format!("failed to init sharing schema: {e}")))?;
        Ok(())
    }

    // ── Sharings ─────────────────────────────────────────────────

    /// Inserts or replaces a sharing.
    pub fn save_sharing(&self, sharing: &Sharing) -> SharingResult<()> {
        let data = serde_json::to_string(sharing)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO sharings (id, active, data) VALUES (?1, ?2, ?3)",
            params![sharing.id.as_str(), sharing.active, data],
        )
        .map_err(|e| SharingError::Storage(format!("failed to save sharing: {e}")))?;
        Ok(())
    }

    pub fn get_sharing(&self, id: &SharingId) -> SharingResult<Option<Sharing>> {
        let conn = self.conn()?;
        let data: Option<String> = conn
            .query_row("SELECT data FROM sharings WHERE id = ?1", params![id.as_str()], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| SharingError::Storage(format!("failed to load sharing: {e}")))?;
        data.map(|data| serde_json::from_str(&data).map_err(SharingError::from))
            .transpose()
    }

    /// Loads a sharing, failing if it does not exist.
    pub fn load_sharing(&self, id: &SharingId) -> SharingResult<Sharing> {
        self.get_sharing(id)?
            .ok_or_else(|| SharingError::SharingNotFound(id.to_string()))
    }

    /// All sharings, or only the active ones.
    pub fn list_sharings(&self, active_only: bool) -> SharingResult<Vec<Sharing>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT data FROM sharings WHERE active >= ?1 ORDER BY id")
            .map_err(|e| SharingError::Storage(format!("failed to prepare sharing query: {e}")))?;
        let rows = stmt
            .query_map(params![active_only], |row| row.get::<_, String>(0))
            .map_err(|e| SharingError::Storage(format!("failed to query sharings: {e}")))?;

        let mut sharings = Vec::new();
        for row in rows {
            let data = row.map_err(|e| SharingError::Storage(format!("failed to read sharing row: {e}")))?;
            sharings.push(serde_json::from_str(&data)?);
        }
        Ok(sharings)
    }

    pub fn delete_sharing(&self, id: &SharingId) -> SharingResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sharings WHERE id = ?1", params![id.as_str()])
            .map_err(|e| SharingError::Storage(format!("failed to delete sharing: {e}")))?;
        conn.execute("DELETE FROM checkpoints WHERE sharing_id = ?1", params![id.as_str()])
            .map_err(|e| SharingError::Storage(format!("failed to delete checkpoints: {e}")))?;
        Ok(())
    }

    // ── Shared-document index ────────────────────────────────────

    pub fn get_shared_ref(&self, key: &DocRef) -> SharingResult<Option<SharedRef>> {
        let conn = self.conn()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM shared_refs WHERE key = ?1",
                params![key.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SharingError::Storage(format!("failed to load shared ref: {e}")))?;
        data.map(|data| serde_json::from_str(&data).map_err(SharingError::from))
            .transpose()
    }

    /// Inserts or replaces an entry and returns its new sequence number.
    pub fn put_shared_ref(&self, shared: &SharedRef) -> SharingResult<u64> {
        let data = serde_json::to_string(shared)?;
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| SharingError::Storage(format!("failed to begin transaction: {e}")))?;
        tx.execute(
            "INSERT INTO sequences (name, value) VALUES ('shared_refs', 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1",
            [],
        )
        .map_err(|e| SharingError::Storage(format!("failed to bump sequence: {e}")))?;
        let seq: i64 = tx
            .query_row("SELECT value FROM sequences WHERE name = 'shared_refs'", [], |row| {
                row.get(0)
            })
            .map_err(|e| SharingError::Storage(format!("failed to read sequence: {e}")))?;
        tx.execute(
            "INSERT OR REPLACE INTO shared_refs (key, seq, data) VALUES (?1, ?2, ?3)",
            params![shared.key.to_string(), seq, data],
        )
        .map_err(|e| SharingError::Storage(format!("failed to save shared ref: {e}")))?;
        tx.commit()
            .map_err(|e| SharingError::Storage(format!("failed to commit shared ref: {e}")))?;
        Ok(seq as u64)
    }

    /// Entries written after `since`, in sequence order.
    pub fn shared_refs_since(&self, since: u64, limit: usize) -> SharingResult<Vec<(u64, SharedRef)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT seq, data FROM shared_refs WHERE seq > ?1 ORDER BY seq LIMIT ?2")
            .map_err(|e| SharingError::Storage(format!("failed to prepare changes query: {e}")))?;
        let rows = stmt
            .query_map(params![since as i64, limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| SharingError::Storage(format!("failed to query changes: {e}")))?;

        let mut changes = Vec::new();
        for row in rows {
            let (seq, data) =
                row.map_err(|e| SharingError::Storage(format!("failed to read shared ref row: {e}")))?;
            changes.push((seq as u64, serde_json::from_str(&data)?));
        }
        Ok(changes)
    }

    /// Detaches a sharing from every entry; entries left with no sharing
    /// are deleted.
    pub fn remove_sharing_refs(&self, sharing_id: &SharingId) -> SharingResult<usize> {
        let mut affected = 0;
        let mut since = 0;
        loop {
            let page = self.shared_refs_since(since, 500)?;
            let Some((last, _)) = page.last() else {
                break;
            };
            since = *last;
            for (_, mut shared) in page {
                if shared.infos.remove(sharing_id).is_none() {
                    continue;
                }
                affected += 1;
                let conn = self.conn()?;
                if shared.infos.is_empty() {
                    conn.execute(
                        "DELETE FROM shared_refs WHERE key = ?1",
                        params![shared.key.to_string()],
                    )
                    .map_err(|e| SharingError::Storage(format!("failed to delete shared ref: {e}")))?;
                } else {
                    let data = serde_json::to_string(&shared)?;
                    conn.execute(
                        "UPDATE shared_refs SET data = ?2 WHERE key = ?1",
                        params![shared.key.to_string(), data],
                    )
                    .map_err(|e| SharingError::Storage(format!("failed to update shared ref: {e}")))?;
                }
            }
        }
        Ok(affected)
    }

    // ── Checkpoints ──────────────────────────────────────────────

    /// Last sequence processed for a member; 0 when none was recorded.
    pub fn get_checkpoint(
        &self,
        sharing_id: &SharingId,
        member_id: &MemberId,
        kind: CheckpointKind,
    ) -> SharingResult<u64> {
        let conn = self.conn()?;
        let seq: Option<i64> = conn
            .query_row(
                "SELECT seq FROM checkpoints WHERE sharing_id = ?1 AND member_id = ?2 AND kind = ?3",
                params![sharing_id.as_str(), member_id.to_string(), kind.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SharingError::Storage(format!("failed to load checkpoint: {e}")))?;
        Ok(seq.unwrap_or(0) as u64)
    }

    pub fn set_checkpoint(
        &self,
        sharing_id: &SharingId,
        member_id: &MemberId,
        kind: CheckpointKind,
        seq: u64,
    ) -> SharingResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO checkpoints (sharing_id, member_id, kind, seq) VALUES (?1, ?2, ?3, ?4)",
            params![sharing_id.as_str(), member_id.to_string(), kind.as_str(), seq as i64],
        )
        .map_err(|e| SharingError::Storage(format!("failed to save checkpoint: {e}")))?;
        Ok(())
    }
}
