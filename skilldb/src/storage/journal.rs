use super::Overlay;
use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// SQLite write-through journal holding the committed rows, the last commit
/// sequence and the history of schema fingerprints.
pub struct Journal {
    conn: Connection,
}

/// A persisted row as stored in the `records` table.
#[derive(Debug, Clone)]
pub struct JournalRow {
    pub entity: String,
    pub id: String,
    pub data_json: String,
    pub version: u64,
}

impl Journal {
    /// Open or create the journal database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let journal = Journal { conn };
        journal.initialize_tables()?;
        Ok(journal)
    }

    /// Open an in-memory journal (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let journal = Journal { conn };
        journal.initialize_tables()?;
        Ok(journal)
    }

    fn initialize_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hash TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS records (
                entity TEXT NOT NULL,
                id TEXT NOT NULL,
                data_json TEXT NOT NULL,
                version INTEGER NOT NULL,
                PRIMARY KEY (entity, id)
            );

            CREATE INDEX IF NOT EXISTS idx_records_entity ON records(entity);

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Schema State ─────────────────────────────────────────────────

    /// Get the most recent schema hash.
    pub fn last_schema_hash(&self) -> Result<Option<String>> {
        let result = self
            .conn
            .query_row(
                "SELECT hash FROM schema_history ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }

    /// Record a new schema version.
    pub fn record_schema(&self, hash: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO schema_history (hash) VALUES (?1)",
            params![hash],
        )?;
        Ok(())
    }

    // ── Records ──────────────────────────────────────────────────────

    /// Last persisted commit sequence and every stored row.
    pub fn load(&self) -> Result<(u64, Vec<JournalRow>)> {
        let seq: Option<String> = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'seq'", [], |row| row.get(0))
            .optional()?;
        let seq = seq.and_then(|s| s.parse().ok()).unwrap_or(0);

        let mut stmt = self
            .conn
            .prepare("SELECT entity, id, data_json, version FROM records ORDER BY entity, id")?;
        let rows = stmt.query_map([], |row| {
            Ok(JournalRow {
                entity: row.get(0)?,
                id: row.get(1)?,
                data_json: row.get(2)?,
                version: row.get::<_, i64>(3)? as u64,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok((seq, records))
    }

    /// Persist one commit inside a single SQLite transaction. Nothing is
    /// written when any statement fails.
    pub fn persist(&mut self, seq: u64, writes: &Overlay) -> Result<()> {
        let tx = self.conn.transaction()?;
        for (entity, rows) in writes {
            for (id, row) in rows {
                match row {
                    Some(record) => {
                        let data_json = serde_json::to_string(&record.to_json())?;
                        tx.execute(
                            "INSERT OR REPLACE INTO records (entity, id, data_json, version)
                             VALUES (?1, ?2, ?3, ?4)",
                            params![entity, id, data_json, seq as i64],
                        )?;
                    }
                    None => {
                        tx.execute(
                            "DELETE FROM records WHERE entity = ?1 AND id = ?2",
                            params![entity, id],
                        )?;
                    }
                }
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('seq', ?1)",
            params![seq.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Number of persisted rows per entity.
    pub fn counts(&self) -> Result<Vec<(String, u64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT entity, COUNT(*) FROM records GROUP BY entity ORDER BY entity")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    fn overlay(entity: &str, id: &str, row: Option<Record>) -> Overlay {
        let mut o = Overlay::new();
        o.entry(entity.to_string())
            .or_default()
            .insert(id.to_string(), row);
        o
    }

    fn user(id: &str) -> Record {
        let mut r = Record::new();
        r.set("id", id);
        r.set("email", format!("{id}@x.com"));
        r
    }

    #[test]
    fn test_persist_and_load() {
        let mut journal = Journal::open_in_memory().unwrap();
        journal.persist(1, &overlay("User", "u1", Some(user("u1")))).unwrap();
        journal.persist(2, &overlay("User", "u2", Some(user("u2")))).unwrap();

        let (seq, rows) = journal.load().unwrap();
        assert_eq!(seq, 2);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "u1");
        assert_eq!(rows[0].version, 1);
        assert!(rows[1].data_json.contains("u2@x.com"));
    }

    #[test]
    fn test_delete_removes_row() {
        let mut journal = Journal::open_in_memory().unwrap();
        journal.persist(1, &overlay("User", "u1", Some(user("u1")))).unwrap();
        journal.persist(2, &overlay("User", "u1", None)).unwrap();

        let (seq, rows) = journal.load().unwrap();
        assert_eq!(seq, 2);
        assert!(rows.is_empty());
        assert!(journal.counts().unwrap().is_empty());
    }

    #[test]
    fn test_schema_history() {
        let journal = Journal::open_in_memory().unwrap();
        assert!(journal.last_schema_hash().unwrap().is_none());

        journal.record_schema("abc123").unwrap();
        journal.record_schema("def456").unwrap();
        assert_eq!(journal.last_schema_hash().unwrap(), Some("def456".to_string()));
    }

    #[test]
    fn test_counts_per_entity() {
        let mut journal = Journal::open_in_memory().unwrap();
        journal.persist(1, &overlay("User", "u1", Some(user("u1")))).unwrap();
        journal.persist(2, &overlay("User", "u2", Some(user("u2")))).unwrap();
        assert_eq!(journal.counts().unwrap(), vec![("User".to_string(), 2)]);
    }
}
