//! SQLite-backed metadata for persisted vectors.
//!
//! One database per collection key, two tables:
//!
//! ```text
//! metadata(id INTEGER PRIMARY KEY, source TEXT, content TEXT)
//! segments(id INTEGER PRIMARY KEY, deleteBit INTEGER, content TEXT)
//! ```
//!
//! `metadata` resolves an id back to its document; `segments` binds an
//! id to the shard file it lives in, with `deleteBit = 1` for live rows
//! and `0` for tombstoned ones. A row is "live" only if both tables
//! agree. The `segments` table doubles as the id-allocation watermark:
//! ids are never reused, so tombstoned segment rows are kept even when
//! their metadata is purged.

use std::{
    collections::HashMap,
    path::Path,
    sync::Mutex,
};

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;

/// A (id, source, content) row scheduled for persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRow {
    pub id: i64,
    pub source: String,
    pub content: String,
}

/// Single-writer, multi-reader store. Every operation takes the internal
/// lock for its whole duration; callers treat writes as single-threaded.
pub struct MetadataDb {
    conn: Mutex<Connection>,
}

impl MetadataDb {
    /// Open or create the database at `path` and ensure both tables exist.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS metadata \
                 (id INTEGER PRIMARY KEY, source TEXT, content TEXT);\n\
             CREATE TABLE IF NOT EXISTS segments \
                 (id INTEGER PRIMARY KEY, deleteBit INTEGER, content TEXT);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persist one dumped batch: the metadata rows plus a live segment
    /// row binding each id to `index_name`, all in a single transaction.
    pub fn insert_dump(
        &self,
        rows: &[MetadataRow],
        index_name: &str,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut meta = tx.prepare(
                "INSERT INTO metadata (id, source, content) VALUES (?1, ?2, ?3)",
            )?;
            let mut seg = tx.prepare(
                "INSERT INTO segments (id, deleteBit, content) VALUES (?1, 1, ?2)",
            )?;
            for row in rows {
                meta.execute(params![row.id, row.source, row.content])?;
                seg.execute(params![row.id, index_name])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Whether `source` already has a live record.
    pub fn is_duplicate(&self, source: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(\
                 SELECT 1 FROM metadata m \
                 JOIN segments s ON s.id = m.id \
                 WHERE m.source = ?1 AND s.deleteBit = 1)",
            params![source],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    /// Highest id ever persisted (the allocation watermark), if any.
    /// Tombstoned rows count; ids are never handed out twice.
    pub fn max_id(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(id) FROM segments",
            [],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// Resolve a live id to its (source, content).
    pub fn fetch(&self, id: i64) -> Result<Option<(String, String)>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT m.source, m.content FROM metadata m \
                 JOIN segments s ON s.id = m.id \
                 WHERE m.id = ?1 AND s.deleteBit = 1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Distinct live source paths, sorted.
    pub fn list_sources(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT m.source FROM metadata m \
             JOIN segments s ON s.id = m.id \
             WHERE s.deleteBit = 1 \
             ORDER BY m.source",
        )?;
        let sources = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(sources)
    }

    /// Live ids whose source is one of `sources`.
    pub fn ids_for_sources(&self, sources: &[String]) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT m.id FROM metadata m \
             JOIN segments s ON s.id = m.id \
             WHERE m.source = ?1 AND s.deleteBit = 1",
        )?;
        let mut ids = Vec::new();
        for source in sources {
            let found = stmt
                .query_map(params![source], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            ids.extend(found);
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Map each live id to the shard file holding its vector.
    pub fn shards_for_ids(
        &self,
        ids: &[i64],
    ) -> Result<HashMap<String, Vec<i64>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT content FROM segments WHERE id = ?1 AND deleteBit = 1",
        )?;
        let mut by_shard: HashMap<String, Vec<i64>> = HashMap::new();
        for &id in ids {
            let shard: Option<String> = stmt
                .query_row(params![id], |row| row.get(0))
                .optional()?;
            if let Some(shard) = shard {
                by_shard.entry(shard).or_default().push(id);
            }
        }
        Ok(by_shard)
    }

    /// Mark ids as deleted (`deleteBit = 0`).
    pub fn tombstone(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("UPDATE segments SET deleteBit = 0 WHERE id = ?1")?;
            for &id in ids {
                stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Drop metadata rows for tombstoned ids. The segment rows stay so
    /// the watermark never regresses. Returns the number of rows dropped.
    pub fn purge_tombstoned(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let purged = conn.execute(
            "DELETE FROM metadata WHERE id IN \
                 (SELECT id FROM segments WHERE deleteBit = 0)",
            [],
        )?;
        Ok(purged)
    }

    /// Number of live segment rows.
    pub fn live_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM segments WHERE deleteBit = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

impl std::fmt::Debug for MetadataDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataDb").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, MetadataDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = MetadataDb::open(&tmp.path().join("k1.db")).unwrap();
        (tmp, db)
    }

    fn row(id: i64, source: &str, content: &str) -> MetadataRow {
        MetadataRow {
            id,
            source: source.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn insert_dump_roundtrip() {
        let (_tmp, db) = test_db();

        let rows = vec![
            row(0, "/docs/a.txt", "first chunk"),
            row(1, "/docs/a.txt", "second chunk"),
            row(2, "/docs/b.txt", "other doc"),
        ];
        db.insert_dump(&rows, "flat_1.faiss").unwrap();

        for r in &rows {
            let (source, content) = db.fetch(r.id).unwrap().unwrap();
            assert_eq!(source, r.source);
            assert_eq!(content, r.content);
        }
        assert_eq!(db.live_count().unwrap(), 3);
    }

    #[test]
    fn insert_dump_is_atomic() {
        let (_tmp, db) = test_db();

        db.insert_dump(&[row(0, "/a", "x")], "flat_1.faiss").unwrap();

        // The second batch collides on id 0 and must leave no trace.
        let err = db.insert_dump(
            &[row(5, "/b", "y"), row(0, "/b", "z")],
            "flat_2.faiss",
        );
        assert!(err.is_err());
        assert!(db.fetch(5).unwrap().is_none());
        assert_eq!(db.live_count().unwrap(), 1);
    }

    #[test]
    fn duplicate_detection() {
        let (_tmp, db) = test_db();
        assert!(!db.is_duplicate("/docs/a.txt").unwrap());

        db.insert_dump(&[row(0, "/docs/a.txt", "c")], "flat_1.faiss")
            .unwrap();
        assert!(db.is_duplicate("/docs/a.txt").unwrap());
        assert!(!db.is_duplicate("/docs/b.txt").unwrap());

        // A tombstoned record is no longer a duplicate.
        db.tombstone(&[0]).unwrap();
        assert!(!db.is_duplicate("/docs/a.txt").unwrap());
    }

    #[test]
    fn max_id_tracks_every_persisted_id() {
        let (_tmp, db) = test_db();
        assert_eq!(db.max_id().unwrap(), None);

        db.insert_dump(
            &[row(0, "/a", "x"), row(1, "/a", "y")],
            "flat_1.faiss",
        )
        .unwrap();
        assert_eq!(db.max_id().unwrap(), Some(1));

        // Tombstoning and purging must not lower the watermark.
        db.tombstone(&[0, 1]).unwrap();
        db.purge_tombstoned().unwrap();
        assert_eq!(db.max_id().unwrap(), Some(1));
    }

    #[test]
    fn list_sources_is_distinct_and_live_only() {
        let (_tmp, db) = test_db();
        db.insert_dump(
            &[
                row(0, "/a", "x"),
                row(1, "/a", "y"),
                row(2, "/b", "z"),
            ],
            "flat_1.faiss",
        )
        .unwrap();

        assert_eq!(db.list_sources().unwrap(), vec!["/a", "/b"]);

        db.tombstone(&[2]).unwrap();
        assert_eq!(db.list_sources().unwrap(), vec!["/a"]);
    }

    #[test]
    fn ids_and_shards_for_sources() {
        let (_tmp, db) = test_db();
        db.insert_dump(
            &[row(0, "/a", "x"), row(1, "/b", "y")],
            "flat_1.faiss",
        )
        .unwrap();
        db.insert_dump(&[row(2, "/a", "z")], "flat_2.faiss").unwrap();

        let ids = db.ids_for_sources(&["/a".to_string()]).unwrap();
        assert_eq!(ids, vec![0, 2]);

        let by_shard = db.shards_for_ids(&ids).unwrap();
        assert_eq!(by_shard.len(), 2);
        assert_eq!(by_shard["flat_1.faiss"], vec![0]);
        assert_eq!(by_shard["flat_2.faiss"], vec![2]);
    }

    #[test]
    fn tombstone_hides_fetch() {
        let (_tmp, db) = test_db();
        db.insert_dump(&[row(0, "/a", "x")], "flat_1.faiss").unwrap();

        db.tombstone(&[0]).unwrap();
        assert!(db.fetch(0).unwrap().is_none());
        assert_eq!(db.live_count().unwrap(), 0);
    }

    #[test]
    fn purge_drops_only_tombstoned_metadata() {
        let (_tmp, db) = test_db();
        db.insert_dump(
            &[row(0, "/a", "x"), row(1, "/b", "y")],
            "flat_1.faiss",
        )
        .unwrap();

        db.tombstone(&[0]).unwrap();
        assert_eq!(db.purge_tombstoned().unwrap(), 1);
        assert!(db.fetch(1).unwrap().is_some());
        assert_eq!(db.purge_tombstoned().unwrap(), 0);
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("k1.db");

        {
            let db = MetadataDb::open(&path).unwrap();
            db.insert_dump(&[row(0, "/a", "x")], "flat_1.faiss").unwrap();
        }

        {
            let db = MetadataDb::open(&path).unwrap();
            assert_eq!(
                db.fetch(0).unwrap(),
                Some(("/a".to_string(), "x".to_string()))
            );
        }
    }

    #[test]
    fn sources_with_quotes_are_stored_verbatim() {
        let (_tmp, db) = test_db();
        let tricky = "/docs/it's \"quoted\".txt";
        db.insert_dump(&[row(0, tricky, "content")], "flat_1.faiss")
            .unwrap();
        assert!(db.is_duplicate(tricky).unwrap());
    }
}
