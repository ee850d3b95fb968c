//! Durable [`VectorIndex`] backed by SQLite.
//!
//! Several named collections share one database file. Every write runs in
//! a single transaction that is committed (with `synchronous = FULL`)
//! before the call returns, so an acknowledged upsert survives a crash.
//! Writes from one process are serialized so a deferred transaction never
//! has to upgrade its lock under a concurrent writer.
//! Queries are an exact scan over the collection that keeps only the best
//! `k` rows in memory.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt::Display;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use semantic_kb_core::embedding::{blob_to_vec, check_dims, vec_to_blob};
use semantic_kb_core::index::{reconcile_spec, VectorIndex};
use semantic_kb_core::models::{
    DistanceMetric, IndexEntry, IndexSpec, Payload, RawHit, ScrollCursor, ScrollPage,
};
use semantic_kb_core::{KbError, Result};

use crate::db;
use crate::migrate;

/// Shape and size of one collection, for `kb stats`.
#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub name: String,
    pub spec: IndexSpec,
    pub entries: usize,
    pub created_at: i64,
}

pub struct SqliteIndex {
    pool: SqlitePool,
    path: PathBuf,
    collection: String,
    write_lock: Mutex<()>,
}

impl SqliteIndex {
    /// Open the database at `path`, creating the schema if needed.
    ///
    /// Opening does not create the collection; call
    /// [`VectorIndex::create`] for that.
    pub async fn open(path: &Path, collection: &str) -> Result<Self> {
        let target = path.display().to_string();
        let pool = db::connect(path)
            .await
            .map_err(|e| KbError::storage("sqlite", &target, format!("{:#}", e)))?;
        migrate::run_migrations(&pool)
            .await
            .map_err(|e| KbError::storage("sqlite", &target, format!("{:#}", e)))?;

        Ok(Self {
            pool,
            path: path.to_path_buf(),
            collection: collection.to_string(),
            write_lock: Mutex::new(()),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Every collection in the database file.
    pub async fn collections(&self) -> Result<Vec<CollectionInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT c.name, c.dimension, c.metric, c.created_at, COUNT(e.id) AS entries
            FROM collections c
            LEFT JOIN entries e ON e.collection = c.name
            GROUP BY c.name
            ORDER BY c.name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.fail(e))?;

        rows.iter()
            .map(|row| {
                let dimension: i64 = row.try_get("dimension").map_err(|e| self.fail(e))?;
                let metric: String = row.try_get("metric").map_err(|e| self.fail(e))?;
                let entries: i64 = row.try_get("entries").map_err(|e| self.fail(e))?;
                Ok(CollectionInfo {
                    name: row.try_get("name").map_err(|e| self.fail(e))?,
                    spec: IndexSpec::new(dimension as usize, self.parse_metric(&metric)?),
                    entries: entries as usize,
                    created_at: row.try_get("created_at").map_err(|e| self.fail(e))?,
                })
            })
            .collect()
    }

    fn fail(&self, reason: impl Display) -> KbError {
        KbError::storage("sqlite", self.path.display().to_string(), reason)
    }

    fn parse_metric(&self, s: &str) -> Result<DistanceMetric> {
        s.parse()
            .map_err(|e| self.fail(format!("corrupt collection metadata: {}", e)))
    }

    async fn load_spec<'e, E>(&self, executor: E) -> Result<Option<IndexSpec>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let row = sqlx::query("SELECT dimension, metric FROM collections WHERE name = ?")
            .bind(&self.collection)
            .fetch_optional(executor)
            .await
            .map_err(|e| self.fail(e))?;

        match row {
            Some(row) => {
                let dimension: i64 = row.try_get("dimension").map_err(|e| self.fail(e))?;
                let metric: String = row.try_get("metric").map_err(|e| self.fail(e))?;
                Ok(Some(IndexSpec::new(
                    dimension as usize,
                    self.parse_metric(&metric)?,
                )))
            }
            None => Ok(None),
        }
    }

    fn decode_entry(&self, row: &SqliteRow) -> Result<(u64, IndexEntry)> {
        let seq: i64 = row.try_get("seq").map_err(|e| self.fail(e))?;
        let blob: Vec<u8> = row.try_get("vector").map_err(|e| self.fail(e))?;
        let payload_json: String = row.try_get("payload_json").map_err(|e| self.fail(e))?;
        let payload: Payload = serde_json::from_str(&payload_json)
            .map_err(|e| self.fail(format!("corrupt payload: {}", e)))?;
        Ok((
            seq as u64,
            IndexEntry {
                id: row.try_get("id").map_err(|e| self.fail(e))?,
                vector: blob_to_vec(&blob),
                payload,
            },
        ))
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    fn backend(&self) -> &str {
        "sqlite"
    }

    fn target(&self) -> String {
        format!("{} ({})", self.collection, self.path.display())
    }

    async fn create(&self, spec: IndexSpec) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(|e| self.fail(e))?;

        match self.load_spec(&mut *tx).await? {
            None => {
                sqlx::query(
                    "INSERT INTO collections (name, dimension, metric, next_seq, created_at) \
                     VALUES (?, ?, ?, 0, ?)",
                )
                .bind(&self.collection)
                .bind(spec.dimension as i64)
                .bind(spec.metric.as_str())
                .bind(chrono::Utc::now().timestamp())
                .execute(&mut *tx)
                .await
                .map_err(|e| self.fail(e))?;
            }
            Some(existing) => {
                let count: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM entries WHERE collection = ?")
                        .bind(&self.collection)
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(|e| self.fail(e))?;
                if !reconcile_spec(existing, spec, count > 0)? {
                    sqlx::query("UPDATE collections SET dimension = ?, metric = ? WHERE name = ?")
                        .bind(spec.dimension as i64)
                        .bind(spec.metric.as_str())
                        .bind(&self.collection)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| self.fail(e))?;
                }
            }
        }

        tx.commit().await.map_err(|e| self.fail(e))?;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.load_spec(&self.pool).await?.is_some())
    }

    async fn spec(&self) -> Result<Option<IndexSpec>> {
        self.load_spec(&self.pool).await
    }

    async fn upsert_batch(&self, entries: Vec<IndexEntry>) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(|e| self.fail(e))?;

        let spec = self
            .load_spec(&mut *tx)
            .await?
            .ok_or_else(|| KbError::IndexNotFound(self.collection.clone()))?;
        for entry in &entries {
            check_dims(spec.dimension, &entry.vector)?;
        }

        let mut seq: i64 =
            sqlx::query_scalar("SELECT next_seq FROM collections WHERE name = ?")
                .bind(&self.collection)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| self.fail(e))?;

        for entry in &entries {
            let payload_json = serde_json::to_string(&entry.payload)
                .map_err(|e| self.fail(format!("payload not serializable: {}", e)))?;
            sqlx::query(
                r#"
                INSERT INTO entries (collection, id, seq, vector, payload_json)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    seq = excluded.seq,
                    vector = excluded.vector,
                    payload_json = excluded.payload_json
                "#,
            )
            .bind(&self.collection)
            .bind(&entry.id)
            .bind(seq)
            .bind(vec_to_blob(&entry.vector))
            .bind(&payload_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.fail(e))?;
            seq += 1;
        }

        sqlx::query("UPDATE collections SET next_seq = ? WHERE name = ?")
            .bind(seq)
            .bind(&self.collection)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.fail(e))?;

        tx.commit().await.map_err(|e| self.fail(e))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let _write = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM entries WHERE collection = ? AND id = ?")
            .bind(&self.collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| self.fail(e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<RawHit>> {
        let spec = self
            .spec()
            .await?
            .ok_or_else(|| KbError::IndexNotFound(self.collection.clone()))?;
        check_dims(spec.dimension, vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut rows = sqlx::query(
            "SELECT id, seq, vector, payload_json FROM entries WHERE collection = ? ORDER BY seq",
        )
        .bind(&self.collection)
        .fetch(&self.pool);

        // Max-heap on rank: the top is the worst of the current best `k`.
        let mut best: BinaryHeap<Candidate> = BinaryHeap::new();
        while let Some(row) = rows.try_next().await.map_err(|e| self.fail(e))? {
            let blob: Vec<u8> = row.try_get("vector").map_err(|e| self.fail(e))?;
            let seq: i64 = row.try_get("seq").map_err(|e| self.fail(e))?;
            let id: String = row.try_get("id").map_err(|e| self.fail(e))?;
            let distance = spec.metric.distance(vector, &blob_to_vec(&blob));

            if best.len() == k
                && best
                    .peek()
                    .is_some_and(|worst| worst.rank(distance, seq as u64, &id) != Ordering::Greater)
            {
                continue;
            }
            best.push(Candidate {
                distance,
                seq: seq as u64,
                id,
                payload_json: row.try_get("payload_json").map_err(|e| self.fail(e))?,
            });
            if best.len() > k {
                best.pop();
            }
        }

        best.into_sorted_vec()
            .into_iter()
            .map(|c| {
                let payload: Payload = serde_json::from_str(&c.payload_json)
                    .map_err(|e| self.fail(format!("corrupt payload for {}: {}", c.id, e)))?;
                Ok(RawHit {
                    id: c.id,
                    distance: c.distance,
                    seq: c.seq,
                    payload,
                })
            })
            .collect()
    }

    async fn scroll(&self, cursor: Option<ScrollCursor>, limit: usize) -> Result<ScrollPage> {
        if !self.exists().await? {
            return Err(KbError::IndexNotFound(self.collection.clone()));
        }
        let after: i64 = cursor.map(|c| c.last_seq() as i64).unwrap_or(-1);

        let rows = sqlx::query(
            "SELECT id, seq, vector, payload_json FROM entries \
             WHERE collection = ? AND seq > ? ORDER BY seq LIMIT ?",
        )
        .bind(&self.collection)
        .bind(after)
        .bind(limit as i64 + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.fail(e))?;

        let more = rows.len() > limit;
        let mut entries = Vec::with_capacity(limit.min(rows.len()));
        let mut last = None;
        for row in rows.iter().take(limit) {
            let (seq, entry) = self.decode_entry(row)?;
            entries.push(entry);
            last = Some(seq);
        }

        Ok(ScrollPage {
            entries,
            next_cursor: match (more, last) {
                (true, Some(seq)) => Some(ScrollCursor::after(seq)),
                _ => None,
            },
        })
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries WHERE collection = ?")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.fail(e))?;
        Ok(count as usize)
    }
}

/// A scored row kept by `query`. Ordered by distance, then
/// insertion sequence, then id.
struct Candidate {
    distance: f32,
    seq: u64,
    id: String,
    payload_json: String,
}

impl Candidate {
    fn rank(&self, distance: f32, seq: u64, id: &str) -> Ordering {
        self.distance
            .total_cmp(&distance)
            .then(self.seq.cmp(&seq))
            .then_with(|| self.id.as_str().cmp(id))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank(other.distance, other.seq, &other.id)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}
