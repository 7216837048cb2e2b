//! Fingerprint Store (C5): the persistent hash -> postings index, per-track
//! compact feature summaries, and indexing status.
//!
//! A single writer at a time; readers run concurrently against the writer
//! via sqlite's own snapshot isolation. Every operation acquires and
//! releases its own connection, so no connection is ever shared across
//! worker threads.

use crate::error::EngineError;
use crate::fingerprint::Fingerprint;
use crate::track::Track;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    MfccSummary,
    ChromaSummary,
}

impl FeatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKind::MfccSummary => "mfcc_summary",
            FeatureKind::ChromaSummary => "chroma_summary",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub total_tracks: i64,
    pub indexed_tracks: i64,
    pub unindexed_tracks: i64,
    pub total_fingerprints: i64,
    pub avg_fingerprints_per_track: f64,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

pub struct FingerprintStore {
    pool: SqlitePool,
}

impl FingerprintStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, EngineError> {
        let opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .pragma("foreign_keys", "ON");
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracks (
                id INTEGER PRIMARY KEY,
                filepath TEXT NOT NULL,
                filename TEXT NOT NULL,
                title TEXT,
                artist TEXT,
                duration_seconds REAL,
                mode TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fingerprints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                track_id INTEGER NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
                hash INTEGER NOT NULL,
                time_offset_ms INTEGER NOT NULL,
                freq_bin INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_fingerprints_hash ON fingerprints(hash)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_fingerprints_track_id ON fingerprints(track_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fingerprint_status (
                track_id INTEGER PRIMARY KEY REFERENCES tracks(id) ON DELETE CASCADE,
                fingerprint_count INTEGER NOT NULL,
                indexed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audio_features (
                track_id INTEGER NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY(track_id, kind)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or update a row in the external `tracks` view. The engine
    /// never calls this in production (the host library owns the table);
    /// tests and local demos use it to seed a standalone database.
    pub async fn upsert_track(&self, track: &Track) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO tracks (id, filepath, filename, title, artist, duration_seconds, mode)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                filepath = excluded.filepath,
                filename = excluded.filename,
                title = excluded.title,
                artist = excluded.artist,
                duration_seconds = excluded.duration_seconds,
                mode = excluded.mode
            "#,
        )
        .bind(track.id)
        .bind(&track.filepath)
        .bind(&track.filename)
        .bind(&track.title)
        .bind(&track.artist)
        .bind(track.duration_seconds)
        .bind(&track.mode)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_track(&self, track_id: i64) -> Result<Option<Track>, EngineError> {
        let track = sqlx::query_as::<_, Track>(
            "SELECT id, filepath, filename, title, artist, duration_seconds, mode FROM tracks WHERE id = ?",
        )
        .bind(track_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(track)
    }

    pub async fn is_indexed(&self, track_id: i64) -> Result<bool, EngineError> {
        let row = sqlx::query("SELECT 1 FROM fingerprint_status WHERE track_id = ?")
            .bind(track_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Batched insert in a single transaction. `replace = true` first
    /// deletes existing postings and status for this track; a failure
    /// anywhere rolls back all effects for the track.
    pub async fn store_fingerprints(
        &self,
        track_id: i64,
        fingerprints: &[Fingerprint],
        replace: bool,
    ) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;

        if replace {
            sqlx::query("DELETE FROM fingerprints WHERE track_id = ?")
                .bind(track_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM fingerprint_status WHERE track_id = ?")
                .bind(track_id)
                .execute(&mut *tx)
                .await?;
        }

        for fp in fingerprints {
            sqlx::query(
                "INSERT INTO fingerprints (track_id, hash, time_offset_ms, freq_bin) VALUES (?, ?, ?, ?)",
            )
            .bind(track_id)
            .bind(fp.hash as i64)
            .bind(fp.time_offset_ms)
            .bind(fp.freq_bin as i32)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO fingerprint_status (track_id, fingerprint_count, indexed_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(track_id) DO UPDATE SET
                fingerprint_count = excluded.fingerprint_count,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(track_id)
        .bind(fingerprints.len() as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Hash-join: `hashes` is loaded into a temp table local to one
    /// connection, then inner-joined against `fingerprints`, avoiding the
    /// quadratic blowup of a large `IN (...)` list. Returns an unordered
    /// multiset -- callers must not assume order.
    pub async fn query_fingerprints(&self, hashes: &[u32]) -> Result<Vec<(i64, i32, u32)>, EngineError> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.pool.acquire().await?;
        sqlx::query("CREATE TEMP TABLE IF NOT EXISTS query_hashes (hash INTEGER PRIMARY KEY)")
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM query_hashes").execute(&mut *conn).await?;

        let mut tx = conn.begin().await?;
        for hash in hashes {
            sqlx::query("INSERT OR IGNORE INTO query_hashes (hash) VALUES (?)")
                .bind(*hash as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        let rows = sqlx::query(
            r#"
            SELECT f.track_id, f.time_offset_ms, f.hash
            FROM fingerprints f
            INNER JOIN query_hashes q ON f.hash = q.hash
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;

        sqlx::query("DELETE FROM query_hashes").execute(&mut *conn).await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let track_id: i64 = r.get("track_id");
                let time_offset_ms: i32 = r.get("time_offset_ms");
                let hash: i64 = r.get("hash");
                (track_id, time_offset_ms, hash as u32)
            })
            .collect())
    }

    pub async fn store_feature(&self, track_id: i64, kind: FeatureKind, data: &[f32]) -> Result<(), EngineError> {
        let blob = bincode::serialize(data)?;
        sqlx::query(
            r#"
            INSERT INTO audio_features (track_id, kind, data) VALUES (?, ?, ?)
            ON CONFLICT(track_id, kind) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(track_id)
        .bind(kind.as_str())
        .bind(blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bulk-load every stored feature of one kind; used once per mix analysis.
    pub async fn get_all_audio_features(&self, kind: FeatureKind) -> Result<HashMap<i64, Vec<f32>>, EngineError> {
        let rows = sqlx::query("SELECT track_id, data FROM audio_features WHERE kind = ?")
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let track_id: i64 = row.get("track_id");
            let blob: Vec<u8> = row.get("data");
            let vector: Vec<f32> = bincode::deserialize(&blob)?;
            out.insert(track_id, vector);
        }
        Ok(out)
    }

    /// Cascades to postings, status, and features in one transaction.
    pub async fn delete_track(&self, track_id: i64) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM fingerprints WHERE track_id = ?")
            .bind(track_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM fingerprint_status WHERE track_id = ?")
            .bind(track_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM audio_features WHERE track_id = ?")
            .bind(track_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Wipe every posting and status row, leaving `tracks` and
    /// `audio_features` untouched -- the CLI's `clear` command.
    pub async fn clear_all(&self) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM fingerprints").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM fingerprint_status").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Tracks with no `fingerprint_status` row, optionally filtered by mode
    /// and capped at `limit`.
    pub async fn tracks_to_index(&self, mode: Option<&str>, limit: Option<i64>) -> Result<Vec<Track>, EngineError> {
        let rows = sqlx::query_as::<_, Track>(
            r#"
            SELECT t.id, t.filepath, t.filename, t.title, t.artist, t.duration_seconds, t.mode
            FROM tracks t
            LEFT JOIN fingerprint_status s ON s.track_id = t.id
            WHERE s.track_id IS NULL
              AND (?1 IS NULL OR t.mode = ?1)
            ORDER BY t.id
            LIMIT ?2
            "#,
        )
        .bind(mode)
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn stats(&self) -> Result<Stats, EngineError> {
        let total_tracks: i64 = sqlx::query("SELECT COUNT(*) AS c FROM tracks")
            .fetch_one(&self.pool)
            .await?
            .get("c");
        let indexed_tracks: i64 = sqlx::query("SELECT COUNT(*) AS c FROM fingerprint_status")
            .fetch_one(&self.pool)
            .await?
            .get("c");
        let total_fingerprints: i64 = sqlx::query("SELECT COUNT(*) AS c FROM fingerprints")
            .fetch_one(&self.pool)
            .await?
            .get("c");

        let avg = if indexed_tracks > 0 {
            total_fingerprints as f64 / indexed_tracks as f64
        } else {
            0.0
        };

        let last_indexed_at: Option<DateTime<Utc>> =
            sqlx::query("SELECT MAX(indexed_at) AS t FROM fingerprint_status")
                .fetch_one(&self.pool)
                .await?
                .get("t");

        Ok(Stats {
            total_tracks,
            indexed_tracks,
            unindexed_tracks: total_tracks - indexed_tracks,
            total_fingerprints,
            avg_fingerprints_per_track: avg,
            last_indexed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;

    async fn test_store() -> FingerprintStore {
        FingerprintStore::connect("sqlite::memory:", 5).await.unwrap()
    }

    fn track(id: i64) -> Track {
        Track {
            id,
            filepath: format!("/music/{id}.mp3"),
            filename: format!("{id}.mp3"),
            title: Some(format!("Title {id}")),
            artist: Some("Artist".into()),
            duration_seconds: Some(200.0),
            mode: Some("jukebox".into()),
        }
    }

    #[tokio::test]
    async fn test_is_indexed_false_before_store() {
        let store = test_store().await;
        store.upsert_track(&track(1)).await.unwrap();
        assert!(!store.is_indexed(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_and_query_fingerprints() {
        let store = test_store().await;
        store.upsert_track(&track(1)).await.unwrap();
        let fps = vec![
            Fingerprint { hash: 100, time_offset_ms: 0, freq_bin: 1 },
            Fingerprint { hash: 200, time_offset_ms: 10, freq_bin: 2 },
        ];
        store.store_fingerprints(1, &fps, false).await.unwrap();
        assert!(store.is_indexed(1).await.unwrap());

        let rows = store.query_fingerprints(&[100, 999]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], (1, 0, 100));
    }

    #[tokio::test]
    async fn test_query_fingerprints_empty_input() {
        let store = test_store().await;
        assert!(store.query_fingerprints(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_is_idempotent_posting_count() {
        let store = test_store().await;
        store.upsert_track(&track(1)).await.unwrap();
        let fps = vec![Fingerprint { hash: 1, time_offset_ms: 0, freq_bin: 0 }; 7];
        store.store_fingerprints(1, &fps, true).await.unwrap();
        store.store_fingerprints(1, &fps, true).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_fingerprints, 7);
    }

    #[tokio::test]
    async fn test_delete_track_cascades() {
        let store = test_store().await;
        store.upsert_track(&track(1)).await.unwrap();
        let fps = vec![Fingerprint { hash: 1, time_offset_ms: 0, freq_bin: 0 }];
        store.store_fingerprints(1, &fps, false).await.unwrap();
        store.store_feature(1, FeatureKind::MfccSummary, &[1.0, 2.0]).await.unwrap();

        store.delete_track(1).await.unwrap();

        assert!(!store.is_indexed(1).await.unwrap());
        assert!(store.query_fingerprints(&[1]).await.unwrap().is_empty());
        assert!(store.get_all_audio_features(FeatureKind::MfccSummary).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tracks_to_index_excludes_indexed() {
        let store = test_store().await;
        store.upsert_track(&track(1)).await.unwrap();
        store.upsert_track(&track(2)).await.unwrap();
        store
            .store_fingerprints(1, &[Fingerprint { hash: 1, time_offset_ms: 0, freq_bin: 0 }], false)
            .await
            .unwrap();

        let pending = store.tracks_to_index(None, None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, 2);
    }

    #[tokio::test]
    async fn test_clear_all_wipes_postings_and_status_only() {
        let store = test_store().await;
        store.upsert_track(&track(1)).await.unwrap();
        store
            .store_fingerprints(1, &[Fingerprint { hash: 1, time_offset_ms: 0, freq_bin: 0 }], false)
            .await
            .unwrap();
        store.store_feature(1, FeatureKind::MfccSummary, &[1.0, 2.0]).await.unwrap();

        store.clear_all().await.unwrap();

        assert!(!store.is_indexed(1).await.unwrap());
        assert!(store.query_fingerprints(&[1]).await.unwrap().is_empty());
        assert!(!store.get_all_audio_features(FeatureKind::MfccSummary).await.unwrap().is_empty());
        assert!(store.get_track(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stats_reports_totals() {
        let store = test_store().await;
        store.upsert_track(&track(1)).await.unwrap();
        store
            .store_fingerprints(1, &[Fingerprint { hash: 1, time_offset_ms: 0, freq_bin: 0 }; 4], false)
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_tracks, 1);
        assert_eq!(stats.indexed_tracks, 1);
        assert_eq!(stats.unindexed_tracks, 0);
        assert_eq!(stats.total_fingerprints, 4);
        assert_eq!(stats.avg_fingerprints_per_track, 4.0);
    }
}
