//! SQLite-backed content store
//!
//! The registry of stored content lives in a relational database for atomic,
//! transactional updates. Segment payloads are kept as blob files on disk,
//! keyed per record; the database rows are the single source of truth for
//! what exists.

use crate::error::{map_blob_io, map_db_err, OvaultError};
use chrono::{DateTime, Utc};
use ovault_types::{
    format_offline_uri, LicenseRecord, RecordStatus, StoredContentRecord, StoredSegment,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool},
    Row,
};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A fetched segment sitting in the staging area, awaiting commit
#[derive(Debug, Clone)]
pub struct StagedSegment {
    pub index: u32,
    pub locator: String,
    pub size_bytes: u64,
    /// Staging file holding the fetched bytes
    pub path: PathBuf,
}

/// Durable store for content records, segment blobs, and license rows
#[derive(Clone, Debug)]
pub struct ContentStore {
    pool: SqlitePool,
    blob_dir: PathBuf,
    staging_dir: PathBuf,
}

impl ContentStore {
    /// Open (or create) the store under the given data directory
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, OvaultError> {
        let data_dir = data_dir.as_ref();
        let blob_dir = data_dir.join("blobs");
        let staging_dir = data_dir.join("staging");

        tokio::fs::create_dir_all(&blob_dir).await?;
        tokio::fs::create_dir_all(&staging_dir).await?;

        let options = SqliteConnectOptions::new()
            .filename(data_dir.join("contents.db"))
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS contents (
                offline_uri TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                manifest TEXT NOT NULL,
                license_id TEXT,
                created_at TEXT NOT NULL,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS content_segments (
                offline_uri TEXT NOT NULL,
                seg_index INTEGER NOT NULL,
                locator TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                blob_key TEXT NOT NULL,
                PRIMARY KEY (offline_uri, seg_index),
                FOREIGN KEY (offline_uri) REFERENCES contents(offline_uri) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS licenses (
                id TEXT PRIMARY KEY,
                key_system TEXT NOT NULL,
                session_key TEXT NOT NULL,
                persistent INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_contents_source ON contents(source);
            CREATE INDEX IF NOT EXISTS idx_segments_uri ON content_segments(offline_uri);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            blob_dir,
            staging_dir,
        })
    }

    /// Staging directory for one download session
    pub fn staging_path(&self, session_id: Uuid) -> PathBuf {
        self.staging_dir.join(session_id.to_string())
    }

    /// On-disk path of a persisted segment blob
    pub fn blob_path(&self, blob_key: &str) -> PathBuf {
        self.blob_dir.join(blob_key)
    }

    /// Remove a session's staging directory, if present
    pub async fn discard_staging(&self, session_id: Uuid) -> Result<(), OvaultError> {
        match tokio::fs::remove_dir_all(self.staging_path(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OvaultError::Io(e)),
        }
    }

    /// Commit one fully fetched presentation as a new record.
    ///
    /// Generates a fresh offline URI, moves staged blobs into place, and
    /// writes manifest + segments + license reference in a single
    /// all-or-nothing transaction. Until the transaction commits, no reader
    /// can observe the record; on failure the moved blobs are removed and
    /// prior state is untouched.
    pub async fn commit_content(
        &self,
        source: &str,
        manifest_raw: &str,
        staged: &[StagedSegment],
        license: Option<&LicenseRecord>,
    ) -> Result<StoredContentRecord, OvaultError> {
        let record_id = Uuid::new_v4();
        let offline_uri = format_offline_uri(record_id);
        let record_blob_dir = self.blob_dir.join(record_id.to_string());

        tokio::fs::create_dir_all(&record_blob_dir)
            .await
            .map_err(map_blob_io)?;

        let mut segments = Vec::with_capacity(staged.len());
        for seg in staged {
            let blob_key = format!("{}/{}.seg", record_id, seg.index);
            let dest = self.blob_dir.join(&blob_key);
            if let Err(e) = tokio::fs::rename(&seg.path, &dest).await {
                let _ = tokio::fs::remove_dir_all(&record_blob_dir).await;
                return Err(map_blob_io(e));
            }
            segments.push(StoredSegment {
                index: seg.index,
                locator: seg.locator.clone(),
                size_bytes: seg.size_bytes,
                blob_key,
            });
        }

        let record = StoredContentRecord {
            offline_uri: offline_uri.clone(),
            source: source.to_string(),
            manifest: manifest_raw.to_string(),
            segments,
            license_id: license.map(|l| l.id),
            created_at: Utc::now(),
            size_bytes: staged.iter().map(|s| s.size_bytes).sum(),
            status: RecordStatus::Complete,
        };

        if let Err(e) = self.insert_record_tx(&record, license).await {
            let _ = tokio::fs::remove_dir_all(&record_blob_dir).await;
            return Err(e);
        }

        Ok(record)
    }

    async fn insert_record_tx(
        &self,
        record: &StoredContentRecord,
        license: Option<&LicenseRecord>,
    ) -> Result<(), OvaultError> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;

        if let Some(lic) = license {
            sqlx::query(
                r#"
                INSERT INTO licenses (id, key_system, session_key, persistent, expires_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(lic.id.to_string())
            .bind(&lic.key_system)
            .bind(&lic.session_key)
            .bind(if lic.persistent { 1i64 } else { 0i64 })
            .bind(lic.expires_at.map(|d| d.to_rfc3339()))
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        }

        // Inserted as pending, flipped to complete before the commit; the
        // record is never observable in the pending state.
        sqlx::query(
            r#"
            INSERT INTO contents (offline_uri, source, manifest, license_id, created_at, size_bytes, status)
            VALUES (?, ?, ?, ?, ?, ?, 'pending')
            "#,
        )
        .bind(&record.offline_uri)
        .bind(&record.source)
        .bind(&record.manifest)
        .bind(record.license_id.map(|id| id.to_string()))
        .bind(record.created_at.to_rfc3339())
        .bind(record.size_bytes as i64)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?;

        for segment in &record.segments {
            sqlx::query(
                r#"
                INSERT INTO content_segments (offline_uri, seg_index, locator, size_bytes, blob_key)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.offline_uri)
            .bind(segment.index as i64)
            .bind(&segment.locator)
            .bind(segment.size_bytes as i64)
            .bind(&segment.blob_key)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        }

        sqlx::query("UPDATE contents SET status = 'complete' WHERE offline_uri = ?")
            .bind(&record.offline_uri)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;

        tx.commit().await.map_err(map_db_err)?;
        Ok(())
    }

    /// Load a record by offline URI
    pub async fn get(&self, offline_uri: &str) -> Result<Option<StoredContentRecord>, OvaultError> {
        let row = sqlx::query("SELECT * FROM contents WHERE offline_uri = ?")
            .bind(offline_uri)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let segments = self.load_segments(offline_uri).await?;
        let record = row_to_record(row, segments)?;
        validate_record(&record)?;
        Ok(Some(record))
    }

    /// Load all records (single segments query, grouped by record)
    pub async fn list_all(&self) -> Result<Vec<StoredContentRecord>, OvaultError> {
        let content_rows = sqlx::query("SELECT * FROM contents ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;

        let segment_rows =
            sqlx::query("SELECT * FROM content_segments ORDER BY offline_uri, seg_index")
                .fetch_all(&self.pool)
                .await?;

        let mut segments_map: std::collections::HashMap<String, Vec<StoredSegment>> =
            std::collections::HashMap::new();
        for row in segment_rows {
            let offline_uri: String = row.get("offline_uri");
            segments_map
                .entry(offline_uri)
                .or_default()
                .push(row_to_segment(&row));
        }

        let mut records = Vec::new();
        for row in content_rows {
            let offline_uri: String = row.get("offline_uri");
            let segments = segments_map.remove(&offline_uri).unwrap_or_default();
            let record = row_to_record(row, segments)?;
            validate_record(&record)?;
            records.push(record);
        }

        Ok(records)
    }

    async fn load_segments(&self, offline_uri: &str) -> Result<Vec<StoredSegment>, OvaultError> {
        let rows = sqlx::query(
            "SELECT * FROM content_segments WHERE offline_uri = ? ORDER BY seg_index",
        )
        .bind(offline_uri)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_segment).collect())
    }

    /// Delete a record and its segment rows in one transaction.
    ///
    /// Blob files are handled separately via [`ContentStore::remove_blobs`].
    pub async fn delete(&self, offline_uri: &str) -> Result<(), OvaultError> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;

        sqlx::query("DELETE FROM content_segments WHERE offline_uri = ?")
            .bind(offline_uri)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;

        sqlx::query("DELETE FROM contents WHERE offline_uri = ?")
            .bind(offline_uri)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;

        tx.commit().await.map_err(map_db_err)?;
        Ok(())
    }

    /// Delete the blob directory of a record. Missing directories are fine;
    /// removal must stay idempotent for retry after partial failures.
    pub async fn remove_blobs(&self, record_id: Uuid) -> Result<(), OvaultError> {
        let dir = self.blob_dir.join(record_id.to_string());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_blob_io(e)),
        }
    }

    /// Record an inconsistent state after a failed removal so the caller can
    /// retry
    pub async fn mark_corrupt(&self, offline_uri: &str) -> Result<(), OvaultError> {
        sqlx::query("UPDATE contents SET status = 'corrupt' WHERE offline_uri = ?")
            .bind(offline_uri)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop the license reference from a record once its license is released
    pub async fn clear_license_ref(&self, offline_uri: &str) -> Result<(), OvaultError> {
        sqlx::query("UPDATE contents SET license_id = NULL WHERE offline_uri = ?")
            .bind(offline_uri)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Load a license row by id
    pub async fn get_license(&self, id: Uuid) -> Result<Option<LicenseRecord>, OvaultError> {
        let row = sqlx::query("SELECT * FROM licenses WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at: Option<String> = row.get("expires_at");
        Ok(Some(LicenseRecord {
            id,
            key_system: row.get("key_system"),
            session_key: row.get("session_key"),
            persistent: row.get::<i64, _>("persistent") != 0,
            expires_at: expires_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        }))
    }

    /// Delete a license row
    pub async fn delete_license(&self, id: Uuid) -> Result<(), OvaultError> {
        sqlx::query("DELETE FROM licenses WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_segment(row: &sqlx::sqlite::SqliteRow) -> StoredSegment {
    StoredSegment {
        index: row.get::<i64, _>("seg_index") as u32,
        locator: row.get("locator"),
        size_bytes: row.get::<i64, _>("size_bytes") as u64,
        blob_key: row.get("blob_key"),
    }
}

fn row_to_record(
    row: sqlx::sqlite::SqliteRow,
    segments: Vec<StoredSegment>,
) -> Result<StoredContentRecord, OvaultError> {
    let offline_uri: String = row.get("offline_uri");

    let status_str: String = row.get("status");
    let status = match status_str.as_str() {
        "pending" => RecordStatus::Pending,
        "complete" => RecordStatus::Complete,
        "corrupt" => RecordStatus::Corrupt,
        other => {
            return Err(OvaultError::StorageCorrupt(format!(
                "{}: unknown status '{}'",
                offline_uri, other
            )))
        }
    };

    let created_at: String = row.get("created_at");
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| OvaultError::StorageCorrupt(format!("{}: bad timestamp: {}", offline_uri, e)))?
        .with_timezone(&Utc);

    Ok(StoredContentRecord {
        offline_uri,
        source: row.get("source"),
        manifest: row.get("manifest"),
        segments,
        license_id: row
            .get::<Option<String>, _>("license_id")
            .and_then(|s| Uuid::parse_str(&s).ok()),
        created_at,
        size_bytes: row.get::<i64, _>("size_bytes") as u64,
        status,
    })
}

/// Validate invariants a complete record must uphold.
///
/// Records already marked corrupt skip validation; they are an expected,
/// recorded inconsistent state awaiting a removal retry.
fn validate_record(record: &StoredContentRecord) -> Result<(), OvaultError> {
    if record.status != RecordStatus::Complete {
        return Ok(());
    }

    if record.segments.is_empty() {
        return Err(OvaultError::StorageCorrupt(format!(
            "{}: complete record with no segments",
            record.offline_uri
        )));
    }

    for (i, segment) in record.segments.iter().enumerate() {
        if segment.index != i as u32 {
            return Err(OvaultError::StorageCorrupt(format!(
                "{}: segment indices not contiguous at {}",
                record.offline_uri, i
            )));
        }
    }

    let total: u64 = record.segments.iter().map(|s| s.size_bytes).sum();
    if total != record.size_bytes {
        return Err(OvaultError::StorageCorrupt(format!(
            "{}: size mismatch ({} recorded, {} in segments)",
            record.offline_uri, record.size_bytes, total
        )));
    }

    Ok(())
}
