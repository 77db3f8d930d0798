//! The durable deletion ledger.
//!
//! Every mark is appended here before the in-memory mark set changes, so
//! a crash can never lose a deletion decision. The ledger is append-only:
//! unmarking appends a compensating tombstone record instead of deleting
//! history, and the current mark set is reconstructed by replaying the
//! record sequence in order. After a restart the ledger, not the session,
//! is the source of truth for marks.
//!
//! `export()` produces the JSON artifact consumed by the external
//! deletion executor. Its field names are a compatibility contract and
//! covered by a test; do not rename them.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use crate::error::SiftError;
use crate::models::{ImageRef, SourceKind};

/// One entry of the export artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerExport {
    pub identifier: String,
    pub source: SourceKind,
    /// Unix timestamp of the surviving mark.
    pub marked_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

pub struct DeletionLedger {
    pool: SqlitePool,
    session_id: String,
}

impl DeletionLedger {
    /// Open (or create) the ledger database at `path`.
    ///
    /// WAL journaling keeps appends durable across crashes without
    /// blocking readers. Schema creation is idempotent.
    pub async fn open(path: &Path) -> Result<Self, SiftError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SiftError::LedgerWriteFailed(e.to_string()))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| SiftError::LedgerWriteFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(|e| SiftError::LedgerWriteFailed(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_records (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                identifier    TEXT NOT NULL,
                source_kind   TEXT NOT NULL,
                action        TEXT NOT NULL CHECK (action IN ('mark', 'unmark')),
                recorded_at   INTEGER NOT NULL,
                remote_url    TEXT,
                metadata_json TEXT,
                session_id    TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| SiftError::LedgerWriteFailed(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ledger_identifier \
             ON ledger_records(identifier, id)",
        )
        .execute(&pool)
        .await
        .map_err(|e| SiftError::LedgerWriteFailed(e.to_string()))?;

        Ok(Self {
            pool,
            session_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Append a mark record. Returns only after the write is durable;
    /// the caller must not apply the mark in memory if this fails.
    pub async fn record_mark(&self, image: &ImageRef) -> Result<(), SiftError> {
        self.append(image, "mark").await
    }

    /// Append a compensating unmark tombstone.
    pub async fn record_unmark(&self, image: &ImageRef) -> Result<(), SiftError> {
        self.append(image, "unmark").await
    }

    async fn append(&self, image: &ImageRef, action: &str) -> Result<(), SiftError> {
        let metadata_json = image
            .download_url
            .as_ref()
            .map(|url| serde_json::json!({ "downloadUrl": url }).to_string());

        sqlx::query(
            "INSERT INTO ledger_records \
             (identifier, source_kind, action, recorded_at, remote_url, metadata_json, session_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&image.identifier)
        .bind(image.kind.to_string())
        .bind(action)
        .bind(Utc::now().timestamp())
        .bind(&image.product_url)
        .bind(metadata_json)
        .bind(&self.session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| SiftError::LedgerWriteFailed(e.to_string()))?;

        Ok(())
    }

    /// Replay the record sequence to the set of currently marked
    /// identifiers, in surviving-mark order.
    pub async fn active_marks(&self) -> Result<Vec<String>, SiftError> {
        Ok(self.replay().await?.into_iter().map(|e| e.identifier).collect())
    }

    /// Build the export artifact: one entry per currently marked image,
    /// ordered by the mark that put it in the set.
    pub async fn export(&self) -> Result<Vec<LedgerExport>, SiftError> {
        self.replay().await
    }

    async fn replay(&self) -> Result<Vec<LedgerExport>, SiftError> {
        let rows = sqlx::query(
            "SELECT identifier, source_kind, action, recorded_at, remote_url, metadata_json \
             FROM ledger_records ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SiftError::LedgerWriteFailed(e.to_string()))?;

        let mut order: Vec<String> = Vec::new();
        let mut marked: HashMap<String, LedgerExport> = HashMap::new();

        for row in rows {
            let identifier: String = row.get("identifier");
            let action: String = row.get("action");

            match action.as_str() {
                "mark" => {
                    if !marked.contains_key(&identifier) {
                        order.push(identifier.clone());
                    }
                    let source_kind: String = row.get("source_kind");
                    let metadata = row
                        .get::<Option<String>, _>("metadata_json")
                        .and_then(|raw| serde_json::from_str(&raw).ok());
                    marked.insert(
                        identifier.clone(),
                        LedgerExport {
                            identifier,
                            source: match source_kind.as_str() {
                                "remote" => SourceKind::Remote,
                                _ => SourceKind::Local,
                            },
                            marked_at: row.get("recorded_at"),
                            remote_url: row.get("remote_url"),
                            metadata,
                        },
                    );
                }
                _ => {
                    if marked.remove(&identifier).is_some() {
                        order.retain(|id| id != &identifier);
                    }
                }
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|id| marked.remove(&id))
            .collect())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(identifier: &str) -> ImageRef {
        ImageRef {
            identifier: identifier.to_string(),
            ordinal: 0,
            captured_at: None,
            product_url: None,
            download_url: None,
            kind: SourceKind::Local,
        }
    }

    fn remote_image(identifier: &str) -> ImageRef {
        ImageRef {
            identifier: identifier.to_string(),
            ordinal: 0,
            captured_at: None,
            product_url: Some(format!("https://photos.example.com/item/{identifier}")),
            download_url: Some(format!("https://cdn.example.com/{identifier}=d")),
            kind: SourceKind::Remote,
        }
    }

    #[tokio::test]
    async fn mark_unmark_mark_exports_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = DeletionLedger::open(&tmp.path().join("ledger.sqlite"))
            .await
            .unwrap();

        let img = image("burst-2.jpg");
        ledger.record_mark(&img).await.unwrap();
        ledger.record_unmark(&img).await.unwrap();
        ledger.record_mark(&img).await.unwrap();

        let export = ledger.export().await.unwrap();
        assert_eq!(export.len(), 1);
        assert_eq!(export[0].identifier, "burst-2.jpg");
        ledger.close().await;
    }

    #[tokio::test]
    async fn replay_after_reopen_reconstructs_marks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ledger.sqlite");

        {
            let ledger = DeletionLedger::open(&path).await.unwrap();
            ledger.record_mark(&image("a.jpg")).await.unwrap();
            ledger.record_mark(&image("b.jpg")).await.unwrap();
            ledger.record_unmark(&image("a.jpg")).await.unwrap();
            ledger.close().await;
        }

        let reopened = DeletionLedger::open(&path).await.unwrap();
        assert_eq!(reopened.active_marks().await.unwrap(), vec!["b.jpg"]);
        reopened.close().await;
    }

    #[tokio::test]
    async fn export_preserves_surviving_mark_order() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = DeletionLedger::open(&tmp.path().join("ledger.sqlite"))
            .await
            .unwrap();

        ledger.record_mark(&image("first.jpg")).await.unwrap();
        ledger.record_mark(&image("second.jpg")).await.unwrap();
        ledger.record_unmark(&image("first.jpg")).await.unwrap();
        ledger.record_mark(&image("third.jpg")).await.unwrap();

        let ids = ledger.active_marks().await.unwrap();
        assert_eq!(ids, vec!["second.jpg", "third.jpg"]);
        ledger.close().await;
    }

    #[tokio::test]
    async fn export_field_names_are_stable() {
        // The external deleter parses these exact field names.
        let tmp = tempfile::tempdir().unwrap();
        let ledger = DeletionLedger::open(&tmp.path().join("ledger.sqlite"))
            .await
            .unwrap();

        ledger.record_mark(&remote_image("m-1")).await.unwrap();
        let export = ledger.export().await.unwrap();
        let value = serde_json::to_value(&export).unwrap();

        let obj = value.as_array().unwrap()[0].as_object().unwrap();
        let mut keys: Vec<&str> = obj.keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec!["identifier", "marked_at", "metadata", "remote_url", "source"]
        );
        assert_eq!(obj["source"], "remote");
        assert_eq!(
            obj["remote_url"],
            "https://photos.example.com/item/m-1"
        );
        ledger.close().await;
    }

    #[tokio::test]
    async fn local_export_omits_remote_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = DeletionLedger::open(&tmp.path().join("ledger.sqlite"))
            .await
            .unwrap();

        ledger.record_mark(&image("a.jpg")).await.unwrap();
        let value = serde_json::to_value(&ledger.export().await.unwrap()).unwrap();
        let obj = value.as_array().unwrap()[0].as_object().unwrap();
        assert!(!obj.contains_key("remote_url"));
        assert!(!obj.contains_key("metadata"));
        ledger.close().await;
    }
}
