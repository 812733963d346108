use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};

use crate::db::Database;
use crate::errors::Result;
use crate::models::{
    is_placeholder_filename, DownloadRecord, DownloadStatus, HistoryPage, HistoryQuery,
    SortDirection, StatusCounts, TransferStats, MIN_TRUSTED_SIZE, PLACEHOLDER_FILENAMES,
};
use crate::utils::ed2k::normalize_hash;
use crate::utils::time::{format_timestamp, now_timestamp};

const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 1000;

const SELECT_COLUMNS: &str = "hash, filename, size, started_at, completed_at, deleted_at, \
     last_seen_at, status, downloaded, uploaded, ratio, tracker_domain, client_type, username, category";

/// Sort keys accepted from callers, in both API and column spelling.
const SORT_COLUMNS: &[(&str, &str)] = &[
    ("startedAt", "started_at"),
    ("started_at", "started_at"),
    ("completedAt", "completed_at"),
    ("completed_at", "completed_at"),
    ("deletedAt", "deleted_at"),
    ("deleted_at", "deleted_at"),
    ("lastSeenAt", "last_seen_at"),
    ("last_seen_at", "last_seen_at"),
    ("filename", "filename"),
    ("size", "size"),
    ("status", "status"),
    ("username", "username"),
    ("clientType", "client_type"),
    ("client_type", "client_type"),
    ("downloaded", "downloaded"),
    ("uploaded", "uploaded"),
    ("ratio", "ratio"),
    ("trackerDomain", "tracker_domain"),
    ("tracker_domain", "tracker_domain"),
    ("category", "category"),
    ("hash", "hash"),
];

const STATUS_PRIORITY: &str = "CASE status \
     WHEN 'downloading' THEN 0 \
     WHEN 'missing' THEN 1 \
     WHEN 'deleted' THEN 2 \
     WHEN 'completed' THEN 4 \
     ELSE 3 END";

const SEARCH_CLAUSE: &str = "(?1 IS NULL \
     OR LOWER(filename) LIKE ?1 ESCAPE '\\' \
     OR LOWER(hash) LIKE ?1 ESCAPE '\\' \
     OR LOWER(COALESCE(username, '')) LIKE ?1 ESCAPE '\\' \
     OR LOWER(COALESCE(tracker_domain, '')) LIKE ?1 ESCAPE '\\')";

pub trait HistoryQueries {
    fn add_or_refresh(
        &self,
        hash: &str,
        filename: &str,
        size: Option<i64>,
        username: Option<&str>,
        client_type: &str,
        category: Option<&str>,
    ) -> Result<()>;
    fn get_entry(&self, hash: &str) -> Result<Option<DownloadRecord>>;
    fn mark_completed(&self, hash: &str) -> Result<bool>;
    fn mark_deleted(&self, hash: &str) -> Result<bool>;
    fn update_transfer_stats(&self, hash: &str, stats: &TransferStats) -> Result<bool>;
    fn update_size(&self, hash: &str, size: i64) -> Result<bool>;
    fn update_filename(&self, hash: &str, filename: &str) -> Result<bool>;
    fn remove_entry(&self, hash: &str) -> Result<bool>;
    fn query(&self, query: &HistoryQuery) -> Result<HistoryPage>;
    fn cleanup(&self, retention_days: u32) -> Result<usize>;
    fn status_counts(&self) -> Result<StatusCounts>;
}

/// Row-level transitions driven by live snapshots.
pub trait ReconcileQueries {
    /// Refreshes `last_seen_at` and moves `downloading`/`missing` rows back to
    /// `downloading`. Returns `false` when no record exists for the hash.
    fn mark_seen_active(&self, hash: &str, now: DateTime<Utc>) -> Result<bool>;
    /// Returns `true` only when the row genuinely transitioned to `completed`.
    fn mark_seen_completed(&self, hash: &str, now: DateTime<Utc>) -> Result<bool>;
    fn mark_stale_missing(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<DownloadRecord> {
    let status_raw: String = row.get(7)?;
    let status = status_raw.parse::<DownloadStatus>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(7, Type::Text, err.into())
    })?;
    Ok(DownloadRecord {
        hash: row.get(0)?,
        filename: row.get(1)?,
        size: row.get(2)?,
        started_at: row.get(3)?,
        completed_at: row.get(4)?,
        deleted_at: row.get(5)?,
        last_seen_at: row.get(6)?,
        status,
        downloaded: row.get(8)?,
        uploaded: row.get(9)?,
        ratio: row.get(10)?,
        tracker_domain: row.get(11)?,
        client_type: row.get(12)?,
        username: row.get(13)?,
        category: row.get(14)?,
    })
}

fn sort_column(key: Option<&str>) -> Option<&'static str> {
    let key = key?.trim();
    SORT_COLUMNS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, column)| *column)
}

fn order_clause(query: &HistoryQuery) -> String {
    let primary = match sort_column(query.sort_by.as_deref()) {
        Some(column) => column,
        None => {
            if let Some(requested) = query.sort_by.as_deref() {
                tracing::debug!("ignoring unknown history sort key '{}'", requested);
            }
            "started_at"
        }
    };
    let direction = SortDirection::parse(query.sort_dir.as_deref());

    let mut clause = if primary == "completed_at" {
        format!(
            "{} ASC, completed_at {}",
            STATUS_PRIORITY,
            direction.as_sql()
        )
    } else {
        format!("{} {}", primary, direction.as_sql())
    };

    if let Some(secondary) = sort_column(query.secondary_sort_by.as_deref()) {
        if secondary != primary {
            let secondary_direction = SortDirection::parse(query.secondary_sort_dir.as_deref());
            clause.push_str(&format!(", {} {}", secondary, secondary_direction.as_sql()));
        }
    }
    clause.push_str(", hash ASC");
    clause
}

fn search_pattern(search: Option<&str>) -> Option<String> {
    let term = search?.trim();
    if term.is_empty() {
        return None;
    }
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    // SQLite LOWER() folds ASCII only, so the pattern must match that.
    for ch in term.to_ascii_lowercase().chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    Some(escaped)
}

fn placeholder_list() -> String {
    PLACEHOLDER_FILENAMES
        .iter()
        .map(|name| format!("'{}'", name.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(", ")
}

impl HistoryQueries for Database {
    fn add_or_refresh(
        &self,
        hash: &str,
        filename: &str,
        size: Option<i64>,
        username: Option<&str>,
        client_type: &str,
        category: Option<&str>,
    ) -> Result<()> {
        let hash = normalize_hash(hash);
        let now = now_timestamp();
        let sql = format!(
            "INSERT INTO download_history (
                hash, filename, size, started_at, username, client_type, category, status, last_seen_at
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'downloading', ?4)
             ON CONFLICT(hash) DO UPDATE SET
                filename = CASE
                    WHEN download_history.filename IN ({placeholders}) THEN excluded.filename
                    WHEN excluded.filename IN ({placeholders}) THEN download_history.filename
                    ELSE excluded.filename
                END,
                size = CASE
                    WHEN excluded.size >= {min_size} THEN excluded.size
                    ELSE COALESCE(download_history.size, excluded.size)
                END,
                started_at = excluded.started_at,
                completed_at = NULL,
                deleted_at = NULL,
                last_seen_at = excluded.last_seen_at,
                status = 'downloading',
                username = COALESCE(excluded.username, download_history.username),
                client_type = excluded.client_type,
                category = COALESCE(excluded.category, download_history.category)",
            placeholders = placeholder_list(),
            min_size = MIN_TRUSTED_SIZE
        );
        let conn = self.connection()?;
        conn.execute(
            &sql,
            params![hash, filename, size, now, username, client_type, category],
        )?;
        Ok(())
    }

    fn get_entry(&self, hash: &str) -> Result<Option<DownloadRecord>> {
        let hash = normalize_hash(hash);
        let conn = self.connection()?;
        let record = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM download_history WHERE hash = ?1"),
                params![hash],
                map_record,
            )
            .optional()?;
        Ok(record)
    }

    fn mark_completed(&self, hash: &str) -> Result<bool> {
        let hash = normalize_hash(hash);
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE download_history
             SET status = 'completed', completed_at = COALESCE(completed_at, ?2)
             WHERE hash = ?1 AND status != 'completed'",
            params![hash, now_timestamp()],
        )?;
        Ok(changed > 0)
    }

    fn mark_deleted(&self, hash: &str) -> Result<bool> {
        let hash = normalize_hash(hash);
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE download_history SET status = 'deleted', deleted_at = ?2
             WHERE hash = ?1 AND status != 'deleted'",
            params![hash, now_timestamp()],
        )?;
        Ok(changed > 0)
    }

    fn update_transfer_stats(&self, hash: &str, stats: &TransferStats) -> Result<bool> {
        if stats.is_empty() {
            return Ok(false);
        }
        let hash = normalize_hash(hash);
        let tracker = stats
            .tracker_domain
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE download_history SET
                downloaded = MAX(downloaded, COALESCE(?2, downloaded)),
                uploaded = MAX(uploaded, COALESCE(?3, uploaded)),
                ratio = COALESCE(?4, ratio),
                tracker_domain = COALESCE(tracker_domain, ?5)
             WHERE hash = ?1",
            params![hash, stats.downloaded, stats.uploaded, stats.ratio, tracker],
        )?;
        Ok(changed > 0)
    }

    fn update_size(&self, hash: &str, size: i64) -> Result<bool> {
        if size < MIN_TRUSTED_SIZE {
            return Ok(false);
        }
        let hash = normalize_hash(hash);
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE download_history SET size = ?2
             WHERE hash = ?1 AND (size IS NULL OR size < ?2)",
            params![hash, size],
        )?;
        Ok(changed > 0)
    }

    fn update_filename(&self, hash: &str, filename: &str) -> Result<bool> {
        let filename = filename.trim();
        if filename.is_empty() || is_placeholder_filename(filename) {
            return Ok(false);
        }
        let hash = normalize_hash(hash);
        let conn = self.connection()?;
        let changed = conn.execute(
            &format!(
                "UPDATE download_history SET filename = ?2
                 WHERE hash = ?1 AND filename IN ({})",
                placeholder_list()
            ),
            params![hash, filename],
        )?;
        Ok(changed > 0)
    }

    fn remove_entry(&self, hash: &str) -> Result<bool> {
        let hash = normalize_hash(hash);
        let conn = self.connection()?;
        let changed = conn.execute(
            "DELETE FROM download_history WHERE hash = ?1",
            params![hash],
        )?;
        Ok(changed > 0)
    }

    fn query(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        let limit = query
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let offset = query.offset.unwrap_or(0);
        let pattern = search_pattern(query.search.as_deref());

        let conn = self.connection()?;
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM download_history WHERE {SEARCH_CLAUSE}"),
            params![pattern],
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM download_history
             WHERE {SEARCH_CLAUSE}
             ORDER BY {}
             LIMIT ?2 OFFSET ?3",
            order_clause(query)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![pattern, limit, offset], map_record)?;

        let mut entries = Vec::new();
        for item in rows {
            entries.push(item?);
        }
        Ok(HistoryPage { entries, total })
    }

    fn cleanup(&self, retention_days: u32) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = format_timestamp(Utc::now() - Duration::days(i64::from(retention_days)));
        let conn = self.connection()?;
        let removed = conn.execute(
            "DELETE FROM download_history WHERE started_at < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            tracing::info!(
                "history retention purge removed={} retention_days={}",
                removed,
                retention_days
            );
        }
        Ok(removed)
    }

    fn status_counts(&self) -> Result<StatusCounts> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM download_history GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = StatusCounts::default();
        for item in rows {
            let (status, count) = item?;
            match status.parse::<DownloadStatus>() {
                Ok(DownloadStatus::Downloading) => counts.downloading += count,
                Ok(DownloadStatus::Completed) => counts.completed += count,
                Ok(DownloadStatus::Missing) => counts.missing += count,
                Ok(DownloadStatus::Deleted) => counts.deleted += count,
                Err(err) => tracing::warn!("skipping history rows with {}", err),
            }
        }
        Ok(counts)
    }
}

impl ReconcileQueries for Database {
    fn mark_seen_active(&self, hash: &str, now: DateTime<Utc>) -> Result<bool> {
        let hash = normalize_hash(hash);
        let conn = self.connection()?;
        let touched = conn.execute(
            "UPDATE download_history SET
                last_seen_at = ?2,
                status = CASE WHEN status IN ('downloading', 'missing') THEN 'downloading' ELSE status END
             WHERE hash = ?1",
            params![hash, format_timestamp(now)],
        )?;
        Ok(touched > 0)
    }

    fn mark_seen_completed(&self, hash: &str, now: DateTime<Utc>) -> Result<bool> {
        let hash = normalize_hash(hash);
        let now = format_timestamp(now);
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let transitioned = tx.execute(
            "UPDATE download_history
             SET status = 'completed', completed_at = COALESCE(completed_at, ?2)
             WHERE hash = ?1 AND status NOT IN ('completed', 'deleted')",
            params![hash, now],
        )? > 0;
        if !transitioned {
            tx.execute(
                "UPDATE download_history SET completed_at = ?2
                 WHERE hash = ?1 AND completed_at IS NULL AND status = 'completed'",
                params![hash, now],
            )?;
        }
        tx.commit()?;
        Ok(transitioned)
    }

    fn mark_stale_missing(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.connection()?;
        let flipped = conn.execute(
            "UPDATE download_history SET status = 'missing'
             WHERE status = 'downloading' AND (last_seen_at IS NULL OR last_seen_at < ?1)",
            params![format_timestamp(cutoff)],
        )?;
        Ok(flipped)
    }
}
