use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{Settings, DEFAULT_STALE_WINDOW_SECONDS};
use crate::db::queries::{HistoryQueries, ReconcileQueries};
use crate::db::Database;
use crate::errors::Result;
use crate::models::{
    is_placeholder_filename, HistoryEvent, LiveMetadata, DEFAULT_CLIENT_TYPE, MIN_TRUSTED_SIZE,
};
use crate::services::events::EventSink;
use crate::utils::ed2k::normalize_hash;

const UNKNOWN_FILENAME: &str = "Unknown";

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub seen: usize,
    pub imported: usize,
    pub completed: usize,
    pub missing: usize,
}

/// Folds live daemon snapshots into the download history.
#[derive(Clone)]
pub struct Reconciler {
    db: Database,
    events: Arc<dyn EventSink>,
    stale_window: Duration,
    client_type: String,
}

impl Reconciler {
    pub fn new(db: Database, events: Arc<dyn EventSink>) -> Self {
        Self {
            db,
            events,
            stale_window: Duration::from_secs(DEFAULT_STALE_WINDOW_SECONDS),
            client_type: DEFAULT_CLIENT_TYPE.to_string(),
        }
    }

    pub fn from_settings(db: Database, events: Arc<dyn EventSink>, settings: &Settings) -> Self {
        Self::new(db, events)
            .with_stale_window(settings.stale_window)
            .with_client_type(settings.client_type.clone())
    }

    /// Records not seen active for longer than `window` are flagged missing.
    /// It must span several poll cycles.
    pub fn with_stale_window(mut self, window: Duration) -> Self {
        self.stale_window = window;
        self
    }

    pub fn with_client_type(mut self, client_type: impl Into<String>) -> Self {
        self.client_type = client_type.into();
        self
    }

    pub fn reconcile(
        &self,
        active: &HashSet<String>,
        completed: &HashSet<String>,
        metadata: &HashMap<String, LiveMetadata>,
    ) -> Result<ReconcileReport> {
        self.reconcile_at(Utc::now(), active, completed, metadata)
    }

    pub fn reconcile_at(
        &self,
        now: DateTime<Utc>,
        active: &HashSet<String>,
        completed: &HashSet<String>,
        metadata: &HashMap<String, LiveMetadata>,
    ) -> Result<ReconcileReport> {
        let metadata: HashMap<String, &LiveMetadata> = metadata
            .iter()
            .map(|(hash, meta)| (normalize_hash(hash), meta))
            .collect();
        let active: BTreeSet<String> = active.iter().map(|hash| normalize_hash(hash)).collect();
        let completed: BTreeSet<String> =
            completed.iter().map(|hash| normalize_hash(hash)).collect();
        let mut report = ReconcileReport::default();

        for hash in &active {
            let meta = metadata.get(hash).copied();
            if !self.db.mark_seen_active(hash, now)? {
                self.import(hash, meta)?;
                report.imported += 1;
            }
            if let Some(meta) = meta {
                self.apply_metadata(hash, meta)?;
            }
            report.seen += 1;
        }

        for hash in &completed {
            let meta = metadata.get(hash).copied();
            let transitioned = self.db.mark_seen_completed(hash, now)?;
            if let Some(meta) = meta {
                self.apply_metadata(hash, meta)?;
            }
            if transitioned {
                self.emit_finished(hash, meta)?;
                report.completed += 1;
            }
        }

        let window = chrono::Duration::from_std(self.stale_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_STALE_WINDOW_SECONDS as i64));
        report.missing = self.db.mark_stale_missing(now - window)?;
        if report.missing > 0 {
            tracing::info!(
                "flagged {} downloads missing from live state window_secs={}",
                report.missing,
                self.stale_window.as_secs()
            );
        }

        tracing::debug!(
            "reconcile seen={} imported={} completed={} missing={}",
            report.seen,
            report.imported,
            report.completed,
            report.missing
        );
        Ok(report)
    }

    /// Creates history for a download started outside the controller.
    fn import(&self, hash: &str, meta: Option<&LiveMetadata>) -> Result<()> {
        let filename = meta
            .and_then(|meta| meta.name.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(UNKNOWN_FILENAME)
            .to_string();
        let size = meta
            .and_then(|meta| meta.size)
            .filter(|size| *size >= MIN_TRUSTED_SIZE);
        let category = meta.and_then(|meta| meta.category.clone());

        self.db.add_or_refresh(
            hash,
            &filename,
            size,
            None,
            &self.client_type,
            category.as_deref(),
        )?;
        tracing::info!("imported external download hash={} filename={}", hash, filename);

        self.events.emit(HistoryEvent::DownloadAdded {
            hash: hash.to_string(),
            filename,
            size,
            username: None,
            client_type: self.client_type.clone(),
            category,
        });
        Ok(())
    }

    fn apply_metadata(&self, hash: &str, meta: &LiveMetadata) -> Result<()> {
        if let Some(name) = meta.name.as_deref() {
            if !is_placeholder_filename(name) {
                self.db.update_filename(hash, name)?;
            }
        }
        if let Some(size) = meta.size {
            self.db.update_size(hash, size)?;
        }
        self.db.update_transfer_stats(hash, &meta.stats)?;
        Ok(())
    }

    fn emit_finished(&self, hash: &str, meta: Option<&LiveMetadata>) -> Result<()> {
        let Some(record) = self.db.get_entry(hash)? else {
            return Ok(());
        };
        tracing::info!(
            "download completed hash={} filename={} downloaded={}",
            record.hash,
            record.filename,
            record.downloaded
        );
        let path = meta.and_then(|meta| meta.resolved_path(&record.filename));
        let category = meta
            .and_then(|meta| meta.category.clone())
            .or(record.category);
        self.events.emit(HistoryEvent::DownloadFinished {
            hash: record.hash,
            filename: record.filename,
            size: record.size,
            client_type: record.client_type,
            downloaded: record.downloaded,
            uploaded: record.uploaded,
            ratio: record.ratio,
            tracker_domain: record.tracker_domain,
            category,
            path,
            multi_file: meta.map(|meta| meta.multi_file).unwrap_or(false),
        });
        Ok(())
    }
}
