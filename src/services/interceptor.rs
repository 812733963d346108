use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::db::queries::HistoryQueries;
use crate::db::Database;
use crate::errors::{ProtocolError, Result};
use crate::models::{FileInfo, HistoryEvent, DEFAULT_CLIENT_TYPE};
use crate::services::dispatcher::{CallHook, DispatchTable, HookContext};
use crate::services::events::EventSink;
use crate::services::session::CallArgs;
use crate::utils::ed2k::{is_valid_hash, normalize_hash, parse_link};

/// Starts a download from an `ed2k://` link. Args: `[link, category]`.
pub const ADD_ED2K_LINK: &str = "add_ed2k_link";
/// Starts a download from a search result hash. Args: `[hash, category]`.
pub const DOWNLOAD_SEARCH_RESULT: &str = "download_search_result";
/// Removes a download from the daemon queue. Args: `[hash]`.
pub const DELETE_DOWNLOAD: &str = "delete_download";

/// Arguments forwarded to the daemon by start calls; one more trailing
/// argument is the attribution username.
const START_ARITY: usize = 2;

const UNKNOWN_FILENAME: &str = "Unknown";

/// Out-of-band name/size lookup for start calls that only carry a hash.
pub type FileInfoLookup = Arc<dyn Fn(&str) -> Option<FileInfo> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tracked {
    StartByLink,
    StartByHash,
    Delete,
}

impl Tracked {
    fn from_operation(operation: &str) -> Option<Self> {
        match operation {
            ADD_ED2K_LINK => Some(Tracked::StartByLink),
            DOWNLOAD_SEARCH_RESULT => Some(Tracked::StartByHash),
            DELETE_DOWNLOAD => Some(Tracked::Delete),
            _ => None,
        }
    }
}

struct StartTarget {
    hash: String,
    filename: String,
    size: Option<i64>,
}

/// Mirrors start and delete calls into the download history.
#[derive(Clone)]
pub struct HistoryInterceptor {
    db: Database,
    events: Arc<dyn EventSink>,
    file_info: Option<FileInfoLookup>,
    client_type: String,
}

impl HistoryInterceptor {
    pub fn new(db: Database, events: Arc<dyn EventSink>) -> Self {
        Self {
            db,
            events,
            file_info: None,
            client_type: DEFAULT_CLIENT_TYPE.to_string(),
        }
    }

    pub fn with_file_info(mut self, lookup: FileInfoLookup) -> Self {
        self.file_info = Some(lookup);
        self
    }

    pub fn with_client_type(mut self, client_type: impl Into<String>) -> Self {
        self.client_type = client_type.into();
        self
    }

    /// Registers this interceptor for every tracked operation.
    pub fn register(self: Arc<Self>, table: &mut DispatchTable) {
        for operation in [ADD_ED2K_LINK, DOWNLOAD_SEARCH_RESULT, DELETE_DOWNLOAD] {
            table.register(operation, self.clone());
        }
    }

    fn start_target(&self, kind: Tracked, args: &CallArgs) -> Option<StartTarget> {
        let raw = args.first().and_then(Value::as_str)?;
        match kind {
            Tracked::StartByLink => match parse_link(raw) {
                Ok(link) => Some(StartTarget {
                    hash: link.hash,
                    filename: link.filename,
                    size: Some(link.size),
                }),
                Err(err) => {
                    tracing::warn!("skipping history for unparseable link: {}", err);
                    None
                }
            },
            Tracked::StartByHash => {
                let hash = normalize_hash(raw);
                if !is_valid_hash(&hash) {
                    tracing::warn!("skipping history for invalid hash '{}'", raw);
                    return None;
                }
                let info = self
                    .file_info
                    .as_ref()
                    .and_then(|lookup| lookup(&hash))
                    .unwrap_or_default();
                Some(StartTarget {
                    hash,
                    filename: info
                        .filename
                        .map(|name| name.trim().to_string())
                        .filter(|name| !name.is_empty())
                        .unwrap_or_else(|| UNKNOWN_FILENAME.to_string()),
                    size: info.size,
                })
            }
            Tracked::Delete => None,
        }
    }

    fn track_start(&self, kind: Tracked, context: &HookContext, result: &Value) -> Result<()> {
        if matches!(result, Value::Bool(false) | Value::Null) {
            tracing::info!(
                "{} returned {}, not recording history",
                context.operation,
                result
            );
            return Ok(());
        }
        let Some(target) = self.start_target(kind, &context.args) else {
            return Ok(());
        };
        let category = context.args.get(1).and_then(category_label);

        self.db.add_or_refresh(
            &target.hash,
            &target.filename,
            target.size,
            context.username.as_deref(),
            &self.client_type,
            category.as_deref(),
        )?;
        tracing::info!(
            "download started hash={} filename={} user={}",
            target.hash,
            target.filename,
            context.username.as_deref().unwrap_or("-")
        );

        self.events.emit(HistoryEvent::DownloadAdded {
            hash: target.hash,
            filename: target.filename,
            size: target.size,
            username: context.username.clone(),
            client_type: self.client_type.clone(),
            category,
        });
        Ok(())
    }

    fn track_delete(&self, context: &HookContext) -> Result<()> {
        let Some(hash) = context
            .args
            .first()
            .and_then(Value::as_str)
            .map(normalize_hash)
            .filter(|hash| is_valid_hash(hash))
        else {
            tracing::warn!("{} without a usable hash, history untouched", context.operation);
            return Ok(());
        };
        if self.db.mark_deleted(&hash)? {
            tracing::info!("download deleted hash={}", hash);
        }
        Ok(())
    }
}

fn category_label(value: &Value) -> Option<String> {
    match value {
        Value::String(label) => Some(label.trim().to_string()).filter(|label| !label.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[async_trait]
impl CallHook for HistoryInterceptor {
    fn before(&self, operation: &str, args: &mut CallArgs) -> HookContext {
        let mut username = None;
        if matches!(
            Tracked::from_operation(operation),
            Some(Tracked::StartByLink | Tracked::StartByHash)
        ) && args.len() > START_ARITY
        {
            username = args
                .pop()
                .and_then(|value| value.as_str().map(|name| name.trim().to_string()))
                .filter(|name| !name.is_empty());
        }
        HookContext {
            operation: operation.to_string(),
            args: args.clone(),
            username,
        }
    }

    async fn after(
        &self,
        context: HookContext,
        outcome: &std::result::Result<Value, ProtocolError>,
    ) -> Result<()> {
        let Some(kind) = Tracked::from_operation(&context.operation) else {
            return Ok(());
        };
        match kind {
            // A delete is user intent, so history follows it even when the daemon call fails.
            Tracked::Delete => self.track_delete(&context).map_err(|err| {
                tracing::error!("failed to record delete for {}: {}", context.operation, err);
                err
            }),
            Tracked::StartByLink | Tracked::StartByHash => match outcome {
                Ok(result) => self.track_start(kind, &context, result).map_err(|err| {
                    tracing::error!("failed to record start for {}: {}", context.operation, err);
                    err
                }),
                Err(err) => {
                    tracing::debug!("start call failed, history untouched: {}", err);
                    Ok(())
                }
            },
        }
    }
}
