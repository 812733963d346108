use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::Settings;
use crate::db::queries::HistoryQueries;
use crate::db::{self, Database};
use crate::errors::Result;
use crate::services::{
    CallDispatcher, DispatchTable, EventBus, FileInfoLookup, HistoryInterceptor, ProtocolSession,
    Reconciler, SnapshotMerger,
};

/// Sub-list the daemon reports incrementally per downloading file.
pub const SOURCE_NAMES_FIELD: &str = "source_names";
pub const SOURCE_INDEX_KEY: &str = "index";

/// Handles built once at startup and passed to the API layer and poller.
#[derive(Clone)]
pub struct BridgeState {
    pub settings: Settings,
    pub db: Database,
    pub events: Arc<EventBus>,
    pub dispatcher: CallDispatcher,
    pub reconciler: Reconciler,
    pub sources: Arc<Mutex<SnapshotMerger>>,
}

impl BridgeState {
    /// Opens the history store (a migration failure aborts startup), applies
    /// retention and wires the dispatcher with history tracking. Must run
    /// inside a tokio runtime.
    pub fn bootstrap(
        settings: Settings,
        session: Arc<dyn ProtocolSession>,
        file_info: Option<FileInfoLookup>,
    ) -> Result<Self> {
        let db = db::init(&settings.history_db)?;
        db.cleanup(settings.retention_days)?;
        Self::assemble(settings, db, session, file_info)
    }

    pub fn assemble(
        settings: Settings,
        db: Database,
        session: Arc<dyn ProtocolSession>,
        file_info: Option<FileInfoLookup>,
    ) -> Result<Self> {
        let events = Arc::new(EventBus::new(settings.event_capacity));

        let mut interceptor = HistoryInterceptor::new(db.clone(), events.clone())
            .with_client_type(settings.client_type.clone());
        if let Some(lookup) = file_info {
            interceptor = interceptor.with_file_info(lookup);
        }
        let mut table = DispatchTable::new();
        Arc::new(interceptor).register(&mut table);

        let dispatcher = CallDispatcher::new(session, table)?;
        let reconciler = Reconciler::from_settings(db.clone(), events.clone(), &settings);

        Ok(Self {
            settings,
            db,
            events,
            dispatcher,
            reconciler,
            sources: Arc::new(Mutex::new(SnapshotMerger::new(
                SOURCE_NAMES_FIELD,
                SOURCE_INDEX_KEY,
            ))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::{current_version, CURRENT_VERSION};
    use crate::models::{DownloadStatus, HistoryEvent};
    use crate::services::test_support::ScriptedSession;
    use crate::services::ADD_ED2K_LINK;
    use serde_json::json;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;
    use std::time::Duration;
    use uuid::Uuid;

    const LINK: &str = "ed2k://|file|Some%20File.txt|1024|AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA|/";
    const HASH: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("mulebridge-state-test-{}", Uuid::new_v4()))
            .join("history.db")
    }

    fn settings_for(path: PathBuf) -> Settings {
        Settings {
            history_db: path,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn start_then_complete_flows_through_history() {
        let path = temp_db_path();
        let session = Arc::new(ScriptedSession::new(Duration::from_millis(1)));
        let state =
            BridgeState::bootstrap(settings_for(path.clone()), session.clone(), None).expect("bootstrap");
        let mut events = state.events.subscribe();

        state
            .dispatcher
            .call(ADD_ED2K_LINK, vec![json!(LINK), json!(0), json!("dave")])
            .await
            .expect("start");

        let completed: HashSet<String> = [HASH.to_string()].into_iter().collect();
        let report = state
            .reconciler
            .reconcile(&HashSet::new(), &completed, &HashMap::new())
            .expect("reconcile");
        assert_eq!(report.completed, 1);

        let record = state.db.get_entry(HASH).expect("get").expect("record");
        assert_eq!(record.status, DownloadStatus::Completed);
        assert_eq!(record.username.as_deref(), Some("dave"));

        assert!(matches!(
            events.try_recv().expect("added"),
            HistoryEvent::DownloadAdded { .. }
        ));
        assert!(matches!(
            events.try_recv().expect("finished"),
            HistoryEvent::DownloadFinished { .. }
        ));

        let _ = std::fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[tokio::test]
    async fn reopening_store_keeps_schema_and_rows() {
        let path = temp_db_path();
        let session = Arc::new(ScriptedSession::new(Duration::from_millis(1)));
        {
            let state = BridgeState::bootstrap(settings_for(path.clone()), session.clone(), None)
                .expect("first bootstrap");
            state
                .db
                .add_or_refresh(HASH, "kept.bin", Some(2048), None, "amule", None)
                .expect("add");
        }

        let state =
            BridgeState::bootstrap(settings_for(path.clone()), session, None).expect("second bootstrap");
        {
            let conn = state.db.connection().expect("conn");
            assert_eq!(current_version(&conn).expect("version"), Some(CURRENT_VERSION));
        }
        let record = state.db.get_entry(HASH).expect("get").expect("record");
        assert_eq!(record.filename, "kept.bin");
        assert_eq!(record.size, Some(2048));

        let _ = std::fs::remove_dir_all(path.parent().expect("parent"));
    }
}
