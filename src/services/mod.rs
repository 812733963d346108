pub mod dispatcher;
pub mod events;
pub mod interceptor;
pub mod reconciler;
pub mod session;
pub mod snapshot;
#[cfg(test)]
pub(crate) mod test_support;

pub use dispatcher::{CallDispatcher, CallHook, CallOutcome, DispatchTable, FailurePolicy, HookContext};
pub use events::{EventBus, EventSink};
pub use interceptor::{
    FileInfoLookup, HistoryInterceptor, ADD_ED2K_LINK, DELETE_DOWNLOAD, DOWNLOAD_SEARCH_RESULT,
};
pub use reconciler::{ReconcileReport, Reconciler};
pub use session::{CallArgs, ProtocolSession};
pub use snapshot::SnapshotMerger;
