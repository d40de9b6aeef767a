use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use eventstaff::config::StorageConfig;
use eventstaff::documents::{
    DispatchError, NotificationDispatcher, NotificationPriority, NotificationRequest,
    RepositoryError, SqliteDocumentStore,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Stand-in for the email/SMS/push gateways: every request becomes a log line.
#[derive(Default, Clone, Copy)]
pub(crate) struct LoggingNotificationDispatcher;

impl NotificationDispatcher for LoggingNotificationDispatcher {
    fn dispatch(&self, request: NotificationRequest) -> Result<(), DispatchError> {
        let recipient = serde_json::to_string(&request.recipient)
            .map_err(|err| DispatchError::Transport(err.to_string()))?;
        match request.priority {
            NotificationPriority::High => warn!(
                recipient = %recipient,
                document_id = %request.document_id,
                kind = %request.kind.tag(),
                title = %request.title,
                "high priority notification"
            ),
            NotificationPriority::Normal => info!(
                recipient = %recipient,
                document_id = %request.document_id,
                kind = %request.kind.tag(),
                title = %request.title,
                "notification"
            ),
        }
        Ok(())
    }
}

/// Keeps requests in memory so the demo can print what would have been sent.
#[derive(Default, Clone)]
pub(crate) struct InMemoryNotificationOutbox {
    sent: Arc<Mutex<Vec<NotificationRequest>>>,
}

impl NotificationDispatcher for InMemoryNotificationOutbox {
    fn dispatch(&self, request: NotificationRequest) -> Result<(), DispatchError> {
        let mut guard = self
            .sent
            .lock()
            .map_err(|_| DispatchError::Transport("outbox mutex poisoned".to_string()))?;
        guard.push(request);
        Ok(())
    }
}

impl InMemoryNotificationOutbox {
    pub(crate) fn drain(&self) -> Vec<NotificationRequest> {
        self.sent
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default()
    }
}

pub(crate) fn open_store(config: &StorageConfig) -> Result<SqliteDocumentStore, RepositoryError> {
    match &config.database_path {
        Some(path) => {
            info!(path = %path.display(), "opening document database");
            SqliteDocumentStore::open(path)
        }
        None => {
            warn!("DOCS_DATABASE_PATH not set; documents live in memory for this process only");
            SqliteDocumentStore::open_in_memory()
        }
    }
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD ({err})"))
}

/// Midnight UTC of `date`.
pub(crate) fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}
