use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::domain::{DocumentId, DocumentRecord, DocumentStatus};
use super::events::{DocumentEvent, DocumentEventBus};
use super::notifications::{
    NotificationDispatcher, NotificationKey, NotificationKind, NotificationRequest, Recipient,
};
use super::repository::{DocumentRepository, NotificationClaim, RepositoryError, SweepLedger};
use crate::config::SweeperConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPass {
    ExpiryNotice,
    Expiration,
}

impl fmt::Display for SweepPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepPass::ExpiryNotice => f.write_str("expiry_notice"),
            SweepPass::Expiration => f.write_str("expiration"),
        }
    }
}

/// A record the sweeper could not finish; the rest of the batch still ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub document_id: DocumentId,
    pub pass: SweepPass,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Ledger entries written this run, one per record and threshold.
    pub notices_created: usize,
    /// Individual requests handed to the dispatcher.
    pub deliveries: usize,
    pub records_expired: usize,
    pub duplicates_skipped: usize,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    fn fail(&mut self, record: &DocumentRecord, pass: SweepPass, reason: impl ToString) {
        let reason = reason.to_string();
        warn!(
            document_id = %record.id,
            company_id = %record.company,
            freelancer_id = %record.freelancer,
            %pass,
            reason = %reason,
            "sweeper skipped record"
        );
        self.failures.push(SweepFailure {
            document_id: record.id.clone(),
            pass,
            reason,
        });
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("another validity sweep holds the lease")]
    AlreadyRunning,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl SweepError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyRunning => "sweep_already_running",
            Self::Repository(_) => "repository_error",
        }
    }
}

/// Source of wall-clock time for the run lease and ledger timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Periodic batch job: expiry notices at the configured lead times, then expirations.
pub struct ValiditySweeper<R, N> {
    repository: Arc<R>,
    dispatcher: Arc<N>,
    events: DocumentEventBus,
    lead_times_days: Vec<u32>,
    lease_ttl: Duration,
    clock: Clock,
}

impl<R, N> ValiditySweeper<R, N>
where
    R: DocumentRepository + SweepLedger + 'static,
    N: NotificationDispatcher + 'static,
{
    pub fn new(repository: Arc<R>, dispatcher: Arc<N>, config: &SweeperConfig) -> Self {
        Self {
            repository,
            dispatcher,
            events: DocumentEventBus::new(),
            lead_times_days: config.lead_times_days.clone(),
            lease_ttl: Duration::from_std(config.lease_ttl).unwrap_or_else(|_| Duration::hours(1)),
            clock: Arc::new(Utc::now),
        }
    }

    /// Expirations are published on `events` after they are stored.
    pub fn with_events(mut self, events: DocumentEventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Wall-clock time the last successful run finished.
    pub fn last_completed(&self) -> Result<Option<DateTime<Utc>>, SweepError> {
        Ok(self.repository.last_sweep_completed()?)
    }

    /// Runs both passes for the date `as_of`, then retries deliveries still owed.
    ///
    /// The lease is held in wall-clock time, so a backdated run still excludes a
    /// live one. Running again for the same date creates no new notices and
    /// expires nothing twice.
    pub fn run(&self, as_of: DateTime<Utc>) -> Result<SweepReport, SweepError> {
        let holder = format!("sweeper-{}", uuid::Uuid::new_v4().simple());
        if !self
            .repository
            .try_acquire_sweep_lease(&holder, (self.clock)(), self.lease_ttl)?
        {
            info!(%holder, "validity sweep skipped; lease held elsewhere");
            return Err(SweepError::AlreadyRunning);
        }

        let mut report = SweepReport::default();
        let mut attempted = HashSet::new();
        let outcome = self
            .notice_pass(as_of, &mut attempted, &mut report)
            .and_then(|()| self.expiration_pass(as_of, &mut attempted, &mut report))
            .and_then(|()| self.retry_pass(as_of, &attempted, &mut report));

        let completed_at = outcome.is_ok().then(|| (self.clock)());
        if let Err(err) = self.repository.release_sweep_lease(&holder, completed_at) {
            warn!(%holder, error = %err, "could not release sweep lease; it lapses after the ttl");
        }
        outcome?;

        info!(
            as_of = %as_of,
            notices_created = report.notices_created,
            deliveries = report.deliveries,
            records_expired = report.records_expired,
            duplicates_skipped = report.duplicates_skipped,
            failures = report.failures.len(),
            "validity sweep finished"
        );
        Ok(report)
    }

    fn notice_pass(
        &self,
        as_of: DateTime<Utc>,
        attempted: &mut HashSet<NotificationKey>,
        report: &mut SweepReport,
    ) -> Result<(), SweepError> {
        for record in self
            .repository
            .documents_with_status(DocumentStatus::Approved)?
        {
            if record.is_past_expiry(as_of) {
                continue;
            }
            let Some(days) = record
                .days_until_expiry(as_of)
                .and_then(|days| u32::try_from(days).ok())
            else {
                continue;
            };
            if days == 0 || !self.lead_times_days.contains(&days) {
                continue;
            }
            self.notify(
                NotificationKind::ExpiryNotice { days_before: days },
                &record,
                attempted,
                report,
            );
        }
        Ok(())
    }

    fn expiration_pass(
        &self,
        as_of: DateTime<Utc>,
        attempted: &mut HashSet<NotificationKey>,
        report: &mut SweepReport,
    ) -> Result<(), SweepError> {
        for record in self
            .repository
            .documents_with_status(DocumentStatus::Approved)?
        {
            if !record.is_past_expiry(as_of) {
                continue;
            }
            let mut expired = record.clone();
            expired.status = DocumentStatus::Expired;
            match self
                .repository
                .replace_if_status(expired.clone(), DocumentStatus::Approved)
            {
                Ok(()) => {
                    report.records_expired += 1;
                    info!(
                        document_id = %expired.id,
                        company_id = %expired.company,
                        doc_type = expired.doc_type.code(),
                        "document expired"
                    );
                    self.notify(NotificationKind::Expired, &expired, attempted, report);
                    self.events.publish(DocumentEvent::Expired(expired));
                }
                Err(RepositoryError::StatusMismatch { found, .. }) => {
                    debug!(document_id = %record.id, %found, "status changed before expiration");
                }
                Err(err) => report.fail(&record, SweepPass::Expiration, err),
            }
        }
        Ok(())
    }

    /// Redelivers claims an earlier run left unsettled, dropping those that no longer apply.
    fn retry_pass(
        &self,
        as_of: DateTime<Utc>,
        attempted: &HashSet<NotificationKey>,
        report: &mut SweepReport,
    ) -> Result<(), SweepError> {
        let mut completed: HashSet<(String, DocumentId)> = HashSet::new();
        for key in self.repository.pending_notifications()? {
            if attempted.contains(&key) {
                continue;
            }
            let record = self.repository.fetch_document(&key.document_id)?;
            let owed = match (key.kind(), &record) {
                (Some(kind), Some(record)) if still_owed(kind, record, &key, as_of) => {
                    Some((kind, record))
                }
                _ => None,
            };
            let Some((kind, record)) = owed else {
                debug!(document_id = %key.document_id, tag = %key.tag, "dropping notice that no longer applies");
                if let Err(err) = self.repository.settle_notification(&key, (self.clock)()) {
                    warn!(document_id = %key.document_id, tag = %key.tag, error = %err, "could not drop stale notice");
                }
                continue;
            };

            match self.deliver(kind, record, &key) {
                Ok(()) => {
                    report.deliveries += 1;
                    if completed.insert((key.tag.clone(), key.document_id.clone())) {
                        report.notices_created += 1;
                    }
                }
                Err(reason) => report.fail(record, pass_for(kind), reason),
            }
        }
        Ok(())
    }

    /// One notice per record and kind, delivered once to each recipient.
    fn notify(
        &self,
        kind: NotificationKind,
        record: &DocumentRecord,
        attempted: &mut HashSet<NotificationKey>,
        report: &mut SweepReport,
    ) {
        let recipients = [
            Recipient::Company(record.company.clone()),
            Recipient::Freelancer(record.freelancer.clone()),
        ];
        let total = recipients.len();
        let mut delivered = 0;
        let mut already_settled = 0;
        let mut failure = None;

        for recipient in recipients {
            let key = NotificationKey::for_record(kind, record, recipient);
            match self.repository.claim_notification(&key, (self.clock)()) {
                Ok(NotificationClaim::Settled) => {
                    already_settled += 1;
                    continue;
                }
                Ok(NotificationClaim::New | NotificationClaim::Pending) => {}
                Err(err) => {
                    failure = Some(err.to_string());
                    continue;
                }
            }
            attempted.insert(key.clone());
            match self.deliver(kind, record, &key) {
                Ok(()) => delivered += 1,
                Err(reason) => failure = Some(reason),
            }
        }
        report.deliveries += delivered;

        if let Some(reason) = failure {
            report.fail(record, pass_for(kind), reason);
        } else if delivered > 0 {
            report.notices_created += 1;
            debug!(document_id = %record.id, tag = %kind.tag(), delivered, "notice dispatched");
        } else if already_settled == total {
            report.duplicates_skipped += 1;
        }
    }

    /// Dispatches to the key's recipient and settles the claim; an unsettled claim is retried later.
    fn deliver(
        &self,
        kind: NotificationKind,
        record: &DocumentRecord,
        key: &NotificationKey,
    ) -> Result<(), String> {
        let request = match kind {
            NotificationKind::ExpiryNotice { days_before } => {
                NotificationRequest::expiry_notice(record, days_before, key.recipient.clone())
            }
            _ => NotificationRequest::expired(record, key.recipient.clone()),
        };
        self.dispatcher
            .dispatch(request)
            .map_err(|err| err.to_string())?;
        self.repository
            .settle_notification(key, (self.clock)())
            .map_err(|err| format!("delivered but not settled: {err}"))
    }
}

fn pass_for(kind: NotificationKind) -> SweepPass {
    match kind {
        NotificationKind::Expired => SweepPass::Expiration,
        _ => SweepPass::ExpiryNotice,
    }
}

/// A pending claim is still worth delivering only for the same validity period and status.
fn still_owed(
    kind: NotificationKind,
    record: &DocumentRecord,
    key: &NotificationKey,
    as_of: DateTime<Utc>,
) -> bool {
    let same_period = record.expires_at.map(|expiry| expiry.date_naive()) == key.expires_on;
    same_period
        && match kind {
            NotificationKind::Expired => record.status == DocumentStatus::Expired,
            NotificationKind::ExpiryNotice { .. } => {
                record.status == DocumentStatus::Approved && !record.is_past_expiry(as_of)
            }
            _ => false,
        }
}
