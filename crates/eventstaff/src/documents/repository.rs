use chrono::{DateTime, Duration, Utc};

use super::domain::{
    AcceptedApplication, ApplicationRef, CompanyId, DocumentId, DocumentKey, DocumentRecord,
    DocumentStatus, FreelancerId, ReuseEvent,
};
use super::notifications::NotificationKey;
use super::policy::CompanyDocumentPolicy;

/// Storage abstraction for policies, document records, and reuse history.
///
/// Each method is its own transaction. Status changes go through
/// [`DocumentRepository::replace_if_status`], which only writes when the stored
/// status still matches, so concurrent reviewers cannot both win.
pub trait DocumentRepository: Send + Sync {
    fn fetch_policy(
        &self,
        company: &CompanyId,
    ) -> Result<Option<CompanyDocumentPolicy>, RepositoryError>;

    /// Stores `policy` unless the company already has one; returns whichever is stored.
    fn insert_policy_if_absent(
        &self,
        policy: CompanyDocumentPolicy,
    ) -> Result<CompanyDocumentPolicy, RepositoryError>;

    fn save_policy(&self, policy: CompanyDocumentPolicy) -> Result<(), RepositoryError>;

    /// Fails with [`RepositoryError::Conflict`] when the natural key is taken.
    fn insert_document(&self, record: DocumentRecord) -> Result<DocumentRecord, RepositoryError>;

    fn fetch_document(&self, id: &DocumentId) -> Result<Option<DocumentRecord>, RepositoryError>;

    fn find_by_key(&self, key: &DocumentKey) -> Result<Option<DocumentRecord>, RepositoryError>;

    /// Compare-and-set on the stored status.
    fn replace_if_status(
        &self,
        record: DocumentRecord,
        expected: DocumentStatus,
    ) -> Result<(), RepositoryError>;

    /// Flips the reuse flag without touching the status.
    fn set_reuse_eligible(&self, id: &DocumentId, eligible: bool) -> Result<(), RepositoryError>;

    fn documents_for_freelancer(
        &self,
        freelancer: &FreelancerId,
    ) -> Result<Vec<DocumentRecord>, RepositoryError>;

    fn documents_for_company(
        &self,
        company: &CompanyId,
        status: Option<DocumentStatus>,
    ) -> Result<Vec<DocumentRecord>, RepositoryError>;

    fn documents_with_status(
        &self,
        status: DocumentStatus,
    ) -> Result<Vec<DocumentRecord>, RepositoryError>;

    /// Stores the acceptance, every reuse event, and the counter increments atomically.
    ///
    /// Nothing is written when the application already exists or any
    /// (document, application) pair was recorded before.
    fn commit_application(
        &self,
        acceptance: AcceptedApplication,
        reuse: Vec<ReuseEvent>,
    ) -> Result<(), RepositoryError>;

    fn fetch_application(
        &self,
        application: &ApplicationRef,
    ) -> Result<Option<AcceptedApplication>, RepositoryError>;

    fn reuse_events_for(&self, document: &DocumentId) -> Result<Vec<ReuseEvent>, RepositoryError>;
}

/// Outcome of claiming a notice for one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationClaim {
    /// First claim; the caller must deliver and then settle it.
    New,
    /// Claimed earlier but never settled, so delivery is still owed.
    Pending,
    /// Already delivered or dropped.
    Settled,
}

/// Bookkeeping for the validity sweeper: run lease and notification dedupe.
///
/// Lease timestamps are wall-clock times, independent of the date a sweep evaluates.
pub trait SweepLedger: Send + Sync {
    /// Grants the lease when nobody holds it or the previous holder's lease has lapsed.
    fn try_acquire_sweep_lease(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, RepositoryError>;

    /// Drops the lease; a `completed_at` also moves the last-finished-run marker.
    fn release_sweep_lease(
        &self,
        holder: &str,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError>;

    fn last_sweep_completed(&self) -> Result<Option<DateTime<Utc>>, RepositoryError>;

    fn claim_notification(
        &self,
        key: &NotificationKey,
        now: DateTime<Utc>,
    ) -> Result<NotificationClaim, RepositoryError>;

    /// Marks a claim as done so it is never delivered again.
    fn settle_notification(
        &self,
        key: &NotificationKey,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Claims still owed a delivery, oldest first.
    fn pending_notifications(&self) -> Result<Vec<NotificationKey>, RepositoryError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("stored status is {found}, expected {expected}")]
    StatusMismatch {
        expected: DocumentStatus,
        found: DocumentStatus,
    },
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}
