//! Document validity and reuse.
//!
//! Records move `pending -> approved -> expired` or `pending -> rejected -> pending`,
//! with `approved -> rejected` allowed on re-review. Every status write is a
//! compare-and-set against the status the caller read, so concurrent reviewers
//! cannot both win. Side effects such as notifications hang off the
//! [`DocumentEventBus`] instead of storage hooks.

pub mod domain;
pub mod events;
pub mod notifications;
pub mod policy;
pub mod repository;
pub mod reuse;
pub mod router;
pub mod service;
pub mod sqlite;
pub mod store;
pub mod sweeper;

#[cfg(test)]
mod tests;

pub use domain::{
    AcceptedApplication, Actor, ApplicationRef, CompanyId, DocumentId, DocumentKey,
    DocumentRecord, DocumentStatus, DocumentType, FileReference, FreelancerId, ReuseEvent,
    ReviewerId,
};
pub use events::{
    DocumentEvent, DocumentEventBus, DocumentEventHandler, EventError, TransitionNotifier,
};
pub use notifications::{
    DispatchError, NotificationDispatcher, NotificationKey, NotificationKind,
    NotificationPriority, NotificationRequest, Recipient,
};
pub use policy::{
    CompanyDocumentPolicy, PolicyError, PolicyResolutionError, PolicyResolver, RequirementScope,
    TypeRequirement, DEFAULT_VALIDITY_DAYS,
};
pub use repository::{DocumentRepository, NotificationClaim, RepositoryError, SweepLedger};
pub use reuse::{
    classify, ApplicationCheck, ApplicationOutcome, ApplicationRequest, DocumentClassification,
    DocumentEvaluation, RequirementCheck, ReuseError, ReuseEvaluator,
};
pub use router::{actor_from_headers, document_router, DocumentApi};
pub use service::{DocumentService, DocumentServiceError, UploadRequest};
pub use sqlite::SqliteDocumentStore;
pub use store::InMemoryDocumentStore;
pub use sweeper::{Clock, SweepError, SweepFailure, SweepPass, SweepReport, ValiditySweeper};
