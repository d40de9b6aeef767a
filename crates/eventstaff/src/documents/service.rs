use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::domain::{
    Actor, CompanyId, DocumentId, DocumentKey, DocumentRecord, DocumentStatus, DocumentType,
    FileReference, FreelancerId, ReuseEvent,
};
use super::events::{DocumentEvent, DocumentEventBus};
use super::policy::{CompanyDocumentPolicy, PolicyError, PolicyResolutionError, PolicyResolver};
use super::repository::{DocumentRepository, RepositoryError};

/// Concurrent uploads for the same key retry this many times before giving up.
const UPLOAD_ATTEMPTS: usize = 3;

/// Inbound upload; the file itself was already handed to object storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub company: CompanyId,
    pub freelancer: FreelancerId,
    pub doc_type: DocumentType,
    pub storage_key: String,
}

/// Review state machine over document records.
pub struct DocumentService<R> {
    repository: Arc<R>,
    policies: PolicyResolver<R>,
    events: DocumentEventBus,
}

impl<R> DocumentService<R>
where
    R: DocumentRepository + 'static,
{
    pub fn new(repository: Arc<R>, events: DocumentEventBus) -> Self {
        let policies = PolicyResolver::new(repository.clone());
        Self {
            repository,
            policies,
            events,
        }
    }

    pub fn policies(&self) -> &PolicyResolver<R> {
        &self.policies
    }

    /// Create the record, or reset an existing one to `pending` with the new file.
    pub fn upload(
        &self,
        actor: &Actor,
        request: UploadRequest,
        now: DateTime<Utc>,
    ) -> Result<DocumentRecord, DocumentServiceError> {
        if !actor.can_upload_for(&request.freelancer) {
            return Err(DocumentServiceError::NotAuthorized {
                actor: actor.label(),
                operation: "upload",
            });
        }

        let file = FileReference::from_storage_key(request.storage_key);
        if !file.is_accepted_format() {
            return Err(DocumentServiceError::UnsupportedFile {
                content_type: file.content_type,
            });
        }

        let policy = self.policies.policy(&request.company)?;
        let key = DocumentKey {
            company: request.company,
            freelancer: request.freelancer,
            doc_type: request.doc_type,
        };

        let mut last_seen = None;
        for _ in 0..UPLOAD_ATTEMPTS {
            match self.repository.find_by_key(&key)? {
                None => {
                    let record = DocumentRecord::new_upload(key.clone(), file.clone(), now);
                    match self.repository.insert_document(record) {
                        Ok(stored) => return Ok(self.uploaded(stored)),
                        // Another upload created the row first; re-read it.
                        Err(RepositoryError::Conflict) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                Some(mut record) => {
                    if record.is_valid(now) && !policy.allow_overwrite_active {
                        return Err(DocumentServiceError::DuplicateActiveDocument {
                            document: record.id,
                            doc_type: record.doc_type,
                            expires_at: record.expires_at,
                        });
                    }

                    let previous = record.status;
                    record.reset_for_upload(file.clone(), now);
                    match self.repository.replace_if_status(record.clone(), previous) {
                        Ok(()) => return Ok(self.uploaded(record)),
                        Err(RepositoryError::StatusMismatch { found, .. }) => {
                            last_seen = Some((record.id, found));
                            continue;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }

        match last_seen {
            Some((document, found)) => Err(DocumentServiceError::InvalidState {
                document,
                found,
                operation: "upload",
            }),
            None => Err(RepositoryError::Conflict.into()),
        }
    }

    fn uploaded(&self, record: DocumentRecord) -> DocumentRecord {
        info!(
            document_id = %record.id,
            company_id = %record.company,
            freelancer_id = %record.freelancer,
            doc_type = record.doc_type.code(),
            "document uploaded for review"
        );
        self.events.publish(DocumentEvent::Uploaded(record.clone()));
        record
    }

    /// `pending -> approved`; expiry is computed from the company policy at approval time.
    pub fn approve(
        &self,
        actor: &Actor,
        document: &DocumentId,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<DocumentRecord, DocumentServiceError> {
        let mut record = self.fetch(document)?;
        let reviewer = actor.reviewer_for(&record.company).ok_or_else(|| {
            DocumentServiceError::NotAuthorized {
                actor: actor.label(),
                operation: "approve",
            }
        })?;

        if record.status != DocumentStatus::Pending {
            return Err(DocumentServiceError::InvalidState {
                document: record.id,
                found: record.status,
                operation: "approve",
            });
        }

        let validity_days = self
            .policies
            .get_validity_days(&record.company, record.doc_type)?;
        record.mark_approved(
            reviewer,
            notes.unwrap_or_default().trim().to_string(),
            validity_days,
            now,
        );
        self.transition(record.clone(), DocumentStatus::Pending, "approve")?;

        info!(
            document_id = %record.id,
            company_id = %record.company,
            validity_days,
            expires_at = ?record.expires_at,
            "document approved"
        );
        self.events.publish(DocumentEvent::Approved(record.clone()));
        Ok(record)
    }

    /// `pending|approved -> rejected`; a written reason is mandatory.
    pub fn reject(
        &self,
        actor: &Actor,
        document: &DocumentId,
        notes: &str,
    ) -> Result<DocumentRecord, DocumentServiceError> {
        let mut record = self.fetch(document)?;
        let reviewer = actor.reviewer_for(&record.company).ok_or_else(|| {
            DocumentServiceError::NotAuthorized {
                actor: actor.label(),
                operation: "reject",
            }
        })?;

        let notes = notes.trim();
        if notes.is_empty() {
            return Err(DocumentServiceError::MissingNotes);
        }

        let previous = record.status;
        if !matches!(previous, DocumentStatus::Pending | DocumentStatus::Approved) {
            return Err(DocumentServiceError::InvalidState {
                document: record.id,
                found: previous,
                operation: "reject",
            });
        }

        record.status = DocumentStatus::Rejected;
        record.reviewer = Some(reviewer);
        record.notes = notes.to_string();
        self.transition(record.clone(), previous, "reject")?;

        if previous == DocumentStatus::Approved {
            warn!(
                document_id = %record.id,
                company_id = %record.company,
                "approved document rejected on re-review"
            );
        } else {
            info!(document_id = %record.id, company_id = %record.company, "document rejected");
        }
        self.events.publish(DocumentEvent::Rejected(record.clone()));
        Ok(record)
    }

    fn transition(
        &self,
        record: DocumentRecord,
        expected: DocumentStatus,
        operation: &'static str,
    ) -> Result<(), DocumentServiceError> {
        let document = record.id.clone();
        match self.repository.replace_if_status(record, expected) {
            Ok(()) => Ok(()),
            Err(RepositoryError::StatusMismatch { found, .. }) => {
                debug!(document_id = %document, operation, %found, "lost transition race");
                Err(DocumentServiceError::InvalidState {
                    document,
                    found,
                    operation,
                })
            }
            Err(RepositoryError::NotFound) => Err(DocumentServiceError::NotFound(document)),
            Err(err) => Err(err.into()),
        }
    }

    pub fn set_reuse_eligibility(
        &self,
        actor: &Actor,
        document: &DocumentId,
        eligible: bool,
    ) -> Result<DocumentRecord, DocumentServiceError> {
        let record = self.fetch(document)?;
        if actor.reviewer_for(&record.company).is_none() {
            return Err(DocumentServiceError::NotAuthorized {
                actor: actor.label(),
                operation: "change reuse eligibility of",
            });
        }
        self.repository.set_reuse_eligible(document, eligible)?;
        self.fetch(document)
    }

    pub fn get(&self, document: &DocumentId) -> Result<DocumentRecord, DocumentServiceError> {
        self.fetch(document)
    }

    fn fetch(&self, document: &DocumentId) -> Result<DocumentRecord, DocumentServiceError> {
        self.repository
            .fetch_document(document)?
            .ok_or_else(|| DocumentServiceError::NotFound(document.clone()))
    }

    pub fn documents_for_freelancer(
        &self,
        freelancer: &FreelancerId,
    ) -> Result<Vec<DocumentRecord>, DocumentServiceError> {
        let mut records = self.repository.documents_for_freelancer(freelancer)?;
        records.sort_by(|a, b| (&a.company, a.doc_type).cmp(&(&b.company, b.doc_type)));
        Ok(records)
    }

    /// Review queue for a company, oldest upload first.
    pub fn pending_reviews(
        &self,
        company: &CompanyId,
    ) -> Result<Vec<DocumentRecord>, DocumentServiceError> {
        let mut records = self
            .repository
            .documents_for_company(company, Some(DocumentStatus::Pending))?;
        records.sort_by_key(|record| record.uploaded_at);
        Ok(records)
    }

    pub fn reuse_history(
        &self,
        document: &DocumentId,
    ) -> Result<Vec<ReuseEvent>, DocumentServiceError> {
        self.fetch(document)?;
        Ok(self.repository.reuse_events_for(document)?)
    }

    pub fn update_policy(
        &self,
        actor: &Actor,
        policy: CompanyDocumentPolicy,
    ) -> Result<CompanyDocumentPolicy, DocumentServiceError> {
        if actor.reviewer_for(&policy.company).is_none() {
            return Err(DocumentServiceError::NotAuthorized {
                actor: actor.label(),
                operation: "configure the document policy of",
            });
        }
        Ok(self.policies.update(policy)?)
    }
}

/// Error raised by the document service.
#[derive(Debug, thiserror::Error)]
pub enum DocumentServiceError {
    #[error("an approved {} ({document}) is still valid{}", .doc_type.label(), .expires_at.map(|at| format!(" until {}", at.date_naive())).unwrap_or_default())]
    DuplicateActiveDocument {
        document: DocumentId,
        doc_type: DocumentType,
        expires_at: Option<DateTime<Utc>>,
    },
    #[error("cannot {operation} document {document} while it is {found}")]
    InvalidState {
        document: DocumentId,
        found: DocumentStatus,
        operation: &'static str,
    },
    #[error("a rejection must include notes explaining the reason")]
    MissingNotes,
    #[error("{actor} may not {operation} this document")]
    NotAuthorized {
        actor: &'static str,
        operation: &'static str,
    },
    #[error("document {0} not found")]
    NotFound(DocumentId),
    #[error("unsupported file type {content_type}; upload a PDF or an image")]
    UnsupportedFile { content_type: String },
    #[error(transparent)]
    Configuration(#[from] PolicyError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl DocumentServiceError {
    /// Machine-readable error kind for API consumers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateActiveDocument { .. } => "duplicate_active_document",
            Self::InvalidState { .. } => "invalid_state",
            Self::MissingNotes => "missing_notes",
            Self::NotAuthorized { .. } => "not_authorized",
            Self::NotFound(_) => "not_found",
            Self::UnsupportedFile { .. } => "unsupported_file",
            Self::Configuration(_) => "configuration_error",
            Self::Repository(_) => "repository_error",
        }
    }
}

impl From<PolicyResolutionError> for DocumentServiceError {
    fn from(value: PolicyResolutionError) -> Self {
        match value {
            PolicyResolutionError::Policy(err) => Self::Configuration(err),
            PolicyResolutionError::Repository(err) => Self::Repository(err),
        }
    }
}
