use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::domain::{
    AcceptedApplication, ApplicationRef, CompanyId, DocumentId, DocumentRecord, DocumentStatus,
    DocumentType, FreelancerId, ReuseEvent,
};
use super::events::{DocumentEvent, DocumentEventBus};
use super::policy::{CompanyDocumentPolicy, PolicyResolver, RequirementScope};
use super::repository::{DocumentRepository, RepositoryError};

/// Bucket a required document type falls into for one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentClassification {
    ApprovedAndValid,
    Expired,
    Rejected,
    Pending,
    Missing,
}

/// Classifies an existing record; an approved record past its expiry counts as expired
/// even before the sweeper has flipped it.
pub fn classify(record: &DocumentRecord, as_of: DateTime<Utc>) -> DocumentClassification {
    match record.status {
        DocumentStatus::Approved if record.is_valid(as_of) => {
            DocumentClassification::ApprovedAndValid
        }
        DocumentStatus::Approved | DocumentStatus::Expired => DocumentClassification::Expired,
        DocumentStatus::Rejected => DocumentClassification::Rejected,
        DocumentStatus::Pending => DocumentClassification::Pending,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequirementCheck {
    pub doc_type: DocumentType,
    pub classification: DocumentClassification,
    /// Record that decided the classification, if any exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<DocumentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_company: Option<CompanyId>,
    /// Satisfied by a record another company approved.
    pub cross_company: bool,
}

impl RequirementCheck {
    fn satisfied(&self) -> bool {
        self.classification == DocumentClassification::ApprovedAndValid
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentEvaluation {
    pub freelancer: FreelancerId,
    pub company: CompanyId,
    pub as_of: DateTime<Utc>,
    pub checks: Vec<RequirementCheck>,
}

impl DocumentEvaluation {
    pub fn classifications(&self) -> BTreeMap<DocumentType, DocumentClassification> {
        self.checks
            .iter()
            .map(|check| (check.doc_type, check.classification))
            .collect()
    }

    pub fn all_valid(&self) -> bool {
        self.checks.iter().all(RequirementCheck::satisfied)
    }

    /// True when every requirement is satisfied or incomplete documentation is explicitly allowed.
    pub fn can_apply(&self, allow_incomplete: bool) -> bool {
        self.all_valid() || allow_incomplete
    }

    pub fn unsatisfied(&self) -> Vec<DocumentType> {
        self.checks
            .iter()
            .filter(|check| !check.satisfied())
            .map(|check| check.doc_type)
            .collect()
    }

    fn reused_documents(&self) -> Vec<DocumentId> {
        let mut sources: Vec<DocumentId> = Vec::new();
        for check in self.checks.iter().filter(|check| check.satisfied()) {
            if let Some(source) = &check.source {
                if !sources.contains(source) {
                    sources.push(source.clone());
                }
            }
        }
        sources
    }
}

/// Evaluation plus the decision, as returned to the hiring flow before it applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationCheck {
    pub required: Vec<DocumentType>,
    pub evaluation: DocumentEvaluation,
    pub allow_incomplete: bool,
    pub can_apply: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRequest {
    pub application: ApplicationRef,
    pub freelancer: FreelancerId,
    pub company: CompanyId,
    #[serde(default)]
    pub scope: RequirementScope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationOutcome {
    pub acceptance: AcceptedApplication,
    pub evaluation: DocumentEvaluation,
    pub reuse_events: Vec<ReuseEvent>,
}

/// Decides whether existing documents cover an application and records their reuse.
pub struct ReuseEvaluator<R> {
    repository: Arc<R>,
    policies: PolicyResolver<R>,
    events: DocumentEventBus,
}

impl<R> ReuseEvaluator<R>
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

    /// Classifies each required type exactly once.
    pub fn evaluate(
        &self,
        freelancer: &FreelancerId,
        company: &CompanyId,
        required: &[DocumentType],
        as_of: DateTime<Utc>,
    ) -> Result<DocumentEvaluation, ReuseError> {
        let policy = self.policies.policy(company)?;
        self.evaluate_with(&policy, freelancer, required, as_of)
    }

    fn evaluate_with(
        &self,
        policy: &CompanyDocumentPolicy,
        freelancer: &FreelancerId,
        required: &[DocumentType],
        as_of: DateTime<Utc>,
    ) -> Result<DocumentEvaluation, ReuseError> {
        let company = &policy.company;
        let records = self.repository.documents_for_freelancer(freelancer)?;

        let mut checks: Vec<RequirementCheck> = Vec::with_capacity(required.len());
        for &doc_type in required {
            if checks.iter().any(|check| check.doc_type == doc_type) {
                continue;
            }

            let local = records
                .iter()
                .find(|record| &record.company == company && record.doc_type == doc_type);
            let mut check = RequirementCheck {
                doc_type,
                classification: local.map_or(DocumentClassification::Missing, |record| {
                    classify(record, as_of)
                }),
                source: local.map(|record| record.id.clone()),
                source_company: local.map(|record| record.company.clone()),
                cross_company: false,
            };

            let replaceable = matches!(
                check.classification,
                DocumentClassification::Missing | DocumentClassification::Expired
            );
            if replaceable && policy.accepts_external_documents {
                // Longest remaining validity wins; no row is created for this company.
                let external = records
                    .iter()
                    .filter(|record| {
                        &record.company != company
                            && record.doc_type == doc_type
                            && record.is_reusable(as_of)
                    })
                    .max_by_key(|record| (record.expires_at.is_none(), record.expires_at));
                if let Some(record) = external {
                    debug!(
                        freelancer_id = %freelancer,
                        company_id = %company,
                        source_company = %record.company,
                        doc_type = doc_type.code(),
                        "requirement satisfied by another company's document"
                    );
                    check = RequirementCheck {
                        doc_type,
                        classification: DocumentClassification::ApprovedAndValid,
                        source: Some(record.id.clone()),
                        source_company: Some(record.company.clone()),
                        cross_company: true,
                    };
                }
            }

            checks.push(check);
        }

        Ok(DocumentEvaluation {
            freelancer: freelancer.clone(),
            company: company.clone(),
            as_of,
            checks,
        })
    }

    /// Resolves the requirement list for `scope` and evaluates it without writing anything.
    pub fn check(
        &self,
        freelancer: &FreelancerId,
        company: &CompanyId,
        scope: &RequirementScope,
        as_of: DateTime<Utc>,
    ) -> Result<ApplicationCheck, ReuseError> {
        let policy = self.policies.policy(company)?;
        let required = scope.resolve(&policy);
        let evaluation = self.evaluate_with(&policy, freelancer, &required, as_of)?;
        let allow_incomplete = scope.allows_incomplete(&policy);
        Ok(ApplicationCheck {
            can_apply: evaluation.can_apply(allow_incomplete),
            required,
            evaluation,
            allow_incomplete,
        })
    }

    /// Accepts the application and records one reuse event per satisfying record, atomically.
    pub fn apply(
        &self,
        request: ApplicationRequest,
        now: DateTime<Utc>,
    ) -> Result<ApplicationOutcome, ReuseError> {
        let ApplicationCheck {
            evaluation,
            can_apply,
            ..
        } = self.check(&request.freelancer, &request.company, &request.scope, now)?;

        if !can_apply {
            info!(
                application = %request.application,
                freelancer_id = %request.freelancer,
                company_id = %request.company,
                unsatisfied = ?evaluation.unsatisfied(),
                "application blocked by incomplete documentation"
            );
            return Err(ReuseError::IncompleteDocumentation {
                evaluation: Box::new(evaluation),
            });
        }

        if self
            .repository
            .fetch_application(&request.application)?
            .is_some()
        {
            return Err(ReuseError::AlreadyApplied(request.application));
        }

        let reuse_events: Vec<ReuseEvent> = evaluation
            .reused_documents()
            .into_iter()
            .map(|source_document| ReuseEvent {
                source_document,
                application: request.application.clone(),
                reused_at: now,
                status_at_reuse: DocumentStatus::Approved,
            })
            .collect();
        let acceptance = AcceptedApplication {
            application: request.application.clone(),
            company: request.company.clone(),
            freelancer: request.freelancer.clone(),
            accepted_at: now,
            complete_documentation: evaluation.all_valid(),
        };

        match self
            .repository
            .commit_application(acceptance.clone(), reuse_events.clone())
        {
            Ok(()) => {}
            Err(RepositoryError::Conflict) => {
                return Err(ReuseError::AlreadyApplied(request.application))
            }
            Err(RepositoryError::StatusMismatch { .. }) => {
                return Err(ReuseError::DocumentChanged(request.application))
            }
            Err(err) => return Err(err.into()),
        }

        info!(
            application = %acceptance.application,
            freelancer_id = %acceptance.freelancer,
            company_id = %acceptance.company,
            reused = reuse_events.len(),
            complete = acceptance.complete_documentation,
            "application accepted"
        );
        for event in &reuse_events {
            self.events.publish(DocumentEvent::Reused(event.clone()));
        }

        Ok(ApplicationOutcome {
            acceptance,
            evaluation,
            reuse_events,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReuseError {
    #[error("documentation incomplete: {:?} not approved and valid", .evaluation.unsatisfied())]
    IncompleteDocumentation { evaluation: Box<DocumentEvaluation> },
    #[error("application {0} was already accepted")]
    AlreadyApplied(ApplicationRef),
    #[error("a document changed status while application {0} was being accepted")]
    DocumentChanged(ApplicationRef),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ReuseError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IncompleteDocumentation { .. } => "incomplete_documentation",
            Self::AlreadyApplied(_) => "already_applied",
            Self::DocumentChanged(_) => "document_changed",
            Self::Repository(_) => "repository_error",
        }
    }
}
