use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::domain::{CompanyId, DocumentType};
use super::repository::{DocumentRepository, RepositoryError};

pub const DEFAULT_VALIDITY_DAYS: i32 = 365;

/// Per-type dials of a company's document policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRequirement {
    pub mandatory: bool,
    /// Overrides the company default when set.
    #[serde(default)]
    pub validity_days: Option<i32>,
}

/// Which documents a company demands and for how long an approval holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyDocumentPolicy {
    pub company: CompanyId,
    pub accepts_external_documents: bool,
    pub default_validity_days: i32,
    pub requirements: BTreeMap<DocumentType, TypeRequirement>,
    pub allow_overwrite_active: bool,
    pub allow_apply_without_documents: bool,
}

impl CompanyDocumentPolicy {
    pub fn default_for(company: CompanyId) -> Self {
        let requirements = DocumentType::ordered()
            .into_iter()
            .map(|doc_type| {
                let mandatory = matches!(doc_type, DocumentType::Rg | DocumentType::Cpf);
                (
                    doc_type,
                    TypeRequirement {
                        mandatory,
                        validity_days: None,
                    },
                )
            })
            .collect();

        Self {
            company,
            accepts_external_documents: false,
            default_validity_days: DEFAULT_VALIDITY_DAYS,
            requirements,
            allow_overwrite_active: false,
            allow_apply_without_documents: false,
        }
    }

    /// Mandatory types in canonical order.
    pub fn mandatory_types(&self) -> Vec<DocumentType> {
        DocumentType::ordered()
            .into_iter()
            .filter(|doc_type| {
                self.requirements
                    .get(doc_type)
                    .map_or(false, |requirement| requirement.mandatory)
            })
            .collect()
    }

    pub fn validity_days(&self, doc_type: DocumentType) -> Result<u32, PolicyError> {
        let configured = self
            .requirements
            .get(&doc_type)
            .and_then(|requirement| requirement.validity_days)
            .unwrap_or(self.default_validity_days);

        u32::try_from(configured)
            .ok()
            .filter(|days| *days > 0)
            .ok_or(PolicyError::NonPositiveValidity {
                company: self.company.clone(),
                doc_type: Some(doc_type),
                configured,
            })
    }

    /// Every period that could ever be resolved must be positive.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.default_validity_days <= 0 {
            return Err(PolicyError::NonPositiveValidity {
                company: self.company.clone(),
                doc_type: None,
                configured: self.default_validity_days,
            });
        }
        for doc_type in DocumentType::ordered() {
            self.validity_days(doc_type)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("company {company} configures a non-positive validity period ({configured} days) for {}", .doc_type.map_or("its default", |doc_type| doc_type.label()))]
    NonPositiveValidity {
        company: CompanyId,
        doc_type: Option<DocumentType>,
        configured: i32,
    },
}

/// Requirement lists declared below the company level for one application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementScope {
    #[serde(default)]
    pub vaga_types: Vec<DocumentType>,
    #[serde(default)]
    pub event_types: Vec<DocumentType>,
    /// Vaga-level "apply without complete documentation" switch; `None` defers to the company.
    #[serde(default)]
    pub allow_apply_without_documents: Option<bool>,
}

impl RequirementScope {
    /// First non-empty list wins: vaga, then event, then the company's mandatory types.
    ///
    /// An empty vaga list defers to the event; it never means "nothing required".
    pub fn resolve(&self, policy: &CompanyDocumentPolicy) -> Vec<DocumentType> {
        let chosen = if !self.vaga_types.is_empty() {
            debug!(company = %policy.company, "using vaga-level document requirements");
            self.vaga_types.clone()
        } else if !self.event_types.is_empty() {
            debug!(company = %policy.company, "using event-level document requirements");
            self.event_types.clone()
        } else {
            policy.mandatory_types()
        };

        let mut seen = Vec::with_capacity(chosen.len());
        for doc_type in chosen {
            if !seen.contains(&doc_type) {
                seen.push(doc_type);
            }
        }
        seen
    }

    pub fn allows_incomplete(&self, policy: &CompanyDocumentPolicy) -> bool {
        self.allow_apply_without_documents
            .unwrap_or(policy.allow_apply_without_documents)
    }
}

/// Resolves company policies, creating the default row on first access.
pub struct PolicyResolver<R> {
    repository: Arc<R>,
}

impl<R> Clone for PolicyResolver<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
        }
    }
}

impl<R> PolicyResolver<R>
where
    R: DocumentRepository + 'static,
{
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }

    pub fn policy(&self, company: &CompanyId) -> Result<CompanyDocumentPolicy, RepositoryError> {
        if let Some(policy) = self.repository.fetch_policy(company)? {
            return Ok(policy);
        }

        let policy = self
            .repository
            .insert_policy_if_absent(CompanyDocumentPolicy::default_for(company.clone()))?;
        info!(company = %company, "created default document policy");
        Ok(policy)
    }

    pub fn get_mandatory_types(
        &self,
        company: &CompanyId,
    ) -> Result<Vec<DocumentType>, RepositoryError> {
        Ok(self.policy(company)?.mandatory_types())
    }

    pub fn get_validity_days(
        &self,
        company: &CompanyId,
        doc_type: DocumentType,
    ) -> Result<u32, PolicyResolutionError> {
        let policy = self.policy(company)?;
        Ok(policy.validity_days(doc_type)?)
    }

    pub fn update(
        &self,
        policy: CompanyDocumentPolicy,
    ) -> Result<CompanyDocumentPolicy, PolicyResolutionError> {
        policy.validate()?;
        self.repository.save_policy(policy.clone())?;
        info!(company = %policy.company, "document policy updated");
        Ok(policy)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyResolutionError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
