use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hiring company (empresa contratante) owning a document policy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CompanyId(pub String);

/// Freelancer who uploads documents and applies to vagas.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FreelancerId(pub String);

/// Company user who reviewed a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReviewerId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn generate() -> Self {
        Self(format!("doc-{}", uuid::Uuid::new_v4().simple()))
    }
}

/// Hiring or application context a reused document was accepted into.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApplicationRef(pub String);

macro_rules! display_id {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        })*
    };
}

display_id!(CompanyId, FreelancerId, ReviewerId, DocumentId, ApplicationRef);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Rg,
    Cpf,
    WorkBooklet,
    ProofOfResidence,
    MilitaryCertificate,
    EducationProof,
    ProfessionalCertificate,
    Other,
}

impl DocumentType {
    pub const fn ordered() -> [Self; 8] {
        [
            Self::Rg,
            Self::Cpf,
            Self::WorkBooklet,
            Self::ProofOfResidence,
            Self::MilitaryCertificate,
            Self::EducationProof,
            Self::ProfessionalCertificate,
            Self::Other,
        ]
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Rg => "RG",
            Self::Cpf => "CPF",
            Self::WorkBooklet => "Carteira de Trabalho",
            Self::ProofOfResidence => "Comprovante de Residência",
            Self::MilitaryCertificate => "Certificado de Reservista",
            Self::EducationProof => "Comprovante de Escolaridade",
            Self::ProfessionalCertificate => "Certificado Profissional",
            Self::Other => "Outro",
        }
    }

    /// Stable storage code, matching the serde representation.
    pub const fn code(self) -> &'static str {
        match self {
            Self::Rg => "rg",
            Self::Cpf => "cpf",
            Self::WorkBooklet => "work_booklet",
            Self::ProofOfResidence => "proof_of_residence",
            Self::MilitaryCertificate => "military_certificate",
            Self::EducationProof => "education_proof",
            Self::ProfessionalCertificate => "professional_certificate",
            Self::Other => "other",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ordered()
            .into_iter()
            .find(|doc_type| doc_type.code() == code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl DocumentStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        [Self::Pending, Self::Approved, Self::Rejected, Self::Expired]
            .into_iter()
            .find(|status| status.label() == label)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Opaque pointer to the uploaded binary; storage itself lives elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    pub storage_key: String,
    pub content_type: String,
}

impl FileReference {
    /// Builds a reference, guessing the content type from the storage key's extension.
    pub fn from_storage_key(storage_key: impl Into<String>) -> Self {
        let storage_key = storage_key.into();
        let content_type = mime_guess::from_path(&storage_key)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Self {
            storage_key,
            content_type,
        }
    }

    /// Scans and photos only.
    pub fn is_accepted_format(&self) -> bool {
        self.content_type == "application/pdf" || self.content_type.starts_with("image/")
    }
}

/// Natural key of a document: one record per (company, freelancer, type).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    pub company: CompanyId,
    pub freelancer: FreelancerId,
    pub doc_type: DocumentType,
}

/// One document of one type, owned by one freelancer, scoped to one company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub company: CompanyId,
    pub freelancer: FreelancerId,
    pub doc_type: DocumentType,
    pub status: DocumentStatus,
    pub file: FileReference,
    pub uploaded_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub reviewer: Option<ReviewerId>,
    pub notes: String,
    pub reuse_eligible: bool,
    pub reuse_count: u32,
}

impl DocumentRecord {
    pub fn new_upload(key: DocumentKey, file: FileReference, now: DateTime<Utc>) -> Self {
        Self {
            id: DocumentId::generate(),
            company: key.company,
            freelancer: key.freelancer,
            doc_type: key.doc_type,
            status: DocumentStatus::Pending,
            file,
            uploaded_at: now,
            expires_at: None,
            approved_at: None,
            reviewer: None,
            notes: String::new(),
            reuse_eligible: true,
            reuse_count: 0,
        }
    }

    pub fn key(&self) -> DocumentKey {
        DocumentKey {
            company: self.company.clone(),
            freelancer: self.freelancer.clone(),
            doc_type: self.doc_type,
        }
    }

    /// Approved and not past its expiry.
    pub fn is_valid(&self, as_of: DateTime<Utc>) -> bool {
        self.status == DocumentStatus::Approved
            && self.expires_at.map_or(true, |expiry| as_of <= expiry)
    }

    pub fn is_reusable(&self, as_of: DateTime<Utc>) -> bool {
        self.is_valid(as_of) && self.reuse_eligible
    }

    /// Whole calendar days between `as_of` and the expiry date, if any.
    pub fn days_until_expiry(&self, as_of: DateTime<Utc>) -> Option<i64> {
        self.expires_at
            .map(|expiry| (expiry.date_naive() - as_of.date_naive()).num_days())
    }

    pub fn is_past_expiry(&self, as_of: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expiry| expiry < as_of)
    }

    /// Returns the record to `pending` for a fresh upload, keeping its identity and counters.
    pub(crate) fn reset_for_upload(&mut self, file: FileReference, now: DateTime<Utc>) {
        self.status = DocumentStatus::Pending;
        self.file = file;
        self.uploaded_at = now;
        self.expires_at = None;
        self.approved_at = None;
        self.reviewer = None;
        self.notes.clear();
    }

    pub(crate) fn mark_approved(
        &mut self,
        reviewer: ReviewerId,
        notes: String,
        validity_days: u32,
        now: DateTime<Utc>,
    ) {
        self.status = DocumentStatus::Approved;
        self.approved_at = Some(now);
        self.expires_at = Some(now + Duration::days(i64::from(validity_days)));
        self.reviewer = Some(reviewer);
        self.notes = notes;
    }
}

/// Evidence that an approved record satisfied a requirement of another application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReuseEvent {
    pub source_document: DocumentId,
    pub application: ApplicationRef,
    pub reused_at: DateTime<Utc>,
    pub status_at_reuse: DocumentStatus,
}

/// An application accepted by the hiring flow, stored with its reuse events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedApplication {
    pub application: ApplicationRef,
    pub company: CompanyId,
    pub freelancer: FreelancerId,
    pub accepted_at: DateTime<Utc>,
    pub complete_documentation: bool,
}

/// Authenticated caller, classified once when the request arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    SystemAdmin { user: String },
    CompanyUser { company: CompanyId, user: String },
    Freelancer { freelancer: FreelancerId },
    Unclassified,
}

impl Actor {
    /// Reviewer identity when the actor may review documents of `company`.
    pub fn reviewer_for(&self, company: &CompanyId) -> Option<ReviewerId> {
        match self {
            Actor::SystemAdmin { user } => Some(ReviewerId(user.clone())),
            Actor::CompanyUser { company: own, user } if own == company => {
                Some(ReviewerId(user.clone()))
            }
            _ => None,
        }
    }

    pub fn can_upload_for(&self, freelancer: &FreelancerId) -> bool {
        match self {
            Actor::SystemAdmin { .. } => true,
            Actor::Freelancer { freelancer: own } => own == freelancer,
            _ => false,
        }
    }

    pub fn can_view_freelancer(&self, freelancer: &FreelancerId) -> bool {
        match self {
            Actor::SystemAdmin { .. } | Actor::CompanyUser { .. } => true,
            Actor::Freelancer { freelancer: own } => own == freelancer,
            Actor::Unclassified => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Actor::SystemAdmin { .. } => "system_admin",
            Actor::CompanyUser { .. } => "company_user",
            Actor::Freelancer { .. } => "freelancer",
            Actor::Unclassified => "unclassified",
        }
    }
}
