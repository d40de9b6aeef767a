use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::domain::{CompanyId, DocumentId, DocumentRecord, FreelancerId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    Company(CompanyId),
    Freelancer(FreelancerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ExpiryNotice { days_before: u32 },
    Expired,
    Uploaded,
    Approved,
    Rejected,
}

impl NotificationKind {
    /// Tag used in dedupe keys and by delivery templates.
    pub fn tag(self) -> String {
        match self {
            Self::ExpiryNotice { days_before } => format!("{days_before}-day"),
            Self::Expired => "expired".to_string(),
            Self::Uploaded => "uploaded".to_string(),
            Self::Approved => "approved".to_string(),
            Self::Rejected => "rejected".to_string(),
        }
    }

    /// Inverse of [`NotificationKind::tag`].
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "expired" => Some(Self::Expired),
            "uploaded" => Some(Self::Uploaded),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            other => other
                .strip_suffix("-day")
                .and_then(|days| days.parse().ok())
                .map(|days_before| Self::ExpiryNotice { days_before }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Normal,
    High,
}

/// Abstract delivery request; email, SMS, and push live behind the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub recipient: Recipient,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub priority: NotificationPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub document_id: DocumentId,
}

impl NotificationRequest {
    pub fn expiry_notice(record: &DocumentRecord, days_before: u32, recipient: Recipient) -> Self {
        let subject = subject_line(record, &recipient);
        let plural = if days_before == 1 { "" } else { "s" };
        Self {
            title: format!("{} expires in {days_before} day{plural}", record.doc_type.label()),
            body: format!(
                "{subject} expires on {}. Upload a renewed copy to keep applying to vagas.",
                expiry_label(record)
            ),
            priority: if days_before <= 7 {
                NotificationPriority::High
            } else {
                NotificationPriority::Normal
            },
            link: Some(document_link(record)),
            document_id: record.id.clone(),
            kind: NotificationKind::ExpiryNotice { days_before },
            recipient,
        }
    }

    pub fn expired(record: &DocumentRecord, recipient: Recipient) -> Self {
        let subject = subject_line(record, &recipient);
        Self {
            title: format!("{} expired", record.doc_type.label()),
            body: format!(
                "{subject} expired on {} and no longer satisfies vaga requirements.",
                expiry_label(record)
            ),
            priority: NotificationPriority::High,
            link: Some(document_link(record)),
            document_id: record.id.clone(),
            kind: NotificationKind::Expired,
            recipient,
        }
    }

    pub fn uploaded(record: &DocumentRecord) -> Self {
        Self {
            title: format!("{} awaiting review", record.doc_type.label()),
            body: format!(
                "Freelancer {} uploaded {} for review.",
                record.freelancer,
                record.doc_type.label()
            ),
            priority: NotificationPriority::Normal,
            link: Some(document_link(record)),
            document_id: record.id.clone(),
            kind: NotificationKind::Uploaded,
            recipient: Recipient::Company(record.company.clone()),
        }
    }

    pub fn approved(record: &DocumentRecord) -> Self {
        Self {
            title: format!("{} approved", record.doc_type.label()),
            body: format!(
                "Your {} was approved by {} and is valid until {}.",
                record.doc_type.label(),
                record.company,
                expiry_label(record)
            ),
            priority: NotificationPriority::Normal,
            link: Some(document_link(record)),
            document_id: record.id.clone(),
            kind: NotificationKind::Approved,
            recipient: Recipient::Freelancer(record.freelancer.clone()),
        }
    }

    pub fn rejected(record: &DocumentRecord) -> Self {
        Self {
            title: format!("{} rejected", record.doc_type.label()),
            body: format!(
                "Your {} was rejected by {}: {}. Please upload a new copy.",
                record.doc_type.label(),
                record.company,
                record.notes
            ),
            priority: NotificationPriority::High,
            link: Some(document_link(record)),
            document_id: record.id.clone(),
            kind: NotificationKind::Rejected,
            recipient: Recipient::Freelancer(record.freelancer.clone()),
        }
    }
}

fn subject_line(record: &DocumentRecord, recipient: &Recipient) -> String {
    match recipient {
        Recipient::Freelancer(_) => format!("Your {}", record.doc_type.label()),
        Recipient::Company(_) => format!(
            "The {} of freelancer {}",
            record.doc_type.label(),
            record.freelancer
        ),
    }
}

fn expiry_label(record: &DocumentRecord) -> String {
    record
        .expires_at
        .map(|expiry| expiry.date_naive().to_string())
        .unwrap_or_else(|| "no expiry".to_string())
}

fn document_link(record: &DocumentRecord) -> String {
    format!("/api/v1/documents/{}", record.id)
}

/// Dedupe key for sweeper notices: one per tag, record, validity period and recipient.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationKey {
    pub tag: String,
    pub document_id: DocumentId,
    pub expires_on: Option<NaiveDate>,
    pub recipient: Recipient,
}

impl NotificationKey {
    pub fn for_record(kind: NotificationKind, record: &DocumentRecord, recipient: Recipient) -> Self {
        Self {
            tag: kind.tag(),
            document_id: record.id.clone(),
            expires_on: record.expires_at.map(|expiry| expiry.date_naive()),
            recipient,
        }
    }

    pub fn kind(&self) -> Option<NotificationKind> {
        NotificationKind::from_tag(&self.tag)
    }
}

/// Outbound notification hook (email, SMS, or push adapters).
pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, request: NotificationRequest) -> Result<(), DispatchError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("notification transport unavailable: {0}")]
    Transport(String),
}
