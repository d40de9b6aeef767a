use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

use super::domain::{
    AcceptedApplication, ApplicationRef, CompanyId, DocumentId, DocumentKey, DocumentRecord,
    DocumentStatus, FreelancerId, ReuseEvent,
};
use super::notifications::NotificationKey;
use super::policy::CompanyDocumentPolicy;
use super::repository::{DocumentRepository, NotificationClaim, RepositoryError, SweepLedger};

#[derive(Default)]
struct StoreState {
    policies: HashMap<CompanyId, CompanyDocumentPolicy>,
    documents: BTreeMap<DocumentId, DocumentRecord>,
    keys: HashMap<DocumentKey, DocumentId>,
    applications: HashMap<ApplicationRef, AcceptedApplication>,
    reuse: Vec<ReuseEvent>,
    notifications: HashMap<NotificationKey, LedgerEntry>,
    lease: Option<(String, DateTime<Utc>)>,
    last_sweep: Option<DateTime<Utc>>,
}

struct LedgerEntry {
    claimed_at: DateTime<Utc>,
    settled_at: Option<DateTime<Utc>>,
}

/// Process-local store; one mutex makes every call a single transaction.
#[derive(Default, Clone)]
pub struct InMemoryDocumentStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryDocumentStore {
    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, RepositoryError> {
        self.state
            .lock()
            .map_err(|_| RepositoryError::Unavailable("document store mutex poisoned".to_string()))
    }

    /// Number of stored document rows, across all companies.
    pub fn document_count(&self) -> usize {
        self.lock().map(|state| state.documents.len()).unwrap_or(0)
    }
}

impl DocumentRepository for InMemoryDocumentStore {
    fn fetch_policy(
        &self,
        company: &CompanyId,
    ) -> Result<Option<CompanyDocumentPolicy>, RepositoryError> {
        Ok(self.lock()?.policies.get(company).cloned())
    }

    fn insert_policy_if_absent(
        &self,
        policy: CompanyDocumentPolicy,
    ) -> Result<CompanyDocumentPolicy, RepositoryError> {
        let mut state = self.lock()?;
        let stored = state
            .policies
            .entry(policy.company.clone())
            .or_insert(policy);
        Ok(stored.clone())
    }

    fn save_policy(&self, policy: CompanyDocumentPolicy) -> Result<(), RepositoryError> {
        self.lock()?.policies.insert(policy.company.clone(), policy);
        Ok(())
    }

    fn insert_document(&self, record: DocumentRecord) -> Result<DocumentRecord, RepositoryError> {
        let mut state = self.lock()?;
        let key = record.key();
        if state.keys.contains_key(&key) || state.documents.contains_key(&record.id) {
            return Err(RepositoryError::Conflict);
        }
        state.keys.insert(key, record.id.clone());
        state.documents.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn fetch_document(&self, id: &DocumentId) -> Result<Option<DocumentRecord>, RepositoryError> {
        Ok(self.lock()?.documents.get(id).cloned())
    }

    fn find_by_key(&self, key: &DocumentKey) -> Result<Option<DocumentRecord>, RepositoryError> {
        let state = self.lock()?;
        Ok(state
            .keys
            .get(key)
            .and_then(|id| state.documents.get(id))
            .cloned())
    }

    fn replace_if_status(
        &self,
        record: DocumentRecord,
        expected: DocumentStatus,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let stored = state
            .documents
            .get_mut(&record.id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.status != expected {
            return Err(RepositoryError::StatusMismatch {
                expected,
                found: stored.status,
            });
        }
        // Counters are owned by commit_application.
        let reuse_count = stored.reuse_count;
        *stored = DocumentRecord {
            reuse_count,
            ..record
        };
        Ok(())
    }

    fn set_reuse_eligible(&self, id: &DocumentId, eligible: bool) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let stored = state
            .documents
            .get_mut(id)
            .ok_or(RepositoryError::NotFound)?;
        stored.reuse_eligible = eligible;
        Ok(())
    }

    fn documents_for_freelancer(
        &self,
        freelancer: &FreelancerId,
    ) -> Result<Vec<DocumentRecord>, RepositoryError> {
        Ok(self
            .lock()?
            .documents
            .values()
            .filter(|record| &record.freelancer == freelancer)
            .cloned()
            .collect())
    }

    fn documents_for_company(
        &self,
        company: &CompanyId,
        status: Option<DocumentStatus>,
    ) -> Result<Vec<DocumentRecord>, RepositoryError> {
        Ok(self
            .lock()?
            .documents
            .values()
            .filter(|record| &record.company == company)
            .filter(|record| status.map_or(true, |status| record.status == status))
            .cloned()
            .collect())
    }

    fn documents_with_status(
        &self,
        status: DocumentStatus,
    ) -> Result<Vec<DocumentRecord>, RepositoryError> {
        Ok(self
            .lock()?
            .documents
            .values()
            .filter(|record| record.status == status)
            .cloned()
            .collect())
    }

    fn commit_application(
        &self,
        acceptance: AcceptedApplication,
        reuse: Vec<ReuseEvent>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        if state.applications.contains_key(&acceptance.application) {
            return Err(RepositoryError::Conflict);
        }

        let mut pairs = HashSet::new();
        for event in &reuse {
            let source = state
                .documents
                .get(&event.source_document)
                .ok_or(RepositoryError::NotFound)?;
            if source.status != DocumentStatus::Approved {
                return Err(RepositoryError::StatusMismatch {
                    expected: DocumentStatus::Approved,
                    found: source.status,
                });
            }
            let pair = (&event.source_document, &event.application);
            let recorded = state.reuse.iter().any(|existing| {
                existing.source_document == event.source_document
                    && existing.application == event.application
            });
            if recorded || !pairs.insert(pair) {
                return Err(RepositoryError::Conflict);
            }
        }

        // All checks passed; from here on nothing can fail.
        for event in &reuse {
            if let Some(document) = state.documents.get_mut(&event.source_document) {
                document.reuse_count += 1;
            }
        }
        state.reuse.extend(reuse);
        state
            .applications
            .insert(acceptance.application.clone(), acceptance);
        Ok(())
    }

    fn fetch_application(
        &self,
        application: &ApplicationRef,
    ) -> Result<Option<AcceptedApplication>, RepositoryError> {
        Ok(self.lock()?.applications.get(application).cloned())
    }

    fn reuse_events_for(&self, document: &DocumentId) -> Result<Vec<ReuseEvent>, RepositoryError> {
        Ok(self
            .lock()?
            .reuse
            .iter()
            .filter(|event| &event.source_document == document)
            .cloned()
            .collect())
    }
}

impl SweepLedger for InMemoryDocumentStore {
    fn try_acquire_sweep_lease(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.lock()?;
        let held = matches!(&state.lease, Some((_, expires_at)) if *expires_at > now);
        if held {
            return Ok(false);
        }
        state.lease = Some((holder.to_string(), now + ttl));
        Ok(true)
    }

    fn release_sweep_lease(
        &self,
        holder: &str,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        if matches!(&state.lease, Some((current, _)) if current == holder) {
            state.lease = None;
        }
        if completed_at.is_some() {
            state.last_sweep = completed_at;
        }
        Ok(())
    }

    fn last_sweep_completed(&self) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        Ok(self.lock()?.last_sweep)
    }

    fn claim_notification(
        &self,
        key: &NotificationKey,
        now: DateTime<Utc>,
    ) -> Result<NotificationClaim, RepositoryError> {
        let mut state = self.lock()?;
        let claim = match state.notifications.get(key) {
            Some(entry) if entry.settled_at.is_some() => NotificationClaim::Settled,
            Some(_) => NotificationClaim::Pending,
            None => {
                state.notifications.insert(
                    key.clone(),
                    LedgerEntry {
                        claimed_at: now,
                        settled_at: None,
                    },
                );
                NotificationClaim::New
            }
        };
        Ok(claim)
    }

    fn settle_notification(
        &self,
        key: &NotificationKey,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let entry = state.notifications.get_mut(key).ok_or(RepositoryError::NotFound)?;
        entry.settled_at.get_or_insert(now);
        Ok(())
    }

    fn pending_notifications(&self) -> Result<Vec<NotificationKey>, RepositoryError> {
        let state = self.lock()?;
        let mut pending: Vec<_> = state
            .notifications
            .iter()
            .filter(|(_, entry)| entry.settled_at.is_none())
            .map(|(key, entry)| (entry.claimed_at, key.clone()))
            .collect();
        pending.sort_by_key(|(claimed_at, _)| *claimed_at);
        Ok(pending.into_iter().map(|(_, key)| key).collect())
    }
}
