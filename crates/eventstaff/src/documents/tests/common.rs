use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use axum::http::Request;
use axum::response::Response;
use axum::Router;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;

use crate::config::SweeperConfig;
use crate::documents::domain::{
    Actor, CompanyId, DocumentId, DocumentRecord, DocumentType, FreelancerId,
};
use crate::documents::events::{DocumentEventBus, TransitionNotifier};
use crate::documents::notifications::{
    DispatchError, NotificationDispatcher, NotificationRequest, Recipient,
};
use crate::documents::policy::{CompanyDocumentPolicy, TypeRequirement};
use crate::documents::reuse::ReuseEvaluator;
use crate::documents::router::{document_router, DocumentApi};
use crate::documents::service::{DocumentService, UploadRequest};
use crate::documents::store::InMemoryDocumentStore;
use crate::documents::sweeper::{Clock, ValiditySweeper};

/// Noon UTC on 2025-01-01 plus `day` days.
pub(super) fn at(day: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0)
        .single()
        .expect("valid timestamp")
        + Duration::days(day)
}

pub(super) fn acme() -> CompanyId {
    CompanyId("acme-eventos".to_string())
}

pub(super) fn globex() -> CompanyId {
    CompanyId("globex-producoes".to_string())
}

pub(super) fn ana() -> FreelancerId {
    FreelancerId("ana-souza".to_string())
}

pub(super) fn bruno() -> FreelancerId {
    FreelancerId("bruno-lima".to_string())
}

pub(super) fn admin() -> Actor {
    Actor::SystemAdmin {
        user: "ops-admin".to_string(),
    }
}

pub(super) fn reviewer(company: CompanyId) -> Actor {
    Actor::CompanyUser {
        company,
        user: "rh-reviewer".to_string(),
    }
}

pub(super) fn freelancer(freelancer: FreelancerId) -> Actor {
    Actor::Freelancer { freelancer }
}

pub(super) fn upload_request(
    company: CompanyId,
    freelancer: FreelancerId,
    doc_type: DocumentType,
) -> UploadRequest {
    UploadRequest {
        storage_key: format!("uploads/{}/{}.pdf", freelancer, doc_type.code()),
        company,
        freelancer,
        doc_type,
    }
}

/// Settable wall clock, kept apart from the dates a sweep evaluates.
#[derive(Clone)]
pub(super) struct WallClock(Arc<Mutex<DateTime<Utc>>>);

impl WallClock {
    /// Starts on 2026-10-19 08:00 UTC, well after every `at(day)` a test sweeps.
    pub(super) fn new() -> Self {
        let start = Utc
            .with_ymd_and_hms(2026, 10, 19, 8, 0, 0)
            .single()
            .expect("valid timestamp");
        Self(Arc::new(Mutex::new(start)))
    }

    pub(super) fn now(&self) -> DateTime<Utc> {
        *self.0.lock().expect("clock mutex poisoned")
    }

    pub(super) fn advance(&self, by: Duration) {
        *self.0.lock().expect("clock mutex poisoned") += by;
    }

    pub(super) fn clock(&self) -> Clock {
        let inner = Arc::clone(&self.0);
        Arc::new(move || *inner.lock().expect("clock mutex poisoned"))
    }
}

/// Dispatcher that records every request and can be told to fail for chosen records or recipients.
#[derive(Default)]
pub(super) struct RecordingDispatcher {
    pub(super) requests: Mutex<Vec<NotificationRequest>>,
    pub(super) failing: Mutex<HashSet<DocumentId>>,
    pub(super) failing_recipients: Mutex<HashSet<Recipient>>,
}

impl RecordingDispatcher {
    pub(super) fn sent(&self) -> Vec<NotificationRequest> {
        self.requests.lock().expect("dispatcher mutex poisoned").clone()
    }

    pub(super) fn clear(&self) {
        self.requests.lock().expect("dispatcher mutex poisoned").clear();
    }

    pub(super) fn fail_for(&self, document: &DocumentId) {
        self.failing
            .lock()
            .expect("dispatcher mutex poisoned")
            .insert(document.clone());
    }

    pub(super) fn fail_for_recipient(&self, recipient: Recipient) {
        self.failing_recipients
            .lock()
            .expect("dispatcher mutex poisoned")
            .insert(recipient);
    }

    pub(super) fn recover(&self) {
        self.failing.lock().expect("dispatcher mutex poisoned").clear();
        self.failing_recipients
            .lock()
            .expect("dispatcher mutex poisoned")
            .clear();
    }

    pub(super) fn sent_to(&self, recipient: &Recipient) -> Vec<NotificationRequest> {
        self.sent()
            .into_iter()
            .filter(|request| &request.recipient == recipient)
            .collect()
    }
}

impl NotificationDispatcher for RecordingDispatcher {
    fn dispatch(&self, request: NotificationRequest) -> Result<(), DispatchError> {
        if self
            .failing
            .lock()
            .expect("dispatcher mutex poisoned")
            .contains(&request.document_id)
            || self
                .failing_recipients
                .lock()
                .expect("dispatcher mutex poisoned")
                .contains(&request.recipient)
        {
            return Err(DispatchError::Transport("smtp relay refused".to_string()));
        }
        self.requests
            .lock()
            .expect("dispatcher mutex poisoned")
            .push(request);
        Ok(())
    }
}

pub(super) struct Harness {
    pub(super) store: Arc<InMemoryDocumentStore>,
    pub(super) notifications: Arc<RecordingDispatcher>,
    pub(super) documents: DocumentService<InMemoryDocumentStore>,
    pub(super) reuse: ReuseEvaluator<InMemoryDocumentStore>,
    pub(super) sweeper: ValiditySweeper<InMemoryDocumentStore, RecordingDispatcher>,
    pub(super) wall: WallClock,
}

pub(super) fn harness() -> Harness {
    let store = Arc::new(InMemoryDocumentStore::default());
    let notifications = Arc::new(RecordingDispatcher::default());
    let events =
        DocumentEventBus::new().subscribe(Arc::new(TransitionNotifier::new(notifications.clone())));
    let wall = WallClock::new();
    Harness {
        documents: DocumentService::new(store.clone(), events.clone()),
        reuse: ReuseEvaluator::new(store.clone(), events.clone()),
        sweeper: ValiditySweeper::new(
            store.clone(),
            notifications.clone(),
            &SweeperConfig::default(),
        )
        .with_events(events)
        .with_clock(wall.clock()),
        store,
        notifications,
        wall,
    }
}

impl Harness {
    pub(super) fn approved(
        &self,
        company: CompanyId,
        freelancer_id: FreelancerId,
        doc_type: DocumentType,
        day: i64,
    ) -> DocumentRecord {
        let uploaded = self
            .documents
            .upload(
                &freelancer(freelancer_id.clone()),
                upload_request(company.clone(), freelancer_id, doc_type),
                at(day),
            )
            .expect("upload succeeds");
        self.documents
            .approve(&reviewer(company), &uploaded.id, None, at(day))
            .expect("approval succeeds")
    }

    pub(super) fn configure(&self, policy: CompanyDocumentPolicy) {
        self.documents
            .update_policy(&admin(), policy)
            .expect("policy update succeeds");
    }

    pub(super) fn router(&self) -> Router {
        let events = DocumentEventBus::new()
            .subscribe(Arc::new(TransitionNotifier::new(self.notifications.clone())));
        document_router(Arc::new(DocumentApi {
            documents: DocumentService::new(self.store.clone(), events.clone()),
            reuse: ReuseEvaluator::new(self.store.clone(), events),
        }))
    }
}

pub(super) fn policy_with(
    company: CompanyId,
    configure: impl FnOnce(&mut CompanyDocumentPolicy),
) -> CompanyDocumentPolicy {
    let mut policy = CompanyDocumentPolicy::default_for(company);
    configure(&mut policy);
    policy
}

pub(super) fn with_validity(policy: &mut CompanyDocumentPolicy, doc_type: DocumentType, days: i32) {
    let mandatory = policy
        .requirements
        .get(&doc_type)
        .map_or(false, |requirement| requirement.mandatory);
    policy.requirements.insert(
        doc_type,
        TypeRequirement {
            mandatory,
            validity_days: Some(days),
        },
    );
}

pub(super) fn json_request(
    method: &str,
    uri: &str,
    actor: Option<(&str, &str, Option<&str>)>,
    body: Option<Value>,
) -> Request<axum::body::Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some((kind, id, company)) = actor {
        builder = builder.header("x-actor-kind", kind).header("x-actor-id", id);
        if let Some(company) = company {
            builder = builder.header("x-company-id", company);
        }
    }
    let body = match body {
        Some(value) => {
            builder = builder.header(axum::http::header::CONTENT_TYPE, "application/json");
            axum::body::Body::from(serde_json::to_vec(&value).expect("serialize body"))
        }
        None => axum::body::Body::empty(),
    };
    builder.body(body).expect("request builds")
}

pub(super) async fn read_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    serde_json::from_slice(&bytes).expect("json body")
}
