use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::domain::{Actor, CompanyId, DocumentId, FreelancerId};
use super::policy::{CompanyDocumentPolicy, RequirementScope};
use super::repository::{DocumentRepository, RepositoryError};
use super::reuse::{ApplicationRequest, ReuseError, ReuseEvaluator};
use super::service::{DocumentService, DocumentServiceError, UploadRequest};

pub const ACTOR_KIND_HEADER: &str = "x-actor-kind";
pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const COMPANY_ID_HEADER: &str = "x-company-id";

/// Services shared by the document handlers.
pub struct DocumentApi<R> {
    pub documents: DocumentService<R>,
    pub reuse: ReuseEvaluator<R>,
}

/// Router builder exposing review, listing, policy, and application endpoints.
pub fn document_router<R>(api: Arc<DocumentApi<R>>) -> Router
where
    R: DocumentRepository + 'static,
{
    Router::new()
        .route("/api/v1/documents", post(upload_handler::<R>))
        .route("/api/v1/documents/:document_id", get(document_handler::<R>))
        .route(
            "/api/v1/documents/:document_id/approve",
            post(approve_handler::<R>),
        )
        .route(
            "/api/v1/documents/:document_id/reject",
            post(reject_handler::<R>),
        )
        .route(
            "/api/v1/documents/:document_id/reuse-eligibility",
            put(reuse_eligibility_handler::<R>),
        )
        .route(
            "/api/v1/documents/:document_id/reuse-events",
            get(reuse_history_handler::<R>),
        )
        .route(
            "/api/v1/freelancers/:freelancer_id/documents",
            get(freelancer_documents_handler::<R>),
        )
        .route(
            "/api/v1/companies/:company_id/documents/pending",
            get(pending_reviews_handler::<R>),
        )
        .route(
            "/api/v1/companies/:company_id/document-policy",
            get(policy_handler::<R>).put(update_policy_handler::<R>),
        )
        .route(
            "/api/v1/applications/evaluate",
            post(evaluate_handler::<R>),
        )
        .route("/api/v1/applications", post(apply_handler::<R>))
        .with_state(api)
}

/// Classifies the caller from the identity headers set by the gateway.
pub fn actor_from_headers(headers: &HeaderMap) -> Actor {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    let (Some(kind), Some(id)) = (header(ACTOR_KIND_HEADER), header(ACTOR_ID_HEADER)) else {
        return Actor::Unclassified;
    };
    match kind.to_ascii_lowercase().as_str() {
        "system_admin" => Actor::SystemAdmin { user: id },
        "company_user" => match header(COMPANY_ID_HEADER) {
            Some(company) => Actor::CompanyUser {
                company: CompanyId(company),
                user: id,
            },
            None => Actor::Unclassified,
        },
        "freelancer" => Actor::Freelancer {
            freelancer: FreelancerId(id),
        },
        _ => Actor::Unclassified,
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ReviewBody {
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReuseEligibilityBody {
    eligible: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EvaluateBody {
    freelancer: FreelancerId,
    company: CompanyId,
    #[serde(default)]
    scope: RequirementScope,
}

pub(crate) async fn upload_handler<R>(
    State(api): State<Arc<DocumentApi<R>>>,
    headers: HeaderMap,
    Json(request): Json<UploadRequest>,
) -> Response
where
    R: DocumentRepository + 'static,
{
    let actor = actor_from_headers(&headers);
    match api.documents.upload(&actor, request, Utc::now()) {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(err) => service_error(err),
    }
}

pub(crate) async fn document_handler<R>(
    State(api): State<Arc<DocumentApi<R>>>,
    Path(document_id): Path<String>,
    headers: HeaderMap,
) -> Response
where
    R: DocumentRepository + 'static,
{
    let actor = actor_from_headers(&headers);
    match api.documents.get(&DocumentId(document_id)) {
        Ok(record) if actor.can_view_freelancer(&record.freelancer) => {
            (StatusCode::OK, Json(record)).into_response()
        }
        Ok(_) => forbidden(&actor, "view"),
        Err(err) => service_error(err),
    }
}

pub(crate) async fn approve_handler<R>(
    State(api): State<Arc<DocumentApi<R>>>,
    Path(document_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ReviewBody>>,
) -> Response
where
    R: DocumentRepository + 'static,
{
    let actor = actor_from_headers(&headers);
    let Json(body) = body.unwrap_or_default();
    match api
        .documents
        .approve(&actor, &DocumentId(document_id), body.notes, Utc::now())
    {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(err) => service_error(err),
    }
}

pub(crate) async fn reject_handler<R>(
    State(api): State<Arc<DocumentApi<R>>>,
    Path(document_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ReviewBody>>,
) -> Response
where
    R: DocumentRepository + 'static,
{
    let actor = actor_from_headers(&headers);
    let Json(body) = body.unwrap_or_default();
    let notes = body.notes.unwrap_or_default();
    match api
        .documents
        .reject(&actor, &DocumentId(document_id), &notes)
    {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(err) => service_error(err),
    }
}

pub(crate) async fn reuse_eligibility_handler<R>(
    State(api): State<Arc<DocumentApi<R>>>,
    Path(document_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ReuseEligibilityBody>,
) -> Response
where
    R: DocumentRepository + 'static,
{
    let actor = actor_from_headers(&headers);
    match api
        .documents
        .set_reuse_eligibility(&actor, &DocumentId(document_id), body.eligible)
    {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(err) => service_error(err),
    }
}

pub(crate) async fn reuse_history_handler<R>(
    State(api): State<Arc<DocumentApi<R>>>,
    Path(document_id): Path<String>,
    headers: HeaderMap,
) -> Response
where
    R: DocumentRepository + 'static,
{
    let actor = actor_from_headers(&headers);
    let document = DocumentId(document_id);
    let record = match api.documents.get(&document) {
        Ok(record) => record,
        Err(err) => return service_error(err),
    };
    if actor.reviewer_for(&record.company).is_none() {
        return forbidden(&actor, "view reuse history of");
    }
    match api.documents.reuse_history(&document) {
        Ok(events) => (StatusCode::OK, Json(events)).into_response(),
        Err(err) => service_error(err),
    }
}

pub(crate) async fn freelancer_documents_handler<R>(
    State(api): State<Arc<DocumentApi<R>>>,
    Path(freelancer_id): Path<String>,
    headers: HeaderMap,
) -> Response
where
    R: DocumentRepository + 'static,
{
    let actor = actor_from_headers(&headers);
    let freelancer = FreelancerId(freelancer_id);
    if !actor.can_view_freelancer(&freelancer) {
        return forbidden(&actor, "list documents of");
    }
    match api.documents.documents_for_freelancer(&freelancer) {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(err) => service_error(err),
    }
}

pub(crate) async fn pending_reviews_handler<R>(
    State(api): State<Arc<DocumentApi<R>>>,
    Path(company_id): Path<String>,
    headers: HeaderMap,
) -> Response
where
    R: DocumentRepository + 'static,
{
    let actor = actor_from_headers(&headers);
    let company = CompanyId(company_id);
    if actor.reviewer_for(&company).is_none() {
        return forbidden(&actor, "list pending reviews of");
    }
    match api.documents.pending_reviews(&company) {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(err) => service_error(err),
    }
}

pub(crate) async fn policy_handler<R>(
    State(api): State<Arc<DocumentApi<R>>>,
    Path(company_id): Path<String>,
    headers: HeaderMap,
) -> Response
where
    R: DocumentRepository + 'static,
{
    let actor = actor_from_headers(&headers);
    let company = CompanyId(company_id);
    if actor.reviewer_for(&company).is_none() {
        return forbidden(&actor, "read the document policy of");
    }
    match api.documents.policies().policy(&company) {
        Ok(policy) => (StatusCode::OK, Json(policy)).into_response(),
        Err(err) => service_error(err.into()),
    }
}

pub(crate) async fn update_policy_handler<R>(
    State(api): State<Arc<DocumentApi<R>>>,
    Path(company_id): Path<String>,
    headers: HeaderMap,
    Json(mut policy): Json<CompanyDocumentPolicy>,
) -> Response
where
    R: DocumentRepository + 'static,
{
    let actor = actor_from_headers(&headers);
    policy.company = CompanyId(company_id);
    match api.documents.update_policy(&actor, policy) {
        Ok(policy) => (StatusCode::OK, Json(policy)).into_response(),
        Err(err) => service_error(err),
    }
}

pub(crate) async fn evaluate_handler<R>(
    State(api): State<Arc<DocumentApi<R>>>,
    headers: HeaderMap,
    Json(body): Json<EvaluateBody>,
) -> Response
where
    R: DocumentRepository + 'static,
{
    let actor = actor_from_headers(&headers);
    if !may_act_on_application(&actor, &body.freelancer, &body.company) {
        return forbidden(&actor, "evaluate applications for");
    }
    match api
        .reuse
        .check(&body.freelancer, &body.company, &body.scope, Utc::now())
    {
        Ok(check) => (StatusCode::OK, Json(check)).into_response(),
        Err(err) => reuse_error(err),
    }
}

pub(crate) async fn apply_handler<R>(
    State(api): State<Arc<DocumentApi<R>>>,
    headers: HeaderMap,
    Json(request): Json<ApplicationRequest>,
) -> Response
where
    R: DocumentRepository + 'static,
{
    let actor = actor_from_headers(&headers);
    if !may_act_on_application(&actor, &request.freelancer, &request.company) {
        return forbidden(&actor, "apply on behalf of");
    }
    match api.reuse.apply(request, Utc::now()) {
        Ok(outcome) => (StatusCode::CREATED, Json(outcome)).into_response(),
        Err(err) => reuse_error(err),
    }
}

fn may_act_on_application(actor: &Actor, freelancer: &FreelancerId, company: &CompanyId) -> bool {
    actor.can_upload_for(freelancer) || actor.reviewer_for(company).is_some()
}

fn forbidden(actor: &Actor, operation: &'static str) -> Response {
    service_error(DocumentServiceError::NotAuthorized {
        actor: actor.label(),
        operation,
    })
}

fn error_body(status: StatusCode, kind: &str, detail: String) -> Response {
    let payload = json!({
        "error": kind,
        "detail": detail,
    });
    (status, Json(payload)).into_response()
}

pub(crate) fn service_error(err: DocumentServiceError) -> Response {
    let status = match &err {
        DocumentServiceError::DuplicateActiveDocument { .. }
        | DocumentServiceError::InvalidState { .. }
        | DocumentServiceError::Repository(RepositoryError::Conflict) => StatusCode::CONFLICT,
        DocumentServiceError::MissingNotes | DocumentServiceError::Configuration(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        DocumentServiceError::NotAuthorized { .. } => StatusCode::FORBIDDEN,
        DocumentServiceError::NotFound(_)
        | DocumentServiceError::Repository(RepositoryError::NotFound) => StatusCode::NOT_FOUND,
        DocumentServiceError::UnsupportedFile { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        DocumentServiceError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_body(status, err.kind(), err.to_string())
}

pub(crate) fn reuse_error(err: ReuseError) -> Response {
    match err {
        ReuseError::IncompleteDocumentation { evaluation } => {
            let detail = format!(
                "documentation incomplete: {:?} not approved and valid",
                evaluation.unsatisfied()
            );
            let payload = json!({
                "error": "incomplete_documentation",
                "detail": detail,
                "classifications": evaluation.classifications(),
            });
            (StatusCode::UNPROCESSABLE_ENTITY, Json(payload)).into_response()
        }
        ReuseError::AlreadyApplied(_) | ReuseError::DocumentChanged(_) => {
            error_body(StatusCode::CONFLICT, err.kind(), err.to_string())
        }
        ReuseError::Repository(_) => {
            error_body(StatusCode::INTERNAL_SERVER_ERROR, err.kind(), err.to_string())
        }
    }
}
