use super::common::*;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use chrono::Utc;
use serde_json::json;
use tower::ServiceExt;

use crate::documents::domain::{Actor, CompanyId, DocumentType, FreelancerId};
use crate::documents::router::actor_from_headers;

const ANA: Option<(&str, &str, Option<&str>)> = Some(("freelancer", "ana-souza", None));
const ACME_REVIEWER: Option<(&str, &str, Option<&str>)> =
    Some(("company_user", "rh-reviewer", Some("acme-eventos")));

fn upload_body(doc_type: &str, storage_key: &str) -> serde_json::Value {
    json!({
        "company": "acme-eventos",
        "freelancer": "ana-souza",
        "doc_type": doc_type,
        "storage_key": storage_key,
    })
}

#[test]
fn actor_headers_resolve_to_one_variant() {
    let mut headers = HeaderMap::new();
    assert_eq!(actor_from_headers(&headers), Actor::Unclassified);

    headers.insert("x-actor-kind", HeaderValue::from_static("company_user"));
    headers.insert("x-actor-id", HeaderValue::from_static("rh-reviewer"));
    assert_eq!(actor_from_headers(&headers), Actor::Unclassified);

    headers.insert("x-company-id", HeaderValue::from_static("acme-eventos"));
    assert_eq!(
        actor_from_headers(&headers),
        Actor::CompanyUser {
            company: CompanyId("acme-eventos".to_string()),
            user: "rh-reviewer".to_string(),
        }
    );

    headers.insert("x-actor-kind", HeaderValue::from_static("Freelancer"));
    assert_eq!(
        actor_from_headers(&headers),
        Actor::Freelancer {
            freelancer: FreelancerId("rh-reviewer".to_string()),
        }
    );

    headers.insert("x-actor-kind", HeaderValue::from_static("auditor"));
    assert_eq!(actor_from_headers(&headers), Actor::Unclassified);
}

#[tokio::test]
async fn upload_then_approve_over_http() {
    let h = harness();
    let router = h.router();

    let response = router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/documents",
            ANA,
            Some(upload_body("rg", "uploads/ana/rg.png")),
        ))
        .await
        .expect("router responds");
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = read_json(response).await;
    assert_eq!(created["status"], "pending");
    assert_eq!(created["file"]["content_type"], "image/png");
    let id = created["id"].as_str().expect("id present").to_string();

    let response = router
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/v1/documents/{id}/approve"),
            ACME_REVIEWER,
            Some(json!({ "notes": "conferido" })),
        ))
        .await
        .expect("router responds");
    assert_eq!(response.status(), StatusCode::OK);
    let approved = read_json(response).await;
    assert_eq!(approved["status"], "approved");
    assert_eq!(approved["notes"], "conferido");
    assert!(approved["expires_at"].is_string());

    let response = router
        .oneshot(json_request(
            "GET",
            &format!("/api/v1/documents/{id}"),
            ANA,
            None,
        ))
        .await
        .expect("router responds");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn anonymous_reviews_are_forbidden() {
    let h = harness();
    let record = h
        .documents
        .upload(
            &freelancer(ana()),
            upload_request(acme(), ana(), DocumentType::Rg),
            Utc::now(),
        )
        .expect("upload succeeds");

    let response = h
        .router()
        .oneshot(json_request(
            "POST",
            &format!("/api/v1/documents/{}/approve", record.id),
            None,
            None,
        ))
        .await
        .expect("router responds");

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(read_json(response).await["error"], "not_authorized");
}

#[tokio::test]
async fn reject_without_notes_is_unprocessable() {
    let h = harness();
    let record = h
        .documents
        .upload(
            &freelancer(ana()),
            upload_request(acme(), ana(), DocumentType::Cpf),
            Utc::now(),
        )
        .expect("upload succeeds");

    let response = h
        .router()
        .oneshot(json_request(
            "POST",
            &format!("/api/v1/documents/{}/reject", record.id),
            ACME_REVIEWER,
            Some(json!({})),
        ))
        .await
        .expect("router responds");

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = read_json(response).await;
    assert_eq!(body["error"], "missing_notes");
    assert!(body["detail"].as_str().expect("detail").contains("notes"));
}

#[tokio::test]
async fn duplicate_upload_is_a_conflict() {
    let h = harness();
    let record = h
        .documents
        .upload(
            &freelancer(ana()),
            upload_request(acme(), ana(), DocumentType::Rg),
            Utc::now(),
        )
        .expect("upload succeeds");
    h.documents
        .approve(&reviewer(acme()), &record.id, None, Utc::now())
        .expect("approval succeeds");

    let response = h
        .router()
        .oneshot(json_request(
            "POST",
            "/api/v1/documents",
            ANA,
            Some(upload_body("rg", "uploads/ana/rg-2.pdf")),
        ))
        .await
        .expect("router responds");

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(
        read_json(response).await["error"],
        "duplicate_active_document"
    );
}

#[tokio::test]
async fn unknown_document_is_not_found() {
    let h = harness();

    let response = h
        .router()
        .oneshot(json_request(
            "GET",
            "/api/v1/documents/doc-missing",
            ACME_REVIEWER,
            None,
        ))
        .await
        .expect("router responds");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn policy_round_trips_and_rejects_zero_validity() {
    let h = harness();
    let router = h.router();

    let response = router
        .clone()
        .oneshot(json_request(
            "GET",
            "/api/v1/companies/acme-eventos/document-policy",
            ACME_REVIEWER,
            None,
        ))
        .await
        .expect("router responds");
    assert_eq!(response.status(), StatusCode::OK);
    let mut policy = read_json(response).await;
    assert_eq!(policy["default_validity_days"], 365);
    assert_eq!(policy["accepts_external_documents"], false);

    policy["default_validity_days"] = json!(0);
    let response = router
        .oneshot(json_request(
            "PUT",
            "/api/v1/companies/acme-eventos/document-policy",
            ACME_REVIEWER,
            Some(policy),
        ))
        .await
        .expect("router responds");
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(read_json(response).await["error"], "configuration_error");
}

#[tokio::test]
async fn evaluate_reports_classifications_and_apply_blocks_incomplete() {
    let h = harness();
    let record = h
        .documents
        .upload(
            &freelancer(ana()),
            upload_request(acme(), ana(), DocumentType::Rg),
            Utc::now(),
        )
        .expect("upload succeeds");
    h.documents
        .approve(&reviewer(acme()), &record.id, None, Utc::now())
        .expect("approval succeeds");
    let router = h.router();

    let response = router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/v1/applications/evaluate",
            ANA,
            Some(json!({ "freelancer": "ana-souza", "company": "acme-eventos" })),
        ))
        .await
        .expect("router responds");
    assert_eq!(response.status(), StatusCode::OK);
    let check = read_json(response).await;
    assert_eq!(check["can_apply"], false);
    assert_eq!(check["required"], json!(["rg", "cpf"]));

    let response = router
        .oneshot(json_request(
            "POST",
            "/api/v1/applications",
            ANA,
            Some(json!({
                "application": "vaga-31",
                "freelancer": "ana-souza",
                "company": "acme-eventos",
            })),
        ))
        .await
        .expect("router responds");
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = read_json(response).await;
    assert_eq!(body["error"], "incomplete_documentation");
    assert_eq!(body["classifications"]["rg"], "approved_and_valid");
    assert_eq!(body["classifications"]["cpf"], "missing");
}

#[tokio::test]
async fn apply_with_vaga_scope_records_reuse() {
    let h = harness();
    let record = h
        .documents
        .upload(
            &freelancer(ana()),
            upload_request(acme(), ana(), DocumentType::Rg),
            Utc::now(),
        )
        .expect("upload succeeds");
    h.documents
        .approve(&reviewer(acme()), &record.id, None, Utc::now())
        .expect("approval succeeds");

    let response = h
        .router()
        .oneshot(json_request(
            "POST",
            "/api/v1/applications",
            ANA,
            Some(json!({
                "application": "vaga-32",
                "freelancer": "ana-souza",
                "company": "acme-eventos",
                "scope": { "vaga_types": ["rg"] },
            })),
        ))
        .await
        .expect("router responds");

    assert_eq!(response.status(), StatusCode::CREATED);
    let outcome = read_json(response).await;
    assert_eq!(outcome["reuse_events"].as_array().map(Vec::len), Some(1));
    assert_eq!(
        h.documents.get(&record.id).expect("record").reuse_count,
        1
    );
}

#[tokio::test]
async fn freelancers_cannot_read_other_freelancers_documents() {
    let h = harness();

    let response = h
        .router()
        .oneshot(json_request(
            "GET",
            "/api/v1/freelancers/bruno-lima/documents",
            ANA,
            None,
        ))
        .await
        .expect("router responds");

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
