//! Router tests against the in-memory billing backends

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt;
    use maturamate_billing::testing::{test_subject, InMemoryProvider, InMemoryStore};
    use maturamate_billing::BillingService;
    use maturamate_shared::Subject;
    use serde_json::{json, Value};
    use time::OffsetDateTime;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::auth::{Claims, JwtManager};
    use crate::config::Config;
    use crate::routes::create_router;
    use crate::state::AppState;

    const JWT_SECRET: &str = "router-test-secret";
    const USER: &str = "user_router";

    struct TestApp {
        router: Router,
        subjects: Vec<Subject>,
    }

    fn test_app(subscribed: usize) -> TestApp {
        let mut subjects = vec![
            test_subject("Italiano", 0),
            test_subject("Matematica", 1),
            test_subject("Fisica", 2),
        ];
        subjects.push(Subject {
            maturita: false,
            ..test_subject("Educazione civica", 3)
        });

        let provider = Arc::new(InMemoryProvider::default());
        let store = Arc::new(InMemoryStore::with_subjects(subjects.clone()));
        if subscribed > 0 {
            let ids: BTreeSet<Uuid> = subjects[..subscribed].iter().map(|s| s.id).collect();
            let subscription = provider.create_subscription(&ids, 15);
            store.add_customer(USER, &subscription);
        }

        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            database_url: "postgres://unused".to_string(),
            run_migrations: false,
            jwt_secret: JWT_SECRET.to_string(),
            allowed_origins: vec![],
        };
        let billing = BillingService::with_backends(provider, store, "whsec_router".to_string());
        let state = AppState::with_billing(config, billing);

        TestApp {
            router: create_router(state),
            subjects,
        }
    }

    fn bearer() -> String {
        let token = JwtManager::new(JWT_SECRET)
            .generate_token(&Claims {
                sub: USER.to_string(),
                email: Some("studente@example.com".to_string()),
                exp: OffsetDateTime::now_utc().unix_timestamp() + 600,
                iat: None,
            })
            .unwrap();
        format!("Bearer {}", token)
    }

    async fn send(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Authorization", bearer());
        let body = match body {
            Some(json) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = app
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn ids(subjects: &[Subject]) -> Vec<Uuid> {
        subjects.iter().map(|s| s.id).collect()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = test_app(0);
        let response = app
            .router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_protected_route_requires_token() {
        let app = test_app(1);
        let response = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/user/subscription-status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_subscription_status() {
        let app = test_app(2);
        let (status, body) = send(&app, "GET", "/api/user/subscription-status", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["has_subscription"], true);
        assert_eq!(body["state"], "active");
        assert_eq!(body["subject_count"], 2);
        assert_eq!(body["price_cents"], 748);
        assert!(body["pending_change"].is_null());
    }

    #[tokio::test]
    async fn test_status_without_subscription() {
        let app = test_app(0);
        let (status, body) = send(&app, "GET", "/api/user/subscription-status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["has_subscription"], false);
    }

    #[tokio::test]
    async fn test_upgrade_then_access() {
        let app = test_app(1);
        let (status, body) = send(
            &app,
            "POST",
            "/api/stripe/plan-change",
            Some(json!({ "subject_ids": ids(&app.subjects[..3]) })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["applied_immediately"], true);
        assert_eq!(body["new_price_cents"], 997);

        let (_, access) = send(&app, "GET", "/api/user/subject-access", None).await;
        assert_eq!(access["count"], 3);
        assert_eq!(access["available_slots"], 1);
    }

    #[tokio::test]
    async fn test_preview_downgrade() {
        let app = test_app(3);
        let (status, body) = send(
            &app,
            "POST",
            "/api/stripe/plan-change-preview",
            Some(json!({ "subject_ids": ids(&app.subjects[..1]) })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["change_type"], "downgrade");
        assert_eq!(body["immediate"], false);
        assert_eq!(body["new_price_cents"], 499);
    }

    #[tokio::test]
    async fn test_empty_selection_is_bad_request() {
        let app = test_app(2);
        let (status, body) = send(
            &app,
            "POST",
            "/api/stripe/plan-change",
            Some(json!({ "subject_ids": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");
    }

    #[tokio::test]
    async fn test_second_change_conflicts_then_undo() {
        let app = test_app(3);
        let (status, body) = send(
            &app,
            "POST",
            "/api/stripe/plan-change",
            Some(json!({ "subject_ids": ids(&app.subjects[..1]) })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pending_change"]["change_type"], "downgrade");

        let (status, body) = send(
            &app,
            "POST",
            "/api/stripe/plan-change",
            Some(json!({ "subject_ids": ids(&app.subjects[..2]) })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "conflict");

        let (_, pending) =
            send(&app, "GET", "/api/user/pending-subscription-changes", None).await;
        assert_eq!(pending.as_array().map(Vec::len), Some(1));

        let (status, body) = send(&app, "POST", "/api/stripe/modify-pending-change", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], true);
        assert_eq!(body["next_price_cents"], 997);
    }

    #[tokio::test]
    async fn test_partial_undo_by_single_subject() {
        let app = test_app(3);
        send(
            &app,
            "POST",
            "/api/stripe/plan-change",
            Some(json!({ "subject_ids": ids(&app.subjects[..1]) })),
        )
        .await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/stripe/modify-pending-change",
            Some(json!({ "subject_id": app.subjects[1].id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], false);
        assert_eq!(body["next_price_cents"], 748);
    }

    #[tokio::test]
    async fn test_undo_without_pending_change_is_not_found() {
        let app = test_app(2);
        let (status, _) = send(&app, "POST", "/api/stripe/modify-pending-change", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_and_reactivate() {
        let app = test_app(2);
        let (status, body) = send(&app, "POST", "/api/stripe/cancel-subscription", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancel_at_period_end"], true);

        let (status, _) = send(&app, "POST", "/api/stripe/cancel-subscription", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) =
            send(&app, "POST", "/api/stripe/reactivate-subscription", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancel_at_period_end"], false);
    }

    #[tokio::test]
    async fn test_subject_catalog_filter() {
        let app = test_app(0);
        let (status, all) = send(&app, "GET", "/api/subjects", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(all.as_array().map(Vec::len), Some(4));

        let (_, maturita) = send(&app, "GET", "/api/subjects?maturita=true", None).await;
        assert_eq!(maturita.as_array().map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn test_webhook_requires_valid_signature() {
        let app = test_app(1);

        let missing = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/stripe/webhook")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let forged = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/stripe/webhook")
                    .header("Stripe-Signature", "t=1,v1=deadbeef")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(forged.status(), StatusCode::BAD_REQUEST);
    }
}
