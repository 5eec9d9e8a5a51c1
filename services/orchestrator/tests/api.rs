
use axum::http::StatusCode;
use emufleet_id::SessionId;
use harness::{delete, get, post_json, send, wait_for_run, Fleet, TEMPLATE};
use serde_json::json;

async fn open_session(router: &axum::Router) -> String {
    let (status, body) = send(router, post_json("/v1/sessions", json!({}))).await;
    assert_eq!(status, StatusCode::CREATED);
    body["session_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn healthz_reports_ok() {
    let fleet = Fleet::new();
    let (_, router) = fleet.router();

    let (status, body) = send(&router, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "emufleet-orchestrator");
}

#[tokio::test]
async fn readyz_needs_the_template() {
    let fleet = Fleet::new();
    let (_, router) = fleet.router();

    let (status, body) = send(&router, get("/readyz")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["components"]["template"]["status"], "unavailable");

    fleet.write_template();
    let (status, body) = send(&router, get("/readyz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["components"]["registry"]["status"], "ok");
}

#[tokio::test]
async fn unknown_and_malformed_sessions_are_rejected() {
    let fleet = Fleet::new();
    let (_, router) = fleet.router();

    let unknown = SessionId::new().to_string();
    let (status, body) = send(&router, get(&format!("/v1/sessions/{unknown}/runs"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "unknown_session");
    assert_eq!(body["instance"], unknown.as_str());

    let (status, body) = send(&router, get("/v1/sessions/not-a-session/runs")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_session_id");
}

#[tokio::test]
async fn ingest_provisions_units_then_run_completes() {
    let fleet = Fleet::new();
    fleet.write_template();
    let (state, router) = fleet.router();
    let session = open_session(&router).await;

    let assignees: Vec<_> = (0..7).map(|n| json!({ "id": format!("acct-{n}") })).collect();
    let (status, report) = send(
        &router,
        post_json(
            &format!("/v1/sessions/{session}/assignees"),
            json!({ "assignees": assignees }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["provisioned"].as_array().unwrap().len(), 2);
    assert_eq!(report["assigned"].as_array().unwrap().len(), 7);

    let (status, units) = send(&router, get("/v1/units")).await;
    assert_eq!(status, StatusCode::OK);
    let items = units["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["name"], format!("{TEMPLATE}_Clone1"));
    assert_eq!(items[0]["assigned"], 5);
    assert_eq!(items[0]["status"], "completed");
    assert_eq!(items[1]["assigned"], 2);

    let (status, discovered) = send(&router, get("/v1/units/discovered")).await;
    assert_eq!(status, StatusCode::OK);
    // The template plus two clones.
    assert_eq!(discovered["items"].as_array().unwrap().len(), 3);

    let (status, body) = send(
        &router,
        post_json(
            &format!("/v1/sessions/{session}/runs"),
            json!({ "status_filter": "failed", "max_parallel": 2 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "no_assignees");

    let (status, accepted) = send(
        &router,
        post_json(
            &format!("/v1/sessions/{session}/runs"),
            json!({ "status_filter": "pending" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["status"], "scheduled");
    assert_eq!(accepted["groups_planned"], 2);
    assert_eq!(accepted["total_assignees"], 7);
    assert_eq!(accepted["max_parallel"], 1);

    let session_id: SessionId = session.parse().unwrap();
    wait_for_run(state.scheduler(), session_id).await;

    let (status, run) = send(&router, get(&format!("/v1/sessions/{session}/runs"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "finished");
    assert_eq!(run["job_id"], accepted["job_id"]);
    assert_eq!(run["task_alive"], false);

    let (_, completed) = send(&router, get("/v1/assignees?status=completed")).await;
    assert_eq!(completed["items"].as_array().unwrap().len(), 7);

    let (status, body) = send(
        &router,
        post_json(
            &format!("/v1/sessions/{session}/runs"),
            json!({ "status_filter": "all" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");
}

#[tokio::test]
async fn request_validation() {
    let fleet = Fleet::new();
    let (_, router) = fleet.router();
    let session = open_session(&router).await;

    let (status, body) = send(
        &router,
        post_json(
            &format!("/v1/sessions/{session}/runs"),
            json!({ "status_filter": "someday" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_status_filter");

    let (status, body) = send(
        &router,
        post_json(
            &format!("/v1/sessions/{session}/assignees"),
            json!({ "assignees": [] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "empty_batch");

    let (status, body) = send(
        &router,
        post_json(
            &format!("/v1/sessions/{session}/units/clone"),
            json!({ "count": 0 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_count");

    let (status, body) = send(
        &router,
        post_json(
            &format!("/v1/sessions/{session}/units/clone"),
            json!({ "count": 1u64 << 40 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_count");

    let (status, _) = send(&router, get("/v1/assignees?status=someday")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn clone_endpoint_copies_the_template() {
    let fleet = Fleet::new();
    fleet.write_template();
    let (_, router) = fleet.router();
    let session = open_session(&router).await;

    let (status, body) = send(
        &router,
        post_json(
            &format!("/v1/sessions/{session}/units/clone"),
            json!({ "count": 2 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        body["created"],
        json!([format!("{TEMPLATE}_Clone1"), format!("{TEMPLATE}_Clone2")])
    );
    assert!(fleet
        .avd_home
        .path()
        .join(format!("{TEMPLATE}_Clone2.ini"))
        .is_file());
}

#[tokio::test]
async fn deleted_session_is_gone() {
    let fleet = Fleet::new();
    let (_, router) = fleet.router();
    let session = open_session(&router).await;

    let (status, body) = send(&router, delete(&format!("/v1/sessions/{session}"))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_null());

    let (status, _) = send(&router, delete(&format!("/v1/sessions/{session}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&router, get(&format!("/v1/sessions/{session}/events"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn event_stream_opens_with_stream_opened() {
    use futures_util::StreamExt;
    use tower::ServiceExt;

    let fleet = Fleet::new();
    let (_, router) = fleet.router();
    let session = open_session(&router).await;

    let response = router
        .clone()
        .oneshot(get(&format!("/v1/sessions/{session}/events")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/event-stream"
    );

    let mut frames = response.into_body().into_data_stream();
    let first = frames.next().await.unwrap().unwrap();
    let first = String::from_utf8_lossy(&first);
    assert!(first.contains("event: stream.opened"));
    assert!(first.contains(&session));
}
