// HTTP program runtime adapter against a mock server

use common::errors::RuntimeError;
use common::models::{LaunchArguments, ProgramId, RunId};
use common::runtime::{HttpProgramRuntime, ProgramRuntime};
use serde_json::json;
use std::collections::BTreeMap;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn program() -> ProgramId {
    ProgramId::new("default", "etl", "loader")
}

#[tokio::test]
async fn test_launch_posts_arguments_and_returns_run_id() {
    let server = MockServer::start().await;

    let mut system_args = BTreeMap::new();
    system_args.insert("schedule.name".to_string(), "nightly".to_string());
    let mut user_args = BTreeMap::new();
    user_args.insert("output".to_string(), "/data".to_string());
    let arguments = LaunchArguments {
        system_args,
        user_args,
    };

    Mock::given(method("POST"))
        .and(path("/v3/namespaces/default/apps/etl/programs/loader/start"))
        .and(body_json(json!({
            "system_args": {"schedule.name": "nightly"},
            "user_args": {"output": "/data"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"run_id": "run-42"})))
        .expect(1)
        .mount(&server)
        .await;

    let runtime = HttpProgramRuntime::new(server.uri(), 5).unwrap();
    let run_id = runtime.launch(&program(), &arguments).await.unwrap();
    assert_eq!(run_id, RunId::from("run-42"));
}

#[tokio::test]
async fn test_launch_of_missing_program() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v3/namespaces/default/apps/etl/programs/loader/start"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let runtime = HttpProgramRuntime::new(server.uri(), 5).unwrap();
    let err = runtime
        .launch(&program(), &LaunchArguments::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::ProgramNotFound(_)));
}

#[tokio::test]
async fn test_launch_server_error_carries_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let runtime = HttpProgramRuntime::new(format!("{}/", server.uri()), 5).unwrap();
    let err = runtime
        .launch(&program(), &LaunchArguments::default())
        .await
        .unwrap_err();
    match err {
        RuntimeError::UnexpectedStatus { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body, "overloaded");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_launch_rejects_malformed_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let runtime = HttpProgramRuntime::new(server.uri(), 5).unwrap();
    let result = runtime.launch(&program(), &LaunchArguments::default()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_list_active_runs() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v3/namespaces/default/apps/etl/programs/loader/runs"))
        .and(query_param("status", "running"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"run_id": "a"},
            {"run_id": "b"},
            {"run_id": "a"}
        ])))
        .mount(&server)
        .await;

    let runtime = HttpProgramRuntime::new(server.uri(), 5).unwrap();
    let runs = runtime.list_active_runs(&program()).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.contains(&RunId::from("a")));
    assert!(runs.contains(&RunId::from("b")));
}

#[tokio::test]
async fn test_unreachable_runtime_is_request_failure() {
    // Nothing listens on this port once the server is dropped
    let uri = {
        let server = MockServer::start().await;
        server.uri()
    };

    let runtime = HttpProgramRuntime::new(uri, 1).unwrap();
    let err = runtime.list_active_runs(&program()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::RequestFailed(_)));
}
