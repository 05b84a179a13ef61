//! End-to-end behaviour of the hub over fake servers and a mock model.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::{config_for, search_schema, FakeConnector, FakeServer, MockModel};
use mcp_hub::agent_loop::{InvocationOutcome, TurnRequest, TurnStatus};
use mcp_hub::connection::{ConnectOutcome, ConnectionState};
use mcp_hub::error::{ErrorCategory, FailureKind, HubError, NotFoundKind};
use mcp_hub::mcp::{McpPrompt, McpTool, PromptArgument, ToolOutcome};
use mcp_hub::McpHub;

fn two_server_hub(model: Arc<MockModel>) -> (McpHub, FakeServer, FakeServer) {
    let a = FakeServer::new()
        .tool("search", search_schema())
        .result("search", ToolOutcome::structured(json!({ "hits": [] })));
    let b = FakeServer::new().tool("fetch", json!({ "type": "object" }));
    let connector = FakeConnector::new()
        .with("A", a.clone())
        .with("B", b.clone());
    let hub = McpHub::new(&config_for(&["A", "B"]), Arc::new(connector), model)
        .expect("hub should build");
    (hub, a, b)
}

#[tokio::test]
async fn connect_is_idempotent_and_disconnect_tolerates_unknown_servers() {
    let (hub, _, _) = two_server_hub(Arc::new(MockModel::new()));

    assert_eq!(hub.connect("A").await.unwrap(), ConnectOutcome::Established);
    let before = hub.snapshot(None).await.unwrap();
    assert_eq!(hub.connect("A").await.unwrap(), ConnectOutcome::AlreadyConnected);
    let after = hub.snapshot(None).await.unwrap();
    assert_eq!(before.tools, after.tools);

    assert!(hub.disconnect(Some("nope")).await.is_empty());
    hub.disconnect(Some("A")).await;
    assert!(hub.disconnect(Some("A")).await.is_empty());
    assert_eq!(
        hub.connections().state("A").await,
        Some(ConnectionState::Disconnected)
    );
}

#[tokio::test]
async fn failed_refresh_on_one_server_leaves_the_other_untouched() {
    let (hub, a, _) = two_server_hub(Arc::new(MockModel::new()));
    hub.connect("A").await.unwrap();
    hub.connect("B").await.unwrap();
    let b_before: Vec<_> = hub
        .snapshot(Some("B"))
        .await
        .unwrap()
        .tools
        .into_iter()
        .map(|entry| entry.tool)
        .collect();

    a.break_tool_listing("pipe closed");
    let report = hub.refresh(Some("A")).await.unwrap().remove(0);
    assert!(!report.is_complete());

    let snapshot = hub.snapshot(None).await.unwrap();
    let a_tools: Vec<&str> = snapshot
        .tools_for("A")
        .map(|entry| entry.tool.name.as_str())
        .collect();
    assert_eq!(a_tools, vec!["search"], "last good catalog is kept");
    let b_after: Vec<_> = snapshot.tools_for("B").map(|entry| entry.tool.clone()).collect();
    assert_eq!(b_after, b_before);
    assert_eq!(snapshot.stale.len(), 1);
    assert_eq!(snapshot.stale[0].server, "A");
}

#[tokio::test]
async fn aggregate_is_the_tagged_union_of_connected_catalogs() {
    let (hub, a, _) = two_server_hub(Arc::new(MockModel::new()));
    hub.connect("B").await.unwrap();
    hub.connect("A").await.unwrap();

    let snapshot = hub.snapshot(None).await.unwrap();
    let tagged: Vec<(String, String)> = snapshot
        .tools
        .iter()
        .map(|entry| (entry.server.clone(), entry.tool.name.clone()))
        .collect();
    assert_eq!(
        tagged,
        vec![
            ("B".to_string(), "fetch".to_string()),
            ("A".to_string(), "search".to_string()),
        ]
    );

    a.replace_tools(vec![McpTool::new("lookup", "Lookup", json!({}))]);
    hub.refresh(Some("A")).await.unwrap();
    hub.disconnect(Some("B")).await;

    let snapshot = hub.snapshot(None).await.unwrap();
    let names: Vec<&str> = snapshot
        .tools
        .iter()
        .map(|entry| entry.tool.name.as_str())
        .collect();
    assert_eq!(names, vec!["lookup"]);
    assert!(snapshot.tools.iter().all(|entry| entry.server == "A"));
}

#[tokio::test]
async fn tool_is_routed_only_to_its_own_server() {
    let (hub, a, b) = two_server_hub(Arc::new(MockModel::new()));
    hub.connect("A").await.unwrap();
    hub.connect("B").await.unwrap();

    let err = hub
        .call_tool("A", "fetch", json!({}))
        .await
        .expect_err("fetch lives on B");
    assert!(matches!(
        err,
        HubError::NotFound { kind: NotFoundKind::Tool, ref server, ref name }
            if server == "A" && name == "fetch"
    ));
    assert!(a.calls().is_empty());
    assert!(b.calls().is_empty());

    let arguments = json!({ "q": "rust", "extra": [1, 2, 3] });
    hub.call_tool("A", "search", arguments.clone()).await.unwrap();
    let calls = a.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "search");
    assert_eq!(
        serde_json::Value::Object(calls[0].1.clone().unwrap()),
        arguments,
        "arguments are forwarded unmodified"
    );
}

#[tokio::test]
async fn invalid_arguments_never_reach_the_server() {
    let (hub, a, _) = two_server_hub(Arc::new(MockModel::new()));
    hub.connect("A").await.unwrap();

    let err = hub
        .call_tool("A", "search", json!({ "q": 7 }))
        .await
        .expect_err("q must be a string");
    assert!(matches!(err, HubError::SchemaValidation { .. }));
    assert!(a.calls().is_empty());
}

#[tokio::test]
async fn model_turn_runs_the_tool_and_answers_from_its_result() {
    let model = Arc::new(MockModel::new());
    model.queue_tool_call("toolu_1", "A__search", json!({ "q": "x" }));
    model.queue_text("No results for x.");
    let (hub, a, _) = two_server_hub(Arc::clone(&model));
    hub.connect("A").await.unwrap();
    hub.connect("B").await.unwrap();

    let result = hub
        .send_prompt(TurnRequest::new("search for x"))
        .await
        .unwrap();

    assert_eq!(result.status, TurnStatus::Completed);
    assert_eq!(result.response, "No results for x.");
    assert_eq!(result.tool_calls.len(), 1);
    assert!(matches!(
        &result.tool_calls[0].outcome,
        InvocationOutcome::Ok { result } if result.structured == Some(json!({ "hits": [] }))
    ));
    assert_eq!(a.calls().len(), 1);
    assert_eq!(model.requests().len(), 2);
}

#[tokio::test]
async fn endless_tool_requests_stop_at_the_round_limit() {
    let model = Arc::new(MockModel::new());
    for i in 0..20 {
        model.queue_tool_call(&format!("c{i}"), "A__search", json!({ "q": "more" }));
    }
    let mut config = config_for(&["A"]);
    config.settings.max_tool_rounds = 4;
    let a = FakeServer::new().tool("search", search_schema());
    let hub = McpHub::new(
        &config,
        Arc::new(FakeConnector::new().with("A", a)),
        model.clone(),
    )
    .unwrap();
    hub.connect("A").await.unwrap();

    let result = hub.send_prompt(TurnRequest::new("go")).await.unwrap();

    assert_eq!(result.status, TurnStatus::LoopLimitExceeded);
    assert_eq!(result.rounds, 4);
    assert_eq!(model.requests().len(), 4);
    assert!(matches!(
        result.into_result(),
        Err(HubError::ConversationLoopLimitExceeded { rounds: 4, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn disconnect_resolves_an_in_flight_call() {
    let a = FakeServer::new()
        .tool("search", search_schema())
        .slow_calls(Duration::from_secs(60));
    let mut config = config_for(&["A"]);
    config.settings.call_timeout_ms = 5_000;
    let hub = Arc::new(
        McpHub::new(
            &config,
            Arc::new(FakeConnector::new().with("A", a.clone())),
            Arc::new(MockModel::new()),
        )
        .unwrap(),
    );
    hub.connect("A").await.unwrap();

    let call = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move { hub.call_tool("A", "search", json!({ "q": "x" })).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    hub.disconnect(Some("A")).await;

    let started = tokio::time::Instant::now();
    let err = call
        .await
        .expect("call task should finish")
        .expect_err("call cannot succeed after disconnect");
    assert!(started.elapsed() <= Duration::from_secs(5));
    assert!(matches!(err, HubError::ToolExecution { .. }));
    assert!(a.is_closed());
    assert_eq!(
        hub.connections().state("A").await,
        Some(ConnectionState::Disconnected)
    );
}

#[tokio::test(start_paused = true)]
async fn slow_tool_times_out_with_a_timeout_kind() {
    let a = FakeServer::new()
        .tool("search", search_schema())
        .slow_calls(Duration::from_secs(60));
    let mut config = config_for(&["A"]);
    config.settings.call_timeout_ms = 5_000;
    let hub = McpHub::new(
        &config,
        Arc::new(FakeConnector::new().with("A", a)),
        Arc::new(MockModel::new()),
    )
    .unwrap();
    hub.connect("A").await.unwrap();

    let err = hub
        .call_tool("A", "search", json!({ "q": "x" }))
        .await
        .expect_err("call should time out");

    assert!(matches!(
        err,
        HubError::ToolExecution { kind: FailureKind::Timeout { timeout_ms: 5000 }, .. }
    ));
    assert_eq!(err.category(), ErrorCategory::Timeout);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn prompts_and_resources_route_to_their_server() {
    let prompt = McpPrompt {
        name: "summarize".into(),
        description: Some("Summarize a topic".into()),
        arguments: Some(vec![PromptArgument {
            name: "topic".into(),
            description: None,
            required: Some(true),
        }]),
    };
    let docs = FakeServer::new().prompt(prompt).resource("docs://readme");
    let hub = McpHub::new(
        &config_for(&["docs"]),
        Arc::new(FakeConnector::new().with("docs", docs)),
        Arc::new(MockModel::new()),
    )
    .unwrap();
    hub.connect("docs").await.unwrap();

    let rendered = hub
        .get_prompt("docs", "summarize", json!({ "topic": "rust" }))
        .await
        .unwrap();
    assert_eq!(rendered[0].text, "summarize: rust");

    let missing = hub
        .get_prompt("docs", "summarize", json!({}))
        .await
        .expect_err("topic is required");
    assert!(matches!(missing, HubError::SchemaValidation { .. }));

    let contents = hub.read_resource("docs", "docs://readme").await.unwrap();
    assert_eq!(contents[0].text, "# docs://readme");

    let snapshot = hub.snapshot(Some("docs")).await.unwrap();
    assert_eq!(snapshot.prompts.len(), 1);
    assert_eq!(snapshot.resources[0].server, "docs");
}

#[tokio::test]
async fn refused_connection_is_scoped_to_that_server() {
    let a = FakeServer::new().tool("search", search_schema());
    let hub = McpHub::new(
        &config_for(&["A", "down"]),
        Arc::new(FakeConnector::new().with("A", a)),
        Arc::new(MockModel::new()),
    )
    .unwrap();

    let results = hub.connect_all().await;

    assert!(results[0].1.is_ok());
    assert!(matches!(results[1].1, Err(HubError::Connection { .. })));
    let statuses = hub.statuses().await;
    assert_eq!(statuses[1].state, ConnectionState::Error);
    assert!(statuses[1].last_error.is_some());
    assert_eq!(hub.connected_servers().await, vec!["A".to_string()]);
}
