use roundtable::client::RequestError;
use roundtable::model::EntryKind;
use roundtable_node::adapters::ROLL_CALL_PROMPT;
use roundtable_tests::harness::{
    client::TestClient, endpoint::FakeEndpoint, node::TestNode, poll_history_until,
    rendezvous::TestRendezvous, texts,
};
use std::time::Duration;

#[tokio::test]
async fn scan_binds_known_endpoints_only() {
    let rv = TestRendezvous::spawn().await.unwrap();
    let endpoints = tempfile::TempDir::new().unwrap();
    let _claude = FakeEndpoint::spawn(endpoints.path(), "claude", "https://claude.ai/new").unwrap();
    let _other = FakeEndpoint::spawn(endpoints.path(), "other", "https://example.com/").unwrap();

    let node = TestNode::spawn_with_endpoints(&rv.rendezvous_addr(), endpoints.path())
        .await
        .unwrap();
    let mut client = TestClient::connect(&node.socket_path).await.unwrap();

    let agents = client.scan().await.unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].key, "claude");
    assert_eq!(agents[0].name, "Claude");
    assert!(agents[0].enabled);
    assert_eq!(client.agents().await.unwrap(), agents);
}

#[tokio::test]
async fn roll_call_sends_fixed_prompt() {
    let rv = TestRendezvous::spawn().await.unwrap();
    let endpoints = tempfile::TempDir::new().unwrap();
    let claude = FakeEndpoint::spawn(endpoints.path(), "claude", "https://claude.ai/new").unwrap();
    let node = TestNode::spawn_with_endpoints(&rv.rendezvous_addr(), endpoints.path())
        .await
        .unwrap();
    let mut client = TestClient::connect(&node.socket_path).await.unwrap();
    client.scan().await.unwrap();

    let result = client.roll_call().await.unwrap();
    assert_eq!(result.dispatched, ["Claude"]);
    assert_eq!(texts(&client.history().await.unwrap()), [ROLL_CALL_PROMPT]);

    let prompts = claude.wait_prompts(1, Duration::from_secs(3)).await;
    assert_eq!(prompts, [ROLL_CALL_PROMPT]);
}

#[tokio::test]
async fn harvest_appends_reply_once() {
    let rv = TestRendezvous::spawn().await.unwrap();
    let endpoints = tempfile::TempDir::new().unwrap();
    let claude = FakeEndpoint::spawn(endpoints.path(), "claude", "https://claude.ai/new").unwrap();
    claude.set_reply("I am Claude.");
    let node = TestNode::spawn_with_endpoints(&rv.rendezvous_addr(), endpoints.path())
        .await
        .unwrap();
    let mut client = TestClient::connect(&node.socket_path).await.unwrap();
    client.scan().await.unwrap();

    client.harvest().await.unwrap();
    let history = poll_history_until(&mut client, 1, Duration::from_secs(3)).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].sender, "Claude");
    assert_eq!(history[0].text, "I am Claude.");
    assert_eq!(history[0].kind, EntryKind::Agent("claude".to_string()));

    client.harvest().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.history().await.unwrap().len(), 1);
}

#[tokio::test]
async fn harvest_without_agents_reports_no_agents() {
    let rv = TestRendezvous::spawn().await.unwrap();
    let node = TestNode::spawn(&rv.rendezvous_addr()).await.unwrap();
    let mut client = TestClient::connect(&node.socket_path).await.unwrap();

    let err = client.harvest().await.unwrap_err();
    assert_eq!(err.downcast::<RequestError>().unwrap().code, "no_agents");
}

#[tokio::test]
async fn history_and_username_survive_restart() {
    let rv = TestRendezvous::spawn().await.unwrap();
    let node = TestNode::spawn(&rv.rendezvous_addr()).await.unwrap();
    {
        let mut client = TestClient::connect(&node.socket_path).await.unwrap();
        client.set_username("Ada").await.unwrap();
        client.say("first").await.unwrap();
        client.say("second").await.unwrap();
    }

    let node = node.restart(&rv.rendezvous_addr()).await.unwrap();
    let mut client = TestClient::connect(&node.socket_path).await.unwrap();
    let history = client.history().await.unwrap();
    assert_eq!(texts(&history), ["first", "second"]);
    assert!(history.iter().all(|e| e.sender == "Ada"));
    assert_eq!(client.status().await.unwrap().username, "Ada");
}
