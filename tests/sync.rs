#![cfg(feature = "async")]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use atomflow::sync::{ChannelClient, ChannelTransport, ServerMessage, Session, SyncHub};
use atomflow::{
    Atom, Component, DirectiveRegistry, DirectiveSpec, EngineConfig, RetryPolicy, Workflow,
};
use serde_json::{Value, json};

fn registry() -> Arc<DirectiveRegistry> {
    let mut registry = DirectiveRegistry::new();
    registry
        .register(DirectiveSpec::new("slider"))
        .register(DirectiveSpec::new("text"));
    Arc::new(registry)
}

fn build_workflow(config: &EngineConfig) -> atomflow::Result<Workflow> {
    let mut workflow = Workflow::with_config(config, registry())
        .with_default_retry_policy(RetryPolicy::no_retry());
    workflow.register(Atom::new("threshold", |ctx| {
        Ok(ctx.directive_with_id("slider", "threshold", json!({ "value": 5 }))?)
    }));
    workflow.register(
        Atom::new("label", |ctx| {
            let threshold: i64 = ctx.arg_as("threshold")?;
            Ok(ctx.directive("text", json!({ "value": format!("threshold={}", threshold) }))?)
        })
        .with_params(["threshold"]),
    );
    workflow.register(Atom::new("note", |ctx| {
        Ok(ctx.directive("text", json!({ "value": "static" }))?)
    }));
    Ok(workflow)
}

fn hub(config: EngineConfig) -> SyncHub {
    SyncHub::new(config, build_workflow)
}

async fn next_components(client: &mut ChannelClient) -> Vec<Component> {
    match client.receive().await.unwrap() {
        Some(ServerMessage::Components { batch }) => batch.decode().unwrap(),
        other => panic!("expected components, got {:?}", other),
    }
}

fn slider_id(session: &Session) -> String {
    session
        .workflow()
        .producers()
        .iter()
        .find(|(_, atom)| atom.as_str() == "threshold")
        .map(|(id, _)| id.clone())
        .unwrap()
}

fn payload_values(components: &[Component]) -> Vec<Value> {
    components
        .iter()
        .map(|component| component.payload["value"].clone())
        .collect()
}

#[tokio::test]
async fn test_update_delivers_only_changed_components() {
    let hub = hub(EngineConfig::default());
    let (transport, mut client) = ChannelTransport::pair();
    let mut session = hub.open_session(transport).unwrap();

    session.initial_render().await.unwrap();
    let initial = next_components(&mut client).await;
    assert_eq!(
        payload_values(&initial),
        vec![json!(5), json!("threshold=5"), json!("static")]
    );

    let id = slider_id(&session);
    let changed = session
        .handle_update(BTreeMap::from([(id.clone(), json!(9))]))
        .await
        .unwrap();
    assert_eq!(changed, BTreeMap::from([(id, json!(9))]));

    let update = next_components(&mut client).await;
    assert_eq!(payload_values(&update), vec![json!(9), json!("threshold=9")]);
}

#[tokio::test]
async fn test_repeated_value_is_not_an_update() {
    let hub = hub(EngineConfig::default());
    let (transport, mut client) = ChannelTransport::pair();
    let mut session = hub.open_session(transport).unwrap();
    session.initial_render().await.unwrap();
    next_components(&mut client).await;

    let id = slider_id(&session);
    session
        .handle_update(BTreeMap::from([(id.clone(), json!(9))]))
        .await
        .unwrap();
    next_components(&mut client).await;

    let changed = session
        .handle_update(BTreeMap::from([(id, json!(9))]))
        .await
        .unwrap();
    assert!(changed.is_empty());
    assert!(client.try_receive().unwrap().is_none());
}

#[tokio::test]
async fn test_peer_session_replays_changes() {
    let hub = hub(EngineConfig::default());
    let (first_transport, mut first_client) = ChannelTransport::pair();
    let (second_transport, mut second_client) = ChannelTransport::pair();
    let mut first = hub.open_session(first_transport).unwrap();
    let second = hub.open_session(second_transport).unwrap();
    assert_eq!(hub.session_count(), 2);

    let second_task = tokio::spawn(second.run());
    let initial = next_components(&mut second_client).await;
    assert_eq!(initial.len(), 3);

    first.initial_render().await.unwrap();
    next_components(&mut first_client).await;

    let id = slider_id(&first);
    first
        .handle_update(BTreeMap::from([(id, json!(2))]))
        .await
        .unwrap();

    let replay = next_components(&mut second_client).await;
    assert_eq!(payload_values(&replay), vec![json!(2), json!("threshold=2")]);

    second_client.close();
    second_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_debounced_update_still_merges_state() {
    let config = EngineConfig {
        debounce_ms: 60_000,
        ..EngineConfig::default()
    };
    let hub = hub(config);
    let (transport, mut client) = ChannelTransport::pair();
    let mut session = hub.open_session(transport).unwrap();
    session.initial_render().await.unwrap();
    next_components(&mut client).await;

    let id = slider_id(&session);
    let changed = session
        .handle_update(BTreeMap::from([(id.clone(), json!(1))]))
        .await
        .unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(session.workflow().component_state().get(&id), Some(json!(1)));
    assert!(client.try_receive().unwrap().is_none());
}

#[tokio::test]
async fn test_malformed_message_reports_error() {
    let hub = hub(EngineConfig::default());
    let (transport, mut client) = ChannelTransport::pair();
    let session = hub.open_session(transport).unwrap();
    let task = tokio::spawn(session.run());
    next_components(&mut client).await;

    client.send_raw("{not json").await.unwrap();
    match client.receive().await.unwrap() {
        Some(ServerMessage::Error { message }) => assert!(!message.is_empty()),
        other => panic!("expected an error, got {:?}", other),
    }

    client.close();
    task.await.unwrap().unwrap();
}

fn counted_slider(name: &'static str, calls: &Arc<AtomicU32>) -> Atom {
    let calls = Arc::clone(calls);
    Atom::new(name, move |ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(ctx.directive_with_id("slider", name, json!({ "value": 0 }))?)
    })
}

#[tokio::test]
async fn test_independent_widgets_stay_selective_across_updates() {
    let a_calls = Arc::new(AtomicU32::new(0));
    let b_calls = Arc::new(AtomicU32::new(0));
    let (a_count, b_count) = (Arc::clone(&a_calls), Arc::clone(&b_calls));
    let hub = SyncHub::new(EngineConfig::default(), move |config: &EngineConfig| {
        let mut workflow = Workflow::with_config(config, registry())
            .with_default_retry_policy(RetryPolicy::no_retry());
        workflow.register(counted_slider("a", &a_count));
        workflow.register(counted_slider("b", &b_count));
        Ok(workflow)
    });
    let (transport, mut client) = ChannelTransport::pair();
    let mut session = hub.open_session(transport).unwrap();
    session.initial_render().await.unwrap();
    next_components(&mut client).await;

    let id_of = |session: &Session, atom: &str| {
        session
            .workflow()
            .producers()
            .iter()
            .find(|(_, producer)| producer.as_str() == atom)
            .map(|(id, _)| id.clone())
            .unwrap()
    };
    let a_id = id_of(&session, "a");
    let b_id = id_of(&session, "b");

    session
        .handle_update(BTreeMap::from([(b_id.clone(), json!(1))]))
        .await
        .unwrap();
    next_components(&mut client).await;
    assert_eq!(session.workflow().producer_of(&a_id), Some("a"));
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(b_calls.load(Ordering::SeqCst), 2);

    session
        .handle_update(BTreeMap::from([(a_id, json!(1))]))
        .await
        .unwrap();
    let update = next_components(&mut client).await;
    assert_eq!(payload_values(&update), vec![json!(1)]);
    assert_eq!(a_calls.load(Ordering::SeqCst), 2);
    assert_eq!(b_calls.load(Ordering::SeqCst), 2);
    assert_eq!(session.workflow().producer_of(&b_id), Some("b"));
}
