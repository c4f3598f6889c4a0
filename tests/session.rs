use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tempfile::{ tempdir, TempDir };
use tokio::sync::mpsc::UnboundedReceiver;

use local_chat_relay::config::settings::SettingsStore;
use local_chat_relay::history::{ FileHistoryStore, HistoryStore };
use local_chat_relay::llm::chat::{ BoxError, TokenStream };
use local_chat_relay::llm::{ BackendOptions, LlmType, RetryPolicy, SimulatedOptions };
use local_chat_relay::models::chat::{ Message, Role };
use local_chat_relay::models::settings::Settings;
use local_chat_relay::relay::{ ChatRelay, Relay };
use local_chat_relay::session::{ SessionController, SessionError, SessionEvent };

fn simulated_settings() -> Settings {
    Settings {
        backend: LlmType::Simulated,
        api_endpoint: "http://localhost:11434".to_string(),
        model: "local".to_string(),
        temperature: 0.7,
        max_tokens: 500,
        top_p: 1.0,
    }
}

async fn make_store(temp: &TempDir) -> Arc<dyn HistoryStore> {
    Arc::new(FileHistoryStore::new(temp.path().join("chats")).await.unwrap())
}

fn simulated_relay(temp: &TempDir, reply: &str) -> Arc<dyn ChatRelay> {
    let settings = Arc::new(SettingsStore::new(temp.path().join("settings.json"), simulated_settings()));
    let options = BackendOptions {
        api_key: None,
        retry: RetryPolicy::none(),
        simulated: SimulatedOptions { reply: Some(reply.to_string()), delay: Duration::ZERO },
    };
    Arc::new(Relay::new(settings, options, None))
}

/// Yields a few tokens and then fails.
struct FailingRelay;

#[async_trait]
impl ChatRelay for FailingRelay {
    async fn stream(&self, _: &[Message], _: Option<&Settings>) -> Result<TokenStream, BoxError> {
        let items: Vec<Result<String, BoxError>> = vec![
            Ok("par".to_string()),
            Ok("tial".to_string()),
            Err("backend unreachable".into())
        ];
        Ok(Box::pin(stream::iter(items)))
    }
}

/// Never produces a token.
struct StalledRelay;

#[async_trait]
impl ChatRelay for StalledRelay {
    async fn stream(&self, _: &[Message], _: Option<&Settings>) -> Result<TokenStream, BoxError> {
        Ok(Box::pin(stream::pending::<Result<String, BoxError>>()))
    }
}

fn drain(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn send_streams_reply_and_saves() {
    let temp = tempdir().unwrap();
    let store = make_store(&temp).await;
    let (mut session, mut events) = SessionController::new(
        Arc::clone(&store),
        simulated_relay(&temp, "Hello, world")
    );

    let reply = session.send("Say hello").await.unwrap();
    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(reply.content, "Hello, world");
    assert_eq!(session.messages().len(), 2);

    let events = drain(&mut events);
    assert!(matches!(events.first(), Some(SessionEvent::MessageAdded(m)) if m.content == "Say hello"));
    let chunks: String = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Chunk { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, "Hello, world");
    assert!(events.iter().any(|e| matches!(e, SessionEvent::StreamFinished { id } if *id == reply.id)));
    assert!(matches!(events.last(), Some(SessionEvent::Saved { title, .. }) if title == "Say hello"));

    let stored = store.get(session.conversation_id()).await.unwrap();
    assert_eq!(stored.messages, session.messages());
}

#[tokio::test]
async fn edit_then_reload_keeps_id_and_role() {
    let temp = tempdir().unwrap();
    let store = make_store(&temp).await;
    let relay = simulated_relay(&temp, "first answer");
    let (mut session, _events) = SessionController::new(Arc::clone(&store), Arc::clone(&relay));

    let reply = session.send("question").await.unwrap();
    session.edit_message(&reply.id, "edited answer").await.unwrap();

    let (mut reloaded, _events) = SessionController::new(Arc::clone(&store), relay);
    reloaded.load_conversation(session.conversation_id()).await.unwrap();
    let message = reloaded.messages().iter().find(|m| m.id == reply.id).unwrap();
    assert_eq!(message.content, "edited answer");
    assert_eq!(message.role, Role::Assistant);
}

#[tokio::test]
async fn delete_message_persists() {
    let temp = tempdir().unwrap();
    let store = make_store(&temp).await;
    let (mut session, mut events) = SessionController::new(
        Arc::clone(&store),
        simulated_relay(&temp, "ok")
    );

    let reply = session.send("hi").await.unwrap();
    drain(&mut events);
    session.delete_message(&reply.id).await.unwrap();

    let events = drain(&mut events);
    assert!(matches!(&events[0], SessionEvent::MessageRemoved { id } if *id == reply.id));
    let stored = store.get(session.conversation_id()).await.unwrap();
    assert_eq!(stored.messages.len(), 1);
    assert_eq!(stored.messages[0].role, Role::User);

    assert!(matches!(
        session.delete_message("missing").await,
        Err(SessionError::MessageNotFound(_))
    ));
}

#[tokio::test]
async fn regenerate_replaces_the_reply_and_keeps_the_question() {
    let temp = tempdir().unwrap();
    let store = make_store(&temp).await;
    let (mut session, _events) = SessionController::new(
        Arc::clone(&store),
        simulated_relay(&temp, "again")
    );

    let first = session.send("question").await.unwrap();
    session.add_message(Role::User, "follow-up");
    let question_id = session.messages()[0].id.clone();

    let second = session.regenerate(&first.id).await.unwrap();
    assert_ne!(second.id, first.id);

    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, question_id);
    assert_eq!(messages[1].id, second.id);
    assert_eq!(messages[1].content, "again");

    let stored = store.get(session.conversation_id()).await.unwrap();
    assert_eq!(stored.messages.len(), 2);
}

#[tokio::test]
async fn invalid_regenerate_changes_nothing_and_notifies() {
    let temp = tempdir().unwrap();
    let store = make_store(&temp).await;
    let (mut session, mut events) = SessionController::new(store, simulated_relay(&temp, "x"));

    session.add_message(Role::Assistant, "greeting");
    let second = session.add_message(Role::Assistant, "another");
    let user = session.add_message(Role::User, "question");
    let before = session.messages().to_vec();
    drain(&mut events);

    for target in [before[0].id.as_str(), second.id.as_str(), user.id.as_str(), "unknown"] {
        let result = session.regenerate(target).await;
        assert!(matches!(result, Err(SessionError::InvalidRegenerateTarget)));
    }

    assert_eq!(session.messages(), before.as_slice());
    let events = drain(&mut events);
    assert_eq!(events.len(), 4);
    assert!(events.iter().all(|e| matches!(e, SessionEvent::Notice(_))));
}

#[tokio::test]
async fn failed_stream_removes_placeholder_and_is_not_saved() {
    let temp = tempdir().unwrap();
    let store = make_store(&temp).await;
    let (mut session, mut events) = SessionController::new(Arc::clone(&store), Arc::new(FailingRelay));

    let err = session.send("hi").await.unwrap_err();
    assert!(matches!(err, SessionError::Relay(ref msg) if msg.contains("backend unreachable")));

    assert_eq!(session.messages().len(), 1);
    assert_eq!(session.messages()[0].role, Role::User);

    let events = drain(&mut events);
    assert!(
        events.iter().any(|e| {
            matches!(e, SessionEvent::StreamFailed { error, .. } if error.contains("backend unreachable"))
        })
    );
    assert!(!events.iter().any(|e| matches!(e, SessionEvent::Saved { .. })));
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn stalled_stream_times_out() {
    let temp = tempdir().unwrap();
    let store = make_store(&temp).await;
    let (session, _events) = SessionController::new(store, Arc::new(StalledRelay));
    let mut session = session.with_chunk_timeout(Duration::from_millis(50));

    let err = session.send("hi").await.unwrap_err();
    assert!(matches!(err, SessionError::Timeout(_)));
    assert_eq!(session.messages().len(), 1);
}

#[tokio::test]
async fn new_and_load_switch_conversations() {
    let temp = tempdir().unwrap();
    let store = make_store(&temp).await;
    let (mut session, mut events) = SessionController::new(
        Arc::clone(&store),
        simulated_relay(&temp, "ok")
    );

    session.send("first chat").await.unwrap();
    let first_id = session.conversation_id().to_string();

    let second_id = session.new_conversation().to_string();
    assert_ne!(first_id, second_id);
    assert!(session.messages().is_empty());
    session.send("second chat").await.unwrap();

    session.load_conversation(&first_id).await.unwrap();
    assert_eq!(session.conversation_id(), first_id);
    assert_eq!(session.messages()[0].content, "first chat");
    assert_eq!(session.title(), Some("first chat"));

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(e, SessionEvent::Reset { id } if *id == second_id)));
    assert!(
        matches!(events.last(), Some(SessionEvent::Loaded { id, message_count: 2 }) if *id == first_id)
    );
    assert_eq!(store.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn empty_messages_are_not_sent() {
    let temp = tempdir().unwrap();
    let store = make_store(&temp).await;
    let (mut session, _events) = SessionController::new(store, simulated_relay(&temp, "x"));

    assert!(matches!(session.send("   ").await, Err(SessionError::EmptyMessage)));
    assert!(session.messages().is_empty());
}
