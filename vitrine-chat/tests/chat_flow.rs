//! A support conversation where one side writes through the service and the
//! other side's writes arrive as pushed change events.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use vitrine_cache::{CacheStore, MutationCall, MutationEndpoint, ReconciliationEngine, StoreConfig};
use vitrine_chat::{messages_key, sessions_key, ChatService, ChatSession, ChatSide, ChatStatus, Sender};
use vitrine_core::{ChangeEvent, EntityType, MutationError};

struct AcceptAll;

#[async_trait]
impl MutationEndpoint for AcceptAll {
    async fn submit(&self, _call: MutationCall) -> Result<Option<Value>, MutationError> {
        Ok(None)
    }
}

fn setup() -> (Arc<CacheStore>, ReconciliationEngine, ChatService) {
    let store = Arc::new(CacheStore::new(StoreConfig::default()));
    let session = serde_json::to_value(vec![ChatSession::new("s1", "cus_1")])
        .expect("session should serialize");
    store.set(&sessions_key("cus_1"), |_| Some(session));
    store.set(&messages_key("s1"), |_| Some(json!([])));
    let engine = ReconciliationEngine::new(store.clone());
    let service = ChatService::new(store.clone(), Arc::new(AcceptAll), "cus_1", Duration::from_secs(1));
    (store, engine, service)
}

#[tokio::test]
async fn test_pushed_admin_reply_is_unread_until_viewed() {
    let (_store, engine, service) = setup();

    engine.apply(
        &sessions_key("cus_1"),
        &ChangeEvent::update(
            EntityType::ChatSession,
            "s1",
            json!({"id": "s1", "status": "active", "participant_ref": "admin-a"}),
        ),
    );
    let session = service.session("s1").expect("session should decode");
    assert_eq!(session.status, ChatStatus::Active);

    service
        .send_message("s1", ChatSide::Customer, "Where is my parcel?")
        .await
        .expect("send should succeed");

    let reply_at = Utc::now() + ChronoDuration::seconds(5);
    engine.apply(
        &messages_key("s1"),
        &ChangeEvent::insert(
            EntityType::ChatMessage,
            "m-admin",
            json!({
                "id": "m-admin",
                "session_id": "s1",
                "sender": "admin",
                "body": "It left the depot this morning.",
                "created_at": reply_at,
            }),
        ),
    );

    let preview = service.preview("s1", 1).expect("preview should decode");
    assert_eq!(preview[0].sender, Sender::Admin);
    assert_eq!(service.unread_count("s1", ChatSide::Customer), Ok(1));

    let viewer = service
        .begin_viewing("s1", ChatSide::Customer)
        .expect("active session can be viewed");
    assert_eq!(viewer.mark_all_read().await, Ok(1));

    let transcript = service.transcript("s1").expect("transcript should decode");
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript.messages()[0].sender, Sender::Customer);
    assert!(transcript.messages()[1].is_read);
    assert_eq!(transcript.unread_count(ChatSide::Admin), 1);
}

#[tokio::test]
async fn test_close_then_rate_once() {
    let (_store, _engine, service) = setup();
    service.accept("s1", "admin-a").await.expect("accept should succeed");
    service.close("s1").await.expect("close should succeed");

    assert!(service
        .send_message("s1", ChatSide::Customer, "one more thing")
        .await
        .is_err());
    assert_eq!(service.rate("s1", 4).await, Ok(vitrine_chat::RatingOutcome::Attached));
    assert_eq!(
        service.rate("s1", 1).await,
        Ok(vitrine_chat::RatingOutcome::AlreadyRated)
    );
    assert!(service.accept("s1", "admin-b").await.is_err());
}
