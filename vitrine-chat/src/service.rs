//! Chat operations over the shared cache.
//!
//! Sessions for one scope live in the `chat:sessions:<scope>` collection and
//! each transcript in `chat:messages:<session>`, newest first like every other
//! pushed collection. Transitions are validated locally, written
//! optimistically, then confirmed by the mutation endpoint.

use crate::session::{ChatSession, ChatSide, RatingOutcome};
use crate::transcript::{Message, Sender, Transcript};
use chrono::{Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use vitrine_cache::{CacheStore, MutationCall, MutationEndpoint, MutationOutcome, OptimisticMutationManager};
use vitrine_core::{identity_of, new_entity_id, ChatError, Timestamp};

pub fn sessions_key(scope: &str) -> String {
    format!("chat:sessions:{scope}")
}

pub fn messages_key(session_id: &str) -> String {
    format!("chat:messages:{session_id}")
}

fn decode_items<T: DeserializeOwned>(key: &str, value: Option<&Value>) -> Vec<T> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                debug!(key = %key, error = %e, "Skipping undecodable chat item");
                None
            }
        })
        .collect()
}

/// Replace the element with `id` in an array value; other shapes are kept.
fn replace_item(value: Option<&Value>, identity_field: &str, id: &str, item: Value) -> Option<Value> {
    match value {
        Some(Value::Array(items)) => Some(Value::Array(
            items
                .iter()
                .map(|existing| {
                    if identity_of(existing, identity_field).as_deref() == Some(id) {
                        item.clone()
                    } else {
                        existing.clone()
                    }
                })
                .collect(),
        )),
        other => other.cloned(),
    }
}

fn prepend_item(value: Option<&Value>, item: Value) -> Option<Value> {
    match value {
        Some(Value::Array(items)) => {
            let mut next = Vec::with_capacity(items.len() + 1);
            next.push(item);
            next.extend(items.iter().cloned());
            Some(Value::Array(next))
        }
        _ => Some(Value::Array(vec![item])),
    }
}

/// Support chat over the cache for one session scope.
#[derive(Clone)]
pub struct ChatService {
    scope: String,
    mutations: OptimisticMutationManager,
    endpoint: Arc<dyn MutationEndpoint>,
}

impl ChatService {
    pub fn new(
        store: Arc<CacheStore>,
        endpoint: Arc<dyn MutationEndpoint>,
        scope: impl Into<String>,
        mutation_timeout: Duration,
    ) -> Self {
        Self {
            scope: scope.into(),
            mutations: OptimisticMutationManager::new(store, mutation_timeout),
            endpoint,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn store(&self) -> &CacheStore {
        self.mutations.store()
    }

    pub fn sessions(&self) -> Vec<ChatSession> {
        let key = sessions_key(&self.scope);
        decode_items(&key, self.store().get(&key).value.as_ref())
    }

    pub fn session(&self, session_id: &str) -> Result<ChatSession, ChatError> {
        self.sessions()
            .into_iter()
            .find(|s| s.id == session_id)
            .ok_or_else(|| ChatError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Messages of a session, oldest first.
    pub fn transcript(&self, session_id: &str) -> Result<Transcript, ChatError> {
        let key = messages_key(session_id);
        let messages = decode_items(&key, self.store().get(&key).value.as_ref());
        Transcript::from_messages(session_id, messages)
    }

    /// Latest messages for a list row. Never touches read receipts.
    pub fn preview(&self, session_id: &str, limit: usize) -> Result<Vec<Message>, ChatError> {
        Ok(self.transcript(session_id)?.preview(limit).to_vec())
    }

    pub fn unread_count(&self, session_id: &str, side: ChatSide) -> Result<usize, ChatError> {
        Ok(self.transcript(session_id)?.unread_count(side))
    }

    async fn commit_session(
        &self,
        session: &ChatSession,
        call: MutationCall,
    ) -> Result<ChatSession, ChatError> {
        let key = sessions_key(&self.scope);
        let identity_field = self.store().identity_field().to_string();
        let item = serde_json::to_value(session).map_err(|e| ChatError::Encode {
            reason: e.to_string(),
        })?;
        let id = session.id.clone();
        self.mutations
            .mutate(
                &key,
                |current| replace_item(current, &identity_field, &id, item),
                self.endpoint.submit(call),
            )
            .await?;
        self.session(&session.id)
    }

    /// Assign an admin to a pending session.
    pub async fn accept(&self, session_id: &str, admin_ref: &str) -> Result<ChatSession, ChatError> {
        let current = self.session(session_id)?;
        let mut next = current.clone();
        next.accept(admin_ref)?;
        if next == current {
            return Ok(current);
        }
        info!(session_id = %session_id, admin = %admin_ref, "Accepting chat session");
        let call = MutationCall::new(
            format!("chat/sessions/{session_id}/accept"),
            json!({ "participant_ref": admin_ref }),
        );
        self.commit_session(&next, call).await
    }

    pub async fn close(&self, session_id: &str) -> Result<ChatSession, ChatError> {
        let mut session = self.session(session_id)?;
        session.close()?;
        info!(session_id = %session_id, "Closing chat session");
        let call = MutationCall::new(
            format!("chat/sessions/{session_id}/close"),
            json!({ "closed_at": session.closed_at }),
        );
        self.commit_session(&session, call).await
    }

    /// Rate a closed session. A repeated rating makes no remote call.
    pub async fn rate(&self, session_id: &str, rating: u8) -> Result<RatingOutcome, ChatError> {
        let mut session = self.session(session_id)?;
        match session.attach_rating(rating)? {
            RatingOutcome::AlreadyRated => {
                debug!(session_id = %session_id, "Session already rated");
                Ok(RatingOutcome::AlreadyRated)
            }
            RatingOutcome::Attached => {
                let call = MutationCall::new(
                    format!("chat/sessions/{session_id}/rating"),
                    json!({ "rating": rating }),
                );
                self.commit_session(&session, call).await?;
                Ok(RatingOutcome::Attached)
            }
        }
    }

    /// Timestamp strictly after the newest cached message.
    fn next_created_at(&self, session_id: &str) -> Result<Timestamp, ChatError> {
        let now = Utc::now();
        Ok(match self.transcript(session_id)?.last_created_at() {
            Some(last) if now <= last => last + ChronoDuration::milliseconds(1),
            _ => now,
        })
    }

    /// Post a message; it shows up in the transcript before the server confirms.
    pub async fn send_message(
        &self,
        session_id: &str,
        from: ChatSide,
        body: &str,
    ) -> Result<Message, ChatError> {
        let session = self.session(session_id)?;
        session.ensure_writable()?;

        let message = Message::new(
            new_entity_id().to_string(),
            session_id,
            Sender::from(from),
            body,
            self.next_created_at(session_id)?,
        );
        let item = serde_json::to_value(&message).map_err(|e| ChatError::Encode {
            reason: e.to_string(),
        })?;
        let call = MutationCall::new(format!("chat/sessions/{session_id}/messages"), item.clone());

        let outcome = self
            .mutations
            .mutate(
                &messages_key(session_id),
                |current| prepend_item(current, item),
                self.endpoint.submit(call),
            )
            .await?;

        self.bump_session(session_id, from, message.created_at);

        Ok(match outcome {
            MutationOutcome::Merged(entity) => serde_json::from_value(entity).unwrap_or(message),
            MutationOutcome::Confirmed => message,
        })
    }

    /// Reflect a confirmed message in the session row counters.
    fn bump_session(&self, session_id: &str, from: ChatSide, at: Timestamp) {
        let Ok(mut session) = self.session(session_id) else {
            return;
        };
        session.record_message(from, at);
        self.write_session_row(&session);
    }

    fn write_session_row(&self, session: &ChatSession) {
        let Ok(item) = serde_json::to_value(session) else {
            return;
        };
        let identity_field = self.store().identity_field().to_string();
        self.store().set(&sessions_key(&self.scope), |current| {
            replace_item(current, &identity_field, &session.id, item)
        });
    }

    /// Start viewing a session as `side`. Only a viewer can mark messages read.
    pub fn begin_viewing(&self, session_id: &str, side: ChatSide) -> Result<ChatViewer<'_>, ChatError> {
        let session = self.session(session_id)?;
        session.ensure_writable()?;
        Ok(ChatViewer {
            service: self,
            session_id: session_id.to_string(),
            side,
        })
    }
}

impl std::fmt::Debug for ChatService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatService")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// An open session view for one side.
#[derive(Debug)]
pub struct ChatViewer<'a> {
    service: &'a ChatService,
    session_id: String,
    side: ChatSide,
}

impl ChatViewer<'_> {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn side(&self) -> ChatSide {
        self.side
    }

    /// Mark everything addressed to this side read; returns how many changed.
    pub async fn mark_all_read(&self) -> Result<usize, ChatError> {
        let service = self.service;
        let session = service.session(&self.session_id)?;
        let mut transcript = service.transcript(&self.session_id)?;
        let read_at = Utc::now();

        let (unread, marked) = {
            let mut guard = transcript.begin_viewing(&session, self.side)?;
            let unread = guard.unread_ids();
            (unread, guard.mark_all_read(read_at))
        };
        if marked == 0 {
            return Ok(0);
        }

        let identity_field = service.store().identity_field().to_string();
        let read_at_value = json!(read_at);
        let call = MutationCall::new(
            format!("chat/sessions/{}/read", self.session_id),
            json!({ "side": self.side.as_db_str(), "message_ids": unread }),
        );
        service
            .mutations
            .mutate(
                &messages_key(&self.session_id),
                |current| {
                    let mut next = current.cloned();
                    if let Some(Value::Array(items)) = next.as_mut() {
                        for item in items.iter_mut() {
                            let hit = identity_of(item, &identity_field)
                                .is_some_and(|id| unread.contains(&id));
                            if !hit {
                                continue;
                            }
                            if let Value::Object(fields) = item {
                                fields.insert("is_read".to_string(), Value::Bool(true));
                                fields.insert("read_at".to_string(), read_at_value.clone());
                            }
                        }
                    }
                    next
                },
                service.endpoint.submit(call),
            )
            .await?;

        let mut session = session;
        session.clear_unread(self.side);
        service.write_session_row(&session);
        Ok(marked)
    }
}
