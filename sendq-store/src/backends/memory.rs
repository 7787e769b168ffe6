use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use crate::{
    error::{Result, StoreError},
    message::{Message, MessageState},
    store::{self, BackingStore, Mutator},
    types::MessageId,
};

/// In-memory backing store implementation
///
/// Stores messages in a `HashMap` protected by an `RwLock`. Primarily
/// intended for testing; can also back a deliberately transient queue.
/// Durability here means "survives as long as the process" — callers that
/// need crash safety use [`FileBackingStore`].
///
/// # Capacity Management
/// The store can be configured with a maximum capacity. When capacity is
/// reached, `put` fails rather than evicting.
///
/// [`FileBackingStore`]: crate::backends::FileBackingStore
#[derive(Debug, Clone)]
pub struct MemoryBackingStore {
    messages: Arc<RwLock<HashMap<MessageId, Message>>>,
    /// Maximum number of messages to store (None = unlimited)
    capacity: Option<usize>,
}

impl MemoryBackingStore {
    /// Create a new empty memory-backed store with unlimited capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            messages: Arc::new(RwLock::new(HashMap::new())),
            capacity: None,
        }
    }

    /// Create a new memory-backed store with a capacity limit
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: Arc::new(RwLock::new(HashMap::new())),
            capacity: Some(capacity),
        }
    }

    /// Get the current number of messages in the store
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Check if the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the configured capacity (None = unlimited)
    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl Default for MemoryBackingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn put(&self, message: &Message) -> Result<()> {
        let mut messages = self.messages.write()?;

        if messages.contains_key(&message.id) {
            return Err(StoreError::DuplicateId(message.id.clone()));
        }

        if let Some(cap) = self.capacity
            && messages.len() >= cap
        {
            return Err(StoreError::Internal(format!(
                "Memory store capacity exceeded: {}/{cap} messages",
                messages.len(),
            )));
        }

        messages.insert(message.id.clone(), message.clone());

        Ok(())
    }

    async fn get(&self, id: &MessageId) -> Result<Message> {
        self.messages
            .read()?
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn update(&self, id: &MessageId, mutator: Mutator<'_>) -> Result<Message> {
        // The write lock serializes the whole read-modify-write cycle, so a
        // revision mismatch cannot occur here; conflicts surface through
        // mutator vetoes.
        let mut messages = self.messages.write()?;

        let current = messages
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let mut updated = current;
        store::apply_mutation(&mut updated, mutator)?;

        messages.insert(id.clone(), updated.clone());

        Ok(updated)
    }

    async fn scan(&self, states: &[MessageState]) -> Result<Vec<Message>> {
        let mut matches: Vec<Message> = self
            .messages
            .read()?
            .values()
            .filter(|m| states.contains(&m.state))
            .cloned()
            .collect();

        store::sort_fifo(&mut matches);

        Ok(matches)
    }

    async fn delete(&self, id: &MessageId) -> Result<()> {
        self.messages.write()?.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use sendq_common::envelope::Envelope;

    use super::*;

    fn test_message(body: &str) -> Message {
        Message::new(
            Envelope::new("sender@example.com", vec!["rcpt@example.net".to_string()]),
            Arc::from(body.as_bytes()),
        )
    }

    #[tokio::test]
    async fn test_memory_store_basic_operations() {
        let store = MemoryBackingStore::new();
        let message = test_message("test message");
        let id = message.id.clone();

        store.put(&message).await.expect("Failed to put");

        let listed = store.scan(&MessageState::ALL).await.expect("Failed to scan");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);

        let read = store.get(&id).await.expect("Failed to get");
        assert_eq!(read.payload.as_ref(), b"test message");
        assert_eq!(read.envelope, message.envelope);

        store.delete(&id).await.expect("Failed to delete");
        assert!(matches!(
            store.get(&id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = MemoryBackingStore::new();
        let message = test_message("one");

        store.put(&message).await.expect("First put should succeed");
        let result = store.put(&message).await;
        assert!(matches!(result, Err(StoreError::DuplicateId(_))));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryBackingStore::new();
        let message = test_message("gone");

        store.put(&message).await.expect("Failed to put");
        store.delete(&message.id).await.expect("Failed to delete");
        store
            .delete(&message.id)
            .await
            .expect("Deleting an absent id should succeed");
    }

    #[tokio::test]
    async fn test_update_bumps_revision() {
        let store = MemoryBackingStore::new();
        let message = test_message("bump");
        store.put(&message).await.expect("Failed to put");

        let updated = store
            .update(
                &message.id,
                Box::new(|m| {
                    m.state = MessageState::InFlight;
                    Ok(())
                }),
            )
            .await
            .expect("Update should succeed");

        assert_eq!(updated.state, MessageState::InFlight);
        assert_eq!(updated.revision, message.revision + 1);
        assert!(updated.updated_at >= message.updated_at);
    }

    #[tokio::test]
    async fn test_mutator_veto_surfaces_conflict() {
        let store = MemoryBackingStore::new();
        let message = test_message("veto");
        store.put(&message).await.expect("Failed to put");

        let result = store
            .update(
                &message.id,
                Box::new(|m| Err(StoreError::Conflict(m.id.clone()))),
            )
            .await;

        assert!(matches!(result, Err(StoreError::Conflict(_))));

        // A vetoed update must leave the record untouched
        let read = store.get(&message.id).await.expect("Failed to get");
        assert_eq!(read.revision, message.revision);
        assert_eq!(read.state, MessageState::Pending);
    }

    #[tokio::test]
    async fn test_concurrent_claim_admits_exactly_one_winner() {
        let store = Arc::new(MemoryBackingStore::new());
        let message = test_message("contested");
        store.put(&message).await.expect("Failed to put");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let id = message.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(
                        &id,
                        Box::new(|m| {
                            if m.state == MessageState::Pending {
                                m.state = MessageState::InFlight;
                                Ok(())
                            } else {
                                Err(StoreError::Conflict(m.id.clone()))
                            }
                        }),
                    )
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("Task panicked").is_ok() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1, "exactly one claim should succeed");
    }

    #[tokio::test]
    async fn test_scan_filters_and_orders_fifo() {
        let store = MemoryBackingStore::new();

        let mut first = test_message("first");
        first.created_at = 100;
        let mut second = test_message("second");
        second.created_at = 200;
        second.state = MessageState::RetryScheduled;
        let mut third = test_message("third");
        third.created_at = 300;
        third.state = MessageState::Delivered;

        // Insert out of order
        store.put(&second).await.expect("put");
        store.put(&third).await.expect("put");
        store.put(&first).await.expect("put");

        let active = store
            .scan(&[MessageState::Pending, MessageState::RetryScheduled])
            .await
            .expect("scan");
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].id, first.id, "oldest message first");
        assert_eq!(active[1].id, second.id);

        let delivered = store.scan(&[MessageState::Delivered]).await.expect("scan");
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].id, third.id);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let store = MemoryBackingStore::with_capacity(2);

        store.put(&test_message("1")).await.expect("First put");
        store.put(&test_message("2")).await.expect("Second put");

        let overflow = test_message("3");
        let result = store.put(&overflow).await;
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("capacity exceeded")
        );

        // After deleting one, writes succeed again
        let ids = store.scan(&MessageState::ALL).await.expect("scan");
        store.delete(&ids[0].id).await.expect("delete");
        store.put(&overflow).await.expect("put after delete");
    }

    #[tokio::test]
    async fn test_unique_id_generation() {
        let store = Arc::new(MemoryBackingStore::new());

        let mut handles = vec![];
        for i in 0..100 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let msg = test_message(&format!("message {i}"));
                store.put(&msg).await
            }));
        }

        for handle in handles {
            handle.await.expect("Task panicked").expect("Put failed");
        }

        let ids = store.scan(&MessageState::ALL).await.expect("scan");
        assert_eq!(ids.len(), 100);

        let mut id_set = std::collections::HashSet::new();
        for msg in &ids {
            assert!(id_set.insert(msg.id.clone()), "Found duplicate ID: {}", msg.id);
        }
    }
}
