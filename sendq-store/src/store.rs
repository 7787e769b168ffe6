use async_trait::async_trait;

use crate::{
    error::{Result, StoreError},
    message::{Message, MessageState},
    types::MessageId,
};

/// A record transformation applied by [`BackingStore::update`].
///
/// The mutator sees the current record and may veto the update by returning
/// an error (typically [`StoreError::Conflict`]), which makes
/// check-and-transition operations atomic with respect to other writers.
pub type Mutator<'a> = Box<dyn FnOnce(&mut Message) -> Result<()> + Send + 'a>;

/// Durable storage for queued messages, keyed by [`MessageId`]
///
/// Implementations must guarantee that any `put`/`update`/`delete` that
/// returns `Ok` has reached stable storage before acknowledging, so that a
/// crash immediately afterwards cannot lose the write.
#[async_trait]
pub trait BackingStore: Send + Sync + std::fmt::Debug {
    /// Persist a new message.
    ///
    /// # Errors
    /// `DuplicateId` if a message with this ID already exists.
    async fn put(&self, message: &Message) -> Result<()>;

    /// Read a message.
    ///
    /// # Errors
    /// `NotFound` if no message with this ID exists.
    async fn get(&self, id: &MessageId) -> Result<Message>;

    /// Apply a compare-and-swap style update: read the current record, run
    /// the mutator on it, and write it back. The store bumps `revision` and
    /// `updated_at` on every successful write; the envelope and payload are
    /// never rewritten.
    ///
    /// Returns the updated record.
    ///
    /// # Errors
    /// - `NotFound` if no message with this ID exists
    /// - `Conflict` if the record changed between read and write, or if the
    ///   mutator vetoed the transition
    async fn update(&self, id: &MessageId, mutator: Mutator<'_>) -> Result<Message>;

    /// All messages whose state is in `states`, ordered by `created_at`
    /// ascending (ties broken by ID). Each call re-reads current state; no
    /// cursor persists across calls.
    async fn scan(&self, states: &[MessageState]) -> Result<Vec<Message>>;

    /// Delete a message. Deleting an absent ID is not an error.
    async fn delete(&self, id: &MessageId) -> Result<()>;
}

/// FIFO ordering for scan results: `created_at` ascending, ties by ID.
pub(crate) fn sort_fifo(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Shared post-mutation bookkeeping: apply the mutator to a working copy,
/// then bump the revision and update timestamp.
pub(crate) fn apply_mutation(current: &mut Message, mutator: Mutator<'_>) -> Result<()> {
    let id = current.id.clone();
    mutator(current)?;
    if current.id != id {
        return Err(StoreError::Internal(format!(
            "update mutator must not change the message id (was {id})"
        )));
    }
    current.revision += 1;
    current.updated_at = sendq_common::unix_now();
    Ok(())
}
