pub mod backends;
pub mod config;
pub mod error;
pub mod message;
pub mod store;
pub mod types;

pub use backends::{FileBackingStore, MemoryBackingStore};
pub use config::{MemoryConfig, StoreConfig};
pub use error::{Result, SerializationError, StoreError, ValidationError};
pub use message::{Message, MessageState};
pub use store::{BackingStore, Mutator};
pub use types::MessageId;
