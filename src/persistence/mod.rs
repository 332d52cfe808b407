//! Durable storage for conversations and messages:
//! - gateway trait and error taxonomy
//! - wire rows for the REST dialect
//! - PostgREST-backed and in-process implementations

pub mod gateway;
pub mod memory;
pub mod rest;
pub mod rows;

pub use gateway::{
    Conversation, PersistenceError, PersistenceGateway, PersistenceResult, StoreFuture,
};
pub use memory::MemoryGateway;
pub use rest::RestGateway;
pub use rows::{MessageRow, NewConversationRow, NewMessageRow};
