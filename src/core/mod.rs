//! Core domain types shared by every engine layer:
//! - typed identifiers, including provisional message ids
//! - agent tags with wire aliases
//! - chat messages and structured-artifact content
//! - identity keys for cross-path deduplication
//! - configuration and the crate error taxonomy

pub mod agents;
pub mod config;
pub mod errors;
pub mod identity;
pub mod ids;
pub mod message;

pub use agents::{AgentTag, AgentTagParseError};
pub use config::{GreetingConfig, PersistenceConfig, ResponderConfig, SendConfig, SyncConfig};
pub use errors::{ChatError, ChatResult};
pub use identity::{IdentityKey, compute_hash, normalize_text};
pub use ids::{ConversationId, MessageId, PROVISIONAL_PREFIX, ParticipantId};
pub use message::{ArtifactKind, ChatMessage, ChatRole, MessageContent, MessageOrigin};
