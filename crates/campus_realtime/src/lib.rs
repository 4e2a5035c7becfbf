#![forbid(unsafe_code)]

//! Realtime fan-out for campus chats: a room hub, authenticated WebSocket
//! connections, and the publisher business logic calls after each write.

pub mod config;
pub mod server;
pub mod util;

pub use server::auth::{AuthClaims, AuthError, AuthenticatedUser, Authenticator, issue_token};
pub use server::hub::{BroadcastOutcome, RoomHub, RoomHubConfig};
pub use server::publisher::{EventPublisher, PublishError};
pub use server::service::{RealtimeService, RunningService};
