//! Realtime client for the Bloom materials tracker
//!
//! Subscribes to `postgres_changes` over the Supabase Realtime (Phoenix)
//! websocket protocol and routes row changes to per-binding callbacks.

mod channel;
mod client;
mod error;
mod filters;
mod message;

pub use channel::{ChannelBuilder, DatabaseChanges, Subscription};
pub use client::{ConnectionState, RealtimeClient, RealtimeClientOptions};
pub use error::RealtimeError;
pub use filters::{DatabaseFilter, FilterOperator};
pub use message::{ChangeType, ChannelEvent, DatabaseEvent, PostgresChangePayload, RealtimeMessage};
