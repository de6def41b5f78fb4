//! # Packet Channels
//!
//! Named sub-protocols grouping related packet types and their handlers.
//!
//! A channel is defined once as an immutable [`ChannelBlueprint`] (built in
//! an append-only phase, locked when first bound to a live connection) and
//! instantiated per connection as a [`ChannelInstance`] carrying its own
//! handler and one-shot-waiter state. Two connections bound to the same
//! definition never observe each other's runtime registrations.
//!
//! ## Dispatch order
//! 1. One-shot response waiters, in registration order; the first match is
//!    removed and receives the packet
//! 2. Permanent handlers, in registration order, stopping at the first
//!    that reports the packet handled
//! 3. Unhandled frames are an error in debug mode, silently dropped
//!    otherwise

pub mod blueprint;
pub mod instance;
pub mod packet;

pub use blueprint::{ChannelBlueprint, ChannelBuilder, ChannelDef, ChannelRegistry};
pub use instance::{ChannelContext, ChannelInstance};
pub use packet::{AnyPacket, Packet};
