//! `aegis-middleware` – The Nervous System
//!
//! Routes data between the gateway stages without caring about its meaning.
//!
//! # Modules
//!
//! - [`bus`] – topic-keyed publish/subscribe dispatcher with per-handler
//!   failure isolation.
//! - [`channel`] – bounded, priority-ordered hand-off between the producer
//!   and translator stages.
//! - [`wire`] – fixed datagram layout used when the stages run in separate
//!   processes.
//! - [`transport`] – UDP uplink/ingress built on the wire codec.
//! - [`sink`] – the [`TelemetrySink`] adapter trait plus in-process sinks.

pub mod bus;
pub mod channel;
pub mod sink;
pub mod transport;
pub mod wire;

pub use bus::{EventBus, EventHandler, FnHandler, SubscriptionId, TopicReceiver};
pub use channel::{Prioritized, PriorityChannel};
pub use sink::{MemorySink, TelemetrySink, TracingSink};
pub use transport::{UdpIngress, UdpUplink};
pub use wire::WirePacket;
