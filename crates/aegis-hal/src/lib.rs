//! `aegis-hal` – simulated hardware behind the gateway.
//!
//! Nothing in this crate touches a real radio or bus controller. The rest of
//! the workspace only talks to the [`CanBus`] trait and the
//! [`SteeringWalk`] sensor model, so a physical driver could replace either
//! without touching the pipeline.

pub mod can;
pub mod steering;

pub use can::{CanBus, VirtualCanBus};
pub use steering::SteeringWalk;
