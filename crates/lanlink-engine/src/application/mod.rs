//! Application layer: device registry, trust store, plugin dispatch, and
//! the event seam collaborators subscribe to. No sockets here; everything
//! is driven by the infrastructure layer and unit-testable in isolation.

pub mod events;
pub mod plugins;
pub mod registry;
pub mod router;
pub mod trust;
