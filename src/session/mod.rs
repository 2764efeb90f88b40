//! Sessions, plans, and the phase state machine.

pub mod model;
pub mod phase;
pub mod store;

pub use model::{Message, Plan, Role, Session};
pub use phase::{Phase, PhaseMachine};
pub use store::{FileStore, MemoryStore, SessionStore};
