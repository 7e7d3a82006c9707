//! Authoritative server for the Strata voxel world.
//!
//! Clients hold a UDP session for presence, chat and positions, and an
//! optional TCP connection for bulk world data and block edits. All state
//! lives on a single core task; see [`server`] for how traffic reaches it.

pub mod dispatcher;
pub mod scheduler;
pub mod server;
pub mod session;

pub use dispatcher::{DisconnectReason, Dispatcher, DispatcherSettings, Outbox, Outgoing};
pub use scheduler::Ticks;
pub use server::{Server, ServerError, ServerHandle};
pub use session::{RegisterError, SessionInfo, SessionRegistry, User};
