//! WorldVault Session - Locking and world sessions
//!
//! Leases give one instance at a time the right to save a world. This
//! crate provides the lock manager that hands them out, the background
//! renewal that keeps them alive, sessions that load and save worlds
//! under a lease, and the manager for whole-world operations.

pub mod clock;
pub mod context;
pub mod lock;
pub mod manager;
pub mod renewal;
pub mod session;
pub mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::SessionContext;
pub use lock::LockManager;
pub use manager::WorldManager;
pub use renewal::{LeaseState, Renewal};
pub use session::{OpenMode, OpenOptions, WorldSession};
pub use sweeper::{LeaseSweeper, SweeperHandle};
