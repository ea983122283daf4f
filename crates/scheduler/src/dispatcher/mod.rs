//! Round-robin, capacity-bounded dispatch over attached producers.
//!
//! Split into focused submodules:
//! - `core`: Dispatcher struct, constructors, attach/detach, and accessors
//! - `scheduling`: producer rotation, `schedule_one`, and the run loop

mod core;
mod scheduling;

pub use self::core::Dispatcher;
