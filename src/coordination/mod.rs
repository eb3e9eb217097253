//! In-process coordination primitives.
//!
//! This module provides the two primitives the coordinator composes:
//!
//! - [`SingleFlight`] - per-key request collapsing with result broadcast
//! - [`Throttler`] - bounded concurrency for engine passes
//!
//! Both are process-local. Locking protects map mutations only, never
//! I/O; channel sends happen outside the table lock.

mod singleflight;
mod throttler;

pub use singleflight::{Acquired, OwnerGuard, SingleFlight, WaiterTicket};
pub use throttler::{ThrottlePermit, Throttler};
