//! HTTP surface: router and lifecycle.

mod lifecycle;
mod router;

pub use lifecycle::serve;
pub use router::{AppState, build_router};
