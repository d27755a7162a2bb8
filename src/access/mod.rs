//! Role-based access control

pub mod guard;

pub use guard::{capabilities, AccessDenied, AccessGuard, Action, Capability, Resource, Scope};
