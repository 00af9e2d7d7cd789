//! Business logic services
//!
//! Transport-agnostic helpers that the session and the optimistic tracker
//! build on. They hold no state and are easily testable in isolation.

pub mod addresses;
pub mod recipients;

pub use recipients::{explicit_recipients, reply_recipients, Recipients, ReplyMode};
