//! Session state management
//!
//! The session owns every long-lived resource of one signed-in context and
//! is safe to share across tasks behind an `Arc`.

mod session;

pub use session::InboxSession;
