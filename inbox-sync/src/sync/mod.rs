//! Real-time sync engine
//!
//! Push frames flow `connection -> codec -> dispatcher -> reconciler -> store`.
//! Local edits flow `optimistic -> reconciler -> store` with the REST call in
//! between. Views are computed from the store by `selectors`.

pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod optimistic;
pub mod reconciler;
pub mod selectors;
pub mod store;

pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use dispatcher::{EventDispatcher, Subscription};
pub use optimistic::{OptimisticMutationTracker, StagedMutation};
pub use reconciler::{ApplyOutcome, ReconcileReport, Reconciler};
pub use selectors::ViewFilter;
pub use store::ConversationStore;
