//! Reactive Primitives
//!
//! This module implements the core reactive system: state units, derived
//! subscribers, and the plumbing that connects them.
//!
//! # Concepts
//!
//! ## State
//!
//! A [`State`] is a container for mutable state. When its value is read
//! within a tracking context (a subscriber evaluating), the state registers
//! that subscriber as a dependent. When the value changes, dependents are
//! notified on the next flush.
//!
//! ## Subscribers
//!
//! A [`Subscriber`] is a derived value that caches its result. It
//! re-evaluates only when one of its dependencies actually changed, and
//! emits only when its own value changed. Bodies can be asynchronous.
//!
//! ## Context
//!
//! A [`Context`] carries an ambient value down the call stack and across
//! await points. Dependency tracking is built on one.
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local tracking context to automatically
//! detect dependencies. When a unit is read, we check if there is an active
//! tracker and, if so, register the dependency.
//!
//! Updates are delivered through a per-thread [`Runtime`] that batches
//! emissions per tick, so any number of writes in one tick cost one
//! propagation.

mod cancel;
mod context;
mod emitter;
mod id;
mod memo;
mod runtime;
mod state;
mod subscriber;
mod tracker;
mod value;

pub use cancel::{Cancellable, Ticket};
pub use context::{Context, Scoped};
pub use emitter::{Emitter, Listener, ListenerId, Observable, Subscription};
pub use id::UnitId;
pub use memo::{MemoCache, MemoHandle};
pub use runtime::{batch, Node, Runtime};
pub use state::State;
pub use subscriber::{DirtyState, Status, Subscriber, SubscriberBuilder};
pub use tracker::{current_tracker, tracking, untracked, Dependency, Tracker};
pub use value::{PendingValue, Snapshot};
