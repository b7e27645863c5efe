//! Ripple Core
//!
//! This crate provides a fine-grained reactive state runtime and a reactive
//! document table built on it. It implements:
//!
//! - Reactive primitives (state units, derived subscribers, selectors)
//! - Ambient context that survives await points
//! - A keyed micro-batching scheduler
//! - A SQL-backed document table with live queries
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: State units, subscribers and dependency tracking
//! - `schedule`: The micro-batching scheduler everything propagates through
//! - `table`: Document tables, predicates, search and live queries
//! - `error`: Error types shared by all of the above
//!
//! # Example
//!
//! ```rust,ignore
//! use ripple_core::reactive::{batch, State, Subscriber};
//!
//! // Create a state unit
//! let count = State::new(1);
//!
//! // Create a derived value
//! let source = count.clone();
//! let doubled = Subscriber::new(move || Ok(source.read()? * 2));
//!
//! // Listen for changes
//! let _subscription = doubled.listen(|value| println!("doubled: {value:?}"));
//!
//! // Several writes in a batch cost one propagation
//! batch(|| {
//!     count.set(2);
//!     count.set(5);
//! });
//! // Prints: "doubled: Ok(10)"
//! ```

pub mod error;
pub mod reactive;
pub mod schedule;
pub mod table;

pub use error::{BackendError, ReactiveError, Result, TableError, TableResult};
