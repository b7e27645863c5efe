//! Scheduling
//!
//! Update delivery is decoupled from mutation: writers enqueue work on a
//! [`Batcher`] and the batcher decides when to flush it. Both the reactive
//! runtime and the table's live queries sit on top of it.

mod batcher;

pub use batcher::{
    Batcher, BatcherOptions, Finish, FlushStrategy, HoldGuard, KeyHandlers, Registration,
    ResolveItem,
};
