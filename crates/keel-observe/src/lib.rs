//! Keel Observe -- push-based, synchronous observables.
//!
//! An [`Observe<T>`] is a subscribe function: hand it a [`Subscriber`] and it
//! starts delivering values, returning an [`Unobserve`] handle that stops
//! delivery when called. There is no scheduler and no buffering; every value
//! is pushed on the caller's stack, and each subscription is independent.
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use keel_observe::prelude::*;
//!
//! let count = State::new(1);
//! let doubled = count.observe().map(|n| n * 2);
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let sink = seen.clone();
//! let handle = doubled.observe(move |n| sink.borrow_mut().push(n));
//!
//! count.set(5);
//! handle.unobserve();
//! count.set(7);
//!
//! assert_eq!(*seen.borrow(), vec![2, 10]);
//! ```

#![deny(unsafe_code)]

pub mod combinators;
pub mod observe;
pub mod state;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// A switch key selected an observable the record does not contain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Key \"{key}\" not found in observable record. Available keys: {}", .available.join(", "))]
pub struct SwitchKeyError {
    pub key: String,
    pub available: Vec<String>,
}

/// Errors delivered on a subscriber's error path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObserveError {
    #[error(transparent)]
    SwitchKey(#[from] SwitchKeyError),

    /// An upstream source failed; the message describes why.
    #[error("observable source failed: {0}")]
    Source(String),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::combinators::{from_constant, with_deduplicate_data, with_switch};
    pub use crate::observe::{Observe, Subscriber, Unobserve};
    pub use crate::state::{State, Subject};
    pub use crate::{ObserveError, SwitchKeyError};
}
