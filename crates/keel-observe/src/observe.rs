//! The observable contract.

use std::fmt;
use std::rc::Rc;

use crate::ObserveError;

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// The receiving end of a subscription: a value callback and an optional
/// error callback.
pub struct Subscriber<T> {
    next: Rc<dyn Fn(T)>,
    error: Option<Rc<dyn Fn(ObserveError)>>,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            next: self.next.clone(),
            error: self.error.clone(),
        }
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("handles_errors", &self.error.is_some())
            .finish()
    }
}

impl<T: 'static> Subscriber<T> {
    pub fn new(next: impl Fn(T) + 'static) -> Self {
        Self {
            next: Rc::new(next),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Fn(ObserveError) + 'static) -> Self {
        self.error = Some(Rc::new(error));
        self
    }

    pub fn next(&self, value: T) {
        (self.next)(value)
    }

    /// Deliver `err` to the error callback, or log it if there is none.
    pub fn error(&self, err: ObserveError) {
        match &self.error {
            Some(handler) => handler(err),
            None => tracing::warn!(error = %err, "observable error with no error handler"),
        }
    }

    /// A subscriber that forwards errors here but sends values through `next`.
    ///
    /// Operators use this to subscribe upstream on behalf of a downstream
    /// subscriber.
    pub fn forward<U: 'static>(&self, next: impl Fn(U) + 'static) -> Subscriber<U> {
        Subscriber {
            next: Rc::new(next),
            error: self.error.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Unobserve
// ---------------------------------------------------------------------------

/// Ends a subscription.
///
/// Dropping the handle without calling [`unobserve`](Self::unobserve) leaves
/// the subscription running for the life of the source.
#[must_use = "the subscription stays active until `unobserve` is called"]
pub struct Unobserve(Option<Box<dyn FnOnce()>>);

impl Unobserve {
    pub fn new(f: impl FnOnce() + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// A handle with nothing to release.
    pub fn noop() -> Self {
        Self(None)
    }

    /// Stop delivery. No value reaches the subscriber after this returns.
    pub fn unobserve(mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

impl fmt::Debug for Unobserve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Unobserve").field(&self.0.is_some()).finish()
    }
}

// ---------------------------------------------------------------------------
// Observe
// ---------------------------------------------------------------------------

/// A subscribe function. Cloning shares the function, not any state.
pub struct Observe<T> {
    subscribe: Rc<dyn Fn(Subscriber<T>) -> Unobserve>,
}

impl<T> Clone for Observe<T> {
    fn clone(&self) -> Self {
        Self {
            subscribe: self.subscribe.clone(),
        }
    }
}

impl<T> fmt::Debug for Observe<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Observe")
    }
}

impl<T: 'static> Observe<T> {
    pub fn new(subscribe: impl Fn(Subscriber<T>) -> Unobserve + 'static) -> Self {
        Self {
            subscribe: Rc::new(subscribe),
        }
    }

    pub fn subscribe(&self, subscriber: Subscriber<T>) -> Unobserve {
        (self.subscribe)(subscriber)
    }

    /// Subscribe with only a value callback.
    pub fn observe(&self, next: impl Fn(T) + 'static) -> Unobserve {
        self.subscribe(Subscriber::new(next))
    }

    /// Transform every value.
    pub fn map<U: 'static>(&self, f: impl Fn(T) -> U + 'static) -> Observe<U> {
        let source = self.clone();
        let f = Rc::new(f);
        Observe::new(move |subscriber: Subscriber<U>| {
            let f = f.clone();
            let sink = subscriber.clone();
            source.subscribe(subscriber.forward(move |value| sink.next(f(value))))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    fn counter() -> Observe<u32> {
        Observe::new(|subscriber: Subscriber<u32>| {
            for n in 1..=3 {
                subscriber.next(n);
            }
            Unobserve::noop()
        })
    }

    #[test]
    fn each_subscription_is_independent() {
        let source = counter();
        let first = Rc::new(RefCell::new(Vec::new()));
        let second = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = (first.clone(), second.clone());
        source.observe(move |n| a.borrow_mut().push(n)).unobserve();
        source.observe(move |n| b.borrow_mut().push(n)).unobserve();
        assert_eq!(*first.borrow(), vec![1, 2, 3]);
        assert_eq!(*second.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn map_transforms_values() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        counter()
            .map(|n| format!("#{n}"))
            .observe(move |s| sink.borrow_mut().push(s))
            .unobserve();
        assert_eq!(*seen.borrow(), vec!["#1", "#2", "#3"]);
    }

    #[test]
    fn unobserve_runs_release_once() {
        let released = Rc::new(Cell::new(0));
        let r = released.clone();
        let source = Observe::new(move |_: Subscriber<()>| {
            let r = r.clone();
            Unobserve::new(move || r.set(r.get() + 1))
        });
        source.observe(|_| {}).unobserve();
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn errors_reach_the_error_callback() {
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = errors.clone();
        let subscriber = Subscriber::new(|_: u8| {})
            .with_error(move |e| sink.borrow_mut().push(e.to_string()));
        subscriber.error(ObserveError::Source("disk".into()));
        assert_eq!(*errors.borrow(), vec!["observable source failed: disk"]);
    }
}
