//! Observable sources: [`State`] holds a value, [`Subject`] only emits.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::observe::{Observe, Subscriber, Unobserve};

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// The subscriber list shared by sources.
///
/// Notification iterates over a copy of the list, so callbacks may subscribe,
/// unsubscribe, or emit again without a `RefCell` conflict. A listener removed
/// during a notification pass receives nothing further from that pass.
struct Listeners<T> {
    entries: RefCell<Vec<(u64, Subscriber<T>)>>,
    next_id: Cell<u64>,
}

impl<T: Clone + 'static> Listeners<T> {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            entries: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        })
    }

    fn add(self: &Rc<Self>, subscriber: Subscriber<T>) -> Unobserve {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.entries.borrow_mut().push((id, subscriber));

        let weak: Weak<Self> = Rc::downgrade(self);
        Unobserve::new(move || {
            if let Some(listeners) = weak.upgrade() {
                listeners.entries.borrow_mut().retain(|(i, _)| *i != id);
            }
        })
    }

    fn is_subscribed(&self, id: u64) -> bool {
        self.entries.borrow().iter().any(|(i, _)| *i == id)
    }

    fn notify(&self, value: &T) {
        let pass: Vec<(u64, Subscriber<T>)> = self.entries.borrow().clone();
        for (id, subscriber) in pass {
            if self.is_subscribed(id) {
                subscriber.next(value.clone());
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.borrow().len()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// A mutable value whose observers receive the current value on subscribe
/// and every value set afterwards.
pub struct State<T> {
    value: Rc<RefCell<T>>,
    listeners: Rc<Listeners<T>>,
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            listeners: self.listeners.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for State<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("State").field(&self.value.borrow()).finish()
    }
}

impl<T: Clone + 'static> State<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Rc::new(RefCell::new(value)),
            listeners: Listeners::new(),
        }
    }

    pub fn get(&self) -> T {
        self.value.borrow().clone()
    }

    /// Store `value` and push it to every observer.
    pub fn set(&self, value: T) {
        *self.value.borrow_mut() = value.clone();
        self.listeners.notify(&value);
    }

    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.value.borrow());
        self.set(next);
    }

    pub fn observe(&self) -> Observe<T> {
        let value = self.value.clone();
        let listeners = self.listeners.clone();
        Observe::new(move |subscriber: Subscriber<T>| {
            let current = value.borrow().clone();
            let handle = listeners.add(subscriber.clone());
            subscriber.next(current);
            handle
        })
    }

    pub fn observer_count(&self) -> usize {
        self.listeners.len()
    }
}

// ---------------------------------------------------------------------------
// Subject
// ---------------------------------------------------------------------------

/// A multicast event source with no current value.
pub struct Subject<T> {
    listeners: Rc<Listeners<T>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
        }
    }
}

impl<T> fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("observers", &self.listeners.entries.borrow().len())
            .finish()
    }
}

impl<T: Clone + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> Subject<T> {
    pub fn new() -> Self {
        Self {
            listeners: Listeners::new(),
        }
    }

    pub fn emit(&self, value: T) {
        self.listeners.notify(&value);
    }

    pub fn observe(&self) -> Observe<T> {
        let listeners = self.listeners.clone();
        Observe::new(move |subscriber| listeners.add(subscriber))
    }

    pub fn observer_count(&self) -> usize {
        self.listeners.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder<T: Clone + 'static>() -> (Rc<RefCell<Vec<T>>>, impl Fn(T) + Clone + 'static) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |v| sink.borrow_mut().push(v))
    }

    #[test]
    fn state_replays_current_value_then_updates() {
        let state = State::new(1);
        let (seen, push) = recorder();
        let handle = state.observe().observe(push);
        state.set(2);
        state.update(|n| n + 10);
        handle.unobserve();
        state.set(99);
        assert_eq!(*seen.borrow(), vec![1, 2, 12]);
        assert_eq!(state.get(), 99);
        assert_eq!(state.observer_count(), 0);
    }

    #[test]
    fn subject_does_not_replay() {
        let subject = Subject::new();
        subject.emit("early");
        let (seen, push) = recorder();
        let handle = subject.observe().observe(push);
        subject.emit("late");
        handle.unobserve();
        subject.emit("after");
        assert_eq!(*seen.borrow(), vec!["late"]);
    }

    #[test]
    fn observer_may_set_state_reentrantly() {
        let state = State::new(0);
        let (seen, push) = recorder();
        let inner = state.clone();
        let clamp = state.observe().observe(move |n| {
            if n > 10 {
                inner.set(10);
            }
        });
        let log = state.observe().observe(push);
        state.set(50);
        clamp.unobserve();
        log.unobserve();
        assert_eq!(state.get(), 10);
        assert!(seen.borrow().contains(&10));
    }

    #[test]
    fn listener_removed_mid_pass_is_skipped() {
        let subject: Subject<u8> = Subject::new();
        let (seen, push) = recorder();
        let victim: Rc<RefCell<Option<Unobserve>>> = Rc::new(RefCell::new(None));
        let slot = victim.clone();
        let killer = subject.observe().observe(move |_| {
            if let Some(handle) = slot.borrow_mut().take() {
                handle.unobserve();
            }
        });
        *victim.borrow_mut() = Some(subject.observe().observe(push));
        subject.emit(1);
        killer.unobserve();
        assert!(seen.borrow().is_empty());
        assert_eq!(subject.observer_count(), 0);
    }
}
