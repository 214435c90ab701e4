//! Observable constructors and combinators.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::observe::{Observe, Subscriber, Unobserve};
use crate::SwitchKeyError;

/// An observable that delivers `value` once to every subscriber.
pub fn from_constant<T: Clone + 'static>(value: T) -> Observe<T> {
    Observe::new(move |subscriber: Subscriber<T>| {
        subscriber.next(value.clone());
        Unobserve::noop()
    })
}

/// Suppress values equal to the last one delivered to the same subscriber.
pub fn with_deduplicate_data<T: Clone + PartialEq + 'static>(source: Observe<T>) -> Observe<T> {
    Observe::new(move |subscriber: Subscriber<T>| {
        let last: RefCell<Option<T>> = RefCell::new(None);
        let sink = subscriber.clone();
        source.subscribe(subscriber.forward(move |value: T| {
            if last.borrow().as_ref() == Some(&value) {
                return;
            }
            *last.borrow_mut() = Some(value.clone());
            sink.next(value);
        }))
    })
}

/// Follow the observable in `record` selected by the latest value of `key`.
///
/// Every key change releases the previous selection before the new one is
/// subscribed. A key missing from `record` sends a [`SwitchKeyError`] to the
/// subscriber's error path; the key subscription stays alive, so a later
/// valid key resumes delivery. Unobserving releases both the selection and
/// the key.
pub fn with_switch<T: 'static>(
    record: BTreeMap<String, Observe<T>>,
    key: Observe<String>,
) -> Observe<T> {
    let record = Rc::new(record);
    Observe::new(move |subscriber: Subscriber<T>| {
        let current: Rc<RefCell<Option<Unobserve>>> = Rc::new(RefCell::new(None));
        let record = record.clone();
        let selection = current.clone();
        let sink = subscriber.clone();

        let key_handle = key.subscribe(subscriber.forward(move |name: String| {
            let previous = selection.borrow_mut().take();
            if let Some(previous) = previous {
                previous.unobserve();
            }
            match record.get(&name) {
                Some(source) => {
                    let handle = source.subscribe(sink.clone());
                    *selection.borrow_mut() = Some(handle);
                }
                None => sink.error(
                    SwitchKeyError {
                        key: name,
                        available: record.keys().cloned().collect(),
                    }
                    .into(),
                ),
            }
        }));

        Unobserve::new(move || {
            let selected = current.borrow_mut().take();
            if let Some(selected) = selected {
                selected.unobserve();
            }
            key_handle.unobserve();
        })
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;
    use crate::ObserveError;

    fn collect<T: 'static>(source: &Observe<T>) -> (Rc<RefCell<Vec<T>>>, Unobserve) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let handle = source.observe(move |v| sink.borrow_mut().push(v));
        (seen, handle)
    }

    fn record<T: 'static>(entries: Vec<(&str, Observe<T>)>) -> BTreeMap<String, Observe<T>> {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect()
    }

    // -- from_constant / dedupe ---------------------------------------------

    #[test]
    fn constant_delivers_once_per_subscriber() {
        let source = from_constant(7);
        let (a, ha) = collect(&source);
        let (b, hb) = collect(&source);
        ha.unobserve();
        hb.unobserve();
        assert_eq!(*a.borrow(), vec![7]);
        assert_eq!(*b.borrow(), vec![7]);
    }

    #[test]
    fn deduplicate_skips_repeats_per_subscription() {
        let state = State::new(vec![1, 2]);
        let deduped = with_deduplicate_data(state.observe());
        let (seen, handle) = collect(&deduped);
        state.set(vec![1, 2]);
        state.set(vec![3]);
        state.set(vec![3]);
        state.set(vec![1, 2]);

        let (late, late_handle) = collect(&deduped);
        handle.unobserve();
        late_handle.unobserve();

        assert_eq!(*seen.borrow(), vec![vec![1, 2], vec![3], vec![1, 2]]);
        assert_eq!(*late.borrow(), vec![vec![1, 2]]);
    }

    // -- with_switch ---------------------------------------------------------

    #[test]
    fn switch_follows_key_changes() {
        let key = State::new("a".to_owned());
        let picked = with_switch(
            record(vec![
                ("a", from_constant(10)),
                ("b", from_constant(20)),
                ("c", from_constant(30)),
            ]),
            key.observe(),
        );
        let (seen, handle) = collect(&picked);
        key.set("b".into());
        key.set("c".into());
        handle.unobserve();
        assert_eq!(*seen.borrow(), vec![10, 20, 30]);
    }

    #[test]
    fn switch_releases_previous_selection() {
        let a = State::new(100);
        let b = State::new(200);
        let key = State::new("a".to_owned());
        let picked = with_switch(
            record(vec![("a", a.observe()), ("b", b.observe())]),
            key.observe(),
        );
        let (seen, handle) = collect(&picked);

        a.set(101);
        key.set("b".into());
        a.set(102);
        b.set(201);
        assert_eq!(a.observer_count(), 0);

        handle.unobserve();
        assert_eq!(*seen.borrow(), vec![100, 101, 200, 201]);
    }

    #[test]
    fn switch_unobserve_releases_everything() {
        let a = State::new(1);
        let b = State::new(2);
        let key = State::new("a".to_owned());
        let picked = with_switch(
            record(vec![("a", a.observe()), ("b", b.observe())]),
            key.observe(),
        );
        let (seen, handle) = collect(&picked);
        a.set(10);
        handle.unobserve();

        a.set(20);
        b.set(30);
        key.set("b".into());
        assert_eq!(*seen.borrow(), vec![1, 10]);
        assert_eq!(key.observer_count(), 0);
        assert_eq!(a.observer_count(), 0);
        assert_eq!(b.observer_count(), 0);
    }

    #[test]
    fn switch_handles_rapid_changes() {
        let key = State::new("x".to_owned());
        let picked = with_switch(
            record(vec![
                ("x", from_constant("first")),
                ("y", from_constant("second")),
                ("z", from_constant("third")),
            ]),
            key.observe(),
        );
        let (seen, handle) = collect(&picked);
        for k in ["y", "z", "x", "z"] {
            key.set(k.into());
        }
        handle.unobserve();
        assert_eq!(*seen.borrow(), vec!["first", "second", "third", "first", "third"]);
    }

    #[test]
    fn unknown_key_reports_error_and_recovers() {
        let key = State::new("a".to_owned());
        let picked = with_switch(
            record(vec![("a", from_constant(1)), ("b", from_constant(2))]),
            key.observe(),
        );
        let values = Rc::new(RefCell::new(Vec::new()));
        let errors = Rc::new(RefCell::new(Vec::new()));
        let (v, e) = (values.clone(), errors.clone());
        let handle = picked.subscribe(
            Subscriber::new(move |n: i32| v.borrow_mut().push(n))
                .with_error(move |err| e.borrow_mut().push(err)),
        );

        key.set("invalid".into());
        key.set("b".into());
        handle.unobserve();

        assert_eq!(*values.borrow(), vec![1, 2]);
        let errors = errors.borrow();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].to_string(),
            "Key \"invalid\" not found in observable record. Available keys: a, b"
        );
        assert!(matches!(&errors[0], ObserveError::SwitchKey(e) if e.key == "invalid"));
    }
}
