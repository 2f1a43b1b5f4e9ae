#![forbid(unsafe_code)]

//! Single-value broadcast channel with terminal-state replay.
//!
//! [`Subject<T>`] is the publish/subscribe primitive under every per-path
//! notification channel in the store. It is single-threaded: shared via
//! `Rc<RefCell<..>>`, delivered cooperatively on the emitter's call stack.
//!
//! # Invariants
//!
//! 1. Observers are invoked in subscription (FIFO) order.
//! 2. An emission is delivered to the snapshot of observers registered at
//!    the moment `emit` was called: observers subscribing mid-delivery do
//!    not see the in-flight value, observers unsubscribing mid-delivery see
//!    it (they were present at emission time) but nothing afterwards.
//! 3. There is no buffering: a `next` value emitted before an observer
//!    subscribed is never replayed.
//! 4. After `emit_error`/`emit_complete` the channel is frozen: further
//!    `emit` calls are no-ops, the observer set is dropped, and any later
//!    subscriber is immediately replayed the terminal signal.
//!
//! # Failure Modes
//!
//! - **Re-entrant emission**: an observer calling back into `emit` (or a
//!   terminal emitter) on the same subject would make delivery order
//!   unspecifiable; the subject panics instead via an explicit guard.
//! - **Dangling subscription**: unsubscribing after the subject was dropped
//!   is a no-op (the handle only holds a weak reference).

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// An observer: a required next-handler plus optional terminal handlers.
pub struct Observer<T> {
    next: Box<dyn Fn(&T)>,
    error: Option<Box<dyn Fn(&str)>>,
    complete: Option<Box<dyn Fn()>>,
}

impl<T> Observer<T> {
    /// Create an observer from a next-handler.
    #[must_use]
    pub fn new(next: impl Fn(&T) + 'static) -> Self {
        Self {
            next: Box::new(next),
            error: None,
            complete: None,
        }
    }

    /// Attach an error handler, invoked once if the channel terminates with
    /// an error.
    #[must_use]
    pub fn on_error(mut self, handler: impl Fn(&str) + 'static) -> Self {
        self.error = Some(Box::new(handler));
        self
    }

    /// Attach a completion handler, invoked once if the channel completes.
    #[must_use]
    pub fn on_complete(mut self, handler: impl Fn() + 'static) -> Self {
        self.complete = Some(Box::new(handler));
        self
    }
}

impl<T> std::fmt::Debug for Observer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("has_error_handler", &self.error.is_some())
            .field("has_complete_handler", &self.complete.is_some())
            .finish()
    }
}

/// Terminal state of a subject.
#[derive(Debug, Clone)]
enum Terminal {
    Errored(String),
    Completed,
}

struct SubjectInner<T> {
    observers: Vec<(u64, Rc<Observer<T>>)>,
    next_id: u64,
    terminal: Option<Terminal>,
    /// Guard against re-entrant emission.
    emitting: Cell<bool>,
}

/// A single-producer, multi-consumer broadcast channel.
///
/// Cloning a `Subject` creates a new handle to the **same** channel.
pub struct Subject<T> {
    inner: Rc<RefCell<SubjectInner<T>>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Subject")
            .field("observers", &inner.observers.len())
            .field("terminated", &inner.terminal.is_some())
            .finish()
    }
}

impl<T> Subject<T> {
    /// Create an open channel with no observers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(SubjectInner {
                observers: Vec::new(),
                next_id: 0,
                terminal: None,
                emitting: Cell::new(false),
            })),
        }
    }

    /// Deliver `value` to every currently-registered observer, in
    /// subscription order. A no-op once the channel has terminated.
    ///
    /// # Panics
    ///
    /// Panics if called from inside an observer callback of the same
    /// subject (re-entrant emission).
    pub fn emit(&self, value: &T) {
        let snapshot = {
            let inner = self.inner.borrow();
            if inner.terminal.is_some() {
                return;
            }
            Self::enter_emit(&inner);
            inner
                .observers
                .iter()
                .map(|(_, observer)| Rc::clone(observer))
                .collect::<Vec<_>>()
        };
        for observer in snapshot {
            (observer.next)(value);
        }
        self.inner.borrow().emitting.set(false);
    }

    /// Terminate the channel with an error, delivering it to every current
    /// observer in order. Later subscribers are replayed the error.
    ///
    /// # Panics
    ///
    /// Panics on re-entrant emission, like [`emit`](Self::emit).
    pub fn emit_error(&self, message: impl Into<String>) {
        let message = message.into();
        let Some(snapshot) = self.terminate(Terminal::Errored(message.clone())) else {
            return;
        };
        for observer in snapshot {
            if let Some(handler) = &observer.error {
                handler(&message);
            }
        }
        self.inner.borrow().emitting.set(false);
    }

    /// Terminate the channel normally, notifying every current observer in
    /// order. Later subscribers are replayed the completion.
    ///
    /// # Panics
    ///
    /// Panics on re-entrant emission, like [`emit`](Self::emit).
    pub fn emit_complete(&self) {
        let Some(snapshot) = self.terminate(Terminal::Completed) else {
            return;
        };
        for observer in snapshot {
            if let Some(handler) = &observer.complete {
                handler();
            }
        }
        self.inner.borrow().emitting.set(false);
    }

    /// Register an observer. Returns a handle whose
    /// [`unsubscribe`](Subscription::unsubscribe) removes it again.
    ///
    /// If the channel has already terminated, the observer's matching
    /// terminal handler is invoked immediately and the returned handle is
    /// inert.
    pub fn subscribe(&self, observer: Observer<T>) -> Subscription
    where
        T: 'static,
    {
        let terminal = {
            let mut inner = self.inner.borrow_mut();
            match &inner.terminal {
                Some(terminal) => terminal.clone(),
                None => {
                    let id = inner.next_id;
                    inner.next_id += 1;
                    inner.observers.push((id, Rc::new(observer)));
                    let weak = Rc::downgrade(&self.inner);
                    return Subscription::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner
                                .borrow_mut()
                                .observers
                                .retain(|(observer_id, _)| *observer_id != id);
                        }
                    });
                }
            }
        };
        match terminal {
            Terminal::Errored(message) => {
                if let Some(handler) = &observer.error {
                    handler(&message);
                }
            }
            Terminal::Completed => {
                if let Some(handler) = &observer.complete {
                    handler();
                }
            }
        }
        Subscription::inert()
    }

    /// Whether any observer is currently registered.
    #[must_use]
    pub fn has_observers(&self) -> bool {
        !self.inner.borrow().observers.is_empty()
    }

    /// Whether the channel has reached a terminal state.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.borrow().terminal.is_some()
    }

    fn enter_emit(inner: &SubjectInner<T>) {
        assert!(
            !inner.emitting.get(),
            "re-entrant emission on Subject: observers must not emit on the channel that is notifying them"
        );
        inner.emitting.set(true);
    }

    /// Freeze the channel, returning the drained observer snapshot, or
    /// `None` if it was already terminal.
    fn terminate(&self, terminal: Terminal) -> Option<Vec<Rc<Observer<T>>>> {
        let mut inner = self.inner.borrow_mut();
        if inner.terminal.is_some() {
            return None;
        }
        Self::enter_emit(&inner);
        inner.terminal = Some(terminal);
        Some(
            inner
                .observers
                .drain(..)
                .map(|(_, observer)| observer)
                .collect(),
        )
    }
}

/// Handle returned by [`Subject::subscribe`].
///
/// `unsubscribe` is idempotent: the first call detaches the observer, later
/// calls are no-ops. Dropping the handle without calling it leaves the
/// observer attached for the lifetime of the subject.
pub struct Subscription {
    cancel: Cell<Option<Box<dyn FnOnce()>>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Cell::new(Some(Box::new(cancel))),
        }
    }

    /// A handle that was never attached (terminal-state subscribe).
    fn inert() -> Self {
        Self {
            cancel: Cell::new(None),
        }
    }

    /// Detach the observer. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Whether the observer is still attached through this handle.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let cancel = self.cancel.take();
        let active = cancel.is_some();
        self.cancel.set(cancel);
        active
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn recording_observer(log: &Rc<RefCell<Vec<String>>>, tag: &str) -> Observer<i32> {
        let next_log = Rc::clone(log);
        let next_tag = tag.to_string();
        Observer::new(move |value| next_log.borrow_mut().push(format!("{next_tag}:{value}")))
    }

    #[test]
    fn delivers_in_subscription_order() {
        let subject = Subject::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let _a = subject.subscribe(recording_observer(&log, "a"));
        let _b = subject.subscribe(recording_observer(&log, "b"));

        subject.emit(&1);
        assert_eq!(*log.borrow(), vec!["a:1", "b:1"]);
    }

    #[test]
    fn no_replay_of_past_values() {
        let subject = Subject::new();
        subject.emit(&1);

        let log = Rc::new(RefCell::new(Vec::new()));
        let _sub = subject.subscribe(recording_observer(&log, "late"));
        assert!(log.borrow().is_empty());

        subject.emit(&2);
        assert_eq!(*log.borrow(), vec!["late:2"]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let subject = Subject::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let sub = subject.subscribe(recording_observer(&log, "a"));

        assert!(sub.is_active());
        sub.unsubscribe();
        assert!(!sub.is_active());
        sub.unsubscribe();

        subject.emit(&1);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn unsubscribe_from_within_a_callback_stops_later_emissions() {
        let subject: Subject<i32> = Subject::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let slot: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));
        let slot_clone = Rc::clone(&slot);
        let first_log = Rc::clone(&log);
        let _first = subject.subscribe(Observer::new(move |value: &i32| {
            first_log.borrow_mut().push(format!("first:{value}"));
            if let Some(sub) = slot_clone.borrow().as_ref() {
                sub.unsubscribe();
            }
        }));
        let second_log = Rc::clone(&log);
        let second = subject.subscribe(Observer::new(move |value: &i32| {
            second_log.borrow_mut().push(format!("second:{value}"));
        }));
        *slot.borrow_mut() = Some(second);

        // Second was present when emit started, so it still sees this value.
        subject.emit(&1);
        assert_eq!(*log.borrow(), vec!["first:1", "second:1"]);

        subject.emit(&2);
        assert_eq!(*log.borrow(), vec!["first:1", "second:1", "first:2"]);
    }

    #[test]
    fn subscribers_added_mid_emit_miss_the_inflight_value() {
        let subject: Subject<i32> = Subject::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let subject_clone = subject.clone();
        let outer_log = Rc::clone(&log);
        let added = Rc::new(Cell::new(false));
        let added_clone = Rc::clone(&added);
        let _outer = subject.subscribe(Observer::new(move |value: &i32| {
            outer_log.borrow_mut().push(format!("outer:{value}"));
            if !added_clone.get() {
                added_clone.set(true);
                let inner_log = Rc::clone(&outer_log);
                let sub = subject_clone.subscribe(Observer::new(move |value: &i32| {
                    inner_log.borrow_mut().push(format!("inner:{value}"));
                }));
                // Keep the inner observer attached.
                std::mem::forget(sub);
            }
        }));

        subject.emit(&1);
        assert_eq!(*log.borrow(), vec!["outer:1"]);

        subject.emit(&2);
        assert_eq!(*log.borrow(), vec!["outer:1", "outer:2", "inner:2"]);
    }

    #[test]
    fn error_freezes_and_replays_to_late_subscribers() {
        let subject: Subject<i32> = Subject::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let early_log = Rc::clone(&log);
        let _early = subject.subscribe(
            Observer::new(|_: &i32| {})
                .on_error(move |message| early_log.borrow_mut().push(format!("early:{message}"))),
        );

        subject.emit_error("boom");
        assert_eq!(*log.borrow(), vec!["early:boom"]);
        assert!(subject.is_terminated());
        assert!(!subject.has_observers());

        // Next emissions are swallowed.
        subject.emit(&1);

        let late_log = Rc::clone(&log);
        let late = subject.subscribe(
            Observer::new(move |value: &i32| late_log.borrow_mut().push(format!("late:{value}")))
                .on_error({
                    let late_log = Rc::clone(&log);
                    move |message| late_log.borrow_mut().push(format!("late-err:{message}"))
                }),
        );
        assert!(!late.is_active());
        assert_eq!(*log.borrow(), vec!["early:boom", "late-err:boom"]);
    }

    #[test]
    fn complete_freezes_and_replays_to_late_subscribers() {
        let subject: Subject<i32> = Subject::new();
        let completions = Rc::new(Cell::new(0));

        let early = Rc::clone(&completions);
        let _early = subject
            .subscribe(Observer::new(|_: &i32| {}).on_complete(move || early.set(early.get() + 1)));

        subject.emit_complete();
        assert_eq!(completions.get(), 1);

        // Second terminal signal is a no-op.
        subject.emit_error("ignored");
        assert_eq!(completions.get(), 1);

        let late = Rc::clone(&completions);
        let _late = subject
            .subscribe(Observer::new(|_: &i32| {}).on_complete(move || late.set(late.get() + 1)));
        assert_eq!(completions.get(), 2);
    }

    #[test]
    #[should_panic(expected = "re-entrant emission")]
    fn reentrant_emit_panics() {
        let subject: Subject<i32> = Subject::new();
        let subject_clone = subject.clone();
        let _sub = subject.subscribe(Observer::new(move |_: &i32| {
            subject_clone.emit(&99);
        }));
        subject.emit(&1);
    }

    #[test]
    fn unsubscribe_after_subject_dropped_is_noop() {
        let sub = {
            let subject: Subject<i32> = Subject::new();
            subject.subscribe(Observer::new(|_| {}))
        };
        sub.unsubscribe();
    }
}
