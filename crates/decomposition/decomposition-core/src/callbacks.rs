//! Scoped notification callbacks
//!
//! The model consuming the decomposition attaches two callbacks: one told
//! when the residual baseline changed and must be reseeded, one receiving
//! human readable annotations. Attaching returns a guard; dropping the
//! guard detaches both.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::stats::MeanAccumulator;

pub type ComponentChangeCallback = Box<dyn FnMut(Vec<MeanAccumulator>)>;
pub type AnnotationCallback = Box<dyn FnMut(&str)>;

#[derive(Default)]
struct Callbacks {
    component_change: Option<ComponentChangeCallback>,
    annotation: Option<AnnotationCallback>,
}

/// Callbacks shared between the decomposition and its handlers
#[derive(Clone, Default)]
pub struct SharedCallbacks {
    inner: Rc<RefCell<Callbacks>>,
}

impl SharedCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach both callbacks, replacing any already attached.
    pub fn attach(
        &self,
        component_change: ComponentChangeCallback,
        annotation: AnnotationCallback,
    ) -> CallbackGuard {
        match self.inner.try_borrow_mut() {
            Ok(mut callbacks) => {
                callbacks.component_change = Some(component_change);
                callbacks.annotation = Some(annotation);
            }
            Err(_) => trace!("Callbacks busy, not attaching"),
        }
        CallbackGuard {
            callbacks: Rc::downgrade(&self.inner),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.inner
            .try_borrow()
            .map(|callbacks| callbacks.component_change.is_some() || callbacks.annotation.is_some())
            .unwrap_or(true)
    }

    /// Tell the consumer its residual baseline changed. An empty payload
    /// means nothing usable changed hands.
    pub fn component_change(&self, residuals: Vec<MeanAccumulator>) {
        match self.inner.try_borrow_mut() {
            Ok(mut callbacks) => {
                if let Some(callback) = callbacks.component_change.as_mut() {
                    callback(residuals);
                }
            }
            Err(_) => trace!("Re-entrant component change notification dropped"),
        }
    }

    pub fn annotate(&self, annotation: &str) {
        match self.inner.try_borrow_mut() {
            Ok(mut callbacks) => {
                if let Some(callback) = callbacks.annotation.as_mut() {
                    callback(annotation);
                }
            }
            Err(_) => trace!(annotation, "Re-entrant annotation dropped"),
        }
    }
}

impl fmt::Debug for SharedCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCallbacks")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Detaches the callbacks when dropped
#[must_use = "dropping the guard detaches the callbacks"]
pub struct CallbackGuard {
    callbacks: Weak<RefCell<Callbacks>>,
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        if let Some(callbacks) = self.callbacks.upgrade() {
            if let Ok(mut callbacks) = callbacks.try_borrow_mut() {
                callbacks.component_change = None;
                callbacks.annotation = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifications_reach_attached_callbacks() {
        let shared = SharedCallbacks::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let notes = Rc::new(RefCell::new(Vec::new()));
        let seen_ = Rc::clone(&seen);
        let notes_ = Rc::clone(&notes);
        let _guard = shared.attach(
            Box::new(move |values: Vec<MeanAccumulator>| seen_.borrow_mut().push(values.len())),
            Box::new(move |text: &str| notes_.borrow_mut().push(text.to_string())),
        );
        assert!(shared.is_attached());
        shared.component_change(vec![MeanAccumulator::new(); 3]);
        shared.annotate("Detected trend");
        assert_eq!(*seen.borrow(), vec![3]);
        assert_eq!(*notes.borrow(), vec!["Detected trend".to_string()]);
    }

    #[test]
    fn test_dropping_guard_detaches() {
        let shared = SharedCallbacks::new();
        let count = Rc::new(RefCell::new(0));
        let count_ = Rc::clone(&count);
        {
            let _guard = shared.attach(
                Box::new(move |_| *count_.borrow_mut() += 1),
                Box::new(|_| {}),
            );
            shared.component_change(Vec::new());
        }
        assert!(!shared.is_attached());
        shared.component_change(Vec::new());
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn test_unattached_is_noop() {
        let shared = SharedCallbacks::new();
        shared.component_change(Vec::new());
        shared.annotate("nothing listening");
        assert!(!shared.is_attached());
    }

    #[test]
    fn test_guard_outliving_callbacks() {
        let guard = {
            let shared = SharedCallbacks::new();
            shared.attach(Box::new(|_| {}), Box::new(|_| {}))
        };
        drop(guard);
    }
}
