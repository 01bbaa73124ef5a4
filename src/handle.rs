//! Single-shot deferred result handle.
//!
//! A [`Handle`] is the return value of every asynchronous request: the
//! engine keeps one clone to fulfil, the caller keeps another and
//! attaches success/failure sinks. Also known as Future, Promise,
//! Deferred. Fulfilment happens at most once; attaching a sink after
//! fulfilment invokes it immediately with the stored outcome. Sink
//! panics are caught and reported to the fault sink so they never
//! propagate into the engine loop.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use crate::config::{logging_fault_sink, Fault, FaultSink};
use crate::error::{Error, Result};

struct Inner<T> {
    outcome: Option<Result<T>>,
    on_result: Option<Box<dyn FnOnce(T)>>,
    on_exception: Option<Box<dyn FnOnce(Error)>>,
    result_attached: bool,
    exception_attached: bool,
    fault_sink: FaultSink,
}

/// Shared single-shot result slot with success and failure sinks.
///
/// Clones share the slot. Handles are single-threaded (`!Send`), like
/// the engines that create them.
pub struct Handle<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Handle")
            .field("completed", &inner.outcome.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + 'static> Default for Handle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> Handle<T> {
    /// Unfulfilled handle reporting sink panics through the default
    /// logging fault sink.
    pub fn new() -> Self {
        Self::with_fault_sink(logging_fault_sink())
    }

    /// Unfulfilled handle reporting sink panics to `fault_sink`.
    pub fn with_fault_sink(fault_sink: FaultSink) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                outcome: None,
                on_result: None,
                on_exception: None,
                result_attached: false,
                exception_attached: false,
                fault_sink,
            })),
        }
    }

    /// Handle already failed with `err`. Sinks attached later fire
    /// immediately.
    pub fn failed(err: Error) -> Self {
        let handle = Self::new();
        let _ = handle.set_exception(err);
        handle
    }

    /// Fulfil with a successful result.
    ///
    /// Fails with [`Error::InvalidState`] when the handle is already
    /// fulfilled.
    pub fn set_result(&self, value: T) -> Result<()> {
        let cb = {
            let mut inner = self.inner.borrow_mut();
            if inner.outcome.is_some() {
                return Err(Error::invalid_state("handle already completed"));
            }
            inner.outcome = Some(Ok(value.clone()));
            inner.on_result.take()
        };
        if let Some(cb) = cb {
            self.invoke(move || cb(value), "result sink");
        }
        Ok(())
    }

    /// Fulfil with a failure.
    ///
    /// Fails with [`Error::InvalidState`] when the handle is already
    /// fulfilled.
    pub fn set_exception(&self, err: Error) -> Result<()> {
        let cb = {
            let mut inner = self.inner.borrow_mut();
            if inner.outcome.is_some() {
                return Err(Error::invalid_state("handle already completed"));
            }
            inner.outcome = Some(Err(err.clone()));
            inner.on_exception.take()
        };
        if let Some(cb) = cb {
            self.invoke(move || cb(err), "exception sink");
        }
        Ok(())
    }

    /// Attach the success sink.
    ///
    /// Invoked synchronously if the handle already succeeded. Attaching
    /// a second success sink fails with [`Error::InvalidState`].
    pub fn on_result(&self, f: impl FnOnce(T) + 'static) -> Result<()> {
        let ready = {
            let mut inner = self.inner.borrow_mut();
            if inner.result_attached {
                return Err(Error::invalid_state("on_result already set"));
            }
            inner.result_attached = true;
            match &inner.outcome {
                None => {
                    inner.on_result = Some(Box::new(f));
                    return Ok(());
                }
                Some(Ok(value)) => Some(value.clone()),
                Some(Err(_)) => None,
            }
        };
        if let Some(value) = ready {
            self.invoke(move || f(value), "result sink");
        }
        Ok(())
    }

    /// Attach the failure sink.
    ///
    /// Invoked synchronously if the handle already failed. Attaching a
    /// second failure sink fails with [`Error::InvalidState`].
    pub fn on_exception(&self, f: impl FnOnce(Error) + 'static) -> Result<()> {
        let ready = {
            let mut inner = self.inner.borrow_mut();
            if inner.exception_attached {
                return Err(Error::invalid_state("on_exception already set"));
            }
            inner.exception_attached = true;
            match &inner.outcome {
                None => {
                    inner.on_exception = Some(Box::new(f));
                    return Ok(());
                }
                Some(Err(err)) => Some(err.clone()),
                Some(Ok(_)) => None,
            }
        };
        if let Some(err) = ready {
            self.invoke(move || f(err), "exception sink");
        }
        Ok(())
    }

    /// `true` once `set_result` or `set_exception` has run.
    pub fn is_completed(&self) -> bool {
        self.inner.borrow().outcome.is_some()
    }

    /// Stored outcome, once fulfilled.
    pub fn outcome(&self) -> Option<Result<T>> {
        self.inner.borrow().outcome.clone()
    }

    /// Handle resolving with every result in order once all `handles`
    /// succeed, or failing with the first failure.
    ///
    /// Fails synchronously if any child handle already carries a sink.
    pub fn aggregate(handles: Vec<Handle<T>>) -> Result<Handle<Vec<T>>> {
        let aggregate = Handle::new();
        if handles.is_empty() {
            aggregate.set_result(Vec::new())?;
            return Ok(aggregate);
        }
        let slots: Rc<RefCell<Vec<Option<T>>>> =
            Rc::new(RefCell::new(handles.iter().map(|_| None).collect()));
        let remaining = Rc::new(Cell::new(handles.len()));
        for (i, handle) in handles.iter().enumerate() {
            let slots = slots.clone();
            let remaining = remaining.clone();
            let on_ok = aggregate.clone();
            handle.on_result(move |value| {
                if on_ok.is_completed() {
                    return;
                }
                slots.borrow_mut()[i] = Some(value);
                remaining.set(remaining.get() - 1);
                if remaining.get() == 0 {
                    let values = slots.borrow_mut().drain(..).flatten().collect();
                    let _ = on_ok.set_result(values);
                }
            })?;
            let on_err = aggregate.clone();
            handle.on_exception(move |err| {
                let _ = on_err.set_exception(err);
            })?;
        }
        Ok(aggregate)
    }

    fn invoke(&self, f: impl FnOnce(), context: &'static str) {
        let fault_sink = self.inner.borrow().fault_sink.clone();
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            fault_sink(&Fault::HandlerPanic {
                context: context.to_string(),
            });
        }
    }
}
