//! Call origination and tracking atop the AMI engine.
//!
//! A [`CallManager`] issues `Originate` actions and follows the life of
//! each call through the events that reference the unique id the switch
//! assigned to it. Per-call progress is delivered through an observer
//! callback; the originate handle itself resolves with the unique id.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use tracing::debug;

use crate::config::Fault;
use crate::error::{Error, Result};
use crate::handle::Handle;

use super::{Action, ActionReply, AmiProtocol, Event};

/// Progress of an originated call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CallProgress {
    /// The `Originate` action was accepted and queued by the switch.
    Queued,
    /// A channel exists and dialing is under way.
    Dialing { channel: Option<String> },
    /// The called party answered.
    Up,
    /// The call ended.
    HungUp {
        cause: Option<String>,
        cause_text: Option<String>,
    },
    /// The originate failed before the call came up.
    Failed { error: Error },
}

type Observer = Rc<RefCell<dyn FnMut(&CallProgress)>>;

struct CallRecord {
    handle: Handle<String>,
    observer: Observer,
    answered: bool,
}

#[derive(Default)]
struct CallsInner {
    /// Action id of the `Originate`, until `OriginateResponse` binds a
    /// unique id.
    by_action: HashMap<String, Rc<RefCell<CallRecord>>>,
    /// Unique id of the first channel, for the rest of the call.
    by_unique: HashMap<String, Rc<RefCell<CallRecord>>>,
}

/// Originates calls and tracks their state through AMI events.
///
/// Registers handlers for `OriginateResponse`, `Newchannel`,
/// `Newstate`, and `Hangup` on construction; unknown or late events are
/// ignored. Dropping the manager unregisters them.
pub struct CallManager {
    ami: AmiProtocol,
    inner: Rc<RefCell<CallsInner>>,
    tokens: Vec<super::EventHandlerToken>,
}

impl CallManager {
    /// Manager bound to `ami`, with its event handlers installed.
    pub fn new(ami: &AmiProtocol) -> Self {
        let inner = Rc::new(RefCell::new(CallsInner::default()));
        let mut tokens = Vec::new();

        let state = inner.clone();
        let sink = ami.fault_sink();
        tokens.push(ami.register_event_handler("OriginateResponse", move |event| {
            on_originate_response(&state, event, &sink);
        }));
        let state = inner.clone();
        let sink = ami.fault_sink();
        tokens.push(ami.register_event_handler("Newchannel", move |event| {
            on_channel_event(&state, event, &sink);
        }));
        let state = inner.clone();
        let sink = ami.fault_sink();
        tokens.push(ami.register_event_handler("Newstate", move |event| {
            on_channel_event(&state, event, &sink);
        }));
        let state = inner.clone();
        let sink = ami.fault_sink();
        tokens.push(ami.register_event_handler("Hangup", move |event| {
            on_hangup(&state, event, &sink);
        }));

        let state = inner.clone();
        let sink = ami.fault_sink();
        ami.on_connection_lost(move |cause| {
            let records: Vec<Rc<RefCell<CallRecord>>> = {
                let mut state = state.borrow_mut();
                let mut records: Vec<_> = state.by_action.drain().map(|(_, r)| r).collect();
                records.extend(state.by_unique.drain().map(|(_, r)| r));
                records
            };
            let error = Error::connection_lost(cause);
            for record in records {
                fail_call(&record, error.clone(), &sink);
            }
        });

        Self {
            ami: ami.clone(),
            inner,
            tokens,
        }
    }

    /// Originate a call. `action` must be an `Originate` action;
    /// `Async: true` is added when missing so the switch reports
    /// progress through events.
    ///
    /// The returned handle resolves with the unique id the switch
    /// assigned to the call, or fails if the originate is rejected.
    /// `observer` receives every [`CallProgress`] transition.
    pub fn originate(
        &self,
        action: Action,
        observer: impl FnMut(&CallProgress) + 'static,
    ) -> Handle<String> {
        let handle: Handle<String> = Handle::with_fault_sink(self.ami.fault_sink());
        let record = Rc::new(RefCell::new(CallRecord {
            handle: handle.clone(),
            observer: Rc::new(RefCell::new(observer)),
            answered: false,
        }));
        let action = if action.headers().contains("Async") {
            action
        } else {
            match action.header("Async", "true") {
                Ok(action) => action,
                Err(err) => {
                    let _ = handle.set_exception(err);
                    return handle;
                }
            }
        };

        let action_handle = self.ami.send_action(action);
        let state = self.inner.clone();
        let queued = record.clone();
        let sink = self.ami.fault_sink();
        let _ = action_handle.on_result(move |reply: ActionReply| {
            if let Some(id) = reply.response().action_id() {
                state.borrow_mut().by_action.insert(id.to_string(), queued.clone());
            }
            debug!("originate queued");
            notify(&queued, &CallProgress::Queued, &sink);
        });
        let rejected = record.clone();
        let sink = self.ami.fault_sink();
        let _ = action_handle.on_exception(move |err| {
            fail_call(&rejected, err, &sink);
        });
        handle
    }

    /// Install server-side event filters tailored for call tracking.
    ///
    /// Not required for correct operation, but recommended on busy
    /// switches to limit event traffic. The returned handle fires when
    /// every filter is accepted, or when one is refused.
    pub fn setup_filters(&self) -> Result<Handle<Vec<ActionReply>>> {
        let mut handles = Vec::new();
        for filter in ["Privilege: call,all", "Event: OriginateResponse"] {
            let action = Action::new("Filter")
                .header("Operation", "Add")?
                .header("Filter", filter)?;
            handles.push(self.ami.send_action(action));
        }
        Handle::aggregate(handles)
    }

    /// Number of calls currently tracked or awaiting their
    /// `OriginateResponse`.
    pub fn active_calls(&self) -> usize {
        let inner = self.inner.borrow();
        inner.by_action.len() + inner.by_unique.len()
    }
}

impl Drop for CallManager {
    fn drop(&mut self) {
        for token in self.tokens.drain(..) {
            self.ami.unregister_event_handler(token);
        }
    }
}

fn notify(record: &Rc<RefCell<CallRecord>>, progress: &CallProgress, sink: &crate::config::FaultSink) {
    let observer = record.borrow().observer.clone();
    let outcome = catch_unwind(AssertUnwindSafe(|| (observer.borrow_mut())(progress)));
    if outcome.is_err() {
        sink(&Fault::HandlerPanic {
            context: "call progress observer".to_string(),
        });
    }
}

fn fail_call(record: &Rc<RefCell<CallRecord>>, error: Error, sink: &crate::config::FaultSink) {
    {
        let record = record.borrow();
        if !record.handle.is_completed() {
            let _ = record.handle.set_exception(error.clone());
        }
    }
    notify(record, &CallProgress::Failed { error }, sink);
}

fn on_originate_response(
    state: &Rc<RefCell<CallsInner>>,
    event: &Event,
    sink: &crate::config::FaultSink,
) {
    let Some(action_id) = event.action_id() else {
        return;
    };
    let record = state.borrow_mut().by_action.remove(action_id);
    let Some(record) = record else {
        return;
    };
    if event.header("Response") == Some("Failure") {
        let reason = event.header("Reason").unwrap_or("unknown");
        fail_call(
            &record,
            Error::Action {
                message: format!("Originate failed with reason {reason}"),
            },
            sink,
        );
        return;
    }
    let Some(unique_id) = event.header("Uniqueid") else {
        fail_call(
            &record,
            Error::Action {
                message: "OriginateResponse without Uniqueid".to_string(),
            },
            sink,
        );
        return;
    };
    debug!(unique_id, "call bound to channel");
    state
        .borrow_mut()
        .by_unique
        .insert(unique_id.to_string(), record.clone());
    {
        let record = record.borrow();
        if !record.handle.is_completed() {
            let _ = record.handle.set_result(unique_id.to_string());
        }
    }
    notify(
        &record,
        &CallProgress::Dialing {
            channel: event.header("Channel").map(str::to_string),
        },
        sink,
    );
}

fn on_channel_event(
    state: &Rc<RefCell<CallsInner>>,
    event: &Event,
    sink: &crate::config::FaultSink,
) {
    let Some(unique_id) = event.header("Uniqueid") else {
        return;
    };
    let record = state.borrow().by_unique.get(unique_id).cloned();
    let Some(record) = record else {
        return;
    };
    if event.header("ChannelStateDesc") == Some("Up") {
        let first = {
            let mut record = record.borrow_mut();
            let first = !record.answered;
            record.answered = true;
            first
        };
        if first {
            notify(&record, &CallProgress::Up, sink);
        }
    }
}

fn on_hangup(state: &Rc<RefCell<CallsInner>>, event: &Event, sink: &crate::config::FaultSink) {
    let Some(unique_id) = event.header("Uniqueid") else {
        return;
    };
    let record = state.borrow_mut().by_unique.remove(unique_id);
    let Some(record) = record else {
        return;
    };
    notify(
        &record,
        &CallProgress::HungUp {
            cause: event.header("Cause").map(str::to_string),
            cause_text: event.header("Cause-txt").map(str::to_string),
        },
        sink,
    );
}
