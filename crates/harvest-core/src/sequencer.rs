//! Canonical event order for intercepted exchanges.
//!
//! Consumers that replay a finished exchange must see its lifecycle events
//! in the same order the proxy would have emitted them live. [`sequence`]
//! returns a lazy [`EventSequence`] over those events.
//!
//! For stream exchanges the sequence replays messages: the exchange starts
//! with no delivered messages and each `Message` event moves one pending
//! message onto `messages`. Dropping the sequence early discards the
//! messages that were never delivered.

use std::collections::VecDeque;

use crate::error::{CaptureError, Result};
use crate::exchange::{Exchange, StreamMessage};

/// A lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowEvent {
    /// Request headers were read.
    RequestHeadersReady,
    /// The full request was read.
    RequestComplete,
    /// Response headers were read.
    ResponseHeadersReady,
    /// The full response was read.
    ResponseComplete,
    /// The exchange failed.
    Error,
    /// A stream opened.
    StreamStart,
    /// One stream message was delivered.
    StreamMessage,
    /// A stream failed.
    StreamError,
    /// A stream closed.
    StreamEnd,
}

impl FlowEvent {
    /// Event name, prefixed with the stream kind for stream events.
    pub fn name(&self, kind: &str) -> String {
        let base = match self {
            FlowEvent::RequestHeadersReady => return "requestheaders".to_string(),
            FlowEvent::RequestComplete => return "request".to_string(),
            FlowEvent::ResponseHeadersReady => return "responseheaders".to_string(),
            FlowEvent::ResponseComplete => return "response".to_string(),
            FlowEvent::Error => return "error".to_string(),
            FlowEvent::StreamStart => "start",
            FlowEvent::StreamMessage => "message",
            FlowEvent::StreamError => "error",
            FlowEvent::StreamEnd => "end",
        };
        format!("{}_{}", kind, base)
    }
}

#[derive(Debug)]
enum Plan {
    /// Fixed list of events, emitted front to back.
    Fixed(VecDeque<FlowEvent>),
    /// Stream replay.
    Stream {
        started: bool,
        pending: VecDeque<StreamMessage>,
        has_error: bool,
        finished: bool,
    },
}

/// Lazy, finite event sequence over one exchange.
#[derive(Debug)]
pub struct EventSequence<'a> {
    exchange: &'a mut Exchange,
    plan: Plan,
}

impl<'a> EventSequence<'a> {
    /// The exchange in its state after the last yielded event.
    pub fn exchange(&self) -> &Exchange {
        self.exchange
    }
}

impl Iterator for EventSequence<'_> {
    type Item = FlowEvent;

    fn next(&mut self) -> Option<FlowEvent> {
        match &mut self.plan {
            Plan::Fixed(events) => events.pop_front(),
            Plan::Stream {
                started,
                pending,
                has_error,
                finished,
            } => {
                if !*started {
                    *started = true;
                    return Some(FlowEvent::StreamStart);
                }
                if let Some(message) = pending.pop_front() {
                    if let Exchange::WebSocket(flow) | Exchange::Tcp(flow) = &mut *self.exchange {
                        flow.push(message);
                    }
                    return Some(FlowEvent::StreamMessage);
                }
                if *has_error {
                    *has_error = false;
                    return Some(FlowEvent::StreamError);
                }
                if !*finished {
                    *finished = true;
                    return Some(FlowEvent::StreamEnd);
                }
                None
            }
        }
    }
}

/// Starts the event sequence for an exchange.
///
/// Fails with [`CaptureError::UnsupportedExchangeKind`] for exchange kinds
/// that have no defined event order.
pub fn sequence(exchange: &mut Exchange) -> Result<EventSequence<'_>> {
    let plan = match &mut *exchange {
        Exchange::Http(flow) => {
            let mut events = VecDeque::with_capacity(5);
            if flow.request.is_some() {
                events.push_back(FlowEvent::RequestHeadersReady);
                events.push_back(FlowEvent::RequestComplete);
            }
            if flow.response.is_some() {
                events.push_back(FlowEvent::ResponseHeadersReady);
                events.push_back(FlowEvent::ResponseComplete);
            }
            if flow.error.is_some() {
                events.push_back(FlowEvent::Error);
            }
            Plan::Fixed(events)
        }
        Exchange::WebSocket(flow) | Exchange::Tcp(flow) => Plan::Stream {
            started: false,
            pending: flow.take_pending(),
            has_error: flow.error.is_some(),
            finished: false,
        },
        Exchange::Other(flow) => {
            return Err(CaptureError::UnsupportedExchangeKind(flow.kind.clone()));
        }
    };
    Ok(EventSequence { exchange, plan })
}

/// Receives replayed events.
pub trait FlowEventHandler {
    /// Called once per event with the exchange as of that event.
    fn on_event(&mut self, event: FlowEvent, exchange: &Exchange);
}

impl<F> FlowEventHandler for F
where
    F: FnMut(FlowEvent, &Exchange),
{
    fn on_event(&mut self, event: FlowEvent, exchange: &Exchange) {
        self(event, exchange)
    }
}

/// Drives `handler` through the full event sequence of `exchange`.
///
/// Returns the number of events delivered.
pub fn replay<H: FlowEventHandler + ?Sized>(exchange: &mut Exchange, handler: &mut H) -> Result<usize> {
    let mut events = sequence(exchange)?;
    let mut count = 0;
    while let Some(event) = events.next() {
        handler.on_event(event, events.exchange());
        count += 1;
    }
    tracing::trace!("Replayed {} events", count);
    Ok(count)
}
