//! Per-connection timing capture.
//!
//! The proxy engine reports the start of each network phase; the recorder
//! stamps it with the monotonic clock and turns "finished" reports into
//! millisecond [`Timing`]s. Each connection has its own [`TimingState`],
//! kept in a sharded map so concurrent connections never contend on one
//! lock. The set of connections already attributed connect/TLS time is a
//! single mutex-guarded set: a connection is charged for its handshake
//! exactly once, on its first exchange.

use std::collections::HashSet;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::clock::SharedClock;
use crate::exchange::{ConnectionId, ServerConnection};
use crate::model::Timing;

/// Phase timestamps of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingState {
    pub dns_start: Option<Instant>,
    pub connect_start: Option<Instant>,
    pub tls_start: Option<Instant>,
    pub send_start: Option<Instant>,
    pub send_end: Option<Instant>,
    pub receive_start: Option<Instant>,
}

/// How far an exchange got on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Request is being written upstream.
    Sending,
    /// Request written, no response bytes yet.
    Waiting,
    /// Response is being read.
    Receiving,
}

impl TimingState {
    /// Stage in progress, or `None` if no request bytes were sent.
    pub fn stage(&self) -> Option<Stage> {
        if self.receive_start.is_some() {
            Some(Stage::Receiving)
        } else if self.send_end.is_some() {
            Some(Stage::Waiting)
        } else if self.send_start.is_some() {
            Some(Stage::Sending)
        } else {
            None
        }
    }

    /// Timestamp the in-progress stage started at.
    pub fn stage_start(&self) -> Option<(Stage, Instant)> {
        match self.stage()? {
            Stage::Receiving => self.receive_start.map(|t| (Stage::Receiving, t)),
            Stage::Waiting => self.send_end.map(|t| (Stage::Waiting, t)),
            Stage::Sending => self.send_start.map(|t| (Stage::Sending, t)),
        }
    }
}

/// Records lifecycle timestamps per connection.
#[derive(Debug)]
pub struct TimingRecorder {
    clock: SharedClock,
    states: DashMap<ConnectionId, TimingState>,
    seen: Mutex<HashSet<ConnectionId>>,
}

impl TimingRecorder {
    /// Creates a recorder reading time from `clock`.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            states: DashMap::new(),
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// The recorder's clock.
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    fn stamp(&self, conn: ConnectionId, select: impl FnOnce(&mut TimingState) -> &mut Option<Instant>) {
        let now = self.clock.now();
        let mut state = self.states.entry(conn).or_default();
        let slot = select(&mut *state);
        if slot.is_none() {
            *slot = Some(now);
        }
    }

    /// Milliseconds elapsed since `start`, or not applicable.
    pub fn elapsed_since(&self, start: Option<Instant>) -> Timing {
        match start {
            Some(start) => Timing::from(self.clock.now().saturating_duration_since(start)),
            None => Timing::NotApplicable,
        }
    }

    /// Address resolution began. The connection attempt is considered
    /// started as well.
    pub fn dns_started(&self, conn: ConnectionId) {
        let now = self.clock.now();
        let mut state = self.states.entry(conn).or_default();
        state.dns_start.get_or_insert(now);
        state.connect_start.get_or_insert(now);
    }

    /// Address resolution ended; returns the resolution time.
    ///
    /// The connect phase is restarted here so it does not include resolution.
    pub fn dns_finished(&self, conn: ConnectionId) -> Timing {
        let now = self.clock.now();
        let mut state = self.states.entry(conn).or_default();
        let timing = match state.dns_start {
            Some(start) => Timing::from(now.saturating_duration_since(start)),
            None => Timing::NotApplicable,
        };
        if state.dns_start.is_some() {
            state.connect_start = Some(now);
        }
        timing
    }

    /// TLS handshake began.
    pub fn tls_started(&self, conn: ConnectionId) {
        self.stamp(conn, |s| &mut s.tls_start);
    }

    /// Request transmission began.
    pub fn send_started(&self, conn: ConnectionId) {
        self.stamp(conn, |s| &mut s.send_start);
    }

    /// Request transmission ended; returns the send time.
    pub fn send_finished(&self, conn: ConnectionId) -> Timing {
        let now = self.clock.now();
        let mut state = self.states.entry(conn).or_default();
        state.send_end.get_or_insert(now);
        match state.send_start {
            Some(start) => Timing::from(now.saturating_duration_since(start)),
            None => Timing::NotApplicable,
        }
    }

    /// First response bytes arrived.
    pub fn receive_started(&self, conn: ConnectionId) {
        self.stamp(conn, |s| &mut s.receive_start);
    }

    /// Copy of the connection's current timestamps.
    pub fn snapshot(&self, conn: ConnectionId) -> TimingState {
        self.states.get(&conn).map(|s| *s).unwrap_or_default()
    }

    /// Marks the connection seen; returns true the first time.
    pub fn mark_seen(&self, conn: ConnectionId) -> bool {
        self.seen.lock().insert(conn)
    }

    /// Returns true if the connection was already charged for its handshake.
    pub fn is_seen(&self, conn: ConnectionId) -> bool {
        self.seen.lock().contains(&conn)
    }

    /// Connect and TLS time for an exchange on `server`.
    ///
    /// Both are not applicable once the connection has been seen. Engine
    /// timestamps on the connection win over the recorder's own.
    pub fn connection_phases(&self, server: &ServerConnection, state: &TimingState) -> (Timing, Timing) {
        if !self.mark_seen(server.id) {
            return (Timing::NotApplicable, Timing::NotApplicable);
        }

        let connect = match (server.timestamp_start, server.timestamp_tcp_setup) {
            (Some(start), Some(setup)) => Timing::from_duration(setup - start),
            _ => match (state.connect_start, state.tls_start.or(state.send_start)) {
                (Some(start), Some(end)) => Timing::from(end.saturating_duration_since(start)),
                _ => Timing::NotApplicable,
            },
        };

        let ssl = match (server.timestamp_tcp_setup, server.timestamp_tls_setup) {
            (Some(tcp), Some(tls)) => Timing::from_duration(tls - tcp),
            _ => match (state.tls_start, state.send_start) {
                (Some(start), Some(end)) => Timing::from(end.saturating_duration_since(start)),
                _ => Timing::NotApplicable,
            },
        };

        (connect, ssl)
    }

    /// Drops the connection's timestamps once its exchange resolved.
    pub fn finish(&self, conn: ConnectionId) -> Option<TimingState> {
        self.states.remove(&conn).map(|(_, state)| state)
    }

    /// Forgets everything about a closed connection.
    pub fn close(&self, conn: ConnectionId) {
        self.states.remove(&conn);
        self.seen.lock().remove(&conn);
    }

    /// Number of connections with live timing state.
    pub fn tracked_connections(&self) -> usize {
        self.states.len()
    }
}
