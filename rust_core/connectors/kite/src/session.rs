//! Connection state machine, independent of any socket.
//!
//! The async driver in `ws` feeds socket events in and performs the requests
//! and retry decisions that come back out.

use std::collections::BTreeSet;
use std::time::Duration;

use connectors_common::Mode;
use serde::Serialize;

use crate::protocol::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            base_delay: Duration::from_millis(1000),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// `base * 2^(attempt - 1)`, saturating. Attempts are numbered from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// What the driver should do after the socket went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
    /// Manually disconnected; nothing to do.
    Halted,
}

#[derive(Debug)]
pub struct Session {
    policy: ReconnectPolicy,
    status: ConnectionStatus,
    attempts: u32,
    manual: bool,
    subscriptions: BTreeSet<u32>,
}

impl Session {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Session {
            policy,
            status: ConnectionStatus::Disconnected,
            attempts: 0,
            manual: false,
            subscriptions: BTreeSet::new(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn is_halted(&self) -> bool {
        self.manual
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn subscriptions(&self) -> Vec<u32> {
        self.subscriptions.iter().copied().collect()
    }

    /// Returns false when a connect would be a no-op: already connecting or
    /// open, or manually disconnected.
    pub fn begin_connect(&mut self) -> bool {
        if self.manual
            || matches!(
                self.status,
                ConnectionStatus::Connecting | ConnectionStatus::Connected
            )
        {
            return false;
        }
        self.status = ConnectionStatus::Connecting;
        true
    }

    /// Socket opened. Returns the full subscription replay.
    pub fn on_open(&mut self) -> Vec<Request> {
        self.status = ConnectionStatus::Connected;
        self.attempts = 0;
        full_mode_subscribe(self.subscriptions())
    }

    /// Socket closed or failed, whether or not it had opened.
    pub fn on_closed(&mut self, failed: bool) -> Reconnect {
        if self.manual {
            self.status = ConnectionStatus::Disconnected;
            return Reconnect::Halted;
        }
        if self.attempts >= self.policy.max_attempts {
            self.status = ConnectionStatus::Disconnected;
            return Reconnect::GiveUp {
                attempts: self.attempts,
            };
        }
        self.status = if failed {
            ConnectionStatus::Error
        } else {
            ConnectionStatus::Disconnected
        };
        self.attempts += 1;
        Reconnect::Retry {
            attempt: self.attempts,
            delay: self.policy.delay_for(self.attempts),
        }
    }

    /// Records the tokens; returns wire requests only while open.
    pub fn subscribe(&mut self, tokens: &[u32]) -> Vec<Request> {
        let tokens = dedup(tokens);
        self.subscriptions.extend(tokens.iter().copied());
        if self.is_open() {
            full_mode_subscribe(tokens)
        } else {
            Vec::new()
        }
    }

    pub fn unsubscribe(&mut self, tokens: &[u32]) -> Vec<Request> {
        let tokens = dedup(tokens);
        for token in &tokens {
            self.subscriptions.remove(token);
        }
        if self.is_open() && !tokens.is_empty() {
            vec![Request::Unsubscribe(tokens)]
        } else {
            Vec::new()
        }
    }

    pub fn disconnect(&mut self) {
        self.manual = true;
        self.status = ConnectionStatus::Disconnected;
    }
}

fn dedup(tokens: &[u32]) -> Vec<u32> {
    tokens
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn full_mode_subscribe(tokens: Vec<u32>) -> Vec<Request> {
    if tokens.is_empty() {
        return Vec::new();
    }
    vec![
        Request::Subscribe(tokens.clone()),
        Request::SetMode(Mode::Full, tokens),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(1000),
            max_attempts,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let p = policy(10);
        assert_eq!(p.delay_for(1), Duration::from_millis(1000));
        assert_eq!(p.delay_for(2), Duration::from_millis(2000));
        assert_eq!(p.delay_for(3), Duration::from_millis(4000));
        assert!(p.delay_for(80) >= p.delay_for(31));
    }

    #[test]
    fn third_consecutive_close_waits_four_seconds() {
        let mut s = Session::new(policy(10));
        let mut delays = Vec::new();
        for _ in 0..3 {
            assert!(s.begin_connect());
            match s.on_closed(true) {
                Reconnect::Retry { delay, .. } => delays.push(delay),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(delays[2], Duration::from_millis(4000));
        assert_eq!(s.status(), ConnectionStatus::Error);
    }

    #[test]
    fn gives_up_after_cap_and_settles_disconnected() {
        let mut s = Session::new(policy(3));
        for attempt in 1..=3 {
            s.begin_connect();
            assert!(matches!(
                s.on_closed(true),
                Reconnect::Retry { attempt: a, .. } if a == attempt
            ));
        }
        s.begin_connect();
        assert_eq!(s.on_closed(true), Reconnect::GiveUp { attempts: 3 });
        assert_eq!(s.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn open_resets_attempts_and_replays_everything() {
        let mut s = Session::new(policy(10));
        assert!(s.subscribe(&[22, 11, 22]).is_empty());
        s.begin_connect();
        s.on_closed(true);
        s.begin_connect();
        let replay = s.on_open();
        assert_eq!(s.attempts(), 0);
        assert_eq!(
            replay,
            vec![
                Request::Subscribe(vec![11, 22]),
                Request::SetMode(Mode::Full, vec![11, 22])
            ]
        );
    }

    #[test]
    fn replay_survives_reconnect_without_new_calls() {
        let mut s = Session::new(policy(10));
        s.begin_connect();
        s.on_open();
        assert_eq!(s.subscribe(&[11, 22]).len(), 2);
        s.on_closed(false);
        assert!(s.begin_connect());
        assert_eq!(s.on_open()[0], Request::Subscribe(vec![11, 22]));
    }

    #[test]
    fn unsubscribe_while_closed_only_updates_set() {
        let mut s = Session::new(policy(10));
        s.subscribe(&[1, 2, 3]);
        assert!(s.unsubscribe(&[2, 9]).is_empty());
        assert_eq!(s.subscriptions(), vec![1, 3]);

        s.begin_connect();
        s.on_open();
        assert_eq!(s.unsubscribe(&[3]), vec![Request::Unsubscribe(vec![3])]);
        assert!(s.unsubscribe(&[]).is_empty());
        assert!(s.subscribe(&[]).is_empty());
    }

    #[test]
    fn connect_is_noop_when_open_or_manual() {
        let mut s = Session::new(policy(10));
        assert!(s.begin_connect());
        assert!(!s.begin_connect());
        s.on_open();
        assert!(!s.begin_connect());
        s.disconnect();
        assert!(!s.begin_connect());
        assert_eq!(s.on_closed(true), Reconnect::Halted);
        assert_eq!(s.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn empty_set_replays_nothing() {
        let mut s = Session::new(policy(10));
        s.begin_connect();
        assert!(s.on_open().is_empty());
    }
}
