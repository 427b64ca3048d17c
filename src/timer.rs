//! NAS Timer Management
//!
//! Timer identifiers, per-timer configuration and the timer wheel feeding
//! the central event queue. Handles are generation counted so stopping a
//! timer is idempotent and a stop racing a just-fired expiry is harmless:
//! the owning procedure compares the token carried by the expiry against
//! the one it recorded before acting on it.

use crate::config::NasTimerConf;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// MME-side NAS timer identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Attach/TAU accept retransmission
    T3450,
    /// Authentication / security mode command retransmission
    T3460,
    /// Identity request retransmission
    T3470,
    /// Attach back-off value signalled to the UE
    T3402,
    /// Paging
    T3413,
    /// Detach request retransmission
    T3422,
}

impl TimerId {
    /// Timer name for logs
    pub fn name(&self) -> &'static str {
        match self {
            TimerId::T3450 => "T3450",
            TimerId::T3460 => "T3460",
            TimerId::T3470 => "T3470",
            TimerId::T3402 => "T3402",
            TimerId::T3413 => "T3413",
            TimerId::T3422 => "T3422",
        }
    }

    /// Configured duration for this timer
    pub fn duration(&self, conf: &NasTimerConf) -> Duration {
        let secs = match self {
            TimerId::T3450 => conf.t3450,
            TimerId::T3460 => conf.t3460,
            TimerId::T3470 => conf.t3470,
            TimerId::T3402 => conf.t3402,
            TimerId::T3413 => conf.t3413,
            TimerId::T3422 => conf.t3422,
        };
        Duration::from_secs(secs)
    }
}

/// Maximum number of message transmissions driven by a retransmission timer
pub const NAS_RETX_MAX: u32 = 5;

/// Handle to a running timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// A fired timer, as delivered on the event queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerExpiry {
    pub token: TimerToken,
    pub timer_id: TimerId,
    /// Context pool id the timer belongs to
    pub ue: crate::context::UeCtxId,
}

#[derive(Debug)]
struct Armed {
    deadline: Instant,
    timer_id: TimerId,
    ue: crate::context::UeCtxId,
}

#[derive(Debug, Default)]
struct WheelInner {
    next_token: u64,
    /// Ordered by deadline; token breaks ties
    tree: BTreeMap<(Instant, u64), ()>,
    armed: HashMap<u64, Armed>,
}

/// Timer wheel shared by the dispatcher and the timer thread
#[derive(Debug)]
pub struct TimerManager {
    inner: Mutex<WheelInner>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WheelInner {
                next_token: 1,
                ..Default::default()
            }),
        }
    }

    /// Arm a timer; returns the handle the owner must keep to stop it
    pub fn start(
        &self,
        timer_id: TimerId,
        duration: Duration,
        ue: crate::context::UeCtxId,
    ) -> TimerToken {
        let mut inner = self.inner.lock().unwrap();
        let token = inner.next_token;
        inner.next_token += 1;
        let deadline = Instant::now() + duration;
        inner.tree.insert((deadline, token), ());
        inner.armed.insert(
            token,
            Armed {
                deadline,
                timer_id,
                ue,
            },
        );
        log::trace!("{} armed for ue {:?} ({:?})", timer_id.name(), ue, duration);
        TimerToken(token)
    }

    /// Disarm a timer. Idempotent: stopping an expired or unknown handle is
    /// a no-op.
    pub fn stop(&self, token: TimerToken) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(armed) = inner.armed.remove(&token.0) {
            inner.tree.remove(&(armed.deadline, token.0));
            log::trace!("{} stopped for ue {:?}", armed.timer_id.name(), armed.ue);
        }
    }

    /// Earliest pending deadline, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock().unwrap();
        inner.tree.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every timer whose deadline has passed
    pub fn drain_expired(&self, now: Instant) -> Vec<TimerExpiry> {
        let mut inner = self.inner.lock().unwrap();
        let mut fired = Vec::new();
        loop {
            let next = inner.tree.keys().next().copied();
            let Some((deadline, token)) = next else {
                break;
            };
            if deadline > now {
                break;
            }
            inner.tree.remove(&(deadline, token));
            if let Some(armed) = inner.armed.remove(&token) {
                fired.push(TimerExpiry {
                    token: TimerToken(token),
                    timer_id: armed.timer_id,
                    ue: armed.ue,
                });
            }
        }
        fired
    }

    /// Number of currently armed timers
    pub fn armed_count(&self) -> usize {
        self.inner.lock().unwrap().armed.len()
    }
}
