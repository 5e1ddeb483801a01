//! Per-peer protocol timers
//!
//! Each timer is a sleeping tokio task that posts a [`TimerEvent`] back to
//! the device. Re-arming aborts the previous task and bumps a generation
//! counter, so an event that raced with a re-arm or cancel is recognised as
//! stale and ignored.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use super::{peer::Peer, DeviceInner, PeerId};
use crate::protocol::session::{
    KEEPALIVE_TIMEOUT, MAX_TIMER_HANDSHAKES, NEW_HANDSHAKE_TIMEOUT, REKEY_TIMEOUT,
    REKEY_TIMEOUT_JITTER_MAX, ZERO_KEYS_TIMEOUT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    RetransmitHandshake,
    SendKeepalive,
    NewHandshake,
    ZeroKeyMaterial,
    PersistentKeepalive,
}

impl TimerKind {
    pub const ALL: [TimerKind; 5] = [
        TimerKind::RetransmitHandshake,
        TimerKind::SendKeepalive,
        TimerKind::NewHandshake,
        TimerKind::ZeroKeyMaterial,
        TimerKind::PersistentKeepalive,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimerEvent {
    pub peer: PeerId,
    pub kind: TimerKind,
    generation: u64,
}

#[derive(Default)]
struct TimerSlot {
    generation: u64,
    task: Option<AbortHandle>,
}

fn jitter() -> Duration {
    let max = REKEY_TIMEOUT_JITTER_MAX.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}

pub struct PeerTimers {
    peer: PeerId,
    events: mpsc::UnboundedSender<TimerEvent>,
    slots: Mutex<[TimerSlot; 5]>,
    enabled: AtomicBool,
    handshake_attempts: AtomicU32,
    need_another_keepalive: AtomicBool,
    persistent_keepalive: AtomicU16,
}

impl PeerTimers {
    pub fn new(peer: PeerId, events: mpsc::UnboundedSender<TimerEvent>) -> Self {
        Self {
            peer,
            events,
            slots: Mutex::new(Default::default()),
            enabled: AtomicBool::new(false),
            handshake_attempts: AtomicU32::new(0),
            need_another_keepalive: AtomicBool::new(false),
            persistent_keepalive: AtomicU16::new(0),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Stop every timer and refuse to arm new ones
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            slot.generation += 1;
            if let Some(task) = slot.task.take() {
                task.abort();
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// (Re)start `kind` to fire after `delay`
    pub fn arm(&self, kind: TimerKind, delay: Duration) {
        let mut slots = self.slots.lock();
        if !self.is_enabled() {
            return;
        }
        let slot = &mut slots[kind.slot()];
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        slot.generation += 1;

        let event = TimerEvent {
            peer: self.peer,
            kind,
            generation: slot.generation,
        };
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
        slot.task = Some(task.abort_handle());
    }

    pub fn cancel(&self, kind: TimerKind) {
        let mut slots = self.slots.lock();
        let slot = &mut slots[kind.slot()];
        slot.generation += 1;
        if let Some(task) = slot.task.take() {
            task.abort();
        }
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.slots.lock()[kind.slot()].task.is_some()
    }

    /// Accept a fired event if it is still the latest arming of its timer
    pub fn fire(&self, event: &TimerEvent) -> bool {
        let mut slots = self.slots.lock();
        let slot = &mut slots[event.kind.slot()];
        if slot.generation != event.generation || slot.task.is_none() {
            return false;
        }
        slot.task = None;
        true
    }

    pub fn handshake_attempts(&self) -> u32 {
        self.handshake_attempts.load(Ordering::Relaxed)
    }

    pub fn reset_handshake_attempts(&self) {
        self.handshake_attempts.store(0, Ordering::Relaxed);
    }

    pub fn persistent_keepalive(&self) -> Option<u16> {
        match self.persistent_keepalive.load(Ordering::Relaxed) {
            0 => None,
            secs => Some(secs),
        }
    }

    pub fn set_persistent_keepalive(&self, interval: Option<u16>) {
        self.persistent_keepalive
            .store(interval.unwrap_or(0), Ordering::Relaxed);
        if interval.is_none() {
            self.cancel(TimerKind::PersistentKeepalive);
        }
    }

    /// Sent a data packet
    pub fn data_sent(&self) {
        if !self.is_pending(TimerKind::NewHandshake) {
            self.arm(TimerKind::NewHandshake, NEW_HANDSHAKE_TIMEOUT + jitter());
        }
    }

    /// Received a data packet
    pub fn data_received(&self) {
        if !self.is_pending(TimerKind::SendKeepalive) {
            self.arm(TimerKind::SendKeepalive, KEEPALIVE_TIMEOUT);
        } else {
            self.need_another_keepalive.store(true, Ordering::Relaxed);
        }
    }

    /// Sent any authenticated packet: handshake, keepalive or data
    pub fn any_authenticated_packet_sent(&self) {
        self.cancel(TimerKind::SendKeepalive);
    }

    /// Received any authenticated packet: handshake, keepalive or data
    pub fn any_authenticated_packet_received(&self) {
        self.cancel(TimerKind::NewHandshake);
    }

    pub fn handshake_initiated(&self) {
        self.arm(TimerKind::RetransmitHandshake, REKEY_TIMEOUT + jitter());
    }

    pub fn handshake_complete(&self) {
        self.cancel(TimerKind::RetransmitHandshake);
        self.reset_handshake_attempts();
    }

    /// A session was derived; schedule erasure of all key material
    pub fn session_derived(&self) {
        self.arm(TimerKind::ZeroKeyMaterial, ZERO_KEYS_TIMEOUT);
    }

    /// Any authenticated packet went either direction
    pub fn any_authenticated_packet_traversal(&self) {
        if let Some(interval) = self.persistent_keepalive() {
            self.arm(
                TimerKind::PersistentKeepalive,
                Duration::from_secs(interval as u64),
            );
        }
    }
}

impl DeviceInner {
    /// Dispatch a fired timer to its expiry handler
    pub(crate) async fn handle_timer(&self, event: TimerEvent) {
        let Some(peer) = self.peer_by_id(event.peer) else {
            return;
        };
        if peer.is_dead() || !peer.timers.fire(&event) {
            return;
        }
        match event.kind {
            TimerKind::RetransmitHandshake => self.expired_retransmit_handshake(&peer).await,
            TimerKind::SendKeepalive => {
                self.send_keepalive(&peer).await;
                if peer.timers.need_another_keepalive.swap(false, Ordering::Relaxed) {
                    peer.timers.arm(TimerKind::SendKeepalive, KEEPALIVE_TIMEOUT);
                }
            }
            TimerKind::NewHandshake => {
                debug!(
                    "Retrying handshake with peer {} because we stopped hearing back after {} seconds",
                    peer,
                    NEW_HANDSHAKE_TIMEOUT.as_secs()
                );
                peer.clear_endpoint_source();
                self.send_handshake_initiation(&peer, false).await;
            }
            TimerKind::ZeroKeyMaterial => {
                debug!(
                    "Zeroing out keys for peer {} after not receiving a new one in {} seconds",
                    peer,
                    ZERO_KEYS_TIMEOUT.as_secs()
                );
                self.zero_key_material(&peer);
            }
            TimerKind::PersistentKeepalive => {
                if peer.timers.persistent_keepalive().is_some() {
                    self.send_keepalive(&peer).await;
                }
            }
        }
    }

    async fn expired_retransmit_handshake(&self, peer: &Peer) {
        let attempts = peer.timers.handshake_attempts();
        if attempts > MAX_TIMER_HANDSHAKES {
            debug!(
                "Handshake for peer {} did not complete after {} attempts, giving up",
                peer,
                attempts + 2
            );
            peer.timers.cancel(TimerKind::SendKeepalive);
            peer.staged.purge();
            if !peer.timers.is_pending(TimerKind::ZeroKeyMaterial) {
                peer.timers.arm(TimerKind::ZeroKeyMaterial, ZERO_KEYS_TIMEOUT);
            }
        } else {
            peer.timers.handshake_attempts.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Handshake for peer {} did not complete after {} seconds, retrying (try {})",
                peer,
                REKEY_TIMEOUT.as_secs(),
                attempts + 2
            );
            peer.clear_endpoint_source();
            self.send_handshake_initiation(peer, true).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timers() -> (PeerTimers, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let timers = PeerTimers::new(PeerId(7), tx);
        timers.enable();
        (timers, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let (timers, mut rx) = timers();
        timers.arm(TimerKind::SendKeepalive, KEEPALIVE_TIMEOUT);
        assert!(timers.is_pending(TimerKind::SendKeepalive));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.peer, PeerId(7));
        assert_eq!(event.kind, TimerKind::SendKeepalive);
        assert!(timers.fire(&event));
        assert!(!timers.is_pending(TimerKind::SendKeepalive));
        assert!(!timers.fire(&event));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_invalidates_old_event() {
        let (timers, mut rx) = timers();
        timers.arm(TimerKind::NewHandshake, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(2)).await;
        let stale = rx.recv().await.unwrap();

        timers.arm(TimerKind::NewHandshake, Duration::from_secs(1));
        assert!(!timers.fire(&stale));
        let fresh = rx.recv().await.unwrap();
        assert!(timers.fire(&fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_cancels_and_blocks() {
        let (timers, mut rx) = timers();
        timers.handshake_initiated();
        timers.session_derived();
        timers.disable();
        assert!(!timers.is_pending(TimerKind::RetransmitHandshake));

        timers.data_sent();
        assert!(!timers.is_pending(TimerKind::NewHandshake));

        tokio::time::sleep(ZERO_KEYS_TIMEOUT * 2).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_rules() {
        let (timers, _rx) = timers();

        timers.data_sent();
        assert!(timers.is_pending(TimerKind::NewHandshake));
        timers.any_authenticated_packet_received();
        assert!(!timers.is_pending(TimerKind::NewHandshake));

        timers.data_received();
        timers.data_received();
        assert!(timers.need_another_keepalive.load(Ordering::Relaxed));
        timers.any_authenticated_packet_sent();
        assert!(!timers.is_pending(TimerKind::SendKeepalive));

        timers.any_authenticated_packet_traversal();
        assert!(!timers.is_pending(TimerKind::PersistentKeepalive));
        timers.set_persistent_keepalive(Some(25));
        timers.any_authenticated_packet_traversal();
        assert!(timers.is_pending(TimerKind::PersistentKeepalive));
        timers.set_persistent_keepalive(None);
        assert!(!timers.is_pending(TimerKind::PersistentKeepalive));

        timers.handshake_attempts.store(3, Ordering::Relaxed);
        timers.handshake_initiated();
        timers.handshake_complete();
        assert_eq!(timers.handshake_attempts(), 0);
        assert!(!timers.is_pending(TimerKind::RetransmitHandshake));
    }
}
