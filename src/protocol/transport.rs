//! Transport layer encryption for WireGuard
//!
//! A [`Keypair`] is one derived session: the two directional keys, the
//! atomic send nonce and the receive replay window. Data packets are padded
//! to a multiple of 16 bytes before encryption.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use zeroize::Zeroize;

use crate::crypto::aead;
use crate::error::DataPathError;
use crate::protocol::handshake::SessionKeys;
use crate::protocol::messages::TransportHeader;
use crate::protocol::session::{
    KEEPALIVE_TIMEOUT, REJECT_AFTER_TIME, REKEY_AFTER_TIME, REKEY_TIMEOUT,
};

/// Rekey once this many messages have been sent on a session
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;

/// Maximum counter value before requiring rekey
/// REJECT_AFTER_MESSAGES = 2^64 - 2^13 - 1
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - 8192;

/// Plaintext is padded to a multiple of this
pub const PADDING_MULTIPLE: usize = 16;

const BITS_PER_WORD: u64 = 64;
const WINDOW_WORDS: usize = 2048 / BITS_PER_WORD as usize;

/// Counters this far behind the newest are rejected outright. One word of
/// the bitmap is always being recycled, hence the reduction.
pub const WINDOW_SIZE: u64 = 2048 - BITS_PER_WORD;

/// Anti-replay window for tracking received packet counters
///
/// A 2048-bit ring of words indexed by `counter / 64`. Words are zeroed as
/// the window advances over them instead of shifting the whole bitmap.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    /// One past the highest counter accepted
    next: u64,
    bitmap: [u64; WINDOW_WORDS],
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            next: 0,
            bitmap: [0u64; WINDOW_WORDS],
        }
    }

    /// Check if a counter is valid (not a replay) and update window
    pub fn check_and_update(&mut self, counter: u64) -> bool {
        if self.next >= REJECT_AFTER_MESSAGES + 1 || counter >= REJECT_AFTER_MESSAGES {
            return false;
        }
        let counter = counter + 1;
        if counter + WINDOW_SIZE < self.next {
            return false;
        }

        let index = counter / BITS_PER_WORD;
        if counter > self.next {
            let current = self.next / BITS_PER_WORD;
            let top = (index - current).min(WINDOW_WORDS as u64);
            for i in 1..=top {
                self.bitmap[((current + i) as usize) % WINDOW_WORDS] = 0;
            }
            self.next = counter;
        }

        let word = &mut self.bitmap[(index as usize) % WINDOW_WORDS];
        let bit = 1u64 << (counter % BITS_PER_WORD);
        let seen = *word & bit != 0;
        *word |= bit;
        !seen
    }

    /// One past the highest counter accepted so far
    pub fn next_expected(&self) -> u64 {
        self.next
    }
}

/// Length after padding `len` bytes of plaintext, never beyond the MTU
pub fn padded_len(len: usize, mtu: usize) -> usize {
    if mtu == 0 {
        return len.next_multiple_of(PADDING_MULTIPLE);
    }
    let last_unit = if len > mtu { len % mtu } else { len };
    let padded = last_unit.next_multiple_of(PADDING_MULTIPLE).min(mtu).max(last_unit);
    len + (padded - last_unit)
}

/// One derived transport session
pub struct Keypair {
    pub local_index: u32,
    pub remote_index: u32,
    pub is_initiator: bool,
    pub created_at: Instant,
    sending_key: [u8; 32],
    receiving_key: [u8; 32],
    send_nonce: AtomicU64,
    replay: Mutex<ReplayWindow>,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .field("is_initiator", &self.is_initiator)
            .field("send_nonce", &self.send_nonce.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Keypair {
    pub fn new(keys: &SessionKeys, created_at: Instant) -> Self {
        Self {
            local_index: keys.local_index,
            remote_index: keys.remote_index,
            is_initiator: keys.is_initiator,
            created_at,
            sending_key: keys.sending_key,
            receiving_key: keys.receiving_key,
            send_nonce: AtomicU64::new(0),
            replay: Mutex::new(ReplayWindow::new()),
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Claim the next send counter. A counter at or past
    /// REJECT_AFTER_MESSAGES is never handed out.
    pub fn next_nonce(&self) -> Result<u64, DataPathError> {
        let nonce = self.send_nonce.fetch_add(1, Ordering::Relaxed);
        if nonce >= REJECT_AFTER_MESSAGES {
            self.send_nonce.store(REJECT_AFTER_MESSAGES, Ordering::Relaxed);
            return Err(DataPathError::SessionExpired);
        }
        Ok(nonce)
    }

    /// Counters handed out so far
    pub fn sent_messages(&self) -> u64 {
        self.send_nonce.load(Ordering::Relaxed)
    }

    pub fn can_send(&self, now: Instant) -> bool {
        self.sent_messages() < REJECT_AFTER_MESSAGES && self.age(now) < REJECT_AFTER_TIME
    }

    pub fn can_receive(&self, now: Instant) -> bool {
        self.replay.lock().next_expected() < REJECT_AFTER_MESSAGES
            && self.age(now) < REJECT_AFTER_TIME
    }

    /// Sender-side keep-key-fresh; only the initiator rekeys on age
    pub fn needs_rekey_on_send(&self, now: Instant) -> bool {
        self.sent_messages() > REKEY_AFTER_MESSAGES
            || (self.is_initiator && self.age(now) >= REKEY_AFTER_TIME)
    }

    /// Receiver-side keep-key-fresh, early enough that the rekey finishes
    /// before the responder stops accepting this session
    pub fn needs_rekey_on_receive(&self, now: Instant) -> bool {
        self.is_initiator
            && self.age(now) >= REJECT_AFTER_TIME - KEEPALIVE_TIMEOUT - REKEY_TIMEOUT
    }

    /// Encrypt `plaintext` under `counter` into a complete transport message
    pub fn seal(&self, counter: u64, plaintext: &[u8], mtu: usize) -> Result<Vec<u8>, DataPathError> {
        let mut padded = Vec::with_capacity(padded_len(plaintext.len(), mtu));
        padded.extend_from_slice(plaintext);
        padded.resize(padded_len(plaintext.len(), mtu), 0);

        let ciphertext = aead::seal(&self.sending_key, counter, &padded, &[])?;
        padded.zeroize();
        Ok(TransportHeader::build_message(self.remote_index, counter, &ciphertext))
    }

    /// Authenticate and decrypt a payload. The replay window is not touched;
    /// call [`Keypair::validate_counter`] once the packet is authentic.
    pub fn open(&self, counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>, DataPathError> {
        Ok(aead::open(&self.receiving_key, counter, ciphertext, &[])?)
    }

    pub fn validate_counter(&self, counter: u64) -> Result<(), DataPathError> {
        if self.replay.lock().check_and_update(counter) {
            Ok(())
        } else {
            Err(DataPathError::ReplayDetected { counter })
        }
    }

    /// Highest received counter + 1
    pub fn receive_counter(&self) -> u64 {
        self.replay.lock().next_expected()
    }

    #[cfg(test)]
    pub(crate) fn force_send_nonce(&self, nonce: u64) {
        self.send_nonce.store(nonce, Ordering::Relaxed);
    }
}

impl Drop for Keypair {
    fn drop(&mut self) {
        self.sending_key.zeroize();
        self.receiving_key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn keys(local: u32, remote: u32, send: u8, recv: u8, is_initiator: bool) -> SessionKeys {
        SessionKeys {
            local_index: local,
            remote_index: remote,
            sending_key: [send; 32],
            receiving_key: [recv; 32],
            is_initiator,
        }
    }

    #[test]
    fn test_replay_window_reference_sequence() {
        const T_LIM: u64 = WINDOW_SIZE + 1;
        let mut window = ReplayWindow::new();
        let cases: &[(u64, bool)] = &[
            (0, true),
            (1, true),
            (1, false),
            (9, true),
            (8, true),
            (7, true),
            (7, false),
            (T_LIM, true),
            (T_LIM - 1, true),
            (T_LIM - 1, false),
            (T_LIM - 2, true),
            (2, true),
            (2, false),
            (T_LIM + 16, true),
            (3, false),
            (T_LIM + 16, false),
            (T_LIM * 4, true),
            (T_LIM * 4 - (T_LIM - 1), true),
            (10, false),
            (T_LIM * 4 - T_LIM, false),
            (T_LIM * 4 - (T_LIM + 1), false),
            (T_LIM * 4 - (T_LIM - 2), true),
            (T_LIM * 4 + 1 - T_LIM, false),
            (0, false),
            (REJECT_AFTER_MESSAGES, false),
            (REJECT_AFTER_MESSAGES - 1, true),
            (REJECT_AFTER_MESSAGES, false),
            (REJECT_AFTER_MESSAGES - 1, false),
            (REJECT_AFTER_MESSAGES - 2, true),
            (REJECT_AFTER_MESSAGES + 1, false),
            (REJECT_AFTER_MESSAGES + 2, false),
            (REJECT_AFTER_MESSAGES - 2, false),
            (REJECT_AFTER_MESSAGES - 3, true),
            (0, false),
        ];
        for (i, &(counter, expected)) in cases.iter().enumerate() {
            assert_eq!(
                window.check_and_update(counter),
                expected,
                "case {} (counter {})",
                i,
                counter
            );
        }
    }

    #[test]
    fn test_replay_window_full_sweep() {
        let mut window = ReplayWindow::new();
        for i in 1..=WINDOW_SIZE {
            assert!(window.check_and_update(i));
        }
        assert!(window.check_and_update(0));
        assert!(!window.check_and_update(0));

        let mut window = ReplayWindow::new();
        for i in (1..=WINDOW_SIZE + 1).rev() {
            assert!(window.check_and_update(i));
        }
        assert!(!window.check_and_update(0));
    }

    #[test]
    fn test_padding() {
        assert_eq!(padded_len(0, 1420), 0);
        assert_eq!(padded_len(1, 1420), 16);
        assert_eq!(padded_len(16, 1420), 16);
        assert_eq!(padded_len(1415, 1420), 1420);
        assert_eq!(padded_len(1420, 1420), 1420);
        assert_eq!(padded_len(17, 0), 32);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let now = Instant::now();
        let a = Keypair::new(&keys(1, 2, 0xA, 0xB, true), now);
        let b = Keypair::new(&keys(2, 1, 0xB, 0xA, false), now);

        let nonce = a.next_nonce().unwrap();
        let msg = a.seal(nonce, b"Hello, WireGuard!", 1420).unwrap();
        assert_eq!(msg.len(), TransportHeader::SIZE + 32 + aead::TAG_LEN);

        let header = TransportHeader::from_bytes(&msg).unwrap();
        assert_eq!(header.receiver_index, 2);
        assert_eq!(header.counter, 0);

        let plain = b.open(header.counter, TransportHeader::payload(&msg)).unwrap();
        assert_eq!(&plain[..17], b"Hello, WireGuard!");
        assert!(plain[17..].iter().all(|&b| b == 0));

        b.validate_counter(header.counter).unwrap();
        assert!(matches!(
            b.validate_counter(header.counter),
            Err(DataPathError::ReplayDetected { counter: 0 })
        ));
        assert_eq!(b.receive_counter(), 1);

        // Tampered ciphertext does not authenticate
        let mut bad = msg.clone();
        bad[TransportHeader::SIZE] ^= 1;
        assert!(b.open(0, TransportHeader::payload(&bad)).is_err());
    }

    #[test]
    fn test_nonces_unique_under_concurrency() {
        let keypair = Arc::new(Keypair::new(&keys(1, 2, 1, 2, true), Instant::now()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let keypair = keypair.clone();
                std::thread::spawn(move || {
                    (0..1000)
                        .map(|_| keypair.next_nonce().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..4000).collect::<Vec<_>>());
    }

    #[test]
    fn test_nonce_exhaustion_refused() {
        let keypair = Keypair::new(&keys(1, 2, 1, 2, true), Instant::now());
        keypair.force_send_nonce(REJECT_AFTER_MESSAGES - 1);
        assert_eq!(keypair.next_nonce().unwrap(), REJECT_AFTER_MESSAGES - 1);
        assert!(matches!(
            keypair.next_nonce(),
            Err(DataPathError::SessionExpired)
        ));
        assert!(keypair.next_nonce().is_err());
        assert!(!keypair.can_send(Instant::now()));
    }

    #[test]
    fn test_rekey_thresholds() {
        let start = Instant::now();
        let initiator = Keypair::new(&keys(1, 2, 1, 2, true), start);
        let responder = Keypair::new(&keys(2, 1, 2, 1, false), start);

        assert!(!initiator.needs_rekey_on_send(start));
        assert!(initiator.needs_rekey_on_send(start + REKEY_AFTER_TIME));
        assert!(!responder.needs_rekey_on_send(start + REKEY_AFTER_TIME));

        assert!(!initiator.needs_rekey_on_receive(start + REKEY_AFTER_TIME));
        assert!(initiator.needs_rekey_on_receive(start + Duration::from_secs(165)));

        assert!(initiator.can_receive(start + Duration::from_secs(179)));
        assert!(!initiator.can_receive(start + REJECT_AFTER_TIME));
    }
}
