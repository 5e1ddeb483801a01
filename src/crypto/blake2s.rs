//! BLAKE2s primitives for WireGuard
//!
//! HASH, MAC (keyed BLAKE2s-128), HMAC-BLAKE2s and the KDF1/2/3 chain from
//! the WireGuard whitepaper.

use blake2::{
    digest::{consts::U16, FixedOutput, Mac as MacTrait, Update},
    Blake2s256, Blake2sMac, Digest,
};
use hmac::SimpleHmac;

/// RFC 2104 HMAC over BLAKE2s-256
type HmacBlake2s = SimpleHmac<Blake2s256>;

/// Length of BLAKE2s-256 hash output
pub const HASH_LEN: usize = 32;

/// Length of the keyed MAC output used for MAC1/MAC2 and cookies
pub const MAC_LEN: usize = 16;

/// HASH(part0 || part1 || ...)
pub fn hash(parts: &[&[u8]]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    for part in parts {
        Digest::update(&mut hasher, part);
    }
    hasher.finalize().into()
}

/// Keyed BLAKE2s with 16-byte output. Keys of 16 bytes (cookies) and
/// 32 bytes (MAC1 keys, cookie secrets) are both valid.
pub fn mac(key: &[u8], parts: &[&[u8]]) -> [u8; MAC_LEN] {
    let mut mac = Blake2sMac::<U16>::new_from_slice(key).expect("key length is 16 or 32");
    for part in parts {
        MacTrait::update(&mut mac, part);
    }
    mac.finalize_fixed().into()
}

/// HMAC-BLAKE2s
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; HASH_LEN] {
    let mut mac = HmacBlake2s::new_from_slice(key).expect("HMAC accepts any key length");
    Update::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// KDFn: T0 = HMAC(key, input); Ti = HMAC(T0, T(i-1) || i)
fn kdf<const N: usize>(key: &[u8; HASH_LEN], input: &[u8]) -> [[u8; HASH_LEN]; N] {
    let prk = hmac(key, input);
    let mut out = [[0u8; HASH_LEN]; N];
    let mut block = [0u8; HASH_LEN + 1];
    for i in 0..N {
        let counter = (i + 1) as u8;
        let t = if i == 0 {
            hmac(&prk, &[counter])
        } else {
            block[..HASH_LEN].copy_from_slice(&out[i - 1]);
            block[HASH_LEN] = counter;
            hmac(&prk, &block)
        };
        out[i] = t;
    }
    out
}

/// KDF1: single 32-byte output
pub fn kdf1(key: &[u8; HASH_LEN], input: &[u8]) -> [u8; HASH_LEN] {
    let [t1] = kdf::<1>(key, input);
    t1
}

/// KDF2: two 32-byte outputs
pub fn kdf2(key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let [t1, t2] = kdf::<2>(key, input);
    (t1, t2)
}

/// KDF3: three 32-byte outputs
pub fn kdf3(
    key: &[u8; HASH_LEN],
    input: &[u8],
) -> ([u8; HASH_LEN], [u8; HASH_LEN], [u8; HASH_LEN]) {
    let [t1, t2, t3] = kdf::<3>(key, input);
    (t1, t2, t3)
}
