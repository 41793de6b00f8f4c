//! Probe packets
//!
//! A UDP entry point only answers when it recognizes the first datagram,
//! so each protocol gets a payload that its server side will reply to.
//! TCP probes need no payload: an accepted connection is an answer.

use blake2::digest::Mac;
use blake2::digest::consts::U16;
use blake2::{Blake2s256, Blake2sMac, Digest};
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Size of a WireGuard handshake initiation
pub const WIREGUARD_INIT_LEN: usize = 148;

const LABEL_MAC1: &[u8] = b"mac1----";

/// Build a WireGuard handshake initiation addressed to `server_public_key`.
///
/// Format (148 bytes):
/// - Type (1 byte): 0x01 = handshake initiation
/// - Reserved (3 bytes): 0x000000
/// - Sender index (4 bytes)
/// - Ephemeral public key (32 bytes)
/// - Encrypted static key (48 bytes)
/// - Encrypted timestamp (28 bytes)
/// - MAC1 (16 bytes)
/// - MAC2 (16 bytes)
///
/// Only MAC1 is valid, which is what the server checks before it spends
/// any work on a packet; the server answers with a cookie reply or drops
/// the rest, either of which is enough to learn the port is served.
pub fn wireguard_initiation(server_public_key: &[u8; 32]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(WIREGUARD_INIT_LEN);

    msg.push(0x01);
    msg.extend_from_slice(&[0x00, 0x00, 0x00]);

    let sender_index: u32 = rand::random();
    msg.extend_from_slice(&sender_index.to_le_bytes());

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    msg.extend_from_slice(PublicKey::from(&ephemeral).as_bytes());

    msg.extend_from_slice(&[0u8; 48 + 28]);

    let mac1 = wireguard_mac1(server_public_key, &msg);
    msg.extend_from_slice(&mac1);
    msg.extend_from_slice(&[0u8; 16]);

    msg
}

/// MAC1 = MAC(HASH(LABEL_MAC1 || server_public_key), msg[..116])
fn wireguard_mac1(server_public_key: &[u8; 32], msg: &[u8]) -> [u8; 16] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, LABEL_MAC1);
    Digest::update(&mut hasher, server_public_key);
    let key = hasher.finalize();

    let mut out = [0u8; 16];
    // A 32-byte key is always accepted by BLAKE2s.
    if let Ok(mut mac) = Blake2sMac::<U16>::new_from_slice(&key) {
        mac.update(msg);
        out.copy_from_slice(&mac.finalize().into_bytes());
    }
    out
}

/// Build an OpenVPN `P_CONTROL_HARD_RESET_CLIENT_V2` datagram.
///
/// Format (14 bytes):
/// - Opcode/key id (1 byte): 0x38
/// - Session id (8 bytes, random)
/// - Ack array length (1 byte): 0
/// - Packet id (4 bytes): 0
pub fn openvpn_hard_reset() -> Vec<u8> {
    let mut msg = Vec::with_capacity(14);
    msg.push(0x38);
    let session_id: u64 = rand::random();
    msg.extend_from_slice(&session_id.to_be_bytes());
    msg.push(0x00);
    msg.extend_from_slice(&0u32.to_be_bytes());
    msg
}
