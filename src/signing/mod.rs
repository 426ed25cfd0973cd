pub mod orchestrator;
pub mod phone;
pub mod pki;
pub mod remote;
pub mod session;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The external signing backends we can drive. Dispatch is always by tag;
/// adding a backend means adding a variant and its client, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningProvider {
    /// Smartcard/PKI signing through the RPC gateway.
    Pki,
    /// Phone-challenge signing (SIM-based).
    Phone,
    /// Remote-challenge signing (app-based).
    Remote,
}

/// Normalized session state reported to callers, whichever provider is
/// behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningStatus {
    Started,
    ChallengeIssued,
    Polling,
    Signed,
    Failed,
    Expired,
}

impl SigningStatus {
    /// Whether the session has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Signed | Self::Failed | Self::Expired)
    }
}

/// SHA-256 digest of the to-be-signed container bytes.
pub fn container_digest(content: &[u8]) -> Vec<u8> {
    Sha256::digest(content).to_vec()
}

/// Derive the four-digit challenge display code from a session seed.
///
/// The code is the last two bytes of the seed's SHA-256 digest, read as a
/// big-endian unsigned integer, reduced modulo 10000 and zero-padded. The
/// voter compares it against the code shown on their phone to confirm the
/// prompt belongs to their session.
pub fn challenge_code(seed: &[u8]) -> String {
    let digest = Sha256::digest(seed);
    let tail = u16::from_be_bytes([digest[30], digest[31]]);
    format!("{:04}", tail % 10000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_code_is_deterministic() {
        let seed = b"session seed bytes";
        assert_eq!(challenge_code(seed), challenge_code(seed));
    }

    #[test]
    fn challenge_code_matches_known_digests() {
        // SHA-256("") ends ...b855: 0xb855 = 47189, 47189 % 10000 = 7189.
        assert_eq!(challenge_code(b""), "7189");
        // SHA-256("abc") ends ...15ad: 0x15ad = 5549.
        assert_eq!(challenge_code(b"abc"), "5549");
    }

    #[test]
    fn challenge_code_is_always_four_digits() {
        for seed in [&b"a"[..], b"bc", b"def", b"\x00\x01\x02", b"longer seed value"] {
            let code = challenge_code(seed);
            assert_eq!(code.len(), 4);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
