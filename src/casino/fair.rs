//! Provably-fair roll generation.
//!
//! Commit-reveal scheme: the hash of the server seed is published before
//! any roll; rolls are HMAC-SHA256(server_seed, "{client_seed}:{nonce}")
//! mapped to [0, 1); rotating the seed reveals the old one so players can
//! verify every past roll. The ledger consumes the win/loss/amount
//! outputs only.

use hmac::{Hmac, Mac};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};
use std::sync::Mutex;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct Roll {
    /// Uniform in [0, 1).
    pub value: f64,
    pub nonce: u64,
    /// Commitment the player saw before rolling.
    pub server_seed_hash: String,
}

/// The seed retired by a rotation, returned for publication.
#[derive(Debug, Clone)]
pub struct RevealedSeed {
    pub server_seed: String,
    pub server_seed_hash: String,
    /// Nonces 0..rolls were consumed under this seed.
    pub rolls: u64,
}

struct FairInner {
    server_seed: String,
    server_seed_hash: String,
    nonce: u64,
}

pub struct FairRoller {
    inner: Mutex<FairInner>,
}

impl FairRoller {
    pub fn new() -> Self {
        Self::with_seed(&generate_seed())
    }

    pub fn with_seed(server_seed: &str) -> Self {
        Self {
            inner: Mutex::new(FairInner {
                server_seed: server_seed.to_string(),
                server_seed_hash: hash_seed(server_seed),
                nonce: 0,
            }),
        }
    }

    /// The current commitment, shown to players before they bet.
    pub fn commitment(&self) -> String {
        self.inner.lock().unwrap().server_seed_hash.clone()
    }

    /// Consume the next nonce and produce a roll.
    pub fn roll(&self, client_seed: &str) -> Roll {
        let mut inner = self.inner.lock().unwrap();
        let nonce = inner.nonce;
        inner.nonce += 1;
        Roll {
            value: derive_roll(&inner.server_seed, client_seed, nonce),
            nonce,
            server_seed_hash: inner.server_seed_hash.clone(),
        }
    }

    /// Retire the current seed (revealing it) and start a fresh one.
    pub fn rotate(&self) -> RevealedSeed {
        let mut inner = self.inner.lock().unwrap();
        let revealed = RevealedSeed {
            server_seed: inner.server_seed.clone(),
            server_seed_hash: inner.server_seed_hash.clone(),
            rolls: inner.nonce,
        };
        let seed = generate_seed();
        inner.server_seed_hash = hash_seed(&seed);
        inner.server_seed = seed;
        inner.nonce = 0;
        revealed
    }
}

impl Default for FairRoller {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_seed() -> String {
    let mut rng = ChaCha20Rng::from_entropy();
    let mut bytes = [0u8; 32];
    rng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn hash_seed(seed: &str) -> String {
    hex::encode(Sha256::digest(seed.as_bytes()))
}

/// Pure roll derivation; also the verification function players run.
pub fn derive_roll(server_seed: &str, client_seed: &str, nonce: u64) -> f64 {
    let mut mac =
        HmacSha256::new_from_slice(server_seed.as_bytes()).expect("HMAC accepts any key length");
    mac.update(format!("{}:{}", client_seed, nonce).as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(raw) as f64 / (u64::MAX as f64 + 1.0)
}

/// Check a revealed seed against its prior commitment.
pub fn verify_commitment(server_seed: &str, server_seed_hash: &str) -> bool {
    hash_seed(server_seed) == server_seed_hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roll_in_unit_interval_and_deterministic() {
        for nonce in 0..100 {
            let roll = derive_roll("seed", "client", nonce);
            assert!((0.0..1.0).contains(&roll));
            assert_eq!(roll, derive_roll("seed", "client", nonce));
        }
    }

    #[test]
    fn test_nonce_advances() {
        let roller = FairRoller::with_seed("seed");
        let a = roller.roll("client");
        let b = roller.roll("client");
        assert_eq!(a.nonce, 0);
        assert_eq!(b.nonce, 1);
        assert_ne!(a.value, b.value);
    }

    #[test]
    fn test_rotation_reveals_verifiable_seed() {
        let roller = FairRoller::new();
        let commitment = roller.commitment();
        let roll = roller.roll("client");

        let revealed = roller.rotate();
        assert_eq!(revealed.server_seed_hash, commitment);
        assert_eq!(revealed.rolls, 1);
        assert!(verify_commitment(&revealed.server_seed, &revealed.server_seed_hash));

        // Player reproduces the past roll from the revealed seed.
        assert_eq!(
            derive_roll(&revealed.server_seed, "client", roll.nonce),
            roll.value
        );

        // New epoch: different commitment, nonce reset.
        assert_ne!(roller.commitment(), commitment);
        assert_eq!(roller.roll("client").nonce, 0);
    }

    #[test]
    fn test_client_seed_matters() {
        assert_ne!(
            derive_roll("seed", "alice", 0),
            derive_roll("seed", "bob", 0)
        );
    }
}
