//! Deterministic RNG provisioning.
//!
//! Every stochastic subsystem owns its own `ChaCha8Rng`, seeded from the
//! scenario's 64-bit master seed through a domain-separation label. Adding a
//! new consumer therefore never perturbs the draw sequence of existing ones,
//! and re-running a scenario with the same seed reproduces every stream
//! byte for byte.

use hkdf::Hkdf;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sha2::Sha256;

use crate::config::{Direction, Side};

const STREAM_IKM: &[u8] = b"drybox/v1/rng";

/// Factory for per-subsystem RNG streams.
#[derive(Debug, Clone, Copy)]
pub struct RngTree {
    seed: u64,
}

impl RngTree {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Derive the stream for a domain-separation label.
    ///
    /// The 32-byte stream seed is HKDF-SHA256 output with the master seed as
    /// salt and the label in the info parameter.
    pub fn stream(&self, label: &str) -> ChaCha8Rng {
        let salt = self.seed.to_le_bytes();
        let hk = Hkdf::<Sha256>::new(Some(&salt), STREAM_IKM);
        let mut info = Vec::with_capacity(STREAM_IKM.len() + 1 + label.len());
        info.extend_from_slice(STREAM_IKM);
        info.push(b'/');
        info.extend_from_slice(label.as_bytes());

        let mut okm = [0u8; 32];
        // 32 bytes is always a valid HKDF-SHA256 output length.
        hk.expand(&info, &mut okm)
            .unwrap_or_else(|_| unreachable!("32-byte HKDF output"));
        ChaCha8Rng::from_seed(okm)
    }

    pub fn bearer(&self, direction: Direction) -> ChaCha8Rng {
        self.stream(direction.rng_label())
    }

    pub fn awgn(&self) -> ChaCha8Rng {
        self.stream("awgn")
    }

    pub fn fading(&self) -> ChaCha8Rng {
        self.stream("fading")
    }

    pub fn vocoder(&self, side: Side) -> ChaCha8Rng {
        match side {
            Side::Left => self.stream("vocoder_L"),
            Side::Right => self.stream("vocoder_R"),
        }
    }

    pub fn adapter(&self, side: Side) -> ChaCha8Rng {
        match side {
            Side::Left => self.stream("adapter_L"),
            Side::Right => self.stream("adapter_R"),
        }
    }
}
