//! Per-side key provisioning.
//!
//! Keys are either supplied explicitly in the scenario (hex, base64, or an
//! `@file` reference) or derived deterministically from the master seed via
//! HKDF-SHA256. Derivation is keyed only on the seed, the side, and the two
//! adapter specs, so parameter sweeps that vary bearer or channel settings
//! keep identical key material.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::{ResolvedScenario, Side};
use crate::errors::{ArtifactError, Result, ScenarioError};

const IDENTITY_IKM: &[u8] = b"drybox/v1/identity";

/// Key material held for one side during a run.
///
/// The secret never leaves memory; only `public` and `key_id` are written
/// to the artifacts directory.
#[derive(Clone)]
pub struct CryptoMaterial {
    pub side: Side,
    secret: [u8; 32],
    pub public: [u8; 32],
    pub peer_public: [u8; 32],
    pub key_id: String,
    pub peer_key_id: String,
}

impl CryptoMaterial {
    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl fmt::Debug for CryptoMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoMaterial")
            .field("side", &self.side)
            .field("key_id", &self.key_id)
            .field("peer_key_id", &self.peer_key_id)
            .finish_non_exhaustive()
    }
}

/// Short identifier for a public key: first 8 hex chars of its SHA-256.
pub fn key_id(public: &[u8; 32]) -> String {
    let digest = Sha256::digest(public);
    hex::encode(&digest[..4])
}

/// Parse explicit key material: hex, base64, or `@path` to a file holding
/// either. 32-byte seeds are taken as-is; 64-byte extended keys are
/// truncated to their first 32 bytes.
fn parse_key_material(side: Side, spec: &str) -> Result<[u8; 32]> {
    let text;
    let spec = if let Some(path) = spec.strip_prefix('@') {
        text = std::fs::read_to_string(path).map_err(|e| ScenarioError::BadKeyMaterial {
            side,
            reason: format!("cannot read {path}: {e}"),
        })?;
        text.trim()
    } else {
        spec.trim()
    };

    let bytes = hex::decode(spec)
        .ok()
        .or_else(|| {
            use base64::Engine as _;
            base64::engine::general_purpose::STANDARD.decode(spec).ok()
        })
        .ok_or_else(|| ScenarioError::BadKeyMaterial {
            side,
            reason: "neither valid hex nor valid base64".to_string(),
        })?;

    let mut seed = [0u8; 32];
    match bytes.len() {
        32 => seed.copy_from_slice(&bytes),
        64 => seed.copy_from_slice(&bytes[..32]),
        n => {
            return Err(ScenarioError::BadKeyMaterial {
                side,
                reason: format!("expected 32 or 64 bytes, got {n}"),
            }
            .into())
        }
    }
    Ok(seed)
}

/// Derive a side's 32-byte secret seed from the master seed.
fn derive_secret(seed: u64, side: Side, left_spec: &str, right_spec: &str) -> [u8; 32] {
    let salt = seed.to_le_bytes();
    let hk = Hkdf::<Sha256>::new(Some(&salt), IDENTITY_IKM);
    let info = format!("drybox/v1/{}/{}/{}", side.label(), left_spec, right_spec);

    let mut okm = [0u8; 32];
    hk.expand(info.as_bytes(), &mut okm)
        .unwrap_or_else(|_| unreachable!("32-byte HKDF output"));
    okm
}

fn secret_for_side(scenario: &ResolvedScenario, side: Side) -> Result<[u8; 32]> {
    match scenario.crypto.for_side(side) {
        Some(spec) => parse_key_material(side, spec),
        None => Ok(derive_secret(
            scenario.seed,
            side,
            &scenario.left.adapter,
            &scenario.right.adapter,
        )),
    }
}

/// Provision key material for both sides.
pub fn provision(scenario: &ResolvedScenario) -> Result<(CryptoMaterial, CryptoMaterial)> {
    let left_secret = secret_for_side(scenario, Side::Left)?;
    let right_secret = secret_for_side(scenario, Side::Right)?;

    let left_public = PublicKey::from(&StaticSecret::from(left_secret)).to_bytes();
    let right_public = PublicKey::from(&StaticSecret::from(right_secret)).to_bytes();
    let left_id = key_id(&left_public);
    let right_id = key_id(&right_public);

    let left = CryptoMaterial {
        side: Side::Left,
        secret: left_secret,
        public: left_public,
        peer_public: right_public,
        key_id: left_id.clone(),
        peer_key_id: right_id.clone(),
    };
    let right = CryptoMaterial {
        side: Side::Right,
        secret: right_secret,
        public: right_public,
        peer_public: left_public,
        key_id: right_id,
        peer_key_id: left_id,
    };
    Ok((left, right))
}

/// Write `pubkeys.txt`: hex public key and short ID per side.
pub fn write_pubkeys(out_dir: &Path, left: &CryptoMaterial, right: &CryptoMaterial) -> Result<()> {
    let path = out_dir.join("pubkeys.txt");
    let mut file = File::create(&path).map_err(|source| ArtifactError::Write {
        artifact: "pubkeys.txt",
        source,
    })?;
    for material in [left, right] {
        writeln!(
            file,
            "{} pub={} key_id={}",
            material.side.label(),
            hex::encode(material.public),
            material.key_id
        )
        .map_err(|source| ArtifactError::Write {
            artifact: "pubkeys.txt",
            source,
        })?;
    }
    Ok(())
}
