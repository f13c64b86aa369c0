//! The cryptographic primitives needed to admit queries.
//!
//! Requests are signed with recoverable secp256k1 signatures over a Keccak-256 digest, exactly as an Ethereum wallet
//! would sign a pre-hashed message. Admission only ever recovers a signer; [SecretKey] exists so that tools and tests
//! can produce requests the node will accept.

use std::fmt::{self, Debug, Display, Formatter};

use alloy::primitives::Address;
use anyhow::{Result, anyhow};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::cfg::Environment;

/// Length of a signature in `r || s || v` form.
pub const SIGNATURE_LEN: usize = 65;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0; 32]);

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn compute<T: AsRef<[S]>, S: AsRef<[u8]>>(preimages: T) -> Hash {
        let mut hasher = Keccak256::new();
        for preimage in preimages.as_ref() {
            hasher.update(preimage.as_ref());
        }
        Self(hasher.finalize().into())
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

/// Returns the tag prepended to a request before hashing. Every prefix has the same length, so tags cannot be confused
/// with one another.
pub fn query_request_prefix(environment: Environment) -> &'static [u8] {
    match environment {
        Environment::Mainnet => b"mainnet_query_request_000000000000|",
        Environment::Testnet => b"testnet_query_request_000000000000|",
        Environment::UnsafeDevNet | Environment::Test => b"devnet_query_request_0000000000000|",
    }
}

/// The digest a requester signs. Including the environment tag stops a signature collected on one network from being
/// replayed on another.
pub fn query_request_digest(environment: Environment, request_bytes: &[u8]) -> Hash {
    Hash::compute([query_request_prefix(environment), request_bytes])
}

/// Derives the Ethereum-style address of a public key.
pub fn address_of(key: &VerifyingKey) -> Address {
    // Skip the leading tag byte of the uncompressed encoding.
    let point = key.to_encoded_point(false);
    Address::from_slice(&Keccak256::digest(&point.as_bytes()[1..])[12..])
}

/// Recovers the address which produced `signature` over `digest`.
///
/// The recovery byte may be given either raw (`0` or `1`) or Ethereum-adjusted (`27` or `28`).
pub fn recover_signer(digest: &Hash, signature: &[u8]) -> Result<Address> {
    if signature.len() != SIGNATURE_LEN {
        return Err(anyhow!(
            "signature must be {SIGNATURE_LEN} bytes, got {}",
            signature.len()
        ));
    }
    let v = match signature[64] {
        v @ (0 | 1) => v,
        v @ (27 | 28) => v - 27,
        v => return Err(anyhow!("invalid recovery byte {v}")),
    };
    let recovery_id = RecoveryId::from_byte(v).ok_or_else(|| anyhow!("invalid recovery byte {v}"))?;
    let signature = Signature::from_slice(&signature[..64])?;
    let key = VerifyingKey::recover_from_prehash(digest.as_bytes(), &signature, recovery_id)?;
    Ok(address_of(&key))
}

/// A secp256k1 secret key, able to sign query requests.
#[derive(Clone)]
pub struct SecretKey {
    key: SigningKey,
}

impl SecretKey {
    pub fn new_from_rng<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> SecretKey {
        SecretKey {
            key: SigningKey::random(rng),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<SecretKey> {
        let bytes: [u8; 32] = bytes.try_into()?;

        if bytes == [0; 32] {
            return Err(anyhow!("bytes are all zero"));
        }

        Ok(SecretKey {
            key: SigningKey::from_bytes(&bytes.into())?,
        })
    }

    pub fn from_hex(s: &str) -> Result<SecretKey> {
        let bytes_vec = hex::decode(s.trim_start_matches("0x"))?;
        Self::from_bytes(&bytes_vec)
    }

    pub fn address(&self) -> Address {
        address_of(self.key.verifying_key())
    }

    /// Signs a pre-computed digest, returning the signature in `r || s || v` form.
    pub fn sign_digest(&self, digest: &Hash) -> Result<[u8; SIGNATURE_LEN]> {
        let (signature, recovery_id) = self.key.sign_prehash_recoverable(digest.as_bytes())?;
        let mut out = [0u8; SIGNATURE_LEN];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = recovery_id.to_byte();
        Ok(out)
    }

    /// Signs serialized query request bytes for the given environment.
    pub fn sign_query_request(
        &self,
        environment: Environment,
        request_bytes: &[u8],
    ) -> Result<[u8; SIGNATURE_LEN]> {
        self.sign_digest(&query_request_digest(environment, request_bytes))
    }
}

impl Debug for SecretKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}
