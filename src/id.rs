//! # Node Identifiers
//!
//! This module defines the core identity types used throughout Mantle:
//!
//! - [`NodeId`]: 512-bit identifier for nodes and routable keys
//! - [`Keypair`]: Ed25519 signing keypair with its derived [`NodeId`]
//!
//! ## Identity Model
//!
//! A node's identifier is derived from its Ed25519 public key by a BLAKE3
//! extended output (64 bytes). The identifier space doubles as the key space,
//! so identifiers can be used directly for XOR-metric routing.
//!
//! The all-zero identifier is the "unset" sentinel ([`NodeId::ZERO`]); it is
//! never a valid node identity and never stored in either peer table.
//!
//! ## Distance
//!
//! `distance(a, b) = a XOR b`, compared big-endian. The metric is symmetric,
//! satisfies the triangle inequality, and `distance(a, b) == 0` iff `a == b`.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::de::{Error as DeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Width of a [`NodeId`] in bytes (512 bits).
pub const ID_LEN: usize = 64;

/// 512-bit identifier for nodes and routable keys.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    /// The "unset" sentinel. Never a valid node identity.
    pub const ZERO: NodeId = NodeId([0u8; ID_LEN]);

    #[inline]
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Derive an identifier from an Ed25519 public key (BLAKE3 XOF, 64 bytes).
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(ID_HASH_DOMAIN);
        hasher.update(key.as_bytes());
        let mut out = [0u8; ID_LEN];
        hasher.finalize_xof().fill(&mut out);
        Self(out)
    }

    /// XOR distance to `other`, interpreted big-endian by [`distance_cmp`].
    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; ID_LEN] {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Number of leading zero bits in the XOR distance to `other`.
    ///
    /// This is the bucket index: 0 for the furthest half of the key space,
    /// up to `ID_LEN * 8 - 1` for the closest neighbours.
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        let dist = self.xor_distance(other);
        for (byte_idx, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_LEN * 8 - 1
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// A uniformly random identifier, for connection tokens and random
    /// routing probes.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        if getrandom::getrandom(&mut bytes).is_err() {
            // getrandom only fails on exotic platforms; fall back to the
            // thread rng rather than returning the zero sentinel.
            use rand::RngCore;
            rand::thread_rng().fill_bytes(&mut bytes);
        }
        Self(bytes)
    }
}

/// Domain separator for public-key -> identifier derivation.
const ID_HASH_DOMAIN: &[u8] = b"mantle-node-id-v1";

/// Compare two XOR distances big-endian.
///
/// `Ordering::Less` means the first distance is shorter, i.e. closer.
#[inline]
pub fn distance_cmp(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> std::cmp::Ordering {
    for i in 0..ID_LEN {
        if a[i] != b[i] {
            return a[i].cmp(&b[i]);
        }
    }
    std::cmp::Ordering::Equal
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_LEN]> for NodeId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// serde derives stop at 32-byte arrays, so the 64-byte id serialises as a
// length-checked byte string.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = NodeId;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "{ID_LEN} bytes")
            }

            fn visit_bytes<E: DeError>(self, v: &[u8]) -> Result<NodeId, E> {
                if v.len() != ID_LEN {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let mut arr = [0u8; ID_LEN];
                arr.copy_from_slice(v);
                Ok(NodeId(arr))
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<NodeId, A::Error> {
                let mut arr = [0u8; ID_LEN];
                for (i, slot) in arr.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| A::Error::invalid_length(i, &self))?;
                }
                Ok(NodeId(arr))
            }
        }

        deserializer.deserialize_bytes(IdVisitor)
    }
}

// ============================================================================
// Keypair
// ============================================================================

/// Ed25519 signing keypair with the derived node identifier.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    id: NodeId,
}

impl Keypair {
    /// Generate a fresh keypair from the OS rng.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let id = NodeId::from_public_key(&signing_key.verifying_key());
        Self { signing_key, id }
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let id = NodeId::from_public_key(&signing_key.verifying_key());
        Self { signing_key, id }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
