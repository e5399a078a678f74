//! # Node Identity and Proof-of-Work
//!
//! This module defines the identity types used throughout kadmesh:
//!
//! - [`NodeId`]: 160-bit identifier, the coordinate of a peer in XOR space
//! - [`Identifier`]: a `NodeId` together with its proof-of-work validation bytes
//! - [`Keypair`]: Ed25519 signing keypair that produced a locally generated identifier
//! - [`LocalIdentity`]: the identifier plus keypair owned by the running node
//!
//! ## Proof-of-Work (S/Kademlia)
//!
//! Identities are deliberately expensive to mint. Generation runs two puzzles:
//!
//! 1. **Static puzzle**: keypairs are drawn until `H(id)` has at least `c1`
//!    leading zero bits, where `id = H(public_key)`.
//! 2. **Dynamic puzzle**: validation values are drawn until `H(id XOR validation)`
//!    has at least `c2` leading zero bits.
//!
//! Verification of both puzzles costs two hashes. `H` is BLAKE3 in XOF mode,
//! truncated to 160 bits.
//!
//! ## Distance
//!
//! `distance(a, b)` is `160 - common_prefix_bits(a, b)`: the 1-indexed position
//! (from the most significant bit) of the first differing bit, or 0 when the
//! identifiers are equal. The routing table files a peer in the bucket matching
//! its distance. Ordering *within* a distance uses the raw XOR bytes
//! ([`NodeId::xor_distance`] with [`distance_cmp`]).

use std::cmp::Ordering;

use ed25519_dalek::SigningKey;
use rand::RngCore;
use rand::rngs::OsRng;

/// Identifier length in bytes.
pub const ID_LEN: usize = 20;

/// Identifier length in bits; also the number of routing buckets.
pub const ID_BITS: usize = ID_LEN * 8;

/// Domain separation prefix for identity hashing.
const ID_HASH_DOMAIN: &[u8] = b"kadmesh-id-v1:";

// ============================================================================
// Errors
// ============================================================================

/// Which of the two proof-of-work puzzles an identifier failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Puzzle {
    /// `H(id)` leading zeros against `c1`.
    Static,
    /// `H(id XOR validation)` leading zeros against `c2`.
    Dynamic,
}

impl std::fmt::Display for Puzzle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Puzzle::Static => write!(f, "static"),
            Puzzle::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// Error type for identifier construction and parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The byte string is not exactly [`ID_LEN`] bytes long.
    InvalidLength { expected: usize, actual: usize },
    /// The hex string could not be decoded.
    InvalidHex,
    /// One of the proof-of-work puzzles is not satisfied.
    InsufficientWork {
        puzzle: Puzzle,
        required: u32,
        found: u32,
    },
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::InvalidLength { expected, actual } => {
                write!(f, "identifier must be {} bytes, got {}", expected, actual)
            }
            IdentityError::InvalidHex => write!(f, "identifier is not valid hex"),
            IdentityError::InsufficientWork {
                puzzle,
                required,
                found,
            } => write!(
                f,
                "{} puzzle requires {} leading zero bits, found {}",
                puzzle, required, found
            ),
        }
    }
}

impl std::error::Error for IdentityError {}

// ============================================================================
// Hashing Helpers
// ============================================================================

/// Hash arbitrary bytes down to 160 bits.
#[inline]
pub fn hash160(data: &[u8]) -> [u8; ID_LEN] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(ID_HASH_DOMAIN);
    hasher.update(data);
    let mut out = [0u8; ID_LEN];
    hasher.finalize_xof().fill(&mut out);
    out
}

/// Count leading zero bits in a byte string.
#[inline]
pub fn leading_zero_bits(bytes: &[u8]) -> u32 {
    let mut zeros = 0u32;
    for byte in bytes {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}

/// Compare two XOR distances lexicographically.
///
/// `Ordering::Less` means `a` is the smaller distance, i.e. the closer peer.
#[inline]
pub fn distance_cmp(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> Ordering {
    for i in 0..ID_LEN {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

#[inline]
fn xor(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> [u8; ID_LEN] {
    let mut out = [0u8; ID_LEN];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

// ============================================================================
// NodeId
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an identifier from a slice, failing on a wrong length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdentityError> {
        let arr: [u8; ID_LEN] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidLength {
                expected: ID_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    /// A uniformly random identifier. Carries no proof-of-work.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The identifier under which a value key is stored.
    pub fn for_key(key: &str) -> Self {
        Self(hash160(key.as_bytes()))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; ID_LEN] {
        xor(&self.0, &other.0)
    }

    /// Bit distance in `0..=ID_BITS`; see the module docs.
    #[inline]
    pub fn distance(&self, other: &NodeId) -> usize {
        ID_BITS - leading_zero_bits(&self.xor_distance(other)) as usize
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s).map_err(|_| IdentityError::InvalidHex)?;
        Self::from_slice(&bytes)
    }

    /// Short hex prefix for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
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

/// Distance between two identifiers, symmetric, zero only for equal ids.
#[inline]
pub fn distance(a: &NodeId, b: &NodeId) -> usize {
    a.distance(b)
}

/// Produce an identifier exactly `d` bits of distance away from `base`.
///
/// Keeps the first `ID_BITS - d` bits of `base`, flips the next one and
/// randomizes everything after it. `d == 0` returns `base`; `d` above
/// `ID_BITS` is clamped. The result carries no proof-of-work and is only
/// meant as a lookup target.
pub fn generate_by_distance(base: &NodeId, d: usize) -> NodeId {
    if d == 0 {
        return *base;
    }
    let d = d.min(ID_BITS);
    let boundary = ID_BITS - d;
    let byte_idx = boundary / 8;
    let bit_pos = boundary % 8;

    let mut noise = [0u8; ID_LEN];
    rand::thread_rng().fill_bytes(&mut noise);

    let mut out = *base.as_bytes();
    let target_bit = 0x80u8 >> bit_pos;
    let keep_mask = !(target_bit | target_bit.wrapping_sub(1));
    let random_mask = target_bit.wrapping_sub(1);
    out[byte_idx] = (out[byte_idx] & keep_mask)
        | (!out[byte_idx] & target_bit)
        | (noise[byte_idx] & random_mask);
    out[byte_idx + 1..].copy_from_slice(&noise[byte_idx + 1..]);

    NodeId(out)
}

// ============================================================================
// Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The identifier derived from this keypair's public key.
    pub fn node_id(&self) -> NodeId {
        NodeId(hash160(&self.public_key_bytes()))
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id().short())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Identifier (id + validation)
// ============================================================================

/// Leading zero bits of the static puzzle hash `H(id)`.
#[inline]
fn static_work(id: &NodeId) -> u32 {
    leading_zero_bits(&hash160(id.as_bytes()))
}

/// Leading zero bits of the dynamic puzzle hash `H(id XOR validation)`.
#[inline]
fn dynamic_work(id: &NodeId, validation: &[u8; ID_LEN]) -> u32 {
    leading_zero_bits(&hash160(&xor(id.as_bytes(), validation)))
}

/// Check both proof-of-work puzzles for an identifier/validation pair.
pub fn validate(id: &NodeId, validation: &[u8; ID_LEN], c1: u32, c2: u32) -> bool {
    static_work(id) >= c1 && dynamic_work(id, validation) >= c2
}

/// An identifier paired with its proof-of-work validation value.
///
/// This is what travels on the wire and what the routing table stores.
/// Instances built with [`Identifier::new`] are known to satisfy the puzzles;
/// [`Identifier::from_parts`] skips the check and is meant for decoding,
/// where the caller validates before trusting the peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identifier {
    id: NodeId,
    validation: [u8; ID_LEN],
}

impl Identifier {
    /// Construct an identifier, failing fast if either puzzle is unsolved.
    pub fn new(id: NodeId, validation: [u8; ID_LEN], c1: u32, c2: u32) -> Result<Self, IdentityError> {
        let identifier = Self { id, validation };
        identifier.verify(c1, c2)?;
        Ok(identifier)
    }

    #[inline]
    pub fn from_parts(id: NodeId, validation: [u8; ID_LEN]) -> Self {
        Self { id, validation }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn validation(&self) -> &[u8; ID_LEN] {
        &self.validation
    }

    pub fn is_valid(&self, c1: u32, c2: u32) -> bool {
        validate(&self.id, &self.validation, c1, c2)
    }

    /// Like [`is_valid`](Self::is_valid) but reports which puzzle failed.
    pub fn verify(&self, c1: u32, c2: u32) -> Result<(), IdentityError> {
        let found = static_work(&self.id);
        if found < c1 {
            return Err(IdentityError::InsufficientWork {
                puzzle: Puzzle::Static,
                required: c1,
                found,
            });
        }
        let found = dynamic_work(&self.id, &self.validation);
        if found < c2 {
            return Err(IdentityError::InsufficientWork {
                puzzle: Puzzle::Dynamic,
                required: c2,
                found,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identifier({})", &self.id.to_hex()[..16])
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

// ============================================================================
// LocalIdentity
// ============================================================================

/// The running node's identifier and the keypair that produced it.
#[derive(Clone, Debug)]
pub struct LocalIdentity {
    identifier: Identifier,
    keypair: Keypair,
}

impl LocalIdentity {
    /// Run both proof-of-work stages until a solution is found.
    ///
    /// There is no attempt limit. Expected cost is `2^c1` keypair generations
    /// plus `2^c2` validation draws, so callers on an async runtime should run
    /// this on a blocking thread.
    pub fn generate(c1: u32, c2: u32) -> Self {
        let mut keypair = Keypair::generate();
        let mut id = keypair.node_id();
        while static_work(&id) < c1 {
            keypair = Keypair::generate();
            id = keypair.node_id();
        }

        let mut rng = rand::thread_rng();
        let mut validation = [0u8; ID_LEN];
        loop {
            rng.fill_bytes(&mut validation);
            if dynamic_work(&id, &validation) >= c2 {
                break;
            }
        }

        Self {
            identifier: Identifier { id, validation },
            keypair,
        }
    }

    /// Rebuild a local identity from a stored keypair and validation value.
    pub fn from_keypair(
        keypair: Keypair,
        validation: [u8; ID_LEN],
        c1: u32,
        c2: u32,
    ) -> Result<Self, IdentityError> {
        let identifier = Identifier::new(keypair.node_id(), validation, c1, c2)?;
        Ok(Self { identifier, keypair })
    }

    #[inline]
    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.identifier.id
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}
