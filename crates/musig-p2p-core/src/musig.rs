//! MuSig2 primitive bridge
//!
//! Key aggregation, nonce generation, partial signing, partial-signature
//! verification and final aggregation are delegated to the `musig2` crate
//! (BIP-327). This module converts between our key types and the crate's
//! types by byte serialization and enforces the deterministic key order every
//! participant must agree on.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use musig2::secp256k1;
use musig2::{AggNonce, BinaryEncoding, KeyAggContext, LiftedSignature, PubNonce, SecNonce};
use rand::{rngs::OsRng, RngCore};

use crate::types::{PrivateKey, PublicKey};
use crate::{Error, Result};

pub use musig2::PartialSignature;

/// Serialized length of a MuSig2 public nonce
pub const PUB_NONCE_LEN: usize = 66;

/// Serialized length of a partial signature
pub const PARTIAL_SIGNATURE_LEN: usize = 32;

/// Serialized length of the final Schnorr signature
pub const SIGNATURE_LEN: usize = 64;

/// Address version byte prepended to the x-only aggregated key
pub const ADDRESS_VERSION: u8 = 0x3c;

/// Serialized length of a peer binding proof
pub const PEER_BINDING_LEN: usize = 64;

const PEER_BINDING_DOMAIN: &[u8] = b"musig2-p2p/peer-binding/v1";

/// Sort keys byte-lexicographically by their compressed encoding.
///
/// Duplicate keys and sets with fewer than two members are rejected: the
/// participant set of a session is exact.
pub fn sort_public_keys(keys: &[PublicKey]) -> Result<Vec<PublicKey>> {
    let mut sorted = keys.to_vec();
    sorted.sort();

    if sorted.windows(2).any(|w| w[0] == w[1]) {
        return Err(Error::ParticipantMismatch(
            "participant set contains a duplicate key".into(),
        ));
    }
    if sorted.len() < 2 {
        return Err(Error::ParticipantMismatch(format!(
            "at least 2 participants required, got {}",
            sorted.len()
        )));
    }

    Ok(sorted)
}

fn to_musig_pubkey(key: &PublicKey) -> Result<secp256k1::PublicKey> {
    secp256k1::PublicKey::from_slice(key.as_bytes())
        .map_err(|e| Error::InvalidKey(format!("pubkey conversion: {}", e)))
}

fn to_musig_seckey(key: &PrivateKey) -> Result<secp256k1::SecretKey> {
    #[allow(deprecated)]
    secp256k1::SecretKey::from_slice(key.secret_bytes())
        .map_err(|e| Error::InvalidKey(format!("seckey conversion: {}", e)))
}

fn from_musig_pubkey(key: &secp256k1::PublicKey) -> Result<PublicKey> {
    PublicKey::from_bytes(&key.serialize())
}

/// Build the key aggregation context for an already sorted participant list
pub fn key_agg_context(sorted: &[PublicKey]) -> Result<KeyAggContext> {
    if sorted.windows(2).any(|w| w[0] >= w[1]) {
        return Err(Error::Internal(
            "key aggregation requires a sorted, duplicate-free key list".into(),
        ));
    }

    let keys = sorted
        .iter()
        .map(to_musig_pubkey)
        .collect::<Result<Vec<_>>>()?;

    KeyAggContext::new(keys).map_err(|e| Error::Crypto(format!("key aggregation: {}", e)))
}

/// Aggregated public key of a context
pub fn aggregated_key(ctx: &KeyAggContext) -> Result<PublicKey> {
    let agg: secp256k1::PublicKey = ctx.aggregated_pubkey();
    from_musig_pubkey(&agg)
}

/// Aggregate a participant set into one public key; input order is irrelevant
pub fn aggregate_public_keys(keys: &[PublicKey]) -> Result<PublicKey> {
    let sorted = sort_public_keys(keys)?;
    let ctx = key_agg_context(&sorted)?;
    aggregated_key(&ctx)
}

/// Receiving address for an aggregated key: base58check of the version byte
/// followed by the x-only key
pub fn derive_address(aggregated: &PublicKey) -> String {
    let mut payload = Vec::with_capacity(33);
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(&aggregated.as_bytes()[1..]);
    bs58::encode(payload).with_check().into_string()
}

fn peer_binding_message(session_id: &str, peer: &str) -> Vec<u8> {
    let mut message =
        Vec::with_capacity(PEER_BINDING_DOMAIN.len() + 8 + session_id.len() + peer.len());
    message.extend_from_slice(PEER_BINDING_DOMAIN);
    for part in [session_id, peer] {
        message.extend_from_slice(&(part.len() as u32).to_be_bytes());
        message.extend_from_slice(part.as_bytes());
    }
    message
}

/// ECDSA signature by a participant key stating that `peer` speaks for it
/// in session `session_id`.
pub fn peer_binding_proof(private_key: &PrivateKey, session_id: &str, peer: &str) -> Result<Vec<u8>> {
    let signing_key = SigningKey::from_slice(private_key.secret_bytes())
        .map_err(|e| Error::InvalidKey(format!("signing key: {}", e)))?;
    let signature: Signature = signing_key.sign(&peer_binding_message(session_id, peer));
    Ok(signature.to_bytes().to_vec())
}

pub fn verify_peer_binding(key: &PublicKey, session_id: &str, peer: &str, proof: &[u8]) -> bool {
    if proof.len() != PEER_BINDING_LEN {
        return false;
    }
    let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(key.as_bytes()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(proof) else {
        return false;
    };
    verifying_key
        .verify(&peer_binding_message(session_id, peer), &signature)
        .is_ok()
}

/// Generate a fresh nonce pair bound to this key, aggregated key and message.
///
/// The returned secret nonce must be used for exactly one partial signature.
pub fn generate_nonce(
    private_key: &PrivateKey,
    ctx: &KeyAggContext,
    message: &[u8],
) -> Result<(SecNonce, PubNonce)> {
    let seckey = to_musig_seckey(private_key)?;
    let agg_pk: secp256k1::PublicKey = ctx.aggregated_pubkey();

    let mut nonce_seed = [0u8; 32];
    OsRng.fill_bytes(&mut nonce_seed);

    let msg = message.to_vec();
    let secnonce = SecNonce::build(nonce_seed)
        .with_seckey(seckey)
        .with_aggregated_pubkey(agg_pk)
        .with_message(&msg)
        .build();
    let pubnonce = secnonce.public_nonce();

    Ok((secnonce, pubnonce))
}

/// Sum all participants' public nonces
pub fn aggregate_nonces(nonces: &[PubNonce]) -> AggNonce {
    AggNonce::sum(nonces)
}

/// Produce this participant's partial signature; consumes the secret nonce
pub fn sign_partial(
    private_key: &PrivateKey,
    secnonce: SecNonce,
    ctx: &KeyAggContext,
    agg_nonce: &AggNonce,
    message: &[u8],
) -> Result<PartialSignature> {
    let seckey = to_musig_seckey(private_key)?;
    let partial: PartialSignature = musig2::sign_partial(ctx, seckey, secnonce, agg_nonce, message)
        .map_err(|e| Error::Crypto(format!("partial sign: {}", e)))?;
    Ok(partial)
}

/// Verify one participant's partial signature against the session's
/// aggregated nonce and that participant's public nonce
pub fn verify_partial(
    ctx: &KeyAggContext,
    partial: &PartialSignature,
    agg_nonce: &AggNonce,
    signer: &PublicKey,
    signer_nonce: &PubNonce,
    message: &[u8],
) -> bool {
    let signer = match to_musig_pubkey(signer) {
        Ok(pk) => pk,
        Err(_) => return false,
    };

    musig2::verify_partial(ctx, *partial, agg_nonce, signer, signer_nonce, message).is_ok()
}

/// Aggregate verified partial signatures into the final 64-byte signature
pub fn aggregate_signatures(
    ctx: &KeyAggContext,
    agg_nonce: &AggNonce,
    partials: &[PartialSignature],
    message: &[u8],
) -> Result<[u8; SIGNATURE_LEN]> {
    let signature: LiftedSignature =
        musig2::aggregate_partial_signatures(ctx, agg_nonce, partials.iter().copied(), message)
            .map_err(|e| Error::Crypto(format!("signature aggregation: {}", e)))?;
    Ok(signature.serialize())
}

/// Verify a final signature against an aggregated key
pub fn verify_signature(aggregated: &PublicKey, signature: &[u8], message: &[u8]) -> bool {
    let pubkey = match to_musig_pubkey(aggregated) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let signature = match LiftedSignature::from_bytes(signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };

    musig2::verify_single(pubkey, signature, message).is_ok()
}

pub fn encode_pub_nonce(nonce: &PubNonce) -> Vec<u8> {
    nonce.serialize().to_vec()
}

pub fn decode_pub_nonce(bytes: &[u8]) -> Result<PubNonce> {
    if bytes.len() != PUB_NONCE_LEN {
        return Err(Error::Deserialization(format!(
            "public nonce must be {} bytes, got {}",
            PUB_NONCE_LEN,
            bytes.len()
        )));
    }
    PubNonce::from_bytes(bytes).map_err(|e| Error::Deserialization(format!("pubnonce: {}", e)))
}

pub fn encode_partial_signature(partial: &PartialSignature) -> Vec<u8> {
    partial.serialize().to_vec()
}

pub fn decode_partial_signature(bytes: &[u8]) -> Result<PartialSignature> {
    if bytes.len() != PARTIAL_SIGNATURE_LEN {
        return Err(Error::Deserialization(format!(
            "partial signature must be {} bytes, got {}",
            PARTIAL_SIGNATURE_LEN,
            bytes.len()
        )));
    }
    PartialSignature::from_slice(bytes)
        .map_err(|e| Error::Deserialization(format!("partial signature: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<PrivateKey> {
        (0..n).map(|_| PrivateKey::generate()).collect()
    }

    fn public(keys: &[PrivateKey]) -> Vec<PublicKey> {
        keys.iter().map(|k| k.public_key()).collect()
    }

    #[test]
    fn test_key_aggregation_is_order_independent() {
        let signers = keys(3);
        let pks = public(&signers);
        let (a, b, c) = (pks[0], pks[1], pks[2]);

        let abc = aggregate_public_keys(&[a, b, c]).unwrap();
        let cab = aggregate_public_keys(&[c, a, b]).unwrap();
        let bca = aggregate_public_keys(&[b, c, a]).unwrap();

        assert_eq!(abc, cab);
        assert_eq!(abc, bca);
    }

    #[test]
    fn test_unsorted_context_rejected() {
        let pks = public(&keys(2));
        let mut descending = pks.clone();
        descending.sort();
        descending.reverse();

        assert!(key_agg_context(&descending).is_err());
    }

    #[test]
    fn test_duplicate_and_single_key_sets_rejected() {
        let pk = PrivateKey::generate().public_key();
        assert!(matches!(
            sort_public_keys(&[pk, pk]),
            Err(Error::ParticipantMismatch(_))
        ));
        assert!(matches!(
            sort_public_keys(&[pk]),
            Err(Error::ParticipantMismatch(_))
        ));
    }

    #[test]
    fn test_shared_wallet_address_stable() {
        let pks = public(&keys(3));
        let mut reversed = pks.clone();
        reversed.reverse();

        let w1 = crate::SharedWallet::from_participants(&pks).unwrap();
        let w2 = crate::SharedWallet::from_participants(&reversed).unwrap();

        assert_eq!(w1, w2);
        assert!(w1.participants().windows(2).all(|w| w[0] < w[1]));
        assert!(!w1.address().is_empty());
    }

    #[test]
    fn test_full_two_round_signing() {
        let signers = keys(3);
        let sorted = sort_public_keys(&public(&signers)).unwrap();
        let ctx = key_agg_context(&sorted).unwrap();
        let agg = aggregated_key(&ctx).unwrap();
        let message = [0xABu8; 32];

        let mut secnonces = Vec::new();
        let mut pubnonces = Vec::new();
        for signer in &signers {
            let (sec, public) = generate_nonce(signer, &ctx, &message).unwrap();
            secnonces.push(sec);
            pubnonces.push(public);
        }
        let agg_nonce = aggregate_nonces(&pubnonces);

        let mut partials = Vec::new();
        for ((signer, sec), public) in signers.iter().zip(secnonces).zip(&pubnonces) {
            let partial = sign_partial(signer, sec, &ctx, &agg_nonce, &message).unwrap();
            assert!(verify_partial(
                &ctx,
                &partial,
                &agg_nonce,
                &signer.public_key(),
                public,
                &message
            ));
            partials.push(partial);
        }

        let signature = aggregate_signatures(&ctx, &agg_nonce, &partials, &message).unwrap();
        assert!(verify_signature(&agg, &signature, &message));
        assert!(!verify_signature(&agg, &signature, &[0xCDu8; 32]));
    }

    #[test]
    fn test_partial_signature_from_wrong_signer_fails_verification() {
        let signers = keys(2);
        let sorted = sort_public_keys(&public(&signers)).unwrap();
        let ctx = key_agg_context(&sorted).unwrap();
        let message = b"escrow release".to_vec();

        let outsider = PrivateKey::generate();
        let (_sec0, pub0) = generate_nonce(&signers[0], &ctx, &message).unwrap();
        let (sec_out, pub_out) = generate_nonce(&outsider, &ctx, &message).unwrap();
        let agg_nonce = aggregate_nonces(&[pub0, pub_out.clone()]);

        if let Ok(partial) = sign_partial(&outsider, sec_out, &ctx, &agg_nonce, &message) {
            assert!(!verify_partial(
                &ctx,
                &partial,
                &agg_nonce,
                &signers[1].public_key(),
                &pub_out,
                &message
            ));
        }
    }

    #[test]
    fn test_nonces_are_fresh_per_generation() {
        let signers = keys(2);
        let sorted = sort_public_keys(&public(&signers)).unwrap();
        let ctx = key_agg_context(&sorted).unwrap();
        let message = [7u8; 32];

        let (_s1, p1) = generate_nonce(&signers[0], &ctx, &message).unwrap();
        let (_s2, p2) = generate_nonce(&signers[0], &ctx, &message).unwrap();
        assert_ne!(encode_pub_nonce(&p1), encode_pub_nonce(&p2));
    }

    #[test]
    fn test_wire_decoding_rejects_bad_lengths() {
        assert!(decode_pub_nonce(&[2u8; 10]).is_err());
        assert!(decode_partial_signature(&[1u8; 31]).is_err());

        let signers = keys(2);
        let sorted = sort_public_keys(&public(&signers)).unwrap();
        let ctx = key_agg_context(&sorted).unwrap();
        let (_sec, public) = generate_nonce(&signers[0], &ctx, b"m").unwrap();
        let decoded = decode_pub_nonce(&encode_pub_nonce(&public)).unwrap();
        assert_eq!(encode_pub_nonce(&decoded), encode_pub_nonce(&public));
    }

    #[test]
    fn test_peer_binding_is_specific_to_key_session_and_peer() {
        let signers = keys(2);
        let key = signers[0].public_key();
        let proof = peer_binding_proof(&signers[0], "s1", "alice").unwrap();
        assert_eq!(proof.len(), PEER_BINDING_LEN);

        assert!(verify_peer_binding(&key, "s1", "alice", &proof));
        assert!(!verify_peer_binding(&key, "s1", "mallory", &proof));
        assert!(!verify_peer_binding(&key, "s2", "alice", &proof));
        assert!(!verify_peer_binding(&signers[1].public_key(), "s1", "alice", &proof));
        assert!(!verify_peer_binding(&key, "s1", "alice", &proof[..32]));
        assert!(!verify_peer_binding(&key, "s1", "alice", &[0u8; PEER_BINDING_LEN]));
    }
}
