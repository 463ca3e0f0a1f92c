// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Ed25519 signing and verification, used both for the federation block
//! signature (§4.4 step 4, §4.7 `AddSignaturesToBlock`) and for the
//! `OP_CHECKSIG`/`OP_CHECKMULTISIG` script opcodes (§4.3).

use chain_failure_ext::{ChainErrorKind, Result};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

#[derive(Clone, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "pubkey_bytes")] VerifyingKey);

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signature(#[serde(with = "sig_bytes")] [u8; 64]);

pub struct PrivateKey(SigningKey);

mod pubkey_bytes {
    use ed25519_dalek::VerifyingKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(key: &VerifyingKey, s: S) -> Result<S::Ok, S::Error> {
        key.to_bytes().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<VerifyingKey, D::Error> {
        let bytes = <[u8; 32]>::deserialize(d)?;
        VerifyingKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

mod sig_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        bytes.to_vec().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let v = Vec::<u8>::deserialize(d)?;
        let mut out = [0u8; 64];
        if v.len() != 64 {
            return Err(serde::de::Error::custom("signature must be 64 bytes"));
        }
        out.copy_from_slice(&v);
        Ok(out)
    }
}

impl PublicKey {
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let sig = DalekSignature::from_bytes(&signature.0);
        self.0.verify(message, &sig).is_ok()
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = chain_failure_ext::Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ChainErrorKind::bad_request("public key must be 32 bytes"))?;
        VerifyingKey::from_bytes(&arr)
            .map(PublicKey)
            .map_err(|e| ChainErrorKind::bad_request(format!("invalid public key: {}", e)))
    }
}

impl Signature {
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl TryFrom<&[u8]> for Signature {
    type Error = chain_failure_ext::Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| ChainErrorKind::bad_request("signature must be 64 bytes"))?;
        Ok(Signature(arr))
    }
}

impl PrivateKey {
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        PrivateKey(SigningKey::generate(&mut csprng))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.0.sign(message);
        Signature(sig.to_bytes())
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl TryFrom<&[u8]> for PrivateKey {
    type Error = chain_failure_ext::Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ChainErrorKind::bad_request("private key must be 32 bytes"))?;
        Ok(PrivateKey(SigningKey::from_bytes(&arr)))
    }
}

/// Verifies an N-of-M multisig clause: at least `required` of the
/// `signatures` (in the order the redeem script lists them; empty slots
/// are `None`) must each verify against a distinct public key in
/// `public_keys`, preserving relative order (§4.3 multisig verification).
pub fn verify_multisig(
    message: &[u8],
    public_keys: &[PublicKey],
    signatures: &[Option<Signature>],
    required: usize,
) -> bool {
    let mut key_cursor = 0usize;
    let mut matched = 0usize;
    for sig in signatures.iter().flatten() {
        let mut found = false;
        while key_cursor < public_keys.len() {
            let key = &public_keys[key_cursor];
            key_cursor += 1;
            if key.verify(message, sig) {
                found = true;
                break;
            }
        }
        if found {
            matched += 1;
        } else {
            return false;
        }
    }
    matched >= required
}
