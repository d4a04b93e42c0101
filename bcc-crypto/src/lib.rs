use anyhow::{anyhow, Result};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const KEY_BITS: usize = 1024;

/// An RSA keypair in PEM form. The public PEM doubles as the account address
/// on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub public_pem: String,
    pub private_pem: String,
}

pub fn generate_rsa() -> Result<KeyMaterial> {
    let mut rng = OsRng;
    let private = RsaPrivateKey::new(&mut rng, KEY_BITS)?;
    let public = RsaPublicKey::from(&private);
    Ok(KeyMaterial {
        public_pem: public.to_public_key_pem(LineEnding::LF)?,
        private_pem: private.to_pkcs8_pem(LineEnding::LF)?.to_string(),
    })
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// PSS-signs `message` (the raw digest bytes of a transaction id) with a
/// PKCS#8 PEM private key. Returns the signature hex-encoded.
pub fn sign_message(private_pem: &str, message: &[u8]) -> Result<String> {
    let key = RsaPrivateKey::from_pkcs8_pem(private_pem)
        .map_err(|e| anyhow!("bad private key: {e}"))?;
    let signing = BlindedSigningKey::<Sha256>::new(key);
    let signature = signing.sign_with_rng(&mut OsRng, message);
    Ok(hex::encode(signature.to_bytes()))
}

/// Verifies a hex PSS signature over `message` under a SPKI PEM public key.
/// Malformed keys or signatures verify as false rather than erroring; the
/// caller treats both the same way.
pub fn verify_message(public_pem: &str, message: &[u8], signature_hex: &str) -> bool {
    let Ok(key) = RsaPublicKey::from_public_key_pem(public_pem) else {
        return false;
    };
    let Ok(raw) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(raw.as_slice()) else {
        return false;
    };
    let verifying = VerifyingKey::<Sha256>::new(key);
    verifying.verify(message, &signature).is_ok()
}
