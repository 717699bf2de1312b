//! RSA key material for the login handshake.

use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pss::BlindedSigningKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::{Oaep, RsaPrivateKey};
use sha2::Sha256;
use ssh_key::public::{KeyData, RsaPublicKey as SshRsaPublicKey};
use ssh_key::PublicKey;
use telemetra_net::{AuthError, KeyManager};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("cannot read key file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path} holds no PKCS#1 or PKCS#8 RSA private key")]
    Format { path: PathBuf },
}

/// Signs with RSA-PSS and decrypts with RSA-OAEP, both over SHA-256.
pub struct RsaKeys {
    private: RsaPrivateKey,
}

impl RsaKeys {
    pub fn new(private: RsaPrivateKey) -> Self {
        RsaKeys { private }
    }

    /// Loads a PEM private key in either PKCS#8 or PKCS#1 form.
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let pem = fs::read_to_string(path).map_err(|source| KeyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        RsaPrivateKey::from_pkcs8_pem(&pem)
            .ok()
            .or_else(|| RsaPrivateKey::from_pkcs1_pem(&pem).ok())
            .map(RsaKeys::new)
            .ok_or_else(|| KeyError::Format {
                path: path.to_path_buf(),
            })
    }
}

impl KeyManager for RsaKeys {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, AuthError> {
        let signer = BlindedSigningKey::<Sha256>::new(self.private.clone());
        let signature = signer
            .try_sign_with_rng(&mut OsRng, data)
            .map_err(|err| AuthError::Key(err.to_string()))?;
        Ok(signature.to_vec())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, AuthError> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), data)
            .map_err(|err| AuthError::Key(err.to_string()))
    }

    fn serialize_public_key(&self) -> Result<String, AuthError> {
        let key_err = |err: ssh_key::Error| AuthError::Key(err.to_string());
        let public = SshRsaPublicKey::try_from(&self.private.to_public_key()).map_err(key_err)?;
        PublicKey::new(KeyData::Rsa(public), "")
            .to_openssh()
            .map_err(key_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};
    use rsa::pss::{Signature, VerifyingKey};
    use rsa::signature::Verifier;
    use std::io::Write;

    fn keys() -> RsaKeys {
        RsaKeys::new(RsaPrivateKey::new(&mut OsRng, 1024).expect("keygen"))
    }

    #[test]
    fn decrypts_oaep_challenges() {
        let keys = keys();
        let public = keys.private.to_public_key();
        let sealed = public
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), b"challenge")
            .expect("encrypt");
        assert_eq!(keys.decrypt(&sealed).expect("decrypt"), b"challenge");
        assert!(matches!(keys.decrypt(b"garbage"), Err(AuthError::Key(_))));
    }

    #[test]
    fn signatures_verify_with_pss() {
        let keys = keys();
        let signature = keys.sign(b"proof").expect("sign");
        let verifier = VerifyingKey::<Sha256>::new(keys.private.to_public_key());
        let signature = Signature::try_from(signature.as_slice()).expect("signature");
        assert!(verifier.verify(b"proof", &signature).is_ok());
        assert!(verifier.verify(b"other", &signature).is_err());
    }

    #[test]
    fn public_key_uses_openssh_form() {
        let encoded = keys().serialize_public_key().expect("public key");
        // base64 of the length-prefixed "ssh-rsa" type tag
        assert!(encoded.starts_with("ssh-rsa AAAAB3NzaC1yc2E"));
        let parsed = PublicKey::from_openssh(&encoded).expect("openssh");
        assert!(parsed.key_data().rsa().is_some());
        assert!(parsed.comment().is_empty());
    }

    #[test]
    fn loads_pem_files() {
        let keys = keys();
        let pem = keys.private.to_pkcs8_pem(LineEnding::LF).expect("pem");
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(pem.as_bytes()).expect("write");
        let loaded = RsaKeys::load(file.path()).expect("load");
        assert_eq!(
            loaded.serialize_public_key().expect("public"),
            keys.serialize_public_key().expect("public")
        );

        let mut junk = tempfile::NamedTempFile::new().expect("tempfile");
        junk.write_all(b"not a key").expect("write");
        assert!(matches!(RsaKeys::load(junk.path()), Err(KeyError::Format { .. })));
    }
}
