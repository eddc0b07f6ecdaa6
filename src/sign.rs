//! Detached-signature collaborator.
//!
//! The core never manages key material; it only needs something that can
//! turn a file on disk into a sibling `.asc`. Swapping [`OpenPgpSigner`] for
//! [`NoopSigner`] in tests keeps the store and generator pipeline
//! exercisable without a real keyring.

use std::path::Path;

use openpgp::parse::Parse;
use openpgp::policy::StandardPolicy;
use openpgp::serialize::stream::{Message, Signer as OpenPgpMessageSigner};
use openpgp::Cert;
use sequoia_openpgp as openpgp;

use crate::error::{Result, TreeError};

/// Signs a file in place, producing `<path>.asc` next to it.
pub trait Signer: Send + Sync {
    fn sign(&self, path: &Path) -> Result<()>;
}

/// Loads a certificate with a secret signing (sub)key and produces
/// cleartext-armored detached signatures, the same shape the teacher's
/// `sign_message` writes.
pub struct OpenPgpSigner {
    cert: Cert,
}

impl OpenPgpSigner {
    pub fn load<P: AsRef<Path>>(cert_path: P) -> Result<Self> {
        let cert = Cert::from_file(cert_path.as_ref())
            .map_err(|e| TreeError::External(format!("loading signing certificate: {e}")))?;
        Ok(OpenPgpSigner { cert })
    }

    fn sign_bytes(&self, content: &[u8]) -> Result<Vec<u8>> {
        let policy = StandardPolicy::new();
        let keypair = self
            .cert
            .keys()
            .secret()
            .with_policy(&policy, None)
            .supported()
            .alive()
            .revoked(false)
            .for_signing()
            .next()
            .ok_or_else(|| TreeError::External("no usable signing key in certificate".into()))?
            .key()
            .clone()
            .into_keypair()
            .map_err(|e| TreeError::External(format!("loading signing keypair: {e}")))?;

        let mut sink = Vec::new();
        let message = Message::new(&mut sink);
        let mut message = OpenPgpMessageSigner::new(message, keypair)
            .map_err(|e| TreeError::External(e.to_string()))?
            .cleartext()
            .build()
            .map_err(|e| TreeError::External(e.to_string()))?;
        use std::io::Write;
        message
            .write_all(content)
            .map_err(|e| TreeError::External(e.to_string()))?;
        message
            .finalize()
            .map_err(|e| TreeError::External(e.to_string()))?;
        Ok(sink)
    }
}

impl Signer for OpenPgpSigner {
    fn sign(&self, path: &Path) -> Result<()> {
        let content = std::fs::read(path)?;
        let signed = self.sign_bytes(&content)?;
        std::fs::write(sibling_asc(path), signed)?;
        Ok(())
    }
}

/// No-op signer for tests: writes an empty `.asc` so sibling-existence
/// checks still pass.
pub struct NoopSigner;

impl Signer for NoopSigner {
    fn sign(&self, path: &Path) -> Result<()> {
        std::fs::write(sibling_asc(path), b"")?;
        Ok(())
    }
}

pub fn sibling_asc(path: &Path) -> std::path::PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".asc");
    std::path::PathBuf::from(s)
}

#[test]
fn test_noop_signer_writes_sibling() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.tar.xz");
    std::fs::write(&path, b"hello").unwrap();
    NoopSigner.sign(&path).unwrap();
    assert!(sibling_asc(&path).exists());
}
