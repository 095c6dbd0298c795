//! On-disk storage of keys, certificates and ACME account records.
//!
//! Each domain owns two slots: issuance stages new material into `next`,
//! and promotion renames it into `current`. A slot is only usable when
//! its private key matches its leaf certificate; anything else reads as
//! an error, so callers restart issuance instead of serving a broken
//! pair.

use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use instant_acme::AccountCredentials;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rcgen::KeyPair;
use rsa::pkcs8::EncodePrivateKey;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use thiserror::Error;

use crate::config::KeyType;
use crate::tls;

/// The two storage slots of a domain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Slot {
    Next,
    Current,
}

impl Slot {
    fn as_str(self) -> &'static str {
        match self {
            Self::Next => "next",
            Self::Current => "current",
        }
    }
}

const PRIVATE_KEY_FILENAME: &str = "private.pem";
const CERTIFICATE_FILENAME: &str = "certificate.pem";
const ACME_ACCOUNT_FILENAME: &str = "acme.json";

/// rwxr-xr-x for created directories. Writable only by the daemon user,
/// but world-listable for debugging.
const DIR_MODE: u32 = 0o755;
/// rw------- for private keys. No permissions outside of user.
const KEY_MODE: u32 = 0o600;
/// rw-r--r-- for certificates and account records. Globally readable for
/// debugging.
const CERT_MODE: u32 = 0o644;

/// Everything except RFC 3986 unreserved characters is percent-encoded
/// when a directory URL becomes a path component.
const PATH_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: no valid PEM data")]
    Pem { path: PathBuf },
    #[error("{domain}: unusable key/certificate pair: {source}")]
    Mismatch {
        domain: String,
        #[source]
        source: rustls::Error,
    },
    #[error("generating {key_type:?} key: {message}")]
    KeyGen { key_type: KeyType, message: String },
    #[error("account record {path}: {source}")]
    AccountJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

/// A validated key plus certificate chain loaded from a slot, ready to
/// hand to rustls.
#[derive(Clone, Debug)]
pub struct CertifiedPair {
    pub certified: Arc<CertifiedKey>,
}

impl CertifiedPair {
    /// DER of the leaf certificate.
    pub fn leaf_der(&self) -> &CertificateDer<'static> {
        &self.certified.cert[0]
    }

    /// DER of the issuer certificate (chain position 1), if bundled.
    pub fn issuer_der(&self) -> Option<&CertificateDer<'static>> {
        self.certified.cert.get(1)
    }

    pub fn chain_len(&self) -> usize {
        self.certified.cert.len()
    }
}

/// Filesystem-backed storage for all per-domain material.
#[derive(Debug)]
pub struct Store {
    /// Serializes writes, and reads that could observe a half-finished
    /// promotion.
    lock: Mutex<()>,
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            lock: Mutex::new(()),
            dir,
        }
    }

    fn path_for(&self, entry: &str, slot: Slot, file: &str) -> PathBuf {
        self.dir.join(entry).join(slot.as_str()).join(file)
    }

    /// Generate a fresh private key for the domain's `next` slot and
    /// persist it as PKCS#8 PEM with owner-only permissions. The key is
    /// returned for CSR signing.
    pub fn store_next_key(
        &self,
        domain: &str,
        key_type: KeyType,
    ) -> Result<KeyPair, StorageError> {
        let key_pair = generate_key(key_type)?;
        let pem = key_pair.serialize_pem();

        let path = self.path_for(domain, Slot::Next, PRIVATE_KEY_FILENAME);
        let _guard = self.lock.lock().unwrap();
        create_dir_all(path.parent().expect("slot paths have a parent"))?;
        write_file(&path, pem.as_bytes(), KEY_MODE)?;
        Ok(key_pair)
    }

    /// Persist the PEM chain (leaf first) for the domain's `next` slot.
    pub fn store_next_cert(
        &self,
        domain: &str,
        chain_pem: &str,
    ) -> Result<(), StorageError> {
        let path = self.path_for(domain, Slot::Next, CERTIFICATE_FILENAME);
        let _guard = self.lock.lock().unwrap();
        create_dir_all(path.parent().expect("slot paths have a parent"))?;
        write_file(&path, chain_pem.as_bytes(), CERT_MODE)
    }

    /// Read the domain's staged pair. Errors if either file is missing or
    /// the key and leaf don't match.
    pub fn read_next(&self, domain: &str) -> Result<CertifiedPair, StorageError> {
        let _guard = self.lock.lock().unwrap();
        self.read(domain, Slot::Next)
    }

    /// Read the domain's served pair. Errors if either file is missing or
    /// the key and leaf don't match.
    pub fn read_current(
        &self,
        domain: &str,
    ) -> Result<CertifiedPair, StorageError> {
        let _guard = self.lock.lock().unwrap();
        self.read(domain, Slot::Current)
    }

    /// Promote `next` to `current` and return the new current pair.
    ///
    /// The pair is read and validated *before* the renames, so a
    /// promotion either commits a matched key and certificate, or fails
    /// leaving a slot that reads as an error. The caller must treat a
    /// failure as "start issuance over".
    pub fn take_next(&self, domain: &str) -> Result<CertifiedPair, StorageError> {
        let _guard = self.lock.lock().unwrap();

        let pair = self.read(domain, Slot::Next)?;

        let current_dir = self.dir.join(domain).join(Slot::Current.as_str());
        create_dir_all(&current_dir)?;

        for file in [PRIVATE_KEY_FILENAME, CERTIFICATE_FILENAME] {
            let from = self.path_for(domain, Slot::Next, file);
            let to = self.path_for(domain, Slot::Current, file);
            fs::rename(&from, &to).map_err(StorageError::io(to.clone()))?;
        }

        Ok(pair)
    }

    /// Load the stored ACME account for `directory_url`. Returns
    /// `Ok(None)` when no account has been registered yet.
    pub fn read_acme_account(
        &self,
        directory_url: &str,
    ) -> Result<Option<AccountCredentials>, StorageError> {
        let path = self.account_path(directory_url);
        let _guard = self.lock.lock().unwrap();

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        let credentials = serde_json::from_slice(&bytes)
            .map_err(|source| StorageError::AccountJson { path, source })?;
        Ok(Some(credentials))
    }

    /// Persist the ACME account record for later [`read_acme_account`]s.
    ///
    /// [`read_acme_account`]: Self::read_acme_account
    pub fn store_acme_account(
        &self,
        directory_url: &str,
        credentials: &AccountCredentials,
    ) -> Result<(), StorageError> {
        let path = self.account_path(directory_url);
        let json = serde_json::to_vec_pretty(credentials).map_err(|source| {
            StorageError::AccountJson {
                path: path.clone(),
                source,
            }
        })?;

        let _guard = self.lock.lock().unwrap();
        create_dir_all(path.parent().expect("account path has a parent"))?;
        write_file(&path, &json, CERT_MODE)
    }

    fn account_path(&self, directory_url: &str) -> PathBuf {
        let encoded =
            utf8_percent_encode(directory_url, PATH_COMPONENT).to_string();
        self.path_for(&encoded, Slot::Current, ACME_ACCOUNT_FILENAME)
    }

    /// Load and validate one slot. Caller must hold the lock.
    fn read(
        &self,
        domain: &str,
        slot: Slot,
    ) -> Result<CertifiedPair, StorageError> {
        let cert_path = self.path_for(domain, slot, CERTIFICATE_FILENAME);
        let key_path = self.path_for(domain, slot, PRIVATE_KEY_FILENAME);

        let cert_bytes =
            fs::read(&cert_path).map_err(StorageError::io(&cert_path))?;
        let key_bytes =
            fs::read(&key_path).map_err(StorageError::io(&key_path))?;

        let chain = CertificateDer::pem_slice_iter(&cert_bytes)
            .map(|cert| cert.map(CertificateDer::into_owned))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| StorageError::Pem {
                path: cert_path.clone(),
            })?;
        if chain.is_empty() {
            return Err(StorageError::Pem { path: cert_path });
        }
        let key = PrivateKeyDer::from_pem_slice(&key_bytes)
            .map_err(|_| StorageError::Pem { path: key_path })?;

        // `from_der` checks that the key and the leaf actually belong
        // together; a half-promoted or corrupted slot fails here.
        let certified = CertifiedKey::from_der(chain, key, &tls::CRYPTO_PROVIDER)
            .map_err(|source| StorageError::Mismatch {
                domain: domain.to_owned(),
                source,
            })?;

        Ok(CertifiedPair {
            certified: Arc::new(certified),
        })
    }
}

/// Generate a private key of the requested type as an rcgen [`KeyPair`],
/// so it can later sign the order's CSR.
fn generate_key(key_type: KeyType) -> Result<KeyPair, StorageError> {
    let keygen_error = |message: String| StorageError::KeyGen {
        key_type,
        message,
    };

    match key_type {
        // rcgen's default algorithm is ECDSA P-256.
        KeyType::P256 =>
            KeyPair::generate().map_err(|err| keygen_error(err.to_string())),
        KeyType::Rsa2048 => {
            // rcgen cannot generate RSA keys; generate with the rsa
            // crate and hand the PKCS#8 encoding back to rcgen for
            // signing.
            let mut rng = rand::thread_rng();
            let rsa_key = rsa::RsaPrivateKey::new(&mut rng, 2048)
                .map_err(|err| keygen_error(err.to_string()))?;
            let der = rsa_key
                .to_pkcs8_der()
                .map_err(|err| keygen_error(err.to_string()))?;
            let der = PrivatePkcs8KeyDer::from(der.as_bytes());
            KeyPair::from_der_and_sign_algo(&der, &rcgen::PKCS_RSA_SHA256)
                .map_err(|err| keygen_error(err.to_string()))
        }
    }
}

fn create_dir_all(path: &Path) -> Result<(), StorageError> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)
        .map_err(StorageError::io(path))
}

fn write_file(
    path: &Path,
    bytes: &[u8],
    mode: u32,
) -> Result<(), StorageError> {
    use std::io::Write;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .map_err(StorageError::io(path))?;
    file.write_all(bytes).map_err(StorageError::io(path))
}
