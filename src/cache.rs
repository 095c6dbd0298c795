//! In-memory certificate cache and SNI resolver.
//!
//! The TLS handshake's only entry point into the daemon: maps each SNI
//! name to the material it should serve, hosts the ephemeral TLS-ALPN-01
//! challenge certificates, and refuses to serve a certificate whose
//! observable expiry contradicts the state its endpoint demonstrates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use rcgen::{CertificateParams, CustomExtension, KeyPair};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use time::OffsetDateTime;
use tracing::{info, warn};
use x509_parser::prelude::*;

use crate::config::{Condition, Config};
use crate::storage::Store;
use crate::tls;

/// Whether a domain's served certificate is supposed to be expired.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IntendedExpiry {
    ShouldNotBeExpired,
    ShouldBeExpired,
}

impl From<Condition> for IntendedExpiry {
    fn from(condition: Condition) -> Self {
        match condition {
            Condition::Valid | Condition::Revoked => Self::ShouldNotBeExpired,
            Condition::Expired => Self::ShouldBeExpired,
        }
    }
}

/// A served certificate entry for one domain.
struct ServedEntry {
    intended: IntendedExpiry,
    /// `None` until the first successful load from storage.
    material: Option<Material>,
}

struct Material {
    certified: Arc<CertifiedKey>,
    /// Leaf expiry, parsed once at load time so handshakes don't
    /// re-parse the certificate.
    not_after: OffsetDateTime,
}

/// Maps SNI names to TLS material for the listener.
pub struct CertCache {
    store: Arc<Store>,
    inner: Mutex<Inner>,
}

struct Inner {
    served: HashMap<String, ServedEntry>,
    challenges: HashMap<String, Arc<CertifiedKey>>,
}

impl CertCache {
    /// Register every configured domain and load whatever current
    /// material storage already has. Missing material is normal on first
    /// boot; issuance fills it in later.
    pub fn new(config: &Config, store: Arc<Store>) -> Arc<Self> {
        let mut served = HashMap::new();
        for site in &config.sites {
            for (condition, domain) in site.domains.iter() {
                served.insert(
                    domain.to_owned(),
                    ServedEntry {
                        intended: condition.into(),
                        material: None,
                    },
                );
            }
        }

        let cache = Arc::new(Self {
            store,
            inner: Mutex::new(Inner {
                served,
                challenges: HashMap::new(),
            }),
        });

        for site in &config.sites {
            for (condition, domain) in site.domains.iter() {
                if let Err(err) = cache.load_certificate(domain) {
                    info!(
                        domain,
                        condition = condition.as_str(),
                        "No current certificate: {err:#}"
                    );
                }
            }
        }

        cache
    }

    /// Re-read the domain's `current` slot from storage and swap it into
    /// the cache, preserving the intended condition. Called at startup
    /// and by the issuer after each promotion.
    pub fn load_certificate(&self, domain: &str) -> anyhow::Result<()> {
        let pair = self.store.read_current(domain)?;
        let not_after = leaf_not_after(pair.leaf_der())?;

        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .served
            .get_mut(domain)
            .with_context(|| format!("domain {domain} is not configured"))?;
        entry.material = Some(Material {
            certified: pair.certified,
            not_after,
        });
        Ok(())
    }

    /// Install a TLS-ALPN-01 challenge certificate for the domain.
    /// `key_auth_digest` is the SHA-256 of the challenge's key
    /// authorization.
    pub fn present(
        &self,
        domain: &str,
        key_auth_digest: &[u8],
    ) -> anyhow::Result<()> {
        let certified = challenge_cert(domain, key_auth_digest)?;
        self.inner
            .lock()
            .unwrap()
            .challenges
            .insert(domain.to_owned(), Arc::new(certified));
        Ok(())
    }

    /// Remove the domain's challenge certificate once validation is over.
    pub fn cleanup(&self, domain: &str) {
        self.inner.lock().unwrap().challenges.remove(domain);
    }

    /// Resolution core, factored out of the rustls callback so the
    /// dispatch and condition rules are testable.
    fn lookup(
        &self,
        sni: &str,
        challenge: bool,
        now: OffsetDateTime,
    ) -> Option<Arc<CertifiedKey>> {
        let inner = self.inner.lock().unwrap();

        if challenge {
            let certified = inner.challenges.get(sni);
            if certified.is_none() {
                warn!(sni, "No challenge certificate");
            }
            return certified.cloned();
        }

        let entry = match inner.served.get(sni) {
            Some(entry) => entry,
            None => {
                warn!(sni, "No certificate configured");
                return None;
            }
        };
        let material = match &entry.material {
            Some(material) => material,
            None => {
                warn!(sni, "Certificate not issued yet");
                return None;
            }
        };

        // The lifecycle engine should never promote material into the
        // wrong state; if it somehow does, refusing the handshake beats
        // misleading a test client.
        let expired = now > material.not_after;
        match (entry.intended, expired) {
            (IntendedExpiry::ShouldNotBeExpired, true) => {
                warn!(sni, "Certificate is expired");
                None
            }
            (IntendedExpiry::ShouldBeExpired, false) => {
                warn!(sni, "Certificate should be expired but is not");
                None
            }
            _ => Some(material.certified.clone()),
        }
    }
}

impl ResolvesServerCert for CertCache {
    fn resolve(
        &self,
        client_hello: ClientHello<'_>,
    ) -> Option<Arc<CertifiedKey>> {
        let sni = match client_hello.server_name() {
            Some(sni) => sni.to_owned(),
            None => {
                warn!("Client hello carries no SNI");
                return None;
            }
        };
        let challenge = is_challenge_hello(&client_hello);
        self.lookup(&sni, challenge, OffsetDateTime::now_utc())
    }
}

/// Per RFC 8737, a challenge client hello advertises exactly the single
/// protocol `acme-tls/1`.
fn is_challenge_hello(client_hello: &ClientHello<'_>) -> bool {
    match client_hello.alpn() {
        Some(mut alpn) => {
            alpn.next() == Some(tls::ALPN_ACME_TLS1) && alpn.next().is_none()
        }
        None => false,
    }
}

/// Build the self-signed challenge certificate carrying the
/// `acmeIdentifier` extension (OID 1.3.6.1.5.5.7.1.31).
fn challenge_cert(
    domain: &str,
    key_auth_digest: &[u8],
) -> anyhow::Result<CertifiedKey> {
    let key_pair =
        KeyPair::generate().context("generating challenge key")?;
    let mut params = CertificateParams::new(vec![domain.to_owned()])
        .context("invalid challenge SAN")?;
    params
        .custom_extensions
        .push(CustomExtension::new_acme_identifier(key_auth_digest));
    let cert = params
        .self_signed(&key_pair)
        .context("signing challenge certificate")?;

    let key = tls::CRYPTO_PROVIDER
        .key_provider
        .load_private_key(
            PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
        )
        .map_err(|err| anyhow!("loading challenge key: {err}"))?;

    Ok(CertifiedKey::new(vec![cert.der().clone()], key))
}

fn leaf_not_after(
    leaf: &CertificateDer<'_>,
) -> anyhow::Result<OffsetDateTime> {
    let (_, cert) = X509Certificate::from_der(leaf)
        .map_err(|err| anyhow!("parsing leaf certificate: {err}"))?;
    Ok(cert.validity().not_after.to_datetime())
}

#[cfg(test)]
mod test {
    use time::Duration;

    use super::*;
    use crate::config::KeyType;

    const DOMAIN_VALID: &str = "valid.example.com";
    const DOMAIN_EXPIRED: &str = "expired.example.com";

    fn test_config(data_dir: &std::path::Path) -> Config {
        serde_json::from_value(serde_json::json!({
            "ListenAddr": "[::]:443",
            "DataDir": data_dir,
            "Sites": [{
                "IssuerCN": "Test CA",
                "KeyType": "p256",
                "Domains": {
                    "Valid": DOMAIN_VALID,
                    "Revoked": "revoked.example.com",
                    "Expired": DOMAIN_EXPIRED,
                }
            }],
            "ACME": { "Directory": "https://acme.example.com/directory" }
        }))
        .unwrap()
    }

    /// Stage and promote a self-signed cert with the given validity.
    fn install_current(
        store: &Store,
        domain: &str,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) {
        let key_pair = store.store_next_key(domain, KeyType::P256).unwrap();
        let mut params =
            CertificateParams::new(vec![domain.to_owned()]).unwrap();
        params.not_before = not_before;
        params.not_after = not_after;
        let pem = params.self_signed(&key_pair).unwrap().pem();
        store.store_next_cert(domain, &pem).unwrap();
        store.take_next(domain).unwrap();
    }

    fn test_cache() -> (tempfile::TempDir, Arc<Store>, Arc<CertCache>) {
        logger::init_for_testing();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path().to_owned()));
        let cache = CertCache::new(&test_config(dir.path()), store.clone());
        (dir, store, cache)
    }

    #[test]
    fn unknown_or_unloaded_domains_fail() {
        let (_dir, _store, cache) = test_cache();
        let now = OffsetDateTime::now_utc();

        assert!(cache.lookup("nobody.example.com", false, now).is_none());
        // Configured but no material loaded yet.
        assert!(cache.lookup(DOMAIN_VALID, false, now).is_none());
    }

    #[test]
    fn served_material_matching_its_condition_is_returned() {
        let (_dir, store, cache) = test_cache();
        let now = OffsetDateTime::now_utc();

        install_current(
            &store,
            DOMAIN_VALID,
            now - Duration::HOUR,
            now + Duration::HOUR,
        );
        cache.load_certificate(DOMAIN_VALID).unwrap();
        assert!(cache.lookup(DOMAIN_VALID, false, now).is_some());

        install_current(
            &store,
            DOMAIN_EXPIRED,
            now - Duration::hours(2),
            now - Duration::HOUR,
        );
        cache.load_certificate(DOMAIN_EXPIRED).unwrap();
        assert!(cache.lookup(DOMAIN_EXPIRED, false, now).is_some());
    }

    #[test]
    fn condition_mismatch_refuses_the_handshake() {
        let (_dir, store, cache) = test_cache();
        let now = OffsetDateTime::now_utc();

        // A fresh certificate behind the should-be-expired endpoint.
        install_current(
            &store,
            DOMAIN_EXPIRED,
            now - Duration::HOUR,
            now + Duration::HOUR,
        );
        cache.load_certificate(DOMAIN_EXPIRED).unwrap();
        assert!(cache.lookup(DOMAIN_EXPIRED, false, now).is_none());

        // An expired certificate behind the valid endpoint.
        install_current(
            &store,
            DOMAIN_VALID,
            now - Duration::hours(2),
            now - Duration::HOUR,
        );
        cache.load_certificate(DOMAIN_VALID).unwrap();
        assert!(cache.lookup(DOMAIN_VALID, false, now).is_none());
    }

    #[test]
    fn challenge_certs_span_present_to_cleanup() {
        let (_dir, _store, cache) = test_cache();
        let now = OffsetDateTime::now_utc();
        let digest = [0x42u8; 32];

        assert!(cache.lookup(DOMAIN_VALID, true, now).is_none());

        cache.present(DOMAIN_VALID, &digest).unwrap();
        let certified = cache
            .lookup(DOMAIN_VALID, true, now)
            .expect("challenge cert should be served");
        assert_eq!(certified.cert.len(), 1);

        // The challenge map never answers ordinary lookups.
        assert!(cache.lookup(DOMAIN_VALID, false, now).is_none());

        cache.cleanup(DOMAIN_VALID);
        assert!(cache.lookup(DOMAIN_VALID, true, now).is_none());
    }
}
