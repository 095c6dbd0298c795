//! Certificate issuance over ACME: the client collaborator, the three
//! condition checkers, and the per-domain issuer state machines.

pub mod checker;
pub mod client;
pub mod expired;
pub mod issuer;
pub mod revoked;
pub mod valid;

use std::sync::Arc;

use scheduler::TimerWheel;

use crate::cache::CertCache;
use crate::config::{Condition, Config};
use crate::storage::Store;

use self::checker::Checker;
use self::client::{build_reqwest_client, AcmeClient, DirectoryClient};
use self::expired::ExpiredChecker;
use self::issuer::Issuer;
use self::revoked::RevokedChecker;
use self::valid::ValidChecker;

/// Connect to the ACME directory (registering an account if none is
/// stored) and start one issuer per configured domain.
pub async fn start(
    config: &Config,
    store: Arc<Store>,
    cache: Arc<CertCache>,
    wheel: TimerWheel,
) -> anyhow::Result<()> {
    let client: Arc<dyn AcmeClient> = Arc::new(
        DirectoryClient::connect(&config.acme, &store, cache.clone()).await?,
    );
    let http = build_reqwest_client(config.acme.ca_certs.as_deref())?;

    for site in &config.sites {
        let key_type = site
            .parse_key_type()
            .expect("key types are validated at config load");
        for (condition, domain) in site.domains.iter() {
            let checker: Box<dyn Checker> = match condition {
                Condition::Valid =>
                    Box::new(ValidChecker::new(client.clone())),
                Condition::Revoked =>
                    Box::new(RevokedChecker::new(http.clone())),
                Condition::Expired => Box::new(ExpiredChecker),
            };
            let issuer = Arc::new(Issuer {
                domain: domain.to_owned(),
                condition,
                issuer_cn: site.issuer_cn.clone(),
                key_type,
                profile: site.profile.clone(),
                checker,
                client: client.clone(),
                cache: cache.clone(),
                store: store.clone(),
                wheel: wheel.clone(),
            });
            issuer.spawn();
        }
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Certificate fixtures and an in-memory ACME server stand-in,
    //! shared by the checker and issuer tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use rcgen::{
        BasicConstraints, CertificateParams, CertificateRevocationListParams,
        CertifiedIssuer, CrlDistributionPoint, DnType, IsCa, KeyIdMethod,
        KeyPair, KeyUsagePurpose, RevokedCertParams, SerialNumber,
    };
    use time::{Duration, OffsetDateTime};
    use x509_parser::certificate::X509Certificate;

    use super::checker::{half_time, Checker, Readiness};
    use super::client::{AcmeClient, AriHint, OrderSpec, RevocationReason};

    pub(crate) struct TestCa {
        pub issuer: CertifiedIssuer<'static, KeyPair>,
    }

    impl TestCa {
        pub fn cert_der_and_pem(&self) -> (Vec<u8>, String) {
            let cert = self.issuer.as_ref();
            (cert.der().to_vec(), cert.pem())
        }
    }

    /// A self-signed CA that can sign test leaves and CRLs.
    pub(crate) fn test_ca() -> TestCa {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, "Lifecycle Test CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages =
            vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        TestCa {
            issuer: CertifiedIssuer::self_signed(params, key).unwrap(),
        }
    }

    pub(crate) struct LeafOptions {
        pub serial: u64,
        pub not_before: OffsetDateTime,
        pub not_after: OffsetDateTime,
        pub crl_url: Option<String>,
    }

    impl Default for LeafOptions {
        fn default() -> Self {
            let now = OffsetDateTime::now_utc();
            Self {
                serial: 1_111,
                not_before: now - Duration::HOUR,
                not_after: now + Duration::HOUR,
                crl_url: None,
            }
        }
    }

    /// Sign a leaf for a throwaway key. Returns `(der, pem)`.
    pub(crate) fn sign_leaf(
        ca: &TestCa,
        domain: &str,
        options: LeafOptions,
    ) -> (Vec<u8>, String) {
        let key = KeyPair::generate().unwrap();
        sign_leaf_for_key(ca, &key, domain, options)
    }

    /// Sign a leaf bound to the caller's key. Returns `(der, pem)`.
    pub(crate) fn sign_leaf_for_key(
        ca: &TestCa,
        key: &KeyPair,
        domain: &str,
        options: LeafOptions,
    ) -> (Vec<u8>, String) {
        let mut params =
            CertificateParams::new(vec![domain.to_owned()]).unwrap();
        params.serial_number = Some(SerialNumber::from(options.serial));
        params.not_before = options.not_before;
        params.not_after = options.not_after;
        if let Some(url) = options.crl_url {
            params.crl_distribution_points =
                vec![CrlDistributionPoint { uris: vec![url] }];
        }
        let cert = params.signed_by(key, &ca.issuer).unwrap();
        (cert.der().to_vec(), cert.pem())
    }

    /// A DER CRL from the test CA listing the given serials as revoked.
    pub(crate) fn make_crl(ca: &TestCa, revoked_serials: &[u64]) -> Vec<u8> {
        let now = OffsetDateTime::now_utc();
        let params = CertificateRevocationListParams {
            this_update: now - Duration::HOUR,
            next_update: now + Duration::HOUR,
            crl_number: SerialNumber::from(1u64),
            issuing_distribution_point: None,
            revoked_certs: revoked_serials
                .iter()
                .map(|&serial| RevokedCertParams {
                    serial_number: SerialNumber::from(serial),
                    revocation_time: now - Duration::MINUTE,
                    reason_code: None,
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        };
        params.signed_by(&ca.issuer).unwrap().der().to_vec()
    }

    /// Mock [`AcmeClient`] that signs orders from an in-memory CA.
    pub(crate) struct MockAcme {
        ca: TestCa,
        /// How far in the past issued leaves begin.
        pub backdate: Duration,
        /// Issued leaf lifetime, starting at the backdated `not_before`.
        pub lifetime: Duration,
        pub obtain_calls: AtomicUsize,
        /// Chains passed to `revoke`.
        pub revoked: Mutex<Vec<String>>,
        /// `None` makes `renewal_info` fail, simulating an ARI outage.
        pub ari: Option<AriHint>,
    }

    impl MockAcme {
        pub fn new(lifetime: Duration) -> Self {
            Self {
                ca: test_ca(),
                backdate: Duration::HOUR,
                lifetime,
                obtain_calls: AtomicUsize::new(0),
                revoked: Mutex::new(Vec::new()),
                ari: Some(AriHint::Unsupported),
            }
        }

        pub fn with_ari(ari: Option<AriHint>) -> Self {
            let mut mock = Self::new(Duration::days(90));
            mock.ari = ari;
            mock
        }
    }

    #[async_trait]
    impl AcmeClient for MockAcme {
        async fn obtain(
            &self,
            order: OrderSpec<'_>,
        ) -> anyhow::Result<String> {
            self.obtain_calls.fetch_add(1, Ordering::SeqCst);
            let now = OffsetDateTime::now_utc();
            let not_before = now - self.backdate;
            let (_, leaf_pem) = sign_leaf_for_key(
                &self.ca,
                order.key,
                order.domain,
                LeafOptions {
                    not_before,
                    not_after: not_before + self.lifetime,
                    ..LeafOptions::default()
                },
            );
            let (_, ca_pem) = self.ca.cert_der_and_pem();
            Ok(format!("{leaf_pem}{ca_pem}"))
        }

        async fn revoke(
            &self,
            chain_pem: &str,
            _reason: RevocationReason,
        ) -> anyhow::Result<()> {
            self.revoked.lock().unwrap().push(chain_pem.to_owned());
            Ok(())
        }

        async fn renewal_info(
            &self,
            _leaf: &X509Certificate<'_>,
        ) -> anyhow::Result<AriHint> {
            match &self.ari {
                Some(hint) => Ok(hint.clone()),
                None => Err(anyhow!("renewal info unavailable")),
            }
        }
    }

    /// A checker that is always ready, standing in for an
    /// instantly-updated CRL.
    pub(crate) struct ReadyChecker {
        pub revoke: bool,
    }

    #[async_trait]
    impl Checker for ReadyChecker {
        async fn check_ready(
            &self,
            _leaf: &X509Certificate<'_>,
            _issuer: &X509Certificate<'_>,
        ) -> Readiness {
            Readiness::Ready
        }

        async fn renew_at(
            &self,
            leaf: &X509Certificate<'_>,
        ) -> OffsetDateTime {
            half_time(leaf)
        }

        fn should_revoke(&self) -> bool {
            self.revoke
        }
    }
}
