//! The ACME collaborator: account bootstrap, orders driven through the
//! TLS-ALPN-01 challenge, revocation, and renewal info (ARI).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use base64::Engine;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, HttpClient, Identifier,
    NewAccount, NewOrder, Order, OrderStatus, RevocationRequest,
};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use rcgen::{CertificateParams, DistinguishedName};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::ParsedExtension;
use x509_parser::prelude::FromDer;

use crate::cache::CertCache;
use crate::config;
use crate::storage::Store;
use crate::tls;

pub use instant_acme::RevocationReason;

const USER_AGENT: &str =
    concat!("cert-states-site/", env!("CARGO_PKG_VERSION"));

/// How often and how long to poll an order toward the ready state.
const ORDER_POLL_TRIES: usize = 8;
const ORDER_POLL_DELAY: StdDuration = StdDuration::from_millis(250);

/// How often and how long to poll for the issued certificate after
/// finalization.
const CERT_POLL_TRIES: usize = 30;
const CERT_POLL_DELAY: StdDuration = StdDuration::from_secs(1);

/// A single-domain certificate order.
pub struct OrderSpec<'a> {
    pub domain: &'a str,
    /// ACME profile to request, if the site configures one.
    pub profile: Option<&'a str>,
    /// Common Name the returned chain is expected to involve.
    pub issuer_cn: &'a str,
    /// The staged private key; the order's CSR is signed with it.
    pub key: &'a rcgen::KeyPair,
}

/// The ACME server's renewal hint for a certificate.
#[derive(Clone, Debug)]
pub enum AriHint {
    /// The directory does not implement ARI.
    Unsupported,
    /// Renew somewhere inside the suggested window. `retry_after` is how
    /// long the server wants us to wait before asking again.
    Window {
        start: OffsetDateTime,
        end: OffsetDateTime,
        retry_after: Option<Duration>,
    },
}

/// The subset of ACME this daemon consumes. Object-safe so issuers can
/// be exercised against a mock in tests.
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Run a complete order for the given domain and return the bundled
    /// PEM chain, leaf first. Drives TLS-ALPN-01 validation through the
    /// certificate cache.
    async fn obtain(&self, order: OrderSpec<'_>) -> anyhow::Result<String>;

    /// Revoke the leaf of the given PEM chain.
    async fn revoke(
        &self,
        chain_pem: &str,
        reason: RevocationReason,
    ) -> anyhow::Result<()>;

    /// The server's renewal suggestion for `leaf`.
    async fn renewal_info(
        &self,
        leaf: &X509Certificate<'_>,
    ) -> anyhow::Result<AriHint>;
}

/// [`AcmeClient`] backed by a real ACME directory via `instant-acme`.
pub struct DirectoryClient {
    account: Account,
    directory_url: String,
    /// Challenge certificates are installed here during validation.
    cache: Arc<CertCache>,
    /// Used for the ARI endpoint, which is plain unauthenticated HTTP.
    http: reqwest::Client,
    /// The directory's `renewalInfo` URL, probed once; `None` when the
    /// directory doesn't advertise one.
    renewal_endpoint: OnceCell<Option<String>>,
}

impl DirectoryClient {
    /// Load the stored account for the configured directory, or register
    /// a fresh one and persist it.
    pub async fn connect(
        config: &config::Acme,
        store: &Store,
        cache: Arc<CertCache>,
    ) -> anyhow::Result<Self> {
        let ca_certs = config.ca_certs.as_deref();

        let account = match store.read_acme_account(&config.directory)? {
            Some(credentials) => {
                let account = Account::from_credentials_and_http(
                    credentials,
                    acme_http_client(ca_certs)?,
                )
                .await
                .context("restoring ACME account")?;
                info!(directory = %config.directory, "Loaded ACME account");
                account
            }
            None => {
                let new_account = NewAccount {
                    contact: &[],
                    terms_of_service_agreed: config.terms_of_service_agreed,
                    only_return_existing: false,
                };
                let (account, credentials) = Account::create_with_http(
                    &new_account,
                    &config.directory,
                    None,
                    acme_http_client(ca_certs)?,
                )
                .await
                .context("registering ACME account")?;
                store.store_acme_account(&config.directory, &credentials)?;
                info!(directory = %config.directory, "Created new ACME account");
                account
            }
        };

        Ok(Self {
            account,
            directory_url: config.directory.clone(),
            cache,
            http: build_reqwest_client(ca_certs)?,
            renewal_endpoint: OnceCell::new(),
        })
    }

    /// Signal readiness, poll, finalize, and download the chain.
    async fn finish_order(
        &self,
        order: &mut Order,
        spec: &OrderSpec<'_>,
        challenge_urls: &[String],
    ) -> anyhow::Result<String> {
        for url in challenge_urls {
            debug!(%url, "Challenge response installed");
            order
                .set_challenge_ready(url)
                .await
                .context("signalling challenge readiness")?;
        }

        let status = order
            .poll(ORDER_POLL_TRIES, ORDER_POLL_DELAY)
            .await
            .context("polling order")?;
        if status != OrderStatus::Ready {
            bail!("unexpected order status: {status:?}");
        }

        let mut params =
            CertificateParams::new(vec![spec.domain.to_owned()])
                .context("building CSR parameters")?;
        params.distinguished_name = DistinguishedName::new();
        let csr = params
            .serialize_request(spec.key)
            .context("signing CSR")?;

        order.finalize(csr.der()).await.context("finalizing order")?;

        let mut tries = 0;
        let chain_pem = loop {
            match order
                .certificate()
                .await
                .context("downloading certificate")?
            {
                Some(chain_pem) => break chain_pem,
                None => {
                    tries += 1;
                    if tries >= CERT_POLL_TRIES {
                        bail!("certificate was not issued in time");
                    }
                    tokio::time::sleep(CERT_POLL_DELAY).await;
                }
            }
        };

        if !chain_mentions_issuer(&chain_pem, spec.issuer_cn) {
            warn!(
                issuer_cn = spec.issuer_cn,
                "Returned chain does not involve the preferred issuer"
            );
        }

        Ok(chain_pem)
    }

    /// The directory's `renewalInfo` endpoint, fetched once.
    async fn renewal_info_endpoint(&self) -> anyhow::Result<Option<String>> {
        let endpoint = self
            .renewal_endpoint
            .get_or_try_init(|| async {
                let response = self
                    .http
                    .get(&self.directory_url)
                    .send()
                    .await
                    .context("fetching ACME directory")?;
                let body: serde_json::Value =
                    serde_json::from_slice(&response.bytes().await?)
                        .context("parsing ACME directory")?;
                Ok::<_, anyhow::Error>(
                    body.get("renewalInfo")
                        .and_then(|value| value.as_str())
                        .map(str::to_owned),
                )
            })
            .await?;
        Ok(endpoint.clone())
    }
}

#[async_trait]
impl AcmeClient for DirectoryClient {
    async fn obtain(&self, spec: OrderSpec<'_>) -> anyhow::Result<String> {
        info!(domain = spec.domain, "Ordering certificate");

        let identifiers = [Identifier::Dns(spec.domain.to_owned())];
        let mut new_order = NewOrder::new(&identifiers);
        if let Some(profile) = spec.profile {
            new_order = new_order.profile(profile);
        }
        let mut order = self
            .account
            .new_order(&new_order)
            .await
            .context("creating order")?;

        let authorizations = order
            .authorizations()
            .await
            .context("fetching authorizations")?;

        let mut challenge_urls = Vec::new();
        let mut presented = Vec::new();
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => bail!(
                    "authorization for {} in unexpected state {status:?}",
                    spec.domain
                ),
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|challenge| challenge.r#type == ChallengeType::TlsAlpn01)
                .with_context(|| {
                    format!("no tls-alpn-01 challenge offered for {}", spec.domain)
                })?;
            let Identifier::Dns(identifier) = &authz.identifier else {
                bail!("unsupported identifier type");
            };

            let digest = order.key_authorization(challenge).digest();
            self.cache.present(identifier, digest.as_ref())?;
            presented.push(identifier.clone());
            challenge_urls.push(challenge.url.clone());
        }

        let result = self
            .finish_order(&mut order, &spec, &challenge_urls)
            .await;

        // Challenge certificates live for exactly one validation.
        for identifier in &presented {
            self.cache.cleanup(identifier);
        }

        result
    }

    async fn revoke(
        &self,
        chain_pem: &str,
        reason: RevocationReason,
    ) -> anyhow::Result<()> {
        let leaf = CertificateDer::pem_slice_iter(chain_pem.as_bytes())
            .next()
            .context("empty certificate chain")?
            .map_err(|err| anyhow!("parsing chain PEM: {err:?}"))?;

        self.account
            .revoke(&RevocationRequest {
                certificate: &leaf,
                reason: Some(reason),
            })
            .await
            .context("revoking certificate")?;
        Ok(())
    }

    async fn renewal_info(
        &self,
        leaf: &X509Certificate<'_>,
    ) -> anyhow::Result<AriHint> {
        let Some(endpoint) = self.renewal_info_endpoint().await? else {
            return Ok(AriHint::Unsupported);
        };

        let cert_id = ari_cert_id(leaf)?;
        let url = format!("{}/{cert_id}", endpoint.trim_end_matches('/'));

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("fetching renewal info")?;
        let status = response.status();
        if !status.is_success() {
            bail!("renewal info {url}: unexpected status {status}");
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<i64>().ok())
            .map(Duration::seconds);
        let body: RenewalInfoBody =
            serde_json::from_slice(&response.bytes().await?)
                .context("parsing renewal info")?;

        Ok(AriHint::Window {
            start: body.suggested_window.start,
            end: body.suggested_window.end,
            retry_after,
        })
    }
}

#[derive(Deserialize)]
struct RenewalInfoBody {
    #[serde(rename = "suggestedWindow")]
    suggested_window: SuggestedWindow,
}

#[derive(Deserialize)]
struct SuggestedWindow {
    #[serde(with = "time::serde::rfc3339")]
    start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    end: OffsetDateTime,
}

/// draft-ietf-acme-ari certificate identifier:
/// `base64url(authority key id) "." base64url(serial)`, both unpadded.
fn ari_cert_id(leaf: &X509Certificate<'_>) -> anyhow::Result<String> {
    let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;

    let key_id = leaf
        .extensions()
        .iter()
        .find_map(|ext| match ext.parsed_extension() {
            ParsedExtension::AuthorityKeyIdentifier(aki) =>
                aki.key_identifier.as_ref(),
            _ => None,
        })
        .context("certificate has no authority key identifier")?;

    Ok(format!(
        "{}.{}",
        engine.encode(key_id.0),
        engine.encode(leaf.raw_serial()),
    ))
}

/// Best-effort preferred-chain check: whether any certificate in the PEM
/// chain names `issuer_cn` as its subject or issuer CN.
fn chain_mentions_issuer(chain_pem: &str, issuer_cn: &str) -> bool {
    for der in CertificateDer::pem_slice_iter(chain_pem.as_bytes()) {
        let Ok(der) = der else { return false };
        let Ok((_, cert)) = X509Certificate::from_der(&der) else {
            return false;
        };
        let mentions = cert
            .subject()
            .iter_common_name()
            .chain(cert.issuer().iter_common_name())
            .any(|cn| cn.as_str().is_ok_and(|cn| cn == issuer_cn));
        if mentions {
            return true;
        }
    }
    false
}

/// The HTTP client handed to `instant-acme`, trusting `ca_certs` in
/// addition to nothing else when a bundle is configured.
fn acme_http_client(
    ca_certs: Option<&Path>,
) -> anyhow::Result<Box<dyn HttpClient>> {
    let roots = match ca_certs {
        Some(path) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in CertificateDer::pem_file_iter(path)
                .with_context(|| format!("reading {}", path.display()))?
            {
                let cert = cert.context("parsing CA certificate")?;
                roots.add(cert).context("adding CA certificate")?;
            }
            Arc::new(roots)
        }
        None => tls::WEBPKI_ROOT_CERTS.clone(),
    };
    let tls_config = tls::client_config_builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let client = HyperClient::builder(TokioExecutor::new()).build(
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build(),
    );
    Ok(Box::new(client))
}

/// reqwest client for CRL and ARI fetches, trusting `ca_certs` on top of
/// the usual roots when a bundle is configured.
pub fn build_reqwest_client(
    ca_certs: Option<&Path>,
) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(StdDuration::from_secs(30))
        .user_agent(USER_AGENT);
    if let Some(path) = ca_certs {
        let pem = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))?;
        for cert in reqwest::Certificate::from_pem_bundle(&pem)
            .context("parsing CA certificates")?
        {
            builder = builder.add_root_certificate(cert);
        }
    }
    builder.build().context("building HTTP client")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::acme::testutil::{sign_leaf, test_ca, LeafOptions};

    #[test]
    fn chain_issuer_check_matches_subject_and_issuer() {
        let ca = test_ca();
        let (_, leaf_pem) =
            sign_leaf(&ca, "valid.example.com", LeafOptions::default());
        let (_, ca_pem) = ca.cert_der_and_pem();
        let chain = format!("{leaf_pem}{ca_pem}");

        // The CA's CN appears as the leaf's issuer and the CA's subject.
        assert!(chain_mentions_issuer(&chain, "Lifecycle Test CA"));
        assert!(chain_mentions_issuer(&leaf_pem, "Lifecycle Test CA"));
        assert!(!chain_mentions_issuer(&chain, "Somebody Else"));
    }

    #[test]
    fn ari_cert_id_is_two_base64url_segments() {
        let ca = test_ca();
        let (der, _) = sign_leaf(
            &ca,
            "valid.example.com",
            LeafOptions {
                serial: 0x00ab_cdef,
                ..LeafOptions::default()
            },
        );
        let (_, leaf) = X509Certificate::from_der(&der).unwrap();

        let cert_id = ari_cert_id(&leaf).unwrap();
        let (aki, serial) =
            cert_id.split_once('.').expect("two dot-separated segments");
        assert!(!aki.is_empty());
        assert!(!serial.is_empty());
        // Unpadded URL-safe base64 only.
        assert!(!cert_id.contains('='));
        assert!(!cert_id.contains('+'));
        assert!(!cert_id.contains('/'));
    }
}
