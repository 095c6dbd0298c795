//! Policy for the `revoked` condition: a freshly issued certificate is
//! revoked immediately, and only promoted once it actually appears on
//! its issuer's CRL.

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tracing::info;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{
    DistributionPointName, GeneralName, ParsedExtension,
};
use x509_parser::prelude::FromDer;
use x509_parser::revocation_list::CertificateRevocationList;

use crate::acme::checker::{expired_leaf, half_time, Checker, Readiness};

/// How often to re-poll the CRL while waiting for the entry to appear.
const CRL_CHECK_INTERVAL: Duration = Duration::minutes(15);

pub struct RevokedChecker {
    http: reqwest::Client,
    check_interval: Duration,
}

impl RevokedChecker {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            check_interval: CRL_CHECK_INTERVAL,
        }
    }

    /// Whether the leaf is listed on its first CRL distribution point.
    /// The CRL's signature must verify under `issuer`.
    async fn check_crl(
        &self,
        leaf: &X509Certificate<'_>,
        issuer: &X509Certificate<'_>,
    ) -> anyhow::Result<bool> {
        let Some(url) = crl_distribution_point(leaf)? else {
            // Without a CRL we cannot prove non-revocation, and serving
            // the cert does not mislead anyone: its only purpose is to
            // appear revoked. Assume revoked.
            info!("No CRL distribution point; assuming revoked");
            return Ok(true);
        };

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("downloading CRL {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("downloading CRL {url}: unexpected status {status}");
        }
        let der = response
            .bytes()
            .await
            .with_context(|| format!("reading CRL {url}"))?;

        let (_, crl) = CertificateRevocationList::from_der(&der)
            .map_err(|err| anyhow!("parsing CRL {url}: {err}"))?;
        crl.verify_signature(issuer.public_key())
            .map_err(|err| anyhow!("validating CRL {url}: {err}"))?;

        Ok(crl
            .iter_revoked_certificates()
            .any(|entry| entry.user_certificate == leaf.serial))
    }
}

#[async_trait]
impl Checker for RevokedChecker {
    async fn check_ready(
        &self,
        leaf: &X509Certificate<'_>,
        issuer: &X509Certificate<'_>,
    ) -> Readiness {
        // A revoked demonstration cert must not also be expired.
        let not_after = leaf.validity().not_after.to_datetime();
        if OffsetDateTime::now_utc() > not_after {
            return expired_leaf(not_after);
        }

        match self.check_crl(leaf, issuer).await {
            Ok(true) => Readiness::Ready,
            Ok(false) => {
                let retry_at = OffsetDateTime::now_utc() + self.check_interval;
                info!("Certificate not yet listed on its CRL; rechecking at {retry_at}");
                Readiness::RetryAt(retry_at, None)
            }
            // CRL trouble is transient for the overall system: surface
            // the error for logging, but keep the staged material.
            Err(err) => Readiness::RetryAt(
                OffsetDateTime::now_utc() + self.check_interval,
                Some(err),
            ),
        }
    }

    /// Always the lifetime midpoint. ARI is inapplicable: the server
    /// would demand immediate replacement of a revoked certificate.
    async fn renew_at(&self, leaf: &X509Certificate<'_>) -> OffsetDateTime {
        half_time(leaf)
    }

    fn should_revoke(&self) -> bool {
        true
    }
}

/// First HTTP(S) URI in the leaf's CRLDistributionPoints extension, if
/// the extension is present at all.
fn crl_distribution_point(
    leaf: &X509Certificate<'_>,
) -> anyhow::Result<Option<String>> {
    for ext in leaf.extensions() {
        let ParsedExtension::CRLDistributionPoints(points) =
            ext.parsed_extension()
        else {
            continue;
        };
        let Some(point) = points.points.first() else {
            return Ok(None);
        };
        let Some(DistributionPointName::FullName(names)) =
            &point.distribution_point
        else {
            bail!("unsupported CRL distribution point form");
        };
        for name in names {
            if let GeneralName::URI(uri) = name {
                return Ok(Some((*uri).to_owned()));
            }
        }
        bail!("CRL distribution point carries no URI");
    }
    Ok(None)
}
