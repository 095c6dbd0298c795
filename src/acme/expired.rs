//! Policy for the `expired` condition: material becomes servable the
//! moment it expires.

use async_trait::async_trait;
use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;

use crate::acme::checker::{Checker, Readiness};

pub struct ExpiredChecker;

#[async_trait]
impl Checker for ExpiredChecker {
    /// Ready exactly when the certificate expires.
    async fn check_ready(
        &self,
        leaf: &X509Certificate<'_>,
        _issuer: &X509Certificate<'_>,
    ) -> Readiness {
        let not_after = leaf.validity().not_after.to_datetime();
        if OffsetDateTime::now_utc() >= not_after {
            Readiness::Ready
        } else {
            Readiness::RetryAt(not_after, None)
        }
    }

    /// A fresh expired certificate is cut once per two lifetimes. The
    /// certs could hang around forever, but replacing them keeps fields
    /// and signatures current across profile changes.
    async fn renew_at(&self, leaf: &X509Certificate<'_>) -> OffsetDateTime {
        let validity = leaf.validity();
        let not_after = validity.not_after.to_datetime();
        not_after + (not_after - validity.not_before.to_datetime())
    }

    fn should_revoke(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod test {
    use time::Duration;
    use x509_parser::prelude::FromDer;

    use super::*;
    use crate::acme::testutil::{sign_leaf, test_ca, LeafOptions};

    #[tokio::test]
    async fn ready_exactly_at_expiry() {
        let ca = test_ca();
        let now = OffsetDateTime::now_utc();

        // Still valid: ready time is the expiry, to the second.
        let not_after = now + Duration::HOUR;
        let (der, _) = sign_leaf(
            &ca,
            "expired.example.com",
            LeafOptions {
                not_before: now - Duration::HOUR,
                not_after,
                ..LeafOptions::default()
            },
        );
        let (_, leaf) = X509Certificate::from_der(&der).unwrap();
        let (ca_der, _) = ca.cert_der_and_pem();
        let (_, issuer) = X509Certificate::from_der(&ca_der).unwrap();

        let checker = ExpiredChecker;
        match checker.check_ready(&leaf, &issuer).await {
            Readiness::RetryAt(at, None) => {
                // DER validity has second precision.
                assert_eq!(
                    at.unix_timestamp(),
                    not_after.unix_timestamp()
                );
            }
            _ => panic!("an unexpired cert should wait for its expiry"),
        }

        // Already expired: ready now.
        let (der, _) = sign_leaf(
            &ca,
            "expired.example.com",
            LeafOptions {
                not_before: now - Duration::hours(2),
                not_after: now - Duration::HOUR,
                ..LeafOptions::default()
            },
        );
        let (_, leaf) = X509Certificate::from_der(&der).unwrap();
        assert!(matches!(
            checker.check_ready(&leaf, &issuer).await,
            Readiness::Ready
        ));
    }

    #[tokio::test]
    async fn renews_one_lifetime_after_expiry() {
        let ca = test_ca();
        let not_before =
            OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let not_after = not_before + Duration::days(90);
        let (der, _) = sign_leaf(
            &ca,
            "expired.example.com",
            LeafOptions {
                not_before,
                not_after,
                ..LeafOptions::default()
            },
        );
        let (_, leaf) = X509Certificate::from_der(&der).unwrap();

        let renew_at = ExpiredChecker.renew_at(&leaf).await;
        assert_eq!(renew_at, not_after + Duration::days(90));
    }

    #[test]
    fn never_revokes() {
        assert!(!ExpiredChecker.should_revoke());
    }
}
