//! Policy for the `valid` condition: the certificate must verify, and is
//! renewed on the server's ARI schedule when one is offered.

use std::sync::Arc;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};
use x509_parser::certificate::X509Certificate;

use crate::acme::checker::{
    expired_leaf, half_time, rand_time, Checker, Readiness,
};
use crate::acme::client::{AcmeClient, AriHint};

pub struct ValidChecker {
    client: Arc<dyn AcmeClient>,
}

impl ValidChecker {
    pub fn new(client: Arc<dyn AcmeClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Checker for ValidChecker {
    async fn check_ready(
        &self,
        leaf: &X509Certificate<'_>,
        _issuer: &X509Certificate<'_>,
    ) -> Readiness {
        let not_after = leaf.validity().not_after.to_datetime();
        if OffsetDateTime::now_utc() > not_after {
            return expired_leaf(not_after);
        }
        Readiness::Ready
    }

    async fn renew_at(&self, leaf: &X509Certificate<'_>) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        match self.client.renewal_info(leaf).await {
            // Without ARI, renew at 50% lifetime.
            Ok(AriHint::Unsupported) => half_time(leaf),
            Ok(AriHint::Window {
                start,
                end,
                retry_after,
            }) => {
                // A random point in the window avoids a renewal stampede
                // of many daemons against the CA.
                let renew = rand_time(start, end);
                if let Some(retry_after) = retry_after {
                    let retry = now + retry_after;
                    if renew > retry {
                        // The window is further out than the server
                        // wants us to wait before asking again.
                        info!("ARI recheck at {retry}");
                        return retry;
                    }
                }
                info!("ARI renewal at {renew}");
                renew
            }
            Err(err) => {
                warn!("Error getting renewal info: {err:#}");
                now + Duration::HOUR
            }
        }
    }

    fn should_revoke(&self) -> bool {
        false
    }
}
