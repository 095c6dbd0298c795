//! The per-condition predicates consulted by the issuer state machine.

use anyhow::anyhow;
use async_trait::async_trait;
use rand::Rng;
use time::{Duration, OffsetDateTime};
use x509_parser::certificate::X509Certificate;

/// Outcome of asking whether staged material may be promoted.
pub enum Readiness {
    /// Promote now.
    Ready,
    /// Not ready yet; check again at the given time. An attached error
    /// explains a transient failure (e.g. an unreachable CRL) and is
    /// logged by the caller.
    RetryAt(OffsetDateTime, Option<anyhow::Error>),
    /// The staged material can never become ready; discard it and
    /// reissue.
    Unusable(anyhow::Error),
}

/// The behavior that differs between the valid, revoked and expired
/// conditions.
#[async_trait]
pub trait Checker: Send + Sync {
    /// When the staged `next` certificate may be promoted to `current`.
    /// `issuer` is the certificate at chain position 1, used for CRL
    /// signature verification.
    async fn check_ready(
        &self,
        leaf: &X509Certificate<'_>,
        issuer: &X509Certificate<'_>,
    ) -> Readiness;

    /// When the current certificate should be replaced.
    async fn renew_at(&self, leaf: &X509Certificate<'_>) -> OffsetDateTime;

    /// Whether a freshly issued certificate must be revoked before it is
    /// ever promoted.
    fn should_revoke(&self) -> bool;
}

/// The midpoint of the certificate's validity:
/// `not_before + (not_after - not_before) / 2`.
pub(crate) fn half_time(leaf: &X509Certificate<'_>) -> OffsetDateTime {
    let validity = leaf.validity();
    let not_before = validity.not_before.to_datetime();
    let lifetime = validity.not_after.to_datetime() - not_before;
    not_before + lifetime / 2
}

/// Uniformly random instant in `[start, end)`. An empty window picks
/// `start` exactly.
pub(crate) fn rand_time(
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> OffsetDateTime {
    let window = (end - start).whole_seconds();
    if window <= 0 {
        return start;
    }
    start + Duration::seconds(rand::thread_rng().gen_range(0..window))
}

/// `Unusable` for a leaf that outlived its validity.
pub(crate) fn expired_leaf(not_after: OffsetDateTime) -> Readiness {
    Readiness::Unusable(anyhow!("certificate expired: {not_after}"))
}
