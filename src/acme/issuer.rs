//! The per-domain issuance state machine.
//!
//! Each issuer drives one domain toward its intended condition: inspect
//! `current`, decide whether to renew, stage new material in `next`,
//! wait until its checker declares the material ready, promote, and
//! reschedule itself on the timer wheel. Errors never stop the loop;
//! they degrade into a delayed retry.

use std::sync::Arc;

use anyhow::{bail, Context};
use futures::future::BoxFuture;
use rand::Rng;
use scheduler::TimerWheel;
use time::{Duration, OffsetDateTime};
use tracing::{error, info, info_span, warn, Instrument};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::acme::checker::{Checker, Readiness};
use crate::acme::client::{AcmeClient, OrderSpec, RevocationReason};
use crate::cache::CertCache;
use crate::config::{Condition, KeyType};
use crate::storage::{CertifiedPair, Store};

/// Delay before retrying after an issuance failure.
const RETRY_DELAY: Duration = Duration::HOUR;

/// Upper bound of the random delay before each issuer's first run, so N
/// domains don't hit the CA simultaneously at boot.
const STARTUP_JITTER: std::time::Duration = std::time::Duration::from_secs(60);

pub struct Issuer {
    pub(crate) domain: String,
    pub(crate) condition: Condition,
    pub(crate) issuer_cn: String,
    pub(crate) key_type: KeyType,
    pub(crate) profile: Option<String>,

    pub(crate) checker: Box<dyn Checker>,
    pub(crate) client: Arc<dyn AcmeClient>,
    pub(crate) cache: Arc<CertCache>,
    pub(crate) store: Arc<Store>,
    pub(crate) wheel: TimerWheel,
}

impl Issuer {
    /// Schedule this issuer's first run at a random offset within the
    /// startup jitter window.
    pub fn spawn(self: Arc<Self>) {
        let jitter = rand::thread_rng()
            .gen_range(std::time::Duration::ZERO..STARTUP_JITTER);
        let wheel = self.wheel.clone();
        wheel.run_in(jitter, self.start_task());
    }

    /// A boxed run of [`Issuer::start`], resubmittable to the timer
    /// wheel. Boxing breaks the type cycle of a task that schedules
    /// itself.
    fn start_task(self: Arc<Self>) -> BoxFuture<'static, ()> {
        let span = info_span!(
            "issuer",
            domain = %self.domain,
            condition = self.condition.as_str(),
        );
        Box::pin(async move { self.start().await }.instrument(span))
    }

    /// One pass of the state machine. Always ends by rescheduling
    /// itself, never by giving up.
    pub(crate) async fn start(self: Arc<Self>) {
        info!("Checking certificate");

        // If the current slot is unreadable we simply renew now.
        let renew_at = match self.store.read_current(&self.domain) {
            Ok(pair) => match self.renew_time(&pair).await {
                Ok(at) => Some(at),
                Err(err) => {
                    error!("Inspecting current certificate: {err:#}");
                    None
                }
            },
            Err(err) => {
                info!("No usable current certificate: {err:#}");
                None
            }
        };

        let now = OffsetDateTime::now_utc();
        let next_run = match renew_at {
            Some(at) if now < at => {
                info!("Scheduling renewal at {at}");
                at
            }
            _ => match self.issue().await {
                Ok(rerun_at) => rerun_at,
                Err(err) => {
                    error!("Issuing new certificate; will retry: {err:#}");
                    now + RETRY_DELAY
                }
            },
        };

        let wheel = self.wheel.clone();
        run_at_wallclock(&wheel, next_run, self.start_task());
    }

    async fn renew_time(
        &self,
        pair: &CertifiedPair,
    ) -> anyhow::Result<OffsetDateTime> {
        let (_, leaf) = X509Certificate::from_der(pair.leaf_der())
            .context("parsing current leaf")?;
        Ok(self.checker.renew_at(&leaf).await)
    }

    /// Stage, verify and promote the next certificate. Returns the time
    /// `start` should run again.
    async fn issue(&self) -> anyhow::Result<OffsetDateTime> {
        // A half-done previous run left material behind; reuse it.
        let next = match self.store.read_next(&self.domain) {
            Ok(pair) => pair,
            Err(err) => {
                info!("No staged certificate, issuing: {err:#}");
                self.issue_next().await?
            }
        };

        // CRL verification for the revoked condition needs the issuer
        // certificate, so a bare leaf cannot be promoted.
        if next.chain_len() < 2 {
            bail!("no issuer certificate: chain length {}", next.chain_len());
        }
        let (_, leaf) = X509Certificate::from_der(next.leaf_der())
            .context("parsing staged leaf")?;
        let issuer_der =
            next.issuer_der().expect("chain length checked above");
        let (_, issuer) = X509Certificate::from_der(issuer_der)
            .context("parsing issuer certificate")?;

        match self.checker.check_ready(&leaf, &issuer).await {
            Readiness::Ready => {
                self.take_next()?;
                info!("Certificate issuance completed");
                // Restart immediately: the fresh `current` yields the
                // real renewal time.
                Ok(OffsetDateTime::now_utc())
            }
            Readiness::RetryAt(at, maybe_err) => {
                match maybe_err {
                    Some(err) => warn!(
                        "Readiness check failed; rechecking at {at}: {err:#}"
                    ),
                    None => info!("Not ready; rechecking at {at}"),
                }
                Ok(at)
            }
            Readiness::Unusable(err) => {
                self.issue_next().await?;
                // Surface the original problem. The caller logs it and
                // retries; the retry finds the fresh staging.
                Err(err.context("staged certificate unusable"))
            }
        }
    }

    /// Run the ACME order for a fresh `next` certificate, revoking it
    /// first when the condition calls for it.
    async fn issue_next(&self) -> anyhow::Result<CertifiedPair> {
        info!("Issuing new certificate");

        let key = self
            .store
            .store_next_key(&self.domain, self.key_type)
            .context("storing next key")?;

        let chain_pem = self
            .client
            .obtain(OrderSpec {
                domain: &self.domain,
                profile: self.profile.as_deref(),
                issuer_cn: &self.issuer_cn,
                key: &key,
            })
            .await
            .context("obtaining certificate")?;

        if self.checker.should_revoke() {
            // Revoked before it is ever promoted. keyCompromise is the
            // reason browsers honor.
            self.client
                .revoke(&chain_pem, RevocationReason::KeyCompromise)
                .await
                .context("revoking certificate")?;
            info!("Certificate revoked");
        }

        self.store
            .store_next_cert(&self.domain, &chain_pem)
            .context("storing next certificate")?;
        info!("Next certificate issued");

        self.store
            .read_next(&self.domain)
            .context("re-reading staged certificate")
    }

    fn take_next(&self) -> anyhow::Result<()> {
        self.store
            .take_next(&self.domain)
            .context("promoting staged certificate")?;
        self.cache
            .load_certificate(&self.domain)
            .context("loading promoted certificate")?;
        Ok(())
    }
}

/// Schedule a task onto the wheel by wall-clock target. Targets in the
/// past run immediately.
fn run_at_wallclock(
    wheel: &TimerWheel,
    at: OffsetDateTime,
    task: BoxFuture<'static, ()>,
) {
    let delay = at - OffsetDateTime::now_utc();
    let delay = std::time::Duration::try_from(delay).unwrap_or_default();
    wheel.run_in(delay, task);
}
