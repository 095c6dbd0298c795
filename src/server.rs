//! The HTTPS listener: renders a small informational page per domain and
//! fulfills TLS-ALPN-01 handshakes through the certificate cache.

use std::collections::HashMap;
use std::io;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::middleware::AddExtension;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Router};
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use axum_server::Handle;
use futures::future::BoxFuture;
use scheduler::ShutdownSignal;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::Layer;
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};

use crate::cache::CertCache;
use crate::config::{Condition, Config};
use crate::tls;

/// This server shouldn't be doing much, so requests time out quickly.
const HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

/// After shutdown, new connections are refused and existing ones get
/// this long to drain before a hard stop.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// What a domain's page should say.
struct SiteInfo {
    issuer_cn: String,
    condition: Condition,
}

#[derive(Clone)]
struct PageState {
    domains: Arc<HashMap<String, SiteInfo>>,
}

/// The SNI the handshake actually negotiated, attached to every request
/// on the connection.
#[derive(Clone)]
struct NegotiatedSni(Option<String>);

/// A [`RustlsAcceptor`] wrapper that records the negotiated SNI and
/// hands it to request handlers as an extension, so page rendering is
/// keyed by the same name certificate selection used. The Host header
/// is client-controlled and free to disagree with the handshake.
#[derive(Clone)]
struct SniAcceptor {
    inner: RustlsAcceptor,
}

impl<I, S> Accept<I, S> for SniAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, NegotiatedSni>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let (_io, connection) = stream.get_ref();
            let sni = connection.server_name().map(str::to_owned);
            let service = Extension(NegotiatedSni(sni)).layer(service);
            Ok((stream, service))
        })
    }
}

/// Serve HTTPS until the shutdown signal. Certificate selection (serving
/// and challenges both) goes through the cache's SNI resolver.
pub async fn serve(
    config: &Config,
    cache: Arc<CertCache>,
    mut shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let mut domains = HashMap::new();
    for site in &config.sites {
        for (condition, domain) in site.domains.iter() {
            domains.insert(
                domain.to_owned(),
                SiteInfo {
                    issuer_cn: site.issuer_cn.clone(),
                    condition,
                },
            );
        }
    }
    let state = PageState {
        domains: Arc::new(domains),
    };

    let mut tls_config = tls::server_config_builder()
        .with_no_client_auth()
        .with_cert_resolver(cache);
    tls_config.alpn_protocols =
        vec![tls::ALPN_HTTP1.to_vec(), tls::ALPN_ACME_TLS1.to_vec()];

    let router = Router::new()
        .route("/", get(home))
        .fallback(not_found)
        .layer(TimeoutLayer::new(HANDLER_TIMEOUT))
        .with_state(state);

    let listener = TcpListener::bind(config.listen_addr.as_str())
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!("Listening on https://{}", config.listen_addr);

    let handle = Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.recv().await;
        info!("Shutting down HTTPS listener");
        shutdown_handle.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
    });

    let acceptor = SniAcceptor {
        inner: RustlsAcceptor::new(RustlsConfig::from_config(Arc::new(
            tls_config,
        ))),
    };

    axum_server::from_tcp(listener)
        .acceptor(acceptor)
        .handle(handle)
        .serve(router.into_make_service())
        .await
        .context("HTTPS server")
}

async fn home(
    State(state): State<PageState>,
    Extension(NegotiatedSni(sni)): Extension<NegotiatedSni>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let Some(sni) = sni else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(info) = state.domains.get(&sni) else {
        // Shouldn't happen: the resolver only completes handshakes for
        // configured domains.
        warn!(%sni, "No page data for domain");
        return StatusCode::NOT_FOUND.into_response();
    };

    if wants_html(uri.query(), headers.get(header::ACCEPT)) {
        Html(html_page(&sni, info)).into_response()
    } else {
        text_page(&sni, info).into_response()
    }
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "404 Not Found")
}

/// Format selection: the query string wins, then the Accept header, and
/// plain text is the default.
fn wants_html(
    query: Option<&str>,
    accept: Option<&header::HeaderValue>,
) -> bool {
    match query {
        Some("html") => return true,
        Some("txt") => return false,
        _ => {}
    }
    accept
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"))
}

fn text_page(domain: &str, info: &SiteInfo) -> String {
    format!(
        "This is a demonstration site for {domain}.\n\
         Its certificate is intended to be {state}, chaining to {issuer}.\n",
        state = info.condition.as_str(),
        issuer = info.issuer_cn,
    )
}

fn html_page(domain: &str, info: &SiteInfo) -> String {
    let domain = escape_html(domain);
    let issuer = escape_html(&info.issuer_cn);
    format!(
        "<!DOCTYPE html>\n\
         <html lang=\"en\">\n\
         <head><meta charset=\"utf-8\"><title>{domain}</title></head>\n\
         <body>\n\
         <h1>{domain}</h1>\n\
         <p>This is a demonstration site. Its certificate is intended to\n\
         be <strong>{state}</strong>, chaining to <em>{issuer}</em>.</p>\n\
         </body>\n\
         </html>\n",
        state = info.condition.as_str(),
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod test {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn format_selection_prefers_the_query_string() {
        let html_accept = HeaderValue::from_static("text/html,*/*");
        let any_accept = HeaderValue::from_static("*/*");

        assert!(wants_html(Some("html"), None));
        assert!(!wants_html(Some("txt"), Some(&html_accept)));
        assert!(wants_html(None, Some(&html_accept)));
        assert!(!wants_html(None, Some(&any_accept)));
        assert!(!wants_html(None, None));
    }

    #[test]
    fn pages_carry_the_domain_and_state() {
        let info = SiteInfo {
            issuer_cn: "Example <X1>".to_owned(),
            condition: Condition::Revoked,
        };

        let text = text_page("revoked.example.com", &info);
        assert!(text.contains("revoked.example.com"));
        assert!(text.contains("revoked"));

        let html = html_page("revoked.example.com", &info);
        assert!(html.contains("<strong>revoked</strong>"));
        assert!(html.contains("Example &lt;X1&gt;"));
    }
}
