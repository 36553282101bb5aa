// Copyright the runsd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The rewriting reverse proxy.
//!
//! The child's HTTP requests land here via the DNS hijack. Each request is
//! rewritten to the canonical Cloud Run hostname, an identity token scoped to
//! that host is injected, and the request leaves over HTTPS. Bodies stream
//! frame-at-a-time in both directions; upgrades (WebSocket) are relayed by
//! joining the two upgraded streams.

use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use once_cell::sync::Lazy;
use tokio::net::TcpListener;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::hyper_util::{plaintext_response, Body};
use crate::metadata::TokenSource;
use crate::{metadata, names, version};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to bind to address {0}: {1}")]
    Bind(SocketAddr, #[source] io::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("loading TLS roots: {0}")]
    TlsRoots(#[source] io::Error),
}

/// A per-request failure, rendered as a local error response. Nothing here
/// ever falls through to an unauthenticated upstream call.
#[derive(thiserror::Error, Debug)]
enum RequestError {
    #[error("runsd doesn't know how to handle host {host:?}: {source}")]
    Rewrite {
        host: String,
        #[source]
        source: names::Error,
    },

    #[error("failed to fetch identity token: {0}")]
    Token(#[from] metadata::Error),

    #[error("request has no Host header or authority")]
    MissingHost,

    #[error("building upstream request: {0}")]
    BadRequest(#[from] hyper::http::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
}

impl RequestError {
    fn status(&self) -> StatusCode {
        match self {
            // Connection-level upstream failures surface as a bad gateway,
            // everything else is a local 500 with context.
            RequestError::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn into_response(self) -> Response<Body> {
        plaintext_response(self.status(), format!("{self:#}\n"))
    }
}

/// The rewriting reverse proxy server: one listener per loopback family.
pub struct Server {
    binds: Vec<TcpListener>,
    ctx: Arc<Context>,
}

struct Context {
    cfg: Arc<Config>,
    tokens: Arc<dyn TokenSource>,
    client: hyper_util::client::legacy::Client<HttpsConnector<HttpConnector>, Incoming>,
}

impl Server {
    pub async fn bind(cfg: Arc<Config>, tokens: Arc<dyn TokenSource>) -> Result<Self, Error> {
        let client = crate::hyper_util::https_client().map_err(Error::TlsRoots)?;

        let mut binds = Vec::new();
        for addr in listen_addrs(&cfg) {
            binds.push(
                TcpListener::bind(addr)
                    .await
                    .map_err(|e| Error::Bind(addr, e))?,
            );
        }

        Ok(Self {
            binds,
            ctx: Arc::new(Context {
                cfg,
                tokens,
                client,
            }),
        })
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.binds
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Serves until a listener fails. Returning at all is fatal to runsd.
    pub async fn run(self) -> Result<(), Error> {
        let loops = self
            .binds
            .into_iter()
            .map(|listener| Box::pin(accept_loop(listener, self.ctx.clone())))
            .collect::<Vec<_>>();
        let (result, _, _) = futures_util::future::select_all(loops).await;
        result
    }
}

fn listen_addrs(cfg: &Config) -> Vec<SocketAddr> {
    let mut addrs = vec![SocketAddr::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        cfg.http_proxy_port,
    )];
    if cfg.serve_ipv6 {
        addrs.push(SocketAddr::new(
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            cfg.http_proxy_port,
        ));
    }
    addrs
}

async fn accept_loop(listener: TcpListener, ctx: Arc<Context>) -> Result<(), Error> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(ctx.clone(), peer, req));
            // The auto builder speaks HTTP/1.1 and h2c on the same listener,
            // with upgrade support for WebSockets.
            let served = auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await;
            if let Err(e) = served {
                debug!(%peer, error = %e, "connection closed with error");
            }
        });
    }
}

async fn handle(
    ctx: Arc<Context>,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Body>, Infallible> {
    match proxy(&ctx, peer, req).await {
        Ok(resp) => Ok(resp),
        Err(e) => {
            warn!("proxy request failed: {e:#}");
            Ok(e.into_response())
        }
    }
}

async fn proxy(
    ctx: &Context,
    peer: SocketAddr,
    mut req: Request<Incoming>,
) -> Result<Response<Body>, RequestError> {
    let cfg = &ctx.cfg;

    // The request arrived via DNS rewrite, so its target is relative; the
    // Host header (or :authority on h2) names the service.
    let host = request_host(&req).ok_or(RequestError::MissingHost)?;
    let canonical = names::resolve_canonical_host(
        &cfg.internal_zone,
        &host,
        &cfg.current_region,
        &cfg.project_hash,
    )
    .map_err(|source| RequestError::Rewrite {
        host: host.clone(),
        source,
    })?;

    let token = ctx
        .tokens
        .identity_token(&format!("https://{canonical}"))
        .await?;

    // Keep the client's upgrade handle before the request is consumed, so a
    // 101 from upstream can be relayed.
    let client_upgrade = req.extensions_mut().remove::<OnUpgrade>();
    let outbound = prepare_upstream_request(req, &canonical, &token, peer.ip())?;

    debug!(host = %host, upstream = %canonical, method = %outbound.method(), "proxying request");
    for (name, value) in outbound.headers() {
        trace!(header = %name, value = ?value, "upstream request header");
    }

    let mut resp = ctx.client.request(outbound).await?;
    debug!(upstream = %canonical, status = %resp.status(), "upstream responded");

    if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let upstream_upgrade = hyper::upgrade::on(&mut resp);
            tokio::spawn(relay_upgrade(client_upgrade, upstream_upgrade));
        }
    } else {
        strip_hop_by_hop(resp.headers_mut());
    }

    Ok(resp.map(|body| body.boxed()))
}

/// Rewrites a client request into the upstream form: HTTPS scheme, canonical
/// authority and Host, bearer token (unless the caller brought its own),
/// tagged User-Agent, hop-by-hop hygiene, appended X-Forwarded-For.
fn prepare_upstream_request<B>(
    req: Request<B>,
    canonical: &str,
    token: &str,
    client_ip: IpAddr,
) -> Result<Request<B>, RequestError> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = Uri::builder()
        .scheme("https")
        .authority(canonical)
        .path_and_query(path_and_query)
        .build()?;

    let upgrade = upgrade_type(&parts.headers);
    strip_hop_by_hop(&mut parts.headers);
    if let Some(upgrade) = upgrade {
        parts
            .headers
            .insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        parts.headers.insert(header::UPGRADE, upgrade);
    }

    parts.headers.insert(
        header::HOST,
        HeaderValue::from_str(canonical).map_err(hyper::http::Error::from)?,
    );
    if !parts.headers.contains_key(header::AUTHORIZATION) {
        parts.headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(hyper::http::Error::from)?,
        );
    }

    let user_agent = match parts
        .headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
    {
        Some(original) if !original.is_empty() => {
            format!("runsd version={}; {original}", version::VERSION)
        }
        _ => format!("runsd version={}", version::VERSION),
    };
    parts.headers.insert(
        header::USER_AGENT,
        HeaderValue::from_str(&user_agent).map_err(hyper::http::Error::from)?,
    );

    append_forwarded_for(&mut parts.headers, client_ip);

    parts.uri = uri;
    // Let the pooled connection decide between HTTP/1.1 and HTTP/2; the
    // inbound version is irrelevant upstream.
    parts.version = Version::HTTP_11;

    Ok(Request::from_parts(parts, body))
}

/// The host the client addressed: the h2 `:authority` when present, else the
/// Host header with any port stripped.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.host().to_ascii_lowercase());
    }
    let host = req.headers().get(header::HOST)?.to_str().ok()?;
    Some(strip_port(host).to_ascii_lowercase())
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(host);
    }
    match host.rsplit_once(':') {
        Some((h, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => h,
        _ => host,
    }
}

static HOP_BY_HOP: Lazy<[HeaderName; 7]> = Lazy::new(|| {
    [
        header::CONNECTION,
        HeaderName::from_static("proxy-connection"),
        HeaderName::from_static("keep-alive"),
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ]
});

static X_FORWARDED_FOR: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-forwarded-for"));

/// Removes hop-by-hop headers, both the fixed set and anything named by the
/// Connection header. `TE: trailers` survives because gRPC needs it.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let te_trailers = headers
        .get(header::TE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("trailers")));

    for name in connection_named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }

    if te_trailers {
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
    }
}

/// `Connection: Upgrade` requests keep their upgrade intent; everything else
/// loses the pair along with the other hop-by-hop headers.
fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
    let connection = headers.get(header::CONNECTION)?.to_str().ok()?;
    if connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    {
        headers.get(header::UPGRADE).cloned()
    } else {
        None
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let value = match headers
        .get(&*X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) => format!("{prior}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(&*X_FORWARDED_FOR, value);
    }
}

/// Joins the two upgraded streams of a 101 response until either side
/// closes.
async fn relay_upgrade(client: OnUpgrade, upstream: OnUpgrade) {
    let (client_io, upstream_io) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "connection upgrade failed");
            return;
        }
    };
    let mut client_io = TokioIo::new(client_io);
    let mut upstream_io = TokioIo::new(upstream_io);
    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
        Ok((up, down)) => debug!(bytes_up = up, bytes_down = down, "upgraded stream closed"),
        Err(e) => debug!(error = %e, "upgraded stream aborted"),
    }
}
