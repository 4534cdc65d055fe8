//! Gateway HTTP application: proxy router and control endpoints.
//!
//! Serves the demultiplexed non-SSH connections. A request resolves to a
//! tunnel either by the `/proxy/<name>/` path prefix or by the leftmost
//! Host label under the gateway's base hostname; both forms land on the
//! same registry lookup. Resolved requests stream through the tunnel's
//! reverse-forwarded channel; everything else is the small control surface
//! (`/login`, `/profiles/<thumbprint>/tunnels`, `/healthz`).

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::header::{
    HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, ETAG, IF_MATCH,
    IF_NONE_MATCH, LOCATION, SET_COOKIE,
};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::auth::{extract_cookie, urldecode, SessionManager};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::inject::{
    decorate_etag, etag_suffix, render_tags, strip_conditional, ContentCoder, InjectTransform,
};
use crate::registry::ActiveTunnelEntry;
use crate::ssh::{Registry, TunnelChannelOpener};
use crate::tunnel::Access;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// How a request routes after name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedRoute {
    /// Proxy to a tunnel; `path_override` is set when the `/proxy/` prefix
    /// was stripped.
    Tunnel {
        name: String,
        path_override: Option<String>,
    },
    /// Not a tunnel request: the gateway's own endpoints.
    Local,
}

/// Resolve a request to a tunnel name.
///
/// Order: `/proxy/<name>/...` path prefix first, then the Host header's
/// leftmost label when the remainder matches the base hostname. Both forms
/// yield the same name for the same tunnel.
pub fn resolve_route(path_and_query: &str, host: Option<&str>, base_hostname: &str) -> ResolvedRoute {
    if let Some(rest) = path_and_query.strip_prefix("/proxy/") {
        let (name, remainder) = match rest.find(['/', '?']) {
            Some(idx) => {
                let (name, tail) = rest.split_at(idx);
                let tail = if tail.starts_with('?') {
                    format!("/{}", tail)
                } else {
                    tail.to_string()
                };
                (name, tail)
            }
            None => (rest, "/".to_string()),
        };
        if !name.is_empty() {
            return ResolvedRoute::Tunnel {
                name: name.to_string(),
                path_override: Some(remainder),
            };
        }
    }

    if let Some(host) = host {
        let host = host.split(':').next().unwrap_or(host);
        if let Some(label) = host.strip_suffix(base_hostname) {
            if let Some(label) = label.strip_suffix('.') {
                if !label.is_empty() && !label.contains('.') {
                    return ResolvedRoute::Tunnel {
                        name: label.to_string(),
                        path_override: None,
                    };
                }
            }
        }
    }

    ResolvedRoute::Local
}

/// Check a request's session against a forward's access level.
fn authorize(
    sessions: &SessionManager,
    access: Access,
    env_id: &str,
    thumbprint: &str,
    cookie_header: Option<&str>,
) -> Result<(), GatewayError> {
    if access == Access::Public {
        return Ok(());
    }

    let cookie_name = SessionManager::cookie_name(thumbprint);
    let value = cookie_header
        .and_then(|h| extract_cookie(h, &cookie_name))
        .ok_or_else(|| GatewayError::Unauthorized("no session".into()))?;

    sessions.verify_scoped(value, env_id, thumbprint)?;
    Ok(())
}

/// Streaming body fed by the injection task; the bounded channel carries
/// the origin's backpressure through to the client.
struct ChannelBody {
    rx: mpsc::Receiver<Result<Frame<Bytes>, BoxError>>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        self.rx.poll_recv(cx)
    }
}

fn full_body(content: impl Into<Bytes>) -> ProxyBody {
    Full::new(content.into())
        .map_err(|never| match never {})
        .boxed()
}

fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(format!("{}\n", message)));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    resp
}

fn json_response(value: &impl serde::Serialize) -> Response<ProxyBody> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut resp = Response::new(full_body(body));
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn redirect_response(location: &str, set_cookie: Option<String>) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(""));
    *resp.status_mut() = StatusCode::TEMPORARY_REDIRECT;
    if let Ok(value) = HeaderValue::from_str(location) {
        resp.headers_mut().insert(LOCATION, value);
    }
    if let Some(cookie) = set_cookie {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            resp.headers_mut().insert(SET_COOKIE, value);
        }
    }
    resp
}

fn error_response(err: &GatewayError) -> Response<ProxyBody> {
    match err {
        GatewayError::Internal(cause) => warn!("Internal error: {:#}", cause),
        GatewayError::Upstream(msg) => warn!("Upstream error: {}", msg),
        GatewayError::UnsupportedEncoding(enc) => {
            warn!("Content injection misconfiguration: unsupported encoding '{}'", enc)
        }
        other => debug!("Request failed: {}", other),
    }
    text_response(err.status_code(), &err.public_message())
}

/// The gateway's HTTP application.
#[derive(Clone)]
pub struct HttpApp {
    config: Arc<GatewayConfig>,
    registry: Arc<Registry>,
    sessions: Arc<SessionManager>,
}

impl HttpApp {
    pub fn new(
        config: Arc<GatewayConfig>,
        registry: Arc<Registry>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            config,
            registry,
            sessions,
        }
    }

    /// Serve one demultiplexed connection until it closes.
    pub async fn serve_connection<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let app = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let app = app.clone();
            async move {
                let resp = match app.handle(req, peer).await {
                    Ok(resp) => resp,
                    Err(err) => error_response(&err),
                };
                Ok::<_, std::convert::Infallible>(resp)
            }
        });

        if let Err(e) = auto::Builder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(TokioIo::new(stream), service)
            .await
        {
            debug!("HTTP connection from {} ended: {}", peer, e);
        }
    }

    async fn handle(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, GatewayError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_owned);

        match resolve_route(&path_and_query, host.as_deref(), &self.config.base_hostname) {
            ResolvedRoute::Tunnel {
                name,
                path_override,
            } => {
                self.handle_tunnel(name, path_override, req, host.as_deref(), peer)
                    .await
            }
            ResolvedRoute::Local => self.handle_local(req).await,
        }
    }

    async fn handle_tunnel(
        &self,
        name: String,
        path_override: Option<String>,
        req: Request<Incoming>,
        host: Option<&str>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, GatewayError> {
        let (entry, forward) = self
            .registry
            .resolve_name(&name)
            .ok_or_else(|| GatewayError::NotFound(format!("unknown tunnel '{}'", name)))?;

        let effective_path = path_override
            .clone()
            .unwrap_or_else(|| {
                req.uri()
                    .path_and_query()
                    .map(|pq| pq.as_str().to_string())
                    .unwrap_or_else(|| "/".to_string())
            });

        // The gateway intercepts /login on tunnel hosts so the session
        // cookie can be set on the environment's own subdomain.
        if path_override.is_none() && req.uri().path() == "/login" {
            return self.handle_tunnel_login(&entry, req, host);
        }

        let cookie_header = req
            .headers()
            .get(COOKIE)
            .and_then(|h| h.to_str().ok())
            .map(str::to_owned);

        if let Err(err) = authorize(
            &self.sessions,
            forward.access,
            &entry.env_id,
            &entry.thumbprint,
            cookie_header.as_deref(),
        ) {
            // Unauthenticated (not mis-scoped) requests bounce to the
            // login flow when one is configured.
            if matches!(err, GatewayError::Unauthorized(_)) {
                let tunnel_host = host.unwrap_or(&self.config.base_hostname);
                let return_to = format!(
                    "https://{}/login?env={}&returnPath={}",
                    tunnel_host,
                    crate::auth::urlencode(&entry.env_id),
                    crate::auth::urlencode(&effective_path),
                );
                if let Some(login_url) = self.sessions.login_redirect(&entry.env_id, &return_to) {
                    return Ok(redirect_response(&login_url, None));
                }
            }
            return Err(err);
        }

        self.proxy(entry, forward, path_override, req, peer).await
    }

    /// Sets the session cookie on the tunnel's subdomain and redirects to
    /// the original path. Without a token, bounces to the SaaS login flow.
    fn handle_tunnel_login(
        &self,
        entry: &ActiveTunnelEntry<TunnelChannelOpener>,
        req: Request<Incoming>,
        host: Option<&str>,
    ) -> Result<Response<ProxyBody>, GatewayError> {
        let query = req.uri().query().unwrap_or("");
        let mut token = None;
        let mut return_path = "/".to_string();
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("token", v)) => token = Some(urldecode(v)),
                Some(("returnPath", v)) => return_path = urldecode(v),
                _ => {}
            }
        }

        let tunnel_host = host
            .map(|h| h.split(':').next().unwrap_or(h).to_string())
            .unwrap_or_else(|| self.config.base_hostname.clone());

        match token {
            Some(token) => {
                // The identity provider minted this token with the shared
                // secret; re-scope it into a session cookie.
                let claims = self
                    .sessions
                    .verify_scoped(&token, &entry.env_id, &entry.thumbprint)?;
                let session = self.sessions.claims_for(&claims.profile, &claims.env_id);
                let cookie = self.sessions.set_cookie(&session, &tunnel_host);
                Ok(redirect_response(&return_path, Some(cookie)))
            }
            None => {
                let return_to = format!(
                    "https://{}/login?env={}&returnPath={}",
                    tunnel_host,
                    crate::auth::urlencode(&entry.env_id),
                    crate::auth::urlencode(&return_path),
                );
                match self.sessions.login_redirect(&entry.env_id, &return_to) {
                    Some(url) => Ok(redirect_response(&url, None)),
                    None => Err(GatewayError::Unauthorized(
                        "no login flow configured".into(),
                    )),
                }
            }
        }
    }

    /// The gateway's own endpoints on the base hostname.
    async fn handle_local(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, GatewayError> {
        let path = req.uri().path().to_string();

        if path == "/healthz" {
            return Ok(text_response(StatusCode::OK, "ok"));
        }

        if let Some(rest) = path.strip_prefix("/profiles/") {
            if let Some(thumbprint) = rest.strip_suffix("/tunnels") {
                return self.handle_profile_tunnels(thumbprint, &req);
            }
        }

        if path == "/login" {
            // Without a tunnel host there is no subdomain to scope a
            // cookie to; hand the caller to the SaaS flow if possible.
            let query = req.uri().query().unwrap_or("");
            let env = query.split('&').find_map(|p| {
                p.split_once('=')
                    .filter(|(k, _)| *k == "env")
                    .map(|(_, v)| urldecode(v))
            });
            let env = env.ok_or_else(|| GatewayError::BadRequest("missing env".into()))?;
            let entry = self
                .registry
                .get(&env)
                .ok_or_else(|| GatewayError::NotFound(format!("unknown environment '{}'", env)))?;
            let host = entry.hostname.clone().unwrap_or_else(|| {
                format!("{}.{}", env, self.config.base_hostname)
            });
            let return_to = format!("https://{}/login", host);
            return match self.sessions.login_redirect(&env, &return_to) {
                Some(url) => Ok(redirect_response(&url, None)),
                None => Err(GatewayError::Unauthorized("no login flow configured".into())),
            };
        }

        Err(GatewayError::NotFound(format!("no route for {}", path)))
    }

    /// List a profile's live tunnels; requires a session for that profile.
    fn handle_profile_tunnels(
        &self,
        thumbprint: &str,
        req: &Request<Incoming>,
    ) -> Result<Response<ProxyBody>, GatewayError> {
        let cookie_name = SessionManager::cookie_name(thumbprint);
        let value = req
            .headers()
            .get(COOKIE)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| extract_cookie(h, &cookie_name))
            .ok_or_else(|| GatewayError::Unauthorized("no session".into()))?;

        let claims = self.sessions.verify(value)?;
        if claims.profile != thumbprint {
            return Err(GatewayError::Forbidden(
                "session not valid for this profile".into(),
            ));
        }

        let tunnels = self.registry.list_tunnels(thumbprint);
        Ok(json_response(&tunnels))
    }

    /// Stream a request through the tunnel's forwarded channel.
    async fn proxy(
        &self,
        entry: Arc<ActiveTunnelEntry<TunnelChannelOpener>>,
        forward: crate::tunnel::ForwardSpec,
        path_override: Option<String>,
        mut req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, GatewayError> {
        if let Some(path) = path_override {
            *req.uri_mut() = Uri::try_from(path.as_str())
                .map_err(|_| GatewayError::BadRequest(format!("bad path '{}'", path)))?;
        }

        let tags = render_tags(&forward.injects);
        let suffix = (!forward.injects.is_empty()).then(|| etag_suffix(&tags));

        // Conditional headers must reach the origin with the origin's own
        // ETags.
        if let Some(suffix) = &suffix {
            for header in [IF_MATCH, IF_NONE_MATCH] {
                if let Some(value) = req.headers().get(&header).and_then(|v| v.to_str().ok()) {
                    let restored = strip_conditional(value, suffix);
                    if let Ok(v) = HeaderValue::from_str(&restored) {
                        req.headers_mut().insert(header, v);
                    }
                }
            }
        }

        let stream = entry
            .opener
            .open(&forward.external_name, peer)
            .await
            .map_err(|e| GatewayError::Upstream(format!("channel open failed: {e:#}")))?;

        let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
            .handshake(TokioIo::new(stream))
            .await
            .map_err(|e| GatewayError::Upstream(format!("origin handshake failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Origin connection ended: {}", e);
            }
        });

        // Pull the client's upgrade handle out before the request moves on.
        let client_upgrade = hyper::upgrade::on(&mut req);

        let mut resp = sender
            .send_request(req)
            .await
            .map_err(|e| GatewayError::Upstream(format!("origin request failed: {e}")))?;

        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            let server_upgrade = hyper::upgrade::on(&mut resp);
            tokio::spawn(async move {
                match tokio::try_join!(client_upgrade, server_upgrade) {
                    Ok((client, origin)) => {
                        let mut client = TokioIo::new(client);
                        let mut origin = TokioIo::new(origin);
                        if let Err(e) =
                            tokio::io::copy_bidirectional(&mut client, &mut origin).await
                        {
                            debug!("Upgraded stream ended: {}", e);
                        }
                    }
                    Err(e) => debug!("Upgrade failed: {}", e),
                }
            });
            return Ok(resp.map(|b| b.map_err(BoxError::from).boxed()));
        }

        let is_html = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/html"));

        if let Some(suffix) = suffix {
            if is_html {
                return inject_response(resp, &tags, &suffix);
            }
        }

        Ok(resp.map(|b| b.map_err(BoxError::from).boxed()))
    }
}

/// Rewrite an HTML response body with the tunnel's script tags, keeping
/// the content coding and decorating the ETag.
fn inject_response(
    resp: Response<Incoming>,
    tags: &str,
    suffix: &str,
) -> Result<Response<ProxyBody>, GatewayError> {
    let (mut parts, mut body) = resp.into_parts();

    let coder = ContentCoder::parse(
        parts
            .headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok()),
    )?;

    // Length changes; let the transfer re-chunk.
    parts.headers.remove(CONTENT_LENGTH);

    if let Some(etag) = parts.headers.get(ETAG).and_then(|v| v.to_str().ok()) {
        let decorated = decorate_etag(etag, suffix);
        if let Ok(v) = HeaderValue::from_str(&decorated) {
            parts.headers.insert(ETAG, v);
        }
    }

    let mut transform = InjectTransform::new(coder, tags);
    let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, BoxError>>(8);

    tokio::spawn(async move {
        loop {
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        match transform.push(data) {
                            Ok(out) if out.is_empty() => {}
                            Ok(out) => {
                                if tx.send(Ok(Frame::data(Bytes::from(out)))).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(Err(BoxError::from(e))).await;
                                return;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    let _ = tx.send(Err(BoxError::from(e))).await;
                    return;
                }
                None => break,
            }
        }
        match transform.finish() {
            Ok(out) => {
                if !out.is_empty() {
                    let _ = tx.send(Ok(Frame::data(Bytes::from(out)))).await;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(BoxError::from(e))).await;
            }
        }
    });

    Ok(Response::from_parts(parts, ChannelBody { rx }.boxed()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path_and_subdomain_agree() {
        let base = "tunnel.example.com";

        let by_path = resolve_route("/proxy/my-tunnel/foo", Some("tunnel.example.com"), base);
        let by_host = resolve_route("/foo", Some("my-tunnel.tunnel.example.com"), base);

        match (by_path, by_host) {
            (
                ResolvedRoute::Tunnel {
                    name: a,
                    path_override: Some(p),
                },
                ResolvedRoute::Tunnel {
                    name: b,
                    path_override: None,
                },
            ) => {
                assert_eq!(a, "my-tunnel");
                assert_eq!(b, "my-tunnel");
                assert_eq!(p, "/foo");
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
    }

    #[test]
    fn test_resolve_path_prefix_variants() {
        let base = "t.example.com";
        assert_eq!(
            resolve_route("/proxy/web-env1", None, base),
            ResolvedRoute::Tunnel {
                name: "web-env1".into(),
                path_override: Some("/".into())
            }
        );
        assert_eq!(
            resolve_route("/proxy/web-env1/a/b?q=1", None, base),
            ResolvedRoute::Tunnel {
                name: "web-env1".into(),
                path_override: Some("/a/b?q=1".into())
            }
        );
        assert_eq!(
            resolve_route("/proxy/web-env1?q=1", None, base),
            ResolvedRoute::Tunnel {
                name: "web-env1".into(),
                path_override: Some("/?q=1".into())
            }
        );
        assert_eq!(resolve_route("/proxy/", None, base), ResolvedRoute::Local);
    }

    #[test]
    fn test_resolve_host_variants() {
        let base = "t.example.com";

        // Port is ignored.
        assert_eq!(
            resolve_route("/", Some("web-env1.t.example.com:8443"), base),
            ResolvedRoute::Tunnel {
                name: "web-env1".into(),
                path_override: None
            }
        );
        // Base host itself is local.
        assert_eq!(resolve_route("/", Some("t.example.com"), base), ResolvedRoute::Local);
        // Unrelated hosts and nested labels are local.
        assert_eq!(resolve_route("/", Some("other.com"), base), ResolvedRoute::Local);
        assert_eq!(
            resolve_route("/", Some("a.b.t.example.com"), base),
            ResolvedRoute::Local
        );
        // Absent host is local.
        assert_eq!(resolve_route("/", None, base), ResolvedRoute::Local);
    }

    #[test]
    fn test_authorize_levels() {
        let sessions = SessionManager::new(b"secret", None, 3600);

        // Public: no session needed.
        assert!(authorize(&sessions, Access::Public, "env1", "tp1", None).is_ok());

        // Private without a cookie: unauthorized.
        let err = authorize(&sessions, Access::Private, "env1", "tp1", None).unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized(_)));

        // Private with a valid scoped session: ok.
        let claims = sessions.claims_for("tp1", "env1");
        let cookie = format!("preevy-tp1={}", sessions.sign(&claims));
        assert!(authorize(&sessions, Access::Private, "env1", "tp1", Some(&cookie)).is_ok());

        // Session for another environment: forbidden, never downgraded.
        let err =
            authorize(&sessions, Access::Private, "env2", "tp1", Some(&cookie)).unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }
}
