use crate::{BoxError, ProxyBody, ProxyError};
use bytes::Bytes;
use http::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    uri::PathAndQuery,
    Method, Request, Response, StatusCode, Version,
};
use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use kubeserver_core::{Cluster, Credential};
use kubeserver_tunnel::Dialer;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tracing::{debug, debug_span, Instrument};

/// The path prefix under which clusters are addressed: `/k8s/clusters/<id-or-name>/<kube-api-path>`.
pub const CLUSTER_PATH_PREFIX: &str = "/k8s/clusters/";

pub const IMPERSONATE_USER: HeaderName = HeaderName::from_static("impersonate-user");
pub const IMPERSONATE_GROUP: HeaderName = HeaderName::from_static("impersonate-group");

static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Headers that apply to a single connection and are not forwarded, except where needed to
/// negotiate an upgrade.
static HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

/// Forwards Kubernetes API requests to one worker cluster through its tunnel.
#[derive(Clone)]
pub struct ClusterProxy {
    cluster: String,
    client: kube::Client,
    dialer: Dialer,
}

/// How a downstream request asks to switch protocols.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Upgrade {
    /// An HTTP/1.1 `Connection: Upgrade` request, forwarded as is.
    Http1,
    /// An HTTP/2 extended CONNECT carrying the `:protocol` to switch to. The upstream API server
    /// is asked for the same protocol with an HTTP/1.1 upgrade.
    ExtendedConnect(HeaderValue),
}

/// The caller's identity, asserted to the upstream API server via impersonation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Impersonation {
    pub user: String,
    pub groups: Vec<String>,
}

/// Splits a cluster proxy path into the cluster's id or name and the upstream path and query.
///
/// Returns `None` for paths outside the cluster prefix or without a cluster segment.
pub fn split_cluster_path(path_and_query: &str) -> Option<(&str, PathAndQuery)> {
    let rest = path_and_query.strip_prefix(CLUSTER_PATH_PREFIX)?;
    let (cluster, upstream) = match rest.find(['/', '?']) {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    if cluster.is_empty() {
        return None;
    }
    let upstream = if upstream.starts_with('/') {
        upstream.to_string()
    } else {
        format!("/{upstream}")
    };
    let upstream = upstream.parse::<PathAndQuery>().ok()?;
    Some((cluster, upstream))
}

// === impl ClusterProxy ===

impl ClusterProxy {
    pub fn new(cluster: &Cluster, client: kube::Client, dialer: Dialer) -> Self {
        Self {
            cluster: cluster.id.clone(),
            client,
            dialer,
        }
    }

    /// Forwards `req` to `upstream` on the cluster's API server.
    ///
    /// Errors are rendered as JSON responses. Upgrade requests are answered with the upstream's
    /// `101 Switching Protocols`, or a `200` for HTTP/2 extended CONNECT, and the two upgraded
    /// connections are then bridged in the background.
    pub async fn proxy<B>(
        &self,
        mut req: Request<B>,
        upstream: PathAndQuery,
        caller: Option<Impersonation>,
    ) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let downstream_upgrade = upgrade_of(&req).map(|kind| (kind, hyper::upgrade::on(&mut req)));
        match self
            .forward(req, upstream, caller, downstream_upgrade)
            .await
        {
            Ok(rsp) => rsp,
            Err(error) => {
                debug!(cluster = %self.cluster, %error, "proxy request failed");
                error.into_response()
            }
        }
    }

    async fn forward<B>(
        &self,
        req: Request<B>,
        upstream: PathAndQuery,
        caller: Option<Impersonation>,
        downstream_upgrade: Option<(Upgrade, OnUpgrade)>,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if !self.dialer.has_session() {
            return Err(ProxyError::NoSession(self.cluster.clone()));
        }

        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::Body(e.into()))?
            .to_bytes();

        let mut headers = parts.headers;
        rewrite_headers(
            &mut headers,
            caller.as_ref(),
            downstream_upgrade.is_some(),
            parts.uri.scheme_str(),
        );
        let mut method = parts.method;
        if let Some((Upgrade::ExtendedConnect(protocol), _)) = &downstream_upgrade {
            method = Method::GET;
            upgrade_headers(&mut headers, protocol.clone());
        }
        let mut upstream_req = Request::builder()
            .method(method)
            .uri(upstream)
            .version(Version::HTTP_11)
            .body(kube::client::Body::from(body.to_vec()))?;
        *upstream_req.headers_mut() = headers;

        let mut rsp = self
            .client
            .send(upstream_req)
            .await
            .map_err(ProxyError::Upstream)?;

        if let Some((kind, downstream)) = downstream_upgrade {
            if rsp.status() == StatusCode::SWITCHING_PROTOCOLS {
                let upstream = hyper::upgrade::on(&mut rsp);
                let span = debug_span!("upgrade", cluster = %self.cluster);
                tokio::spawn(bridge(downstream, upstream).instrument(span));
                if kind != Upgrade::Http1 {
                    accept_extended_connect(&mut rsp);
                }
            }
        }

        Ok(rsp.map(|body| body.map_err(Into::<BoxError>::into).boxed_unsync()))
    }
}

/// Prepares downstream headers for the upstream request.
///
/// The caller's credentials and any impersonation headers are removed; the cluster's credential
/// is added by the client. When the caller's identity is known, it is asserted with impersonation
/// headers.
pub(crate) fn rewrite_headers(
    headers: &mut HeaderMap,
    caller: Option<&Impersonation>,
    upgrade: bool,
    downstream_scheme: Option<&str>,
) {
    let host = headers.remove(header::HOST);
    headers.remove(header::AUTHORIZATION);
    let impersonation = headers
        .keys()
        .filter(|name| name.as_str().starts_with("impersonate-"))
        .cloned()
        .collect::<Vec<_>>();
    for name in impersonation {
        headers.remove(name);
    }

    if !upgrade {
        for name in HOP_BY_HOP.iter() {
            headers.remove(name);
        }
        headers.remove(header::UPGRADE);
    }

    if !headers.contains_key(&X_FORWARDED_PROTO) {
        let proto = downstream_scheme.unwrap_or("https");
        if let Ok(v) = HeaderValue::from_str(proto) {
            headers.insert(X_FORWARDED_PROTO.clone(), v);
        }
    }
    if let Some(host) = host {
        headers
            .entry(X_FORWARDED_HOST.clone())
            .or_insert(host);
    }

    if let Some(caller) = caller {
        if let Ok(user) = HeaderValue::from_str(&caller.user) {
            headers.insert(IMPERSONATE_USER, user);
        }
        for group in &caller.groups {
            if let Ok(group) = HeaderValue::from_str(group) {
                headers.append(IMPERSONATE_GROUP, group);
            }
        }
    }
}

fn upgrade_of<B>(req: &Request<B>) -> Option<Upgrade> {
    if req.method() == Method::CONNECT {
        let protocol = req.extensions().get::<hyper::ext::Protocol>()?;
        return HeaderValue::from_str(protocol.as_str())
            .ok()
            .map(Upgrade::ExtendedConnect);
    }
    is_upgrade(req.headers()).then_some(Upgrade::Http1)
}

/// Turns the headers of an extended CONNECT into an HTTP/1.1 upgrade to `protocol`.
fn upgrade_headers(headers: &mut HeaderMap, protocol: HeaderValue) {
    let websocket = protocol.as_bytes().eq_ignore_ascii_case(b"websocket");
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, protocol);
    if websocket && !headers.contains_key(header::SEC_WEBSOCKET_KEY) {
        if let Ok(key) = HeaderValue::from_str(&generate_key()) {
            headers.insert(header::SEC_WEBSOCKET_KEY, key);
        }
    }
}

/// Answers an extended CONNECT with a `200` once the upstream has switched protocols.
fn accept_extended_connect<B>(rsp: &mut Response<B>) {
    *rsp.status_mut() = StatusCode::OK;
    *rsp.version_mut() = Version::HTTP_2;
    let headers = rsp.headers_mut();
    headers.remove(header::CONNECTION);
    headers.remove(header::UPGRADE);
    headers.remove(header::SEC_WEBSOCKET_ACCEPT);
}

fn is_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && headers.contains_key(header::UPGRADE)
}

async fn bridge(downstream: OnUpgrade, upstream: OnUpgrade) {
    let (downstream, upstream) = match tokio::try_join!(downstream, upstream) {
        Ok(upgraded) => upgraded,
        Err(error) => {
            debug!(%error, "upgrade failed");
            return;
        }
    };
    let mut downstream = TokioIo::new(downstream);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await {
        Ok((sent, received)) => debug!(sent, received, "upgraded connection closed"),
        Err(error) => debug!(%error, "upgraded connection failed"),
    }
}

impl From<&Credential> for Impersonation {
    fn from(cred: &Credential) -> Self {
        let groups = if cred.project_name.is_empty() {
            vec![]
        } else {
            vec![cred.project_name.clone()]
        };
        Self {
            user: cred.user_name.clone(),
            groups,
        }
    }
}
