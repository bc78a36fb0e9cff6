use crate::{authn::Webhook, empty, text_response};
use bytes::Bytes;
use futures::future;
use http::{header, HeaderMap, HeaderName, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use kubeserver_core::{ClusterStore, IdentityService};
use kubeserver_proxy::{
    error_response, split_cluster_path, BoxError, ClientCache, ClusterProxy, Impersonation,
    ProxyBody, CLUSTER_PATH_PREFIX,
};
use kubeserver_tunnel::SessionManager;
use std::{convert::Infallible, sync::Arc, task};
use tracing::{debug, warn};
use url::form_urlencoded;

/// Names the cluster a webhook call concerns.
pub static X_API_CLUSTER_ID: HeaderName = HeaderName::from_static("x-api-cluster-id");

/// Dispatches requests on the HTTPS listener.
///
/// - `GET /ping` answers `pong`.
/// - `/connect` accepts agent tunnels.
/// - `/k8s/clusters/<id-or-name>/...` is proxied to the cluster's API server.
/// - `/auth` and `/auth/...` serve the `TokenReview` webhook.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

struct Inner {
    tunnels: SessionManager,
    clients: Arc<ClientCache>,
    clusters: Arc<dyn ClusterStore>,
    identity: Arc<dyn IdentityService>,
    webhook: Webhook,
}

// === impl Router ===

impl Router {
    pub fn new(
        tunnels: SessionManager,
        clients: Arc<ClientCache>,
        clusters: Arc<dyn ClusterStore>,
        identity: Arc<dyn IdentityService>,
        webhook: Webhook,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tunnels,
                clients,
                clusters,
                identity,
                webhook,
            }),
        }
    }

    async fn route<B>(self, req: Request<B>) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let path = req.uri().path();
        if path == "/ping" {
            if req.method() != Method::GET {
                return method_not_allowed(req.method());
            }
            return text_response(StatusCode::OK, "pong");
        }
        if path == "/connect" {
            return self.inner.tunnels.accept(req).map(|()| empty());
        }
        if path.starts_with(CLUSTER_PATH_PREFIX) {
            return self.proxy(req).await;
        }
        if path == "/auth" || path.starts_with("/auth/") {
            return self.authenticate(req).await;
        }
        error_response(
            StatusCode::NOT_FOUND,
            "NotFound",
            &format!("no route for {path}"),
        )
    }

    async fn proxy<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let Some((id, upstream)) = req
            .uri()
            .path_and_query()
            .and_then(|pq| split_cluster_path(pq.as_str()))
            .map(|(id, upstream)| (id.to_string(), upstream))
        else {
            return error_response(StatusCode::NOT_FOUND, "NotFound", "no cluster in path");
        };

        let Some(token) = bearer_token(req.headers()) else {
            return error_response(StatusCode::UNAUTHORIZED, "Unauthorized", "missing bearer token");
        };
        let cred = match self.inner.identity.verify(&token).await {
            Ok(cred) => cred,
            Err(error) if error.is_unavailable() => {
                warn!(%error, cluster = %id, "Identity service unavailable");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalError",
                    &error.to_string(),
                );
            }
            Err(error) => {
                debug!(%error, cluster = %id, "Rejected caller");
                return error_response(StatusCode::UNAUTHORIZED, "Unauthorized", &error.to_string());
            }
        };

        let cluster = match self
            .inner
            .clusters
            .fetch_cluster_by_id_or_name(&token, &id)
            .await
        {
            Ok(Some(cluster)) => cluster,
            Ok(None) => {
                return error_response(
                    StatusCode::NOT_FOUND,
                    "NotFound",
                    &format!("cluster {id} not found"),
                )
            }
            Err(error) => {
                warn!(%error, cluster = %id, "Failed to look up cluster");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalError",
                    &error.to_string(),
                );
            }
        };

        let client = match self.inner.clients.client(&cluster).await {
            Ok(client) => client,
            Err(error) => return error.into_response(),
        };
        let proxy = ClusterProxy::new(&cluster, client, self.inner.clients.dialer(&cluster));
        proxy
            .proxy(req, upstream, Some(Impersonation::from(&cred)))
            .await
    }

    async fn authenticate<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if req.method() != Method::POST {
            return method_not_allowed(req.method());
        }

        let cluster = req
            .headers()
            .get(&X_API_CLUSTER_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| query_param(req.uri().query()?, "cluster"))
            .filter(|c| !c.is_empty());

        let body = match req.into_body().collect().await {
            Ok(body) => body.to_bytes(),
            Err(error) => {
                let error: BoxError = error.into();
                return error_response(StatusCode::BAD_REQUEST, "BadRequest", &error.to_string());
            }
        };
        self.inner.webhook.review(body, cluster.as_deref()).await
    }
}

impl<B> tower::Service<Request<B>> for Router
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<ProxyBody>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut task::Context<'_>) -> task::Poll<Result<(), Infallible>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let router = self.clone();
        Box::pin(async move { Ok(router.route(req).await) })
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn query_param(query: &str, name: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn method_not_allowed(method: &Method) -> Response<ProxyBody> {
    error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        "MethodNotAllowed",
        &format!("method {method} not allowed"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn parses_bearer_tokens() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t1"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("t1"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer  t2 "));
        assert_eq!(bearer_token(&headers).as_deref(), Some("t2"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn finds_query_params() {
        assert_eq!(query_param("cluster=c-abc", "cluster").as_deref(), Some("c-abc"));
        assert_eq!(
            query_param("timeout=5s&cluster=prod", "cluster").as_deref(),
            Some("prod")
        );
        assert_eq!(query_param("clusters=x", "cluster"), None);
        assert_eq!(query_param("cluster", "cluster").as_deref(), Some(""));
        assert_eq!(
            query_param("cluster=c%2Fabc%20x", "cluster").as_deref(),
            Some("c/abc x")
        );
        assert_eq!(query_param("cluster=prod+east", "cluster").as_deref(), Some("prod east"));
    }
}
