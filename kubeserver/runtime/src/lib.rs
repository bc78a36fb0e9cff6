//! Wires the kubeserver components into the server and agent processes.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;
mod authn;
mod router;
mod server;
mod store;
pub mod tls;


pub use self::{
    args::{AgentArgs, Fatal, ServerArgs},
    authn::{ClusterApis, Webhook},
    router::{Router, X_API_CLUSTER_ID},
    server::{bind, BindError, Bound},
    store::FileClusterStore,
};

use bytes::Bytes;
use http::{header, HeaderValue, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use kubeserver_proxy::{error_response, ProxyBody};

fn empty() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn text_response(status: StatusCode, text: &'static str) -> Response<ProxyBody> {
    let mut rsp = Response::new(full(text));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    rsp
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    let json = match serde_json::to_vec(value) {
        Ok(json) => json,
        Err(error) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalError",
                &error.to_string(),
            )
        }
    };
    let mut rsp = Response::new(full(json));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    rsp
}
