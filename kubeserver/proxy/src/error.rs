use crate::{BoxError, ProxyBody};
use bytes::Bytes;
use http::{header, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use kubeserver_tunnel::DialError;
use std::error::Error as _;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no tunnel session for cluster {0}")]
    NoSession(String),

    #[error("invalid configuration for cluster {cluster}: {source}")]
    Config {
        cluster: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to read request body: {0}")]
    Body(#[source] BoxError),

    #[error("invalid upstream request: {0}")]
    Request(#[from] http::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[source] kube::Error),
}

/// The JSON document returned for failed proxy requests.
#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub status: u16,
    pub code: String,
    pub message: String,
}

// === impl ProxyError ===

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoSession(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Body(_) => StatusCode::BAD_REQUEST,
            Self::Request(_) => StatusCode::BAD_GATEWAY,
            Self::Upstream(error) => match find_dial_error(error) {
                Some(DialError::NoSession(_)) => StatusCode::SERVICE_UNAVAILABLE,
                Some(DialError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
                Some(DialError::Rejected(_) | DialError::SessionClosed) | None => {
                    StatusCode::BAD_GATEWAY
                }
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self.status() {
            StatusCode::SERVICE_UNAVAILABLE => "NoTunnelSession",
            StatusCode::GATEWAY_TIMEOUT => "GatewayTimeout",
            StatusCode::BAD_REQUEST => "BadRequest",
            StatusCode::INTERNAL_SERVER_ERROR => "InternalError",
            _ => "BadGateway",
        }
    }

    pub fn into_response(self) -> Response<ProxyBody> {
        error_response(self.status(), self.code(), &self.to_string())
    }
}

/// Finds the tunnel dial failure underlying an upstream error, if any.
fn find_dial_error(error: &kube::Error) -> Option<&DialError> {
    let mut next: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(e) = next {
        if let Some(dial) = e.downcast_ref::<DialError>() {
            return Some(dial);
        }
        next = e.source();
    }
    None
}

/// Builds a JSON error response.
pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response<ProxyBody> {
    let body = ErrorBody {
        status: status.as_u16(),
        code: code.to_string(),
        message: message.to_string(),
    };
    let json = serde_json::to_vec(&body).unwrap_or_default();
    let mut rsp = Response::new(
        Full::new(Bytes::from(json))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    rsp
}
