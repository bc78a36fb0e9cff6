//! The `TokenReview` envelope exchanged with the Kubernetes API server's authentication webhook.
//!
//! `k8s-openapi` pins `TokenReview` to a single API version, while API servers may be configured to
//! send either `authentication.k8s.io/v1` or `v1beta1`. The two versions share a wire shape, so a
//! single envelope serves both and the response echoes the request's version.

use kubeserver_core::UserInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const V1: &str = "authentication.k8s.io/v1";
pub const V1BETA1: &str = "authentication.k8s.io/v1beta1";
pub const KIND: &str = "TokenReview";

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenReview {
    pub api_version: String,
    pub kind: String,

    #[serde(default)]
    pub spec: TokenReviewSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TokenReviewStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenReviewSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audiences: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenReviewStatus {
    pub authenticated: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<ReviewUser>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The user as it appears in a review status.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReviewUser {
    pub username: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidReview {
    #[error("unsupported apiVersion {0:?}; expected {V1} or {V1BETA1}")]
    UnsupportedVersion(String),

    #[error("unsupported kind {0:?}; expected {KIND}")]
    UnsupportedKind(String),
}

// === impl TokenReview ===

impl TokenReview {
    pub fn new(api_version: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: KIND.to_string(),
            spec: TokenReviewSpec {
                token: token.into(),
                audiences: vec![],
            },
            status: None,
        }
    }

    pub fn validate(&self) -> Result<(), InvalidReview> {
        if self.api_version != V1 && self.api_version != V1BETA1 {
            return Err(InvalidReview::UnsupportedVersion(self.api_version.clone()));
        }
        if self.kind != KIND {
            return Err(InvalidReview::UnsupportedKind(self.kind.clone()));
        }
        Ok(())
    }

    /// Builds the response accepting this review for `user`.
    pub fn authenticated(&self, user: UserInfo) -> Self {
        self.respond(TokenReviewStatus {
            authenticated: true,
            user: Some(user.into()),
            error: None,
        })
    }

    /// Builds the response rejecting this review.
    pub fn unauthenticated(&self, error: impl ToString) -> Self {
        self.respond(TokenReviewStatus {
            authenticated: false,
            user: None,
            error: Some(error.to_string()),
        })
    }

    fn respond(&self, status: TokenReviewStatus) -> Self {
        Self {
            api_version: self.api_version.clone(),
            kind: KIND.to_string(),
            spec: TokenReviewSpec {
                token: String::new(),
                audiences: self.spec.audiences.clone(),
            },
            status: Some(status),
        }
    }
}

impl From<UserInfo> for ReviewUser {
    fn from(user: UserInfo) -> Self {
        Self {
            username: user.name,
            uid: user.uid,
            groups: user.groups,
            extra: user.extra,
        }
    }
}
