#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod token_review;

pub use self::token_review::{
    InvalidReview, ReviewUser, TokenReview, TokenReviewSpec, TokenReviewStatus,
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{LimitRange, LimitRangeItem, LimitRangeSpec, Namespace},
        rbac::v1::{ClusterRoleBinding, RoleBinding, RoleRef, Subject},
    },
    apimachinery::pkg::api::resource::Quantity,
};
pub use kube::{
    api::{Api, ObjectMeta, PostParams, ResourceExt},
    Client, Error, Resource,
};

/// Indicates whether a Kubernetes API error carries the given HTTP status code.
pub fn is_status(error: &Error, code: u16) -> bool {
    matches!(error, Error::Api(rsp) if rsp.code == code)
}

pub fn is_not_found(error: &Error) -> bool {
    is_status(error, 404)
}

pub fn is_already_exists(error: &Error) -> bool {
    is_status(error, 409)
}
