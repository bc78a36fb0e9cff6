//! Identity service integration: token verification and role assignment snapshots.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
mod keystone;

pub use self::{
    cache::{RoleAssignmentCache, DEFAULT_REFRESH_INTERVAL},
    keystone::KeystoneClient,
};
