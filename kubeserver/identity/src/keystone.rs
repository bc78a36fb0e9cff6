use kubeserver_core::{Credential, IdentityError, IdentityService, RoleAssignment};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const AUTH_TOKEN: &str = "x-auth-token";
const SUBJECT_TOKEN: &str = "x-subject-token";

/// A client for a Keystone-compatible identity API (v3).
///
/// Requests are authorized with an administrative token; tokens under review are passed as the
/// subject token.
#[derive(Clone, Debug)]
pub struct KeystoneClient {
    base: Url,
    admin_token: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: Token,
}

#[derive(Debug, Deserialize)]
struct Token {
    user: User,
    #[serde(default)]
    project: Option<Named>,
    #[serde(default)]
    roles: Vec<Named>,
}

#[derive(Debug, Default, Deserialize)]
struct Named {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    domain: Option<Named>,
}

#[derive(Debug, Deserialize)]
struct AssignmentsBody {
    role_assignments: Vec<Assignment>,
}

#[derive(Debug, Deserialize)]
struct Assignment {
    // Group assignments carry a group instead.
    #[serde(default)]
    user: Option<User>,
    #[serde(default)]
    scope: Option<Scope>,
    #[serde(default)]
    role: Option<Named>,
}

#[derive(Debug, Deserialize)]
struct Scope {
    #[serde(default)]
    project: Option<Named>,
}

// === impl KeystoneClient ===

impl KeystoneClient {
    pub fn new(url: &str, admin_token: impl Into<String>) -> Result<Self, IdentityError> {
        let mut base = Url::parse(url)
            .map_err(|e| IdentityError::Response(format!("invalid identity service URL: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(request_error)?;
        Ok(Self {
            base,
            admin_token: admin_token.into(),
            http,
        })
    }

    fn url(&self, path: &str) -> Result<Url, IdentityError> {
        self.base
            .join(path)
            .map_err(|e| IdentityError::Response(format!("invalid identity service URL: {e}")))
    }
}

#[async_trait::async_trait]
impl IdentityService for KeystoneClient {
    async fn verify(&self, token: &str) -> Result<Credential, IdentityError> {
        if token.is_empty() {
            return Err(IdentityError::InvalidToken);
        }

        let rsp = self
            .http
            .get(self.url("v3/auth/tokens")?)
            .header(AUTH_TOKEN, &self.admin_token)
            .header(SUBJECT_TOKEN, token)
            .send()
            .await
            .map_err(request_error)?;
        match rsp.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED => {
                return Err(IdentityError::InvalidToken)
            }
            status => {
                return Err(IdentityError::Response(format!(
                    "token validation returned {status}"
                )))
            }
        }

        let TokenBody { token } = rsp.json().await.map_err(request_error)?;
        let project = token.project.unwrap_or_default();
        let credential = Credential {
            user_id: token.user.id,
            user_name: token.user.name,
            domain: token.user.domain.map(|d| d.name).unwrap_or_default(),
            project_id: project.id,
            project_name: project.name,
            roles: token.roles.into_iter().map(|r| r.name).collect(),
        };
        debug!(user = %credential.user_name, project = %credential.project_name, "Verified token");
        Ok(credential)
    }

    async fn list_role_assignments(&self) -> Result<Vec<RoleAssignment>, IdentityError> {
        let mut url = self.url("v3/role_assignments")?;
        url.query_pairs_mut().append_pair("include_names", "true");
        let rsp = self
            .http
            .get(url)
            .header(AUTH_TOKEN, &self.admin_token)
            .send()
            .await
            .map_err(request_error)?;
        if !rsp.status().is_success() {
            return Err(IdentityError::Response(format!(
                "listing role assignments returned {}",
                rsp.status()
            )));
        }

        let AssignmentsBody { role_assignments } = rsp.json().await.map_err(request_error)?;
        Ok(role_assignments
            .into_iter()
            .filter_map(|a| {
                let user = a.user?;
                let project = a.scope?.project?;
                let role = a.role?;
                Some(RoleAssignment {
                    user_id: user.id,
                    user_name: user.name,
                    project_id: project.id,
                    project_name: project.name,
                    role: role.name,
                    domain: user.domain.map(|d| d.name).unwrap_or_default(),
                })
            })
            .collect())
    }
}

fn request_error(error: reqwest::Error) -> IdentityError {
    IdentityError::Request(error.into())
}
