use super::*;
use kubeserver_core::{RoleAssignment, RoleAssignments, SYSTEM_PROJECT};
use kubeserver_k8s_api as k8s;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

/// An in-memory cluster.
#[derive(Default)]
struct FakeApi {
    objects: Mutex<BTreeMap<String, Object>>,
    created: Mutex<Vec<String>>,

    /// Objects created concurrently by another writer: they are not seen by `get` but `create`
    /// reports them as existing.
    racing: BTreeSet<String>,

    /// Requests touching this namespace fail.
    failing_namespace: Option<String>,
}

impl FakeApi {
    fn names(&self) -> BTreeSet<String> {
        self.objects.lock().keys().cloned().collect()
    }

    fn get_object(&self, key: &str) -> Option<Object> {
        self.objects.lock().get(key).cloned()
    }

    fn check_failing(&self, obj: &Object) -> Result<(), ApiError> {
        let ns = match obj {
            Object::Namespace(_) => Some(obj.name()),
            _ => obj.namespace(),
        };
        if ns.is_some() && ns == self.failing_namespace {
            return Err(ApiError::Kube(k8s::Error::Service(Box::new(
                std::io::Error::other("connection reset"),
            ))));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterApi for FakeApi {
    async fn get(&self, obj: &Object) -> Result<(), ApiError> {
        self.check_failing(obj)?;
        if self.objects.lock().contains_key(&obj.to_string()) {
            return Ok(());
        }
        Err(ApiError::NotFound)
    }

    async fn create(&self, obj: &Object) -> Result<(), ApiError> {
        self.check_failing(obj)?;
        let key = obj.to_string();
        if self.racing.contains(&key) {
            return Err(ApiError::AlreadyExists);
        }
        let mut objects = self.objects.lock();
        if objects.contains_key(&key) {
            return Err(ApiError::AlreadyExists);
        }
        objects.insert(key.clone(), obj.clone());
        self.created.lock().push(key);
        Ok(())
    }
}

fn ra(project: &str, role: &str) -> RoleAssignment {
    RoleAssignment {
        user_id: "u1".to_string(),
        user_name: "alice".to_string(),
        project_id: format!("{project}-id"),
        project_name: project.to_string(),
        role: role.to_string(),
        domain: "Default".to_string(),
    }
}

fn keys(keys: &[&str]) -> BTreeSet<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

#[tokio::test]
async fn member_gets_namespace_and_binding() {
    let api = FakeApi::default();
    let assignments = RoleAssignments::from(vec![ra("proj-a", "member")]);
    Reconciler::default()
        .reconcile(&api, "alice", "u1", &assignments)
        .await
        .expect("reconcile must succeed");

    assert_eq!(
        api.names(),
        keys(&[
            "Namespace proj-a",
            "RoleBinding proj-a/keystone:user:alice:u1",
        ])
    );
    let Some(Object::RoleBinding(rb)) = api.get_object("RoleBinding proj-a/keystone:user:alice:u1")
    else {
        panic!("expected a RoleBinding");
    };
    assert_eq!(rb.role_ref.name, "admin");
    assert_eq!(rb.subjects.unwrap()[0].name, "alice");
}

#[tokio::test]
async fn system_admin_gets_cluster_admin() {
    let api = FakeApi::default();
    let assignments = RoleAssignments::from(vec![
        ra("proj-a", "member"),
        ra(SYSTEM_PROJECT, "admin"),
    ]);
    Reconciler::default()
        .reconcile(&api, "alice", "u1", &assignments)
        .await
        .expect("reconcile must succeed");

    assert_eq!(
        api.names(),
        keys(&[
            "ClusterRoleBinding keystone:admin:alice:u1",
            "Namespace proj-a",
            "Namespace system",
            "RoleBinding proj-a/keystone:user:alice:u1",
            "RoleBinding system/keystone:user:alice:u1",
        ])
    );
    let Some(Object::ClusterRoleBinding(crb)) =
        api.get_object("ClusterRoleBinding keystone:admin:alice:u1")
    else {
        panic!("expected a ClusterRoleBinding");
    };
    assert_eq!(crb.role_ref.name, "cluster-admin");
}

#[tokio::test]
async fn system_member_is_not_elevated() {
    let api = FakeApi::default();
    let assignments = RoleAssignments::from(vec![ra(SYSTEM_PROJECT, "member")]);
    Reconciler::default()
        .reconcile(&api, "alice", "u1", &assignments)
        .await
        .unwrap();
    assert!(!api
        .names()
        .iter()
        .any(|k| k.starts_with("ClusterRoleBinding")));
}

#[tokio::test]
async fn only_the_users_assignments_apply() {
    let api = FakeApi::default();
    let mut other = ra("proj-b", "admin");
    other.user_id = "u2".to_string();
    other.user_name = "bob".to_string();
    let assignments = RoleAssignments::from(vec![ra("proj-a", "member"), other]);
    Reconciler::default()
        .reconcile(&api, "alice", "u1", &assignments)
        .await
        .unwrap();
    assert!(!api.names().contains("Namespace proj-b"));
}

#[tokio::test]
async fn limit_ranges_when_enabled() {
    let api = FakeApi::default();
    let assignments = RoleAssignments::from(vec![ra("proj_a", "member")]);
    Reconciler::new(2, true)
        .reconcile(&api, "alice", "u1", &assignments)
        .await
        .unwrap();
    assert_eq!(
        api.names(),
        keys(&[
            "LimitRange proj-a/yunion-limit-range",
            "Namespace proj-a",
            "RoleBinding proj-a/keystone:user:alice:u1",
        ])
    );
}

#[tokio::test]
async fn reconcile_is_idempotent() {
    let api = FakeApi::default();
    let assignments = RoleAssignments::from(vec![
        ra("proj-a", "member"),
        ra("proj-b", "member"),
        ra(SYSTEM_PROJECT, "system"),
    ]);
    let reconciler = Reconciler::new(4, true);
    reconciler
        .reconcile(&api, "alice", "u1", &assignments)
        .await
        .unwrap();
    let created = api.created.lock().len();
    assert_eq!(created, 10);

    reconciler
        .reconcile(&api, "alice", "u1", &assignments)
        .await
        .unwrap();
    assert_eq!(api.created.lock().len(), created);
}

#[tokio::test]
async fn concurrent_creation_is_absorbed() {
    let api = FakeApi {
        racing: keys(&["Namespace proj-a"]),
        ..FakeApi::default()
    };
    let ensured = ensure(&api, namespace("proj-a")).await.unwrap();
    assert_eq!(ensured, Ensured::Existing);

    let assignments = RoleAssignments::from(vec![ra("proj-a", "member")]);
    Reconciler::default()
        .reconcile(&api, "alice", "u1", &assignments)
        .await
        .expect("a concurrently created namespace is not a failure");
    assert!(api
        .names()
        .contains("RoleBinding proj-a/keystone:user:alice:u1"));
}

#[tokio::test]
async fn failures_are_aggregated() {
    let api = FakeApi {
        failing_namespace: Some("proj-b".to_string()),
        ..FakeApi::default()
    };
    let assignments = RoleAssignments::from(vec![
        ra("proj-a", "member"),
        ra("proj-b", "member"),
        ra("proj-c", "member"),
    ]);
    let error = Reconciler::new(1, false)
        .reconcile(&api, "alice", "u1", &assignments)
        .await
        .expect_err("reconcile must fail");

    assert_eq!(error.user, "alice");
    assert_eq!(error.failures.len(), 1);
    assert_eq!(error.failures[0].object, "Namespace proj-b");
    assert!(matches!(error.failures[0].source, ApiError::Kube(_)));
    assert!(error.to_string().contains("Namespace proj-b"), "{error}");

    // The other namespaces are still reconciled.
    let names = api.names();
    assert!(names.contains("RoleBinding proj-a/keystone:user:alice:u1"));
    assert!(names.contains("RoleBinding proj-c/keystone:user:alice:u1"));
}

#[tokio::test]
async fn unrepresentable_projects_are_skipped() {
    let api = FakeApi::default();
    let assignments = RoleAssignments::from(vec![ra("项目", "member"), ra("proj-a", "member")]);
    Reconciler::default()
        .reconcile(&api, "alice", "u1", &assignments)
        .await
        .unwrap();
    assert_eq!(
        api.names(),
        keys(&[
            "Namespace proj-a",
            "RoleBinding proj-a/keystone:user:alice:u1",
        ])
    );
}
