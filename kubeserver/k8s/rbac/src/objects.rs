use kubeserver_k8s_api::{
    ClusterRoleBinding, LimitRange, LimitRangeItem, LimitRangeSpec, Namespace, ObjectMeta,
    Quantity, ResourceExt, RoleBinding, RoleRef, Subject,
};
use std::collections::BTreeMap;

pub const LIMIT_RANGE_NAME: &str = "yunion-limit-range";

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// An object the reconciler ensures.
#[derive(Clone, Debug, PartialEq)]
pub enum Object {
    Namespace(Namespace),
    LimitRange(LimitRange),
    RoleBinding(RoleBinding),
    ClusterRoleBinding(ClusterRoleBinding),
}

// === impl Object ===

impl Object {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Namespace(_) => "Namespace",
            Self::LimitRange(_) => "LimitRange",
            Self::RoleBinding(_) => "RoleBinding",
            Self::ClusterRoleBinding(_) => "ClusterRoleBinding",
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Namespace(o) => o.name_any(),
            Self::LimitRange(o) => o.name_any(),
            Self::RoleBinding(o) => o.name_any(),
            Self::ClusterRoleBinding(o) => o.name_any(),
        }
    }

    /// The namespace of namespaced objects.
    pub fn namespace(&self) -> Option<String> {
        match self {
            Self::Namespace(_) | Self::ClusterRoleBinding(_) => None,
            Self::LimitRange(o) => o.namespace(),
            Self::RoleBinding(o) => o.namespace(),
        }
    }
}

impl std::fmt::Display for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.namespace() {
            Some(ns) => write!(f, "{} {}/{}", self.kind(), ns, self.name()),
            None => write!(f, "{} {}", self.kind(), self.name()),
        }
    }
}

pub fn namespace(name: &str) -> Object {
    Object::Namespace(Namespace {
        metadata: meta(name, None),
        ..Namespace::default()
    })
}

/// The default per-container limits applied to project namespaces.
pub fn limit_range(ns: &str) -> Object {
    let resources = |cpu: &str, memory: &str| {
        Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ]))
    };
    Object::LimitRange(LimitRange {
        metadata: meta(LIMIT_RANGE_NAME, Some(ns)),
        spec: Some(LimitRangeSpec {
            limits: vec![LimitRangeItem {
                type_: "Container".to_string(),
                default: resources("500m", "1024Mi"),
                default_request: resources("200m", "64Mi"),
                max: resources("16", "16Gi"),
                min: resources("100m", "64Mi"),
                ..LimitRangeItem::default()
            }],
        }),
    })
}

pub fn user_role_binding_name(user_name: &str, user_id: &str) -> String {
    format!("keystone:user:{user_name}:{user_id}")
}

pub fn admin_cluster_role_binding_name(user_name: &str, user_id: &str) -> String {
    format!("keystone:admin:{user_name}:{user_id}")
}

/// Grants the user the `admin` cluster role within a project namespace.
pub fn user_role_binding(ns: &str, user_name: &str, user_id: &str) -> Object {
    Object::RoleBinding(RoleBinding {
        metadata: meta(&user_role_binding_name(user_name, user_id), Some(ns)),
        role_ref: cluster_role("admin"),
        subjects: Some(vec![user(user_name)]),
    })
}

/// Grants the user `cluster-admin` across the cluster.
pub fn admin_cluster_role_binding(user_name: &str, user_id: &str) -> Object {
    Object::ClusterRoleBinding(ClusterRoleBinding {
        metadata: meta(&admin_cluster_role_binding_name(user_name, user_id), None),
        role_ref: cluster_role("cluster-admin"),
        subjects: Some(vec![user(user_name)]),
    })
}

fn meta(name: &str, ns: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: ns.map(Into::into),
        ..ObjectMeta::default()
    }
}

fn cluster_role(name: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_GROUP.to_string(),
        kind: "ClusterRole".to_string(),
        name: name.to_string(),
    }
}

fn user(name: &str) -> Subject {
    Subject {
        api_group: Some(RBAC_GROUP.to_string()),
        kind: "User".to_string(),
        name: name.to_string(),
        namespace: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_binding() {
        let Object::RoleBinding(rb) = user_role_binding("proj-a", "alice", "u1") else {
            panic!("expected a RoleBinding");
        };
        assert_eq!(rb.name_any(), "keystone:user:alice:u1");
        assert_eq!(rb.namespace().as_deref(), Some("proj-a"));
        assert_eq!(rb.role_ref.kind, "ClusterRole");
        assert_eq!(rb.role_ref.name, "admin");
        let subjects = rb.subjects.unwrap();
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].kind, "User");
        assert_eq!(subjects[0].name, "alice");
    }

    #[test]
    fn limit_range_defaults() {
        let Object::LimitRange(lr) = limit_range("proj-a") else {
            panic!("expected a LimitRange");
        };
        assert_eq!(lr.name_any(), LIMIT_RANGE_NAME);
        let item = &lr.spec.unwrap().limits[0];
        assert_eq!(item.type_, "Container");
        let get = |m: &Option<BTreeMap<String, Quantity>>, k: &str| m.as_ref().unwrap()[k].0.clone();
        assert_eq!(get(&item.default, "cpu"), "500m");
        assert_eq!(get(&item.default, "memory"), "1024Mi");
        assert_eq!(get(&item.default_request, "cpu"), "200m");
        assert_eq!(get(&item.default_request, "memory"), "64Mi");
        assert_eq!(get(&item.max, "cpu"), "16");
        assert_eq!(get(&item.max, "memory"), "16Gi");
        assert_eq!(get(&item.min, "cpu"), "100m");
        assert_eq!(get(&item.min, "memory"), "64Mi");
    }

    #[test]
    fn display() {
        assert_eq!(namespace("proj-a").to_string(), "Namespace proj-a");
        assert_eq!(
            admin_cluster_role_binding("alice", "u1").to_string(),
            "ClusterRoleBinding keystone:admin:alice:u1"
        );
        assert_eq!(
            limit_range("proj-a").to_string(),
            "LimitRange proj-a/yunion-limit-range"
        );
    }
}
