/// Characters that may appear in project names but not in namespace names.
const REPLACED: &str = "/\\.?!@#$%^&*()_+=";

/// The longest DNS-1123 label.
const MAX_LEN: usize = 63;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidName {
    #[error("project name is empty")]
    Empty,

    #[error("project name {0:?} is not ASCII")]
    NonAscii(String),

    #[error("{0:?} is not a valid namespace name")]
    NotDnsLabel(String),
}

/// Translates a project name to the namespace that holds its bindings.
pub fn namespace_for_project(project: &str) -> Result<String, InvalidName> {
    if project.is_empty() {
        return Err(InvalidName::Empty);
    }
    if !project.is_ascii() {
        return Err(InvalidName::NonAscii(project.to_string()));
    }
    let ns = project
        .chars()
        .map(|c| {
            if REPLACED.contains(c) {
                '-'
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect::<String>();
    if !is_dns_label(&ns) {
        return Err(InvalidName::NotDnsLabel(ns));
    }
    Ok(ns)
}

fn is_dns_label(name: &str) -> bool {
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    name.len() <= MAX_LEN
        && name.starts_with(alnum)
        && name.ends_with(alnum)
        && name.chars().all(|c| alnum(c) || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transliterates() {
        assert_eq!(namespace_for_project("proj-a").unwrap(), "proj-a");
        assert_eq!(namespace_for_project("team_a.dev").unwrap(), "team-a-dev");
        assert_eq!(
            namespace_for_project(r"a/b\c?d!e@f#g$h%i^j&k*l(m)n+o=p").unwrap(),
            "a-b-c-d-e-f-g-h-i-j-k-l-m-n-o-p"
        );
        assert_eq!(namespace_for_project("Team-A").unwrap(), "team-a");
        assert_eq!(namespace_for_project(&"p".repeat(63)).unwrap(), "p".repeat(63));
    }

    #[test]
    fn rejects_unrepresentable_names() {
        assert_eq!(namespace_for_project(""), Err(InvalidName::Empty));
        assert_eq!(
            namespace_for_project("项目"),
            Err(InvalidName::NonAscii("项目".to_string()))
        );
        assert_eq!(
            namespace_for_project(&"p".repeat(64)),
            Err(InvalidName::NotDnsLabel("p".repeat(64)))
        );
        assert_eq!(
            namespace_for_project("team a"),
            Err(InvalidName::NotDnsLabel("team a".to_string()))
        );
        assert_eq!(
            namespace_for_project("_infra"),
            Err(InvalidName::NotDnsLabel("-infra".to_string()))
        );
    }
}
