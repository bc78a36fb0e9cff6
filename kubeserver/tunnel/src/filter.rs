use crate::frame::Destination;
use std::{fmt, str::FromStr};

/// An allow-list of destinations an agent will dial on behalf of its peer.
///
/// Rules are written as `proto/pattern`, where the pattern is either `*` (any address), a prefix
/// followed by `*`, or an exact address. An empty filter allows nothing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectFilter(Vec<Rule>);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    proto: String,
    address: Pattern,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Pattern {
    Any,
    Prefix(String),
    Exact(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid connect rule {0:?}: expected proto/pattern")]
pub struct InvalidRule(String);

// === impl ConnectFilter ===

impl ConnectFilter {
    pub fn allows(&self, dst: &Destination) -> bool {
        self.0.iter().any(|rule| rule.matches(dst))
    }
}

impl FromIterator<Rule> for ConnectFilter {
    fn from_iter<T: IntoIterator<Item = Rule>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

// === impl Rule ===

impl Rule {
    fn matches(&self, dst: &Destination) -> bool {
        if self.proto != dst.proto {
            return false;
        }
        match &self.address {
            Pattern::Any => true,
            Pattern::Prefix(prefix) => dst.address.starts_with(prefix.as_str()),
            Pattern::Exact(address) => *address == dst.address,
        }
    }
}

impl FromStr for Rule {
    type Err = InvalidRule;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (proto, pattern) = match s.split_once('/') {
            Some((p, a)) if !p.is_empty() && !a.is_empty() => (p, a),
            _ => return Err(InvalidRule(s.to_string())),
        };
        let address = if pattern == "*" {
            Pattern::Any
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            Pattern::Prefix(prefix.to_string())
        } else {
            Pattern::Exact(pattern.to_string())
        };
        Ok(Self {
            proto: proto.to_string(),
            address,
        })
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Pattern::Any => write!(f, "{}/*", self.proto),
            Pattern::Prefix(p) => write!(f, "{}/{p}*", self.proto),
            Pattern::Exact(a) => write!(f, "{}/{a}", self.proto),
        }
    }
}
