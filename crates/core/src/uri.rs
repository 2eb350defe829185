//! Object URIs: `kblocks://<group>/<version>/<plural>/<system>/<namespace>/<name>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const SCHEME: &str = "kblocks://";

/// Namespace placeholder for cluster-scoped objects.
pub const CLUSTER_SCOPE: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    #[error("object uri must start with kblocks://: {0}")]
    Scheme(String),
    #[error("object uri must have 6 segments (group/version/plural/system/namespace/name): {0}")]
    Segments(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjUri {
    pub group: String,
    pub version: String,
    pub plural: String,
    pub system: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjUri {
    /// `group/version/plural`, the form used as `objType` on the wire.
    pub fn obj_type(&self) -> String { format!("{}/{}/{}", self.group, self.version, self.plural) }
}

impl fmt::Display for ObjUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}/{}/{}/{}/{}/{}",
            SCHEME,
            self.group,
            self.version,
            self.plural,
            self.system,
            self.namespace.as_deref().unwrap_or(CLUSTER_SCOPE),
            self.name
        )
    }
}

impl FromStr for ObjUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix(SCHEME).ok_or_else(|| UriError::Scheme(s.to_string()))?;
        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [group, version, plural, system, namespace, name]
                if !version.is_empty() && !plural.is_empty() && !name.is_empty() =>
            {
                let namespace = match *namespace {
                    "" | CLUSTER_SCOPE => None,
                    ns => Some(ns.to_string()),
                };
                Ok(ObjUri {
                    group: (*group).to_string(),
                    version: (*version).to_string(),
                    plural: (*plural).to_string(),
                    system: (*system).to_string(),
                    namespace,
                    name: (*name).to_string(),
                })
            }
            _ => Err(UriError::Segments(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let s = "kblocks://acme.com/v1/queues/dev/team-a/orders";
        let u: ObjUri = s.parse().unwrap();
        assert_eq!(u.group, "acme.com");
        assert_eq!(u.namespace.as_deref(), Some("team-a"));
        assert_eq!(u.obj_type(), "acme.com/v1/queues");
        assert_eq!(u.to_string(), s);
    }

    #[test]
    fn cluster_scoped_uses_dash() {
        let u: ObjUri = "kblocks://acme.com/v1/clusters/dev/-/main".parse().unwrap();
        assert!(u.namespace.is_none());
        assert_eq!(u.to_string(), "kblocks://acme.com/v1/clusters/dev/-/main");
    }

    #[test]
    fn rejects_bad_uris() {
        assert!(matches!("http://x/y".parse::<ObjUri>(), Err(UriError::Scheme(_))));
        assert!(matches!("kblocks://a/v1/q/dev/ns".parse::<ObjUri>(), Err(UriError::Segments(_))));
        assert!(matches!("kblocks://a/v1/q/dev/ns/".parse::<ObjUri>(), Err(UriError::Segments(_))));
    }
}
