//! ARM-style resource identifiers
//!
//! `/subscriptions/{sub}/resourceGroups/{rg}/providers/{namespace}/{type}/{name}[/{type}/{name}]...`

use crate::error::{CloudError, Result};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    subscription_id: String,
    resource_group: String,
    provider: Option<String>,
    path: Vec<(String, String)>,
}

impl ResourceId {
    /// Top-level resource, e.g. `virtualNetworks/vnet-1` under `Microsoft.Network`
    pub fn new(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        provider: impl Into<String>,
        resource_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            provider: Some(provider.into()),
            path: vec![(resource_type.into(), name.into())],
        }
    }

    pub fn parse(id: &str) -> Result<Self> {
        let invalid = |reason: &str| CloudError::InvalidResourceId {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = id.trim().trim_end_matches('/');
        let rest = trimmed
            .strip_prefix('/')
            .ok_or_else(|| invalid("must start with '/'"))?;
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() % 2 != 0 {
            return Err(invalid("expected key/value pairs"));
        }
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid("empty segment"));
        }

        let mut subscription_id = None;
        let mut resource_group = None;
        let mut provider = None;
        let mut path = Vec::new();

        for pair in parts.chunks(2) {
            let (key, value) = (pair[0], pair[1]);
            if provider.is_none() && path.is_empty() {
                if key.eq_ignore_ascii_case("subscriptions") && subscription_id.is_none() {
                    subscription_id = Some(value.to_string());
                    continue;
                }
                if key.eq_ignore_ascii_case("resourceGroups") && resource_group.is_none() {
                    resource_group = Some(value.to_string());
                    continue;
                }
                if key.eq_ignore_ascii_case("providers") {
                    provider = Some(value.to_string());
                    continue;
                }
            }
            if provider.is_none() {
                return Err(invalid(&format!("unexpected segment {key:?} before providers")));
            }
            path.push((key.to_string(), value.to_string()));
        }

        let subscription_id = subscription_id.ok_or_else(|| invalid("missing subscriptions"))?;
        let resource_group = resource_group.ok_or_else(|| invalid("missing resourceGroups"))?;
        if provider.is_some() && path.is_empty() {
            return Err(invalid("missing resource type and name"));
        }

        Ok(Self {
            subscription_id,
            resource_group,
            provider,
            path,
        })
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    /// Name of the innermost resource (the resource group for a group ID)
    pub fn name(&self) -> &str {
        self.path
            .last()
            .map_or(self.resource_group.as_str(), |(_, name)| name.as_str())
    }

    /// Type of the innermost resource, e.g. `subnets`
    pub fn resource_type(&self) -> Option<&str> {
        self.path.last().map(|(kind, _)| kind.as_str())
    }

    /// Name recorded under `resource_type` anywhere in the path
    pub fn segment(&self, resource_type: &str) -> Option<&str> {
        self.path
            .iter()
            .find(|(kind, _)| kind.eq_ignore_ascii_case(resource_type))
            .map(|(_, name)| name.as_str())
    }

    /// Nested resource below this one
    pub fn child(&self, resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        let mut child = self.clone();
        child.path.push((resource_type.into(), name.into()));
        child
    }

    /// Enclosing resource, if this one is nested
    pub fn parent(&self) -> Option<Self> {
        if self.path.len() < 2 {
            return None;
        }
        let mut parent = self.clone();
        parent.path.pop();
        Some(parent)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/subscriptions/{}/resourceGroups/{}",
            self.subscription_id, self.resource_group
        )?;
        if let Some(provider) = &self.provider {
            write!(f, "/providers/{provider}")?;
        }
        for (kind, name) in &self.path {
            write!(f, "/{kind}/{name}")?;
        }
        Ok(())
    }
}

impl FromStr for ResourceId {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUBNET: &str = "/subscriptions/0000/resourceGroups/rg-net/providers/Microsoft.Network/virtualNetworks/vnet-1/subnets/frontend";

    #[test]
    fn test_parse_nested_id() {
        let id = ResourceId::parse(SUBNET).unwrap();
        assert_eq!(id.subscription_id(), "0000");
        assert_eq!(id.resource_group(), "rg-net");
        assert_eq!(id.provider(), Some("Microsoft.Network"));
        assert_eq!(id.name(), "frontend");
        assert_eq!(id.resource_type(), Some("subnets"));
        assert_eq!(id.segment("virtualNetworks"), Some("vnet-1"));
        assert_eq!(id.to_string(), SUBNET);
    }

    #[test]
    fn test_parent_and_child() {
        let vnet = ResourceId::new("0000", "rg-net", "Microsoft.Network", "virtualNetworks", "vnet-1");
        let subnet = vnet.child("subnets", "frontend");
        assert_eq!(subnet.to_string(), SUBNET);
        assert_eq!(subnet.parent(), Some(vnet.clone()));
        assert_eq!(vnet.parent(), None);
    }

    #[test]
    fn test_lowercase_resource_groups_key() {
        let id: ResourceId = "/subscriptions/0000/resourcegroups/rg/providers/Microsoft.Network/routeTables/rt-1"
            .parse()
            .unwrap();
        assert_eq!(id.resource_group(), "rg");
        assert_eq!(id.name(), "rt-1");
    }

    #[test]
    fn test_rejects_malformed_ids() {
        for bad in [
            "subscriptions/0000/resourceGroups/rg",
            "/subscriptions/0000/resourceGroups",
            "/subscriptions/0000/virtualNetworks/vnet-1",
            "/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks/v",
            "/subscriptions/0000/resourceGroups/rg/providers/Microsoft.Network",
            "/subscriptions//resourceGroups/rg",
        ] {
            let err = ResourceId::parse(bad).unwrap_err();
            assert!(
                matches!(err, CloudError::InvalidResourceId { .. }),
                "{bad} -> {err}"
            );
        }
    }
}
