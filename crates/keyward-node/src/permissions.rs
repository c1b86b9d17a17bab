//! Origin permission authority.
//!
//! The validation pipeline consults a [`PermissionAuthority`] for every
//! non-CLI request. Without one the permission check is skipped.

use std::collections::HashSet;

use keyward_protocol::request::{Origin, RequestType};

/// Decides whether an origin may issue a request type.
pub trait PermissionAuthority: Send + Sync {
    /// Returns `true` if `origin` may issue `kind`.
    fn is_permitted(&self, origin: &Origin, kind: RequestType) -> bool;

    /// Records that the user approved `origin` for account access.
    fn grant(&mut self, origin: &Origin);

    /// Withdraws a grant.
    fn revoke(&mut self, origin: &Origin);

    /// Returns `true` if `origin` already holds a grant.
    fn is_granted(&self, origin: &Origin) -> bool;
}

/// Allow-list authority.
///
/// Origins listed in configuration start granted; others become
/// granted when the user approves a connect prompt. Connecting
/// (`eth_requestAccounts`) and status / ping are open to every origin,
/// since connecting is how a grant is obtained.
#[derive(Debug, Default)]
pub struct OriginAllowList {
    granted: HashSet<String>,
}

impl OriginAllowList {
    /// Creates an authority with `origins` pre-granted.
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            granted: origins.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of granted origins.
    pub fn len(&self) -> usize {
        self.granted.len()
    }

    /// Returns `true` if nothing is granted.
    pub fn is_empty(&self) -> bool {
        self.granted.is_empty()
    }
}

impl PermissionAuthority for OriginAllowList {
    fn is_permitted(&self, origin: &Origin, kind: RequestType) -> bool {
        if origin.is_cli() || kind.always_allowed() || kind == RequestType::EthRequestAccounts {
            return true;
        }
        self.granted.contains(origin.as_str())
    }

    fn grant(&mut self, origin: &Origin) {
        if !origin.is_cli() && self.granted.insert(origin.as_str().to_string()) {
            tracing::info!(%origin, "origin granted account access");
        }
    }

    fn revoke(&mut self, origin: &Origin) {
        if self.granted.remove(origin.as_str()) {
            tracing::info!(%origin, "origin access revoked");
        }
    }

    fn is_granted(&self, origin: &Origin) -> bool {
        origin.is_cli() || self.granted.contains(origin.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
