//! Hierarchical role-based permission resolution.

use std::sync::Arc;
use tracing::debug;

use crate::error::{CatalogError, Result};
use crate::model::{Action, Entry, PermissionSet, Principal, Resource, ROLE_ANY, ROLE_NONE};
use crate::traits::EntryStore;
use crate::tree::EntryTree;

/// Permissions installed on a fresh top group.
pub fn root_default_permissions() -> PermissionSet {
    PermissionSet::new()
        .with(Action::View, [ROLE_ANY])
        .with(Action::ViewChildren, [ROLE_ANY])
        .with(Action::Edit, [ROLE_NONE])
        .with(Action::New, [ROLE_NONE])
        .with(Action::Delete, [ROLE_NONE])
        .with(Action::Comment, [ROLE_ANY])
}

/// First role token the principal holds decides; `None` when none match.
fn evaluate_roles(principal: &Principal, roles: &[String]) -> Option<bool> {
    for token in roles {
        let (negated, role) = match token.strip_prefix('!') {
            Some(role) => (true, role),
            None => (false, token.as_str()),
        };
        let held = match role.strip_prefix("ip:") {
            Some(prefix) => principal.ip.as_deref().is_some_and(|ip| ip.starts_with(prefix)),
            None => principal.holds_role(role),
        };
        if held {
            return Some(!negated);
        }
    }
    None
}

pub struct PermissionResolver {
    tree: Arc<EntryTree>,
    download_ok: bool,
}

impl PermissionResolver {
    pub fn new(tree: Arc<EntryTree>) -> Self {
        Self {
            tree,
            download_ok: false,
        }
    }

    pub fn with_download_ok(mut self, download_ok: bool) -> Self {
        self.download_ok = download_ok;
        self
    }

    /// Permission rows of `entry`, cached on the instance after first load.
    pub async fn permissions(&self, entry: &Entry) -> Result<Arc<PermissionSet>> {
        entry
            .permissions
            .get_or_load(|| self.tree.store().load_permissions(&entry.id))
            .await
    }

    /// Whether `principal` may perform `action` on `entry`.
    ///
    /// Walks the parent chain: an entry without any permission rows defers
    /// to its parent; an entry with rows but none (or an empty list) for
    /// `action` denies; otherwise the first held role token decides, and
    /// when none is held the parent is consulted. Reaching past the top
    /// group denies.
    pub async fn can(&self, principal: &Principal, entry: &Entry, action: Action) -> Result<bool> {
        if entry.is_external_file() && matches!(action, Action::New | Action::Delete) {
            return Ok(false);
        }
        if principal.admin {
            return Ok(true);
        }
        let owner = entry.owner_user_id.as_str();
        if !owner.is_empty() && principal.user_id.as_deref() == Some(owner) {
            return Ok(true);
        }

        let mut ancestor: Option<Arc<Entry>> = None;
        loop {
            let current = ancestor.as_deref().unwrap_or(entry);
            let permissions = self.permissions(current).await?;
            if !permissions.is_empty() {
                match permissions.roles_for(action) {
                    None | Some([]) => {
                        debug!(entry = %current.id, %action, "no roles for action, denying");
                        return Ok(false);
                    }
                    Some(roles) => {
                        if let Some(allowed) = evaluate_roles(principal, roles) {
                            return Ok(allowed);
                        }
                    }
                }
            }
            let Some(parent_id) = current.parent_group_id.clone() else {
                return Ok(false);
            };
            ancestor = Some(self.tree.resolve(&parent_id).await?);
        }
    }

    /// Like [`can`](Self::can) but fails with `PermissionDenied`.
    pub async fn check(&self, principal: &Principal, entry: &Entry, action: Action) -> Result<()> {
        if self.can(principal, entry, action).await? {
            Ok(())
        } else {
            Err(CatalogError::PermissionDenied {
                entry_id: entry.id.clone(),
                action: action.to_string(),
            })
        }
    }

    /// `Some(entry)` when the principal may see it: the backing local file
    /// still exists, `view` is allowed on it and `viewchildren` on its parent.
    pub async fn filter_entry(
        &self,
        principal: &Principal,
        entry: Arc<Entry>,
    ) -> Result<Option<Arc<Entry>>> {
        if let Resource::LocalFile(path) = &entry.resource {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Ok(None);
            }
        }
        if !self.can(principal, &entry, Action::View).await? {
            return Ok(None);
        }
        if let Some(parent_id) = &entry.parent_group_id {
            let parent = self.tree.resolve(parent_id).await?;
            if !self.can(principal, &parent, Action::ViewChildren).await? {
                return Ok(None);
            }
        }
        Ok(Some(entry))
    }

    pub async fn filter_entries(
        &self,
        principal: &Principal,
        entries: Vec<Arc<Entry>>,
    ) -> Result<Vec<Arc<Entry>>> {
        let mut visible = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(entry) = self.filter_entry(principal, entry).await? {
                visible.push(entry);
            }
        }
        Ok(visible)
    }

    pub async fn can_download(&self, principal: &Principal, entry: Arc<Entry>) -> Result<bool> {
        if !self.download_ok {
            return Ok(false);
        }
        match self.filter_entry(principal, entry).await? {
            Some(entry) => Ok((entry.kind.handler().can_download)(&entry)),
            None => Ok(false),
        }
    }

    pub async fn set_permissions(&self, entry: &Entry, permissions: PermissionSet) -> Result<()> {
        self.tree.set_permissions(entry, permissions).await
    }
}
