use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

use courier_types::models::Group;

/// Group name -> members, shared by all sessions. Loaded from the group
/// store at startup and written through on creation.
#[derive(Clone, Default)]
pub struct GroupDirectory {
    inner: Arc<RwLock<HashMap<String, Group>>>,
}

impl GroupDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_groups(groups: impl IntoIterator<Item = Group>) -> Self {
        let map = groups
            .into_iter()
            .map(|group| (group.group_name.clone(), group))
            .collect();
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.inner.read().await.contains_key(name)
    }

    /// `false` if a group with this name already exists.
    pub async fn insert(&self, group: Group) -> bool {
        let mut groups = self.inner.write().await;
        if groups.contains_key(&group.group_name) {
            return false;
        }
        groups.insert(group.group_name.clone(), group);
        true
    }

    /// Membership snapshot; later changes don't affect the returned set.
    pub async fn members(&self, name: &str) -> Option<BTreeSet<String>> {
        self.inner
            .read()
            .await
            .get(name)
            .map(|group| group.members.clone())
    }

    pub async fn groups_of(&self, identity: &str) -> Vec<Group> {
        let mut groups: Vec<Group> = self
            .inner
            .read()
            .await
            .values()
            .filter(|group| group.contains(identity))
            .cloned()
            .collect();
        groups.sort_by(|a, b| a.group_name.cmp(&b.group_name));
        groups
    }
}
