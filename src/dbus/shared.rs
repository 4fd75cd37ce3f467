use std::collections::{HashMap, HashSet};
use zbus::Connection;
use zbus::zvariant::OwnedObjectPath;

/// Values of one exported service, shared between the publisher and the
/// object server's interface handlers.
pub struct DbusSharedState {
    pub(crate) paths: HashMap<String, serde_json::Value>,
    pub(crate) writable: HashSet<String>,
    pub(crate) connection: Option<Connection>,
    pub(crate) root_path: OwnedObjectPath,
}

impl DbusSharedState {
    pub fn new(root_path: OwnedObjectPath) -> Self {
        Self {
            paths: HashMap::new(),
            writable: HashSet::new(),
            connection: None,
            root_path,
        }
    }

    /// Values below `prefix`, keyed by the path relative to it
    pub(crate) fn subtree(&self, prefix: &str) -> Vec<(String, String, &serde_json::Value)> {
        let mut px = prefix.to_string();
        if !px.ends_with('/') {
            px.push('/');
        }
        self.paths
            .iter()
            .filter_map(|(path, val)| {
                path.strip_prefix(&px)
                    .map(|suffix| (suffix.to_string(), path.clone(), val))
            })
            .collect()
    }
}
