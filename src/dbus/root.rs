use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use zbus::object_server::SignalEmitter;
use zbus::zvariant::OwnedValue;

use super::items::BusItem;
use super::shared::DbusSharedState;
use super::util::text_owned_value;

fn subtree_map(shared: &Mutex<DbusSharedState>, prefix: &str, as_text: bool) -> HashMap<String, OwnedValue> {
    let shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
    shared
        .subtree(prefix)
        .into_iter()
        .map(|(suffix, full, val)| {
            let ov = if as_text {
                text_owned_value(&full, val)
            } else {
                BusItem::serde_to_owned_value(val)
            };
            (suffix, ov)
        })
        .collect()
}

/// The service root: whole-tree reads and the ItemsChanged signal
pub struct RootBus {
    pub(crate) shared: Arc<Mutex<DbusSharedState>>,
}

#[zbus::interface(name = "com.victronenergy.BusItem")]
impl RootBus {
    #[zbus(name = "GetValue")]
    async fn get_value(&self) -> OwnedValue {
        OwnedValue::from(subtree_map(&self.shared, "/", false))
    }

    #[zbus(name = "GetText")]
    async fn get_text(&self) -> OwnedValue {
        OwnedValue::from(subtree_map(&self.shared, "/", true))
    }

    #[zbus(name = "GetItems")]
    async fn get_items(&self) -> HashMap<String, HashMap<String, OwnedValue>> {
        let shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        shared
            .paths
            .iter()
            .map(|(path, val)| {
                let mut entry = HashMap::new();
                entry.insert("Value".to_string(), BusItem::serde_to_owned_value(val));
                entry.insert("Text".to_string(), text_owned_value(path, val));
                (path.clone(), entry)
            })
            .collect()
    }

    #[zbus(signal)]
    pub async fn items_changed(
        ctxt: &SignalEmitter<'_>,
        changes: HashMap<&str, HashMap<&str, OwnedValue>>,
    ) -> zbus::Result<()>;
}

/// Intermediate node such as `/Ac/Out`; reads return its subtree
pub struct TreeNode {
    pub(crate) path: String,
    pub(crate) shared: Arc<Mutex<DbusSharedState>>,
}

impl TreeNode {
    pub fn new(path: String, shared: Arc<Mutex<DbusSharedState>>) -> Self {
        Self { path, shared }
    }
}

#[zbus::interface(name = "com.victronenergy.BusItem")]
impl TreeNode {
    #[zbus(name = "GetValue")]
    async fn get_value(&self) -> OwnedValue {
        OwnedValue::from(subtree_map(&self.shared, &self.path, false))
    }

    #[zbus(name = "GetText")]
    async fn get_text(&self) -> OwnedValue {
        OwnedValue::from(subtree_map(&self.shared, &self.path, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zbus::zvariant::OwnedObjectPath;

    #[test]
    fn subtree_is_relative_to_node() {
        let mut s = DbusSharedState::new(OwnedObjectPath::try_from("/").unwrap());
        s.paths.insert("/Ac/Out/L1/P".into(), serde_json::json!(100.0));
        s.paths.insert("/Ac/Out/L2/P".into(), serde_json::json!(50.0));
        s.paths.insert("/Dc/0/Voltage".into(), serde_json::json!(26.5));
        let shared = Mutex::new(s);

        let map = subtree_map(&shared, "/Ac/Out", false);
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("L1/P"));

        let all = subtree_map(&shared, "/", true);
        assert_eq!(all.len(), 3);
        let text = <&str as TryFrom<&OwnedValue>>::try_from(&all["Dc/0/Voltage"]).unwrap();
        assert_eq!(text, "26.5 V");
    }
}
