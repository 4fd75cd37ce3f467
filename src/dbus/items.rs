use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use zbus::Connection;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};

use super::root::RootBus;
use super::shared::DbusSharedState;
use super::util::{format_text_value, text_owned_value};

/// VeDbus-style leaf item implementing com.victronenergy.BusItem
pub struct BusItem {
    pub(crate) path: String,
    pub(crate) shared: Arc<Mutex<DbusSharedState>>,
}

impl BusItem {
    pub fn new(path: String, shared: Arc<Mutex<DbusSharedState>>) -> Self {
        Self { path, shared }
    }

    fn current(&self) -> serde_json::Value {
        let shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        shared
            .paths
            .get(&self.path)
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }

    /// Null is published as an empty array, the VeDbus "invalid" marker
    pub(crate) fn serde_to_owned_value(v: &serde_json::Value) -> OwnedValue {
        let zero = || OwnedValue::from(0i64);
        match v {
            serde_json::Value::Null => {
                OwnedValue::try_from(Value::from(Vec::<i32>::new())).unwrap_or_else(|_| zero())
            }
            serde_json::Value::Bool(b) => OwnedValue::from(i64::from(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    OwnedValue::from(i)
                } else if let Some(u) = n.as_u64() {
                    OwnedValue::from(u)
                } else {
                    OwnedValue::from(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => {
                OwnedValue::try_from(Value::from(s.as_str())).unwrap_or_else(|_| zero())
            }
            _ => zero(),
        }
    }

    pub(crate) fn owned_value_to_serde(v: &OwnedValue) -> serde_json::Value {
        if let Ok(b) = <bool as TryFrom<&OwnedValue>>::try_from(v) {
            return serde_json::json!(b);
        }
        if let Ok(i) = <i64 as TryFrom<&OwnedValue>>::try_from(v) {
            return serde_json::json!(i);
        }
        if let Ok(i) = <i32 as TryFrom<&OwnedValue>>::try_from(v) {
            return serde_json::json!(i);
        }
        if let Ok(u) = <u64 as TryFrom<&OwnedValue>>::try_from(v) {
            return serde_json::json!(u);
        }
        if let Ok(u) = <u32 as TryFrom<&OwnedValue>>::try_from(v) {
            return serde_json::json!(u);
        }
        if let Ok(u) = <u8 as TryFrom<&OwnedValue>>::try_from(v) {
            return serde_json::json!(u);
        }
        if let Ok(f) = <f64 as TryFrom<&OwnedValue>>::try_from(v) {
            return serde_json::json!(f);
        }
        if let Ok(s) = <&str as TryFrom<&OwnedValue>>::try_from(v) {
            return serde_json::json!(s.to_string());
        }
        serde_json::Value::Null
    }
}

/// Emit PropertiesChanged on the item and ItemsChanged on the service root
pub(crate) async fn emit_value_changed(
    conn: &Connection,
    root_path: &OwnedObjectPath,
    path: &str,
    value: &serde_json::Value,
) -> zbus::Result<()> {
    let entry = || {
        let mut m: HashMap<&str, OwnedValue> = HashMap::new();
        m.insert("Value", BusItem::serde_to_owned_value(value));
        m.insert("Text", text_owned_value(path, value));
        m
    };

    let item_path = OwnedObjectPath::try_from(path)?;
    let item_ctx = SignalEmitter::new(conn, item_path)?;
    BusItem::properties_changed(&item_ctx, entry()).await?;

    let root_ctx = SignalEmitter::new(conn, root_path.clone())?;
    let mut outer: HashMap<&str, HashMap<&str, OwnedValue>> = HashMap::new();
    outer.insert(path, entry());
    RootBus::items_changed(&root_ctx, outer).await
}

#[zbus::interface(name = "com.victronenergy.BusItem")]
impl BusItem {
    #[zbus(name = "GetValue")]
    async fn get_value(&self) -> OwnedValue {
        Self::serde_to_owned_value(&self.current())
    }

    /// Only paths registered as writable accept a value; 0 means accepted
    #[zbus(name = "SetValue")]
    async fn set_value(&self, value: OwnedValue) -> i32 {
        let json = Self::owned_value_to_serde(&value);
        let (conn, root_path) = {
            let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
            if !shared.writable.contains(&self.path) {
                return 1;
            }
            shared.paths.insert(self.path.clone(), json.clone());
            (shared.connection.clone(), shared.root_path.clone())
        };
        if let Some(conn) = conn {
            let _ = emit_value_changed(&conn, &root_path, &self.path, &json).await;
        }
        0
    }

    #[zbus(name = "GetText")]
    async fn get_text(&self) -> String {
        format_text_value(&self.path, &self.current())
    }

    #[zbus(signal)]
    pub async fn properties_changed(
        ctxt: &SignalEmitter<'_>,
        changes: HashMap<&str, OwnedValue>,
    ) -> zbus::Result<()>;
}
