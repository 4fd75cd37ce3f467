use async_trait::async_trait;
use std::time::Duration;
use tokio::time::timeout;
use zbus::Connection;

use super::items::BusItem;
use crate::error::{BridgeError, Result};
use crate::sources::BusReader;

const CALL_TIMEOUT: Duration = Duration::from_millis(600);

/// Reads BusItem values exported by other services
#[derive(Clone)]
pub struct RemoteBus {
    connection: Connection,
}

impl RemoteBus {
    pub const fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub async fn read_remote_value(&self, service_name: &str, path: &str) -> Result<serde_json::Value> {
        let proxy = timeout(
            CALL_TIMEOUT,
            zbus::Proxy::new(&self.connection, service_name, path, "com.victronenergy.BusItem"),
        )
        .await
        .map_err(|_| BridgeError::dbus("DBus proxy creation timed out"))?
        .map_err(|e| BridgeError::dbus(format!("Proxy creation failed: {}", e)))?;

        let val: zbus::zvariant::OwnedValue = timeout(CALL_TIMEOUT, proxy.call("GetValue", &()))
            .await
            .map_err(|_| BridgeError::dbus(format!("GetValue {}{} timed out", service_name, path)))?
            .map_err(|e| BridgeError::dbus(format!("GetValue {}{} failed: {}", service_name, path, e)))?;

        Ok(BusItem::owned_value_to_serde(&val))
    }
}

#[async_trait]
impl BusReader for RemoteBus {
    async fn list_services(&self, prefix: &str) -> Result<Vec<String>> {
        let proxy = zbus::fdo::DBusProxy::new(&self.connection)
            .await
            .map_err(|e| BridgeError::dbus(format!("DBusProxy creation failed: {}", e)))?;
        let names = timeout(CALL_TIMEOUT, proxy.list_names())
            .await
            .map_err(|_| BridgeError::dbus("ListNames timed out"))?
            .map_err(|e| BridgeError::dbus(format!("ListNames failed: {}", e)))?;
        Ok(names
            .into_iter()
            .map(|n| n.to_string())
            .filter(|n| n.starts_with(prefix))
            .collect())
    }

    async fn read_f64(&self, service: &str, path: &str) -> Result<f64> {
        let value = self.read_remote_value(service, path).await?;
        value.as_f64().ok_or_else(|| {
            BridgeError::dbus(format!("{}{} is not numeric: {}", service, path, value))
        })
    }
}
