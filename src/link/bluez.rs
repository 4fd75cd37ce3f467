//! BlueZ backend reached over the system D-Bus

use super::transport::{Block, GattTransport};
use crate::config::AddressType;
use crate::error::{BridgeError, Result};
use crate::logging::{StructuredLogger, get_logger};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use zbus::Connection;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};

const BLUEZ: &str = "org.bluez";
const ADAPTER_IFACE: &str = "org.bluez.Adapter1";
const DEVICE_IFACE: &str = "org.bluez.Device1";
const SERVICE_IFACE: &str = "org.bluez.GattService1";
const CHAR_IFACE: &str = "org.bluez.GattCharacteristic1";
const RESOLVE_POLL: Duration = Duration::from_millis(100);

type ManagedObjects = HashMap<OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>>;

/// Object path BlueZ uses for a device on an adapter
pub fn device_object_path(adapter: &str, mac: &str) -> String {
    format!(
        "/org/bluez/{}/dev_{}",
        adapter,
        mac.trim().to_ascii_uppercase().replace(':', "_")
    )
}

fn uuid_of(ifaces: &HashMap<String, HashMap<String, OwnedValue>>, iface: &str) -> Option<String> {
    let props = ifaces.get(iface)?;
    let v = props.get("UUID")?;
    <&str as TryFrom<&OwnedValue>>::try_from(v)
        .ok()
        .map(str::to_ascii_lowercase)
}

/// Locate each block's characteristic under `device_path`, checking that
/// it sits in the expected service.
pub fn resolve_characteristics(
    objects: &ManagedObjects,
    device_path: &str,
) -> HashMap<Block, OwnedObjectPath> {
    let prefix = format!("{}/", device_path);
    let mut found = HashMap::new();
    for (path, ifaces) in objects {
        let p = path.as_str();
        if !p.starts_with(&prefix) {
            continue;
        }
        let Some(uuid) = uuid_of(ifaces, CHAR_IFACE) else {
            continue;
        };
        let Some(block) = Block::ROUND
            .into_iter()
            .find(|b| b.characteristic_uuid() == uuid)
        else {
            continue;
        };
        let service_ok = p.rsplit_once('/').is_some_and(|(parent, _)| {
            objects
                .iter()
                .find(|(sp, _)| sp.as_str() == parent)
                .and_then(|(_, si)| uuid_of(si, SERVICE_IFACE))
                .is_none_or(|su| su == block.service_uuid())
        });
        if service_ok {
            found.insert(block, path.clone());
        }
    }
    found
}

/// GATT transport backed by BlueZ
pub struct BluezTransport {
    adapter: String,
    mac: String,
    conn: Option<Connection>,
    characteristics: HashMap<Block, OwnedObjectPath>,
    connected: bool,
    last_address_type: Option<AddressType>,
    logger: StructuredLogger,
}

impl BluezTransport {
    pub fn new(adapter: &str, mac: &str) -> Self {
        Self {
            adapter: adapter.to_string(),
            mac: mac.trim().to_ascii_uppercase(),
            conn: None,
            characteristics: HashMap::new(),
            connected: false,
            last_address_type: None,
            logger: get_logger("bluez"),
        }
    }

    fn adapter_path(&self) -> String {
        format!("/org/bluez/{}", self.adapter)
    }

    fn device_path(&self) -> String {
        device_object_path(&self.adapter, &self.mac)
    }

    async fn bus(&mut self) -> Result<Connection> {
        if let Some(c) = &self.conn {
            return Ok(c.clone());
        }
        let c = Connection::system()
            .await
            .map_err(|e| BridgeError::link_lost(format!("System bus unavailable: {}", e)))?;
        self.conn = Some(c.clone());
        Ok(c)
    }

    async fn managed_objects(conn: &Connection) -> Result<ManagedObjects> {
        let proxy = zbus::Proxy::new(conn, BLUEZ, "/", "org.freedesktop.DBus.ObjectManager")
            .await
            .map_err(|e| BridgeError::link(format!("ObjectManager proxy failed: {}", e)))?;
        proxy
            .call("GetManagedObjects", &())
            .await
            .map_err(|e| BridgeError::link(format!("GetManagedObjects failed: {}", e)))
    }

    async fn device_bool(conn: &Connection, device_path: &str, property: &str) -> Result<bool> {
        let proxy = zbus::Proxy::new(conn, BLUEZ, device_path, "org.freedesktop.DBus.Properties")
            .await
            .map_err(|e| BridgeError::link(format!("Properties proxy failed: {}", e)))?;
        let v: OwnedValue = proxy
            .call("Get", &(DEVICE_IFACE, property))
            .await
            .map_err(|e| BridgeError::link(format!("Get {} failed: {}", property, e)))?;
        bool::try_from(v).map_err(|e| BridgeError::link(format!("{} not a bool: {}", property, e)))
    }

    async fn remove_device(&self, conn: &Connection, device_path: &str) {
        let Ok(adapter) = zbus::Proxy::new(conn, BLUEZ, self.adapter_path(), ADAPTER_IFACE).await
        else {
            return;
        };
        let Ok(path) = ObjectPath::try_from(device_path) else {
            return;
        };
        if let Err(e) = adapter.call::<_, _, ()>("RemoveDevice", &(path,)).await {
            self.logger
                .debug(&format!("RemoveDevice {} ignored: {}", device_path, e));
        }
    }

    async fn connect_new_device(&self, conn: &Connection, address_type: AddressType) -> Result<()> {
        let adapter = zbus::Proxy::new(conn, BLUEZ, self.adapter_path(), ADAPTER_IFACE)
            .await
            .map_err(|e| BridgeError::link_lost(format!("Adapter {} unavailable: {}", self.adapter, e)))?;
        let mut props: HashMap<&str, Value<'_>> = HashMap::new();
        props.insert("Address", Value::from(self.mac.as_str()));
        props.insert("AddressType", Value::from(address_type.as_str()));
        adapter
            .call::<_, _, OwnedObjectPath>("ConnectDevice", &(props,))
            .await
            .map_err(|e| BridgeError::link_lost(format!("ConnectDevice {} failed: {}", self.mac, e)))?;
        Ok(())
    }
}

#[async_trait]
impl GattTransport for BluezTransport {
    async fn connect(&mut self, address_type: AddressType) -> Result<()> {
        let conn = self.bus().await?;
        let device_path = self.device_path();

        // A cached device keeps its old address type; drop it so BlueZ uses the new one
        if self.last_address_type.is_some_and(|t| t != address_type) {
            self.remove_device(&conn, &device_path).await;
        }
        self.last_address_type = Some(address_type);

        let objects = Self::managed_objects(&conn).await?;
        let known = objects.keys().any(|p| p.as_str() == device_path);
        if known {
            let device = zbus::Proxy::new(&conn, BLUEZ, device_path.as_str(), DEVICE_IFACE)
                .await
                .map_err(|e| BridgeError::link_lost(format!("Device proxy failed: {}", e)))?;
            device
                .call::<_, _, ()>("Connect", &())
                .await
                .map_err(|e| BridgeError::link_lost(format!("Connect {} failed: {}", self.mac, e)))?;
        } else {
            self.connect_new_device(&conn, address_type).await?;
        }

        // Services resolve asynchronously after Connect returns; the caller's timeout bounds this
        while !Self::device_bool(&conn, &device_path, "ServicesResolved").await? {
            tokio::time::sleep(RESOLVE_POLL).await;
        }

        let objects = Self::managed_objects(&conn).await?;
        let chars = resolve_characteristics(&objects, &device_path);
        for block in Block::ROUND {
            if !chars.contains_key(&block) {
                return Err(BridgeError::link_lost(format!(
                    "Characteristic {} ({}) not found on {}",
                    block,
                    block.characteristic_uuid(),
                    self.mac
                )));
            }
        }
        self.characteristics = chars;
        self.connected = true;
        self.logger.debug(&format!(
            "Connected {} on {} ({})",
            self.mac,
            self.adapter,
            address_type.as_str()
        ));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.characteristics.clear();
        let Some(conn) = self.conn.clone() else {
            return Ok(());
        };
        let device_path = self.device_path();
        let device = zbus::Proxy::new(&conn, BLUEZ, device_path.as_str(), DEVICE_IFACE).await?;
        if let Err(e) = device.call::<_, _, ()>("Disconnect", &()).await {
            self.logger.debug(&format!("Disconnect ignored: {}", e));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn read_block(&mut self, block: Block) -> Result<Vec<u8>> {
        let conn = self
            .conn
            .clone()
            .ok_or_else(|| BridgeError::link_lost("Not connected"))?;
        let path = self
            .characteristics
            .get(&block)
            .cloned()
            .ok_or_else(|| BridgeError::link_lost(format!("{} not resolved; not connected", block)))?;
        let proxy = zbus::Proxy::new(&conn, BLUEZ, path.as_str(), CHAR_IFACE)
            .await
            .map_err(|e| BridgeError::link(format!("{} proxy failed: {}", block, e)))?;
        let options: HashMap<&str, Value<'_>> = HashMap::new();
        proxy
            .call("ReadValue", &(options,))
            .await
            .map_err(|e| BridgeError::link(format!("ReadValue {} failed: {}", block, e)))
    }

    fn describe(&self) -> String {
        format!("Bluetooth {}", self.adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ov(s: &str) -> OwnedValue {
        OwnedValue::try_from(Value::from(s)).unwrap()
    }

    fn entry(iface: &str, uuid: &str) -> HashMap<String, HashMap<String, OwnedValue>> {
        let mut props = HashMap::new();
        props.insert("UUID".to_string(), ov(uuid));
        let mut ifaces = HashMap::new();
        ifaces.insert(iface.to_string(), props);
        ifaces
    }

    fn path(p: &str) -> OwnedObjectPath {
        OwnedObjectPath::try_from(p).unwrap()
    }

    #[test]
    fn device_path_from_mac() {
        assert_eq!(
            device_object_path("hci0", "aa:bb:cc:dd:ee:ff"),
            "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF"
        );
    }

    #[test]
    fn characteristics_resolve_under_matching_services() {
        let dev = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF";
        let mut objects: ManagedObjects = HashMap::new();
        objects.insert(
            path(&format!("{dev}/service0010")),
            entry(SERVICE_IFACE, Block::Inverter.service_uuid()),
        );
        objects.insert(
            path(&format!("{dev}/service0010/char0011")),
            entry(CHAR_IFACE, Block::Inverter.characteristic_uuid()),
        );
        objects.insert(
            path(&format!("{dev}/service0020")),
            entry(SERVICE_IFACE, "0000180f-0000-1000-8000-00805f9b34fb"),
        );
        // right characteristic, wrong service: ignored
        objects.insert(
            path(&format!("{dev}/service0020/char0021")),
            entry(CHAR_IFACE, Block::Pv.characteristic_uuid()),
        );

        let chars = resolve_characteristics(&objects, dev);
        assert_eq!(
            chars.get(&Block::Inverter).map(|p| p.as_str().to_string()),
            Some(format!("{dev}/service0010/char0011"))
        );
        assert!(!chars.contains_key(&Block::Pv));
    }
}
