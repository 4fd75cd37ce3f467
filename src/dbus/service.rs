use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use zbus::zvariant::OwnedObjectPath;
use zbus::{Connection, Result as ZbusResult, names::WellKnownName};

use crate::error::{BridgeError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};

use super::items::{BusItem, emit_value_changed};
use super::root::{RootBus, TreeNode};
use super::shared::DbusSharedState;

pub const UPDATE_INDEX_PATH: &str = "/UpdateIndex";

/// Open a bus connection, preferring the system bus
pub async fn connect_bus(logger: &StructuredLogger) -> Result<Connection> {
    match Connection::system().await {
        Ok(c) => Ok(c),
        Err(e_sys) => match Connection::session().await {
            Ok(c) => {
                logger.warn(&format!(
                    "System bus unavailable ({}); using session bus",
                    e_sys
                ));
                Ok(c)
            }
            Err(e_sess) => Err(BridgeError::dbus(format!(
                "DBus connect failed: system={} session={}",
                e_sys, e_sess
            ))),
        },
    }
}

/// One exported VeDbus-style service.
///
/// Without a connection the service keeps its values in memory only, which
/// is how dry-run mode and the tests use it.
pub struct VeService {
    logger: StructuredLogger,
    service_name: String,
    connection: Option<Connection>,
    pub(crate) shared: Arc<Mutex<DbusSharedState>>,
    registered_paths: HashSet<String>,
    root_path: OwnedObjectPath,
}

impl VeService {
    pub fn new(service_name: &str) -> Result<Self> {
        let root_path = OwnedObjectPath::try_from("/")
            .map_err(|e| BridgeError::dbus(format!("Invalid object path: {}", e)))?;
        Ok(Self {
            logger: get_logger_with_context(
                LogContext::new("dbus").with_field("service", service_name.to_string()),
            ),
            service_name: service_name.to_string(),
            connection: None,
            shared: Arc::new(Mutex::new(DbusSharedState::new(root_path.clone()))),
            registered_paths: HashSet::new(),
            root_path,
        })
    }

    fn shared(&self) -> MutexGuard<'_, DbusSharedState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub const fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Attach to a bus connection, export every known path and claim the name
    pub async fn start(&mut self, connection: Connection) -> Result<()> {
        let root = RootBus {
            shared: Arc::clone(&self.shared),
        };
        connection
            .object_server()
            .at(&self.root_path, root)
            .await
            .map_err(|e| BridgeError::dbus(format!("Register root BusItem failed: {}", e)))?;
        self.shared().connection = Some(connection.clone());
        self.connection = Some(connection.clone());

        // Paths added while offline were only recorded; export them now
        let leaves: Vec<String> = self.shared().paths.keys().cloned().collect();
        self.registered_paths.clear();
        for leaf in leaves {
            self.register_objects(&leaf).await?;
        }

        self.request_name(&connection)
            .await
            .map_err(|e| BridgeError::dbus(format!("RequestName {} failed: {}", self.service_name, e)))?;
        self.logger
            .info(&format!("D-Bus service started: {}", self.service_name));
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(conn) = self.connection.take() {
            self.shared().connection = None;
            if let Ok(name) = WellKnownName::try_from(self.service_name.as_str())
                && let Err(e) = conn.release_name(name).await
            {
                self.logger.debug(&format!("ReleaseName failed: {}", e));
            }
            self.logger
                .info(&format!("D-Bus service stopped: {}", self.service_name));
        }
    }

    /// Register `path` with an initial value unless it already exists
    pub async fn add_path(
        &mut self,
        path: &str,
        initial_value: serde_json::Value,
        writable: bool,
    ) -> Result<()> {
        self.register_objects(path).await?;
        let mut shared = self.shared();
        shared
            .paths
            .entry(path.to_string())
            .or_insert(initial_value);
        if writable {
            shared.writable.insert(path.to_string());
        }
        Ok(())
    }

    /// Export object nodes for `path` and its parents
    async fn register_objects(&mut self, path: &str) -> Result<()> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for i in 1..=segments.len() {
            let subpath = format!("/{}", segments[..i].join("/"));
            if self.registered_paths.contains(&subpath) {
                continue;
            }
            let obj_path = OwnedObjectPath::try_from(subpath.as_str()).map_err(|e| {
                BridgeError::dbus(format!("Invalid object path '{}': {}", subpath, e))
            })?;
            if let Some(conn) = &self.connection {
                let registered = if i == segments.len() {
                    let item = BusItem::new(subpath.clone(), Arc::clone(&self.shared));
                    conn.object_server().at(&obj_path, item).await
                } else {
                    let node = TreeNode::new(subpath.clone(), Arc::clone(&self.shared));
                    conn.object_server().at(&obj_path, node).await
                };
                registered.map_err(|e| {
                    BridgeError::dbus(format!("Register object failed for {}: {}", subpath, e))
                })?;
            }
            self.registered_paths.insert(subpath);
        }
        Ok(())
    }

    /// Set one path; returns whether the value changed
    pub async fn update_path(&mut self, path: &str, value: serde_json::Value) -> Result<bool> {
        {
            let shared = self.shared();
            if shared.paths.get(path) == Some(&value) {
                return Ok(false);
            }
        }
        if !self.registered_paths.contains(path) {
            self.register_objects(path).await?;
        }
        self.shared().paths.insert(path.to_string(), value.clone());
        if let Some(conn) = &self.connection
            && let Err(e) = emit_value_changed(conn, &self.root_path, path, &value).await
        {
            self.logger
                .debug(&format!("Change signal for {} failed: {}", path, e));
        }
        Ok(true)
    }

    /// Apply a batch of updates and bump `/UpdateIndex` once (mod 256).
    ///
    /// A path that fails does not stop the rest of the batch; the first
    /// failure is returned after the index has been bumped.
    pub async fn publish(
        &mut self,
        updates: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) -> Result<usize> {
        let mut changed = 0;
        let mut first_error = None;
        for (path, value) in updates {
            match self.update_path(&path, value).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        let next = (self.update_index() + 1) % 256;
        self.update_path(UPDATE_INDEX_PATH, serde_json::json!(next))
            .await?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(changed),
        }
    }

    pub fn update_index(&self) -> u64 {
        self.shared()
            .paths
            .get(UPDATE_INDEX_PATH)
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
    }

    /// Current value of `path`, if registered
    pub fn value(&self, path: &str) -> Option<serde_json::Value> {
        self.shared().paths.get(path).cloned()
    }

    pub fn f64_value(&self, path: &str) -> Option<f64> {
        self.value(path).as_ref().and_then(serde_json::Value::as_f64)
    }

    async fn request_name(&self, connection: &Connection) -> ZbusResult<()> {
        use zbus::fdo::{DBusProxy, RequestNameFlags};
        let proxy = DBusProxy::new(connection).await?;
        let name = WellKnownName::try_from(self.service_name.as_str())?;
        let _ = proxy
            .request_name(name, RequestNameFlags::ReplaceExisting.into())
            .await?;
        Ok(())
    }
}
