//! D-Bus integration for Venus OS compatibility
//!
//! Each published device is a VeDbus-style service: one object per path
//! implementing `com.victronenergy.BusItem`, intermediate tree nodes and a
//! root object that emits `ItemsChanged`. `RemoteBus` is the read side used
//! to import values from other services.

mod items;
mod remote;
mod root;
mod service;
mod shared;
mod util;

pub use items::BusItem;
pub use remote::RemoteBus;
pub use root::{RootBus, TreeNode};
pub use service::{UPDATE_INDEX_PATH, VeService, connect_bus};
pub use shared::DbusSharedState;
