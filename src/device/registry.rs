//! # Device Registry
//!
//! Process-wide id → device map with hot add/remove, guarded by one
//! mutex. Per-device state is self-contained; the registry only hands
//! out `Arc`s and enforces that a device is not removed while open or
//! claimed.

use std::sync::{Arc, OnceLock};

use eyre::{bail, Result};
use hashbrown::HashMap;
use log::info;
use parking_lot::Mutex;

use super::Device;

#[derive(Default)]
pub struct Registry {
    devices: Mutex<RegistryMap>,
}

#[derive(Default)]
struct RegistryMap {
    by_id: HashMap<u32, Arc<Device>>,
    next_id: u32,
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static Registry {
        GLOBAL.get_or_init(Registry::new)
    }

    /// Create a new unconfigured device and return it.
    pub fn add(&self) -> Arc<Device> {
        let mut map = self.devices.lock();
        let id = map.next_id;
        map.next_id += 1;
        let device = Device::new(id);
        map.by_id.insert(id, Arc::clone(&device));
        info!("added device cram{id}");
        device
    }

    pub fn get(&self, id: u32) -> Option<Arc<Device>> {
        self.devices.lock().by_id.get(&id).cloned()
    }

    /// Tear down and unregister a device. Refused while it is open or
    /// mid-reset.
    pub fn remove(&self, id: u32) -> Result<()> {
        let device = {
            let map = self.devices.lock();
            match map.by_id.get(&id) {
                Some(device) => Arc::clone(device),
                None => bail!("no such device: {id}"),
            }
        };

        if device.is_busy() {
            bail!("device cram{id} is busy");
        }
        device.reset()?;

        self.devices.lock().by_id.remove(&id);
        info!("removed device cram{id}");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.devices.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_assigns_sequential_ids() {
        let registry = Registry::new();

        let a = registry.add();
        let b = registry.add();

        assert_eq!(a.id(), 0);
        assert_eq!(b.id(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn get_returns_registered_devices() {
        let registry = Registry::new();
        let dev = registry.add();

        assert!(Arc::ptr_eq(&registry.get(dev.id()).unwrap(), &dev));
        assert!(registry.get(999).is_none());
    }

    #[test]
    fn remove_tears_down() {
        let registry = Registry::new();
        let dev = registry.add();
        dev.set_disksize(1 << 16).unwrap();

        registry.remove(dev.id()).unwrap();

        assert!(registry.get(dev.id()).is_none());
        assert!(!dev.init_done());
    }

    #[test]
    fn remove_refused_while_open() {
        let registry = Registry::new();
        let dev = registry.add();

        let handle = dev.open().unwrap();
        assert!(registry.remove(dev.id()).is_err());
        drop(handle);

        registry.remove(dev.id()).unwrap();
    }

    #[test]
    fn remove_unknown_id_fails() {
        let registry = Registry::new();
        assert!(registry.remove(7).is_err());
    }
}
