//! Virtual-device registry and operator control surface.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::sync::{Arc, Mutex};

use lsvbd_map::{MapKind, SectorMap};
use tracing::info;

use crate::device::VirtualDevice;
use crate::io::{BackendSink, CloneSink};
use crate::{FileBackend, Result, VbdError, SECTOR_OFFSET};

pub const DEVICE_NAME_PREFIX: &str = "lsvbd";

/// Source of truth for bound devices, plus the global log head shared by
/// every device's write path.
pub struct Registry {
    selected: Mutex<Option<MapKind>>,
    devices: Mutex<Vec<Arc<VirtualDevice>>>,
    next_free_sector: AtomicU64,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            selected: Mutex::new(None),
            devices: Mutex::new(Vec::new()),
            next_free_sector: AtomicU64::new(SECTOR_OFFSET),
        })
    }

    /// Selects the back-end used by subsequent binds.
    pub fn set_data_structure(&self, tag: &str) -> Result<MapKind> {
        let kind: MapKind = tag
            .parse()
            .map_err(|()| VbdError::UnknownBackend(tag.to_string()))?;
        *self.selected.lock().expect("registry poisoned") = Some(kind);
        info!(%kind, "selected map back-end");
        Ok(kind)
    }

    pub fn selected(&self) -> Option<MapKind> {
        *self.selected.lock().expect("registry poisoned")
    }

    /// Opens `path` read-write and binds it as the backing device of
    /// `lsvbd<index>`.
    pub fn set_redirect_bd(&self, index: u32, path: &Path) -> Result<String> {
        let backend = FileBackend::open_rw(path)?;
        self.bind_with_sink(
            index,
            path.display().to_string(),
            Arc::new(BackendSink::new(backend)),
        )
    }

    /// Registers `lsvbd<index>` over an arbitrary clone sink. The device
    /// list is left untouched on any failure.
    pub fn bind_with_sink(
        &self,
        index: u32,
        backing_name: String,
        sink: Arc<dyn CloneSink>,
    ) -> Result<String> {
        let kind = self.selected().ok_or(VbdError::BackendNotSelected)?;
        let name = format!("{DEVICE_NAME_PREFIX}{index}");
        let mut devices = self.devices.lock().expect("registry poisoned");
        if devices.iter().any(|d| d.name() == name) {
            return Err(VbdError::DuplicateName(name));
        }
        devices.push(Arc::new(VirtualDevice::new(
            name.clone(),
            backing_name,
            SectorMap::new(kind),
            sink,
        )));
        info!(device = %name, backend = %kind, "bound virtual device");
        Ok(name)
    }

    /// Destroys the device at the given 1-based listing position. Teardown
    /// order inside the record: map first, then the backing sink.
    pub fn delete_bd(&self, index: usize) -> Result<()> {
        let mut devices = self.devices.lock().expect("registry poisoned");
        if index == 0 || index > devices.len() {
            return Err(VbdError::BadIndex(index));
        }
        let device = devices.remove(index - 1);
        drop(devices);
        info!(device = %device.name(), "unbound virtual device");
        // Last registry reference: the record (map, then sink) drops here
        // unless in-flight I/O still pins it.
        drop(device);
        Ok(())
    }

    /// Lines `N. <virtual_name> -> <backing_name>`, 1-based.
    pub fn vbd_names(&self) -> String {
        let devices = self.devices.lock().expect("registry poisoned");
        let mut out = String::new();
        for (i, device) in devices.iter().enumerate() {
            writeln!(out, "{}. {} -> {}", i + 1, device.name(), device.backing_name())
                .expect("string write");
        }
        out
    }

    /// Lines `N. <tag>`, one per recognized back-end.
    pub fn data_structures(&self) -> String {
        let mut out = String::new();
        for (i, kind) in MapKind::ALL.iter().enumerate() {
            writeln!(out, "{}. {}", i + 1, kind).expect("string write");
        }
        out
    }

    pub fn device_by_name(&self, name: &str) -> Option<Arc<VirtualDevice>> {
        self.devices
            .lock()
            .expect("registry poisoned")
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    /// 0-based positional lookup.
    pub fn device_at(&self, index: usize) -> Option<Arc<VirtualDevice>> {
        self.devices
            .lock()
            .expect("registry poisoned")
            .get(index)
            .cloned()
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().expect("registry poisoned").len()
    }

    /// Hands out `sectors` fresh physical sectors from the log head.
    pub(crate) fn allocate(&self, sectors: u64) -> u64 {
        self.next_free_sector.fetch_add(sectors, SeqCst)
    }

    /// Current log-head position (next sector that would be allocated).
    pub fn log_head(&self) -> u64 {
        self.next_free_sector.load(SeqCst)
    }
}
