use std::sync::Arc;

use lsvbd_map::SectorMap;

use crate::CloneSink;

/// One bound virtual device: its name, its indirection map, and the sink its
/// clones are submitted to.
pub struct VirtualDevice {
    name: String,
    backing_name: String,
    // Field order is teardown order: the map (and every node it retired)
    // goes first, the backing sink after.
    map: SectorMap,
    sink: Arc<dyn CloneSink>,
}

impl VirtualDevice {
    pub(crate) fn new(
        name: String,
        backing_name: String,
        map: SectorMap,
        sink: Arc<dyn CloneSink>,
    ) -> Self {
        Self {
            name,
            backing_name,
            map,
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backing_name(&self) -> &str {
        &self.backing_name
    }

    pub fn map(&self) -> &SectorMap {
        &self.map
    }

    pub fn sink(&self) -> &Arc<dyn CloneSink> {
        &self.sink
    }
}
