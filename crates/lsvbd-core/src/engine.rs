//! The I/O redirection engine: write-path log allocator, read-path segment
//! resolver, and the split driver that fans one read across discontiguous
//! mapped segments.

use std::sync::Arc;

use lsvbd_map::{MapError, Mapping};
use tracing::{debug, error, warn};

use crate::device::VirtualDevice;
use crate::io::{CloneIo, IoOp, IoRequest};
use crate::registry::Registry;
use crate::{Result, VbdError, SECTOR_SIZE};

const SECTOR_BYTES: u64 = SECTOR_SIZE as u64;

pub struct Engine {
    registry: Arc<Registry>,
}

impl Engine {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Entry point for one original request. Looks up the virtual device,
    /// derives clone descriptors, and submits them; the original completes
    /// when its last clone does, or immediately with an error when setup
    /// fails.
    pub fn submit(&self, request: IoRequest) {
        let Some(device) = self.registry.device_by_name(&request.device) else {
            error!(device = %request.device, "no such virtual device");
            request
                .completion
                .complete_unit(Err(VbdError::NoSuchDevice(request.device.clone())));
            return;
        };

        let outcome = match request.op {
            IoOp::Write => self.write_redirect(&device, &request),
            IoOp::Read => self.read_resolve(&device, &request),
            IoOp::Other(op) => {
                warn!(op, "unknown operation, passing through");
                self.submit_tail(&device, &request, request.sector, request.size_bytes(), 0);
                Ok(())
            }
        };

        if let Err(e) = outcome {
            error!(device = %request.device, error = %e, "request setup failed");
            request.completion.complete_unit(Err(e));
        }
    }

    /// Write path. Every accepted write advances the log head exactly once,
    /// then replaces any previous mapping for its LBA.
    fn write_redirect(&self, device: &VirtualDevice, request: &IoRequest) -> Result<()> {
        let size = request.size_bytes();
        if size == 0 || size % SECTOR_SIZE != 0 {
            return Err(VbdError::Misaligned);
        }
        let lba = request.sector;
        let pba = self.registry.allocate(u64::from(size / SECTOR_SIZE));
        let mapping = Mapping::new(pba, size);
        debug!(lba, pba, size, "write redirect");

        loop {
            if device.map().lookup(lba).is_some() {
                // The old range becomes dead space in the log; nothing reclaims it.
                device.map().remove(lba);
            }
            match device.map().insert(lba, mapping) {
                Ok(()) => break,
                // A racing write to the same LBA slipped its mapping in
                // between our remove and insert; take it out and retry. The
                // last insert to land wins, exactly as the allocator already
                // ordered the writes.
                Err(MapError::DuplicateKey(_)) => {
                    debug!(lba, "write lost an insert race, retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.submit_tail(device, request, pba, size, 0);
        Ok(())
    }

    /// Read path: classify, then resolve against the map.
    fn read_resolve(&self, device: &VirtualDevice, request: &IoRequest) -> Result<()> {
        let size = request.size_bytes();
        if size == 0 || size % SECTOR_SIZE != 0 {
            return Err(VbdError::Misaligned);
        }
        let lba = request.sector;

        if let Some(seg) = device.map().lookup(lba) {
            // Exact match: the read starts where a prior write started.
            debug!(lba, pba = seg.pba_start, seg_len = seg.length_bytes, "read exact match");
            self.resolve_chain(device, request, seg.pba_start, seg.length_bytes);
            return Ok(());
        }

        if self.is_system_io(device, lba) {
            // Bring-up probes at arbitrary sectors pass through untouched.
            debug!(lba, "system i/o passthrough");
            self.submit_tail(device, request, lba, size, 0);
            return Ok(());
        }

        let Some((prev_key, prev)) = device.map().predecessor(lba) else {
            // Nothing mapped below the read either; complete it as-is.
            debug!(lba, "unmapped read without predecessor, passthrough");
            self.submit_tail(device, request, lba, size, 0);
            return Ok(());
        };

        // The read begins inside (or past) the predecessor's segment.
        let redirect_byte = prev.pba_start * SECTOR_BYTES + (lba - prev_key) * SECTOR_BYTES;
        let end_of_prev = prev.pba_start * SECTOR_BYTES + u64::from(prev.length_bytes);
        let target = redirect_byte / SECTOR_BYTES;
        debug!(
            lba,
            prev_key,
            target,
            to_end = end_of_prev as i64 - redirect_byte as i64,
            "read within prior write"
        );
        if redirect_byte >= end_of_prev {
            // Starts in the unmapped gap past the segment; read contiguously
            // from where the segment's layout puts it.
            self.submit_tail(device, request, target, size, 0);
            return Ok(());
        }
        let to_end_of_block = (end_of_prev - redirect_byte) as u32;
        self.resolve_chain(device, request, target, to_end_of_block);
        Ok(())
    }

    /// A read is system I/O when nothing is mapped, when it probes sector 0,
    /// or when it starts above every mapped key.
    fn is_system_io(&self, device: &VirtualDevice, lba: u64) -> bool {
        if device.map().is_empty() {
            return true;
        }
        lba == 0 || lba > device.map().greatest_key().unwrap_or(0)
    }

    /// Split driver. Starting from the first resolved piece (`target`,
    /// `piece` bytes of it usable), peels children off the request until the
    /// remainder fits the current segment, re-targeting at each mapped
    /// segment boundary via `lookup(lba + consumed)`. When the next segment
    /// is absent the remainder completes contiguously past the current one.
    /// Child sizes always sum to the request size.
    fn resolve_chain(
        &self,
        device: &VirtualDevice,
        request: &IoRequest,
        first_target: u64,
        first_piece: u32,
    ) {
        let size = request.size_bytes();
        let mut remaining = size;
        let mut consumed = 0u32;
        let mut target = first_target;
        let mut piece = first_piece;

        loop {
            if remaining <= piece {
                self.submit_tail(device, request, target, remaining, consumed);
                return;
            }
            debug!(target, piece, remaining, "splitting read clone");
            self.submit_child(device, request, target, piece, consumed);
            consumed += piece;
            remaining -= piece;
            target += u64::from(piece / SECTOR_SIZE);

            let next_lba = request.sector + u64::from(consumed / SECTOR_SIZE);
            match device.map().lookup(next_lba) {
                Some(seg) => {
                    target = seg.pba_start;
                    piece = seg.length_bytes;
                }
                // No further segment: finish against this boundary.
                None => piece = remaining,
            }
        }
    }

    /// Submits a split child carrying an extra completion unit.
    fn submit_child(
        &self,
        device: &VirtualDevice,
        request: &IoRequest,
        target_sector: u64,
        len_bytes: u32,
        payload_offset: u32,
    ) {
        request.completion.add_unit();
        device.sink().submit(CloneIo::new(
            request.op,
            target_sector,
            len_bytes,
            payload_offset,
            request.payload.clone(),
            request.completion.clone(),
        ));
    }

    /// Submits the tail clone, which carries the original's own unit.
    fn submit_tail(
        &self,
        device: &VirtualDevice,
        request: &IoRequest,
        target_sector: u64,
        len_bytes: u32,
        payload_offset: u32,
    ) {
        device.sink().submit(CloneIo::new(
            request.op,
            target_sector,
            len_bytes,
            payload_offset,
            request.payload.clone(),
            request.completion.clone(),
        ));
    }
}
