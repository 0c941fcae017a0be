//! Process-wide adapter and device registry.
//!
//! The binder walks this registry under a lock, but every accessor returns
//! an owned handle (a cloned `Arc` or an RAII claim) so the critical section
//! never straddles a blocking step like a block-object claim or an identity
//! probe. Exclusive ownership is expressed as guard types that release on
//! drop, on every exit path.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backing::BackingDevice;
use crate::{Error, Result};

/// Addressing coordinates of one backing device under its adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceCoords {
    pub channel: u32,
    pub target: u32,
    pub lun: u64,
}

impl fmt::Display for DeviceCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.channel, self.target, self.lun)
    }
}

struct DeviceSlot {
    coords: DeviceCoords,
    device: Arc<dyn BackingDevice>,
    claimed: bool,
}

/// One physical host adapter and the devices enumerated under it.
pub struct PhysicalHost {
    id: u32,
    /// Queue depth advertised by the adapter template.
    nominal_queue_depth: u16,
    /// Queue depth configured at runtime. Some adapter families only
    /// populate this one.
    configured_queue_depth: u16,
    /// Largest transfer the adapter accepts, in 512-byte sectors.
    max_sectors: u32,
    /// Exclusive passthrough binding by one HBA context.
    bound: AtomicBool,
    devices: Mutex<Vec<DeviceSlot>>,
}

impl fmt::Debug for PhysicalHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalHost")
            .field("id", &self.id)
            .field("queue_depth", &self.queue_depth())
            .field("max_sectors", &self.max_sectors)
            .field("bound", &self.bound.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PhysicalHost {
    #[must_use]
    pub fn new(id: u32, nominal_queue_depth: u16, configured_queue_depth: u16, max_sectors: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            nominal_queue_depth,
            configured_queue_depth,
            max_sectors,
            bound: AtomicBool::new(false),
            devices: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn max_sectors(&self) -> u32 {
        self.max_sectors
    }

    /// Advertised queue depth: the larger of the template maximum and the
    /// runtime-configured maximum. Policy, not law; kept because some
    /// adapter families only set the latter.
    #[must_use]
    pub fn queue_depth(&self) -> u16 {
        Ord::max(self.nominal_queue_depth, self.configured_queue_depth)
    }

    /// Surface a device at `coords`, as the backing stack would after a
    /// scan. Fails if the address is already occupied.
    pub fn add_device(&self, coords: DeviceCoords, device: Arc<dyn BackingDevice>) -> Result<()> {
        let mut devices = self.devices.lock();
        if devices.iter().any(|s| s.coords == coords) {
            return Err(Error::Busy);
        }
        devices.push(DeviceSlot {
            coords,
            device,
            claimed: false,
        });
        Ok(())
    }

    /// Remove the device at `coords`. Fails while it is claimed.
    pub fn remove_device(&self, coords: DeviceCoords) -> Result<()> {
        let mut devices = self.devices.lock();
        let idx = devices
            .iter()
            .position(|s| s.coords == coords)
            .ok_or(Error::NotFound)?;
        if devices[idx].claimed {
            return Err(Error::Busy);
        }
        devices.swap_remove(idx);
        Ok(())
    }

    /// Exclusive passthrough claim of this adapter.
    pub(crate) fn try_bind(self: &Arc<Self>) -> Result<HostBinding> {
        if self.bound.swap(true, Ordering::AcqRel) {
            return Err(Error::Busy);
        }
        Ok(HostBinding {
            host: Arc::clone(self),
        })
    }

    /// Find a device by exact coordinates. The lock is dropped before the
    /// cloned handle is returned; no claim is taken.
    pub(crate) fn find_device(&self, coords: DeviceCoords) -> Option<Arc<dyn BackingDevice>> {
        let devices = self.devices.lock();
        devices
            .iter()
            .find(|s| s.coords == coords)
            .map(|s| Arc::clone(&s.device))
    }

    /// Take an exclusive reference on the device at `coords`.
    pub(crate) fn claim_device(self: &Arc<Self>, coords: DeviceCoords) -> Result<DeviceRef> {
        let mut devices = self.devices.lock();
        let slot = devices
            .iter_mut()
            .find(|s| s.coords == coords)
            .ok_or(Error::NotFound)?;
        if slot.claimed {
            return Err(Error::Busy);
        }
        slot.claimed = true;
        let device = Arc::clone(&slot.device);
        drop(devices);
        Ok(DeviceRef {
            host: Arc::clone(self),
            coords,
            device,
        })
    }

    fn unclaim_device(&self, coords: DeviceCoords) {
        let mut devices = self.devices.lock();
        if let Some(slot) = devices.iter_mut().find(|s| s.coords == coords) {
            slot.claimed = false;
        }
    }

    fn has_claims(&self) -> bool {
        self.devices.lock().iter().any(|s| s.claimed)
    }
}

/// Exclusive passthrough binding of a physical host. Released on drop.
#[derive(Debug)]
pub struct HostBinding {
    host: Arc<PhysicalHost>,
}

impl HostBinding {
    #[must_use]
    pub fn host(&self) -> &Arc<PhysicalHost> {
        &self.host
    }
}

impl Drop for HostBinding {
    fn drop(&mut self) {
        self.host.bound.store(false, Ordering::Release);
    }
}

/// Exclusive reference on one backing device. Released on drop.
pub struct DeviceRef {
    host: Arc<PhysicalHost>,
    coords: DeviceCoords,
    device: Arc<dyn BackingDevice>,
}

impl fmt::Debug for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRef")
            .field("host", &self.host.id)
            .field("coords", &self.coords)
            .finish_non_exhaustive()
    }
}

impl DeviceRef {
    #[must_use]
    pub fn device(&self) -> &Arc<dyn BackingDevice> {
        &self.device
    }
}

impl Drop for DeviceRef {
    fn drop(&mut self) {
        self.host.unclaim_device(self.coords);
    }
}

/// Exclusive write+read claim on a block object, keyed by its path.
/// Released on drop.
#[derive(Debug)]
pub struct BlockClaim {
    registry: Arc<HostRegistry>,
    path: PathBuf,
}

impl BlockClaim {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BlockClaim {
    fn drop(&mut self) {
        self.registry.block_claims.lock().remove(&self.path);
    }
}

/// The process-wide list of physical adapters, plus the block-object claim
/// table used by disk-class bindings.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: Mutex<Vec<Arc<PhysicalHost>>>,
    block_claims: Mutex<HashSet<PathBuf>>,
}

impl HostRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an adapter. Fails if its numeric id is already taken.
    pub fn register(&self, host: Arc<PhysicalHost>) -> Result<()> {
        let mut hosts = self.hosts.lock();
        if hosts.iter().any(|h| h.id == host.id) {
            return Err(Error::Busy);
        }
        tracing::debug!(host = host.id, "registered physical host");
        hosts.push(host);
        Ok(())
    }

    /// Deregister an adapter. Fails while it is bound in passthrough mode
    /// or any of its devices is claimed.
    pub fn deregister(&self, id: u32) -> Result<()> {
        let mut hosts = self.hosts.lock();
        let idx = hosts.iter().position(|h| h.id == id).ok_or(Error::NotFound)?;
        let host = &hosts[idx];
        if host.bound.load(Ordering::Acquire) || host.has_claims() {
            return Err(Error::Busy);
        }
        hosts.swap_remove(idx);
        Ok(())
    }

    /// Resolve an adapter by numeric id. Returns an owned handle cloned
    /// under the list lock.
    #[must_use]
    pub fn lookup(&self, id: u32) -> Option<Arc<PhysicalHost>> {
        let hosts = self.hosts.lock();
        hosts.iter().find(|h| h.id == id).map(Arc::clone)
    }

    /// Claim exclusive access to the block object at `path`.
    pub(crate) fn claim_block(self: &Arc<Self>, path: &Path) -> Result<BlockClaim> {
        let mut claims = self.block_claims.lock();
        if !claims.insert(path.to_path_buf()) {
            return Err(Error::Busy);
        }
        drop(claims);
        Ok(BlockClaim {
            registry: Arc::clone(self),
            path: path.to_path_buf(),
        })
    }

    /// Whether the block object at `path` is currently claimed.
    #[must_use]
    pub fn block_claimed(&self, path: &Path) -> bool {
        self.block_claims.lock().contains(path)
    }
}
