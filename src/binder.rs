//! Device binding: resolve addressing coordinates to a concrete backing
//! device, claim it according to its media class, collect identity data and
//! publish queue limits.
//!
//! All acquisitions are RAII guards, so a failure anywhere in the bind
//! sequence rolls back everything acquired so far; a failed bind leaves no
//! resource allocated. The registry walk happens under the enumeration
//! lock, but the lock is dropped before any blocking step (block-object
//! claim, identity probes).

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use serde::Deserialize;

use crate::backing::{BackingDevice, MediaClass};
use crate::engine;
use crate::hba::HbaContext;
use crate::identity::{self, Identity};
use crate::registry::{BlockClaim, DeviceCoords, DeviceRef, PhysicalHost};
use crate::scsi;
use crate::{Error, Result};

/// Generic I/O layer ceiling on one transfer, in 512-byte sectors.
pub const IO_MAX_SECTORS: u32 = 1024;

/// Queue depth substituted when a device reports zero.
pub const DEFAULT_DEVICE_QUEUE_DEPTH: u16 = 1;

/// Block size assumed for sequential media whose MODE SENSE probe reports
/// zero (or fails outright).
pub const SEQUENTIAL_DEFAULT_BLOCK_SIZE: u32 = 1024;

/// Administrative addressing parameters, settable before a binding is
/// enabled.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindConfig {
    /// Physical adapter to search under; only honored while the HBA context
    /// is not itself bound to one.
    pub host_id: Option<u32>,
    pub channel_id: Option<u32>,
    pub target_id: Option<u32>,
    pub lun_id: Option<u64>,
    /// Path of the block object claimed by disk-class bindings.
    pub block_path: Option<PathBuf>,
}

impl BindConfig {
    fn coords(&self) -> Result<DeviceCoords> {
        match (self.channel_id, self.target_id, self.lun_id) {
            (Some(channel), Some(target), Some(lun)) => Ok(DeviceCoords {
                channel,
                target,
                lun,
            }),
            _ => Err(Error::ConfigurationIncomplete(
                "channel_id, target_id and lun_id are all required",
            )),
        }
    }
}

/// Queue limits published upward after a successful bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub sector_size: u32,
    /// Largest transfer in 512-byte sectors.
    pub max_sectors: u32,
    pub queue_depth: u16,
}

/// Per-media-class claim held for the binding's lifetime.
///
/// Field order matters for disks: the block claim is declared first so it
/// is released before the device reference on drop.
enum MediaBinder {
    Disk {
        block: BlockClaim,
        device_ref: DeviceRef,
    },
    Optical {
        device_ref: DeviceRef,
    },
    Generic,
}

impl fmt::Debug for MediaBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disk { block, .. } => f.debug_struct("Disk").field("block", &block.path()).finish(),
            Self::Optical { .. } => f.write_str("Optical"),
            Self::Generic => f.write_str("Generic"),
        }
    }
}

/// One backing device attached to an HBA context.
///
/// Dropping the binding releases the block claim and device reference, in
/// that order, and deaccounts it from the owning context. Callers must
/// drain outstanding tasks first; no implicit draining happens here.
pub struct DeviceBinding {
    hba: Arc<HbaContext>,
    host: Arc<PhysicalHost>,
    coords: DeviceCoords,
    device: Arc<dyn BackingDevice>,
    media: MediaBinder,
    identity: Identity,
    max_sectors: u32,
    queue_depth: u16,
    /// Live sector size; sequential media rewrite it on MODE SELECT.
    sector_size: AtomicU32,
    read_only: AtomicBool,
}

impl fmt::Debug for DeviceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBinding")
            .field("host", &self.host.id())
            .field("coords", &self.coords)
            .field("media", &self.media)
            .field("identity", &self.identity)
            .field("limits", &self.queue_limits())
            .finish_non_exhaustive()
    }
}

impl Drop for DeviceBinding {
    fn drop(&mut self) {
        tracing::debug!(host = self.host.id(), coords = %self.coords, "destroying device binding");
        self.hba.binding_dropped();
    }
}

impl DeviceBinding {
    /// Bind the configured logical unit under `hba`.
    ///
    /// Resolves the physical adapter per the context mode, enumerates for an
    /// exact coordinate match, claims the device per its media class, runs
    /// identity discovery and publishes queue limits. Every failure is
    /// reported synchronously with full rollback.
    pub async fn bind(hba: Arc<HbaContext>, config: &BindConfig) -> Result<Arc<Self>> {
        let coords = config.coords()?;
        let host = hba.resolve_host_for_bind(config.host_id)?;
        let device = host.find_device(coords).ok_or(Error::NotFound)?;

        let class = device.media_class();
        let media = match class {
            MediaClass::Disk => {
                let device_ref = host.claim_device(coords)?;
                let path = config.block_path.as_deref().ok_or(
                    Error::ConfigurationIncomplete("disk-class binding requires a block path"),
                )?;
                // Claimed after the device reference; a failure here drops
                // the reference on the way out.
                let block = hba.registry().claim_block(path)?;
                MediaBinder::Disk { block, device_ref }
            }
            MediaClass::Optical => MediaBinder::Optical {
                device_ref: host.claim_device(coords)?,
            },
            MediaClass::Sequential | MediaClass::Other => MediaBinder::Generic,
        };

        let identity = identity::discover(&device).await;

        let sector_size = if class == MediaClass::Sequential {
            probe_sequential_block_size(&device).await
        } else {
            device.sector_size()
        };

        let queue_depth = match device.queue_depth() {
            0 => {
                tracing::warn!(
                    coords = %coords,
                    "device reports zero queue depth, substituting {DEFAULT_DEVICE_QUEUE_DEPTH}",
                );
                DEFAULT_DEVICE_QUEUE_DEPTH
            }
            depth => depth,
        };
        let max_sectors = Ord::min(host.max_sectors(), IO_MAX_SECTORS);

        // Accounting re-validates the adapter; on failure every claim
        // acquired above is rolled back by its guard.
        hba.binding_created(&host)?;
        let binding = Arc::new(Self {
            hba,
            host,
            coords,
            device,
            media,
            identity,
            max_sectors,
            queue_depth,
            sector_size: AtomicU32::new(sector_size),
            read_only: AtomicBool::new(false),
        });
        tracing::info!(
            host = binding.host.id(),
            coords = %binding.coords,
            vendor = %binding.identity.vendor(),
            model = %binding.identity.model(),
            limits = ?binding.queue_limits(),
            "bound backing device",
        );
        Ok(binding)
    }

    #[must_use]
    pub fn coords(&self) -> DeviceCoords {
        self.coords
    }

    #[must_use]
    pub fn host_id(&self) -> u32 {
        self.host.id()
    }

    #[must_use]
    pub fn media_class(&self) -> MediaClass {
        self.device.media_class()
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn queue_limits(&self) -> QueueLimits {
        QueueLimits {
            sector_size: self.sector_size(),
            max_sectors: self.max_sectors,
            queue_depth: self.queue_depth,
        }
    }

    #[must_use]
    pub fn sector_size(&self) -> u32 {
        self.sector_size.load(Ordering::Relaxed)
    }

    pub(crate) fn store_sector_size(&self, size: u32) {
        self.sector_size.store(size, Ordering::Relaxed);
    }

    /// Administrative read-only marking; drives the MODE SENSE
    /// write-protect fix-up.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    pub(crate) fn device(&self) -> &Arc<dyn BackingDevice> {
        &self.device
    }
}

/// Sequential media do not expose a fixed sector size; recover the native
/// block size with a MODE SENSE probe, defaulting when it reports zero or
/// the probe fails.
async fn probe_sequential_block_size(device: &Arc<dyn BackingDevice>) -> u32 {
    let cdb = scsi::mode_sense6_cdb(0, 12);
    let probed = engine::execute_flat(device, &cdb, 12, MediaClass::Sequential)
        .await
        .and_then(|buf| scsi::block_descriptor_size(&buf, false));
    match probed {
        Some(size) if size != 0 => size,
        _ => {
            tracing::debug!(
                "unable to probe sequential block size, assuming {SEQUENTIAL_DEFAULT_BLOCK_SIZE}",
            );
            SEQUENTIAL_DEFAULT_BLOCK_SIZE
        }
    }
}
