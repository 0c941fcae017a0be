//! Identity discovery: INQUIRY and VPD probes run once at bind time.
//!
//! Vendor/model/revision come from the standard INQUIRY data the backing
//! stack cached at scan time. The VPD unit-serial probe (page 0x80) and the
//! device-identification walk (page 0x83, attempted only after a serial was
//! found) are best effort: a failed probe never fails the bind.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::backing::BackingDevice;
use crate::engine;
use crate::scsi;

pub use crate::scsi::DeviceIdDescriptor;

/// Immutable identity of a bound backing device.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    vendor: [u8; 8],
    model: [u8; 16],
    revision: [u8; 4],
    serial: Option<String>,
    descriptors: Vec<DeviceIdDescriptor>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("vendor", &self.vendor())
            .field("model", &self.model())
            .field("revision", &self.revision())
            .field("serial", &self.serial)
            .field("descriptors", &self.descriptors.len())
            .finish()
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            vendor: [b' '; 8],
            model: [b' '; 16],
            revision: [b' '; 4],
            serial: None,
            descriptors: Vec::new(),
        }
    }
}

impl Identity {
    #[must_use]
    pub fn vendor(&self) -> Cow<'_, str> {
        trimmed(&self.vendor)
    }

    #[must_use]
    pub fn model(&self) -> Cow<'_, str> {
        trimmed(&self.model)
    }

    #[must_use]
    pub fn revision(&self) -> Cow<'_, str> {
        trimmed(&self.revision)
    }

    /// Unit serial, present only if the VPD page 0x80 probe succeeded.
    #[must_use]
    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    #[must_use]
    pub fn descriptors(&self) -> &[DeviceIdDescriptor] {
        &self.descriptors
    }
}

fn trimmed(raw: &[u8]) -> Cow<'_, str> {
    match String::from_utf8_lossy(raw) {
        Cow::Borrowed(s) => Cow::Borrowed(s.trim_end_matches([' ', '\0'])),
        Cow::Owned(s) => Cow::Owned(s.trim_end_matches([' ', '\0']).to_owned()),
    }
}

/// Collect the identity of `device`. Infallible by design: missing or
/// failing probes leave the corresponding fields blank.
pub(crate) async fn discover(device: &Arc<dyn BackingDevice>) -> Identity {
    let mut identity = Identity::default();

    if let Some(inquiry) = device.cached_inquiry() {
        if let Some((vendor, model, revision)) = scsi::inquiry_strings(&inquiry) {
            identity.vendor = vendor;
            identity.model = model;
            identity.revision = revision;
        }
    }

    let class = device.media_class();
    let serial_cdb = scsi::inquiry_cdb(Some(scsi::VPD_UNIT_SERIAL), scsi::VPD_ALLOC_LEN);
    let Some(buf) = engine::execute_flat(device, &serial_cdb, scsi::VPD_ALLOC_LEN.into(), class).await
    else {
        tracing::debug!("unit-serial probe failed, proceeding without one");
        return identity;
    };
    match scsi::unit_serial(&buf) {
        Some(serial) => identity.serial = Some(serial),
        None => return identity,
    }

    // The device-identification walk is only attempted on devices that
    // answered the serial probe.
    let id_cdb = scsi::inquiry_cdb(Some(scsi::VPD_DEVICE_ID), scsi::VPD_ALLOC_LEN);
    if let Some(buf) = engine::execute_flat(device, &id_cdb, scsi::VPD_ALLOC_LEN.into(), class).await {
        identity.descriptors = scsi::walk_device_id(&buf);
        tracing::debug!(count = identity.descriptors.len(), "collected device id descriptors");
    }

    identity
}
