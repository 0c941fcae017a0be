//! SCSI passthrough backend: present a logical unit to a target-emulation
//! front end while executing the actual I/O against a real backing device.
//!
//! The crate is organized around the lifetime of one logical unit:
//!
//! 1.  An [`HbaContext`] is attached, either as a pure virtual-host-id
//!     configuration namespace or bound exclusively to one physical adapter
//!     ([`HbaContext::set_passthrough_mode`]).
//! 2.  [`DeviceBinding::bind`] resolves a `(channel, target, lun)` tuple under
//!     the adapter, claims the backing device according to its media class,
//!     collects INQUIRY/VPD identity data, and publishes queue limits.
//! 3.  Per command, a [`Task`] is mapped into one or two low-level requests
//!     (flat copy for probe-style commands, zero-copy page chains for real
//!     data transfers, a coupled secondary request for bidirectional
//!     commands) and submitted through [`engine::submit`].
//! 4.  Completions arrive from the backing device's own context through a
//!     [`CompletionSink`]; the translator derives the SAM status, applies
//!     protocol fix-ups (MODE SENSE write-protect, MODE SELECT block-size
//!     re-derivation for sequential media) and runs the task's continuation.
//!
//! The backing storage stack itself is an external collaborator modelled by
//! the [`BackingDevice`] trait; [`MemoryDevice`] is an in-memory
//! implementation used by the test suite.

pub mod backing;
pub mod binder;
pub mod completion;
pub mod engine;
pub mod hba;
pub mod identity;
pub mod mapper;
pub mod memory_device;
pub mod registry;
pub mod scsi;


pub use backing::{
    BackingDevice, Completion, CompletionSink, ExecOptions, MediaClass, Page, Phase, RawResult,
    SenseData, Submission, PAGE_SIZE, SENSE_BUFFER_SIZE,
};
pub use binder::{BindConfig, DeviceBinding, QueueLimits};
pub use completion::{FailureClass, TaskOutcome};
pub use hba::{HbaContext, HbaMode};
pub use identity::{DeviceIdDescriptor, Identity};
pub use mapper::{MappedRequest, SgFragment, SgList, Task, TaskAttrs, TaskData};
pub use memory_device::MemoryDevice;
pub use registry::{DeviceCoords, HostRegistry, PhysicalHost};

/// Errors reported synchronously by the administrative surface and the
/// request mapper. Device-level failures travel through the completion path
/// instead and never show up here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A required addressing parameter is missing, or contradicts the owning
    /// HBA context (e.g. an explicit host id while bound to a different
    /// physical adapter).
    #[error("incomplete or contradictory configuration: {0}")]
    ConfigurationIncomplete(&'static str),
    /// The named physical adapter or `(channel, target, lun)` tuple does not
    /// exist.
    #[error("no matching adapter or device")]
    NotFound,
    /// The adapter, device or block object is already exclusively claimed.
    #[error("already claimed or in use")]
    Busy,
    /// Allocation or request-mapping failure. Partially built transfer
    /// chains are released before this is returned.
    #[error("out of resources")]
    OutOfResources,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
