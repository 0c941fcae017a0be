//! Completion translation.
//!
//! Raw completions arrive on a channel fed from the backing device's own
//! context; the finalizer below runs as an ordinary spawned task, so all
//! fix-up parsing happens outside the restrictive completion context. For a
//! bidirectional task both requests must have completed, in either order,
//! before the task is finalized; the secondary is released only after the
//! primary has been processed.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::backing::{Completion, Phase, SenseData};
use crate::binder::DeviceBinding;
use crate::mapper::MappedRequest;
use crate::scsi::{self, sam};
use crate::MediaClass;

/// Completion continuation of one task, run exactly once.
pub type Continuation = Box<dyn FnOnce(TaskOutcome) + Send + 'static>;

/// Error classification for completions that never reached the device
/// status phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The adapter reported a non-ok host-level outcome.
    UnknownAdapterOpcode,
}

/// What a task's continuation receives.
#[derive(Debug, Clone, Copy)]
pub struct TaskOutcome {
    /// Whether the command completed with a clean GOOD status.
    pub good: bool,
    /// SAM status byte in target-mode encoding.
    pub status: u8,
    /// Set when the host-level outcome was not ok; status is forced to
    /// CHECK CONDITION in that case.
    pub failure: Option<FailureClass>,
    /// Residual byte count from the primary request.
    pub residual: u32,
    /// Sense data, when the device reported any.
    pub sense: Option<SenseData>,
}

impl TaskOutcome {
    /// Outcome used when the device layer dropped the completion channel
    /// without answering.
    fn lost() -> Self {
        Self {
            good: false,
            status: sam::CHECK_CONDITION,
            failure: Some(FailureClass::UnknownAdapterOpcode),
            residual: 0,
            sense: None,
        }
    }
}

/// Wait for all completions of one task, translate, and run the
/// continuation. The continuation fires exactly once on every path,
/// including a panic while translating.
pub(crate) async fn finalize(
    binding: Arc<DeviceBinding>,
    cdb: Box<[u8]>,
    on_complete: Continuation,
    mut rx: UnboundedReceiver<Completion>,
    expect_secondary: bool,
) {
    let mut guard = scopeguard::guard(
        (on_complete, TaskOutcome::lost()),
        |(continuation, outcome)| continuation(outcome),
    );

    let mut primary = None;
    let mut secondary = None;
    while primary.is_none() || (expect_secondary && secondary.is_none()) {
        match rx.recv().await {
            Some(completion) => match completion.phase {
                Phase::Primary => primary = Some(completion),
                Phase::Secondary => secondary = Some(completion),
            },
            None => break,
        }
    }

    let Some(mut primary) = primary else {
        tracing::error!(
            opcode = format_args!("{:#04x}", cdb[0]),
            "completion channel closed before the primary request finished",
        );
        return;
    };

    let outcome = translate(&binding, &cdb, &mut primary);

    // Release the bidirectional companion only after the primary has been
    // processed; its result fields were inspected while collecting.
    if let Some(companion) = secondary {
        tracing::trace!(residual = companion.residual, "releasing bidi companion");
        drop(companion);
    }
    drop(primary);

    guard.1 = outcome;
}

/// Translate one primary completion into a task outcome, applying the
/// protocol fix-ups on a clean completion.
pub(crate) fn translate(
    binding: &DeviceBinding,
    cdb: &[u8],
    completion: &mut Completion,
) -> TaskOutcome {
    let raw = completion.result;
    // Device status arrives in halved encoding; shift to the target-mode
    // status byte.
    let status = raw.device_status() << 1;
    if status != 0 {
        tracing::debug!(
            opcode = format_args!("{:#04x}", cdb[0]),
            result = format_args!("{:#010x}", raw.0),
            "nonzero device status",
        );
    }

    if !raw.host_ok() {
        tracing::warn!(
            opcode = format_args!("{:#04x}", cdb[0]),
            host_code = raw.host_code(),
            "host-level failure",
        );
        return TaskOutcome {
            good: false,
            status: sam::CHECK_CONDITION,
            failure: Some(FailureClass::UnknownAdapterOpcode),
            residual: completion.residual,
            sense: None,
        };
    }

    let good = status == sam::GOOD;
    if good {
        apply_fixups(binding, cdb, &mut completion.request);
    }
    let sense = completion.request.sense();
    let sense = (!sense.is_empty()).then(|| *sense);
    TaskOutcome {
        good,
        status,
        failure: None,
        residual: completion.residual,
        sense,
    }
}

/// Protocol-correctness fix-ups, best effort: a response too short for the
/// expected shape just skips the fix-up.
fn apply_fixups(binding: &DeviceBinding, cdb: &[u8], request: &mut MappedRequest) {
    match cdb[0] {
        scsi::MODE_SENSE_6 | scsi::MODE_SENSE_10 if binding.is_read_only() => {
            let applied = request
                .with_leading_mut(4, |header| scsi::force_write_protect(cdb[0], header))
                .unwrap_or(false);
            if applied {
                tracing::trace!("forced write-protect bit in MODE SENSE response");
            } else {
                tracing::debug!("MODE SENSE response too short for write-protect fix-up");
            }
        }
        scsi::MODE_SELECT_6 | scsi::MODE_SELECT_10
            if binding.media_class() == MediaClass::Sequential =>
        {
            let need = if cdb[0] == scsi::MODE_SELECT_10 { 16 } else { 12 };
            if let Some(size) = request
                .leading(need)
                .and_then(|block| scsi::mode_select_block_size(cdb[0], &block))
            {
                tracing::debug!(size, "sequential media block size re-derived from MODE SELECT");
                binding.store_sector_size(size);
            }
        }
        _ => {}
    }
}
