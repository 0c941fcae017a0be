//! Request execution: stamp timeout/retry policy onto mapped requests,
//! queue them on the backing device and hand completion handling to a
//! spawned finalizer. Submission never blocks the caller.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;

use crate::backing::{BackingDevice, CompletionSink, ExecOptions, MediaClass, Submission};
use crate::completion;
use crate::mapper::{self, MappedRequest, Task, TaskAttrs};
use crate::Result;

/// Disk-class requests fail fast; everything else (tapes, changers, odd
/// media) is given generous headroom.
pub const DISK_TIMEOUT: Duration = Duration::from_secs(15);
pub const OTHER_TIMEOUT: Duration = Duration::from_secs(500);

/// Fixed per-request retry count honored by the backing stack.
pub const REQUEST_RETRIES: u32 = 5;

#[must_use]
pub fn timeout_for(class: MediaClass) -> Duration {
    match class {
        MediaClass::Disk => DISK_TIMEOUT,
        MediaClass::Optical | MediaClass::Sequential | MediaClass::Other => OTHER_TIMEOUT,
    }
}

/// Map `task` and queue it on its binding's backing device.
///
/// Returns as soon as the request pair is sent; the task's continuation
/// runs later, driven by completions from the device. A mapping failure is
/// reported synchronously and nothing touches the device.
///
/// Must be called within a tokio runtime, which drives finalization.
pub fn submit(task: Task) -> Result<()> {
    let mapped = mapper::map_task(&task)?;
    let Task {
        binding,
        cdb,
        attrs,
        on_complete,
        ..
    } = task;

    let options = ExecOptions {
        timeout: timeout_for(binding.media_class()),
        retries: REQUEST_RETRIES,
        head_of_queue: attrs.contains(TaskAttrs::HEAD_OF_QUEUE),
    };
    let (sink, rx) = CompletionSink::channel();
    let expect_secondary = mapped.secondary.is_some();

    tracing::trace!(
        opcode = format_args!("{:#04x}", cdb[0]),
        fragments = mapped.mapped_fragments,
        bidi = expect_secondary,
        head_of_queue = options.head_of_queue,
        "submitting request pair",
    );
    binding.device().submit(Submission {
        primary: mapped.primary,
        secondary: mapped.secondary,
        options,
        sink,
    });

    tokio::spawn(completion::finalize(
        binding,
        cdb,
        on_complete,
        rx,
        expect_secondary,
    ));
    Ok(())
}

/// Issue a flat-buffer probe command and wait for its single completion.
///
/// Used by identity discovery and the sequential-media block-size probe.
/// Returns the response buffer only on a clean completion (host ok, status
/// good); every failure collapses to `None` since all probe callers are
/// best effort.
pub(crate) async fn execute_flat(
    device: &Arc<dyn BackingDevice>,
    cdb: &[u8],
    read_len: usize,
    class: MediaClass,
) -> Option<BytesMut> {
    let request = MappedRequest::flat_in(cdb, read_len);
    let (sink, mut rx) = CompletionSink::channel();
    device.submit(Submission {
        primary: request,
        secondary: None,
        options: ExecOptions {
            timeout: timeout_for(class),
            retries: REQUEST_RETRIES,
            head_of_queue: false,
        },
        sink,
    });

    let completion = rx.recv().await?;
    if completion.result.host_ok() && completion.result.device_status() == 0 {
        completion.request.into_flat()
    } else {
        tracing::debug!(
            opcode = format_args!("{:#04x}", cdb[0]),
            result = completion.result.0,
            "probe command failed",
        );
        None
    }
}
