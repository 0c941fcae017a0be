//! The seam to the underlying storage stack.
//!
//! Everything the rest of the crate knows about the real device goes through
//! [`BackingDevice`]: media class, native queue limits, the standard INQUIRY
//! data the stack cached at scan time, and a non-blocking [`submit`]
//! entry point. Completions are delivered back through a [`CompletionSink`]
//! from whatever context the device layer runs its completions in; that
//! context must never block, so the sink is a plain unbounded channel send.
//!
//! [`submit`]: BackingDevice::submit

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::mapper::MappedRequest;

/// Page granularity of the zero-copy scatter/gather path.
pub const PAGE_SIZE: usize = 4096;

/// Fixed sense-buffer area carried by every mapped request.
pub const SENSE_BUFFER_SIZE: usize = 96;

/// Media class reported by the backing stack. Selects the claim strategy at
/// bind time and the timeout class at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaClass {
    Disk,
    Optical,
    /// Tape-like media without a fixed sector size.
    Sequential,
    Other,
}

/// A reference-counted page of caller-owned memory.
///
/// The mapper only ever creates additional references to pages; payload
/// bytes are never copied on the scatter/gather path. The inner lock keeps
/// device-side access sound; holders must keep critical sections short since
/// completion contexts must not block.
#[derive(Clone)]
pub struct Page(Arc<Mutex<Box<[u8]>>>);

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Page")
            .field(&format_args!("<{PAGE_SIZE} bytes>"))
            .finish()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl Page {
    #[must_use]
    pub fn zeroed() -> Self {
        Self(Arc::new(Mutex::new(
            vec![0u8; PAGE_SIZE].into_boxed_slice(),
        )))
    }

    /// A page initialized with `data` at offset 0, zero-padded.
    ///
    /// # Panics
    ///
    /// Panic if `data` exceeds [`PAGE_SIZE`].
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        assert!(data.len() <= PAGE_SIZE);
        let page = Self::zeroed();
        page.0.lock()[..data.len()].copy_from_slice(data);
        page
    }

    /// Copy `out.len()` bytes starting at `offset` out of the page.
    ///
    /// # Panics
    ///
    /// Panic if the range exceeds [`PAGE_SIZE`].
    pub fn copy_out(&self, offset: usize, out: &mut [u8]) {
        out.copy_from_slice(&self.0.lock()[offset..offset + out.len()]);
    }

    /// Copy `data` into the page starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panic if the range exceeds [`PAGE_SIZE`].
    pub fn copy_in(&self, offset: usize, data: &[u8]) {
        self.0.lock()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Run `f` over a mutable window of the page.
    pub(crate) fn with_mut<R>(&self, offset: usize, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.0.lock()[offset..offset + len])
    }

    /// Number of live references, including the caller's own.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// Completion result as reported by the backing stack: device status byte in
/// the low byte, host-level outcome code in the third byte.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RawResult(pub u32);

impl RawResult {
    pub const HOST_OK: u8 = 0;

    #[must_use]
    pub const fn new(device_status: u8, host_code: u8) -> Self {
        Self(device_status as u32 | (host_code as u32) << 16)
    }

    #[must_use]
    pub const fn device_status(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    #[must_use]
    pub const fn host_code(self) -> u8 {
        ((self.0 >> 16) & 0xff) as u8
    }

    #[must_use]
    pub const fn host_ok(self) -> bool {
        self.host_code() == Self::HOST_OK
    }
}

/// Fixed-size sense area. Zero length means no sense data was reported.
#[derive(Clone, Copy)]
pub struct SenseData {
    bytes: [u8; SENSE_BUFFER_SIZE],
    len: u8,
}

impl fmt::Debug for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SenseData")
            .field(&format_args!("<{} bytes>", self.len))
            .finish()
    }
}

impl Default for SenseData {
    fn default() -> Self {
        Self::empty()
    }
}

impl SenseData {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            bytes: [0u8; SENSE_BUFFER_SIZE],
            len: 0,
        }
    }

    /// Copy `raw` in, truncating to the fixed sense area.
    #[must_use]
    pub fn from_bytes(raw: &[u8]) -> Self {
        let len = Ord::min(raw.len(), SENSE_BUFFER_SIZE);
        let mut this = Self::empty();
        this.bytes[..len].copy_from_slice(&raw[..len]);
        this.len = len as u8;
        this
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Which member of a task's request pair a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Primary,
    /// The bidirectional-read companion.
    Secondary,
}

/// One finished low-level request, handed back with its result fields.
#[derive(Debug)]
pub struct Completion {
    pub phase: Phase,
    pub result: RawResult,
    /// Residual byte count (requested minus transferred).
    pub residual: u32,
    /// The request object, returned so the translator can inspect its sense
    /// area and apply payload fix-ups before releasing it.
    pub request: MappedRequest,
}

/// Non-blocking completion delivery handle.
///
/// `complete` is a plain channel send: safe to call from interrupt-like
/// contexts that must not block or sleep. If the consumer is gone the
/// completion is dropped silently; the task side treats a closed channel as
/// a host-level failure.
#[derive(Debug, Clone)]
pub struct CompletionSink(mpsc::UnboundedSender<Completion>);

impl CompletionSink {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub fn complete(&self, completion: Completion) {
        let _: Result<_, _> = self.0.send(completion);
    }
}

/// Execution policy stamped onto a submission by the request engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOptions {
    pub timeout: Duration,
    pub retries: u32,
    /// Request out-of-order servicing ahead of queued requests.
    pub head_of_queue: bool,
}

/// One or two mapped requests queued as a single logical unit.
///
/// The secondary request, when present, is the read phase of a bidirectional
/// command. The two may complete in either order; both completions go
/// through the same sink.
#[derive(Debug)]
pub struct Submission {
    pub primary: MappedRequest,
    pub secondary: Option<MappedRequest>,
    pub options: ExecOptions,
    pub sink: CompletionSink,
}

/// A concrete backing device surfaced by the underlying storage stack.
pub trait BackingDevice: Send + Sync + fmt::Debug + 'static {
    fn media_class(&self) -> MediaClass;

    /// Native logical sector size in bytes. Sequential media report zero and
    /// are probed at bind time instead.
    fn sector_size(&self) -> u32;

    /// Advertised queue depth; zero when the device does not report one.
    fn queue_depth(&self) -> u16;

    /// Standard INQUIRY data cached by the backing stack at scan time.
    fn cached_inquiry(&self) -> Option<bytes::Bytes>;

    /// Queue the submission. Must not block; completions are delivered
    /// through the submission's sink from the device's own context, once per
    /// request in the pair.
    fn submit(&self, submission: Submission);
}
