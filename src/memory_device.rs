//! An in-memory [`BackingDevice`] used by the test suite.
//!
//! Submissions are executed inline: INQUIRY VPD probes and MODE SENSE are
//! answered from canned pages, outbound payloads are captured, and inbound
//! payloads are filled from a configurable pattern. Every submission is
//! appended to an action log that tests drain and compare against.

use std::collections::HashMap;
use std::fmt::Write;
use std::mem;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::backing::{
    BackingDevice, Completion, ExecOptions, MediaClass, Phase, RawResult, Submission,
};
use crate::mapper::{MappedRequest, XferDir};
use crate::scsi;

/// Device status byte (halved encoding) for CHECK CONDITION.
const DEVICE_CHECK_CONDITION: u8 = 0x01;

#[derive(Debug, Default)]
struct State {
    vpd_pages: HashMap<u8, Vec<u8>>,
    mode_data: Vec<u8>,
    read_data: Vec<u8>,
    /// Captured outbound payloads, `(opcode, bytes)`.
    writes: Vec<(u8, Vec<u8>)>,
    options: Vec<ExecOptions>,
    forced: Option<RawResult>,
    sense: Option<Vec<u8>>,
    secondary_first: bool,
    log: String,
}

#[derive(Debug)]
pub struct MemoryDevice {
    media_class: MediaClass,
    sector_size: u32,
    queue_depth: u16,
    inquiry: Option<Bytes>,
    state: Mutex<State>,
}

macro_rules! act {
    ($st:expr, $($tt:tt)*) => {
        write!($st.log, "{};", format_args!($($tt)*)).unwrap()
    };
}

impl MemoryDevice {
    #[must_use]
    pub fn new(media_class: MediaClass) -> Self {
        Self {
            media_class,
            sector_size: 512,
            queue_depth: 2,
            inquiry: None,
            state: Mutex::default(),
        }
    }

    #[must_use]
    pub fn sector_size(mut self, size: u32) -> Self {
        self.sector_size = size;
        self
    }

    #[must_use]
    pub fn queue_depth(mut self, depth: u16) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Install a standard INQUIRY response built from the three identity
    /// strings, each space-padded to its fixed field width.
    ///
    /// # Panics
    ///
    /// Panic if a string exceeds its field width.
    #[must_use]
    pub fn inquiry(mut self, vendor: &str, model: &str, revision: &str) -> Self {
        let mut data = vec![0u8; scsi::INQUIRY_MIN_LEN];
        data[0] = match self.media_class {
            MediaClass::Disk => 0x00,
            MediaClass::Sequential => 0x01,
            MediaClass::Other => 0x03,
            MediaClass::Optical => 0x05,
        };
        for (off, width, s) in [(8, 8, vendor), (16, 16, model), (32, 4, revision)] {
            assert!(s.len() <= width);
            data[off..off + width].fill(b' ');
            data[off..off + s.len()].copy_from_slice(s.as_bytes());
        }
        self.inquiry = Some(data.into());
        self
    }

    /// Install a raw cached-INQUIRY blob verbatim.
    #[must_use]
    pub fn raw_inquiry(mut self, data: impl Into<Bytes>) -> Self {
        self.inquiry = Some(data.into());
        self
    }

    /// Install the full response served for a VPD page probe.
    #[must_use]
    pub fn vpd_page(self, page: u8, data: Vec<u8>) -> Self {
        self.state.lock().vpd_pages.insert(page, data);
        self
    }

    /// Install the response served for MODE SENSE.
    #[must_use]
    pub fn mode_data(self, data: Vec<u8>) -> Self {
        self.state.lock().mode_data = data;
        self
    }

    /// Pattern used to fill inbound data transfers.
    #[must_use]
    pub fn read_data(self, data: Vec<u8>) -> Self {
        self.state.lock().read_data = data;
        self
    }

    /// Force every subsequent completion to carry this raw result instead of
    /// executing the command.
    #[must_use]
    pub fn force_result(self, result: RawResult) -> Self {
        self.state.lock().forced = Some(result);
        self
    }

    /// Sense bytes attached to every completed primary request.
    #[must_use]
    pub fn with_sense(self, sense: Vec<u8>) -> Self {
        self.state.lock().sense = Some(sense);
        self
    }

    /// Deliver the bidirectional read completion before the write one.
    #[must_use]
    pub fn complete_secondary_first(self) -> Self {
        self.state.lock().secondary_first = true;
        self
    }

    pub fn drain_log(&self) -> String {
        mem::take(&mut self.state.lock().log)
    }

    /// Captured outbound payloads, draining them.
    pub fn taken_writes(&self) -> Vec<(u8, Vec<u8>)> {
        mem::take(&mut self.state.lock().writes)
    }

    /// Execution options seen so far, draining them.
    pub fn taken_options(&self) -> Vec<ExecOptions> {
        mem::take(&mut self.state.lock().options)
    }

    /// Execute one request, returning its result and transferred byte count.
    fn answer(st: &mut State, request: &mut MappedRequest) -> (RawResult, usize) {
        if let Some(forced) = st.forced {
            return (forced, 0);
        }
        let opcode = request.cdb()[0];
        match request.direction() {
            XferDir::None => (RawResult::default(), 0),
            XferDir::ToDevice => {
                let data = request.gather_payload();
                let n = data.len();
                st.writes.push((opcode, data));
                (RawResult::default(), n)
            }
            XferDir::FromDevice => {
                // EVPD bit distinguishes a VPD probe from plain INQUIRY.
                if opcode == scsi::INQUIRY && request.cdb()[1] & 0x01 != 0 {
                    let page = request.cdb()[2];
                    return match st.vpd_pages.get(&page) {
                        Some(data) => {
                            let data = data.clone();
                            (RawResult::default(), request.fill_payload(&data))
                        }
                        None => (RawResult::new(DEVICE_CHECK_CONDITION, 0), 0),
                    };
                }
                if opcode == scsi::MODE_SENSE_6 || opcode == scsi::MODE_SENSE_10 {
                    let data = st.mode_data.clone();
                    return (RawResult::default(), request.fill_payload(&data));
                }
                let data = st.read_data.clone();
                (RawResult::default(), request.fill_payload(&data))
            }
        }
    }

    fn finish(st: &mut State, phase: Phase, mut request: MappedRequest) -> Completion {
        let (result, transferred) = Self::answer(st, &mut request);
        if phase == Phase::Primary {
            if let Some(sense) = &st.sense {
                request.set_sense(sense);
            }
        }
        let residual = (request.payload_len() - transferred) as u32;
        Completion {
            phase,
            result,
            residual,
            request,
        }
    }
}

impl BackingDevice for MemoryDevice {
    fn media_class(&self) -> MediaClass {
        self.media_class
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn queue_depth(&self) -> u16 {
        self.queue_depth
    }

    fn cached_inquiry(&self) -> Option<Bytes> {
        self.inquiry.clone()
    }

    fn submit(&self, submission: Submission) {
        let Submission {
            primary,
            secondary,
            options,
            sink,
        } = submission;
        let st = &mut *self.state.lock();
        act!(
            st,
            "submit({:#04x}, {:?}, len={}, chains={}, bidi={}, hoq={})",
            primary.cdb()[0],
            primary.direction(),
            primary.payload_len(),
            primary.chain_count(),
            secondary.is_some(),
            options.head_of_queue,
        );
        st.options.push(options);

        let first = Self::finish(st, Phase::Primary, primary);
        match secondary {
            None => sink.complete(first),
            Some(secondary) => {
                let second = Self::finish(st, Phase::Secondary, secondary);
                if st.secondary_first {
                    sink.complete(second);
                    sink.complete(first);
                } else {
                    sink.complete(first);
                    sink.complete(second);
                }
            }
        }
    }
}
