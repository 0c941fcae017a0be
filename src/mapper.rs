//! Task-to-request mapping.
//!
//! One abstract command ([`Task`]) becomes one or two low-level requests
//! ([`MappedRequest`]): a flat deep-copied buffer for probe-style commands
//! without a real scatter/gather list, or zero-copy chains of page segments
//! for data-carrying commands. Bidirectional commands get a secondary
//! request for the read phase, coupled to the primary so the pair is
//! submitted and retired as one logical unit.
//!
//! A mapping failure releases every chain built so far before returning;
//! partially-built requests are never left in a submittable state.

use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;

use crate::backing::{Page, SenseData, PAGE_SIZE};
use crate::binder::DeviceBinding;
use crate::completion::Continuation;
use crate::{Error, Result};

/// Hard batching limit: the maximum number of page segments one transfer
/// chain may reference before a new chain is opened.
pub const MAX_SEGMENTS_PER_CHAIN: usize = 256;

/// Maximum CDB length carried inline by a request.
pub const CDB_SIZE: usize = 16;

bitflags::bitflags! {
    /// Per-task attribute hints from the originating command.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct TaskAttrs: u32 {
        /// Request out-of-order servicing from the device queue.
        const HEAD_OF_QUEUE = 1 << 0;
    }
}

/// Per-request transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferDir {
    None,
    ToDevice,
    FromDevice,
}

/// One (page, offset, length) fragment of a caller scatter/gather list.
#[derive(Debug, Clone)]
pub struct SgFragment {
    pub page: Page,
    pub offset: u32,
    pub len: u32,
}

/// An ordered fragment list with its total byte budget.
#[derive(Debug, Clone)]
pub struct SgList {
    fragments: Vec<SgFragment>,
    total_len: u32,
}

impl SgList {
    #[must_use]
    pub fn new(fragments: Vec<SgFragment>, total_len: u32) -> Self {
        Self {
            fragments,
            total_len,
        }
    }

    #[must_use]
    pub fn total_len(&self) -> u32 {
        self.total_len
    }

    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }
}

/// Data phases of a task.
#[derive(Debug)]
pub enum TaskData {
    None,
    /// Contiguous outbound buffer, deep-copied into the request.
    FlatOut(bytes::Bytes),
    /// Contiguous inbound buffer of the given length, owned by the request.
    FlatIn(usize),
    ReadSg(SgList),
    WriteSg(SgList),
    /// One write phase and one read phase in a single logical command.
    Bidi { write: SgList, read: SgList },
}

/// One in-flight abstract command.
pub struct Task {
    pub(crate) binding: Arc<DeviceBinding>,
    pub(crate) cdb: Box<[u8]>,
    pub(crate) data: TaskData,
    pub(crate) attrs: TaskAttrs,
    pub(crate) on_complete: Continuation,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("cdb", &self.cdb)
            .field("data", &self.data)
            .field("attrs", &self.attrs)
            .finish_non_exhaustive()
    }
}

impl Task {
    /// # Panics
    ///
    /// Panic if `cdb` is empty or longer than [`CDB_SIZE`].
    #[must_use]
    pub fn new(
        binding: Arc<DeviceBinding>,
        cdb: &[u8],
        data: TaskData,
        attrs: TaskAttrs,
        on_complete: Continuation,
    ) -> Self {
        assert!(!cdb.is_empty() && cdb.len() <= CDB_SIZE);
        Self {
            binding,
            cdb: cdb.into(),
            data,
            attrs,
            on_complete,
        }
    }

    #[must_use]
    pub fn opcode(&self) -> u8 {
        self.cdb[0]
    }
}

/// One contiguous segment of a transfer chain, referencing a caller page.
#[derive(Debug, Clone)]
pub(crate) struct Segment {
    pub page: Page,
    pub offset: u32,
    pub len: u32,
}

/// A bounded run of transfer segments. Chains are linked at the
/// request-construction layer: all chains of one request are submitted and
/// retired together.
#[derive(Debug, Default)]
pub struct Chain {
    segments: Vec<Segment>,
}

impl Chain {
    fn new() -> Self {
        Self::default()
    }

    fn is_full(&self) -> bool {
        self.segments.len() >= MAX_SEGMENTS_PER_CHAIN
    }

    /// Attach one segment. The generic layer rejects zero-length segments
    /// and segments overrunning their page.
    fn attach(&mut self, page: &Page, offset: u32, len: u32) -> Result<()> {
        if len == 0 || offset as usize + len as usize > PAGE_SIZE {
            return Err(Error::OutOfResources);
        }
        debug_assert!(!self.is_full());
        self.segments.push(Segment {
            page: page.clone(),
            offset,
            len,
        });
        Ok(())
    }

    /// Drop all page references. This is the chain's completion-no-op
    /// release, used when unwinding a failed mapping.
    fn release(&mut self) {
        self.segments.clear();
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn byte_len(&self) -> u64 {
        self.segments.iter().map(|s| u64::from(s.len)).sum()
    }
}

/// Request payload: either a request-owned contiguous buffer or linked
/// zero-copy chains over caller pages.
#[derive(Debug)]
pub(crate) enum Payload {
    None,
    Flat(BytesMut),
    Chains(Vec<Chain>),
}

/// One low-level I/O request derived from a task. Carries the CDB copy, a
/// fixed sense-buffer area and the transfer payload.
#[derive(Debug)]
pub struct MappedRequest {
    cdb: [u8; CDB_SIZE],
    cdb_len: usize,
    dir: XferDir,
    payload: Payload,
    sense: SenseData,
}

impl MappedRequest {
    fn new(cdb: &[u8], dir: XferDir, payload: Payload) -> Self {
        assert!(!cdb.is_empty() && cdb.len() <= CDB_SIZE);
        let mut buf = [0u8; CDB_SIZE];
        buf[..cdb.len()].copy_from_slice(cdb);
        Self {
            cdb: buf,
            cdb_len: cdb.len(),
            dir,
            payload,
            sense: SenseData::empty(),
        }
    }

    /// Flat-buffer path, outbound: one blocking copy of the caller's
    /// contiguous buffer into the request's own transfer region.
    #[must_use]
    pub fn flat_out(cdb: &[u8], data: &[u8]) -> Self {
        let payload = if data.is_empty() {
            Payload::None
        } else {
            Payload::Flat(BytesMut::from(data))
        };
        Self::new(cdb, XferDir::ToDevice, payload)
    }

    /// Flat-buffer path, inbound: a request-owned zeroed response region.
    #[must_use]
    pub fn flat_in(cdb: &[u8], len: usize) -> Self {
        let payload = if len == 0 {
            Payload::None
        } else {
            Payload::Flat(BytesMut::zeroed(len))
        };
        Self::new(cdb, XferDir::FromDevice, payload)
    }

    /// A request without a data phase.
    #[must_use]
    pub fn non_data(cdb: &[u8]) -> Self {
        Self::new(cdb, XferDir::None, Payload::None)
    }

    #[must_use]
    pub fn cdb(&self) -> &[u8] {
        &self.cdb[..self.cdb_len]
    }

    #[must_use]
    pub fn direction(&self) -> XferDir {
        self.dir
    }

    #[must_use]
    pub fn sense(&self) -> &SenseData {
        &self.sense
    }

    /// Record sense data reported alongside a check condition.
    pub fn set_sense(&mut self, raw: &[u8]) {
        self.sense = SenseData::from_bytes(raw);
    }

    #[must_use]
    pub fn payload_len(&self) -> usize {
        match &self.payload {
            Payload::None => 0,
            Payload::Flat(buf) => buf.len(),
            Payload::Chains(chains) => chains.iter().map(|c| c.byte_len() as usize).sum(),
        }
    }

    #[must_use]
    pub fn chain_count(&self) -> usize {
        match &self.payload {
            Payload::Chains(chains) => chains.len(),
            Payload::None | Payload::Flat(_) => 0,
        }
    }

    pub(crate) fn chains(&self) -> &[Chain] {
        match &self.payload {
            Payload::Chains(chains) => chains,
            Payload::None | Payload::Flat(_) => &[],
        }
    }

    /// Device side: fill the transfer region with response bytes. Returns
    /// the number of bytes actually placed.
    pub fn fill_payload(&mut self, data: &[u8]) -> usize {
        match &mut self.payload {
            Payload::None => 0,
            Payload::Flat(buf) => {
                let n = Ord::min(buf.len(), data.len());
                buf[..n].copy_from_slice(&data[..n]);
                n
            }
            Payload::Chains(chains) => {
                let mut copied = 0;
                for seg in chains.iter().flat_map(|c| &c.segments) {
                    if copied == data.len() {
                        break;
                    }
                    let n = Ord::min(seg.len as usize, data.len() - copied);
                    seg.page
                        .copy_in(seg.offset as usize, &data[copied..copied + n]);
                    copied += n;
                }
                copied
            }
        }
    }

    /// Device side: gather the outbound transfer region into one buffer.
    #[must_use]
    pub fn gather_payload(&self) -> Vec<u8> {
        match &self.payload {
            Payload::None => Vec::new(),
            Payload::Flat(buf) => buf.to_vec(),
            Payload::Chains(chains) => {
                let mut out = vec![0u8; self.payload_len()];
                let mut off = 0;
                for seg in chains.iter().flat_map(|c| &c.segments) {
                    let n = seg.len as usize;
                    seg.page.copy_out(seg.offset as usize, &mut out[off..off + n]);
                    off += n;
                }
                out
            }
        }
    }

    /// Mutate the leading `len` bytes of the transfer region in place, for
    /// completion fix-ups. Returns `None` (fix-up skipped) when the region
    /// is shorter than `len` or the leading segment cannot cover it.
    pub(crate) fn with_leading_mut<R>(
        &mut self,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Option<R> {
        match &mut self.payload {
            Payload::None => None,
            Payload::Flat(buf) => (buf.len() >= len).then(|| f(&mut buf[..len])),
            Payload::Chains(chains) => {
                let seg = chains.first()?.segments.first()?;
                (seg.len as usize >= len)
                    .then(|| seg.page.with_mut(seg.offset as usize, len, f))
            }
        }
    }

    /// Copy of the leading `len` bytes of the transfer region, if present.
    pub(crate) fn leading(&self, len: usize) -> Option<Vec<u8>> {
        match &self.payload {
            Payload::None => None,
            Payload::Flat(buf) => (buf.len() >= len).then(|| buf[..len].to_vec()),
            Payload::Chains(chains) => {
                let seg = chains.first()?.segments.first()?;
                (seg.len as usize >= len).then(|| {
                    let mut out = vec![0u8; len];
                    seg.page.copy_out(seg.offset as usize, &mut out);
                    out
                })
            }
        }
    }

    /// Take the flat response buffer out of a completed probe request.
    pub(crate) fn into_flat(self) -> Option<BytesMut> {
        match self.payload {
            Payload::Flat(buf) => Some(buf),
            Payload::None | Payload::Chains(_) => None,
        }
    }
}

/// The request pair produced for one task.
#[derive(Debug)]
pub struct MappedTask {
    pub primary: MappedRequest,
    pub secondary: Option<MappedRequest>,
    /// Number of scatter/gather fragments mapped across both requests.
    pub mapped_fragments: usize,
}

/// Map one task into its request pair.
pub(crate) fn map_task(task: &Task) -> Result<MappedTask> {
    let cdb = &task.cdb;
    match &task.data {
        TaskData::None => Ok(MappedTask {
            primary: MappedRequest::non_data(cdb),
            secondary: None,
            mapped_fragments: 0,
        }),
        TaskData::FlatOut(data) => Ok(MappedTask {
            primary: MappedRequest::flat_out(cdb, data),
            secondary: None,
            mapped_fragments: 0,
        }),
        TaskData::FlatIn(len) => Ok(MappedTask {
            primary: MappedRequest::flat_in(cdb, *len),
            secondary: None,
            mapped_fragments: 0,
        }),
        TaskData::ReadSg(sg) => {
            let (primary, n) = map_sg(cdb, XferDir::FromDevice, sg)?;
            Ok(MappedTask {
                primary,
                secondary: None,
                mapped_fragments: n,
            })
        }
        TaskData::WriteSg(sg) => {
            let (primary, n) = map_sg(cdb, XferDir::ToDevice, sg)?;
            Ok(MappedTask {
                primary,
                secondary: None,
                mapped_fragments: n,
            })
        }
        TaskData::Bidi { write, read } => {
            let (primary, n_out) = map_sg(cdb, XferDir::ToDevice, write)?;
            // Dropping `primary` on a secondary mapping failure releases its
            // chains; nothing is submitted.
            let (secondary, n_in) = map_sg(cdb, XferDir::FromDevice, read)?;
            Ok(MappedTask {
                primary,
                secondary: Some(secondary),
                mapped_fragments: n_out + n_in,
            })
        }
    }
}

/// Zero-copy path: walk the fragment list in order, carving off the smaller
/// of (fragment-remaining, page-remaining, still-needed) each step, closing
/// a chain whenever the segment cap is reached.
///
/// Returns the request and the count of fragments mapped. On any failure the
/// chains built so far are released before the error is returned.
pub(crate) fn map_sg(cdb: &[u8], dir: XferDir, sg: &SgList) -> Result<(MappedRequest, usize)> {
    let mut chains = vec![Chain::new()];
    let mut needed = sg.total_len;
    let mut mapped_fragments = 0usize;

    let walk = (|| -> Result<()> {
        for frag in &sg.fragments {
            if needed == 0 {
                break;
            }
            let mut frag_off = frag.offset;
            let mut frag_rem = frag.len;
            let mut touched = false;
            while frag_rem > 0 && needed > 0 {
                let page_rem = (PAGE_SIZE as u32).saturating_sub(frag_off);
                let take = frag_rem.min(page_rem).min(needed);
                let chain = {
                    if chains.last().is_some_and(Chain::is_full) {
                        chains.push(Chain::new());
                    }
                    chains.last_mut().expect("never empty")
                };
                chain.attach(&frag.page, frag_off, take)?;
                frag_off += take;
                frag_rem -= take;
                needed -= take;
                touched = true;
            }
            if touched {
                mapped_fragments += 1;
            }
        }
        // The fragment list must cover the byte budget exactly.
        if needed != 0 {
            return Err(Error::OutOfResources);
        }
        Ok(())
    })();

    if let Err(err) = walk {
        for chain in &mut chains {
            chain.release();
        }
        tracing::debug!(total_len = sg.total_len, "request mapping failed, unwound");
        return Err(err);
    }

    Ok((MappedRequest::new(cdb, dir, Payload::Chains(chains)), mapped_fragments))
}
