//! Bit-exact SCSI wire helpers: the opcodes this layer inspects, SAM status
//! bytes, standard-INQUIRY field extraction, VPD page parsing and the mode
//! parameter fix-ups applied by the completion translator.
//!
//! Everything here is a pure function over byte slices; malformed input is
//! answered with `None` (best-effort callers simply skip the fix-up).

/// Opcodes inspected by this layer. All other CDBs are opaque.
pub const INQUIRY: u8 = 0x12;
pub const MODE_SELECT_6: u8 = 0x15;
pub const MODE_SENSE_6: u8 = 0x1a;
pub const MODE_SELECT_10: u8 = 0x55;
pub const MODE_SENSE_10: u8 = 0x5a;

/// VPD page numbers probed during identity discovery.
pub const VPD_UNIT_SERIAL: u8 = 0x80;
pub const VPD_DEVICE_ID: u8 = 0x83;

/// Allocation length used for both VPD probes.
pub const VPD_ALLOC_LEN: u8 = 254;

/// SAM status bytes in target-mode encoding.
pub mod sam {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
}

/// Minimum standard INQUIRY length carrying vendor/model/revision.
pub const INQUIRY_MIN_LEN: usize = 36;

const VENDOR_OFF: usize = 8;
const MODEL_OFF: usize = 16;
const REVISION_OFF: usize = 32;

/// Vendor (8), model (16) and revision (4) fields of a standard INQUIRY
/// response, or `None` if the data is too short to carry them.
pub fn inquiry_strings(data: &[u8]) -> Option<([u8; 8], [u8; 16], [u8; 4])> {
    if data.len() < INQUIRY_MIN_LEN {
        return None;
    }
    let mut vendor = [0u8; 8];
    let mut model = [0u8; 16];
    let mut revision = [0u8; 4];
    vendor.copy_from_slice(&data[VENDOR_OFF..VENDOR_OFF + 8]);
    model.copy_from_slice(&data[MODEL_OFF..MODEL_OFF + 16]);
    revision.copy_from_slice(&data[REVISION_OFF..REVISION_OFF + 4]);
    Some((vendor, model, revision))
}

/// Unit serial string from a VPD page 0x80 response. The serial begins at
/// byte 4; its length is the page length at byte 3. Trailing NULs and spaces
/// are stripped.
pub fn unit_serial(data: &[u8]) -> Option<String> {
    let page_len = usize::from(*data.get(3)?);
    let tail = data.get(4..)?;
    let raw = &tail[..Ord::min(page_len, tail.len())];
    let s = String::from_utf8_lossy(raw)
        .trim_end_matches(['\0', ' '])
        .to_owned();
    (!s.is_empty()).then_some(s)
}

/// One designation descriptor from a VPD page 0x83 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdDescriptor {
    pub protocol_id: u8,
    pub code_set: u8,
    pub association: u8,
    pub ident_type: u8,
    pub ident: Vec<u8>,
}

/// Walk the descriptor list of a VPD page 0x83 response.
///
/// The total list length is a 16-bit big-endian value at bytes 2..4. Each
/// descriptor has a 4-byte header (protocol/code-set, association/type,
/// reserved, identifier length) followed by that many identifier bytes.
/// Descriptors with a reserved association or identifier type are skipped
/// without aborting the walk; a descriptor claiming zero identifier length
/// terminates the walk early.
pub fn walk_device_id(data: &[u8]) -> Vec<DeviceIdDescriptor> {
    let mut out = Vec::new();
    let Some(&[hi, lo]) = data.get(2..4).and_then(|s| <&[u8; 2]>::try_from(s).ok()) else {
        return out;
    };
    let list_len = usize::from(u16::from_be_bytes([hi, lo]));
    let mut off = 4;
    let end = Ord::min(4 + list_len, data.len());
    while off + 4 <= end {
        let header = &data[off..off + 4];
        let ident_len = usize::from(header[3]);
        if ident_len == 0 {
            // Malformed: nothing can follow a zero-length identifier.
            break;
        }
        let next = off + 4 + ident_len;
        if next > end {
            break;
        }
        let association = (header[1] >> 4) & 0x3;
        let ident_type = header[1] & 0xf;
        // Association 3 and identifier types above 8 are reserved; skip the
        // descriptor but keep walking.
        if association <= 0x2 && ident_type <= 0x8 {
            out.push(DeviceIdDescriptor {
                protocol_id: header[0] >> 4,
                code_set: header[0] & 0xf,
                association,
                ident_type,
                ident: data[off + 4..next].to_vec(),
            });
        }
        off = next;
    }
    out
}

/// Force the write-protect bit on in a MODE SENSE response header.
///
/// Byte 2 bit 7 for the 6-byte form, byte 3 bit 7 for the 10-byte form.
/// Returns `false` (fix-up skipped) for other opcodes or short data.
pub fn force_write_protect(opcode: u8, data: &mut [u8]) -> bool {
    let off = match opcode {
        MODE_SENSE_6 => 2,
        MODE_SENSE_10 => 3,
        _ => return false,
    };
    match data.get_mut(off) {
        Some(b) => {
            *b |= 0x80;
            true
        }
        None => false,
    }
}

/// Block size carried in a mode parameter block's block descriptor, or
/// `None` if the block-descriptor length is zero or the data is short.
///
/// 6-byte form: descriptor length at byte 3, block size big-endian at bytes
/// 9..12. 10-byte form: descriptor length big-endian at bytes 6..8, block
/// size at bytes 13..16.
pub fn block_descriptor_size(data: &[u8], ten_byte: bool) -> Option<u32> {
    let (bd_len, size_off) = if ten_byte {
        let len = u16::from_be_bytes([*data.get(6)?, *data.get(7)?]);
        (usize::from(len), 13)
    } else {
        (usize::from(*data.get(3)?), 9)
    };
    if bd_len == 0 {
        return None;
    }
    let b = data.get(size_off..size_off + 3)?;
    Some(u32::from_be_bytes([0, b[0], b[1], b[2]]))
}

/// Block size from a MODE SELECT parameter block, dispatched on the opcode.
pub fn mode_select_block_size(opcode: u8, data: &[u8]) -> Option<u32> {
    match opcode {
        MODE_SELECT_6 => block_descriptor_size(data, false),
        MODE_SELECT_10 => block_descriptor_size(data, true),
        _ => None,
    }
}

/// Build an INQUIRY CDB, optionally for a VPD page.
#[must_use]
pub fn inquiry_cdb(vpd_page: Option<u8>, alloc_len: u8) -> [u8; 6] {
    let mut cdb = [0u8; 6];
    cdb[0] = INQUIRY;
    if let Some(page) = vpd_page {
        cdb[1] = 0x01; // EVPD
        cdb[2] = page;
    }
    cdb[4] = alloc_len;
    cdb
}

/// Build a MODE SENSE(6) CDB for the current values of `page`.
#[must_use]
pub fn mode_sense6_cdb(page: u8, alloc_len: u8) -> [u8; 6] {
    let mut cdb = [0u8; 6];
    cdb[0] = MODE_SENSE_6;
    cdb[2] = page;
    cdb[4] = alloc_len;
    cdb
}
