// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Management message framing
//!
//! A message travels as up to [`MAX_SEGMENTS`] segments of at most
//! [`SEGMENT_LEN`] bytes, each preceded by a 64-bit header:
//!
//! ```text
//! MSG_LEN[0..11] MODULE[11..16] SEG_LEN[16..22] NO_ACK[22]
//! ASYNC_MGMT_TO_PF[23] SEQID[24..30] LAST[30] DIRECTION[31] CMD[32..40]
//! PCI_INTF[48..50] FUNC_IDX[50..54] MSG_ID[54..64]
//! ```
//!
//! Outbound, each segment fills one API chain cell as
//! `[8 reserved][8 header][segment]`. Inbound, the AEQ element data holds
//! `[8 header][segment]`. Headers are little-endian.

use static_assertions::const_assert;

/// Payload bytes per segment
pub const SEGMENT_LEN: usize = 48;
/// Largest message payload
pub const MAX_MSG_LEN: usize = 2016;
pub const MAX_SEGMENTS: usize = MAX_MSG_LEN / SEGMENT_LEN;
/// Device-reserved prefix of an outbound cell
pub const CELL_RSVD_LEN: usize = 8;
pub const HEADER_LEN: usize = 8;
/// Message ids on the wire are 9 bits plus the async flag
pub const MSG_ID_MASK: u16 = 0x1FF;
/// Set in the message id of async sends
pub const ASYNC_MSG_FLAG: u16 = 0x200;

const_assert!(MAX_SEGMENTS * SEGMENT_LEN == MAX_MSG_LEN);
const_assert!(MAX_SEGMENTS <= 0x3F + 1);
const_assert!(MAX_MSG_LEN <= 0x7FF);
const_assert!(HEADER_LEN + SEGMENT_LEN <= crate::eqs::AEQ_DATA_LEN);

/// Message direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Request,
    Response,
}

/// Decoded segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub msg_len: u16,
    pub module: u8,
    pub seg_len: u8,
    pub no_ack: bool,
    pub async_mgmt_to_pf: bool,
    pub seq_id: u8,
    pub last: bool,
    pub direction: Direction,
    pub cmd: u8,
    pub pci_intf: u8,
    pub func_idx: u8,
    pub msg_id: u16,
}

const fn bits(value: u64, shift: u32, mask: u64) -> u64 {
    (value & mask) << shift
}

const fn take(header: u64, shift: u32, mask: u64) -> u64 {
    (header >> shift) & mask
}

impl MsgHeader {
    pub fn encode(&self) -> u64 {
        bits(self.msg_len as u64, 0, 0x7FF)
            | bits(self.module as u64, 11, 0x1F)
            | bits(self.seg_len as u64, 16, 0x3F)
            | bits(self.no_ack as u64, 22, 0x1)
            | bits(self.async_mgmt_to_pf as u64, 23, 0x1)
            | bits(self.seq_id as u64, 24, 0x3F)
            | bits(self.last as u64, 30, 0x1)
            | bits((self.direction == Direction::Response) as u64, 31, 0x1)
            | bits(self.cmd as u64, 32, 0xFF)
            | bits(self.pci_intf as u64, 48, 0x3)
            | bits(self.func_idx as u64, 50, 0xF)
            | bits(self.msg_id as u64, 54, 0x3FF)
    }

    pub fn decode(header: u64) -> Self {
        Self {
            msg_len: take(header, 0, 0x7FF) as u16,
            module: take(header, 11, 0x1F) as u8,
            seg_len: take(header, 16, 0x3F) as u8,
            no_ack: take(header, 22, 0x1) != 0,
            async_mgmt_to_pf: take(header, 23, 0x1) != 0,
            seq_id: take(header, 24, 0x3F) as u8,
            last: take(header, 30, 0x1) != 0,
            direction: if take(header, 31, 0x1) != 0 {
                Direction::Response
            } else {
                Direction::Request
            },
            cmd: take(header, 32, 0xFF) as u8,
            pci_intf: take(header, 48, 0x3) as u8,
            func_idx: take(header, 50, 0xF) as u8,
            msg_id: take(header, 54, 0x3FF) as u16,
        }
    }

    pub fn is_async_id(&self) -> bool {
        self.msg_id & ASYNC_MSG_FLAG != 0
    }
}

/// Split `payload` into `(header, segment)` pairs. `template` supplies
/// everything but the per-segment fields.
pub fn segments<'a>(
    template: MsgHeader,
    payload: &'a [u8],
) -> impl Iterator<Item = (MsgHeader, &'a [u8])> + 'a {
    let count = payload.len().div_ceil(SEGMENT_LEN).max(1);
    (0..count).map(move |seq| {
        let start = seq * SEGMENT_LEN;
        let end = (start + SEGMENT_LEN).min(payload.len());
        let header = MsgHeader {
            msg_len: payload.len() as u16,
            seg_len: (end - start) as u8,
            seq_id: seq as u8,
            last: seq + 1 == count,
            ..template
        };
        (header, &payload[start..end])
    })
}

/// Outbound API chain cell data: `[8 reserved][8 header][segment]`
pub fn encode_cell(header: &MsgHeader, segment: &[u8]) -> Vec<u8> {
    let mut cell = vec![0u8; CELL_RSVD_LEN + HEADER_LEN + segment.len()];
    cell[CELL_RSVD_LEN..CELL_RSVD_LEN + HEADER_LEN].copy_from_slice(&header.encode().to_le_bytes());
    cell[CELL_RSVD_LEN + HEADER_LEN..].copy_from_slice(segment);
    cell
}

/// Inverse of [`encode_cell`]
pub fn decode_cell(cell: &[u8]) -> Option<(MsgHeader, &[u8])> {
    parse_event(cell.get(CELL_RSVD_LEN..)?)
}

/// Inbound AEQ element data: `[8 header][segment]`
pub fn encode_event(header: &MsgHeader, segment: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(HEADER_LEN + segment.len());
    data.extend_from_slice(&header.encode().to_le_bytes());
    data.extend_from_slice(segment);
    data
}

/// Split AEQ element data into header and segment. The segment is cut to
/// the header's segment length; `None` if the data is shorter than that.
pub fn parse_event(data: &[u8]) -> Option<(MsgHeader, &[u8])> {
    let raw: [u8; HEADER_LEN] = data.get(..HEADER_LEN)?.try_into().ok()?;
    let header = MsgHeader::decode(u64::from_le_bytes(raw));
    let segment = data.get(HEADER_LEN..HEADER_LEN + header.seg_len as usize)?;
    Some((header, segment))
}

/// A fully reassembled message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Header of the last segment
    pub header: MsgHeader,
    pub payload: Vec<u8>,
}

/// Why a segment was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Continuation segment with no message in progress
    NoMessage,
    /// Sequence id is not the next expected one (gap or duplicate)
    OutOfOrder { expected: u8, got: u8 },
    /// Message id changed mid-message
    IdChanged { expected: u16, got: u16 },
    /// Segment or message length out of bounds or inconsistent
    BadLength,
}

/// Result of feeding one segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed {
    /// Accepted, more segments expected
    Partial,
    Complete(Message),
    /// Rejected; any partial message was discarded
    Dropped(DropReason),
}

enum AssemblyState {
    Idle,
    Assembling {
        msg_id: u16,
        module: u8,
        cmd: u8,
        next_seq: u8,
        buf: Vec<u8>,
    },
}

/// In-order reassembly of one direction's segment stream
pub struct Reassembler {
    state: AssemblyState,
}

impl Reassembler {
    pub const fn new() -> Self {
        Self {
            state: AssemblyState::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, AssemblyState::Idle)
    }

    pub fn feed(&mut self, header: &MsgHeader, segment: &[u8]) -> Feed {
        let seg_len = header.seg_len as usize;
        if seg_len > SEGMENT_LEN
            || segment.len() < seg_len
            || header.msg_len as usize > MAX_MSG_LEN
            || (!header.last && seg_len != SEGMENT_LEN)
        {
            self.state = AssemblyState::Idle;
            return Feed::Dropped(DropReason::BadLength);
        }

        if header.seq_id == 0 {
            if !self.is_idle() {
                log::warn!(
                    "hinic: new message {} restarts unfinished reassembly",
                    header.msg_id
                );
            }
            self.state = AssemblyState::Assembling {
                msg_id: header.msg_id,
                module: header.module,
                cmd: header.cmd,
                next_seq: 0,
                buf: Vec::with_capacity(header.msg_len as usize),
            };
        }

        let AssemblyState::Assembling {
            msg_id,
            module,
            cmd,
            next_seq,
            buf,
        } = &mut self.state
        else {
            return Feed::Dropped(DropReason::NoMessage);
        };

        let reason = if header.msg_id != *msg_id {
            Some(DropReason::IdChanged {
                expected: *msg_id,
                got: header.msg_id,
            })
        } else if header.seq_id != *next_seq {
            Some(DropReason::OutOfOrder {
                expected: *next_seq,
                got: header.seq_id,
            })
        } else if header.module != *module || header.cmd != *cmd {
            Some(DropReason::BadLength)
        } else {
            None
        };
        if let Some(reason) = reason {
            self.state = AssemblyState::Idle;
            return Feed::Dropped(reason);
        }

        buf.extend_from_slice(&segment[..seg_len]);
        *next_seq += 1;

        if !header.last {
            if buf.len() >= MAX_MSG_LEN {
                self.state = AssemblyState::Idle;
                return Feed::Dropped(DropReason::BadLength);
            }
            return Feed::Partial;
        }

        let payload = std::mem::take(buf);
        self.state = AssemblyState::Idle;
        if payload.len() != header.msg_len as usize {
            return Feed::Dropped(DropReason::BadLength);
        }
        Feed::Complete(Message {
            header: *header,
            payload,
        })
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> MsgHeader {
        MsgHeader {
            msg_len: 0,
            module: 1,
            seg_len: 0,
            no_ack: false,
            async_mgmt_to_pf: false,
            seq_id: 0,
            last: false,
            direction: Direction::Request,
            cmd: 0x20,
            pci_intf: 2,
            func_idx: 5,
            msg_id: 0x1AB,
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn test_header_fields() {
        let header = MsgHeader {
            msg_len: 2016,
            seg_len: 48,
            seq_id: 41,
            last: true,
            no_ack: true,
            async_mgmt_to_pf: true,
            direction: Direction::Response,
            msg_id: 0x3FF,
            ..template()
        };
        let raw = header.encode();
        assert_eq!(raw & 0x7FF, 2016);
        assert_eq!(raw >> 54, 0x3FF);
        assert_eq!(MsgHeader::decode(raw), header);
        assert!(header.is_async_id());
    }

    #[test]
    fn test_segmentation_counts() {
        let data = payload(100);
        let segs: Vec<_> = segments(template(), &data).collect();
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[2].0.seg_len, 4);
        assert!(segs[2].0.last && !segs[1].0.last);
        assert_eq!(segs[1].0.seq_id, 1);

        let empty: Vec<_> = segments(template(), &[]).collect();
        assert_eq!(empty.len(), 1);
        assert!(empty[0].0.last);
    }

    #[test]
    fn test_reassembly_in_order() {
        let data = payload(130);
        let mut rx = Reassembler::new();
        let mut result = None;
        for (header, seg) in segments(template(), &data) {
            let event = encode_event(&header, seg);
            let (header, seg) = parse_event(&event).unwrap();
            match rx.feed(&header, seg) {
                Feed::Partial => {}
                Feed::Complete(msg) => result = Some(msg),
                Feed::Dropped(reason) => panic!("dropped: {:?}", reason),
            }
        }
        let msg = result.unwrap();
        assert_eq!(msg.payload, data);
        assert_eq!(msg.header.cmd, 0x20);
        assert!(rx.is_idle());
    }

    #[test]
    fn test_reassembly_out_of_order_discards() {
        let data = payload(144);
        let segs: Vec<_> = segments(template(), &data).collect();
        let mut rx = Reassembler::new();
        assert_eq!(rx.feed(&segs[0].0, segs[0].1), Feed::Partial);
        assert_eq!(
            rx.feed(&segs[2].0, segs[2].1),
            Feed::Dropped(DropReason::OutOfOrder { expected: 1, got: 2 })
        );
        assert!(rx.is_idle());
        assert_eq!(
            rx.feed(&segs[1].0, segs[1].1),
            Feed::Dropped(DropReason::NoMessage)
        );
    }

    #[test]
    fn test_duplicate_segment_discards() {
        let data = payload(144);
        let segs: Vec<_> = segments(template(), &data).collect();
        let mut rx = Reassembler::new();
        assert_eq!(rx.feed(&segs[0].0, segs[0].1), Feed::Partial);
        assert_eq!(rx.feed(&segs[1].0, segs[1].1), Feed::Partial);
        assert!(matches!(rx.feed(&segs[1].0, segs[1].1), Feed::Dropped(_)));
        assert!(matches!(rx.feed(&segs[2].0, segs[2].1), Feed::Dropped(_)));
    }

    #[test]
    fn test_message_id_change_discards() {
        let data = payload(96);
        let segs: Vec<_> = segments(template(), &data).collect();
        let mut rx = Reassembler::new();
        rx.feed(&segs[0].0, segs[0].1);
        let other = MsgHeader {
            msg_id: 7,
            ..segs[1].0
        };
        assert_eq!(
            rx.feed(&other, segs[1].1),
            Feed::Dropped(DropReason::IdChanged {
                expected: 0x1AB,
                got: 7
            })
        );
    }

    #[test]
    fn test_cell_layout() {
        let header = MsgHeader {
            msg_len: 3,
            seg_len: 3,
            last: true,
            ..template()
        };
        let cell = encode_cell(&header, &[9, 8, 7]);
        assert_eq!(&cell[..CELL_RSVD_LEN], &[0u8; CELL_RSVD_LEN]);
        assert_eq!(cell.len(), 19);
        let (decoded, seg) = decode_cell(&cell).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(seg, &[9, 8, 7]);
    }
}
