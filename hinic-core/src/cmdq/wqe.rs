// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Command queue WQE format
//!
//! Every command WQE is one 64-byte WQEBB made of big-endian 32-bit words:
//!
//! ```text
//! 0x00 header_info   BUFDESC_LEN[0..8] COMPLETE_FMT[15] DATA_FMT[22]
//!                    COMPLETE_REQ[23] COMPLETE_SECT_LEN[24..26]
//!                    CTRL_LEN[26..28] TOGGLED_WRAPPED[31]
//! 0x04 saved_data    ARM[31]
//! 0x08 status_info   ERRCODE[0..8]
//! 0x0C ctrl_info     PI[0..16] CMD[16..24] MOD[24..29] ACK_TYPE[29..31]
//!                    HW_BUSY[31]
//! 0x10 completion    direct u64 | SGE { hi, lo, len }
//! 0x20 body          LCMD SGE { hi, lo, len } | SCMD { len, rsvd, data[24] }
//! ```

use core::sync::atomic::{Ordering, fence};

use static_assertions::const_assert;

use crate::dma::DmaBuffer;
use crate::error::{Error, Result};
use crate::wq::Slot;

/// Bytes per command WQE
pub const WQE_SIZE: usize = 64;
/// WQEBBs per command WQE
pub const WQEBBS_PER_CMD: u16 = 1;
/// Largest payload carried inline in the WQE
pub const INLINE_DATA_MAX: usize = 24;
/// Largest command buffer
pub const CMD_BUF_SIZE: usize = 2048;

/// Bytes written in the first commit phase
const FIRST_PHASE: usize = 8;

const_assert!(WQE_SIZE == 16 * 4);
const_assert!(BODY_OFFSET + 8 + INLINE_DATA_MAX == WQE_SIZE);

const fn field(value: u32, shift: u32, mask: u32) -> u32 {
    (value & mask) << shift
}

const fn get(word: u32, shift: u32, mask: u32) -> u32 {
    (word >> shift) & mask
}

mod hdr {
    pub const BUFDESC_LEN: (u32, u32) = (0, 0xFF);
    pub const COMPLETE_FMT: (u32, u32) = (15, 0x1);
    pub const DATA_FMT: (u32, u32) = (22, 0x1);
    pub const COMPLETE_REQ: (u32, u32) = (23, 0x1);
    pub const COMPLETE_SECT_LEN: (u32, u32) = (24, 0x3);
    pub const CTRL_LEN: (u32, u32) = (26, 0x3);
    pub const WRAPPED: (u32, u32) = (31, 0x1);
}

mod ctrl {
    pub const PI: (u32, u32) = (0, 0xFFFF);
    pub const CMD: (u32, u32) = (16, 0xFF);
    pub const MOD: (u32, u32) = (24, 0x1F);
    pub const ACK_TYPE: (u32, u32) = (29, 0x3);
    pub const HW_BUSY: (u32, u32) = (31, 0x1);
}

const SAVED_ARM: u32 = 1 << 31;
const ERRCODE_MASK: u32 = 0xFF;

/// Byte offset of ctrl_info within a WQE
pub const CTRL_OFFSET: usize = 0x0C;
/// Byte offset of status_info within a WQE
pub const STATUS_OFFSET: usize = 0x08;
const COMPLETION_OFFSET: usize = 0x10;
const SGE_LEN_OFFSET: usize = COMPLETION_OFFSET + 8;
const BODY_OFFSET: usize = 0x20;
const BODY_WORD: usize = BODY_OFFSET / 4;

/// Body lengths in 8-byte units, as the hardware expects them
const BUFDESC_LCMD_LEN: u8 = 2;
const BUFDESC_SCMD_LEN: u8 = 3;
const CTRL_SECT_LEN: u8 = 1;
const COMPLETE_SECT_LEN: u8 = 3;

/// How the response is returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// 64-bit value written back into the WQE
    Direct(u64),
    /// Hardware writes into a DMA output buffer
    Sge { addr: u64, len: u32 },
}

/// Where the request data lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Body {
    /// SGE descriptor to a DMA command buffer
    Lcmd { addr: u64, len: u32 },
    /// Up to [`INLINE_DATA_MAX`] bytes inline
    Scmd { len: u8, data: [u8; INLINE_DATA_MAX] },
}

impl Body {
    pub fn inline(input: &[u8]) -> Result<Self> {
        if input.len() > INLINE_DATA_MAX {
            return Err(Error::MessageTooLarge);
        }
        let mut data = [0u8; INLINE_DATA_MAX];
        data[..input.len()].copy_from_slice(input);
        Ok(Body::Scmd {
            len: input.len() as u8,
            data,
        })
    }
}

/// Decoded command WQE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wqe {
    pub wrapped: bool,
    pub complete_req: bool,
    /// Re-arm request for the completion event
    pub arm: bool,
    pub errcode: u8,
    pub pi: u16,
    pub cmd: u8,
    pub module: u8,
    pub ack_type: u8,
    pub hw_busy: bool,
    pub completion: Completion,
    pub body: Body,
}

impl Wqe {
    /// Host-built WQE: hardware owns it until it clears the busy bit
    pub fn request(pi: u16, wrapped: bool, module: u8, cmd: u8, body: Body, completion: Completion) -> Self {
        Self {
            wrapped,
            complete_req: true,
            arm: false,
            errcode: 0,
            pi,
            cmd,
            module,
            ack_type: 0,
            hw_busy: true,
            completion,
            body,
        }
    }

    /// Host-order words, index 0 is the header
    pub fn encode(&self) -> [u32; 16] {
        let mut words = [0u32; 16];

        let (bufdesc_len, data_fmt) = match self.body {
            Body::Lcmd { .. } => (BUFDESC_LCMD_LEN, 0),
            Body::Scmd { .. } => (BUFDESC_SCMD_LEN, 1),
        };
        let complete_fmt = match self.completion {
            Completion::Direct(_) => 0,
            Completion::Sge { .. } => 1,
        };

        words[0] = field(bufdesc_len as u32, hdr::BUFDESC_LEN.0, hdr::BUFDESC_LEN.1)
            | field(complete_fmt, hdr::COMPLETE_FMT.0, hdr::COMPLETE_FMT.1)
            | field(data_fmt, hdr::DATA_FMT.0, hdr::DATA_FMT.1)
            | field(self.complete_req as u32, hdr::COMPLETE_REQ.0, hdr::COMPLETE_REQ.1)
            | field(COMPLETE_SECT_LEN as u32, hdr::COMPLETE_SECT_LEN.0, hdr::COMPLETE_SECT_LEN.1)
            | field(CTRL_SECT_LEN as u32, hdr::CTRL_LEN.0, hdr::CTRL_LEN.1)
            | field(self.wrapped as u32, hdr::WRAPPED.0, hdr::WRAPPED.1);
        words[1] = if self.arm { SAVED_ARM } else { 0 };
        words[2] = self.errcode as u32 & ERRCODE_MASK;
        words[3] = field(self.pi as u32, ctrl::PI.0, ctrl::PI.1)
            | field(self.cmd as u32, ctrl::CMD.0, ctrl::CMD.1)
            | field(self.module as u32, ctrl::MOD.0, ctrl::MOD.1)
            | field(self.ack_type as u32, ctrl::ACK_TYPE.0, ctrl::ACK_TYPE.1)
            | field(self.hw_busy as u32, ctrl::HW_BUSY.0, ctrl::HW_BUSY.1);

        match self.completion {
            Completion::Direct(value) => {
                words[4] = (value >> 32) as u32;
                words[5] = value as u32;
            }
            Completion::Sge { addr, len } => {
                words[4] = (addr >> 32) as u32;
                words[5] = addr as u32;
                words[6] = len;
            }
        }

        match self.body {
            Body::Lcmd { addr, len } => {
                words[BODY_WORD] = (addr >> 32) as u32;
                words[BODY_WORD + 1] = addr as u32;
                words[BODY_WORD + 2] = len;
            }
            Body::Scmd { len, data } => {
                words[BODY_WORD] = len as u32;
                for (i, chunk) in data.chunks_exact(4).enumerate() {
                    words[BODY_WORD + 2 + i] =
                        u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
            }
        }

        words
    }

    /// Inverse of [`Wqe::encode`]
    pub fn decode(words: &[u32; 16]) -> Self {
        let header = words[0];
        let ctrl_info = words[3];

        let completion = if get(header, hdr::COMPLETE_FMT.0, hdr::COMPLETE_FMT.1) == 0 {
            Completion::Direct(((words[4] as u64) << 32) | words[5] as u64)
        } else {
            Completion::Sge {
                addr: ((words[4] as u64) << 32) | words[5] as u64,
                len: words[6],
            }
        };

        let body = if get(header, hdr::DATA_FMT.0, hdr::DATA_FMT.1) == 0 {
            Body::Lcmd {
                addr: ((words[BODY_WORD] as u64) << 32) | words[BODY_WORD + 1] as u64,
                len: words[BODY_WORD + 2],
            }
        } else {
            let mut data = [0u8; INLINE_DATA_MAX];
            for (i, chunk) in data.chunks_exact_mut(4).enumerate() {
                chunk.copy_from_slice(&words[BODY_WORD + 2 + i].to_be_bytes());
            }
            Body::Scmd {
                len: (words[BODY_WORD] as usize).min(INLINE_DATA_MAX) as u8,
                data,
            }
        };

        Self {
            wrapped: get(header, hdr::WRAPPED.0, hdr::WRAPPED.1) != 0,
            complete_req: get(header, hdr::COMPLETE_REQ.0, hdr::COMPLETE_REQ.1) != 0,
            arm: words[1] & SAVED_ARM != 0,
            errcode: (words[2] & ERRCODE_MASK) as u8,
            pi: get(ctrl_info, ctrl::PI.0, ctrl::PI.1) as u16,
            cmd: get(ctrl_info, ctrl::CMD.0, ctrl::CMD.1) as u8,
            module: get(ctrl_info, ctrl::MOD.0, ctrl::MOD.1) as u8,
            ack_type: get(ctrl_info, ctrl::ACK_TYPE.0, ctrl::ACK_TYPE.1) as u8,
            hw_busy: get(ctrl_info, ctrl::HW_BUSY.0, ctrl::HW_BUSY.1) != 0,
            completion,
            body,
        }
    }
}

/// Write `wqe` into `slot` in two phases.
///
/// Everything after the first 8 bytes lands first; the header and saved data
/// follow a release fence so the hardware never sees a valid wrapped bit on a
/// half-written WQE.
pub fn commit_wqe(slot: &Slot, wqe: &Wqe) {
    let words = wqe.encode();
    for (i, word) in words.iter().enumerate().skip(FIRST_PHASE / 4) {
        slot.page.write_be32(slot.offset + i * 4, *word);
    }
    fence(Ordering::Release);
    for (i, word) in words.iter().enumerate().take(FIRST_PHASE / 4) {
        slot.page.write_be32(slot.offset + i * 4, *word);
    }
}

/// Read back a WQE from DMA memory
pub fn read_wqe(buf: &DmaBuffer, offset: usize) -> Wqe {
    Wqe::decode(&read_words(buf, offset))
}

fn read_words(buf: &DmaBuffer, offset: usize) -> [u32; 16] {
    let mut words = [0u32; 16];
    for (i, word) in words.iter_mut().enumerate() {
        *word = buf.read_be32(offset + i * 4);
    }
    words
}

/// Whether the hardware still owns the WQE at `slot`
pub fn hw_busy(slot: &Slot) -> bool {
    let ctrl_info = slot.page.read_be32(slot.offset + CTRL_OFFSET);
    get(ctrl_info, ctrl::HW_BUSY.0, ctrl::HW_BUSY.1) != 0
}

/// Hardware side of a completion: write status and direct response, then
/// hand the WQE back by clearing the busy bit.
pub fn write_completion(buf: &DmaBuffer, offset: usize, errcode: u8, direct_resp: Option<u64>) {
    buf.write_be32(offset + STATUS_OFFSET, errcode as u32);
    if let Some(value) = direct_resp {
        buf.write_be64(offset + COMPLETION_OFFSET, value);
    }
    fence(Ordering::Release);
    let ctrl_info = buf.read_be32(offset + CTRL_OFFSET);
    buf.write_be32(
        offset + CTRL_OFFSET,
        ctrl_info & !field(1, ctrl::HW_BUSY.0, ctrl::HW_BUSY.1),
    );
}

/// Hardware side of a buffer response: record how many bytes were written
/// to the output SGE. Precedes [`write_completion`].
pub fn write_sge_len(buf: &DmaBuffer, offset: usize, len: u32) {
    buf.write_be32(offset + SGE_LEN_OFFSET, len);
}

/// Hex dump of the WQE words for error logs
pub fn dump(slot: &Slot) -> String {
    let words = read_words(&slot.page, slot.offset);
    let mut out = String::with_capacity(16 * 9 + 16);
    for (i, word) in words.iter().enumerate() {
        if i % 4 == 0 {
            out.push_str(if i == 0 { "" } else { " |" });
        }
        out.push_str(&format!(" {:08x}", word));
    }
    out
}

/// Queue type field of the doorbell
pub const DB_QUEUE_TYPE_CMDQ: u32 = 0;
/// Source type field of the doorbell
pub const DB_SRC_TYPE_CMDQ: u32 = 1;

/// Decoded command queue doorbell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorbellInfo {
    pub hi_prod_idx: u8,
    pub queue_type: u8,
    pub cmdq_type: u8,
    pub src_type: u8,
}

impl DoorbellInfo {
    /// `HI_PROD_IDX[0..8] QUEUE_TYPE[23] CMDQ_TYPE[24..27] SRC_TYPE[27..32]`
    pub fn encode(prod_idx: u16, cmdq_type: u8) -> u32 {
        field((prod_idx >> 8) as u32, 0, 0xFF)
            | field(DB_QUEUE_TYPE_CMDQ, 23, 0x1)
            | field(cmdq_type as u32, 24, 0x7)
            | field(DB_SRC_TYPE_CMDQ, 27, 0x1F)
    }

    pub fn decode(value: u32) -> Self {
        Self {
            hi_prod_idx: get(value, 0, 0xFF) as u8,
            queue_type: get(value, 23, 0x1) as u8,
            cmdq_type: get(value, 24, 0x7) as u8,
            src_type: get(value, 27, 0x1F) as u8,
        }
    }

    /// Offset within the doorbell page for producer index `prod_idx`
    pub fn offset(prod_idx: u16) -> usize {
        ((prod_idx & 0xFF) as usize) << 3
    }

    /// Rebuild the producer index from a doorbell write
    pub fn prod_idx(&self, offset: usize) -> u16 {
        ((self.hi_prod_idx as u16) << 8) | ((offset >> 3) & 0xFF) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{DmaAllocator, HostDma};
    use crate::wq::RingBuffer;

    #[test]
    fn test_scmd_wqe_round_trip() {
        let wqe = Wqe::request(
            0x1234,
            true,
            0x1F,
            0xAB,
            Body::inline(b"hello, hardware").unwrap(),
            Completion::Direct(0xDEAD_BEEF_0000_0001),
        );
        assert_eq!(Wqe::decode(&wqe.encode()), wqe);
    }

    #[test]
    fn test_lcmd_wqe_round_trip_through_memory() {
        let dma = HostDma::new();
        let mut wq = RingBuffer::new(&dma, 8, WQE_SIZE, 4096, 0).unwrap();
        let out = dma.alloc_coherent(CMD_BUF_SIZE).unwrap();
        let slot = wq.acquire(1).unwrap();

        let mut wqe = Wqe::request(
            slot.index,
            slot.wrapped,
            1,
            7,
            Body::Lcmd {
                addr: 0x1_2345_6000,
                len: 1500,
            },
            Completion::Sge {
                addr: out.bus_addr(),
                len: CMD_BUF_SIZE as u32,
            },
        );
        wqe.errcode = 0x42;
        commit_wqe(&slot, &wqe);

        assert_eq!(read_wqe(&slot.page, slot.offset), wqe);
        assert!(hw_busy(&slot));
    }

    #[test]
    fn test_header_is_big_endian_in_memory() {
        let dma = HostDma::new();
        let mut wq = RingBuffer::new(&dma, 8, WQE_SIZE, 4096, 0).unwrap();
        let slot = wq.acquire(1).unwrap();
        let wqe = Wqe::request(0, true, 0, 0, Body::inline(&[]).unwrap(), Completion::Direct(0));
        commit_wqe(&slot, &wqe);

        let mut raw = [0u8; 4];
        slot.page.read_bytes(slot.offset, &mut raw);
        assert_eq!(raw[0] & 0x80, 0x80, "wrapped bit must be in the first byte");
        assert_eq!(raw[3], BUFDESC_SCMD_LEN);
    }

    #[test]
    fn test_hardware_completion_clears_busy() {
        let dma = HostDma::new();
        let mut wq = RingBuffer::new(&dma, 8, WQE_SIZE, 4096, 0).unwrap();
        let slot = wq.acquire(1).unwrap();
        let wqe = Wqe::request(0, true, 3, 9, Body::inline(&[1, 2]).unwrap(), Completion::Direct(0));
        commit_wqe(&slot, &wqe);

        write_completion(&slot.page, slot.offset, 5, Some(77));
        let done = read_wqe(&slot.page, slot.offset);
        assert!(!done.hw_busy);
        assert_eq!(done.errcode, 5);
        assert_eq!(done.completion, Completion::Direct(77));
        assert_eq!(done.cmd, 9);
    }

    #[test]
    fn test_inline_limit() {
        assert!(Body::inline(&[0u8; INLINE_DATA_MAX]).is_ok());
        assert_eq!(
            Body::inline(&[0u8; INLINE_DATA_MAX + 1]).unwrap_err(),
            Error::MessageTooLarge
        );
    }

    #[test]
    fn test_doorbell_encoding() {
        let value = DoorbellInfo::encode(0x0305, 1);
        let info = DoorbellInfo::decode(value);
        assert_eq!(info.hi_prod_idx, 0x03);
        assert_eq!(info.cmdq_type, 1);
        assert_eq!(info.src_type as u32, DB_SRC_TYPE_CMDQ);
        assert_eq!(DoorbellInfo::offset(0x0305), 5 << 3);
        assert_eq!(info.prod_idx(DoorbellInfo::offset(0x0305)), 0x0305);
    }
}
