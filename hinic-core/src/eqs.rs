// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Event queues
//!
//! The card reports asynchronous events (AEQ) and completion events (CEQ)
//! through rings in host memory. Ownership is tracked with a wrapped bit in
//! every element: an element is new when its bit differs from the queue's
//! flag, which toggles each time the consumer index wraps.
//!
//! AEQ element: 60 data bytes, then a big-endian descriptor
//! `TYPE[0..7] SRC[7] SIZE[8..16] WRAPPED[31]`.
//! CEQ element: big-endian `DATA[0..23] TYPE[23..26] WRAPPED[31]`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::dma::DmaBuffer;
use crate::error::{Error, Result};
use crate::hwif::{Hwif, csr};
use crate::stats::ChannelStats;

pub const AEQ_ELEM_SIZE: usize = 64;
pub const AEQ_DATA_LEN: usize = 60;
pub const CEQ_ELEM_SIZE: usize = 4;
/// Consumer index is reported (not armed) every this many elements
pub const UPDATE_CI_STEP: u32 = 64;

const AEQ_DESC_OFFSET: usize = AEQ_DATA_LEN;
const WRAPPED_BIT: u32 = 1 << 31;

/// Hardware AEQ event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AeqEventType {
    HwInterInt = 0,
    MbxFromFunc = 1,
    MsgFromMgmtCpu = 2,
    ApiRsp = 3,
    ApiChainSts = 4,
    MbxSendRslt = 5,
}

impl AeqEventType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => AeqEventType::HwInterInt,
            1 => AeqEventType::MbxFromFunc,
            2 => AeqEventType::MsgFromMgmtCpu,
            3 => AeqEventType::ApiRsp,
            4 => AeqEventType::ApiChainSts,
            5 => AeqEventType::MbxSendRslt,
            _ => return None,
        })
    }
}

/// CEQ event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CeqEventType {
    NonL2nicScq = 0,
    NonL2nicEcq = 1,
    NonL2nicNoCqEq = 2,
    Cmdq = 3,
    L2nicSq = 4,
    L2nicRq = 5,
}

impl CeqEventType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => CeqEventType::NonL2nicScq,
            1 => CeqEventType::NonL2nicEcq,
            2 => CeqEventType::NonL2nicNoCqEq,
            3 => CeqEventType::Cmdq,
            4 => CeqEventType::L2nicSq,
            5 => CeqEventType::L2nicRq,
            _ => return None,
        })
    }
}

/// Decoded AEQ element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AeqElement {
    pub event: u8,
    /// Software-raised event
    pub sw: bool,
    pub size: u8,
    pub wrapped: bool,
    pub data: [u8; AEQ_DATA_LEN],
}

impl AeqElement {
    pub fn descriptor(&self) -> u32 {
        (self.event as u32 & 0x7F)
            | (self.sw as u32) << 7
            | (self.size as u32) << 8
            | if self.wrapped { WRAPPED_BIT } else { 0 }
    }

    /// Device side: data first, descriptor (carrying the wrapped bit) last
    pub fn write(&self, buf: &DmaBuffer, offset: usize) {
        buf.write_bytes(offset, &self.data);
        buf.write_be32(offset + AEQ_DESC_OFFSET, self.descriptor());
    }

    pub fn read(buf: &DmaBuffer, offset: usize) -> Self {
        let desc = buf.read_be32(offset + AEQ_DESC_OFFSET);
        let mut data = [0u8; AEQ_DATA_LEN];
        buf.read_bytes(offset, &mut data);
        Self {
            event: (desc & 0x7F) as u8,
            sw: desc & (1 << 7) != 0,
            size: ((desc >> 8) & 0xFF) as u8,
            wrapped: desc & WRAPPED_BIT != 0,
            data,
        }
    }

    /// Valid portion of the data
    pub fn payload(&self) -> &[u8] {
        &self.data[..(self.size as usize).min(AEQ_DATA_LEN)]
    }
}

/// Decoded CEQ element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CeqElement {
    pub event: u8,
    pub data: u32,
    pub wrapped: bool,
}

impl CeqElement {
    pub fn encode(&self) -> u32 {
        (self.data & 0x7F_FFFF)
            | (self.event as u32 & 0x7) << 23
            | if self.wrapped { WRAPPED_BIT } else { 0 }
    }

    pub fn decode(value: u32) -> Self {
        Self {
            event: ((value >> 23) & 0x7) as u8,
            data: value & 0x7F_FFFF,
            wrapped: value & WRAPPED_BIT != 0,
        }
    }
}

/// AEQ or CEQ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EqKind {
    Aeq,
    Ceq,
}

impl EqKind {
    pub fn elem_size(self) -> usize {
        match self {
            EqKind::Aeq => AEQ_ELEM_SIZE,
            EqKind::Ceq => CEQ_ELEM_SIZE,
        }
    }

    /// CTRL1 element size code: log2 of the size in 32-byte units. CEQ
    /// elements have a fixed size and leave the field zero.
    pub fn elem_size_code(self) -> u32 {
        match self {
            EqKind::Aeq => (AEQ_ELEM_SIZE / 32).ilog2(),
            EqKind::Ceq => 0,
        }
    }

    /// CTRL1 value for a queue of `len` elements
    pub fn ctrl1(self, len: u32) -> u32 {
        (len & csr::EQ_CI_MASK) | self.elem_size_code() << csr::EQ_CTRL1_ELEM_SIZE_SHIFT
    }

    pub fn csr_base(self, id: u16) -> u32 {
        match self {
            EqKind::Aeq => csr::aeq(id),
            EqKind::Ceq => csr::ceq(id),
        }
    }
}

/// One element handed to the queue's consumer
pub enum EqElement {
    Aeq(AeqElement),
    Ceq(CeqElement),
}

struct EqState {
    cons_idx: u32,
    wrapped: bool,
}

/// Event queue ring
pub struct EventQueue {
    kind: EqKind,
    id: u16,
    hwif: Arc<Hwif>,
    buf: DmaBuffer,
    len: u32,
    state: Mutex<EqState>,
}

impl EventQueue {
    /// Allocate the ring and program it into the card, armed
    pub fn new(kind: EqKind, id: u16, hwif: Arc<Hwif>, len: u32, vector: u16) -> Result<Self> {
        if len == 0 || !len.is_power_of_two() || len > csr::EQ_CI_MASK {
            return Err(Error::InvalidParameter);
        }
        let buf = hwif
            .platform()
            .dma
            .alloc_coherent(len as usize * kind.elem_size())?;

        let base = kind.csr_base(id);
        hwif.write_reg(base + csr::EQ_PAGE_HI, (buf.bus_addr() >> 32) as u32);
        hwif.write_reg(base + csr::EQ_PAGE_LO, buf.bus_addr() as u32);
        hwif.write_reg(base + csr::EQ_CTRL1, kind.ctrl1(len));
        hwif.write_reg(base + csr::EQ_CTRL0, vector as u32 | csr::EQ_CTRL0_ENABLE);
        hwif.write_reg(base + csr::EQ_CONS_IDX, csr::EQ_CI_ARMED);
        log::debug!("hinic: {:?}{} with {} elements on vector {}", kind, id, len, vector);

        Ok(Self {
            kind,
            id,
            hwif,
            buf,
            len,
            state: Mutex::new(EqState {
                cons_idx: 0,
                wrapped: false,
            }),
        })
    }

    pub fn kind(&self) -> EqKind {
        self.kind
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn write_ci(&self, cons_idx: u32, armed: bool) {
        let value = (cons_idx & csr::EQ_CI_MASK) | if armed { csr::EQ_CI_ARMED } else { 0 };
        self.hwif
            .write_reg(self.kind.csr_base(self.id) + csr::EQ_CONS_IDX, value);
    }

    fn element(&self, index: u32) -> EqElement {
        let offset = index as usize * self.kind.elem_size();
        match self.kind {
            EqKind::Aeq => EqElement::Aeq(AeqElement::read(&self.buf, offset)),
            EqKind::Ceq => EqElement::Ceq(CeqElement::decode(self.buf.read_be32(offset))),
        }
    }

    /// Hand every new element to `handler`, at most one lap per call.
    /// Returns whether more work may remain.
    pub fn drain<F: FnMut(EqElement)>(&self, mut handler: F) -> bool {
        let mut state = self.state.lock();
        let mut processed = 0;

        while processed < self.len {
            let element = self.element(state.cons_idx);
            let wrapped = match &element {
                EqElement::Aeq(elem) => elem.wrapped,
                EqElement::Ceq(elem) => elem.wrapped,
            };
            if wrapped == state.wrapped {
                break;
            }

            handler(element);

            state.cons_idx += 1;
            if state.cons_idx == self.len {
                state.cons_idx = 0;
                state.wrapped = !state.wrapped;
            }
            processed += 1;
            if processed % UPDATE_CI_STEP == 0 {
                self.write_ci(state.cons_idx, false);
            }
        }

        self.write_ci(state.cons_idx, true);
        processed == self.len
    }

    /// Drain until no new element remains
    pub fn drain_all<F: FnMut(EqElement)>(&self, mut handler: F) {
        while self.drain(&mut handler) {}
    }
}

/// Callback for a hardware AEQ event, given the element payload
pub type AeqCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
/// Callback for a CEQ event, given the element data
pub type CeqCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Asynchronous event queue with its dispatch tables
pub struct Aeq {
    eq: EventQueue,
    stats: Arc<ChannelStats>,
    hw_callbacks: RwLock<HashMap<AeqEventType, AeqCallback>>,
    sw_callbacks: RwLock<HashMap<u8, AeqCallback>>,
}

impl Aeq {
    pub fn new(eq: EventQueue, stats: Arc<ChannelStats>) -> Self {
        Self {
            eq,
            stats,
            hw_callbacks: RwLock::new(HashMap::new()),
            sw_callbacks: RwLock::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> &EventQueue {
        &self.eq
    }

    pub fn register_hw_event(&self, event: AeqEventType, callback: AeqCallback) {
        self.hw_callbacks.write().insert(event, callback);
    }

    pub fn unregister_hw_event(&self, event: AeqEventType) {
        self.hw_callbacks.write().remove(&event);
    }

    pub fn register_sw_event(&self, event: u8, callback: AeqCallback) {
        self.sw_callbacks.write().insert(event, callback);
    }

    pub fn unregister_sw_event(&self, event: u8) {
        self.sw_callbacks.write().remove(&event);
    }

    fn dispatch(&self, elem: &AeqElement) {
        self.stats.record_aeq_event();
        let callback = if elem.sw {
            self.sw_callbacks.read().get(&elem.event).cloned()
        } else {
            match AeqEventType::from_u8(elem.event) {
                Some(event) => self.hw_callbacks.read().get(&event).cloned(),
                None => {
                    log::warn!("hinic: unknown aeq event type {}", elem.event);
                    return;
                }
            }
        };

        match callback {
            Some(callback) => callback(elem.payload()),
            None => log::debug!(
                "hinic: unhandled aeq event {} (sw {})",
                elem.event,
                elem.sw
            ),
        }
    }

    /// Interrupt handler body
    pub fn handle_irq(&self) {
        self.eq.drain_all(|element| {
            if let EqElement::Aeq(elem) = element {
                self.dispatch(&elem);
            }
        });
    }
}

/// Completion event queue with its dispatch table
pub struct Ceq {
    eq: EventQueue,
    stats: Arc<ChannelStats>,
    callbacks: RwLock<HashMap<CeqEventType, CeqCallback>>,
}

impl Ceq {
    pub fn new(eq: EventQueue, stats: Arc<ChannelStats>) -> Self {
        Self {
            eq,
            stats,
            callbacks: RwLock::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> &EventQueue {
        &self.eq
    }

    pub fn register_event(&self, event: CeqEventType, callback: CeqCallback) {
        self.callbacks.write().insert(event, callback);
    }

    pub fn unregister_event(&self, event: CeqEventType) {
        self.callbacks.write().remove(&event);
    }

    fn dispatch(&self, elem: CeqElement) {
        self.stats.record_ceq_event();
        let Some(event) = CeqEventType::from_u8(elem.event) else {
            log::warn!("hinic: unknown ceq event type {}", elem.event);
            return;
        };
        match self.callbacks.read().get(&event).cloned() {
            Some(callback) => callback(elem.data),
            None => log::debug!("hinic: unhandled ceq event {:?}", event),
        }
    }

    pub fn handle_irq(&self) {
        self.eq.drain_all(|element| {
            if let EqElement::Ceq(elem) = element {
                self.dispatch(elem);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HostDma;
    use crate::hwif::{DoorbellSpace, InterruptController, IrqHandler, Platform, RegisterSpace};

    #[derive(Default)]
    struct Regs(Mutex<HashMap<u32, u32>>);

    impl RegisterSpace for Regs {
        fn read32(&self, addr: u32) -> u32 {
            self.0.lock().get(&addr).copied().unwrap_or(0)
        }
        fn write32(&self, addr: u32, value: u32) {
            self.0.lock().insert(addr, value);
        }
    }

    struct Quiet;

    impl DoorbellSpace for Quiet {
        fn write32(&self, _offset: usize, _value: u32) {}
    }

    impl InterruptController for Quiet {
        fn request_irq(&self, _vector: u16, _name: &str, _handler: IrqHandler) -> Result<()> {
            Ok(())
        }
        fn free_irq(&self, _vector: u16) {}
    }

    fn hwif() -> (Arc<Hwif>, Arc<Regs>) {
        let regs = Arc::new(Regs::default());
        let platform = Platform {
            regs: regs.clone(),
            doorbells: Arc::new(Quiet),
            irq: Arc::new(Quiet),
            dma: Arc::new(HostDma::new()),
        };
        (Arc::new(Hwif::new(platform).unwrap()), regs)
    }

    fn reg(regs: &Regs, addr: u32) -> u32 {
        regs.read32(addr)
    }

    #[test]
    fn test_ctrl1_element_size_code() {
        assert_eq!(EqKind::Aeq.elem_size_code(), 1);
        assert_eq!(EqKind::Ceq.elem_size_code(), 0);
        assert_eq!(EqKind::Aeq.ctrl1(64), 64 | 1 << 24);
        assert_eq!(EqKind::Ceq.ctrl1(256), 256);
        // the code must fit the two-bit field
        assert_eq!(EqKind::Aeq.elem_size_code() & !csr::EQ_CTRL1_ELEM_SIZE_MASK, 0);
    }

    #[test]
    fn test_queue_programs_ctrl_registers() {
        let (hwif, regs) = hwif();
        let aeq = EventQueue::new(EqKind::Aeq, 0, Arc::clone(&hwif), 32, 4).unwrap();
        let ceq = EventQueue::new(EqKind::Ceq, 1, Arc::clone(&hwif), 128, 5).unwrap();

        assert_eq!(reg(&regs, csr::aeq(0) + csr::EQ_CTRL1), 32 | 1 << 24);
        assert_eq!(reg(&regs, csr::ceq(1) + csr::EQ_CTRL1), 128);
        assert_eq!(reg(&regs, csr::aeq(0) + csr::EQ_CTRL0), 4 | csr::EQ_CTRL0_ENABLE);
        assert_eq!(reg(&regs, csr::ceq(1) + csr::EQ_CONS_IDX), csr::EQ_CI_ARMED);
        assert_eq!(aeq.buf.len(), 32 * AEQ_ELEM_SIZE);
        assert_eq!(ceq.buf.len(), 128 * CEQ_ELEM_SIZE);
    }

    #[test]
    fn test_consecutive_aeq_elements_are_drained() {
        let (hwif, regs) = hwif();
        let eq = EventQueue::new(EqKind::Aeq, 0, hwif, 4, 0).unwrap();
        for (index, byte) in [0xA1u8, 0xB2].into_iter().enumerate() {
            let mut data = [0u8; AEQ_DATA_LEN];
            data[0] = byte;
            let elem = AeqElement {
                event: AeqEventType::MsgFromMgmtCpu as u8,
                sw: false,
                size: 1,
                wrapped: true,
                data,
            };
            elem.write(&eq.buf, index * AEQ_ELEM_SIZE);
        }

        let mut seen = Vec::new();
        eq.drain_all(|element| {
            if let EqElement::Aeq(elem) = element {
                seen.push(elem.payload().to_vec());
            }
        });
        assert_eq!(seen, vec![vec![0xA1], vec![0xB2]]);
        assert_eq!(reg(&regs, csr::aeq(0) + csr::EQ_CONS_IDX), 2 | csr::EQ_CI_ARMED);

        // nothing new until the device writes the next lap
        eq.drain_all(|_| panic!("stale element handed out"));
    }

    #[test]
    fn test_aeq_element_layout() {
        let buf = DmaBuffer::new(0, AEQ_ELEM_SIZE * 2);
        let mut data = [0u8; AEQ_DATA_LEN];
        data[..3].copy_from_slice(&[1, 2, 3]);
        let elem = AeqElement {
            event: AeqEventType::MsgFromMgmtCpu as u8,
            sw: false,
            size: 3,
            wrapped: true,
            data,
        };
        elem.write(&buf, AEQ_ELEM_SIZE);

        let desc = buf.read_be32(AEQ_ELEM_SIZE + 60);
        assert_eq!(desc, 0x8000_0302);
        let read = AeqElement::read(&buf, AEQ_ELEM_SIZE);
        assert_eq!(read, elem);
        assert_eq!(read.payload(), &[1, 2, 3]);
    }

    #[test]
    fn test_ceq_element_fields() {
        let elem = CeqElement {
            event: CeqEventType::Cmdq as u8,
            data: 1,
            wrapped: true,
        };
        assert_eq!(elem.encode(), 0x8000_0000 | 3 << 23 | 1);
        assert_eq!(CeqElement::decode(elem.encode()), elem);
    }

    #[test]
    fn test_event_type_parsing() {
        assert_eq!(AeqEventType::from_u8(2), Some(AeqEventType::MsgFromMgmtCpu));
        assert_eq!(AeqEventType::from_u8(9), None);
        assert_eq!(CeqEventType::from_u8(3), Some(CeqEventType::Cmdq));
    }
}
