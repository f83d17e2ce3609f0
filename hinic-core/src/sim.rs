// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Software model of the card's control plane
//!
//! [`SimCard`] implements the CSR, doorbell and interrupt seams of one
//! function and plays the management CPU and the command queue engine behind
//! them. All DMA goes through a [`HostDma`], so the descriptors the driver
//! writes can be followed by bus address.
//!
//! API chain writes are consumed inline with the PI register write. Doorbells
//! and outbound management messages are queued to a worker thread, which
//! also runs the registered interrupt handlers one at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

use crate::Module;
use crate::cmdq::CmdqContext;
use crate::cmdq::wqe::{self, Body, Completion, DoorbellInfo};
use crate::comm_cmd;
use crate::dma::{DmaBuffer, HostDma};
use crate::eqs::{
    AEQ_DATA_LEN, AeqElement, AeqEventType, CEQ_ELEM_SIZE, CeqElement, CeqEventType, EqKind,
};
use crate::error::{DeviceStatus, Error, Result};
use crate::hwif::{
    DB_PAGE_SIZE, DoorbellSpace, InterruptController, IrqHandler, LINK_DOWN, Platform,
    RegisterSpace, csr,
};
use crate::mgmt::api_cmd::{ApiCell, DEST_MGMT_CPU, WB_CHKSUM_ERR_SHIFT, WB_VALID};
use crate::mgmt::msg::{self, Direction, Feed, MSG_ID_MASK, Message, MsgHeader, Reassembler};

const WORK_QUEUE_LEN: usize = 1024;
const IDLE_WAIT: Duration = Duration::from_millis(5);
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Command queue engine's answer to one WQE
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdResponse {
    pub errcode: u8,
    /// Returned when the WQE asks for a direct response
    pub direct: u64,
    /// Written to the output SGE when the WQE has one
    pub data: Vec<u8>,
}

impl CmdResponse {
    pub fn direct(value: u64) -> Self {
        Self {
            direct: value,
            ..Self::default()
        }
    }

    pub fn data(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn error(errcode: u8) -> Self {
        Self {
            errcode,
            ..Self::default()
        }
    }
}

/// Command handler of the simulated engine, given the request bytes
pub type CmdHandler = Arc<dyn Fn(&[u8]) -> CmdResponse + Send + Sync>;
/// Management CPU handler, given the request payload. The first byte of the
/// response is the status.
pub type MgmtCpuHandler = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Misbehaviour of the command queue engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CmdqFault {
    #[default]
    None,
    /// Consume WQEs and never complete them
    Stall,
    /// Complete WQEs but raise no completion event
    NoEvent,
}

/// Misbehaviour of the management CPU
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MgmtFault {
    #[default]
    None,
    /// Never answer
    Silent,
    /// Answer with the wrong message id
    WrongMsgId,
}

enum Work {
    Doorbell { offset: usize, value: u32 },
    /// Segments to deliver as `MsgFromMgmtCpu` AEQ elements
    Aeq(Vec<Vec<u8>>),
    /// Any other AEQ element
    Event { event: u8, sw: bool, data: Vec<u8> },
}

struct SimEq {
    buf: DmaBuffer,
    len: u32,
    elem_size: usize,
    vector: u16,
    prod_idx: u32,
    wrapped: bool,
    cons_idx: u32,
}

impl SimEq {
    /// Claim the next element: offset and the wrapped bit to stamp
    fn produce(&mut self) -> (usize, bool) {
        if (self.prod_idx + 1) % self.len == self.cons_idx {
            log::warn!("hinic-sim: event queue overrun at {}", self.prod_idx);
        }
        let claimed = (self.prod_idx as usize * self.elem_size, self.wrapped);
        self.prod_idx += 1;
        if self.prod_idx == self.len {
            self.prod_idx = 0;
            self.wrapped = !self.wrapped;
        }
        claimed
    }
}

struct SimCmdq {
    ctxt: CmdqContext,
    cons_idx: u16,
    armed: bool,
    /// Completions since the last event
    unreported: bool,
}

struct CardState {
    regs: HashMap<u32, u32>,
    eqs: HashMap<(EqKind, u16), SimEq>,
    cmdqs: [Option<SimCmdq>; 2],
    chain_ci: u32,
    host_requests: Reassembler,
    host_responses: Reassembler,
    cmd_handlers: HashMap<(u8, u8), CmdHandler>,
    mgmt_handlers: HashMap<(u8, u8), MgmtCpuHandler>,
    cmdq_fault: CmdqFault,
    mgmt_fault: MgmtFault,
    contexts: Vec<CmdqContext>,
    requests: Vec<Message>,
    responses: Vec<Message>,
    next_msg_id: u16,
    doorbells: usize,
}

/// Decode an EQ register address into queue and register offset
fn eq_register(addr: u32) -> Option<(EqKind, u16, u32)> {
    let stride = csr::aeq(1) - csr::aeq(0);
    let (kind, base) = if (csr::aeq(0)..csr::ceq(0)).contains(&addr) {
        (EqKind::Aeq, csr::aeq(0))
    } else if (csr::ceq(0)..csr::API_CHAIN_BASE).contains(&addr) {
        (EqKind::Ceq, csr::ceq(0))
    } else {
        return None;
    };
    let rel = addr - base;
    Some((kind, (rel / stride) as u16, rel % stride))
}

/// Page and offset of WQE `index` of the ring described by `ctxt`
fn wqe_location(dma: &HostDma, ctxt: &CmdqContext, index: u16) -> Option<(DmaBuffer, usize)> {
    let wqebb = ctxt.wqebb_size as usize;
    if wqebb == 0 {
        return None;
    }
    let (block, base) = dma.resolve(ctxt.wq_block_addr)?;
    let (first, _) = dma.resolve(block.read_be64(base))?;
    let per_page = first.len() / wqebb;
    if per_page == 0 {
        return None;
    }
    let page_addr = block.read_be64(base + (index as usize / per_page) * 8);
    let (page, offset) = dma.resolve(page_addr)?;
    Some((page, offset + (index as usize % per_page) * wqebb))
}

fn read_body(dma: &HostDma, body: &Body) -> Vec<u8> {
    match *body {
        Body::Scmd { len, data } => data[..len as usize].to_vec(),
        Body::Lcmd { addr, len } => {
            let Some((buf, offset)) = dma.resolve(addr) else {
                log::error!("hinic-sim: command buffer {:#x} is not mapped", addr);
                return Vec::new();
            };
            let len = (len as usize).min(buf.len() - offset);
            let mut data = vec![0u8; len];
            buf.read_bytes(offset, &mut data);
            data
        }
    }
}

impl CardState {
    fn new() -> Self {
        Self {
            regs: HashMap::new(),
            eqs: HashMap::new(),
            cmdqs: [None, None],
            chain_ci: 0,
            host_requests: Reassembler::new(),
            host_responses: Reassembler::new(),
            cmd_handlers: HashMap::new(),
            mgmt_handlers: HashMap::new(),
            cmdq_fault: CmdqFault::None,
            mgmt_fault: MgmtFault::None,
            contexts: Vec::new(),
            requests: Vec::new(),
            responses: Vec::new(),
            next_msg_id: 0,
            doorbells: 0,
        }
    }

    fn reg(&self, addr: u32) -> u32 {
        self.regs.get(&addr).copied().unwrap_or(0)
    }

    fn reg64(&self, hi: u32, lo: u32) -> u64 {
        (self.reg(hi) as u64) << 32 | self.reg(lo) as u64
    }

    /// Register write side effects. Returns management replies to deliver.
    fn write(&mut self, dma: &HostDma, addr: u32, value: u32) -> Vec<Vec<Vec<u8>>> {
        self.regs.insert(addr, value);
        if let Some((kind, id, reg)) = eq_register(addr) {
            match reg {
                csr::EQ_CTRL0 => self.configure_eq(dma, kind, id),
                csr::EQ_CONS_IDX => {
                    if let Some(eq) = self.eqs.get_mut(&(kind, id)) {
                        eq.cons_idx = value & csr::EQ_CI_MASK;
                    }
                }
                _ => {}
            }
            return Vec::new();
        }
        if addr == csr::API_CHAIN_PI {
            return self.consume_api_chain(dma, value);
        }
        Vec::new()
    }

    fn configure_eq(&mut self, dma: &HostDma, kind: EqKind, id: u16) {
        let base = kind.csr_base(id);
        let ctrl0 = self.reg(base + csr::EQ_CTRL0);
        if ctrl0 & csr::EQ_CTRL0_ENABLE == 0 {
            self.eqs.remove(&(kind, id));
            return;
        }
        let ctrl1 = self.reg(base + csr::EQ_CTRL1);
        let addr = self.reg64(base + csr::EQ_PAGE_HI, base + csr::EQ_PAGE_LO);
        let Some((buf, 0)) = dma.resolve(addr) else {
            log::error!("hinic-sim: {:?}{} page {:#x} is not mapped", kind, id, addr);
            return;
        };
        let eq = SimEq {
            buf,
            len: ctrl1 & csr::EQ_CI_MASK,
            elem_size: match kind {
                EqKind::Aeq => {
                    32 << ((ctrl1 >> csr::EQ_CTRL1_ELEM_SIZE_SHIFT) & csr::EQ_CTRL1_ELEM_SIZE_MASK)
                }
                EqKind::Ceq => CEQ_ELEM_SIZE,
            },
            vector: (ctrl0 & 0x3FF) as u16,
            prod_idx: 0,
            wrapped: true,
            cons_idx: 0,
        };
        if eq.len == 0 {
            return;
        }
        log::debug!("hinic-sim: {:?}{} enabled, {} elements", kind, id, eq.len);
        self.eqs.insert((kind, id), eq);
    }

    fn post_aeq(&mut self, event: u8, sw: bool, data: &[u8]) -> Option<u16> {
        let Some(eq) = self.eqs.get_mut(&(EqKind::Aeq, 0)) else {
            log::warn!("hinic-sim: aeq not enabled, dropping event");
            return None;
        };
        let (offset, wrapped) = eq.produce();
        let mut elem = AeqElement {
            event,
            sw,
            size: data.len().min(AEQ_DATA_LEN) as u8,
            wrapped,
            data: [0u8; AEQ_DATA_LEN],
        };
        elem.data[..elem.size as usize].copy_from_slice(&data[..elem.size as usize]);
        elem.write(&eq.buf, offset);
        Some(eq.vector)
    }

    fn post_ceq(&mut self, ceq_id: u16, data: u32) -> Option<u16> {
        let eq = self.eqs.get_mut(&(EqKind::Ceq, ceq_id))?;
        let (offset, wrapped) = eq.produce();
        let elem = CeqElement {
            event: CeqEventType::Cmdq as u8,
            data,
            wrapped,
        };
        eq.buf.write_be32(offset, elem.encode());
        Some(eq.vector)
    }

    /// Walk the API chain up to `prod_idx` and update the write-back block
    fn consume_api_chain(&mut self, dma: &HostDma, prod_idx: u32) -> Vec<Vec<Vec<u8>>> {
        let num_cells = self.reg(csr::API_CHAIN_GEOMETRY) & 0xFFFF;
        let cells = dma.resolve(self.reg64(csr::API_CHAIN_CELL_HI, csr::API_CHAIN_CELL_LO));
        let wb = dma.resolve(self.reg64(csr::API_CHAIN_STATUS_HI, csr::API_CHAIN_STATUS_LO));
        let (Some((cells, _)), Some((wb, wb_offset))) = (cells, wb) else {
            log::error!("hinic-sim: api chain written before it was programmed");
            return Vec::new();
        };
        if num_cells == 0 {
            return Vec::new();
        }

        let mut replies = Vec::new();
        let mut chksum_err = 0;
        while self.chain_ci != prod_idx % num_cells {
            let cell = ApiCell::read(&cells, self.chain_ci as usize);
            if !cell.ctrl_chksum_ok || !cell.desc_chksum_ok {
                log::error!("hinic-sim: api cell {} checksum mismatch", self.chain_ci);
                chksum_err = 1;
                break;
            }
            self.chain_ci = (self.chain_ci + 1) % num_cells;

            let Some((buf, offset)) = dma.resolve(cell.data_addr) else {
                log::error!("hinic-sim: api cell data {:#x} is not mapped", cell.data_addr);
                continue;
            };
            if cell.dest != DEST_MGMT_CPU {
                log::warn!("hinic-sim: api cell for node {:#x} ignored", cell.dest);
                continue;
            }
            let mut data = vec![0u8; cell.data_size as usize];
            buf.read_bytes(offset, &mut data);
            if let Some(reply) = self.receive_cell(&data) {
                replies.push(reply);
            }
        }

        wb.write_be32(wb_offset, WB_VALID);
        wb.write_be32(wb_offset + 4, self.chain_ci | chksum_err << WB_CHKSUM_ERR_SHIFT);
        replies
    }

    fn receive_cell(&mut self, data: &[u8]) -> Option<Vec<Vec<u8>>> {
        let Some((header, segment)) = msg::decode_cell(data) else {
            log::warn!("hinic-sim: malformed api cell of {} bytes", data.len());
            return None;
        };
        let reassembler = match header.direction {
            Direction::Request => &mut self.host_requests,
            Direction::Response => &mut self.host_responses,
        };
        match reassembler.feed(&header, segment) {
            Feed::Partial => None,
            Feed::Complete(message) => match header.direction {
                Direction::Request => self.mgmt_request(message),
                Direction::Response => {
                    self.responses.push(message);
                    None
                }
            },
            Feed::Dropped(reason) => {
                log::warn!("hinic-sim: dropped segment from host: {:?}", reason);
                None
            }
        }
    }

    /// Management CPU: answer a request from the host
    fn mgmt_request(&mut self, message: Message) -> Option<Vec<Vec<u8>>> {
        let header = message.header;
        let response = if header.module == Module::Comm as u8 && header.cmd == comm_cmd::CMDQ_CTXT_SET
        {
            match CmdqContext::decode(&message.payload) {
                Some(ctxt) => {
                    self.install_cmdq(ctxt);
                    vec![DeviceStatus::SUCCESS.0]
                }
                None => vec![0x02],
            }
        } else {
            match self.mgmt_handlers.get(&(header.module, header.cmd)) {
                Some(handler) => handler(&message.payload),
                None => vec![DeviceStatus::CMD_UNSUPPORTED.0],
            }
        };
        self.requests.push(message);

        if header.no_ack || header.is_async_id() {
            return None;
        }
        let msg_id = match self.mgmt_fault {
            MgmtFault::None => header.msg_id,
            MgmtFault::Silent => return None,
            MgmtFault::WrongMsgId => (header.msg_id + 1) & MSG_ID_MASK,
        };
        let template = MsgHeader {
            direction: Direction::Response,
            msg_id,
            ..header
        };
        Some(
            msg::segments(template, &response)
                .map(|(header, segment)| msg::encode_event(&header, segment))
                .collect(),
        )
    }

    fn install_cmdq(&mut self, ctxt: CmdqContext) {
        let Some(entry) = self.cmdqs.get_mut(ctxt.cmdq_type as usize) else {
            log::error!("hinic-sim: context for unknown cmdq {}", ctxt.cmdq_type);
            return;
        };
        *entry = Some(SimCmdq {
            ctxt,
            cons_idx: 0,
            armed: ctxt.ceq_arm,
            unreported: false,
        });
        self.contexts.push(ctxt);
    }

    /// Command queue engine: run every WQE up to the rung producer index.
    /// Returns the vector to interrupt, if an event was raised.
    fn doorbell(&mut self, dma: &HostDma, offset: usize, value: u32) -> Option<u16> {
        self.doorbells += 1;
        let info = DoorbellInfo::decode(value);
        let index = offset / DB_PAGE_SIZE;
        let prod_idx = info.prod_idx(offset % DB_PAGE_SIZE);
        let Some(mut cmdq) = self.cmdqs.get_mut(index).and_then(Option::take) else {
            log::warn!("hinic-sim: doorbell for unconfigured cmdq {}", index);
            return None;
        };

        let depth = cmdq.ctxt.depth.max(1);
        while cmdq.cons_idx != prod_idx % depth {
            let ci = cmdq.cons_idx;
            cmdq.cons_idx = (ci + 1) % depth;
            let Some((page, offset)) = wqe_location(dma, &cmdq.ctxt, ci) else {
                log::error!("hinic-sim: cmdq {} slot {} is not mapped", index, ci);
                break;
            };
            let wqe = wqe::read_wqe(&page, offset);
            if !wqe.hw_busy {
                continue;
            }

            if wqe.arm && wqe.module == Module::Comm as u8 && wqe.cmd == comm_cmd::SET_ARM {
                wqe::write_completion(&page, offset, 0, None);
                cmdq.armed = true;
                continue;
            }
            if self.cmdq_fault == CmdqFault::Stall {
                log::debug!("hinic-sim: cmdq {} swallowing slot {}", index, ci);
                continue;
            }

            let input = read_body(dma, &wqe.body);
            let response = match self.cmd_handlers.get(&(wqe.module, wqe.cmd)) {
                Some(handler) => handler(&input),
                None => CmdResponse::default(),
            };
            let direct = match wqe.completion {
                Completion::Sge { addr, len } => {
                    let written = response.data.len().min(len as usize);
                    match dma.resolve(addr) {
                        Some((out, out_offset)) => {
                            out.write_bytes(out_offset, &response.data[..written])
                        }
                        None => log::error!("hinic-sim: output buffer {:#x} is not mapped", addr),
                    }
                    wqe::write_sge_len(&page, offset, written as u32);
                    None
                }
                Completion::Direct(_) => Some(response.direct),
            };
            wqe::write_completion(&page, offset, response.errcode, direct);
            if self.cmdq_fault != CmdqFault::NoEvent {
                cmdq.unreported = true;
            }
        }

        let mut vector = None;
        if cmdq.unreported && cmdq.armed {
            vector = self.post_ceq(cmdq.ctxt.ceq_id, cmdq.ctxt.cmdq_type as u32);
            cmdq.armed = false;
            cmdq.unreported = false;
        }
        self.cmdqs[index] = Some(cmdq);
        vector
    }
}

struct Shared {
    dma: Arc<HostDma>,
    attr0: u32,
    removed: AtomicBool,
    shutdown: AtomicBool,
    state: Mutex<CardState>,
    irqs: Mutex<HashMap<u16, IrqHandler>>,
    work: ArrayQueue<Work>,
    outstanding: AtomicUsize,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

impl Shared {
    fn push(&self, work: Work) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if self.work.push(work).is_err() {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            log::error!("hinic-sim: work queue overflow");
            return;
        }
        let _guard = self.wake_lock.lock();
        self.wake.notify_one();
    }

    fn run(&self) {
        while !self.shutdown.load(Ordering::Acquire) {
            match self.work.pop() {
                Some(work) => {
                    self.process(work);
                    self.outstanding.fetch_sub(1, Ordering::AcqRel);
                }
                None => {
                    let mut guard = self.wake_lock.lock();
                    if self.work.is_empty() && !self.shutdown.load(Ordering::Acquire) {
                        self.wake.wait_for(&mut guard, IDLE_WAIT);
                    }
                }
            }
        }
    }

    fn process(&self, work: Work) {
        if self.removed.load(Ordering::Acquire) {
            return;
        }
        let mut vectors = match work {
            Work::Doorbell { offset, value } => {
                let vector = self.state.lock().doorbell(&self.dma, offset, value);
                vector.into_iter().collect::<Vec<_>>()
            }
            Work::Aeq(segments) => {
                let mut state = self.state.lock();
                segments
                    .iter()
                    .filter_map(|segment| {
                        state.post_aeq(AeqEventType::MsgFromMgmtCpu as u8, false, segment)
                    })
                    .collect()
            }
            Work::Event { event, sw, data } => {
                let vector = self.state.lock().post_aeq(event, sw, &data);
                vector.into_iter().collect()
            }
        };
        vectors.dedup();
        for vector in vectors {
            let handler = self.irqs.lock().get(&vector).cloned();
            if let Some(handler) = handler {
                handler();
            }
        }
    }
}

/// Simulated function
pub struct SimCard {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl SimCard {
    pub fn new() -> Arc<Self> {
        Self::with_function(0, 0)
    }

    /// Card reporting the given function index and PCI interface
    pub fn with_function(func_idx: u16, pci_intf: u8) -> Arc<Self> {
        let attr0 = (func_idx as u32 & csr::ATTR0_FUNC_IDX_MASK)
            | (pci_intf as u32 & csr::ATTR0_PCI_INTF_MASK) << csr::ATTR0_PCI_INTF_SHIFT;
        let shared = Arc::new(Shared {
            dma: Arc::new(HostDma::new()),
            attr0,
            removed: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            state: Mutex::new(CardState::new()),
            irqs: Mutex::new(HashMap::new()),
            work: ArrayQueue::new(WORK_QUEUE_LEN),
            outstanding: AtomicUsize::new(0),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || worker_shared.run());
        Arc::new(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Seams to hand to [`crate::HwDev::init`]
    pub fn platform(self: &Arc<Self>) -> Platform {
        Platform {
            regs: Arc::clone(self) as Arc<dyn RegisterSpace>,
            doorbells: Arc::clone(self) as Arc<dyn DoorbellSpace>,
            irq: Arc::clone(self) as Arc<dyn InterruptController>,
            dma: Arc::clone(&self.shared.dma) as Arc<dyn crate::dma::DmaAllocator>,
        }
    }

    pub fn dma(&self) -> &HostDma {
        &self.shared.dma
    }

    pub fn set_cmd_handler<F>(&self, module: Module, cmd: u8, handler: F)
    where
        F: Fn(&[u8]) -> CmdResponse + Send + Sync + 'static,
    {
        let handler: CmdHandler = Arc::new(handler);
        self.shared
            .state
            .lock()
            .cmd_handlers
            .insert((module as u8, cmd), handler);
    }

    pub fn set_mgmt_handler<F>(&self, module: Module, cmd: u8, handler: F)
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        let handler: MgmtCpuHandler = Arc::new(handler);
        self.shared
            .state
            .lock()
            .mgmt_handlers
            .insert((module as u8, cmd), handler);
    }

    pub fn set_cmdq_fault(&self, fault: CmdqFault) {
        self.shared.state.lock().cmdq_fault = fault;
    }

    pub fn set_mgmt_fault(&self, fault: MgmtFault) {
        self.shared.state.lock().mgmt_fault = fault;
    }

    fn header(&self, module: u8, cmd: u8, msg_id: u16, no_ack: bool) -> MsgHeader {
        MsgHeader {
            msg_len: 0,
            module,
            seg_len: 0,
            no_ack,
            async_mgmt_to_pf: false,
            seq_id: 0,
            last: false,
            direction: Direction::Request,
            cmd,
            pci_intf: ((self.shared.attr0 >> csr::ATTR0_PCI_INTF_SHIFT) & 0x3) as u8,
            func_idx: (self.shared.attr0 & 0xF) as u8,
            msg_id,
        }
    }

    /// Management CPU request to the host. Returns its message id.
    pub fn send_request(&self, module: u8, cmd: u8, payload: &[u8], no_ack: bool) -> u16 {
        let msg_id = {
            let mut state = self.shared.state.lock();
            state.next_msg_id = (state.next_msg_id + 1) & MSG_ID_MASK;
            state.next_msg_id
        };
        let segments = msg::segments(self.header(module, cmd, msg_id, no_ack), payload)
            .map(|(header, segment)| msg::encode_event(&header, segment))
            .collect();
        self.shared.push(Work::Aeq(segments));
        msg_id
    }

    /// Template header for hand-built segments
    pub fn request_header(&self, module: u8, cmd: u8, msg_id: u16) -> MsgHeader {
        self.header(module, cmd, msg_id, false)
    }

    /// Deliver one raw segment as it is
    pub fn inject_segment(&self, header: &MsgHeader, segment: &[u8]) {
        self.shared
            .push(Work::Aeq(vec![msg::encode_event(header, segment)]));
    }

    /// Raise a hardware AEQ event carrying `data`
    pub fn raise_hw_event(&self, event: AeqEventType, data: &[u8]) {
        self.shared.push(Work::Event {
            event: event as u8,
            sw: false,
            data: data.to_vec(),
        });
    }

    /// Raise a software AEQ event (source bit set)
    pub fn raise_sw_event(&self, event: u8, data: &[u8]) {
        self.shared.push(Work::Event {
            event,
            sw: true,
            data: data.to_vec(),
        });
    }

    /// Requests the management CPU has received, oldest first
    pub fn mgmt_requests(&self) -> Vec<Message> {
        self.shared.state.lock().requests.clone()
    }

    /// Responses the host sent to management CPU requests
    pub fn host_responses(&self) -> Vec<Message> {
        self.shared.state.lock().responses.clone()
    }

    /// Command queue contexts programmed by the host
    pub fn cmdq_contexts(&self) -> Vec<CmdqContext> {
        self.shared.state.lock().contexts.clone()
    }

    pub fn doorbell_count(&self) -> usize {
        self.shared.state.lock().doorbells
    }

    /// Consumer index last reported by the host for an event queue
    pub fn eq_cons_idx(&self, kind: EqKind, id: u16) -> Option<u32> {
        self.shared
            .state
            .lock()
            .eqs
            .get(&(kind, id))
            .map(|eq| eq.cons_idx)
    }

    pub fn irq_registered(&self, vector: u16) -> bool {
        self.shared.irqs.lock().contains_key(&vector)
    }

    /// Wait until the worker has run everything queued so far
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.shared.outstanding.load(Ordering::Acquire) == 0)
    }

    /// Poll `cond` until it holds or `timeout` passes
    pub fn wait_until<F: Fn() -> bool>(&self, timeout: Duration, cond: F) -> bool {
        let start = Instant::now();
        loop {
            if cond() {
                return true;
            }
            if start.elapsed() > timeout {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// The card drops off the bus: CSR reads return all ones and nothing is
    /// processed any more.
    pub fn surprise_remove(&self) {
        self.shared.removed.store(true, Ordering::Release);
        log::info!("hinic-sim: card removed");
    }
}

impl RegisterSpace for SimCard {
    fn read32(&self, addr: u32) -> u32 {
        if self.shared.removed.load(Ordering::Acquire) {
            return LINK_DOWN;
        }
        if addr == csr::FUNC_ATTR0 {
            return self.shared.attr0;
        }
        self.shared.state.lock().reg(addr)
    }

    fn write32(&self, addr: u32, value: u32) {
        if self.shared.removed.load(Ordering::Acquire) {
            return;
        }
        let replies = self.shared.state.lock().write(&self.shared.dma, addr, value);
        for segments in replies {
            self.shared.push(Work::Aeq(segments));
        }
    }
}

impl DoorbellSpace for SimCard {
    fn write32(&self, offset: usize, value: u32) {
        if self.shared.removed.load(Ordering::Acquire) {
            return;
        }
        self.shared.push(Work::Doorbell { offset, value });
    }
}

impl InterruptController for SimCard {
    fn request_irq(&self, vector: u16, name: &str, handler: IrqHandler) -> Result<()> {
        let mut irqs = self.shared.irqs.lock();
        if irqs.contains_key(&vector) {
            log::error!("hinic-sim: vector {} already taken, {} refused", vector, name);
            return Err(Error::InvalidParameter);
        }
        irqs.insert(vector, handler);
        log::debug!("hinic-sim: {} on vector {}", name, vector);
        Ok(())
    }

    fn free_irq(&self, vector: u16) {
        self.shared.irqs.lock().remove(&vector);
    }
}

impl Drop for SimCard {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        self.shared.irqs.lock().clear();
        if let Some(worker) = self.worker.take() {
            // the last handle can go away inside a handler on the worker itself
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                log::error!("hinic-sim: worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaAllocator;

    #[test]
    fn test_eq_element_size_from_ctrl1() {
        let dma = HostDma::new();
        let mut state = CardState::new();
        for kind in [EqKind::Aeq, EqKind::Ceq] {
            let buf = dma.alloc_coherent(16 * kind.elem_size()).unwrap();
            let base = kind.csr_base(0);
            state.write(&dma, base + csr::EQ_PAGE_HI, (buf.bus_addr() >> 32) as u32);
            state.write(&dma, base + csr::EQ_PAGE_LO, buf.bus_addr() as u32);
            state.write(&dma, base + csr::EQ_CTRL1, kind.ctrl1(16));
            state.write(&dma, base + csr::EQ_CTRL0, 7 | csr::EQ_CTRL0_ENABLE);

            let eq = &state.eqs[&(kind, 0)];
            assert_eq!(eq.elem_size, kind.elem_size());
            assert_eq!(eq.len, 16);
            assert_eq!(eq.vector, 7);
        }
    }

    #[test]
    fn test_eq_register_decoding() {
        assert_eq!(
            eq_register(csr::aeq(0) + csr::EQ_CONS_IDX),
            Some((EqKind::Aeq, 0, csr::EQ_CONS_IDX))
        );
        assert_eq!(
            eq_register(csr::ceq(2) + csr::EQ_CTRL0),
            Some((EqKind::Ceq, 2, csr::EQ_CTRL0))
        );
        assert_eq!(eq_register(csr::API_CHAIN_PI), None);
        assert_eq!(eq_register(csr::FUNC_ATTR0), None);
    }

    #[test]
    fn test_attributes_and_removal() {
        let card = SimCard::with_function(5, 1);
        assert_eq!(card.read32(csr::FUNC_ATTR0) & csr::ATTR0_FUNC_IDX_MASK, 5);
        card.surprise_remove();
        assert_eq!(card.read32(csr::FUNC_ATTR0), LINK_DOWN);
    }

    #[test]
    fn test_vector_cannot_be_taken_twice() {
        let card = SimCard::new();
        card.request_irq(3, "a", Arc::new(|| {})).unwrap();
        assert_eq!(
            card.request_irq(3, "b", Arc::new(|| {})),
            Err(Error::InvalidParameter)
        );
        card.free_irq(3);
        assert!(!card.irq_registered(3));
    }
}
