// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Command queues
//!
//! Two rings share the same engine: one for synchronous commands, whose
//! callers block until the completion event (or timeout), and one for
//! fire-and-forget commands. Each ring keeps per-slot bookkeeping under one
//! spin lock that both the submit path and the CEQ dispatcher take.
//!
//! Completion is a hybrid of the hardware busy bit and the interrupt: the
//! dispatcher only finishes a slot whose WQE the hardware has handed back, and
//! a caller whose wait expired rechecks the same bit before declaring the
//! command lost.

pub mod wqe;

use std::sync::Arc;
use std::time::{Duration, Instant};

use spin::Mutex as SpinMutex;

use crate::Module;
use crate::comm_cmd;
use crate::completion::{WaitEnd, Waiter};
use crate::dma::DmaBuffer;
use crate::error::{DeviceStatus, Error, Result};
use crate::hwif::{DB_PAGE_SIZE, Hwif, PRESENCE_POLL, StateFlags};
use crate::stats::ChannelStats;
use crate::wq::{RingBuffer, Slot};

use self::wqe::{Body, CMD_BUF_SIZE, Completion, DoorbellInfo, WQE_SIZE, WQEBBS_PER_CMD, Wqe};

/// Command queue type, also the CEQ event payload and doorbell field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CmdqType {
    Sync = 0,
    Async = 1,
}

impl CmdqType {
    pub const ALL: [CmdqType; 2] = [CmdqType::Sync, CmdqType::Async];

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(CmdqType::Sync),
            1 => Some(CmdqType::Async),
            _ => None,
        }
    }
}

/// Result of a synchronous command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdCompletion {
    /// Direct response value (zero for buffer responses)
    pub direct_resp: u64,
    /// Bytes written into the output buffer
    pub out_len: usize,
    /// Completed by the timeout recheck rather than the completion event
    pub late: bool,
}

type CmdWaiter = Waiter<Result<CmdCompletion>>;

/// A posted synchronous command
pub struct PendingCmd {
    index: u16,
    generation: u32,
    waiter: Arc<CmdWaiter>,
    buf_out: Option<DmaBuffer>,
    submitted_at: Instant,
}

impl PendingCmd {
    /// Ring slot holding the WQE
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// What a ring slot currently holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdKind {
    None,
    SetArm,
    DirectResp,
    SgeResp,
    Async,
    /// Finished by the timeout recheck, not yet released
    FakeTimeout,
    /// Abandoned by its caller, not yet released
    Timeout,
    /// Force-completed by a flush, not yet released
    ForceStop,
}

struct CmdInfo {
    kind: CmdKind,
    generation: u32,
    waiter: Option<Arc<CmdWaiter>>,
    buf_in: Option<DmaBuffer>,
    buf_out: Option<DmaBuffer>,
}

impl CmdInfo {
    const fn empty() -> Self {
        Self {
            kind: CmdKind::None,
            generation: 0,
            waiter: None,
            buf_in: None,
            buf_out: None,
        }
    }
}

struct CmdqState {
    wq: RingBuffer,
    infos: Vec<CmdInfo>,
    next_generation: u32,
}

/// Result of one completion pass
struct Pass {
    released: usize,
    /// Stopped where the hardware has not caught up; the event must be armed
    rearm: bool,
}

/// Outcome of the post-timeout recheck
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recheck {
    /// The request had already been finished; its outcome is in the waiter
    Completed,
    /// Hardware had completed without an event; finished now, marked late
    Late,
    /// Hardware still owns the WQE; the request is lost
    Lost,
}

/// Ring context programmed into the card at init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdqContext {
    pub func_idx: u16,
    pub cmdq_type: u8,
    pub wq_block_addr: u64,
    pub depth: u16,
    pub wqebb_size: u16,
    pub ceq_id: u16,
    pub ceq_arm: bool,
    pub wrapped: bool,
}

impl CmdqContext {
    pub const LEN: usize = 24;
    const VERSION: u8 = 1;

    /// Little-endian management payload; byte 0 is the status byte
    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[1] = Self::VERSION;
        buf[4..6].copy_from_slice(&self.func_idx.to_le_bytes());
        buf[6] = self.cmdq_type;
        buf[8..16].copy_from_slice(&self.wq_block_addr.to_le_bytes());
        buf[16..18].copy_from_slice(&self.depth.to_le_bytes());
        buf[18..20].copy_from_slice(&self.wqebb_size.to_le_bytes());
        buf[20..22].copy_from_slice(&self.ceq_id.to_le_bytes());
        buf[22] = self.ceq_arm as u8;
        buf[23] = self.wrapped as u8;
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN || buf[1] != Self::VERSION {
            return None;
        }
        let u16_at = |i: usize| u16::from_le_bytes([buf[i], buf[i + 1]]);
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&buf[8..16]);
        Some(Self {
            func_idx: u16_at(4),
            cmdq_type: buf[6],
            wq_block_addr: u64::from_le_bytes(addr),
            depth: u16_at(16),
            wqebb_size: u16_at(18),
            ceq_id: u16_at(20),
            ceq_arm: buf[22] != 0,
            wrapped: buf[23] != 0,
        })
    }
}

/// One command queue
pub struct Cmdq {
    cmdq_type: CmdqType,
    hwif: Arc<Hwif>,
    stats: Arc<ChannelStats>,
    state: SpinMutex<CmdqState>,
    db_base: usize,
}

impl Cmdq {
    pub fn new(
        cmdq_type: CmdqType,
        hwif: Arc<Hwif>,
        stats: Arc<ChannelStats>,
        depth: u16,
        reserve: u16,
        page_size: usize,
    ) -> Result<Self> {
        let wq = RingBuffer::new(&*hwif.platform().dma, depth, WQE_SIZE, page_size, reserve)?;
        let infos = (0..depth).map(|_| CmdInfo::empty()).collect();
        Ok(Self {
            cmdq_type,
            hwif,
            stats,
            state: SpinMutex::new(CmdqState {
                wq,
                infos,
                next_generation: 0,
            }),
            db_base: cmdq_type as usize * DB_PAGE_SIZE,
        })
    }

    pub fn cmdq_type(&self) -> CmdqType {
        self.cmdq_type
    }

    /// Context describing this ring to the card
    pub fn context(&self, func_idx: u16, ceq_id: u16) -> CmdqContext {
        let state = self.state.lock();
        CmdqContext {
            func_idx,
            cmdq_type: self.cmdq_type as u8,
            wq_block_addr: state.wq.block_addr(),
            depth: state.wq.depth(),
            wqebb_size: WQE_SIZE as u16,
            ceq_id,
            ceq_arm: true,
            wrapped: state.wq.wrapped(),
        }
    }

    pub fn free_slots(&self) -> u16 {
        self.state.lock().wq.free_slots()
    }

    fn input_body(&self, input: &[u8]) -> Result<(Body, Option<DmaBuffer>)> {
        if let Ok(body) = Body::inline(input) {
            return Ok((body, None));
        }
        if input.len() > CMD_BUF_SIZE {
            return Err(Error::MessageTooLarge);
        }
        let buf = self.hwif.platform().dma.alloc_coherent(CMD_BUF_SIZE)?;
        buf.write_bytes(0, input);
        let body = Body::Lcmd {
            addr: buf.bus_addr(),
            len: input.len() as u32,
        };
        Ok((body, Some(buf)))
    }

    /// Fill a slot, commit the WQE and ring the doorbell. Caller holds the
    /// ring lock.
    fn post(&self, state: &mut CmdqState, slot: &Slot, info: CmdInfo, wqe: &Wqe) -> Result<()> {
        let index = slot.index as usize;
        state.infos[index] = info;
        wqe::commit_wqe(slot, wqe);

        let next_pi = state.wq.producer_index();
        let ring = self.hwif.ring_doorbell(
            self.db_base + DoorbellInfo::offset(next_pi),
            DoorbellInfo::encode(next_pi, self.cmdq_type as u8),
        );
        if let Err(err) = ring {
            let info = &mut state.infos[index];
            if let Some(waiter) = info.waiter.take() {
                waiter.reclaim(info.generation);
            }
            info.buf_in = None;
            info.buf_out = None;
            info.kind = CmdKind::ForceStop;
            return Err(err);
        }
        Ok(())
    }

    fn check_present(&self) -> Result<()> {
        if !self.hwif.is_present() {
            return Err(Error::DeviceAbsent);
        }
        if !self.hwif.state().contains(StateFlags::CMDQ_READY) {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }

    /// Post a synchronous command without waiting for it.
    ///
    /// `out_capacity` requests a buffer response of up to that many bytes;
    /// otherwise the response is the 64-bit direct value.
    pub fn post_sync(
        &self,
        module: Module,
        cmd: u8,
        input: &[u8],
        out_capacity: Option<usize>,
    ) -> Result<PendingCmd> {
        self.check_present()?;
        let (body, buf_in) = self.input_body(input)?;

        let (completion, kind, buf_out) = match out_capacity {
            Some(capacity) => {
                let buf = self.hwif.platform().dma.alloc_coherent(CMD_BUF_SIZE)?;
                let completion = Completion::Sge {
                    addr: buf.bus_addr(),
                    len: capacity.min(CMD_BUF_SIZE) as u32,
                };
                (completion, CmdKind::SgeResp, Some(buf))
            }
            None => (Completion::Direct(0), CmdKind::DirectResp, None),
        };

        let mut state = self.state.lock();
        let slot = match state.wq.acquire(WQEBBS_PER_CMD) {
            Ok(slot) => slot,
            Err(err) => {
                self.stats.record_cmdq_busy();
                return Err(err);
            }
        };
        let generation = state.next_generation;
        state.next_generation = state.next_generation.wrapping_add(1);

        let waiter = Arc::new(CmdWaiter::new(generation));
        let info = CmdInfo {
            kind,
            generation,
            waiter: Some(Arc::clone(&waiter)),
            buf_in,
            buf_out: buf_out.clone(),
        };
        let wqe = Wqe::request(slot.index, slot.wrapped, module as u8, cmd, body, completion);
        self.post(&mut state, &slot, info, &wqe)?;
        drop(state);

        self.stats.record_cmdq_submit();
        Ok(PendingCmd {
            index: slot.index,
            generation,
            waiter,
            buf_out,
            submitted_at: Instant::now(),
        })
    }

    /// Wait for a posted command, rechecking the hardware if the wait expires
    pub fn wait(
        &self,
        pending: &PendingCmd,
        output: Option<&mut [u8]>,
        timeout: Duration,
    ) -> Result<CmdCompletion> {
        let alive = || self.hwif.check_present();
        match pending.waiter.wait_polled(timeout, PRESENCE_POLL, alive) {
            WaitEnd::Completed => {}
            // removal hooks normally got here first
            WaitEnd::Aborted => {
                self.flush(Error::DeviceAbsent);
            }
            WaitEnd::TimedOut => match self.resolve_timeout(pending) {
                Recheck::Lost => {
                    self.stats.record_cmdq_timeout();
                    return Err(Error::Timeout);
                }
                Recheck::Late => self.stats.record_cmdq_fake_timeout(),
                Recheck::Completed => {}
            },
        }

        let done = match pending.waiter.take_outcome() {
            Some(Ok(done)) => done,
            Some(Err(err)) => {
                self.stats.record_cmdq_error();
                return Err(err);
            }
            None => return Err(Error::Timeout),
        };

        if let (Some(out), Some(buf)) = (output, &pending.buf_out) {
            if done.out_len > out.len() {
                return Err(Error::ResponseTooLarge {
                    len: done.out_len,
                    capacity: out.len(),
                });
            }
            buf.read_bytes(0, &mut out[..done.out_len]);
        }
        self.stats.record_cmdq_complete(pending.submitted_at.elapsed());
        Ok(done)
    }

    /// Submit a command and wait for its completion.
    ///
    /// With `output` the response is written by the hardware into a DMA
    /// buffer and copied out; otherwise the 64-bit direct response is returned.
    pub fn submit_sync(
        &self,
        module: Module,
        cmd: u8,
        input: &[u8],
        output: Option<&mut [u8]>,
        timeout: Duration,
    ) -> Result<CmdCompletion> {
        let capacity = output.as_ref().map(|out| out.len());
        let pending = self.post_sync(module, cmd, input, capacity)?;
        self.wait(&pending, output, timeout)
    }

    /// Submit a command without waiting. The input buffer is kept alive by
    /// the slot until the hardware has consumed it.
    pub fn submit_async(&self, module: Module, cmd: u8, input: &[u8]) -> Result<()> {
        self.check_present()?;
        let (body, buf_in) = self.input_body(input)?;

        let mut state = self.state.lock();
        let slot = match state.wq.acquire(WQEBBS_PER_CMD) {
            Ok(slot) => slot,
            Err(err) => {
                self.stats.record_cmdq_busy();
                return Err(err);
            }
        };
        let generation = state.next_generation;
        state.next_generation = state.next_generation.wrapping_add(1);

        let info = CmdInfo {
            kind: CmdKind::Async,
            generation,
            waiter: None,
            buf_in,
            buf_out: None,
        };
        let wqe = Wqe::request(slot.index, slot.wrapped, module as u8, cmd, body, Completion::Direct(0));
        self.post(&mut state, &slot, info, &wqe)?;
        self.stats.record_cmdq_async();
        Ok(())
    }

    /// Recheck a request whose wait expired.
    ///
    /// Runs under the ring lock, so it is exclusive with the dispatcher. Safe
    /// to call any number of times.
    pub fn resolve_timeout(&self, pending: &PendingCmd) -> Recheck {
        let PendingCmd {
            index,
            generation,
            waiter,
            ..
        } = pending;
        let (index, generation) = (*index, *generation);

        let mut state = self.state.lock();
        if waiter.is_completed() {
            return Recheck::Completed;
        }

        let slot = state.wq.peek(index);
        let info = &mut state.infos[slot.index as usize];
        let owned = info.generation == generation
            && matches!(info.kind, CmdKind::DirectResp | CmdKind::SgeResp)
            && info.waiter.as_ref().is_some_and(|w| Arc::ptr_eq(w, waiter));
        if !owned {
            return Recheck::Lost;
        }

        if !wqe::hw_busy(&slot) {
            let outcome = completion_from_wqe(&slot, true);
            waiter.complete(generation, outcome);
            info.waiter = None;
            info.kind = CmdKind::FakeTimeout;
            log::warn!(
                "hinic: cmdq {:?} slot {} completed without an event",
                self.cmdq_type,
                index
            );
            Recheck::Late
        } else {
            waiter.reclaim(generation);
            info.waiter = None;
            info.kind = CmdKind::Timeout;
            log::error!(
                "hinic: cmdq {:?} slot {} timed out, wqe:{}",
                self.cmdq_type,
                index,
                wqe::dump(&slot)
            );
            Recheck::Lost
        }
    }

    /// Ring slot of a posted command, for inspection
    pub fn slot(&self, index: u16) -> Slot {
        self.state.lock().wq.peek(index)
    }

    /// Walk slots from the consumer index, finishing and releasing every one
    /// the hardware has handed back. Returns the number released.
    pub fn process_completions(&self) -> usize {
        self.completion_pass().released
    }

    fn completion_pass(&self) -> Pass {
        let mut state = self.state.lock();
        let mut pass = Pass {
            released: 0,
            rearm: false,
        };

        loop {
            let ci = state.wq.consumer_index();
            let slot = state.wq.peek(ci);
            let info = &mut state.infos[ci as usize];

            match info.kind {
                CmdKind::None => {
                    pass.rearm = true;
                    break;
                }
                // an arm request is already on its way
                CmdKind::SetArm => {
                    if wqe::hw_busy(&slot) {
                        break;
                    }
                }
                CmdKind::Async => {
                    if wqe::hw_busy(&slot) {
                        pass.rearm = true;
                        break;
                    }
                }
                CmdKind::DirectResp | CmdKind::SgeResp => {
                    if wqe::hw_busy(&slot) {
                        pass.rearm = true;
                        break;
                    }
                    if let Some(waiter) = info.waiter.take() {
                        waiter.complete(info.generation, completion_from_wqe(&slot, false));
                    }
                }
                CmdKind::Timeout => {
                    log::warn!(
                        "hinic: cmdq {:?} releasing timed out slot {}, wqe:{}",
                        self.cmdq_type,
                        ci,
                        wqe::dump(&slot)
                    );
                }
                CmdKind::FakeTimeout | CmdKind::ForceStop => {}
            }

            *info = CmdInfo {
                generation: info.generation,
                ..CmdInfo::empty()
            };
            if state.wq.release(WQEBBS_PER_CMD).is_err() {
                break;
            }
            pass.released += 1;
        }

        pass
    }

    /// Re-arm the completion event. Uses the reserved slot and has no waiter.
    pub fn set_arm(&self) -> Result<()> {
        if !self.hwif.is_present() {
            return Err(Error::DeviceAbsent);
        }
        let mut state = self.state.lock();
        let slot = state.wq.acquire_reserved()?;

        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&(0u32).to_be_bytes());
        payload[4..].copy_from_slice(&(self.cmdq_type as u32).to_be_bytes());

        let mut wqe = Wqe::request(
            slot.index,
            slot.wrapped,
            Module::Comm as u8,
            comm_cmd::SET_ARM,
            Body::inline(&payload)?,
            Completion::Direct(0),
        );
        wqe.arm = true;

        let generation = state.next_generation;
        state.next_generation = state.next_generation.wrapping_add(1);
        let info = CmdInfo {
            kind: CmdKind::SetArm,
            generation,
            ..CmdInfo::empty()
        };
        self.post(&mut state, &slot, info, &wqe)
    }

    /// CEQ event for this queue: completion pass, then re-arm once the pass
    /// has caught up with the hardware
    pub fn handle_event(&self) -> usize {
        let pass = self.completion_pass();
        if pass.rearm {
            if let Err(err) = self.set_arm() {
                log::error!("hinic: cmdq {:?} set arm failed: {}", self.cmdq_type, err);
            }
        }
        pass.released
    }

    /// Force-complete every outstanding request with `err` and drop async
    /// buffers. Slots stay allocated until a later pass reclaims them.
    pub fn flush(&self, err: Error) -> usize {
        let mut state = self.state.lock();
        let ci = state.wq.consumer_index() as u32;
        let in_use = state.wq.in_use();
        let depth = state.wq.depth() as u32;
        let mut flushed = 0;

        for i in 0..in_use {
            let info = &mut state.infos[((ci + i) % depth) as usize];
            match info.kind {
                CmdKind::DirectResp | CmdKind::SgeResp => {
                    if let Some(waiter) = info.waiter.take() {
                        if waiter.complete(info.generation, Err(err)) {
                            flushed += 1;
                        }
                    }
                }
                CmdKind::Async | CmdKind::SetArm => {}
                _ => continue,
            }
            info.buf_in = None;
            info.buf_out = None;
            info.kind = CmdKind::ForceStop;
        }

        self.stats.record_cmdq_flushed(flushed);
        flushed
    }

    /// Kinds of the occupied slots, oldest first
    pub fn slot_kinds(&self) -> Vec<CmdKind> {
        let state = self.state.lock();
        let ci = state.wq.consumer_index() as u32;
        let depth = state.wq.depth() as u32;
        (0..state.wq.in_use())
            .map(|i| state.infos[((ci + i) % depth) as usize].kind)
            .collect()
    }
}

/// Build the caller-visible outcome from a WQE the hardware handed back
fn completion_from_wqe(slot: &Slot, late: bool) -> Result<CmdCompletion> {
    let done = wqe::read_wqe(&slot.page, slot.offset);
    if done.errcode != 0 {
        return Err(Error::DeviceStatus(DeviceStatus(done.errcode)));
    }
    Ok(match done.completion {
        Completion::Direct(direct_resp) => CmdCompletion {
            direct_resp,
            out_len: 0,
            late,
        },
        Completion::Sge { len, .. } => CmdCompletion {
            direct_resp: 0,
            out_len: len as usize,
            late,
        },
    })
}

/// Both command queues of a function
pub struct Cmdqs {
    queues: [Cmdq; 2],
    default_timeout: Duration,
}

impl Cmdqs {
    pub fn new(
        hwif: Arc<Hwif>,
        stats: Arc<ChannelStats>,
        depth: u16,
        reserve: u16,
        page_size: usize,
        default_timeout: Duration,
    ) -> Result<Self> {
        let build = |cmdq_type| {
            Cmdq::new(
                cmdq_type,
                Arc::clone(&hwif),
                Arc::clone(&stats),
                depth,
                reserve,
                page_size,
            )
        };
        Ok(Self {
            queues: [build(CmdqType::Sync)?, build(CmdqType::Async)?],
            default_timeout,
        })
    }

    pub fn get(&self, cmdq_type: CmdqType) -> &Cmdq {
        &self.queues[cmdq_type as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cmdq> {
        self.queues.iter()
    }

    pub fn submit_sync(
        &self,
        module: Module,
        cmd: u8,
        input: &[u8],
        output: Option<&mut [u8]>,
        timeout: Option<Duration>,
    ) -> Result<CmdCompletion> {
        self.get(CmdqType::Sync).submit_sync(
            module,
            cmd,
            input,
            output,
            timeout.unwrap_or(self.default_timeout),
        )
    }

    pub fn submit_async(&self, module: Module, cmd: u8, input: &[u8]) -> Result<()> {
        self.get(CmdqType::Async).submit_async(module, cmd, input)
    }

    /// CEQ handler for `Cmdq` events; `data` names the queue
    pub fn handle_ceq(&self, data: u32) {
        match CmdqType::from_u32(data) {
            Some(cmdq_type) => {
                self.get(cmdq_type).handle_event();
            }
            None => log::warn!("hinic: ceq event for unknown cmdq type {}", data),
        }
    }

    pub fn flush(&self, err: Error) -> usize {
        self.queues.iter().map(|cmdq| cmdq.flush(err)).sum()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::dma::HostDma;
    use crate::hwif::{DoorbellSpace, InterruptController, IrqHandler, Platform, RegisterSpace};

    struct NullRegs;

    impl RegisterSpace for NullRegs {
        fn read32(&self, _addr: u32) -> u32 {
            0
        }
        fn write32(&self, _addr: u32, _value: u32) {}
    }

    #[derive(Default)]
    struct Doorbells(Mutex<Vec<(usize, u32)>>);

    impl DoorbellSpace for Doorbells {
        fn write32(&self, offset: usize, value: u32) {
            self.0.lock().push((offset, value));
        }
    }

    struct NoIrq;

    impl InterruptController for NoIrq {
        fn request_irq(&self, _vector: u16, _name: &str, _handler: IrqHandler) -> Result<()> {
            Ok(())
        }
        fn free_irq(&self, _vector: u16) {}
    }

    fn setup(depth: u16, reserve: u16) -> (Cmdq, Arc<Hwif>, Arc<Doorbells>) {
        let doorbells = Arc::new(Doorbells::default());
        let platform = Platform {
            regs: Arc::new(NullRegs),
            doorbells: doorbells.clone(),
            irq: Arc::new(NoIrq),
            dma: Arc::new(HostDma::new()),
        };
        let hwif = Arc::new(Hwif::new(platform).unwrap());
        hwif.set_state(StateFlags::CMDQ_READY);
        let cmdq = Cmdq::new(
            CmdqType::Sync,
            Arc::clone(&hwif),
            Arc::new(ChannelStats::new()),
            depth,
            reserve,
            4096,
        )
        .unwrap();
        (cmdq, hwif, doorbells)
    }

    fn hw_complete(cmdq: &Cmdq, pending: &PendingCmd, errcode: u8, resp: u64) {
        let slot = cmdq.slot(pending.index());
        wqe::write_completion(&slot.page, slot.offset, errcode, Some(resp));
    }

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn test_posted_wqe_and_doorbell() {
        let (cmdq, _hwif, doorbells) = setup(8, 1);
        let pending = cmdq.post_sync(Module::L2nic, 0x33, &[1, 2, 3], None).unwrap();

        let slot = cmdq.slot(pending.index());
        let wqe = wqe::read_wqe(&slot.page, slot.offset);
        assert!(wqe.hw_busy);
        assert!(wqe.wrapped);
        assert_eq!(wqe.module, Module::L2nic as u8);
        assert_eq!(wqe.cmd, 0x33);
        assert!(matches!(wqe.body, Body::Scmd { len: 3, .. }));

        let rung = doorbells.0.lock().clone();
        assert_eq!(rung, vec![(DoorbellInfo::offset(1), DoorbellInfo::encode(1, 0))]);
    }

    #[test]
    fn test_large_input_uses_command_buffer() {
        let (cmdq, _hwif, _doorbells) = setup(8, 1);
        let input = vec![0x5A; 100];
        let pending = cmdq.post_sync(Module::Cfgm, 1, &input, Some(64)).unwrap();
        let slot = cmdq.slot(pending.index());
        let wqe = wqe::read_wqe(&slot.page, slot.offset);
        assert!(matches!(wqe.body, Body::Lcmd { len: 100, .. }));
        assert!(matches!(wqe.completion, Completion::Sge { len: 64, .. }));
        assert_eq!(
            cmdq.post_sync(Module::Cfgm, 1, &[0; CMD_BUF_SIZE + 1], None).err(),
            Some(Error::MessageTooLarge)
        );
    }

    #[test]
    fn test_completed_before_timeout_releases_once() {
        let (cmdq, _hwif, _doorbells) = setup(8, 1);
        let pending = cmdq.post_sync(Module::Comm, 5, &[], None).unwrap();
        assert_eq!(cmdq.process_completions(), 0, "busy slot must stay");

        hw_complete(&cmdq, &pending, 0, 42);
        assert_eq!(cmdq.process_completions(), 1);
        assert_eq!(cmdq.process_completions(), 0);

        let done = cmdq.wait(&pending, None, SHORT).unwrap();
        assert_eq!(done.direct_resp, 42);
        assert!(!done.late);
        assert_eq!(cmdq.free_slots(), 8);
        assert_eq!(cmdq.resolve_timeout(&pending), Recheck::Completed);
    }

    #[test]
    fn test_device_status_is_reported() {
        let (cmdq, _hwif, _doorbells) = setup(8, 1);
        let pending = cmdq.post_sync(Module::Comm, 5, &[], None).unwrap();
        hw_complete(&cmdq, &pending, 0x03, 0);
        cmdq.process_completions();
        assert_eq!(
            cmdq.wait(&pending, None, SHORT),
            Err(Error::DeviceStatus(DeviceStatus(0x03)))
        );
    }

    #[test]
    fn test_fake_timeout_is_idempotent() {
        let (cmdq, _hwif, _doorbells) = setup(8, 1);
        let pending = cmdq.post_sync(Module::Comm, 5, &[], None).unwrap();
        hw_complete(&cmdq, &pending, 0, 7);

        let done = cmdq.wait(&pending, None, SHORT).unwrap();
        assert!(done.late);
        assert_eq!(done.direct_resp, 7);
        assert_eq!(cmdq.slot_kinds(), vec![CmdKind::FakeTimeout]);

        assert_eq!(cmdq.resolve_timeout(&pending), Recheck::Completed);
        assert_eq!(cmdq.resolve_timeout(&pending), Recheck::Completed);
        assert_eq!(cmdq.process_completions(), 1);
        assert_eq!(cmdq.process_completions(), 0);
        assert_eq!(cmdq.free_slots(), 8);
    }

    #[test]
    fn test_real_timeout_reclaims_slot() {
        let (cmdq, _hwif, _doorbells) = setup(8, 1);
        let pending = cmdq.post_sync(Module::Comm, 5, &[], None).unwrap();

        assert_eq!(cmdq.wait(&pending, None, SHORT), Err(Error::Timeout));
        assert_eq!(cmdq.slot_kinds(), vec![CmdKind::Timeout]);
        assert_eq!(cmdq.resolve_timeout(&pending), Recheck::Lost);

        // a late hardware completion must not resurrect the request
        hw_complete(&cmdq, &pending, 0, 1);
        assert_eq!(cmdq.process_completions(), 1);
        assert!(pending.waiter.take_outcome().is_none());
        assert_eq!(cmdq.free_slots(), 8);
    }

    #[test]
    fn test_busy_with_one_free_slot_and_reserve() {
        let (cmdq, _hwif, _doorbells) = setup(8, 1);
        let posted: Vec<_> = (0..7)
            .map(|i| cmdq.post_sync(Module::Comm, i, &[], None).unwrap())
            .collect();
        assert_eq!(cmdq.free_slots(), 1);
        assert_eq!(
            cmdq.post_sync(Module::Comm, 9, &[], None).err(),
            Some(Error::QueueFull)
        );
        assert_eq!(cmdq.submit_async(Module::Comm, 9, &[]), Err(Error::QueueFull));

        // the reserved slot stays available to the re-arm command
        cmdq.set_arm().unwrap();
        assert_eq!(cmdq.free_slots(), 0);
        assert_eq!(cmdq.slot_kinds().last(), Some(&CmdKind::SetArm));
        drop(posted);
    }

    #[test]
    fn test_pass_stops_at_busy_slot() {
        let (cmdq, _hwif, _doorbells) = setup(8, 1);
        let first = cmdq.post_sync(Module::Comm, 1, &[], None).unwrap();
        let second = cmdq.post_sync(Module::Comm, 2, &[], None).unwrap();
        hw_complete(&cmdq, &second, 0, 2);

        assert_eq!(cmdq.process_completions(), 0);
        hw_complete(&cmdq, &first, 0, 1);
        assert_eq!(cmdq.process_completions(), 2);
        assert_eq!(cmdq.wait(&first, None, SHORT).unwrap().direct_resp, 1);
        assert_eq!(cmdq.wait(&second, None, SHORT).unwrap().direct_resp, 2);
    }

    #[test]
    fn test_rearm_only_when_caught_up() {
        let (cmdq, _hwif, doorbells) = setup(8, 1);
        let first = cmdq.post_sync(Module::Comm, 1, &[], None).unwrap();

        // stopped at a command the hardware still owns
        assert_eq!(cmdq.handle_event(), 0);
        assert_eq!(cmdq.slot_kinds(), vec![CmdKind::DirectResp, CmdKind::SetArm]);

        // the outstanding arm request ends the pass without another one
        hw_complete(&cmdq, &first, 0, 1);
        assert_eq!(cmdq.handle_event(), 1);
        assert_eq!(cmdq.slot_kinds(), vec![CmdKind::SetArm]);
        let rung = doorbells.0.lock().len();

        // once the arm is consumed the pass reaches an empty slot and re-arms
        let arm = cmdq.slot(1);
        wqe::write_completion(&arm.page, arm.offset, 0, Some(0));
        assert_eq!(cmdq.handle_event(), 1);
        assert_eq!(cmdq.slot_kinds(), vec![CmdKind::SetArm]);
        assert_eq!(doorbells.0.lock().len(), rung + 1);
        assert_eq!(cmdq.wait(&first, None, SHORT).unwrap().direct_resp, 1);
    }

    #[test]
    fn test_wait_fails_once_the_device_is_gone() {
        let (cmdq, hwif, _doorbells) = setup(8, 1);
        let pending = cmdq.post_sync(Module::Comm, 1, &[], None).unwrap();
        hwif.clear_state(StateFlags::PRESENT);

        let start = Instant::now();
        assert_eq!(
            cmdq.wait(&pending, None, Duration::from_secs(5)),
            Err(Error::DeviceAbsent)
        );
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(cmdq.slot_kinds(), vec![CmdKind::ForceStop]);
    }

    #[test]
    fn test_flush_completes_waiters_once() {
        let (cmdq, _hwif, _doorbells) = setup(8, 1);
        let a = cmdq.post_sync(Module::Comm, 1, &[], None).unwrap();
        let b = cmdq.post_sync(Module::Comm, 2, &[], None).unwrap();
        cmdq.submit_async(Module::Comm, 3, &[0; 64]).unwrap();

        assert_eq!(cmdq.flush(Error::DeviceAbsent), 2);
        assert_eq!(cmdq.flush(Error::DeviceAbsent), 0);
        assert_eq!(cmdq.wait(&a, None, SHORT), Err(Error::DeviceAbsent));
        assert_eq!(cmdq.wait(&b, None, SHORT), Err(Error::DeviceAbsent));
        assert!(cmdq.slot_kinds().iter().all(|kind| *kind == CmdKind::ForceStop));
        assert_eq!(cmdq.process_completions(), 3);
    }

    #[test]
    fn test_absent_device_refuses_commands() {
        let (cmdq, hwif, _doorbells) = setup(8, 1);
        hwif.clear_state(StateFlags::PRESENT);
        assert_eq!(
            cmdq.post_sync(Module::Comm, 1, &[], None).err(),
            Some(Error::DeviceAbsent)
        );
        assert_eq!(cmdq.set_arm(), Err(Error::DeviceAbsent));
    }

    #[test]
    fn test_context_encoding() {
        let ctxt = CmdqContext {
            func_idx: 3,
            cmdq_type: 1,
            wq_block_addr: 0x1_0000_2000,
            depth: 4096,
            wqebb_size: 64,
            ceq_id: 0,
            ceq_arm: true,
            wrapped: true,
        };
        let raw = ctxt.encode();
        assert_eq!(raw[0], 0, "status byte");
        assert_eq!(&raw[16..18], &4096u16.to_le_bytes());
        assert_eq!(CmdqContext::decode(&raw), Some(ctxt));
        assert_eq!(CmdqContext::decode(&raw[..10]), None);
    }

    #[test]
    fn test_cmdq_type_from_event_data() {
        assert_eq!(CmdqType::from_u32(0), Some(CmdqType::Sync));
        assert_eq!(CmdqType::from_u32(1), Some(CmdqType::Async));
        assert_eq!(CmdqType::from_u32(5), None);
    }
}
