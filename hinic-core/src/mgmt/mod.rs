// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Management message channel
//!
//! Requests to the management CPU are segmented onto the API command chain.
//! Responses and unsolicited requests come back as `MsgFromMgmtCpu` AEQ
//! events, one segment per element, and are reassembled per direction.
//!
//! One synchronous send is outstanding at a time; its expected message id and
//! event state live under a spin lock shared with the AEQ path.
//!
//! Reassembled requests are queued to a worker thread, which runs the
//! registered handler and sends the response. Handlers may therefore issue
//! commands of their own.

pub mod api_cmd;
pub mod msg;
pub mod policy;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex, RwLock};
use spin::Mutex as SpinMutex;

use crate::Module;
use crate::completion::{WaitEnd, Waiter};
use crate::error::{DeviceStatus, Error, Result};
use crate::hwif::{Hwif, PRESENCE_POLL, StateFlags};
use crate::stats::ChannelStats;

use self::api_cmd::{ApiCmdChain, DEST_MGMT_CPU};
use self::msg::{
    ASYNC_MSG_FLAG, Direction, Feed, MAX_MSG_LEN, MSG_ID_MASK, Message, MsgHeader, Reassembler,
};

/// Handler for requests from the management CPU. Returns the response
/// payload, whose first byte is the status.
pub type MgmtHandler = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

type RespWaiter = Waiter<Result<Vec<u8>>>;

/// Requests waiting for the worker
const REQUEST_QUEUE_DEPTH: usize = 64;

/// Requests handed from the AEQ path to the worker thread
struct RequestQueue {
    pending: ArrayQueue<Message>,
    shutdown: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl RequestQueue {
    fn new() -> Self {
        Self {
            pending: ArrayQueue::new(REQUEST_QUEUE_DEPTH),
            shutdown: AtomicBool::new(false),
            lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    fn push(&self, message: Message) -> std::result::Result<(), Message> {
        self.pending.push(message)?;
        let _guard = self.lock.lock();
        self.wake.notify_one();
        Ok(())
    }

    /// Next request, or `None` once shut down
    fn pop_wait(&self) -> Option<Message> {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            if let Some(message) = self.pending.pop() {
                return Some(message);
            }
            let mut guard = self.lock.lock();
            if self.pending.is_empty() && !self.shutdown.load(Ordering::Acquire) {
                self.wake.wait_for(&mut guard, Duration::from_millis(10));
            }
        }
    }

    fn close(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.wake.notify_all();
    }
}

/// Progress of the outstanding sync send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncEvent {
    Start,
    Success,
    Fail,
    Timeout,
    End,
}

struct SyncState {
    event: SyncEvent,
    msg_id: u16,
    waiter: Option<Arc<RespWaiter>>,
}

/// Channel to the management CPU
pub struct MgmtChannel {
    hwif: Arc<Hwif>,
    chain: ApiCmdChain,
    stats: Arc<ChannelStats>,
    default_timeout: Duration,
    send_lock: Mutex<()>,
    sync_msg_id: AtomicU32,
    async_msg_id: AtomicU32,
    sync: SpinMutex<SyncState>,
    recv_request: SpinMutex<Reassembler>,
    recv_response: SpinMutex<Reassembler>,
    handlers: RwLock<HashMap<(Module, u8), MgmtHandler>>,
    requests: Arc<RequestQueue>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MgmtChannel {
    pub fn new(
        hwif: Arc<Hwif>,
        stats: Arc<ChannelStats>,
        cells: u32,
        chain_timeout: Duration,
        default_timeout: Duration,
    ) -> Result<Self> {
        let chain = ApiCmdChain::new(Arc::clone(&hwif), cells, chain_timeout)?;
        Ok(Self {
            hwif,
            chain,
            stats,
            default_timeout,
            send_lock: Mutex::new(()),
            sync_msg_id: AtomicU32::new(0),
            async_msg_id: AtomicU32::new(0),
            sync: SpinMutex::new(SyncState {
                event: SyncEvent::End,
                msg_id: 0,
                waiter: None,
            }),
            recv_request: SpinMutex::new(Reassembler::new()),
            recv_response: SpinMutex::new(Reassembler::new()),
            handlers: RwLock::new(HashMap::new()),
            requests: Arc::new(RequestQueue::new()),
            worker: Mutex::new(None),
        })
    }

    /// Start the thread that serves requests from the management CPU
    pub fn start_worker(self: &Arc<Self>) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let queue = Arc::clone(&self.requests);
        let channel: Weak<Self> = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name(format!("hinic-mgmt-{}", self.hwif.func_idx()))
            .spawn(move || {
                while let Some(message) = queue.pop_wait() {
                    let Some(channel) = channel.upgrade() else {
                        break;
                    };
                    channel.handle_request(message);
                }
                log::debug!("hinic: mgmt worker exiting");
            })
            .map_err(|err| {
                log::error!("hinic: failed to spawn mgmt worker: {}", err);
                Error::NoMemory
            })?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stop the request worker. Queued requests are dropped.
    pub fn stop_worker(&self) {
        self.requests.close();
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        // the worker may hold the last reference and end up here itself
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            log::error!("hinic: mgmt worker panicked");
        }
    }

    pub fn register_event_handler(&self, module: Module, cmd: u8, handler: MgmtHandler) {
        self.handlers.write().insert((module, cmd), handler);
    }

    pub fn unregister_event_handler(&self, module: Module, cmd: u8) {
        self.handlers.write().remove(&(module, cmd));
    }

    fn check_sendable(&self, module: Module, cmd: u8, len: usize) -> Result<()> {
        let state = self.hwif.state();
        if !state.contains(StateFlags::PRESENT) {
            return Err(Error::DeviceAbsent);
        }
        if !state.contains(StateFlags::MGMT_READY) {
            return Err(Error::NotInitialized);
        }
        if state.contains(StateFlags::MGMT_BUSY) && !policy::allowed_while_busy(module, cmd) {
            log::debug!("hinic: mgmt busy, refusing {:?} cmd {:#x}", module, cmd);
            return Err(Error::ChannelBusy);
        }
        if len > MAX_MSG_LEN {
            return Err(Error::MessageTooLarge);
        }
        Ok(())
    }

    fn header(&self, module: u8, cmd: u8, direction: Direction, msg_id: u16) -> MsgHeader {
        MsgHeader {
            msg_len: 0,
            module,
            seg_len: 0,
            no_ack: false,
            async_mgmt_to_pf: false,
            seq_id: 0,
            last: false,
            direction,
            cmd,
            pci_intf: self.hwif.pci_intf(),
            func_idx: self.hwif.func_idx() as u8,
            msg_id,
        }
    }

    /// Push every segment of `payload` through the API chain
    fn send_segments(&self, template: MsgHeader, payload: &[u8]) -> Result<()> {
        for (header, segment) in msg::segments(template, payload) {
            self.chain.write(DEST_MGMT_CPU, &msg::encode_cell(&header, segment))?;
        }
        Ok(())
    }

    fn next_sync_id(&self) -> u16 {
        (self.sync_msg_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1) as u16) & MSG_ID_MASK
    }

    fn next_async_id(&self) -> u16 {
        ((self.async_msg_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1) as u16) & MSG_ID_MASK)
            | ASYNC_MSG_FLAG
    }

    /// Send a request and, with `ack_required`, wait for its response.
    ///
    /// Returns the response length. With `output` the response is copied
    /// into it; a non-zero status byte fails the call.
    pub fn send_message(
        &self,
        module: Module,
        cmd: u8,
        input: &[u8],
        output: Option<&mut [u8]>,
        ack_required: bool,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        self.check_sendable(module, cmd, input.len())?;
        let timeout = timeout.unwrap_or(self.default_timeout);

        let _serialized = self.send_lock.lock();
        let msg_id = self.next_sync_id();
        let mut template = self.header(module as u8, cmd, Direction::Request, msg_id);

        if !ack_required {
            template.no_ack = true;
            self.send_segments(template, input)?;
            self.stats.record_mgmt_send();
            return Ok(0);
        }

        let waiter = Arc::new(RespWaiter::new(msg_id as u32));
        {
            let mut sync = self.sync.lock();
            sync.event = SyncEvent::Start;
            sync.msg_id = msg_id;
            sync.waiter = Some(Arc::clone(&waiter));
        }

        let start = Instant::now();
        if let Err(err) = self.send_segments(template, input) {
            let mut sync = self.sync.lock();
            sync.event = SyncEvent::End;
            sync.waiter = None;
            log::error!("hinic: mgmt send {:?} cmd {:#x} failed: {}", module, cmd, err);
            return Err(err);
        }
        self.stats.record_mgmt_send();

        let alive = || self.hwif.check_present();
        match waiter.wait_polled(timeout, PRESENCE_POLL, alive) {
            WaitEnd::Completed => {}
            WaitEnd::Aborted => {
                self.flush(Error::DeviceAbsent);
            }
            WaitEnd::TimedOut => {
                let mut sync = self.sync.lock();
                if waiter.reclaim(msg_id as u32) {
                    sync.event = SyncEvent::Timeout;
                    sync.waiter = None;
                    drop(sync);
                    self.stats.record_mgmt_timeout();
                    log::error!(
                        "hinic: mgmt {:?} cmd {:#x} msg_id {} timed out",
                        module,
                        cmd,
                        msg_id
                    );
                    return Err(Error::Timeout);
                }
            }
        }

        let response = waiter.take_outcome().unwrap_or(Err(Error::Timeout))?;
        self.sync.lock().event = SyncEvent::End;
        self.stats.record_mgmt_response(start.elapsed());

        if let Some(&status) = response.first() {
            DeviceStatus(status).check()?;
        }
        if let Some(out) = output {
            if response.len() > out.len() {
                return Err(Error::ResponseTooLarge {
                    len: response.len(),
                    capacity: out.len(),
                });
            }
            out[..response.len()].copy_from_slice(&response);
        }
        Ok(response.len())
    }

    /// Send a request that expects no correlation
    pub fn send_async(&self, module: Module, cmd: u8, input: &[u8]) -> Result<()> {
        self.check_sendable(module, cmd, input.len())?;
        let template = self.header(module as u8, cmd, Direction::Request, self.next_async_id());
        self.send_segments(template, input)?;
        self.stats.record_mgmt_send();
        Ok(())
    }

    fn send_response(&self, request: &MsgHeader, payload: &[u8]) -> Result<()> {
        if !self.hwif.is_present() {
            return Err(Error::DeviceAbsent);
        }
        let template = self.header(request.module, request.cmd, Direction::Response, request.msg_id);
        self.send_segments(template, payload)
    }

    /// AEQ `MsgFromMgmtCpu` element data
    pub fn handle_aeq_msg(&self, data: &[u8]) {
        let Some((header, segment)) = msg::parse_event(data) else {
            log::warn!("hinic: malformed mgmt segment of {} bytes", data.len());
            self.stats.record_dropped_segment();
            return;
        };

        let feed = match header.direction {
            Direction::Request => self.recv_request.lock().feed(&header, segment),
            Direction::Response => self.recv_response.lock().feed(&header, segment),
        };

        match feed {
            Feed::Partial => {}
            Feed::Complete(message) => match header.direction {
                Direction::Request => self.queue_request(message),
                Direction::Response => {
                    if let Err(err) = self.handle_response(message) {
                        self.stats.record_mismatch();
                        log::error!(
                            "hinic: mgmt response msg_id {}: {}",
                            header.msg_id,
                            err
                        );
                    }
                }
            },
            Feed::Dropped(reason) => {
                self.stats.record_dropped_segment();
                log::warn!(
                    "hinic: dropped mgmt {:?} segment {} of msg {}: {:?}",
                    header.direction,
                    header.seq_id,
                    header.msg_id,
                    reason
                );
            }
        }
    }

    fn queue_request(&self, message: Message) {
        let header = message.header;
        if self.requests.push(message).is_err() {
            self.stats.record_dropped_segment();
            log::warn!(
                "hinic: mgmt request queue full, dropping cmd {:#x} msg {}",
                header.cmd,
                header.msg_id
            );
        }
    }

    /// Complete the outstanding sync send. A response nobody waits for is a
    /// protocol mismatch.
    fn handle_response(&self, message: Message) -> Result<()> {
        let header = message.header;
        if header.is_async_id() {
            log::trace!("hinic: ignoring response to async msg {}", header.msg_id);
            return Ok(());
        }

        let mut sync = self.sync.lock();
        if sync.event != SyncEvent::Start || sync.msg_id != header.msg_id {
            return Err(Error::ProtocolMismatch);
        }
        if let Some(waiter) = sync.waiter.take() {
            waiter.complete(header.msg_id as u32, Ok(message.payload));
        }
        sync.event = SyncEvent::Success;
        Ok(())
    }

    fn handle_request(&self, message: Message) {
        let header = message.header;
        self.stats.record_mgmt_request();

        let Some(module) = Module::from_u8(header.module) else {
            log::warn!("hinic: mgmt request for unknown module {}", header.module);
            self.respond(&header, &[DeviceStatus::CMD_UNSUPPORTED.0]);
            return;
        };

        let handler = self.handlers.read().get(&(module, header.cmd)).cloned();
        let wants_response = !header.no_ack && !header.async_mgmt_to_pf;

        if policy::ack_first(module, header.cmd) {
            if wants_response {
                self.respond(&header, &[]);
            }
            if let Some(handler) = handler {
                handler(&message.payload);
            }
            return;
        }

        let response = match handler {
            Some(handler) => handler(&message.payload),
            None => {
                log::warn!(
                    "hinic: no handler for mgmt {:?} cmd {:#x}",
                    module,
                    header.cmd
                );
                vec![DeviceStatus::CMD_UNSUPPORTED.0]
            }
        };
        if wants_response {
            self.respond(&header, &response);
        }
    }

    fn respond(&self, request: &MsgHeader, payload: &[u8]) {
        if let Err(err) = self.send_response(request, payload) {
            log::error!(
                "hinic: response to mgmt cmd {:#x} msg {} failed: {}",
                request.cmd,
                request.msg_id,
                err
            );
        }
    }

    /// Fail the outstanding sync send, if any
    pub fn flush(&self, err: Error) -> bool {
        let mut sync = self.sync.lock();
        let Some(waiter) = sync.waiter.take() else {
            return false;
        };
        let done = waiter.complete(sync.msg_id as u32, Err(err));
        sync.event = SyncEvent::Fail;
        done
    }
}

impl Drop for MgmtChannel {
    fn drop(&mut self) {
        self.stop_worker();
    }
}
