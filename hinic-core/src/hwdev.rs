// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Hardware device
//!
//! Brings up the control channel of one PCIe function in dependency order
//! (attributes, AEQ, management channel, CEQ, command queues) and exposes the
//! request API on top of it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::Module;
use crate::cmdq::{CmdCompletion, CmdqContext, CmdqType, Cmdqs};
use crate::comm_cmd;
use crate::config::HwConfig;
use crate::eqs::{Aeq, AeqCallback, AeqEventType, Ceq, CeqEventType, EqKind, EventQueue};
use crate::error::{Error, Result};
use crate::hwif::{Hwif, IrqHandler, Platform, StateFlags};
use crate::mgmt::{MgmtChannel, MgmtHandler};
use crate::stats::{ChannelStats, StatsReport};

/// Vectors registered so far, released again if bring-up fails
struct IrqGuard<'a> {
    platform: &'a Platform,
    vectors: Vec<u16>,
}

impl IrqGuard<'_> {
    fn request(&mut self, vector: u16, name: &str, handler: IrqHandler) -> Result<()> {
        self.platform.irq.request_irq(vector, name, handler)?;
        self.vectors.push(vector);
        Ok(())
    }

    fn disarm(mut self) -> Vec<u16> {
        std::mem::take(&mut self.vectors)
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        for vector in self.vectors.drain(..) {
            self.platform.irq.free_irq(vector);
        }
    }
}

/// Control channel of one function
pub struct HwDev {
    config: HwConfig,
    hwif: Arc<Hwif>,
    stats: Arc<ChannelStats>,
    aeq: Arc<Aeq>,
    ceq: Arc<Ceq>,
    mgmt: Arc<MgmtChannel>,
    cmdqs: Arc<Cmdqs>,
    vectors: Vec<u16>,
}

impl HwDev {
    pub fn init(platform: Platform, config: HwConfig) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(ChannelStats::new());
        let hwif = Arc::new(Hwif::new(platform.clone())?);
        let mut irqs = IrqGuard {
            platform: &platform,
            vectors: Vec::new(),
        };

        let aeq = Arc::new(Aeq::new(
            EventQueue::new(EqKind::Aeq, 0, Arc::clone(&hwif), config.aeq_len, config.aeq_vector)?,
            Arc::clone(&stats),
        ));
        let handler = Arc::clone(&aeq);
        irqs.request(config.aeq_vector, "hinic-aeq0", Arc::new(move || handler.handle_irq()))?;

        let mgmt = Arc::new(MgmtChannel::new(
            Arc::clone(&hwif),
            Arc::clone(&stats),
            config.api_chain_cells,
            config.api_chain_timeout(),
            config.mgmt_timeout(),
        )?);
        let receiver = Arc::clone(&mgmt);
        aeq.register_hw_event(
            AeqEventType::MsgFromMgmtCpu,
            Arc::new(move |data: &[u8]| receiver.handle_aeq_msg(data)),
        );
        mgmt.start_worker()?;
        let channel: Weak<MgmtChannel> = Arc::downgrade(&mgmt);
        hwif.on_removal(Box::new(move || {
            if let Some(channel) = channel.upgrade() {
                if channel.flush(Error::DeviceAbsent) {
                    log::warn!("hinic: failed outstanding mgmt message");
                }
            }
        }));
        hwif.set_state(StateFlags::MGMT_READY);

        let ceq = Arc::new(Ceq::new(
            EventQueue::new(EqKind::Ceq, 0, Arc::clone(&hwif), config.ceq_len, config.ceq_vector)?,
            Arc::clone(&stats),
        ));
        let handler = Arc::clone(&ceq);
        irqs.request(config.ceq_vector, "hinic-ceq0", Arc::new(move || handler.handle_irq()))?;

        let cmdqs = Arc::new(Cmdqs::new(
            Arc::clone(&hwif),
            Arc::clone(&stats),
            config.cmdq_depth,
            config.cmdq_reserve,
            config.page_size as usize,
            config.cmdq_timeout(),
        )?);
        let queues: Weak<Cmdqs> = Arc::downgrade(&cmdqs);
        hwif.on_removal(Box::new(move || {
            if let Some(queues) = queues.upgrade() {
                let flushed = queues.flush(Error::DeviceAbsent);
                if flushed > 0 {
                    log::warn!("hinic: failed {} outstanding commands", flushed);
                }
            }
        }));
        let dispatcher = Arc::clone(&cmdqs);
        ceq.register_event(
            CeqEventType::Cmdq,
            Arc::new(move |data: u32| dispatcher.handle_ceq(data)),
        );

        for cmdq in cmdqs.iter() {
            let ctxt = cmdq.context(hwif.func_idx(), ceq.queue().id());
            let mut out = [0u8; CmdqContext::LEN];
            mgmt.send_message(
                Module::Comm,
                comm_cmd::CMDQ_CTXT_SET,
                &ctxt.encode(),
                Some(&mut out),
                true,
                None,
            )
            .inspect_err(|err| {
                log::error!("hinic: setting {:?} cmdq context failed: {}", cmdq.cmdq_type(), err)
            })?;
        }
        hwif.set_state(StateFlags::CMDQ_READY);

        log::info!(
            "hinic: function {} ready, cmdq depth {}",
            hwif.func_idx(),
            config.cmdq_depth
        );

        Ok(Self {
            vectors: irqs.disarm(),
            config,
            hwif,
            stats,
            aeq,
            ceq,
            mgmt,
            cmdqs,
        })
    }

    pub fn config(&self) -> &HwConfig {
        &self.config
    }

    pub fn func_idx(&self) -> u16 {
        self.hwif.func_idx()
    }

    pub fn is_present(&self) -> bool {
        self.hwif.is_present()
    }

    pub fn cmdqs(&self) -> &Cmdqs {
        &self.cmdqs
    }

    /// Synchronous command; `timeout` defaults to the configured one
    pub fn submit_sync(
        &self,
        module: Module,
        cmd: u8,
        input: &[u8],
        output: Option<&mut [u8]>,
        timeout: Option<Duration>,
    ) -> Result<CmdCompletion> {
        self.cmdqs.submit_sync(module, cmd, input, output, timeout)
    }

    pub fn submit_async(&self, module: Module, cmd: u8, input: &[u8]) -> Result<()> {
        self.cmdqs.submit_async(module, cmd, input)
    }

    /// Management request; returns the response length
    pub fn send_message(
        &self,
        module: Module,
        cmd: u8,
        input: &[u8],
        output: Option<&mut [u8]>,
        ack_required: bool,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        self.mgmt
            .send_message(module, cmd, input, output, ack_required, timeout)
    }

    pub fn send_async(&self, module: Module, cmd: u8, input: &[u8]) -> Result<()> {
        self.mgmt.send_async(module, cmd, input)
    }

    /// Handler for requests the management CPU sends to this function
    pub fn register_event_handler<F>(&self, module: Module, cmd: u8, handler: F)
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        let handler: MgmtHandler = Arc::new(handler);
        self.mgmt.register_event_handler(module, cmd, handler);
    }

    pub fn unregister_event_handler(&self, module: Module, cmd: u8) {
        self.mgmt.unregister_event_handler(module, cmd);
    }

    /// Callback for a hardware AEQ event. Management messages are owned by
    /// the channel and cannot be taken over.
    pub fn register_hw_event<F>(&self, event: AeqEventType, callback: F) -> Result<()>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        if event == AeqEventType::MsgFromMgmtCpu {
            return Err(Error::InvalidParameter);
        }
        let callback: AeqCallback = Arc::new(callback);
        self.aeq.register_hw_event(event, callback);
        Ok(())
    }

    pub fn unregister_hw_event(&self, event: AeqEventType) {
        if event != AeqEventType::MsgFromMgmtCpu {
            self.aeq.unregister_hw_event(event);
        }
    }

    /// Callback for a software-raised AEQ event
    pub fn register_sw_event<F>(&self, event: u8, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.aeq.register_sw_event(event, Arc::new(callback));
    }

    pub fn unregister_sw_event(&self, event: u8) {
        self.aeq.unregister_sw_event(event);
    }

    /// Mark the management channel busy during firmware activation
    pub fn set_mgmt_channel_busy(&self, busy: bool) {
        if busy {
            self.hwif.set_state(StateFlags::MGMT_BUSY);
        } else {
            self.hwif.clear_state(StateFlags::MGMT_BUSY);
        }
        log::info!("hinic: management channel busy: {}", busy);
    }

    /// The device is gone: fail everything in flight with `DeviceAbsent`.
    ///
    /// Reading all ones from the device does the same on its own.
    pub fn surprise_remove(&self) {
        if self.hwif.mark_absent() {
            log::warn!("hinic: function {} removed", self.hwif.func_idx());
        } else {
            log::debug!("hinic: function {} already removed", self.hwif.func_idx());
        }
    }

    /// Run the completion pass of one command queue outside the interrupt
    pub fn poll_cmdq(&self, cmdq_type: CmdqType) -> usize {
        self.cmdqs.get(cmdq_type).process_completions()
    }

    pub fn stats(&self) -> StatsReport {
        self.stats.snapshot()
    }

    /// Log the counters and the latency distribution
    pub fn log_stats(&self) {
        let report = self.stats.snapshot();
        log::info!(
            "hinic: function {} stats: {:?}",
            self.hwif.func_idx(),
            report
        );
        for line in self.stats.latency_histogram_report().lines() {
            log::info!("hinic: {}", line);
        }
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }
}

impl Drop for HwDev {
    fn drop(&mut self) {
        self.hwif
            .clear_state(StateFlags::CMDQ_READY | StateFlags::MGMT_READY);
        self.mgmt.stop_worker();
        self.log_stats();
        let platform = self.hwif.platform();
        for vector in self.vectors.drain(..) {
            platform.irq.free_irq(vector);
        }
        self.ceq.unregister_event(CeqEventType::Cmdq);
        self.aeq.unregister_hw_event(AeqEventType::MsgFromMgmtCpu);
    }
}
