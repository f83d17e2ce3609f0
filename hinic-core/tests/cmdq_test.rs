// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

#![cfg(feature = "sim")]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use hinic::cmdq::CmdKind;
use hinic::sim::{CmdResponse, CmdqFault};
use hinic::{CmdqType, DeviceStatus, Error, HwConfig, Module};

use common::{SHORT, WAIT, bring_up, bring_up_with, test_config};

fn echo_u64(input: &[u8]) -> CmdResponse {
    let mut raw = [0u8; 8];
    let n = input.len().min(8);
    raw[..n].copy_from_slice(&input[..n]);
    CmdResponse::direct(u64::from_le_bytes(raw))
}

#[test]
fn test_bring_up_programs_both_cmdqs() {
    let (card, dev) = bring_up();
    assert!(dev.is_present());

    let contexts = card.cmdq_contexts();
    assert_eq!(contexts.len(), 2);
    assert_eq!(contexts[0].cmdq_type, CmdqType::Sync as u8);
    assert_eq!(contexts[1].cmdq_type, CmdqType::Async as u8);
    for ctxt in &contexts {
        assert_eq!(ctxt.depth, 64);
        assert_eq!(ctxt.wqebb_size, 64);
        assert!(ctxt.ceq_arm);
        assert!(ctxt.wrapped);
    }
    assert!(card.irq_registered(dev.config().aeq_vector));
    assert!(card.irq_registered(dev.config().ceq_vector));
}

#[test]
fn test_drop_releases_vectors() {
    let (card, dev) = bring_up();
    let config = dev.config().clone();
    drop(dev);
    assert!(!card.irq_registered(config.aeq_vector));
    assert!(!card.irq_registered(config.ceq_vector));
}

#[test]
fn test_sync_direct_response() {
    let (card, dev) = bring_up();
    card.set_cmd_handler(Module::L2nic, 0x20, |input| {
        CmdResponse::direct(input.iter().map(|b| *b as u64).sum())
    });

    let done = dev
        .submit_sync(Module::L2nic, 0x20, &[1, 2, 3], None, None)
        .expect("command failed");
    assert_eq!(done.direct_resp, 6);
    assert_eq!(done.out_len, 0);
    assert!(!done.late);
}

#[test]
fn test_sync_buffer_response() {
    let (card, dev) = bring_up();
    card.set_cmd_handler(Module::Cfgm, 0x07, |input| {
        CmdResponse::data(input.iter().rev().copied().collect())
    });

    // too large to travel inline
    let input: Vec<u8> = (0..100).collect();
    let mut output = [0u8; 128];
    let done = dev
        .submit_sync(Module::Cfgm, 0x07, &input, Some(&mut output), None)
        .expect("command failed");

    assert_eq!(done.out_len, 100);
    let expected: Vec<u8> = (0..100).rev().collect();
    assert_eq!(&output[..100], &expected[..]);
}

#[test]
fn test_device_error_status() {
    let (card, dev) = bring_up();
    card.set_cmd_handler(Module::L2nic, 0x30, |_| CmdResponse::error(0x04));

    assert_eq!(
        dev.submit_sync(Module::L2nic, 0x30, &[], None, None),
        Err(Error::DeviceStatus(DeviceStatus(0x04)))
    );
    assert_eq!(dev.stats().cmdq_errors, 1);
}

#[test]
fn test_ring_and_event_queue_wrap() {
    let (card, dev) = bring_up();
    card.set_cmd_handler(Module::L2nic, 0x01, echo_u64);

    // several laps of both the 64-slot ring and the 64-element CEQ
    for i in 0..300u64 {
        let done = dev
            .submit_sync(Module::L2nic, 0x01, &i.to_le_bytes(), None, None)
            .expect("command failed");
        assert_eq!(done.direct_resp, i);
    }
    let stats = dev.stats();
    assert_eq!(stats.cmdq_submitted, 300);
    assert_eq!(stats.cmdq_completed, 300);
    assert_eq!(stats.cmdq_timeouts, 0);
}

#[test]
fn test_concurrent_callers_get_their_own_results() {
    let (card, dev) = bring_up();
    card.set_cmd_handler(Module::L2nic, 0x01, echo_u64);

    thread::scope(|scope| {
        for t in 0..4u64 {
            let dev = &dev;
            scope.spawn(move || {
                for i in 0..50u64 {
                    let value = t << 32 | i;
                    let done = dev
                        .submit_sync(Module::L2nic, 0x01, &value.to_le_bytes(), None, None)
                        .expect("command failed");
                    assert_eq!(done.direct_resp, value);
                }
            });
        }
    });
    assert_eq!(dev.stats().cmdq_completed, 200);
}

#[test]
fn test_async_commands_reach_the_card() {
    let (card, dev) = bring_up();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    card.set_cmd_handler(Module::L2nic, 0x40, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        CmdResponse::default()
    });

    for _ in 0..10 {
        dev.submit_async(Module::L2nic, 0x40, &[0xAA; 64])
            .expect("async submit failed");
    }
    assert!(card.wait_until(WAIT, || seen.load(Ordering::SeqCst) == 10));
    assert_eq!(dev.stats().cmdq_async, 10);
}

#[test]
fn test_completion_without_event_is_late() {
    let (card, dev) = bring_up();
    card.set_cmd_handler(Module::L2nic, 0x01, echo_u64);
    card.set_cmdq_fault(CmdqFault::NoEvent);

    let cmdq = dev.cmdqs().get(CmdqType::Sync);
    let pending = cmdq
        .post_sync(Module::L2nic, 0x01, &7u64.to_le_bytes(), None)
        .expect("post failed");
    assert!(card.wait_idle(WAIT));

    let done = cmdq.wait(&pending, None, SHORT).expect("late completion lost");
    assert!(done.late);
    assert_eq!(done.direct_resp, 7);
    assert_eq!(cmdq.slot_kinds(), vec![CmdKind::FakeTimeout]);
    assert_eq!(dev.stats().cmdq_fake_timeouts, 1);

    // the next event releases the slot
    card.set_cmdq_fault(CmdqFault::None);
    let done = dev
        .submit_sync(Module::L2nic, 0x01, &8u64.to_le_bytes(), None, None)
        .expect("command failed");
    assert_eq!(done.direct_resp, 8);
    assert!(!done.late);
}

#[test]
fn test_timeout_then_recovery() {
    let (card, dev) = bring_up();
    card.set_cmd_handler(Module::L2nic, 0x01, echo_u64);
    card.set_cmdq_fault(CmdqFault::Stall);

    assert_eq!(
        dev.submit_sync(Module::L2nic, 0x01, &1u64.to_le_bytes(), None, Some(SHORT)),
        Err(Error::Timeout)
    );
    assert_eq!(
        dev.cmdqs().get(CmdqType::Sync).slot_kinds(),
        vec![CmdKind::Timeout]
    );
    assert_eq!(dev.stats().cmdq_timeouts, 1);

    card.set_cmdq_fault(CmdqFault::None);
    let done = dev
        .submit_sync(Module::L2nic, 0x01, &2u64.to_le_bytes(), None, None)
        .expect("command failed");
    assert_eq!(done.direct_resp, 2);
    assert!(card.wait_until(WAIT, || {
        !dev.cmdqs()
            .get(CmdqType::Sync)
            .slot_kinds()
            .contains(&CmdKind::Timeout)
    }));
}

#[test]
fn test_full_ring_reports_busy() {
    let config = HwConfig {
        cmdq_depth: 8,
        ..test_config()
    };
    let (card, dev) = bring_up_with(config);
    card.set_cmdq_fault(CmdqFault::Stall);

    let cmdq = dev.cmdqs().get(CmdqType::Sync);
    let pending: Vec<_> = (0..7)
        .map(|i| cmdq.post_sync(Module::L2nic, i, &[], None).expect("post failed"))
        .collect();
    assert_eq!(cmdq.free_slots(), 1);

    assert_eq!(
        dev.submit_sync(Module::L2nic, 0x01, &[], None, Some(SHORT)),
        Err(Error::QueueFull)
    );
    assert!(Error::QueueFull.is_retryable());
    assert_eq!(dev.stats().cmdq_busy, 1);
    assert_eq!(pending.len(), 7);
}

#[test]
fn test_oversized_input_is_refused() {
    let (_card, dev) = bring_up();
    assert_eq!(
        dev.submit_sync(Module::L2nic, 0x01, &[0u8; 4096], None, None),
        Err(Error::MessageTooLarge)
    );
}
