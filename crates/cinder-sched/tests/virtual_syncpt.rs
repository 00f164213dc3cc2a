//! Virtual sync points driven through a stream on the soft host

use std::sync::Arc;

use cinder_core::opcode::IncrCond;
use cinder_core::sync::has_reached;
use cinder_core::{ModuleId, WaitBaseId, WaitTimeout};
use cinder_hal::{ChannelRegistry, CompletionMode, SoftHost, SoftHostConfig};
use cinder_sched::{SchedClient, MAPPING_TABLE_SIZE};
use cinder_stream::{Stream, StreamConfig};
use proptest::prelude::*;

fn client_with(mode: CompletionMode, config: StreamConfig) -> (Arc<SoftHost>, SchedClient) {
    let host = Arc::new(SoftHost::new(SoftHostConfig::default().with_completion(mode)));
    let channel = ChannelRegistry::new(host.clone()).open(&[ModuleId::Gr3d]).unwrap();
    let stream = Stream::new(channel, ModuleId::Gr3d, config).unwrap();
    (host, SchedClient::new(stream).unwrap())
}

fn client(mode: CompletionMode) -> (Arc<SoftHost>, SchedClient) {
    client_with(mode, StreamConfig::default())
}

fn frame(client: &mut SchedClient) -> u32 {
    let value = client.begin(2, 0, 0, 0).unwrap().push_incr(IncrCond::OpDone).unwrap();
    client.flush();
    value
}

#[test]
fn test_frames_wait_individually() {
    let (host, mut client) = client(CompletionMode::OnWait);
    let values: Vec<u32> = (0..3).map(|_| frame(&mut client)).collect();
    assert_eq!(values, [0, 1, 2]);

    // each frame is one client increment plus the trailing one
    assert_eq!(client.to_hardware(1), Some(3));
    assert_eq!(client.to_hardware(2), Some(5));

    client.cpu_wait(0, WaitTimeout::Infinite).unwrap();
    assert_eq!(host.waits()[0].thresh, 1);
    assert_eq!(host.in_flight(), 2);
    assert_eq!(client.read_cached(), 0);
    assert_eq!(client.to_hardware(0), None);
    assert!(client.would_wait(2).unwrap());

    client.cpu_wait(2, WaitTimeout::Infinite).unwrap();
    assert_eq!(client.read_latest().unwrap(), 2);
    assert!(!client.would_wait(1).unwrap());
    client.close().unwrap();
}

#[test]
fn test_timeout_leaves_value_pending() {
    let (host, mut client) = client(CompletionMode::Manual);
    let value = frame(&mut client);
    assert_eq!(client.cpu_wait(value, WaitTimeout::millis(2)), Err(cinder_core::Error::Timeout));
    assert!(client.would_wait(value).unwrap());
    host.retire_next();
    client.cpu_wait(value, WaitTimeout::millis(2)).unwrap();
}

#[test]
fn test_flush_and_cpu_wait_drains() {
    let (host, mut client) = client(CompletionMode::OnWait);
    frame(&mut client);
    let last = client.begin(2, 0, 0, 0).unwrap().push_incr(IncrCond::OpDone).unwrap();
    client.flush_and_cpu_wait().unwrap();
    assert_eq!(host.in_flight(), 0);
    assert_eq!(client.read_cached(), last);
}

#[test]
fn test_host_wait_last_with_wait_base() {
    let config = StreamConfig::default().with_wait_base(WaitBaseId::new(1));
    let (host, mut client) = client_with(CompletionMode::Immediate, config);
    let value = client
        .begin(6, 0, 0, 0)
        .unwrap()
        .push_host_wait_last(IncrCond::OpDone)
        .unwrap();
    assert_eq!(value, 0);
    client.flush();

    let record = &host.submissions()[0];
    assert_eq!(record.incrs[0].id, client.syncpoint());
    assert_eq!(record.incrs[0].wait_base, Some(WaitBaseId::new(1)));
    assert_eq!(client.read_latest().unwrap(), 0);
}

#[test]
fn test_full_mapping_table_forgets_oldest() {
    // A flushed range pushed out of the table reads as complete even
    // though the hardware never got there.
    let (host, mut client) = client(CompletionMode::Manual);
    for _ in 0..=MAPPING_TABLE_SIZE {
        frame(&mut client);
    }
    assert_eq!(client.dropped_mappings(), 1);
    assert_eq!(client.to_hardware(0), None);
    assert!(!client.would_wait(0).unwrap());
    client.cpu_wait(0, WaitTimeout::None).unwrap();
    assert!(client.would_wait(1).unwrap());
    host.retire_all();
    assert!(!client.would_wait(MAPPING_TABLE_SIZE as u32).unwrap());
}

/// Retires everything in flight when dropped, so a client dropped after
/// it does not block on work nobody will complete
struct RetireOnDrop(Arc<SoftHost>);

impl Drop for RetireOnDrop {
    fn drop(&mut self) {
        self.0.retire_all();
    }
}

#[derive(Debug, Clone)]
enum Op {
    Incr(u32),
    Flush,
    Retire,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u32..4).prop_map(Op::Incr),
        3 => Just(Op::Flush),
        2 => Just(Op::Retire),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_mapping_follows_hardware_across_wrap(
        start in 0u32..24,
        ops in prop::collection::vec(op(), 1..48),
    ) {
        let (host, mut client) = client(CompletionMode::Manual);
        let sp = client.syncpoint();
        host.set_syncpoint(sp, u32::MAX - start).unwrap();
        let _retire = RetireOnDrop(host.clone());

        let mut in_flight = 0;
        let mut flushed = 0;
        for op in &ops {
            match op {
                Op::Incr(n) => {
                    let mut cursor = client.begin(2 * n, 0, 0, 0).unwrap();
                    for _ in 0..*n {
                        cursor.push_incr(IncrCond::OpDone).unwrap();
                    }
                }
                Op::Flush => {
                    if !client.flush().is_empty() {
                        in_flight += 1;
                        flushed = client.next_value();
                    }
                }
                Op::Retire => {
                    if host.retire_next() {
                        in_flight -= 1;
                    }
                }
            }
            if in_flight >= MAPPING_TABLE_SIZE - 4 {
                host.retire_all();
                in_flight = 0;
            }

            let min = client.stream().channel().read_syncpoint(sp).unwrap();
            let mut prev: Option<u32> = None;
            for value in 0..flushed {
                match client.to_hardware(value) {
                    Some(hw) => {
                        if let Some(prev) = prev {
                            prop_assert!(has_reached(hw, prev.wrapping_add(1)));
                        }
                        prev = Some(hw);
                        prop_assert_eq!(client.would_wait(value).unwrap(), !has_reached(min, hw));
                    }
                    None => prop_assert!(!client.would_wait(value).unwrap()),
                }
            }
        }

        host.retire_all();
        client.close().unwrap();
    }
}
