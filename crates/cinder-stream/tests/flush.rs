//! Flush protocol scenarios against the soft host

use std::sync::{Arc, Mutex};

use cinder_core::opcode::{self, IncrCond};
use cinder_core::{Channel, Error, Fence, ModuleId, SyncPointId, SyncPointIncr};
use cinder_hal::{ChannelRegistry, SoftHost, SoftHostConfig};
use cinder_stream::{FlushReport, Stream, StreamConfig, StreamFlags};

fn open(config: SoftHostConfig, module: ModuleId) -> (Arc<SoftHost>, Arc<dyn Channel>) {
    let host = Arc::new(SoftHost::new(config));
    let registry = ChannelRegistry::new(host.clone());
    let channel = registry.open(&[module]).unwrap();
    (host, channel)
}

#[test]
fn test_single_engine_no_contention() {
    let (host, channel) = open(SoftHostConfig::default(), ModuleId::Gr2d);
    let config = StreamConfig::default().with_syncpoint(SyncPointId::new(5));
    let mut stream = Stream::new(channel.clone(), ModuleId::Gr2d, config).unwrap();
    assert_eq!(channel.read_syncpoint(SyncPointId::new(5)).unwrap(), 0);

    {
        let mut cursor = stream.begin(10, 0, 0, 0).unwrap();
        for i in 0..10 {
            cursor.push_word(i).unwrap();
        }
    }
    let fences = stream.flush();

    assert_eq!(host.submit_count(), 1);
    let record = &host.submissions()[0];
    assert_eq!(
        record.incrs,
        [SyncPointIncr { id: SyncPointId::new(5), incrs: 1, wait_base: None }]
    );
    assert_eq!(fences.as_slice(), &[Fence::new(SyncPointId::new(5), 1)]);
    assert_eq!(stream.last_fences(), &[Fence::new(SyncPointId::new(5), 1)]);
}

#[test]
fn test_empty_flush_is_idempotent() {
    let (host, channel) = open(SoftHostConfig::default(), ModuleId::Gr3d);
    let mut stream = Stream::new(channel, ModuleId::Gr3d, StreamConfig::default()).unwrap();

    assert!(stream.flush().is_empty());
    stream.begin(1, 0, 0, 0).unwrap().push_word(0).unwrap();
    assert_eq!(stream.flush().len(), 1);
    assert!(stream.flush().is_empty());
    assert!(stream.flush().is_empty());

    assert_eq!(host.submit_count(), 1);
    assert_eq!(stream.stats().empty_flushes, 3);
    assert_eq!(stream.stats().flushes, 1);
}

#[test]
fn test_submission_failure_is_sticky_once() {
    let (host, channel) = open(SoftHostConfig::default(), ModuleId::Gr3d);
    let mut stream = Stream::new(channel, ModuleId::Gr3d, StreamConfig::default()).unwrap();
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    stream
        .set_post_flush(Box::new(move |r: &FlushReport| sink.lock().unwrap().push(*r)))
        .unwrap();

    stream.begin(1, 0, 0, 0).unwrap().push_word(0).unwrap();
    let good = stream.flush();

    host.fail_next_submit(Error::SubmissionFailed);
    stream.begin(1, 0, 0, 0).unwrap().push_word(0).unwrap();
    assert!(stream.flush().is_empty());

    // earlier work stays valid
    assert_eq!(stream.last_fences(), good.as_slice());
    assert!(stream.is_idle());

    assert_eq!(stream.get_error(), Err(Error::SubmissionFailed));
    assert_eq!(stream.get_error(), Ok(()));

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[1].count, 0);
    assert_eq!(reports[1].error, Some(Error::SubmissionFailed));
}

#[test]
fn test_pending_error_abandons_batches() {
    let (host, channel) = open(SoftHostConfig::default(), ModuleId::Gr3d);
    let mut stream = Stream::new(channel, ModuleId::Gr3d, StreamConfig::default()).unwrap();

    host.fail_next_submit(Error::TransportError(-5));
    stream.begin(1, 0, 0, 0).unwrap().push_word(0).unwrap();
    stream.flush();
    assert_eq!(host.submit_count(), 0);

    stream.begin(1, 0, 0, 0).unwrap().push_word(0).unwrap();
    assert!(stream.flush().is_empty());
    assert_eq!(host.submit_count(), 0);
    assert_eq!(stream.stats().failed_submits, 2);

    // the first error wins
    assert_eq!(stream.get_error(), Err(Error::TransportError(-5)));

    stream.begin(1, 0, 0, 0).unwrap().push_word(0).unwrap();
    assert_eq!(stream.flush().len(), 1);
    assert_eq!(host.submit_count(), 1);
}

#[test]
fn test_syncpoint_table_exhaustion() {
    let config = SoftHostConfig::default().with_syncpoints(64);
    let (host, channel) = open(config, ModuleId::Gr3d);
    let mut stream = Stream::new(channel, ModuleId::Gr3d, StreamConfig::default()).unwrap();
    let own = stream.syncpoint();

    let foreign: Vec<SyncPointId> = (30..64).map(SyncPointId::new).filter(|&id| id != own).collect();
    let mut result = Ok(());
    {
        let mut cursor = stream.begin(2 * foreign.len() as u32, 0, 0, 0).unwrap();
        for &id in &foreign {
            result = cursor.push_incr(id, opcode::host::INCR_SYNCPT, IncrCond::OpDone, true);
            if result.is_err() {
                break;
            }
        }
    }
    assert_eq!(result, Err(Error::InsufficientResources));

    let fences = stream.flush();
    let record = &host.submissions()[0];
    assert_eq!(record.incrs.len(), 32);
    assert_eq!(record.incrs[0].id, own);
    assert_eq!(fences.len(), 32);
    // every recorded increment was actually written
    assert!(record.incrs[1..].iter().all(|i| i.incrs == 1));
}

#[test]
fn test_null_kickoff_forwarded() {
    let (host, channel) = open(SoftHostConfig::default(), ModuleId::Vic);
    let config = StreamConfig::default().with_flags(StreamFlags::NULL_KICKOFF);
    let mut stream = Stream::new(channel, ModuleId::Vic, config).unwrap();
    stream.begin(1, 0, 0, 0).unwrap().push_word(0).unwrap();
    stream.flush();
    let record = &host.submissions()[0];
    assert!(record.null_kickoff);
    assert_eq!(record.module, Some(ModuleId::Vic));
}

#[test]
fn test_streams_interleave_at_flush_granularity() {
    let (host, channel) = open(SoftHostConfig::default(), ModuleId::Gr2d);
    let config_a = StreamConfig::default().with_syncpoint(SyncPointId::new(18));
    let config_b = StreamConfig::default().with_syncpoint(SyncPointId::new(19));
    let mut a = Stream::new(channel.clone(), ModuleId::Gr2d, config_a).unwrap();
    let mut b = Stream::new(channel, ModuleId::Gr2d, config_b).unwrap();

    a.begin(2, 0, 0, 0).unwrap().push_words(&[0xa0, 0xa1]).unwrap();
    b.begin(2, 0, 0, 0).unwrap().push_words(&[0xb0, 0xb1]).unwrap();
    a.begin(1, 0, 0, 0).unwrap().push_word(0xa2).unwrap();
    b.flush();
    a.flush();

    let records = host.submissions();
    assert_eq!(records.len(), 2);
    assert_eq!(&records[0].gather_words[0][..2], &[0xb0, 0xb1]);
    assert_eq!(&records[1].gather_words[0][..3], &[0xa0, 0xa1, 0xa2]);
}

#[test]
fn test_wait_on_other_stream_fence() {
    let (host, channel) = open(SoftHostConfig::default(), ModuleId::Gr2d);
    let mut producer = Stream::new(
        channel.clone(),
        ModuleId::Gr2d,
        StreamConfig::default().with_syncpoint(SyncPointId::new(18)),
    )
    .unwrap();
    let mut consumer = Stream::new(
        channel,
        ModuleId::Gr2d,
        StreamConfig::default().with_syncpoint(SyncPointId::new(19)),
    )
    .unwrap();

    producer.begin(1, 0, 0, 0).unwrap().push_word(0).unwrap();
    let fence = producer.flush()[0];

    consumer.begin(1, 1, 0, 0).unwrap().push_wait(fence).unwrap();
    consumer.flush();

    let record = &host.submissions()[1];
    assert_eq!(record.waits[0].syncpt, fence.id);
    assert_eq!(record.waits[0].thresh, fence.value);
}
