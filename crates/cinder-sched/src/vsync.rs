//! # Virtual Sync Point
//!
//! Hardware sync points are 32-bit and wrap. A virtual sync point hands
//! out client values in order and remembers, per flush, which hardware
//! range those values landed on:
//!
//! ```text
//!   client   0 1 2 | 3 4 | 5 6 7 8
//!   hardware 41..43 | 47..48 | 50..53     (gaps are other increments)
//! ```
//!
//! A piece is dropped once the hardware minimum has passed its end.

use cinder_core::sync::{is_between, is_expired};
use cinder_core::SyncPointId;
use cinder_stream::FlushReport;
use heapless::Deque;

/// Live pieces one virtual sync point can hold
pub const MAPPING_TABLE_SIZE: usize = 16;

const _: () = assert!(MAPPING_TABLE_SIZE.is_power_of_two());

/// One flushed range of client values and where it sits in hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mapping {
    /// Hardware value of the first increment
    pub hw: u32,
    /// Client value of the first increment
    pub client: u32,
    /// Number of increments
    pub count: u32,
}

impl Mapping {
    /// Hardware value of the last increment
    #[inline]
    pub fn hw_last(&self) -> u32 {
        self.hw.wrapping_add(self.count).wrapping_sub(1)
    }

    /// Client value following the range
    #[inline]
    pub fn client_end(&self) -> u32 {
        self.client.wrapping_add(self.count)
    }
}

/// Client view of one hardware sync point
#[derive(Debug, Clone)]
pub struct VirtualSyncPoint {
    id: SyncPointId,
    /// Pieces whose end the hardware has not passed, oldest first
    live: Deque<Mapping, MAPPING_TABLE_SIZE>,
    /// Most recent piece, kept after it retires
    newest: Mapping,
    /// Next client value to hand out
    next: u32,
    dropped: u64,
}

impl VirtualSyncPoint {
    /// Start a virtual sync point over `id`
    pub const fn new(id: SyncPointId) -> Self {
        Self {
            id,
            live: Deque::new(),
            newest: Mapping { hw: 0, client: 0, count: 0 },
            next: 0,
            dropped: 0,
        }
    }

    /// Hardware sync point
    pub fn id(&self) -> SyncPointId {
        self.id
    }

    /// Next client value [`VirtualSyncPoint::reserve`] hands out
    pub fn next_value(&self) -> u32 {
        self.next
    }

    /// Live pieces
    pub fn live(&self) -> usize {
        self.live.len()
    }

    /// Pieces dropped because the table was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Hand out the next client value
    pub fn reserve(&mut self) -> u32 {
        let value = self.next;
        self.next = self.next.wrapping_add(1);
        value
    }

    fn get(&self, i: usize) -> Option<&Mapping> {
        let (front, back) = self.live.as_slices();
        match front.get(i) {
            Some(m) => Some(m),
            None => back.get(i - front.len()),
        }
    }

    /// Newest client value known to be done
    ///
    /// Everything before the oldest live piece has completed.
    pub fn cached_min(&self) -> u32 {
        match self.live.front() {
            Some(oldest) => oldest.client.wrapping_sub(1),
            None => self.newest.client_end().wrapping_sub(1),
        }
    }

    /// Has `value` been covered by a flush?
    pub fn is_submitted(&self, value: u32) -> bool {
        is_expired(
            self.newest.client_end().wrapping_sub(1),
            value,
            self.next.wrapping_sub(1),
        )
    }

    /// Would waiting for `value` block, judging by cached state only?
    pub fn would_wait_cached(&self, value: u32) -> bool {
        !is_expired(self.cached_min(), value, self.next.wrapping_sub(1))
    }

    /// Hardware value matching client `value`, if it sits in a live piece
    pub fn to_hardware(&self, value: u32) -> Option<u32> {
        self.live
            .iter()
            .find(|m| is_between(m.client, value, m.client_end()))
            .map(|m| m.hw.wrapping_add(value.wrapping_sub(m.client)))
    }

    /// Retire pieces the hardware window `(min, max]` has passed
    pub fn update(&mut self, min: u32, max: u32) {
        let len = self.live.len();
        let mut retire = 0;
        let mut chop = None;
        for i in (0..len).rev() {
            let Some(m) = self.get(i) else { break };
            if is_expired(min, m.hw_last(), max) {
                retire = i + 1;
                break;
            }
            if is_expired(min, m.hw, max) {
                retire = i;
                chop = Some(min.wrapping_sub(m.hw).wrapping_add(1));
                break;
            }
        }

        for _ in 0..retire {
            self.live.pop_front();
        }
        if let Some(done) = chop {
            if let Some(front) = self.live.front_mut() {
                front.hw = front.hw.wrapping_add(done);
                front.client = front.client.wrapping_add(done);
                front.count -= done;
            }
            if self.live.len() == 1 {
                if let Some(&front) = self.live.front() {
                    self.newest = front;
                }
            }
        }
        if retire > 0 || chop.is_some() {
            log::debug!(
                "{}: hw ({}, {}] retired {} piece(s), {} live",
                self.id,
                min,
                max,
                retire,
                self.live.len()
            );
        }
    }

    /// Account a flush of the stream feeding this sync point
    ///
    /// `min` is the hardware value read after the submission.
    pub fn on_flush(&mut self, report: &FlushReport, min: u32) {
        if report.error.is_some() || report.count == 0 || report.syncpoint != self.id {
            return;
        }
        self.update(min, report.base.wrapping_add(report.count));

        let count = report.count.saturating_sub(report.bookkeeping_incrs);
        if count == 0 {
            return;
        }
        let piece = Mapping {
            hw: report.base.wrapping_add(1),
            client: self.newest.client_end(),
            count,
        };
        if self.live.is_full() {
            if let Some(lost) = self.live.pop_front() {
                self.dropped += 1;
                log::warn!(
                    "{}: mapping table full, dropping client values {}..{} still in flight",
                    self.id,
                    lost.client,
                    lost.client_end()
                );
            }
        }
        if self.live.push_back(piece).is_ok() {
            self.newest = piece;
        }
    }
}
