// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Enum-indexed metrics. Each `Stat` variant maps to one atomic slot in a
//! fixed array, which keeps the hot path to a single relaxed fetch-add and
//! makes a stats snapshot a simple walk over the variants.

use core::sync::atomic::{AtomicU64, Ordering};

/// All counters and gauges exported by the server. Names returned by
/// [`Stat::name`] are what the admin `stats` command prints.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Stat {
    ConnAccept,
    ConnAcceptEx,
    ConnClose,
    ConnCurr,
    ConnYield,
    TcpRecvByte,
    TcpSendByte,
    TcpSendPartial,
    WorkerEventLoop,
    WorkerEventRead,
    WorkerEventWrite,
    WorkerEventError,
    WorkerEventTotal,
    PendingIoServed,
    ProcessReq,
    ProcessEx,
    RbufExisting,
    RbufLoaned,
    RbufAllocated,
    WbufExisting,
    WbufLoaned,
    WbufAllocated,
    DcpMessageSent,
    DcpStepEx,
    ReservedItem,
    ReleasedItem,
    AdminRequestParse,
    AdminResponseCompose,
}

const NUM_STATS: usize = Stat::AdminResponseCompose as usize + 1;

static SLOTS: [AtomicU64; NUM_STATS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicU64 = AtomicU64::new(0);
    [ZERO; NUM_STATS]
};

static ALL: [Stat; NUM_STATS] = [
    Stat::ConnAccept,
    Stat::ConnAcceptEx,
    Stat::ConnClose,
    Stat::ConnCurr,
    Stat::ConnYield,
    Stat::TcpRecvByte,
    Stat::TcpSendByte,
    Stat::TcpSendPartial,
    Stat::WorkerEventLoop,
    Stat::WorkerEventRead,
    Stat::WorkerEventWrite,
    Stat::WorkerEventError,
    Stat::WorkerEventTotal,
    Stat::PendingIoServed,
    Stat::ProcessReq,
    Stat::ProcessEx,
    Stat::RbufExisting,
    Stat::RbufLoaned,
    Stat::RbufAllocated,
    Stat::WbufExisting,
    Stat::WbufLoaned,
    Stat::WbufAllocated,
    Stat::DcpMessageSent,
    Stat::DcpStepEx,
    Stat::ReservedItem,
    Stat::ReleasedItem,
    Stat::AdminRequestParse,
    Stat::AdminResponseCompose,
];

impl Stat {
    pub fn name(&self) -> &'static str {
        match self {
            Stat::ConnAccept => "conn_accept",
            Stat::ConnAcceptEx => "conn_accept_ex",
            Stat::ConnClose => "conn_close",
            Stat::ConnCurr => "conn_curr",
            Stat::ConnYield => "conn_yield",
            Stat::TcpRecvByte => "tcp_recv_byte",
            Stat::TcpSendByte => "tcp_send_byte",
            Stat::TcpSendPartial => "tcp_send_partial",
            Stat::WorkerEventLoop => "worker_event_loop",
            Stat::WorkerEventRead => "worker_event_read",
            Stat::WorkerEventWrite => "worker_event_write",
            Stat::WorkerEventError => "worker_event_error",
            Stat::WorkerEventTotal => "worker_event_total",
            Stat::PendingIoServed => "pending_io_served",
            Stat::ProcessReq => "process_req",
            Stat::ProcessEx => "process_ex",
            Stat::RbufExisting => "rbuf_existing",
            Stat::RbufLoaned => "rbuf_loaned",
            Stat::RbufAllocated => "rbuf_allocated",
            Stat::WbufExisting => "wbuf_existing",
            Stat::WbufLoaned => "wbuf_loaned",
            Stat::WbufAllocated => "wbuf_allocated",
            Stat::DcpMessageSent => "dcp_message_sent",
            Stat::DcpStepEx => "dcp_step_ex",
            Stat::ReservedItem => "reserved_item",
            Stat::ReleasedItem => "released_item",
            Stat::AdminRequestParse => "admin_request_parse",
            Stat::AdminResponseCompose => "admin_response_compose",
        }
    }

    fn slot(&self) -> &'static AtomicU64 {
        &SLOTS[*self as usize]
    }
}

pub fn increment_counter(stat: &Stat) {
    stat.slot().fetch_add(1, Ordering::Relaxed);
}

pub fn increment_counter_by(stat: &Stat, count: u64) {
    stat.slot().fetch_add(count, Ordering::Relaxed);
}

pub fn decrement_gauge(stat: &Stat) {
    stat.slot().fetch_sub(1, Ordering::Relaxed);
}

pub fn value(stat: &Stat) -> u64 {
    stat.slot().load(Ordering::Relaxed)
}

pub fn reset(stat: &Stat) {
    stat.slot().store(0, Ordering::Relaxed);
}

/// Snapshot every stat for the admin `stats` command.
pub fn snapshot() -> Vec<(&'static str, u64)> {
    ALL.iter()
        .map(|s| (s.name(), s.slot().load(Ordering::Relaxed)))
        .collect()
}

#[macro_export]
macro_rules! increment_counter {
    ($stat:expr) => {
        $crate::increment_counter($stat)
    };
}

#[macro_export]
macro_rules! increment_counter_by {
    ($stat:expr, $count:expr) => {
        $crate::increment_counter_by($stat, $count)
    };
}

#[macro_export]
macro_rules! increment_gauge {
    ($stat:expr) => {
        $crate::increment_counter($stat)
    };
}

#[macro_export]
macro_rules! decrement_gauge {
    ($stat:expr) => {
        $crate::decrement_gauge($stat)
    };
}

/// A histogram with power-of-two buckets. Used for the per-worker scheduler
/// histogram, where coarse buckets are sufficient and recording must stay
/// cheap and lock-free.
pub struct Histogram {
    buckets: [AtomicU64; 64],
}

impl Histogram {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            buckets: [ZERO; 64],
        }
    }

    pub fn increment(&self, value: u64) {
        let bucket = (64 - value.leading_zeros() as usize).min(63);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }

    /// Upper bound of the bucket containing the given percentile, or `None`
    /// if the histogram is empty.
    pub fn percentile(&self, percentile: f64) -> Option<u64> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let target = ((total as f64) * percentile / 100.0).ceil() as u64;
        let mut seen = 0;
        for (i, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return Some(if i == 0 { 0 } else { 1u64 << i });
            }
        }
        Some(u64::MAX)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_basics() {
        reset(&Stat::ProcessReq);
        increment_counter!(&Stat::ProcessReq);
        increment_counter_by!(&Stat::ProcessReq, 2);
        assert_eq!(value(&Stat::ProcessReq), 3);
    }

    #[test]
    fn snapshot_contains_all_names() {
        let snapshot = snapshot();
        assert_eq!(snapshot.len(), NUM_STATS);
        assert!(snapshot.iter().any(|(name, _)| *name == "conn_accept"));
    }

    #[test]
    fn histogram_percentile() {
        let histogram = Histogram::new();
        assert_eq!(histogram.percentile(50.0), None);

        for v in 1..=100u64 {
            histogram.increment(v);
        }
        // all values fall between 1 and 128, so p100 is bounded by 128
        assert!(histogram.percentile(100.0).unwrap() <= 128);
        assert!(histogram.percentile(50.0).unwrap() >= 32);
    }
}
