// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The capability set a bucket exports to the server core. Engines are held
//! behind `Arc<dyn Engine>` and invoked synchronously from worker threads;
//! any operation may return `ErrorCode::WouldBlock` to park the calling
//! command, in which case the engine must later complete it through the
//! [`NotifyIoComplete`] hook it was handed.

mod error;
mod item;
mod memory;

pub use error::*;
pub use item::*;
pub use memory::*;

use std::sync::Arc;

/// Identifies one in-flight command to the engine. The server packs the
/// connection's identity and the command's arrival serial into it; engines
/// treat the value as fully opaque and pass it back unchanged through
/// [`NotifyIoComplete`].
pub type CookieId = u64;

/// Completion hook for parked operations. Implemented by the worker: the
/// notification lands on the worker's pending-io list and wakes its poller,
/// which replays the command with the given status.
pub trait NotifyIoComplete: Send + Sync {
    fn notify_io_complete(&self, cookie: CookieId, status: EngineResult<()>);
}

/// Per-command context passed into every engine operation. The engine may
/// clone the notifier and stash it together with the id to complete the
/// command asynchronously.
pub struct CookieRef<'a> {
    pub id: CookieId,
    pub notify: &'a Arc<dyn NotifyIoComplete>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StoreOperation {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

/// Returned by mutating operations. When the client negotiated mutation
/// extras, the uuid and seqno are echoed in the response.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MutationDescr {
    pub cas: u64,
    pub vbucket_uuid: u64,
    pub seqno: u64,
}

pub trait Engine: Send + Sync {
    fn get(&self, cookie: &CookieRef, key: &DocKey, vbucket: u16) -> EngineResult<ItemHandle>;

    /// Get and lock the item. Further mutations and lock attempts fail with
    /// `Locked` until the lock times out, the item is unlocked with the
    /// returned cas, or a mutation presents the returned cas.
    fn get_locked(
        &self,
        cookie: &CookieRef,
        key: &DocKey,
        vbucket: u16,
        lock_timeout: u32,
    ) -> EngineResult<ItemHandle>;

    fn unlock(&self, cookie: &CookieRef, key: &DocKey, vbucket: u16, cas: u64)
        -> EngineResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn store(
        &self,
        cookie: &CookieRef,
        operation: StoreOperation,
        key: &DocKey,
        value: &[u8],
        flags: u32,
        exptime: u32,
        datatype: u8,
        cas: u64,
        vbucket: u16,
    ) -> EngineResult<MutationDescr>;

    fn remove(
        &self,
        cookie: &CookieRef,
        key: &DocKey,
        vbucket: u16,
        cas: u64,
    ) -> EngineResult<MutationDescr>;

    fn flush(&self, cookie: &CookieRef) -> EngineResult<()>;

    /// Fallback for opcodes the core does not implement. The returned bytes
    /// become the response value.
    fn unknown_command(
        &self,
        _cookie: &CookieRef,
        _header: &protocol_mcbp::RequestHeader,
        _body: &[u8],
    ) -> EngineResult<bytes::Bytes> {
        Err(ErrorCode::UnknownCommand)
    }

    /// Describe an item previously returned by `get`/`get_locked`. Returns
    /// `None` if the handle is not live.
    fn get_item_info(&self, item: &ItemHandle) -> Option<ItemInfo>;

    /// Release an item handle. Every handle returned by the engine must be
    /// released exactly once.
    fn item_release(&self, item: ItemHandle);

    /// The change-feed interface, if this engine supports it.
    fn dcp(&self) -> Option<&dyn Dcp> {
        None
    }

    /// Notification that the connection owning the cookie is disconnecting.
    /// The engine must complete or fail its outstanding operations; there is
    /// no preemptive cancellation.
    fn on_disconnect(&self, _cookie: CookieId) {}
}

/// Outcome of one producer step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DcpStep {
    /// Messages were produced; call again.
    Continue,
    /// Nothing to ship right now.
    Idle,
}

/// The change-feed interface. The consumer-side operations mirror the wire
/// commands; `step` drives the producer side, pushing messages through the
/// [`DcpMessageProducers`] sink (implemented by the connection).
pub trait Dcp: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn open(
        &self,
        cookie: &CookieRef,
        opaque: u32,
        seqno: u32,
        flags: u32,
        name: &[u8],
    ) -> EngineResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn mutation(
        &self,
        cookie: &CookieRef,
        opaque: u32,
        key: &DocKey,
        value: &[u8],
        datatype: u8,
        cas: u64,
        vbucket: u16,
        by_seqno: u64,
        rev_seqno: u64,
        meta: &[u8],
    ) -> EngineResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn deletion(
        &self,
        cookie: &CookieRef,
        opaque: u32,
        key: &DocKey,
        value: &[u8],
        datatype: u8,
        cas: u64,
        vbucket: u16,
        by_seqno: u64,
        rev_seqno: u64,
        meta: &[u8],
    ) -> EngineResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn expiration(
        &self,
        cookie: &CookieRef,
        opaque: u32,
        key: &DocKey,
        cas: u64,
        vbucket: u16,
        by_seqno: u64,
        rev_seqno: u64,
        meta: &[u8],
    ) -> EngineResult<()>;

    fn stream_end(
        &self,
        cookie: &CookieRef,
        opaque: u32,
        vbucket: u16,
        flags: u32,
    ) -> EngineResult<()>;

    fn get_failover_log(
        &self,
        cookie: &CookieRef,
        opaque: u32,
        vbucket: u16,
    ) -> EngineResult<Vec<(u64, u64)>>;

    fn buffer_acknowledgement(
        &self,
        cookie: &CookieRef,
        opaque: u32,
        vbucket: u16,
        buffer_bytes: u32,
    ) -> EngineResult<()>;

    fn control(&self, cookie: &CookieRef, key: &[u8], value: &[u8]) -> EngineResult<()>;

    /// Produce the next batch of messages for this channel.
    fn step(
        &self,
        cookie: &CookieRef,
        producers: &mut dyn DcpMessageProducers,
    ) -> EngineResult<DcpStep>;
}

/// Sink for producer messages, implemented by the connection. Each call
/// frames one message into the connection's send path. Item handles passed
/// here are owned by the sink from this point on: on success they are
/// released after transmission, on error before returning.
pub trait DcpMessageProducers {
    #[allow(clippy::too_many_arguments)]
    fn mutation(
        &mut self,
        opaque: u32,
        item: ItemHandle,
        vbucket: u16,
        by_seqno: u64,
        rev_seqno: u64,
        lock_time: u32,
        meta: &[u8],
        nru: u8,
        collection_len: u8,
    ) -> EngineResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn deletion(
        &mut self,
        opaque: u32,
        item: ItemHandle,
        vbucket: u16,
        by_seqno: u64,
        rev_seqno: u64,
        meta: &[u8],
        collection_len: u8,
    ) -> EngineResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn expiration(
        &mut self,
        opaque: u32,
        item: ItemHandle,
        vbucket: u16,
        by_seqno: u64,
        rev_seqno: u64,
        meta: &[u8],
        collection_len: u8,
    ) -> EngineResult<()>;

    fn stream_end(&mut self, opaque: u32, vbucket: u16, flags: u32) -> EngineResult<()>;
}
