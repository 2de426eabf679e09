// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Change-feed plumbing. The consumer-side executors decode incoming DCP
//! frames and forward them to the engine; the producer side implements the
//! engine's message sink on top of the connection's send path, and
//! `ship_dcp_log` drives the engine's step function from the ship state.

use crate::connection::Connection;
use crate::dispatch::{check_privilege, handle_error, protocol_error, take_aiostat};
use crate::rbac::Privilege;
use crate::statemachine::State;
use crate::worker::WorkerCtx;

use engine::{
    CookieRef, DcpMessageProducers, DcpStep, DocKey, Engine, EngineResult, ErrorCode, ItemHandle,
};
use metrics::Stat;
use protocol_mcbp::*;

use std::sync::Arc;

fn dcp_engine(c: &mut Connection, slot: usize) -> Option<Arc<dyn Engine>> {
    match c.bucket_engine() {
        Some(engine) if engine.dcp().is_some() => Some(engine.clone()),
        Some(_) => {
            handle_error(c, slot, c.remap_error_code(ErrorCode::NotSupported));
            None
        }
        None => {
            handle_error(c, slot, c.remap_error_code(ErrorCode::NoBucket));
            None
        }
    }
}

// ----------------------------------------------------------------------
// consumer-side executors

pub fn dcp_open_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    let header = *c.cookie(slot).header();

    let open = {
        let packet = c.packet(slot);
        let extras = &packet[HEADER_LEN..HEADER_LEN + header.extlen as usize];
        DcpOpen::decode(extras)
    };
    let open = match open {
        Ok(open) => open,
        Err(_) => {
            protocol_error(c, slot, "invalid dcp open request");
            return;
        }
    };

    let engine = match dcp_engine(c, slot) {
        Some(engine) => engine,
        None => return,
    };

    let mut ret = take_aiostat(c, slot);
    if ret.is_ok() {
        let privilege = if open.is_producer() {
            Privilege::DcpProducer
        } else {
            Privilege::DcpConsumer
        };
        ret = check_privilege(c, ctx, privilege);
    }

    let result = if let Err(code) = ret {
        Err(code)
    } else {
        let cookie_ref = CookieRef {
            id: c.cookie_id(slot),
            notify: &ctx.notify,
        };
        let packet = c.packet(slot);
        let name = &packet[HEADER_LEN + header.extlen as usize..]
            [..header.keylen as usize];
        engine
            .dcp()
            .expect("engine lost its dcp interface")
            .open(&cookie_ref, header.opaque, open.seqno, open.flags, name)
    };

    match result.map_err(|e| c.remap_error_code(e)) {
        Ok(()) => {
            c.set_dcp(true);
            c.set_dcp_xattr_aware(open.include_xattrs());
            c.set_dcp_no_value(open.no_value());
            c.set_dcp_collection_aware(open.is_collection_aware());
            c.set_dcp_delete_time_enabled(open.include_delete_times());
            // unordered execution and a change feed cannot coexist
            c.set_allow_unordered_execution(false);
            info!(
                "{}: opened dcp channel ({})",
                c.id(),
                if open.is_producer() {
                    "producer"
                } else {
                    "consumer"
                }
            );
            c.send_status(slot, Status::Success);
        }
        Err(code) => handle_error(c, slot, code),
    }
}

/// Split a change-feed key section into its collection prefix and logical
/// key, enforcing that the prefix is only present on collection-aware
/// channels.
fn split_dcp_key<'a>(
    key: &'a [u8],
    collection_len: u8,
    collection_aware: bool,
) -> Result<DocKey<'a>, ()> {
    if collection_len as usize > key.len() {
        return Err(());
    }
    if collection_len != 0 && !collection_aware {
        return Err(());
    }
    let namespace = DocKey::dcp_namespace(collection_aware, collection_len);
    Ok(DocKey::new(namespace, &key[collection_len as usize..]))
}

pub fn dcp_mutation_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    let header = *c.cookie(slot).header();
    let collection_aware = c.is_dcp_collection_aware();

    // validate the frame before the engine sees any of it
    let mutation = {
        let packet = c.packet(slot);
        let body = &packet[HEADER_LEN..];
        let extras = &body[0..header.extlen as usize];
        let keylen = header.keylen as usize;
        match DcpMutation::decode(extras, collection_aware) {
            Ok(mutation)
                if mutation.nmeta as usize
                    <= body.len() - header.extlen as usize - keylen
                    && split_dcp_key(
                        &body[header.extlen as usize..][..keylen],
                        mutation.collection_len,
                        collection_aware,
                    )
                    .is_ok() =>
            {
                Some(mutation)
            }
            _ => None,
        }
    };
    let mutation = match mutation {
        Some(mutation) => mutation,
        None => {
            protocol_error(c, slot, "malformed dcp mutation");
            return;
        }
    };

    let engine = match dcp_engine(c, slot) {
        Some(engine) => engine,
        None => return,
    };

    let ret = take_aiostat(c, slot);

    let result = if let Err(code) = ret {
        Err(code)
    } else {
        let cookie_ref = CookieRef {
            id: c.cookie_id(slot),
            notify: &ctx.notify,
        };
        let packet = c.packet(slot);
        let body = &packet[HEADER_LEN..];
        let keylen = header.keylen as usize;
        let key_section = &body[header.extlen as usize..][..keylen];
        let rest = &body[header.extlen as usize + keylen..];
        let nmeta = mutation.nmeta as usize;
        let value = &rest[..rest.len() - nmeta];
        let meta = &rest[rest.len() - nmeta..];
        let key = split_dcp_key(key_section, mutation.collection_len, collection_aware)
            .expect("frame was validated");
        engine
            .dcp()
            .expect("engine lost its dcp interface")
            .mutation(
                &cookie_ref,
                header.opaque,
                &key,
                value,
                header.datatype,
                header.cas,
                header.vbucket,
                mutation.by_seqno,
                mutation.rev_seqno,
                meta,
            )
    };

    match result.map_err(|e| c.remap_error_code(e)) {
        Ok(()) => {
            if slot == 0 {
                c.set_state(State::NewCmd);
            }
        }
        Err(code) => handle_error(c, slot, code),
    }
}

fn dcp_removal_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize, expiration: bool) {
    let header = *c.cookie(slot).header();
    let collection_aware = c.is_dcp_collection_aware();

    // validate the frame before the engine sees any of it
    let deletion = {
        let packet = c.packet(slot);
        let body = &packet[HEADER_LEN..];
        let extras = &body[0..header.extlen as usize];
        let keylen = header.keylen as usize;
        match DcpDeletion::decode(extras, collection_aware) {
            Ok(deletion)
                if deletion.nmeta as usize
                    <= body.len() - header.extlen as usize - keylen
                    && split_dcp_key(
                        &body[header.extlen as usize..][..keylen],
                        deletion.collection_len,
                        collection_aware,
                    )
                    .is_ok() =>
            {
                Some(deletion)
            }
            _ => None,
        }
    };
    let deletion = match deletion {
        Some(deletion) => deletion,
        None => {
            protocol_error(c, slot, "malformed dcp deletion");
            return;
        }
    };

    let engine = match dcp_engine(c, slot) {
        Some(engine) => engine,
        None => return,
    };

    let ret = take_aiostat(c, slot);

    let result = if let Err(code) = ret {
        Err(code)
    } else {
        let cookie_ref = CookieRef {
            id: c.cookie_id(slot),
            notify: &ctx.notify,
        };
        let packet = c.packet(slot);
        let body = &packet[HEADER_LEN..];
        let keylen = header.keylen as usize;
        let key_section = &body[header.extlen as usize..][..keylen];
        let rest = &body[header.extlen as usize + keylen..];
        let nmeta = deletion.nmeta as usize;
        let value = &rest[..rest.len() - nmeta];
        let meta = &rest[rest.len() - nmeta..];
        let key = split_dcp_key(key_section, deletion.collection_len, collection_aware)
            .expect("frame was validated");
        let dcp = engine.dcp().expect("engine lost its dcp interface");
        if expiration {
            dcp.expiration(
                &cookie_ref,
                header.opaque,
                &key,
                header.cas,
                header.vbucket,
                deletion.by_seqno,
                deletion.rev_seqno,
                meta,
            )
        } else {
            dcp.deletion(
                &cookie_ref,
                header.opaque,
                &key,
                value,
                header.datatype,
                header.cas,
                header.vbucket,
                deletion.by_seqno,
                deletion.rev_seqno,
                meta,
            )
        }
    };

    match result.map_err(|e| c.remap_error_code(e)) {
        Ok(()) => {
            if slot == 0 {
                c.set_state(State::NewCmd);
            }
        }
        Err(code) => handle_error(c, slot, code),
    }
}

pub fn dcp_deletion_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    dcp_removal_executor(c, ctx, slot, false);
}

pub fn dcp_expiration_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    dcp_removal_executor(c, ctx, slot, true);
}

pub fn dcp_snapshot_marker_executor(c: &mut Connection, _ctx: &mut WorkerCtx, slot: usize) {
    let header = *c.cookie(slot).header();
    let _ = take_aiostat(c, slot);

    let valid = {
        let packet = c.packet(slot);
        let extras = &packet[HEADER_LEN..HEADER_LEN + header.extlen as usize];
        DcpSnapshotMarker::decode(extras).is_ok()
    };

    if !valid {
        protocol_error(c, slot, "malformed snapshot marker");
        return;
    }

    // markers carry no engine side effects here; acknowledge by moving on
    if slot == 0 {
        c.set_state(State::NewCmd);
    }
}

pub fn dcp_stream_end_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    let header = *c.cookie(slot).header();

    let engine = match dcp_engine(c, slot) {
        Some(engine) => engine,
        None => return,
    };

    let ret = take_aiostat(c, slot);

    let result = if let Err(code) = ret {
        Err(code)
    } else {
        let flags = {
            let packet = c.packet(slot);
            let extras = &packet[HEADER_LEN..HEADER_LEN + header.extlen as usize];
            DcpStreamEnd::decode(extras)
        };
        match flags {
            Ok(end) => {
                let cookie_ref = CookieRef {
                    id: c.cookie_id(slot),
                    notify: &ctx.notify,
                };
                engine
                    .dcp()
                    .expect("engine lost its dcp interface")
                    .stream_end(&cookie_ref, header.opaque, header.vbucket, end.flags)
            }
            Err(_) => Err(ErrorCode::Invalid),
        }
    };

    match result.map_err(|e| c.remap_error_code(e)) {
        Ok(()) => {
            c.set_state(State::ShipLog);
        }
        Err(code) => handle_error(c, slot, code),
    }
}

pub fn dcp_get_failover_log_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    let header = *c.cookie(slot).header();

    let engine = match dcp_engine(c, slot) {
        Some(engine) => engine,
        None => return,
    };

    let ret = take_aiostat(c, slot);

    let result = if let Err(code) = ret {
        Err(code)
    } else {
        let cookie_ref = CookieRef {
            id: c.cookie_id(slot),
            notify: &ctx.notify,
        };
        engine
            .dcp()
            .expect("engine lost its dcp interface")
            .get_failover_log(&cookie_ref, header.opaque, header.vbucket)
    };

    match result.map_err(|e| c.remap_error_code(e)) {
        Ok(log) => {
            let mut value = Vec::with_capacity(log.len() * 16);
            compose_failover_log(&log, &mut value);

            let response = ResponseHeader {
                magic: Magic::ClientResponse,
                opcode: header.opcode,
                keylen: 0,
                extlen: 0,
                datatype: 0,
                status: Status::Success,
                bodylen: value.len() as u32,
                opaque: header.opaque,
                cas: 0,
            };
            let cookie = c.cookie_mut(slot);
            let buffer = cookie.dynamic_buffer();
            response.compose(buffer);
            buffer.extend_from_slice(&value);
            c.send_dynamic_buffer(slot);
        }
        Err(code) => handle_error(c, slot, code),
    }
}

pub fn dcp_buffer_acknowledgement_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    let header = *c.cookie(slot).header();

    let engine = match dcp_engine(c, slot) {
        Some(engine) => engine,
        None => return,
    };

    let ret = take_aiostat(c, slot);

    let result = if let Err(code) = ret {
        Err(code)
    } else {
        let ack = {
            let packet = c.packet(slot);
            let extras = &packet[HEADER_LEN..HEADER_LEN + header.extlen as usize];
            DcpBufferAcknowledgement::decode(extras)
        };
        match ack {
            Ok(ack) => {
                let cookie_ref = CookieRef {
                    id: c.cookie_id(slot),
                    notify: &ctx.notify,
                };
                engine
                    .dcp()
                    .expect("engine lost its dcp interface")
                    .buffer_acknowledgement(
                        &cookie_ref,
                        header.opaque,
                        header.vbucket,
                        ack.buffer_bytes,
                    )
            }
            Err(_) => Err(ErrorCode::Invalid),
        }
    };

    match result.map_err(|e| c.remap_error_code(e)) {
        Ok(()) => {
            // acknowledgements are not answered
            if slot == 0 {
                c.set_state(State::NewCmd);
            }
        }
        Err(code) => handle_error(c, slot, code),
    }
}

pub fn dcp_control_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    let header = *c.cookie(slot).header();

    let engine = match dcp_engine(c, slot) {
        Some(engine) => engine,
        None => return,
    };

    let ret = take_aiostat(c, slot);

    let result = if let Err(code) = ret {
        Err(code)
    } else {
        let cookie_ref = CookieRef {
            id: c.cookie_id(slot),
            notify: &ctx.notify,
        };
        let packet = c.packet(slot);
        let body = &packet[HEADER_LEN..];
        let key = &body[0..header.keylen as usize];
        let value = &body[header.keylen as usize..];
        engine
            .dcp()
            .expect("engine lost its dcp interface")
            .control(&cookie_ref, key, value)
    };

    match result.map_err(|e| c.remap_error_code(e)) {
        Ok(()) => c.send_status(slot, Status::Success),
        Err(code) => handle_error(c, slot, code),
    }
}

// ----------------------------------------------------------------------
// producer side

/// Implements the engine's message sink on a connection: each message
/// reserves the item, frames header and extras into the write pipe, and
/// points io-vector entries at the item's key and value.
struct DcpProducerSink<'a> {
    c: &'a mut Connection,
    engine: &'a Arc<dyn Engine>,
}

impl<'a> DcpProducerSink<'a> {
    fn item_message(
        &mut self,
        opcode: Opcode,
        item: ItemHandle,
        opaque: u32,
        vbucket: u16,
        extras: &[u8],
        meta: &[u8],
        collection_len: u8,
    ) -> EngineResult<()> {
        if collection_len != 0 && !self.c.is_dcp_collection_aware() {
            self.engine.item_release(item);
            metrics::increment_counter!(&Stat::DcpStepEx);
            return Err(ErrorCode::Failed);
        }

        let info = match self.engine.get_item_info(&item) {
            Some(info) => info,
            None => {
                warn!("{}: failed to get item info for dcp message", self.c.id());
                self.engine.item_release(item);
                metrics::increment_counter!(&Stat::DcpStepEx);
                return Err(ErrorCode::Failed);
            }
        };

        // the item is kept alive until transmit completes
        self.c.reserve_item(item);

        // mutations carry the document body unless the channel asked for no
        // values; deletions still carry the extended-attribute section when
        // the item has one
        let include_value = match opcode {
            Opcode::DcpMutation => !self.c.is_dcp_no_value(),
            Opcode::DcpDeletion => true,
            _ => false,
        } && !info.value.is_empty();
        let value_len = if include_value { info.value.len() } else { 0 };

        let header = RequestHeader {
            magic: Magic::ClientRequest,
            opcode: opcode as u8,
            keylen: info.key.len() as u16,
            extlen: extras.len() as u8,
            datatype: info.datatype,
            vbucket,
            bodylen: (extras.len() + info.key.len() + value_len + meta.len()) as u32,
            opaque,
            cas: info.cas,
        };
        let mut composed = [0u8; HEADER_LEN];
        header.compose(&mut &mut composed[..]);

        self.c.add_msg_hdr(false);
        self.c.put_iov(&composed);
        self.c.put_iov(extras);
        self.c.put_bytes_iov(info.key.clone());
        if include_value {
            self.c.put_bytes_iov(info.value.clone());
        }
        if !meta.is_empty() {
            self.c.put_iov(meta);
        }

        metrics::increment_counter!(&Stat::DcpMessageSent);
        Ok(())
    }
}

impl<'a> DcpMessageProducers for DcpProducerSink<'a> {
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
    ) -> EngineResult<()> {
        let collection_aware = self.c.is_dcp_collection_aware();
        let body = DcpMutation {
            by_seqno,
            rev_seqno,
            flags: 0,
            expiration: 0,
            lock_time,
            nmeta: meta.len() as u16,
            nru,
            collection_len,
        };
        let mut extras = Vec::with_capacity(DcpMutation::extlen(collection_aware) as usize);
        body.compose_extras(&mut extras, collection_aware);
        self.item_message(
            Opcode::DcpMutation,
            item,
            opaque,
            vbucket,
            &extras,
            meta,
            collection_len,
        )
    }

    fn deletion(
        &mut self,
        opaque: u32,
        item: ItemHandle,
        vbucket: u16,
        by_seqno: u64,
        rev_seqno: u64,
        meta: &[u8],
        collection_len: u8,
    ) -> EngineResult<()> {
        let collection_aware = self.c.is_dcp_collection_aware();
        let body = DcpDeletion {
            by_seqno,
            rev_seqno,
            nmeta: meta.len() as u16,
            collection_len,
        };
        let mut extras = Vec::with_capacity(DcpDeletion::extlen(collection_aware) as usize);
        body.compose_extras(&mut extras, collection_aware);
        self.item_message(
            Opcode::DcpDeletion,
            item,
            opaque,
            vbucket,
            &extras,
            meta,
            collection_len,
        )
    }

    fn expiration(
        &mut self,
        opaque: u32,
        item: ItemHandle,
        vbucket: u16,
        by_seqno: u64,
        rev_seqno: u64,
        meta: &[u8],
        collection_len: u8,
    ) -> EngineResult<()> {
        let collection_aware = self.c.is_dcp_collection_aware();
        let body = DcpDeletion {
            by_seqno,
            rev_seqno,
            nmeta: meta.len() as u16,
            collection_len,
        };
        let mut extras = Vec::with_capacity(DcpDeletion::extlen(collection_aware) as usize);
        body.compose_extras(&mut extras, collection_aware);
        self.item_message(
            Opcode::DcpExpiration,
            item,
            opaque,
            vbucket,
            &extras,
            meta,
            collection_len,
        )
    }

    fn stream_end(&mut self, opaque: u32, vbucket: u16, flags: u32) -> EngineResult<()> {
        let body = DcpStreamEnd { flags };
        let mut extras = Vec::with_capacity(DcpStreamEnd::EXTLEN as usize);
        body.compose_extras(&mut extras);

        let header = RequestHeader {
            magic: Magic::ClientRequest,
            opcode: Opcode::DcpStreamEnd as u8,
            keylen: 0,
            extlen: extras.len() as u8,
            datatype: 0,
            vbucket,
            bodylen: extras.len() as u32,
            opaque,
            cas: 0,
        };
        let mut composed = [0u8; HEADER_LEN];
        header.compose(&mut &mut composed[..]);

        self.c.add_msg_hdr(false);
        self.c.put_iov(&composed);
        self.c.put_iov(&extras);

        metrics::increment_counter!(&Stat::DcpMessageSent);
        Ok(())
    }
}

/// Pull the next batch of messages out of the engine and stage them for
/// transmission. Runs from the ship state on write readiness.
pub fn ship_dcp_log(c: &mut Connection, ctx: &mut WorkerCtx) {
    let engine = match c.bucket_engine() {
        Some(engine) => engine.clone(),
        None => {
            c.set_state(State::Closing);
            return;
        }
    };

    let result = {
        let cookie_ref = CookieRef {
            id: c.cookie_id(0),
            notify: &ctx.notify,
        };
        let mut sink = DcpProducerSink {
            c: &mut *c,
            engine: &engine,
        };
        match engine.dcp() {
            Some(dcp) => dcp.step(&cookie_ref, &mut sink),
            None => Err(ErrorCode::NotSupported),
        }
    };

    let staged = c.has_pending_output();
    if staged {
        c.set_write_and_go(State::ShipLog);
        c.set_state(State::SendData);
    }

    match result {
        Ok(DcpStep::Continue) => {}
        Ok(DcpStep::Idle) => {
            if !staged {
                // nothing to ship; wait for the engine to produce more
                c.cookie_mut(0).set_ewouldblock(true);
            }
        }
        Err(ErrorCode::WouldBlock) => {
            c.cookie_mut(0).set_ewouldblock(true);
        }
        Err(code) => {
            warn!(
                "{}: dcp step failed ({:?}), closing connection",
                c.id(),
                code
            );
            metrics::increment_counter!(&Stat::DcpStepEx);
            c.set_state(State::Closing);
        }
    }
}
