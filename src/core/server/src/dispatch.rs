// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Command dispatch: a 256-wide opcode-indexed table of executors. Each
//! executor consumes the cookie in the given slot and produces exactly one
//! of: a response staged into the send path, a state transition, or an
//! EWOULDBLOCK park. An executor always reads the cookie's async status
//! first so that an engine wakeup short-circuits re-invocation.

use crate::connection::{Connection, ResponseValue};
use crate::cookie::{CommandContext, FlushState};
use crate::rbac::{Privilege, PrivilegeAccess, PrivilegeContext};
use crate::statemachine::State;
use crate::worker::WorkerCtx;

use engine::{CookieRef, DocKey, EngineResult, ErrorCode, StoreOperation};
use metrics::Stat;
use protocol_mcbp::*;

use std::sync::OnceLock;

pub type Executor = fn(&mut Connection, &mut WorkerCtx, usize);

fn table() -> &'static [Executor; 256] {
    static TABLE: OnceLock<[Executor; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: [Executor; 256] = [unknown_command_executor; 256];

        table[Opcode::Get as usize] = get_executor;
        table[Opcode::GetQ as usize] = get_executor;
        table[Opcode::GetK as usize] = get_executor;
        table[Opcode::GetKQ as usize] = get_executor;
        table[Opcode::Set as usize] = store_executor;
        table[Opcode::SetQ as usize] = store_executor;
        table[Opcode::Add as usize] = store_executor;
        table[Opcode::AddQ as usize] = store_executor;
        table[Opcode::Replace as usize] = store_executor;
        table[Opcode::ReplaceQ as usize] = store_executor;
        table[Opcode::Append as usize] = store_executor;
        table[Opcode::Prepend as usize] = store_executor;
        table[Opcode::Delete as usize] = delete_executor;
        table[Opcode::DeleteQ as usize] = delete_executor;
        table[Opcode::Increment as usize] = not_supported_executor;
        table[Opcode::Decrement as usize] = not_supported_executor;
        table[Opcode::Quit as usize] = quit_executor;
        table[Opcode::Flush as usize] = flush_executor;
        table[Opcode::Noop as usize] = noop_executor;
        table[Opcode::Version as usize] = version_executor;
        table[Opcode::Stat as usize] = stat_executor;
        table[Opcode::Verbosity as usize] = verbosity_executor;
        table[Opcode::Hello as usize] = hello_executor;
        table[Opcode::SaslListMechs as usize] = sasl_list_mechs_executor;
        table[Opcode::SaslAuth as usize] = sasl_auth_executor;
        table[Opcode::SaslStep as usize] = sasl_step_executor;
        table[Opcode::SelectBucket as usize] = select_bucket_executor;
        table[Opcode::GetLocked as usize] = get_locked_executor;
        table[Opcode::UnlockKey as usize] = unlock_executor;

        table[Opcode::DcpOpen as usize] = crate::dcp::dcp_open_executor;
        table[Opcode::DcpAddStream as usize] = not_supported_executor;
        table[Opcode::DcpCloseStream as usize] = not_supported_executor;
        table[Opcode::DcpStreamReq as usize] = not_supported_executor;
        table[Opcode::DcpGetFailoverLog as usize] = crate::dcp::dcp_get_failover_log_executor;
        table[Opcode::DcpStreamEnd as usize] = crate::dcp::dcp_stream_end_executor;
        table[Opcode::DcpSnapshotMarker as usize] = crate::dcp::dcp_snapshot_marker_executor;
        table[Opcode::DcpMutation as usize] = crate::dcp::dcp_mutation_executor;
        table[Opcode::DcpDeletion as usize] = crate::dcp::dcp_deletion_executor;
        table[Opcode::DcpExpiration as usize] = crate::dcp::dcp_expiration_executor;
        table[Opcode::DcpNoop as usize] = noop_executor;
        table[Opcode::DcpBufferAcknowledgement as usize] =
            crate::dcp::dcp_buffer_acknowledgement_executor;
        table[Opcode::DcpControl as usize] = crate::dcp::dcp_control_executor;

        table
    })
}

/// Dispatch the fully received request bound to `slot`.
pub fn execute_packet(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    metrics::increment_counter!(&Stat::ProcessReq);
    let opcode = c.cookie(slot).header().opcode;
    if c.is_trace_enabled() {
        debug!("{}> 0x{:02x}", c.id(), opcode);
    }
    table()[opcode as usize](c, ctx, slot);
}

/// Read and reset the async status delivered by an engine wakeup.
pub(crate) fn take_aiostat(c: &mut Connection, slot: usize) -> EngineResult<()> {
    let status = c.cookie(slot).aiostat();
    let cookie = c.cookie_mut(slot);
    cookie.set_aiostat(Ok(()));
    cookie.set_ewouldblock(false);
    status
}

/// Probe the connection's privilege context, refreshing it once when the
/// authentication configuration changed underneath it.
pub(crate) fn check_privilege(
    c: &mut Connection,
    ctx: &WorkerCtx,
    privilege: Privilege,
) -> Result<(), ErrorCode> {
    match c.privilege_context().check(ctx.connections, privilege) {
        PrivilegeAccess::Ok => Ok(()),
        PrivilegeAccess::Fail => Err(ErrorCode::Eaccess),
        PrivilegeAccess::Stale => {
            let refreshed = PrivilegeContext::create(ctx.connections, c.username());
            c.set_privilege_context(refreshed);
            match c.privilege_context().check(ctx.connections, privilege) {
                PrivilegeAccess::Ok => Ok(()),
                PrivilegeAccess::Fail => Err(ErrorCode::Eaccess),
                PrivilegeAccess::Stale => Err(ErrorCode::AuthStale),
            }
        }
    }
}

/// Common error epilogue. Returns to `NewCmd` only for the inline slot;
/// detached slots never drive the state machine.
pub(crate) fn handle_error(c: &mut Connection, slot: usize, code: ErrorCode) {
    match code {
        ErrorCode::WouldBlock => {
            c.cookie_mut(slot).set_ewouldblock(true);
        }
        ErrorCode::Disconnect => {
            c.set_state(State::Closing);
        }
        other => {
            c.send_status(slot, other.into());
        }
    }
}

/// A protocol violation in the request itself: answer with the error and
/// hang up once the response is flushed. A response staged for ordered
/// drain cannot carry the hangup in `write_and_go`, so the teardown rides
/// the out-of-band event queue instead.
pub(crate) fn protocol_error(c: &mut Connection, slot: usize, context: &str) {
    c.cookie_mut(slot).set_error_context(context);
    c.send_status(slot, Status::Einval);
    if c.cookie(slot).response_ready() {
        c.enqueue_server_event(crate::event::ServerEvent::Disconnect);
    } else {
        c.set_write_and_go(State::Closing);
    }
}

/// Announced lengths of the three body sections: extras, key, value.
fn body_parts(header: &RequestHeader) -> (usize, usize, usize) {
    let extras = header.extlen as usize;
    let key = header.keylen as usize;
    let value = header.bodylen as usize - extras - key;
    (extras, key, value)
}

fn quiet(header: &RequestHeader) -> bool {
    Opcode::try_from(header.opcode)
        .map(|op| op.is_quiet())
        .unwrap_or(false)
}

// ----------------------------------------------------------------------
// data commands

fn get_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    let header = *c.cookie(slot).header();
    let (extlen, keylen, valuelen) = body_parts(&header);

    if extlen != 0 || keylen == 0 || valuelen != 0 {
        protocol_error(c, slot, "get must have a key and nothing else");
        return;
    }

    let engine = match c.bucket_engine() {
        Some(engine) => engine.clone(),
        None => {
            handle_error(c, slot, c.remap_error_code(ErrorCode::NoBucket));
            return;
        }
    };

    let mut ret = take_aiostat(c, slot);
    if ret.is_ok() {
        ret = check_privilege(c, ctx, Privilege::Read);
    }

    let result = if let Err(code) = ret {
        Err(code)
    } else {
        let namespace = c.doc_namespace();
        let cookie_ref = CookieRef {
            id: c.cookie_id(slot),
            notify: &ctx.notify,
        };
        let packet = c.packet(slot);
        let key = &packet[HEADER_LEN + extlen..HEADER_LEN + extlen + keylen];
        engine.get(&cookie_ref, &DocKey::new(namespace, key), header.vbucket)
    };

    match result.map_err(|e| c.remap_error_code(e)) {
        Ok(item) => {
            let info = match engine.get_item_info(&item) {
                Some(info) => info,
                None => {
                    engine.item_release(item);
                    c.cookie_mut(slot).set_error_context("failed to get item info");
                    c.send_status(slot, Status::Einternal);
                    return;
                }
            };
            c.reserve_item(item);
            c.cookie_mut(slot).set_cas(info.cas);

            let opcode = Opcode::try_from(header.opcode).unwrap();
            let extras = info.flags.to_be_bytes();
            let key_echo = matches!(opcode, Opcode::GetK | Opcode::GetKQ);
            let datatype = Datatype::new(info.datatype & 0x07).unwrap_or(Datatype::RAW);
            let key = if key_echo { info.key.clone() } else { bytes::Bytes::new() };
            c.send_response(
                slot,
                Status::Success,
                &extras,
                &key,
                ResponseValue::Bytes(info.value),
                datatype,
            );
        }
        Err(ErrorCode::KeyNotFound) if quiet(&header) => {
            // quiet get swallows the miss
            c.suppress_response(slot);
            if slot == 0 {
                c.set_state(State::NewCmd);
            }
        }
        Err(code) => handle_error(c, slot, code),
    }
}

fn store_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    let header = *c.cookie(slot).header();
    let opcode = Opcode::try_from(header.opcode).unwrap();
    let (extlen, keylen, _valuelen) = body_parts(&header);

    let (operation, expected_extlen) = match opcode {
        Opcode::Set | Opcode::SetQ => (StoreOperation::Set, 8),
        Opcode::Add | Opcode::AddQ => (StoreOperation::Add, 8),
        Opcode::Replace | Opcode::ReplaceQ => (StoreOperation::Replace, 8),
        Opcode::Append => (StoreOperation::Append, 0),
        Opcode::Prepend => (StoreOperation::Prepend, 0),
        _ => unreachable!("store_executor bound to non-store opcode"),
    };

    if extlen != expected_extlen || keylen == 0 {
        protocol_error(c, slot, "invalid store request layout");
        return;
    }

    if Datatype::new(header.datatype).is_err() {
        protocol_error(c, slot, "invalid datatype bits");
        return;
    }

    let engine = match c.bucket_engine() {
        Some(engine) => engine.clone(),
        None => {
            handle_error(c, slot, c.remap_error_code(ErrorCode::NoBucket));
            return;
        }
    };

    let mut ret = take_aiostat(c, slot);
    if ret.is_ok() {
        ret = check_privilege(c, ctx, Privilege::Upsert);
    }

    let result = if let Err(code) = ret {
        Err(code)
    } else {
        let namespace = c.doc_namespace();
        let cookie_ref = CookieRef {
            id: c.cookie_id(slot),
            notify: &ctx.notify,
        };
        let packet = c.packet(slot);
        let body = &packet[HEADER_LEN..];
        let key = &body[extlen..extlen + keylen];
        let value = &body[extlen + keylen..];
        let (flags, exptime) = if expected_extlen == 8 {
            (
                u32::from_be_bytes(body[0..4].try_into().unwrap()),
                u32::from_be_bytes(body[4..8].try_into().unwrap()),
            )
        } else {
            (0, 0)
        };
        engine.store(
            &cookie_ref,
            operation,
            &DocKey::new(namespace, key),
            value,
            flags,
            exptime,
            header.datatype,
            header.cas,
            header.vbucket,
        )
    };

    match result.map_err(|e| c.remap_error_code(e)) {
        Ok(descr) => {
            c.cookie_mut(slot).set_cas(descr.cas);
            if quiet(&header) {
                c.suppress_response(slot);
                if slot == 0 {
                    c.set_state(State::NewCmd);
                }
                return;
            }
            if c.supports_mutation_extras() {
                let mut extras = [0u8; 16];
                extras[0..8].copy_from_slice(&descr.vbucket_uuid.to_be_bytes());
                extras[8..16].copy_from_slice(&descr.seqno.to_be_bytes());
                c.send_response(
                    slot,
                    Status::Success,
                    &extras,
                    &[],
                    ResponseValue::None,
                    Datatype::RAW,
                );
            } else {
                c.send_status(slot, Status::Success);
            }
        }
        Err(code) => handle_error(c, slot, code),
    }
}

fn delete_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    let header = *c.cookie(slot).header();
    let (extlen, keylen, valuelen) = body_parts(&header);

    if extlen != 0 || keylen == 0 || valuelen != 0 {
        protocol_error(c, slot, "delete must have a key and nothing else");
        return;
    }

    let engine = match c.bucket_engine() {
        Some(engine) => engine.clone(),
        None => {
            handle_error(c, slot, c.remap_error_code(ErrorCode::NoBucket));
            return;
        }
    };

    let mut ret = take_aiostat(c, slot);
    if ret.is_ok() {
        ret = check_privilege(c, ctx, Privilege::Delete);
    }

    let result = if let Err(code) = ret {
        Err(code)
    } else {
        let namespace = c.doc_namespace();
        let cookie_ref = CookieRef {
            id: c.cookie_id(slot),
            notify: &ctx.notify,
        };
        let packet = c.packet(slot);
        let key = &packet[HEADER_LEN..HEADER_LEN + keylen];
        engine.remove(
            &cookie_ref,
            &DocKey::new(namespace, key),
            header.vbucket,
            header.cas,
        )
    };

    match result.map_err(|e| c.remap_error_code(e)) {
        Ok(descr) => {
            if quiet(&header) {
                c.suppress_response(slot);
                if slot == 0 {
                    c.set_state(State::NewCmd);
                }
                return;
            }
            if c.supports_mutation_extras() {
                let mut extras = [0u8; 16];
                extras[0..8].copy_from_slice(&descr.vbucket_uuid.to_be_bytes());
                extras[8..16].copy_from_slice(&descr.seqno.to_be_bytes());
                c.send_response(
                    slot,
                    Status::Success,
                    &extras,
                    &[],
                    ResponseValue::None,
                    Datatype::RAW,
                );
            } else {
                c.send_status(slot, Status::Success);
            }
        }
        Err(code) => handle_error(c, slot, code),
    }
}

fn get_locked_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    let header = *c.cookie(slot).header();
    let (extlen, keylen, valuelen) = body_parts(&header);

    // extras optionally carry the lock timeout
    if (extlen != 0 && extlen != 4) || keylen == 0 || valuelen != 0 {
        protocol_error(c, slot, "invalid lock request layout");
        return;
    }

    let engine = match c.bucket_engine() {
        Some(engine) => engine.clone(),
        None => {
            handle_error(c, slot, c.remap_error_code(ErrorCode::NoBucket));
            return;
        }
    };

    let mut ret = take_aiostat(c, slot);
    if ret.is_ok() {
        ret = check_privilege(c, ctx, Privilege::Read);
    }

    let result = if let Err(code) = ret {
        Err(code)
    } else {
        let namespace = c.doc_namespace();
        let cookie_ref = CookieRef {
            id: c.cookie_id(slot),
            notify: &ctx.notify,
        };
        let packet = c.packet(slot);
        let body = &packet[HEADER_LEN..];
        let lock_timeout = if extlen == 4 {
            u32::from_be_bytes(body[0..4].try_into().unwrap())
        } else {
            0
        };
        let key = &body[extlen..extlen + keylen];
        engine.get_locked(
            &cookie_ref,
            &DocKey::new(namespace, key),
            header.vbucket,
            lock_timeout,
        )
    };

    match result.map_err(|e| c.remap_error_code(e)) {
        Ok(item) => {
            let info = match engine.get_item_info(&item) {
                Some(info) => info,
                None => {
                    engine.item_release(item);
                    c.cookie_mut(slot).set_error_context("failed to get item info");
                    c.send_status(slot, Status::Einternal);
                    return;
                }
            };
            c.reserve_item(item);
            c.cookie_mut(slot).set_cas(info.cas);
            let extras = info.flags.to_be_bytes();
            let datatype = Datatype::new(info.datatype & 0x07).unwrap_or(Datatype::RAW);
            c.send_response(
                slot,
                Status::Success,
                &extras,
                &[],
                ResponseValue::Bytes(info.value),
                datatype,
            );
        }
        Err(code) => handle_error(c, slot, code),
    }
}

fn unlock_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    let header = *c.cookie(slot).header();
    let (extlen, keylen, valuelen) = body_parts(&header);

    if extlen != 0 || keylen == 0 || valuelen != 0 || header.cas == 0 {
        protocol_error(c, slot, "unlock requires a key and a cas");
        return;
    }

    let engine = match c.bucket_engine() {
        Some(engine) => engine.clone(),
        None => {
            handle_error(c, slot, c.remap_error_code(ErrorCode::NoBucket));
            return;
        }
    };

    let mut ret = take_aiostat(c, slot);
    if ret.is_ok() {
        ret = check_privilege(c, ctx, Privilege::Upsert);
    }

    let result = if let Err(code) = ret {
        Err(code)
    } else {
        let namespace = c.doc_namespace();
        let cookie_ref = CookieRef {
            id: c.cookie_id(slot),
            notify: &ctx.notify,
        };
        let packet = c.packet(slot);
        let key = &packet[HEADER_LEN..HEADER_LEN + keylen];
        engine.unlock(
            &cookie_ref,
            &DocKey::new(namespace, key),
            header.vbucket,
            header.cas,
        )
    };

    match result.map_err(|e| c.remap_error_code(e)) {
        Ok(()) => c.send_status(slot, Status::Success),
        Err(code) => handle_error(c, slot, code),
    }
}

fn flush_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    let engine = match c.bucket_engine() {
        Some(engine) => engine.clone(),
        None => {
            handle_error(c, slot, c.remap_error_code(ErrorCode::NoBucket));
            return;
        }
    };

    let mut ret = take_aiostat(c, slot);
    if ret.is_ok() {
        ret = check_privilege(c, ctx, Privilege::BucketManagement);
    }

    // multi-step command: the first pass asks the engine to flush, a wakeup
    // replay finds the context recorded on the cookie and finishes up
    let result = match (ret, c.cookie(slot).context()) {
        (Err(code), _) => Err(code),
        (Ok(()), None) => {
            c.cookie_mut(slot)
                .set_context(Some(CommandContext::Flush(FlushState::Flushing)));
            let cookie_ref = CookieRef {
                id: c.cookie_id(slot),
                notify: &ctx.notify,
            };
            engine.flush(&cookie_ref)
        }
        (Ok(()), Some(CommandContext::Flush(_))) => Ok(()),
    };

    match result.map_err(|e| c.remap_error_code(e)) {
        Ok(()) => {
            c.cookie_mut(slot)
                .set_context(Some(CommandContext::Flush(FlushState::Done)));
            info!("{}: flushed bucket {}", c.id(), c.bucket_index());
            c.send_status(slot, Status::Success);
        }
        Err(code) => handle_error(c, slot, code),
    }
}

// ----------------------------------------------------------------------
// connection management commands

fn noop_executor(c: &mut Connection, _ctx: &mut WorkerCtx, slot: usize) {
    let _ = take_aiostat(c, slot);
    c.send_status(slot, Status::Success);
}

fn version_executor(c: &mut Connection, _ctx: &mut WorkerCtx, slot: usize) {
    let _ = take_aiostat(c, slot);
    c.send_response(
        slot,
        Status::Success,
        &[],
        &[],
        ResponseValue::Slice(env!("CARGO_PKG_VERSION").as_bytes()),
        Datatype::RAW,
    );
}

fn quit_executor(c: &mut Connection, _ctx: &mut WorkerCtx, slot: usize) {
    let _ = take_aiostat(c, slot);
    c.send_status(slot, Status::Success);
    c.set_write_and_go(State::Closing);
}

fn verbosity_executor(c: &mut Connection, _ctx: &mut WorkerCtx, slot: usize) {
    let header = *c.cookie(slot).header();
    let _ = take_aiostat(c, slot);
    if header.extlen != 4 {
        protocol_error(c, slot, "verbosity requires a level");
        return;
    }
    c.send_status(slot, Status::Success);
}

fn not_supported_executor(c: &mut Connection, _ctx: &mut WorkerCtx, slot: usize) {
    let _ = take_aiostat(c, slot);
    c.send_status(slot, Status::NotSupported);
}

fn hello_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    let header = *c.cookie(slot).header();
    let (extlen, keylen, valuelen) = body_parts(&header);
    let _ = take_aiostat(c, slot);

    if extlen != 0 || valuelen % 2 != 0 {
        protocol_error(c, slot, "invalid hello request layout");
        return;
    }

    let (agent, requested) = {
        let packet = c.packet(slot);
        let body = &packet[HEADER_LEN..];
        let agent = body[0..keylen].to_vec();
        let mut requested = Vec::with_capacity(valuelen / 2);
        let features = &body[keylen..];
        for pair in features.chunks_exact(2) {
            requested.push(u16::from_be_bytes([pair[0], pair[1]]));
        }
        (agent, requested)
    };

    // the agent field may carry "name/connection-id"
    if !agent.is_empty() {
        let mut split = agent.splitn(2, |b| *b == b'/');
        if let Some(name) = split.next() {
            c.set_agent_name(name);
        }
        if let Some(id) = split.next() {
            c.set_connection_id(id);
        }
        ctx.connections.set_agent(c.id(), c.agent_name());
    }

    let mut enabled = Vec::new();
    for feature in requested {
        let feature = match Feature::try_from(feature) {
            Ok(feature) => feature,
            Err(()) => continue,
        };

        match feature {
            Feature::Datatype | Feature::Json => {
                c.enable_datatype(Feature::Json);
                enabled.push(Feature::Json as u16);
            }
            Feature::Snappy => {
                c.enable_datatype(Feature::Snappy);
                enabled.push(Feature::Snappy as u16);
            }
            Feature::Xattr => {
                c.enable_datatype(Feature::Xattr);
                enabled.push(Feature::Xattr as u16);
            }
            Feature::Xerror => {
                c.set_xerror_support(true);
                enabled.push(Feature::Xerror as u16);
            }
            Feature::Collections => {
                c.set_collections_supported(true);
                enabled.push(Feature::Collections as u16);
            }
            Feature::Duplex => {
                c.set_duplex_supported(true);
                enabled.push(Feature::Duplex as u16);
            }
            Feature::ClustermapChangeNotification => {
                c.set_clustermap_notification_supported(true);
                enabled.push(Feature::ClustermapChangeNotification as u16);
            }
            Feature::MutationSeqno => {
                c.set_supports_mutation_extras(true);
                enabled.push(Feature::MutationSeqno as u16);
            }
            Feature::UnorderedExecution => {
                // a change feed's ordering guarantees preclude this
                if !c.is_dcp() {
                    c.set_allow_unordered_execution(true);
                    enabled.push(Feature::UnorderedExecution as u16);
                }
            }
            Feature::Tracing => {
                c.set_tracing_negotiated(true);
                enabled.push(Feature::Tracing as u16);
            }
            Feature::SelectBucket => {
                enabled.push(Feature::SelectBucket as u16);
            }
            Feature::TcpNoDelay | Feature::TcpDelay | Feature::Tls => {
                // transport tuning is accepted but not echoed
            }
        }
    }

    let mut value = Vec::with_capacity(enabled.len() * 2);
    for feature in enabled {
        value.extend_from_slice(&feature.to_be_bytes());
    }

    c.send_response(
        slot,
        Status::Success,
        &[],
        &[],
        ResponseValue::Slice(&value),
        Datatype::RAW,
    );
}

fn select_bucket_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    let header = *c.cookie(slot).header();
    let (extlen, keylen, valuelen) = body_parts(&header);
    let _ = take_aiostat(c, slot);

    if extlen != 0 || keylen == 0 || valuelen != 0 {
        protocol_error(c, slot, "select bucket requires a bucket name");
        return;
    }

    let selected = {
        let packet = c.packet(slot);
        let name = &packet[HEADER_LEN..HEADER_LEN + keylen];
        ctx.buckets
            .iter()
            .position(|bucket| bucket.name().as_bytes() == name)
    };

    match selected {
        Some(index) => {
            let engine = ctx.buckets[index].engine().clone();
            c.set_bucket(index, engine);
            ctx.connections.set_bucket(c.id(), index);
            c.send_status(slot, Status::Success);
        }
        None => {
            c.cookie_mut(slot).set_error_context("no such bucket");
            c.send_status(slot, Status::KeyEnoent);
        }
    }
}

fn stat_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    let header = *c.cookie(slot).header();
    let _ = take_aiostat(c, slot);

    if let Err(code) = check_privilege(c, ctx, Privilege::Stats) {
        handle_error(c, slot, c.remap_error_code(code));
        return;
    }

    // one response frame per stat, then an empty terminator frame
    let mut stats = metrics::snapshot();
    stats.push(("curr_connections", ctx.connections.len() as u64));
    let mut frames = Vec::new();
    for (name, value) in stats {
        let value = value.to_string();
        let stat_header = ResponseHeader {
            magic: Magic::ClientResponse,
            opcode: header.opcode,
            keylen: name.len() as u16,
            extlen: 0,
            datatype: 0,
            status: Status::Success,
            bodylen: (name.len() + value.len()) as u32,
            opaque: header.opaque,
            cas: 0,
        };
        stat_header.compose(&mut frames);
        frames.extend_from_slice(name.as_bytes());
        frames.extend_from_slice(value.as_bytes());
    }
    let terminator = ResponseHeader {
        magic: Magic::ClientResponse,
        opcode: header.opcode,
        keylen: 0,
        extlen: 0,
        datatype: 0,
        status: Status::Success,
        bodylen: 0,
        opaque: header.opaque,
        cas: 0,
    };
    terminator.compose(&mut frames);

    c.cookie_mut(slot).dynamic_buffer().extend_from_slice(&frames);
    c.send_dynamic_buffer(slot);
}

// ----------------------------------------------------------------------
// authentication hooks

fn sasl_list_mechs_executor(c: &mut Connection, _ctx: &mut WorkerCtx, slot: usize) {
    let _ = take_aiostat(c, slot);
    c.send_response(
        slot,
        Status::Success,
        &[],
        &[],
        ResponseValue::Slice(b"PLAIN"),
        Datatype::RAW,
    );
}

fn sasl_auth_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    let header = *c.cookie(slot).header();
    let (extlen, keylen, _valuelen) = body_parts(&header);
    let _ = take_aiostat(c, slot);

    if extlen != 0 || keylen == 0 {
        protocol_error(c, slot, "invalid sasl auth request layout");
        return;
    }

    let username = {
        let packet = c.packet(slot);
        let body = &packet[HEADER_LEN..];
        let mech = &body[0..keylen];
        if mech != b"PLAIN" {
            None
        } else {
            // PLAIN payload: authzid NUL authcid NUL passwd
            let value = &body[keylen..];
            let mut fields = value.split(|b| *b == 0);
            let _authzid = fields.next();
            fields.next().map(|authcid| authcid.to_vec())
        }
    };

    match username {
        Some(username) => {
            let username = String::from_utf8_lossy(&username).to_string();
            let context = PrivilegeContext::create(ctx.connections, &username);
            c.set_authenticated(true, &username, context);
            info!("{}: authenticated as {}", c.id(), username);
            c.send_status(slot, Status::Success);
        }
        None => {
            c.cookie_mut(slot).set_error_context("authentication failed");
            c.send_status(slot, Status::AuthError);
        }
    }
}

fn sasl_step_executor(c: &mut Connection, _ctx: &mut WorkerCtx, slot: usize) {
    let _ = take_aiostat(c, slot);
    // the only supported mechanism completes in a single round
    c.send_status(slot, Status::AuthError);
}

// ----------------------------------------------------------------------
// everything else goes to the engine

fn unknown_command_executor(c: &mut Connection, ctx: &mut WorkerCtx, slot: usize) {
    let header = *c.cookie(slot).header();

    let engine = match c.bucket_engine() {
        Some(engine) => engine.clone(),
        None => {
            handle_error(c, slot, c.remap_error_code(ErrorCode::NoBucket));
            return;
        }
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
        engine.unknown_command(&cookie_ref, &header, body)
    };

    match result.map_err(|e| c.remap_error_code(e)) {
        Ok(value) => {
            c.send_response(
                slot,
                Status::Success,
                &[],
                &[],
                ResponseValue::Bytes(value),
                Datatype::RAW,
            );
        }
        Err(code) => handle_error(c, slot, code),
    }
}
