// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The per-connection state machine. Each state is a function returning
//! `true` when the worker should immediately re-enter the machine (the
//! state changed or more work is pending) and `false` when the connection
//! should yield back to the reactor and wait for an event.

use crate::connection::{Connection, TransmitResult, TryReadResult};
use crate::dispatch;
use crate::event::ServerEvent;
use crate::worker::WorkerCtx;

use metrics::Stat;
use protocol_mcbp::{FrameError, Magic, RequestHeader, Status, HEADER_LEN};

use ::net::Interest;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// Entry point for each new command.
    NewCmd,
    /// Registered for readability, no data buffered.
    Waiting,
    /// Reading until a full header is buffered.
    ReadHeader,
    /// Header buffered: validate and decide how to proceed.
    ParseCmd,
    /// Reading the remainder of the frame.
    ReadBody,
    /// Full frame buffered: dispatch to the executor.
    Execute,
    /// Flushing the message list.
    SendData,
    /// Change-feed steady state: full duplex.
    ShipLog,
    /// Begin teardown: unregister and close the socket.
    Closing,
    /// Socket closed but the engine still references a command.
    PendingClose,
    /// All references released: final cleanup.
    ImmediateClose,
    /// Sentinel; the worker frees the connection.
    Destroyed,
}

/// Run the state machine for one reactor callback. Buffers are provisioned
/// up front so that every state, including out-of-band event processing,
/// can rely on the pipes being present.
pub fn run_event_loop(c: &mut Connection, ctx: &mut WorkerCtx, readable: bool, writable: bool) {
    c.set_current_event(readable, writable);
    c.reset_num_events();

    if !matches!(
        c.state(),
        State::Closing | State::PendingClose | State::ImmediateClose | State::Destroyed
    ) {
        match ctx.pool.loan(&mut c.read, &mut c.write) {
            Ok((r, w)) => {
                ctx.count_loan(r, true);
                ctx.count_loan(w, false);
            }
            Err(()) => {
                warn!(
                    "{}: failed to provision network buffers, closing connection {}",
                    c.id(),
                    c.description()
                );
                c.set_state(State::Closing);
            }
        }
    }

    while drive(c, ctx) {}
}

fn drive(c: &mut Connection, ctx: &mut WorkerCtx) -> bool {
    match c.state() {
        State::NewCmd => conn_new_cmd(c, ctx),
        State::Waiting => conn_waiting(c, ctx),
        State::ReadHeader => conn_read_packet_header(c, ctx),
        State::ParseCmd => conn_parse_cmd(c, ctx),
        State::ReadBody => conn_read_packet_body(c, ctx),
        State::Execute => conn_execute(c, ctx),
        State::SendData => conn_send_data(c, ctx),
        State::ShipLog => conn_ship_log(c, ctx),
        State::Closing => conn_closing(c, ctx),
        State::PendingClose => conn_pending_close(c),
        State::ImmediateClose => conn_immediate_close(c, ctx),
        State::Destroyed => false,
    }
}

/// Drain out-of-band events. May only run between commands. Returns true if
/// an event moved the state machine, in which case the current state
/// callback must terminate immediately.
fn process_server_events(c: &mut Connection, _ctx: &mut WorkerCtx) -> bool {
    let entry_state = c.state();

    while let Some(event) = c.pop_server_event() {
        match event {
            ServerEvent::Disconnect => {
                c.set_state(State::Closing);
            }
            ServerEvent::ClustermapNotification { revision, payload } => {
                // only clients which asked for push notifications and allow
                // server-initiated traffic get the update
                if !c.is_clustermap_notification_supported() || !c.is_duplex_supported() {
                    continue;
                }
                let header = RequestHeader {
                    magic: Magic::ServerRequest,
                    opcode: 0x01,
                    keylen: 0,
                    extlen: 4,
                    datatype: 0,
                    vbucket: 0,
                    bodylen: 4 + payload.len() as u32,
                    opaque: 0,
                    cas: 0,
                };
                let mut composed = [0u8; HEADER_LEN];
                header.compose(&mut &mut composed[..]);

                c.add_msg_hdr(false);
                c.put_iov(&composed);
                c.put_iov(&revision.to_be_bytes());
                c.put_bytes_iov(payload);
                c.set_write_and_go(entry_state);
                c.set_state(State::SendData);
            }
        }

        if c.state() != entry_state {
            return true;
        }
    }

    false
}

/// Prepare the connection for its next command: reset the inline cookie,
/// shrink oversized buffers, and choose the next state from what is
/// already buffered.
fn reset_cmd_handler(c: &mut Connection, _ctx: &mut WorkerCtx) {
    c.cookie_mut(0).reset();

    c.shrink_buffers();

    if c.read_buffered() >= HEADER_LEN {
        c.set_state(State::ParseCmd);
    } else if c.is_tls() {
        // the TLS layer may hold plaintext that will never raise a
        // readiness event, so always attempt a read
        c.set_state(State::ReadHeader);
    } else {
        c.set_state(State::Waiting);
    }
}

fn conn_new_cmd(c: &mut Connection, ctx: &mut WorkerCtx) -> bool {
    // serialize any detached-command responses which became ready
    if c.drain_ordered_responses() {
        c.set_write_and_go(State::NewCmd);
        c.set_state(State::SendData);
        return true;
    }

    if process_server_events(c, ctx) {
        return true;
    }

    c.set_start(None);

    if c.write.as_ref().map(|w| !w.is_empty()).unwrap_or(false) {
        // residual response bytes between commands mean the send path lost
        // track of a buffer range; the connection cannot be trusted
        error!(
            "{}: write buffer not empty between commands, closing connection",
            c.id()
        );
        c.set_state(State::Closing);
        return true;
    }

    // when the in-flight command limit is reached, wait for completions
    // instead of parsing further commands
    if c.allow_unordered_execution() && !c.detached_capacity_left() {
        return false;
    }

    // each connection only processes a bounded number of operations per
    // timeslice so that all clients are served
    if c.decrement_num_events() >= 0 {
        reset_cmd_handler(c, ctx);
    } else {
        metrics::increment_counter!(&Stat::ConnYield);

        // with data already buffered (or a change feed to ship) there may
        // never be another read event, so ask for a write event to get
        // re-entered promptly
        if c.have_pending_input_data() || c.is_dcp() {
            if !c.update_event(ctx.registry, Interest::READABLE.add(Interest::WRITABLE)) {
                warn!(
                    "{}: unable to update event settings, closing connection",
                    c.id()
                );
                c.set_state(State::Closing);
                return true;
            }
        }
        return false;
    }

    true
}

fn conn_waiting(c: &mut Connection, ctx: &mut WorkerCtx) -> bool {
    if process_server_events(c, ctx) {
        return true;
    }

    if !c.update_event(ctx.registry, Interest::READABLE) {
        warn!(
            "{}: unable to update event settings, closing connection",
            c.id()
        );
        c.set_state(State::Closing);
        return true;
    }
    c.set_state(State::ReadHeader);

    // with edge-triggered readiness an unconsumed read event must be acted
    // on now; it will not be delivered again
    c.is_read_event()
}

fn conn_read_packet_header(c: &mut Connection, ctx: &mut WorkerCtx) -> bool {
    if process_server_events(c, ctx) {
        return true;
    }

    match c.try_read_network() {
        TryReadResult::NoDataReceived => {
            c.set_state(State::Waiting);
        }
        TryReadResult::DataReceived => {
            if c.read_buffered() >= HEADER_LEN {
                c.set_state(State::ParseCmd);
            } else {
                c.set_state(State::Waiting);
            }
        }
        TryReadResult::SocketClosed | TryReadResult::SocketError => {
            c.set_state(State::Closing);
        }
        TryReadResult::MemoryError => {
            c.set_state(State::Closing);
        }
    }

    true
}

/// Validate the buffered header and decide whether the body is already
/// present or more reads are required.
fn try_read_command(c: &mut Connection, _ctx: &mut WorkerCtx) {
    let rdata_len = c.read_buffered();
    let header = {
        let read = c.read.as_ref().expect("read pipe missing");
        RequestHeader::parse(read.rdata())
    };

    match header {
        Err(FrameError::Incomplete) => {
            c.set_state(State::ReadHeader);
        }
        Err(FrameError::InvalidMagic) => {
            // nothing about the framing can be trusted, not even enough to
            // form an error response
            warn!("{}: invalid magic, closing connection", c.id());
            c.set_state(State::Closing);
        }
        Err(FrameError::InvalidLength) => {
            // the magic was valid, so echo opcode and opaque back with the
            // protocol error before hanging up
            let (opcode, opaque) = {
                let read = c.read.as_ref().expect("read pipe missing");
                let raw = read.rdata();
                (
                    raw[1],
                    u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]),
                )
            };
            let synthesized = RequestHeader {
                magic: Magic::ClientRequest,
                opcode,
                keylen: 0,
                extlen: 0,
                datatype: 0,
                vbucket: 0,
                bodylen: 0,
                opaque,
                cas: 0,
            };
            let seq = c.next_arrival_seq();
            c.cookie_mut(0).bind(synthesized, seq);
            c.cookie_mut(0).set_error_context("invalid packet length");
            c.send_status(0, Status::Einval);
            c.set_write_and_go(State::Closing);
        }
        Ok(header) => {
            let total = header.total_len();
            if rdata_len < total {
                let read = c.read.as_mut().expect("read pipe missing");
                read.reserve(total - rdata_len);
                c.set_state(State::ReadBody);
            } else {
                c.set_state(State::Execute);
            }
        }
    }
}

fn conn_parse_cmd(c: &mut Connection, ctx: &mut WorkerCtx) -> bool {
    try_read_command(c, ctx);
    !c.cookie(0).is_ewouldblock()
}

fn conn_read_packet_body(c: &mut Connection, ctx: &mut WorkerCtx) -> bool {
    if c.is_packet_available() {
        panic!("conn_read_packet_body: called with the complete packet available");
    }

    match c.try_read_network() {
        TryReadResult::DataReceived => {
            if c.is_packet_available() {
                c.set_state(State::Execute);
            }
            true
        }
        TryReadResult::NoDataReceived => {
            if !c.update_event(ctx.registry, Interest::READABLE) {
                warn!(
                    "{}: unable to update event settings, closing connection",
                    c.id()
                );
                c.set_state(State::Closing);
                return true;
            }
            false
        }
        TryReadResult::SocketClosed => {
            c.set_state(State::Closing);
            true
        }
        TryReadResult::SocketError | TryReadResult::MemoryError => {
            warn!("{}: read error, closing connection", c.id());
            c.set_state(State::Closing);
            true
        }
    }
}

fn conn_execute(c: &mut Connection, ctx: &mut WorkerCtx) -> bool {
    if !c.is_packet_available() {
        panic!("conn_execute: the input packet is not completely in memory");
    }

    // bind the inline cookie on first entry; a wakeup replay keeps the
    // binding (and the arrival position) it already has
    if !c.cookie(0).has_request() {
        let header = {
            let read = c.read.as_ref().expect("read pipe missing");
            RequestHeader::parse(read.rdata()).expect("packet availability was checked")
        };
        let seq = c.next_arrival_seq();
        c.cookie_mut(0).bind(header, seq);
    }

    c.cookie_mut(0).set_ewouldblock(false);

    dispatch::execute_packet(c, ctx, 0);

    let total = c.cookie(0).header().total_len();

    if c.cookie(0).is_ewouldblock() {
        if c.allow_unordered_execution() && c.detached_capacity_left() {
            // detach the parked command so the connection can keep going;
            // the frame is copied out before it is consumed from the pipe
            let packet = c.packet(0).to_vec();
            c.cookie_mut(0).detach(&packet);
            let _slot = c.detach_inline_cookie();
            c.increment_refcount();
            let read = c.read.as_mut().expect("read pipe missing");
            read.consumed(total);
            c.set_state(State::NewCmd);
            return true;
        }

        // the engine parked the command; wait for notify_io_complete
        c.increment_refcount();
        c.unregister_event(ctx.registry);
        return false;
    }

    if c.cookie(0).response_ready() {
        // the response is staged for arrival-order serialization because
        // detached commands are outstanding; park the finished command and
        // keep going, the ordered drain in the new-command state flushes it
        let _slot = c.detach_inline_cookie();
        let read = c.read.as_mut().expect("read pipe missing");
        read.consumed(total);
        c.set_state(State::NewCmd);
        return true;
    }

    if c.state() == State::Execute {
        panic!("conn_execute: executor failed to leave the execute state");
    }

    // consume the packet we just executed from the input buffer
    let read = c.read.as_mut().expect("read pipe missing");
    read.consumed(total);

    true
}

fn conn_send_data(c: &mut Connection, ctx: &mut WorkerCtx) -> bool {
    match c.transmit() {
        TransmitResult::Complete => {
            c.release_temp_alloc();
            c.release_reserved_items();
            let next = c.write_and_go();
            c.set_state(next);
            true
        }
        TransmitResult::Incomplete => {
            trace!("{}: incomplete transfer, will retry", c.id());
            true
        }
        TransmitResult::HardError => {
            info!("{}: hard send error, closing connection", c.id());
            c.release_temp_alloc();
            c.release_reserved_items();
            c.set_state(State::Closing);
            true
        }
        TransmitResult::SoftError => {
            if !c.update_event(ctx.registry, Interest::READABLE.add(Interest::WRITABLE)) {
                warn!(
                    "{}: unable to update event settings, closing connection",
                    c.id()
                );
                c.set_state(State::Closing);
                return true;
            }
            false
        }
    }
}

/// The change-feed steady state. Unlike every other state this one is full
/// duplex: read events feed acknowledgement commands through the normal
/// parse path while write events pull more messages out of the engine.
fn conn_ship_log(c: &mut Connection, ctx: &mut WorkerCtx) -> bool {
    if c.is_socket_closed() {
        return false;
    }

    let mut cont = false;
    let mut mask = Interest::READABLE.add(Interest::WRITABLE);

    if c.is_read_event() || c.have_pending_input_data() {
        if c.read_buffered() >= HEADER_LEN {
            try_read_command(c, ctx);
        } else {
            c.set_state(State::ReadHeader);
        }

        // process the whole input queue rather than backing off after a
        // subset: every write event ships a chunk of messages, so during a
        // burst of acks a partial drain would let the input queue grow
        c.reset_num_events();
        cont = true;
    } else if c.is_write_event() && c.decrement_num_events() >= 0 {
        c.cookie_mut(0).set_ewouldblock(false);
        crate::dcp::ship_dcp_log(c, ctx);
        if c.cookie(0).is_ewouldblock() {
            mask = Interest::READABLE;
        } else {
            cont = true;
        }
    }

    if !c.update_event(ctx.registry, mask) {
        warn!(
            "{}: unable to update event settings, closing connection",
            c.id()
        );
        c.set_state(State::Closing);
    }

    cont
}

fn conn_closing(c: &mut Connection, ctx: &mut WorkerCtx) -> bool {
    c.cookie_mut(0).set_context(None);

    c.unregister_event(ctx.registry);
    c.close_socket();

    // release anything the engine lent us for in-flight responses
    c.release_temp_alloc();
    c.release_reserved_items();

    if c.refcount() > 1 || c.cookie(0).is_ewouldblock() {
        c.set_state(State::PendingClose);
    } else {
        c.set_state(State::ImmediateClose);
    }
    true
}

fn conn_pending_close(c: &mut Connection) -> bool {
    if !c.is_socket_closed() {
        panic!("conn_pending_close: socket must be closed");
    }
    debug!(
        "{}: awaiting engine to release its command references",
        c.id()
    );

    // tell the engine we're disconnecting, but give it a grace period to
    // complete its outstanding operations
    if !c.disconnect_propagated() {
        if let Some(engine) = c.bucket_engine() {
            engine.on_disconnect(c.cookie_id(0));
        }
    }

    if c.refcount() > 1 {
        return false;
    }

    c.set_state(State::ImmediateClose);
    true
}

fn conn_immediate_close(c: &mut Connection, ctx: &mut WorkerCtx) -> bool {
    if !c.is_socket_closed() {
        panic!("conn_immediate_close: socket must be closed");
    }

    c.drop_port_count();

    if let Some(engine) = c.bucket_engine() {
        engine.on_disconnect(c.cookie_id(0));
    }

    // change feeds keep their buffers for their lifetime; everyone else
    // hands drained pipes back to the worker's pool
    if !c.is_dcp() {
        ctx.pool.maybe_return(&mut c.read, &mut c.write);
    }
    c.read = None;
    c.write = None;

    c.dissociate_bucket();
    c.set_state(State::Destroyed);
    false
}
