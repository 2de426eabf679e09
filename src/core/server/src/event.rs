// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Out-of-band events targeted at a single connection. They are queued on
//! the connection and drained only between commands, never while a command
//! is in flight.

use bytes::Bytes;

#[derive(Clone, Debug)]
pub enum ServerEvent {
    /// Push an unsolicited cluster-map notification to a client which
    /// negotiated change notifications.
    ClustermapNotification { revision: i32, payload: Bytes },
    /// Force the connection into its shutdown sequence.
    Disconnect,
}
