// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

/// Control-plane signals broadcast from the admin thread to its sibling
/// threads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Flush the selected storage of every worker.
    FlushAll,
    /// Close idle connections, optionally restricted to connections which
    /// have the given bucket selected. Used to evict clients when a bucket
    /// is being deleted.
    SignalIdle(Option<usize>),
    /// Terminate all threads and exit.
    Shutdown,
}
