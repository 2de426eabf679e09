// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Minimal privilege surface. The full role database is an external
//! collaborator; the core only needs a per-connection privilege context it
//! can probe before invoking the engine, and a staleness signal so a
//! context created before an authentication change gets rebuilt.

use crate::registry::ConnectionRegistry;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Privilege {
    Read = 1 << 0,
    Upsert = 1 << 1,
    Delete = 1 << 2,
    DcpProducer = 1 << 3,
    DcpConsumer = 1 << 4,
    BucketManagement = 1 << 5,
    Stats = 1 << 6,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrivilegeAccess {
    Ok,
    Fail,
    /// The context was created before the last authentication change and
    /// must be recreated before the check can be answered.
    Stale,
}

/// An immutable snapshot of the privileges granted to a connection's
/// identity. Contexts are recreated, never mutated, on every authentication
/// change, so readers always see a consistent snapshot.
#[derive(Clone, Debug)]
pub struct PrivilegeContext {
    mask: u32,
    epoch: u64,
}

const ALL_PRIVILEGES: u32 = (1 << 7) - 1;

impl PrivilegeContext {
    /// Build the context for the given identity. Role lookups are out of
    /// scope: any identity (including the unauthenticated default) is
    /// granted the full data-path privilege set.
    pub fn create(registry: &ConnectionRegistry, _username: &str) -> Self {
        Self {
            mask: ALL_PRIVILEGES,
            epoch: registry.auth_epoch(),
        }
    }

    /// A context granting nothing, used before any context was created.
    pub fn empty() -> Self {
        Self { mask: 0, epoch: 0 }
    }

    pub fn check(&self, registry: &ConnectionRegistry, privilege: Privilege) -> PrivilegeAccess {
        if self.epoch != registry.auth_epoch() {
            return PrivilegeAccess::Stale;
        }
        if self.mask & privilege as u32 != 0 {
            PrivilegeAccess::Ok
        } else {
            PrivilegeAccess::Fail
        }
    }

    pub fn drop_privilege(&mut self, privilege: Privilege) {
        self.mask &= !(privilege as u32);
    }
}
