// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use bytes::Bytes;

/// Key namespaces. Collection-aware connections address keys inside named
/// collections; everything else operates on the default collection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DocNamespace {
    DefaultCollection,
    Collections,
}

/// A namespaced key, borrowed from the request packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DocKey<'a> {
    pub namespace: DocNamespace,
    pub key: &'a [u8],
}

impl<'a> DocKey<'a> {
    pub fn new(namespace: DocNamespace, key: &'a [u8]) -> Self {
        Self { namespace, key }
    }

    /// Namespace for a change-feed message: on a collection-aware channel a
    /// non-zero collection length marks the key as collection-scoped.
    pub fn dcp_namespace(collection_aware: bool, collection_len: u8) -> DocNamespace {
        if collection_aware && collection_len != 0 {
            DocNamespace::Collections
        } else {
            DocNamespace::DefaultCollection
        }
    }
}

/// An opaque reference to an engine-owned item. Handles are deliberately not
/// clonable: each one must be passed back through `item_release` exactly
/// once, which is what lets the engine keep the item alive until the server
/// has finished transmitting it.
#[derive(Debug, PartialEq, Eq)]
pub struct ItemHandle(u64);

impl ItemHandle {
    pub fn new(token: u64) -> Self {
        Self(token)
    }

    pub fn token(&self) -> u64 {
        self.0
    }
}

/// A snapshot of an item's metadata and value. Values are refcounted so the
/// server can hold them in its io-vectors without copying.
#[derive(Clone, Debug)]
pub struct ItemInfo {
    pub key: Bytes,
    pub value: Bytes,
    pub flags: u32,
    pub cas: u64,
    pub datatype: u8,
    pub exptime: u32,
    pub vbucket_uuid: u64,
    pub seqno: u64,
}
