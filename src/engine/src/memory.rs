// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A minimal in-memory engine backing the default bucket. It implements the
//! synchronous capability set (no change-feed) with hashmap storage, cas
//! protection and lock support, which is enough to serve clients and to
//! exercise the core. Durability is out of scope.

use crate::*;

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_LOCK_TIMEOUT: u32 = 15;

struct Entry {
    value: Bytes,
    flags: u32,
    datatype: u8,
    cas: u64,
    exptime: u32,
    locked_until: Option<Instant>,
}

impl Entry {
    fn is_locked(&self, now: Instant) -> bool {
        self.locked_until.map(|until| now < until).unwrap_or(false)
    }
}

struct Inner {
    data: HashMap<Vec<u8>, Entry>,
    next_cas: u64,
    seqno: u64,
}

pub struct MemoryEngine {
    inner: Mutex<Inner>,
    handles: Mutex<HashMap<u64, ItemInfo>>,
    next_handle: AtomicU64,
    vbucket_uuid: u64,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: HashMap::new(),
                next_cas: 1,
                seqno: 0,
            }),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            vbucket_uuid: 0xcafe_f00d,
        }
    }

    /// Number of item handles which have been returned but not yet
    /// released.
    pub fn outstanding_items(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    fn compose_key(key: &DocKey) -> Vec<u8> {
        let tag = match key.namespace {
            DocNamespace::DefaultCollection => 0u8,
            DocNamespace::Collections => 1u8,
        };
        let mut composed = Vec::with_capacity(key.key.len() + 1);
        composed.push(tag);
        composed.extend_from_slice(key.key);
        composed
    }

    fn make_handle(&self, key: &DocKey, entry: &Entry) -> ItemHandle {
        let info = ItemInfo {
            key: Bytes::copy_from_slice(key.key),
            value: entry.value.clone(),
            flags: entry.flags,
            cas: entry.cas,
            datatype: entry.datatype,
            exptime: entry.exptime,
            vbucket_uuid: self.vbucket_uuid,
            seqno: 0,
        };
        let token = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().unwrap().insert(token, info);
        ItemHandle::new(token)
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for MemoryEngine {
    fn get(&self, _cookie: &CookieRef, key: &DocKey, _vbucket: u16) -> EngineResult<ItemHandle> {
        let inner = self.inner.lock().unwrap();
        let entry = inner
            .data
            .get(&Self::compose_key(key))
            .ok_or(ErrorCode::KeyNotFound)?;
        Ok(self.make_handle(key, entry))
    }

    fn get_locked(
        &self,
        _cookie: &CookieRef,
        key: &DocKey,
        _vbucket: u16,
        lock_timeout: u32,
    ) -> EngineResult<ItemHandle> {
        let mut inner = self.inner.lock().unwrap();
        let next_cas = inner.next_cas;
        let entry = inner
            .data
            .get_mut(&Self::compose_key(key))
            .ok_or(ErrorCode::KeyNotFound)?;

        let now = Instant::now();
        if entry.is_locked(now) {
            return Err(ErrorCode::Locked);
        }

        let timeout = if lock_timeout == 0 {
            DEFAULT_LOCK_TIMEOUT
        } else {
            lock_timeout
        };
        entry.locked_until = Some(now + Duration::from_secs(timeout as u64));
        entry.cas = next_cas;

        let handle = self.make_handle(key, entry);
        inner.next_cas += 1;
        Ok(handle)
    }

    fn unlock(
        &self,
        _cookie: &CookieRef,
        key: &DocKey,
        _vbucket: u16,
        cas: u64,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .data
            .get_mut(&Self::compose_key(key))
            .ok_or(ErrorCode::KeyNotFound)?;

        if !entry.is_locked(Instant::now()) {
            return Err(ErrorCode::TmpFail);
        }
        if entry.cas != cas {
            return Err(ErrorCode::Locked);
        }

        entry.locked_until = None;
        Ok(())
    }

    fn store(
        &self,
        _cookie: &CookieRef,
        operation: StoreOperation,
        key: &DocKey,
        value: &[u8],
        flags: u32,
        exptime: u32,
        datatype: u8,
        cas: u64,
        _vbucket: u16,
    ) -> EngineResult<MutationDescr> {
        let mut inner = self.inner.lock().unwrap();
        let new_cas = inner.next_cas;
        let composed = Self::compose_key(key);
        let now = Instant::now();

        let existing = inner.data.get(&composed);

        // a lock is only bypassed by a mutation presenting the locked cas
        if let Some(entry) = existing {
            if entry.is_locked(now) && entry.cas != cas {
                return Err(ErrorCode::Locked);
            }
        }

        let new_value = match operation {
            StoreOperation::Set => {
                if cas != 0 {
                    match existing {
                        Some(entry) if entry.cas == cas => {}
                        Some(_) => return Err(ErrorCode::KeyExists),
                        None => return Err(ErrorCode::KeyNotFound),
                    }
                }
                Bytes::copy_from_slice(value)
            }
            StoreOperation::Add => {
                if existing.is_some() {
                    return Err(ErrorCode::KeyExists);
                }
                Bytes::copy_from_slice(value)
            }
            StoreOperation::Replace => {
                let entry = existing.ok_or(ErrorCode::KeyNotFound)?;
                if cas != 0 && entry.cas != cas {
                    return Err(ErrorCode::KeyExists);
                }
                Bytes::copy_from_slice(value)
            }
            StoreOperation::Append | StoreOperation::Prepend => {
                let entry = existing.ok_or(ErrorCode::NotStored)?;
                if cas != 0 && entry.cas != cas {
                    return Err(ErrorCode::KeyExists);
                }
                let mut combined = Vec::with_capacity(entry.value.len() + value.len());
                if operation == StoreOperation::Append {
                    combined.extend_from_slice(&entry.value);
                    combined.extend_from_slice(value);
                } else {
                    combined.extend_from_slice(value);
                    combined.extend_from_slice(&entry.value);
                }
                Bytes::from(combined)
            }
        };

        let (flags, exptime) = match (operation, existing) {
            // append and prepend keep the item's metadata
            (StoreOperation::Append | StoreOperation::Prepend, Some(entry)) => {
                (entry.flags, entry.exptime)
            }
            _ => (flags, exptime),
        };

        inner.data.insert(
            composed,
            Entry {
                value: new_value,
                flags,
                datatype,
                cas: new_cas,
                exptime,
                locked_until: None,
            },
        );
        inner.next_cas += 1;
        inner.seqno += 1;

        Ok(MutationDescr {
            cas: new_cas,
            vbucket_uuid: self.vbucket_uuid,
            seqno: inner.seqno,
        })
    }

    fn remove(
        &self,
        _cookie: &CookieRef,
        key: &DocKey,
        _vbucket: u16,
        cas: u64,
    ) -> EngineResult<MutationDescr> {
        let mut inner = self.inner.lock().unwrap();
        let composed = Self::compose_key(key);

        let entry = inner.data.get(&composed).ok_or(ErrorCode::KeyNotFound)?;
        if entry.is_locked(Instant::now()) && entry.cas != cas {
            return Err(ErrorCode::Locked);
        }
        if cas != 0 && entry.cas != cas {
            return Err(ErrorCode::KeyExists);
        }

        inner.data.remove(&composed);
        inner.seqno += 1;

        Ok(MutationDescr {
            cas: 0,
            vbucket_uuid: self.vbucket_uuid,
            seqno: inner.seqno,
        })
    }

    fn flush(&self, _cookie: &CookieRef) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.data.clear();
        inner.seqno += 1;
        Ok(())
    }

    fn get_item_info(&self, item: &ItemHandle) -> Option<ItemInfo> {
        self.handles.lock().unwrap().get(&item.token()).cloned()
    }

    fn item_release(&self, item: ItemHandle) {
        if self.handles.lock().unwrap().remove(&item.token()).is_none() {
            log::warn!("released unknown item handle {}", item.token());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct NoopNotify;

    impl NotifyIoComplete for NoopNotify {
        fn notify_io_complete(&self, _cookie: CookieId, _status: EngineResult<()>) {}
    }

    fn cookie_setup() -> Arc<dyn NotifyIoComplete> {
        Arc::new(NoopNotify)
    }

    fn dockey(key: &[u8]) -> DocKey {
        DocKey::new(DocNamespace::DefaultCollection, key)
    }

    #[test]
    fn get_miss_then_set_then_hit() {
        let engine = MemoryEngine::new();
        let notify = cookie_setup();
        let cookie = CookieRef {
            id: 1,
            notify: &notify,
        };

        assert_eq!(
            engine.get(&cookie, &dockey(b"abc"), 0).unwrap_err(),
            ErrorCode::KeyNotFound
        );

        let descr = engine
            .store(
                &cookie,
                StoreOperation::Set,
                &dockey(b"abc"),
                b"xyz",
                0x12345678,
                0,
                0,
                0,
                0,
            )
            .expect("store failed");
        assert!(descr.cas != 0);

        let item = engine.get(&cookie, &dockey(b"abc"), 0).expect("get failed");
        let info = engine.get_item_info(&item).expect("no item info");
        assert_eq!(&info.value[..], b"xyz");
        assert_eq!(info.flags, 0x12345678);
        assert_eq!(info.cas, descr.cas);

        engine.item_release(item);
        assert_eq!(engine.outstanding_items(), 0);
    }

    #[test]
    fn add_and_replace_semantics() {
        let engine = MemoryEngine::new();
        let notify = cookie_setup();
        let cookie = CookieRef {
            id: 1,
            notify: &notify,
        };

        assert_eq!(
            engine
                .store(
                    &cookie,
                    StoreOperation::Replace,
                    &dockey(b"k"),
                    b"v",
                    0,
                    0,
                    0,
                    0,
                    0
                )
                .unwrap_err(),
            ErrorCode::KeyNotFound
        );

        engine
            .store(
                &cookie,
                StoreOperation::Add,
                &dockey(b"k"),
                b"v",
                0,
                0,
                0,
                0,
                0,
            )
            .expect("add failed");

        assert_eq!(
            engine
                .store(
                    &cookie,
                    StoreOperation::Add,
                    &dockey(b"k"),
                    b"v2",
                    0,
                    0,
                    0,
                    0,
                    0
                )
                .unwrap_err(),
            ErrorCode::KeyExists
        );
    }

    #[test]
    fn cas_protection() {
        let engine = MemoryEngine::new();
        let notify = cookie_setup();
        let cookie = CookieRef {
            id: 1,
            notify: &notify,
        };

        let descr = engine
            .store(
                &cookie,
                StoreOperation::Set,
                &dockey(b"k"),
                b"1",
                0,
                0,
                0,
                0,
                0,
            )
            .unwrap();

        // stale cas is rejected
        assert_eq!(
            engine
                .store(
                    &cookie,
                    StoreOperation::Set,
                    &dockey(b"k"),
                    b"2",
                    0,
                    0,
                    0,
                    descr.cas + 1,
                    0
                )
                .unwrap_err(),
            ErrorCode::KeyExists
        );

        // matching cas succeeds
        engine
            .store(
                &cookie,
                StoreOperation::Set,
                &dockey(b"k"),
                b"2",
                0,
                0,
                0,
                descr.cas,
                0,
            )
            .expect("cas store failed");
    }

    #[test]
    fn lock_and_unlock() {
        let engine = MemoryEngine::new();
        let notify = cookie_setup();
        let cookie = CookieRef {
            id: 1,
            notify: &notify,
        };

        engine
            .store(
                &cookie,
                StoreOperation::Set,
                &dockey(b"k"),
                b"v",
                0,
                0,
                0,
                0,
                0,
            )
            .unwrap();

        let item = engine
            .get_locked(&cookie, &dockey(b"k"), 0, 0)
            .expect("lock failed");
        let locked_cas = engine.get_item_info(&item).unwrap().cas;
        engine.item_release(item);

        // second lock attempt fails while held
        assert_eq!(
            engine.get_locked(&cookie, &dockey(b"k"), 0, 0).unwrap_err(),
            ErrorCode::Locked
        );

        // mutation without the lock cas fails
        assert_eq!(
            engine
                .store(
                    &cookie,
                    StoreOperation::Set,
                    &dockey(b"k"),
                    b"v2",
                    0,
                    0,
                    0,
                    0,
                    0
                )
                .unwrap_err(),
            ErrorCode::Locked
        );

        // unlock with the wrong cas fails, with the right cas succeeds
        assert_eq!(
            engine
                .unlock(&cookie, &dockey(b"k"), 0, locked_cas + 1)
                .unwrap_err(),
            ErrorCode::Locked
        );
        engine
            .unlock(&cookie, &dockey(b"k"), 0, locked_cas)
            .expect("unlock failed");

        engine
            .store(
                &cookie,
                StoreOperation::Set,
                &dockey(b"k"),
                b"v2",
                0,
                0,
                0,
                0,
                0,
            )
            .expect("store after unlock failed");
    }

    #[test]
    fn namespaces_are_disjoint() {
        let engine = MemoryEngine::new();
        let notify = cookie_setup();
        let cookie = CookieRef {
            id: 1,
            notify: &notify,
        };

        engine
            .store(
                &cookie,
                StoreOperation::Set,
                &DocKey::new(DocNamespace::Collections, b"user"),
                b"a",
                0,
                0,
                0,
                0,
                0,
            )
            .unwrap();

        assert_eq!(
            engine.get(&cookie, &dockey(b"user"), 0).unwrap_err(),
            ErrorCode::KeyNotFound
        );
    }

    #[test]
    fn flush_clears_everything() {
        let engine = MemoryEngine::new();
        let notify = cookie_setup();
        let cookie = CookieRef {
            id: 1,
            notify: &notify,
        };

        engine
            .store(
                &cookie,
                StoreOperation::Set,
                &dockey(b"k"),
                b"v",
                0,
                0,
                0,
                0,
                0,
            )
            .unwrap();
        engine.flush(&cookie).expect("flush failed");
        assert_eq!(
            engine.get(&cookie, &dockey(b"k"), 0).unwrap_err(),
            ErrorCode::KeyNotFound
        );
    }
}
