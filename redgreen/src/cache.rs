// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of redgreen.
//
// redgreen is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// redgreen is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with redgreen.  If not,
// see <http://www.gnu.org/licenses/>.

//! # cache
//!
//! Two-tier storage: an approximate-LRU cache in front of the permanent backend.
//!
//! # Design
//!
//! The cache tier (which must be list-capable) holds payloads; an in-memory map of descriptors
//! holds the bookkeeping: one entry per cached id carrying its size, a last-access timestamp &
//! a readiness signal. A descriptor enters the map *before* its payload finishes arriving, which
//! is what buys single-flight behavior: the first task to miss on an id becomes its "owner" and
//! performs the one permanent-storage fetch, while every later arrival finds the descriptor and
//! parks on its readiness signal instead of issuing a second fetch. An entry in the map is
//! therefore in one of exactly two states: still being fetched (size 0, readiness pending), or
//! fully stored in the cache tier (size > 0, readiness resolved).
//!
//! Eviction is approximate LRU. Writers nudge a depth-one channel after adding payload; a
//! dedicated worker wakes, and if the summed descriptor sizes have reached the cap, removes
//! descriptors in last-access order until usage sits five percent under the cap, then deletes
//! the corresponding payloads in the background. Accuracy concessions, both deliberate:
//! last-access updates go through a try-lock & are simply skipped under contention, and the
//! summed size may briefly overshoot the cap between nudge & sweep.
//!
//! Readiness is a tokio watch channel rather than the more obvious [Notify]: a watch carries
//! the resolved/pending state with it, so a task arriving after resolution doesn't hang, and a
//! fetch owner that gets cancelled mid-flight drops its sender, which observers can tell apart
//! from resolution & treat as a miss (clearing the orphaned descriptor on their way out).
//!
//! [Notify]: tokio::sync::Notify

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, Weak,
    },
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error};

use crate::{
    counter_add, gauge_setu,
    metrics::{self, Instruments, Sort},
    storage::{self, Backend, ListBackend},
};

inventory::submit! { metrics::Registration::new("cache.hits", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("cache.misses", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("cache.evictions", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("cache.size", Sort::IntegralGauge) }

/// Pause between eviction passes; coalesces bursts of nudges
const CLEAN_SLEEP: Duration = Duration::from_secs(1);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        cached objects                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Bookkeeping for one cached payload
struct CachedObject {
    id: String,
    /// Payload length; zero until the fetch completes
    size: AtomicU64,
    last_access: StdMutex<Instant>,
    /// Resolves to `true` once the owning fetcher finishes, success or failure
    ready: watch::Receiver<bool>,
}

impl CachedObject {
    fn unresolved(id: &str, ready: watch::Receiver<bool>) -> Arc<CachedObject> {
        Arc::new(CachedObject {
            id: id.to_owned(),
            size: AtomicU64::new(0),
            last_access: StdMutex::new(Instant::now()),
            ready,
        })
    }
    /// A pre-resolved readiness signal, for descriptors rebuilt at startup
    fn resolved() -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(true);
        rx
    }
    /// Best-effort last-access update; contended updates are dropped on the floor
    fn access(&self) {
        let now = Instant::now();
        if let Ok(mut guard) = self.last_access.try_lock() {
            *guard = now;
        }
    }
    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         CachedStorage                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An approximate-LRU cache tier in front of permanent storage
pub struct CachedStorage {
    cache: Arc<dyn ListBackend + Send + Sync>,
    permanent: Arc<dyn Backend + Send + Sync>,
    /// Byte cap on the cache tier; actual usage may briefly run slightly higher
    max_size: u64,
    objects: RwLock<HashMap<String, Arc<CachedObject>>>,
    /// Nudged after adding payload; depth one, a dropped nudge means one is already pending
    cleaning: mpsc::Sender<()>,
    instruments: Arc<Instruments>,
}

impl CachedStorage {
    /// Stand up cached storage, re-learning the cache tier's contents by enumeration
    pub async fn new(
        cache: Arc<dyn ListBackend + Send + Sync>,
        permanent: Arc<dyn Backend + Send + Sync>,
        max_size: u64,
        instruments: Arc<Instruments>,
    ) -> storage::Result<Arc<CachedStorage>> {
        let mut objects = HashMap::new();
        cache
            .list(&mut |id, buf| {
                objects.insert(
                    id.to_owned(),
                    Arc::new(CachedObject {
                        id: id.to_owned(),
                        size: AtomicU64::new(buf.len() as u64),
                        last_access: StdMutex::new(Instant::now()),
                        ready: CachedObject::resolved(),
                    }),
                );
            })
            .await?;
        debug!("cached storage warm-started with {} objects", objects.len());
        let (tx, rx) = mpsc::channel(1);
        let this = Arc::new(CachedStorage {
            cache,
            permanent,
            max_size,
            objects: RwLock::new(objects),
            cleaning: tx,
            instruments,
        });
        tokio::spawn(Self::cleaner(Arc::downgrade(&this), rx));
        Ok(this)
    }

    /// Retrieve `id`, preferring the cache tier; a miss fetches from permanent storage exactly
    /// once no matter how many tasks are asking
    pub async fn get(&self, id: &str) -> storage::Result<Vec<u8>> {
        // Fast path: the object is cached (or a fetch is already in flight & resolves to it).
        if self.cache_has(id).await {
            counter_add!(self.instruments, "cache.hits", 1, &[]);
            return self.cache.get(id).await;
        }
        counter_add!(self.instruments, "cache.misses", 1, &[]);

        // Attempt to take ownership of fetching `id` from permanent storage.
        let (tx, rx) = watch::channel(false);
        let fresh = CachedObject::unresolved(id, rx);
        let (obj, ours) = {
            let mut objects = self.objects.write().await;
            match objects.get(id) {
                Some(existing) => (existing.clone(), false),
                None => {
                    objects.insert(id.to_owned(), fresh.clone());
                    (fresh, true)
                }
            }
        };

        if !ours {
            // Someone beat us to it; park on their readiness signal.
            let mut ready = obj.ready.clone();
            return match ready.wait_for(|done| *done).await.map(|r| *r) {
                Ok(_) if obj.size() > 0 => self.cache.get(id).await,
                Ok(_) => storage::NotFoundSnafu { id: id.to_owned() }.fail(),
                Err(_) => {
                    // The owner was cancelled without resolving; clear the orphan & miss.
                    self.remove_if_same(id, &obj).await;
                    storage::NotFoundSnafu { id: id.to_owned() }.fail()
                }
            };
        }

        // We own retrieving the object & installing it in the cache.
        match self.permanent.get(id).await {
            Ok(data) => {
                self.cache_store(id, &data, &obj).await;
                let _ = tx.send(true);
                Ok(data)
            }
            Err(err) => {
                // Resolve (waking observers into a miss), then drop the descriptor so the map
                // never retains a resolved-but-empty entry.
                let _ = tx.send(true);
                self.remove_if_same(id, &obj).await;
                Err(err)
            }
        }
    }

    /// Store `data` under `id`: permanent storage first, then the cache tier
    pub async fn put(&self, id: &str, data: &[u8]) -> storage::Result<()> {
        self.permanent.put(id, data).await?;
        // Durable; now install it in the cache, readiness pending until the payload lands.
        let (tx, rx) = watch::channel(false);
        let obj = CachedObject::unresolved(id, rx);
        self.objects
            .write()
            .await
            .insert(id.to_owned(), obj.clone());
        self.cache_store(id, data, &obj).await;
        let _ = tx.send(true);
        Ok(())
    }

    /// Remove `id` everywhere; the cache tier is best-effort (permanent is the system of record)
    pub async fn del(&self, id: &str) -> storage::Result<()> {
        self.permanent.del(id).await?;
        let existed = self.objects.write().await.remove(id).is_some();
        if !existed {
            return Ok(());
        }
        if let Err(err) = self.cache.del(id).await {
            error!("cache does not correctly delete objects: {err}");
        }
        Ok(())
    }

    /// Approximate bytes held by the cache tier (the sum of descriptor sizes)
    pub async fn cache_size(&self) -> u64 {
        self.objects.read().await.values().map(|o| o.size()).sum()
    }

    /// True iff `id` is fully cached; waits out any in-flight fetch
    async fn cache_has(&self, id: &str) -> bool {
        let obj = {
            let objects = self.objects.read().await;
            match objects.get(id) {
                Some(obj) => obj.clone(),
                None => return false,
            }
        };
        let mut ready = obj.ready.clone();
        if ready.wait_for(|done| *done).await.is_err() {
            // Orphaned by a cancelled owner.
            self.remove_if_same(id, &obj).await;
            return false;
        }
        if obj.size() == 0 {
            return false;
        }
        obj.access();
        true
    }

    /// Install a payload in the cache tier & complete its descriptor
    async fn cache_store(&self, id: &str, data: &[u8], obj: &CachedObject) {
        if let Err(err) = self.cache.put(id, data).await {
            // The descriptor stays at size 0; readers will fall through to permanent storage.
            error!("cache does not correctly put objects: {err}");
            return;
        }
        obj.access();
        obj.size.store(data.len() as u64, Ordering::Release);
        let _ = self.cleaning.try_send(());
    }

    /// Drop `id`'s descriptor, but only if it still is `obj` (a newer insert wins)
    async fn remove_if_same(&self, id: &str, obj: &Arc<CachedObject>) {
        let mut objects = self.objects.write().await;
        if objects.get(id).is_some_and(|cur| Arc::ptr_eq(cur, obj)) {
            objects.remove(id);
        }
    }

    /// The eviction worker; parks on the nudge channel & exits when the storage is dropped
    async fn cleaner(this: Weak<CachedStorage>, mut cleaning: mpsc::Receiver<()>) {
        while cleaning.recv().await.is_some() {
            let Some(this) = this.upgrade() else { break };
            if this.cache_size().await >= this.max_size {
                this.clone().sweep().await;
            }
            drop(this);
            tokio::time::sleep(CLEAN_SLEEP).await;
        }
    }

    /// One eviction pass: shed least-recently-used descriptors until usage sits 5% under the
    /// cap, then delete their payloads in the background
    async fn sweep(self: Arc<Self>) {
        let doomed = self.clean_pass().await;
        if !doomed.is_empty() {
            debug!("evicting {} objects from the cache tier", doomed.len());
            tokio::spawn(self.clone().evict(doomed));
        }
    }

    /// Pick & unmap this pass's eviction victims, least-recently-used first, accumulating
    /// until usage sits 5% under the cap
    async fn clean_pass(&self) -> Vec<Arc<CachedObject>> {
        let mut objects = self.objects.write().await;
        let mut snapshot: Vec<Arc<CachedObject>> = objects.values().cloned().collect();
        let total: u64 = snapshot.iter().map(|o| o.size()).sum();
        if total < self.max_size {
            // Raced below the cap since the nudge; nothing to do.
            return Vec::new();
        }
        snapshot.sort_by_key(|o| *o.last_access.lock().expect("lock poisoned"));
        let target = total - self.max_size + self.max_size / 20;
        let mut collected = 0u64;
        let mut doomed = Vec::new();
        for obj in snapshot {
            if collected >= target {
                break;
            }
            collected += obj.size();
            objects.remove(&obj.id);
            doomed.push(obj);
        }
        gauge_setu!(self.instruments, "cache.size", total - collected, &[]);
        counter_add!(self.instruments, "cache.evictions", doomed.len() as u64, &[]);
        doomed
    }

    /// Delete evicted payloads from the cache tier
    async fn evict(self: Arc<Self>, doomed: Vec<Arc<CachedObject>>) {
        // Taking the read lock for the duration keeps the descriptor map stable underneath us:
        // an id that has reappeared belongs to a newer write & must not have its payload
        // deleted, so it's skipped.
        let objects = self.objects.read().await;
        for obj in doomed {
            if objects.contains_key(&obj.id) {
                continue;
            }
            if let Err(err) = self.cache.del(&obj.id).await {
                error!("error deleting {} in cache eviction: {err}", obj.id);
            }
        }
    }
}

// So that a CachedStorage can stand wherever a plain backend does.
#[async_trait::async_trait]
impl Backend for CachedStorage {
    async fn get(&self, id: &str) -> storage::Result<Vec<u8>> {
        CachedStorage::get(self, id).await
    }
    async fn put(&self, id: &str, data: &[u8]) -> storage::Result<()> {
        CachedStorage::put(self, id, data).await
    }
    async fn del(&self, id: &str) -> storage::Result<()> {
        CachedStorage::del(self, id).await
    }
}

// Pressure-test the machinery against in-memory mock backends.
#[cfg(test)]
mod mock {

    use super::*;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use std::sync::atomic::AtomicUsize;

    /// An in-memory [Backend]/[ListBackend] that counts gets &, optionally, gates them
    #[derive(Default)]
    pub struct InMemory {
        pub objects: StdMutex<HashMap<String, Vec<u8>>>,
        pub gets: AtomicUsize,
        /// When set, every get parks here first
        pub gate: Option<Arc<Notify>>,
    }

    impl InMemory {
        pub fn with(objects: &[(&str, &[u8])]) -> Arc<InMemory> {
            Arc::new(InMemory {
                objects: StdMutex::new(
                    objects
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_vec()))
                        .collect(),
                ),
                ..Default::default()
            })
        }
        pub fn len(&self) -> usize {
            self.objects.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Backend for InMemory {
        async fn get(&self, id: &str) -> storage::Result<Vec<u8>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.objects
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| storage::NotFoundSnafu { id: id.to_owned() }.build())
        }
        async fn put(&self, id: &str, data: &[u8]) -> storage::Result<()> {
            self.objects
                .lock()
                .unwrap()
                .insert(id.to_owned(), data.to_vec());
            Ok(())
        }
        async fn del(&self, id: &str) -> storage::Result<()> {
            self.objects.lock().unwrap().remove(id);
            Ok(())
        }
    }

    #[async_trait]
    impl ListBackend for InMemory {
        async fn list(&self, cb: &mut (dyn for<'a> FnMut(&'a str, &'a [u8]) + Send)) -> storage::Result<()> {
            for (id, buf) in self.objects.lock().unwrap().iter() {
                cb(id, buf);
            }
            Ok(())
        }
    }
}
