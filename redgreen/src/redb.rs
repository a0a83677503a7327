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

//! # redb
//!
//! The embedded backend: a single [redb] file playing two roles. Its `files` & `stats` tables
//! implement the [Metadata](crate::db::Metadata) store, while [KvStorage] exposes any one table
//! as an object-storage [Backend](crate::storage::Backend) -- the `storage` table when running
//! without S3 (permanent storage), the `cache` table in front of S3 otherwise.
//!
//! redb admits one write transaction at a time, so the usage counter's read-modify-write is
//! strictly serialized; redb calls block, so every operation hops onto the blocking pool.
//!
//! [redb]: https://docs.rs/redb/latest/redb/index.html

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use snafu::prelude::*;
use tokio::task::spawn_blocking;

use crate::{
    archive::ShortId,
    db::{self, Metadata, UploadLimits, UploadRecord, UsageStat},
    storage::{self, Backend, ListBackend},
};

pub const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");
pub const STATS: TableDefinition<&str, &[u8]> = TableDefinition::new("stats");
pub const STORAGE: TableDefinition<&str, &[u8]> = TableDefinition::new("storage");
pub const CACHE: TableDefinition<&str, &[u8]> = TableDefinition::new("cache");

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to open the database: {source}"))]
    Open {
        source: redb::DatabaseError,
        backtrace: snafu::Backtrace,
    },
    #[snafu(display("failed to create tables: {source}"))]
    Init {
        source: redb::Error,
        backtrace: snafu::Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Db                                                //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Handle on the redb file; cheaply clonable
#[derive(Clone)]
pub struct Db {
    db: Arc<Database>,
}

impl Db {
    /// Open (creating if need be) the database at `path` & ensure every table exists, so that
    /// later read transactions can't trip over a missing table
    pub fn open(path: impl AsRef<Path>) -> Result<Db> {
        let db = Database::create(path).context(OpenSnafu)?;
        let init = || -> StdResult<(), redb::Error> {
            let txn = db.begin_write()?;
            for table in [FILES, STATS, STORAGE, CACHE] {
                txn.open_table(table)?;
            }
            txn.commit()?;
            Ok(())
        };
        init().context(InitSnafu)?;
        Ok(Db { db: Arc::new(db) })
    }

    /// Expose one table as an object-storage backend
    pub fn storage(&self, table: TableDefinition<'static, &'static str, &'static [u8]>) -> KvStorage {
        KvStorage {
            db: self.db.clone(),
            table,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       object storage                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One redb table worn as a [Backend]; list-capable
#[derive(Clone)]
pub struct KvStorage {
    db: Arc<Database>,
    table: TableDefinition<'static, &'static str, &'static [u8]>,
}

#[async_trait]
impl Backend for KvStorage {
    async fn get(&self, id: &str) -> storage::Result<Vec<u8>> {
        let db = self.db.clone();
        let table = self.table;
        let id = id.to_owned();
        let val = spawn_blocking({
            let id = id.clone();
            move || -> StdResult<Option<Vec<u8>>, redb::Error> {
                let txn = db.begin_read()?;
                let t = txn.open_table(table)?;
                Ok(t.get(id.as_str())?.map(|guard| guard.value().to_vec()))
            }
        })
        .await
        .map_err(storage::Error::backend)?
        .map_err(storage::Error::backend)?;
        match val {
            Some(buf) if !buf.is_empty() => Ok(buf),
            _ => storage::NotFoundSnafu { id }.fail(),
        }
    }

    async fn put(&self, id: &str, data: &[u8]) -> storage::Result<()> {
        let db = self.db.clone();
        let table = self.table;
        let id = id.to_owned();
        let data = data.to_vec();
        spawn_blocking(move || -> StdResult<(), redb::Error> {
            let txn = db.begin_write()?;
            {
                let mut t = txn.open_table(table)?;
                t.insert(id.as_str(), data.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .map_err(storage::Error::backend)?
        .map_err(storage::Error::backend)
    }

    async fn del(&self, id: &str) -> storage::Result<()> {
        let db = self.db.clone();
        let table = self.table;
        let id = id.to_owned();
        spawn_blocking(move || -> StdResult<(), redb::Error> {
            let txn = db.begin_write()?;
            {
                let mut t = txn.open_table(table)?;
                t.remove(id.as_str())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .map_err(storage::Error::backend)?
        .map_err(storage::Error::backend)
    }
}

#[async_trait]
impl ListBackend for KvStorage {
    async fn list(&self, cb: &mut (dyn for<'a> FnMut(&'a str, &'a [u8]) + Send)) -> storage::Result<()> {
        // Startup-only path; snapshotting the table keeps the callback out of the read
        // transaction's lifetime.
        let db = self.db.clone();
        let table = self.table;
        let entries = spawn_blocking(move || -> StdResult<Vec<(String, Vec<u8>)>, redb::Error> {
            let txn = db.begin_read()?;
            let t = txn.open_table(table)?;
            let mut entries = Vec::new();
            for item in t.iter()? {
                let (k, v) = item?;
                entries.push((k.value().to_owned(), v.value().to_vec()));
            }
            Ok(entries)
        })
        .await
        .map_err(storage::Error::backend)?
        .map_err(storage::Error::backend)?;
        for (id, buf) in &entries {
            cb(id, buf);
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       metadata store                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[async_trait]
impl Metadata for Db {
    async fn has_file(&self, id: &ShortId) -> db::Result<bool> {
        let db = self.db.clone();
        let id = id.as_str().to_owned();
        spawn_blocking(move || -> StdResult<bool, redb::Error> {
            let txn = db.begin_read()?;
            let t = txn.open_table(FILES)?;
            Ok(t.get(id.as_str())?.is_some())
        })
        .await
        .map_err(db::Error::metadata)?
        .map_err(db::Error::metadata)
    }

    async fn get_file(&self, id: &ShortId) -> db::Result<Option<UploadRecord>> {
        let db = self.db.clone();
        let id = id.as_str().to_owned();
        let buf = spawn_blocking(move || -> StdResult<Option<Vec<u8>>, redb::Error> {
            let txn = db.begin_read()?;
            let t = txn.open_table(FILES)?;
            Ok(t.get(id.as_str())?.map(|guard| guard.value().to_vec()))
        })
        .await
        .map_err(db::Error::metadata)?
        .map_err(db::Error::metadata)?;
        buf.map(|buf| serde_json::from_slice(&buf))
            .transpose()
            .map_err(db::Error::metadata)
    }

    async fn put_file(&self, id: &ShortId, record: &UploadRecord) -> db::Result<()> {
        let db = self.db.clone();
        let id = id.as_str().to_owned();
        let encoded = serde_json::to_vec(record).map_err(db::Error::metadata)?;
        spawn_blocking(move || -> StdResult<(), redb::Error> {
            let txn = db.begin_write()?;
            {
                let mut t = txn.open_table(FILES)?;
                t.insert(id.as_str(), encoded.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .map_err(db::Error::metadata)?
        .map_err(db::Error::metadata)
    }

    async fn add_amounts_and_compare(
        &self,
        key: &str,
        delta: UsageStat,
        limits: UploadLimits,
    ) -> db::Result<()> {
        enum Outcome {
            Persisted,
            Exceeded,
        }
        let db = self.db.clone();
        let key = key.to_owned();
        let outcome = spawn_blocking(move || -> StdResult<Outcome, redb::Error> {
            let txn = db.begin_write()?;
            let outcome = {
                let mut t = txn.open_table(STATS)?;
                let existing = t.get(key.as_str())?.map(|guard| guard.value().to_vec());
                let mut stat: UsageStat = existing
                    .as_deref()
                    .and_then(|buf| serde_json::from_slice(buf).ok())
                    .unwrap_or_default();
                // A counter left over from an earlier window restarts from the delta.
                if stat.period == delta.period {
                    stat.num_bytes += delta.num_bytes;
                    stat.num_calls += delta.num_calls;
                } else {
                    stat = delta;
                }
                if stat.num_bytes > limits.max_bytes || stat.num_calls > limits.max_calls {
                    Outcome::Exceeded
                } else {
                    let encoded =
                        serde_json::to_vec(&stat).expect("UsageStat is always serializable");
                    t.insert(key.as_str(), encoded.as_slice())?;
                    Outcome::Persisted
                }
            };
            match outcome {
                Outcome::Persisted => txn.commit()?,
                Outcome::Exceeded => txn.abort()?,
            }
            Ok(outcome)
        })
        .await
        .map_err(db::Error::metadata)?
        .map_err(db::Error::metadata)?;
        match outcome {
            Outcome::Persisted => Ok(()),
            Outcome::Exceeded => db::LimitsExceededSnafu.fail(),
        }
    }
}
