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

//! # storage
//!
//! Abstractions over the redgreen object storage layer.
//!
//! Archives are small (generally under 32KB, never over 1MB -- uploads are capped well before
//! that) so the interface trades in whole buffers; no streaming. Implementations must never
//! delete objects of their own accord; object lifecycle belongs to the caller.

use async_trait::async_trait;
use snafu::{Backtrace, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The requested object doesn't exist; the one failure mode callers routinely branch on
    #[snafu(display("no object stored under {id}"))]
    NotFound { id: String, backtrace: Backtrace },
    /// Anything the underlying store coughed-up
    #[snafu(display("{source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Backend {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Object-safe trait abstracting over a key |-> bytes object store
#[async_trait]
pub trait Backend {
    /// Retrieve the object stored under `id`; [Error::NotFound] if there is none
    async fn get(&self, id: &str) -> Result<Vec<u8>>;
    /// Store `data` under `id`, overwriting any previous object
    async fn put(&self, id: &str, data: &[u8]) -> Result<()>;
    /// Remove the object stored under `id`; removing a missing object is not an error
    async fn del(&self, id: &str) -> Result<()>;
}

/// A [Backend] that can also enumerate its contents; required of the cache tier so that
/// [CachedStorage](crate::cache::CachedStorage) can rebuild its bookkeeping on startup
#[async_trait]
pub trait ListBackend: Backend {
    /// Invoke `cb` once per stored object. Implementations may hand `cb` borrowed payloads;
    /// callers wanting to retain one should copy it.
    async fn list(&self, cb: &mut (dyn for<'a> FnMut(&'a str, &'a [u8]) + Send)) -> Result<()>;
}
