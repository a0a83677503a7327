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

//! # The redgreen Integration Test Framework
//!
//! The integration tests drive a real redgreen server over HTTP. Rather than depending on
//! outside infrastructure, [Helper] stands the whole service up in-process: a scratch database
//! in the temp directory, an ephemeral port, a Tokio runtime kept alive for the duration. The
//! tests themselves (see `tests/smoke.rs`) then talk to it with a plain blocking HTTP client,
//! exactly as curl would.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use snafu::{prelude::*, Backtrace};
use tokio::net::TcpListener;

use redgreen::{
    metrics::Instruments,
    redb::{Db, STORAGE},
    redgreen::Redgreen,
    storage::Backend,
    web::make_router,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind an ephemeral port: {source}"))]
    Bind {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to open the scratch database: {source}"))]
    Db { source: redgreen::redb::Error },
    #[snafu(display("Failed to set-up the scratch directory: {source}"))]
    Scratch { source: std::io::Error },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// An in-process redgreen server; dropping it tears the runtime (& so the server) down
pub struct Helper {
    /// "http://127.0.0.1:<port>"; also the server's public URL, so redirect Locations resolve
    pub base_url: String,
    _runtime: tokio::runtime::Runtime,
}

impl Helper {
    pub fn start() -> Result<Helper> {
        let runtime = tokio::runtime::Runtime::new().context(TokioRuntimeSnafu)?;
        let scratch: PathBuf =
            std::env::temp_dir().join(format!("redgreen-test-{}", std::process::id()));
        // Stale state (a recycled pid, say) would throw the rate-limiter tests off.
        let _ = std::fs::remove_dir_all(&scratch);
        std::fs::create_dir_all(&scratch).context(ScratchSnafu)?;

        let base_url = runtime.block_on(async {
            let db = Db::open(scratch.join("redgreen.redb")).context(DbSnafu)?;
            let storage: Arc<dyn Backend + Send + Sync> = Arc::new(db.storage(STORAGE));
            let listener = TcpListener::bind("127.0.0.1:0").await.context(BindSnafu)?;
            let addr = listener.local_addr().context(BindSnafu)?;
            let public_url = format!("http://{addr}");
            let state = Arc::new(Redgreen {
                public_url: public_url.clone(),
                storage,
                db: Arc::new(db),
                assets: scratch.clone(),
                instruments: Arc::new(Instruments::new("redgreen-test")),
            });
            tokio::spawn(async move {
                axum::serve(
                    listener,
                    make_router(state).into_make_service_with_connect_info::<SocketAddr>(),
                )
                .await
                .expect("the test server exited");
            });
            Ok(public_url)
        })?;
        Ok(Helper {
            base_url,
            _runtime: runtime,
        })
    }
}
