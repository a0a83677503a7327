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

//! # redgreend
//!
//! The redgreen server: a small web service that accepts two text files, stores them
//! content-addressed & serves their diff.
//!
//! Every option can be given as a flag or an environment variable (the latter being the usual
//! route inside a container). With no `--s3-endpoint`, the embedded database is permanent
//! storage; with one, archives live in the S3 bucket & the embedded database becomes a
//! size-capped cache in front of it.

use std::{io, net::SocketAddr, path::PathBuf, sync::Arc};

use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use opentelemetry::{global, KeyValue};
use snafu::{prelude::*, Backtrace};
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
};
use tracing::{info, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry};

use redgreen::{
    cache::CachedStorage,
    metrics::Instruments,
    redb::{Db, CACHE, STORAGE},
    redgreen::Redgreen,
    s3::{S3Config, S3Storage},
    storage::Backend,
    web::make_router,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     application Error type                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The redgreend application error type
///
/// Nb. [Debug] is implemented in terms of [Display]: `main()` returns `Result<(), Error>` & the
/// runtime prints the `Err` variant through its `Debug` implementation, whose derived form is
/// not fit for operators' eyes.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Failed to stand-up cached storage: {source}"))]
    Cache { source: redgreen::storage::Error },
    #[snafu(display("Failed to create {}: {source}", dir.display()))]
    CreateDir {
        dir: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to open the database: {source}"))]
    Db { source: redgreen::redb::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("While serving requests: {source}"))]
    Serve {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Options read from the command line or the environment
struct Opts {
    listen_addr: SocketAddr,
    public_url: String,
    db_file: PathBuf,
    s3_endpoint: String,
    s3_access_key: String,
    s3_access_secret: String,
    s3_bucket: String,
    s3_secure_ssl: bool,
    cache_size: u64,
    assets: PathBuf,
    plain: bool,
    level: Level,
}

impl Opts {
    fn new(matches: clap::ArgMatches) -> Opts {
        Opts {
            listen_addr: *matches.get_one::<SocketAddr>("listen-addr").unwrap(/* defaulted */),
            public_url: matches.get_one::<String>("public-url").unwrap(/* defaulted */).clone(),
            db_file: matches.get_one::<PathBuf>("db-file").unwrap(/* defaulted */).clone(),
            s3_endpoint: matches.get_one::<String>("s3-endpoint").unwrap(/* defaulted */).clone(),
            s3_access_key: matches.get_one::<String>("s3-access-key").unwrap(/* defaulted */).clone(),
            s3_access_secret: matches
                .get_one::<String>("s3-access-secret")
                .unwrap(/* defaulted */)
                .clone(),
            s3_bucket: matches.get_one::<String>("s3-bucket").unwrap(/* defaulted */).clone(),
            s3_secure_ssl: matches.get_flag("s3-secure-ssl"),
            cache_size: *matches.get_one::<u64>("cache-size").unwrap(/* defaulted */),
            assets: matches.get_one::<PathBuf>("assets").unwrap(/* defaulted */).clone(),
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

fn cli() -> Command {
    Command::new("redgreend")
        .version(crate_version!())
        .author(crate_authors!())
        .about("A pastebin for diffs")
        .long_about(
            "redgreend accepts two text files (\"red\" = old, \"green\" = new), stores them \
             under a short content-addressed id & serves their unified diff.",
        )
        .arg(
            Arg::new("listen-addr")
                .short('l')
                .long("listen-addr")
                .num_args(1)
                .value_parser(value_parser!(SocketAddr))
                .env("LISTEN_ADDR")
                .default_value("0.0.0.0:18844")
                .help("listen address for the web server"),
        )
        .arg(
            Arg::new("public-url")
                .short('u')
                .long("public-url")
                .num_args(1)
                .env("PUBLIC_URL")
                .default_value("http://localhost:18844")
                .help("URL at which this server is reachable; used in the curl example & in redirects"),
        )
        .arg(
            Arg::new("db-file")
                .short('f')
                .long("db-file")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .env("DB_FILE")
                .default_value("data/redgreen.redb")
                .help(
                    "the file used for the database; this will be a cache (when used together \
                     with S3) or the permanent store",
                ),
        )
        .arg(
            Arg::new("s3-endpoint")
                .long("s3-endpoint")
                .num_args(1)
                .env("S3_ENDPOINT")
                .default_value("")
                .help("S3 endpoint (host:port, no scheme); empty disables S3"),
        )
        .arg(
            Arg::new("s3-access-key")
                .long("s3-access-key")
                .num_args(1)
                .env("S3_ACCESS_KEY")
                .default_value("")
                .help("S3 access key"),
        )
        .arg(
            Arg::new("s3-access-secret")
                .long("s3-access-secret")
                .num_args(1)
                .env("S3_ACCESS_SECRET")
                .default_value("")
                .help("S3 access secret"),
        )
        .arg(
            Arg::new("s3-bucket")
                .long("s3-bucket")
                .num_args(1)
                .env("S3_BUCKET")
                .default_value("")
                .help("S3 bucket"),
        )
        .arg(
            Arg::new("s3-secure-ssl")
                .long("s3-secure-ssl")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("S3_SECURE_SSL")
                .help("reach the S3 endpoint over https"),
        )
        .arg(
            Arg::new("cache-size")
                .long("cache-size")
                .num_args(1)
                .value_parser(value_parser!(u64))
                .env("CACHE_SIZE")
                .default_value("134217728")
                .help("cache tier byte cap (only salient when S3 is the permanent store)"),
        )
        .arg(
            Arg::new("assets")
                .long("assets")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .env("ASSETS")
                .default_value("static")
                .help("directory served under /static/"),
        )
        .arg(
            Arg::new("debug")
                .short('D')
                .long("debug")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("REDGREEN_DEBUG")
                .help("produce debug output"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("REDGREEN_VERBOSE")
                .help("produce prolix output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("REDGREEN_QUIET")
                .help("produce only error output"),
        )
        .arg(
            Arg::new("plain")
                .short('p')
                .long("plain")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .env("REDGREEN_PLAIN")
                .help("log in human-readable format, not JSON/structured logging"),
        )
}

/// Configure redgreen logging: human-readable or JSON, to stdout (the usual case being a
/// container whose runtime collects it)
///
/// Can only be invoked once (it calls tracing's
/// [set_global_default](tracing::subscriber::set_global_default)).
fn configure_logging(opts: &Opts) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(opts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;
    // `compact()` & `json()` produce layers *of different types*, whence the Box<dyn Layer>.
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if opts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        )
    };
    tracing::subscriber::set_global_default(Registry::default().with(formatter).with(filter))
        .context(SubscriberSnafu)
}

/// Install the OTel meter provider
///
/// Must be invoked before any [Instruments] are built.
fn init_telemetry() {
    let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_resource(
            opentelemetry_sdk::Resource::builder_empty()
                .with_attribute(KeyValue::new("service.name", "redgreen"))
                .build(),
        )
        .build();
    global::set_meter_provider(provider);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Choose permanent storage per configuration: the embedded store alone, or S3 fronted by a
/// size-capped cache living in the embedded store
async fn select_storage(
    opts: &Opts,
    db: &Db,
    instruments: Arc<Instruments>,
) -> Result<Arc<dyn Backend + Send + Sync>> {
    if opts.s3_endpoint.is_empty() {
        info!("permanent storage: embedded database (no cache tier)");
        return Ok(Arc::new(db.storage(STORAGE)));
    }
    info!(
        "permanent storage: S3 at {} (cache tier capped at {} bytes)",
        opts.s3_endpoint, opts.cache_size
    );
    let permanent = Arc::new(S3Storage::new(&S3Config {
        endpoint: opts.s3_endpoint.clone(),
        access_key: opts.s3_access_key.clone(),
        access_secret: opts.s3_access_secret.clone(),
        bucket: opts.s3_bucket.clone(),
        secure: opts.s3_secure_ssl,
    }));
    let cache = Arc::new(db.storage(CACHE));
    let cached = CachedStorage::new(cache, permanent, opts.cache_size, instruments)
        .await
        .context(CacheSnafu)?;
    Ok(cached)
}

async fn shutdown_signal() {
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => (),
        _ = term.recv() => (),
    }
    info!("shutting down");
}

async fn serve(opts: Opts) -> Result<()> {
    init_telemetry();
    let instruments = Arc::new(Instruments::new("redgreen"));

    if let Some(dir) = opts.db_file.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).context(CreateDirSnafu {
            dir: dir.to_path_buf(),
        })?;
    }
    let db = Db::open(&opts.db_file).context(DbSnafu)?;
    let storage = select_storage(&opts, &db, instruments.clone()).await?;

    let state = Arc::new(Redgreen {
        public_url: opts.public_url.clone(),
        storage,
        db: Arc::new(db),
        assets: opts.assets.clone(),
        instruments,
    });

    let listener = TcpListener::bind(&opts.listen_addr)
        .await
        .context(BindSnafu {
            addr: opts.listen_addr,
        })?;
    info!(
        "redgreen {} listening on {} (public URL {})",
        crate_version!(),
        opts.listen_addr,
        opts.public_url
    );
    axum::serve(
        listener,
        make_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context(ServeSnafu)
}

fn main() -> Result<()> {
    let opts = Opts::new(cli().get_matches());
    configure_logging(&opts)?;
    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(serve(opts))
}
