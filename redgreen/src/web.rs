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

//! # web
//!
//! The redgreen HTTP surface: upload, diff view, file view, home page.
//!
//! Uploads are multipart. With file parts, the form must carry exactly one `red` & one `green`
//! file; without, the `red` & `green` *fields* carry the content and `red_name`/`green_name`
//! optionally carry the names. Either way the two files are packed into an archive, the archive
//! fingerprinted, and the short id answered as a 302 whose Location (& body) is the public URL
//! -- re-uploading the same content is a no-op returning the same link, which makes the
//! operation idempotent & lets callers blindly `curl | head -1`.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, Path, RawQuery, State},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, SecondsFormat, Utc};
use http::{
    header::{CONTENT_DISPOSITION, CONTENT_TYPE, LOCATION},
    HeaderMap, StatusCode,
};
use itertools::Itertools;
use snafu::{prelude::*, Backtrace};
use tower_http::{
    catch_panic::CatchPanicLayer, services::ServeDir, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::error;
use url::form_urlencoded;

use crate::{
    archive::{self, ArchiveEntry, ShortId},
    counter_add,
    db::{self, UploadLimits, UploadRecord, UsageStat},
    diff::{self, Normal, Options},
    http::{is_browser, ClientAddr, CT_PLAIN},
    metrics::{self, Sort},
    redgreen::Redgreen,
    render::{self, DiffPage},
    storage,
};

/// Request bodies are capped here & oversize rejected; comfortably above any text worth diffing
const MAX_BODY_SIZE: usize = 1 << 20;
/// Weekly per-client allowance, compressed bytes
const MAX_BYTES_WEEK: u64 = (1 << 20) * 2;
/// Weekly per-client allowance, upload calls
const MAX_CALLS_WEEK: u64 = 100;

inventory::submit! { metrics::Registration::new("uploads.accepted", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("uploads.deduplicated", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("uploads.limited", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("diffs.served", Sort::IntegralCounter) }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("corrupt archive: {source}"))]
    Archive { source: archive::Error },
    #[snafu(display("metadata store failure: {source}"))]
    Db { source: db::Error },
    #[snafu(display("client is over its weekly allowance"))]
    LimitsExceeded {
        reset: DateTime<Utc>,
        now: DateTime<Utc>,
    },
    #[snafu(display("no such id"))]
    NotFound { backtrace: Backtrace },
    #[snafu(display("failed to record an upload: {source}"))]
    RecordWrite {
        source: db::Error,
        /// Outcome of the compensating archive delete, when it too failed
        cleanup: Option<String>,
    },
    #[snafu(display("storage failure: {source}"))]
    Storage { source: storage::Error },
    #[snafu(display("bad request"))]
    Usage {
        detail: Option<String>,
        usage: String,
    },
}

impl Error {
    fn as_status_and_body(&self) -> (StatusCode, String) {
        match self {
            ////////////////////////////////////////////////////////////////////////////////////////
            // Broken requests-- tell the caller how to fix it
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::Usage { detail, usage } => (
                StatusCode::BAD_REQUEST,
                match detail {
                    Some(detail) => format!("error: {detail}\n{usage}"),
                    None => usage.clone(),
                },
            ),
            Error::NotFound { .. } => (StatusCode::NOT_FOUND, String::from("not found")),
            Error::LimitsExceeded { reset, now } => (
                StatusCode::TOO_MANY_REQUESTS,
                format!(
                    "limit exceeded; will reset on {} (in {})\n",
                    reset.to_rfc3339_opts(SecondsFormat::Secs, true),
                    db::approx_duration(*reset - *now),
                ),
            ),
            ////////////////////////////////////////////////////////////////////////////////////////
            // Internal failures-- log the details, tell the client nothing actionable
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::Archive { .. }
            | Error::Db { .. }
            | Error::RecordWrite { .. }
            | Error::Storage { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("500 internal server error\n"),
            ),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, body) = self.as_status_and_body();
        if status.is_server_error() {
            match &self {
                Error::RecordWrite {
                    source,
                    cleanup: Some(cleanup),
                } => error!("request error: {source} (archive cleanup also failed: {cleanup})"),
                _ => error!("request error: {self}"),
            }
        }
        (status, [(CONTENT_TYPE, CT_PLAIN)], body).into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

fn usage_error(state: &Redgreen, detail: Option<String>) -> Error {
    Error::Usage {
        detail,
        usage: state.usage_string(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the router                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub fn make_router(state: Arc<Redgreen>) -> Router {
    Router::new()
        .route("/", get(index).post(upload))
        .nest_service("/static", ServeDir::new(state.assets.clone()))
        .route("/{id}", get(serve_diff))
        .route("/{id}/red", get(serve_red))
        .route("/{id}/green", get(serve_green))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::new(Duration::from_secs(60)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index(State(state): State<Arc<Redgreen>>, headers: HeaderMap) -> Response {
    if is_browser(&headers) {
        Html(render::index_page(&state.public_url)).into_response()
    } else {
        ([(CONTENT_TYPE, CT_PLAIN)], state.usage_string()).into_response()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             upload                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One decoded multipart part
struct Part {
    name: String,
    file_name: Option<String>,
    data: Bytes,
}

async fn upload(
    State(state): State<Arc<Redgreen>>,
    ClientAddr(client): ClientAddr,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Response> {
    // A missing/broken Content-Type never reaches the handler proper; turn the rejection into
    // the usage response (its text names multipart/form-data, which is the hint that matters).
    let mut multipart = multipart.map_err(|rej| usage_error(&state, Some(rej.body_text())))?;

    let mut parts: Vec<Part> = Vec::new();
    loop {
        // Both ends of this can fail on oversize bodies (the 1 MiB cap applies), malformed
        // framing, or a disconnect; they're all the client's problem.
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return Err(usage_error(&state, Some(err.to_string()))),
        };
        let name = field.name().unwrap_or_default().to_owned();
        let file_name = field.file_name().map(str::to_owned);
        let data = field
            .bytes()
            .await
            .map_err(|err| usage_error(&state, Some(err.to_string())))?;
        parts.push(Part {
            name,
            file_name,
            data,
        });
    }

    let archive = if parts.iter().any(|p| p.file_name.is_some()) {
        archive_from_files(&state, &parts)?
    } else {
        archive_from_values(&state, &parts)?
    };

    let fp = archive::fingerprint(&archive);
    let link = format!("{}/{}", state.public_url, fp.short_id);

    // A reupload? Answer the same link; nothing counts against the client's allowance.
    if state.db.has_file(&fp.short_id).await.context(DbSnafu)? {
        counter_add!(state.instruments, "uploads.deduplicated", 1, &[]);
        return Ok(redirect(&link));
    }

    let now = Utc::now();
    let delta = UsageStat {
        period: db::period(&now),
        num_bytes: archive.len() as u64,
        num_calls: 1,
    };
    let limits = UploadLimits {
        max_bytes: MAX_BYTES_WEEK,
        max_calls: MAX_CALLS_WEEK,
    };
    if let Err(err) = state.db.add_amounts_and_compare(&client, delta, limits).await {
        if err.is_limits_exceeded() {
            counter_add!(state.instruments, "uploads.limited", 1, &[]);
            return Err(Error::LimitsExceeded {
                reset: db::reset_time(&now),
                now,
            });
        }
        return Err(Error::Db { source: err });
    }

    // Not a reupload: make the archive durable, then record it.
    state
        .storage
        .put(fp.short_id.as_str(), &archive)
        .await
        .context(StorageSnafu)?;

    let record = UploadRecord {
        created_at: Utc::now(),
        sum: fp.sum,
    };
    if let Err(err) = state.db.put_file(&fp.short_id, &record).await {
        // The archive is in storage but unrecorded; delete it on a detached task so a client
        // disconnect can't abandon the cleanup mid-flight.
        let storage = state.storage.clone();
        let id = fp.short_id.clone();
        let cleanup = tokio::spawn(async move { storage.del(id.as_str()).await });
        let cleanup = match cleanup.await {
            Ok(Ok(())) => None,
            Ok(Err(del_err)) => Some(del_err.to_string()),
            Err(join_err) => Some(join_err.to_string()),
        };
        return Err(Error::RecordWrite {
            source: err,
            cleanup,
        });
    }

    counter_add!(state.instruments, "uploads.accepted", 1, &[]);
    Ok(redirect(&link))
}

fn redirect(link: &str) -> Response {
    (
        StatusCode::FOUND,
        [
            (CONTENT_TYPE, CT_PLAIN.to_owned()),
            (LOCATION, link.to_owned()),
        ],
        format!("{link}\n"),
    )
        .into_response()
}

/// File-part mode: exactly one `red` & one `green` file, named by their filenames
fn archive_from_files(state: &Redgreen, parts: &[Part]) -> Result<Vec<u8>> {
    let one_file = |field: &str| -> Result<(String, Bytes)> {
        parts
            .iter()
            .filter(|p| p.name == field && p.file_name.is_some())
            .exactly_one()
            .map(|p| (p.file_name.clone().unwrap_or_default(), p.data.clone()))
            .map_err(|_| usage_error(state, None))
    };
    let (red_name, red) = one_file("red")?;
    let (green_name, green) = one_file("green")?;
    archive::pack(&red_name, &red, &green_name, &green).context(ArchiveSnafu)
}

/// Form-value mode: content in the `red` & `green` fields, names (optionally) in
/// `red_name`/`green_name`
fn archive_from_values(state: &Redgreen, parts: &[Part]) -> Result<Vec<u8>> {
    let one_value = |field: &str| -> Result<Bytes> {
        parts
            .iter()
            .filter(|p| p.name == field)
            .exactly_one()
            .map(|p| p.data.clone())
            .map_err(|_| usage_error(state, None))
    };
    let name_or = |field: &str, default: &str| -> String {
        parts
            .iter()
            .find(|p| p.name == field)
            .map(|p| String::from_utf8_lossy(&p.data).into_owned())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| default.to_owned())
    };
    let red = one_value("red")?;
    let green = one_value("green")?;
    let red_name = name_or("red_name", "red");
    let green_name = name_or("green_name", "green");
    archive::pack(&red_name, &red, &green_name, &green).context(ArchiveSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         diff & file views                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

static EXAMPLE_RED: &str = r#"fn say_hello(to: &str) -> String {
    format!("hello {to}!")
}

fn main() {
    println!("{}", say_hello("world"));
}
"#;

static EXAMPLE_GREEN: &str = r#"use std::{io::Write, net::TcpListener};

/// Greet whoever is passed in as an argument.
fn say_hello(to: &str) -> String {
    format!("hello {to}!")
}

fn main() {
    if std::env::var("DEBUG").as_deref() == Ok("1") {
        println!("{}", say_hello("world"));
    }
    let listener = TcpListener::bind("0.0.0.0:8080").unwrap();
    for stream in listener.incoming() {
        let mut stream = stream.unwrap();
        stream.write_all(say_hello("internet").as_bytes()).unwrap();
    }
}
"#;

/// The pair behind the fixed `example` id: a live sample diff that needs no upload
fn example_files() -> (ArchiveEntry, ArchiveEntry) {
    (
        ArchiveEntry {
            name: String::from("main.rs"),
            content: EXAMPLE_RED.as_bytes().to_vec(),
        },
        ArchiveEntry {
            name: String::from("server.rs"),
            content: EXAMPLE_GREEN.as_bytes().to_vec(),
        },
    )
}

/// Load & unpack the archive behind `id`; the metadata store is consulted first so that ids we
/// never handed out don't hit storage at all. The fixed `example` id short-circuits everything
/// (it isn't even a valid short id) & serves the baked-in demo pair.
async fn get_files(state: &Redgreen, id: &str) -> Result<(ArchiveEntry, ArchiveEntry)> {
    if id == "example" {
        return Ok(example_files());
    }
    let id: ShortId = id.parse().map_err(|_| NotFoundSnafu.build())?;
    if state.db.get_file(&id).await.context(DbSnafu)?.is_none() {
        return NotFoundSnafu.fail();
    }
    let data = state.storage.get(id.as_str()).await.map_err(|err| {
        if err.is_not_found() {
            NotFoundSnafu.build()
        } else {
            Error::Storage { source: err }
        }
    })?;
    archive::unpack(&data).context(ArchiveSnafu)
}

async fn serve_diff(
    State(state): State<Arc<Redgreen>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Result<Response> {
    // A trailing ".diff" (or a non-browser caller) gets the plain-text rendering.
    let (id, mut want_raw) = match id.strip_suffix(".diff") {
        Some(stem) => (stem.to_owned(), true),
        None => (id, false),
    };
    if !want_raw && !is_browser(&headers) {
        want_raw = true;
    }
    let (red, green) = get_files(&state, &id).await?;

    let query: Vec<(String, String)> = raw_query
        .as_deref()
        .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    let lookup = |key: &str| -> Option<&str> {
        query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };
    let space = match lookup("w") {
        Some("w") => "w",
        Some("b") => "b",
        _ => "",
    };
    let normal: Option<Normal> = match space {
        "w" => Some(diff::ignore_all_space),
        "b" => Some(diff::ignore_space_change),
        _ => None,
    };
    let context = lookup("c")
        .and_then(|c| c.parse::<i64>().ok())
        .unwrap_or(3)
        .clamp(0, 1000) as usize;
    let split = query.iter().any(|(k, _)| k == "split");

    let unified = diff::diff_with_options(
        &red.name,
        &red.content,
        &green.name,
        &green.content,
        Options { context, normal },
    );
    counter_add!(state.instruments, "diffs.served", 1, &[]);

    if want_raw {
        return Ok(([(CONTENT_TYPE, CT_PLAIN)], unified.to_string()).into_response());
    }
    let page = DiffPage {
        id: &id,
        diff: &unified,
        space,
        context,
        split,
        query: &query,
    };
    Ok(Html(render::diff_page(&page)).into_response())
}

async fn serve_red(
    State(state): State<Arc<Redgreen>>,
    Path(id): Path<String>,
) -> Result<Response> {
    serve_file(&state, &id, 0).await
}

async fn serve_green(
    State(state): State<Arc<Redgreen>>,
    Path(id): Path<String>,
) -> Result<Response> {
    serve_file(&state, &id, 1).await
}

async fn serve_file(state: &Redgreen, id: &str, index: usize) -> Result<Response> {
    let (red, green) = get_files(state, id).await?;
    let entry = if index == 0 { red } else { green };
    Ok((
        [
            (CONTENT_TYPE, CT_PLAIN.to_owned()),
            // {:?} quotes & escapes the name, which is all the quoted-string form needs.
            (CONTENT_DISPOSITION, format!("inline; filename={:?}", entry.name)),
        ],
        entry.content,
    )
        .into_response())
}
