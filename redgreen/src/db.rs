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

//! # db
//!
//! The redgreen metadata store: one record per upload, keyed by short id, plus a usage counter
//! per client for rate limiting. Both are tiny JSON documents in an ordered key-value store;
//! the trait below abstracts over the store so the handlers don't care which one is configured.
//!
//! Rate limiting is deliberately coarse: one bucket per client per 7-day yearday window,
//! persisted so that restarts don't forgive anyone. The period key is recomputed on every call
//! rather than cached anywhere.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Days, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu};

use crate::archive::ShortId;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The sentinel [add_amounts_and_compare](Metadata::add_amounts_and_compare) returns when a
    /// client is over its weekly allowance; nothing is persisted in that case
    #[snafu(display("limits exceeded"))]
    LimitsExceeded { backtrace: Backtrace },
    /// Anything the underlying store coughed-up
    #[snafu(display("{source}"))]
    Metadata {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn metadata(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Metadata {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
    pub fn is_limits_exceeded(&self) -> bool {
        matches!(self, Error::LimitsExceeded { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            records                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An uploaded archive's record: created on first upload, never mutated, never deleted
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct UploadRecord {
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 of the archive bytes
    pub sum: String,
}

/// A client's usage within one weekly window
// The single-letter field names are the wire format; these documents outlive any one version of
// the program.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct UsageStat {
    #[serde(rename = "p")]
    pub period: String,
    #[serde(rename = "nb")]
    pub num_bytes: u64,
    #[serde(rename = "nc")]
    pub num_calls: u64,
}

/// Per-window ceilings enforced by [add_amounts_and_compare](Metadata::add_amounts_and_compare)
#[derive(Clone, Copy, Debug)]
pub struct UploadLimits {
    pub max_bytes: u64,
    pub max_calls: u64,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        weekly windows                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The window key for `now`: "YYYY/W" where W = (yearday - 1) / 7
pub fn period(now: &DateTime<Utc>) -> String {
    format!("{}/{}", now.year(), (now.ordinal() - 1) / 7)
}

/// The UTC instant at which `now`'s window rolls over: midnight of yearday (W+1)*7 + 1
/// (normalized across year end, so late-December windows reset in January)
pub fn reset_time(now: &DateTime<Utc>) -> DateTime<Utc> {
    let week = (now.ordinal() - 1) / 7;
    let jan1 = NaiveDate::from_ymd_opt(now.year(), 1, 1).unwrap(/* known good */);
    let date = jan1 + Days::new(((week + 1) * 7) as u64);
    date.and_hms_opt(0, 0, 0).unwrap(/* known good */).and_utc()
}

/// Render a [TimeDelta] the way the 429 body wants it: "37h14m09s"
pub fn approx_duration(delta: TimeDelta) -> String {
    let secs = delta.num_seconds().max(0);
    format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the trait                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Object-safe trait abstracting over the metadata store
#[async_trait]
pub trait Metadata {
    /// Cheaper [get_file](Metadata::get_file) when only existence matters
    async fn has_file(&self, id: &ShortId) -> Result<bool>;
    /// Retrieve the record for `id`; `None` if it was never uploaded
    async fn get_file(&self, id: &ShortId) -> Result<Option<UploadRecord>>;
    async fn put_file(&self, id: &ShortId, record: &UploadRecord) -> Result<()>;
    /// Atomically fold `delta` into `key`'s counter & enforce `limits`
    ///
    /// If the stored counter's period differs from `delta`'s, the counter restarts from `delta`
    /// before comparison. If either total would exceed its limit, nothing is persisted and the
    /// [LimitsExceeded](Error::LimitsExceeded) sentinel comes back. Implementations must
    /// serialize this read-modify-write per key.
    async fn add_amounts_and_compare(
        &self,
        key: &str,
        delta: UsageStat,
        limits: UploadLimits,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {

    use super::*;

    use chrono::TimeZone;

    #[test]
    fn period_keys() {
        let jan1 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(period(&jan1), "2024/0");
        let jan8 = Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap();
        assert_eq!(period(&jan8), "2024/1");
        let jan7 = Utc.with_ymd_and_hms(2024, 1, 7, 23, 59, 59).unwrap();
        assert_eq!(period(&jan7), "2024/0");
    }

    #[test]
    fn reset_times_land_on_window_boundaries() {
        for (y, m, d) in [(2024, 1, 3), (2024, 6, 15), (2023, 12, 30)] {
            let now = Utc.with_ymd_and_hms(y, m, d, 13, 45, 0).unwrap();
            let reset = reset_time(&now);
            assert!(reset > now);
            // A window boundary is always yearday 7k+1.
            assert_eq!((reset.ordinal() - 1) % 7, 0, "now={now}");
            // And the reset belongs to the *next* window.
            assert_ne!(period(&now), period(&reset));
        }
    }

    #[test]
    fn year_end_windows_reset_in_january() {
        // Yearday 366 of a leap year sits in window 52; window 53's first day normalizes into
        // the following January.
        let now = Utc.with_ymd_and_hms(2024, 12, 31, 8, 0, 0).unwrap();
        assert_eq!(period(&now), "2024/52");
        let reset = reset_time(&now);
        assert_eq!(reset, Utc.with_ymd_and_hms(2025, 1, 6, 0, 0, 0).unwrap());
    }

    #[test]
    fn durations_render_compactly() {
        assert_eq!(approx_duration(TimeDelta::seconds(0)), "0h00m00s");
        assert_eq!(approx_duration(TimeDelta::seconds(3661)), "1h01m01s");
        assert_eq!(approx_duration(TimeDelta::seconds(134_129)), "37h15m29s");
    }
}
