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

//! # http
//!
//! Low-level HTTP-related utilities that don't depend on much of anything else.

use std::{convert::Infallible, net::SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts};
use http::{header::USER_AGENT, request::Parts, HeaderMap};
use lazy_static::lazy_static;
use regex::Regex;
use tap::Pipe;

pub const CT_PLAIN: &str = "text/plain; charset=utf-8";
pub const CT_HTML: &str = "text/html; charset=utf-8";

lazy_static! {
    static ref RE_BROWSER: Regex =
        Regex::new("(?i)(?:chrome|firefox|safari|gecko)/").unwrap(/* known good */);
}

/// Guess whether the requester is an interactive browser (as opposed to curl & friends); used
/// only to pick between HTML & plain-text renderings, so a wrong guess is merely cosmetic
pub fn is_browser(headers: &HeaderMap) -> bool {
    headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|ua| RE_BROWSER.is_match(ua))
}

/// The requesting client's address, as an opaque string
///
/// Prefers the first entry of `X-Forwarded-For` (redgreen expects to sit behind a reverse
/// proxy), falling back to the socket peer address. Extraction never fails: rate limiting
/// should degrade to a shared bucket rather than fail requests, so an unidentifiable client
/// maps to a fixed key.
#[derive(Clone, Debug)]
pub struct ClientAddr(pub String);

impl<S> FromRequestParts<S> for ClientAddr
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|first| first.trim().to_owned())
            .filter(|first| !first.is_empty())
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|info| info.0.ip().to_string())
            })
            .unwrap_or_else(|| String::from("unknown"))
            .pipe(ClientAddr)
            .pipe(Ok)
    }
}
