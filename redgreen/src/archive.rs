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

//! # archive
//!
//! The on-disk unit of a redgreen submission: a gzipped USTAR archive holding exactly two
//! entries, red then green, each mode 0600 with the client-supplied name. The archive bytes are
//! a deterministic function of (red name, red bytes, green name, green bytes), which is what
//! makes content addressing work: the [ShortId] is the first 40 bits of the archive's SHA-256,
//! in lowercase Crockford base32.

use std::{io::Read, str::FromStr};

use data_encoding::{Encoding, Specification};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};
use snafu::{prelude::*, Backtrace};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{id} is not a valid short id"))]
    BadId { id: String, backtrace: Backtrace },
    #[snafu(display("expected 2 archive entries, got {count}"))]
    EntryCount { count: usize, backtrace: Backtrace },
    #[snafu(display("failed to write the archive: {source}"))]
    Pack {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("failed to read the archive: {source}"))]
    Unpack {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            ShortId                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    // Crockford's base32: the digits, then the lowercase alphabet less i, l, o & u.
    static ref CROCKFORD_LOWER: Encoding = {
        let mut spec = Specification::new();
        spec.symbols.push_str("0123456789abcdefghjkmnpqrstvwxyz");
        spec.encoding().unwrap(/* known good */)
    };
    static ref RE_SHORT_ID: Regex = Regex::new("^[0-9a-hjkmnp-tv-z]{8}$").unwrap(/* known good */);
}

/// A refined type representing a redgreen object identifier
///
/// Eight characters of lowercase Crockford base32-- 40 bits of the archive's SHA-256. Collisions
/// within the working set are accepted as part of the design (40 bits keeps the URLs humane).
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ShortId(String);

impl ShortId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ShortId {
    type Err = Error;
    fn from_str(s: &str) -> Result<ShortId> {
        if RE_SHORT_ID.is_match(s) {
            Ok(ShortId(s.to_owned()))
        } else {
            BadIdSnafu { id: s.to_owned() }.fail()
        }
    }
}

/// The SHA-256 of an archive, in the two derived forms redgreen stores
pub struct Fingerprint {
    /// First 40 bits, Crockford'd; names the object everywhere
    pub short_id: ShortId,
    /// Full digest, lowercase hex; recorded in the upload record
    pub sum: String,
}

/// Fingerprint archive bytes
pub fn fingerprint(data: &[u8]) -> Fingerprint {
    let digest = Sha256::digest(data);
    Fingerprint {
        short_id: ShortId(CROCKFORD_LOWER.encode(&digest[..5])),
        sum: hex::encode(digest),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          pack & unpack                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A named file recovered from (or destined for) an archive
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArchiveEntry {
    pub name: String,
    pub content: Vec<u8>,
}

/// Pack the red & green files into a gzipped tar stream, red first
pub fn pack(red_name: &str, red: &[u8], green_name: &str, green: &[u8]) -> Result<Vec<u8>> {
    let gz = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(gz);
    for (name, content) in [(red_name, red), (green_name, green)] {
        let mut header = tar::Header::new_ustar();
        header.set_size(content.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        builder.append_data(&mut header, name, content).context(PackSnafu)?;
    }
    // The tar trailer must land inside the gzip stream: finish the builder first, the encoder
    // second.
    let gz = builder.into_inner().context(PackSnafu)?;
    gz.finish().context(PackSnafu)
}

/// Unpack an archive into its two entries, in order; any other entry count is corruption
pub fn unpack(data: &[u8]) -> Result<(ArchiveEntry, ArchiveEntry)> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    let mut files = Vec::new();
    for entry in archive.entries().context(UnpackSnafu)? {
        let mut entry = entry.context(UnpackSnafu)?;
        let name = entry
            .path()
            .context(UnpackSnafu)?
            .to_string_lossy()
            .into_owned();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).context(UnpackSnafu)?;
        files.push(ArchiveEntry { name, content });
    }
    let count = files.len();
    files
        .into_iter()
        .collect_tuple()
        .ok_or_else(|| EntryCountSnafu { count }.build())
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn round_trip() {
        let arc = pack("before.txt", b"a\nb\n", "after.txt", b"a\nc\n").unwrap();
        let (red, green) = unpack(&arc).unwrap();
        assert_eq!(red.name, "before.txt");
        assert_eq!(red.content, b"a\nb\n");
        assert_eq!(green.name, "after.txt");
        assert_eq!(green.content, b"a\nc\n");
    }

    #[test]
    fn packing_is_deterministic() {
        let a = pack("red", b"one", "green", b"two").unwrap();
        let b = pack("red", b"one", "green", b"two").unwrap();
        assert_eq!(a, b);
        assert_eq!(
            fingerprint(&a).short_id.as_str(),
            fingerprint(&b).short_id.as_str()
        );
    }

    #[test]
    fn short_ids_are_eight_crockford_chars() {
        let fp = fingerprint(b"anything at all");
        assert_eq!(fp.short_id.as_str().len(), 8);
        assert!(fp.short_id.as_str().parse::<ShortId>().is_ok());
        assert_eq!(fp.sum.len(), 64);
        // Distinct content, distinct id (with overwhelming probability).
        let other = fingerprint(b"anything at all, but different");
        assert_ne!(fp.short_id, other.short_id);
    }

    #[test]
    fn short_id_grammar() {
        assert!("abcdefgh".parse::<ShortId>().is_ok());
        assert!("01234567".parse::<ShortId>().is_ok());
        // i, l, o & u are excluded from Crockford's alphabet,
        assert!("abcdefgi".parse::<ShortId>().is_err());
        assert!("aaaaaaal".parse::<ShortId>().is_err());
        // as are uppercase & wrong lengths.
        assert!("ABCDEFGH".parse::<ShortId>().is_err());
        assert!("abcdefg".parse::<ShortId>().is_err());
        assert!("abcdefghj".parse::<ShortId>().is_err());
    }

    #[test]
    fn wrong_entry_counts_are_corruption() {
        // A single-entry archive, assembled by hand.
        let gz = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(gz);
        let mut header = tar::Header::new_ustar();
        header.set_size(3);
        header.set_mode(0o600);
        header.set_cksum();
        builder.append_data(&mut header, "only", &b"one"[..]).unwrap();
        let arc = builder.into_inner().unwrap().finish().unwrap();
        assert!(matches!(unpack(&arc), Err(Error::EntryCount { count: 1, .. })));
        // Garbage is corruption too.
        assert!(unpack(b"not a gzip stream").is_err());
    }
}
