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

//! # s3
//!
//! Permanent storage on any S3-compatible service (AWS itself, MinIO, Garage...). Objects are
//! whole small buffers, so everything goes over the wire in one shot; path-style addressing
//! keeps self-hosted endpoints happy. This backend is not list-capable & so can only serve in
//! the permanent role.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Credentials, Region},
    primitives::ByteStream,
    Client,
};

use crate::storage::{self, Backend};

/// Connection parameters for an S3-compatible endpoint
#[derive(Clone, Debug)]
pub struct S3Config {
    /// Host (and optional port) of the endpoint, without a scheme
    pub endpoint: String,
    pub access_key: String,
    pub access_secret: String,
    pub bucket: String,
    /// https when true, plain http else (local MinIO, usually)
    pub secure: bool,
}

pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(cfg: &S3Config) -> S3Storage {
        let scheme = if cfg.secure { "https" } else { "http" };
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(format!("{scheme}://{}", cfg.endpoint))
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new(
                cfg.access_key.clone(),
                cfg.access_secret.clone(),
                None,
                None,
                "redgreen",
            ))
            .force_path_style(true)
            .build();
        S3Storage {
            client: Client::from_conf(config),
            bucket: cfg.bucket.clone(),
        }
    }
}

#[async_trait]
impl Backend for S3Storage {
    async fn get(&self, id: &str) -> storage::Result<Vec<u8>> {
        let rsp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(id)
            .send()
            .await;
        match rsp {
            Ok(out) => Ok(out
                .body
                .collect()
                .await
                .map_err(storage::Error::backend)?
                .into_bytes()
                .to_vec()),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_no_such_key() {
                    storage::NotFoundSnafu { id: id.to_owned() }.fail()
                } else {
                    Err(storage::Error::backend(err))
                }
            }
        }
    }

    async fn put(&self, id: &str, data: &[u8]) -> storage::Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(id)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map(|_| ())
            .map_err(|err| storage::Error::backend(err.into_service_error()))
    }

    async fn del(&self, id: &str) -> storage::Result<()> {
        // S3 treats deletion of a missing key as success, which is exactly the contract.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(id)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| storage::Error::backend(err.into_service_error()))
    }
}
