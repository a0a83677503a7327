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

use std::{path::PathBuf, sync::Arc};

use crate::{db::Metadata, metrics::Instruments, storage::Backend};

/// Application state available to all handlers
pub struct Redgreen {
    /// The address at which this instance may be reached from the public internet; used in the
    /// curl one-liner & in redirect Locations
    pub public_url: String,
    pub storage: Arc<dyn Backend + Send + Sync>,
    pub db: Arc<dyn Metadata + Send + Sync>,
    /// Directory served under /static/
    pub assets: PathBuf,
    pub instruments: Arc<Instruments>,
}

impl Redgreen {
    pub fn usage_string(&self) -> String {
        format!(
            "usage: curl -F red=@before.txt -F green=@after.txt {}\n",
            self.public_url
        )
    }
}
