// SPDX-FileCopyrightText: The rcoredump contributors
//
// SPDX-License-Identifier: GPL-3.0-only

//! Build metadata surfaced by `GET /about`. No `vergen` build-dependency is
//! introduced here: the commit hash is read from an optional environment
//! variable set by CI at build time, defaulting honestly to `"unknown"`
//! rather than faking one.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct About {
    pub version: &'static str,
    pub commit: &'static str,
    pub built_at: &'static str,
}

pub fn about() -> About {
    About {
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("RCOREDUMP_COMMIT").unwrap_or("unknown"),
        built_at: option_env!("RCOREDUMP_BUILT_AT").unwrap_or("unknown"),
    }
}
