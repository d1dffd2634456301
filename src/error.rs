// SPDX-FileCopyrightText: The rcoredump contributors
//
// SPDX-License-Identifier: GPL-3.0-only

//! Typed error enums for the two narrow capability interfaces,
//! [`Store`](crate::store::Store) and [`Index`](crate::index::Index).
//! Everything above these boundaries uses `anyhow` with `.context(..)`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("not found")]
    NotFound,
    #[error("io error: {0}")]
    Io(#[from] anyhow::Error),
    #[error("schema error: {0}")]
    Schema(String),
}
