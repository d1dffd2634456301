// SPDX-FileCopyrightText: The rcoredump contributors
//
// SPDX-License-Identifier: GPL-3.0-only

//! Decodes the forwarder's upload stream: a concatenation of independent
//! gzip members (header, core, optionally the executable, then one per
//! resolved link). The underlying reader is wrapped in a single shared
//! `BufReader` up front, and each segment is decoded with
//! `flate2::bufread::GzDecoder` over a `&mut` borrow of that same buffer, so
//! the decoder can be reset on the underlying reader for the next segment.
//! A fresh `flate2::read::GzDecoder` per segment would each wrap the reader
//! in its *own* private `BufReader`, whose internal buffer over-reads past
//! the current member's trailer and is discarded when the decoder drops,
//! losing everything after the first segment.

use std::io::{BufReader, Read};

use anyhow::Context;
use bytes::Bytes;
use flate2::bufread::GzDecoder;
use futures_util::{Stream, TryStreamExt};
use tokio_util::io::{StreamReader, SyncIoBridge};

use crate::store::Store;
use crate::wire::{Coredump, UploadHeader, Uid};

/// What one completed upload produced: the minted uid and the document ready
/// to be indexed.
pub struct UploadOutcome {
    pub uid: Uid,
    pub coredump: Coredump,
}

/// Consumes `body` as a sequence of gzip segments per the wire format and
/// persists each into `store`, returning the assembled document.
///
/// Runs on a blocking thread: gzip decoding and the store writes it drives
/// are both synchronous, and bridging an axum body stream down to
/// `std::io::Read` lets the whole pipeline be expressed as ordinary
/// sequential code instead of a hand-rolled async state machine.
pub async fn receive_upload<S>(
    store: Store,
    body: S,
    indexer_version: String,
) -> anyhow::Result<UploadOutcome>
where
    S: Stream<Item = Result<Bytes, axum::Error>> + Send + Unpin + 'static,
{
    let async_reader =
        StreamReader::new(body.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
    let sync_reader = SyncIoBridge::new(async_reader);
    tokio::task::spawn_blocking(move || receive_upload_blocking(&store, sync_reader, &indexer_version))
        .await
        .context("upload worker thread panicked")?
}

fn receive_upload_blocking(
    store: &Store,
    reader: impl Read,
    indexer_version: &str,
) -> anyhow::Result<UploadOutcome> {
    let uid = Uid::new();
    // One `BufReader` shared across every segment: each `GzDecoder` only
    // ever borrows it, so the unconsumed bytes `fill_buf` pulled in past a
    // member's trailer stay available to the next segment's decoder instead
    // of being dropped with a private buffer.
    let mut reader = BufReader::new(reader);

    let header = {
        let mut decoder = GzDecoder::new(&mut reader);
        let mut buf = Vec::new();
        decoder
            .read_to_end(&mut buf)
            .context("decoding upload header segment")?;
        serde_json::from_slice::<UploadHeader>(&buf).context("parsing upload header JSON")?
    };
    let mut coredump = Coredump::from_header(uid, &header, indexer_version);

    {
        let mut decoder = GzDecoder::new(&mut reader);
        coredump.core_size = store
            .put_core_sync(uid, &mut decoder)
            .context("writing core segment to store")?;
    }

    if header.include_executable {
        // Trusts `header.executable_hash` as the key rather than re-hashing
        // the decoded bytes to verify it: a forwarder bug or a malicious
        // client can mislabel an executable under the wrong hash. Accepted
        // limitation, not yet closed.
        let mut decoder = GzDecoder::new(&mut reader);
        coredump.executable_size = store
            .put_executable_sync(&header.executable_hash, &mut decoder)
            .context("writing executable segment to store")?;
    } else {
        let meta = store
            .stat_executable_sync(&header.executable_hash)
            .with_context(|| {
                format!(
                    "executable {} not previously uploaded but include_executable=false",
                    header.executable_hash
                )
            })?;
        coredump.executable_size = meta.len();
    }

    for link in header
        .links
        .iter()
        .filter(|link| link.found && link.error.is_empty())
    {
        let mut decoder = GzDecoder::new(&mut reader);
        store
            .put_link_sync(&header.executable_hash, &link.name, &mut decoder)
            .with_context(|| format!("writing link segment {} to store", link.name))?;
    }

    Ok(UploadOutcome { uid, coredump })
}
