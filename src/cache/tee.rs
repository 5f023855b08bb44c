//! Streaming cache population.
//!
//! A tee consumes the upstream body once, forwarding every chunk to the
//! client while duplicating it into the chosen tier. The artifact is
//! installed only on a clean end-of-body; a client disconnect or an upstream
//! read error discards the partial copy and leaves the cache untouched.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Cache, CacheKey};

/// Channel depth between the tee task and the client body stream.
const TEE_BUFFER_CHUNKS: usize = 32;

/// Stream the upstream body to the client while buffering it for the memory
/// tier. Bodies that grow past `ceiling` keep streaming but stop buffering.
pub fn tee_to_memory(
    upstream: reqwest::Response,
    cache: Arc<Cache>,
    key: CacheKey,
    headers: Vec<(String, String)>,
    etag: Option<String>,
    ttl: Duration,
    ceiling: u64,
) -> mpsc::Receiver<Result<Bytes, std::io::Error>> {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(TEE_BUFFER_CHUNKS);

    tokio::spawn(async move {
        let mut stream = upstream.bytes_stream();
        let mut buf = BytesMut::new();
        let mut buffering = true;
        let mut clean = true;

        while let Some(chunk_result) = stream.next().await {
            match chunk_result {
                Ok(chunk) => {
                    if buffering {
                        if (buf.len() + chunk.len()) as u64 > ceiling {
                            debug!(key = %key, "body exceeded cache ceiling, streaming only");
                            buffering = false;
                            buf = BytesMut::new();
                        } else {
                            buf.extend_from_slice(&chunk);
                        }
                    }
                    if tx.send(Ok(chunk)).await.is_err() {
                        // Client disconnected; the partial copy is dropped.
                        clean = false;
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                    clean = false;
                    break;
                }
            }
        }

        if clean && buffering && !buf.is_empty() {
            cache.insert_memory(&key, buf.freeze(), headers, etag, ttl);
        }
    });

    rx
}

/// Stream the upstream body to the client while duplicating it into a
/// temporary file, committing data-then-metadata atomically on clean end.
pub fn tee_to_disk(
    upstream: reqwest::Response,
    cache: Arc<Cache>,
    key: CacheKey,
    headers: Vec<(String, String)>,
    etag: Option<String>,
    ttl: Duration,
) -> mpsc::Receiver<Result<Bytes, std::io::Error>> {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(TEE_BUFFER_CHUNKS);

    tokio::spawn(async move {
        if let Err(e) = cache.ensure_shard_dir(&key).await {
            warn!(key = %key, error = %e, "cannot create cache shard, streaming only");
            pump_without_caching(upstream, tx).await;
            return;
        }

        let tmp = cache.tmp_path(&key);
        let mut file = match tokio::fs::File::create(&tmp).await {
            Ok(f) => f,
            Err(e) => {
                warn!(key = %key, error = %e, "cannot create temp file, streaming only");
                pump_without_caching(upstream, tx).await;
                return;
            }
        };

        let mut stream = upstream.bytes_stream();
        let mut written: u64 = 0;
        let mut writing = true;
        let mut clean = true;

        while let Some(chunk_result) = stream.next().await {
            match chunk_result {
                Ok(chunk) => {
                    if writing {
                        if let Err(e) = file.write_all(&chunk).await {
                            // A full disk must not take the download down
                            // with it; keep serving the client.
                            warn!(key = %key, error = %e, "tee write failed, streaming only");
                            writing = false;
                        } else {
                            written += chunk.len() as u64;
                        }
                    }
                    if tx.send(Ok(chunk)).await.is_err() {
                        clean = false;
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                    clean = false;
                    break;
                }
            }
        }

        if clean && writing {
            if let Err(e) = file.flush().await {
                warn!(key = %key, error = %e, "tee flush failed");
                drop(file);
                let _ = tokio::fs::remove_file(&tmp).await;
                return;
            }
            drop(file);
            if let Err(e) = cache
                .commit_disk(&key, &tmp, headers, etag, written, ttl)
                .await
            {
                warn!(key = %key, error = %e, "disk commit failed");
                let _ = tokio::fs::remove_file(&tmp).await;
            }
        } else {
            drop(file);
            let _ = tokio::fs::remove_file(&tmp).await;
        }
    });

    rx
}

/// Fallback pump when the cache side of a tee cannot be set up.
async fn pump_without_caching(
    upstream: reqwest::Response,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    let mut stream = upstream.bytes_stream();
    while let Some(chunk_result) = stream.next().await {
        let forwarded = match chunk_result {
            Ok(chunk) => Ok(chunk),
            Err(e) => Err(std::io::Error::other(e.to_string())),
        };
        let failed = forwarded.is_err();
        if tx.send(forwarded).await.is_err() || failed {
            break;
        }
    }
}
