//! Parallel fan-out: the chunked batch executor and the multi-write helper.
//!
//! Both spread a large command set across several connections while each
//! individual connection stays strictly sequential, so response
//! correlation on every socket remains trivial.

use crate::client::Client;
use crate::connection::Connection;
use crate::error::ClientError;
use crate::reply;
use linekv_protocol::Arg;
use std::io;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Commands per ephemeral batch connection.
pub const BATCH_CHUNK_SIZE: usize = 2000;

/// One `(hash, key, value)` write for [`Client::multi_hash_set`].
#[derive(Debug, Clone)]
pub struct HashEntry {
    pub hash: String,
    pub key: String,
    pub value: String,
}

impl HashEntry {
    pub fn new(
        hash: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            hash: hash.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Client {
    /// Executes a large command set by sharding it into chunks of
    /// [`BATCH_CHUNK_SIZE`], one ephemeral connection per chunk.
    ///
    /// Chunks run in parallel; within a chunk commands run one at a time
    /// and a failing command is logged and skipped. The first error
    /// observed anywhere is returned after every chunk has finished and
    /// all chunk connections are closed. The caller's own connection is
    /// not used.
    pub async fn batch_send(&self, commands: Vec<Vec<Arg>>) -> Result<(), ClientError> {
        if commands.is_empty() {
            return Ok(());
        }
        let chunks: Vec<Vec<Vec<Arg>>> = commands
            .chunks(BATCH_CHUNK_SIZE)
            .map(<[Vec<Arg>]>::to_vec)
            .collect();
        if crate::debug_enabled() {
            tracing::debug!(
                "batch: {} commands over {} connections to {}:{}",
                chunks.iter().map(Vec::len).sum::<usize>(),
                chunks.len(),
                self.config().host,
                self.config().port
            );
        }

        let mut tasks = JoinSet::new();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let config = self.config().clone();
            tasks.spawn(async move {
                let conn = Connection::connect(config).await?;
                let mut first_error: Option<ClientError> = None;
                for args in chunk {
                    if let Err(e) = conn.request(args, None).await {
                        tracing::warn!("batch chunk {index}: command failed: {e}");
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
                conn.close();
                match first_error {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            });
        }
        collect_first_error(&mut tasks).await
    }

    /// Writes `(hash, key, value)` triples across `parallelism`
    /// connections: `parallelism - 1` fresh ones plus the caller's own.
    ///
    /// The triples are split evenly (remainder to the last worker); each
    /// worker issues `hset` sequentially and stops at its first error
    /// while the other workers continue. The first error is returned
    /// after all workers finish; extra connections are closed first.
    pub async fn multi_hash_set(
        &self,
        entries: Vec<HashEntry>,
        parallelism: usize,
    ) -> Result<(), ClientError> {
        if entries.is_empty() {
            return Ok(());
        }
        let workers = parallelism.clamp(1, entries.len());

        let mut extra: Vec<Arc<Connection>> = Vec::with_capacity(workers - 1);
        for _ in 0..workers - 1 {
            match Connection::connect(self.config().clone()).await {
                Ok(conn) => extra.push(Arc::new(conn)),
                Err(e) => {
                    for conn in &extra {
                        conn.close();
                    }
                    return Err(e);
                }
            }
        }

        let share = entries.len() / workers;
        let mut tasks = JoinSet::new();
        for index in 0..workers {
            let start = index * share;
            let end = if index == workers - 1 {
                entries.len()
            } else {
                (index + 1) * share
            };
            let chunk = entries[start..end].to_vec();
            // The caller's connection serves as the final worker.
            let conn = extra
                .get(index)
                .cloned()
                .unwrap_or_else(|| self.connection());
            tasks.spawn(async move {
                for entry in chunk {
                    let args = vec![
                        Arg::from("hset"),
                        Arg::from(entry.hash),
                        Arg::from(entry.key),
                        Arg::from(entry.value),
                    ];
                    let parts = conn.request(args, None).await?;
                    reply::decode("hset", parts)?;
                }
                Ok(())
            });
        }

        let result = collect_first_error(&mut tasks).await;
        for conn in &extra {
            conn.close();
        }
        result
    }
}

async fn collect_first_error(
    tasks: &mut JoinSet<Result<(), ClientError>>,
) -> Result<(), ClientError> {
    let mut first_error: Option<ClientError> = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => Err(ClientError::Io(io::Error::new(io::ErrorKind::Other, e))),
        };
        if let Err(e) = outcome {
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
