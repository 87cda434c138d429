//! High-level client API.

use crate::connection::{Connection, ConnectionConfig, HEALTH_CHECK_INTERVAL};
use crate::error::ClientError;
use crate::reply::{self, Reply};
use linekv_protocol::{Arg, STATUS_OK};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Window size for the paged key listing helper.
const KEY_PAGE_SIZE: i64 = 15;

/// High-level client for LineKV.
///
/// Wraps one [`Connection`] and exposes the command surface as thin typed
/// wrappers. All wrappers funnel through a single dispatch helper, so the
/// per-command result coercion lives in [`crate::reply`] rather than here.
#[derive(Debug)]
pub struct Client {
    config: ConnectionConfig,
    conn: Arc<Connection>,
    // Commands queued for the next exec_batch call. Owned by the client so
    // concurrent queuing serializes here instead of racing on hidden state.
    batch: Mutex<Vec<Vec<Arg>>>,
}

impl Client {
    /// Connects to the server described by `config`.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let conn = Connection::connect(config.clone()).await?;
        Ok(Self {
            config,
            conn: Arc::new(conn),
            batch: Mutex::new(Vec::new()),
        })
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// The configuration this client was built from.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Closes the connection. Idempotent.
    pub fn close(&self) {
        self.conn.close();
    }

    /// Spawns the keep-alive task: a `ping` every 30 seconds while the
    /// connection is usable. Failures are logged; recovery rides the
    /// normal error path, which already redials.
    pub fn keep_alive(&self) {
        let conn = self.conn.clone();
        let mut closed = conn.closed_watch();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.wait_for(|closed| *closed) => return,
                    _ = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {}
                }
                if !conn.is_ready() {
                    continue;
                }
                match conn.request(vec![Arg::from("ping")], None).await {
                    Ok(parts) => {
                        if crate::debug_enabled() {
                            tracing::debug!("health check ok: {:?}", parts);
                        }
                    }
                    Err(e) => tracing::warn!("health check failed: {e}"),
                }
            }
        });
    }

    /// Sends a raw argument vector and returns the raw response parts.
    pub async fn execute(&self, args: Vec<Arg>) -> Result<Vec<String>, ClientError> {
        self.conn.request(args, None).await
    }

    /// Like [`execute`](Client::execute) with an explicit per-command
    /// timeout in milliseconds (0 disables the timeout).
    pub async fn execute_with_timeout(
        &self,
        args: Vec<Arg>,
        timeout_ms: u32,
    ) -> Result<Vec<String>, ClientError> {
        self.conn.request(args, Some(timeout_ms)).await
    }

    async fn process_cmd(&self, cmd: &str, args: Vec<Arg>) -> Result<Reply, ClientError> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(Arg::from(cmd));
        full.extend(args);
        let parts = self.conn.request(full, None).await?;
        match reply::decode(cmd, parts) {
            Err(ClientError::UnexpectedResponse(parts)) => {
                if reply::reports_connection_fault(&parts) {
                    self.conn.reset();
                }
                Err(ClientError::UnexpectedResponse(parts))
            }
            other => other,
        }
    }

    // ------------------------------------------------------------------
    // Key-value commands
    // ------------------------------------------------------------------

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.process_cmd("ping", Vec::new()).await?;
        Ok(())
    }

    pub async fn auth(&self, token: &str) -> Result<bool, ClientError> {
        self.process_cmd("auth", vec![token.into()]).await?.into_bool()
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<bool, ClientError> {
        self.process_cmd("set", vec![key.into(), value.into()])
            .await?
            .into_bool()
    }

    pub async fn get(&self, key: &str) -> Result<String, ClientError> {
        self.process_cmd("get", vec![key.into()]).await?.into_string()
    }

    pub async fn del(&self, key: &str) -> Result<bool, ClientError> {
        self.process_cmd("del", vec![key.into()]).await?.into_bool()
    }

    /// Sets a key with a time-to-live in seconds.
    pub async fn setx(&self, key: &str, value: &str, ttl: i64) -> Result<String, ClientError> {
        self.process_cmd("setx", vec![key.into(), value.into(), ttl.into()])
            .await?
            .into_string()
    }

    /// Sets a key only when it does not exist yet.
    pub async fn setnx(&self, key: &str, value: &str) -> Result<bool, ClientError> {
        self.process_cmd("setnx", vec![key.into(), value.into()])
            .await?
            .into_bool()
    }

    pub async fn getset(&self, key: &str, value: &str) -> Result<String, ClientError> {
        self.process_cmd("getset", vec![key.into(), value.into()])
            .await?
            .into_string()
    }

    pub async fn incr(&self, key: &str, delta: i64) -> Result<String, ClientError> {
        self.process_cmd("incr", vec![key.into(), delta.into()])
            .await?
            .into_string()
    }

    pub async fn exists(&self, key: &str) -> Result<bool, ClientError> {
        self.process_cmd("exists", vec![key.into()]).await?.into_bool()
    }

    pub async fn expire(&self, key: &str, ttl: i64) -> Result<bool, ClientError> {
        self.process_cmd("expire", vec![key.into(), ttl.into()])
            .await?
            .into_bool()
    }

    pub async fn ttl(&self, key: &str) -> Result<String, ClientError> {
        self.process_cmd("ttl", vec![key.into()]).await?.into_string()
    }

    pub async fn scan(
        &self,
        start: &str,
        end: &str,
        limit: i64,
    ) -> Result<HashMap<String, String>, ClientError> {
        self.process_cmd("scan", vec![start.into(), end.into(), limit.into()])
            .await?
            .into_map()
    }

    pub async fn rscan(
        &self,
        start: &str,
        end: &str,
        limit: i64,
    ) -> Result<HashMap<String, String>, ClientError> {
        self.process_cmd("rscan", vec![start.into(), end.into(), limit.into()])
            .await?
            .into_map()
    }

    // ------------------------------------------------------------------
    // Hash commands
    // ------------------------------------------------------------------

    pub async fn hset(&self, hash: &str, key: &str, value: &str) -> Result<String, ClientError> {
        self.process_cmd("hset", vec![hash.into(), key.into(), value.into()])
            .await?
            .into_string()
    }

    pub async fn hget(&self, hash: &str, key: &str) -> Result<String, ClientError> {
        self.process_cmd("hget", vec![hash.into(), key.into()])
            .await?
            .into_string()
    }

    pub async fn hdel(&self, hash: &str, key: &str) -> Result<String, ClientError> {
        self.process_cmd("hdel", vec![hash.into(), key.into()])
            .await?
            .into_string()
    }

    pub async fn hincr(&self, hash: &str, key: &str, delta: i64) -> Result<String, ClientError> {
        self.process_cmd("hincr", vec![hash.into(), key.into(), delta.into()])
            .await?
            .into_string()
    }

    pub async fn hexists(&self, hash: &str, key: &str) -> Result<bool, ClientError> {
        self.process_cmd("hexists", vec![hash.into(), key.into()])
            .await?
            .into_bool()
    }

    pub async fn hsize(&self, hash: &str) -> Result<i64, ClientError> {
        self.process_cmd("hsize", vec![hash.into()]).await?.into_int()
    }

    /// Lists hash names in `[start, end)`, excluding `start` itself.
    pub async fn hlist(
        &self,
        start: &str,
        end: &str,
        limit: i64,
    ) -> Result<Vec<String>, ClientError> {
        self.process_cmd("hlist", vec![start.into(), end.into(), limit.into()])
            .await?
            .into_list()
    }

    pub async fn hkeys(
        &self,
        hash: &str,
        start: &str,
        end: &str,
        limit: i64,
    ) -> Result<Vec<String>, ClientError> {
        self.process_cmd(
            "hkeys",
            vec![hash.into(), start.into(), end.into(), limit.into()],
        )
        .await?
        .into_list()
    }

    /// Collects every key of a hash by paging through `hkeys`, using the
    /// hash size to bound the number of pages.
    pub async fn hkeys_all(&self, hash: &str) -> Result<Vec<String>, ClientError> {
        let total = self.hsize(hash).await?;
        let pages = (total + KEY_PAGE_SIZE - 1) / KEY_PAGE_SIZE;
        let mut keys: Vec<String> = Vec::new();
        for _ in 0..pages {
            let start = keys.last().cloned().unwrap_or_default();
            let page = self.hkeys(hash, &start, "", KEY_PAGE_SIZE).await?;
            if page.is_empty() {
                break;
            }
            keys.extend(page);
        }
        Ok(keys)
    }

    pub async fn hgetall(&self, hash: &str) -> Result<HashMap<String, String>, ClientError> {
        self.process_cmd("hgetall", vec![hash.into()]).await?.into_map()
    }

    pub async fn hscan(
        &self,
        hash: &str,
        start: &str,
        end: &str,
        limit: i64,
    ) -> Result<HashMap<String, String>, ClientError> {
        self.process_cmd(
            "hscan",
            vec![hash.into(), start.into(), end.into(), limit.into()],
        )
        .await?
        .into_map()
    }

    pub async fn hrscan(
        &self,
        hash: &str,
        start: &str,
        end: &str,
        limit: i64,
    ) -> Result<HashMap<String, String>, ClientError> {
        self.process_cmd(
            "hrscan",
            vec![hash.into(), start.into(), end.into(), limit.into()],
        )
        .await?
        .into_map()
    }

    /// Writes several fields of one hash in a single command.
    pub async fn multi_hset(
        &self,
        hash: &str,
        data: &HashMap<String, String>,
    ) -> Result<String, ClientError> {
        let mut args: Vec<Arg> = Vec::with_capacity(1 + data.len() * 2);
        args.push(hash.into());
        for (key, value) in data {
            args.push(key.as_str().into());
            args.push(value.as_str().into());
        }
        self.process_cmd("multi_hset", args).await?.into_string()
    }

    pub async fn multi_hget(
        &self,
        hash: &str,
        keys: &[String],
    ) -> Result<HashMap<String, String>, ClientError> {
        let mut args: Vec<Arg> = Vec::with_capacity(1 + keys.len());
        args.push(hash.into());
        args.extend(keys.iter().map(|k| Arg::from(k.as_str())));
        self.process_cmd("multi_hget", args).await?.into_map()
    }

    pub async fn multi_hdel(&self, hash: &str, keys: &[String]) -> Result<String, ClientError> {
        let mut args: Vec<Arg> = Vec::with_capacity(1 + keys.len());
        args.push(hash.into());
        args.extend(keys.iter().map(|k| Arg::from(k.as_str())));
        self.process_cmd("multi_hdel", args).await?.into_string()
    }

    pub async fn hclear(&self, hash: &str) -> Result<String, ClientError> {
        self.process_cmd("hclear", vec![hash.into()]).await?.into_string()
    }

    // ------------------------------------------------------------------
    // Queued batch
    // ------------------------------------------------------------------

    /// Queues one command for the next [`exec_batch`](Client::exec_batch).
    pub fn batch_append(&self, args: Vec<Arg>) {
        self.batch.lock().expect("batch mutex poisoned").push(args);
    }

    /// Ships the queued commands as one `batchexec` call and returns the
    /// per-command results. The queue is cleared even when the call fails.
    /// When the first queued command is `async` the server answers before
    /// executing, so no per-command results are returned.
    pub async fn exec_batch(&self) -> Result<Vec<Vec<String>>, ClientError> {
        let queued = {
            let mut batch = self.batch.lock().expect("batch mutex poisoned");
            std::mem::take(&mut *batch)
        };
        if queued.is_empty() {
            return Err(ClientError::EmptyBatch);
        }
        let fire_and_forget = matches!(
            queued.first().and_then(|cmd| cmd.first()),
            Some(Arg::Str(name)) if name == "async"
        );
        let payload = serde_json::to_string(&queued)?;
        let parts = self
            .conn
            .request(vec![Arg::from("batchexec"), Arg::from(payload)], None)
            .await?;
        if parts.len() == 2 && parts[0] == STATUS_OK {
            if fire_and_forget {
                return Ok(Vec::new());
            }
            Ok(serde_json::from_str(&parts[1])?)
        } else {
            Err(ClientError::UnexpectedResponse(parts))
        }
    }
}
