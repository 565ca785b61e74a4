//! Connections to other cluster nodes.
//!
//! [`ConnectionFactory`] keeps one bounded pool per peer address. A pool
//! caps concurrent borrows with a semaphore (`max_active`) and keeps at
//! most `max_idle` authenticated connections around for reuse. Streams
//! for bulk transfer bypass the pool and get a dedicated connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tessera_protocol::{cmd_line, format_cmd_line, read_frame, write_frame, FrameError, Reply};
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::ClusterError;

/// Inbound buffer of a [`PeerStream`].
const STREAM_BUFFER: usize = 64;

/// A single authenticated connection to a peer.
#[derive(Debug)]
pub struct PeerClient {
    addr: String,
    conn: BufStream<TcpStream>,
    read_timeout: std::time::Duration,
    broken: bool,
}

impl PeerClient {
    /// Dials `addr` and authenticates when the pool config has a password.
    pub async fn connect(addr: &str, config: &PoolConfig) -> Result<Self, ClusterError> {
        let stream = timeout(config.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClusterError::peer(addr, "connect timed out"))?
            .map_err(|e| ClusterError::peer(addr, e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ClusterError::peer(addr, e))?;

        let mut client = Self {
            addr: addr.to_string(),
            conn: BufStream::new(stream),
            read_timeout: config.read_timeout,
            broken: false,
        };
        if let Some(password) = &config.password {
            let reply = client.send(&cmd_line(&["AUTH", password.as_str()])).await?;
            if !reply.is_ok() {
                return Err(ClusterError::peer(addr, format!("auth failed: {reply}")));
            }
        }
        Ok(client)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Set once an I/O error has been seen. Broken clients are never
    /// returned to a pool.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Sends one command and waits for its reply. Error replies from the
    /// peer are returned as `Ok`.
    pub async fn send(&mut self, cmd: &[Bytes]) -> Result<Reply, ClusterError> {
        let result = self.round_trip(cmd).await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    async fn round_trip(&mut self, cmd: &[Bytes]) -> Result<Reply, ClusterError> {
        write_frame(&mut self.conn, &cmd)
            .await
            .map_err(|e| ClusterError::frame(&self.addr, e))?;
        match timeout(self.read_timeout, read_frame(&mut self.conn)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(ClusterError::frame(&self.addr, e)),
            Err(_) => Err(ClusterError::Timeout(format!(
                "{} to {}",
                format_cmd_line(cmd),
                self.addr
            ))),
        }
    }
}

/// A client on loan from a pool. Holds one of the pool's active slots
/// until it is returned or dropped.
#[derive(Debug)]
pub struct PooledClient {
    client: PeerClient,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledClient {
    type Target = PeerClient;

    fn deref(&self) -> &PeerClient {
        &self.client
    }
}

impl std::ops::DerefMut for PooledClient {
    fn deref_mut(&mut self) -> &mut PeerClient {
        &mut self.client
    }
}

#[derive(Debug)]
struct Pool {
    idle: Mutex<Vec<PeerClient>>,
    active: Arc<Semaphore>,
}

impl Pool {
    fn new(config: &PoolConfig) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(config.max_idle)),
            active: Arc::new(Semaphore::new(config.max_active)),
        }
    }

    fn idle(&self) -> MutexGuard<'_, Vec<PeerClient>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-peer connection pools.
#[derive(Debug)]
pub struct ConnectionFactory {
    pools: Mutex<HashMap<String, Arc<Pool>>>,
    config: PoolConfig,
}

impl ConnectionFactory {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn pools(&self) -> MutexGuard<'_, HashMap<String, Arc<Pool>>> {
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pool_for(&self, addr: &str) -> Arc<Pool> {
        let mut pools = self.pools();
        Arc::clone(
            pools
                .entry(addr.to_string())
                .or_insert_with(|| Arc::new(Pool::new(&self.config))),
        )
    }

    /// Borrows an authenticated client for `addr`, reusing an idle one when
    /// possible. Fails with [`ClusterError::PoolExhausted`] if no active
    /// slot frees up within the wait timeout.
    pub async fn borrow_peer_client(&self, addr: &str) -> Result<PooledClient, ClusterError> {
        let pool = self.pool_for(addr);
        let permit = match timeout(
            self.config.wait_timeout,
            Arc::clone(&pool.active).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            _ => return Err(ClusterError::PoolExhausted(addr.to_string())),
        };

        let reused = pool.idle().pop();
        let client = match reused {
            Some(client) => client,
            None => PeerClient::connect(addr, &self.config).await?,
        };
        Ok(PooledClient {
            client,
            _permit: permit,
        })
    }

    /// Gives a borrowed client back. Broken clients and clients beyond the
    /// idle limit are closed.
    pub fn return_peer_client(&self, pooled: PooledClient) -> Result<(), ClusterError> {
        let PooledClient { client, _permit } = pooled;
        let pool = self
            .pools()
            .get(client.addr())
            .cloned()
            .ok_or_else(|| ClusterError::PoolNotFound(client.addr().to_string()))?;
        if client.is_broken() {
            debug!(peer = client.addr(), "discarding broken connection");
            return Ok(());
        }
        let mut idle = pool.idle();
        if idle.len() < self.config.max_idle {
            idle.push(client);
        }
        Ok(())
    }

    /// Borrows, sends `cmd`, and returns the client, whatever the outcome.
    pub async fn send(&self, addr: &str, cmd: &[Bytes]) -> Result<Reply, ClusterError> {
        let mut client = self.borrow_peer_client(addr).await?;
        let result = client.send(cmd).await;
        if let Err(e) = self.return_peer_client(client) {
            debug!("return connection: {e}");
        }
        result
    }

    /// Opens a dedicated connection, sends `cmd`, and streams the replies
    /// back. The stream ends after the first reply that is not an array,
    /// which the sender uses as its terminator, or after an error. Each
    /// reply must arrive within the read timeout.
    pub async fn new_stream(&self, addr: &str, cmd: &[Bytes]) -> Result<PeerStream, ClusterError> {
        let mut client = PeerClient::connect(addr, &self.config).await?;
        write_frame(&mut client.conn, &cmd)
            .await
            .map_err(|e| ClusterError::frame(addr, e))?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let read_timeout = client.read_timeout;
        let reader = tokio::spawn(async move {
            loop {
                let read = timeout(read_timeout, read_frame::<_, Reply>(&mut client.conn)).await;
                let item = match read {
                    Ok(Ok(reply)) => Ok(reply),
                    Ok(Err(FrameError::Closed)) => Err(ClusterError::peer(
                        &client.addr,
                        "stream closed before completion",
                    )),
                    Ok(Err(e)) => Err(ClusterError::frame(&client.addr, e)),
                    Err(_) => Err(ClusterError::Timeout(format!("stream from {}", client.addr))),
                };
                let last = !matches!(item, Ok(Reply::Array(_)));
                if tx.send(item).await.is_err() || last {
                    break;
                }
            }
        });
        Ok(PeerStream { rx, reader })
    }

    /// Drops every pool along with its idle connections.
    pub fn close(&self) {
        self.pools().clear();
    }
}

/// Inbound side of a streaming request.
#[derive(Debug)]
pub struct PeerStream {
    rx: mpsc::Receiver<Result<Reply, ClusterError>>,
    reader: JoinHandle<()>,
}

impl PeerStream {
    /// Next reply, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Result<Reply, ClusterError>> {
        self.rx.recv().await
    }

    pub fn close(self) {}
}

impl Drop for PeerStream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
