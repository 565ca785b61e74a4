//! TCP front end shared by clients and peers.
//!
//! Each connection reads command-line frames and answers each with one
//! reply frame, except `cluster.migration.export`, which answers with a
//! stream of restore lines and a final `OK`.

use std::future::Future;
use std::sync::Arc;

use subtle::ConstantTimeEq;
use tessera_protocol::{command_name, read_frame, write_frame, CmdLine, FrameError, Reply};
use tokio::io::BufStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::cluster::Cluster;
use crate::consensus::Consensus;

/// Default maximum number of concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// When set, connections must `AUTH` before anything else.
    pub requirepass: Option<String>,
    pub max_connections: usize,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            requirepass: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Accepts connections until `shutdown` resolves, then waits for open
/// connections to finish.
pub async fn serve<C, F>(
    listener: TcpListener,
    cluster: Arc<Cluster<C>>,
    options: ListenerOptions,
    shutdown: F,
) -> std::io::Result<()>
where
    C: Consensus,
    F: Future<Output = ()>,
{
    let max_conn = options.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_conn));
    let password: Option<Arc<str>> = options.requirepass.map(Arc::from);
    if let Ok(addr) = listener.local_addr() {
        info!(node = %cluster.self_id(), "listening on {addr} (max {max_conn} connections)");
    }

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received, draining connections...");
                break;
            }

            result = listener.accept() => {
                let (stream, peer) = result?;
                let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("connection limit reached, dropping connection from {peer}");
                        drop(stream);
                        continue;
                    }
                };

                let cluster = Arc::clone(&cluster);
                let password = password.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle(stream, cluster, password).await {
                        debug!("connection error from {peer}: {e}");
                    }
                    drop(permit);
                });
            }
        }
    }

    info!("waiting for active connections to close...");
    if semaphore.acquire_many(max_conn as u32).await.is_err() {
        error!("connection semaphore closed while draining");
    }
    info!("all connections drained");
    Ok(())
}

fn check_auth(password: Option<&str>, cmd: &CmdLine) -> Reply {
    let Some(expected) = password else {
        return Reply::err("Client sent AUTH, but no password is set");
    };
    match cmd.get(1) {
        Some(given) if cmd.len() == 2 => {
            if bool::from(expected.as_bytes().ct_eq(given)) {
                Reply::ok()
            } else {
                Reply::Error("WRONGPASS invalid password".into())
            }
        }
        _ => Reply::err("wrong number of arguments for 'auth' command"),
    }
}

async fn handle<C: Consensus>(
    stream: TcpStream,
    cluster: Arc<Cluster<C>>,
    password: Option<Arc<str>>,
) -> Result<(), FrameError> {
    stream.set_nodelay(true)?;
    let mut conn = BufStream::new(stream);
    let mut authenticated = password.is_none();

    loop {
        let cmd: CmdLine = match read_frame(&mut conn).await {
            Ok(cmd) => cmd,
            Err(FrameError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };
        let name = command_name(&cmd);

        if name == "auth" {
            let reply = check_auth(password.as_deref(), &cmd);
            authenticated = authenticated || reply.is_ok();
            write_frame(&mut conn, &reply).await?;
            continue;
        }
        if !authenticated {
            let reply = Reply::Error("NOAUTH Authentication required.".into());
            write_frame(&mut conn, &reply).await?;
            continue;
        }

        if name == "cluster.migration.export" && cmd.len() == 2 {
            stream_export(&mut conn, &cluster, &cmd).await?;
            continue;
        }
        let reply = cluster.exec(&cmd).await;
        write_frame(&mut conn, &reply).await?;
    }
}

async fn stream_export<C: Consensus>(
    conn: &mut BufStream<TcpStream>,
    cluster: &Arc<Cluster<C>>,
    cmd: &CmdLine,
) -> Result<(), FrameError> {
    let id = String::from_utf8_lossy(&cmd[1]).into_owned();
    let cursor = match cluster.begin_export(&id).await {
        Ok(cursor) => cursor,
        Err(e) => {
            warn!(task = %id, "export refused: {e}");
            return write_frame(conn, &Reply::from(e)).await;
        }
    };
    let mut sent = 0usize;
    for line in cursor {
        write_frame(conn, &Reply::from_cmd_line(&line)).await?;
        sent += 1;
    }
    debug!(task = %id, keys = sent, "export stream complete");
    write_frame(conn, &Reply::ok()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_protocol::cmd_line;

    use crate::config::PoolConfig;
    use crate::peer::PeerClient;
    use crate::testkit::TestCluster;

    #[test]
    fn auth_checks() {
        let auth = |parts: &[&str]| check_auth(Some("s3cret"), &cmd_line(parts));
        assert!(auth(&["AUTH", "s3cret"]).is_ok());
        assert!(auth(&["AUTH", "nope"]).is_error());
        assert!(auth(&["AUTH"]).is_error());
        assert!(check_auth(None, &cmd_line(&["AUTH", "x"])).is_error());
    }

    #[tokio::test]
    async fn password_protected_listener() {
        let tc = TestCluster::start_with_password(1, "s3cret").await;
        let addr = tc.id(0).to_string();

        let mut anonymous = PeerClient::connect(&addr, &PoolConfig::default())
            .await
            .unwrap();
        let reply = anonymous.send(&cmd_line(&["PING"])).await.unwrap();
        assert_eq!(reply, Reply::Error("NOAUTH Authentication required.".into()));

        let config = PoolConfig {
            password: Some("s3cret".into()),
            ..PoolConfig::default()
        };
        let mut client = PeerClient::connect(&addr, &config).await.unwrap();
        assert_eq!(
            client.send(&cmd_line(&["PING"])).await.unwrap(),
            Reply::Simple("PONG".into())
        );
    }

    #[tokio::test]
    async fn export_of_unknown_task_is_an_error_reply() {
        let tc = TestCluster::start(1).await;
        let mut stream = tc
            .node(0)
            .connections()
            .new_stream(tc.id(0).as_str(), &cmd_line(&["cluster.migration.export", "nope"]))
            .await
            .unwrap();
        let reply = stream.recv().await.unwrap().unwrap();
        assert!(reply.is_error());
        assert!(stream.recv().await.is_none());
    }
}
