//! TCP framing for raft RPC messages.
//!
//! A frame is a 4-byte big-endian length followed by a bincode payload.
//! With a [`ClusterSecret`] configured, a 32-byte HMAC-SHA256 tag follows
//! the payload inside the length-delimited frame, and the receiver checks
//! it before deserializing.

use std::io;

use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::auth::{ClusterSecret, TAG_LEN};
use crate::raft::TypeConfig;

/// Topology snapshots are small; anything past this is a bug or an attack.
pub(crate) const MAX_RAFT_FRAME_SIZE: usize = 10 * 1024 * 1024;

#[derive(Serialize, Deserialize)]
pub(crate) enum RaftRpc {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<u64>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

#[derive(Serialize, Deserialize)]
pub(crate) enum RaftRpcResponse {
    AppendEntries(AppendEntriesResponse<u64>),
    Vote(VoteResponse<u64>),
    InstallSnapshot(InstallSnapshotResponse<u64>),
}

fn invalid(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Writes one frame, tagged when `secret` is set.
pub(crate) async fn write_rpc<W, T>(
    w: &mut W,
    msg: &T,
    secret: Option<&ClusterSecret>,
) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(msg).map_err(invalid)?;
    let tag = secret.map(|s| s.sign(&data));
    let total = data.len() + tag.map_or(0, |_| TAG_LEN);
    if total > MAX_RAFT_FRAME_SIZE {
        return Err(invalid(format!(
            "raft frame size {total} exceeds limit {MAX_RAFT_FRAME_SIZE}"
        )));
    }
    w.write_all(&(total as u32).to_be_bytes()).await?;
    w.write_all(&data).await?;
    if let Some(tag) = tag {
        w.write_all(&tag).await?;
    }
    w.flush().await
}

/// Reads one frame, verifying its tag when `secret` is set.
pub(crate) async fn read_rpc<R, T>(r: &mut R, secret: Option<&ClusterSecret>) -> io::Result<T>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_RAFT_FRAME_SIZE {
        return Err(invalid(format!(
            "raft frame size {len} exceeds limit {MAX_RAFT_FRAME_SIZE}"
        )));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;

    let payload = match secret {
        Some(secret) => {
            if len < TAG_LEN {
                return Err(invalid("raft frame too short for auth tag"));
            }
            let (payload, tag) = buf.split_at(len - TAG_LEN);
            if !secret.verify(payload, tag) {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "raft auth failed",
                ));
            }
            payload
        }
        None => &buf[..],
    };
    bincode::deserialize(payload).map_err(invalid)
}
