//! RENAME and RENAMENX across nodes.

use std::sync::Arc;

use bytes::Bytes;
use tessera_protocol::{command_name, Reply};
use tracing::debug;

use crate::cluster::Cluster;
use crate::consensus::Consensus;
use crate::tcc::{gen_tx_id, strip_err, RouteMap, KEY_EXISTS};

impl<C: Consensus> Cluster<C> {
    /// Renames `cmd[1]` to `cmd[2]`. Keys on one node run there as a single
    /// command; otherwise the value moves with a two-node transaction that
    /// dumps the source, restores it at the destination and deletes the
    /// source on commit.
    pub(crate) async fn exec_rename(self: &Arc<Self>, cmd: &[Bytes]) -> Reply {
        let name = command_name(cmd);
        let nx = name == "renamenx";
        let [_, src, dst] = cmd else {
            return Reply::err(format!("wrong number of arguments for '{name}' command"));
        };

        let src_node = match self.pick_node(self.get_slot(src)) {
            Ok(node) => node,
            Err(e) => return e.into(),
        };
        let dst_node = match self.pick_node(self.get_slot(dst)) {
            Ok(node) => node,
            Err(e) => return e.into(),
        };
        if src_node == dst_node {
            return self.exec_on(&src_node, cmd).await;
        }

        let tx_id = gen_tx_id();
        let mut route_map = RouteMap::new();
        route_map.insert(src_node.clone(), vec![src.clone()]);
        route_map.insert(dst_node.clone(), vec![dst.clone()]);
        debug!(tx = %tx_id, src = %src_node, dst = %dst_node, "cross-node rename");

        let prepared = self
            .request_prepare(&src_node, &tx_id, &[Bytes::from_static(b"RenameFrom"), src.clone()])
            .await;
        let dump = match prepared {
            Reply::Bulk(dump) => dump,
            reply => {
                self.request_rollback(&tx_id, &route_map).await;
                if reply.is_error() {
                    return reply;
                }
                return Reply::err("invalid prepare response");
            }
        };

        let op: &'static [u8] = if nx { b"RenameNxTo" } else { b"RenameTo" };
        let prepared = self
            .request_prepare(&dst_node, &tx_id, &[Bytes::from_static(op), dst.clone(), dump])
            .await;
        if prepared.is_error() {
            self.request_rollback(&tx_id, &route_map).await;
            if nx && prepared.error_message() == Some(KEY_EXISTS) {
                return Reply::Integer(0);
            }
            return prepared;
        }

        for node in [&src_node, &dst_node] {
            let reply = self.request_commit(node, &tx_id).await;
            if reply.is_error() {
                self.request_rollback(&tx_id, &route_map).await;
                return Reply::err(format!("commit failed: {}", strip_err(&reply)));
            }
        }

        if nx {
            Reply::Integer(1)
        } else {
            Reply::ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use tessera_protocol::Reply;

    use crate::testkit::{key_on, TestCluster};

    #[tokio::test]
    async fn cross_node_rename_keeps_value_and_ttl() {
        let tc = TestCluster::start(2).await;
        let (a, b) = (tc.node(0), tc.node(1));
        let src = key_on(&tc, 0, "src");
        let dst = key_on(&tc, 1, "dst");

        assert!(tc.exec(0, &["SET", &src, "payload", "PX", "100000"]).await.is_ok());
        assert_eq!(tc.exec(1, &["RENAME", &src, &dst]).await, Reply::ok());

        assert!(!a.engine().exists(src.as_bytes()));
        assert_eq!(tc.local(1, &["GET", &dst]), Reply::bulk("payload"));
        let ttl = tc.local(1, &["PTTL", &dst]).as_integer().unwrap();
        assert!(ttl > 90_000 && ttl <= 100_000, "ttl {ttl}");
        assert_eq!(b.transactions.pending(), 0);
        assert_eq!(a.transactions.pending(), 0);
    }

    #[tokio::test]
    async fn renamenx_onto_existing_key_changes_nothing() {
        let tc = TestCluster::start(2).await;
        let src = key_on(&tc, 0, "src");
        let dst = key_on(&tc, 1, "dst");
        tc.exec(0, &["SET", &src, "new"]).await;
        tc.exec(0, &["SET", &dst, "old"]).await;

        assert_eq!(tc.exec(0, &["RENAMENX", &src, &dst]).await, Reply::Integer(0));
        assert_eq!(tc.local(0, &["GET", &src]), Reply::bulk("new"));
        assert_eq!(tc.local(1, &["GET", &dst]), Reply::bulk("old"));
        assert_eq!(tc.node(0).transactions.pending(), 0);
        assert_eq!(tc.node(1).transactions.pending(), 0);

        // the source is unlocked again
        assert!(tc.exec(0, &["SET", &src, "again"]).await.is_ok());

        let free = key_on(&tc, 1, "free");
        assert_eq!(tc.exec(1, &["RENAMENX", &src, &free]).await, Reply::Integer(1));
        assert_eq!(tc.local(1, &["GET", &free]), Reply::bulk("again"));
    }

    #[tokio::test]
    async fn rename_of_missing_key() {
        let tc = TestCluster::start(2).await;
        let src = key_on(&tc, 0, "src");
        let dst = key_on(&tc, 1, "dst");
        assert_eq!(
            tc.exec(1, &["RENAME", &src, &dst]).await,
            Reply::err("no such key")
        );
        assert_eq!(tc.node(0).transactions.pending(), 0);
    }

    #[tokio::test]
    async fn same_node_rename_runs_locally() {
        let tc = TestCluster::start(2).await;
        let a = key_on(&tc, 1, "a");
        let b = key_on(&tc, 1, "b");
        tc.exec(0, &["SET", &a, "v"]).await;
        assert_eq!(tc.exec(0, &["RENAME", &a, &b]).await, Reply::ok());
        assert_eq!(tc.local(1, &["GET", &b]), Reply::bulk("v"));
    }
}
