//! MSET and DEL over keys owned by several nodes.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tessera_protocol::{command_name, CmdLine, Reply};

use crate::cluster::Cluster;
use crate::consensus::Consensus;
use crate::tcc::TccTx;

impl<C: Consensus> Cluster<C> {
    /// `MSET k v [k v ...]`
    pub(crate) async fn exec_mset(self: &Arc<Self>, cmd: &[Bytes]) -> Reply {
        let args = &cmd[1..];
        if args.is_empty() || args.len() % 2 != 0 {
            return Reply::err("wrong number of arguments for 'mset' command");
        }
        let keys: Vec<Bytes> = args.iter().step_by(2).cloned().collect();
        let route_map = match self.group_by_node(&keys) {
            Ok(map) => map,
            Err(e) => return e.into(),
        };
        if route_map.len() == 1 {
            if let Some(node) = route_map.keys().next() {
                return self.exec_on(node, cmd).await;
            }
        }

        let mut cmd_lines: BTreeMap<_, CmdLine> = BTreeMap::new();
        for pair in args.chunks(2) {
            let node = match self.pick_node(self.get_slot(&pair[0])) {
                Ok(node) => node,
                Err(e) => return e.into(),
            };
            cmd_lines
                .entry(node)
                .or_insert_with(|| vec![Bytes::from_static(b"MSet")])
                .extend_from_slice(pair);
        }

        match self.do_tcc(&TccTx::new(route_map, cmd_lines)).await {
            Ok(_) => Reply::ok(),
            Err(reply) => reply,
        }
    }

    /// `DEL k [k ...]`: replies with the total number of keys removed.
    pub(crate) async fn exec_del(self: &Arc<Self>, cmd: &[Bytes]) -> Reply {
        if cmd.len() < 2 {
            return Reply::err(format!(
                "wrong number of arguments for '{}' command",
                command_name(cmd)
            ));
        }
        let route_map = match self.group_by_node(&cmd[1..]) {
            Ok(map) => map,
            Err(e) => return e.into(),
        };
        if route_map.len() == 1 {
            if let Some(node) = route_map.keys().next() {
                return self.exec_on(node, cmd).await;
            }
        }

        let cmd_lines = route_map
            .iter()
            .map(|(node, keys)| {
                let mut line = vec![Bytes::from_static(b"Del")];
                line.extend_from_slice(keys);
                (node.clone(), line)
            })
            .collect();

        match self.do_tcc(&TccTx::new(route_map, cmd_lines)).await {
            Ok(replies) => Reply::Integer(replies.iter().filter_map(Reply::as_integer).sum()),
            Err(reply) => reply,
        }
    }
}
