//! Commands the cluster layer handles itself instead of passing straight
//! to the local engine.

/// A cluster-level request, identified by command name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterRequest {
    Join,
    Heartbeat,
    ChangeRoute,
    CommittedIndex,
    MigrationStart,
    MigrationExport,
    MigrationDone,
    MigrationRestore,
    MigrationForget,
    MigrationAbort,
    Prepare,
    Commit,
    Rollback,
    Nodes,
    Local,
    Rename,
    RenameNx,
    MSet,
    Del,
}

/// Prefix shared by inter-node commands.
pub const CLUSTER_PREFIX: &str = "cluster.";

static ROUTES: &[(&str, ClusterRequest)] = &[
    ("cluster.join", ClusterRequest::Join),
    ("cluster.heartbeat", ClusterRequest::Heartbeat),
    ("cluster.migration.changeroute", ClusterRequest::ChangeRoute),
    ("cluster.committedindex", ClusterRequest::CommittedIndex),
    ("cluster.migration.start", ClusterRequest::MigrationStart),
    ("cluster.migration.export", ClusterRequest::MigrationExport),
    ("cluster.migration.done", ClusterRequest::MigrationDone),
    ("cluster.migration.restore", ClusterRequest::MigrationRestore),
    ("cluster.migration.forget", ClusterRequest::MigrationForget),
    ("cluster.migration.abort", ClusterRequest::MigrationAbort),
    ("cluster.nodes", ClusterRequest::Nodes),
    ("cluster.local", ClusterRequest::Local),
    ("prepare", ClusterRequest::Prepare),
    ("commit", ClusterRequest::Commit),
    ("rollback", ClusterRequest::Rollback),
    ("rename", ClusterRequest::Rename),
    ("renamenx", ClusterRequest::RenameNx),
    ("mset", ClusterRequest::MSet),
    ("del", ClusterRequest::Del),
];

impl ClusterRequest {
    /// Looks up a lowercased command name.
    pub fn parse(name: &str) -> Option<Self> {
        ROUTES
            .iter()
            .find(|(route, _)| *route == name)
            .map(|(_, req)| *req)
    }

    pub fn name(self) -> &'static str {
        ROUTES
            .iter()
            .find(|(_, req)| *req == self)
            .map(|(route, _)| *route)
            .unwrap_or("unknown")
    }

    /// Requests only the raft leader may serve. Followers forward them.
    pub fn leader_only(self) -> bool {
        matches!(
            self,
            Self::Join | Self::Heartbeat | Self::ChangeRoute | Self::MigrationAbort
        )
    }

    /// Exact argument count including the name, or the minimum when
    /// negative. Data commands check their own arity.
    pub fn arity(self) -> i32 {
        match self {
            Self::Join => -3,
            Self::Heartbeat
            | Self::ChangeRoute
            | Self::MigrationStart
            | Self::MigrationExport
            | Self::MigrationDone
            | Self::MigrationForget
            | Self::MigrationAbort
            | Self::Commit
            | Self::Rollback => 2,
            Self::MigrationRestore => 3,
            Self::CommittedIndex | Self::Nodes => 1,
            Self::Prepare => -3,
            Self::Local => -2,
            Self::Rename | Self::RenameNx | Self::MSet | Self::Del => -1,
        }
    }

    pub fn arity_ok(self, len: usize) -> bool {
        let arity = self.arity();
        let len = len as i32;
        if arity >= 0 {
            len == arity
        } else {
            len >= -arity
        }
    }
}
