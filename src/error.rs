/// Unified error handling for the portero proxy
///
/// Groups the error surfaces by subsystem: session/wire errors, pool
/// lifecycle errors, topology discovery errors, supervisor startup errors,
/// and address-mapping errors used by the response rewriters.
use std::io;

use thiserror::Error;

use crate::replica::ReplicaState;

/// Errors raised while proxying a single client session.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Transport-level failure on either side of the session.
    #[error("network error: {0}")]
    Io(io::Error),

    /// A write completed short of the full message.
    #[error("incomplete write on wire stream")]
    IncompleteWrite,

    /// A reply-rewriting path saw something other than OP_REPLY.
    #[error("expected OP_REPLY from server, got {op}")]
    UnexpectedOp { op: String },

    /// Reply rewriting only handles single-document replies.
    #[error("can only rewrite single-document replies, got {count}")]
    MultiDocReply { count: i32 },

    /// An inspected query document failed to unmarshal.
    #[error("corrupted query document: {0}")]
    DocumentCorrupted(#[from] bson::de::Error),

    /// A rewritten reply document failed to marshal.
    #[error("failed to encode rewritten document: {0}")]
    DocumentEncode(#[from] bson::ser::Error),

    /// The rewriter observed a cluster view that differs from the snapshot
    /// the proxy fleet was built against.
    #[error("replica set configuration changed")]
    TopologyChanged,

    /// A host in a rewritten reply maps to neither a proxy nor an ignored
    /// member.
    #[error("host {host} is not a known replica set member")]
    UnknownMember { host: String },

    /// Upstream pool failure while servicing the session.
    #[error("upstream pool error: {0}")]
    Pool(#[from] PoolError),

    /// A single message exceeded the per-message deadline.
    #[error("message exceeded the per-message timeout")]
    MessageTimeout,
}

impl ProxyError {
    pub fn unexpected_op(op: impl ToString) -> Self {
        ProxyError::UnexpectedOp { op: op.to_string() }
    }

    pub fn unknown_member(host: impl Into<String>) -> Self {
        ProxyError::UnknownMember { host: host.into() }
    }

    /// True for errors that end the session without being worth a log line.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, ProxyError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

impl From<io::Error> for ProxyError {
    fn from(e: io::Error) -> Self {
        // write_all reports a stalled sink as WriteZero; that is our
        // short-write condition.
        if e.kind() == io::ErrorKind::WriteZero {
            ProxyError::IncompleteWrite
        } else {
            ProxyError::Io(e)
        }
    }
}

impl From<MapError> for ProxyError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::Unknown { host } => ProxyError::UnknownMember { host },
            // Ignored members are dropped at the call sites; reaching here
            // means a mapping that must always succeed (primary/me) failed.
            MapError::Ignored { host, .. } => ProxyError::UnknownMember { host },
        }
    }
}

/// Result type alias for session-level operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors surfaced by the upstream connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool has been closed; no further acquisitions are possible.
    #[error("pool has been closed")]
    Closed,

    /// The resource factory failed while creating a new resource.
    #[error("failed to create pooled resource: {0}")]
    Create(io::Error),
}

/// Errors raised while discovering replica set topology from seed addresses.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("node {host} is busy starting up")]
    NodeStartingUp { host: String },

    #[error("conflicting replica set state between seeds: {detail}")]
    TopologyMismatch { detail: String },

    #[error("could not connect to any provided addresses: {addrs:?}")]
    NoReachableNodes { addrs: Vec<String> },

    #[error(
        "node {addr} is standalone but {seed_count} seeds were given, expected a replica set"
    )]
    ExpectedReplicaSet { addr: String, seed_count: usize },

    #[error("single node replica set member {host} is in state {state}, expected PRIMARY or SECONDARY")]
    SingleNodeBadState { host: String, state: ReplicaState },

    #[error("command {command} failed on {addr}: {errmsg}")]
    Command {
        addr: String,
        command: String,
        errmsg: String,
    },

    #[error("network error talking to {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed command reply from {addr}: {detail}")]
    BadReply { addr: String, detail: String },
}

impl DiscoveryError {
    pub fn io(addr: impl Into<String>, source: io::Error) -> Self {
        DiscoveryError::Io {
            addr: addr.into(),
            source,
        }
    }

    pub fn bad_reply(addr: impl Into<String>, detail: impl Into<String>) -> Self {
        DiscoveryError::BadReply {
            addr: addr.into(),
            detail: detail.into(),
        }
    }
}

/// Errors raised while starting or restarting the proxy fleet.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("no seed addresses given")]
    NoSeeds,

    #[error("no healthy primaries or secondaries among: {addrs}")]
    NoHealthyNodes { addrs: String },

    #[error("could not find a free port in range {start}-{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("member {addr} appears twice in the replica set")]
    DuplicateMember { addr: String },

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("listener error: {0}")]
    Io(#[from] io::Error),
}

/// Failure to map a real member address to a proxy address.
#[derive(Debug, Error)]
pub enum MapError {
    /// The member is known but deliberately not proxied (arbiters,
    /// unreachable members). Carries the member state recorded at startup.
    #[error("member {host} in state {state} is not proxied")]
    Ignored { host: String, state: ReplicaState },

    /// The member is not in the replica set at all.
    #[error("mongo {host} is not in the replica set")]
    Unknown { host: String },
}
