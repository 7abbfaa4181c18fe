pub mod config;
pub mod error;
/// Portero - transparent MongoDB wire-protocol proxy for replica sets
///
/// Clients connect to portero instead of MongoDB: each replica set member
/// gets its own local listener, and host-discovery replies (`isMaster`,
/// `replSetGetStatus`) are rewritten on the wire so clients only ever see
/// proxy addresses. Many transient client connections are multiplexed over
/// a bounded pool of upstream connections per member, with mutations pinned
/// to their upstream for the follow-up `getLastError`.
pub mod core;
pub mod pool;
pub mod protocol;
pub mod replica;

pub use config::Config;
pub use replica::supervisor::ReplicaSet;
