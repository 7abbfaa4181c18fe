/// Replica set membership tracking
///
/// Snapshots the cluster view (`replSetGetStatus` + `isMaster`) from seed
/// addresses, compares snapshots to detect topology change, and exposes the
/// healthy member addresses the supervisor builds proxies for.
pub mod supervisor;

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use log::{debug, error};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::DiscoveryError;
use crate::protocol::{wire, MsgHeader, OpCode, HEADER_LEN};

const NOT_REPL_SET: &str = "not running with --replSet";

/// How long a single discovery probe may take, dial included.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// State of a node within a replica set, as reported in `stateStr`.
///
/// Servers report more states than we act on; unrecognized ones are carried
/// verbatim so replies round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReplicaState {
    Primary,
    Secondary,
    Arbiter,
    Startup,
    Other(String),
}

impl ReplicaState {
    pub fn as_str(&self) -> &str {
        match self {
            ReplicaState::Primary => "PRIMARY",
            ReplicaState::Secondary => "SECONDARY",
            ReplicaState::Arbiter => "ARBITER",
            ReplicaState::Startup => "STARTUP",
            ReplicaState::Other(s) => s,
        }
    }

    pub fn is_arbiter(&self) -> bool {
        matches!(self, ReplicaState::Arbiter)
    }

    /// Members usable as proxy upstreams.
    pub fn is_data_bearing(&self) -> bool {
        matches!(self, ReplicaState::Primary | ReplicaState::Secondary)
    }
}

impl From<&str> for ReplicaState {
    fn from(s: &str) -> Self {
        match s {
            "PRIMARY" => ReplicaState::Primary,
            "SECONDARY" => ReplicaState::Secondary,
            "ARBITER" => ReplicaState::Arbiter,
            "STARTUP" => ReplicaState::Startup,
            other => ReplicaState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ReplicaState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ReplicaState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ReplicaState::from(s.as_str()))
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Typed view of an `isMaster` reply. Fields the rewriter does not touch
/// pass through the flattened document untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IsMasterReply {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub primary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub me: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub passives: Vec<String>,
    #[serde(flatten)]
    pub extra: bson::Document,
}

/// One member entry from a `replSetGetStatus` reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusMember {
    pub name: String,
    #[serde(rename = "stateStr", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ReplicaState>,
    #[serde(rename = "self", default, skip_serializing_if = "is_false")]
    pub is_self: bool,
    #[serde(flatten)]
    pub extra: bson::Document,
}

/// Typed view of a `replSetGetStatus` reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReply {
    #[serde(rename = "set", default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub members: Vec<StatusMember>,
    #[serde(flatten)]
    pub extra: bson::Document,
}

/// A snapshot of the replica set configuration at some point in time.
///
/// `single_addr` is set instead of a status reply when the probed node is
/// not running with `--replSet`.
#[derive(Debug, Clone, Default)]
pub struct ReplicaSetState {
    pub(crate) last_rs: Option<StatusReply>,
    pub(crate) last_im: IsMasterReply,
    pub(crate) single_addr: Option<String>,
}

impl ReplicaSetState {
    /// Addresses of members usable as upstreams: the single node itself, or
    /// every member in PRIMARY or SECONDARY state.
    pub fn addrs(&self) -> Vec<String> {
        if let Some(addr) = &self.single_addr {
            return vec![addr.clone()];
        }
        let Some(rs) = &self.last_rs else {
            return Vec::new();
        };
        rs.members
            .iter()
            .filter(|m| m.state.as_ref().is_some_and(|s| s.is_data_bearing()))
            .map(|m| m.name.clone())
            .collect()
    }

    pub fn equal(&self, other: &ReplicaSetState) -> bool {
        self.same_im(&other.last_im) && same_rs_members(self.last_rs.as_ref(), other.last_rs.as_ref())
    }

    /// Compare against a freshly parsed `replSetGetStatus` reply.
    pub fn same_rs(&self, other: &StatusReply) -> bool {
        same_rs_members(self.last_rs.as_ref(), Some(other))
    }

    /// Compare against a freshly parsed `isMaster` reply.
    pub fn same_im(&self, other: &IsMasterReply) -> bool {
        same_im_members(&self.last_im, other)
    }
}

/// Membership equality: matching set names and matching `name:state`
/// multisets. Snapshots from differently named sets never compare equal.
fn same_rs_members(a: Option<&StatusReply>, b: Option<&StatusReply>) -> bool {
    let a_empty = a.map_or(true, |r| r.members.is_empty());
    let b_empty = b.map_or(true, |r| r.members.is_empty());
    if a_empty && b_empty {
        return true;
    }
    let (Some(a), Some(b)) = (a, b) else {
        return false;
    };
    if !a.name.is_empty() && !b.name.is_empty() && a.name != b.name {
        return false;
    }
    if a.members.len() != b.members.len() {
        return false;
    }
    let key = |m: &StatusMember| {
        format!(
            "{}:{}",
            m.name,
            m.state.as_ref().map(ReplicaState::as_str).unwrap_or("")
        )
    };
    let mut a_members: Vec<String> = a.members.iter().map(key).collect();
    let mut b_members: Vec<String> = b.members.iter().map(key).collect();
    a_members.sort();
    b_members.sort();
    a_members == b_members
}

/// Host-list equality: the sorted `hosts` lists plus the primary must match.
fn same_im_members(a: &IsMasterReply, b: &IsMasterReply) -> bool {
    if a.hosts.len() != b.hosts.len() {
        return false;
    }
    let mut a_hosts = a.hosts.clone();
    let mut b_hosts = b.hosts.clone();
    a_hosts.sort();
    b_hosts.sort();
    a_hosts.push(a.primary.clone());
    b_hosts.push(b.primary.clone());
    a_hosts == b_hosts
}

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Builds [`ReplicaSetState`] snapshots by probing live nodes.
#[derive(Debug, Clone, Default)]
pub struct StateBuilder {
    /// When non-empty, seeds reporting a different set name are skipped.
    pub expected_set_name: String,
}

impl StateBuilder {
    pub fn new(expected_set_name: impl Into<String>) -> Self {
        StateBuilder {
            expected_set_name: expected_set_name.into(),
        }
    }

    /// Probe a single node and snapshot its view of the cluster.
    pub async fn from_addr(&self, addr: &str) -> Result<ReplicaSetState, DiscoveryError> {
        let mut stream = timeout(PROBE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                DiscoveryError::io(
                    addr,
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                )
            })?
            .map_err(|e| DiscoveryError::io(addr, e))?;

        let last_rs = match run_command::<StatusReply>(&mut stream, addr, "replSetGetStatus").await
        {
            Ok(reply) => Some(reply),
            // This error indicates single node mode. That's okay.
            Err(DiscoveryError::Command { errmsg, .. }) if errmsg == NOT_REPL_SET => None,
            Err(e) => return Err(e),
        };

        let last_im = run_command::<IsMasterReply>(&mut stream, addr, "isMaster").await?;

        if let Some(rs) = &last_rs {
            if rs.members.len() == 1 {
                let member = &rs.members[0];
                let state = member
                    .state
                    .clone()
                    .unwrap_or_else(|| ReplicaState::Other(String::new()));
                if !state.is_data_bearing() {
                    return Err(DiscoveryError::SingleNodeBadState {
                        host: member.name.clone(),
                        state,
                    });
                }
            }
            for member in &rs.members {
                if member.is_self && member.state == Some(ReplicaState::Startup) {
                    return Err(DiscoveryError::NodeStartingUp {
                        host: member.name.clone(),
                    });
                }
            }
        }

        Ok(ReplicaSetState {
            single_addr: last_rs.is_none().then(|| addr.to_string()),
            last_rs,
            last_im,
        })
    }

    /// Probe every seed. The first reachable seed establishes the snapshot;
    /// each further reachable seed must agree with it.
    pub async fn from_seeds(&self, seeds: &[String]) -> Result<ReplicaSetState, DiscoveryError> {
        let mut state: Option<ReplicaSetState> = None;
        for addr in seeds {
            let probed = match self.from_addr(addr).await {
                Ok(s) => s,
                Err(e) => {
                    error!("ignoring failure against address {}: {}", addr, e);
                    continue;
                }
            };

            if !self.expected_set_name.is_empty() {
                match &probed.last_rs {
                    None => {
                        error!(
                            "ignoring standalone node {} not in expected replset {}",
                            addr, self.expected_set_name
                        );
                        continue;
                    }
                    Some(rs) if rs.name != self.expected_set_name => {
                        error!(
                            "ignoring node {} not in expected replset: {} vs {}",
                            addr, rs.name, self.expected_set_name
                        );
                        continue;
                    }
                    Some(_) => {}
                }
            }

            match &state {
                None => state = Some(probed),
                Some(established) => {
                    if !established.equal(&probed) {
                        return Err(DiscoveryError::TopologyMismatch {
                            detail: format!(
                                "seed {} reports a different membership than earlier seeds",
                                addr
                            ),
                        });
                    }
                }
            }
        }

        let state = state.ok_or_else(|| DiscoveryError::NoReachableNodes {
            addrs: seeds.to_vec(),
        })?;

        if let Some(single) = &state.single_addr {
            if seeds.len() != 1 {
                return Err(DiscoveryError::ExpectedReplicaSet {
                    addr: single.clone(),
                    seed_count: seeds.len(),
                });
            }
        }

        Ok(state)
    }
}

/// Issue a `{ <name>: 1 }` command against `admin.$cmd` and parse the single
/// reply document, checking its `ok` field.
async fn run_command<T: DeserializeOwned>(
    stream: &mut TcpStream,
    addr: &str,
    name: &str,
) -> Result<T, DiscoveryError> {
    let mut query = bson::Document::new();
    query.insert(name, 1i32);
    let doc_bytes =
        bson::to_vec(&query).map_err(|e| DiscoveryError::bad_reply(addr, e.to_string()))?;

    let mut body = Vec::with_capacity(32 + doc_bytes.len());
    body.extend_from_slice(&0i32.to_le_bytes()); // flags
    body.extend_from_slice(b"admin.$cmd\0");
    body.extend_from_slice(&0i32.to_le_bytes()); // numberToSkip
    body.extend_from_slice(&(-1i32).to_le_bytes()); // numberToReturn
    body.extend_from_slice(&doc_bytes);

    let header = MsgHeader {
        message_length: HEADER_LEN + body.len() as i32,
        request_id: next_request_id(),
        response_to: 0,
        op_code: OpCode::Query,
    };

    let exchange = async {
        stream.write_all(&header.to_wire()).await?;
        stream.write_all(&body).await?;

        let reply_header = wire::read_header(stream).await?;
        if reply_header.op_code != OpCode::Reply {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("expected OP_REPLY, got {}", reply_header.op_code),
            ));
        }
        let mut prefix = [0u8; 20];
        stream.read_exact(&mut prefix).await?;
        let number_returned = wire::get_i32(&prefix, 16);
        if number_returned != 1 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("expected 1 reply document, got {}", number_returned),
            ));
        }
        wire::read_document(stream).await
    };

    let raw = timeout(PROBE_TIMEOUT, exchange)
        .await
        .map_err(|_| {
            DiscoveryError::io(
                addr,
                std::io::Error::new(std::io::ErrorKind::TimedOut, "command timed out"),
            )
        })?
        .map_err(|e| DiscoveryError::io(addr, e))?;

    let doc: bson::Document =
        bson::from_slice(&raw).map_err(|e| DiscoveryError::bad_reply(addr, e.to_string()))?;
    debug!("{} reply from {}: {} keys", name, addr, doc.len());

    if !reply_ok(&doc) {
        let errmsg = doc
            .get_str("errmsg")
            .unwrap_or("command failed without errmsg")
            .to_string();
        return Err(DiscoveryError::Command {
            addr: addr.to_string(),
            command: name.to_string(),
            errmsg,
        });
    }

    bson::from_document(doc).map_err(|e| DiscoveryError::bad_reply(addr, e.to_string()))
}

fn reply_ok(doc: &bson::Document) -> bool {
    match doc.get("ok") {
        Some(bson::Bson::Double(v)) => *v == 1.0,
        Some(bson::Bson::Int32(v)) => *v == 1,
        Some(bson::Bson::Int64(v)) => *v == 1,
        Some(bson::Bson::Boolean(v)) => *v,
        _ => false,
    }
}
