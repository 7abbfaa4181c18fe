/// Stream-splicing rewriters for host-discovery replies
///
/// Both rewriters read one reply message off the server stream, rewrite the
/// member addresses in its single document through the proxy mapper, and
/// write the reply back to the client with the header length adjusted. The
/// surrounding reply prefix bytes are preserved untouched.
use std::sync::Arc;

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MapError, ProxyError, ProxyResult};
use crate::protocol::{wire, MsgHeader, OpCode};
use crate::replica::{IsMasterReply, StatusReply};

/// Response flags, cursorId, startingFrom and numberReturned.
pub const REPLY_PREFIX_LEN: usize = 20;

/// The fixed OP_REPLY fields between the header and the documents.
pub type ReplyPrefix = [u8; REPLY_PREFIX_LEN];

/// Maps real member addresses to their proxy addresses.
pub trait ProxyMapper: Send + Sync {
    fn proxy(&self, real_host: &str) -> Result<String, MapError>;
}

/// Compares live discovery replies against the snapshot the proxy fleet was
/// built from.
pub trait ReplicaStateCompare: Send + Sync {
    fn same_rs(&self, reply: &StatusReply) -> bool;
    fn same_im(&self, reply: &IsMasterReply) -> bool;
}

impl ReplicaStateCompare for crate::replica::ReplicaSetState {
    fn same_rs(&self, reply: &StatusReply) -> bool {
        crate::replica::ReplicaSetState::same_rs(self, reply)
    }

    fn same_im(&self, reply: &IsMasterReply) -> bool {
        crate::replica::ReplicaSetState::same_im(self, reply)
    }
}

/// Read a single-document reply from the server: header, fixed prefix, and
/// the document deserialized into `T`. Returns the original document length
/// so the caller can fix up the header after re-serializing.
pub async fn read_reply_one<S, T>(server: &mut S) -> ProxyResult<(MsgHeader, ReplyPrefix, i32, T)>
where
    S: AsyncRead + Unpin + Send,
    T: DeserializeOwned,
{
    let h = wire::read_header(server).await?;
    if h.op_code != OpCode::Reply {
        return Err(ProxyError::unexpected_op(h.op_code));
    }

    let mut prefix: ReplyPrefix = [0u8; REPLY_PREFIX_LEN];
    server.read_exact(&mut prefix).await?;

    let number_returned = wire::get_i32(&prefix, 16);
    if number_returned != 1 {
        return Err(ProxyError::MultiDocReply {
            count: number_returned,
        });
    }

    let raw = wire::read_document(server).await?;
    let value: T = bson::from_slice(&raw)?;
    Ok((h, prefix, raw.len() as i32, value))
}

/// Write a rewritten single-document reply to the client. The header length
/// is adjusted by the document size delta; everything else is preserved.
pub async fn write_reply_one<S, T>(
    client: &mut S,
    mut h: MsgHeader,
    prefix: &ReplyPrefix,
    old_doc_len: i32,
    value: &T,
) -> ProxyResult<()>
where
    S: AsyncWrite + Unpin + Send,
    T: Serialize,
{
    let new_doc = bson::to_vec(value)?;
    h.message_length = h.message_length - old_doc_len + new_doc.len() as i32;
    client.write_all(&h.to_wire()).await?;
    client.write_all(prefix).await?;
    client.write_all(&new_doc).await?;
    Ok(())
}

/// Rewrites `isMaster` and `replSetGetStatus` replies so clients only ever
/// see proxy addresses.
pub struct ResponseRewriter {
    mapper: Arc<dyn ProxyMapper>,
    state: Arc<dyn ReplicaStateCompare>,
}

impl ResponseRewriter {
    pub fn new(mapper: Arc<dyn ProxyMapper>, state: Arc<dyn ReplicaStateCompare>) -> Self {
        Self { mapper, state }
    }

    /// Rewrite the reply to an `isMaster` query.
    pub async fn rewrite_is_master<C, S>(&self, client: &mut C, server: &mut S) -> ProxyResult<()>
    where
        C: AsyncWrite + Unpin + Send,
        S: AsyncRead + Unpin + Send,
    {
        let (h, prefix, doc_len, mut reply) = read_reply_one::<_, IsMasterReply>(server).await?;
        if !self.state.same_im(&reply) {
            return Err(ProxyError::TopologyChanged);
        }

        reply.hosts = self.map_host_list(&reply.hosts)?;
        if !reply.passives.is_empty() {
            reply.passives = self.map_host_list(&reply.passives)?;
        }
        if !reply.primary.is_empty() {
            // failure in mapping the primary is fatal
            reply.primary = self.mapper.proxy(&reply.primary)?;
        }
        if !reply.me.is_empty() {
            // failure in mapping me is fatal
            reply.me = self.mapper.proxy(&reply.me)?;
        }

        write_reply_one(client, h, &prefix, doc_len, &reply).await
    }

    /// Rewrite the reply to a `replSetGetStatus` command.
    pub async fn rewrite_repl_set_get_status<C, S>(
        &self,
        client: &mut C,
        server: &mut S,
    ) -> ProxyResult<()>
    where
        C: AsyncWrite + Unpin + Send,
        S: AsyncRead + Unpin + Send,
    {
        let (h, prefix, doc_len, mut reply) = read_reply_one::<_, StatusReply>(server).await?;
        if !self.state.same_rs(&reply) {
            return Err(ProxyError::TopologyChanged);
        }

        let mut members = Vec::with_capacity(reply.members.len());
        for mut m in reply.members {
            match self.mapper.proxy(&m.name) {
                Ok(mapped) => {
                    m.name = mapped;
                    members.push(m);
                }
                Err(MapError::Ignored { host, state }) => {
                    if !state.is_arbiter() {
                        warn!("dropping member {} in state {}", host, state);
                    }
                }
                Err(e @ MapError::Unknown { .. }) => return Err(e.into()),
            }
        }
        reply.members = members;

        write_reply_one(client, h, &prefix, doc_len, &reply).await
    }

    fn map_host_list(&self, hosts: &[String]) -> ProxyResult<Vec<String>> {
        let mut mapped = Vec::with_capacity(hosts.len());
        for host in hosts {
            match self.mapper.proxy(host) {
                Ok(p) => mapped.push(p),
                Err(MapError::Ignored { host, state }) => {
                    if !state.is_arbiter() {
                        warn!("dropping member {} in state {}", host, state);
                    }
                }
                Err(e @ MapError::Unknown { .. }) => return Err(e.into()),
            }
        }
        Ok(mapped)
    }
}
