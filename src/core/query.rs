/// OpQuery mediation
///
/// An OpQuery is the only message the proxy ever looks inside: command
/// queries may need their replies rewritten (`isMaster`,
/// `replSetGetStatus`) or served from the session's getLastError cache. The
/// body is buffered piece by piece while parsing so the upstream sees the
/// identical bytes.
use std::sync::Arc;

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyResult;
use crate::protocol::{wire, LastError, MsgHeader};

use super::rewrite::ResponseRewriter;

const CMD_COLLECTION_SUFFIX: &[u8] = b".$cmd\0";
const ADMIN_COLLECTION: &[u8] = b"admin.$cmd\0";

enum Rewrite {
    IsMaster,
    ReplSetGetStatus,
}

/// Proxies an OpQuery and its response, consulting the last-error cache and
/// the response rewriters as needed.
pub struct QueryProxy {
    pub rewriter: Arc<ResponseRewriter>,
    /// Inspect every query document, not just `.$cmd` collections.
    pub proxy_all_queries: bool,
}

impl QueryProxy {
    /// Mediate one OpQuery whose header has already been read.
    pub async fn proxy<C, S>(
        &self,
        h: &MsgHeader,
        client: &mut C,
        server: &mut S,
        last_error: &mut LastError,
    ) -> ProxyResult<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // Mirrors the server's own lastError.disableForCommand logic: most
        // requests invalidate the cache, a rewritten discovery query from
        // the shell does not.
        let mut reset_last_error = true;

        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&h.to_wire());

        let mut flags = [0u8; 4];
        client.read_exact(&mut flags).await?;
        buf.extend_from_slice(&flags);

        let collection = wire::read_cstring(client).await?;
        buf.extend_from_slice(&collection);

        let mut rewrite: Option<Rewrite> = None;
        if self.proxy_all_queries || collection.ends_with(CMD_COLLECTION_SUFFIX) {
            let mut skip_return = [0u8; 8];
            client.read_exact(&mut skip_return).await?;
            buf.extend_from_slice(&skip_return);

            let query_doc = wire::read_document(client).await?;
            buf.extend_from_slice(&query_doc);

            let q: bson::Document = bson::from_slice(&query_doc)?;
            debug!(
                "buffered OpQuery for {}",
                String::from_utf8_lossy(&collection[..collection.len() - 1])
            );

            if has_key_fold(&q, "getLastError") {
                return self
                    .get_last_error(h, &buf, client, server, last_error)
                    .await;
            }

            if has_key_fold(&q, "isMaster") {
                rewrite = Some(Rewrite::IsMaster);
            }
            if collection == ADMIN_COLLECTION && has_key_fold(&q, "replSetGetStatus") {
                rewrite = Some(Rewrite::ReplSetGetStatus);
            }

            // A rewritten discovery query from the shell carries forShell
            // and must not clobber the cached last error.
            if rewrite.is_some() && has_key_fold(&q, "forShell") {
                reset_last_error = false;
            }
        }

        if reset_last_error && last_error.exists() {
            debug!("reset getLastError cache");
            last_error.reset();
        }

        server.write_all(&buf).await?;
        let pending = i64::from(h.message_length) - buf.len() as i64;
        if pending > 0 {
            wire::copy_exact(server, client, pending as u64).await?;
        }

        match rewrite {
            Some(Rewrite::IsMaster) => self.rewriter.rewrite_is_master(client, server).await,
            Some(Rewrite::ReplSetGetStatus) => {
                self.rewriter
                    .rewrite_repl_set_get_status(client, server)
                    .await
            }
            None => {
                wire::copy_message(client, server).await?;
                Ok(())
            }
        }
    }

    /// Service a getLastError query: round-trip the first one after a
    /// mutation and cache its reply; serve later ones from the cache without
    /// touching the upstream.
    async fn get_last_error<C, S>(
        &self,
        h: &MsgHeader,
        buffered: &[u8],
        client: &mut C,
        server: &mut S,
        last_error: &mut LastError,
    ) -> ProxyResult<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if !last_error.exists() {
            // Perform the real query and capture the entire reply.
            server.write_all(buffered).await?;
            let pending = i64::from(h.message_length) - buffered.len() as i64;
            if pending > 0 {
                wire::copy_exact(server, client, pending as u64).await?;
            }

            let reply_header = wire::read_header(server).await?;
            let mut rest = vec![0u8; reply_header.body_length().max(0) as usize];
            server.read_exact(&mut rest).await?;
            debug!("caching new getLastError response");
            last_error.set(reply_header, rest);
        } else {
            // The client's query is consumed but never sent upstream.
            let pending = i64::from(h.message_length) - buffered.len() as i64;
            if pending > 0 {
                wire::discard_exact(client, pending as u64).await?;
            }
            debug!("using cached getLastError response");
        }

        if let Some((reply_header, payload)) = last_error.for_request(h.request_id) {
            client.write_all(&reply_header.to_wire()).await?;
            client.write_all(payload).await?;
        }
        Ok(())
    }
}

/// Case-insensitive check for a top-level key.
fn has_key_fold(doc: &bson::Document, key: &str) -> bool {
    doc.keys().any(|k| k.eq_ignore_ascii_case(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MapError, ProxyError};
    use crate::core::rewrite::{ProxyMapper, ReplicaStateCompare, REPLY_PREFIX_LEN};
    use crate::protocol::{OpCode, HEADER_LEN};
    use crate::replica::{IsMasterReply, StatusReply};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    struct NoMap;

    impl ProxyMapper for NoMap {
        fn proxy(&self, real_host: &str) -> Result<String, MapError> {
            Err(MapError::Unknown {
                host: real_host.to_string(),
            })
        }
    }

    struct IdentityState;

    impl ReplicaStateCompare for IdentityState {
        fn same_rs(&self, _: &StatusReply) -> bool {
            true
        }
        fn same_im(&self, _: &IsMasterReply) -> bool {
            true
        }
    }

    fn query_proxy() -> QueryProxy {
        QueryProxy {
            rewriter: Arc::new(ResponseRewriter::new(
                Arc::new(NoMap),
                Arc::new(IdentityState),
            )),
            proxy_all_queries: false,
        }
    }

    /// Full OpQuery wire message for `doc` against `collection`.
    fn op_query(request_id: i32, collection: &str, doc: &bson::Document) -> (MsgHeader, Vec<u8>) {
        let doc_bytes = bson::to_vec(doc).unwrap();
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(collection.as_bytes());
        body.push(0);
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&(-1i32).to_le_bytes());
        body.extend_from_slice(&doc_bytes);
        let h = MsgHeader {
            message_length: HEADER_LEN + body.len() as i32,
            request_id,
            response_to: 0,
            op_code: OpCode::Query,
        };
        (h, body)
    }

    /// A canned single-document OP_REPLY.
    fn op_reply(response_to: i32, doc: &bson::Document) -> Vec<u8> {
        let doc_bytes = bson::to_vec(doc).unwrap();
        let h = MsgHeader {
            message_length: HEADER_LEN + REPLY_PREFIX_LEN as i32 + doc_bytes.len() as i32,
            request_id: 900,
            response_to,
            op_code: OpCode::Reply,
        };
        let mut prefix = [0u8; REPLY_PREFIX_LEN];
        wire::set_i32(&mut prefix, 16, 1);
        let mut msg = h.to_wire().to_vec();
        msg.extend_from_slice(&prefix);
        msg.extend_from_slice(&doc_bytes);
        msg
    }

    struct Pipes {
        client_ours: DuplexStream,
        client_theirs: DuplexStream,
        server_ours: DuplexStream,
        server_theirs: DuplexStream,
    }

    fn pipes() -> Pipes {
        let (client_ours, client_theirs) = duplex(64 * 1024);
        let (server_ours, server_theirs) = duplex(64 * 1024);
        Pipes {
            client_ours,
            client_theirs,
            server_ours,
            server_theirs,
        }
    }

    async fn read_all(mut stream: DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_plain_query_passthrough_and_reply_relay() {
        let mut p = pipes();
        let qp = query_proxy();
        let (h, body) = op_query(5, "db.widgets", &bson::doc! { "find": "x" });
        let reply = op_reply(5, &bson::doc! { "n": 1, "ok": 1.0 });

        p.client_ours.write_all(&body).await.unwrap();
        p.server_ours.write_all(&reply).await.unwrap();

        let mut le = LastError::new();
        qp.proxy(&h, &mut p.client_theirs, &mut p.server_theirs, &mut le)
            .await
            .unwrap();

        drop(p.server_theirs);
        let upstream_saw = read_all(p.server_ours).await;
        let mut expected = h.to_wire().to_vec();
        expected.extend_from_slice(&body);
        assert_eq!(upstream_saw, expected, "request forwarded byte-for-byte");

        drop(p.client_theirs);
        let client_saw = read_all(p.client_ours).await;
        assert_eq!(client_saw, reply, "reply relayed verbatim");
        assert!(!le.exists());
    }

    #[tokio::test]
    async fn test_first_get_last_error_round_trips_and_caches() {
        let mut p = pipes();
        let qp = query_proxy();
        let (h, body) = op_query(7, "test.$cmd", &bson::doc! { "getLastError": 1 });
        let reply = op_reply(7, &bson::doc! { "err": bson::Bson::Null, "ok": 1.0 });

        p.client_ours.write_all(&body).await.unwrap();
        p.server_ours.write_all(&reply).await.unwrap();

        let mut le = LastError::new();
        qp.proxy(&h, &mut p.client_theirs, &mut p.server_theirs, &mut le)
            .await
            .unwrap();

        assert!(le.exists(), "reply captured into the cache");

        drop(p.server_theirs);
        let upstream_saw = read_all(p.server_ours).await;
        let mut expected = h.to_wire().to_vec();
        expected.extend_from_slice(&body);
        assert_eq!(upstream_saw, expected, "first GLE reaches the server");

        drop(p.client_theirs);
        let client_saw = read_all(p.client_ours).await;
        assert_eq!(client_saw, reply, "server reply forwarded to the client");
    }

    #[tokio::test]
    async fn test_cached_get_last_error_skips_upstream() {
        let mut p = pipes();
        let qp = query_proxy();

        let cached_doc = bson::doc! { "err": bson::Bson::Null, "n": 3, "ok": 1.0 };
        let cached = op_reply(7, &cached_doc);
        let mut le = LastError::new();
        {
            let mut header_bytes = [0u8; HEADER_LEN as usize];
            header_bytes.copy_from_slice(&cached[..HEADER_LEN as usize]);
            le.set(
                MsgHeader::from_wire(&header_bytes),
                cached[HEADER_LEN as usize..].to_vec(),
            );
        }

        let (h, body) = op_query(42, "test.$cmd", &bson::doc! { "getLastError": 1 });
        p.client_ours.write_all(&body).await.unwrap();

        qp.proxy(&h, &mut p.client_theirs, &mut p.server_theirs, &mut le)
            .await
            .unwrap();

        drop(p.server_theirs);
        let upstream_saw = read_all(p.server_ours).await;
        assert!(upstream_saw.is_empty(), "no bytes reach the upstream");

        drop(p.client_theirs);
        let client_saw = read_all(p.client_ours).await;
        let mut header_bytes = [0u8; HEADER_LEN as usize];
        header_bytes.copy_from_slice(&client_saw[..HEADER_LEN as usize]);
        let served = MsgHeader::from_wire(&header_bytes);
        assert_eq!(served.response_to, 42, "responseTo patched to the request");
        assert_eq!(
            &client_saw[HEADER_LEN as usize..],
            &cached[HEADER_LEN as usize..],
            "payload identical to the cached reply"
        );
    }

    #[tokio::test]
    async fn test_get_last_error_key_is_case_insensitive() {
        let mut p = pipes();
        let qp = query_proxy();
        let (h, body) = op_query(8, "test.$cmd", &bson::doc! { "GetLastError": 1 });
        let reply = op_reply(8, &bson::doc! { "ok": 1.0 });

        p.client_ours.write_all(&body).await.unwrap();
        p.server_ours.write_all(&reply).await.unwrap();

        let mut le = LastError::new();
        qp.proxy(&h, &mut p.client_theirs, &mut p.server_theirs, &mut le)
            .await
            .unwrap();
        assert!(le.exists(), "GetLastError routes like getLastError");
    }

    #[tokio::test]
    async fn test_non_gle_command_resets_cache() {
        let mut p = pipes();
        let qp = query_proxy();

        let mut le = LastError::new();
        le.set(
            MsgHeader {
                message_length: HEADER_LEN,
                request_id: 1,
                response_to: 1,
                op_code: OpCode::Reply,
            },
            Vec::new(),
        );

        let (h, body) = op_query(9, "test.$cmd", &bson::doc! { "count": "widgets" });
        let reply = op_reply(9, &bson::doc! { "n": 0, "ok": 1.0 });
        p.client_ours.write_all(&body).await.unwrap();
        p.server_ours.write_all(&reply).await.unwrap();

        qp.proxy(&h, &mut p.client_theirs, &mut p.server_theirs, &mut le)
            .await
            .unwrap();
        assert!(!le.exists(), "any non-GLE command invalidates the cache");
    }

    #[tokio::test]
    async fn test_for_shell_is_master_keeps_cache() {
        let mut p = pipes();
        // A mapper that knows the single host, so the rewrite succeeds.
        struct One;
        impl ProxyMapper for One {
            fn proxy(&self, _real: &str) -> Result<String, MapError> {
                Ok("proxy:1".to_string())
            }
        }
        let qp = QueryProxy {
            rewriter: Arc::new(ResponseRewriter::new(Arc::new(One), Arc::new(IdentityState))),
            proxy_all_queries: false,
        };

        let mut le = LastError::new();
        le.set(
            MsgHeader {
                message_length: HEADER_LEN,
                request_id: 1,
                response_to: 1,
                op_code: OpCode::Reply,
            },
            Vec::new(),
        );

        let (h, body) = op_query(
            10,
            "admin.$cmd",
            &bson::doc! { "isMaster": 1, "forShell": 1 },
        );
        let reply = op_reply(10, &bson::doc! { "hosts": ["real:1"], "ok": 1.0 });
        p.client_ours.write_all(&body).await.unwrap();
        p.server_ours.write_all(&reply).await.unwrap();

        qp.proxy(&h, &mut p.client_theirs, &mut p.server_theirs, &mut le)
            .await
            .unwrap();
        assert!(le.exists(), "forShell discovery preserves the cache");

        drop(p.client_theirs);
        let client_saw = read_all(p.client_ours).await;
        let doc: bson::Document =
            bson::from_slice(&client_saw[HEADER_LEN as usize + REPLY_PREFIX_LEN..]).unwrap();
        assert_eq!(doc.get_array("hosts").unwrap().len(), 1);
        assert_eq!(
            doc.get_array("hosts").unwrap()[0].as_str().unwrap(),
            "proxy:1"
        );
    }

    #[tokio::test]
    async fn test_corrupt_command_document_fails() {
        let mut p = pipes();
        let qp = query_proxy();

        // A syntactically framed but semantically broken document: length
        // says 10 bytes, content is garbage without a terminator.
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(b"test.$cmd\0");
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&(-1i32).to_le_bytes());
        let mut bad_doc = vec![0u8; 10];
        wire::set_i32(&mut bad_doc, 0, 10);
        bad_doc[4..].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x01, 0x02]);
        body.extend_from_slice(&bad_doc);
        let h = MsgHeader {
            message_length: HEADER_LEN + body.len() as i32,
            request_id: 11,
            response_to: 0,
            op_code: OpCode::Query,
        };

        p.client_ours.write_all(&body).await.unwrap();
        let mut le = LastError::new();
        let err = qp
            .proxy(&h, &mut p.client_theirs, &mut p.server_theirs, &mut le)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::DocumentCorrupted(_)));
    }
}
