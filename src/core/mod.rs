/// Per-node proxy: accept loop and client session state machine
///
/// One `NodeProxy` fronts one upstream member: it listens on a local port,
/// runs a session task per accepted client, and multiplexes sessions over a
/// bounded pool of upstream connections. A mutation pins its upstream until
/// the follow-up getLastError arrives or the pin window lapses.
pub mod query;
pub mod rewrite;
pub mod tee;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, timeout};

use crate::error::{PoolError, ProxyError, ProxyResult};
use crate::pool::{Factory, Pool, PoolOptions};
use crate::protocol::{wire, LastError, MsgHeader, OpCode};
use crate::replica::supervisor::RestartHandle;

use self::query::QueryProxy;

/// Upstream dial retry schedule: 7 attempts with a doubling backoff from
/// 50 ms waits a total of about 12.75 seconds.
const DIAL_ATTEMPTS: u32 = 7;
const DIAL_BACKOFF_START: Duration = Duration::from_millis(50);

/// Timing and pool knobs for one node proxy.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Deadline for a single message to be fully proxied.
    pub message_timeout: Duration,
    /// How long a client may sit between requests.
    pub client_idle_timeout: Duration,
    /// How long an upstream stays pinned awaiting a follow-up getLastError.
    pub get_last_error_timeout: Duration,
    pub pool: PoolOptions,
    /// Arm a topology restart when an upstream dial exhausts its retries.
    pub restart_on_dial_failure: bool,
}

/// How a client header read ended without producing a header.
enum SessionEnd {
    /// EOF or proxy shutdown; not worth a log line.
    NormalClose,
    /// The read window lapsed.
    ReadTimeout,
    Io(io::Error),
}

/// Proxy for a single upstream member.
#[derive(Clone)]
pub struct NodeProxy {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    proxy_addr: String,
    mongo_addr: String,
    opts: NodeOptions,
    query: QueryProxy,
    pool: Pool<TcpStream>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    restart: RestartHandle,
    listener: StdMutex<Option<TcpListener>>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
    session_guard: StdMutex<Option<mpsc::Sender<()>>>,
    sessions_done: StdMutex<Option<mpsc::Receiver<()>>>,
}

impl fmt::Display for NodeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proxy {} => mongo {}", self.proxy_addr, self.mongo_addr)
    }
}

impl fmt::Display for NodeProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl NodeProxy {
    /// Build a proxy for `mongo_addr` serving clients on the already-bound
    /// `listener`, advertised to clients as `proxy_addr`.
    pub fn new(
        opts: NodeOptions,
        proxy_addr: String,
        mongo_addr: String,
        listener: TcpListener,
        query: QueryProxy,
        restart: RestartHandle,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (guard_tx, guard_rx) = mpsc::channel(1);

        let pool = Pool::new(
            opts.pool.clone(),
            dial_factory(
                mongo_addr.clone(),
                shutdown_rx.clone(),
                restart.clone(),
                opts.restart_on_dial_failure,
            ),
            Arc::new(|e| error!("closing server connection: {}", e)),
        );

        Self {
            inner: Arc::new(NodeInner {
                proxy_addr,
                mongo_addr,
                opts,
                query,
                pool,
                shutdown_tx,
                shutdown_rx,
                restart,
                listener: StdMutex::new(Some(listener)),
                accept_task: StdMutex::new(None),
                session_guard: StdMutex::new(Some(guard_tx)),
                sessions_done: StdMutex::new(Some(guard_rx)),
            }),
        }
    }

    pub fn proxy_addr(&self) -> &str {
        &self.inner.proxy_addr
    }

    pub fn mongo_addr(&self) -> &str {
        &self.inner.mongo_addr
    }

    /// Start accepting clients. Listener binding and option validation have
    /// already happened by the time a proxy exists, so this cannot fail.
    pub fn start(&self) {
        let listener = match self.inner.listener.lock().unwrap().take() {
            Some(l) => l,
            None => {
                warn!("{} already started", self);
                return;
            }
        };

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut shutdown = inner.shutdown_rx.clone();
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let guard = inner.session_guard.lock().unwrap().clone();
                            let Some(guard) = guard else { break };
                            let session = Arc::clone(&inner);
                            tokio::spawn(async move {
                                let _guard = guard;
                                if tee::enabled() {
                                    let ctx = format!("client {} <=> {}", peer, session);
                                    serve_client(session, tee::Tee::new(ctx, stream), peer).await;
                                } else {
                                    serve_client(session, stream, peer).await;
                                }
                            });
                        }
                        Err(e) => {
                            if shutdown.has_changed().unwrap_or(true) {
                                break;
                            }
                            error!("accept on {}: {}", inner.proxy_addr, e);
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("accept loop for {} exited", inner.proxy_addr);
        });
        *self.inner.accept_task.lock().unwrap() = Some(handle);
        info!("started {}", self);
    }

    /// Stop the proxy: close the listener, wake idle readers, wait for
    /// in-flight sessions unless `hard`, then close the upstream pool.
    pub async fn stop(&self, hard: bool) {
        let _ = self.inner.shutdown_tx.send(true);

        // The accept loop exits promptly and drops the listener, releasing
        // the port for a restarted fleet.
        let accept = self.inner.accept_task.lock().unwrap().take();
        if let Some(accept) = accept {
            let _ = accept.await;
        }

        drop(self.inner.session_guard.lock().unwrap().take());
        if !hard {
            let done = self.inner.sessions_done.lock().unwrap().take();
            if let Some(mut done) = done {
                while done.recv().await.is_some() {}
            }
        }

        self.inner.pool.close().await;
        info!("stopped {}", self);
    }
}

/// Pool factory that dials the upstream member with retries and backoff.
fn dial_factory(
    mongo_addr: String,
    shutdown: watch::Receiver<bool>,
    restart: RestartHandle,
    restart_on_dial_failure: bool,
) -> Factory<TcpStream> {
    Arc::new(move || {
        let addr = mongo_addr.clone();
        let mut shutdown = shutdown.clone();
        let restart = restart.clone();
        Box::pin(async move {
            let mut backoff = DIAL_BACKOFF_START;
            let mut last_err: Option<io::Error> = None;
            for attempt in 0..DIAL_ATTEMPTS {
                if *shutdown.borrow() {
                    return Err(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "proxy shutting down",
                    ));
                }
                match TcpStream::connect(&addr).await {
                    Ok(conn) => {
                        let _ = conn.set_nodelay(true);
                        return Ok(conn);
                    }
                    Err(e) => {
                        error!("connect to {} (attempt {}): {}", addr, attempt + 1, e);
                        last_err = Some(e);
                    }
                }
                tokio::select! {
                    _ = time::sleep(backoff) => {}
                    _ = shutdown.wait_for(|closed| *closed) => {
                        return Err(io::Error::new(
                            io::ErrorKind::Interrupted,
                            "proxy shutting down",
                        ));
                    }
                }
                backoff *= 2;
            }
            if restart_on_dial_failure {
                restart.trigger();
            }
            Err(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::ConnectionRefused, "upstream unreachable")
            }))
        })
    })
}

/// Drive one client connection through the session state machine.
async fn serve_client<S>(inner: Arc<NodeInner>, mut client: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    info!("client {} connected to {}", peer, inner);
    let mut last_error = LastError::new();

    'session: loop {
        // Idle read: wait for the next request header.
        let first = match inner
            .read_client_header(&mut client, inner.opts.client_idle_timeout)
            .await
        {
            Ok(h) => h,
            Err(SessionEnd::NormalClose) => break,
            Err(SessionEnd::ReadTimeout) => {
                info!("client {} idle timeout", peer);
                break;
            }
            Err(SessionEnd::Io(e)) => {
                error!("client {} read: {}", peer, e);
                break;
            }
        };

        let mut server = match inner.pool.acquire().await {
            Ok(s) => s,
            Err(PoolError::Closed) => break,
            Err(e) => {
                error!("acquiring upstream for client {}: {}", peer, e);
                break;
            }
        };

        let mut header = first;
        loop {
            let dispatched = timeout(
                inner.opts.message_timeout,
                inner.handle_message(&header, &mut client, &mut *server, &mut last_error),
            )
            .await
            .unwrap_or(Err(ProxyError::MessageTimeout));

            if let Err(e) = dispatched {
                inner.pool.discard(server).await;
                if matches!(e, ProxyError::TopologyChanged) {
                    inner.restart.trigger();
                }
                if !e.is_clean_close() {
                    error!("proxying message for client {}: {}", peer, e);
                }
                break 'session;
            }

            if !header.op_code.is_mutation() {
                break;
            }

            // The follow-up request after a mutation must reuse the same
            // upstream; it may be the getLastError for that mutation.
            match inner
                .read_client_header(&mut client, inner.opts.get_last_error_timeout)
                .await
            {
                Ok(h) => header = h,
                Err(SessionEnd::ReadTimeout) => break,
                Err(SessionEnd::NormalClose) => {
                    inner.pool.release(server).await;
                    break 'session;
                }
                Err(SessionEnd::Io(e)) => {
                    error!("client {} read: {}", peer, e);
                    inner.pool.release(server).await;
                    break 'session;
                }
            }
        }
        inner.pool.release(server).await;
    }

    info!("client {} disconnected from {}", peer, inner);
}

impl NodeInner {
    /// Read a client header within `window`, observing shutdown promptly.
    async fn read_client_header<S>(
        &self,
        client: &mut S,
        window: Duration,
    ) -> Result<MsgHeader, SessionEnd>
    where
        S: AsyncRead + Unpin + Send,
    {
        let mut shutdown = self.shutdown_rx.clone();
        if *shutdown.borrow() {
            return Err(SessionEnd::NormalClose);
        }
        tokio::select! {
            read = timeout(window, wire::read_header(client)) => match read {
                Ok(Ok(h)) => Ok(h),
                Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    Err(SessionEnd::NormalClose)
                }
                Ok(Err(e)) => Err(SessionEnd::Io(e)),
                Err(_) => Err(SessionEnd::ReadTimeout),
            },
            _ = shutdown.wait_for(|closed| *closed) => Err(SessionEnd::NormalClose),
        }
    }

    /// Proxy one message and, when the opcode calls for it, its response.
    async fn handle_message<C, S>(
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
        debug!("proxying message {} for {}", h, self);

        // OpQuery may need its reply transformed to keep the proxy
        // transparent.
        if h.op_code == OpCode::Query {
            return self.query.proxy(h, client, server, last_error).await;
        }

        // Anything besides a getLastError (which requires an OpQuery)
        // invalidates the cache.
        if last_error.exists() {
            debug!("reset getLastError cache");
            last_error.reset();
        }

        wire::write_header(server, h).await?;
        wire::copy_exact(server, client, h.body_length().max(0) as u64).await?;

        if h.op_code.has_response() {
            wire::copy_message(client, server).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rewrite::{
        ProxyMapper, ReplicaStateCompare, ResponseRewriter, REPLY_PREFIX_LEN,
    };
    use crate::error::MapError;
    use crate::protocol::HEADER_LEN;
    use crate::replica::{IsMasterReply, StatusReply};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

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

    fn test_query_proxy() -> QueryProxy {
        QueryProxy {
            rewriter: Arc::new(ResponseRewriter::new(
                Arc::new(NoMap),
                Arc::new(IdentityState),
            )),
            proxy_all_queries: false,
        }
    }

    fn test_options() -> NodeOptions {
        NodeOptions {
            message_timeout: Duration::from_secs(5),
            client_idle_timeout: Duration::from_secs(5),
            get_last_error_timeout: Duration::from_secs(5),
            pool: PoolOptions {
                max: 4,
                min_idle: 0,
                idle_timeout: Duration::from_secs(3600),
                close_pool_size: 1,
            },
            restart_on_dial_failure: false,
        }
    }

    /// Records every byte received and answers each OpQuery with a canned
    /// getLastError-style reply.
    struct FakeUpstream {
        addr: SocketAddr,
        accepts: Arc<AtomicUsize>,
        received: Arc<Mutex<Vec<u8>>>,
    }

    async fn fake_upstream() -> FakeUpstream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let task_accepts = Arc::clone(&accepts);
        let task_received = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                task_accepts.fetch_add(1, Ordering::SeqCst);
                let received = Arc::clone(&task_received);
                tokio::spawn(async move {
                    loop {
                        let Ok(h) = wire::read_header(&mut stream).await else {
                            return;
                        };
                        let mut body = vec![0u8; h.body_length().max(0) as usize];
                        if stream.read_exact(&mut body).await.is_err() {
                            return;
                        }
                        {
                            let mut log = received.lock().unwrap();
                            log.extend_from_slice(&h.to_wire());
                            log.extend_from_slice(&body);
                        }
                        if h.op_code == OpCode::Query {
                            let doc = bson::doc! { "err": bson::Bson::Null, "n": 0, "ok": 1.0 };
                            let doc_bytes = bson::to_vec(&doc).unwrap();
                            let reply = MsgHeader {
                                message_length: HEADER_LEN
                                    + REPLY_PREFIX_LEN as i32
                                    + doc_bytes.len() as i32,
                                request_id: 777,
                                response_to: h.request_id,
                                op_code: OpCode::Reply,
                            };
                            let mut prefix = [0u8; REPLY_PREFIX_LEN];
                            wire::set_i32(&mut prefix, 16, 1);
                            if stream.write_all(&reply.to_wire()).await.is_err() {
                                return;
                            }
                            let _ = stream.write_all(&prefix).await;
                            let _ = stream.write_all(&doc_bytes).await;
                        }
                    }
                });
            }
        });

        FakeUpstream {
            addr,
            accepts,
            received,
        }
    }

    async fn start_proxy(upstream: &FakeUpstream, opts: NodeOptions) -> (NodeProxy, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = NodeProxy::new(
            opts,
            addr.to_string(),
            upstream.addr.to_string(),
            listener,
            test_query_proxy(),
            RestartHandle::disconnected(),
        );
        proxy.start();
        (proxy, addr)
    }

    fn insert_message(request_id: i32, payload: &[u8]) -> Vec<u8> {
        let h = MsgHeader {
            message_length: HEADER_LEN + payload.len() as i32,
            request_id,
            response_to: 0,
            op_code: OpCode::Insert,
        };
        let mut msg = h.to_wire().to_vec();
        msg.extend_from_slice(payload);
        msg
    }

    fn gle_message(request_id: i32) -> Vec<u8> {
        let doc_bytes = bson::to_vec(&bson::doc! { "getLastError": 1 }).unwrap();
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(b"test.$cmd\0");
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&(-1i32).to_le_bytes());
        body.extend_from_slice(&doc_bytes);
        let h = MsgHeader {
            message_length: HEADER_LEN + body.len() as i32,
            request_id,
            response_to: 0,
            op_code: OpCode::Query,
        };
        let mut msg = h.to_wire().to_vec();
        msg.extend_from_slice(&body);
        msg
    }

    async fn wait_for_received(upstream: &FakeUpstream, len: usize) {
        for _ in 0..200 {
            if upstream.received.lock().unwrap().len() >= len {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("upstream never received {} bytes", len);
    }

    async fn read_reply(client: &mut TcpStream) -> (MsgHeader, Vec<u8>) {
        let h = wire::read_header(client).await.unwrap();
        let mut body = vec![0u8; h.body_length() as usize];
        client.read_exact(&mut body).await.unwrap();
        (h, body)
    }

    #[tokio::test]
    async fn test_insert_passthrough_keeps_session_open() {
        let upstream = fake_upstream().await;
        let (proxy, addr) = start_proxy(&upstream, test_options()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let msg = insert_message(1, b"fake insert body");
        client.write_all(&msg).await.unwrap();

        wait_for_received(&upstream, msg.len()).await;
        assert_eq!(*upstream.received.lock().unwrap(), msg);

        // The session is still usable for another request.
        let msg2 = insert_message(2, b"second body");
        client.write_all(&msg2).await.unwrap();
        wait_for_received(&upstream, msg.len() + msg2.len()).await;

        proxy.stop(true).await;
    }

    #[tokio::test]
    async fn test_mutation_pins_upstream_for_gle_and_serves_cache() {
        let upstream = fake_upstream().await;
        let (proxy, addr) = start_proxy(&upstream, test_options()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();

        // Mutation, then the follow-up getLastError.
        let insert = insert_message(10, b"doc bytes");
        client.write_all(&insert).await.unwrap();
        let gle = gle_message(11);
        client.write_all(&gle).await.unwrap();

        let (reply_header, reply_body) = read_reply(&mut client).await;
        assert_eq!(reply_header.response_to, 11);
        assert_eq!(reply_header.op_code, OpCode::Reply);

        // Both messages went upstream, over a single pinned connection.
        wait_for_received(&upstream, insert.len() + gle.len()).await;
        assert_eq!(upstream.accepts.load(Ordering::SeqCst), 1);
        let upstream_len = upstream.received.lock().unwrap().len();

        // A second getLastError is served from the cache: identical payload,
        // rewritten responseTo, and not a byte more upstream.
        client.write_all(&gle_message(12)).await.unwrap();
        let (cached_header, cached_body) = read_reply(&mut client).await;
        assert_eq!(cached_header.response_to, 12);
        assert_eq!(cached_header.request_id, reply_header.request_id);
        assert_eq!(cached_body, reply_body);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(upstream.received.lock().unwrap().len(), upstream_len);

        proxy.stop(true).await;
    }

    #[tokio::test]
    async fn test_gle_window_lapse_releases_upstream_for_reuse() {
        let upstream = fake_upstream().await;
        let mut opts = test_options();
        opts.get_last_error_timeout = Duration::from_millis(50);
        opts.pool.max = 1;
        let (proxy, addr) = start_proxy(&upstream, opts).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let insert = insert_message(20, b"pin me");
        client.write_all(&insert).await.unwrap();
        wait_for_received(&upstream, insert.len()).await;

        // Let the pin window lapse, then verify another client can use the
        // sole upstream connection.
        time::sleep(Duration::from_millis(120)).await;
        let mut other = TcpStream::connect(addr).await.unwrap();
        let msg = insert_message(21, b"after lapse");
        other.write_all(&msg).await.unwrap();
        wait_for_received(&upstream, insert.len() + msg.len()).await;
        assert_eq!(upstream.accepts.load(Ordering::SeqCst), 1);

        proxy.stop(true).await;
    }

    #[tokio::test]
    async fn test_stop_wakes_idle_sessions() {
        let upstream = fake_upstream().await;
        let (proxy, addr) = start_proxy(&upstream, test_options()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        time::sleep(Duration::from_millis(20)).await;

        // A graceful stop returns promptly even with an idle client parked
        // in its header read.
        timeout(Duration::from_secs(2), proxy.stop(false))
            .await
            .expect("stop should not hang on idle sessions");

        // The client sees the connection close.
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        // The listener is gone.
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
