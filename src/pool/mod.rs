/// Bounded, idle-evicting pool of upstream resources
///
/// A single coordinator task owns all pool state; callers interact with it
/// through a command channel, so no lock is ever held across I/O. Resource
/// creation runs in the acquiring caller: the coordinator hands out a
/// create token and the caller reports the outcome, so a slow or failing
/// dial never stalls the coordinator.
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::io;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::error::PoolError;

/// A resource the pool can own and eventually close.
#[async_trait]
pub trait PoolResource: Send + 'static {
    async fn close(self) -> io::Result<()>;
}

#[async_trait]
impl PoolResource for TcpStream {
    async fn close(mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

/// Factory invoked by acquiring callers when the pool asks for a new
/// resource.
pub type Factory<R> =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = io::Result<R>> + Send>> + Send + Sync>;

/// Invoked from the close workers when closing a resource fails.
pub type CloseErrorHandler = Arc<dyn Fn(io::Error) + Send + Sync>;

/// Pool sizing and eviction parameters.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Maximum number of concurrently alive resources.
    pub max: usize,
    /// Idle floor retained by eviction.
    pub min_idle: usize,
    /// Idle age beyond which resources past the floor are closed.
    pub idle_timeout: Duration,
    /// Number of background close workers.
    pub close_pool_size: usize,
}

/// A resource checked out of a [`Pool`]. Must be returned via
/// [`Pool::release`] or [`Pool::discard`].
#[derive(Debug)]
pub struct Pooled<R> {
    id: u64,
    inner: R,
}

impl<R> Pooled<R> {
    /// Pool-assigned identity, stable for the life of the resource.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<R> Deref for Pooled<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.inner
    }
}

impl<R> DerefMut for Pooled<R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

enum Handout<R> {
    Ready { id: u64, resource: R },
    Create,
    Closed,
}

enum Command<R> {
    Acquire(oneshot::Sender<Handout<R>>),
    NewArrived {
        resource: R,
        reply: oneshot::Sender<Handout<R>>,
    },
    FailedNew,
    Release {
        id: u64,
        resource: R,
        reply: oneshot::Sender<bool>,
    },
    Discard {
        id: u64,
        resource: R,
        reply: oneshot::Sender<bool>,
    },
    Close(oneshot::Sender<()>),
}

/// Handle to a coordinator-backed resource pool. Cheap to clone.
pub struct Pool<R: PoolResource> {
    cmd_tx: mpsc::UnboundedSender<Command<R>>,
    factory: Factory<R>,
}

impl<R: PoolResource> Clone for Pool<R> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<R: PoolResource> Pool<R> {
    /// Spawn the coordinator and close workers for a new pool.
    ///
    /// Panics on a zero `max`, `idle_timeout` or `close_pool_size`; these
    /// are configuration errors, not runtime conditions.
    pub fn new(opts: PoolOptions, factory: Factory<R>, on_close_error: CloseErrorHandler) -> Self {
        assert!(opts.max > 0, "pool max cannot be 0");
        assert!(
            !opts.idle_timeout.is_zero(),
            "pool idle_timeout cannot be 0"
        );
        assert!(opts.close_pool_size > 0, "pool close_pool_size cannot be 0");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (closers_tx, closers_rx) = mpsc::unbounded_channel::<R>();

        let closers_rx = Arc::new(Mutex::new(closers_rx));
        let mut close_workers = Vec::with_capacity(opts.close_pool_size);
        for _ in 0..opts.close_pool_size {
            let rx = Arc::clone(&closers_rx);
            let on_error = Arc::clone(&on_close_error);
            close_workers.push(tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    match next {
                        Some(resource) => {
                            if let Err(e) = resource.close().await {
                                on_error(e);
                            }
                        }
                        None => break,
                    }
                }
            }));
        }

        let coordinator = Coordinator {
            opts,
            cmd_rx,
            idle: Vec::new(),
            waiters: VecDeque::new(),
            out: HashSet::new(),
            live: 0,
            next_id: 0,
            closers_tx: Some(closers_tx),
            close_workers,
            closed: false,
            close_replies: Vec::new(),
        };
        tokio::spawn(coordinator.run());

        Self { cmd_tx, factory }
    }

    /// Check a resource out of the pool, blocking while the pool is
    /// saturated. Fails with [`PoolError::Closed`] once the pool is closed,
    /// and with [`PoolError::Create`] if a needed new resource could not be
    /// created.
    pub async fn acquire(&self) -> Result<Pooled<R>, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Acquire(tx))
            .map_err(|_| PoolError::Closed)?;

        match rx.await.map_err(|_| PoolError::Closed)? {
            Handout::Ready { id, resource } => Ok(Pooled {
                id,
                inner: resource,
            }),
            Handout::Closed => Err(PoolError::Closed),
            Handout::Create => match (self.factory)().await {
                Ok(resource) => {
                    let (ntx, nrx) = oneshot::channel();
                    self.cmd_tx
                        .send(Command::NewArrived {
                            resource,
                            reply: ntx,
                        })
                        .map_err(|_| PoolError::Closed)?;
                    match nrx.await.map_err(|_| PoolError::Closed)? {
                        Handout::Ready { id, resource } => Ok(Pooled {
                            id,
                            inner: resource,
                        }),
                        _ => Err(PoolError::Closed),
                    }
                }
                Err(e) => {
                    // Give back the slot reserved by the create token.
                    let _ = self.cmd_tx.send(Command::FailedNew);
                    Err(PoolError::Create(e))
                }
            },
        }
    }

    /// Return a resource to the pool as idle, or hand it straight to a
    /// blocked waiter. Panics if the resource was not acquired from this
    /// pool.
    pub async fn release(&self, pooled: Pooled<R>) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Release {
                id: pooled.id,
                resource: pooled.inner,
                reply: tx,
            })
            .is_err()
        {
            // Pool fully shut down; nothing left to return to.
            return;
        }
        if let Ok(false) = rx.await {
            panic!("released a resource that was not acquired from this pool");
        }
    }

    /// Close a resource (asynchronously, via the close workers) and give up
    /// its slot. Panics if the resource was not acquired from this pool.
    pub async fn discard(&self, pooled: Pooled<R>) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Discard {
                id: pooled.id,
                resource: pooled.inner,
                reply: tx,
            })
            .is_err()
        {
            return;
        }
        if let Ok(false) = rx.await {
            panic!("discarded a resource that was not acquired from this pool");
        }
    }

    /// Fence new acquisitions, fail blocked waiters, close all idle
    /// resources, then wait for every checked-out resource to come back and
    /// be closed.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

struct IdleEntry<R> {
    id: u64,
    resource: R,
    since: Instant,
}

struct Coordinator<R: PoolResource> {
    opts: PoolOptions,
    cmd_rx: mpsc::UnboundedReceiver<Command<R>>,
    /// LRU stack of idle resources: most recently used at the end.
    idle: Vec<IdleEntry<R>>,
    /// FIFO queue of blocked acquirers.
    waiters: VecDeque<oneshot::Sender<Handout<R>>>,
    /// Identities of checked-out resources.
    out: HashSet<u64>,
    /// Checked-out resources plus in-flight creations.
    live: usize,
    next_id: u64,
    closers_tx: Option<mpsc::UnboundedSender<R>>,
    close_workers: Vec<JoinHandle<()>>,
    closed: bool,
    close_replies: Vec<oneshot::Sender<()>>,
}

impl<R: PoolResource> Coordinator<R> {
    async fn run(mut self) {
        let mut tick = time::interval(self.opts.idle_timeout);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.closed && self.live == 0 && self.waiters.is_empty() {
                break;
            }
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = tick.tick(), if !self.closed => self.evict_idle(),
            }
        }

        // All resources accounted for: let the close workers drain and
        // acknowledge the close.
        drop(self.closers_tx.take());
        for worker in self.close_workers.drain(..) {
            let _ = worker.await;
        }
        for reply in self.close_replies.drain(..) {
            let _ = reply.send(());
        }
    }

    fn handle(&mut self, cmd: Command<R>) {
        match cmd {
            Command::Acquire(reply) => self.on_acquire(reply),
            Command::NewArrived { resource, reply } => self.on_new_arrived(resource, reply),
            Command::FailedNew => self.on_failed_new(),
            Command::Release {
                id,
                resource,
                reply,
            } => self.on_release(id, resource, reply),
            Command::Discard {
                id,
                resource,
                reply,
            } => self.on_discard(id, resource, reply),
            Command::Close(reply) => self.on_close(reply),
        }
    }

    fn on_acquire(&mut self, reply: oneshot::Sender<Handout<R>>) {
        if self.closed {
            let _ = reply.send(Handout::Closed);
            return;
        }

        // Prefer the most recently used idle resource.
        if let Some(entry) = self.idle.pop() {
            self.out.insert(entry.id);
            self.live += 1;
            if let Err(Handout::Ready { id, resource }) = reply.send(Handout::Ready {
                id: entry.id,
                resource: entry.resource,
            }) {
                // The acquirer went away; keep the resource idle.
                self.out.remove(&id);
                self.live -= 1;
                self.idle.push(IdleEntry {
                    id,
                    resource,
                    since: Instant::now(),
                });
            }
            return;
        }

        if self.live >= self.opts.max {
            self.waiters.push_back(reply);
            return;
        }

        // Reserve a slot and have the caller create the resource.
        self.live += 1;
        if reply.send(Handout::Create).is_err() {
            self.live -= 1;
        }
    }

    fn on_new_arrived(&mut self, resource: R, reply: oneshot::Sender<Handout<R>>) {
        let id = self.next_id;
        self.next_id += 1;
        self.out.insert(id);
        if let Err(Handout::Ready { id, resource }) = reply.send(Handout::Ready { id, resource }) {
            // Creator vanished between factory success and pickup.
            self.out.remove(&id);
            self.live -= 1;
            self.send_to_closers(resource);
        }
    }

    fn on_failed_new(&mut self) {
        if !self.hand_create_to_waiter() {
            self.live -= 1;
        }
    }

    fn on_release(&mut self, id: u64, resource: R, reply: oneshot::Sender<bool>) {
        if !self.out.contains(&id) {
            let _ = reply.send(false);
            return;
        }
        let _ = reply.send(true);

        // Hand it straight to the oldest waiter; the identity stays
        // checked out.
        let mut resource = resource;
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(Handout::Ready { id, resource }) {
                Ok(()) => return,
                Err(Handout::Ready { resource: r, .. }) => {
                    resource = r;
                }
                Err(_) => unreachable!(),
            }
        }

        self.out.remove(&id);
        self.live -= 1;
        if self.closed {
            self.send_to_closers(resource);
        } else {
            self.idle.push(IdleEntry {
                id,
                resource,
                since: Instant::now(),
            });
        }
    }

    fn on_discard(&mut self, id: u64, resource: R, reply: oneshot::Sender<bool>) {
        if !self.out.remove(&id) {
            let _ = reply.send(false);
            return;
        }
        let _ = reply.send(true);
        self.send_to_closers(resource);

        // A waiter can immediately create a replacement; the slot stays
        // reserved in that case.
        if !self.hand_create_to_waiter() {
            self.live -= 1;
        }
    }

    fn on_close(&mut self, reply: oneshot::Sender<()>) {
        self.close_replies.push(reply);
        if self.closed {
            return;
        }
        self.closed = true;

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Handout::Closed);
        }
        let idle: Vec<_> = self.idle.drain(..).collect();
        for entry in idle {
            self.send_to_closers(entry.resource);
        }
    }

    fn evict_idle(&mut self) {
        if self.idle.len() <= self.opts.min_idle {
            return;
        }
        let now = Instant::now();
        let eligible = self.idle.len() - self.opts.min_idle;
        let mut expired = 0;
        for entry in &self.idle[..eligible] {
            if now.duration_since(entry.since) < self.opts.idle_timeout {
                break;
            }
            expired += 1;
        }
        let evicted: Vec<_> = self.idle.drain(..expired).collect();
        for entry in evicted {
            self.send_to_closers(entry.resource);
        }
    }

    fn hand_create_to_waiter(&mut self) -> bool {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.send(Handout::Create).is_ok() {
                return true;
            }
        }
        false
    }

    fn send_to_closers(&mut self, resource: R) {
        if let Some(tx) = &self.closers_tx {
            if tx.send(resource).is_err() {
                warn!("pool close workers gone, dropping resource unclosed");
            }
        }
    }
}
