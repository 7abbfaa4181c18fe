/// Replica set supervisor
///
/// Owns the fleet of per-member node proxies: discovers the topology from
/// seeds, allocates a listener per healthy member in the configured port
/// range, builds the immutable proxy address mapping for the fleet
/// generation, and tears the whole fleet down and up again when a session
/// observes topology drift.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::join_all;
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

use crate::config::Config;
use crate::core::query::QueryProxy;
use crate::core::rewrite::{ProxyMapper, ReplicaStateCompare, ResponseRewriter};
use crate::core::NodeProxy;
use crate::error::{MapError, StartError};

use super::{ReplicaState, StateBuilder};

/// Arms the restart gate on behalf of the fleet generation that observed a
/// topology change. Cheap to clone into every session.
#[derive(Debug, Clone)]
pub struct RestartHandle {
    generation: u64,
    tx: mpsc::UnboundedSender<u64>,
}

impl RestartHandle {
    /// Request a restart of the fleet this handle belongs to. Requests from
    /// superseded generations are discarded by the gate.
    pub fn trigger(&self) {
        let _ = self.tx.send(self.generation);
    }

    /// A handle whose triggers go nowhere, for proxies run outside a
    /// supervisor.
    pub fn disconnected() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self { generation: 0, tx }
    }
}

/// Bijective real-address ↔ proxy-address mapping for one fleet generation,
/// plus the members deliberately left unproxied. Built during `start()` and
/// never mutated afterwards, so readers need no locks.
#[derive(Debug, Default)]
pub struct ProxyMapping {
    proxy_to_real: HashMap<String, String>,
    real_to_proxy: HashMap<String, String>,
    ignored: HashMap<String, ReplicaState>,
}

impl ProxyMapping {
    fn add(&mut self, proxy: String, real: String) -> Result<(), StartError> {
        if self.proxy_to_real.contains_key(&proxy) {
            return Err(StartError::DuplicateMember { addr: proxy });
        }
        if self.real_to_proxy.contains_key(&real) {
            return Err(StartError::DuplicateMember { addr: real });
        }
        info!("added proxy {} => mongo {}", proxy, real);
        self.proxy_to_real.insert(proxy.clone(), real.clone());
        self.real_to_proxy.insert(real, proxy);
        Ok(())
    }

    fn add_ignored(&mut self, real: String, state: ReplicaState) {
        self.ignored.insert(real, state);
    }

    /// The proxy addresses advertised to clients.
    pub fn proxy_members(&self) -> Vec<String> {
        self.proxy_to_real.keys().cloned().collect()
    }
}

impl ProxyMapper for ProxyMapping {
    fn proxy(&self, real_host: &str) -> Result<String, MapError> {
        if let Some(proxy) = self.real_to_proxy.get(real_host) {
            return Ok(proxy.clone());
        }
        if let Some(state) = self.ignored.get(real_host) {
            return Err(MapError::Ignored {
                host: real_host.to_string(),
                state: state.clone(),
            });
        }
        Err(MapError::Unknown {
            host: real_host.to_string(),
        })
    }
}

struct Fleet {
    generation: u64,
    mapping: Arc<ProxyMapping>,
    proxies: Vec<NodeProxy>,
}

/// Supervises the set of per-member proxies for one replica set.
#[derive(Clone)]
pub struct ReplicaSet {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    config: Config,
    builder: StateBuilder,
    /// Original seeds plus every member discovered since; restarts draw
    /// from here even if the original seeds are gone.
    seeds: StdMutex<Vec<String>>,
    fleet: Mutex<Option<Fleet>>,
    generation: AtomicU64,
    restart_tx: mpsc::UnboundedSender<u64>,
    restart_rx: StdMutex<Option<mpsc::UnboundedReceiver<u64>>>,
}

impl ReplicaSet {
    pub fn new(config: Config) -> Self {
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let seeds = config.seed_addrs();
        let builder = StateBuilder::new(config.replica_name.clone());
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                builder,
                seeds: StdMutex::new(seeds),
                fleet: Mutex::new(None),
                generation: AtomicU64::new(0),
                restart_tx,
                restart_rx: StdMutex::new(Some(restart_rx)),
            }),
        }
    }

    /// Current fleet generation; 0 before the first successful start.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Run the restart gate: stale requests are dropped, a current one
    /// tears the fleet down and starts it again. A failed restart is
    /// unrecoverable and exits the process.
    pub fn spawn_restart_task(&self) {
        let rx = self.inner.restart_rx.lock().unwrap().take();
        let Some(mut rx) = rx else {
            warn!("restart task already running");
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(observed) = rx.recv().await {
                if observed != this.generation() {
                    // A session from an already-replaced fleet; the restart
                    // it asked for has effectively happened.
                    continue;
                }
                info!("restart triggered");
                this.stop(this.inner.config.hard_restart).await;
                info!("successfully stopped for restart");
                if let Err(e) = this.start().await {
                    error!("start failed for restart: {}", e);
                    std::process::exit(1);
                }
                info!("successfully restarted");
            }
        });
    }

    /// Discover the topology and bring up one proxy per healthy member.
    pub async fn start(&self) -> Result<(), StartError> {
        let mut fleet_slot = self.inner.fleet.lock().await;
        if fleet_slot.is_some() {
            warn!("replica set already started");
            return Ok(());
        }

        let seeds = self.inner.seeds.lock().unwrap().clone();
        if seeds.is_empty() {
            return Err(StartError::NoSeeds);
        }

        let state = self.inner.builder.from_seeds(&seeds).await?;
        let healthy = state.addrs();
        if healthy.is_empty() {
            return Err(StartError::NoHealthyNodes {
                addrs: seeds.join(","),
            });
        }

        // Fold discovered members into the seed list: over time the
        // original seeds may leave the set entirely.
        {
            let mut stored = self.inner.seeds.lock().unwrap();
            let mut merged = stored.clone();
            merged.extend(healthy.iter().cloned());
            merged.sort();
            merged.dedup();
            *stored = merged;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let restart = RestartHandle {
            generation,
            tx: self.inner.restart_tx.clone(),
        };

        let hostname = proxy_hostname().await;
        let mut mapping = ProxyMapping::default();
        let mut bound = Vec::with_capacity(healthy.len());
        for mongo_addr in &healthy {
            let listener =
                allocate_listener(self.inner.config.port_start, self.inner.config.port_end)
                    .await?;
            let port = listener.local_addr()?.port();
            let proxy_addr = format!("{}:{}", hostname, port);
            mapping.add(proxy_addr.clone(), mongo_addr.clone())?;
            bound.push((listener, proxy_addr, mongo_addr.clone()));
        }

        // Members we know about but do not front, typically arbiters: the
        // rewriters drop them from client-visible replies.
        if let Some(rs) = &state.last_rs {
            for member in &rs.members {
                if !mapping.real_to_proxy.contains_key(&member.name) {
                    let member_state = member
                        .state
                        .clone()
                        .unwrap_or_else(|| ReplicaState::Other("UNKNOWN".to_string()));
                    info!(
                        "ignoring member {} in state {}",
                        member.name, member_state
                    );
                    mapping.add_ignored(member.name.clone(), member_state);
                }
            }
        }

        let mapping = Arc::new(mapping);
        let state = Arc::new(state);
        let rewriter = Arc::new(ResponseRewriter::new(
            Arc::clone(&mapping) as Arc<dyn ProxyMapper>,
            Arc::clone(&state) as Arc<dyn ReplicaStateCompare>,
        ));

        let node_opts = self.inner.config.node_options();
        let mut proxies = Vec::with_capacity(bound.len());
        for (listener, proxy_addr, mongo_addr) in bound {
            let query = QueryProxy {
                rewriter: Arc::clone(&rewriter),
                proxy_all_queries: self.inner.config.proxy_all_queries,
            };
            let proxy = NodeProxy::new(
                node_opts.clone(),
                proxy_addr,
                mongo_addr,
                listener,
                query,
                restart.clone(),
            );
            proxy.start();
            proxies.push(proxy);
        }

        info!(
            "started {} node proxies (generation {})",
            proxies.len(),
            generation
        );
        *fleet_slot = Some(Fleet {
            generation,
            mapping,
            proxies,
        });
        Ok(())
    }

    /// Stop every node proxy in parallel.
    pub async fn stop(&self, hard: bool) {
        let fleet = self.inner.fleet.lock().await.take();
        if let Some(fleet) = fleet {
            join_all(fleet.proxies.iter().map(|p| p.stop(hard))).await;
            info!("stopped fleet generation {}", fleet.generation);
        }
    }

    /// Map a real member address to its advertised proxy address.
    pub async fn proxy_for(&self, real_host: &str) -> Result<String, MapError> {
        let fleet = self.inner.fleet.lock().await;
        match fleet.as_ref() {
            Some(f) => f.mapping.proxy(real_host),
            None => Err(MapError::Unknown {
                host: real_host.to_string(),
            }),
        }
    }

    /// The proxy addresses clients should connect to.
    pub async fn proxy_members(&self) -> Vec<String> {
        let fleet = self.inner.fleet.lock().await;
        fleet
            .as_ref()
            .map(|f| f.mapping.proxy_members())
            .unwrap_or_default()
    }
}

/// First free port in the configured range wins.
async fn allocate_listener(start: u16, end: u16) -> Result<TcpListener, StartError> {
    for port in start..=end {
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
            return Ok(listener);
        }
    }
    Err(StartError::NoFreePort { start, end })
}

/// The hostname advertised in rewritten replies. It must resolve to an
/// address of this machine, otherwise clients would chase an unreachable
/// name; `127.0.0.1` is the fallback.
async fn proxy_hostname() -> String {
    const HOME: &str = "127.0.0.1";

    let Ok(raw) = hostname::get() else {
        return HOME.to_string();
    };
    let Some(name) = raw.to_str().map(str::to_owned) else {
        return HOME.to_string();
    };

    let Ok(resolved) = tokio::net::lookup_host((name.as_str(), 0u16)).await else {
        warn!("hostname {} does not resolve", name);
        return HOME.to_string();
    };
    let mut local = false;
    for addr in resolved {
        // Binding succeeds only on addresses assigned to a local interface.
        if std::net::TcpListener::bind((addr.ip(), 0)).is_ok() {
            local = true;
            break;
        }
    }
    if local {
        return name;
    }
    warn!("hostname {} doesn't resolve to the current host", name);
    HOME.to_string()
}
