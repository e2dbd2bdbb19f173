//! Cluster routing: slot derivation, topology cache and the MOVED/ASK
//! redirection state machine.
//!
//! The router never invents topology. It caches what `CLUSTER SLOTS`
//! reports, routes each keyed command to the cached slot owner and treats
//! redirects as authoritative hints: an `ASK` retries once at the hinted
//! node, a `MOVED` retries there and schedules a background re-sync so the
//! cache converges on the servers' view.

use crate::cmd::Cmd;
use crate::pool::{Connector, Pool};
use crate::trace::{self, ClusterTrace, RedirectKind, Redirected, TopoChanged};
use bytes::Bytes;
use crc16::{State, XMODEM};
use redshard_core::types::NUM_SLOTS;
use redshard_core::{ClusterConfig, Error, Node, RespValue, Result, SlotRange, Topology};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Hash slot for a key: CRC16-XMODEM over the key (or its hash tag),
/// modulo the slot count.
#[must_use]
pub fn calculate_slot(key: &[u8]) -> u16 {
    State::<XMODEM>::calculate(extract_hash_tag(key)) % NUM_SLOTS
}

/// Apply the hash-tag rule: if the key contains `{...}` with a non-empty
/// inner substring, only that substring is hashed. This is what lets
/// multi-key commands pin related keys to one slot.
fn extract_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[start + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[start + 1..start + 1 + len];
            }
        }
    }
    key
}

/// The slot shared by every key of a command, `None` for keyless commands.
fn slot_for_keys(keys: &[Bytes]) -> Result<Option<u16>> {
    let mut slot = None;
    for key in keys {
        let s = calculate_slot(key);
        match slot {
            None => slot = Some(s),
            Some(prev) if prev != s => return Err(Error::CrossSlot),
            Some(_) => {}
        }
    }
    Ok(slot)
}

/// Parse a `CLUSTER SLOTS` reply into an ordered topology snapshot.
///
/// Each entry is `[lo, hi, primary, replica...]` where a node is
/// `[host, port, id?, ...]`; trailing fields beyond the id are tolerated.
/// The primaries must cover every slot exactly once.
pub fn parse_cluster_slots(value: &RespValue) -> Result<Topology> {
    let entries = value
        .as_array()
        .map_err(|_| Error::Cluster("CLUSTER SLOTS reply is not an array".into()))?;

    // Primary addr -> (node, replicas), insertion-ordered via index map.
    let mut order: Vec<String> = Vec::new();
    let mut by_addr: HashMap<String, (Node, Vec<Node>)> = HashMap::new();

    for entry in entries {
        let parts = entry
            .as_array()
            .map_err(|_| Error::Cluster("slot entry is not an array".into()))?;
        if parts.len() < 3 {
            return Err(Error::Cluster(format!(
                "slot entry has {} fields, expected at least 3",
                parts.len()
            )));
        }
        let lo = parts[0].as_int().map_err(|e| Error::Cluster(e.to_string()))?;
        let hi = parts[1].as_int().map_err(|e| Error::Cluster(e.to_string()))?;
        if lo < 0 || hi < lo || hi >= i64::from(NUM_SLOTS) {
            return Err(Error::Cluster(format!("invalid slot range {lo}..{hi}")));
        }
        let range = SlotRange::new(lo as u16, hi as u16);

        let (addr, id) = parse_node_fields(&parts[2])?;
        let (node, replicas) = match by_addr.entry(addr.clone()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                order.push(addr.clone());
                e.insert((
                    Node {
                        addr,
                        id,
                        slots: Vec::new(),
                        replica_of: None,
                    },
                    Vec::new(),
                ))
            }
        };
        node.slots.push(range);

        for part in &parts[3..] {
            let (raddr, rid) = parse_node_fields(part)?;
            if replicas.iter().any(|r: &Node| r.addr == raddr) {
                continue;
            }
            replicas.push(Node {
                addr: raddr,
                id: rid,
                slots: Vec::new(),
                replica_of: Some(node.addr.clone()),
            });
        }
    }

    // Primaries in slot order, every slot served exactly once.
    order.sort_by_key(|addr| {
        by_addr[addr]
            .0
            .slots
            .iter()
            .map(|r| r.start)
            .min()
            .unwrap_or(NUM_SLOTS)
    });
    let mut ranges: Vec<SlotRange> = by_addr
        .values()
        .flat_map(|(node, _)| node.slots.iter().copied())
        .collect();
    ranges.sort();
    let mut expect = 0u32;
    for range in &ranges {
        if u32::from(range.start) != expect {
            return Err(Error::Cluster(format!(
                "slots not covered exactly once around slot {expect}"
            )));
        }
        expect = u32::from(range.end) + 1;
    }
    if expect != u32::from(NUM_SLOTS) {
        return Err(Error::Cluster(format!(
            "slot coverage ends at {expect}, expected {NUM_SLOTS}"
        )));
    }

    let mut nodes = Vec::new();
    let mut all_replicas = Vec::new();
    for addr in order {
        if let Some((node, replicas)) = by_addr.remove(&addr) {
            nodes.push(node);
            all_replicas.extend(replicas);
        }
    }
    nodes.extend(all_replicas);
    Ok(Topology::new(nodes))
}

fn parse_node_fields(value: &RespValue) -> Result<(String, String)> {
    let parts = value
        .as_array()
        .map_err(|_| Error::Cluster("node entry is not an array".into()))?;
    if parts.len() < 2 {
        return Err(Error::Cluster("node entry missing host or port".into()));
    }
    let host = parts[0]
        .as_str()
        .map_err(|e| Error::Cluster(e.to_string()))?;
    let port = parts[1]
        .as_int()
        .map_err(|e| Error::Cluster(e.to_string()))?;
    if !(1..=65535).contains(&port) {
        return Err(Error::Cluster(format!("invalid port {port}")));
    }
    let id = parts
        .get(2)
        .and_then(|v| v.as_str().ok())
        .unwrap_or_default()
        .to_string();
    Ok((format!("{host}:{port}"), id))
}

#[derive(Default)]
struct ClusterState {
    topo: Topology,
    pools: HashMap<String, Pool>,
}

struct ClusterShared {
    cfg: ClusterConfig,
    connector: Arc<dyn Connector>,
    state: RwLock<ClusterState>,
    sync_lock: Mutex<()>,
    sync_inflight: AtomicBool,
    rr: AtomicUsize,
    closed: AtomicBool,
    trace: ClusterTrace,
}

impl ClusterShared {
    /// Pool for an address, opening one on demand. Redirects can point at
    /// addresses the cached topology does not know yet; the next sync
    /// reconciles the pool set with the topology.
    async fn ensure_pool(&self, addr: &str) -> Result<Pool> {
        if let Some(pool) = self.state.read().await.pools.get(addr) {
            return Ok(pool.clone());
        }
        let pool = Pool::new(addr, Arc::clone(&self.connector), self.cfg.pool).await?;
        let mut st = self.state.write().await;
        match st.pools.entry(addr.to_string()) {
            Entry::Occupied(e) => {
                let existing = e.get().clone();
                drop(st);
                pool.close().await;
                Ok(existing)
            }
            Entry::Vacant(e) => {
                e.insert(pool.clone());
                Ok(pool)
            }
        }
    }

    fn deadline(&self) -> Option<Instant> {
        Some(Instant::now() + self.cfg.operation_timeout)
    }
}

/// A cluster-aware client: routes commands by key slot and follows
/// MOVED/ASK redirects across live slot migrations.
///
/// Cloning is cheap; clones share the topology cache and pools.
#[derive(Clone)]
pub struct Cluster {
    shared: Arc<ClusterShared>,
}

impl Cluster {
    /// Connect to the cluster: dial the seeds in order until one serves a
    /// topology, then open a pool per discovered node.
    pub async fn new(cfg: ClusterConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::with_trace(cfg, connector, ClusterTrace::default()).await
    }

    /// Like [`Cluster::new`] with trace hooks installed.
    pub async fn with_trace(
        cfg: ClusterConfig,
        connector: Arc<dyn Connector>,
        trace: ClusterTrace,
    ) -> Result<Self> {
        if cfg.seeds.is_empty() {
            return Err(Error::Config("no seed addresses".into()));
        }
        let cluster = Self {
            shared: Arc::new(ClusterShared {
                cfg,
                connector,
                state: RwLock::new(ClusterState::default()),
                sync_lock: Mutex::new(()),
                sync_inflight: AtomicBool::new(false),
                rr: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                trace,
            }),
        };

        let seeds = cluster.shared.cfg.seeds.clone();
        let mut last_err = None;
        for seed in &seeds {
            let pool = match cluster.shared.ensure_pool(seed).await {
                Ok(pool) => pool,
                Err(err) => {
                    warn!(addr = %seed, %err, "seed unreachable");
                    last_err = Some(err);
                    continue;
                }
            };
            match cluster.sync_via(&pool).await {
                Ok(()) => return Ok(cluster),
                Err(err) => {
                    warn!(addr = %seed, %err, "seed did not serve a usable topology");
                    last_err = Some(err);
                }
            }
        }

        // No seed worked; tear down whatever pools were opened.
        let pools: Vec<Pool> = {
            let mut st = cluster.shared.state.write().await;
            st.pools.drain().map(|(_, pool)| pool).collect()
        };
        for pool in pools {
            pool.close().await;
        }
        Err(last_err.unwrap_or_else(|| Error::Config("no seed addresses".into())))
    }

    /// Route one command and return its reply.
    ///
    /// Keyed commands go to the cached owner of their slot; keyless
    /// commands round-robin across known nodes. Commands whose keys span
    /// slots fail locally with [`Error::CrossSlot`] before any I/O.
    pub async fn run(&self, cmd: &Cmd) -> Result<RespValue> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let slot = slot_for_keys(cmd.keys())?;
        let addr = match slot {
            Some(slot) => self.addr_for_slot(slot).await?,
            None => self.any_addr().await?,
        };
        let attempts = self.shared.cfg.max_redirects + 1;
        self.do_inner(cmd, addr, slot, false, attempts).await
    }

    /// One attempt loop of the redirection state machine. Per-attempt state
    /// is `(addr, ask)`; `attempts` bounds redirects and transport retries
    /// together.
    async fn do_inner(
        &self,
        cmd: &Cmd,
        mut addr: String,
        slot: Option<u16>,
        mut ask: bool,
        attempts: usize,
    ) -> Result<RespValue> {
        let sh = &self.shared;
        let mut remaining = attempts.max(1);
        loop {
            let deadline = sh.deadline();
            let pool = sh.ensure_pool(&addr).await?;
            let mut conn = pool.get().await?;
            let res = if ask {
                // Tell the importing node to serve the migrating key.
                match conn.run_command(deadline, &Cmd::new("ASKING")).await {
                    Ok(_) => conn.run_command(deadline, cmd).await,
                    Err(err) => Err(err),
                }
            } else {
                conn.run_command(deadline, cmd).await
            };
            pool.put(conn);

            let err = match res {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let retryable = err.is_redirect() || !err.is_connection_usable();
            if !retryable || remaining <= 1 {
                return Err(err);
            }
            remaining -= 1;

            match &err {
                Error::Moved { host, port, .. } => {
                    addr = format!("{host}:{port}");
                    debug!(%addr, "following MOVED redirect");
                    trace::fire(
                        &sh.trace.redirected,
                        &Redirected {
                            kind: RedirectKind::Moved,
                            addr: addr.clone(),
                        },
                    );
                    ask = false;
                    // MOVED means the cache has drifted; converge it off
                    // the request path.
                    self.schedule_sync();
                }
                Error::Ask { host, port, .. } => {
                    addr = format!("{host}:{port}");
                    debug!(%addr, "following ASK redirect");
                    trace::fire(
                        &sh.trace.redirected,
                        &Redirected {
                            kind: RedirectKind::Ask,
                            addr: addr.clone(),
                        },
                    );
                    ask = true;
                }
                _ => {
                    warn!(%err, %addr, "transport error, retrying at slot owner");
                    if let Some(slot) = slot {
                        if let Some(owner) = sh.state.read().await.topo.addr_for_slot(slot) {
                            addr = owner.to_string();
                        }
                    }
                    ask = false;
                }
            }
        }
    }

    async fn addr_for_slot(&self, slot: u16) -> Result<String> {
        self.shared
            .state
            .read()
            .await
            .topo
            .addr_for_slot(slot)
            .map(str::to_string)
            .ok_or_else(|| Error::Cluster(format!("no known node serves slot {slot}")))
    }

    async fn any_addr(&self) -> Result<String> {
        let st = self.shared.state.read().await;
        let mut addrs: Vec<&String> = st.pools.keys().collect();
        if addrs.is_empty() {
            return Err(Error::Cluster("no known nodes".into()));
        }
        addrs.sort();
        let i = self.shared.rr.fetch_add(1, Ordering::Relaxed) % addrs.len();
        Ok(addrs[i].clone())
    }

    /// Fetch `CLUSTER SLOTS` from a reachable node and swap the cached
    /// topology, opening pools for new nodes and closing pools whose node
    /// disappeared. At most one sync runs at a time.
    pub async fn sync(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let _guard = self.shared.sync_lock.lock().await;
        let sources = self.sync_sources().await;
        if sources.is_empty() {
            return Err(Error::Cluster("no pool available for topology sync".into()));
        }
        let mut last_err = None;
        for pool in sources {
            match self.sync_via(&pool).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(addr = %pool.addr(), %err, "topology sync attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Cluster("topology sync failed".into())))
    }

    /// Candidate pools for a sync: the known primaries first (slot order),
    /// then the rest, rotated so retries spread across nodes.
    async fn sync_sources(&self) -> Vec<Pool> {
        let st = self.shared.state.read().await;
        let mut out: Vec<Pool> = Vec::with_capacity(st.pools.len());
        let mut seen = HashSet::new();
        for node in st.topo.primaries() {
            if let Some(pool) = st.pools.get(&node.addr) {
                seen.insert(node.addr.clone());
                out.push(pool.clone());
            }
        }
        let mut rest: Vec<&String> = st
            .pools
            .keys()
            .filter(|addr| !seen.contains(*addr))
            .collect();
        rest.sort();
        if !rest.is_empty() {
            let shift = self.shared.rr.fetch_add(1, Ordering::Relaxed) % rest.len();
            rest.rotate_left(shift);
        }
        for addr in rest {
            out.push(st.pools[addr].clone());
        }
        out
    }

    async fn sync_via(&self, pool: &Pool) -> Result<()> {
        let reply = pool
            .run_command(self.shared.deadline(), &Cmd::new("CLUSTER").arg("SLOTS"))
            .await?;
        let topo = parse_cluster_slots(&reply)?;
        self.apply_topology(topo).await
    }

    /// Copy-on-write swap: pools for new addresses are opened off-lock, the
    /// `(topo, pools)` pair is replaced under a short write section, and
    /// stale pools are closed after the lock is released.
    async fn apply_topology(&self, topo: Topology) -> Result<()> {
        let sh = &self.shared;
        let wanted: HashSet<String> = topo.addrs().map(str::to_string).collect();
        let existing: HashSet<String> = {
            let st = sh.state.read().await;
            st.pools.keys().cloned().collect()
        };

        let mut created: Vec<(String, Pool)> = Vec::new();
        for addr in wanted.difference(&existing) {
            match Pool::new(addr.clone(), Arc::clone(&sh.connector), sh.cfg.pool).await {
                Ok(pool) => created.push((addr.clone(), pool)),
                Err(err) => {
                    for (_, pool) in created {
                        pool.close().await;
                    }
                    return Err(err);
                }
            }
        }

        let (mut stale, changed) = {
            let mut st = sh.state.write().await;
            let mut replaced = Vec::new();
            for (addr, pool) in created {
                if let Some(prev) = st.pools.insert(addr, pool) {
                    // Lost a race with ensure_pool; keep the newer pool.
                    replaced.push(prev);
                }
            }
            let stale_addrs: Vec<String> = st
                .pools
                .keys()
                .filter(|addr| !wanted.contains(*addr))
                .cloned()
                .collect();
            let mut stale: Vec<Pool> = stale_addrs
                .iter()
                .filter_map(|addr| st.pools.remove(addr))
                .collect();
            stale.append(&mut replaced);
            let changed = st.topo != topo;
            st.topo = topo.clone();
            (stale, changed)
        };
        for pool in stale.drain(..) {
            pool.close().await;
        }

        if changed {
            info!(nodes = topo.nodes().len(), "cluster topology updated");
            trace::fire(&sh.trace.topo_changed, &TopoChanged { topo });
        }
        Ok(())
    }

    /// Kick off a background sync unless one is already in flight.
    fn schedule_sync(&self) {
        let sh = &self.shared;
        if sh.closed.load(Ordering::SeqCst) {
            return;
        }
        if sh
            .sync_inflight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let cluster = self.clone();
        tokio::spawn(async move {
            if let Err(err) = cluster.sync().await {
                warn!(%err, "background topology sync failed");
            }
            cluster.shared.sync_inflight.store(false, Ordering::SeqCst);
        });
    }

    /// The cached topology snapshot.
    pub async fn topology(&self) -> Topology {
        self.shared.state.read().await.topo.clone()
    }

    /// Addresses the router currently holds pools for, sorted.
    pub async fn pool_addrs(&self) -> Vec<String> {
        let st = self.shared.state.read().await;
        let mut addrs: Vec<String> = st.pools.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// Close every pool. Subsequent operations fail with [`Error::Closed`].
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pools: Vec<Pool> = {
            let mut st = self.shared.state.write().await;
            st.pools.drain().map(|(_, pool)| pool).collect()
        };
        for pool in pools {
            pool.close().await;
        }
    }
}
