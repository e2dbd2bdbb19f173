//! An in-process stub cluster speaking just enough RESP for the
//! integration tests: keyed GET/SET with MOVED/ASK redirection, CLUSTER
//! SLOTS, ASKING, EVAL/EVALSHA and a few plumbing commands.
//!
//! Slot ownership lives in one shared table; each node routes against it
//! the way a real cluster member routes against its own view, so moving a
//! slot in the table immediately makes the old owner answer MOVED.

#![allow(dead_code)]

use bytes::{Buf, BytesMut};
use redshard::{calculate_slot, protocol, RespValue};
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const NUM_SLOTS: u16 = 16384;

struct State {
    addrs: Vec<String>,
    /// slot -> owning node index
    owner: Vec<usize>,
    /// per-node key/value store
    data: Vec<HashMap<Vec<u8>, Vec<u8>>>,
    /// slot -> destination node index, while a migration is underway
    migrating: HashMap<u16, usize>,
    /// keys already handed to the destination of their slot's migration
    migrated: HashSet<Vec<u8>>,
    /// SHA1s of scripts loaded via EVAL
    scripts: HashSet<String>,
}

impl State {
    fn addr(&self, idx: usize) -> String {
        self.addrs[idx].clone()
    }
}

#[derive(Clone)]
pub struct StubCluster {
    state: Arc<Mutex<State>>,
}

impl StubCluster {
    /// Start `n` nodes on ephemeral localhost ports, slots split evenly.
    pub async fn start(n: usize) -> Self {
        assert!(n > 0);
        let mut addrs = Vec::new();
        let mut listeners = Vec::new();
        for _ in 0..n {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            addrs.push(format!("127.0.0.1:{}", listener.local_addr().unwrap().port()));
            listeners.push(listener);
        }
        let owner = (0..NUM_SLOTS as usize)
            .map(|slot| slot * n / NUM_SLOTS as usize)
            .collect();
        let state = Arc::new(Mutex::new(State {
            addrs,
            owner,
            data: vec![HashMap::new(); n],
            migrating: HashMap::new(),
            migrated: HashSet::new(),
            scripts: HashSet::new(),
        }));
        for (idx, listener) in listeners.into_iter().enumerate() {
            let state = state.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((sock, _)) = listener.accept().await else {
                        return;
                    };
                    tokio::spawn(serve_conn(sock, idx, state.clone()));
                }
            });
        }
        Self { state }
    }

    pub fn addrs(&self) -> Vec<String> {
        self.state.lock().unwrap().addrs.clone()
    }

    pub fn addr_of(&self, idx: usize) -> String {
        self.state.lock().unwrap().addr(idx)
    }

    pub fn node_for_slot(&self, slot: u16) -> usize {
        self.state.lock().unwrap().owner[slot as usize]
    }

    pub fn addr_for_slot(&self, slot: u16) -> String {
        let st = self.state.lock().unwrap();
        st.addr(st.owner[slot as usize])
    }

    /// Addresses currently serving at least one slot, sorted. This is what
    /// CLUSTER SLOTS advertises, and therefore what a synced client should
    /// hold pools for.
    pub fn advertised_addrs(&self) -> Vec<String> {
        let st = self.state.lock().unwrap();
        let serving: HashSet<usize> = st.owner.iter().copied().collect();
        let mut addrs: Vec<String> = serving.iter().map(|&idx| st.addr(idx)).collect();
        addrs.sort();
        addrs
    }

    /// Reassign `lo..=hi` to `dst` instantly, moving stored keys with it.
    /// The next CLUSTER SLOTS reply reflects the new ownership; clients
    /// with stale caches get MOVED from the old owners.
    pub fn move_slot_range(&self, lo: u16, hi: u16, dst: usize) {
        let mut st = self.state.lock().unwrap();
        for slot in lo..=hi {
            let src = st.owner[slot as usize];
            if src == dst {
                continue;
            }
            let keys: Vec<Vec<u8>> = st.data[src]
                .keys()
                .filter(|k| calculate_slot(k) == slot)
                .cloned()
                .collect();
            for key in keys {
                if let Some(value) = st.data[src].remove(&key) {
                    st.data[dst].insert(key, value);
                }
            }
            st.owner[slot as usize] = dst;
        }
    }

    /// Begin migrating one slot towards `dst`. Ownership does not change
    /// yet; keys marked migrated draw ASK redirects from the owner.
    pub fn migrate_init(&self, slot: u16, dst: usize) {
        self.state.lock().unwrap().migrating.insert(slot, dst);
    }

    /// Hand one key of a migrating slot to the destination node.
    pub fn migrate_key(&self, key: &[u8]) {
        let mut st = self.state.lock().unwrap();
        let slot = calculate_slot(key);
        let dst = *st.migrating.get(&slot).expect("slot not migrating");
        let src = st.owner[slot as usize];
        if let Some(value) = st.data[src].remove(key) {
            st.data[dst].insert(key.to_vec(), value);
        }
        st.migrated.insert(key.to_vec());
    }

    /// Finish a migration: the destination becomes the owner.
    pub fn migrate_done(&self, slot: u16) {
        let mut st = self.state.lock().unwrap();
        if let Some(dst) = st.migrating.remove(&slot) {
            let src = st.owner[slot as usize];
            let keys: Vec<Vec<u8>> = st.data[src]
                .keys()
                .filter(|k| calculate_slot(k) == slot)
                .cloned()
                .collect();
            for key in keys {
                if let Some(value) = st.data[src].remove(&key) {
                    st.data[dst].insert(key, value);
                }
            }
            st.owner[slot as usize] = dst;
            st.migrated.retain(|k| calculate_slot(k) != slot);
        }
    }
}

async fn serve_conn(mut sock: TcpStream, idx: usize, state: Arc<Mutex<State>>) {
    let mut buf = BytesMut::new();
    let mut asking = false;
    loop {
        let cmd = loop {
            let mut cur = Cursor::new(&buf[..]);
            match protocol::decode(&mut cur) {
                Ok(Some(v)) => {
                    let consumed = cur.position() as usize;
                    buf.advance(consumed);
                    break v;
                }
                Ok(None) => {
                    if sock.read_buf(&mut buf).await.unwrap_or(0) == 0 {
                        return;
                    }
                }
                Err(_) => return,
            }
        };
        let Ok(parts) = cmd.as_array().map(<[RespValue]>::to_vec) else {
            return;
        };
        let name = parts[0]
            .as_str()
            .map(str::to_ascii_uppercase)
            .unwrap_or_default();

        let reply = if name == "ASKING" {
            asking = true;
            RespValue::SimpleString("OK".into())
        } else {
            let was_asking = std::mem::take(&mut asking);
            handle(&state, idx, &name, &parts, was_asking)
        };

        let mut out = BytesMut::new();
        protocol::encode_value(&reply, &mut out);
        if sock.write_all(&out).await.is_err() {
            return;
        }
    }
}

fn handle(
    state: &Arc<Mutex<State>>,
    idx: usize,
    name: &str,
    parts: &[RespValue],
    asking: bool,
) -> RespValue {
    let mut st = state.lock().unwrap();
    match name {
        "PING" => RespValue::SimpleString("PONG".into()),
        "ECHO" => parts[1].clone(),
        "CLUSTER" => {
            let sub = parts
                .get(1)
                .and_then(|v| v.as_str().ok())
                .unwrap_or_default()
                .to_ascii_uppercase();
            if sub == "SLOTS" {
                slots_reply(&st)
            } else {
                RespValue::Error(format!("ERR unknown CLUSTER subcommand {sub}"))
            }
        }
        "GET" | "SET" => {
            let key = parts[1].as_bytes().unwrap().to_vec();
            let serving = match route(&st, idx, &key, asking) {
                Ok(serving) => serving,
                Err(redirect) => return redirect,
            };
            if name == "GET" {
                match st.data[serving].get(&key) {
                    Some(value) => RespValue::BulkString(value.clone().into()),
                    None => RespValue::Null,
                }
            } else {
                let value = parts[2].as_bytes().unwrap().to_vec();
                st.data[serving].insert(key, value);
                RespValue::SimpleString("OK".into())
            }
        }
        "EVAL" | "EVALSHA" => {
            // Routed by the first declared key, like any keyed command.
            let key = parts[3].as_bytes().unwrap().to_vec();
            if let Err(redirect) = route(&st, idx, &key, asking) {
                return redirect;
            }
            if name == "EVALSHA" {
                let sha = parts[1].as_str().unwrap().to_ascii_lowercase();
                if !st.scripts.contains(&sha) {
                    return RespValue::Error(
                        "NOSCRIPT No matching script. Please use EVAL.".into(),
                    );
                }
            } else {
                let mut hasher = Sha1::new();
                hasher.update(parts[1].as_bytes().unwrap());
                let sha: String = hasher
                    .finalize()
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect();
                st.scripts.insert(sha);
            }
            RespValue::Integer(1)
        }
        other => RespValue::Error(format!("ERR unknown command '{other}'")),
    }
}

/// Decide which node store serves this key from `idx`'s point of view, or
/// produce the MOVED/ASK redirect a real node would send.
fn route(st: &State, idx: usize, key: &[u8], asking: bool) -> Result<usize, RespValue> {
    let slot = calculate_slot(key);
    let owner = st.owner[slot as usize];
    if owner == idx {
        if let Some(&dst) = st.migrating.get(&slot) {
            if st.migrated.contains(key) {
                return Err(RespValue::Error(format!(
                    "ASK {slot} {}",
                    st.addr(dst)
                )));
            }
        }
        return Ok(idx);
    }
    if st.migrating.get(&slot) == Some(&idx) && asking {
        return Ok(idx);
    }
    Err(RespValue::Error(format!("MOVED {slot} {}", st.addr(owner))))
}

fn slots_reply(st: &State) -> RespValue {
    let mut entries = Vec::new();
    let mut lo = 0usize;
    while lo < NUM_SLOTS as usize {
        let owner = st.owner[lo];
        let mut hi = lo;
        while hi + 1 < NUM_SLOTS as usize && st.owner[hi + 1] == owner {
            hi += 1;
        }
        let (host, port) = st.addrs[owner].rsplit_once(':').unwrap();
        entries.push(RespValue::Array(vec![
            RespValue::Integer(lo as i64),
            RespValue::Integer(hi as i64),
            RespValue::Array(vec![
                RespValue::from(host),
                RespValue::Integer(port.parse().unwrap()),
                RespValue::from(format!("node-{owner}")),
            ]),
        ]));
        lo = hi + 1;
    }
    RespValue::Array(entries)
}
