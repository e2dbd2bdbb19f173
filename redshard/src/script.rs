//! Server-side Lua scripts.
//!
//! An [`EvalScript`] is routed like any keyed command: by its first key,
//! with all keys required to share a slot. Execution tries `EVALSHA` first
//! and falls back to `EVAL` when the target node does not know the script
//! yet, so the script body crosses the wire once per node.

use crate::cluster::Cluster;
use crate::cmd::Cmd;
use redshard_core::{Error, RespValue, Result};
use sha1::{Digest, Sha1};

/// A Lua script plus its precomputed SHA1.
#[derive(Debug, Clone)]
pub struct EvalScript {
    source: String,
    sha: String,
}

impl EvalScript {
    /// Prepare a script for execution.
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let mut hasher = Sha1::new();
        hasher.update(source.as_bytes());
        let sha = hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        Self { source, sha }
    }

    /// Hex SHA1 of the script body, as used by `EVALSHA`.
    #[must_use]
    pub fn sha(&self) -> &str {
        &self.sha
    }

    /// The script body.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Build the `EVALSHA` form of this invocation.
    fn sha_cmd(&self, keys: &[&str], args: &[&str]) -> Cmd {
        Self::fill(Cmd::new("EVALSHA").arg(self.sha.clone()), keys, args)
    }

    /// Build the `EVAL` form of this invocation.
    fn eval_cmd(&self, keys: &[&str], args: &[&str]) -> Cmd {
        Self::fill(Cmd::new("EVAL").arg(self.source.clone()), keys, args)
    }

    fn fill(cmd: Cmd, keys: &[&str], args: &[&str]) -> Cmd {
        let mut cmd = cmd.arg(keys.len().to_string());
        for key in keys {
            cmd = cmd.key(*key);
        }
        cmd.args(args.iter().copied())
    }

    /// Execute on the cluster, routed by the script's keys.
    ///
    /// `EVALSHA` goes first; a `NOSCRIPT` reply re-runs with the full
    /// source, which also caches the script on that node.
    pub async fn eval(
        &self,
        cluster: &Cluster,
        keys: &[&str],
        args: &[&str],
    ) -> Result<RespValue> {
        match cluster.run(&self.sha_cmd(keys, args)).await {
            Err(Error::Server(msg)) if msg.starts_with("NOSCRIPT") => {
                cluster.run(&self.eval_cmd(keys, args)).await
            }
            other => other,
        }
    }
}
