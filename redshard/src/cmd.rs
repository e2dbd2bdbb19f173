//! Command composition.
//!
//! [`Cmd`] is the minimal building block the router understands: an ordered
//! list of wire parts plus the subset of parts that are keys, which is what
//! slot routing needs. [`Pipeline`] batches several commands into one write
//! with FIFO-correlated replies.

use crate::protocol;
use bytes::Bytes;

/// A single command.
///
/// ```
/// use redshard::Cmd;
///
/// let cmd = Cmd::new("SET").key("foo").arg("bar");
/// assert_eq!(cmd.keys().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Cmd {
    parts: Vec<Bytes>,
    keys: Vec<Bytes>,
}

impl Cmd {
    /// Start a command with the given name.
    pub fn new(name: impl Into<Vec<u8>>) -> Self {
        Self {
            parts: vec![Bytes::from(name.into())],
            keys: Vec::new(),
        }
    }

    /// Append an argument that is a key. Keys participate in slot routing;
    /// a command may carry several as long as they hash to one slot.
    #[must_use]
    pub fn key(mut self, key: impl Into<Vec<u8>>) -> Self {
        let key = Bytes::from(key.into());
        self.keys.push(key.clone());
        self.parts.push(key);
        self
    }

    /// Append a non-key argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<Vec<u8>>) -> Self {
        self.parts.push(Bytes::from(arg.into()));
        self
    }

    /// Append several non-key arguments.
    #[must_use]
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Vec<u8>>,
    {
        self.parts
            .extend(args.into_iter().map(|a| Bytes::from(a.into())));
        self
    }

    /// The command name.
    #[must_use]
    pub fn name(&self) -> &[u8] {
        &self.parts[0]
    }

    /// The key arguments, in order of appearance.
    #[must_use]
    pub fn keys(&self) -> &[Bytes] {
        &self.keys
    }

    /// Encode the command into one wire frame.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        protocol::encode_command(&self.parts)
    }
}

/// An ordered batch of commands written in a single frame.
///
/// Replies come back in submission order; error replies are surfaced as
/// in-band [`RespValue::Error`](redshard_core::RespValue::Error) values so
/// one failing command does not mask the others' results.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    cmds: Vec<Cmd>,
}

impl Pipeline {
    /// An empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command.
    #[must_use]
    pub fn cmd(mut self, cmd: Cmd) -> Self {
        self.cmds.push(cmd);
        self
    }

    /// Number of commands in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    /// Encode every command back-to-back into one frame.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::new();
        for cmd in &self.cmds {
            buf.extend_from_slice(&cmd.encode());
        }
        Bytes::from(buf)
    }
}
