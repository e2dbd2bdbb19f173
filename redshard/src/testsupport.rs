//! In-process stubs shared by the unit tests.

use crate::conn::Conn;
use crate::pool::Connector;
use crate::protocol;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use redshard_core::{Error, RespValue, Result};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Serve a tiny command set over one in-memory stream: ECHO and PING get
/// answers, BAD gets an error reply, SINK is swallowed without a reply.
pub(crate) async fn serve_echo(mut stream: DuplexStream) {
    let mut buf = BytesMut::new();
    'outer: loop {
        let cmd = loop {
            let mut cur = Cursor::new(&buf[..]);
            match protocol::decode(&mut cur) {
                Ok(Some(v)) => {
                    let consumed = cur.position() as usize;
                    buf.advance(consumed);
                    break v;
                }
                Ok(None) => {
                    if stream.read_buf(&mut buf).await.unwrap_or(0) == 0 {
                        return;
                    }
                }
                Err(_) => return,
            }
        };
        let parts = match cmd.as_array() {
            Ok(parts) => parts.to_vec(),
            Err(_) => return,
        };
        let name = parts[0]
            .as_str()
            .map(str::to_ascii_uppercase)
            .unwrap_or_default();
        let reply = match name.as_str() {
            "ECHO" => parts[1].clone(),
            "PING" => RespValue::SimpleString("PONG".into()),
            "BAD" => RespValue::Error("ERR bad command".into()),
            "SINK" => continue 'outer,
            other => RespValue::Error(format!("ERR unknown command '{other}'")),
        };
        let mut out = BytesMut::new();
        protocol::encode_value(&reply, &mut out);
        if stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

/// A [`Connector`] whose "server" is an in-process [`serve_echo`] task.
#[derive(Default)]
pub(crate) struct StubConnector {
    connects: AtomicUsize,
    fail: bool,
}

impl StubConnector {
    /// A connector whose every connect attempt fails.
    pub(crate) fn failing() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            fail: true,
        }
    }

    /// Number of successful connects so far.
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(&self, addr: &str) -> Result<Conn> {
        if self.fail {
            return Err(Error::Connection(format!("{addr}: connection refused")));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_echo(server));
        Ok(Conn::new(client))
    }
}
