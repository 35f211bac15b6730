//! RPC framing over a [`Connection`].
//!
//! A request is a 32-bit command code followed by the request arguments. A
//! reply is a [`StatusCode`] followed by the reply arguments, which are only
//! present when the status is success.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::connection::{Connection, RecvMode};
use crate::error::{Result, TransportError};
use crate::status::StatusCode;
use crate::wire::{WireDecode, WireEncode};

/// Outcome of an RPC as seen by the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcReply<T> {
    /// The peer reported success and sent reply arguments.
    Ok(T),
    /// The peer reported a failure; no reply arguments followed.
    Failed(StatusCode),
}

impl<T> RpcReply<T> {
    /// Converts into a `Result` keyed on the remote status.
    pub fn into_result(self) -> std::result::Result<T, StatusCode> {
        match self {
            RpcReply::Ok(value) => Ok(value),
            RpcReply::Failed(status) => Err(status),
        }
    }
}

/// What a handler did with a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The command was recognised and answered.
    Handled,
    /// The command is not served here.
    Unknown,
}

/// Server side of an RPC connection.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Reads the arguments of `command` from `conn` and writes the reply.
    async fn handle(&self, command: i32, conn: &mut Connection) -> Result<Dispatch>;
}

impl Connection {
    /// Sends a command code and its arguments.
    pub async fn rpc_request<A>(&mut self, command: i32, args: &A) -> Result<()>
    where
        A: WireEncode + ?Sized,
    {
        self.send(&command).await?;
        self.send(args).await
    }

    /// Receives a reply. On a non-zero status the reply arguments are not
    /// read, since the peer does not send them.
    pub async fn rpc_result<R: WireDecode>(&mut self, mode: RecvMode) -> Result<RpcReply<R>> {
        let status: StatusCode = self.recv_value(mode).await?;
        if !status.is_ok() {
            return Ok(RpcReply::Failed(status));
        }
        Ok(RpcReply::Ok(self.recv_value(mode).await?))
    }

    /// Request followed by result.
    pub async fn rpc<A, R>(&mut self, mode: RecvMode, command: i32, args: &A) -> Result<RpcReply<R>>
    where
        A: WireEncode + ?Sized,
        R: WireDecode,
    {
        self.rpc_request(command, args).await?;
        self.rpc_result(mode).await
    }

    /// Sends a reply and flushes it. `args` are only written on success.
    pub async fn rpc_reply<R>(&mut self, status: StatusCode, args: &R) -> Result<()>
    where
        R: WireEncode + ?Sized,
    {
        self.send(&status).await?;
        if status.is_ok() {
            self.send(args).await?;
        }
        self.flush().await
    }
}

/// Serves commands on `conn` until the peer closes it.
///
/// An unknown command is answered with [`StatusCode::InvalidArgument`]; its
/// arguments cannot be skipped, so the loop then stops with a protocol error.
pub async fn serve_rpc(conn: &mut Connection, handler: &dyn RpcHandler) -> Result<()> {
    loop {
        let command: i32 = match conn.recv(RecvMode::Buffered).await? {
            Some(command) => command,
            None => {
                debug!(peer = conn.peer(), "RPC peer closed the connection");
                return Ok(());
            }
        };
        debug!(peer = conn.peer(), command, "RPC request");
        match handler.handle(command, conn).await? {
            Dispatch::Handled => {}
            Dispatch::Unknown => {
                warn!(peer = conn.peer(), command, "unknown RPC command");
                conn.rpc_reply(StatusCode::InvalidArgument, &()).await?;
                return Err(TransportError::protocol(format!(
                    "unknown command {}",
                    command
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CMD_ADD: i32 = 1;
    const CMD_FAIL: i32 = 2;

    struct Adder;

    #[async_trait]
    impl RpcHandler for Adder {
        async fn handle(&self, command: i32, conn: &mut Connection) -> Result<Dispatch> {
            match command {
                CMD_ADD => {
                    let (a, b): (i32, i32) = conn.recv_value(RecvMode::Buffered).await?;
                    conn.rpc_reply(StatusCode::Ok, &(a + b)).await?;
                    Ok(Dispatch::Handled)
                }
                CMD_FAIL => {
                    let _: i32 = conn.recv_value(RecvMode::Buffered).await?;
                    conn.rpc_reply(StatusCode::NoSpace, &0i32).await?;
                    Ok(Dispatch::Handled)
                }
                _ => Ok(Dispatch::Unknown),
            }
        }
    }

    fn pair() -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(1 << 16);
        (Connection::from_stream(a, "client"), Connection::from_stream(b, "server"))
    }

    #[tokio::test]
    async fn test_rpc_roundtrip() {
        let (mut client, mut server) = pair();
        let task = tokio::spawn(async move { serve_rpc(&mut server, &Adder).await });

        let reply: RpcReply<i32> =
            client.rpc(RecvMode::Buffered, CMD_ADD, &(2i32, 40i32)).await.unwrap();
        assert_eq!(reply, RpcReply::Ok(42));

        let reply: RpcReply<i32> = client.rpc(RecvMode::Buffered, CMD_FAIL, &7i32).await.unwrap();
        assert_eq!(reply.into_result(), Err(StatusCode::NoSpace));

        // the failed reply carried no arguments, so the stream is still aligned
        let reply: RpcReply<i32> =
            client.rpc(RecvMode::Buffered, CMD_ADD, &(1i32, 1i32)).await.unwrap();
        assert_eq!(reply, RpcReply::Ok(2));

        client.flush_and_close().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (mut client, mut server) = pair();
        let task = tokio::spawn(async move { serve_rpc(&mut server, &Adder).await });
        let reply: RpcReply<()> = client.rpc(RecvMode::Buffered, 99, &()).await.unwrap();
        assert_eq!(reply, RpcReply::Failed(StatusCode::InvalidArgument));
        assert!(matches!(task.await.unwrap(), Err(TransportError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_eof_before_status_is_unexpected() {
        let (mut client, server) = pair();
        client.rpc_request(CMD_ADD, &(1i32, 2i32)).await.unwrap();
        drop(server);
        let err = client.rpc_result::<i32>(RecvMode::Buffered).await.unwrap_err();
        assert!(matches!(err, TransportError::UnexpectedEof { .. } | TransportError::IoError(_)));
    }
}
