//! A reusable, length-delimited, JSON-framed IPC transport for the
//! local control surface (§4.12), the same `Decoder`/`Encoder` shape
//! this codebase's GUI/IPC-service pair uses for its own
//! controller<->GUI channel, adapted here to a single local-only
//! request/response service instead of a bidirectional event stream.
//!
//! A Unix domain socket carries the frames; this node targets Linux
//! only; a Windows named-pipe variant would live behind the same
//! `platform` module seam this codebase uses elsewhere, but is not
//! needed for this system's supported platform set.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use bytes::BytesMut;
use tokio::net::{UnixListener, UnixStream};
use tokio::io::{ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

pub type SocketRead<M> = FramedRead<ReadHalf<UnixStream>, Decoder<M>>;
pub type SocketWrite<M> = FramedWrite<WriteHalf<UnixStream>, Encoder<M>>;

pub struct Decoder<D> {
    inner: LengthDelimitedCodec,
    _decode_type: std::marker::PhantomData<D>,
}

pub struct Encoder<E> {
    inner: LengthDelimitedCodec,
    _encode_type: std::marker::PhantomData<E>,
}

impl<D> Default for Decoder<D> {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::new(),
            _decode_type: std::marker::PhantomData,
        }
    }
}

impl<E> Default for Encoder<E> {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::new(),
            _encode_type: std::marker::PhantomData,
        }
    }
}

impl<D: serde::de::DeserializeOwned> tokio_util::codec::Decoder for Decoder<D> {
    type Error = anyhow::Error;
    type Item = D;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<D>, Self::Error> {
        let Some(msg) = self.inner.decode(buf)? else {
            return Ok(None);
        };
        let msg = serde_json::from_slice(&msg)?;
        Ok(Some(msg))
    }
}

impl<E: serde::Serialize> tokio_util::codec::Encoder<&E> for Encoder<E> {
    type Error = anyhow::Error;

    fn encode(&mut self, msg: &E, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let text = serde_json::to_string(msg)?;
        self.inner.encode(text.into(), buf)?;
        Ok(())
    }
}

/// Listens on a Unix domain socket at `path`, recreating it if a
/// previous run left a stale one behind. Permissions are restricted
/// to the owning user/group, matching the IPC service socket this
/// codebase's headless client binds for the same local-control
/// purpose.
pub struct IpcServer {
    listener: UnixListener,
}

impl IpcServer {
    pub async fn bind(path: &Path) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::remove_file(path).await.ok();
        let listener = UnixListener::bind(path)?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660)).await?;
        Ok(Self { listener })
    }

    pub async fn accept_split<R, W>(&self) -> std::io::Result<(SocketRead<R>, SocketWrite<W>)>
    where
        R: serde::de::DeserializeOwned,
        W: serde::Serialize,
    {
        let (stream, _addr) = self.listener.accept().await?;
        let (rx, tx) = tokio::io::split(stream);
        Ok((FramedRead::new(rx, Decoder::default()), FramedWrite::new(tx, Encoder::default())))
    }
}

pub async fn connect<R, W>(path: &Path) -> std::io::Result<(SocketRead<R>, SocketWrite<W>)>
where
    R: serde::de::DeserializeOwned,
    W: serde::Serialize,
{
    let stream = UnixStream::connect(path).await?;
    let (rx, tx) = tokio::io::split(stream);
    Ok((FramedRead::new(rx, Decoder::default()), FramedWrite::new(tx, Encoder::default())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    enum ClientMsg {
        Ping,
    }

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    enum ServerMsg {
        Pong,
    }

    #[tokio::test]
    async fn request_then_reply_round_trips() {
        let dir = std::env::temp_dir().join(format!("overlay-node-ipc-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("control.sock");

        let server = IpcServer::bind(&path).await.unwrap();

        let server_task = tokio::spawn(async move {
            let (mut rx, mut tx) = server.accept_split::<ClientMsg, ServerMsg>().await.unwrap();
            let msg = rx.next().await.unwrap().unwrap();
            assert_eq!(msg, ClientMsg::Ping);
            tx.send(&ServerMsg::Pong).await.unwrap();
        });

        let (mut rx, mut tx) = connect::<ServerMsg, ClientMsg>(&path).await.unwrap();
        tx.send(&ClientMsg::Ping).await.unwrap();
        let reply = rx.next().await.unwrap().unwrap();
        assert_eq!(reply, ServerMsg::Pong);

        server_task.await.unwrap();
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
