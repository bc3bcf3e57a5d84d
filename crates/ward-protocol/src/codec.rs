//! Length-delimited JSON framing over any async byte stream.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use ward_core::config::MAX_FRAME_BYTES;

use crate::error::{ProtocolError, Result};

pub type ControlStream<S> = Framed<S, LengthDelimitedCodec>;

/// Wrap `io` with the control-protocol framing.
pub fn framed<S>(io: S) -> ControlStream<S>
where
    S: AsyncRead + AsyncWrite,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec();
    Framed::new(io, codec)
}

/// Serialize `value` and write it as one frame.
pub async fn send<S, T>(stream: &mut ControlStream<S>, value: &T) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    stream.send(Bytes::from(body)).await?;
    Ok(())
}

/// Read one frame and deserialize it.
pub async fn recv<S, T>(stream: &mut ControlStream<S>) -> Result<T>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    match stream.next().await {
        Some(Ok(frame)) => Ok(serde_json::from_slice(&frame)?),
        Some(Err(e)) => Err(ProtocolError::Io(e)),
        None => Err(ProtocolError::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{Request, Response};
    use crate::handshake::Hello;

    #[tokio::test]
    async fn exchange_over_duplex() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let mut client = framed(client_io);
        let mut server = framed(server_io);

        send(&mut client, &Hello::new("9.9.9")).await.unwrap();
        let hello: Hello = recv(&mut server).await.unwrap();
        assert_eq!(hello.version, "9.9.9");

        send(&mut client, &Request::configure(b"{}".to_vec()))
            .await
            .unwrap();
        let req: Request = recv(&mut server).await.unwrap();
        assert_eq!(req.kind, "configure");
        assert_eq!(req.payload, b"{}");

        send(&mut server, &Response::err("boom")).await.unwrap();
        let res: Response = recv(&mut client).await.unwrap();
        assert_eq!(res.exit_code, 1);
        assert_eq!(res.err, "boom");
    }

    #[tokio::test]
    async fn recv_after_peer_drop_is_closed() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let mut server = framed(server_io);
        drop(client_io);

        let err = recv::<_, Hello>(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Closed));
    }

    #[tokio::test]
    async fn garbage_frame_is_malformed() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let mut client = framed(client_io);
        let mut server = framed(server_io);

        client.send(Bytes::from_static(b"not json")).await.unwrap();
        let err = recv::<_, Request>(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }
}
