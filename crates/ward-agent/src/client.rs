use std::path::Path;

use anyhow::Context;
use tokio::net::UnixStream;
use tracing::debug;
use ward_protocol::{codec, Hello, Request, Response};

/// Send one control request to the agent listening on `socket`.
pub async fn send_request(socket: &Path, request: &Request) -> anyhow::Result<Response> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("failed to connect to agent at {}", socket.display()))?;
    let mut stream = codec::framed(stream);

    let ours = Hello::ours();
    codec::send(&mut stream, &ours).await?;
    let theirs: Hello = codec::recv(&mut stream).await?;
    if theirs.version != ours.version {
        debug!(agent = %theirs.version, client = %ours.version, "agent version differs");
    }

    codec::send(&mut stream, request).await?;
    let response: Response = codec::recv(&mut stream)
        .await
        .context("agent closed the connection without a response")?;
    Ok(response)
}
