//! TCP listener and per connection request loop.

use std::net::SocketAddr;

use log::{error, info};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::codec::{read_frame, write_frame};
use crate::config::ServerConfig;
use crate::error::RpcError;
use crate::protocol::{RpcRequest, RpcResponse};
use crate::session::Session;

/// Answer requests until the client closes its side
pub async fn serve<R, W>(mut reader: R, mut writer: W, mut session: Session) -> Result<u64, RpcError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut handled = 0;
    while let Some(request) = read_frame::<_, RpcRequest>(&mut reader).await? {
        let response: RpcResponse = session.handle(request);
        write_frame(&mut writer, &response).await?;
        handled += 1;
    }
    Ok(handled)
}

/// Accept clients forever. Must run inside a `LocalSet`; sessions are not
/// `Send`.
pub async fn run(config: ServerConfig) -> Result<(), RpcError> {
    let addr = SocketAddr::new(config.bind, config.port);
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("client {peer} connected");
        let session = Session::new(&config);
        tokio::task::spawn_local(async move {
            let (reader, writer) = stream.into_split();
            match serve(reader, writer, session).await {
                Ok(handled) => info!("client {peer} left after {handled} requests"),
                Err(err) => error!("client {peer}: {err}"),
            }
        });
    }
}
