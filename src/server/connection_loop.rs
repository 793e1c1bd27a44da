// src/server/connection_loop.rs

//! The accept loop and the per-connection frame loop: length-delimited
//! bincode frames in, handler dispatch, frames out.

use super::initialization::ServerContext;
use crate::core::protocol::{self, PoolRequest};
use crate::core::svc::PoolModule;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

pub async fn run(context: ServerContext) {
    let ServerContext {
        module,
        listener,
        shutdown_tx,
        ..
    } = context;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let module = Arc::clone(&module);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(module, stream).await {
                                warn!(%peer, error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(());
    module.fini().await;
    info!("all pool services stopped");
}

async fn serve_connection(
    module: Arc<PoolModule>,
    stream: TcpStream,
) -> Result<(), std::io::Error> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let request: PoolRequest = match protocol::decode_frame(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                break;
            }
        };

        let reply = module.handle(request).await;
        let body = match protocol::encode_frame(&reply) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "failed to encode reply");
                break;
            }
        };
        framed.send(body).await?;
    }
    Ok(())
}
