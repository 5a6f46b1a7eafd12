use crate::handlers::handle_connection;
use crate::types::GenericBoxedStream;
use async_stream::stream;
use futures_util::{Stream, StreamExt};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::{self, JoinHandle};
use tracing::{error, info, trace};

/// Accepted connections, forever. Accept errors are logged and skipped.
pub fn tcp_accept_stream(listener: TcpListener) -> impl Stream<Item = TcpStream> {
    stream! {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    trace!("Accepted connection from {}", addr);
                    yield stream;
                }
                Err(e) => {
                    error!("TCP accept error: {}", e);
                }
            }
        }
    }
}

/// Hand every item of `stream` to `handler` until the stream ends or
/// `shutdown` is notified.
pub async fn serve_stream<T>(
    mut stream: GenericBoxedStream<T>,
    shutdown: Arc<Notify>,
    handler: impl Fn(T) -> JoinHandle<()> + Send + Sync + 'static,
) {
    let notified = shutdown.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(item) => {
                    handler(item);
                }
                None => {
                    info!("Stream ended");
                    break;
                }
            },
            _ = notified.as_mut() => {
                info!("Shutdown requested");
                break;
            }
        }
    }
}

/// Serve the status front-end on `addr` over the record at `status_path`.
pub async fn run_status_server(
    addr: String,
    status_path: PathBuf,
    shutdown: Arc<Notify>,
) -> io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("Status front-end listening on http://{}", listener.local_addr()?);

    let status_path = Arc::new(status_path);
    let connections: GenericBoxedStream<TcpStream> = Box::pin(tcp_accept_stream(listener));

    serve_stream(connections, shutdown, move |stream| {
        let status_path = status_path.clone();
        task::spawn(async move {
            handle_connection(stream, status_path).await;
        })
    })
    .await;

    Ok(())
}
