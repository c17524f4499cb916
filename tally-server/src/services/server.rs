use std::io;
use std::net::{SocketAddr, TcpListener};

use tally_system::{Receiver, Service, ShutdownHandle};

use crate::endpoints;
use crate::service::ServiceState;
use crate::statsd::ServerCounters;

/// Indicates the type of failure of the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding failed.
    #[error("bind to interface failed")]
    BindFailed(#[from] io::Error),
}

/// HTTP server service.
///
/// Hosts the HTTP API of the agent. The server stops accepting connections when a shutdown is
/// triggered and finishes all pending requests before it stops.
#[derive(Debug)]
pub struct HttpServer {
    listener: TcpListener,
    state: ServiceState,
    shutdown: ShutdownHandle,
}

impl HttpServer {
    /// Binds the listener. Use port `0` to bind to an arbitrary free port.
    pub fn new(
        addr: SocketAddr,
        state: ServiceState,
        shutdown: ShutdownHandle,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        Ok(Self {
            listener,
            state,
            shutdown,
        })
    }
}

impl Service for HttpServer {
    type Interface = ();

    async fn run(self, _rx: Receiver<Self::Interface>) {
        let Self {
            listener,
            state,
            mut shutdown,
        } = self;

        let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(error) => {
                tally_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to register http listener"
                );
                return;
            }
        };

        if let Ok(addr) = listener.local_addr() {
            tally_log::info!("spawning http server");
            tally_log::info!("  listening on http://{addr}/");
        }
        tally_statsd::metric!(counter(ServerCounters::ServerStarting) += 1);

        let app = endpoints::routes().with_state(state);
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.notified().await;
                tally_log::info!("shutting down http server");
            })
            .await;

        if let Err(error) = result {
            tally_log::error!(
                error = &error as &dyn std::error::Error,
                "http server failed"
            );
        }
    }
}

#[cfg(test)]
impl HttpServer {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}
