//! The signaling server: a bound listener, the HTTP front end and the switch

use crate::auth::Credentials;
use crate::config::ServerConfig;
use crate::error::SignalingError;
use crate::handler::{AppState, router};
use crate::relay::IceServerProvider;
use crate::switch::Switch;
use crate::tls::{TlsListener, load_acceptor};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// A signaling server bound to its listen address, ready to serve
pub struct SignalingServer {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    switch: Switch,
    state: AppState,
    ws_path: String,
}

impl SignalingServer {
    /// Bind the listener described by `config`
    ///
    /// Port 0 picks a free port; see [`SignalingServer::local_addr`]. With
    /// `tls` set the certificate and key are loaded here, so a bad identity
    /// fails before anything listens.
    pub async fn bind<C, R>(config: &ServerConfig, credentials: C, relays: R) -> Result<Self, SignalingError>
    where
        C: Credentials + 'static,
        R: IceServerProvider + 'static,
    {
        let addr = config.listen_addr()?;
        let tls = match config.tls_files()? {
            Some((crt, key)) => Some(load_acceptor(crt, key)?),
            None => None,
        };
        let listener = TcpListener::bind(addr).await?;
        let (switch, handle) = Switch::new();

        Ok(Self {
            listener,
            tls,
            switch,
            state: AppState {
                switch: handle,
                credentials: Arc::new(credentials),
                relays: Arc::new(relays),
                mailbox_capacity: config.signaling.mailbox_capacity,
            },
            ws_path: config.signaling.ws_path.clone(),
        })
    }

    /// The address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, SignalingError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve connections until `shutdown` resolves
    ///
    /// On shutdown every client is unregistered, which closes its
    /// connection, and the switch stops.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), SignalingError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let SignalingServer {
            listener,
            tls,
            switch,
            state,
            ws_path,
        } = self;

        let handle = state.switch.clone();
        let routing = tokio::spawn(switch.run());

        let scheme = if tls.is_some() { "wss" } else { "ws" };
        info!(addr = %listener.local_addr()?, path = %ws_path, %scheme, "signaling server listening");
        let app = router(state, &ws_path);
        let shutdown = async move {
            shutdown.await;
            info!("shutting down");
            handle.shutdown().await;
        };
        let result = match tls {
            Some(acceptor) => {
                axum::serve(TlsListener::new(listener, acceptor), app)
                    .with_graceful_shutdown(shutdown)
                    .await
            }
            None => axum::serve(listener, app).with_graceful_shutdown(shutdown).await,
        };

        let _ = routing.await;
        info!("signaling server stopped");
        Ok(result?)
    }
}
