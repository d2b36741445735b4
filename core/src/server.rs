/*
 * server.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portalettere, a self-hostable mail server.
 *
 * Portalettere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portalettere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portalettere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Server frontend: owns the shared components for the process lifetime,
//! spawns one session task per accepted connection, bounds concurrency with
//! a semaphore and drives graceful shutdown.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::auth::UserStore;
use crate::config::ServerConfig;
use crate::dnsbl::DnsblChecker;
use crate::error::Error;
use crate::greylist::Greylist;
use crate::limiter::RateLimiter;
use crate::net::build_tls_acceptor;
use crate::protocol::smtp::session::Session;
use crate::protocol::smtp::Reply;
use crate::queue::DeliveryQueue;
use crate::store::MessageStore;

/// Everything a session needs, injected once at startup. Sessions hold
/// shared, non-owning references through one `Arc<Core>`.
pub struct Core {
    pub config: ServerConfig,
    pub users: Arc<UserStore>,
    pub limiter: RateLimiter,
    pub greylist: Option<Greylist>,
    pub dnsbl: Option<DnsblChecker>,
    pub store: Arc<MessageStore>,
    pub queue: DeliveryQueue,
    pub tls_acceptor: Option<TlsAcceptor>,
}

impl Core {
    /// Open all stores at their configured paths. Any storage failure here
    /// aborts startup; the server must not accept mail it cannot keep.
    pub fn open(config: ServerConfig) -> Result<Self, Error> {
        let users = Arc::new(UserStore::open(&config.db_path)?);
        let store = Arc::new(MessageStore::open(&config.db_path)?);
        let queue = DeliveryQueue::open(
            &config.queue_path,
            config.queue_base_delay,
            config.queue_max_backoff,
            config.queue_max_attempts,
            &config.hostname,
        )?
        .with_bounce_store(store.clone());
        let greylist = if config.enable_greylist {
            Some(Greylist::open(
                &config.db_path,
                config.greylist_initial_delay,
                config.greylist_retry_window,
                config.greylist_auto_whitelist_after,
            )?)
        } else {
            None
        };
        Self::assemble(config, users, store, queue, greylist)
    }

    /// Fully in-memory variant for tests and ephemeral instances.
    pub fn open_in_memory(config: ServerConfig) -> Result<Self, Error> {
        let users = Arc::new(UserStore::open_in_memory()?);
        let store = Arc::new(MessageStore::open_in_memory()?);
        let queue = DeliveryQueue::open_in_memory(
            config.queue_base_delay,
            config.queue_max_backoff,
            config.queue_max_attempts,
            &config.hostname,
        )?
        .with_bounce_store(store.clone());
        let greylist = if config.enable_greylist {
            Some(Greylist::open_in_memory(
                config.greylist_initial_delay,
                config.greylist_retry_window,
                config.greylist_auto_whitelist_after,
            )?)
        } else {
            None
        };
        Self::assemble(config, users, store, queue, greylist)
    }

    fn assemble(
        config: ServerConfig,
        users: Arc<UserStore>,
        store: Arc<MessageStore>,
        queue: DeliveryQueue,
        greylist: Option<Greylist>,
    ) -> Result<Self, Error> {
        let limiter = RateLimiter::new(
            config.rate_limit_per_ip,
            config.rate_limit_per_user,
            Duration::from_secs(config.rate_window_seconds),
        );
        let dnsbl = if config.enable_dnsbl && !config.dnsbl_zones.is_empty() {
            Some(DnsblChecker::new(config.dnsbl_zones.clone()))
        } else {
            None
        };
        let tls_acceptor = if config.enable_tls {
            Some(build_tls_acceptor(
                &config.tls_cert_path,
                &config.tls_key_path,
            )?)
        } else {
            None
        };
        Ok(Self {
            config,
            users,
            limiter,
            greylist,
            dnsbl,
            store,
            queue,
            tls_acceptor,
        })
    }
}

/// Shared trigger for graceful shutdown.
#[derive(Clone)]
pub struct ServerHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

pub struct Server {
    core: Arc<Core>,
    semaphore: Arc<Semaphore>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    pub fn new(core: Arc<Core>) -> Self {
        let (tx, rx) = watch::channel(false);
        let permits = core.config.max_connections;
        Self {
            core,
            semaphore: Arc::new(Semaphore::new(permits)),
            shutdown_tx: Arc::new(tx),
            shutdown_rx: rx,
        }
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Serve a single already-accepted connection. Exposed for embedders
    /// that own their own accept loop.
    pub async fn serve_connection<S>(
        core: Arc<Core>,
        stream: S,
        remote_ip: IpAddr,
        shutdown: watch::Receiver<bool>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        Session::new(core, stream, remote_ip, shutdown).run().await;
    }

    /// Accept loop: one session task per connection until shutdown, then a
    /// grace period for the stragglers.
    pub async fn run(mut self, listener: TcpListener) -> Result<(), Error> {
        info!(
            hostname = %self.core.config.hostname,
            max_connections = self.core.config.max_connections,
            "SMTP server accepting connections"
        );
        let mut sessions: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let remote_ip = peer.ip();
                    match self.semaphore.clone().try_acquire_owned() {
                        Ok(permit) => {
                            let core = self.core.clone();
                            let shutdown = self.shutdown_rx.clone();
                            sessions.spawn(async move {
                                Self::serve_connection(core, stream, remote_ip, shutdown).await;
                                drop(permit);
                            });
                        }
                        Err(_) => {
                            debug!(ip = %remote_ip, "connection over capacity");
                            sessions.spawn(async move {
                                let mut stream = stream;
                                let _ = Reply::new(421, "4.3.2 Too many connections")
                                    .write_to(&mut stream)
                                    .await;
                            });
                        }
                    }
                }
                _ = self.shutdown_rx.changed() => break,
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        info!(active = sessions.len(), "shutting down, draining sessions");
        let grace = Duration::from_secs(self.core.config.shutdown_grace);
        let drained = timeout(grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = sessions.len(), "grace period elapsed, aborting sessions");
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }
        info!("shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config() -> ServerConfig {
        ServerConfig {
            hostname: "mx.test".to_string(),
            enable_auth: false,
            shutdown_grace: 1,
            ..Default::default()
        }
    }

    async fn read_reply(stream: &mut TcpStream) -> String {
        let mut buf = [0u8; 512];
        let n = stream.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[tokio::test]
    async fn accepts_a_connection_and_greets() {
        let core = Arc::new(Core::open_in_memory(test_config()).unwrap());
        let server = Server::new(core);
        let handle = server.handle();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(server.run(listener));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let banner = read_reply(&mut client).await;
        assert!(banner.starts_with("220 mx.test ESMTP ready"));
        client.write_all(b"QUIT\r\n").await.unwrap();
        let bye = read_reply(&mut client).await;
        assert!(bye.starts_with("221"));

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn over_capacity_connections_get_421() {
        let config = ServerConfig {
            max_connections: 0,
            ..test_config()
        };
        let core = Arc::new(Core::open_in_memory(config).unwrap());
        let server = Server::new(core);
        let handle = server.handle();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(server.run(listener));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let reply = read_reply(&mut client).await;
        assert!(reply.starts_with("421"), "got {:?}", reply);
        assert!(reply.contains("Too many connections"));

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_without_sessions_completes() {
        let core = Arc::new(Core::open_in_memory(test_config()).unwrap());
        let server = Server::new(core);
        let handle = server.handle();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let task = tokio::spawn(server.run(listener));
        handle.shutdown();
        task.await.unwrap().unwrap();
    }
}
