/*
 * net.rs
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

//! TLS acceptor helpers and the session transport: a connection starts plain
//! and may be upgraded in place after STARTTLS.

use std::fs::File;
use std::io::{self, BufReader};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::rustls::ServerConfig as RustlsServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::error::Error;

/// Build a TLS acceptor from a PEM certificate chain and private key.
/// Called once at startup; a broken cert setup must abort before accepting.
pub fn build_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, Error> {
    let certs = {
        let file = File::open(cert_path)
            .map_err(|e| Error::FatalStorage(format!("cannot open {}: {}", cert_path, e)))?;
        let mut reader = BufReader::new(file);
        rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::FatalStorage(format!("bad certificate in {}: {}", cert_path, e)))?
    };
    if certs.is_empty() {
        return Err(Error::FatalStorage(format!(
            "no certificates found in {}",
            cert_path
        )));
    }

    let key: PrivateKeyDer = {
        let file = File::open(key_path)
            .map_err(|e| Error::FatalStorage(format!("cannot open {}: {}", key_path, e)))?;
        let mut reader = BufReader::new(file);
        rustls_pemfile::private_key(&mut reader)
            .map_err(|e| Error::FatalStorage(format!("bad key in {}: {}", key_path, e)))?
            .ok_or_else(|| Error::FatalStorage(format!("no private key found in {}", key_path)))?
    };

    let config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::FatalStorage(format!("TLS config rejected: {}", e)))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Session transport: plain at accept time, TLS after a STARTTLS upgrade.
/// Generic over the inner stream so tests can drive sessions over in-memory
/// duplex pipes.
pub enum SessionStream<S> {
    Plain(S),
    Tls(TlsStream<S>),
}

impl<S> SessionStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn is_tls(&self) -> bool {
        matches!(self, SessionStream::Tls(_))
    }

    /// Perform the server half of the STARTTLS handshake on the same
    /// underlying connection. Consumes `self`; an already-TLS stream is a
    /// caller bug and comes back as an error rather than a double handshake.
    pub async fn upgrade(self, acceptor: &TlsAcceptor) -> io::Result<SessionStream<S>> {
        match self {
            SessionStream::Plain(stream) => {
                let tls = acceptor.accept(stream).await?;
                Ok(SessionStream::Tls(tls))
            }
            SessionStream::Tls(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "connection is already TLS",
            )),
        }
    }
}

impl<S> AsyncRead for SessionStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            SessionStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            SessionStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<S> AsyncWrite for SessionStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            SessionStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            SessionStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            SessionStream::Plain(s) => Pin::new(s).poll_flush(cx),
            SessionStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            SessionStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            SessionStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
