/*
 * session.rs
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

//! The per-connection SMTP session: ingress gates at connect, the command
//! state machine, AUTH exchanges, STARTTLS upgrade, DATA ingestion and
//! routing into the store and queue.
//!
//! Commands are processed strictly in arrival order out of one receive
//! buffer, which is also what makes PIPELINING work: whatever the client
//! sent ahead is already buffered and each command still gets its reply in
//! sequence.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::message_id::{generate_message_id, generate_queue_id};
use crate::net::SessionStream;
use crate::protocol::smtp::command::{self, Command};
use crate::protocol::smtp::data::{header_value, split_message, DataReader};
use crate::protocol::smtp::Reply;
use crate::sasl::{
    decode_login_response, decode_plain, SaslMechanism, LOGIN_PASSWORD_CHALLENGE,
    LOGIN_USERNAME_CHALLENGE,
};
use crate::server::Core;
use crate::store::NewMessage;

/// RFC 5321 §4.5.3.1.6: command lines beyond this are rejected with 500.
const MAX_LINE_LEN: usize = 998;
const READ_CHUNK: usize = 8192;

enum Flow {
    Continue,
    Close,
}

enum ReadOutcome {
    Line(String),
    TooLong,
    TimedOut,
}

enum ChunkOutcome {
    Data,
    TimedOut,
}

fn stream_gone() -> Error {
    Error::Transport(io::Error::new(
        io::ErrorKind::NotConnected,
        "stream unavailable",
    ))
}

pub struct Session<S: AsyncRead + AsyncWrite + Unpin> {
    core: Arc<Core>,
    stream: Option<SessionStream<S>>,
    remote_ip: IpAddr,
    shutdown: watch::Receiver<bool>,

    recv: Vec<u8>,
    discarding_line: bool,

    greeted: bool,
    helo_name: String,
    authed_user: Option<String>,
    auth_failures: u32,
    reverse_path: Option<String>,
    forward_paths: Vec<String>,
    announced_size: Option<usize>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(
        core: Arc<Core>,
        stream: S,
        remote_ip: IpAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            core,
            stream: Some(SessionStream::Plain(stream)),
            remote_ip,
            shutdown,
            recv: Vec::new(),
            discarding_line: false,
            greeted: false,
            helo_name: String::new(),
            authed_user: None,
            auth_failures: 0,
            reverse_path: None,
            forward_paths: Vec::new(),
            announced_size: None,
        }
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.core.config.command_timeout)
    }

    /// Run the session to completion. Session-local errors never escape.
    pub async fn run(mut self) {
        match self.serve().await {
            Ok(()) => debug!(ip = %self.remote_ip, "session closed"),
            Err(Error::Shutdown) => {
                let _ = self
                    .write_reply(&Reply::new(421, "4.3.0 Server shutting down"))
                    .await;
            }
            Err(Error::Transport(e)) => {
                debug!(ip = %self.remote_ip, error = %e, "session transport error")
            }
            Err(e) => warn!(ip = %self.remote_ip, error = %e, "session error"),
        }
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.shutdown().await;
        }
    }

    async fn serve(&mut self) -> Result<(), Error> {
        // Connect-time gates: blocklist first, then the per-IP budget.
        let blocked = match &self.core.dnsbl {
            Some(dnsbl) => dnsbl.is_blacklisted(self.remote_ip).await,
            None => false,
        };
        if blocked {
            warn!(ip = %self.remote_ip, "connection blocked by DNSBL");
            self.write_reply(&Reply::new(
                554,
                "5.7.1 Service unavailable; client host blocked",
            ))
            .await?;
            return Ok(());
        }
        if !self.core.limiter.check_and_increment(self.remote_ip) {
            debug!(ip = %self.remote_ip, "connection rate limited");
            self.write_reply(&Reply::new(421, "4.7.0 Too many requests"))
                .await?;
            return Ok(());
        }

        let banner = format!("{} ESMTP ready", self.core.config.hostname);
        self.write_reply(&Reply::new(220, banner)).await?;

        loop {
            // Between transactions a shutdown request closes the session;
            // a transaction already underway is allowed to finish first.
            let shutting_down = *self.shutdown.borrow();
            if shutting_down && self.reverse_path.is_none() {
                self.write_reply(&Reply::new(421, "4.3.0 Server shutting down"))
                    .await?;
                return Ok(());
            }
            let line = match self.read_line(self.command_timeout()).await? {
                ReadOutcome::Line(line) => line,
                ReadOutcome::TooLong => {
                    self.write_reply(&Reply::new(500, "5.5.2 Line too long"))
                        .await?;
                    continue;
                }
                ReadOutcome::TimedOut => {
                    self.write_reply(&Reply::new(421, "4.4.2 Idle timeout, closing connection"))
                        .await?;
                    return Ok(());
                }
            };
            match self.handle_command(&line).await? {
                Flow::Continue => {}
                Flow::Close => return Ok(()),
            }
        }
    }

    async fn write_reply(&mut self, reply: &Reply) -> Result<(), Error> {
        let stream = self.stream.as_mut().ok_or_else(stream_gone)?;
        reply.write_to(stream).await?;
        Ok(())
    }

    /// Pull one chunk off the socket into the receive buffer, honoring the
    /// timeout and the shutdown signal.
    async fn read_chunk(&mut self, dur: Duration) -> Result<ChunkOutcome, Error> {
        let mut buf = [0u8; READ_CHUNK];
        let stream = self.stream.as_mut().ok_or_else(stream_gone)?;
        let shutdown = &mut self.shutdown;
        let n = tokio::select! {
            r = timeout(dur, stream.read(&mut buf)) => match r {
                Err(_) => return Ok(ChunkOutcome::TimedOut),
                Ok(Ok(0)) => {
                    return Err(Error::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )))
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
            },
            _ = shutdown.changed() => return Err(Error::Shutdown),
        };
        self.recv.extend_from_slice(&buf[..n]);
        Ok(ChunkOutcome::Data)
    }

    /// Extract the next command line from the receive buffer, reading more
    /// as needed. Lines end in CRLF; bare LF is tolerated.
    async fn read_line(&mut self, dur: Duration) -> Result<ReadOutcome, Error> {
        loop {
            while let Some(pos) = self.recv.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.recv.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if self.discarding_line {
                    // Tail of an over-long line that was already rejected.
                    self.discarding_line = false;
                    continue;
                }
                if line.len() > MAX_LINE_LEN {
                    return Ok(ReadOutcome::TooLong);
                }
                return Ok(ReadOutcome::Line(String::from_utf8_lossy(&line).to_string()));
            }
            if self.discarding_line {
                self.recv.clear();
            } else if self.recv.len() > MAX_LINE_LEN + 2 {
                self.recv.clear();
                self.discarding_line = true;
                return Ok(ReadOutcome::TooLong);
            }
            match self.read_chunk(dur).await? {
                ChunkOutcome::Data => {}
                ChunkOutcome::TimedOut => return Ok(ReadOutcome::TimedOut),
            }
        }
    }

    fn reset_transaction(&mut self) {
        self.reverse_path = None;
        self.forward_paths.clear();
        self.announced_size = None;
    }

    /// RFC 3207 §4.2: after the TLS handshake the session restarts from the
    /// very beginning; only the connection itself (and its address) survives.
    fn reset_after_starttls(&mut self) {
        self.greeted = false;
        self.helo_name.clear();
        self.authed_user = None;
        self.auth_failures = 0;
        self.recv.clear();
        self.discarding_line = false;
        self.reset_transaction();
    }

    fn is_tls(&self) -> bool {
        self.stream.as_ref().map(|s| s.is_tls()).unwrap_or(false)
    }

    /// A recipient is local when its domain is served here or the exact
    /// address belongs to a user account. `postmaster` is always local.
    fn is_local_recipient(&self, addr: &str) -> bool {
        match addr.rsplit_once('@') {
            Some((_, domain)) => {
                self.core.config.is_local_domain(domain) || self.core.users.email_exists(addr)
            }
            None => true,
        }
    }

    async fn handle_command(&mut self, line: &str) -> Result<Flow, Error> {
        let cmd = match command::parse(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                self.write_reply(&Reply::new(e.code, e.message)).await?;
                return Ok(Flow::Continue);
            }
        };
        match cmd {
            Command::Helo(name) => {
                self.greeted = true;
                self.helo_name = name;
                self.reset_transaction();
                let text = self.core.config.hostname.clone();
                self.write_reply(&Reply::new(250, text)).await?;
                Ok(Flow::Continue)
            }
            Command::Ehlo(name) => {
                self.greeted = true;
                self.helo_name = name;
                self.reset_transaction();
                let reply = self.ehlo_reply();
                self.write_reply(&reply).await?;
                Ok(Flow::Continue)
            }
            Command::StartTls => self.handle_starttls().await,
            Command::Auth { mechanism, initial } => self.handle_auth(&mechanism, initial).await,
            Command::Mail { reverse_path, size } => self.handle_mail(reverse_path, size).await,
            Command::Rcpt { forward_path } => self.handle_rcpt(forward_path).await,
            Command::Data => self.handle_data().await,
            Command::Rset => {
                self.reset_transaction();
                self.write_reply(&Reply::new(250, "OK")).await?;
                Ok(Flow::Continue)
            }
            Command::Noop => {
                self.write_reply(&Reply::new(250, "OK")).await?;
                Ok(Flow::Continue)
            }
            Command::Quit => {
                self.write_reply(&Reply::new(221, "2.0.0 Bye")).await?;
                Ok(Flow::Close)
            }
            Command::Vrfy(_) | Command::Expn(_) => {
                // Never confirm or deny mailboxes; delivery will tell.
                self.write_reply(&Reply::new(
                    252,
                    "2.1.5 Cannot verify, but will accept message and attempt delivery",
                ))
                .await?;
                Ok(Flow::Continue)
            }
            Command::Help(_) => {
                self.write_reply(&Reply::new(214, "2.0.0 See RFC 5321")).await?;
                Ok(Flow::Continue)
            }
            Command::Etrn(arg) => self.handle_etrn(&arg).await,
        }
    }

    fn ehlo_reply(&self) -> Reply {
        let config = &self.core.config;
        let mut lines = vec![
            format!("{} Hello {}", config.hostname, self.helo_name),
            format!("SIZE {}", config.max_message_size),
            "8BITMIME".to_string(),
            "PIPELINING".to_string(),
        ];
        if config.enable_auth {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }
        if self.core.tls_acceptor.is_some() && !self.is_tls() {
            lines.push("STARTTLS".to_string());
        }
        lines.push("ETRN".to_string());
        Reply::multi(250, lines)
    }

    async fn handle_starttls(&mut self) -> Result<Flow, Error> {
        if !self.greeted {
            self.write_reply(&Reply::new(503, "5.5.1 EHLO first")).await?;
            return Ok(Flow::Continue);
        }
        if self.is_tls() {
            self.write_reply(&Reply::new(503, "5.5.1 TLS already active"))
                .await?;
            return Ok(Flow::Continue);
        }
        let acceptor = self.core.tls_acceptor.clone();
        let acceptor = match acceptor {
            Some(acceptor) => acceptor,
            None => {
                self.write_reply(&Reply::new(454, "4.7.0 TLS not available"))
                    .await?;
                return Ok(Flow::Continue);
            }
        };
        self.write_reply(&Reply::new(220, "2.0.0 Ready to start TLS"))
            .await?;
        // Anything pipelined past STARTTLS was sent in the clear; drop it.
        self.recv.clear();
        self.discarding_line = false;
        let stream = self.stream.take().ok_or_else(stream_gone)?;
        match stream.upgrade(&acceptor).await {
            Ok(tls) => {
                self.stream = Some(tls);
                self.reset_after_starttls();
                debug!(ip = %self.remote_ip, "TLS established");
                Ok(Flow::Continue)
            }
            Err(e) => {
                warn!(ip = %self.remote_ip, error = %e, "TLS handshake failed");
                Err(Error::Transport(e))
            }
        }
    }

    /// Read one line of an AUTH exchange. `*` cancels (RFC 4954 §4).
    async fn read_auth_response(&mut self) -> Result<Option<String>, Error> {
        match self.read_line(self.command_timeout()).await? {
            ReadOutcome::Line(line) => {
                if line.trim() == "*" {
                    self.write_reply(&Reply::new(501, "5.7.0 Authentication cancelled"))
                        .await?;
                    Ok(None)
                } else {
                    Ok(Some(line))
                }
            }
            ReadOutcome::TooLong => {
                self.write_reply(&Reply::new(500, "5.5.2 Line too long")).await?;
                Ok(None)
            }
            ReadOutcome::TimedOut => {
                self.write_reply(&Reply::new(421, "4.4.2 Idle timeout, closing connection"))
                    .await?;
                Err(Error::Transport(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "AUTH exchange timed out",
                )))
            }
        }
    }

    async fn handle_auth(&mut self, mechanism: &str, initial: Option<String>) -> Result<Flow, Error> {
        if !self.core.config.enable_auth {
            self.write_reply(&Reply::new(502, "5.5.1 Command not implemented"))
                .await?;
            return Ok(Flow::Continue);
        }
        if !self.greeted {
            self.write_reply(&Reply::new(503, "5.5.1 EHLO first")).await?;
            return Ok(Flow::Continue);
        }
        if self.authed_user.is_some() {
            self.write_reply(&Reply::new(503, "5.5.1 Already authenticated"))
                .await?;
            return Ok(Flow::Continue);
        }
        if self.reverse_path.is_some() {
            self.write_reply(&Reply::new(503, "5.5.1 AUTH not permitted during mail transaction"))
                .await?;
            return Ok(Flow::Continue);
        }
        let mechanism = match SaslMechanism::from_name(mechanism) {
            Some(m) => m,
            None => {
                self.write_reply(&Reply::new(504, "5.5.4 Unrecognized authentication type"))
                    .await?;
                return Ok(Flow::Continue);
            }
        };

        let credentials = match mechanism {
            SaslMechanism::Plain => {
                let payload = match initial {
                    // "=" is the zero-length initial response.
                    Some(s) if s == "=" => String::new(),
                    Some(s) => s,
                    None => {
                        self.write_reply(&Reply::new(334, "")).await?;
                        match self.read_auth_response().await? {
                            Some(line) => line,
                            None => return Ok(Flow::Continue),
                        }
                    }
                };
                match decode_plain(&payload) {
                    Ok(creds) => creds,
                    Err(e) => {
                        debug!(error = %e, "bad AUTH PLAIN payload");
                        self.write_reply(&Reply::new(501, "5.5.2 Cannot decode response"))
                            .await?;
                        return Ok(Flow::Continue);
                    }
                }
            }
            SaslMechanism::Login => {
                let user_b64 = match initial {
                    Some(s) => s,
                    None => {
                        self.write_reply(&Reply::new(334, LOGIN_USERNAME_CHALLENGE))
                            .await?;
                        match self.read_auth_response().await? {
                            Some(line) => line,
                            None => return Ok(Flow::Continue),
                        }
                    }
                };
                self.write_reply(&Reply::new(334, LOGIN_PASSWORD_CHALLENGE))
                    .await?;
                let pass_b64 = match self.read_auth_response().await? {
                    Some(line) => line,
                    None => return Ok(Flow::Continue),
                };
                let decoded = decode_login_response(&user_b64)
                    .and_then(|u| decode_login_response(&pass_b64).map(|p| (u, p)));
                match decoded {
                    Ok(creds) => creds,
                    Err(e) => {
                        debug!(error = %e, "bad AUTH LOGIN payload");
                        self.write_reply(&Reply::new(501, "5.5.2 Cannot decode response"))
                            .await?;
                        return Ok(Flow::Continue);
                    }
                }
            }
        };

        let (username, password) = credentials;
        // Argon2 verification is deliberately slow; keep it off the async
        // workers and away from every component lock.
        let users = self.core.users.clone();
        let user_for_task = username.clone();
        let verified = tokio::task::spawn_blocking(move || {
            users.verify_credentials(&user_for_task, &password)
        })
        .await
        .map_err(|e| Error::TransientStorage(format!("verification task failed: {}", e)))?;

        if verified {
            info!(ip = %self.remote_ip, user = %username, "authenticated");
            self.authed_user = Some(username);
            self.auth_failures = 0;
            self.write_reply(&Reply::new(235, "2.7.0 Authentication successful"))
                .await?;
            return Ok(Flow::Continue);
        }

        self.auth_failures += 1;
        // Failed logins also debit the per-IP budget.
        let _ = self.core.limiter.check_and_increment(self.remote_ip);
        if self.auth_failures >= self.core.config.max_auth_failures {
            warn!(ip = %self.remote_ip, attempts = self.auth_failures, "too many auth failures");
            self.write_reply(&Reply::new(421, "4.7.0 Too many authentication failures"))
                .await?;
            return Ok(Flow::Close);
        }
        self.write_reply(&Reply::new(535, "5.7.8 Authentication credentials invalid"))
            .await?;
        Ok(Flow::Continue)
    }

    async fn handle_mail(&mut self, reverse_path: String, size: Option<usize>) -> Result<Flow, Error> {
        if !self.greeted {
            self.write_reply(&Reply::new(503, "5.5.1 EHLO first")).await?;
            return Ok(Flow::Continue);
        }
        if self.reverse_path.is_some() {
            self.write_reply(&Reply::new(503, "5.5.1 Nested MAIL command"))
                .await?;
            return Ok(Flow::Continue);
        }
        if self.core.config.enable_auth && self.authed_user.is_none() {
            self.write_reply(&Reply::new(530, "5.7.0 Authentication required"))
                .await?;
            return Ok(Flow::Continue);
        }
        if let Some(announced) = size {
            if announced > self.core.config.max_message_size {
                self.write_reply(&Reply::new(552, "5.3.4 Message exceeds maximum size"))
                    .await?;
                return Ok(Flow::Continue);
            }
        }
        self.reverse_path = Some(reverse_path);
        self.announced_size = size;
        self.write_reply(&Reply::new(250, "OK")).await?;
        Ok(Flow::Continue)
    }

    async fn handle_rcpt(&mut self, forward_path: String) -> Result<Flow, Error> {
        let reverse_path = match &self.reverse_path {
            Some(path) => path.clone(),
            None => {
                self.write_reply(&Reply::new(503, "5.5.1 MAIL first")).await?;
                return Ok(Flow::Continue);
            }
        };
        let deferred = match &self.core.greylist {
            Some(greylist) => !greylist.check_triplet(self.remote_ip, &reverse_path, &forward_path),
            None => false,
        };
        if deferred {
            debug!(ip = %self.remote_ip, rcpt = %forward_path, "greylisted");
            self.write_reply(&Reply::new(450, "4.7.1 Greylisted, try again later"))
                .await?;
            return Ok(Flow::Continue);
        }
        if let Some(user) = self.authed_user.clone() {
            if !self.core.limiter.check_and_increment_user(&user) {
                warn!(user = %user, "user rate limited");
                self.write_reply(&Reply::new(421, "4.7.0 Too many requests"))
                    .await?;
                return Ok(Flow::Close);
            }
        }
        if self.forward_paths.len() >= self.core.config.max_recipients {
            self.write_reply(&Reply::new(552, "5.5.3 Too many recipients"))
                .await?;
            return Ok(Flow::Continue);
        }
        self.forward_paths.push(forward_path);
        self.write_reply(&Reply::new(250, "OK")).await?;
        Ok(Flow::Continue)
    }

    async fn handle_data(&mut self) -> Result<Flow, Error> {
        if self.reverse_path.is_none() {
            self.write_reply(&Reply::new(503, "5.5.1 MAIL first")).await?;
            return Ok(Flow::Continue);
        }
        if self.forward_paths.is_empty() {
            self.write_reply(&Reply::new(503, "5.5.1 RCPT first")).await?;
            return Ok(Flow::Continue);
        }
        self.write_reply(&Reply::new(354, "End data with <CR><LF>.<CR><LF>"))
            .await?;

        let limit = self
            .announced_size
            .map(|announced| announced.min(self.core.config.max_message_size))
            .unwrap_or(self.core.config.max_message_size);
        let mut reader = DataReader::new(limit);
        let deadline = Instant::now() + Duration::from_secs(self.core.config.data_timeout);

        loop {
            if !self.recv.is_empty() {
                let chunk = std::mem::take(&mut self.recv);
                if let Some(consumed) = reader.push(&chunk) {
                    // Bytes past the terminator are the next pipelined
                    // command.
                    self.recv = chunk[consumed..].to_vec();
                    break;
                }
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.write_reply(&Reply::new(421, "4.4.2 Data timeout, closing connection"))
                    .await?;
                return Err(Error::Transport(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "DATA terminator timed out",
                )));
            }
            let per_read = remaining.min(self.command_timeout());
            match self.read_chunk(per_read).await? {
                ChunkOutcome::Data => {}
                ChunkOutcome::TimedOut => {
                    self.write_reply(&Reply::new(421, "4.4.2 Data timeout, closing connection"))
                        .await?;
                    return Err(Error::Transport(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "DATA line timed out",
                    )));
                }
            }
        }

        if reader.is_oversized() {
            self.reset_transaction();
            self.write_reply(&Reply::new(552, "5.3.4 Message exceeds maximum size"))
                .await?;
            return Ok(Flow::Continue);
        }

        let raw = reader.into_body();
        match self.deliver(&raw) {
            Ok(queue_id) => {
                self.reset_transaction();
                self.write_reply(&Reply::new(250, format!("OK {}", queue_id)))
                    .await?;
                Ok(Flow::Continue)
            }
            Err(e) if e.is_recoverable() => {
                warn!(ip = %self.remote_ip, error = %e, "message not accepted");
                self.reset_transaction();
                self.write_reply(&Reply::new(451, "4.3.0 Temporary storage failure, try again later"))
                    .await?;
                Ok(Flow::Continue)
            }
            Err(e) => Err(e),
        }
    }

    /// Store for local recipients, enqueue for remote ones.
    fn deliver(&self, raw: &[u8]) -> Result<String, Error> {
        let sender = self.reverse_path.clone().unwrap_or_default();
        let (headers, body) = split_message(raw);
        let subject = header_value(&headers, "Subject").unwrap_or_default();
        let message_id = header_value(&headers, "Message-ID")
            .unwrap_or_else(|| generate_message_id(&self.core.config.hostname));
        let queue_id = generate_queue_id();

        for rcpt in &self.forward_paths {
            if self.is_local_recipient(rcpt) {
                self.core.store.store(NewMessage {
                    owner_email: rcpt.clone(),
                    message_id: message_id.clone(),
                    sender: sender.clone(),
                    recipients: self.forward_paths.clone(),
                    subject: subject.clone(),
                    headers: headers.clone(),
                    body: body.clone(),
                })?;
            } else {
                self.core.queue.enqueue(&sender, rcpt, raw)?;
            }
        }
        info!(
            ip = %self.remote_ip,
            queue_id = %queue_id,
            sender = %sender,
            nrcpt = self.forward_paths.len(),
            size = raw.len(),
            "message accepted"
        );
        Ok(queue_id)
    }

    async fn handle_etrn(&mut self, arg: &str) -> Result<Flow, Error> {
        if !self.greeted {
            self.write_reply(&Reply::new(503, "5.5.1 EHLO first")).await?;
            return Ok(Flow::Continue);
        }
        let (queue_form, target) = if let Some(t) = arg.strip_prefix('#') {
            (true, t)
        } else if let Some(t) = arg.strip_prefix('@') {
            (false, t)
        } else {
            (false, arg)
        };
        let valid = !target.is_empty()
            && target
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
        if !valid {
            self.write_reply(&Reply::new(501, "5.5.4 Syntax error in ETRN node name"))
                .await?;
            return Ok(Flow::Continue);
        }
        if !self.core.config.etrn_allows(target) {
            self.write_reply(&Reply::new(459, format!("Node {} not allowed", target)))
                .await?;
            return Ok(Flow::Continue);
        }
        match self.core.queue.flush_domain(target) {
            Err(e) => {
                warn!(error = %e, "ETRN flush failed");
                self.write_reply(&Reply::new(451, "4.3.0 Queue unavailable"))
                    .await?;
            }
            Ok(_) if queue_form => {
                self.write_reply(&Reply::new(
                    252,
                    format!("OK, pending messages for queue {} started", target),
                ))
                .await?;
            }
            Ok(0) => {
                self.write_reply(&Reply::new(251, format!("OK, no queued messages for {}", target)))
                    .await?;
            }
            Ok(n) => {
                self.write_reply(&Reply::new(
                    250,
                    format!("OK, queuing for {} started ({} messages)", target, n),
                ))
                .await?;
            }
        }
        Ok(Flow::Continue)
    }
}
