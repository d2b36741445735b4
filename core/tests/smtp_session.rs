/*
 * smtp_session.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * Integration tests for the SMTP session engine: full command/reply
 * round-trips over in-memory duplex streams against in-memory stores,
 * covering the happy path, greylisting, rate limits, AUTH failure
 * escalation, SIZE enforcement, ETRN and pipelining.
 *
 * Run with:
 *   cargo test -p portalettere_core --test smtp_session -- --nocapture
 */

use std::net::IpAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use portalettere_core::sasl::encode_base64;
use portalettere_core::server::{Core, Server};
use portalettere_core::ServerConfig;

/// Client half of a scripted session.
struct Client {
    stream: DuplexStream,
    buf: Vec<u8>,
    session: JoinHandle<()>,
    _shutdown: watch::Sender<bool>,
}

impl Client {
    fn connect(core: Arc<Core>, ip: &str) -> Client {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = watch::channel(false);
        let remote_ip: IpAddr = ip.parse().expect("test ip");
        let session = tokio::spawn(Server::serve_connection(core, server_io, remote_ip, rx));
        Client {
            stream: client_io,
            buf: Vec::new(),
            session,
            _shutdown: tx,
        }
    }

    async fn send(&mut self, line: &str) {
        self.stream
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .expect("write");
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write raw");
    }

    /// Read one complete reply (multi-line aware). Returns every line,
    /// CRLF-stripped, concatenated with '\n'.
    async fn reply(&mut self) -> String {
        let mut lines = Vec::new();
        loop {
            while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                let line = String::from_utf8(line).expect("ascii reply");
                let done = line.len() < 4 || line.as_bytes()[3] == b' ';
                lines.push(line);
                if done {
                    return lines.join("\n");
                }
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.expect("read");
            assert!(n > 0, "connection closed while waiting for a reply");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// True when the server closed the stream (no more replies).
    async fn closed(mut self) -> bool {
        let mut chunk = [0u8; 64];
        let n = self.stream.read(&mut chunk).await.unwrap_or(0);
        let _ = self.session.await;
        n == 0
    }
}

fn base_config() -> ServerConfig {
    ServerConfig {
        hostname: "mx.test".to_string(),
        enable_auth: false,
        local_domains: vec!["local".to_string()],
        ..Default::default()
    }
}

fn core_with(config: ServerConfig) -> Arc<Core> {
    Arc::new(Core::open_in_memory(config).expect("in-memory core"))
}

#[tokio::test]
async fn s1_happy_path_stores_the_message() {
    let core = core_with(base_config());
    let mut c = Client::connect(core.clone(), "192.0.2.1");

    assert!(c.reply().await.starts_with("220 mx.test ESMTP ready"));
    c.send("EHLO c").await;
    let ehlo = c.reply().await;
    assert!(ehlo.starts_with("250-mx.test"));
    assert!(ehlo.contains("250-PIPELINING"));
    assert!(ehlo.contains("250-SIZE"));
    assert!(ehlo.ends_with("250 ETRN"));
    c.send("MAIL FROM:<a@x>").await;
    assert_eq!(c.reply().await, "250 OK");
    c.send("RCPT TO:<b@local>").await;
    assert_eq!(c.reply().await, "250 OK");
    c.send("DATA").await;
    assert!(c.reply().await.starts_with("354"));
    c.send_raw(b"From: a@x\r\n\r\nhi\r\n.\r\n").await;
    let accept = c.reply().await;
    assert!(accept.starts_with("250 OK "), "got {:?}", accept);
    c.send("QUIT").await;
    assert!(c.reply().await.starts_with("221"));
    assert!(c.closed().await);

    let inbox = core.store.list("b@local", None, 10, 0).unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].sender, "a@x");
    assert_eq!(inbox[0].body, b"hi\r\n".to_vec());
    assert_eq!(inbox[0].size, 4);
    assert_eq!(inbox[0].recipients, vec!["b@local".to_string()]);
}

#[tokio::test]
async fn s2_greylist_defers_then_admits() {
    let config = ServerConfig {
        enable_greylist: true,
        // Zero delay: the retry in the same session is already "late enough",
        // which keeps the scenario deterministic. The delay arithmetic itself
        // is covered by the greylist unit tests.
        greylist_initial_delay: 0,
        ..base_config()
    };
    let core = core_with(config);
    let mut c = Client::connect(core, "192.0.2.2");

    c.reply().await;
    c.send("EHLO c").await;
    c.reply().await;
    c.send("MAIL FROM:<a@x>").await;
    assert_eq!(c.reply().await, "250 OK");
    c.send("RCPT TO:<b@local>").await;
    let deferred = c.reply().await;
    assert!(deferred.starts_with("450"), "got {:?}", deferred);
    assert!(deferred.contains("Greylisted"));

    // The sender retries the recipient: the triplet is now known.
    c.send("RCPT TO:<b@local>").await;
    assert_eq!(c.reply().await, "250 OK");
    c.send("DATA").await;
    assert!(c.reply().await.starts_with("354"));
    c.send_raw(b"hi\r\n.\r\n").await;
    assert!(c.reply().await.starts_with("250 OK "));
}

#[tokio::test]
async fn s3_per_ip_rate_limit_closes_third_connection() {
    let config = ServerConfig {
        rate_limit_per_ip: 2,
        rate_window_seconds: 60,
        ..base_config()
    };
    let core = core_with(config);

    for _ in 0..2 {
        let mut c = Client::connect(core.clone(), "10.0.0.1");
        assert!(c.reply().await.starts_with("220"));
        c.send("QUIT").await;
        c.reply().await;
    }
    let mut c = Client::connect(core.clone(), "10.0.0.1");
    let reply = c.reply().await;
    assert!(reply.starts_with("421"), "got {:?}", reply);
    assert!(reply.contains("Too many requests"));
    assert!(c.closed().await);

    // A different address is unaffected.
    let mut c = Client::connect(core, "10.0.0.2");
    assert!(c.reply().await.starts_with("220"));
}

#[tokio::test]
async fn s4_auth_failures_escalate_to_421() {
    let config = ServerConfig {
        enable_auth: true,
        ..base_config()
    };
    let core = core_with(config);
    core.users
        .create_user("u", "u@local", "the-right-password")
        .unwrap();
    let mut c = Client::connect(core, "192.0.2.4");

    c.reply().await;
    c.send("EHLO c").await;
    let ehlo = c.reply().await;
    assert!(ehlo.contains("250-AUTH PLAIN LOGIN"));

    let bad = encode_base64(b"\0u\0wrong");
    c.send(&format!("AUTH PLAIN {}", bad)).await;
    assert!(c.reply().await.starts_with("535"));
    c.send(&format!("AUTH PLAIN {}", bad)).await;
    assert!(c.reply().await.starts_with("535"));
    c.send(&format!("AUTH PLAIN {}", bad)).await;
    let last = c.reply().await;
    assert!(last.starts_with("421"), "got {:?}", last);
    assert!(c.closed().await);
}

#[tokio::test]
async fn auth_plain_success_and_mail_gating() {
    let config = ServerConfig {
        enable_auth: true,
        ..base_config()
    };
    let core = core_with(config);
    core.users.create_user("alice", "alice@local", "sekrit").unwrap();
    let mut c = Client::connect(core, "192.0.2.14");

    c.reply().await;
    c.send("EHLO c").await;
    c.reply().await;

    // Unauthenticated MAIL is refused.
    c.send("MAIL FROM:<alice@local>").await;
    assert!(c.reply().await.starts_with("530"));

    c.send(&format!("AUTH PLAIN {}", encode_base64(b"\0alice\0sekrit"))).await;
    assert!(c.reply().await.starts_with("235"));
    c.send("MAIL FROM:<alice@local>").await;
    assert_eq!(c.reply().await, "250 OK");
}

#[tokio::test]
async fn auth_login_challenge_flow() {
    let config = ServerConfig {
        enable_auth: true,
        ..base_config()
    };
    let core = core_with(config);
    core.users.create_user("bob", "bob@local", "pw-bob").unwrap();
    let mut c = Client::connect(core, "192.0.2.15");

    c.reply().await;
    c.send("EHLO c").await;
    c.reply().await;
    c.send("AUTH LOGIN").await;
    assert_eq!(c.reply().await, "334 VXNlcm5hbWU6");
    c.send(&encode_base64(b"bob")).await;
    assert_eq!(c.reply().await, "334 UGFzc3dvcmQ6");
    c.send(&encode_base64(b"pw-bob")).await;
    assert!(c.reply().await.starts_with("235"));
}

#[tokio::test]
async fn s5_announced_size_over_limit_is_rejected() {
    let config = ServerConfig {
        max_message_size: 1024,
        ..base_config()
    };
    let core = core_with(config);
    let mut c = Client::connect(core, "192.0.2.5");

    c.reply().await;
    c.send("EHLO c").await;
    let ehlo = c.reply().await;
    assert!(ehlo.contains("250-SIZE 1024"));
    c.send("MAIL FROM:<a@x> SIZE=2048").await;
    let reply = c.reply().await;
    assert!(reply.starts_with("552"), "got {:?}", reply);
    assert!(reply.contains("exceeds maximum size"));
}

#[tokio::test]
async fn oversized_data_is_discarded_with_552() {
    let config = ServerConfig {
        max_message_size: 32,
        ..base_config()
    };
    let core = core_with(config);
    let mut c = Client::connect(core.clone(), "192.0.2.6");

    c.reply().await;
    c.send("EHLO c").await;
    c.reply().await;
    c.send("MAIL FROM:<a@x>").await;
    c.reply().await;
    c.send("RCPT TO:<b@local>").await;
    c.reply().await;
    c.send("DATA").await;
    assert!(c.reply().await.starts_with("354"));
    c.send_raw(b"this body is clearly longer than the thirty-two byte cap\r\n.\r\n")
        .await;
    let reply = c.reply().await;
    assert!(reply.starts_with("552"), "got {:?}", reply);
    assert_eq!(core.store.message_count(), 0);

    // The session survives and a small message goes through.
    c.send("MAIL FROM:<a@x>").await;
    assert_eq!(c.reply().await, "250 OK");
}

#[tokio::test]
async fn s6_starttls_unavailable_without_certificates() {
    let core = core_with(base_config());
    let mut c = Client::connect(core, "192.0.2.7");

    c.reply().await;
    c.send("EHLO c").await;
    let ehlo = c.reply().await;
    // No acceptor configured: the capability is not advertised either.
    assert!(!ehlo.contains("STARTTLS"));
    c.send("STARTTLS").await;
    assert!(c.reply().await.starts_with("454"));
    // Session continues in plaintext.
    c.send("NOOP").await;
    assert_eq!(c.reply().await, "250 OK");
}

#[tokio::test]
async fn s7_etrn_flushes_allowed_domain() {
    let config = ServerConfig {
        etrn_allowed: vec!["example.com".to_string()],
        ..base_config()
    };
    let core = core_with(config);
    core.queue.enqueue("a@local", "one@example.com", b"m1").unwrap();
    core.queue.enqueue("a@local", "two@example.com", b"m2").unwrap();
    let mut c = Client::connect(core, "192.0.2.8");

    c.reply().await;
    c.send("EHLO c").await;
    c.reply().await;
    c.send("ETRN example.com").await;
    assert_eq!(
        c.reply().await,
        "250 OK, queuing for example.com started (2 messages)"
    );
    c.send("ETRN nothing-queued.example").await;
    let reply = c.reply().await;
    assert!(reply.starts_with("459"), "got {:?}", reply);
    c.send("ETRN @example.com").await;
    assert!(c.reply().await.starts_with("25"));
}

#[tokio::test]
async fn pipelined_commands_get_ordered_replies() {
    let core = core_with(base_config());
    let mut c = Client::connect(core.clone(), "192.0.2.9");

    c.reply().await;
    // Four commands in one write; four replies, in order.
    c.send_raw(b"EHLO c\r\nMAIL FROM:<a@x>\r\nRCPT TO:<b@local>\r\nDATA\r\n")
        .await;
    assert!(c.reply().await.starts_with("250-mx.test"));
    assert_eq!(c.reply().await, "250 OK");
    assert_eq!(c.reply().await, "250 OK");
    assert!(c.reply().await.starts_with("354"));
    // Message and QUIT pipelined too.
    c.send_raw(b"pipelined body\r\n.\r\nQUIT\r\n").await;
    assert!(c.reply().await.starts_with("250 OK "));
    assert!(c.reply().await.starts_with("221"));

    let inbox = core.store.list("b@local", None, 10, 0).unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].body, b"pipelined body\r\n".to_vec());
}

#[tokio::test]
async fn ingested_message_round_trips_byte_equal() {
    let core = core_with(base_config());
    let mut c = Client::connect(core.clone(), "192.0.2.10");

    c.reply().await;
    c.send("EHLO c").await;
    c.reply().await;
    c.send("MAIL FROM:<a@x>").await;
    c.reply().await;
    c.send("RCPT TO:<b@local>").await;
    c.reply().await;
    c.send("DATA").await;
    c.reply().await;
    // Dot-stuffed line and a bare-LF line in the wire form.
    c.send_raw(b"Subject: roundtrip\r\nMessage-ID: <rt@x>\r\n\r\n..dotted\r\nunix line\nend\r\n.\r\n")
        .await;
    assert!(c.reply().await.starts_with("250 OK "));

    let stored = core.store.retrieve("b@local", "<rt@x>").unwrap().unwrap();
    assert_eq!(stored.subject, "roundtrip");
    // Unstuffed, CRLF-canonicalized content.
    assert_eq!(stored.headers, "Subject: roundtrip\r\nMessage-ID: <rt@x>\r\n");
    assert_eq!(stored.body, b".dotted\r\nunix line\r\nend\r\n".to_vec());
    // Reassembling headers + separator + body reproduces the canonical DATA
    // section (modulo the dot-stuffing the wire adds back).
    let mut rebuilt = stored.headers.clone().into_bytes();
    rebuilt.extend_from_slice(b"\r\n");
    rebuilt.extend_from_slice(&stored.body);
    assert_eq!(
        rebuilt,
        b"Subject: roundtrip\r\nMessage-ID: <rt@x>\r\n\r\n.dotted\r\nunix line\r\nend\r\n".to_vec()
    );
}

#[tokio::test]
async fn bad_sequencing_gets_503_and_session_survives() {
    let core = core_with(base_config());
    let mut c = Client::connect(core, "192.0.2.11");

    c.reply().await;
    c.send("MAIL FROM:<a@x>").await;
    let reply = c.reply().await;
    assert!(reply.starts_with("503"));
    assert!(reply.contains("EHLO first"));
    c.send("EHLO c").await;
    c.reply().await;
    c.send("RCPT TO:<b@local>").await;
    assert!(c.reply().await.starts_with("503"));
    c.send("DATA").await;
    assert!(c.reply().await.starts_with("503"));
    c.send("BOGUS").await;
    assert!(c.reply().await.starts_with("500"));
    c.send("VRFY b@local").await;
    assert!(c.reply().await.starts_with("252"));
    c.send("HELP").await;
    assert!(c.reply().await.starts_with("214"));
    c.send("NOOP").await;
    assert_eq!(c.reply().await, "250 OK");
}

#[tokio::test]
async fn remote_recipients_are_queued_not_stored() {
    let core = core_with(base_config());
    let mut c = Client::connect(core.clone(), "192.0.2.12");

    c.reply().await;
    c.send("EHLO c").await;
    c.reply().await;
    c.send("MAIL FROM:<a@local>").await;
    c.reply().await;
    c.send("RCPT TO:<b@local>").await;
    c.reply().await;
    c.send("RCPT TO:<far@remote.example>").await;
    c.reply().await;
    c.send("DATA").await;
    c.reply().await;
    c.send_raw(b"Subject: split\r\n\r\nbody\r\n.\r\n").await;
    assert!(c.reply().await.starts_with("250 OK "));

    assert_eq!(core.store.list("b@local", None, 10, 0).unwrap().len(), 1);
    let stats = core.queue.stats().unwrap();
    assert_eq!(stats.pending, 1);
    let ready = core
        .queue
        .dequeue_ready(chrono_now_plus_one())
        .unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].to_addr, "far@remote.example");
    assert_eq!(ready[0].from_addr, "a@local");
    // The queue carries the full canonicalized message, headers included.
    assert_eq!(
        ready[0].message_data,
        b"Subject: split\r\n\r\nbody\r\n".to_vec()
    );
}

fn chrono_now_plus_one() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
        + 1
}

#[tokio::test]
async fn idle_command_timeout_closes_with_421() {
    let config = ServerConfig {
        command_timeout: 1,
        ..base_config()
    };
    let core = core_with(config);
    let mut c = Client::connect(core, "192.0.2.20");

    assert!(c.reply().await.starts_with("220"));
    // Say nothing; the server gives up after the command timeout.
    let reply = c.reply().await;
    assert!(reply.starts_with("421"), "got {:?}", reply);
    assert!(c.closed().await);
}

#[tokio::test]
async fn max_recipients_is_enforced() {
    let config = ServerConfig {
        max_recipients: 2,
        ..base_config()
    };
    let core = core_with(config);
    let mut c = Client::connect(core, "192.0.2.13");

    c.reply().await;
    c.send("EHLO c").await;
    c.reply().await;
    c.send("MAIL FROM:<a@x>").await;
    c.reply().await;
    c.send("RCPT TO:<r1@local>").await;
    assert_eq!(c.reply().await, "250 OK");
    c.send("RCPT TO:<r2@local>").await;
    assert_eq!(c.reply().await, "250 OK");
    c.send("RCPT TO:<r3@local>").await;
    let reply = c.reply().await;
    assert!(reply.starts_with("552"), "got {:?}", reply);
    assert!(reply.contains("Too many recipients"));
}
