//! Wire tests for the SASL sub-protocol.
//!
//! AUTH is only offered on a secured channel, so these tests flip the
//! session's `secure` flag directly instead of carrying certificate
//! fixtures.

use std::sync::Arc;

use smtpd_common::config::{ListenerConfig, Timeouts};
use tokio::{
    io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf},
    sync::mpsc,
};

use crate::{
    listener::Listener,
    peer::{
        spawn_routers, AuthReply, AuthRequest, DnsReply, DnsRequest, MfaReply, MfaRequest,
        PeerReplies, Peers, QueueReply, QueueRequest, Verdict,
    },
    registry::Registries,
    session::{Session, SessionConfig},
};

struct Client {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Client {
    async fn expect(&mut self, prefix: &str) -> String {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await.unwrap();
        assert!(n > 0, "connection closed while expecting {prefix:?}");
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        assert!(
            line.starts_with(prefix),
            "expected reply starting with {prefix:?}, got {line:?}"
        );
        line
    }

    async fn drain_ehlo(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            let done = line.starts_with("250 ");
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }
}

/// Start a session with accept-all collaborators and a credential checker
/// that accepts exactly `user`/`pass`. `secure` pre-secures the channel.
async fn start(listener: ListenerConfig, secure: bool) -> Client {
    let registries = Arc::new(Registries::new());

    let (dns_tx, mut dns_rx) = mpsc::channel::<DnsRequest>(32);
    let (mfa_tx, mut mfa_rx) = mpsc::channel::<MfaRequest>(32);
    let (queue_tx, mut queue_rx) = mpsc::channel::<QueueRequest>(32);
    let (auth_tx, mut auth_rx) = mpsc::channel::<AuthRequest>(32);
    let (dns_reply_tx, dns_reply_rx) = mpsc::channel(32);
    let (mfa_reply_tx, mfa_reply_rx) = mpsc::channel(32);
    let (queue_reply_tx, queue_reply_rx) = mpsc::channel(32);
    let (auth_reply_tx, auth_reply_rx) = mpsc::channel(32);

    spawn_routers(
        Arc::clone(&registries),
        PeerReplies {
            dns: dns_reply_rx,
            mfa: mfa_reply_rx,
            queue: queue_reply_rx,
            auth: auth_reply_rx,
        },
    );

    tokio::spawn(async move {
        while let Some(DnsRequest::Ptr { reqid, .. }) = dns_rx.recv().await {
            let _ = dns_reply_tx
                .send(DnsReply::Ptr {
                    reqid,
                    host: Some("client.example".to_string()),
                })
                .await;
        }
    });

    tokio::spawn(async move {
        while let Some(request) = mfa_rx.recv().await {
            let reply = match request {
                MfaRequest::Connect { reqid, .. } => Some(MfaReply::Connect {
                    reqid,
                    verdict: Verdict::ok(),
                }),
                MfaRequest::Helo { reqid, .. } => Some(MfaReply::Helo {
                    reqid,
                    verdict: Verdict::ok(),
                }),
                MfaRequest::Mail { reqid, .. } => Some(MfaReply::Mail {
                    reqid,
                    verdict: Verdict::ok(),
                }),
                _ => None,
            };
            if let Some(reply) = reply {
                let _ = mfa_reply_tx.send(reply).await;
            }
        }
    });

    // only message creation is exercised here
    tokio::spawn(async move {
        let mut next_msgid: u32 = 1;
        while let Some(request) = queue_rx.recv().await {
            if let QueueRequest::CreateMessage { reqid } = request {
                let msgid = next_msgid;
                next_msgid += 1;
                let _ = queue_reply_tx
                    .send(QueueReply::CreateMessage {
                        reqid,
                        evpid: Some((u64::from(msgid) << 32) | 1),
                    })
                    .await;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(request) = auth_rx.recv().await {
            let success = request.user == "user" && request.pass == "pass";
            let _ = auth_reply_tx
                .send(AuthReply {
                    reqid: request.reqid,
                    success,
                })
                .await;
        }
    });

    let config = SessionConfig {
        hostname: Arc::from("mail.example"),
        max_message_size: 1024,
        timeouts: Timeouts { session_secs: 5 },
        registries,
        peers: Peers {
            dns: dns_tx,
            mfa: mfa_tx,
            queue: queue_tx,
            auth: auth_tx,
        },
    };

    let listener = Arc::new(Listener::from_config(listener).unwrap());
    let (client, server) = duplex(8 * 1024);
    let mut session = Session::create(server, "192.0.2.1:34567".parse().unwrap(), listener, config);
    session.flags.secure = secure;
    tokio::spawn(session.run());

    let (reader, writer) = tokio::io::split(client);
    Client {
        reader: BufReader::new(reader),
        writer,
    }
}

fn auth_listener() -> ListenerConfig {
    ListenerConfig {
        socket: "127.0.0.1:0".parse().unwrap(),
        tag: "submission".to_string(),
        starttls: false,
        starttls_require: false,
        smtps: false,
        auth: true,
        auth_require: false,
        filter_dataline: false,
        tls: None,
    }
}

async fn greet(client: &mut Client) -> Vec<String> {
    client.expect("220 ").await;
    client.send("EHLO client.example").await;
    client.drain_ehlo().await
}

#[tokio::test]
async fn auth_is_advertised_on_a_secured_channel() {
    let mut client = start(auth_listener(), true).await;
    let block = greet(&mut client).await;
    assert!(block.contains(&"250-AUTH PLAIN LOGIN".to_string()));
}

#[tokio::test]
async fn auth_is_not_offered_in_the_clear() {
    let mut client = start(auth_listener(), false).await;
    let block = greet(&mut client).await;
    assert!(!block.iter().any(|l| l.contains("AUTH")));

    client.send("AUTH PLAIN AHVzZXIAcGFzcw==").await;
    client.expect("503 Command not supported").await;
}

#[tokio::test]
async fn plain_with_initial_response() {
    let mut client = start(auth_listener(), true).await;
    greet(&mut client).await;

    // "\0user\0pass"
    client.send("AUTH PLAIN AHVzZXIAcGFzcw==").await;
    client.expect("235 Authentication succeeded").await;

    client.send("AUTH PLAIN AHVzZXIAcGFzcw==").await;
    client.expect("503 Already authenticated").await;
}

#[tokio::test]
async fn plain_with_continuation() {
    let mut client = start(auth_listener(), true).await;
    greet(&mut client).await;

    client.send("AUTH PLAIN").await;
    client.expect("334 ").await;
    client.send("AHVzZXIAcGFzcw==").await;
    client.expect("235 Authentication succeeded").await;
}

#[tokio::test]
async fn plain_with_bad_credentials() {
    let mut client = start(auth_listener(), true).await;
    greet(&mut client).await;

    // "\0user\0wrong"
    client.send("AUTH PLAIN AHVzZXIAd3Jvbmc=").await;
    client.expect("535 Authentication failed").await;

    // a failure leaves the session usable
    client.send("NOOP").await;
    client.expect("250 2.0.0 Ok").await;
}

#[tokio::test]
async fn plain_rejects_malformed_blobs() {
    let mut client = start(auth_listener(), true).await;
    greet(&mut client).await;

    // not base64
    client.send("AUTH PLAIN !!!").await;
    client.expect("501 Syntax error").await;

    // missing NULs
    client.send("AUTH PLAIN dXNlcnBhc3M=").await;
    client.expect("501 Syntax error").await;

    // empty authcid and password
    client.send("AUTH PLAIN AAAA").await;
    client.expect("501 Syntax error").await;

    client.send("NOOP").await;
    client.expect("250 2.0.0 Ok").await;
}

#[tokio::test]
async fn login_prompts_for_both_halves() {
    let mut client = start(auth_listener(), true).await;
    greet(&mut client).await;

    client.send("AUTH LOGIN").await;
    client.expect("334 VXNlcm5hbWU6").await;
    client.send("dXNlcg==").await;
    client.expect("334 UGFzc3dvcmQ6").await;
    client.send("cGFzcw==").await;
    client.expect("235 Authentication succeeded").await;
}

#[tokio::test]
async fn unknown_mechanisms_are_refused() {
    let mut client = start(auth_listener(), true).await;
    greet(&mut client).await;

    client.send("AUTH CRAM-MD5").await;
    client.expect("504 AUTH method \"CRAM-MD5\" not supported").await;

    client.send("AUTH").await;
    client.expect("501 No parameters given").await;
}

#[tokio::test]
async fn auth_require_gates_mail() {
    let listener = ListenerConfig {
        auth_require: true,
        ..auth_listener()
    };
    let mut client = start(listener, true).await;
    greet(&mut client).await;

    client.send("MAIL FROM:<a@ex>").await;
    client
        .expect("530 5.7.0 Must issue an AUTH command first")
        .await;

    client.send("AUTH PLAIN AHVzZXIAcGFzcw==").await;
    client.expect("235 Authentication succeeded").await;

    client.send("MAIL FROM:<a@ex>").await;
    client.expect("250 Ok").await;
}
