//! End-to-end tests over real sockets.
//!
//! Each test builds an in-process server on an ephemeral port with a
//! throwaway store and a stubbed resolver, then drives it through a raw
//! TCP (or TLS) client. Outbound forwarding talks to a scripted fake
//! downstream SMTP server, so no test touches the network or the DNS.
//!
//! Everything runs on a `LocalSet`, matching the single-threaded
//! scheduling of the real binary.

use std::cell::RefCell;
use std::net::TcpListener as StdTcpListener;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::LocalSet;

use postfach::config::{Config, UserTable};
use postfach::dns::HostCheck;
use postfach::mailbox::MailStore;
use postfach::{pop3, smtp, tls, Ctx, Shared};

// base64("\0jan\0secret")
const JAN_PLAIN: &str = "AGphbgBzZWNyZXQ=";

/// Resolver stub: every host has an address, nothing has an MX.
struct AllHosts;

#[async_trait(?Send)]
impl HostCheck for AllHosts {
    async fn resolves(&self, _host: &str) -> bool {
        true
    }
    async fn best_mx(&self, _domain: &str) -> Option<String> {
        None
    }
}

fn get_free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind to port 0");
    listener.local_addr().unwrap().port()
}

fn make_ctx(smtp_port: u16, pop3_port: u16, pop3s_port: u16, relayhost: Option<String>) -> Ctx {
    let mut users = UserTable::default();
    users.insert("jan", "secret");
    let config = Config {
        smtp_port,
        pop3_port,
        pop3s_port,
        bind_address: "127.0.0.1".to_string(),
        hostname: "myhost".to_string(),
        relayhost,
        dbfile: PathBuf::new(),
        tls_cert_file: PathBuf::new(),
        tls_ca_file: PathBuf::new(),
    };
    Rc::new(Shared {
        config,
        users: RefCell::new(users),
        store: MailStore::temporary().unwrap(),
        dns: Rc::new(AllHosts),
    })
}

async fn wait_for_port(port: u16) {
    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server on port {} did not become ready", port);
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Line-oriented test client over any stream.
struct MailClient<S> {
    reader: BufReader<tokio::io::ReadHalf<S>>,
    writer: tokio::io::WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite> MailClient<S> {
    fn new(stream: S) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        MailClient { reader: BufReader::new(read_half), writer }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(format!("{}\r\n", line).as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await.unwrap();
        (n > 0).then(|| line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn expect(&mut self, prefix: &str) -> String {
        let line = self.recv().await.unwrap_or_else(|| panic!("EOF, expected {:?}", prefix));
        assert!(line.starts_with(prefix), "expected {:?}, got {:?}", prefix, line);
        line
    }
}

async fn smtp_client(ctx: &Ctx) -> MailClient<TcpStream> {
    let server = smtp::Server::new(ctx.clone());
    tokio::task::spawn_local(async move { server.run().await });
    wait_for_port(ctx.config.smtp_port).await;
    let stream = TcpStream::connect(("127.0.0.1", ctx.config.smtp_port)).await.unwrap();
    let mut client = MailClient::new(stream);
    client.expect("220 myhost SMTP Relay").await;
    client
}

async fn pop3_client(ctx: &Ctx) -> MailClient<TcpStream> {
    let stream = TcpStream::connect(("127.0.0.1", ctx.config.pop3_port)).await.unwrap();
    let mut client = MailClient::new(stream);
    client.expect("+OK myhost POP3-Server").await;
    client
}

/// Per-connection behavior of the fake downstream SMTP server.
#[derive(Clone, Copy)]
enum FakeBehavior {
    Accept,
    RejectRcpt,
}

/// Starts a scripted downstream SMTP server; connection `i` follows
/// `scripts[i]` (later connections accept). Returns its port and the
/// transcripts of every finished connection.
async fn spawn_fake_downstream(scripts: Vec<FakeBehavior>) -> (u16, Rc<RefCell<Vec<Vec<String>>>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let transcripts: Rc<RefCell<Vec<Vec<String>>>> = Rc::new(RefCell::new(Vec::new()));

    let recorded = transcripts.clone();
    tokio::task::spawn_local(async move {
        let mut scripts = scripts.into_iter();
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let behavior = scripts.next().unwrap_or(FakeBehavior::Accept);
            let mut transcript = Vec::new();
            fake_smtp_session(stream, behavior, &mut transcript).await;
            recorded.borrow_mut().push(transcript);
        }
    });

    (port, transcripts)
}

async fn fake_smtp_session(stream: TcpStream, behavior: FakeBehavior, transcript: &mut Vec<String>) {
    let mut client = MailClient::new(stream);
    client.send("220 fake ESMTP").await;

    while let Some(line) = client.recv().await {
        transcript.push(line.clone());
        let upper = line.to_uppercase();
        if upper.starts_with("HELO") {
            client.send("250 fake").await;
        } else if upper.starts_with("MAIL FROM") {
            client.send("250 OK").await;
        } else if upper.starts_with("RCPT TO") {
            match behavior {
                FakeBehavior::Accept => client.send("250 OK").await,
                FakeBehavior::RejectRcpt => client.send("550 no such mailbox").await,
            }
        } else if upper.starts_with("DATA") {
            client.send("354 go ahead").await;
            while let Some(body_line) = client.recv().await {
                if body_line == "." {
                    break;
                }
                transcript.push(body_line);
            }
            client.send("250 queued").await;
        } else if upper.starts_with("QUIT") {
            client.send("221 bye").await;
            break;
        } else {
            client.send("500 what").await;
        }
    }
}

// --- SMTP scenarios ---

#[tokio::test]
async fn local_delivery_roundtrip() {
    LocalSet::new()
        .run_until(async {
            let ctx = make_ctx(get_free_port(), 0, 0, None);
            let mut client = smtp_client(&ctx).await;

            client.send("HELO host").await;
            client.expect("250 Hello host!").await;
            client.send("MAIL FROM:<al@elsewhere>").await;
            client.expect("250 Sender al@elsewhere OK").await;
            client.send("RCPT TO:<jan@myhost>").await;
            client.expect("250 RCPT jan@myhost seems to be OK").await;
            client.send("DATA").await;
            client.expect("250 Waiting for Data").await;
            client.send("hello").await;
            client.send(".").await;
            client.expect("250 Message accepted and delivered").await;
            client.send("QUIT").await;
            client.expect("221 Bye").await;

            let view = ctx.store.open_mailbox("jan").unwrap();
            assert_eq!(view.stat().0, 1);
            let bytes = ctx.store.fetch(view.slot(1).unwrap().id).unwrap().unwrap();
            assert_eq!(bytes, b"hello\r\n");
        })
        .await;
}

#[tokio::test]
async fn unauthenticated_relay_is_denied() {
    LocalSet::new()
        .run_until(async {
            let ctx = make_ctx(get_free_port(), 0, 0, None);
            let mut client = smtp_client(&ctx).await;

            client.send("HELO host").await;
            client.expect("250").await;
            client.send("MAIL FROM:<ab@b>").await;
            client.expect("250 Sender").await;
            client.send("RCPT TO:<cc@other>").await;
            client.expect("554 Relay access denied").await;

            // The session stayed in the post-MAIL state: a local recipient
            // still goes through.
            client.send("RCPT TO:<jan@myhost>").await;
            client.expect("250 RCPT").await;
        })
        .await;
}

#[tokio::test]
async fn authenticated_relay_reaches_the_downstream() {
    LocalSet::new()
        .run_until(async {
            let (fake_port, transcripts) = spawn_fake_downstream(vec![FakeBehavior::Accept]).await;
            let ctx =
                make_ctx(get_free_port(), 0, 0, Some(format!("127.0.0.1:{}", fake_port)));
            let mut client = smtp_client(&ctx).await;

            client.send("EHLO host").await;
            client.expect("250-Hello host!").await;
            client.expect("250 AUTH PLAIN").await;
            client.send(&format!("AUTH PLAIN {}", JAN_PLAIN)).await;
            client.expect("235 Authentication successful").await;
            client.send("MAIL FROM:<jan@myhost>").await;
            client.expect("250 Sender").await;
            client.send("RCPT TO:<xx@other>").await;
            client.expect("250 RCPT").await;
            client.send("DATA").await;
            client.expect("250 Waiting for Data").await;
            client.send("Subject: relayed").await;
            client.send("").await;
            client.send("hello downstream").await;
            client.send(".").await;
            client.expect("250 Message accepted and forwarded").await;

            wait_until(|| {
                transcripts.borrow().iter().any(|t| t.iter().any(|l| l.starts_with("QUIT")))
            })
            .await;

            let transcripts = transcripts.borrow();
            let session = &transcripts[0];
            assert!(session.contains(&"MAIL FROM:<jan@myhost>".to_string()));
            assert!(session.contains(&"RCPT TO:<xx@other>".to_string()));
            assert!(session.contains(&"Subject: relayed".to_string()));
            assert!(session.contains(&"hello downstream".to_string()));
        })
        .await;
}

#[tokio::test]
async fn downstream_rejection_produces_a_bounce() {
    LocalSet::new()
        .run_until(async {
            let (fake_port, transcripts) =
                spawn_fake_downstream(vec![FakeBehavior::RejectRcpt, FakeBehavior::Accept]).await;
            let ctx =
                make_ctx(get_free_port(), 0, 0, Some(format!("127.0.0.1:{}", fake_port)));
            let mut client = smtp_client(&ctx).await;

            client.send("EHLO host").await;
            client.expect("250-").await;
            client.expect("250 AUTH PLAIN").await;
            client.send(&format!("AUTH PLAIN {}", JAN_PLAIN)).await;
            client.expect("235").await;
            client.send("MAIL FROM:<jan@myhost>").await;
            client.expect("250 Sender").await;
            client.send("RCPT TO:<nobody@faraway>").await;
            client.expect("250 RCPT").await;
            client.send("DATA").await;
            client.expect("250 Waiting for Data").await;
            client.send("original content").await;
            client.send(".").await;
            client.expect("250 Message accepted and forwarded").await;

            // First conversation fails at RCPT; the bounce job is the
            // second conversation and runs to completion.
            wait_until(|| transcripts.borrow().len() >= 2).await;
            wait_until(|| {
                transcripts.borrow()[1].iter().any(|l| l.starts_with("QUIT"))
            })
            .await;

            let transcripts = transcripts.borrow();
            let bounce = &transcripts[1];
            assert!(bounce.contains(&"MAIL FROM:<postmaster@myhost>".to_string()));
            assert!(bounce.contains(&"RCPT TO:<jan@myhost>".to_string()));
            assert!(bounce
                .contains(&"From: \"Mail Delivery System\" postmaster@myhost".to_string()));
            assert!(bounce.contains(&"Subject: Undelivered Mail Returned to Sender".to_string()));
            assert!(bounce.contains(&"550 no such mailbox".to_string()));
            assert!(bounce.contains(&"original content".to_string()));
        })
        .await;
}

// --- POP3 scenarios ---

#[tokio::test]
async fn pop3_stat_list_dele_quit_commits() {
    LocalSet::new()
        .run_until(async {
            let ctx = make_ctx(0, get_free_port(), 0, None);
            ctx.store.push("jan", &vec![b'a'; 100]).unwrap();
            ctx.store.push("jan", &vec![b'b'; 200]).unwrap();

            let server = pop3::Server::plain(ctx.clone());
            tokio::task::spawn_local(async move { server.run().await });
            wait_for_port(ctx.config.pop3_port).await;

            let mut client = pop3_client(&ctx).await;
            client.send("USER jan").await;
            client.expect("+OK Please enter passwd").await;
            client.send("PASS secret").await;
            client.expect("+OK Mailbox locked").await;
            client.send("STAT").await;
            client.expect("+OK 2 300").await;
            client.send("LIST").await;
            client.expect("+OK 2 messages (300 Octets)").await;
            client.expect("1 100").await;
            client.expect("2 200").await;
            client.expect(".").await;
            client.send("RETR 2").await;
            client.expect("+OK 200 Octets").await;
            client.expect(&"b".repeat(200)).await;
            client.expect(".").await;
            client.send("DELE 1").await;
            client.expect("+OK Message 1 deleted").await;
            client.send("QUIT").await;
            client.expect("+OK Bye").await;

            wait_until(|| !ctx.users.borrow().is_locked("jan")).await;
            let after = ctx.store.open_mailbox("jan").unwrap();
            assert_eq!(after.stat(), (1, 200));
        })
        .await;
}

#[tokio::test]
async fn pop3_lock_contention_refuses_the_second_session() {
    LocalSet::new()
        .run_until(async {
            let ctx = make_ctx(0, get_free_port(), 0, None);
            let server = pop3::Server::plain(ctx.clone());
            tokio::task::spawn_local(async move { server.run().await });
            wait_for_port(ctx.config.pop3_port).await;

            let mut first = pop3_client(&ctx).await;
            first.send("USER jan").await;
            first.expect("+OK").await;
            first.send("PASS secret").await;
            first.expect("+OK Mailbox locked").await;

            let mut second = pop3_client(&ctx).await;
            second.send("USER jan").await;
            second.expect("+OK").await;
            second.send("PASS secret").await;
            second.expect("-ERR Cannot lock mailbox").await;
            // The loser's connection is closed by the server.
            assert_eq!(second.recv().await, None);

            // The holder keeps working and releases the lock on QUIT.
            first.send("STAT").await;
            first.expect("+OK 0 0").await;
            first.send("QUIT").await;
            first.expect("+OK Bye").await;

            wait_until(|| !ctx.users.borrow().is_locked("jan")).await;
        })
        .await;
}

#[tokio::test]
async fn pop3s_serves_the_same_protocol_over_tls() {
    LocalSet::new()
        .run_until(async {
            tls::install_crypto_provider();

            // Self-signed server material, trusted by the test client.
            let signed =
                rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
            let pem_path = std::env::temp_dir()
                .join(format!("postfach-pop3s-{}.pem", std::process::id()));
            std::fs::write(
                &pem_path,
                format!("{}{}", signed.cert.pem(), signed.key_pair.serialize_pem()),
            )
            .unwrap();
            let acceptor = tls::load_acceptor(&pem_path, None).unwrap();
            std::fs::remove_file(&pem_path).ok();

            let ctx = make_ctx(0, 0, get_free_port(), None);
            ctx.store.push("jan", b"Subject: tls\r\n\r\nover tls\r\n").unwrap();
            let server = pop3::Server::tls(ctx.clone(), acceptor);
            tokio::task::spawn_local(async move { server.run().await });
            wait_for_port(ctx.config.pop3s_port).await;

            let mut roots = rustls::RootCertStore::empty();
            roots.add(signed.cert.der().clone()).unwrap();
            let client_config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

            let tcp = TcpStream::connect(("127.0.0.1", ctx.config.pop3s_port)).await.unwrap();
            let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
            let stream = connector.connect(server_name, tcp).await.unwrap();

            let mut client = MailClient::new(stream);
            client.expect("+OK myhost POP3-Server").await;
            client.send("USER jan").await;
            client.expect("+OK").await;
            client.send("PASS secret").await;
            client.expect("+OK Mailbox locked").await;
            client.send("RETR 1").await;
            client.expect("+OK").await;
            client.expect("Subject: tls").await;
            client.expect("").await;
            client.expect("over tls").await;
            client.expect(".").await;
            client.send("QUIT").await;
            client.expect("+OK Bye").await;
        })
        .await;
}
