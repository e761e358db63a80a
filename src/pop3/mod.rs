//! The POP3 and POP3S listeners.
//!
//! Both flavors share one `Server` type: the TLS variant carries an
//! acceptor and runs the handshake synchronously after accept, before any
//! session state exists. From there on a TLS stream and a plain socket are
//! the same thing — an `AsyncRead + AsyncWrite` fed through the line
//! framer into the protocol machine in `protocol.rs`.

mod protocol;

use anyhow::{Context, Result};
use log::{debug, error, info, trace};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::net::LineReader;
use crate::{Action, Ctx};
use protocol::Pop3Protocol;

/// A POP3 server instance, plaintext or TLS-wrapped.
pub struct Server {
    ctx: Ctx,
    port: u16,
    acceptor: Option<TlsAcceptor>,
}

impl Server {
    /// The plaintext POP3 listener.
    pub fn plain(ctx: Ctx) -> Self {
        let port = ctx.config.pop3_port;
        Server { ctx, port, acceptor: None }
    }

    /// The POP3S listener: identical framing, wrapped in TLS from accept.
    pub fn tls(ctx: Ctx, acceptor: TlsAcceptor) -> Self {
        let port = ctx.config.pop3s_port;
        Server { ctx, port, acceptor: Some(acceptor) }
    }

    fn name(&self) -> &'static str {
        if self.acceptor.is_some() {
            "POP3S"
        } else {
            "POP3"
        }
    }

    /// Binds the listener and accepts connections forever. Handshake and
    /// session errors are logged per connection; only the bind can fail.
    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.ctx.config.bind_address, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("cannot bind {} listener to {}", self.name(), addr))?;
        info!("{} server listening on {}", self.name(), addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("{}: new connection from {}", self.name(), peer);
                    let ctx = self.ctx.clone();
                    let acceptor = self.acceptor.clone();
                    let name = self.name();
                    tokio::task::spawn_local(async move {
                        if let Err(e) = handle_connection(ctx, stream, acceptor).await {
                            debug!("{} connection from {} ended: {:#}", name, peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("{}: error accepting connection: {:?}", self.name(), e);
                }
            }
        }
    }
}

/// Performs the optional TLS handshake, then serves the session. A failed
/// handshake tears the connection down before any session exists.
async fn handle_connection(ctx: Ctx, stream: TcpStream, acceptor: Option<TlsAcceptor>) -> Result<()> {
    match acceptor {
        Some(acceptor) => {
            let tls = acceptor.accept(stream).await.context("TLS handshake failed")?;
            serve(ctx, tls).await
        }
        None => serve(ctx, stream).await,
    }
}

/// Runs one POP3 conversation. Whatever way it ends, the mailbox lock is
/// released and uncommitted deletion marks are discarded; the writer is
/// shut down gracefully (close_notify on TLS) afterwards.
async fn serve<S>(ctx: Ctx, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = LineReader::new(read_half);
    let mut protocol = Pop3Protocol::new(ctx, write_half);

    let result = drive(&mut reader, &mut protocol).await;
    protocol.finish();
    protocol.shutdown().await.ok();
    debug!("POP3: closing connection");
    result
}

async fn drive<R, W>(reader: &mut LineReader<R>, protocol: &mut Pop3Protocol<W>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: tokio::io::AsyncWriteExt + Unpin,
{
    protocol.send_greeting().await?;
    loop {
        trace!("POP3({:?}): waiting for command", protocol.state());
        let Some(line) = reader.read_line().await? else {
            break;
        };
        if protocol.handle_line(&line).await? == Action::Quit {
            break;
        }
    }
    Ok(())
}
