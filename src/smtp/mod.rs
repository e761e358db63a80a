//! The SMTP listener: accepts connections, frames lines, and feeds them to
//! the per-session protocol state machine in `protocol.rs`. Mail for local
//! users goes to the mailbox store; everything else is handed to the
//! forwarder.

mod protocol;

use anyhow::{Context, Result};
use log::{debug, error, info, trace};
use tokio::net::TcpStream;

use crate::net::LineReader;
use crate::{Action, Ctx};
use protocol::SmtpProtocol;

/// The SMTP server instance.
pub struct Server {
    ctx: Ctx,
}

impl Server {
    pub fn new(ctx: Ctx) -> Self {
        Server { ctx }
    }

    /// Binds the SMTP listener and accepts connections forever. Each
    /// connection becomes its own task on the event-loop thread; accept
    /// errors are logged and do not stop the listener.
    ///
    /// # Errors
    ///
    /// Returns an `Err` only if the initial bind fails.
    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.ctx.config.bind_address, self.ctx.config.smtp_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("cannot bind SMTP listener to {}", addr))?;
        info!("SMTP server listening on {}", addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("SMTP: new connection from {}", peer);
                    let ctx = self.ctx.clone();
                    tokio::task::spawn_local(async move {
                        if let Err(e) = handle_connection(ctx, stream).await {
                            debug!("SMTP connection from {} ended: {:#}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("SMTP: error accepting connection: {:?}", e);
                }
            }
        }
    }
}

/// Runs one SMTP conversation until QUIT, peer close, or a write failure.
async fn handle_connection(ctx: Ctx, stream: TcpStream) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = LineReader::new(read_half);
    let mut protocol = SmtpProtocol::new(ctx, write_half);

    protocol.send_greeting().await?;
    loop {
        trace!("SMTP({:?}): waiting for command", protocol.state());
        let Some(line) = reader.read_line().await? else {
            break;
        };
        if protocol.handle_line(&line).await? == Action::Quit {
            break;
        }
    }
    debug!("SMTP: closing connection");
    Ok(())
}
