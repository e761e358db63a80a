//! Orchestrates the postfach mail server startup and component lifecycle.
//!
//! This library crate wires the pieces together: it opens the mailbox
//! store, loads the TLS material, builds the shared per-process context,
//! and runs the three listeners — SMTP, POP3 and POP3S — as tasks on one
//! current-thread runtime. The whole server is cooperatively scheduled on
//! that single thread: sessions and outbound forward jobs are `spawn_local`
//! tasks, shared state lives in `Rc`/`RefCell`, and no two of them ever
//! run at the same time.

pub mod config;
pub mod dns;
pub mod forward;
pub mod mailbox;
pub mod net;
pub mod pop3;
pub mod smtp;
pub mod tls;

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use log::{error, info};
use tokio::select;

use config::{Config, UserTable};
use dns::{DnsCheck, HostCheck};
use mailbox::MailStore;

/// What a session state machine wants done with its connection after a
/// line has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep reading.
    Continue,
    /// Close the connection and destroy the session.
    Quit,
}

/// Process-wide state shared by every session on the event-loop thread.
pub struct Shared {
    pub config: Config,
    /// User table and mailbox lock flags.
    pub users: RefCell<UserTable>,
    /// The persistent mail store.
    pub store: MailStore,
    /// Host resolution capability; stubbed out in tests.
    pub dns: Rc<dyn HostCheck>,
}

/// Shared context handle passed to every component.
pub type Ctx = Rc<Shared>;

/// Runs the mail server until a fatal error or a termination signal.
///
/// Must be called from within a `tokio::task::LocalSet` on a
/// current-thread runtime. Returns `Ok(())` on signal-driven shutdown;
/// any listener going down is a fatal error.
pub async fn run(config: Config, users: UserTable) -> Result<()> {
    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    tls::install_crypto_provider();

    let store = MailStore::open(&config.dbfile)?;
    let acceptor = tls::load_acceptor(
        &config.tls_cert_file,
        config.tls_ca_file.exists().then(|| config.tls_ca_file.as_path()),
    )?;
    let dns = Rc::new(DnsCheck::from_system()?);
    let ctx: Ctx = Rc::new(Shared { config, users: RefCell::new(users), store, dns });

    let smtp_server = smtp::Server::new(ctx.clone());
    let pop3_server = pop3::Server::plain(ctx.clone());
    let pop3s_server = pop3::Server::tls(ctx.clone(), acceptor);

    let smtp_handle = tokio::task::spawn_local(async move { smtp_server.run().await });
    let pop3_handle = tokio::task::spawn_local(async move { pop3_server.run().await });
    let pop3s_handle = tokio::task::spawn_local(async move { pop3s_server.run().await });

    // The listeners run forever; whichever finishes first took the whole
    // application down with it. A termination signal wins the race and
    // shuts down cleanly.
    let result = select! {
        res = smtp_handle => server_exit("SMTP", res),
        res = pop3_handle => server_exit("POP3", res),
        res = pop3s_handle => server_exit("POP3S", res),
        _ = shutdown_signal() => {
            info!("termination signal received, shutting down");
            Ok(())
        }
    };

    ctx.store.flush()?;
    result
}

/// Maps the join result of a listener task to the application error.
fn server_exit(name: &str, res: Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(Ok(())) => {
            error!("{} server exited cleanly, which is unexpected", name);
            Err(anyhow!("{} server exited unexpectedly", name))
        }
        Ok(Err(e)) => {
            error!("{} server failed: {:#}", name, e);
            Err(e)
        }
        Err(join_error) => {
            error!("{} server task failed (panic or cancellation): {}", name, join_error);
            Err(anyhow!("{} server task failed: {}", name, join_error))
        }
    }
}

/// Completes on SIGINT, SIGTERM or SIGQUIT.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::SignalKind;
        select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = unix_signal(SignalKind::terminate()) => {}
            _ = unix_signal(SignalKind::quit()) => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Waits for one delivery of the given unix signal. Never completes if
/// the handler cannot be installed, leaving the other signals usable.
#[cfg(unix)]
async fn unix_signal(kind: tokio::signal::unix::SignalKind) {
    match tokio::signal::unix::signal(kind) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            error!("cannot install handler for signal {:?}: {}", kind, e);
            std::future::pending::<()>().await;
        }
    }
}
