//! Runtime configuration loaded from the command line.
//!
//! This module defines the CLI option surface (`Options`), the resolved
//! `Config` consumed by the rest of the application, and the `UserTable`
//! holding the locally provisioned users together with their mailbox lock
//! flags. Users come from a CSV file with one `name<TAB>password` record
//! per line.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Default listening ports: SMTP, POP3, POP3S.
pub const DEFAULT_PORTS: (u16, u16, u16) = (25, 110, 995);

/// Combined PEM with the server certificate chain and private key.
pub const DEFAULT_CERT_FILE: &str = "comb.pem";

/// PEM with the CA chain presented alongside the server certificate.
pub const DEFAULT_CA_FILE: &str = "cacert.pem";

/// Command-line options.
///
/// `-h` and `-V` are handled by clap itself and exit the process with
/// status 0 after printing help or version information.
#[derive(Debug, Parser)]
#[command(name = "postfach", version, about = "SMTP/POP3/POP3S mail relay for a fixed local user set")]
pub struct Options {
    /// Ports for the SMTP, POP3 and POP3S listeners.
    #[arg(short = 'p', value_name = "SMTP,POP3,POP3S")]
    pub ports: Option<String>,

    /// CSV file with one "user<TAB>password" record per line.
    #[arg(short = 'u', value_name = "FILE")]
    pub user_file: PathBuf,

    /// Hostname of this server; must resolve.
    #[arg(short = 'H', value_name = "HOST")]
    pub hostname: Option<String>,

    /// Relay all non-local mail to this host instead of the recipient's MX.
    #[arg(short = 'R', value_name = "HOST[:PORT]")]
    pub relayhost: Option<String>,

    /// Path of the mailbox store.
    #[arg(short = 'd', value_name = "PATH")]
    pub dbfile: Option<PathBuf>,
}

/// Resolved application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Port of the SMTP listener.
    pub smtp_port: u16,
    /// Port of the plaintext POP3 listener.
    pub pop3_port: u16,
    /// Port of the TLS-wrapped POP3 listener.
    pub pop3s_port: u16,
    /// Address all three listeners bind to.
    pub bind_address: String,
    /// The local hostname; a recipient is local iff its domain equals this.
    pub hostname: String,
    /// Fixed downstream relay, optionally with an explicit port.
    pub relayhost: Option<String>,
    /// Path of the mailbox store.
    pub dbfile: PathBuf,
    /// Combined certificate chain + private key PEM for POP3S.
    pub tls_cert_file: PathBuf,
    /// CA chain PEM appended to the presented certificate chain.
    pub tls_ca_file: PathBuf,
}

impl Config {
    /// Builds the configuration and the user table from parsed options.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if the port tuple is malformed, the user CSV cannot
    /// be opened, or a hostname given with `-H`/`-R` does not resolve. Any
    /// of these is a startup failure; the caller exits non-zero.
    pub fn from_options(opts: &Options) -> Result<(Self, UserTable)> {
        let (smtp_port, pop3_port, pop3s_port) = match &opts.ports {
            Some(tuple) => parse_ports(tuple)?,
            None => DEFAULT_PORTS,
        };

        let hostname = match &opts.hostname {
            Some(host) => {
                if !host_resolves(host) {
                    return Err(anyhow!("hostname '{}' does not resolve", host));
                }
                host.clone()
            }
            None => "localhost".to_string(),
        };

        if let Some(relay) = &opts.relayhost {
            let host = relay.rsplit_once(':').map_or(relay.as_str(), |(h, _)| h);
            if !host_resolves(host) {
                return Err(anyhow!("relay host '{}' does not resolve", host));
            }
        }

        let users = UserTable::from_csv(&opts.user_file)
            .with_context(|| format!("cannot load user file {}", opts.user_file.display()))?;
        info!("Config: loaded {} users from {}", users.len(), opts.user_file.display());

        let config = Config {
            smtp_port,
            pop3_port,
            pop3s_port,
            bind_address: "0.0.0.0".to_string(),
            hostname,
            relayhost: opts.relayhost.clone(),
            dbfile: opts.dbfile.clone().unwrap_or_else(|| PathBuf::from("mailboxes.db")),
            tls_cert_file: PathBuf::from(DEFAULT_CERT_FILE),
            tls_ca_file: PathBuf::from(DEFAULT_CA_FILE),
        };
        info!(
            "Config: listening on {} ports {}/{}/{} as '{}'",
            config.bind_address, config.smtp_port, config.pop3_port, config.pop3s_port, config.hostname
        );

        Ok((config, users))
    }
}

/// Parses the `-p smtp,pop3,pop3s` tuple. Exactly three fields, each a
/// valid port in 1..=65535.
pub fn parse_ports(tuple: &str) -> Result<(u16, u16, u16)> {
    let fields: Vec<&str> = tuple.split(',').collect();
    if fields.len() != 3 {
        return Err(anyhow!("expected three comma-separated ports, got '{}'", tuple));
    }
    let mut ports = [0u16; 3];
    for (slot, field) in ports.iter_mut().zip(&fields) {
        let port: u16 = field
            .trim()
            .parse()
            .map_err(|_| anyhow!("'{}' is not a valid port number", field))?;
        if port == 0 {
            return Err(anyhow!("'{}' is not a valid port number", field));
        }
        *slot = port;
    }
    Ok((ports[0], ports[1], ports[2]))
}

/// Checks whether a hostname resolves via the system resolver.
///
/// Used only for startup validation of `-H` and `-R`; runtime address
/// checks go through [`crate::dns`].
fn host_resolves(host: &str) -> bool {
    (host, 0u16).to_socket_addrs().map(|mut a| a.next().is_some()).unwrap_or(false)
}

#[derive(Debug)]
struct UserEntry {
    password: String,
    locked: bool,
}

/// The local user table, doubling as the mailbox lock table.
///
/// User names are stored lowercased and every lookup lowercases its
/// argument, so matching is case-insensitive throughout. The lock flag
/// guards a user's mailbox against concurrent POP3 sessions; it is only
/// ever flipped on the event-loop thread.
#[derive(Debug, Default)]
pub struct UserTable {
    users: HashMap<String, UserEntry>,
}

impl UserTable {
    /// Loads the table from a `name<TAB>password` CSV file.
    ///
    /// Lines without a TAB-separated pair are skipped silently, matching
    /// the file format contract. Passwords are stored as-is.
    pub fn from_csv(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut table = UserTable::default();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let Some((name, password)) = line.split_once('\t') else {
                if !line.is_empty() {
                    warn!("skipping malformed user record: {:?}", line);
                }
                continue;
            };
            let (name, password) = (name.trim(), password.trim_end_matches('\r'));
            if name.is_empty() || password.is_empty() {
                continue;
            }
            table.insert(name, password);
        }
        Ok(table)
    }

    /// Adds a user; the name is lowercased. Later records win.
    pub fn insert(&mut self, name: &str, password: &str) {
        self.users.insert(
            name.to_lowercase(),
            UserEntry { password: password.to_string(), locked: false },
        );
    }

    /// Whether the user exists locally.
    pub fn has(&self, name: &str) -> bool {
        self.users.contains_key(&name.to_lowercase())
    }

    /// Verifies a plaintext password for the user.
    pub fn verify(&self, name: &str, password: &str) -> bool {
        self.users
            .get(&name.to_lowercase())
            .map(|u| u.password == password)
            .unwrap_or(false)
    }

    /// Whether the user's mailbox is currently locked.
    pub fn is_locked(&self, name: &str) -> bool {
        self.users
            .get(&name.to_lowercase())
            .map(|u| u.locked)
            .unwrap_or(false)
    }

    /// Takes the mailbox lock. Returns `false` if the user is unknown or
    /// the lock is already held.
    pub fn lock(&mut self, name: &str) -> bool {
        match self.users.get_mut(&name.to_lowercase()) {
            Some(user) if !user.locked => {
                user.locked = true;
                true
            }
            _ => false,
        }
    }

    /// Releases the mailbox lock.
    pub fn unlock(&mut self, name: &str) {
        if let Some(user) = self.users.get_mut(&name.to_lowercase()) {
            user.locked = false;
        }
    }

    /// Number of provisioned users.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
