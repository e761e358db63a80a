//! The SMTP server state machine.
//!
//! One `SmtpProtocol` per accepted connection. It owns the write side and
//! the whole session state; the connection handler feeds it one framed
//! line at a time and closes the connection when `Action::Quit` comes
//! back. Replies are written inline, so a failed write surfaces as an
//! error and ends the session.
//!
//! Plain sessions may only deliver to local users; relaying to the
//! outside requires an ESMTP session authenticated with AUTH PLAIN.

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;

use crate::dns::{check_mail_addr, MailAddr};
use crate::{forward, Action, Ctx};

/// States of an SMTP session. Pre-DATA states are named after the last
/// accepted command.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SmtpState {
    /// Fresh connection, greeting sent, waiting for HELO/EHLO.
    New,
    /// Greeted (or transaction finished), waiting for MAIL FROM.
    Helo,
    /// EHLO seen, waiting for AUTH PLAIN.
    Ehlo,
    /// Envelope sender accepted, waiting for RCPT TO.
    From,
    /// Recipient accepted, waiting for DATA.
    Rcpt,
    /// Consuming body lines until the lone-dot terminator.
    Data,
    /// AUTH challenge sent, next line is the credential blob.
    Auth,
}

/// Plain SMTP or extended (EHLO) session. Only ESMTP sessions can
/// authenticate.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SessionKind {
    Smtp,
    Esmtp,
}

/// Manages the state and the write side of one SMTP connection.
///
/// Generic over the writer so tests can capture the wire output.
pub struct SmtpProtocol<W: AsyncWriteExt + Unpin> {
    writer: W,
    ctx: Ctx,
    state: SmtpState,
    kind: SessionKind,
    authenticated: bool,
    user: Option<String>,
    peer_host: Option<String>,
    from: Option<MailAddr>,
    rcpt: Option<MailAddr>,
    rcpt_local: bool,
    body: Vec<String>,
}

impl<W: AsyncWriteExt + Unpin> SmtpProtocol<W> {
    pub fn new(ctx: Ctx, writer: W) -> Self {
        SmtpProtocol {
            writer,
            ctx,
            state: SmtpState::New,
            kind: SessionKind::Smtp,
            authenticated: false,
            user: None,
            peer_host: None,
            from: None,
            rcpt: None,
            rcpt_local: false,
            body: Vec::new(),
        }
    }

    /// Sends the `220` service greeting; called right after accept.
    pub async fn send_greeting(&mut self) -> Result<()> {
        let greeting = format!("220 {} SMTP Relay ready", self.ctx.config.hostname);
        self.write_line(&greeting).await
    }

    /// Processes one framed command or body line.
    pub async fn handle_line(&mut self, line: &str) -> Result<Action> {
        debug!("SMTP({:?}): {:?}", self.state, line);
        match self.state {
            SmtpState::New => self.on_new(line).await,
            SmtpState::Ehlo => self.on_ehlo(line).await,
            SmtpState::Auth => self.on_auth_blob(line).await,
            SmtpState::Helo => self.on_helo(line).await,
            SmtpState::From => self.on_from(line).await,
            SmtpState::Rcpt => self.on_rcpt(line).await,
            SmtpState::Data => self.on_data(line).await,
        }
    }

    /// Current state, for the connection handler and tests.
    pub fn state(&self) -> SmtpState {
        self.state
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        debug!("SMTP > {}", line);
        self.writer.write_all(format!("{}\r\n", line).as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Waiting for HELO or EHLO.
    async fn on_new(&mut self, line: &str) -> Result<Action> {
        if let Some(host) = command_arg(line, "EHLO", ' ') {
            let host = host.to_string();
            self.write_line(&format!("250-Hello {}!", host)).await?;
            self.write_line("250 AUTH PLAIN").await?;
            self.kind = SessionKind::Esmtp;
            self.state = SmtpState::Ehlo;
            self.peer_host = Some(host);
            Ok(Action::Continue)
        } else if let Some(host) = command_arg(line, "HELO", ' ') {
            let host = host.to_string();
            self.write_line(&format!("250 Hello {}!", host)).await?;
            self.state = SmtpState::Helo;
            self.peer_host = Some(host);
            Ok(Action::Continue)
        } else if starts_with_ci(line, "HELO") || starts_with_ci(line, "EHLO") {
            self.write_line("501 syntax error in parameters or arguments").await?;
            Ok(Action::Continue)
        } else {
            self.universal(line).await
        }
    }

    /// ESMTP session waiting for AUTH.
    async fn on_ehlo(&mut self, line: &str) -> Result<Action> {
        if is_command(line, "AUTH PLAIN") {
            // Challenge form: empty 334, credentials on the next line.
            self.write_line("334 ").await?;
            self.state = SmtpState::Auth;
            Ok(Action::Continue)
        } else if let Some(blob) = command_arg(line, "AUTH PLAIN", ' ') {
            if self.check_credentials(blob) {
                self.write_line("235 Authentication successful").await?;
                self.state = SmtpState::Helo;
            } else {
                self.write_line("535 Error: authentication failed").await?;
            }
            Ok(Action::Continue)
        } else {
            self.universal(line).await
        }
    }

    /// The line after the 334 challenge.
    async fn on_auth_blob(&mut self, line: &str) -> Result<Action> {
        if self.check_credentials(line.trim()) {
            self.write_line("235 Authentication successful").await?;
            self.state = SmtpState::Helo;
        } else {
            self.write_line("535 Error: authentication failed").await?;
            self.state = SmtpState::Ehlo;
        }
        Ok(Action::Continue)
    }

    /// Waiting for MAIL FROM.
    async fn on_helo(&mut self, line: &str) -> Result<Action> {
        if let Some(arg) = command_arg(line, "MAIL FROM", ':') {
            match check_mail_addr(self.ctx.dns.as_ref(), arg).await {
                Some(addr) => {
                    self.write_line(&format!("250 Sender {} OK", addr.to_address())).await?;
                    self.from = Some(addr);
                    self.state = SmtpState::From;
                }
                None => {
                    self.write_line("501 syntax error in parameters or arguments").await?;
                }
            }
            Ok(Action::Continue)
        } else if starts_with_ci(line, "MAIL FROM") {
            self.write_line("501 syntax error in parameters or arguments").await?;
            Ok(Action::Continue)
        } else {
            self.universal(line).await
        }
    }

    /// Waiting for RCPT TO; this is where the relay policy lives.
    async fn on_from(&mut self, line: &str) -> Result<Action> {
        if let Some(arg) = command_arg(line, "RCPT TO", ':') {
            match check_mail_addr(self.ctx.dns.as_ref(), arg).await {
                Some(addr) => {
                    let local = addr.domain.eq_ignore_ascii_case(&self.ctx.config.hostname)
                        && self.ctx.users.borrow().has(&addr.local);
                    if !local && !self.authenticated {
                        info!("refusing relay of mail for {}", addr.to_address());
                        self.write_line("554 Relay access denied").await?;
                    } else {
                        self.write_line(&format!("250 RCPT {} seems to be OK", addr.to_address()))
                            .await?;
                        self.rcpt = Some(addr);
                        self.rcpt_local = local;
                        self.state = SmtpState::Rcpt;
                    }
                }
                None => {
                    self.write_line("501 syntax error in parameters or arguments").await?;
                }
            }
            Ok(Action::Continue)
        } else if starts_with_ci(line, "RCPT TO") {
            self.write_line("501 syntax error in parameters or arguments").await?;
            Ok(Action::Continue)
        } else {
            self.universal(line).await
        }
    }

    /// Waiting for DATA.
    async fn on_rcpt(&mut self, line: &str) -> Result<Action> {
        if is_command(line, "DATA") {
            self.write_line("250 Waiting for Data, End with <CR><LF>.<CR><LF>").await?;
            self.state = SmtpState::Data;
            Ok(Action::Continue)
        } else if starts_with_ci(line, "DATA") {
            self.write_line("501 syntax error in parameters or arguments").await?;
            Ok(Action::Continue)
        } else {
            self.universal(line).await
        }
    }

    /// Body lines until the terminator. A lone `.` ends the mail; `..` and
    /// friends are ordinary content.
    async fn on_data(&mut self, line: &str) -> Result<Action> {
        if line == "." {
            self.deliver().await
        } else {
            self.body.push(line.to_string());
            Ok(Action::Continue)
        }
    }

    /// Commands valid in (almost) any state, plus the error replies for
    /// everything unrecognized.
    async fn universal(&mut self, line: &str) -> Result<Action> {
        if is_command(line, "RSET") {
            self.write_line("250 Reset OK").await?;
            self.reset_mail();
            return Ok(Action::Continue);
        }
        if is_command(line, "QUIT") {
            self.write_line("221 Bye").await?;
            return Ok(Action::Quit);
        }
        if is_command(line, "NOOP") {
            self.write_line("250 Ok, I'm here").await?;
            return Ok(Action::Continue);
        }
        for unimplemented in ["VRFY", "EXPN", "HELP"] {
            if starts_with_ci(line, unimplemented) {
                self.write_line(&format!("502 {} Command not implemented", unimplemented)).await?;
                return Ok(Action::Continue);
            }
        }
        for known in ["HELO", "EHLO", "AUTH", "MAIL FROM", "RCPT TO", "DATA"] {
            if starts_with_ci(line, known) {
                self.write_line("503 Bad Sequence of Commands").await?;
                return Ok(Action::Continue);
            }
        }
        self.write_line("500 Syntax error or command unrecognized").await?;
        Ok(Action::Continue)
    }

    /// Verifies an AUTH PLAIN blob: base64 of `authzid NUL authcid NUL
    /// password`, decoded exactly and matched against the user table.
    fn check_credentials(&mut self, blob: &str) -> bool {
        let Ok(plain) = BASE64.decode(blob) else {
            warn!("undecodable AUTH PLAIN blob");
            return false;
        };
        let fields: Vec<&[u8]> = plain.split(|&b| b == 0).collect();
        if fields.len() != 3 {
            warn!("malformed AUTH PLAIN credentials");
            return false;
        }
        let (user, password) =
            (String::from_utf8_lossy(fields[1]), String::from_utf8_lossy(fields[2]));
        let users = self.ctx.users.borrow();
        if users.has(&user) && users.verify(&user, &password) {
            info!("SMTP session authenticated as '{}'", user);
            self.authenticated = true;
            self.user = Some(user.into_owned());
            true
        } else {
            warn!("failed SMTP authentication for '{}'", user);
            false
        }
    }

    /// End of DATA: deliver locally or hand the body to the forwarder,
    /// then reset for the next transaction on this connection.
    async fn deliver(&mut self) -> Result<Action> {
        let (Some(from), Some(rcpt)) = (self.from.take(), self.rcpt.take()) else {
            error!("end of DATA without a complete envelope");
            self.reset_mail();
            self.write_line("503 Bad Sequence of Commands").await?;
            return Ok(Action::Continue);
        };
        let body = std::mem::take(&mut self.body);
        debug!(
            "end of DATA ({:?} session, peer {:?}, user {:?}, {} lines)",
            self.kind,
            self.peer_host,
            self.user,
            body.len()
        );

        if self.rcpt_local {
            let bytes = collapse_body(&body);
            match self.ctx.store.push(&rcpt.local, &bytes) {
                Ok(id) => {
                    info!("mail from {} delivered to '{}' as {}", from.to_address(), rcpt.local, id);
                    self.write_line("250 Message accepted and delivered").await?;
                }
                Err(e) => {
                    error!("local delivery for '{}' failed: {:#}", rcpt.local, e);
                    self.write_line(
                        "452 Requested mail action aborted: exceeded storage allocation",
                    )
                    .await?;
                }
            }
        } else {
            match forward::queue(&self.ctx, body, from.to_address(), rcpt.to_address(), true).await
            {
                Ok(()) => {
                    self.write_line("250 Message accepted and forwarded").await?;
                }
                Err(e) => {
                    warn!("cannot queue forward for {}: {:#}", rcpt.to_address(), e);
                    self.write_line("250 Message accepted but forward failed").await?;
                }
            }
        }

        self.reset_mail();
        Ok(Action::Continue)
    }

    /// Clears the envelope and body for the next mail; the peer greeting
    /// and any authentication survive.
    fn reset_mail(&mut self) {
        self.from = None;
        self.rcpt = None;
        self.rcpt_local = false;
        self.body.clear();
        self.state = SmtpState::Helo;
    }
}

/// Joins body lines back into wire bytes, CRLF after every line.
pub fn collapse_body(lines: &[String]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(lines.iter().map(|l| l.len() + 2).sum());
    for line in lines {
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(b"\r\n");
    }
    bytes
}

fn strip_prefix_ci<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    if line.len() < prefix.len() {
        return None;
    }
    let (head, rest) = line.split_at(prefix.len());
    head.eq_ignore_ascii_case(prefix).then_some(rest)
}

fn starts_with_ci(line: &str, prefix: &str) -> bool {
    strip_prefix_ci(line, prefix).is_some()
}

/// A bare command: the word alone, modulo case and surrounding blanks.
fn is_command(line: &str, command: &str) -> bool {
    strip_prefix_ci(line.trim(), command).is_some_and(|rest| rest.trim().is_empty())
}

/// The argument of `command` behind its delimiter: `':'` as in
/// `MAIL FROM:<…>`, or `' '` for blank-separated arguments. Blanks around
/// the delimiter are eaten; an absent or empty argument is `None`.
fn command_arg<'a>(line: &'a str, command: &str, delim: char) -> Option<&'a str> {
    let rest = strip_prefix_ci(line.trim(), command)?;
    let arg = match delim {
        ':' => rest.trim_start_matches([' ', '\t']).strip_prefix(':')?,
        _ => {
            if !rest.starts_with([' ', '\t']) {
                return None;
            }
            rest
        }
    };
    let arg = arg.trim_matches([' ', '\t']);
    (!arg.is_empty()).then_some(arg)
}
