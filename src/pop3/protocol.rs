//! The POP3 server state machine.
//!
//! One `Pop3Protocol` per accepted connection, plaintext or TLS alike. A
//! session authenticates with USER/PASS, takes the user's mailbox lock,
//! and then works against a point-in-time view of the mailbox. Deletion
//! marks live on that view; only QUIT commits them to the store. Any other
//! way the session ends — peer close, write failure, lock refusal — leaves
//! the store untouched.

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;

use crate::mailbox::MailboxView;
use crate::{Action, Ctx};

/// POP3 session states. The RFC's UPDATE state is the commit inside QUIT.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Pop3State {
    /// Waiting for USER/PASS.
    Auth,
    /// Authenticated, mailbox locked and open.
    Transaction,
}

/// Argument arity of a transaction command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arity {
    None,
    Optional,
    Required,
}

/// The transaction command table: name and argument arity.
const TRANSACTION_COMMANDS: &[(&str, Arity)] = &[
    ("STAT", Arity::None),
    ("LIST", Arity::Optional),
    ("UIDL", Arity::Optional),
    ("RETR", Arity::Required),
    ("DELE", Arity::Required),
    ("NOOP", Arity::None),
    ("RSET", Arity::None),
    ("QUIT", Arity::None),
];

/// Manages the state and the write side of one POP3 connection.
pub struct Pop3Protocol<W: AsyncWriteExt + Unpin> {
    writer: W,
    ctx: Ctx,
    state: Pop3State,
    candidate: Option<String>,
    locked_user: Option<String>,
    mailbox: Option<MailboxView>,
    closed: bool,
}

impl<W: AsyncWriteExt + Unpin> Pop3Protocol<W> {
    pub fn new(ctx: Ctx, writer: W) -> Self {
        Pop3Protocol {
            writer,
            ctx,
            state: Pop3State::Auth,
            candidate: None,
            locked_user: None,
            mailbox: None,
            closed: false,
        }
    }

    /// Sends the `+OK` service greeting; called right after accept.
    pub async fn send_greeting(&mut self) -> Result<()> {
        let greeting = format!("+OK {} POP3-Server, Enter user", self.ctx.config.hostname);
        self.write_line(&greeting).await
    }

    /// Processes one framed command line.
    pub async fn handle_line(&mut self, line: &str) -> Result<Action> {
        debug!("POP3({:?}): {:?}", self.state, line);
        let (token, arg) = match line.split_once(' ') {
            Some((token, arg)) => (token, arg),
            None => (line, ""),
        };
        // The command word matches case-insensitively: upper-case the
        // token in place. Arguments keep their case (and their spaces).
        let mut command = token.to_string();
        command.make_ascii_uppercase();

        match self.state {
            Pop3State::Auth => self.on_auth(&command, arg).await,
            Pop3State::Transaction => self.on_transaction(&command, arg).await,
        }
    }

    /// Current state, for tests.
    pub fn state(&self) -> Pop3State {
        self.state
    }

    /// Releases the mailbox lock and discards uncommitted deletion marks.
    /// Must run on every session end; a QUIT has already done the work.
    pub fn finish(&mut self) {
        if self.closed {
            return;
        }
        if let Some(view) = self.mailbox.take() {
            if let Err(e) = self.ctx.store.close(view, false) {
                error!("error discarding mailbox view: {:#}", e);
            }
        }
        if let Some(user) = self.locked_user.take() {
            self.ctx.users.borrow_mut().unlock(&user);
            debug!("mailbox lock released for '{}'", user);
        }
        self.closed = true;
    }

    /// Flushes and shuts the writer down; on TLS this sends close_notify.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        debug!("POP3 > {}", line);
        self.writer.write_all(format!("{}\r\n", line).as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn on_auth(&mut self, command: &str, arg: &str) -> Result<Action> {
        match command {
            "USER" => {
                let name = arg.trim();
                if !name.is_empty() && self.ctx.users.borrow().has(name) {
                    self.candidate = Some(name.to_lowercase());
                    self.write_line("+OK Please enter passwd").await?;
                } else {
                    self.candidate = None;
                    self.write_line("-ERR Username not found").await?;
                }
                Ok(Action::Continue)
            }
            "PASS" => self.on_pass(arg).await,
            "QUIT" => {
                self.closed = true;
                self.write_line("+OK Bye").await?;
                Ok(Action::Quit)
            }
            _ => {
                self.write_line("-ERR Invalid command").await?;
                Ok(Action::Continue)
            }
        }
    }

    /// PASS: verify, take the mailbox lock, open the mailbox view. A lock
    /// refusal terminates the session.
    async fn on_pass(&mut self, password: &str) -> Result<Action> {
        let Some(user) = self.candidate.clone() else {
            self.write_line("-ERR No username entered").await?;
            return Ok(Action::Continue);
        };
        if !self.ctx.users.borrow().verify(&user, password) {
            warn!("failed POP3 login for '{}'", user);
            self.write_line("-ERR Invalid passwd").await?;
            return Ok(Action::Continue);
        }
        if !self.ctx.users.borrow_mut().lock(&user) {
            info!("mailbox of '{}' is busy, refusing session", user);
            self.write_line("-ERR Cannot lock mailbox").await?;
            return Ok(Action::Quit);
        }
        self.locked_user = Some(user.clone());

        match self.ctx.store.open_mailbox(&user) {
            Ok(view) => {
                let (count, size) = view.stat();
                info!("POP3 session for '{}': {} mails, {} octets", user, count, size);
                self.mailbox = Some(view);
                self.state = Pop3State::Transaction;
                self.write_line("+OK Mailbox locked").await?;
                Ok(Action::Continue)
            }
            Err(e) => {
                error!("cannot open mailbox of '{}': {:#}", user, e);
                self.write_line("-ERR Cannot open mailbox").await?;
                Ok(Action::Quit)
            }
        }
    }

    async fn on_transaction(&mut self, command: &str, arg: &str) -> Result<Action> {
        if self.mailbox.is_none() {
            self.write_line("-ERR No mailbox").await?;
            return Ok(Action::Continue);
        }
        let Some(&(_, arity)) = TRANSACTION_COMMANDS.iter().find(|(name, _)| *name == command)
        else {
            self.write_line("-ERR Invalid command").await?;
            return Ok(Action::Continue);
        };
        let arg = arg.trim();
        let arity_ok = match arity {
            Arity::None => arg.is_empty(),
            Arity::Optional => true,
            Arity::Required => !arg.is_empty(),
        };
        if !arity_ok {
            self.write_line("-ERR Invalid argument").await?;
            return Ok(Action::Continue);
        }

        match command {
            "STAT" => {
                let (count, size) = self.view().stat();
                self.write_line(&format!("+OK {} {}", count, size)).await?;
            }
            "LIST" => return self.on_list(arg).await,
            "UIDL" => return self.on_uidl(arg).await,
            "RETR" => return self.on_retr(arg).await,
            "DELE" => {
                let marked = msgnum(arg).map(|num| (num, self.view_mut().mark_deleted(num)));
                match marked {
                    Some((num, true)) => {
                        self.write_line(&format!("+OK Message {} deleted", num)).await?;
                    }
                    _ => {
                        self.write_line("-ERR No such message").await?;
                    }
                }
            }
            "NOOP" => {
                self.write_line("+OK").await?;
            }
            "RSET" => {
                self.view_mut().reset();
                self.write_line("+OK").await?;
            }
            "QUIT" => return self.on_quit().await,
            _ => unreachable!("command table and dispatch disagree"),
        }
        Ok(Action::Continue)
    }

    async fn on_list(&mut self, arg: &str) -> Result<Action> {
        if arg.is_empty() {
            let (count, size) = self.view().stat();
            let listing: Vec<String> =
                self.view().live().map(|s| format!("{} {}", s.seq, s.size)).collect();
            self.write_line(&format!("+OK {} messages ({} Octets)", count, size)).await?;
            for line in listing {
                self.write_line(&line).await?;
            }
            self.write_line(".").await?;
        } else {
            match msgnum(arg).and_then(|num| self.live_slot(num)) {
                Some((seq, size, _)) => {
                    self.write_line(&format!("+OK {} {}", seq, size)).await?;
                }
                None => {
                    self.write_line("-ERR No such message").await?;
                }
            }
        }
        Ok(Action::Continue)
    }

    async fn on_uidl(&mut self, arg: &str) -> Result<Action> {
        if arg.is_empty() {
            let listing: Vec<String> =
                self.view().live().map(|s| format!("{} {}", s.seq, s.uid())).collect();
            self.write_line("+OK").await?;
            for line in listing {
                self.write_line(&line).await?;
            }
            self.write_line(".").await?;
        } else {
            match msgnum(arg).and_then(|num| self.uid_of(num)) {
                Some((seq, uid)) => {
                    self.write_line(&format!("+OK {} {}", seq, uid)).await?;
                }
                None => {
                    self.write_line("-ERR No such message").await?;
                }
            }
        }
        Ok(Action::Continue)
    }

    /// RETR streams the stored bytes verbatim; the multi-line terminator
    /// is sent with its own leading CRLF.
    async fn on_retr(&mut self, arg: &str) -> Result<Action> {
        let Some((_, size, id)) = msgnum(arg).and_then(|num| self.live_slot(num)) else {
            self.write_line("-ERR No such message").await?;
            return Ok(Action::Continue);
        };
        let bytes = match self.ctx.store.fetch(id) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.write_line("-ERR No such message").await?;
                return Ok(Action::Continue);
            }
            Err(e) => {
                error!("cannot fetch mail {}: {:#}", id, e);
                self.write_line("-ERR No such message").await?;
                return Ok(Action::Continue);
            }
        };
        self.write_line(&format!("+OK {} Octets", size)).await?;
        self.writer.write_all(&bytes).await?;
        self.writer.write_all(b"\r\n.\r\n").await?;
        self.writer.flush().await?;
        Ok(Action::Continue)
    }

    /// QUIT is the only command that commits deletion marks.
    async fn on_quit(&mut self) -> Result<Action> {
        if let Some(view) = self.mailbox.take() {
            let user = view.user().to_string();
            match self.ctx.store.close(view, true) {
                Ok(removed) if removed > 0 => info!("'{}': {} mails deleted", user, removed),
                Ok(_) => {}
                Err(e) => error!("error committing deletions for '{}': {:#}", user, e),
            }
        }
        if let Some(user) = self.locked_user.take() {
            self.ctx.users.borrow_mut().unlock(&user);
        }
        self.closed = true;
        self.write_line("+OK Bye").await?;
        Ok(Action::Quit)
    }

    fn view(&self) -> &MailboxView {
        self.mailbox.as_ref().expect("transaction state without mailbox")
    }

    fn view_mut(&mut self) -> &mut MailboxView {
        self.mailbox.as_mut().expect("transaction state without mailbox")
    }

    /// `(seq, size, id)` of a non-deleted message number.
    fn live_slot(&self, num: usize) -> Option<(usize, u64, u64)> {
        self.view().slot(num).filter(|s| !s.deleted).map(|s| (s.seq, s.size, s.id))
    }

    fn uid_of(&self, num: usize) -> Option<(usize, String)> {
        self.view().slot(num).filter(|s| !s.deleted).map(|s| (s.seq, s.uid()))
    }
}

fn msgnum(arg: &str) -> Option<usize> {
    arg.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, UserTable};
    use crate::dns::HostCheck;
    use crate::mailbox::MailStore;
    use crate::Shared;
    use async_trait::async_trait;
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::rc::Rc;

    struct NoHosts;

    #[async_trait(?Send)]
    impl HostCheck for NoHosts {
        async fn resolves(&self, _host: &str) -> bool {
            false
        }
        async fn best_mx(&self, _domain: &str) -> Option<String> {
            None
        }
    }

    fn test_ctx() -> Ctx {
        let mut users = UserTable::default();
        users.insert("jan", "secret");
        let config = Config {
            smtp_port: 0,
            pop3_port: 0,
            pop3s_port: 0,
            bind_address: "127.0.0.1".to_string(),
            hostname: "myhost".to_string(),
            relayhost: None,
            dbfile: PathBuf::new(),
            tls_cert_file: PathBuf::new(),
            tls_ca_file: PathBuf::new(),
        };
        Rc::new(Shared {
            config,
            users: RefCell::new(users),
            store: MailStore::temporary().unwrap(),
            dns: Rc::new(NoHosts),
        })
    }

    fn proto(ctx: &Ctx) -> Pop3Protocol<Vec<u8>> {
        Pop3Protocol::new(ctx.clone(), Vec::new())
    }

    fn output(protocol: &Pop3Protocol<Vec<u8>>) -> String {
        String::from_utf8_lossy(&protocol.writer).into_owned()
    }

    async fn login(protocol: &mut Pop3Protocol<Vec<u8>>) {
        assert_eq!(protocol.handle_line("USER jan").await.unwrap(), Action::Continue);
        assert_eq!(protocol.handle_line("PASS secret").await.unwrap(), Action::Continue);
        assert_eq!(protocol.state(), Pop3State::Transaction);
    }

    #[tokio::test]
    async fn user_pass_opens_the_mailbox() {
        let ctx = test_ctx();
        let mut protocol = proto(&ctx);
        login(&mut protocol).await;
        let out = output(&protocol);
        assert!(out.contains("+OK Please enter passwd"));
        assert!(out.contains("+OK Mailbox locked"));
        assert!(ctx.users.borrow().is_locked("jan"));
        protocol.finish();
        assert!(!ctx.users.borrow().is_locked("jan"));
    }

    #[tokio::test]
    async fn commands_are_case_insensitive() {
        let ctx = test_ctx();
        let mut protocol = proto(&ctx);
        protocol.handle_line("user jan").await.unwrap();
        protocol.handle_line("pass secret").await.unwrap();
        assert_eq!(protocol.state(), Pop3State::Transaction);
        protocol.handle_line("stat").await.unwrap();
        assert!(output(&protocol).contains("+OK 0 0"));
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_are_refused() {
        let ctx = test_ctx();
        let mut protocol = proto(&ctx);
        protocol.handle_line("USER nobody").await.unwrap();
        assert!(output(&protocol).contains("-ERR Username not found"));
        protocol.handle_line("USER jan").await.unwrap();
        protocol.handle_line("PASS wrong").await.unwrap();
        assert!(output(&protocol).contains("-ERR Invalid passwd"));
        assert_eq!(protocol.state(), Pop3State::Auth);
        assert!(!ctx.users.borrow().is_locked("jan"));
    }

    #[tokio::test]
    async fn pass_without_user_is_refused() {
        let ctx = test_ctx();
        let mut protocol = proto(&ctx);
        protocol.handle_line("PASS secret").await.unwrap();
        assert!(output(&protocol).contains("-ERR No username entered"));
    }

    #[tokio::test]
    async fn second_session_cannot_lock_the_mailbox() {
        let ctx = test_ctx();
        let mut first = proto(&ctx);
        login(&mut first).await;

        let mut second = proto(&ctx);
        second.handle_line("USER jan").await.unwrap();
        let action = second.handle_line("PASS secret").await.unwrap();
        assert_eq!(action, Action::Quit);
        assert!(output(&second).contains("-ERR Cannot lock mailbox"));
        second.finish();

        // The holder's lock survives the loser's teardown.
        assert!(ctx.users.borrow().is_locked("jan"));
        first.finish();
        assert!(!ctx.users.borrow().is_locked("jan"));

        let mut third = proto(&ctx);
        login(&mut third).await;
        third.finish();
    }

    #[tokio::test]
    async fn stat_and_list_count_live_messages() {
        let ctx = test_ctx();
        ctx.store.push("jan", &vec![b'a'; 100]).unwrap();
        ctx.store.push("jan", &vec![b'b'; 200]).unwrap();

        let mut protocol = proto(&ctx);
        login(&mut protocol).await;
        protocol.handle_line("STAT").await.unwrap();
        assert!(output(&protocol).contains("+OK 2 300"));

        protocol.handle_line("LIST").await.unwrap();
        let out = output(&protocol);
        assert!(out.contains("+OK 2 messages (300 Octets)"));
        assert!(out.contains("1 100\r\n"));
        assert!(out.contains("2 200\r\n"));
        assert!(out.contains(".\r\n"));

        protocol.handle_line("LIST 2").await.unwrap();
        assert!(output(&protocol).contains("+OK 2 200"));
        protocol.handle_line("LIST 3").await.unwrap();
        assert!(output(&protocol).contains("-ERR No such message"));
        protocol.finish();
    }

    #[tokio::test]
    async fn uidl_is_stable_and_zero_padded() {
        let ctx = test_ctx();
        let id = ctx.store.push("jan", b"mail").unwrap();
        let mut protocol = proto(&ctx);
        login(&mut protocol).await;
        protocol.handle_line("UIDL 1").await.unwrap();
        assert!(output(&protocol).contains(&format!("+OK 1 {:018}", id)));
        protocol.handle_line("UIDL").await.unwrap();
        assert!(output(&protocol).contains(&format!("1 {:018}\r\n", id)));
        protocol.finish();
    }

    #[tokio::test]
    async fn retr_streams_the_stored_bytes() {
        let ctx = test_ctx();
        ctx.store.push("jan", b"line one\r\nline two\r\n").unwrap();
        let mut protocol = proto(&ctx);
        login(&mut protocol).await;
        protocol.handle_line("RETR 1").await.unwrap();
        let out = output(&protocol);
        assert!(out.contains("+OK 20 Octets\r\n"));
        assert!(out.contains("line one\r\nline two\r\n\r\n.\r\n"));
        protocol.handle_line("RETR 9").await.unwrap();
        assert!(output(&protocol).contains("-ERR No such message"));
        protocol.finish();
    }

    #[tokio::test]
    async fn dele_marks_and_quit_commits() {
        let ctx = test_ctx();
        ctx.store.push("jan", &vec![b'a'; 100]).unwrap();
        ctx.store.push("jan", &vec![b'b'; 200]).unwrap();

        let mut protocol = proto(&ctx);
        login(&mut protocol).await;
        protocol.handle_line("DELE 1").await.unwrap();
        assert!(output(&protocol).contains("+OK Message 1 deleted"));
        // Deleted messages vanish from listings and repeat DELEs fail.
        protocol.handle_line("DELE 1").await.unwrap();
        assert!(output(&protocol).contains("-ERR No such message"));
        protocol.handle_line("STAT").await.unwrap();
        assert!(output(&protocol).contains("+OK 1 200"));
        protocol.handle_line("RETR 1").await.unwrap();
        assert!(output(&protocol).contains("-ERR No such message"));

        let action = protocol.handle_line("QUIT").await.unwrap();
        assert_eq!(action, Action::Quit);
        assert!(output(&protocol).contains("+OK Bye"));
        protocol.finish();
        assert!(!ctx.users.borrow().is_locked("jan"));

        let after = ctx.store.open_mailbox("jan").unwrap();
        assert_eq!(after.stat(), (1, 200));
    }

    #[tokio::test]
    async fn abandoned_session_commits_nothing() {
        let ctx = test_ctx();
        ctx.store.push("jan", &vec![b'a'; 100]).unwrap();
        let mut protocol = proto(&ctx);
        login(&mut protocol).await;
        protocol.handle_line("DELE 1").await.unwrap();
        // Peer vanished; no QUIT.
        protocol.finish();
        assert_eq!(ctx.store.open_mailbox("jan").unwrap().stat(), (1, 100));
        assert!(!ctx.users.borrow().is_locked("jan"));
    }

    #[tokio::test]
    async fn rset_restores_marked_messages() {
        let ctx = test_ctx();
        ctx.store.push("jan", &vec![b'a'; 100]).unwrap();
        let mut protocol = proto(&ctx);
        login(&mut protocol).await;
        protocol.handle_line("DELE 1").await.unwrap();
        protocol.handle_line("RSET").await.unwrap();
        protocol.handle_line("STAT").await.unwrap();
        assert!(output(&protocol).contains("+OK 1 100"));
        protocol.finish();
    }

    #[tokio::test]
    async fn arity_violations_and_unknown_commands_err() {
        let ctx = test_ctx();
        let mut protocol = proto(&ctx);
        login(&mut protocol).await;
        protocol.handle_line("STAT 1").await.unwrap();
        assert!(output(&protocol).contains("-ERR Invalid argument"));
        protocol.handle_line("RETR").await.unwrap();
        assert!(output(&protocol).contains("-ERR Invalid argument"));
        protocol.handle_line("DELE abc").await.unwrap();
        assert!(output(&protocol).contains("-ERR No such message"));
        protocol.handle_line("XYZZY").await.unwrap();
        assert!(output(&protocol).contains("-ERR Invalid command"));
        assert_eq!(protocol.state(), Pop3State::Transaction);
        protocol.finish();
    }

    #[tokio::test]
    async fn quit_in_auth_state_just_ends() {
        let ctx = test_ctx();
        let mut protocol = proto(&ctx);
        assert_eq!(protocol.handle_line("QUIT").await.unwrap(), Action::Quit);
        assert!(output(&protocol).contains("+OK Bye"));
    }

    #[tokio::test]
    async fn noop_keeps_everything_in_place() {
        let ctx = test_ctx();
        let mut protocol = proto(&ctx);
        login(&mut protocol).await;
        protocol.handle_line("NOOP").await.unwrap();
        assert_eq!(protocol.state(), Pop3State::Transaction);
        assert!(output(&protocol).ends_with("+OK\r\n"));
        protocol.finish();
    }
}
