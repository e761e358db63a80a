//! Outbound mail forwarding.
//!
//! Every non-local recipient accepted by the SMTP server becomes one
//! forward job: an SMTP client conversation with the downstream host,
//! driven as its own task on the event loop. The job owns its body — the
//! receiving session hands it off by move. When the downstream hard-fails
//! a failable job, a bounce mail is synthesized and queued back to the
//! original sender; bounces themselves are never failable, which is the
//! sole guard against bounce storms.

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::net::LineReader;
use crate::Ctx;

/// Hard cap on re-sends of a single command after 4xx replies.
const MAX_TRIES: u32 = 3;

/// Default downstream port when the relay host does not carry one.
const SMTP_PORT: u16 = 25;

/// One outbound delivery attempt.
#[derive(Debug)]
pub struct ForwardJob {
    pub from: String,
    pub to: String,
    pub body: Vec<String>,
    /// Whether a hard failure produces a bounce mail to the sender.
    pub failable: bool,
}

/// Forwarder states. Each pre-`Quit` state means "the command for this
/// state is on the wire, awaiting its reply".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FwdState {
    New,
    Helo,
    Mail,
    Rcpt,
    Data,
    Send,
    Quit,
}

impl FwdState {
    /// Reply code that advances the conversation out of this state.
    fn expected_code(self) -> u16 {
        match self {
            FwdState::New => 220,
            FwdState::Data => 354,
            FwdState::Quit => 221,
            _ => 250,
        }
    }

    fn next(self) -> FwdState {
        match self {
            FwdState::New => FwdState::Helo,
            FwdState::Helo => FwdState::Mail,
            FwdState::Mail => FwdState::Rcpt,
            FwdState::Rcpt => FwdState::Data,
            FwdState::Data => FwdState::Send,
            FwdState::Send | FwdState::Quit => FwdState::Quit,
        }
    }
}

/// Classification of one downstream reply line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// The expected code arrived.
    Ok,
    /// 4xx: the command may succeed on a retry.
    Retry,
    /// Anything else with a parseable code.
    Fail,
    /// No final code on this line (noise or a `-` continuation).
    Nop,
}

/// Extracts and classifies the reply code of `line` against `expected`.
///
/// A line is final only when three ASCII digits are followed by a space;
/// a `-` separator marks a continuation of a multi-line reply.
pub fn classify_reply(line: &str, expected: u16) -> Reply {
    let bytes = line.as_bytes();
    if bytes.len() < 4 || !bytes[..3].iter().all(u8::is_ascii_digit) || bytes[3] != b' ' {
        return Reply::Nop;
    }
    let code: u16 = match line[..3].parse() {
        Ok(code) => code,
        Err(_) => return Reply::Nop,
    };
    if code == expected {
        Reply::Ok
    } else if (400..500).contains(&code) {
        Reply::Retry
    } else {
        Reply::Fail
    }
}

/// Builds the body of a bounce mail: a minimal header block, the failing
/// server's reply, and the original mail.
pub fn bounce_body(myhost: &str, sender: &str, reply: &str, original: Vec<String>) -> Vec<String> {
    let mut body = vec![
        format!("From: \"Mail Delivery System\" postmaster@{}", myhost),
        format!("To: {}", sender),
        "Subject: Undelivered Mail Returned to Sender".to_string(),
        "An error occurred while sending your mail:".to_string(),
        reply.to_string(),
        "Your mail was:".to_string(),
    ];
    body.extend(original);
    body
}

/// Picks the downstream host and port for a recipient: the configured
/// relay host if any (honoring an explicit `:port`), else the recipient
/// domain if it has an address record, else its best-preference MX.
async fn downstream_for(ctx: &Ctx, to: &str) -> Result<(String, u16)> {
    if let Some(relay) = &ctx.config.relayhost {
        if let Some((host, port)) = relay.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return Ok((host.to_string(), port));
            }
        }
        return Ok((relay.clone(), SMTP_PORT));
    }

    let domain = to
        .split_once('@')
        .map(|(_, domain)| domain)
        .ok_or_else(|| anyhow!("recipient '{}' has no domain", to))?;
    if ctx.dns.resolves(domain).await {
        return Ok((domain.to_string(), SMTP_PORT));
    }
    ctx.dns
        .best_mx(domain)
        .await
        .map(|mx| (mx, SMTP_PORT))
        .ok_or_else(|| anyhow!("no route to domain '{}'", domain))
}

/// Queues one forward job: resolves the downstream, connects, and spawns
/// the client conversation as its own task.
///
/// # Errors
///
/// Resolution and connect failures surface here, so the caller can answer
/// "accepted but forward failed"; everything after the spawn is reported
/// by the job itself (bounce or log line).
pub async fn queue(ctx: &Ctx, body: Vec<String>, from: String, to: String, failable: bool) -> Result<()> {
    let (host, port) = downstream_for(ctx, &to).await?;
    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .with_context(|| format!("cannot connect to downstream {}:{}", host, port))?;
    info!("forwarding mail for {} via {}:{}", to, host, port);

    let job = ForwardJob { from, to, body, failable };
    let ctx = ctx.clone();
    tokio::task::spawn_local(async move {
        if let Err(e) = run(ctx, stream, job).await {
            error!("forward session error: {:#}", e);
        }
    });
    Ok(())
}

/// Drives one forward conversation to completion.
async fn run(ctx: Ctx, stream: TcpStream, job: ForwardJob) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = LineReader::new(read_half);
    let mut state = FwdState::New;
    let mut tries: u32 = 0;
    let mut delivered = false;

    loop {
        let line = match reader.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                if delivered {
                    return Ok(());
                }
                return fail(&ctx, job, "downstream server closed the connection").await;
            }
            Err(e) => {
                if delivered {
                    return Ok(());
                }
                return fail(&ctx, job, &format!("downstream read failed: {}", e)).await;
            }
        };
        debug!("forward({:?}) <- {:?}", state, line);

        match classify_reply(&line, state.expected_code()) {
            Reply::Nop => continue,
            Reply::Ok => {
                if state == FwdState::Quit {
                    debug!("forward to {} complete", job.to);
                    return Ok(());
                }
                if state == FwdState::Send {
                    delivered = true;
                }
                tries = 0;
                state = state.next();
                if let Err(e) = send_for(&mut write_half, state, &ctx, &job).await {
                    if delivered {
                        return Ok(());
                    }
                    return fail(&ctx, job, &format!("downstream write failed: {}", e)).await;
                }
            }
            // The greeting is not retryable (anything but 220 is fatal),
            // and neither is a 4xx answering the body terminator: the
            // downstream is back in command mode at that point, so there
            // is no single command to re-send.
            Reply::Retry if state != FwdState::New && state != FwdState::Send => {
                tries += 1;
                if tries >= MAX_TRIES {
                    warn!("forward to {}: retry cap reached in {:?}", job.to, state);
                    return fail(&ctx, job, &line).await;
                }
                debug!("forward({:?}): retry {} after {:?}", state, tries, line);
                if let Err(e) = send_for(&mut write_half, state, &ctx, &job).await {
                    return fail(&ctx, job, &format!("downstream write failed: {}", e)).await;
                }
            }
            Reply::Retry | Reply::Fail => {
                if delivered {
                    return Ok(());
                }
                return fail(&ctx, job, &line).await;
            }
        }
    }
}

/// Writes the command that enters `state`.
async fn send_for<W>(writer: &mut W, state: FwdState, ctx: &Ctx, job: &ForwardJob) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    match state {
        FwdState::New => Ok(()),
        FwdState::Helo => send_command(writer, &format!("HELO {}", ctx.config.hostname)).await,
        FwdState::Mail => send_command(writer, &format!("MAIL FROM:<{}>", job.from)).await,
        FwdState::Rcpt => send_command(writer, &format!("RCPT TO:<{}>", job.to)).await,
        FwdState::Data => send_command(writer, "DATA").await,
        FwdState::Send => send_body(writer, &job.body).await,
        FwdState::Quit => send_command(writer, "QUIT").await,
    }
}

async fn send_command<W>(writer: &mut W, command: &str) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    debug!("forward -> {}", command);
    writer.write_all(format!("{}\r\n", command).as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Streams the body, dot-stuffing lines that start with `.`, and finishes
/// with the lone-dot terminator.
pub async fn send_body<W>(writer: &mut W, body: &[String]) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    for line in body {
        if line.starts_with('.') {
            writer.write_all(b".").await?;
        }
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.write_all(b".\r\n").await?;
    writer.flush().await?;
    Ok(())
}

/// The hard-failure path: synthesize and queue a bounce for failable jobs,
/// drop silently otherwise.
async fn fail(ctx: &Ctx, job: ForwardJob, reply: &str) -> Result<()> {
    warn!("forward to {} failed: {}", job.to, reply);
    if !job.failable {
        return Ok(());
    }
    let body = bounce_body(&ctx.config.hostname, &job.from, reply, job.body);
    let postmaster = format!("postmaster@{}", ctx.config.hostname);
    if let Err(e) = Box::pin(queue(ctx, body, postmaster, job.from, false)).await {
        error!("cannot queue bounce mail: {:#}", e);
    }
    Ok(())
}
