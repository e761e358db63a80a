//! Name resolution and mail address validation.
//!
//! The protocol machines never talk to the resolver directly; they go
//! through the [`HostCheck`] capability so tests can substitute a stub.
//! The real implementation wraps a tokio `hickory-resolver` built from the
//! system configuration.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use log::debug;

/// Host resolution as the mail machinery needs it: "does this name have an
/// address" and "what is the best MX for this domain".
#[async_trait(?Send)]
pub trait HostCheck {
    /// Whether the host resolves to at least one address (A/AAAA).
    async fn resolves(&self, host: &str) -> bool;

    /// The exchange of the lowest-preference MX record, if any.
    async fn best_mx(&self, domain: &str) -> Option<String>;
}

/// System-resolver backed [`HostCheck`].
pub struct DnsCheck {
    resolver: TokioResolver,
}

impl DnsCheck {
    /// Builds a resolver from the system configuration.
    pub fn from_system() -> Result<Self> {
        let resolver = TokioResolver::builder_tokio()
            .context("cannot read system resolver configuration")?
            .build();
        Ok(DnsCheck { resolver })
    }
}

#[async_trait(?Send)]
impl HostCheck for DnsCheck {
    async fn resolves(&self, host: &str) -> bool {
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => lookup.iter().next().is_some(),
            Err(e) => {
                debug!("lookup of '{}' failed: {}", host, e);
                false
            }
        }
    }

    async fn best_mx(&self, domain: &str) -> Option<String> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => lookup
                .iter()
                .min_by_key(|mx| mx.preference())
                .map(|mx| mx.exchange().to_utf8().trim_end_matches('.').to_string()),
            Err(e) => {
                debug!("MX lookup of '{}' failed: {}", domain, e);
                None
            }
        }
    }
}

/// An envelope address split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAddr {
    pub local: String,
    pub domain: String,
}

impl MailAddr {
    /// The address in `local@domain` form, brackets gone.
    pub fn to_address(&self) -> String {
        format!("{}@{}", self.local, self.domain)
    }
}

/// Splits `addr` (optionally wrapped in one `<…>` pair) at the first `@`.
///
/// Returns `None` when there is no `@` or either side is empty. No
/// resolution happens here; see [`check_mail_addr`].
pub fn split_address(raw: &str) -> Option<MailAddr> {
    let raw = raw.trim();
    let bare = match raw.strip_prefix('<') {
        Some(inner) => inner.strip_suffix('>').unwrap_or(inner),
        None => raw,
    };
    let (local, domain) = bare.split_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some(MailAddr { local: local.to_string(), domain: domain.to_string() })
}

/// Full envelope-address check: syntactic split, local part of at least two
/// characters, and a domain that resolves by A or carries an MX record.
pub async fn check_mail_addr(dns: &dyn HostCheck, raw: &str) -> Option<MailAddr> {
    let addr = split_address(raw)?;
    if addr.local.len() < 2 {
        return None;
    }
    if dns.resolves(&addr.domain).await || dns.best_mx(&addr.domain).await.is_some() {
        Some(addr)
    } else {
        None
    }
}
