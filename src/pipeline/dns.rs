//! Resolver selection for outbound parser traffic.
//!
//! The parser's CDN hosts are sometimes unresolvable through the local
//! resolver. Hosts on the configured domain allowlist are looked up through
//! a fixed set of public DNS servers first; anything else, and any failure
//! or timeout of the public lookup, goes through the system resolver.

use crate::config::ParserConfig;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Which resolver a hostname should go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverChoice {
    System,
    PublicDns,
}

/// Pick the resolver for `host` given the allowlisted `domains`.
///
/// A host matches a domain when it equals it or is a subdomain of it.
pub fn select_resolver(host: &str, domains: &[String]) -> ResolverChoice {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let matched = domains.iter().any(|d| {
        let d = d.trim_start_matches('.').to_ascii_lowercase();
        !d.is_empty() && (host == d || host.ends_with(&format!(".{d}")))
    });
    if matched {
        ResolverChoice::PublicDns
    } else {
        ResolverChoice::System
    }
}

/// `reqwest` resolver that routes allowlisted hosts through public DNS.
#[derive(Clone)]
pub struct FallbackResolver {
    inner: Arc<Inner>,
}

struct Inner {
    public: Option<TokioAsyncResolver>,
    domains: Vec<String>,
    timeout: Duration,
}

impl FallbackResolver {
    pub fn new(config: &ParserConfig) -> Self {
        let public = if config.dns_servers.is_empty() {
            None
        } else {
            let group = NameServerConfigGroup::from_ips_clear(&config.dns_servers, 53, true);
            let mut opts = ResolverOpts::default();
            opts.timeout = config.dns_timeout;
            opts.attempts = 1;
            Some(TokioAsyncResolver::tokio(
                ResolverConfig::from_parts(None, vec![], group),
                opts,
            ))
        };
        Self {
            inner: Arc::new(Inner {
                public,
                domains: config.dns_domains.clone(),
                timeout: config.dns_timeout,
            }),
        }
    }

    pub fn choice_for(&self, host: &str) -> ResolverChoice {
        if self.inner.public.is_none() {
            return ResolverChoice::System;
        }
        select_resolver(host, &self.inner.domains)
    }
}

impl Inner {
    async fn lookup_public(&self, host: &str) -> Option<Vec<SocketAddr>> {
        let resolver = self.public.as_ref()?;
        match tokio::time::timeout(self.timeout, resolver.lookup_ip(host)).await {
            Ok(Ok(lookup)) => {
                let addrs: Vec<SocketAddr> =
                    lookup.iter().map(|ip| SocketAddr::new(ip, 0)).collect();
                if addrs.is_empty() {
                    None
                } else {
                    Some(addrs)
                }
            }
            Ok(Err(e)) => {
                debug!("Public DNS lookup of {} failed: {}", host, e);
                None
            }
            Err(_) => {
                debug!("Public DNS lookup of {} timed out", host);
                None
            }
        }
    }
}

async fn lookup_system(host: &str) -> std::io::Result<Vec<SocketAddr>> {
    Ok(tokio::net::lookup_host((host, 0)).await?.collect())
}

impl Resolve for FallbackResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let this = self.clone();
        Box::pin(async move {
            let host = name.as_str().to_string();
            if this.choice_for(&host) == ResolverChoice::PublicDns {
                if let Some(addrs) = this.inner.lookup_public(&host).await {
                    debug!("Resolved {} via public DNS ({} addrs)", host, addrs.len());
                    let addrs: Addrs = Box::new(addrs.into_iter());
                    return Ok(addrs);
                }
            }
            let addrs = lookup_system(&host).await?;
            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok(addrs)
        })
    }
}
