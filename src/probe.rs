//! Caller-supplied verification actions.
//!
//! The racer does not know what "working" means for the target; only the
//! extraction layer can tell a block page from real content. It supplies a
//! [`ProbeAction`]; the racer runs it through each candidate's proxy and
//! takes the first `Ok`.

use crate::instance::Endpoint;
use async_trait::async_trait;
use std::time::Duration;

/// Verdict of one verification probe through one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// The proxy reached the target and the response looked usable.
    Ok,
    /// The target answered with a block signal for this identity.
    Blocked,
    /// Network-level failure (connect refused, timeout, reset).
    Error,
}

/// A cheap check that a circuit currently works against the target,
/// executed through the instance's SOCKS endpoint.
#[async_trait]
pub trait ProbeAction: Send + Sync {
    async fn probe(&self, proxy: &Endpoint) -> ProbeVerdict;
}

/// Default probe: fetch a URL through the SOCKS proxy and map the result.
/// Any 2xx is `Ok`, 403/429 are treated as block signals, everything else
/// at the transport level is `Error`.
pub struct SocksProbe {
    url: String,
    timeout: Duration,
}

impl SocksProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ProbeAction for SocksProbe {
    async fn probe(&self, proxy: &Endpoint) -> ProbeVerdict {
        let socks_proxy = match reqwest::Proxy::all(proxy.socks_url()) {
            Ok(p) => p,
            Err(_) => return ProbeVerdict::Error,
        };
        let client = match reqwest::Client::builder()
            .proxy(socks_proxy)
            .timeout(self.timeout)
            .build()
        {
            Ok(c) => c,
            Err(_) => return ProbeVerdict::Error,
        };

        match client.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => ProbeVerdict::Ok,
            Ok(resp)
                if resp.status() == reqwest::StatusCode::FORBIDDEN
                    || resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS =>
            {
                ProbeVerdict::Blocked
            }
            Ok(_) => ProbeVerdict::Error,
            Err(_) => ProbeVerdict::Error,
        }
    }
}
