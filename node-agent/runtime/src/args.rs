use crate::{
    core::RedirectParams,
    netns::SharedCache,
    proxy::{Listener, ProxyServer},
};
use anyhow::{anyhow, bail, Result};
use clap::Parser;
use std::{
    net::{Ipv4Addr, Ipv6Addr},
    num::NonZeroUsize,
};
use tokio::time::Duration;

/// Node agent settings, meant to be flattened into the owning controller's arguments.
#[derive(Debug, Parser)]
#[clap(name = "node-agent", about = "Admits workloads into the node's mesh data plane")]
pub struct Args {
    #[clap(
        long,
        default_value = "linkerd=info,warn",
        env = "LINKERD_NODE_AGENT_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    /// The source address the host uses for IPv4 kubelet probes.
    #[clap(long, default_value = "169.254.7.127")]
    host_probe_snat_ipv4: Ipv4Addr,

    /// The source address the host uses for IPv6 kubelet probes.
    #[clap(long, default_value = "fd16:9254:7127:1337:ffff:ffff:ffff:ffff")]
    host_probe_snat_ipv6: Ipv6Addr,

    /// The name of the host IP set holding meshed workloads' IPs.
    #[clap(long, default_value = "linkerd-probes")]
    probe_set_name: String,

    /// The number of threads that may run operations inside workload namespaces at once.
    #[clap(long, default_value = "4")]
    netns_workers: NonZeroUsize,

    /// How long to wait for the proxy to acknowledge an update.
    #[clap(long, default_value = "5s", value_parser = parse_timeout)]
    proxy_ack_timeout: Duration,
}

/// Validated node agent settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub redirect: RedirectParams,
    pub probe_set_name: String,
    pub netns_workers: NonZeroUsize,
    pub proxy_ack_timeout: Duration,
}

// === impl Args ===

impl Args {
    pub fn config(&self) -> Result<Config> {
        if self.probe_set_name.is_empty() {
            bail!("probe set name must not be empty");
        }
        if self.proxy_ack_timeout.is_zero() {
            bail!("proxy ack timeout must be greater than zero");
        }

        Ok(Config {
            redirect: RedirectParams {
                host_probe_snat_v4: self.host_probe_snat_ipv4,
                host_probe_snat_v6: self.host_probe_snat_ipv6,
            },
            probe_set_name: self.probe_set_name.clone(),
            netns_workers: self.netns_workers,
            proxy_ack_timeout: self.proxy_ack_timeout,
        })
    }

    /// Initializes logging and returns the validated configuration.
    pub fn init(self) -> Result<Config> {
        let config = self.config()?;
        let Self {
            log_level,
            log_format,
            ..
        } = self;
        log_format.try_init(log_level)?;
        Ok(config)
    }
}

// === impl Config ===

impl Config {
    /// Builds the proxy sync server, replaying snapshots from `cache`.
    pub fn proxy_server<L: Listener>(&self, listener: L, cache: SharedCache) -> ProxyServer<L> {
        ProxyServer::new(listener, cache, self.proxy_ack_timeout)
    }
}

/// Parses a duration like `250ms` or `5s`. A bare `0` is accepted without a unit.
pub fn parse_timeout(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if split == 0 {
        bail!("{s} does not start with a number");
    }
    let (value, unit) = s.split_at(split);
    let value = value.parse::<u64>()?;

    let unit = match unit {
        "" if value == 0 => return Ok(Duration::ZERO),
        "ms" => Duration::from_millis(1),
        "s" => Duration::from_secs(1),
        "m" => Duration::from_secs(60),
        "h" => Duration::from_secs(60 * 60),
        "d" => Duration::from_secs(60 * 60 * 24),
        unit => bail!("unknown unit {unit:?} in {s}; expected ms, s, m, h or d"),
    };
    u32::try_from(value)
        .ok()
        .and_then(|n| unit.checked_mul(n))
        .ok_or_else(|| anyhow!("{s} is too large"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["node-agent"]).expect("must parse");
        let config = args.config().expect("must be valid");
        assert_eq!(
            config,
            Config {
                redirect: RedirectParams {
                    host_probe_snat_v4: Ipv4Addr::new(169, 254, 7, 127),
                    host_probe_snat_v6: "fd16:9254:7127:1337:ffff:ffff:ffff:ffff"
                        .parse()
                        .unwrap(),
                },
                probe_set_name: "linkerd-probes".to_string(),
                netns_workers: NonZeroUsize::new(4).unwrap(),
                proxy_ack_timeout: Duration::from_secs(5),
            }
        );
    }

    #[test]
    fn overrides() {
        let args = Args::try_parse_from([
            "node-agent",
            "--host-probe-snat-ipv4=169.254.1.1",
            "--probe-set-name=probes",
            "--netns-workers=1",
            "--proxy-ack-timeout=250ms",
        ])
        .expect("must parse");
        let config = args.config().expect("must be valid");
        assert_eq!(
            config.redirect.host_probe_snat_v4,
            Ipv4Addr::new(169, 254, 1, 1)
        );
        assert_eq!(config.probe_set_name, "probes");
        assert_eq!(config.netns_workers.get(), 1);
        assert_eq!(config.proxy_ack_timeout, Duration::from_millis(250));
    }

    #[test]
    fn rejects_invalid_settings() {
        assert!(Args::try_parse_from(["node-agent", "--netns-workers=0"]).is_err());

        let args = Args::try_parse_from(["node-agent", "--proxy-ack-timeout=0"])
            .expect("zero is a valid duration");
        assert!(args.config().is_err());
    }

    #[tokio::test]
    async fn builds_proxy_server_from_config() {
        struct Idle;

        #[async_trait::async_trait]
        impl Listener for Idle {
            type Connection = Never;

            async fn accept(&self) -> Result<Never> {
                std::future::pending().await
            }
        }

        enum Never {}

        #[async_trait::async_trait]
        impl crate::proxy::Connection for Never {
            async fn send(&mut self, _: &crate::proxy::Message) -> Result<crate::proxy::Ack> {
                match *self {}
            }
        }

        let config = Args::try_parse_from(["node-agent", "--proxy-ack-timeout=250ms"])
            .expect("must parse")
            .config()
            .expect("must be valid");
        let server = config.proxy_server(Idle, crate::netns::NetnsCache::shared());
        assert!(!server.is_connected());
        assert!(format!("{server:?}").contains("ack_timeout: 250ms"), "{server:?}");
    }

    #[test]
    fn test_parse_timeout() {
        for (input, expected) in [
            ("0", Some(Duration::ZERO)),
            ("250ms", Some(Duration::from_millis(250))),
            ("5s", Some(Duration::from_secs(5))),
            (" 2m ", Some(Duration::from_secs(120))),
            ("1h", Some(Duration::from_secs(60 * 60))),
            ("1d", Some(Duration::from_secs(60 * 60 * 24))),
            ("5", None),
            ("5w", None),
            ("s", None),
            ("18446744073709551615d", None),
            ("4294967296ms", None),
            ("1.5s", None),
        ] {
            assert_eq!(parse_timeout(input).ok(), expected, "{input}");
        }
    }
}
