//! TCP connect prober

use super::{ip_protocol_value, protocol_matches, Prober};
use crate::config::Module;
use crate::logger::ScrapeLogger;
use async_trait::async_trait;
use probe_common::constants::{
    IP_PROTOCOL, IP_PROTOCOL_HELP, TCP_CONNECT_DURATION_SECONDS, TCP_CONNECT_DURATION_SECONDS_HELP,
};
use prometheus::{Gauge, Registry};
use std::net::SocketAddr;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout_at, Instant};

/// Connects to `host:port` within the deadline
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

impl TcpProber {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(
        &self,
        deadline: Instant,
        target: &str,
        module: &Module,
        registry: &Registry,
        logger: &ScrapeLogger,
    ) -> bool {
        let (connect_duration, protocol) = match register_gauges(registry) {
            Ok(gauges) => gauges,
            Err(err) => {
                logger.error("Failed to register metrics", &[("err", &err)]);
                return false;
            }
        };

        let preferred = module.tcp.preferred_ip_protocol;
        let addrs: Vec<SocketAddr> = match timeout_at(deadline, lookup_host(target)).await {
            Ok(Ok(addrs)) => addrs.collect(),
            Ok(Err(err)) => {
                logger.error("Error resolving address", &[("err", &err)]);
                return false;
            }
            Err(_) => {
                logger.error("Timeout resolving address", &[]);
                return false;
            }
        };
        let Some(addr) = addrs
            .iter()
            .copied()
            .find(|addr| protocol_matches(addr.ip(), preferred))
            .or_else(|| addrs.first().copied())
        else {
            logger.error("Target resolved to no address", &[]);
            return false;
        };
        protocol.set(ip_protocol_value(addr.ip()));

        logger.info("Dialing TCP", &[("address", &addr)]);
        let start = Instant::now();
        match timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => {
                connect_duration.set(start.elapsed().as_secs_f64());
                logger.info("Successfully dialed", &[]);
                true
            }
            Ok(Err(err)) => {
                logger.error("Error dialing target", &[("err", &err)]);
                false
            }
            Err(_) => {
                logger.error("Timeout dialing target", &[]);
                false
            }
        }
    }
}

fn register_gauges(registry: &Registry) -> prometheus::Result<(Gauge, Gauge)> {
    let connect = Gauge::new(TCP_CONNECT_DURATION_SECONDS, TCP_CONNECT_DURATION_SECONDS_HELP)?;
    let protocol = Gauge::new(IP_PROTOCOL, IP_PROTOCOL_HELP)?;
    registry.register(Box::new(connect.clone()))?;
    registry.register(Box::new(protocol.clone()))?;
    Ok((connect, protocol))
}
