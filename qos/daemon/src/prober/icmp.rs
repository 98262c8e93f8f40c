//! Single echo prober

use super::{ip_protocol_value, Prober};
use crate::config::Module;
use crate::icmp::{EchoTransport, SessionOptions};
use crate::logger::ScrapeLogger;
use async_trait::async_trait;
use probe_common::constants::{
    ICMP_DURATION_SECONDS, ICMP_DURATION_SECONDS_HELP, IP_PROTOCOL, IP_PROTOCOL_HELP,
};
use prometheus::{Gauge, GaugeVec, Opts, Registry};
use tokio::time::{timeout_at, Instant};

const SEQ: u16 = 0;

/// Sends one echo request and waits for its reply
pub struct IcmpProber<T> {
    transport: T,
}

impl<T: EchoTransport> IcmpProber<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<T: EchoTransport> Prober for IcmpProber<T> {
    async fn probe(
        &self,
        deadline: Instant,
        target: &str,
        module: &Module,
        registry: &Registry,
        logger: &ScrapeLogger,
    ) -> bool {
        let duration = match GaugeVec::new(
            Opts::new(ICMP_DURATION_SECONDS, ICMP_DURATION_SECONDS_HELP),
            &["phase"],
        ) {
            Ok(gauge) => gauge,
            Err(err) => {
                logger.error("Failed to create metrics", &[("err", &err)]);
                return false;
            }
        };
        let protocol = match Gauge::new(IP_PROTOCOL, IP_PROTOCOL_HELP) {
            Ok(gauge) => gauge,
            Err(err) => {
                logger.error("Failed to create metrics", &[("err", &err)]);
                return false;
            }
        };
        if let Err(err) = registry
            .register(Box::new(duration.clone()))
            .and_then(|_| registry.register(Box::new(protocol.clone())))
        {
            logger.error("Failed to register metrics", &[("err", &err)]);
            return false;
        }
        for phase in ["setup", "rtt"] {
            duration.with_label_values(&[phase]);
        }

        let params = &module.icmp;
        let options = SessionOptions {
            packet_size: params.payload_size,
            ttl: params.ttl,
            privileged: params.privileged,
            ip_protocol: params.preferred_ip_protocol,
        };

        let setup_start = Instant::now();
        let mut session = match timeout_at(deadline, self.transport.open(target, &options)).await {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => {
                logger.error("Error creating socket", &[("err", &err)]);
                return false;
            }
            Err(_) => {
                logger.error("Timeout creating socket", &[]);
                return false;
            }
        };
        duration
            .with_label_values(&["setup"])
            .set(setup_start.elapsed().as_secs_f64());
        protocol.set(ip_protocol_value(session.remote()));

        logger.info("Creating ICMP packet", &[("address", &session.remote()), ("seq", &SEQ)]);
        if let Err(err) = session.send(SEQ).await {
            logger.error("Error writing to socket", &[("err", &err)]);
            return false;
        }

        loop {
            match timeout_at(deadline, session.recv()).await {
                Ok(Ok(reply)) if reply.seq == SEQ => {
                    duration
                        .with_label_values(&["rtt"])
                        .set(reply.rtt.as_secs_f64());
                    logger.info("Found matching reply packet", &[("rtt", &format!("{:?}", reply.rtt))]);
                    return true;
                }
                Ok(Ok(_)) => continue,
                Ok(Err(err)) => {
                    logger.error("Error reading from socket", &[("err", &err)]);
                    return false;
                }
                Err(_) => {
                    logger.warn("Timeout reading from socket", &[]);
                    return false;
                }
            }
        }
    }
}
