use crate::config::processor::PluginOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficClass {
    Public,
    /// Traffic from a service address, or through a private load balancer.
    Servicenet,
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficClass::Public => write!(f, "public"),
            TrafficClass::Servicenet => write!(f, "servicenet"),
        }
    }
}

/// Splits traffic into public and servicenet.
///
/// Client addresses are only checked against `service_ips` and load
/// balancer addresses only against `lb_private_ips`.
#[derive(Debug, Clone, Default)]
pub struct TrafficClassifier {
    service_ips: BTreeSet<IpAddr>,
    lb_private_ips: BTreeSet<IpAddr>,
}

impl TrafficClassifier {
    pub fn new(options: &PluginOptions) -> Self {
        Self {
            service_ips: options.service_ips.iter().copied().collect(),
            lb_private_ips: options.lb_private_ips.iter().copied().collect(),
        }
    }

    pub fn classify(&self, client_ip: Option<IpAddr>, lb_ip: Option<IpAddr>) -> TrafficClass {
        let service_client = client_ip.is_some_and(|ip| self.service_ips.contains(&ip));
        let private_lb = lb_ip.is_some_and(|ip| self.lb_private_ips.contains(&ip));
        if service_client || private_lb {
            TrafficClass::Servicenet
        } else {
            TrafficClass::Public
        }
    }
}
