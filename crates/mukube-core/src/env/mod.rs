//! Execution environment module.
//!
//! The execution environment is the record shared by every supervised daemon:
//! where state lives on disk, how privileges are elevated, which addresses to
//! bind and the full port table derived from a single base port.

use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Port assignments for all supervised daemons.
///
/// Every port is derived from one base port plus a fixed offset, so a single
/// `--base-port`-style knob can move the whole cluster out of the way of
/// other software.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortTable {
    /// etcd client traffic (also the etcd health endpoint).
    pub etcd_client: u16,
    /// etcd peer traffic (single member, but etcd still binds it).
    pub etcd_peer: u16,
    /// kube-apiserver secure port.
    pub kube_api: u16,
    /// Node port reserved for the `kubernetes` service.
    pub kube_node_api: u16,
    /// kube-controller-manager secure port.
    pub kube_controller_manager: u16,
    /// kubelet healthz port (plaintext, localhost only).
    pub kubelet_health: u16,
    /// kube-proxy healthz port.
    pub kube_proxy_health: u16,
    /// kube-proxy metrics port.
    pub kube_proxy_metrics: u16,
    /// kube-scheduler healthz port.
    pub kube_scheduler_health: u16,
    /// kube-scheduler metrics port.
    pub kube_scheduler_metrics: u16,
}

impl PortTable {
    /// Derive the full port table from `base`.
    #[must_use]
    pub const fn from_base(base: u16) -> Self {
        Self {
            etcd_client: base,
            etcd_peer: base + 1,
            kube_api: base + 2,
            kube_node_api: base + 3,
            kube_controller_manager: base + 4,
            kubelet_health: base + 5,
            kube_proxy_health: base + 6,
            kube_proxy_metrics: base + 7,
            kube_scheduler_health: base + 8,
            kube_scheduler_metrics: base + 9,
        }
    }

    /// All assigned ports, in offset order.
    #[must_use]
    pub const fn all(&self) -> [u16; 10] {
        [
            self.etcd_client,
            self.etcd_peer,
            self.kube_api,
            self.kube_node_api,
            self.kube_controller_manager,
            self.kubelet_health,
            self.kube_proxy_health,
            self.kube_proxy_metrics,
            self.kube_scheduler_health,
            self.kube_scheduler_metrics,
        ]
    }
}

/// The environment every supervised daemon starts in.
#[derive(Debug, Clone)]
pub struct ExecutionEnvironment {
    /// State root; each daemon owns a subdirectory below it.
    pub workdir: PathBuf,
    /// Privilege-elevation binary used for daemons that need root
    /// (kubelet, kube-proxy).
    pub sudo_method: PathBuf,
    /// Host address all externally reachable services bind to.
    pub listen_address: Ipv4Addr,
    /// First address of the service range (the `kubernetes` service VIP).
    pub service_address: Ipv4Addr,
    /// Cluster DNS address (service address + 1).
    pub dns_address: Ipv4Addr,
    /// Port assignments for all daemons.
    pub ports: PortTable,
}

impl ExecutionEnvironment {
    /// Create an environment with ports derived from `base_port`.
    #[must_use]
    pub fn new(
        workdir: PathBuf,
        sudo_method: PathBuf,
        listen_address: Ipv4Addr,
        service_address: Ipv4Addr,
        dns_address: Ipv4Addr,
        base_port: u16,
    ) -> Self {
        Self {
            workdir,
            sudo_method,
            listen_address,
            service_address,
            dns_address,
            ports: PortTable::from_base(base_port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_table_offsets() {
        let ports = PortTable::from_base(7000);

        assert_eq!(ports.etcd_client, 7000);
        assert_eq!(ports.etcd_peer, 7001);
        assert_eq!(ports.kube_api, 7002);
        assert_eq!(ports.kube_node_api, 7003);
        assert_eq!(ports.kube_controller_manager, 7004);
        assert_eq!(ports.kubelet_health, 7005);
        assert_eq!(ports.kube_proxy_health, 7006);
        assert_eq!(ports.kube_proxy_metrics, 7007);
        assert_eq!(ports.kube_scheduler_health, 7008);
        assert_eq!(ports.kube_scheduler_metrics, 7009);
    }

    #[test]
    fn test_no_port_collisions() {
        let ports = PortTable::from_base(7000).all();

        for (i, a) in ports.iter().enumerate() {
            for b in &ports[i + 1..] {
                assert_ne!(a, b, "port table contains a collision");
            }
        }
    }
}
