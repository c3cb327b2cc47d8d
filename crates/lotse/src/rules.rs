//! Forwarding rule installation.
//!
//! The port manager realizes each persisted mapping through a
//! [`RuleInstaller`]. The shipped [`IptablesInstaller`] programs iptables
//! NAT rules; tests substitute their own installers to exercise failure
//! paths without touching the network stack.

use std::net::IpAddr;
use std::process::Command;

use lotse_common::{ContainerId, LotseError, LotseResult};

use crate::mapping::PortMapping;

/// Handle to one installed forwarding rule.
///
/// Carries everything needed to remove the rule again, so handles can be
/// rebuilt from persisted records after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleHandle {
    /// Container owning the rule.
    pub id: ContainerId,
    /// Network the container is attached to.
    pub network: String,
    /// The mapping the rule realizes.
    pub mapping: PortMapping,
}

impl RuleHandle {
    /// Create a handle for a mapping.
    #[must_use]
    pub fn new(id: ContainerId, network: impl Into<String>, mapping: PortMapping) -> Self {
        Self {
            id,
            network: network.into(),
            mapping,
        }
    }
}

/// Realizes mapping records as active forwarding rules.
pub trait RuleInstaller: Send + Sync {
    /// Install the forwarding rule for one mapping.
    ///
    /// # Errors
    ///
    /// Returns [`LotseError::Install`] if the rule cannot be realized.
    fn install(
        &self,
        id: &ContainerId,
        network: &str,
        mapping: &PortMapping,
    ) -> LotseResult<RuleHandle>;

    /// Remove a previously installed rule.
    ///
    /// # Errors
    ///
    /// Returns [`LotseError::Install`] if the rule cannot be removed.
    fn uninstall(&self, handle: &RuleHandle) -> LotseResult<()>;
}

impl<T: RuleInstaller + ?Sized> RuleInstaller for std::sync::Arc<T> {
    fn install(
        &self,
        id: &ContainerId,
        network: &str,
        mapping: &PortMapping,
    ) -> LotseResult<RuleHandle> {
        (**self).install(id, network, mapping)
    }

    fn uninstall(&self, handle: &RuleHandle) -> LotseResult<()> {
        (**self).uninstall(handle)
    }
}

/// Rule installer backed by iptables NAT rules.
///
/// Each mapping becomes three rules tagged with a per-container comment:
/// a PREROUTING DNAT for external traffic, an OUTPUT DNAT for localhost
/// traffic, and a POSTROUTING MASQUERADE for return traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct IptablesInstaller;

impl IptablesInstaller {
    /// Create a new iptables-backed installer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Derive the DNAT destination address from the record's network text.
    ///
    /// Accepts a plain address (`10.88.0.2`) or CIDR notation
    /// (`10.88.0.2/16`), of which the address part is used.
    fn container_address(network: &str) -> LotseResult<IpAddr> {
        let addr = network.split('/').next().unwrap_or(network);
        addr.parse().map_err(|_| LotseError::Install {
            message: format!("cannot derive container address from network {network:?}"),
        })
    }

    fn comment(id: &ContainerId) -> String {
        format!("lotse-{id}")
    }
}

impl RuleInstaller for IptablesInstaller {
    fn install(
        &self,
        id: &ContainerId,
        network: &str,
        mapping: &PortMapping,
    ) -> LotseResult<RuleHandle> {
        tracing::debug!(
            id = %id,
            host_port = mapping.host_port,
            container_port = mapping.container_port,
            protocol = %mapping.protocol,
            "Installing forwarding rule"
        );

        let container_address = Self::container_address(network)?.to_string();

        // Pre-compute strings that we need references to
        let host_address = mapping.host_address.to_string();
        let host_port = mapping.host_port.to_string();
        let container_port = mapping.container_port.to_string();
        let dest = format!("{}:{}", container_address, mapping.container_port);
        let comment = Self::comment(id);

        // PREROUTING DNAT rule for external traffic
        let mut args: Vec<&str> = vec![
            "-t",
            "nat",
            "-A",
            "PREROUTING",
            "-p",
            mapping.protocol.as_str(),
            "--dport",
            &host_port,
            "-j",
            "DNAT",
            "--to-destination",
            &dest,
            "-m",
            "comment",
            "--comment",
            &comment,
        ];

        // An unspecified host address forwards traffic on every interface.
        if !mapping.host_address.is_unspecified() {
            args.insert(4, "-d");
            args.insert(5, &host_address);
        }

        run_iptables(&args)?;

        // OUTPUT DNAT rule for localhost traffic
        run_iptables(&[
            "-t",
            "nat",
            "-A",
            "OUTPUT",
            "-p",
            mapping.protocol.as_str(),
            "-d",
            "127.0.0.1",
            "--dport",
            &host_port,
            "-j",
            "DNAT",
            "--to-destination",
            &dest,
            "-m",
            "comment",
            "--comment",
            &comment,
        ])?;

        // MASQUERADE rule for return traffic
        run_iptables(&[
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-p",
            mapping.protocol.as_str(),
            "-d",
            &container_address,
            "--dport",
            &container_port,
            "-j",
            "MASQUERADE",
            "-m",
            "comment",
            "--comment",
            &comment,
        ])?;

        Ok(RuleHandle::new(id.clone(), network, mapping.clone()))
    }

    fn uninstall(&self, handle: &RuleHandle) -> LotseResult<()> {
        tracing::debug!(
            id = %handle.id,
            host_port = handle.mapping.host_port,
            "Removing forwarding rule"
        );

        let container_address = Self::container_address(&handle.network)?.to_string();
        let mapping = &handle.mapping;

        let host_address = mapping.host_address.to_string();
        let host_port = mapping.host_port.to_string();
        let container_port = mapping.container_port.to_string();
        let dest = format!("{}:{}", container_address, mapping.container_port);
        let comment = Self::comment(&handle.id);

        let mut args: Vec<&str> = vec![
            "-t",
            "nat",
            "-D",
            "PREROUTING",
            "-p",
            mapping.protocol.as_str(),
            "--dport",
            &host_port,
            "-j",
            "DNAT",
            "--to-destination",
            &dest,
            "-m",
            "comment",
            "--comment",
            &comment,
        ];

        if !mapping.host_address.is_unspecified() {
            args.insert(4, "-d");
            args.insert(5, &host_address);
        }

        run_iptables(&args)?;

        run_iptables(&[
            "-t",
            "nat",
            "-D",
            "OUTPUT",
            "-p",
            mapping.protocol.as_str(),
            "-d",
            "127.0.0.1",
            "--dport",
            &host_port,
            "-j",
            "DNAT",
            "--to-destination",
            &dest,
            "-m",
            "comment",
            "--comment",
            &comment,
        ])?;

        run_iptables(&[
            "-t",
            "nat",
            "-D",
            "POSTROUTING",
            "-p",
            mapping.protocol.as_str(),
            "-d",
            &container_address,
            "--dport",
            &container_port,
            "-j",
            "MASQUERADE",
            "-m",
            "comment",
            "--comment",
            &comment,
        ])?;

        Ok(())
    }
}

/// Run an iptables command.
fn run_iptables(args: &[&str]) -> LotseResult<()> {
    let status = Command::new("iptables")
        .args(args)
        .status()
        .map_err(|e| LotseError::Install {
            message: format!("failed to execute iptables: {e}"),
        })?;

    if !status.success() {
        return Err(LotseError::Install {
            message: format!("iptables command failed: {args:?}"),
        });
    }

    Ok(())
}
