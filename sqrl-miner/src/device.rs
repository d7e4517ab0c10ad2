//! Device enumeration.
//!
//! Boards are addressed as `host[:port]`. A single spec of the form
//! `host:startPort-endPort` fans out into one logical device per port —
//! the common layout for a chassis of boards behind one bridge host.

use tracing::warn;

use crate::config::Settings;

const DEFAULT_PORT: u16 = 2000;

/// Memory hint for a board; the bitstream addresses two 4 GiB HBM stacks.
const TOTAL_MEMORY: u64 = 8 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Fpga,
}

/// Immutable identity of one logical device.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub unique_id: String,
    pub kind: DeviceKind,
    pub total_memory: u64,
    /// Core clock to apply once the DAG is staged; 0 keeps stock.
    pub target_clk: u32,
}

/// Expand the configured host specs into device descriptors.
pub fn enumerate(settings: &Settings) -> Vec<DeviceDescriptor> {
    let hosts = expand_port_range(&settings.hosts);

    hosts
        .iter()
        .enumerate()
        .map(|(index, spec)| {
            let (host, port) = split_host_port(spec);
            DeviceDescriptor {
                name: format!("SQRL TCP-FPGA ({host}:{port})"),
                unique_id: format!("sqrl-{index}"),
                host,
                port,
                kind: DeviceKind::Fpga,
                total_memory: TOTAL_MEMORY,
                target_clk: settings.target_clk,
            }
        })
        .collect()
}

/// Turn a lone `host:start-end` spec into one `host:port` entry per port.
fn expand_port_range(hosts: &[String]) -> Vec<String> {
    if hosts.len() != 1 {
        return hosts.to_vec();
    }
    let spec = &hosts[0];
    let (Some(colon), Some(dash)) = (spec.find(':'), spec.find('-')) else {
        return hosts.to_vec();
    };
    if colon > dash {
        return hosts.to_vec();
    }

    let host = &spec[..colon];
    let range = &spec[colon + 1..];
    let (start, end) = match range.split_once('-') {
        Some((s, e)) => match (s.parse::<u16>(), e.parse::<u16>()) {
            (Ok(s), Ok(e)) if s <= e => (s, e),
            _ => {
                warn!(spec, "unparseable port range, treating as single host");
                return hosts.to_vec();
            }
        },
        None => return hosts.to_vec(),
    };

    (start..=end).map(|port| format!("{host}:{port}")).collect()
}

fn split_host_port(spec: &str) -> (String, u16) {
    match spec.split_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => {
                warn!(spec, "unparseable port, using default");
                (host.to_string(), DEFAULT_PORT)
            }
        },
        None => (spec.to_string(), DEFAULT_PORT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_hosts(hosts: &[&str]) -> Settings {
        let settings = Settings::default();
        Settings {
            hosts: hosts.iter().map(|s| s.to_string()).collect(),
            ..settings
        }
    }

    #[test]
    fn port_range_expands_one_device_per_port() {
        let settings = settings_with_hosts(&["127.0.0.1:2000-2003"]);
        let devices = enumerate(&settings);

        assert_eq!(devices.len(), 4);
        for (i, device) in devices.iter().enumerate() {
            assert_eq!(device.host, "127.0.0.1");
            assert_eq!(device.port, 2000 + i as u16);
            assert_eq!(device.unique_id, format!("sqrl-{i}"));
            assert_eq!(device.total_memory, 8 * 1024 * 1024 * 1024);
            assert_eq!(device.kind, DeviceKind::Fpga);
        }
        assert_eq!(devices[0].name, "SQRL TCP-FPGA (127.0.0.1:2000)");
    }

    #[test]
    fn bare_host_uses_default_port() {
        let devices = enumerate(&settings_with_hosts(&["fpga.local"]));
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].port, 2000);
    }

    #[test]
    fn multiple_hosts_do_not_expand() {
        let devices =
            enumerate(&settings_with_hosts(&["10.0.0.1:2000-2002", "10.0.0.2:2000"]));
        assert_eq!(devices.len(), 2);
    }

    #[test]
    fn hyphenated_hostname_is_not_a_range() {
        // The dash precedes the colon, so this is a plain host:port.
        let devices = enumerate(&settings_with_hosts(&["my-fpga:2100"]));
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].host, "my-fpga");
        assert_eq!(devices[0].port, 2100);
    }
}
