//! VXLAN tunnel commands

use super::exec::CommandSpec;
use crate::models::{tunnel_interface, TunnelEndpoint, Vni};

/// Flooding entry for the remote VTEP
const ALL_ZEROS_MAC: &str = "00:00:00:00:00:00";

/// Commands creating one side of a tunnel, in execution order
pub fn create_commands(
    vni: Vni,
    mtu: u16,
    local: &TunnelEndpoint,
    remote: &TunnelEndpoint,
    vxlan_port: u16,
) -> Vec<CommandSpec> {
    let dev = tunnel_interface(vni);
    vec![
        CommandSpec::new(
            "ip",
            [
                "link".to_string(),
                "add".to_string(),
                dev.clone(),
                "type".to_string(),
                "vxlan".to_string(),
                "id".to_string(),
                vni.to_string(),
                "local".to_string(),
                local.address.to_string(),
                "dstport".to_string(),
                vxlan_port.to_string(),
                "dev".to_string(),
                local.interface.clone(),
            ],
        ),
        CommandSpec::new(
            "ip",
            [
                "link".to_string(),
                "set".to_string(),
                "dev".to_string(),
                dev.clone(),
                "mtu".to_string(),
                mtu.to_string(),
            ],
        ),
        CommandSpec::new("ip", ["link", "set", "dev", dev.as_str(), "up"]),
        CommandSpec::new(
            "bridge",
            [
                "fdb".to_string(),
                "append".to_string(),
                ALL_ZEROS_MAC.to_string(),
                "dev".to_string(),
                dev,
                "dst".to_string(),
                remote.address.to_string(),
            ],
        ),
    ]
}

pub fn delete_command(vni: Vni) -> CommandSpec {
    CommandSpec::new("ip", ["link", "del", "dev", tunnel_interface(vni).as_str()])
}

pub fn status_command(vni: Vni) -> CommandSpec {
    CommandSpec::new("ip", ["-o", "link", "show", "dev", tunnel_interface(vni).as_str()])
}

/// `ip` reports a missing link this way; deleting one is then a no-op
pub fn is_missing_device(stderr: &str) -> bool {
    stderr.contains("Cannot find device") || stderr.contains("does not exist")
}

pub fn is_existing_device(stderr: &str) -> bool {
    stderr.contains("File exists")
}

/// Parse `ip -o link show` output; vxlan links report UNKNOWN when up
pub fn link_is_up(stdout: &str) -> bool {
    if stdout.trim().is_empty() {
        return false;
    }
    let flags_up = stdout
        .split_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .map(|(flags, _)| flags.split(',').any(|f| f == "UP"))
        .unwrap_or(false);
    flags_up && !stdout.contains("state DOWN")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(ip: &str) -> TunnelEndpoint {
        TunnelEndpoint {
            site_id: "s".into(),
            node: "n".into(),
            address: ip.parse().unwrap(),
            interface: "eth0".into(),
        }
    }

    #[test]
    fn test_create_commands() {
        let cmds = create_commands(1000, 1450, &endpoint("10.0.0.1"), &endpoint("10.0.0.2"), 4789);
        let rendered: Vec<String> = cmds.iter().map(|c| c.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "ip link add vxlan1000 type vxlan id 1000 local 10.0.0.1 dstport 4789 dev eth0",
                "ip link set dev vxlan1000 mtu 1450",
                "ip link set dev vxlan1000 up",
                "bridge fdb append 00:00:00:00:00:00 dev vxlan1000 dst 10.0.0.2",
            ]
        );
        assert_eq!(delete_command(1000).to_string(), "ip link del dev vxlan1000");
    }

    #[test]
    fn test_link_state_parsing() {
        let up = "7: vxlan1000: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1450 qdisc noqueue state UNKNOWN mode DEFAULT";
        let down = "7: vxlan1000: <BROADCAST,MULTICAST> mtu 1450 qdisc noop state DOWN mode DEFAULT";
        assert!(link_is_up(up));
        assert!(!link_is_up(down));
        assert!(!link_is_up(""));
        assert!(is_missing_device("Device \"vxlan9\" does not exist."));
    }
}
