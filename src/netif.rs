//! Network interface selection and destination address derivation.
//!
//! Discovery datagrams can reach a server three ways, depending on what the
//! local interface supports: plain unicast to the loopback address, IPv4
//! directed broadcast, or the well-known all-nodes multicast group.  This
//! module picks a usable interface and computes the matching destination.
//! It is deliberately pure — it enumerates interfaces and does address
//! arithmetic, but opens no sockets; the engines own all I/O.
//!
//! Interfaces are referred to by OS name (`"eth0"`, `"lo"`, ...).  `None`
//! in the engine configurations means "no preference, let the OS route".

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

use ipnetwork::IpNetwork;
use pnet_datalink::{self as datalink, NetworkInterface};
use thiserror::Error;

/// IPv4 all-nodes group used for multicast discovery.
pub const MULTICAST_V4_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);

/// IPv6 all-nodes group used for multicast discovery (link-local scope).
pub const MULTICAST_V6_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// Errors from interface selection and destination derivation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetifError {
    /// No up interface carries the requested capability.
    #[error("no suitable interface found")]
    NoInterface,

    /// An interface was requested by name but the OS knows no such name.
    #[error("none interface with this name")]
    NoSuchInterface,

    /// Broadcast was requested for an IPv6 family; IPv6 has no broadcast.
    #[error("broadcast requires an IPv4 address")]
    BroadcastRequiresIpv4,

    /// The interface carries no IPv4 address to derive a directed
    /// broadcast address from.
    #[error("interface {0} has no IPv4 address to derive a broadcast address from")]
    NoBroadcastAddr(String),
}

/// The capability a caller needs from an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// The interface is a loopback device.
    Loopback,
    /// The interface supports IPv4 broadcast.
    Broadcast,
    /// The interface supports IP multicast.
    Multicast,
}

/// Address family restriction for an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddrFamily {
    /// No restriction; resolves to IPv4 when the interface has an IPv4
    /// address (or no interface is involved), IPv6 otherwise.
    #[default]
    Any,
    /// IPv4 only.
    V4,
    /// IPv6 only.
    V6,
}

// ── Selection ─────────────────────────────────────────────────────────────────

/// Finds an up interface carrying `cap` and returns its name.
///
/// When several qualify, the first one holding a non-link-local,
/// non-unspecified IPv4 address wins; otherwise enumeration order decides.
///
/// # Errors
///
/// [`NetifError::NoInterface`] when nothing qualifies — common for
/// [`Capability::Multicast`] inside minimal containers, which is why the
/// end-to-end tests treat it as a skip condition.
pub fn discover(cap: Capability) -> Result<String, NetifError> {
    let candidates: Vec<NetworkInterface> = datalink::interfaces()
        .into_iter()
        .filter(|i| i.is_up() && has_capability(i, cap))
        .collect();

    if let Some(preferred) = candidates.iter().find(|i| {
        i.ips.iter().any(|net| match net.ip() {
            IpAddr::V4(a) => !a.is_link_local() && !a.is_unspecified(),
            IpAddr::V6(_) => false,
        })
    }) {
        return Ok(preferred.name.clone());
    }
    candidates
        .first()
        .map(|i| i.name.clone())
        .ok_or(NetifError::NoInterface)
}

/// Looks an interface up by its exact OS name.
pub fn lookup(name: &str) -> Result<NetworkInterface, NetifError> {
    datalink::interfaces()
        .into_iter()
        .find(|i| i.name == name)
        .ok_or(NetifError::NoSuchInterface)
}

fn has_capability(netif: &NetworkInterface, cap: Capability) -> bool {
    match cap {
        Capability::Loopback => netif.is_loopback(),
        Capability::Broadcast => netif.is_broadcast(),
        Capability::Multicast => netif.is_multicast(),
    }
}

// ── Address derivation ────────────────────────────────────────────────────────

/// Collapses [`AddrFamily::Any`] into a concrete family for the given
/// interface: IPv4 unless the interface carries only IPv6 addresses.
pub(crate) fn resolve_family(netif: Option<&NetworkInterface>, family: AddrFamily) -> AddrFamily {
    match family {
        AddrFamily::Any => match netif {
            Some(i) if !has_ipv4(i) && has_ipv6(i) => AddrFamily::V6,
            _ => AddrFamily::V4,
        },
        concrete => concrete,
    }
}

/// Computes where a discovery request should be sent when the client has no
/// cached peer address.
///
/// - Loopback interface: the loopback unicast address of the resolved
///   family.
/// - `not_multicast` on a broadcast-capable interface: the directed
///   broadcast address derived from the interface's first IPv4 network.
/// - Otherwise: the well-known multicast group, scoped to the interface for
///   IPv6.
/// - No interface: limited broadcast (`not_multicast`) or the unscoped
///   multicast group, leaving routing to the OS.
pub fn destination_for(
    netif: Option<&NetworkInterface>,
    family: AddrFamily,
    port: u16,
    not_multicast: bool,
) -> Result<SocketAddr, NetifError> {
    let family = resolve_family(netif, family);

    if let Some(i) = netif {
        if i.is_loopback() {
            return Ok(match family {
                AddrFamily::V6 => (Ipv6Addr::LOCALHOST, port).into(),
                _ => (Ipv4Addr::LOCALHOST, port).into(),
            });
        }
        if not_multicast {
            if family == AddrFamily::V6 {
                return Err(NetifError::BroadcastRequiresIpv4);
            }
            let broadcast = directed_broadcast(i)
                .ok_or_else(|| NetifError::NoBroadcastAddr(i.name.clone()))?;
            return Ok((broadcast, port).into());
        }
        return Ok(match family {
            AddrFamily::V6 => {
                SocketAddrV6::new(MULTICAST_V6_GROUP, port, 0, i.index).into()
            }
            _ => (MULTICAST_V4_GROUP, port).into(),
        });
    }

    // No interface preference: derive a destination the default route can
    // carry.
    if not_multicast {
        if family == AddrFamily::V6 {
            return Err(NetifError::BroadcastRequiresIpv4);
        }
        return Ok((Ipv4Addr::BROADCAST, port).into());
    }
    Ok(match family {
        AddrFamily::V6 => (MULTICAST_V6_GROUP, port).into(),
        _ => (MULTICAST_V4_GROUP, port).into(),
    })
}

/// Directed broadcast address of the interface's first IPv4 network
/// (address with the host bits all set).
fn directed_broadcast(netif: &NetworkInterface) -> Option<Ipv4Addr> {
    netif.ips.iter().find_map(|net| match net {
        IpNetwork::V4(v4) => Some(v4.broadcast()),
        IpNetwork::V6(_) => None,
    })
}

/// First IPv4 address on the interface, used to scope multicast sends and
/// group joins.
pub(crate) fn first_ipv4_addr(netif: &NetworkInterface) -> Option<Ipv4Addr> {
    netif.ips.iter().find_map(|net| match net.ip() {
        IpAddr::V4(a) => Some(a),
        IpAddr::V6(_) => None,
    })
}

pub(crate) fn has_ipv4(netif: &NetworkInterface) -> bool {
    netif.ips.iter().any(|net| net.is_ipv4())
}

pub(crate) fn has_ipv6(netif: &NetworkInterface) -> bool {
    netif.ips.iter().any(|net| net.is_ipv6())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Every Unix machine has a loopback device, so selecting by the
    /// loopback capability must succeed and round-trip through `lookup`.
    #[test]
    fn test_discover_loopback_finds_a_loopback_interface() {
        let name = discover(Capability::Loopback).expect("a loopback interface must exist");
        let netif = lookup(&name).expect("discovered name must resolve");
        assert!(netif.is_loopback(), "{name} must be a loopback device");
    }

    #[test]
    fn test_lookup_unknown_name_yields_the_stable_error_string() {
        let err = lookup(":)").expect_err("no interface can be called :)");
        assert_eq!(err, NetifError::NoSuchInterface);
        assert_eq!(err.to_string(), "none interface with this name");
    }

    #[test]
    fn test_no_interface_error_has_the_stable_string() {
        assert_eq!(
            NetifError::NoInterface.to_string(),
            "no suitable interface found"
        );
    }

    #[test]
    fn test_loopback_destination_is_localhost() {
        let name = discover(Capability::Loopback).unwrap();
        let netif = lookup(&name).unwrap();

        let v4 = destination_for(Some(&netif), AddrFamily::V4, 3333, false).unwrap();
        assert_eq!(v4, SocketAddr::from((Ipv4Addr::LOCALHOST, 3333)));

        let v6 = destination_for(Some(&netif), AddrFamily::V6, 3333, false).unwrap();
        assert_eq!(v6.ip(), IpAddr::V6(Ipv6Addr::LOCALHOST));
    }

    /// Without an interface the client falls back to limited broadcast or
    /// the unscoped multicast group.
    #[test]
    fn test_destinations_without_an_interface() {
        let bc = destination_for(None, AddrFamily::Any, 4444, true).unwrap();
        assert_eq!(bc, SocketAddr::from((Ipv4Addr::BROADCAST, 4444)));

        let mc = destination_for(None, AddrFamily::Any, 4444, false).unwrap();
        assert_eq!(mc, SocketAddr::from((MULTICAST_V4_GROUP, 4444)));
    }

    #[test]
    fn test_broadcast_over_ipv6_is_rejected() {
        let err = destination_for(None, AddrFamily::V6, 4444, true).unwrap_err();
        assert_eq!(err, NetifError::BroadcastRequiresIpv4);
    }

    /// The directed broadcast address must come from the interface's own
    /// IPv4 network, with all host bits set.
    #[test]
    fn test_directed_broadcast_matches_the_interface_network() {
        // Skip quietly when the environment has no broadcast-capable
        // interface (e.g. a loopback-only network namespace).
        let Ok(name) = discover(Capability::Broadcast) else {
            return;
        };
        let netif = lookup(&name).unwrap();
        let dest = destination_for(Some(&netif), AddrFamily::V4, 5555, true).unwrap();

        let expected = netif
            .ips
            .iter()
            .find_map(|net| match net {
                IpNetwork::V4(v4) => Some(v4.broadcast()),
                IpNetwork::V6(_) => None,
            })
            .expect("a broadcast-capable interface must have an IPv4 network");
        assert_eq!(dest, SocketAddr::from((expected, 5555)));
    }

    /// A multicast destination on a named interface must target the
    /// all-nodes group.
    #[test]
    fn test_multicast_destination_targets_the_all_nodes_group() {
        let Ok(name) = discover(Capability::Multicast) else {
            return;
        };
        let netif = lookup(&name).unwrap();
        let dest = destination_for(Some(&netif), AddrFamily::V4, 6666, false).unwrap();
        assert_eq!(dest, SocketAddr::from((MULTICAST_V4_GROUP, 6666)));
    }

    #[test]
    fn test_any_family_resolves_to_v4_without_an_interface() {
        assert_eq!(resolve_family(None, AddrFamily::Any), AddrFamily::V4);
        assert_eq!(resolve_family(None, AddrFamily::V6), AddrFamily::V6);
    }
}
