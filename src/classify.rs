//! Address classification for outbound targets.
//!
//! [`classify`] maps a numeric address to the network category it belongs
//! to. Categories are checked in a fixed order so that overlapping ranges
//! always produce the same label:
//!
//! 1. the cloud metadata endpoint (`169.254.169.254`)
//! 2. loopback
//! 3. link-local
//! 4. private (RFC 1918, CGNAT, IPv6 ULA)
//! 5. other reserved ranges
//! 6. public

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Serialize;

/// Instance metadata service address exposed by the major cloud providers.
pub const CLOUD_METADATA_V4: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

/// Network category of a numeric address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressClassification {
    Loopback,
    LinkLocal,
    Private,
    Reserved,
    CloudMetadata,
    Public,
}

impl AddressClassification {
    pub fn is_public(self) -> bool {
        self == Self::Public
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loopback => "loopback",
            Self::LinkLocal => "link-local",
            Self::Private => "private",
            Self::Reserved => "reserved",
            Self::CloudMetadata => "cloud-metadata",
            Self::Public => "public",
        }
    }
}

impl fmt::Display for AddressClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an address. Total and side-effect free.
pub fn classify(ip: IpAddr) -> AddressClassification {
    match ip {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => classify_v6(v6),
    }
}

fn classify_v4(ip: Ipv4Addr) -> AddressClassification {
    if ip == CLOUD_METADATA_V4 {
        return AddressClassification::CloudMetadata;
    }
    let octets = ip.octets();
    // 127.0.0.0/8
    if octets[0] == 127 {
        return AddressClassification::Loopback;
    }
    // 169.254.0.0/16
    if octets[0] == 169 && octets[1] == 254 {
        return AddressClassification::LinkLocal;
    }
    if is_private_v4(octets) {
        return AddressClassification::Private;
    }
    if is_reserved_v4(octets) {
        return AddressClassification::Reserved;
    }
    AddressClassification::Public
}

fn is_private_v4(octets: [u8; 4]) -> bool {
    // 10.0.0.0/8
    octets[0] == 10
        // 172.16.0.0/12
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        // 192.168.0.0/16
        || (octets[0] == 192 && octets[1] == 168)
        // 100.64.0.0/10 (CGNAT / shared address space)
        || (octets[0] == 100 && (64..=127).contains(&octets[1]))
}

fn is_reserved_v4(octets: [u8; 4]) -> bool {
    // 0.0.0.0/8 ("this network")
    octets[0] == 0
        // 192.0.0.0/24 (IETF protocol assignments)
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
        // 192.0.2.0/24, 198.51.100.0/24, 203.0.113.0/24 (documentation)
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 2)
        || (octets[0] == 198 && octets[1] == 51 && octets[2] == 100)
        || (octets[0] == 203 && octets[1] == 0 && octets[2] == 113)
        // 198.18.0.0/15 (benchmark testing)
        || (octets[0] == 198 && (18..=19).contains(&octets[1]))
        // 224.0.0.0/4 (multicast), 240.0.0.0/4 (future use + broadcast)
        || octets[0] >= 224
}

/// IPv4 destination carried inside an IPv6 address: IPv4-mapped
/// (`::ffff:0:0/96`), NAT64 well-known prefix (`64:ff9b::/96`) or 6to4
/// (`2002::/16`).
fn embedded_v4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return Some(v4);
    }
    let segments = ip.segments();
    let octets = ip.octets();
    let nat64 = segments[0] == 0x0064 && segments[1] == 0xff9b;
    if nat64 && segments[2..6].iter().all(|s| *s == 0) {
        return Some(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]));
    }
    if segments[0] == 0x2002 {
        return Some(Ipv4Addr::new(octets[2], octets[3], octets[4], octets[5]));
    }
    None
}

fn classify_v6(ip: Ipv6Addr) -> AddressClassification {
    if let Some(v4) = embedded_v4(ip) {
        return classify_v4(v4);
    }
    if ip.is_loopback() {
        return AddressClassification::Loopback;
    }
    let segments = ip.segments();
    // fe80::/10
    if segments[0] & 0xffc0 == 0xfe80 {
        return AddressClassification::LinkLocal;
    }
    // fc00::/7 (ULA)
    if segments[0] & 0xfe00 == 0xfc00 {
        return AddressClassification::Private;
    }
    // :: unspecified, ff00::/8 multicast, 2001:db8::/32 documentation,
    // ::/96 deprecated IPv4-compatible
    if ip.is_unspecified()
        || segments[0] & 0xff00 == 0xff00
        || (segments[0] == 0x2001 && segments[1] == 0x0db8)
        || segments[..6].iter().all(|s| *s == 0)
    {
        return AddressClassification::Reserved;
    }
    AddressClassification::Public
}
