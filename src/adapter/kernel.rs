//! Kernel configuration contract.
//!
//! The datastore manager never talks to the operating system directly. A
//! commit is lowered to a sequence of calls against [`KernelAdapter`], which
//! a platform backend implements with the appropriate system calls.
use std::{collections::BTreeMap, fmt};

use thiserror::Error;

pub type Attributes = BTreeMap<String, String>;

/// Interface object classes the kernel knows how to configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Ethernet,
    Loopback,
    Wireless,
    Lag,
    Vlan,
    Bridge,
    Tunnel,
    Tun,
    Tap,
    Vxlan,
    Vpn,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 11] = [
        ObjectKind::Ethernet,
        ObjectKind::Loopback,
        ObjectKind::Wireless,
        ObjectKind::Lag,
        ObjectKind::Vlan,
        ObjectKind::Bridge,
        ObjectKind::Tunnel,
        ObjectKind::Tun,
        ObjectKind::Tap,
        ObjectKind::Vxlan,
        ObjectKind::Vpn,
    ];

    /// Interface type identity as it appears in the `type` leaf.
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjectKind::Ethernet => "ethernetCsmacd",
            ObjectKind::Loopback => "softwareLoopback",
            ObjectKind::Wireless => "ieee80211",
            ObjectKind::Lag => "ieee8023adLag",
            ObjectKind::Vlan => "l2vlan",
            ObjectKind::Bridge => "bridge",
            ObjectKind::Tunnel => "tunnel",
            ObjectKind::Tun => "tun",
            ObjectKind::Tap => "tap",
            ObjectKind::Vxlan => "vxlan",
            ObjectKind::Vpn => "wireguard",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        let name = name.rsplit(':').next().unwrap_or(name);
        Self::ALL.into_iter().find(|k| k.type_name() == name)
    }

    /// Guess the class of an interface from its driver-style name
    /// (`lo0`, `vlan100`, `lagg0`, `em0`, ...).
    pub fn infer(name: &str) -> Self {
        let driver = name.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.');
        match driver {
            "lo" => ObjectKind::Loopback,
            "vlan" => ObjectKind::Vlan,
            "bridge" => ObjectKind::Bridge,
            "lagg" => ObjectKind::Lag,
            "gif" | "gre" => ObjectKind::Tunnel,
            "tun" => ObjectKind::Tun,
            "tap" => ObjectKind::Tap,
            "vxlan" => ObjectKind::Vxlan,
            "wg" | "ovpn" => ObjectKind::Vpn,
            "wlan" => ObjectKind::Wireless,
            _ if name.contains('.') => ObjectKind::Vlan,
            _ => ObjectKind::Ethernet,
        }
    }

    /// Cloned interfaces are created and destroyed; hardware interfaces are
    /// only ever reconfigured.
    pub fn is_cloned(&self) -> bool {
        !matches!(self, ObjectKind::Ethernet | ObjectKind::Wireless)
    }

    /// Creation rank: lower ranks must exist before higher ones reference them.
    pub fn rank(&self) -> u8 {
        match self {
            ObjectKind::Ethernet | ObjectKind::Loopback | ObjectKind::Wireless => 0,
            ObjectKind::Lag => 1,
            ObjectKind::Vlan => 2,
            ObjectKind::Bridge => 3,
            ObjectKind::Tunnel
            | ObjectKind::Tun
            | ObjectKind::Tap
            | ObjectKind::Vxlan
            | ObjectKind::Vpn => 4,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelObject {
    pub kind: ObjectKind,
    pub name: String,
    pub attributes: Attributes,
}

impl KernelObject {
    pub fn new(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Addresses configured on the object, as `ip/prefix-length` strings.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.attribute("addresses")
            .into_iter()
            .flat_map(|a| a.split(','))
            .filter(|a| !a.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHandle {
    pub kind: ObjectKind,
    pub name: String,
    pub index: u32,
}

/// A forwarding entry. Table 0 is the default table; other tables belong to
/// VRFs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Route {
    pub table: u32,
    pub destination: String,
    pub gateway: Option<String>,
    pub interface: Option<String>,
    pub metric: u32,
}

impl Route {
    pub fn new(table: u32, destination: impl Into<String>) -> Self {
        Self {
            table,
            destination: destination.into(),
            gateway: None,
            interface: None,
            metric: 0,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (table {})", self.destination, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vrf {
    pub name: String,
    pub table: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("kernel refused {operation} of {object}: {reason}")]
pub struct KernelError {
    pub operation: String,
    pub object: String,
    pub reason: String,
}

impl KernelError {
    pub fn new(
        operation: impl Into<String>,
        object: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            object: object.into(),
            reason: reason.into(),
        }
    }
}

/// Operations a platform backend provides to the commit pipeline.
pub trait KernelAdapter: Send {
    fn enumerate(&self, kind: ObjectKind) -> Result<Vec<KernelObject>, KernelError>;

    fn create(&mut self, object: &KernelObject) -> Result<ObjectHandle, KernelError>;

    fn modify(
        &mut self,
        kind: ObjectKind,
        name: &str,
        attributes: &Attributes,
    ) -> Result<(), KernelError>;

    fn destroy(&mut self, kind: ObjectKind, name: &str) -> Result<(), KernelError>;

    fn route_add(&mut self, route: &Route) -> Result<(), KernelError>;

    fn route_remove(&mut self, route: &Route) -> Result<(), KernelError>;

    fn route_modify(&mut self, route: &Route) -> Result<(), KernelError>;

    fn vrf_create(&mut self, vrf: &Vrf) -> Result<(), KernelError>;

    fn vrf_destroy(&mut self, name: &str) -> Result<(), KernelError>;

    fn vrf_add_route(&mut self, table: u32, route: &Route) -> Result<(), KernelError>;

    fn vrf_list_routes(&self, table: u32) -> Result<Vec<Route>, KernelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_kind_from_interface_name() {
        let inputs = vec![
            ("lo1", ObjectKind::Loopback),
            ("vlan100", ObjectKind::Vlan),
            ("em0.20", ObjectKind::Vlan),
            ("bridge0", ObjectKind::Bridge),
            ("lagg0", ObjectKind::Lag),
            ("gif0", ObjectKind::Tunnel),
            ("tap3", ObjectKind::Tap),
            ("wg0", ObjectKind::Vpn),
            ("wlan0", ObjectKind::Wireless),
            ("igb1", ObjectKind::Ethernet),
        ];

        for (name, expected) in inputs {
            assert_eq!(ObjectKind::infer(name), expected, "{name}");
        }
    }

    #[test]
    fn type_names_parse_with_or_without_prefix() {
        assert_eq!(
            ObjectKind::from_type_name("ianaift:l2vlan"),
            Some(ObjectKind::Vlan)
        );
        assert_eq!(
            ObjectKind::from_type_name("softwareLoopback"),
            Some(ObjectKind::Loopback)
        );
        assert_eq!(ObjectKind::from_type_name("token-ring"), None);
    }

    #[test]
    fn addresses_split_on_commas() {
        let obj = KernelObject::new(ObjectKind::Loopback, "lo1")
            .with("addresses", "127.0.0.2/8,::2/128");
        assert_eq!(obj.addresses().collect::<Vec<_>>(), vec!["127.0.0.2/8", "::2/128"]);
        assert_eq!(KernelObject::new(ObjectKind::Loopback, "lo2").addresses().count(), 0);
    }
}
