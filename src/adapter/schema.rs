//! Schema library contract and the built-in schema context.
//!
//! # Overview
//!
//! The protocol core treats configuration as opaque trees. Everything that
//! needs to know what an element *means* (which elements are lists and what
//! their keys are, which values are legal, which references must resolve)
//! goes through a [`SchemaLibrary`].
//!
//! [`SchemaContext`] is the library the server ships with. Its modules are
//! compiled in as static tables describing the surfaced data models:
//!
//! - `ietf-interfaces`: physical, VLAN, LAG, bridge, tunnel, tun/tap, VXLAN,
//!   VPN and 802.11 interfaces with their addresses
//! - `ietf-routing`: static routes of the default table
//! - `ietf-network-instance`: VRFs, each with a routing table id and routes
//! - `ietf-yang-library`: the `modules-state` report
//!
//! # Key Components
//!
//! - [`SchemaLibrary`]: the contract consumed by the datastore manager.
//! - [`SchemaContext`]: context lifecycle (open, load module, close).
//! - [`SchemaError`]: a validation failure with the data path it refers to,
//!   e.g. `/interfaces/interface[name='lo1']/mtu`.
use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    net::IpAddr,
    path::PathBuf,
};

use log::{debug, info};
use thiserror::Error;

use crate::{
    protocol::codec::BASE_NAMESPACE,
    storage::filter::{Filter, FilterError},
    tree::Node,
};

use super::kernel::ObjectKind;

pub const INTERFACES_NAMESPACE: &str = "urn:ietf:params:xml:ns:yang:ietf-interfaces";
pub const ROUTING_NAMESPACE: &str = "urn:ietf:params:xml:ns:yang:ietf-routing";
pub const NETWORK_INSTANCE_NAMESPACE: &str = "urn:ietf:params:xml:ns:yang:ietf-network-instance";
pub const YANG_LIBRARY_NAMESPACE: &str = "urn:ietf:params:xml:ns:yang:ietf-yang-library";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    Malformed,
    UnknownModule,
    UnknownElement,
    UnknownNamespace,
    MissingElement,
    BadElement,
    InvalidValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at {path}")]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub path: String,
    pub message: String,
}

impl SchemaError {
    fn new(kind: SchemaErrorKind, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Shape of a data node as far as tree manipulation is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Container,
    List(Vec<String>),
    Leaf,
    LeafList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub revision: String,
    pub namespace: String,
}

impl ModuleInfo {
    /// Capability URI advertised in `<hello>`.
    pub fn capability(&self) -> String {
        format!(
            "{}?module={}&revision={}",
            self.namespace, self.name, self.revision
        )
    }
}

/// Operations the core needs from a schema library.
///
/// Trees handed to and returned from the library are rooted at a `<config>`
/// (or `<data>`) element whose children are module top-level containers.
pub trait SchemaLibrary: Send + Sync {
    fn modules(&self) -> &[ModuleInfo];

    /// Capability URIs for every loaded module.
    fn capabilities(&self) -> Vec<String> {
        self.modules().iter().map(ModuleInfo::capability).collect()
    }

    /// Parse an XML document into a normalized tree.
    fn parse(&self, xml: &str) -> Result<Node, SchemaError>;

    fn print(&self, tree: &Node) -> String;

    /// Attach module namespaces to unqualified elements.
    fn normalize(&self, tree: &mut Node);

    /// Schema node at `path` (element names below the root).
    fn node_kind(&self, path: &[&str]) -> Option<NodeKind>;

    /// Structural and type validation.
    fn validate(&self, tree: &Node) -> Result<(), SchemaError>;

    /// Referential constraints across the whole tree.
    fn validate_semantics(&self, tree: &Node) -> Result<(), SchemaError>;

    fn filter(&self, tree: &Node, filter: &Filter) -> Result<Node, FilterError> {
        filter.apply(tree)
    }

    /// `modules-state` describing the loaded modules.
    fn yang_library(&self) -> Node;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeafType {
    String,
    Boolean,
    Uint(u64, u64),
    Enumeration(&'static [&'static str]),
    InterfaceType,
    IpAddress,
    Prefix,
}

impl LeafType {
    fn check(&self, value: &str) -> Result<(), String> {
        let ok = match self {
            LeafType::String => true,
            LeafType::Boolean => matches!(value, "true" | "false"),
            LeafType::Uint(min, max) => value
                .parse::<u64>()
                .is_ok_and(|v| (*min..=*max).contains(&v)),
            LeafType::Enumeration(values) => values.contains(&value),
            LeafType::InterfaceType => ObjectKind::from_type_name(value).is_some(),
            LeafType::IpAddress => value.parse::<IpAddr>().is_ok(),
            LeafType::Prefix => is_prefix(value),
        };
        if ok {
            return Ok(());
        }
        Err(match self {
            LeafType::Uint(min, max) => format!("'{value}' is not in range {min}..{max}"),
            LeafType::Enumeration(values) => {
                format!("'{value}' is not one of {}", values.join(", "))
            }
            LeafType::InterfaceType => format!("'{value}' is not a known interface type"),
            LeafType::IpAddress => format!("'{value}' is not an ip address"),
            LeafType::Prefix => format!("'{value}' is not an ip prefix"),
            _ => format!("'{value}' is not a valid value"),
        })
    }
}

fn is_prefix(value: &str) -> bool {
    let Some((ip, len)) = value.split_once('/') else {
        return false;
    };
    let Ok(len) = len.parse::<u8>() else {
        return false;
    };
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => len <= 32,
        Ok(IpAddr::V6(_)) => len <= 128,
        Err(_) => false,
    }
}

#[derive(Debug)]
struct SchemaEntry {
    name: &'static str,
    kind: EntryKind,
}

#[derive(Debug)]
enum EntryKind {
    Container(&'static [SchemaEntry]),
    List(&'static [&'static str], &'static [SchemaEntry]),
    Leaf(LeafType),
    LeafList(LeafType),
}

impl EntryKind {
    fn children(&self) -> &'static [SchemaEntry] {
        match self {
            EntryKind::Container(children) | EntryKind::List(_, children) => children,
            _ => &[],
        }
    }

    fn node_kind(&self) -> NodeKind {
        match self {
            EntryKind::Container(_) => NodeKind::Container,
            EntryKind::List(keys, _) => NodeKind::List(keys.iter().map(|k| k.to_string()).collect()),
            EntryKind::Leaf(_) => NodeKind::Leaf,
            EntryKind::LeafList(_) => NodeKind::LeafList,
        }
    }
}

const fn leaf(name: &'static str, ty: LeafType) -> SchemaEntry {
    SchemaEntry {
        name,
        kind: EntryKind::Leaf(ty),
    }
}

const ADDRESS: &[SchemaEntry] = &[
    leaf("ip", LeafType::IpAddress),
    leaf("prefix-length", LeafType::Uint(0, 128)),
];

const INTERFACE: &[SchemaEntry] = &[
    leaf("name", LeafType::String),
    leaf("description", LeafType::String),
    leaf("type", LeafType::InterfaceType),
    leaf("enabled", LeafType::Boolean),
    leaf("mtu", LeafType::Uint(68, 65535)),
    leaf("vlan-id", LeafType::Uint(1, 4094)),
    leaf("parent", LeafType::String),
    SchemaEntry {
        name: "member",
        kind: EntryKind::LeafList(LeafType::String),
    },
    leaf(
        "lag-protocol",
        LeafType::Enumeration(&["lacp", "failover", "loadbalance", "roundrobin", "none"]),
    ),
    leaf("tunnel-source", LeafType::IpAddress),
    leaf("tunnel-destination", LeafType::IpAddress),
    leaf("vni", LeafType::Uint(1, 16_777_215)),
    leaf("ssid", LeafType::String),
    leaf("vrf", LeafType::String),
    SchemaEntry {
        name: "address",
        kind: EntryKind::List(&["ip"], ADDRESS),
    },
];

const ROUTE: &[SchemaEntry] = &[
    leaf("destination-prefix", LeafType::Prefix),
    leaf("next-hop", LeafType::IpAddress),
    leaf("outgoing-interface", LeafType::String),
    leaf("metric", LeafType::Uint(0, u32::MAX as u64)),
];

const STATIC_ROUTES: &[SchemaEntry] = &[SchemaEntry {
    name: "route",
    kind: EntryKind::List(&["destination-prefix"], ROUTE),
}];

const NETWORK_INSTANCE: &[SchemaEntry] = &[
    leaf("name", LeafType::String),
    leaf("description", LeafType::String),
    leaf("table-id", LeafType::Uint(1, u32::MAX as u64)),
    SchemaEntry {
        name: "static-routes",
        kind: EntryKind::Container(STATIC_ROUTES),
    },
];

#[derive(Debug)]
struct ModuleDef {
    name: &'static str,
    revision: &'static str,
    namespace: &'static str,
    /// Top-level configuration container, if the module has one.
    config: Option<SchemaEntry>,
    /// Top-level operational state container, if any.
    state: Option<&'static str>,
}

const BUILTIN_MODULES: &[ModuleDef] = &[
    ModuleDef {
        name: "ietf-interfaces",
        revision: "2018-02-20",
        namespace: INTERFACES_NAMESPACE,
        config: Some(SchemaEntry {
            name: "interfaces",
            kind: EntryKind::Container(&[SchemaEntry {
                name: "interface",
                kind: EntryKind::List(&["name"], INTERFACE),
            }]),
        }),
        state: Some("interfaces-state"),
    },
    ModuleDef {
        name: "ietf-routing",
        revision: "2018-03-13",
        namespace: ROUTING_NAMESPACE,
        config: Some(SchemaEntry {
            name: "routing",
            kind: EntryKind::Container(&[SchemaEntry {
                name: "static-routes",
                kind: EntryKind::Container(STATIC_ROUTES),
            }]),
        }),
        state: Some("routing-state"),
    },
    ModuleDef {
        name: "ietf-network-instance",
        revision: "2019-01-21",
        namespace: NETWORK_INSTANCE_NAMESPACE,
        config: Some(SchemaEntry {
            name: "network-instances",
            kind: EntryKind::Container(&[SchemaEntry {
                name: "network-instance",
                kind: EntryKind::List(&["name"], NETWORK_INSTANCE),
            }]),
        }),
        state: None,
    },
    ModuleDef {
        name: "ietf-yang-library",
        revision: "2016-06-21",
        namespace: YANG_LIBRARY_NAMESPACE,
        config: None,
        state: Some("modules-state"),
    },
];

/// Modules loaded by [`SchemaContext::with_default_modules`].
pub const DEFAULT_MODULES: &[(&str, &str)] = &[
    ("ietf-interfaces", "2018-02-20"),
    ("ietf-routing", "2018-03-13"),
    ("ietf-network-instance", "2019-01-21"),
    ("ietf-yang-library", "2016-06-21"),
];

/// The built-in schema library.
pub struct SchemaContext {
    search_paths: Vec<PathBuf>,
    loaded: Vec<&'static ModuleDef>,
    modules: Vec<ModuleInfo>,
}

impl fmt::Debug for SchemaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaContext")
            .field("search_paths", &self.search_paths)
            .field("modules", &self.modules)
            .finish()
    }
}

impl SchemaContext {
    /// An empty context resolving modules against `search_paths`.
    pub fn open(search_paths: Vec<PathBuf>) -> Self {
        debug!("opening schema context with search paths {search_paths:?}");
        Self {
            search_paths,
            loaded: Vec::new(),
            modules: Vec::new(),
        }
    }

    pub fn with_default_modules(search_paths: Vec<PathBuf>) -> Result<Self, SchemaError> {
        let mut ctx = Self::open(search_paths);
        for (name, revision) in DEFAULT_MODULES {
            ctx.load_module(name, Some(revision))?;
        }
        Ok(ctx)
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Load a module by name, optionally pinned to a revision. Loading an
    /// already loaded module is a no-op.
    pub fn load_module(
        &mut self,
        name: &str,
        revision: Option<&str>,
    ) -> Result<&ModuleInfo, SchemaError> {
        let def = BUILTIN_MODULES
            .iter()
            .find(|m| m.name == name && revision.is_none_or(|r| r == m.revision))
            .ok_or_else(|| {
                SchemaError::new(
                    SchemaErrorKind::UnknownModule,
                    "/",
                    format!(
                        "module {name}@{} not found in {}",
                        revision.unwrap_or("latest"),
                        display_paths(&self.search_paths)
                    ),
                )
            })?;

        let idx = match self.loaded.iter().position(|m| m.name == def.name) {
            Some(idx) => idx,
            None => {
                info!("loaded module {}@{}", def.name, def.revision);
                self.loaded.push(def);
                self.modules.push(ModuleInfo {
                    name: def.name.to_string(),
                    revision: def.revision.to_string(),
                    namespace: def.namespace.to_string(),
                });
                self.modules.len() - 1
            }
        };
        Ok(&self.modules[idx])
    }

    pub fn close(self) {
        debug!("closing schema context ({} modules)", self.modules.len());
    }

    fn module_for(&self, top: &str) -> Option<&'static ModuleDef> {
        self.loaded.iter().copied().find(|m| {
            m.config.as_ref().is_some_and(|c| c.name == top) || m.state == Some(top)
        })
    }

    fn config_root(&self, top: &str) -> Option<(&'static ModuleDef, &'static SchemaEntry)> {
        self.loaded
            .iter()
            .copied()
            .find_map(|m| m.config.as_ref().filter(|c| c.name == top).map(|c| (m, c)))
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "the built-in module set".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

fn qualify(node: &mut Node, namespace: &str) {
    if node.namespace.as_deref().is_none_or(|ns| ns == BASE_NAMESPACE) {
        node.namespace = Some(namespace.to_string());
    }
    let own = node.namespace.clone().unwrap_or_default();
    for child in &mut node.children {
        qualify(child, &own);
    }
}

/// Data path of a list entry: `{parent}/{name}[key='value']...`.
pub fn entry_path(parent: &str, node: &Node, keys: &[&str]) -> String {
    let mut path = format!("{parent}/{}", node.name);
    for key in keys {
        if let Some(value) = node.child_text(key) {
            path.push_str(&format!("[{key}='{value}']"));
        }
    }
    path
}

fn check_children(
    entries: &[SchemaEntry],
    node: &Node,
    namespace: &str,
    path: &str,
) -> Result<(), SchemaError> {
    let mut seen_leaves = HashSet::new();
    let mut seen_entries = HashSet::new();

    for child in &node.children {
        let child_path = format!("{path}/{}", child.name);
        let entry = entries.iter().find(|e| e.name == child.name).ok_or_else(|| {
            SchemaError::new(
                SchemaErrorKind::UnknownElement,
                &child_path,
                format!("unknown element '{}'", child.name),
            )
        })?;
        if child.namespace.as_deref().is_some_and(|ns| ns != namespace) {
            return Err(SchemaError::new(
                SchemaErrorKind::UnknownNamespace,
                &child_path,
                format!("element '{}' is not in namespace {namespace}", child.name),
            ));
        }

        match &entry.kind {
            EntryKind::Container(children) => {
                if child.text.as_deref().is_some_and(|t| !t.trim().is_empty()) {
                    return Err(SchemaError::new(
                        SchemaErrorKind::BadElement,
                        &child_path,
                        "container cannot carry a value",
                    ));
                }
                if !seen_leaves.insert(child.name.as_str()) {
                    return Err(SchemaError::new(
                        SchemaErrorKind::BadElement,
                        &child_path,
                        "container appears more than once",
                    ));
                }
                check_children(children, child, namespace, &child_path)?;
            }
            EntryKind::List(keys, children) => {
                let child_path = entry_path(path, child, keys);
                let mut key_values = Vec::with_capacity(keys.len());
                for key in keys.iter() {
                    let value = child.child_text(key).ok_or_else(|| {
                        SchemaError::new(
                            SchemaErrorKind::MissingElement,
                            &child_path,
                            format!("list entry is missing key '{key}'"),
                        )
                    })?;
                    key_values.push(value);
                }
                if !seen_entries.insert((child.name.as_str(), key_values)) {
                    return Err(SchemaError::new(
                        SchemaErrorKind::InvalidValue,
                        &child_path,
                        "duplicate list entry",
                    ));
                }
                check_children(children, child, namespace, &child_path)?;
            }
            EntryKind::Leaf(ty) => {
                if !child.children.is_empty() {
                    return Err(SchemaError::new(
                        SchemaErrorKind::BadElement,
                        &child_path,
                        "leaf cannot have children",
                    ));
                }
                if !seen_leaves.insert(child.name.as_str()) {
                    return Err(SchemaError::new(
                        SchemaErrorKind::BadElement,
                        &child_path,
                        "leaf appears more than once",
                    ));
                }
                ty.check(child.text.as_deref().unwrap_or("").trim())
                    .map_err(|m| SchemaError::new(SchemaErrorKind::InvalidValue, &child_path, m))?;
            }
            EntryKind::LeafList(ty) => {
                if !child.children.is_empty() {
                    return Err(SchemaError::new(
                        SchemaErrorKind::BadElement,
                        &child_path,
                        "leaf-list entry cannot have children",
                    ));
                }
                ty.check(child.text.as_deref().unwrap_or("").trim())
                    .map_err(|m| SchemaError::new(SchemaErrorKind::InvalidValue, &child_path, m))?;
            }
        }
    }
    Ok(())
}

fn texts<'a>(node: &'a Node, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    node.children_named(name)
        .filter_map(|n| n.text.as_deref())
        .map(str::trim)
}

fn check_routes(
    routes: Option<&Node>,
    interfaces: &BTreeSet<&str>,
    path: &str,
) -> Result<(), SchemaError> {
    let Some(routes) = routes else {
        return Ok(());
    };
    for route in routes.children_named("route") {
        let route_path = entry_path(path, route, &["destination-prefix"]);
        let outgoing = route.child_text("outgoing-interface").map(str::trim);
        if route.child("next-hop").is_none() && outgoing.is_none() {
            return Err(SchemaError::new(
                SchemaErrorKind::MissingElement,
                route_path,
                "route needs a next-hop or an outgoing-interface",
            ));
        }
        if let Some(ifname) = outgoing {
            if !interfaces.contains(ifname) {
                return Err(SchemaError::new(
                    SchemaErrorKind::InvalidValue,
                    format!("{route_path}/outgoing-interface"),
                    format!("interface '{ifname}' is not configured"),
                ));
            }
        }
    }
    Ok(())
}

impl SchemaLibrary for SchemaContext {
    fn modules(&self) -> &[ModuleInfo] {
        &self.modules
    }

    fn parse(&self, xml: &str) -> Result<Node, SchemaError> {
        let mut tree = Node::parse(xml)
            .map_err(|e| SchemaError::new(SchemaErrorKind::Malformed, "/", e.to_string()))?;
        if tree.name != "config" && tree.name != "data" {
            tree = Node::new("config").with_child(tree);
        }
        tree.name = "config".to_string();
        tree.namespace = None;
        tree.attributes.clear();
        self.normalize(&mut tree);
        Ok(tree)
    }

    fn print(&self, tree: &Node) -> String {
        tree.to_xml()
    }

    fn normalize(&self, tree: &mut Node) {
        for top in &mut tree.children {
            if let Some(module) = self.module_for(&top.name) {
                qualify(top, module.namespace);
            }
        }
    }

    fn node_kind(&self, path: &[&str]) -> Option<NodeKind> {
        let (first, rest) = path.split_first()?;
        let (_, mut entry) = self.config_root(first)?;
        for name in rest {
            entry = entry.kind.children().iter().find(|e| e.name == *name)?;
        }
        Some(entry.kind.node_kind())
    }

    fn validate(&self, tree: &Node) -> Result<(), SchemaError> {
        let mut seen = HashSet::new();
        for top in &tree.children {
            let path = format!("/{}", top.name);
            let (module, entry) = self.config_root(&top.name).ok_or_else(|| {
                SchemaError::new(
                    SchemaErrorKind::UnknownElement,
                    &path,
                    format!("no loaded module defines '{}'", top.name),
                )
            })?;
            if top.namespace.as_deref() != Some(module.namespace) {
                return Err(SchemaError::new(
                    SchemaErrorKind::UnknownNamespace,
                    &path,
                    format!(
                        "'{}' belongs to {}, not {}",
                        top.name,
                        module.namespace,
                        top.namespace.as_deref().unwrap_or("no namespace")
                    ),
                ));
            }
            if !seen.insert(top.name.as_str()) {
                return Err(SchemaError::new(
                    SchemaErrorKind::BadElement,
                    &path,
                    "container appears more than once",
                ));
            }
            check_children(entry.kind.children(), top, module.namespace, &path)?;
        }
        Ok(())
    }

    fn validate_semantics(&self, tree: &Node) -> Result<(), SchemaError> {
        let interfaces: Vec<&Node> = tree
            .child("interfaces")
            .map(|i| i.children_named("interface").collect())
            .unwrap_or_default();
        let names: BTreeSet<&str> = interfaces
            .iter()
            .filter_map(|i| i.child_text("name"))
            .map(str::trim)
            .collect();
        let instances: Vec<&Node> = tree
            .child("network-instances")
            .map(|n| n.children_named("network-instance").collect())
            .unwrap_or_default();
        let vrfs: BTreeSet<&str> = instances
            .iter()
            .filter_map(|i| i.child_text("name"))
            .map(str::trim)
            .collect();

        for iface in &interfaces {
            let name = iface.child_text("name").unwrap_or("").trim();
            let path = entry_path("/interfaces", iface, &["name"]);
            let kind = iface
                .child_text("type")
                .and_then(ObjectKind::from_type_name)
                .unwrap_or_else(|| ObjectKind::infer(name));

            if kind == ObjectKind::Vlan {
                for required in ["parent", "vlan-id"] {
                    if iface.child(required).is_none() {
                        return Err(SchemaError::new(
                            SchemaErrorKind::MissingElement,
                            format!("{path}/{required}"),
                            format!("vlan interface requires '{required}'"),
                        ));
                    }
                }
            }

            let references = texts(iface, "parent").chain(texts(iface, "member"));
            for target in references {
                if target == name || !names.contains(target) {
                    return Err(SchemaError::new(
                        SchemaErrorKind::InvalidValue,
                        &path,
                        format!("interface '{target}' is not configured"),
                    ));
                }
            }
            if let Some(vrf) = iface.child_text("vrf").map(str::trim) {
                if !vrfs.contains(vrf) {
                    return Err(SchemaError::new(
                        SchemaErrorKind::InvalidValue,
                        format!("{path}/vrf"),
                        format!("network instance '{vrf}' is not configured"),
                    ));
                }
            }
        }

        check_routes(
            tree.child("routing").and_then(|r| r.child("static-routes")),
            &names,
            "/routing/static-routes",
        )?;

        let mut tables = HashSet::new();
        for instance in &instances {
            let path = entry_path("/network-instances", instance, &["name"]);
            let table = instance.child_text("table-id").map(str::trim).ok_or_else(|| {
                SchemaError::new(
                    SchemaErrorKind::MissingElement,
                    format!("{path}/table-id"),
                    "network instance requires 'table-id'",
                )
            })?;
            if !tables.insert(table) {
                return Err(SchemaError::new(
                    SchemaErrorKind::InvalidValue,
                    format!("{path}/table-id"),
                    format!("table {table} is used by another network instance"),
                ));
            }
            check_routes(
                instance.child("static-routes"),
                &names,
                &format!("{path}/static-routes"),
            )?;
        }
        Ok(())
    }

    fn yang_library(&self) -> Node {
        let mut state = Node::new("modules-state")
            .with_namespace(YANG_LIBRARY_NAMESPACE)
            .with_child(Node::leaf("module-set-id", module_set_id(&self.modules)));
        for module in &self.modules {
            state.push(
                Node::new("module")
                    .with_child(Node::leaf("name", module.name.clone()))
                    .with_child(Node::leaf("revision", module.revision.clone()))
                    .with_child(Node::leaf("namespace", module.namespace.clone()))
                    .with_child(Node::leaf("conformance-type", "implement")),
            );
        }
        state
    }
}

/// FNV-1a over the module names and revisions.
fn module_set_id(modules: &[ModuleInfo]) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for m in modules {
        for b in m.name.bytes().chain(b"@".iter().copied()).chain(m.revision.bytes()) {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
    }
    format!("{hash:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SchemaContext {
        SchemaContext::with_default_modules(Vec::new()).unwrap()
    }

    fn config(body: &str) -> Node {
        ctx().parse(&format!("<config>{body}</config>")).unwrap()
    }

    #[test]
    fn parse_qualifies_unprefixed_elements() {
        let tree = config("<interfaces><interface><name>lo1</name></interface></interfaces>");
        let iface = tree.child("interfaces").unwrap().child("interface").unwrap();
        assert_eq!(iface.namespace.as_deref(), Some(INTERFACES_NAMESPACE));
        assert_eq!(
            iface.child("name").unwrap().namespace.as_deref(),
            Some(INTERFACES_NAMESPACE)
        );
    }

    #[test]
    fn node_kinds_follow_the_tables() {
        let ctx = ctx();
        assert_eq!(
            ctx.node_kind(&["interfaces", "interface"]),
            Some(NodeKind::List(vec!["name".to_string()]))
        );
        assert_eq!(
            ctx.node_kind(&["interfaces", "interface", "member"]),
            Some(NodeKind::LeafList)
        );
        assert_eq!(
            ctx.node_kind(&["network-instances", "network-instance", "static-routes", "route"]),
            Some(NodeKind::List(vec!["destination-prefix".to_string()]))
        );
        assert_eq!(ctx.node_kind(&["routing"]), Some(NodeKind::Container));
        assert_eq!(ctx.node_kind(&["interfaces", "bogus"]), None);
    }

    #[test]
    fn accepts_valid_interface() {
        let tree = config(
            "<interfaces><interface><name>lo1</name><mtu>1500</mtu>\
             <address><ip>127.0.0.2</ip><prefix-length>8</prefix-length></address>\
             </interface></interfaces>",
        );
        ctx().validate(&tree).unwrap();
        ctx().validate_semantics(&tree).unwrap();
    }

    #[test]
    fn rejects_out_of_range_mtu_with_path() {
        let tree = config("<interfaces><interface><name>lo1</name><mtu>12</mtu></interface></interfaces>");
        let err = ctx().validate(&tree).unwrap_err();
        assert_eq!(err.kind, SchemaErrorKind::InvalidValue);
        assert_eq!(err.path, "/interfaces/interface[name='lo1']/mtu");
    }

    #[test]
    fn rejects_unknown_elements() {
        let tree = config("<interfaces><interface><name>lo1</name><speed>10</speed></interface></interfaces>");
        assert_eq!(
            ctx().validate(&tree).unwrap_err().kind,
            SchemaErrorKind::UnknownElement
        );

        let tree = config("<widgets/>");
        assert_eq!(
            ctx().validate(&tree).unwrap_err().kind,
            SchemaErrorKind::UnknownElement
        );
    }

    #[test]
    fn rejects_foreign_namespace() {
        let tree = ctx()
            .parse(r#"<config><interfaces xmlns="urn:example:other"/></config>"#)
            .unwrap();
        assert_eq!(
            ctx().validate(&tree).unwrap_err().kind,
            SchemaErrorKind::UnknownNamespace
        );
    }

    #[test]
    fn list_entries_need_keys_and_must_be_unique() {
        let tree = config("<interfaces><interface><mtu>1500</mtu></interface></interfaces>");
        assert_eq!(
            ctx().validate(&tree).unwrap_err().kind,
            SchemaErrorKind::MissingElement
        );

        let tree = config(
            "<interfaces><interface><name>lo1</name></interface>\
             <interface><name>lo1</name></interface></interfaces>",
        );
        assert_eq!(
            ctx().validate(&tree).unwrap_err().kind,
            SchemaErrorKind::InvalidValue
        );
    }

    #[test]
    fn vlan_needs_parent_and_tag() {
        let tree = config("<interfaces><interface><name>vlan10</name><vlan-id>10</vlan-id></interface></interfaces>");
        let err = ctx().validate_semantics(&tree).unwrap_err();
        assert_eq!(err.kind, SchemaErrorKind::MissingElement);
        assert_eq!(err.path, "/interfaces/interface[name='vlan10']/parent");
    }

    #[test]
    fn references_must_resolve() {
        let tree = config(
            "<interfaces><interface><name>vlan10</name><parent>em0</parent>\
             <vlan-id>10</vlan-id></interface></interfaces>",
        );
        assert_eq!(
            ctx().validate_semantics(&tree).unwrap_err().kind,
            SchemaErrorKind::InvalidValue
        );

        let tree = config(
            "<routing><static-routes><route><destination-prefix>10.0.0.0/8</destination-prefix>\
             </route></static-routes></routing>",
        );
        assert_eq!(
            ctx().validate_semantics(&tree).unwrap_err().kind,
            SchemaErrorKind::MissingElement
        );
    }

    #[test]
    fn network_instance_tables_are_unique() {
        let tree = config(
            "<network-instances>\
             <network-instance><name>red</name><table-id>5</table-id></network-instance>\
             <network-instance><name>blue</name><table-id>5</table-id></network-instance>\
             </network-instances>",
        );
        let err = ctx().validate_semantics(&tree).unwrap_err();
        assert_eq!(err.path, "/network-instances/network-instance[name='blue']/table-id");
    }

    #[test]
    fn yang_library_lists_loaded_modules() {
        let lib = ctx().yang_library();
        assert_eq!(lib.children_named("module").count(), DEFAULT_MODULES.len());
        assert!(lib.child_text("module-set-id").is_some());
        assert!(ctx().capabilities()[0].starts_with(INTERFACES_NAMESPACE));
    }

    #[test]
    fn unknown_module_fails_to_load() {
        let mut ctx = SchemaContext::open(vec![PathBuf::from("/usr/share/yang")]);
        let err = ctx.load_module("ietf-ospf", None).unwrap_err();
        assert_eq!(err.kind, SchemaErrorKind::UnknownModule);
        assert!(ctx.load_module("ietf-routing", Some("2018-03-13")).is_ok());
        assert_eq!(ctx.modules().len(), 1);
        ctx.close();
    }
}
