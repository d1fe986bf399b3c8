//! Lowering configuration trees onto the kernel.
//!
//! A commit never hands trees to the kernel. Both the running and the
//! candidate tree are first reduced to a [`SystemConfig`] (interfaces, VRFs
//! and routes keyed by identity) and the difference between the two becomes
//! an ordered list of [`Change`]s. Every change has an inverse, so a delta
//! that fails halfway can be walked back.
//!
//! Ordering: route removals, interface destroys (dependents first), VRF
//! creations, interface modifications, interface creations (parents first),
//! VRF destroys, then route modifications and additions.
use std::collections::BTreeMap;

use log::{info, warn};
use thiserror::Error;

use crate::{
    adapter::{
        kernel::{KernelAdapter, KernelError, KernelObject, ObjectKind, Route, Vrf},
        schema::{INTERFACES_NAMESPACE, ROUTING_NAMESPACE},
    },
    tree::Node,
};

/// Interface leaves copied verbatim into kernel attributes.
const SCALAR_ATTRIBUTES: &[&str] = &[
    "description",
    "enabled",
    "mtu",
    "vlan-id",
    "parent",
    "vrf",
    "lag-protocol",
    "tunnel-source",
    "tunnel-destination",
    "vni",
    "ssid",
];

/// Kernel-facing view of a configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemConfig {
    pub interfaces: BTreeMap<String, KernelObject>,
    pub vrfs: BTreeMap<String, u32>,
    pub routes: BTreeMap<(u32, String), Route>,
}

impl SystemConfig {
    pub fn from_tree(tree: &Node) -> Self {
        let mut config = SystemConfig::default();

        let interfaces = tree
            .child("interfaces")
            .into_iter()
            .flat_map(|i| i.children_named("interface"));
        for iface in interfaces {
            let Some(object) = interface_object(iface) else {
                continue;
            };
            config.interfaces.insert(object.name.clone(), object);
        }

        if let Some(routes) = tree.child("routing").and_then(|r| r.child("static-routes")) {
            config.add_routes(0, routes);
        }

        let instances = tree
            .child("network-instances")
            .into_iter()
            .flat_map(|n| n.children_named("network-instance"));
        for instance in instances {
            let (Some(name), Some(table)) = (
                instance.child_text("name"),
                instance.child_text("table-id").and_then(|t| t.trim().parse().ok()),
            ) else {
                continue;
            };
            config.vrfs.insert(name.trim().to_string(), table);
            if let Some(routes) = instance.child("static-routes") {
                config.add_routes(table, routes);
            }
        }
        config
    }

    fn add_routes(&mut self, table: u32, routes: &Node) {
        for node in routes.children_named("route") {
            let Some(destination) = node.child_text("destination-prefix") else {
                continue;
            };
            let route = Route {
                table,
                destination: destination.trim().to_string(),
                gateway: node.child_text("next-hop").map(|s| s.trim().to_string()),
                interface: node
                    .child_text("outgoing-interface")
                    .map(|s| s.trim().to_string()),
                metric: node
                    .child_text("metric")
                    .and_then(|m| m.trim().parse().ok())
                    .unwrap_or(0),
            };
            self.routes.insert((table, route.destination.clone()), route);
        }
    }
}

fn interface_object(iface: &Node) -> Option<KernelObject> {
    let name = iface.child_text("name")?.trim();
    let kind = iface
        .child_text("type")
        .and_then(ObjectKind::from_type_name)
        .unwrap_or_else(|| ObjectKind::infer(name));

    let mut object = KernelObject::new(kind, name);
    for key in SCALAR_ATTRIBUTES {
        if let Some(value) = iface.child_text(key) {
            object.attributes.insert(key.to_string(), value.trim().to_string());
        }
    }

    let members: Vec<&str> = iface
        .children_named("member")
        .filter_map(|m| m.text.as_deref())
        .map(str::trim)
        .collect();
    if !members.is_empty() {
        object.attributes.insert("members".to_string(), members.join(","));
    }

    let addresses: Vec<String> = iface
        .children_named("address")
        .filter_map(|a| {
            let ip = a.child_text("ip")?.trim();
            Some(match a.child_text("prefix-length") {
                Some(len) => format!("{ip}/{}", len.trim()),
                None => ip.to_string(),
            })
        })
        .collect();
    if !addresses.is_empty() {
        object
            .attributes
            .insert("addresses".to_string(), addresses.join(","));
    }
    Some(object)
}

/// One kernel operation of a delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    VrfCreate(Vrf),
    VrfDestroy(Vrf),
    Create(KernelObject),
    Modify {
        before: KernelObject,
        after: KernelObject,
    },
    Destroy(KernelObject),
    RouteAdd(Route),
    RouteModify {
        before: Route,
        after: Route,
    },
    RouteRemove(Route),
}

impl Change {
    pub fn apply(&self, kernel: &mut dyn KernelAdapter) -> Result<(), KernelError> {
        match self {
            Change::VrfCreate(vrf) => kernel.vrf_create(vrf),
            Change::VrfDestroy(vrf) => kernel.vrf_destroy(&vrf.name),
            Change::Create(object) => kernel.create(object).map(|_| ()),
            Change::Modify { after, .. } => kernel.modify(after.kind, &after.name, &after.attributes),
            Change::Destroy(object) => kernel.destroy(object.kind, &object.name),
            Change::RouteAdd(route) if route.table != 0 => kernel.vrf_add_route(route.table, route),
            Change::RouteAdd(route) => kernel.route_add(route),
            Change::RouteModify { after, .. } => kernel.route_modify(after),
            Change::RouteRemove(route) => kernel.route_remove(route),
        }
    }

    /// The change that undoes this one.
    pub fn inverse(&self) -> Change {
        match self {
            Change::VrfCreate(vrf) => Change::VrfDestroy(vrf.clone()),
            Change::VrfDestroy(vrf) => Change::VrfCreate(vrf.clone()),
            Change::Create(object) => Change::Destroy(object.clone()),
            Change::Destroy(object) => Change::Create(object.clone()),
            Change::Modify { before, after } => Change::Modify {
                before: after.clone(),
                after: before.clone(),
            },
            Change::RouteAdd(route) => Change::RouteRemove(route.clone()),
            Change::RouteRemove(route) => Change::RouteAdd(route.clone()),
            Change::RouteModify { before, after } => Change::RouteModify {
                before: after.clone(),
                after: before.clone(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("{0}")]
    Rejected(KernelError),

    #[error("{error}; revert failed: {revert}")]
    RevertFailed {
        error: KernelError,
        revert: KernelError,
    },
}

/// Ordered kernel changes turning one configuration into another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub changes: Vec<Change>,
}

impl Delta {
    pub fn between(before: &Node, after: &Node) -> Self {
        Self::between_configs(&SystemConfig::from_tree(before), &SystemConfig::from_tree(after))
    }

    pub fn between_configs(before: &SystemConfig, after: &SystemConfig) -> Self {
        let mut route_removes = Vec::new();
        let mut route_updates = Vec::new();
        for (key, old) in &before.routes {
            match after.routes.get(key) {
                None => route_removes.push(Change::RouteRemove(old.clone())),
                Some(new) if new != old => route_updates.push(Change::RouteModify {
                    before: old.clone(),
                    after: new.clone(),
                }),
                Some(_) => {}
            }
        }
        let route_adds = after
            .routes
            .iter()
            .filter(|(key, _)| !before.routes.contains_key(*key))
            .map(|(_, r)| Change::RouteAdd(r.clone()));
        route_updates.extend(route_adds);

        // A VRF whose table changes is destroyed before any VRF is created.
        let mut vrf_creates = Vec::new();
        let mut vrf_retables = Vec::new();
        let mut vrf_destroys = Vec::new();
        for (name, table) in &before.vrfs {
            let old = Change::VrfDestroy(Vrf {
                name: name.clone(),
                table: *table,
            });
            match after.vrfs.get(name) {
                Some(new) if new == table => {}
                Some(_) => vrf_retables.push(old),
                None => vrf_destroys.push(old),
            }
        }
        for (name, table) in &after.vrfs {
            if before.vrfs.get(name) != Some(table) {
                vrf_creates.push(Change::VrfCreate(Vrf {
                    name: name.clone(),
                    table: *table,
                }));
            }
        }

        let mut destroys: Vec<&KernelObject> = Vec::new();
        let mut creates: Vec<&KernelObject> = Vec::new();
        let mut modifies = Vec::new();
        for (name, old) in &before.interfaces {
            match after.interfaces.get(name) {
                Some(new) if new.kind == old.kind => {
                    if new != old {
                        modifies.push(Change::Modify {
                            before: old.clone(),
                            after: new.clone(),
                        });
                    }
                }
                Some(new) => {
                    destroys.push(old);
                    creates.push(new);
                }
                None => destroys.push(old),
            }
        }
        creates.extend(
            after
                .interfaces
                .iter()
                .filter(|(name, _)| !before.interfaces.contains_key(*name))
                .map(|(_, o)| o),
        );
        destroys.sort_by_key(|o| std::cmp::Reverse(o.kind.rank()));
        creates.sort_by_key(|o| o.kind.rank());

        let mut changes = route_removes;
        changes.extend(destroys.into_iter().map(|o| {
            if o.kind.is_cloned() {
                Change::Destroy(o.clone())
            } else {
                Change::Modify {
                    before: o.clone(),
                    after: KernelObject::new(o.kind, o.name.clone()),
                }
            }
        }));
        changes.extend(vrf_retables);
        changes.extend(vrf_creates);
        changes.extend(modifies);
        changes.extend(creates.into_iter().map(|o| {
            if o.kind.is_cloned() {
                Change::Create(o.clone())
            } else {
                Change::Modify {
                    before: KernelObject::new(o.kind, o.name.clone()),
                    after: o.clone(),
                }
            }
        }));
        changes.extend(vrf_destroys);
        changes.extend(route_updates);

        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Apply every change in order. When one is refused, the changes already
    /// applied are undone in reverse order.
    pub fn apply(&self, kernel: &mut dyn KernelAdapter) -> Result<(), ApplyError> {
        for (idx, change) in self.changes.iter().enumerate() {
            info!("applying {change:?}");
            if let Err(error) = change.apply(kernel) {
                warn!("kernel refused change: {error}; reverting {idx} applied changes");
                return match revert(kernel, &self.changes[..idx]) {
                    Ok(()) => Err(ApplyError::Rejected(error)),
                    Err(revert) => Err(ApplyError::RevertFailed { error, revert }),
                };
            }
        }
        Ok(())
    }
}

fn revert(kernel: &mut dyn KernelAdapter, applied: &[Change]) -> Result<(), KernelError> {
    for change in applied.iter().rev() {
        let inverse = change.inverse();
        info!("reverting with {inverse:?}");
        inverse.apply(kernel)?;
    }
    Ok(())
}

/// `interfaces-state` built from live kernel objects.
pub fn interfaces_state(objects: &[KernelObject]) -> Node {
    let mut state = Node::new("interfaces-state").with_namespace(INTERFACES_NAMESPACE);
    for object in objects {
        let up = object.attribute("enabled") != Some("false");
        let mut iface = Node::new("interface")
            .with_child(Node::leaf("name", object.name.clone()))
            .with_child(Node::leaf("type", object.kind.type_name()))
            .with_child(Node::leaf("oper-status", if up { "up" } else { "down" }));
        if let Some(mtu) = object.attribute("mtu") {
            iface.push(Node::leaf("mtu", mtu));
        }
        for address in object.addresses() {
            let (ip, len) = address.split_once('/').unwrap_or((address, ""));
            let mut node = Node::new("address").with_child(Node::leaf("ip", ip));
            if !len.is_empty() {
                node.push(Node::leaf("prefix-length", len));
            }
            iface.push(node);
        }
        state.push(iface);
    }
    state
}

/// `routing-state` with one RIB per routing table.
pub fn routing_state(tables: &[(String, u32, Vec<Route>)]) -> Node {
    let mut ribs = Node::new("ribs");
    for (name, table, routes) in tables {
        let mut entries = Node::new("routes");
        for route in routes {
            let mut entry =
                Node::new("route").with_child(Node::leaf("destination-prefix", route.destination.clone()));
            if let Some(gateway) = &route.gateway {
                entry.push(Node::leaf("next-hop", gateway.clone()));
            }
            if let Some(interface) = &route.interface {
                entry.push(Node::leaf("outgoing-interface", interface.clone()));
            }
            entry.push(Node::leaf("metric", route.metric.to_string()));
            entries.push(entry);
        }
        ribs.push(
            Node::new("rib")
                .with_child(Node::leaf("name", name.clone()))
                .with_child(Node::leaf("table-id", table.to_string()))
                .with_child(entries),
        );
    }
    Node::new("routing-state")
        .with_namespace(ROUTING_NAMESPACE)
        .with_child(ribs)
}

#[cfg(test)]
mod tests {
    use crate::adapter::{
        memory::{KernelCall, KernelOp, MemoryKernel},
        schema::{SchemaContext, SchemaLibrary},
    };

    use super::*;

    fn tree(body: &str) -> Node {
        SchemaContext::with_default_modules(Vec::new())
            .unwrap()
            .parse(&format!("<config>{body}</config>"))
            .unwrap()
    }

    #[test]
    fn lowers_interfaces_and_routes() {
        let config = SystemConfig::from_tree(&tree(
            "<interfaces><interface><name>lo1</name><mtu>1500</mtu>\
             <address><ip>10.0.0.1</ip><prefix-length>32</prefix-length></address>\
             <address><ip>10.0.0.2</ip><prefix-length>32</prefix-length></address>\
             </interface></interfaces>\
             <routing><static-routes><route><destination-prefix>0.0.0.0/0</destination-prefix>\
             <next-hop>192.0.2.1</next-hop></route></static-routes></routing>\
             <network-instances><network-instance><name>blue</name><table-id>7</table-id>\
             </network-instance></network-instances>",
        ));

        let lo1 = &config.interfaces["lo1"];
        assert_eq!(lo1.kind, ObjectKind::Loopback);
        assert_eq!(lo1.attribute("mtu"), Some("1500"));
        assert_eq!(lo1.attribute("addresses"), Some("10.0.0.1/32,10.0.0.2/32"));
        assert_eq!(config.vrfs["blue"], 7);
        let route = &config.routes[&(0, "0.0.0.0/0".to_string())];
        assert_eq!(route.gateway.as_deref(), Some("192.0.2.1"));
    }

    #[test]
    fn orders_parents_before_children() {
        let before = Node::new("config");
        let after = tree(
            "<interfaces>\
             <interface><name>vlan10</name><parent>lagg0</parent><vlan-id>10</vlan-id></interface>\
             <interface><name>lagg0</name></interface>\
             </interfaces>",
        );
        let delta = Delta::between(&before, &after);
        let names: Vec<&str> = delta
            .changes
            .iter()
            .map(|c| match c {
                Change::Create(o) => o.name.as_str(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["lagg0", "vlan10"]);

        let teardown = Delta::between(&after, &before);
        let names: Vec<&str> = teardown
            .changes
            .iter()
            .map(|c| match c {
                Change::Destroy(o) => o.name.as_str(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["vlan10", "lagg0"]);
    }

    #[test]
    fn hardware_interfaces_are_modified_not_created() {
        let delta = Delta::between(
            &Node::new("config"),
            &tree("<interfaces><interface><name>em0</name><mtu>9000</mtu></interface></interfaces>"),
        );
        assert!(matches!(&delta.changes[..], [Change::Modify { after, .. }] if after.name == "em0"));
    }

    #[test]
    fn unchanged_trees_yield_empty_delta() {
        let t = tree("<interfaces><interface><name>lo1</name></interface></interfaces>");
        assert!(Delta::between(&t, &t).is_empty());
    }

    #[test]
    fn vrf_routes_use_vrf_table() {
        let mut kernel = MemoryKernel::new();
        let delta = Delta::between(
            &Node::new("config"),
            &tree(
                "<interfaces><interface><name>lo1</name></interface></interfaces>\
                 <network-instances><network-instance><name>blue</name><table-id>7</table-id>\
                 <static-routes><route><destination-prefix>10.0.0.0/8</destination-prefix>\
                 <outgoing-interface>lo1</outgoing-interface></route></static-routes>\
                 </network-instance></network-instances>",
            ),
        );
        delta.apply(&mut kernel).unwrap();
        assert_eq!(kernel.vrf_list_routes(7).unwrap().len(), 1);
        assert!(kernel.calls().contains(&KernelCall::VrfAddRoute {
            table: 7,
            destination: "10.0.0.0/8".to_string()
        }));
    }

    fn position(delta: &Delta, wanted: impl Fn(&Change) -> bool) -> usize {
        delta.changes.iter().position(|c| wanted(c)).unwrap()
    }

    #[test]
    fn vrf_table_change_destroys_then_recreates() {
        let vrf = |table: u32| {
            tree(&format!(
                "<network-instances><network-instance><name>red</name>\
                 <table-id>{table}</table-id><static-routes><route>\
                 <destination-prefix>10.1.0.0/16</destination-prefix>\
                 <next-hop>192.0.2.254</next-hop></route></static-routes>\
                 </network-instance></network-instances>"
            ))
        };
        let mut kernel = MemoryKernel::new();
        Delta::between(&Node::new("config"), &vrf(10))
            .apply(&mut kernel)
            .unwrap();

        let delta = Delta::between(&vrf(10), &vrf(20));
        let removed = position(&delta, |c| matches!(c, Change::RouteRemove(r) if r.table == 10));
        let destroyed = position(&delta, |c| matches!(c, Change::VrfDestroy(v) if v.table == 10));
        let created = position(&delta, |c| matches!(c, Change::VrfCreate(v) if v.table == 20));
        let added = position(&delta, |c| matches!(c, Change::RouteAdd(r) if r.table == 20));
        assert!(removed < destroyed && destroyed < created && created < added);

        delta.apply(&mut kernel).unwrap();
        assert_eq!(kernel.vrfs().get("red"), Some(&20));
        assert_eq!(kernel.vrf_list_routes(20).unwrap().len(), 1);
        assert!(kernel.vrf_list_routes(10).is_err());
    }

    #[test]
    fn failed_change_reverts_applied_ones() {
        let mut kernel = MemoryKernel::new();
        kernel.fail_on(KernelOp::Create, "lo2");
        let delta = Delta::between(
            &Node::new("config"),
            &tree(
                "<interfaces><interface><name>lo1</name></interface>\
                 <interface><name>lo2</name></interface></interfaces>",
            ),
        );

        let err = delta.apply(&mut kernel).unwrap_err();
        assert!(matches!(err, ApplyError::Rejected(_)));
        assert!(kernel.interface("lo1").is_none());
        assert_eq!(
            kernel.calls().last(),
            Some(&KernelCall::Destroy {
                kind: ObjectKind::Loopback,
                name: "lo1".to_string()
            })
        );
    }

    #[test]
    fn failed_revert_is_reported() {
        let mut kernel = MemoryKernel::new();
        kernel.fail_on(KernelOp::Create, "lo2");
        kernel.fail_on(KernelOp::Destroy, "lo1");
        let delta = Delta::between(
            &Node::new("config"),
            &tree(
                "<interfaces><interface><name>lo1</name></interface>\
                 <interface><name>lo2</name></interface></interfaces>",
            ),
        );
        assert!(matches!(
            delta.apply(&mut kernel),
            Err(ApplyError::RevertFailed { .. })
        ));
    }

    #[test]
    fn state_trees_reflect_kernel() {
        let objects = vec![
            KernelObject::new(ObjectKind::Loopback, "lo1")
                .with("enabled", "false")
                .with("addresses", "127.0.0.2/8"),
        ];
        let state = interfaces_state(&objects);
        let iface = state.child("interface").unwrap();
        assert_eq!(iface.child_text("oper-status"), Some("down"));
        assert_eq!(
            iface.child("address").unwrap().child_text("prefix-length"),
            Some("8")
        );

        let routing = routing_state(&[("default".to_string(), 0, vec![Route::new(0, "0.0.0.0/0")])]);
        let rib = routing.child("ribs").unwrap().child("rib").unwrap();
        assert_eq!(rib.child_text("table-id"), Some("0"));
    }
}
