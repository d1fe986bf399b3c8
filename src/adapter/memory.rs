//! In-memory kernel backend.
//!
//! Keeps interface, route and VRF tables in process memory and enforces the
//! constraints a real network stack would (unique names and addresses,
//! existing parents, known routing tables). Every call is journaled so the
//! effects of a commit or a revert can be inspected.
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::trace;

use super::kernel::{
    Attributes, KernelAdapter, KernelError, KernelObject, ObjectHandle, ObjectKind, Route, Vrf,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelCall {
    Create { kind: ObjectKind, name: String },
    Modify { kind: ObjectKind, name: String },
    Destroy { kind: ObjectKind, name: String },
    RouteAdd(Route),
    RouteRemove(Route),
    RouteModify(Route),
    VrfCreate(String),
    VrfDestroy(String),
    VrfAddRoute { table: u32, destination: String },
}

/// Operation classes that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KernelOp {
    Create,
    Modify,
    Destroy,
    Route,
}

#[derive(Debug)]
struct Interface {
    object: KernelObject,
    index: u32,
}

#[derive(Debug, Default)]
struct KernelState {
    interfaces: BTreeMap<String, Interface>,
    routes: BTreeMap<(u32, String), Route>,
    vrfs: BTreeMap<String, u32>,
    calls: Vec<KernelCall>,
    faults: BTreeSet<(KernelOp, String)>,
    next_index: u32,
}

/// Shared handle to an in-memory network stack; clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryKernel {
    state: Arc<Mutex<KernelState>>,
}

impl MemoryKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate an object that exists before any configuration is applied,
    /// such as a hardware port.
    pub fn with_object(self, object: KernelObject) -> Self {
        {
            let mut state = self.lock();
            state.next_index += 1;
            let index = state.next_index;
            state
                .interfaces
                .insert(object.name.clone(), Interface { object, index });
        }
        self
    }

    /// Make every `op` on `name` fail from now on.
    pub fn fail_on(&self, op: KernelOp, name: impl Into<String>) {
        self.lock().faults.insert((op, name.into()));
    }

    pub fn calls(&self) -> Vec<KernelCall> {
        self.lock().calls.clone()
    }

    pub fn interface(&self, name: &str) -> Option<KernelObject> {
        self.lock()
            .interfaces
            .get(name)
            .map(|i| i.object.clone())
    }

    pub fn routes(&self) -> Vec<Route> {
        self.lock().routes.values().cloned().collect()
    }

    pub fn vrfs(&self) -> BTreeMap<String, u32> {
        self.lock().vrfs.clone()
    }

    fn lock(&self) -> MutexGuard<'_, KernelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KernelState {
    fn record(&mut self, call: KernelCall) {
        trace!("kernel call: {call:?}");
        self.calls.push(call);
    }

    fn check_fault(&self, op: KernelOp, operation: &str, name: &str) -> Result<(), KernelError> {
        if self.faults.contains(&(op, name.to_string())) {
            return Err(KernelError::new(operation, name, "operation rejected"));
        }
        Ok(())
    }

    fn check_object(&self, object: &KernelObject, operation: &str) -> Result<(), KernelError> {
        for address in object.addresses() {
            let ip = address.split('/').next().unwrap_or(address);
            let clash = self.interfaces.values().find(|i| {
                i.object.name != object.name
                    && i.object
                        .addresses()
                        .any(|a| a.split('/').next() == Some(ip))
            });
            if let Some(other) = clash {
                return Err(KernelError::new(
                    operation,
                    &object.name,
                    format!("address {ip} already in use on {}", other.object.name),
                ));
            }
        }

        if let Some(parent) = object.attribute("parent") {
            if !self.interfaces.contains_key(parent) {
                return Err(KernelError::new(
                    operation,
                    &object.name,
                    format!("parent interface {parent} does not exist"),
                ));
            }
        }
        if let Some(members) = object.attribute("members") {
            for member in members.split(',').filter(|m| !m.is_empty()) {
                if !self.interfaces.contains_key(member) {
                    return Err(KernelError::new(
                        operation,
                        &object.name,
                        format!("member interface {member} does not exist"),
                    ));
                }
            }
        }
        if let Some(vrf) = object.attribute("vrf") {
            if !self.vrfs.contains_key(vrf) {
                return Err(KernelError::new(
                    operation,
                    &object.name,
                    format!("vrf {vrf} does not exist"),
                ));
            }
        }
        Ok(())
    }

    fn check_route(&self, route: &Route, operation: &str) -> Result<(), KernelError> {
        self.check_fault(KernelOp::Route, operation, &route.destination)?;
        if route.table != 0 && !self.vrfs.values().any(|t| *t == route.table) {
            return Err(KernelError::new(
                operation,
                route.to_string(),
                format!("routing table {} does not exist", route.table),
            ));
        }
        if let Some(ifname) = &route.interface {
            if !self.interfaces.contains_key(ifname) {
                return Err(KernelError::new(
                    operation,
                    route.to_string(),
                    format!("interface {ifname} does not exist"),
                ));
            }
        }
        Ok(())
    }

    fn add_route(&mut self, route: &Route, operation: &str) -> Result<(), KernelError> {
        self.check_route(route, operation)?;
        let key = (route.table, route.destination.clone());
        if self.routes.contains_key(&key) {
            return Err(KernelError::new(operation, route.to_string(), "route exists"));
        }
        self.routes.insert(key, route.clone());
        Ok(())
    }
}

impl KernelAdapter for MemoryKernel {
    fn enumerate(&self, kind: ObjectKind) -> Result<Vec<KernelObject>, KernelError> {
        Ok(self
            .lock()
            .interfaces
            .values()
            .filter(|i| i.object.kind == kind)
            .map(|i| i.object.clone())
            .collect())
    }

    fn create(&mut self, object: &KernelObject) -> Result<ObjectHandle, KernelError> {
        let mut state = self.lock();
        state.record(KernelCall::Create {
            kind: object.kind,
            name: object.name.clone(),
        });
        state.check_fault(KernelOp::Create, "create", &object.name)?;

        if state.interfaces.contains_key(&object.name) {
            return Err(KernelError::new("create", &object.name, "interface exists"));
        }
        state.check_object(object, "create")?;

        state.next_index += 1;
        let index = state.next_index;
        state.interfaces.insert(
            object.name.clone(),
            Interface {
                object: object.clone(),
                index,
            },
        );
        Ok(ObjectHandle {
            kind: object.kind,
            name: object.name.clone(),
            index,
        })
    }

    fn modify(
        &mut self,
        kind: ObjectKind,
        name: &str,
        attributes: &Attributes,
    ) -> Result<(), KernelError> {
        let mut state = self.lock();
        state.record(KernelCall::Modify {
            kind,
            name: name.to_string(),
        });
        state.check_fault(KernelOp::Modify, "modify", name)?;

        let updated = KernelObject {
            kind,
            name: name.to_string(),
            attributes: attributes.clone(),
        };
        if !state.interfaces.contains_key(name) {
            return Err(KernelError::new("modify", name, "no such interface"));
        }
        state.check_object(&updated, "modify")?;

        if let Some(iface) = state.interfaces.get_mut(name) {
            iface.object = updated;
        }
        Ok(())
    }

    fn destroy(&mut self, kind: ObjectKind, name: &str) -> Result<(), KernelError> {
        let mut state = self.lock();
        state.record(KernelCall::Destroy {
            kind,
            name: name.to_string(),
        });
        state.check_fault(KernelOp::Destroy, "destroy", name)?;

        let existing = state.interfaces.get(name).map(|i| i.object.kind);
        match existing {
            None => Err(KernelError::new("destroy", name, "no such interface")),
            Some(actual) if actual != kind => Err(KernelError::new(
                "destroy",
                name,
                format!("interface is a {actual}"),
            )),
            Some(_) => {
                state.interfaces.remove(name);
                Ok(())
            }
        }
    }

    fn route_add(&mut self, route: &Route) -> Result<(), KernelError> {
        let mut state = self.lock();
        state.record(KernelCall::RouteAdd(route.clone()));
        state.add_route(route, "route-add")
    }

    fn route_remove(&mut self, route: &Route) -> Result<(), KernelError> {
        let mut state = self.lock();
        state.record(KernelCall::RouteRemove(route.clone()));
        state.check_fault(KernelOp::Route, "route-remove", &route.destination)?;

        match state.routes.remove(&(route.table, route.destination.clone())) {
            Some(_) => Ok(()),
            None => Err(KernelError::new(
                "route-remove",
                route.to_string(),
                "no such route",
            )),
        }
    }

    fn route_modify(&mut self, route: &Route) -> Result<(), KernelError> {
        let mut state = self.lock();
        state.record(KernelCall::RouteModify(route.clone()));
        state.check_route(route, "route-modify")?;

        match state.routes.get_mut(&(route.table, route.destination.clone())) {
            Some(existing) => {
                *existing = route.clone();
                Ok(())
            }
            None => Err(KernelError::new(
                "route-modify",
                route.to_string(),
                "no such route",
            )),
        }
    }

    fn vrf_create(&mut self, vrf: &Vrf) -> Result<(), KernelError> {
        let mut state = self.lock();
        state.record(KernelCall::VrfCreate(vrf.name.clone()));
        state.check_fault(KernelOp::Create, "vrf-create", &vrf.name)?;

        if state.vrfs.contains_key(&vrf.name) || state.vrfs.values().any(|t| *t == vrf.table) {
            return Err(KernelError::new(
                "vrf-create",
                &vrf.name,
                format!("vrf or table {} exists", vrf.table),
            ));
        }
        state.vrfs.insert(vrf.name.clone(), vrf.table);
        Ok(())
    }

    fn vrf_destroy(&mut self, name: &str) -> Result<(), KernelError> {
        let mut state = self.lock();
        state.record(KernelCall::VrfDestroy(name.to_string()));
        state.check_fault(KernelOp::Destroy, "vrf-destroy", name)?;

        let table = state
            .vrfs
            .remove(name)
            .ok_or_else(|| KernelError::new("vrf-destroy", name, "no such vrf"))?;
        state.routes.retain(|(t, _), _| *t != table);
        Ok(())
    }

    fn vrf_add_route(&mut self, table: u32, route: &Route) -> Result<(), KernelError> {
        let mut state = self.lock();
        state.record(KernelCall::VrfAddRoute {
            table,
            destination: route.destination.clone(),
        });
        let route = Route {
            table,
            ..route.clone()
        };
        state.add_route(&route, "vrf-add-route")
    }

    fn vrf_list_routes(&self, table: u32) -> Result<Vec<Route>, KernelError> {
        let state = self.lock();
        if table != 0 && !state.vrfs.values().any(|t| *t == table) {
            return Err(KernelError::new(
                "vrf-list-routes",
                table.to_string(),
                "no such table",
            ));
        }
        Ok(state
            .routes
            .values()
            .filter(|r| r.table == table)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lo(name: &str) -> KernelObject {
        KernelObject::new(ObjectKind::Loopback, name)
    }

    #[test]
    fn create_and_destroy_interface() {
        let mut kernel = MemoryKernel::new();
        let handle = kernel.create(&lo("lo1").with("mtu", "1500")).unwrap();

        assert_eq!(handle.name, "lo1");
        assert_eq!(
            kernel.interface("lo1").unwrap().attribute("mtu"),
            Some("1500")
        );
        assert_eq!(kernel.enumerate(ObjectKind::Loopback).unwrap().len(), 1);

        kernel.destroy(ObjectKind::Loopback, "lo1").unwrap();
        assert!(kernel.interface("lo1").is_none());
        assert_eq!(
            kernel.calls(),
            vec![
                KernelCall::Create {
                    kind: ObjectKind::Loopback,
                    name: "lo1".to_string()
                },
                KernelCall::Destroy {
                    kind: ObjectKind::Loopback,
                    name: "lo1".to_string()
                },
            ]
        );
    }

    #[test]
    #[should_panic(expected = "already in use")]
    fn duplicate_address_is_refused() {
        let mut kernel = MemoryKernel::new().with_object(
            KernelObject::new(ObjectKind::Ethernet, "em0").with("addresses", "192.0.2.1/24"),
        );
        kernel
            .create(&lo("lo1").with("addresses", "192.0.2.1/32"))
            .unwrap();
    }

    #[test]
    fn vlan_requires_parent() {
        let mut kernel = MemoryKernel::new();
        let vlan = KernelObject::new(ObjectKind::Vlan, "vlan10").with("parent", "em0");
        assert!(kernel.create(&vlan).is_err());

        let mut kernel = kernel.with_object(KernelObject::new(ObjectKind::Ethernet, "em0"));
        assert!(kernel.create(&vlan).is_ok());
    }

    #[test]
    fn injected_fault_fails_operation() {
        let mut kernel = MemoryKernel::new();
        kernel.fail_on(KernelOp::Destroy, "lo1");
        kernel.create(&lo("lo1")).unwrap();
        assert!(kernel.destroy(ObjectKind::Loopback, "lo1").is_err());
        assert!(kernel.interface("lo1").is_some());
    }

    #[test]
    fn vrf_routes_live_in_their_table() {
        let mut kernel = MemoryKernel::new();
        kernel
            .vrf_create(&Vrf {
                name: "blue".to_string(),
                table: 5,
            })
            .unwrap();
        kernel
            .vrf_add_route(5, &Route::new(0, "10.0.0.0/8"))
            .unwrap();
        kernel.route_add(&Route::new(0, "0.0.0.0/0")).unwrap();

        let routes = kernel.vrf_list_routes(5).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].table, 5);
        assert_eq!(kernel.vrf_list_routes(0).unwrap().len(), 1);
        assert!(kernel.vrf_list_routes(6).is_err());

        kernel.vrf_destroy("blue").unwrap();
        assert_eq!(kernel.routes().len(), 1);
    }

    #[test]
    fn route_to_unknown_table_is_refused() {
        let mut kernel = MemoryKernel::new();
        assert!(kernel.route_add(&Route::new(9, "10.0.0.0/8")).is_err());
        assert!(kernel.route_remove(&Route::new(0, "10.0.0.0/8")).is_err());
    }

    #[test]
    fn clones_share_state() {
        let kernel = MemoryKernel::new();
        let mut boxed: Box<dyn KernelAdapter> = Box::new(kernel.clone());
        boxed.create(&lo("lo7")).unwrap();
        assert!(kernel.interface("lo7").is_some());
    }
}
