//! Service discovery beacon.
//!
//! A beacon advertises the server's listener on the local link so that
//! management tools can find it without configuration. The daemon announces
//! once the listener is bound and withdraws on shutdown.
use std::fmt;

use log::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub address: String,
    pub port: u16,
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}", self.name, self.address, self.port)
    }
}

pub trait DiscoveryBeacon: Send {
    fn announce(&mut self, service: &ServiceDescriptor);

    fn withdraw(&mut self);
}

/// Beacon that records announcements in the log only.
#[derive(Debug, Default)]
pub struct LogBeacon {
    announced: Option<ServiceDescriptor>,
}

impl LogBeacon {
    pub fn announced(&self) -> Option<&ServiceDescriptor> {
        self.announced.as_ref()
    }
}

impl DiscoveryBeacon for LogBeacon {
    fn announce(&mut self, service: &ServiceDescriptor) {
        info!("announcing {service}");
        self.announced = Some(service.clone());
    }

    fn withdraw(&mut self) {
        if let Some(service) = self.announced.take() {
            info!("withdrawing {service}");
        }
    }
}
