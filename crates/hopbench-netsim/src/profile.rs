//! Impairment profiles: named link conditions swept by the harness.
//!
//! The built-in catalog scales one parameter at a time around a
//! 100 Mbit/s, 10 ms baseline. Composite profiles approximating real access
//! networks are available separately.

use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CatalogError {
    #[error("duplicate profile name {0:?}")]
    DuplicateName(String),
    #[error("profile {0:?} has non-positive bandwidth")]
    InvalidBandwidth(String),
    #[error("profile {0:?} has loss outside 0..=100%")]
    InvalidLoss(String),
    #[error("profile catalog is empty")]
    Empty,
}

/// Link-level conditions applied to the variable link.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpairmentProfile {
    pub name: String,
    pub bandwidth_mbps: f64,
    pub delay: Duration,
    pub jitter: Duration,
    pub loss_pct: f64,
}

impl ImpairmentProfile {
    pub fn new(
        name: impl Into<String>,
        bandwidth_mbps: f64,
        delay_ms: u64,
        jitter_ms: u64,
        loss_pct: f64,
    ) -> Self {
        Self {
            name: name.into(),
            bandwidth_mbps,
            delay: Duration::from_millis(delay_ms),
            jitter: Duration::from_millis(jitter_ms),
            loss_pct,
        }
    }
}

/// Ordered set of profiles with unique names.
#[derive(Debug, Clone)]
pub struct ProfileCatalog {
    profiles: Vec<ImpairmentProfile>,
}

impl ProfileCatalog {
    pub fn new(profiles: Vec<ImpairmentProfile>) -> Result<Self, CatalogError> {
        if profiles.is_empty() {
            return Err(CatalogError::Empty);
        }
        let mut seen = HashSet::new();
        for p in &profiles {
            if !seen.insert(p.name.clone()) {
                return Err(CatalogError::DuplicateName(p.name.clone()));
            }
            if p.bandwidth_mbps.is_nan() || p.bandwidth_mbps <= 0.0 {
                return Err(CatalogError::InvalidBandwidth(p.name.clone()));
            }
            if !(0.0..=100.0).contains(&p.loss_pct) {
                return Err(CatalogError::InvalidLoss(p.name.clone()));
            }
        }
        Ok(Self { profiles })
    }

    /// The standard sweep: baseline, then bandwidth, delay, jitter and
    /// loss scaling.
    pub fn builtin() -> Self {
        let mut profiles = vec![ImpairmentProfile::new("baseline", 100.0, 10, 0, 0.0)];

        for bw in (10..=100).step_by(10) {
            profiles.push(ImpairmentProfile::new(
                format!("bw_{bw}Mbps"),
                bw as f64,
                10,
                0,
                0.0,
            ));
        }
        for delay in [1, 5, 10, 20, 50, 100, 200, 300, 500] {
            profiles.push(ImpairmentProfile::new(
                format!("delay_{delay}ms"),
                100.0,
                delay,
                0,
                0.0,
            ));
        }
        for jitter in [0, 5, 10, 20, 30, 50, 75, 100, 150, 200] {
            profiles.push(ImpairmentProfile::new(
                format!("jitter_{jitter}ms"),
                100.0,
                10,
                jitter,
                0.0,
            ));
        }
        for loss in [0.0, 0.1, 0.25, 0.5, 0.75, 1.0, 2.0, 3.0, 5.0, 7.5, 10.0] {
            profiles.push(ImpairmentProfile::new(
                format!("loss_{loss}"),
                100.0,
                10,
                0,
                loss,
            ));
        }

        Self { profiles }
    }

    /// Composite scenarios modelled on real access networks.
    pub fn composite() -> Self {
        let profiles = vec![
            ImpairmentProfile::new("4G_urban", 20.0, 30, 5, 0.2),
            ImpairmentProfile::new("4G_rural", 5.0, 100, 20, 0.5),
            ImpairmentProfile::new("5G_ideal", 200.0, 5, 1, 0.05),
            ImpairmentProfile::new("wifi_highload", 10.0, 80, 40, 2.0),
            ImpairmentProfile::new("satellite_L1", 10.0, 300, 30, 0.2),
            ImpairmentProfile::new("satellite_L2", 10.0, 600, 50, 0.5),
            ImpairmentProfile::new("mobile_edge", 5.0, 250, 20, 1.0),
            ImpairmentProfile::new("congested_net", 1.0, 300, 100, 5.0),
            ImpairmentProfile::new("unstable_wifi", 5.0, 100, 80, 3.0),
            ImpairmentProfile::new("starlink_like", 100.0, 50, 10, 0.1),
        ];
        Self { profiles }
    }

    pub fn get(&self, name: &str) -> Option<&ImpairmentProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImpairmentProfile> {
        self.profiles.iter()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
