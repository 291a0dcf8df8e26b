//! Port allocation for participant sidecars
//!
//! Each participant gets four ports (proxy ingress, proxy egress, translator
//! ingress, translator egress). They are drawn from a random source and must
//! not collide with each other or with any port already declared on the
//! workload's containers. Ports already recorded in status are kept.

use std::collections::BTreeSet;
use std::ops::Range;

use k8s_openapi::api::apps::v1::Deployment;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use wirepact_common::crd::MeshParticipantStatus;
use wirepact_common::Error;

/// Range new ports are sampled from
pub const PORT_RANGE: Range<u16> = 40000..60000;

/// Draws per port before giving up
pub const MAX_ATTEMPTS: u32 = 1000;

/// Source of candidate ports
pub trait PortSource: Send {
    /// Produce the next candidate; it may collide, the caller resamples
    fn next_candidate(&mut self) -> u16;
}

/// Uniform sampling over [`PORT_RANGE`]
pub struct RandomPorts<R> {
    rng: R,
}

impl<R: Rng> RandomPorts<R> {
    /// Wrap a random number generator
    pub fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl RandomPorts<StdRng> {
    /// Seed from the operating system
    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }
}

impl<R: Rng + Send> PortSource for RandomPorts<R> {
    fn next_candidate(&mut self) -> u16 {
        self.rng.gen_range(PORT_RANGE)
    }
}

/// Result of an allocation pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    /// Status with all four ports set
    pub status: MeshParticipantStatus,
    /// True if at least one port was newly drawn
    pub changed: bool,
}

/// Draw one port that is not in `excluded`.
pub fn next_port(
    source: &mut dyn PortSource,
    excluded: &BTreeSet<u16>,
    participant: &str,
) -> Result<u16, Error> {
    for _ in 0..MAX_ATTEMPTS {
        let candidate = source.next_candidate();
        if candidate != 0 && !excluded.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(Error::PortExhausted {
        participant: participant.to_string(),
        attempts: MAX_ATTEMPTS,
    })
}

/// Fill every zero port in `current`, keeping non-zero ones.
///
/// Ports are handled in status order; each port, kept or drawn, joins the
/// exclusion set before the next one is considered.
pub fn allocate(
    current: MeshParticipantStatus,
    used: impl IntoIterator<Item = u16>,
    source: &mut dyn PortSource,
    participant: &str,
) -> Result<Allocation, Error> {
    let mut excluded: BTreeSet<u16> = used.into_iter().collect();
    let mut ports = current.ports();
    let mut changed = false;

    for port in ports.iter_mut() {
        if *port == 0 {
            *port = next_port(source, &excluded, participant)?;
            changed = true;
        }
        excluded.insert(*port);
    }

    Ok(Allocation {
        status: MeshParticipantStatus::from_ports(ports),
        changed,
    })
}

/// All container ports declared on the deployment's pod template.
pub fn deployment_ports(deployment: &Deployment) -> BTreeSet<u16> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|pod| {
            pod.containers
                .iter()
                .flat_map(|c| c.ports.iter().flatten())
                .filter_map(|p| u16::try_from(p.container_port).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Hands out a fixed sequence of candidates
#[cfg(test)]
pub(crate) struct ScriptedPorts(std::collections::VecDeque<u16>);

#[cfg(test)]
impl ScriptedPorts {
    pub(crate) fn new(ports: &[u16]) -> Self {
        Self(ports.iter().copied().collect())
    }
}

#[cfg(test)]
impl PortSource for ScriptedPorts {
    fn next_candidate(&mut self) -> u16 {
        self.0.pop_front().expect("script ran out of ports")
    }
}
