//! Service Resolver - label-selected membership and member selection
//!
//! Membership is computed when a snapshot is built; selection runs per
//! request against that frozen member list and never blocks.

use crate::apis::service::TargetPort;
use crate::topology::instance::Instance;
use crate::topology::labels::Selector;
use common::{fnv1a_hash, Endpoint, MaglevTable, DEFAULT_WEIGHT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// How a ready member is chosen for a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancePolicy {
    /// Rotate through members with a per-service counter
    #[default]
    RoundRobin,
    /// Consistent hashing on the client address
    Maglev,
}

impl FromStr for LoadBalancePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "round-robin" | "roundrobin" | "rr" => Ok(LoadBalancePolicy::RoundRobin),
            "maglev" => Ok(LoadBalancePolicy::Maglev),
            other => Err(format!(
                "unknown load balancing policy '{}' (expected round-robin or maglev)",
                other
            )),
        }
    }
}

impl fmt::Display for LoadBalancePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBalancePolicy::RoundRobin => f.write_str("round-robin"),
            LoadBalancePolicy::Maglev => f.write_str("maglev"),
        }
    }
}

/// Ready instances whose labels are a superset of `selector`, ordered by name
///
/// An empty selector selects nothing.
pub fn resolve<'a, I>(instances: I, selector: &Selector) -> Vec<Instance>
where
    I: IntoIterator<Item = &'a Instance>,
{
    let mut members: Vec<Instance> = instances
        .into_iter()
        .filter(|i| i.ready && selector.matches(&i.labels))
        .cloned()
        .collect();
    members.sort_by(|a, b| a.name.cmp(&b.name));
    members
}

/// `(address, port)` pairs a Service port forwards to
///
/// Members that do not expose `target` contribute nothing.
pub fn resolve_endpoints(members: &[Instance], target: &TargetPort) -> BTreeSet<Endpoint> {
    members
        .iter()
        .filter_map(|m| target.resolve(&m.ports).map(|port| Endpoint::new(m.addr, port)))
        .collect()
}

/// Flow key for consistent hashing: client address and source port
pub fn flow_key(client: &SocketAddr) -> u64 {
    let endpoint = Endpoint::new(client.ip(), client.port());
    let mut key = [0u8; 18];
    key[0..16].copy_from_slice(&endpoint.ip_bytes());
    key[16..18].copy_from_slice(&endpoint.port.to_be_bytes());
    fnv1a_hash(&key)
}

/// Maglev key of a member: address plus instance name
///
/// The port is resolved after selection, so it stays out of the key. The
/// name keeps instances sharing an address (host networking) apart.
fn member_key(member: &Instance) -> u64 {
    let mut bytes = Endpoint::new(member.addr, 0).ip_bytes().to_vec();
    bytes.extend_from_slice(member.name.as_bytes());
    fnv1a_hash(&bytes)
}

/// Frozen member list of one Service plus its selection state
#[derive(Debug)]
pub struct MemberSet {
    members: Vec<Instance>,
    maglev: MaglevTable,
    cursor: AtomicUsize,
}

impl MemberSet {
    pub fn new(members: Vec<Instance>) -> Self {
        let keys: Vec<(u64, u16)> = members
            .iter()
            .map(|m| (member_key(m), DEFAULT_WEIGHT))
            .collect();
        Self {
            maglev: MaglevTable::build_keyed(&keys),
            members,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn members(&self) -> &[Instance] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Pick one member, `None` when the set is empty
    ///
    /// Maglev without a flow key falls back to round-robin.
    pub fn pick(&self, policy: LoadBalancePolicy, flow: Option<u64>) -> Option<&Instance> {
        if self.members.is_empty() {
            return None;
        }
        let idx = match (policy, flow) {
            (LoadBalancePolicy::Maglev, Some(key)) => self.maglev.lookup(key)?,
            _ => self.cursor.fetch_add(1, Ordering::Relaxed) % self.members.len(),
        };
        self.members.get(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::workload::ContainerPort;
    use crate::topology::labels::Labels;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};

    fn instance(name: &str, host: u8, app: &str, ready: bool) -> Instance {
        let labels: Labels = [("app".to_string(), app.to_string())].into();
        Instance {
            name: name.to_string(),
            workload: None,
            addr: IpAddr::V4(Ipv4Addr::new(10, 244, 0, host)),
            labels,
            ports: vec![ContainerPort::tcp(8080).named("http")],
            ready,
        }
    }

    fn selector(app: &str) -> Selector {
        Selector::from_pairs([("app", app)])
    }

    #[test]
    fn test_resolve_filters_by_labels_and_readiness() {
        let instances = vec![
            instance("kg-0", 10, "knowledge-graph", true),
            instance("kg-1", 11, "knowledge-graph", false),
            instance("other-0", 12, "other", true),
        ];

        let members = resolve(&instances, &selector("knowledge-graph"));
        let names: Vec<_> = members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["kg-0"]);
    }

    #[test]
    fn test_empty_selector_selects_nothing() {
        let instances = vec![instance("kg-0", 10, "knowledge-graph", true)];
        assert!(resolve(&instances, &Selector::default()).is_empty());
    }

    #[test]
    fn test_resolve_endpoints_by_number_and_name() {
        let members = vec![
            instance("kg-0", 10, "knowledge-graph", true),
            instance("kg-1", 11, "knowledge-graph", true),
        ];

        let by_number = resolve_endpoints(&members, &TargetPort::Number(8080));
        let by_name = resolve_endpoints(&members, &TargetPort::Named("http".to_string()));
        assert_eq!(by_number, by_name);
        assert_eq!(by_number.len(), 2);

        assert!(resolve_endpoints(&members, &TargetPort::Number(9090)).is_empty());
    }

    #[test]
    fn test_round_robin_rotates_evenly() {
        let set = MemberSet::new(vec![
            instance("kg-0", 10, "knowledge-graph", true),
            instance("kg-1", 11, "knowledge-graph", true),
        ]);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..100 {
            let member = set
                .pick(LoadBalancePolicy::RoundRobin, None)
                .expect("Should pick a member");
            *counts.entry(member.name.clone()).or_default() += 1;
        }
        assert_eq!(counts.get("kg-0"), Some(&50));
        assert_eq!(counts.get("kg-1"), Some(&50));
    }

    #[test]
    fn test_maglev_is_sticky_per_client() {
        let set = MemberSet::new(vec![
            instance("kg-0", 10, "knowledge-graph", true),
            instance("kg-1", 11, "knowledge-graph", true),
        ]);
        let client: SocketAddr = "192.0.2.7:51000".parse().expect("valid address");
        let key = flow_key(&client);

        let first = set
            .pick(LoadBalancePolicy::Maglev, Some(key))
            .map(|m| m.name.clone());
        for _ in 0..10 {
            let again = set
                .pick(LoadBalancePolicy::Maglev, Some(key))
                .map(|m| m.name.clone());
            assert_eq!(first, again, "Same client should land on the same member");
        }
    }

    #[test]
    fn test_maglev_spreads_members_sharing_an_address() {
        let mut kg0 = instance("kg-0", 10, "knowledge-graph", true);
        let mut kg1 = instance("kg-1", 10, "knowledge-graph", true);
        kg0.ports = vec![ContainerPort::tcp(8080)];
        kg1.ports = vec![ContainerPort::tcp(8081)];
        let set = MemberSet::new(vec![kg0, kg1]);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for port in 0..4000u16 {
            let client = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)), 20000 + port);
            let member = set
                .pick(LoadBalancePolicy::Maglev, Some(flow_key(&client)))
                .expect("Should pick a member");
            *counts.entry(member.name.clone()).or_default() += 1;
        }

        for name in ["kg-0", "kg-1"] {
            let share = counts.get(name).copied().unwrap_or_default() as f64 / 4000.0;
            assert!(
                (share - 0.5).abs() < 0.1,
                "{} got {:.2}% of flows (expected ~50%)",
                name,
                share * 100.0
            );
        }
    }

    #[test]
    fn test_empty_set_picks_nothing() {
        let set = MemberSet::new(Vec::new());
        assert!(set.pick(LoadBalancePolicy::RoundRobin, None).is_none());
        assert!(set.pick(LoadBalancePolicy::Maglev, Some(1)).is_none());
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("maglev".parse::<LoadBalancePolicy>(), Ok(LoadBalancePolicy::Maglev));
        assert_eq!("Round-Robin".parse::<LoadBalancePolicy>(), Ok(LoadBalancePolicy::RoundRobin));
        assert!("random".parse::<LoadBalancePolicy>().is_err());
    }
}
