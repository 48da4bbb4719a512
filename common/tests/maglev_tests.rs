/// Maglev Consistent Hashing Tests
///
/// Distribution and disruption properties of the member-selection table.
/// Based on the Google Maglev paper: https://research.google/pubs/pub44824/
use common::{Endpoint, MaglevTable, MAGLEV_TABLE_SIZE};
use std::net::{IpAddr, Ipv4Addr};

fn endpoint(last_octet: u8) -> Endpoint {
    Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 244, 0, last_octet)), 8080)
}

fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    let mut i = 2;
    while i * i <= n {
        if n % i == 0 {
            return false;
        }
        i += 1;
    }
    true
}

#[test]
fn test_maglev_table_size_is_prime() {
    assert!(is_prime(MAGLEV_TABLE_SIZE));
}

#[test]
fn test_maglev_single_endpoint_owns_every_slot() {
    let table = MaglevTable::build(&[endpoint(10)]);

    assert_eq!(table.len(), 1);
    assert_eq!(table.slots().len(), MAGLEV_TABLE_SIZE);
    assert!(table.slots().iter().all(|&idx| idx == 0));
}

#[test]
fn test_maglev_two_replicas_split_evenly() {
    // The declared workload runs two replicas
    let endpoints = vec![endpoint(10), endpoint(11)];
    let table = MaglevTable::build(&endpoints);

    let mut counts = vec![0usize; endpoints.len()];
    for &idx in table.slots() {
        counts[idx as usize] += 1;
    }

    for (i, count) in counts.iter().enumerate() {
        let share = *count as f64 / MAGLEV_TABLE_SIZE as f64;
        assert!(
            (share - 0.5).abs() < 0.05,
            "Endpoint {} owns {:.2}% of slots (expected ~50%)",
            i,
            share * 100.0
        );
    }
}

#[test]
fn test_maglev_flows_spread_across_three_endpoints() {
    let endpoints = vec![endpoint(10), endpoint(11), endpoint(12)];
    let table = MaglevTable::build(&endpoints);

    let mut hits = vec![0usize; endpoints.len()];
    for flow_key in 0..10_000u64 {
        let idx = table.lookup(flow_key).expect("non-empty table");
        hits[idx] += 1;
    }

    for (i, count) in hits.iter().enumerate() {
        let share = *count as f64 / 10_000.0;
        assert!(
            (share - 0.333).abs() < 0.05,
            "Endpoint {} got {:.2}% of flows (expected ~33.3%)",
            i,
            share * 100.0
        );
    }
}

#[test]
fn test_maglev_lookup_is_deterministic() {
    let endpoints = vec![endpoint(10), endpoint(11), endpoint(12)];
    let first = MaglevTable::build(&endpoints);
    let second = MaglevTable::build(&endpoints);

    assert_eq!(first, second);
    assert_eq!(first.lookup(0x1234_5678), second.lookup(0x1234_5678));
}

#[test]
fn test_maglev_minimal_disruption_on_removal() {
    let before = vec![endpoint(10), endpoint(11), endpoint(12)];
    // Instance .11 went unready
    let after = vec![endpoint(10), endpoint(12)];

    let table_before = MaglevTable::build(&before);
    let table_after = MaglevTable::build(&after);

    let mut kept = 0;
    let mut moved = 0;
    for flow_key in 0..10_000u64 {
        let old = before[table_before.lookup(flow_key).expect("non-empty")];
        if old == endpoint(11) {
            continue;
        }
        let new = after[table_after.lookup(flow_key).expect("non-empty")];
        if old == new {
            kept += 1;
        } else {
            moved += 1;
        }
    }

    let moved_share = moved as f64 / (kept + moved) as f64;
    assert!(
        moved_share < 0.2,
        "{:.2}% of surviving flows moved (expected well under 20%)",
        moved_share * 100.0
    );
}

#[test]
fn test_maglev_weight_skews_ownership() {
    let heavy = endpoint(10).with_weight(90);
    let light = endpoint(11).with_weight(10);
    let table = MaglevTable::build(&[heavy, light]);

    let heavy_slots = table.slots().iter().filter(|&&idx| idx == 0).count();
    let share = heavy_slots as f64 / MAGLEV_TABLE_SIZE as f64;
    assert!(share > 0.75, "heavy endpoint owns only {:.2}%", share * 100.0);
}

#[test]
fn test_maglev_keyed_members_sharing_an_address_split_evenly() {
    // Same address, distinct identities folded into the key
    let members: Vec<(u64, u16)> = [b"kg-0", b"kg-1"]
        .iter()
        .map(|name| {
            let mut bytes = endpoint(10).ip_bytes().to_vec();
            bytes.extend_from_slice(&name[..]);
            (common::fnv1a_hash(&bytes), 100)
        })
        .collect();
    let table = MaglevTable::build_keyed(&members);

    let first = table.slots().iter().filter(|&&idx| idx == 0).count();
    let share = first as f64 / MAGLEV_TABLE_SIZE as f64;
    assert!(
        (share - 0.5).abs() < 0.05,
        "First member owns {:.2}% of slots (expected ~50%)",
        share * 100.0
    );
}

#[test]
fn test_maglev_build_matches_keyed_build() {
    let endpoints = vec![endpoint(10), endpoint(11)];
    let keyed: Vec<(u64, u16)> = endpoints.iter().map(|e| (e.hash_key(), e.weight)).collect();

    assert_eq!(MaglevTable::build(&endpoints), MaglevTable::build_keyed(&keyed));
}
