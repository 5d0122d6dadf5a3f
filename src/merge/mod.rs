//! Field-level merge of partial context records into stored ones
//!
//! Realtime deltas carry partial records. Merging follows three rules:
//! - scalar fields: the incoming value wins unless it is zero/empty
//! - list fields: union, existing order first, then new incoming values
//! - tunnels: an incoming tunnel is appended only when no tunnel with the
//!   same non-empty operator is already present
//!
//! A zero or empty incoming scalar cannot be told apart from an absent one,
//! so a delta can never clear a field.

use crate::models::{
    AutonomousSystem, Client, Concentration, IPContext, IPContextV6, Location, Tunnel,
};

/// Merge `incoming` into a copy of `existing`.
pub fn merge<T: Merge + Clone>(existing: &T, incoming: &T) -> T {
    let mut merged = existing.clone();
    merged.merge_from(incoming);
    merged
}

pub trait Merge {
    fn merge_from(&mut self, incoming: &Self);
}

fn take_newer<T: Default + PartialEq + Clone>(current: &mut T, incoming: &T) {
    if *incoming != T::default() {
        *current = incoming.clone();
    }
}

fn union_into<T: PartialEq + Clone>(current: &mut Vec<T>, incoming: &[T]) {
    for item in incoming {
        if !current.contains(item) {
            current.push(item.clone());
        }
    }
}

fn merge_tunnels(current: &mut Vec<Tunnel>, incoming: &[Tunnel]) {
    for tunnel in incoming {
        let known = !tunnel.operator.is_empty()
            && current.iter().any(|t| t.operator == tunnel.operator);
        if !known {
            current.push(tunnel.clone());
        }
    }
}

impl Merge for Location {
    fn merge_from(&mut self, incoming: &Self) {
        take_newer(&mut self.country, &incoming.country);
        take_newer(&mut self.state, &incoming.state);
        take_newer(&mut self.city, &incoming.city);
    }
}

impl Merge for AutonomousSystem {
    fn merge_from(&mut self, incoming: &Self) {
        take_newer(&mut self.number, &incoming.number);
        take_newer(&mut self.organization, &incoming.organization);
    }
}

impl Merge for Concentration {
    fn merge_from(&mut self, incoming: &Self) {
        take_newer(&mut self.country, &incoming.country);
        take_newer(&mut self.state, &incoming.state);
        take_newer(&mut self.city, &incoming.city);
        take_newer(&mut self.geohash, &incoming.geohash);
        take_newer(&mut self.density, &incoming.density);
        take_newer(&mut self.skew, &incoming.skew);
    }
}

impl Merge for Client {
    fn merge_from(&mut self, incoming: &Self) {
        union_into(&mut self.behaviors, &incoming.behaviors);
        union_into(&mut self.types, &incoming.types);
        union_into(&mut self.proxies, &incoming.proxies);
        self.concentration.merge_from(&incoming.concentration);
        take_newer(&mut self.countries, &incoming.countries);
        take_newer(&mut self.spread, &incoming.spread);
        take_newer(&mut self.count, &incoming.count);
    }
}

impl Merge for IPContext {
    fn merge_from(&mut self, incoming: &Self) {
        take_newer(&mut self.ip, &incoming.ip);
        take_newer(&mut self.organization, &incoming.organization);
        take_newer(&mut self.infrastructure, &incoming.infrastructure);
        self.autonomous_system.merge_from(&incoming.autonomous_system);
        self.client.merge_from(&incoming.client);
        self.location.merge_from(&incoming.location);
        union_into(&mut self.services, &incoming.services);
        union_into(&mut self.risks, &incoming.risks);
        merge_tunnels(&mut self.tunnels, &incoming.tunnels);
    }
}

impl Merge for IPContextV6 {
    fn merge_from(&mut self, incoming: &Self) {
        take_newer(&mut self.network, &incoming.network);
        take_newer(&mut self.organization, &incoming.organization);
        take_newer(&mut self.infrastructure, &incoming.infrastructure);
        self.autonomous_system.merge_from(&incoming.autonomous_system);
        self.client.merge_from(&incoming.client);
        self.location.merge_from(&incoming.location);
        union_into(&mut self.services, &incoming.services);
        union_into(&mut self.risks, &incoming.risks);
        merge_tunnels(&mut self.tunnels, &incoming.tunnels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn tunnel(operator: &str, kind: &str) -> Tunnel {
        Tunnel {
            operator: operator.to_string(),
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    fn full_record() -> IPContext {
        IPContext {
            ip: "1.2.3.4".to_string(),
            organization: "Example Org".to_string(),
            infrastructure: "DATACENTER".to_string(),
            location: Location {
                country: "US".to_string(),
                state: "Texas".to_string(),
                city: "Austin".to_string(),
            },
            tunnels: vec![tunnel("NORD_VPN", "VPN")],
            services: strings(&["IPSEC"]),
            risks: strings(&["TUNNEL", "SPAM"]),
            autonomous_system: AutonomousSystem {
                organization: "AS Org".to_string(),
                number: 64500,
            },
            client: Client {
                behaviors: strings(&["FILE_SHARING"]),
                types: strings(&["DESKTOP"]),
                proxies: strings(&["LUMINATI_PROXY"]),
                concentration: Concentration {
                    country: "US".to_string(),
                    state: "Texas".to_string(),
                    city: "Austin".to_string(),
                    geohash: "9v6".to_string(),
                    density: 0.4,
                    skew: 12,
                },
                countries: 3,
                spread: 1200,
                count: 9,
            },
        }
    }

    #[test]
    fn test_merge_risks_example() {
        let existing = IPContext {
            ip: "1.2.3.4".to_string(),
            risks: strings(&["TUNNEL"]),
            ..Default::default()
        };
        let incoming = IPContext {
            ip: "1.2.3.4".to_string(),
            risks: strings(&["BOTNET"]),
            ..Default::default()
        };

        let merged = merge(&existing, &incoming);
        assert_eq!(merged.risks, strings(&["TUNNEL", "BOTNET"]));
        assert_eq!(merged.ip, "1.2.3.4");
    }

    #[test]
    fn test_merge_with_empty_incoming_keeps_existing() {
        let existing = full_record();
        let merged = merge(&existing, &IPContext::default());
        assert_eq!(merged, existing);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let record = full_record();
        assert_eq!(merge(&record, &record), record);
    }

    #[test]
    fn test_non_empty_scalars_replace_existing() {
        let existing = full_record();
        let incoming = IPContext {
            organization: "New Org".to_string(),
            location: Location {
                city: "Dallas".to_string(),
                ..Default::default()
            },
            autonomous_system: AutonomousSystem {
                number: 64501,
                ..Default::default()
            },
            client: Client {
                concentration: Concentration {
                    density: 0.9,
                    ..Default::default()
                },
                count: 20,
                ..Default::default()
            },
            ..Default::default()
        };

        let merged = merge(&existing, &incoming);
        assert_eq!(merged.organization, "New Org");
        assert_eq!(merged.location.city, "Dallas");
        assert_eq!(merged.location.state, "Texas");
        assert_eq!(merged.autonomous_system.number, 64501);
        assert_eq!(merged.autonomous_system.organization, "AS Org");
        assert_eq!(merged.client.concentration.density, 0.9);
        assert_eq!(merged.client.concentration.skew, 12);
        assert_eq!(merged.client.count, 20);
        assert_eq!(merged.client.spread, 1200);
    }

    #[test]
    fn test_zero_incoming_cannot_clear_a_field() {
        let existing = full_record();
        let incoming = IPContext {
            client: Client {
                count: 0,
                ..Default::default()
            },
            ..Default::default()
        };

        assert_eq!(merge(&existing, &incoming).client.count, 9);
    }

    #[test]
    fn test_union_fields_have_no_duplicates_and_keep_existing() {
        let existing = full_record();
        let incoming = IPContext {
            services: strings(&["OPENVPN", "IPSEC", "OPENVPN"]),
            risks: strings(&["SPAM", "CALLBACK_PROXY"]),
            client: Client {
                behaviors: strings(&["FILE_SHARING", "TOR_PROXY_USER"]),
                types: strings(&["MOBILE"]),
                proxies: strings(&["LUMINATI_PROXY"]),
                ..Default::default()
            },
            ..Default::default()
        };

        let merged = merge(&existing, &incoming);
        assert_eq!(merged.services, strings(&["IPSEC", "OPENVPN"]));
        assert_eq!(merged.risks, strings(&["TUNNEL", "SPAM", "CALLBACK_PROXY"]));
        assert_eq!(
            merged.client.behaviors,
            strings(&["FILE_SHARING", "TOR_PROXY_USER"])
        );
        assert_eq!(merged.client.types, strings(&["DESKTOP", "MOBILE"]));
        assert_eq!(merged.client.proxies, strings(&["LUMINATI_PROXY"]));
    }

    #[test]
    fn test_first_seen_tunnel_wins_for_an_operator() {
        let mut existing = full_record();
        existing.tunnels[0].exits = strings(&["10.0.0.1"]);

        let mut updated = tunnel("NORD_VPN", "PROXY");
        updated.exits = strings(&["10.0.0.2"]);
        let incoming = IPContext {
            tunnels: vec![updated, tunnel("PROTON_VPN", "VPN")],
            ..Default::default()
        };

        let merged = merge(&existing, &incoming);
        assert_eq!(merged.tunnels.len(), 2);
        assert_eq!(merged.tunnels[0].kind, "VPN");
        assert_eq!(merged.tunnels[0].exits, strings(&["10.0.0.1"]));
        assert_eq!(merged.tunnels[1].operator, "PROTON_VPN");
    }

    #[test]
    fn test_tunnel_merge_never_duplicates_an_operator() {
        let existing = IPContext::default();
        let incoming = IPContext {
            tunnels: vec![
                tunnel("OXYLABS_PROXY", "PROXY"),
                tunnel("OXYLABS_PROXY", "VPN"),
                tunnel("", "PROXY"),
                tunnel("", "VPN"),
            ],
            ..Default::default()
        };

        let merged = merge(&existing, &incoming);
        let named: Vec<_> = merged
            .tunnels
            .iter()
            .filter(|t| t.operator == "OXYLABS_PROXY")
            .collect();
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].kind, "PROXY");
        // Tunnels without an operator are never treated as duplicates
        assert_eq!(merged.tunnels.len(), 3);
    }

    #[test]
    fn test_merge_v6_network_record() {
        let existing = IPContextV6 {
            network: "2001:db8::/32".to_string(),
            risks: strings(&["TUNNEL"]),
            ..Default::default()
        };
        let incoming = IPContextV6 {
            organization: "Example".to_string(),
            risks: strings(&["TUNNEL", "BOTNET"]),
            ..Default::default()
        };

        let merged = merge(&existing, &incoming);
        assert_eq!(merged.network, "2001:db8::/32");
        assert_eq!(merged.organization, "Example");
        assert_eq!(merged.risks, strings(&["TUNNEL", "BOTNET"]));
    }
}
