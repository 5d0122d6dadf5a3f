use serde::{Deserialize, Serialize};

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}

fn is_zero_u32(value: &u32) -> bool {
    *value == 0
}

fn is_zero_f64(value: &f64) -> bool {
    *value == 0.0
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Context record for a single IPv4 address, keyed by `ip`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IPContext {
    #[serde(skip_serializing_if = "Location::is_empty")]
    pub location: Location,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub organization: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub infrastructure: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tunnels: Vec<Tunnel>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub risks: Vec<String>,
    #[serde(rename = "as", skip_serializing_if = "AutonomousSystem::is_empty")]
    pub autonomous_system: AutonomousSystem,
    #[serde(skip_serializing_if = "Client::is_empty")]
    pub client: Client,
}

/// Context record for an IPv6 network, keyed by the CIDR in `network`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IPContextV6 {
    #[serde(skip_serializing_if = "Location::is_empty")]
    pub location: Location,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub network: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub organization: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub infrastructure: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tunnels: Vec<Tunnel>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub risks: Vec<String>,
    #[serde(rename = "as", skip_serializing_if = "AutonomousSystem::is_empty")]
    pub autonomous_system: AutonomousSystem,
    #[serde(skip_serializing_if = "Client::is_empty")]
    pub client: Client,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub country: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub city: String,
}

impl Location {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomousSystem {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub organization: String,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub number: u32,
}

impl AutonomousSystem {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Observed client population behind an address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Client {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub behaviors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub proxies: Vec<String>,
    #[serde(skip_serializing_if = "Concentration::is_empty")]
    pub concentration: Concentration,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub countries: i64,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub spread: i64,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub count: i64,
}

impl Client {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Concentration {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub country: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub city: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub geohash: String,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub density: f64,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub skew: i64,
}

impl Concentration {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// An anonymizing tunnel (VPN, proxy, relay) observed on an address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunnel {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub operator: String,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exits: Vec<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub anonymous: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_feed_line() {
        let line = r#"{"ip":"1.2.3.4","organization":"Example","as":{"number":7018,"organization":"AT&T"},"client":{"behaviors":["FILE_SHARING"],"concentration":{"country":"US","density":0.25},"count":3},"tunnels":[{"operator":"NORD_VPN","type":"VPN","anonymous":true}],"location":{"country":"US"},"risks":["TUNNEL"]}"#;

        let ctx: IPContext = serde_json::from_str(line).unwrap();
        assert_eq!(ctx.ip, "1.2.3.4");
        assert_eq!(ctx.autonomous_system.number, 7018);
        assert_eq!(ctx.client.concentration.density, 0.25);
        assert_eq!(ctx.client.count, 3);
        assert_eq!(ctx.tunnels[0].kind, "VPN");
        assert!(ctx.tunnels[0].anonymous);
        assert!(ctx.services.is_empty());
    }

    #[test]
    fn test_serialize_omits_empty_fields() {
        let ctx = IPContext {
            ip: "1.2.3.4".to_string(),
            risks: vec!["TUNNEL".to_string()],
            ..Default::default()
        };

        let json = serde_json::to_string(&ctx).unwrap();
        assert_eq!(json, r#"{"ip":"1.2.3.4","risks":["TUNNEL"]}"#);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let ctx: IPContextV6 =
            serde_json::from_str(r#"{"network":"2001:db8::/32","future_field":{"a":1}}"#).unwrap();
        assert_eq!(ctx.network, "2001:db8::/32");
    }
}
