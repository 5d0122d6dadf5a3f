//! In-memory writer for MaxMind DB (MMDB) files
//!
//! Builds an IPv6 search tree with 32-bit records. IPv4 networks are stored in
//! the `::/96` subtree, which is where MMDB readers look for IPv4 addresses.

use ipnet::IpNet;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

const METADATA_MARKER: &[u8] = b"\xab\xcd\xefMaxMind.com";
const DATA_SECTION_SEPARATOR: [u8; 16] = [0; 16];
const RECORD_SIZE: u16 = 32;

// MMDB data field types
const TYPE_UTF8: u8 = 2;
const TYPE_DOUBLE: u8 = 3;
const TYPE_UINT32: u8 = 6;
const TYPE_MAP: u8 = 7;
const TYPE_INT32: u8 = 8;
const TYPE_UINT64: u8 = 9;
const TYPE_ARRAY: u8 = 11;
const TYPE_BOOL: u8 = 14;

/// Largest payload length the control byte can describe
const MAX_FIELD_SIZE: usize = 65_821 + (1 << 24) - 1;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("record could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("unsupported value in record: {0}")]
    Unsupported(String),
    #[error("field of {0} bytes exceeds the format limit")]
    FieldTooLarge(usize),
    #[error("database exceeds the 32-bit record limit")]
    TreeTooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Empty,
    Node(usize),
    Data(usize),
}

pub struct MmdbWriter {
    database_type: String,
    description: String,
    nodes: Vec<[Link; 2]>,
    /// Encoded data-section entries
    records: Vec<Vec<u8>>,
}

impl MmdbWriter {
    pub fn new(database_type: &str, description: &str) -> Self {
        Self {
            database_type: database_type.to_string(),
            description: description.to_string(),
            nodes: vec![[Link::Empty; 2]],
            records: Vec::new(),
        }
    }

    /// Number of records inserted so far, including ones later shadowed
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Associate `record` with every address in `network`.
    ///
    /// An insert replaces whatever an earlier insert left inside the same
    /// network, including more specific networks. A record that cannot be
    /// encoded is rejected before the tree is touched.
    pub fn insert<T: Serialize>(&mut self, network: IpNet, record: &T) -> Result<(), WriterError> {
        let mut encoded = Vec::new();
        encode_value(&mut encoded, &serde_json::to_value(record)?)?;
        let data = self.records.len();
        self.records.push(encoded);

        let (bits, prefix_len) = tree_key(network);
        if prefix_len == 0 {
            self.nodes[0] = [Link::Data(data); 2];
            return Ok(());
        }

        let mut node = 0;
        for depth in 0..prefix_len - 1 {
            let bit = bit_at(bits, depth);
            node = match self.nodes[node][bit] {
                Link::Node(child) => child,
                // A shorter network covers this one; push its data down a level
                inherited => {
                    let child = self.nodes.len();
                    let fill = match inherited {
                        Link::Data(d) => Link::Data(d),
                        _ => Link::Empty,
                    };
                    self.nodes.push([fill; 2]);
                    self.nodes[node][bit] = Link::Node(child);
                    child
                }
            };
        }

        self.nodes[node][bit_at(bits, prefix_len - 1)] = Link::Data(data);
        Ok(())
    }

    /// Serialize the tree, data section and metadata into a complete database.
    pub fn into_bytes(self, build_epoch: u64) -> Result<Vec<u8>, WriterError> {
        // Renumber reachable nodes breadth first; shadowed subtrees are dropped
        let mut order = Vec::new();
        let mut ids = HashMap::new();
        let mut pending = VecDeque::from([0usize]);
        ids.insert(0usize, 0usize);
        while let Some(node) = pending.pop_front() {
            order.push(node);
            for link in self.nodes[node] {
                if let Link::Node(child) = link {
                    if !ids.contains_key(&child) {
                        ids.insert(child, ids.len());
                        pending.push_back(child);
                    }
                }
            }
        }
        let node_count = u32::try_from(order.len()).map_err(|_| WriterError::TreeTooLarge)?;

        let mut data_section = Vec::new();
        let mut offsets = HashMap::new();
        for &node in &order {
            for link in self.nodes[node] {
                if let Link::Data(d) = link {
                    if !offsets.contains_key(&d) {
                        offsets.insert(d, data_section.len());
                        data_section.extend_from_slice(&self.records[d]);
                    }
                }
            }
        }

        let record_value = |link: Link| -> Result<u32, WriterError> {
            match link {
                Link::Empty => Ok(node_count),
                Link::Node(child) => u32::try_from(ids[&child]).map_err(|_| WriterError::TreeTooLarge),
                Link::Data(d) => u32::try_from(offsets[&d])
                    .ok()
                    .and_then(|offset| offset.checked_add(16))
                    .and_then(|offset| offset.checked_add(node_count))
                    .ok_or(WriterError::TreeTooLarge),
            }
        };

        let mut out = Vec::with_capacity(order.len() * 8 + data_section.len() + 256);
        for &node in &order {
            let [left, right] = self.nodes[node];
            out.extend_from_slice(&record_value(left)?.to_be_bytes());
            out.extend_from_slice(&record_value(right)?.to_be_bytes());
        }
        out.extend_from_slice(&DATA_SECTION_SEPARATOR);
        out.extend_from_slice(&data_section);

        out.extend_from_slice(METADATA_MARKER);
        let metadata = serde_json::json!({
            "node_count": node_count,
            "record_size": RECORD_SIZE,
            "ip_version": 6,
            "database_type": self.database_type,
            "languages": ["en"],
            "binary_format_major_version": 2,
            "binary_format_minor_version": 0,
            "build_epoch": build_epoch,
            "description": { "en": self.description },
        });
        encode_value(&mut out, &metadata)?;

        Ok(out)
    }
}

/// Address bits and prefix length of `network` inside the IPv6 tree
fn tree_key(network: IpNet) -> (u128, u8) {
    match network {
        IpNet::V4(net) => (
            u128::from(net.network().to_ipv6_compatible()),
            96 + net.prefix_len(),
        ),
        IpNet::V6(net) => (u128::from(net.network()), net.prefix_len()),
    }
}

fn bit_at(bits: u128, depth: u8) -> usize {
    ((bits >> (127 - depth)) & 1) as usize
}

fn write_control(out: &mut Vec<u8>, type_num: u8, size: usize) -> Result<(), WriterError> {
    let (size_bits, extra): (u8, Vec<u8>) = if size < 29 {
        (size as u8, Vec::new())
    } else if size < 285 {
        (29, vec![(size - 29) as u8])
    } else if size < 65_821 {
        (30, ((size - 285) as u16).to_be_bytes().to_vec())
    } else if size <= MAX_FIELD_SIZE {
        (31, ((size - 65_821) as u32).to_be_bytes()[1..].to_vec())
    } else {
        return Err(WriterError::FieldTooLarge(size));
    };

    if type_num <= 7 {
        out.push((type_num << 5) | size_bits);
    } else {
        out.push(size_bits);
        out.push(type_num - 7);
    }
    out.extend_from_slice(&extra);
    Ok(())
}

/// Big-endian bytes of `value` without leading zeros
fn minimal_be_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    bytes[skip..].to_vec()
}

fn encode_value(out: &mut Vec<u8>, value: &Value) -> Result<(), WriterError> {
    match value {
        Value::Null => return Err(WriterError::Unsupported("null".to_string())),
        Value::Bool(b) => write_control(out, TYPE_BOOL, usize::from(*b))?,
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                let bytes = minimal_be_bytes(u);
                let type_num = if u <= u64::from(u32::MAX) {
                    TYPE_UINT32
                } else {
                    TYPE_UINT64
                };
                write_control(out, type_num, bytes.len())?;
                out.extend_from_slice(&bytes);
            } else if let Some(i) = n.as_i64() {
                let i = i32::try_from(i)
                    .map_err(|_| WriterError::Unsupported(format!("integer {i}")))?;
                write_control(out, TYPE_INT32, 4)?;
                out.extend_from_slice(&i.to_be_bytes());
            } else {
                let f = n
                    .as_f64()
                    .ok_or_else(|| WriterError::Unsupported(format!("number {n}")))?;
                write_control(out, TYPE_DOUBLE, 8)?;
                out.extend_from_slice(&f.to_be_bytes());
            }
        }
        Value::String(s) => {
            write_control(out, TYPE_UTF8, s.len())?;
            out.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            write_control(out, TYPE_ARRAY, items.len())?;
            for item in items {
                encode_value(out, item)?;
            }
        }
        Value::Object(map) => {
            let entries: Vec<_> = map.iter().filter(|(_, v)| !v.is_null()).collect();
            write_control(out, TYPE_MAP, entries.len())?;
            for (key, item) in entries {
                write_control(out, TYPE_UTF8, key.len())?;
                out.extend_from_slice(key.as_bytes());
                encode_value(out, item)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maxminddb::Reader;
    use serde::Deserialize;
    use std::collections::BTreeMap;
    use std::net::IpAddr;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        #[serde(default)]
        count: i64,
    }

    fn sample(name: &str) -> Sample {
        Sample {
            name: name.to_string(),
            count: 0,
        }
    }

    fn lookup(reader: &Reader<Vec<u8>>, ip: &str) -> Option<Sample> {
        let ip: IpAddr = ip.parse().unwrap();
        reader.lookup(ip).unwrap().decode::<Sample>().unwrap()
    }

    #[test]
    fn test_control_byte_sizes() {
        let mut out = Vec::new();
        write_control(&mut out, TYPE_UTF8, 3).unwrap();
        assert_eq!(out, vec![0x43]);

        out.clear();
        write_control(&mut out, TYPE_UTF8, 30).unwrap();
        assert_eq!(out, vec![0x5d, 1]);

        out.clear();
        write_control(&mut out, TYPE_MAP, 300).unwrap();
        assert_eq!(out, vec![0xfe, 0x00, 15]);

        out.clear();
        write_control(&mut out, TYPE_ARRAY, 2).unwrap();
        assert_eq!(out, vec![0x02, 0x04]);

        assert!(matches!(
            write_control(&mut out, TYPE_UTF8, MAX_FIELD_SIZE + 1),
            Err(WriterError::FieldTooLarge(_))
        ));
    }

    #[test]
    fn test_minimal_be_bytes() {
        assert!(minimal_be_bytes(0).is_empty());
        assert_eq!(minimal_be_bytes(255), vec![255]);
        assert_eq!(minimal_be_bytes(256), vec![1, 0]);
    }

    #[test]
    fn test_database_is_readable() {
        let mut writer = MmdbWriter::new("test", "test database");
        writer
            .insert("2001:db8::/32".parse().unwrap(), &sample("doc"))
            .unwrap();
        writer
            .insert("10.0.0.0/8".parse().unwrap(), &sample("private"))
            .unwrap();
        let reader = Reader::from_source(writer.into_bytes(1_700_000_000).unwrap()).unwrap();

        assert_eq!(reader.metadata.database_type, "test");
        assert_eq!(reader.metadata.ip_version, 6);
        assert_eq!(reader.metadata.record_size, 32);
        assert_eq!(reader.metadata.build_epoch, 1_700_000_000);
        assert_eq!(lookup(&reader, "2001:db8::1"), Some(sample("doc")));
        assert_eq!(lookup(&reader, "2001:db9::1"), None);
        assert_eq!(lookup(&reader, "10.1.2.3"), Some(sample("private")));
        assert_eq!(lookup(&reader, "11.1.2.3"), None);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut writer = MmdbWriter::new("test", "test database");
        writer
            .insert("2001:db8::/32".parse().unwrap(), &sample("wide"))
            .unwrap();
        writer
            .insert("2001:db8:1::/48".parse().unwrap(), &sample("narrow"))
            .unwrap();
        let reader = Reader::from_source(writer.into_bytes(0).unwrap()).unwrap();

        assert_eq!(lookup(&reader, "2001:db8:1::5"), Some(sample("narrow")));
        assert_eq!(lookup(&reader, "2001:db8:2::5"), Some(sample("wide")));
    }

    #[test]
    fn test_later_insert_replaces_overlapping_networks() {
        let mut writer = MmdbWriter::new("test", "test database");
        writer
            .insert("2001:db8:1::/48".parse().unwrap(), &sample("narrow"))
            .unwrap();
        writer
            .insert("2001:db8::/32".parse().unwrap(), &sample("wide"))
            .unwrap();
        let reader = Reader::from_source(writer.into_bytes(0).unwrap()).unwrap();

        assert_eq!(lookup(&reader, "2001:db8:1::5"), Some(sample("wide")));
    }

    #[test]
    fn test_value_types_decode() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Rich {
            negative: i64,
            big: u64,
            ratio: f64,
            flag: bool,
            tags: Vec<String>,
            nested: BTreeMap<String, String>,
            long_text: String,
        }

        let record = Rich {
            negative: -42,
            big: u64::from(u32::MAX) + 7,
            ratio: 0.25,
            flag: true,
            tags: vec!["a".into(), "b".into()],
            nested: BTreeMap::from([("k".to_string(), "v".to_string())]),
            long_text: "x".repeat(400),
        };

        let mut writer = MmdbWriter::new("test", "test database");
        writer.insert("::/0".parse().unwrap(), &record).unwrap();
        let reader = Reader::from_source(writer.into_bytes(0).unwrap()).unwrap();

        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        let decoded = reader.lookup(ip).unwrap().decode::<Rich>().unwrap();
        assert_eq!(decoded, Some(record));
    }

    #[test]
    fn test_unencodable_record_leaves_tree_untouched() {
        #[derive(Serialize)]
        struct Wide {
            name: String,
            spread: i64,
        }

        let mut writer = MmdbWriter::new("test", "test database");
        writer
            .insert("2001:db8::/32".parse().unwrap(), &sample("kept"))
            .unwrap();
        let err = writer
            .insert(
                "2001:db8::/32".parse().unwrap(),
                &Wide {
                    name: "dropped".to_string(),
                    spread: -3_000_000_000,
                },
            )
            .unwrap_err();
        assert!(matches!(err, WriterError::Unsupported(_)));
        assert_eq!(writer.len(), 1);

        let reader = Reader::from_source(writer.into_bytes(0).unwrap()).unwrap();
        assert_eq!(lookup(&reader, "2001:db8::1"), Some(sample("kept")));
    }

    #[test]
    fn test_empty_database() {
        let writer = MmdbWriter::new("test", "test database");
        assert!(writer.is_empty());
        let reader = Reader::from_source(writer.into_bytes(0).unwrap()).unwrap();
        assert_eq!(reader.metadata.node_count, 1);
        assert_eq!(lookup(&reader, "2001:db8::1"), None);
    }
}
