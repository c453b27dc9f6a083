//! Country lookup for the `GeoMatch` custom operator

use crate::secrule::CustomOperator;
use crate::{Result, WafError};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

/// Resolves a client address to a two-letter country code
pub trait GeoDb: Send + Sync {
    fn geo_lookup(&self, ip: IpAddr) -> Option<String>;
}

/// Inclusive IPv4 range owned by one country
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GeoIpRecord {
    #[serde(rename = "StartIP")]
    pub start_ip: u32,
    #[serde(rename = "EndIP")]
    pub end_ip: u32,
    pub country_code: String,
}

impl GeoIpRecord {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr, country_code: &str) -> Self {
        Self {
            start_ip: start.into(),
            end_ip: end.into(),
            country_code: country_code.to_string(),
        }
    }
}

/// In-memory range table, swapped atomically on update
#[derive(Default)]
pub struct RangeGeoDb {
    records: ArcSwap<Vec<GeoIpRecord>>,
}

impl RangeGeoDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the table. Ranges must not overlap and must have start <= end.
    pub fn put_geo_ip_data(&self, mut records: Vec<GeoIpRecord>) -> Result<()> {
        records.sort_by_key(|r| r.start_ip);

        for (i, r) in records.iter().enumerate() {
            if r.start_ip > r.end_ip {
                return Err(WafError::Config(format!(
                    "GeoIP record ({}, {}, {}) has StartIP greater than EndIP",
                    Ipv4Addr::from(r.start_ip),
                    Ipv4Addr::from(r.end_ip),
                    r.country_code
                )));
            }
            if let Some(prev) = i.checked_sub(1).map(|p| &records[p]) {
                if r.start_ip <= prev.end_ip {
                    return Err(WafError::Config(format!(
                        "overlap between GeoIP records starting at {} and {}",
                        Ipv4Addr::from(prev.start_ip),
                        Ipv4Addr::from(r.start_ip)
                    )));
                }
            }
        }

        for r in &mut records {
            r.country_code = r.country_code.trim().to_ascii_uppercase();
        }

        tracing::info!(records = records.len(), "GeoIP data updated");
        self.records.store(Arc::new(records));
        Ok(())
    }

    /// Load records from the JSON array form of [`GeoIpRecord`]
    pub fn load_json(&self, data: &[u8]) -> Result<()> {
        let records: Vec<GeoIpRecord> =
            serde_json::from_slice(data).map_err(|e| WafError::Config(format!("invalid GeoIP data: {e}")))?;
        self.put_geo_ip_data(records)
    }
}

impl GeoDb for RangeGeoDb {
    fn geo_lookup(&self, ip: IpAddr) -> Option<String> {
        let IpAddr::V4(v4) = ip else {
            return None;
        };
        let ip = u32::from(v4);
        let records = self.records.load();

        let idx = records.partition_point(|r| r.start_ip <= ip).checked_sub(1)?;
        let r = &records[idx];
        if ip > r.end_ip || r.country_code.len() != 2 {
            if !(v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()) {
                tracing::warn!(ip = %v4, "GeoDB failed to look up record for IP address");
            }
            return None;
        }
        Some(r.country_code.clone())
    }
}

/// `GeoMatch` operator over a [`GeoDb`].
///
/// The target is a comma-separated address list, each entry optionally
/// carrying a port. The operand is a comma-separated list of country codes
/// compared case-insensitively.
pub struct GeoMatch {
    db: Arc<dyn GeoDb>,
}

impl GeoMatch {
    pub fn new(db: Arc<dyn GeoDb>) -> Self {
        Self { db }
    }
}

fn parse_address(entry: &str) -> Option<IpAddr> {
    let entry = entry.trim();
    if let Ok(ip) = entry.parse() {
        return Some(ip);
    }
    // `a.b.c.d:port` or `[v6]:port`
    let host = match entry.strip_prefix('[') {
        Some(rest) => rest.split(']').next()?,
        None => entry.split(':').next()?,
    };
    host.parse().ok()
}

impl CustomOperator for GeoMatch {
    fn eval(&self, actual: &[u8], expected: &[u8]) -> Result<bool> {
        let actual = String::from_utf8_lossy(actual);
        let expected = String::from_utf8_lossy(expected);

        for ip in actual.split(',').filter_map(parse_address) {
            let Some(country) = self.db.geo_lookup(ip) else {
                continue;
            };
            if expected.split(',').any(|code| code.trim().eq_ignore_ascii_case(&country)) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_db() -> RangeGeoDb {
        let db = RangeGeoDb::new();
        db.put_geo_ip_data(vec![
            GeoIpRecord::new(Ipv4Addr::new(8, 8, 0, 0), Ipv4Addr::new(8, 8, 255, 255), "us"),
            GeoIpRecord::new(Ipv4Addr::new(2, 0, 0, 0), Ipv4Addr::new(2, 15, 255, 255), " FR "),
        ])
        .unwrap();
        db
    }

    #[test]
    fn test_lookup() {
        let db = sample_db();
        assert_eq!(db.geo_lookup("8.8.4.4".parse().unwrap()).as_deref(), Some("US"));
        assert_eq!(db.geo_lookup("2.1.2.3".parse().unwrap()).as_deref(), Some("FR"));
        assert_eq!(db.geo_lookup("9.9.9.9".parse().unwrap()), None);
        assert_eq!(db.geo_lookup("1.1.1.1".parse().unwrap()), None);
        assert_eq!(db.geo_lookup("::1".parse().unwrap()), None);
    }

    #[test]
    fn test_invalid_data_rejected() {
        let db = RangeGeoDb::new();
        let overlapping = vec![
            GeoIpRecord::new(Ipv4Addr::new(1, 0, 0, 0), Ipv4Addr::new(1, 0, 0, 255), "AU"),
            GeoIpRecord::new(Ipv4Addr::new(1, 0, 0, 128), Ipv4Addr::new(1, 0, 1, 0), "CN"),
        ];
        assert!(db.put_geo_ip_data(overlapping).is_err());

        let inverted = vec![GeoIpRecord::new(Ipv4Addr::new(1, 0, 0, 9), Ipv4Addr::new(1, 0, 0, 1), "AU")];
        assert!(db.put_geo_ip_data(inverted).is_err());
    }

    #[test]
    fn test_load_json() {
        let db = RangeGeoDb::new();
        db.load_json(br#"[{"StartIP": 16777216, "EndIP": 16777471, "CountryCode": "AU"}]"#)
            .unwrap();
        assert_eq!(db.geo_lookup("1.0.0.7".parse().unwrap()).as_deref(), Some("AU"));
        assert!(db.load_json(b"not json").is_err());
    }

    #[test]
    fn test_geo_match_operator() {
        let op = GeoMatch::new(Arc::new(sample_db()));
        assert!(op.eval(b"8.8.8.8", b"US").unwrap());
        assert!(op.eval(b"8.8.8.8:80", b"ca,us").unwrap());
        assert!(op.eval(b"10.0.0.1, 2.3.4.5:443", b"FR").unwrap());
        assert!(!op.eval(b"8.8.8.8", b"FR").unwrap());
        assert!(!op.eval(b"garbage", b"US").unwrap());
    }
}
