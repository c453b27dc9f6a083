//! IP reputation: blocks requests whose client or forwarding addresses are
//! on a list of known bad addresses and networks.
//!
//! The list is replaced as a whole by [`IpReputationEngine::put_list`] and,
//! when a store is configured, persisted one entry per line so that it
//! survives restarts.

use super::logging::ResultsLogger;
use super::request::HttpRequest;
use crate::{Decision, Result, WafError};
use arc_swap::ArcSwap;
use ipnetwork::IpNetwork;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

pub const DEFAULT_LIST_FILE: &str = "badbots.txt";

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Where the bad-IP list is persisted
pub trait IpListFileSystem: Send + Sync {
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OsIpListFileSystem;

impl IpListFileSystem for OsIpListFileSystem {
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        std::fs::write(path, data)
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct TrieNode {
    children: [Option<usize>; 2],
    terminal: bool,
}

/// Binary prefix trie over address bits, most significant bit first
#[derive(Debug)]
struct PrefixTrie {
    nodes: Vec<TrieNode>,
}

impl PrefixTrie {
    fn new() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
        }
    }

    fn insert(&mut self, bits: u128, width: u8, prefix: u8) {
        let mut node = 0;
        for i in 0..prefix {
            if self.nodes[node].terminal {
                return;
            }
            let bit = bit_at(bits, width, i);
            node = match self.nodes[node].children[bit] {
                Some(child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(TrieNode::default());
                    self.nodes[node].children[bit] = Some(child);
                    child
                }
            };
        }
        self.nodes[node].terminal = true;
    }

    fn contains(&self, bits: u128, width: u8) -> bool {
        let mut node = 0;
        for i in 0..width {
            if self.nodes[node].terminal {
                return true;
            }
            match self.nodes[node].children[bit_at(bits, width, i)] {
                Some(child) => node = child,
                None => return false,
            }
        }
        self.nodes[node].terminal
    }
}

fn bit_at(bits: u128, width: u8, index: u8) -> usize {
    ((bits >> (width - 1 - index)) & 1) as usize
}

/// Compiled bad-IP list
#[derive(Debug)]
struct IpMatcher {
    v4: PrefixTrie,
    v6: PrefixTrie,
    entries: Vec<String>,
}

impl IpMatcher {
    fn new(networks: &[IpNetwork]) -> Self {
        let mut matcher = Self {
            v4: PrefixTrie::new(),
            v6: PrefixTrie::new(),
            entries: networks.iter().map(ToString::to_string).collect(),
        };
        for network in networks {
            match network {
                IpNetwork::V4(n) => matcher.v4.insert(u128::from(u32::from(n.network())), 32, n.prefix()),
                IpNetwork::V6(n) => matcher.v6.insert(u128::from(n.network()), 128, n.prefix()),
            }
        }
        matcher
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match ip.to_canonical() {
            IpAddr::V4(v4) => self.v4.contains(u128::from(u32::from(v4)), 32),
            IpAddr::V6(v6) => self.v6.contains(u128::from(v6), 128),
        }
    }
}

/// An address or CIDR network; a bare address covers itself only
fn parse_entry(entry: &str) -> Result<IpNetwork> {
    if let Ok(network) = IpNetwork::from_str(entry) {
        return Ok(network);
    }
    let ip = IpAddr::from_str(entry).map_err(|_| WafError::Config(format!("invalid IP reputation entry {entry:?}")))?;
    let prefix = if ip.is_ipv4() { 32 } else { 128 };
    IpNetwork::new(ip, prefix).map_err(|e| WafError::Config(format!("invalid IP reputation entry {entry:?}: {e}")))
}

fn parse_entries<'a>(entries: impl IntoIterator<Item = &'a str>) -> Result<Vec<IpNetwork>> {
    entries
        .into_iter()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(parse_entry)
        .collect()
}

/// Address of one `X-Forwarded-For` element or of the peer, with any port removed
fn parse_client_address(s: &str) -> Option<IpAddr> {
    let s = s.trim();
    s.parse::<IpAddr>()
        .ok()
        .or_else(|| s.parse::<SocketAddr>().ok().map(|sa| sa.ip()))
}

/// Addresses a request is checked by: the last `X-Forwarded-For` header's
/// elements in order, then the peer address
fn candidate_addresses(request: &HttpRequest) -> Vec<&str> {
    let mut candidates: Vec<&str> = request
        .headers
        .iter()
        .rev()
        .find(|(name, _)| name.eq_ignore_ascii_case(X_FORWARDED_FOR))
        .map(|(_, value)| value.split(',').collect())
        .unwrap_or_default();
    candidates.push(&request.remote_addr);
    candidates
}

pub struct IpReputationEngine {
    matcher: ArcSwap<IpMatcher>,
    store: Option<(Box<dyn IpListFileSystem>, PathBuf)>,
    /// Serializes writers so the file and the live list agree
    write_lock: Mutex<()>,
}

impl Default for IpReputationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IpReputationEngine {
    /// Engine with an empty, in-memory list
    pub fn new() -> Self {
        Self {
            matcher: ArcSwap::from_pointee(IpMatcher::new(&[])),
            store: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Engine persisting its list at `path`, starting from the list already there.
    ///
    /// A missing file means an empty list. Unparsable lines are skipped.
    pub fn with_store(fs: Box<dyn IpListFileSystem>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let networks = match fs.read_file(&path) {
            Ok(data) => String::from_utf8_lossy(&data)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .filter_map(|line| match parse_entry(line) {
                    Ok(n) => Some(n),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping IP reputation entry");
                        None
                    }
                })
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read IP reputation list");
                Vec::new()
            }
        };
        tracing::info!(entries = networks.len(), path = %path.display(), "IP reputation list loaded");

        Self {
            matcher: ArcSwap::from_pointee(IpMatcher::new(&networks)),
            store: Some((fs, path)),
            write_lock: Mutex::new(()),
        }
    }

    /// Replace the whole list.
    ///
    /// Every entry must be an address or a CIDR network. Nothing changes if
    /// an entry is invalid or the list cannot be persisted.
    pub fn put_list<S: AsRef<str>>(&self, entries: &[S]) -> Result<()> {
        let networks = parse_entries(entries.iter().map(AsRef::as_ref))?;
        let matcher = IpMatcher::new(&networks);

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| WafError::Config("IP reputation writer poisoned".into()))?;
        if let Some((fs, path)) = &self.store {
            fs.write_file(path, matcher.entries.join("\n").as_bytes())?;
        }
        self.matcher.store(Arc::new(matcher));

        tracing::info!(entries = networks.len(), "IP reputation list replaced");
        Ok(())
    }

    /// Number of entries in the live list
    pub fn len(&self) -> usize {
        self.matcher.load().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// [`Decision::Block`] if any forwarding or peer address is listed.
    ///
    /// Addresses that do not parse are ignored.
    pub fn eval_request(&self, request: &HttpRequest, logger: &dyn ResultsLogger) -> Decision {
        let matcher = self.matcher.load();
        if matcher.entries.is_empty() {
            return Decision::Pass;
        }

        for candidate in candidate_addresses(request) {
            let Some(ip) = parse_client_address(candidate) else {
                tracing::debug!(address = candidate.trim(), "Unparsable client address ignored");
                continue;
            };
            if matcher.contains(ip) {
                logger.ip_reputation_triggered(ip);
                return Decision::Block;
            }
        }
        Decision::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waf::logging::tests::{Event, RecordingLogger};
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemFs {
        files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    }

    impl IpListFileSystem for Arc<MemFs> {
        fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
            self.files.lock().unwrap().insert(path.to_path_buf(), data.to_vec());
            Ok(())
        }
    }

    fn request(remote_addr: &str, xff: Option<&str>) -> HttpRequest {
        HttpRequest {
            method: "GET".into(),
            uri: "/".into(),
            remote_addr: remote_addr.into(),
            headers: xff
                .map(|v| vec![("X-Forwarded-For".to_string(), v.to_string())])
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    fn engine(entries: &[&str]) -> IpReputationEngine {
        let e = IpReputationEngine::new();
        e.put_list(entries).unwrap();
        e
    }

    #[test]
    fn test_match_and_no_match() {
        let e = engine(&["1.2.3.4", "10.0.0.0/8", "2001:db8::/32"]);
        let logger = RecordingLogger::default();

        assert_eq!(e.eval_request(&request("1.2.3.4", None), &logger), Decision::Block);
        assert_eq!(e.eval_request(&request("10.200.1.1", None), &logger), Decision::Block);
        assert_eq!(e.eval_request(&request("2001:db8::7", None), &logger), Decision::Block);
        assert_eq!(
            logger.events(),
            vec![
                Event::IpReputation("1.2.3.4".into()),
                Event::IpReputation("10.200.1.1".into()),
                Event::IpReputation("2001:db8::7".into()),
            ]
        );

        let logger = RecordingLogger::default();
        assert_eq!(e.eval_request(&request("1.2.3.5", None), &logger), Decision::Pass);
        assert_eq!(e.eval_request(&request("11.0.0.1", None), &logger), Decision::Pass);
        assert_eq!(e.eval_request(&request("2001:db9::1", None), &logger), Decision::Pass);
        assert!(logger.events().is_empty());
    }

    #[test]
    fn test_forwarded_for_with_ports() {
        let e = engine(&["5.6.7.8", "2001:db8::1"]);
        let logger = RecordingLogger::default();

        let req = request("9.9.9.9", Some("1.1.1.1:4431, 5.6.7.8:8080"));
        assert_eq!(e.eval_request(&req, &logger), Decision::Block);
        assert_eq!(logger.events(), vec![Event::IpReputation("5.6.7.8".into())]);

        let req = request("9.9.9.9", Some("[2001:db8::1]:443"));
        assert_eq!(e.eval_request(&req, &logger), Decision::Block);

        assert_eq!(e.eval_request(&request("5.6.7.8:51000", None), &logger), Decision::Block);
        assert_eq!(e.eval_request(&request("9.9.9.9", Some("1.1.1.1, 2.2.2.2")), &logger), Decision::Pass);
    }

    #[test]
    fn test_unparsable_addresses_ignored() {
        let e = engine(&["0.0.0.0/1"]);
        let logger = RecordingLogger::default();
        assert_eq!(e.eval_request(&request("203.0.113.9", Some("unknown, ")), &logger), Decision::Pass);
        assert_eq!(e.eval_request(&request("203.0.113.9", Some("garbage, 8.8.8.8")), &logger), Decision::Block);
    }

    #[test]
    fn test_ipv4_mapped_client() {
        let e = engine(&["192.0.2.0/24"]);
        let logger = RecordingLogger::default();
        assert_eq!(e.eval_request(&request("::ffff:192.0.2.10", None), &logger), Decision::Block);
    }

    #[test]
    fn test_put_list_replaces_and_rejects_invalid() {
        let e = engine(&["1.2.3.4"]);
        let logger = RecordingLogger::default();

        assert!(matches!(e.put_list(&["1.2.3.4", "not-an-ip"]), Err(WafError::Config(_))));
        assert!(e.put_list(&["10.0.0.0/33"]).is_err());
        assert_eq!(e.eval_request(&request("1.2.3.4", None), &logger), Decision::Block);

        e.put_list(&["4.3.2.1", ""]).unwrap();
        assert_eq!(e.len(), 1);
        assert_eq!(e.eval_request(&request("1.2.3.4", None), &logger), Decision::Pass);
        assert_eq!(e.eval_request(&request("4.3.2.1", None), &logger), Decision::Block);

        e.put_list::<&str>(&[]).unwrap();
        assert!(e.is_empty());
        assert_eq!(e.eval_request(&request("4.3.2.1", None), &logger), Decision::Pass);
    }

    #[test]
    fn test_list_persisted() {
        let fs = Arc::new(MemFs::default());
        let path = PathBuf::from(DEFAULT_LIST_FILE);

        let e = IpReputationEngine::with_store(Box::new(fs.clone()), &path);
        assert!(e.is_empty());
        e.put_list(&["1.2.3.4", "10.0.0.0/8"]).unwrap();
        assert_eq!(fs.read_file(&path).unwrap(), b"1.2.3.4/32\n10.0.0.0/8");

        fs.write_file(&path, b"1.2.3.4/32\n\nbogus\n10.0.0.0/8\n").unwrap();
        let reloaded = IpReputationEngine::with_store(Box::new(fs.clone()), &path);
        assert_eq!(reloaded.len(), 2);
        let logger = RecordingLogger::default();
        assert_eq!(reloaded.eval_request(&request("10.1.1.1", None), &logger), Decision::Block);
    }

    #[test]
    fn test_trie_prefixes() {
        let mut t = PrefixTrie::new();
        t.insert(u128::from(u32::from_be_bytes([10, 0, 0, 0])), 32, 8);
        t.insert(u128::from(u32::from_be_bytes([10, 1, 0, 0])), 32, 16);
        assert!(t.contains(u128::from(u32::from_be_bytes([10, 1, 2, 3])), 32));
        assert!(!t.contains(u128::from(u32::from_be_bytes([11, 0, 0, 0])), 32));

        let mut all = PrefixTrie::new();
        all.insert(0, 32, 0);
        assert!(all.contains(u128::from(u32::MAX), 32));
    }
}
