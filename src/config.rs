use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Process-wide parameters, one `Key Value` pair per line.
#[derive(Debug, Clone)]
pub struct CommonConfig {
    pub preferred_neighbors: usize,
    pub unchoke_interval: Duration,
    pub optimistic_unchoke_interval: Duration,
    pub file_name: String,
    pub file_size: u64,
    pub piece_size: u64,
    /// Deployment-time integrity constant; verification is skipped when absent.
    pub expected_sha256: Option<[u8; 32]>,
}

impl CommonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("could not read common config {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut entries = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let key = parts.next().expect("non-empty line has a first token");
            let value = match parts.next() {
                Some(value) => value,
                None => bail!("common config line {line:?} has no value"),
            };
            entries.insert(key.to_string(), value.to_string());
        }

        let expected_sha256 = match entries.get("ExpectedFileSha256") {
            None => None,
            Some(hex_digest) => {
                let bytes = hex::decode(hex_digest)
                    .with_context(|| format!("ExpectedFileSha256 is not hex: {hex_digest:?}"))?;
                let digest: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
                    anyhow::anyhow!(
                        "ExpectedFileSha256 must be 32 bytes, got {}",
                        bytes.len()
                    )
                })?;
                Some(digest)
            }
        };

        let config = CommonConfig {
            preferred_neighbors: required(&entries, "NumberOfPreferredNeighbors")?,
            unchoke_interval: Duration::from_secs(required(&entries, "UnchokingInterval")?),
            optimistic_unchoke_interval: Duration::from_secs(required(
                &entries,
                "OptimisticUnchokingInterval",
            )?),
            file_name: match entries.get("FileName") {
                Some(name) => name.clone(),
                None => bail!("common config is missing FileName"),
            },
            file_size: required(&entries, "FileSize")?,
            piece_size: required(&entries, "PieceSize")?,
            expected_sha256,
        };
        if config.piece_size == 0 {
            bail!("PieceSize must be greater than zero");
        }
        if config.file_size == 0 {
            bail!("FileSize must be greater than zero");
        }
        if config.unchoke_interval.is_zero() || config.optimistic_unchoke_interval.is_zero() {
            bail!("unchoking intervals must be greater than zero");
        }
        Ok(config)
    }
}

fn required<T: std::str::FromStr>(entries: &HashMap<String, String>, key: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match entries.get(key) {
        None => bail!("common config is missing {key}"),
        Some(value) => value
            .parse()
            .with_context(|| format!("common config value for {key} is invalid: {value:?}")),
    }
}

/// One statically known peer, in declared order. Order matters: a peer dials
/// only the peers listed before itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: u32,
    pub host: String,
    pub port: u16,
    pub has_file: bool,
}

pub fn load_peer_list(path: &Path) -> Result<Vec<PeerInfo>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("could not read peer list {}", path.display()))?;
    parse_peer_list(&content)
}

pub fn parse_peer_list(content: &str) -> Result<Vec<PeerInfo>> {
    let mut peers: Vec<PeerInfo> = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            bail!("peer list line {line:?} must be: <peer_id> <host> <port> [<has_file>]");
        }
        let peer_id = parts[0]
            .parse()
            .with_context(|| format!("invalid peer id in line {line:?}"))?;
        let port = parts[2]
            .parse()
            .with_context(|| format!("invalid port in line {line:?}"))?;
        if peers.iter().any(|p| p.peer_id == peer_id) {
            bail!("peer id {peer_id} appears twice in the peer list");
        }
        peers.push(PeerInfo {
            peer_id,
            host: parts[1].to_string(),
            port,
            has_file: parts.len() > 3 && parts[3] == "1",
        });
    }
    if peers.is_empty() {
        bail!("peer list contains no peers");
    }
    Ok(peers)
}
