//! Host key verification against an OpenSSH known_hosts file

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::HostKeyPolicy;

/// Result of looking a key up in known_hosts
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches a stored entry
    Verified,
    /// No entry of this key type for the host
    Unknown { fingerprint: String },
    /// Stored key of the same type differs
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Outcome of applying a [`HostKeyPolicy`] to a verification result
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyDecision {
    Accept,
    AcceptAndRecord,
    Reject(String),
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

pub struct KnownHostsStore {
    /// Lookup key (see `make_key`) -> stored keys
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// ~/.ssh/known_hosts
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from("known_hosts"))
    }

    /// Open the store at `path`. A missing or unreadable file starts empty.
    pub fn open(path: PathBuf) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path,
        };
        if let Err(e) = store.load() {
            warn!("Failed to load known_hosts from {:?}: {}", store.path, e);
        }
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> std::io::Result<()> {
        if !self.path.exists() {
            debug!("No known_hosts file at {:?}", self.path);
            return Ok(());
        }

        let reader = BufReader::new(fs::File::open(&self.path)?);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let mut parts = line.split_whitespace();
            let (Some(hostnames), Some(key_type), Some(key_data)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };

            let entry = HostKeyEntry {
                key_type: key_type.to_string(),
                key_data: key_data.to_string(),
            };

            for hostname in hostnames.split(',') {
                // Hashed entries (|1|...) are not matched
                if hostname.starts_with('|') || hostname.is_empty() {
                    continue;
                }
                hosts
                    .entry(Self::normalize_hostname(hostname))
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        info!(
            "Loaded {} known host entries ({} unique hosts)",
            entry_count,
            hosts.len()
        );
        Ok(())
    }

    /// Canonical lookup form of a known_hosts hostname field.
    /// `[host]:22` collapses to `host`, other ports keep the bracket form.
    fn normalize_hostname(host: &str) -> String {
        let lower = host.to_lowercase();
        if let Some(rest) = lower.strip_prefix('[') {
            if let Some((name, port)) = rest.split_once("]:") {
                return match port.parse::<u16>() {
                    Ok(port) => Self::make_key(name, port),
                    Err(_) => name.to_string(),
                };
            }
            return rest.trim_end_matches(']').to_string();
        }
        lower
    }

    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    fn fingerprint_bytes(bytes: &[u8]) -> String {
        let hash = Sha256::digest(bytes);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    fn fingerprint_b64(key_b64: &str) -> String {
        match BASE64.decode(key_b64) {
            Ok(bytes) => Self::fingerprint_bytes(&bytes),
            Err(_) => "unknown".to_string(),
        }
    }

    /// SHA256 fingerprint in the format `ssh-keygen -l` prints
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn encode(key: &PublicKey) -> (String, String) {
        (
            key.algorithm().as_str().to_string(),
            BASE64.encode(key.public_key_bytes()),
        )
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let (key_type, key_b64) = Self::encode(key);
        self.verify_encoded(host, port, &key_type, &key_b64)
    }

    /// Verify a key given in known_hosts encoding (type name + base64 blob)
    pub fn verify_encoded(
        &self,
        host: &str,
        port: u16,
        key_type: &str,
        key_b64: &str,
    ) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let fingerprint = Self::fingerprint_b64(key_b64);
        let hosts = self.hosts.read();

        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        let mut same_type = entries.iter().filter(|e| e.key_type == key_type).peekable();
        let Some(first) = same_type.peek().copied() else {
            debug!("Host {} has no {} key stored", lookup_key, key_type);
            return HostKeyVerification::Unknown { fingerprint };
        };

        // A host may list several keys of one type while rotating
        if same_type.any(|e| e.key_data == key_b64) {
            debug!("Host key verified for {} ({})", lookup_key, key_type);
            HostKeyVerification::Verified
        } else {
            HostKeyVerification::Changed {
                expected_fingerprint: Self::fingerprint_b64(&first.key_data),
                actual_fingerprint: fingerprint,
            }
        }
    }

    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> std::io::Result<()> {
        let (key_type, key_b64) = Self::encode(key);
        self.add_encoded(host, port, &key_type, &key_b64)
    }

    /// Record a key in memory and append it to the file
    pub fn add_encoded(
        &self,
        host: &str,
        port: u16,
        key_type: &str,
        key_b64: &str,
    ) -> std::io::Result<()> {
        let lookup_key = Self::make_key(host, port);

        self.hosts
            .write()
            .entry(lookup_key.clone())
            .or_default()
            .push(HostKeyEntry {
                key_type: key_type.to_string(),
                key_data: key_b64.to_string(),
            });

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {} {}", lookup_key, key_type, key_b64)?;

        info!("Added {} host key for {} to {:?}", key_type, lookup_key, self.path);
        Ok(())
    }
}

/// Apply the configured policy to a lookup result
pub fn decide(
    policy: HostKeyPolicy,
    host: &str,
    port: u16,
    verification: &HostKeyVerification,
) -> HostKeyDecision {
    match (policy, verification) {
        (HostKeyPolicy::AcceptAny, _) => HostKeyDecision::Accept,
        (_, HostKeyVerification::Verified) => HostKeyDecision::Accept,
        (_, HostKeyVerification::Changed {
            expected_fingerprint,
            actual_fingerprint,
        }) => HostKeyDecision::Reject(format!(
            "Host key for {}:{} has changed (expected {}, got {}). \
             Remove the old entry from known_hosts if the change is legitimate.",
            host, port, expected_fingerprint, actual_fingerprint
        )),
        (HostKeyPolicy::Strict, HostKeyVerification::Unknown { fingerprint }) => {
            HostKeyDecision::Reject(format!(
                "Unknown host {}:{} (fingerprint {}) and strict host key checking is enabled.",
                host, port, fingerprint
            ))
        }
        (HostKeyPolicy::AcceptNew, HostKeyVerification::Unknown { .. }) => {
            HostKeyDecision::AcceptAndRecord
        }
    }
}
