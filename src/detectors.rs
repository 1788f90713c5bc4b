//! Optional detection passes over the loaded object set: OS distribution,
//! shells, certificate files, UTF-8 text classification.
//!
//! Each detector is independently fallible; the Package Loader records a
//! failure per detector and keeps going.

use crate::matchers::MAX_MATCH_DATA_SIZE;
use crate::tar_index::TarIndex;
use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Shell binaries worth flagging in a minified image.
pub const SHELL_PATHS: &[&str] = &[
    "bin/sh",
    "bin/bash",
    "bin/dash",
    "bin/ash",
    "bin/zsh",
    "bin/busybox",
    "usr/bin/sh",
    "usr/bin/bash",
    "usr/bin/dash",
    "usr/bin/zsh",
    "usr/bin/fish",
    "usr/bin/ksh",
];

const OS_RELEASE_PATHS: &[&str] = &["etc/os-release", "usr/lib/os-release"];

const CA_CERT_PREFIXES: &[&str] = &[
    "etc/ssl/certs",
    "usr/share/ca-certificates",
    "usr/local/share/ca-certificates",
    "etc/ca-certificates",
    "etc/pki/ca-trust",
];

const CERT_PREFIXES: &[&str] = &["etc/ssl", "etc/pki", "usr/lib/ssl", "usr/share/pki"];

/// Parsed `os-release` identity.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DistroInfo {
    pub id: String,
    pub name: String,
    pub version: Option<String>,
}

/// Parses `os-release` key=value content.
pub fn parse_os_release(data: &str) -> Option<DistroInfo> {
    let mut id = None;
    let mut name = None;
    let mut version = None;
    for line in data.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim_matches('"').to_string();
        match key {
            "ID" => id = Some(value),
            "PRETTY_NAME" => name = Some(value),
            "VERSION_ID" => version = Some(value),
            _ => {}
        }
    }
    let id = id?;
    Some(DistroInfo {
        name: name.unwrap_or_else(|| id.clone()),
        id,
        version,
    })
}

/// Reads the distro identity from the final live tree.
pub fn detect_distro(
    live: &BTreeMap<String, usize>,
    indexes: &[TarIndex],
) -> Result<Option<DistroInfo>> {
    for candidate in OS_RELEASE_PATHS {
        let Some(&layer) = live.get(*candidate) else {
            continue;
        };
        let Some(meta) = indexes[layer].get(candidate) else {
            continue;
        };
        let data = indexes[layer].read_entry(meta)?;
        if let Some(info) = parse_os_release(&String::from_utf8_lossy(&data)) {
            return Ok(Some(info));
        }
    }
    Ok(None)
}

/// Shell binaries present in the final live tree.
pub fn detect_shells(live: &BTreeMap<String, usize>) -> Result<Vec<String>> {
    Ok(SHELL_PATHS
        .iter()
        .filter(|p| live.contains_key(**p))
        .map(|p| p.to_string())
        .collect())
}

/// Certificate and CA-certificate files in the final live tree.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CertsInfo {
    pub cert_files: BTreeSet<String>,
    pub ca_cert_files: BTreeSet<String>,
}

impl CertsInfo {
    pub fn is_empty(&self) -> bool {
        self.cert_files.is_empty() && self.ca_cert_files.is_empty()
    }
}

pub fn detect_certs(live: &BTreeMap<String, usize>) -> Result<CertsInfo> {
    let mut certs = CertsInfo::default();
    for path in live.keys() {
        if under_any(path, CA_CERT_PREFIXES) {
            certs.ca_cert_files.insert(path.clone());
        } else if under_any(path, CERT_PREFIXES) && looks_like_cert(path) {
            certs.cert_files.insert(path.clone());
        }
    }
    Ok(certs)
}

fn under_any(path: &str, prefixes: &[&str]) -> bool {
    prefixes
        .iter()
        .any(|p| path.strip_prefix(p).is_some_and(|rest| rest.starts_with('/')))
}

fn looks_like_cert(path: &str) -> bool {
    path.ends_with(".pem") || path.ends_with(".crt") || path.ends_with(".cert")
}

/// Paths in the final live tree whose content is valid UTF-8 text, bounded
/// by the data-read policy.
pub fn detect_utf8(
    live: &BTreeMap<String, usize>,
    indexes: &[TarIndex],
) -> Result<Vec<String>> {
    let mut text_paths = Vec::new();
    for (path, &layer) in live {
        let Some(meta) = indexes[layer].get(path) else {
            continue;
        };
        if !meta.is_file() || meta.size == 0 || meta.size > MAX_MATCH_DATA_SIZE {
            continue;
        }
        let data = indexes[layer].read_entry(meta)?;
        if std::str::from_utf8(&data).is_ok() {
            text_paths.push(path.clone());
        }
    }
    Ok(text_paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_os_release() {
        let data = r#"
NAME="Alpine Linux"
ID=alpine
VERSION_ID=3.20.1
PRETTY_NAME="Alpine Linux v3.20"
"#;
        let info = parse_os_release(data).unwrap();
        assert_eq!(info.id, "alpine");
        assert_eq!(info.name, "Alpine Linux v3.20");
        assert_eq!(info.version.as_deref(), Some("3.20.1"));
    }

    #[test]
    fn os_release_without_id_is_none() {
        assert!(parse_os_release("NAME=\"mystery\"").is_none());
        assert!(parse_os_release("").is_none());
    }

    #[test]
    fn shells_from_live_view() {
        let mut live = BTreeMap::new();
        live.insert("bin/sh".to_string(), 0);
        live.insert("usr/bin/fish".to_string(), 1);
        live.insert("etc/passwd".to_string(), 0);
        let shells = detect_shells(&live).unwrap();
        assert_eq!(shells, vec!["bin/sh", "usr/bin/fish"]);
    }

    #[test]
    fn cert_classification() {
        let mut live = BTreeMap::new();
        live.insert("etc/ssl/certs/ca-certificates.crt".to_string(), 0);
        live.insert("etc/ssl/private/server.pem".to_string(), 0);
        live.insert("etc/ssl/openssl.cnf".to_string(), 0);
        live.insert("usr/bin/openssl".to_string(), 0);

        let certs = detect_certs(&live).unwrap();
        assert!(certs
            .ca_cert_files
            .contains("etc/ssl/certs/ca-certificates.crt"));
        assert!(certs.cert_files.contains("etc/ssl/private/server.pem"));
        assert!(!certs.cert_files.contains("etc/ssl/openssl.cnf"));
        assert!(!certs.cert_files.contains("usr/bin/openssl"));
    }
}
