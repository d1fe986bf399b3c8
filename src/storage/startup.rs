//! Persisted startup configuration.
//!
//! The startup datastore is a single XML document, `<config>` in the base
//! namespace with one child per module container. It is replaced atomically:
//! the new document is written to a sibling temporary file, synced, and
//! renamed over the old one.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

use crate::{protocol::codec::BASE_NAMESPACE, tree::Node};

/// Read the startup document, if one exists.
pub fn load(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => {
            info!("loaded startup configuration from {}", path.display());
            Ok(Some(text))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("no startup configuration at {}", path.display());
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Atomically replace the startup document with `tree`.
pub fn persist(path: &Path, tree: &Node) -> io::Result<()> {
    let mut document = tree.clone();
    document.name = "config".to_string();
    document.namespace = Some(BASE_NAMESPACE.to_string());

    let tmp = temp_path(path);
    if let Err(e) = write_document(&tmp, &document).and_then(|_| fs::rename(&tmp, path)) {
        if let Err(cleanup) = fs::remove_file(&tmp) {
            if cleanup.kind() != ErrorKind::NotFound {
                warn!("could not remove {}: {cleanup}", tmp.display());
            }
        }
        return Err(e);
    }

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        File::open(dir)?.sync_all()?;
    }
    debug!("persisted startup configuration to {}", path.display());
    Ok(())
}

fn write_document(tmp: &Path, document: &Node) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp)?;
    file.write_all(br#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
    file.write_all(b"\n")?;
    file.write_all(document.to_xml().as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "startup".into());
    name.push(".tmp");
    path.with_file_name(name)
}
