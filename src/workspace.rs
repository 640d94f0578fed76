// src/workspace.rs
//
// Local storage for pulled kits.
//
// Layout: `<root>/<provider>-<kit>/<payload>` plus `<root>/<provider>-<kit>/metadata.json`.
// Entries are staged in a hidden directory under the root and renamed into
// place once complete, so an entry is either fully there or not there at all.

use crate::error::ConnectorError;
use crate::models::Offer;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use percent_encoding::percent_decode_str;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Name of the metadata sidecar inside every entry.
pub const METADATA_FILE: &str = "metadata.json";

const STAGING_PREFIX: &str = ".staging-";
const REPLACED_PREFIX: &str = ".replaced-";
const PREVIOUS_ENTRY: &str = "previous";

/// Where the payload file name comes from when the offer names no default file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilenameSource {
    /// Always the kit name.
    #[default]
    KitName,
    /// The `Content-Disposition` filename if the response carries one, else the kit name.
    ContentDisposition,
}

/// A complete entry on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceEntry {
    pub folder: PathBuf,
    pub payload: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    filename_source: FilenameSource,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            filename_source: FilenameSource::default(),
        }
    }

    pub fn with_filename_source(mut self, source: FilenameSource) -> Self {
        self.filename_source = source;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical folder key for a kit: `{provider_id}-{kit_name}`.
    pub fn folder_key(provider_id: &str, kit_name: &str) -> String {
        sanitize_component(&format!("{}-{}", provider_id, kit_name))
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Picks the payload file name.
    ///
    /// The offer's `default_file_name` wins. Otherwise the kit name is used,
    /// unless the workspace is set to trust `Content-Disposition` and the
    /// response named a file.
    pub fn payload_file_name(
        &self,
        offer: &Offer,
        kit_name: &str,
        content_disposition: Option<&str>,
    ) -> String {
        let from_header = match self.filename_source {
            FilenameSource::ContentDisposition => {
                content_disposition.and_then(filename_from_content_disposition)
            }
            FilenameSource::KitName => None,
        };

        offer
            .default_file_name
            .as_deref()
            .and_then(usable_file_name)
            .or_else(|| from_header.as_deref().and_then(usable_file_name))
            .or_else(|| usable_file_name(kit_name))
            .unwrap_or_else(|| "payload".to_string())
    }

    /// Returns the entry under `key` if it is complete: metadata plus exactly
    /// one payload file.
    pub async fn existing_entry(&self, key: &str) -> Option<WorkspaceEntry> {
        let folder = self.entry_path(key);
        match fs::metadata(folder.join(METADATA_FILE)).await {
            Ok(meta) if meta.is_file() => {}
            _ => return None,
        }

        let mut dir = fs::read_dir(&folder).await.ok()?;
        let mut payload = None;
        while let Ok(Some(entry)) = dir.next_entry().await {
            if entry.file_name() == METADATA_FILE {
                continue;
            }
            match entry.file_type().await {
                Ok(kind) if kind.is_file() => {}
                _ => continue,
            }
            if payload.is_some() {
                return None;
            }
            let bytes = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            payload = Some((entry.path(), bytes));
        }

        let (payload, bytes) = payload?;
        Some(WorkspaceEntry {
            folder,
            payload,
            bytes,
        })
    }

    /// Writes `metadata.json` and streams `body` into `file_name`, then swaps
    /// the result in as entry `key`, replacing whatever was there.
    ///
    /// On any failure the staging directory is removed and the previous entry
    /// (if any) stays as it was.
    pub async fn materialize(
        &self,
        key: &str,
        file_name: &str,
        offer: &Offer,
        body: BoxStream<'static, Result<Bytes, String>>,
    ) -> Result<WorkspaceEntry, ConnectorError> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            ConnectorError::Persistence(format!("{}: {}", self.root.display(), e))
        })?;

        let staging = scratch_dir(&self.root, STAGING_PREFIX).await?;
        let bytes = match write_staged(staging.path(), file_name, offer, body).await {
            Ok(bytes) => bytes,
            Err(e) => {
                discard(staging).await;
                return Err(e);
            }
        };

        let target = self.entry_path(key);
        if let Err(e) = self.swap_into_place(staging.path(), &target).await {
            discard(staging).await;
            return Err(e);
        }
        // The staging directory is the entry now.
        let _ = staging.keep();

        info!(
            "Workspace: Materialized {} ({} bytes) at {}",
            file_name,
            bytes,
            target.display()
        );

        Ok(WorkspaceEntry {
            payload: target.join(file_name),
            folder: target,
            bytes,
        })
    }

    async fn swap_into_place(&self, staged: &Path, target: &Path) -> Result<(), ConnectorError> {
        if fs::metadata(target).await.is_err() {
            return fs::rename(staged, target).await.map_err(|e| {
                ConnectorError::Persistence(format!("Failed to move entry into place: {}", e))
            });
        }

        // Move the old entry aside first so a failed rename can put it back.
        let replaced = scratch_dir(&self.root, REPLACED_PREFIX).await?;
        if let Err(e) = fs::rename(target, replaced.path().join(PREVIOUS_ENTRY)).await {
            discard(replaced).await;
            return Err(ConnectorError::Persistence(format!(
                "Failed to move old entry aside: {}",
                e
            )));
        }

        if let Err(e) = fs::rename(staged, target).await {
            return Err(match restore_previous(replaced, target).await {
                Ok(()) => ConnectorError::Persistence(format!("Failed to move entry into place: {}", e)),
                Err(kept) => ConnectorError::Persistence(format!(
                    "Failed to move entry into place: {}; previous entry kept at {}",
                    e,
                    kept.display()
                )),
            });
        }

        discard(replaced).await;
        Ok(())
    }
}

/// Creates a hidden scratch directory under `root`.
async fn scratch_dir(root: &Path, prefix: &'static str) -> Result<TempDir, ConnectorError> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || tempfile::Builder::new().prefix(prefix).tempdir_in(&root))
        .await
        .map_err(|e| ConnectorError::Persistence(format!("Scratch directory task failed: {}", e)))?
        .map_err(|e| ConnectorError::Persistence(format!("Failed to create scratch directory: {}", e)))
}

/// Removes a scratch directory and everything in it on the blocking pool.
async fn discard(dir: TempDir) {
    let path = dir.path().to_path_buf();
    match tokio::task::spawn_blocking(move || dir.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Workspace: Could not remove {}: {}", path.display(), e),
        Err(e) => warn!("Workspace: Cleanup of {} did not finish: {}", path.display(), e),
    }
}

/// Moves the entry parked in `replaced` back to `target`.
///
/// If that fails the scratch directory is kept instead of deleted, and its
/// path is returned so the old entry can still be recovered by hand.
async fn restore_previous(replaced: TempDir, target: &Path) -> Result<(), PathBuf> {
    match fs::rename(replaced.path().join(PREVIOUS_ENTRY), target).await {
        Ok(()) => {
            discard(replaced).await;
            Ok(())
        }
        Err(e) => {
            let kept = replaced.keep();
            warn!(
                "Workspace: Could not restore previous entry at {}: {}; left it in {}",
                target.display(),
                e,
                kept.display()
            );
            Err(kept)
        }
    }
}

/// Writes `metadata.json` and the payload into `staging`, returning the payload size.
async fn write_staged(
    staging: &Path,
    file_name: &str,
    offer: &Offer,
    mut body: BoxStream<'static, Result<Bytes, String>>,
) -> Result<u64, ConnectorError> {
    let metadata = serde_json::to_vec_pretty(offer)
        .map_err(|e| ConnectorError::Persistence(format!("Failed to serialize metadata: {}", e)))?;
    fs::write(staging.join(METADATA_FILE), metadata)
        .await
        .map_err(|e| ConnectorError::Persistence(format!("Failed to write metadata: {}", e)))?;

    let staged_payload = staging.join(file_name);
    let mut file = fs::File::create(&staged_payload)
        .await
        .map_err(|e| ConnectorError::Persistence(format!("Failed to create payload file: {}", e)))?;

    let mut bytes: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(ConnectorError::Upstream)?;
        file.write_all(&chunk)
            .await
            .map_err(|e| ConnectorError::Persistence(format!("Failed to write payload: {}", e)))?;
        bytes += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| ConnectorError::Persistence(format!("Failed to flush payload: {}", e)))?;
    file.sync_all()
        .await
        .map_err(|e| ConnectorError::Persistence(format!("Failed to sync payload: {}", e)))?;
    Ok(bytes)
}

/// Extracts the file name from a `Content-Disposition` header value.
/// `filename*` (RFC 5987) is preferred over plain `filename` and is
/// percent-decoded; invalid UTF-8 is replaced rather than rejected.
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for part in header.split(';').map(str::trim) {
        let Some((name, value)) = part.split_once('=') else {
            continue;
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "filename" => plain = Some(value.trim().trim_matches('"').to_string()),
            "filename*" => {
                let value = value.trim();
                let value = value.split_once("''").map(|(_, v)| v).unwrap_or(value);
                let value = value.trim_matches('"');
                extended = Some(percent_decode_str(value).decode_utf8_lossy().into_owned());
            }
            _ => {}
        }
    }

    extended.or(plain).filter(|name| !name.is_empty())
}

/// Keeps only the last path component and refuses names that would escape
/// the entry or collide with the sidecar.
fn usable_file_name(name: &str) -> Option<String> {
    let name = name.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." || name == METADATA_FILE {
        return None;
    }
    Some(name.to_string())
}

fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}
