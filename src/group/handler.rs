//! Pre- and post-download hooks
//!
//! Pre-download handlers prepare a group right before its first task is
//! created. Post-download handlers turn a finished group into follow-up
//! groups (a fetched info dictionary becomes a torrent download).

use std::path::PathBuf;
use std::rc::Rc;

use tracing::{info, warn};

use super::context::{DownloadContext, TorrentAttributes};
use super::RequestGroup;
use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::torrent::bencode::BencodeValue;

/// Runs before a group's first task
pub trait PreDownloadHandler {
    fn can_handle(&self, group: &RequestGroup) -> bool;

    fn execute(&self, group: &mut RequestGroup) -> Result<()>;
}

/// Runs once a group has finished
pub trait PostDownloadHandler {
    fn can_handle(&self, group: &RequestGroup) -> bool;

    /// Groups that continue the work of `group`
    fn get_next_groups(&self, group: &RequestGroup) -> Result<Vec<RequestGroup>>;
}

/// Builds a download context from a raw info dictionary
pub trait MetadataParser {
    fn parse(&self, info_hash: &[u8; 20], metadata: &[u8]) -> Result<DownloadContext>;
}

fn metadata_error(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::MetadataError, message)
}

/// Parses a bare info dictionary into single- or multi-file layout
#[derive(Debug, Clone, Default)]
pub struct InfoDictParser {
    base_dir: PathBuf,
}

impl InfoDictParser {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn parse_files(&self, name: &str, list: &[BencodeValue]) -> Result<Vec<(PathBuf, u64)>> {
        let mut files = Vec::with_capacity(list.len());
        for entry in list {
            let length = entry
                .get("length")
                .and_then(|v| v.as_uint())
                .ok_or_else(|| metadata_error("Missing 'length' in file entry"))?;
            let components = entry
                .get("path")
                .and_then(|v| v.as_list())
                .ok_or_else(|| metadata_error("Missing 'path' in file entry"))?;
            let mut path = self.base_dir.join(name);
            for component in components {
                let part = component
                    .as_string()
                    .ok_or_else(|| metadata_error("Path component must be a string"))?;
                if part == ".." || part.contains('/') {
                    return Err(metadata_error(format!("Unsafe path component: {}", part)));
                }
                path.push(part);
            }
            files.push((path, length));
        }
        Ok(files)
    }
}

impl MetadataParser for InfoDictParser {
    fn parse(&self, info_hash: &[u8; 20], metadata: &[u8]) -> Result<DownloadContext> {
        let info = BencodeValue::decode(metadata)?;
        if !info.is_dict() {
            return Err(metadata_error("info must be a dictionary"));
        }

        let name = info
            .get("name")
            .and_then(|v| v.as_string())
            .map(str::to_string)
            .unwrap_or_else(|| hex::encode(info_hash));

        let piece_length = info
            .get("piece length")
            .and_then(|v| v.as_uint())
            .filter(|&len| len > 0)
            .ok_or_else(|| metadata_error("Missing or invalid 'piece length'"))?;

        let files = match info.get("files").and_then(|v| v.as_list()) {
            Some(list) => self.parse_files(&name, list)?,
            None => {
                let length = info
                    .get("length")
                    .and_then(|v| v.as_uint())
                    .ok_or_else(|| metadata_error("Missing 'length' for single-file torrent"))?;
                vec![(self.base_dir.join(&name), length)]
            }
        };

        let mut ctx = DownloadContext::new(piece_length, files);
        ctx.set_torrent(TorrentAttributes {
            info_hash: *info_hash,
            name: Some(name),
            metadata: Some(metadata.to_vec()),
            metadata_size: Some(metadata.len()),
            metadata_only: false,
        });
        Ok(ctx)
    }
}

/// Turns a finished metadata-only group into the real torrent download
pub struct UtMetadataPostDownloadHandler {
    parser: Rc<dyn MetadataParser>,
}

impl UtMetadataPostDownloadHandler {
    pub fn new(parser: Rc<dyn MetadataParser>) -> Self {
        Self { parser }
    }
}

impl PostDownloadHandler for UtMetadataPostDownloadHandler {
    fn can_handle(&self, group: &RequestGroup) -> bool {
        let ctx = group.download_context().borrow();
        ctx.torrent()
            .is_some_and(|t| t.metadata_only && t.metadata.is_some())
    }

    fn get_next_groups(&self, group: &RequestGroup) -> Result<Vec<RequestGroup>> {
        let (info_hash, metadata) = {
            let ctx = group.download_context().borrow();
            let Some(attrs) = ctx.torrent() else {
                return Ok(Vec::new());
            };
            let Some(metadata) = attrs.metadata.clone() else {
                return Ok(Vec::new());
            };
            (attrs.info_hash, metadata)
        };

        let ctx = match self.parser.parse(&info_hash, &metadata) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!("Metadata of {} did not parse: {}", hex::encode(info_hash), e);
                return Err(e);
            }
        };
        info!(
            "Metadata of {} fetched, starting torrent download",
            hex::encode(info_hash)
        );

        let next = RequestGroup::new(ctx.into_handle())
            .with_split(group.num_concurrent_command())
            .with_speed_limits(group.max_download_speed_limit(), group.max_upload_speed_limit());
        Ok(vec![next])
    }
}
