use super::{Descriptor, FileEntry, Pieces};
use crate::bencode::{Bencode, Decoder};
use crate::error::{BittorrentError, Result};
use sha1::{Digest, Sha1};
use std::ops::Range;
use std::path::{Component, Path, PathBuf};

impl Descriptor {
    /// Parse a `.torrent` document into a descriptor for this client.
    pub fn from_torrent_bytes(data: &[u8], peer_id: [u8; 20]) -> Result<Self> {
        let (root, info_span) = decode_root(data)?;
        let info_span = info_span.ok_or_else(|| invalid("Missing 'info' field"))?;
        let info = root.get(b"info").ok_or_else(|| invalid("Missing 'info' field"))?;

        let name = info
            .get_str(b"name")
            .ok_or_else(|| invalid("Missing 'name' field"))
            .and_then(path_component)?
            .to_string();

        let piece_length = info
            .get_u64(b"piece length")
            .ok_or_else(|| invalid("Missing 'piece length' field"))?;

        let pieces = info
            .get(b"pieces")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| invalid("Missing 'pieces' field"))
            .and_then(Pieces::from_bytes)?;

        let files = parse_files(info, &name)?;
        let total_length = files.iter().map(|f| f.length).sum();

        let mut hasher = Sha1::new();
        hasher.update(&data[info_span]);
        let info_hash: [u8; 20] = hasher.finalize().into();

        let descriptor = Descriptor {
            name,
            info_hash,
            peer_id,
            piece_length,
            pieces,
            total_length,
            files,
            announce_list: parse_announce_list(&root),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Decode the top-level dictionary, remembering where `info` sits.
fn decode_root(data: &[u8]) -> Result<(Bencode, Option<Range<usize>>)> {
    let mut decoder = Decoder::new(data);
    if !decoder.eat(b'd')? {
        return Err(invalid("Torrent must be a dict"));
    }

    let mut dict = std::collections::BTreeMap::new();
    let mut info_span = None;
    while !decoder.eat(b'e')? {
        let key = decoder.decode_bytes()?;
        let (value, span) = decoder.decode_value_with_span()?;
        if key == b"info" {
            info_span = Some(span);
        }
        dict.insert(key, value);
    }

    Ok((Bencode::Dict(dict), info_span))
}

fn parse_files(info: &Bencode, name: &str) -> Result<Vec<FileEntry>> {
    if let Some(length) = info.get_u64(b"length") {
        return Ok(vec![FileEntry::new(name, length)]);
    }

    let list = info
        .get(b"files")
        .and_then(|v| v.as_list())
        .ok_or_else(|| invalid("Missing 'length' or 'files' field"))?;

    list.iter()
        .map(|entry| {
            let length = entry
                .get_u64(b"length")
                .ok_or_else(|| invalid("Missing file 'length'"))?;
            let components = entry
                .get(b"path")
                .and_then(|v| v.as_list())
                .ok_or_else(|| invalid("Missing file 'path'"))?;

            let mut path = PathBuf::from(name);
            for component in components {
                let component = component
                    .as_str()
                    .ok_or_else(|| invalid("Invalid path component"))
                    .and_then(path_component)?;
                path.push(component);
            }
            Ok(FileEntry::new(path, length))
        })
        .collect()
}

/// A single plain file or directory name: no separators, no `.`/`..`,
/// nothing absolute.
fn path_component(component: &str) -> Result<&str> {
    let mut parts = Path::new(component).components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(_)), None) if !component.contains(&['/', '\\'][..]) => Ok(component),
        _ => Err(invalid(&format!("Unsafe path component: {:?}", component))),
    }
}

/// `announce` followed by every tier of `announce-list`, without duplicates
fn parse_announce_list(root: &Bencode) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    let mut push = |url: &str| {
        if !urls.iter().any(|u| u == url) {
            urls.push(url.to_string());
        }
    };

    if let Some(url) = root.get_str(b"announce") {
        push(url);
    }

    let tiers = root.get(b"announce-list").and_then(|v| v.as_list());
    for tier in tiers.unwrap_or_default() {
        for url in tier.as_list().unwrap_or_default() {
            if let Some(url) = url.as_str() {
                push(url);
            }
        }
    }

    urls
}

fn invalid(message: &str) -> BittorrentError {
    BittorrentError::InvalidTorrent(message.to_string())
}
