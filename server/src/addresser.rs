//! Content addressing: where an asset's bytes live and how they are fingerprinted.

use uuid::Uuid;

use crate::error::{UploadError, UploadResult};

const MAX_EXTENSION_LEN: usize = 10;
const SVG_SNIFF_LEN: usize = 512;
const BMP_HEADER_LEN: usize = 26;

/// Derives storage keys and content hashes.
#[derive(Debug, Clone)]
pub struct ContentAddresser {
    root_namespace: String,
}

impl ContentAddresser {
    /// Creates an addresser rooted at `root_namespace`.
    ///
    /// Leading and trailing slashes are dropped. Every remaining segment must be made of
    /// ASCII letters, digits, `_` or `-`.
    pub fn new(root_namespace: &str) -> UploadResult<Self> {
        let trimmed = root_namespace.trim_matches('/');
        if trimmed.is_empty() {
            return Err(UploadError::invalid_input("root namespace is empty"));
        }
        if let Some(bad) = trimmed.split('/').find(|s| !is_safe_segment(s)) {
            return Err(UploadError::invalid_input(format!(
                "root namespace segment '{bad}' is not path safe"
            )));
        }
        Ok(Self {
            root_namespace: trimmed.to_owned(),
        })
    }

    /// `{root}/containers_{container}/owners_{owner}/{asset}.{extension}`
    pub fn compute_key(
        &self,
        owner_id: i64,
        container_id: i64,
        asset_id: Uuid,
        extension: &str,
    ) -> UploadResult<String> {
        let extension = normalize_extension(extension)?;
        Ok(format!(
            "{}/containers_{container_id}/owners_{owner_id}/{asset_id}.{extension}",
            self.root_namespace
        ))
    }

    #[must_use]
    pub fn compute_hash(bytes: &[u8]) -> String {
        blake3::hash(bytes).to_string()
    }

    /// Sniffed extension wins over the declared one, as a client supplied name can lie.
    pub fn resolve_extension(declared: Option<&str>, bytes: &[u8]) -> UploadResult<String> {
        if let Some(sniffed) = sniff_extension(bytes) {
            return Ok(sniffed.to_owned());
        }
        match declared {
            Some(ext) if !ext.trim().is_empty() => normalize_extension(ext),
            _ => Err(UploadError::invalid_input(
                "file extension is missing and cannot be determined from content",
            )),
        }
    }
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn normalize_extension(extension: &str) -> UploadResult<String> {
    let ext = extension.trim().trim_start_matches('.').to_ascii_lowercase();
    if ext.is_empty() {
        return Err(UploadError::invalid_input("file extension is empty"));
    }
    if ext.len() > MAX_EXTENSION_LEN || !ext.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(UploadError::invalid_input(format!(
            "file extension '{ext}' is not path safe"
        )));
    }
    Ok(ext)
}

/// Extension of a file name, if it has one.
#[must_use]
pub fn extension_of(file_name: &str) -> Option<&str> {
    let name = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(ix) => Some(&name[ix + 1..]),
    }
}

/// Guesses the extension from well known magic numbers.
#[must_use]
pub fn sniff_extension(bytes: &[u8]) -> Option<&'static str> {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\xFF\xD8\xFF", "jpg"),
        (b"\x89PNG\r\n\x1A\n", "png"),
        (b"GIF87a", "gif"),
        (b"GIF89a", "gif"),
        (b"II*\x00", "tiff"),
        (b"MM\x00*", "tiff"),
        (b"%PDF-", "pdf"),
    ];

    if let Some((_, ext)) = SIGNATURES.iter().find(|(magic, _)| bytes.starts_with(magic)) {
        return Some(*ext);
    }
    if is_bmp(bytes) {
        return Some("bmp");
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("webp");
    }
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        return match &bytes[8..12] {
            b"avif" | b"avis" => Some("avif"),
            b"heic" | b"heix" | b"mif1" => Some("heic"),
            _ => Some("mp4"),
        };
    }
    let head = &bytes[..bytes.len().min(SVG_SNIFF_LEN)];
    let head = String::from_utf8_lossy(head);
    if head.trim_start().starts_with("<svg") || (head.contains("<?xml") && head.contains("<svg"))
    {
        return Some("svg");
    }
    None
}

/// `BM` alone is too common in text, so the header must also carry the content length,
/// zero reserved fields and a pixel offset inside the content.
fn is_bmp(bytes: &[u8]) -> bool {
    if bytes.len() < BMP_HEADER_LEN || !bytes.starts_with(b"BM") {
        return false;
    }
    let le = |at: usize| {
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    };
    let offset = le(10) as usize;
    le(2) as usize == bytes.len()
        && le(6) == 0
        && (BMP_HEADER_LEN..=bytes.len()).contains(&offset)
}

/// Mime type for a resolved extension.
#[must_use]
pub fn mime_for_extension(extension: &str) -> Option<&'static str> {
    let mime = match extension {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "heic" => "image/heic",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "mp4" => "video/mp4",
        _ => return None,
    };
    Some(mime)
}
