//! Which files may be uploaded and how their object keys look.

use uuid::Uuid;

/// Accepted content types and the extension their keys carry.
const ALLOWED_CONTENT_TYPES: &[(&str, &str)] = &[
    ("image/jpeg", ".jpg"),
    ("image/png", ".png"),
    ("image/webp", ".webp"),
    ("image/gif", ".gif"),
    ("image/heic", ".heic"),
    ("image/heif", ".heif"),
    ("image/avif", ".avif"),
    ("image/tiff", ".tiff"),
    ("image/bmp", ".bmp"),
    ("image/x-ms-bmp", ".bmp"),
    ("application/pdf", ".pdf"),
    ("application/msword", ".doc"),
    (
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ".docx",
    ),
    ("application/vnd.ms-excel", ".xls"),
    (
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        ".xlsx",
    ),
    ("application/vnd.ms-powerpoint", ".ppt"),
    (
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        ".pptx",
    ),
    ("application/zip", ".zip"),
    ("audio/mpeg", ".mp3"),
    ("audio/ogg", ".ogg"),
    ("audio/webm", ".webm"),
    ("audio/wav", ".wav"),
    ("video/mp4", ".mp4"),
    ("video/webm", ".webm"),
];

pub const KEY_PREFIX: &str = "uploads/";

/// Strip parameters (`; charset=...`) and normalize case.
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub fn extension_for(content_type: &str) -> Option<&'static str> {
    let essence = essence(content_type);
    ALLOWED_CONTENT_TYPES
        .iter()
        .find(|(ct, _)| *ct == essence)
        .map(|(_, ext)| *ext)
}

pub fn is_allowed(content_type: &str) -> bool {
    extension_for(content_type).is_some()
}

pub fn is_image(content_type: &str) -> bool {
    essence(content_type).starts_with("image/")
}

/// A fresh, time-ordered key: `uploads/<uuid v7><ext>`.
pub fn new_object_key(content_type: &str) -> Option<String> {
    let ext = extension_for(content_type)?;
    Some(format!("{KEY_PREFIX}{}{ext}", Uuid::now_v7()))
}

/// Keys are only ever ones this server handed out.
pub fn is_valid_key(key: &str) -> bool {
    key.len() > KEY_PREFIX.len() && key.starts_with(KEY_PREFIX) && !key.contains("..")
}
