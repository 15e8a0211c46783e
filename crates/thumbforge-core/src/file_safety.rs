//! Upload intake checks: image content-type validation and safe staging names.

use uuid::Uuid;

/// True for `image/*` MIME types (parameters such as `; charset=` are ignored).
pub fn is_image_mime(mime: &str) -> bool {
    let essence = mime.split(';').next().unwrap_or("").trim();
    match essence.split_once('/') {
        Some((kind, subtype)) => kind.eq_ignore_ascii_case("image") && !subtype.is_empty(),
        None => false,
    }
}

/// Detect actual content type from file magic bytes.
///
/// Returns the detected MIME type if magic bytes match a known format. A
/// claimed `image/*` type whose bytes match nothing is downgraded to
/// `application/octet-stream` so garbage never reaches the worker; any other
/// claimed type is passed through.
pub fn detect_content_type(data: &[u8], claimed: &str) -> String {
    if let Some(kind) = infer::get(data) {
        return kind.mime_type().to_string();
    }

    if is_image_mime(claimed) {
        return "application/octet-stream".to_string();
    }

    claimed.to_string()
}

/// Sanitize filename for safe storage
pub fn sanitize_filename(filename: &str) -> String {
    // Remove path components
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);

    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' | '\0' => '_',
            c if c.is_control() || c.is_whitespace() => '_',
            c => c,
        })
        .collect();

    let sanitized = sanitized.trim_matches(|c| c == '.' || c == '_');
    if sanitized.is_empty() {
        return "unnamed_file".to_string();
    }

    // Truncate on a char boundary, preserving the extension
    const MAX_LEN: usize = 200;
    if sanitized.len() > MAX_LEN {
        let (stem, ext) = match sanitized.rfind('.') {
            Some(dot) if sanitized.len() - dot <= 16 => sanitized.split_at(dot),
            _ => (sanitized, ""),
        };
        let mut end = MAX_LEN - ext.len();
        while !stem.is_char_boundary(end) {
            end -= 1;
        }
        return format!("{}{}", &stem[..end], ext);
    }

    sanitized.to_string()
}

/// Collision-resistant staging name for an upload: `<uuid>-<sanitized original>`.
pub fn staged_filename(original: &str) -> String {
    format!("{}-{}", Uuid::new_v4(), sanitize_filename(original))
}
