//! Input constraints on admission: allowed MIME types, the 50 MiB
//! size ceiling, and the http(s)-only URL scheme restriction.

use crate::error::ApiError;

pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/tiff",
];

pub const MAX_FILE_SIZE_BYTES: usize = 50 * 1024 * 1024;

pub fn validate_mime_type(mime_type: &str) -> Result<(), ApiError> {
    if ALLOWED_MIME_TYPES.contains(&mime_type) {
        Ok(())
    } else {
        Err(ApiError::Validation(format!(
            "unsupported mimeType {mime_type:?}, expected one of {ALLOWED_MIME_TYPES:?}"
        )))
    }
}

pub fn validate_file_size(size: usize) -> Result<(), ApiError> {
    if size <= MAX_FILE_SIZE_BYTES {
        Ok(())
    } else {
        Err(ApiError::Validation(format!(
            "file size {size} exceeds the {MAX_FILE_SIZE_BYTES} byte limit"
        )))
    }
}

pub fn validate_url_scheme(url: &str) -> Result<url::Url, ApiError> {
    let parsed =
        url::Url::parse(url).map_err(|e| ApiError::Validation(format!("invalid url: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(ApiError::Validation(format!(
            "unsupported url scheme {other:?}, expected http or https"
        ))),
    }
}
