//! Media payload validation and format sniffing.

use crate::error::MediaError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// A validated media payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPayload {
    /// MIME type declared by a data URL, if the input was one.
    pub declared_mime: Option<String>,
    /// Decoded bytes.
    pub bytes: Vec<u8>,
    /// The base64 text without any data-URL prefix.
    pub base64: String,
}

impl MediaPayload {
    /// Data URL for this payload, with `fallback_mime` when nothing better
    /// is known.
    pub fn data_url(&self, fallback_mime: &str) -> String {
        let mime = self.declared_mime.as_deref().unwrap_or(fallback_mime);
        format!("data:{};base64,{}", mime, self.base64)
    }
}

/// Accept raw base64 or a `data:<mime>;base64,` URL.
pub fn decode(input: &str) -> Result<MediaPayload, MediaError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(MediaError::Empty);
    }

    let (declared_mime, data) = match trimmed.strip_prefix("data:") {
        Some(rest) => {
            let (mime, data) = rest
                .split_once(";base64,")
                .ok_or(MediaError::MalformedDataUrl)?;
            let mime = mime.trim();
            (
                (!mime.is_empty()).then(|| mime.to_string()),
                data.trim(),
            )
        }
        None => (None, trimmed),
    };

    if data.is_empty() {
        return Err(MediaError::Empty);
    }

    let bytes = STANDARD
        .decode(data)
        .map_err(|e| MediaError::MalformedBase64(e.to_string()))?;

    Ok(MediaPayload {
        declared_mime,
        bytes,
        base64: data.to_string(),
    })
}

/// Image MIME type from magic bytes, defaulting to JPEG.
pub fn sniff_image_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        "image/gif"
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else if bytes.starts_with(b"BM") {
        "image/bmp"
    } else {
        "image/jpeg"
    }
}

/// Audio container format from magic bytes, defaulting to mp3.
pub fn sniff_audio_format(bytes: &[u8]) -> &'static str {
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        "wav"
    } else if bytes.starts_with(b"OggS") {
        "ogg"
    } else if bytes.starts_with(b"fLaC") {
        "flac"
    } else {
        "mp3"
    }
}

/// Audio format from a declared MIME type such as `audio/wav`.
pub fn audio_format_from_mime(mime: &str) -> Option<&'static str> {
    match mime.trim().to_lowercase().as_str() {
        "audio/wav" | "audio/x-wav" | "audio/wave" => Some("wav"),
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/ogg" => Some("ogg"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        _ => None,
    }
}
