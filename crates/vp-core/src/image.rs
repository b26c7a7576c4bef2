// SPDX-License-Identifier: MIT OR Apache-2.0
//! Image format detection over base64 payloads.
//!
//! The detector inspects the leading base64 characters rather than decoding:
//! the PNG magic bytes encode to `iVBORw0KGgo` and the JPEG SOI marker to
//! `/9j/`. Anything else is treated as PNG.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Base64 prefix produced by the 8-byte PNG signature.
const PNG_BASE64_PREFIX: &str = "iVBORw0KGgo";

/// Base64 prefix produced by the JPEG start-of-image marker.
const JPEG_BASE64_PREFIX: &str = "/9j/";

/// Supported image wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Portable Network Graphics.
    Png,
    /// JPEG.
    Jpeg,
}

impl ImageFormat {
    /// Detect the format of a base64-encoded image payload.
    #[must_use]
    pub fn detect(base64: &str) -> Self {
        if base64.starts_with(JPEG_BASE64_PREFIX) {
            Self::Jpeg
        } else if base64.starts_with(PNG_BASE64_PREFIX) {
            Self::Png
        } else {
            // Default when the prefix is unrecognized.
            Self::Png
        }
    }

    /// Wire-format string (`"png"` / `"jpeg"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
        }
    }

    /// MIME type for the format.
    #[must_use]
    pub fn media_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
