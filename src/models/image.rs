//! Image formats and stored-image metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The closed set of image formats the service stores.
///
/// Dispatch on format goes through this enum rather than runtime type
/// inspection: each variant knows its extension, MIME type, and which codec
/// (if any) this build carries for it.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
    Avif,
}

impl ImageFormat {
    /// Sniff the format from magic bytes. Extension and caller claims are
    /// never trusted.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        match image::guess_format(bytes).ok()? {
            image::ImageFormat::Png => Some(Self::Png),
            image::ImageFormat::Jpeg => Some(Self::Jpeg),
            image::ImageFormat::WebP => Some(Self::Webp),
            image::ImageFormat::Avif => Some(Self::Avif),
            _ => None,
        }
    }

    /// Canonical file extension used in object keys (`jpeg`, never `jpg`).
    pub fn ext(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Webp => "webp",
            Self::Avif => "avif",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
            Self::Avif => "image/avif",
        }
    }

    /// The `image`-crate codec for this format, when the build has one.
    ///
    /// AVIF stays in the model (records written elsewhere must still load)
    /// but has no pure-Rust decode/encode path here, so it returns `None`
    /// and upload/resize reject it as unsupported.
    pub fn codec(self) -> Option<image::ImageFormat> {
        match self {
            Self::Png => Some(image::ImageFormat::Png),
            Self::Jpeg => Some(image::ImageFormat::Jpeg),
            Self::Webp => Some(image::ImageFormat::WebP),
            Self::Avif => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.ext()
    }
}

/// Metadata for an uploaded original image.
///
/// One row per `(project, key)`; upserted on upload, immutable otherwise.
/// The payload bytes live in object storage at `s3_path`, not here.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ImageRecord {
    /// Project namespace chosen by the uploader.
    pub project: String,

    /// Key within the project (single path segment, no extension).
    pub key: String,

    /// Sniffed format of the stored bytes.
    pub format: ImageFormat,

    /// Natural pixel width of the original.
    pub width: i64,

    /// Natural pixel height of the original.
    pub height: i64,

    /// Size of the original in bytes.
    pub size_bytes: i64,

    /// Object-storage key of the original, `{project}/{key}.{ext}`.
    pub s3_path: String,

    /// When the image was (last) uploaded.
    pub created_at: DateTime<Utc>,
}

/// Request body for `POST /image`.
#[derive(Debug, Deserialize)]
pub struct UploadImageRequest {
    /// Base64-encoded image data (png, jpeg, webp, avif).
    pub image: String,
    /// Project name to categorize the image.
    pub project: String,
    /// Key for the image within the project; overwrites if it exists.
    pub key: String,
}

/// Response body for `POST /image`.
#[derive(Debug, Serialize)]
pub struct UploadImageResponse {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub size: u64,
}

/// One entry in the `GET /images` listing.
#[derive(Debug, Serialize)]
pub struct ImageSummary {
    pub url: String,
    pub project: String,
    pub key: String,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub size: u64,
}

/// Response body for `GET /images`.
#[derive(Debug, Serialize)]
pub struct ListImagesResponse {
    pub images: Vec<ImageSummary>,
    pub next_continuation_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::DynamicImage::new_rgb8(width, height);
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn sniffs_png_from_magic_bytes() {
        assert_eq!(ImageFormat::sniff(&png_bytes(2, 2)), Some(ImageFormat::Png));
    }

    #[test]
    fn sniffs_jpeg_from_magic_bytes() {
        let img = image::DynamicImage::new_rgb8(2, 2);
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Jpeg).unwrap();
        assert_eq!(
            ImageFormat::sniff(&buf.into_inner()),
            Some(ImageFormat::Jpeg)
        );
    }

    #[test]
    fn rejects_non_image_bytes() {
        assert_eq!(ImageFormat::sniff(b"definitely not an image"), None);
        assert_eq!(ImageFormat::sniff(&[]), None);
    }

    #[test]
    fn extension_is_canonical_jpeg() {
        assert_eq!(ImageFormat::Jpeg.ext(), "jpeg");
        assert_eq!(ImageFormat::Jpeg.mime(), "image/jpeg");
    }

    #[test]
    fn avif_has_no_codec_in_this_build() {
        assert!(ImageFormat::Avif.codec().is_none());
        assert!(ImageFormat::Png.codec().is_some());
        assert!(ImageFormat::Webp.codec().is_some());
    }
}
