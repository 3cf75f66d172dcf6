//! ImageService — upload and the fetch-resize-cache read path, backed by
//! SQLite for metadata and S3 for payloads.
//!
//! Originals live at `{project}/{key}.{ext}`; resized variants at
//! `{project}/derived/{key}_{w}x{h}.{ext}`. Keys are single path segments, so
//! the two namespaces cannot collide. The derived cache is opportunistic:
//! concurrent misses may each compute the same variant, and the idempotent
//! overwrite makes that harmless.

use crate::models::image::{ImageFormat, ImageRecord};
use crate::services::object_store::{ObjectStore, StoreError};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::Utc;
use image::imageops::FilterType;
use sqlx::SqlitePool;
use std::{io::Cursor, sync::Arc};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image `{key}` not found in project `{project}`")]
    NotFound { project: String, key: String },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),
    #[error("stored image failed to decode: {0}")]
    DecodeFailure(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type ImageResult<T> = Result<T, ImageError>;

/// Image bytes ready to serve, with the format for the content type.
#[derive(Debug)]
pub struct FetchedImage {
    pub bytes: Bytes,
    pub format: ImageFormat,
}

#[derive(Clone, Debug, Default)]
pub struct ListImagesParams {
    /// Resume after this `(project, key)` pair, exclusive.
    pub after: Option<(String, String)>,
    pub max_keys: usize,
}

#[derive(Debug)]
pub struct ListImagesResult {
    pub records: Vec<ImageRecord>,
    /// Cursor for the next page when truncated.
    pub next: Option<(String, String)>,
}

const MAX_NAME_LEN: usize = 256;
const MAX_TARGET_DIMENSION: u32 = 8192;
const MAX_LIST_KEYS: usize = 1000;

/// Core service: upload images, serve originals, and lazily compute and
/// cache resized derivatives.
#[derive(Clone)]
pub struct ImageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Object store holding originals and derived variants.
    pub store: Arc<dyn ObjectStore>,

    max_upload_bytes: usize,
    public_base_url: String,
}

impl ImageService {
    pub fn new(
        db: Arc<SqlitePool>,
        store: Arc<dyn ObjectStore>,
        max_upload_bytes: usize,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            db,
            store,
            max_upload_bytes,
            public_base_url: public_base_url.into(),
        }
    }

    /// Public URL at which an uploaded image can be fetched back.
    pub fn public_url(&self, project: &str, key: &str) -> String {
        format!(
            "{}/image/{}/{}",
            self.public_base_url.trim_end_matches('/'),
            project,
            key
        )
    }

    /// Validate a project or key as a single safe path segment.
    ///
    /// Both are embedded verbatim in object-storage keys, so anything
    /// path-like is rejected outright.
    fn ensure_name_safe(value: &str) -> ImageResult<()> {
        if value.is_empty() || value.len() > MAX_NAME_LEN {
            return Err(ImageError::InvalidPayload(
                "project and key must be 1-256 characters".into(),
            ));
        }
        if value.contains('/') || value.contains("..") {
            return Err(ImageError::InvalidPayload(
                "project and key must be plain path segments".into(),
            ));
        }
        if value
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(ImageError::InvalidPayload(
                "project and key must not contain control characters".into(),
            ));
        }
        Ok(())
    }

    /// Storage key of the original image.
    fn original_key(project: &str, key: &str, format: ImageFormat) -> String {
        format!("{}/{}.{}", project, key, format.ext())
    }

    /// Deterministic storage key of a resized variant.
    fn derived_key(project: &str, key: &str, format: ImageFormat, w: u32, h: u32) -> String {
        format!("{}/derived/{}_{}x{}.{}", project, key, w, h, format.ext())
    }

    /// Compute target dimensions from the request, preserving the original
    /// aspect ratio. Width takes precedence when both are given. The derived
    /// dimension is rounded and floored at 1px.
    fn target_dimensions(
        orig_w: u32,
        orig_h: u32,
        req_w: Option<u32>,
        req_h: Option<u32>,
    ) -> (u32, u32) {
        let scale = |value: u32, num: u32, den: u32| -> u32 {
            let scaled = (value as f64) * (num as f64) / (den as f64);
            (scaled.round() as u32).max(1)
        };
        match (req_w, req_h) {
            (Some(w), _) => (w, scale(orig_h, w, orig_w)),
            (None, Some(h)) => (scale(orig_w, h, orig_h), h),
            (None, None) => (orig_w, orig_h),
        }
    }

    /// Decode, resize to exactly `(w, h)`, and re-encode in the same format.
    fn resize_encoded(bytes: &[u8], format: ImageFormat, w: u32, h: u32) -> ImageResult<Vec<u8>> {
        let codec = format.codec().ok_or_else(|| {
            ImageError::UnsupportedFormat(format!(
                "no {} codec in this build",
                format.as_str()
            ))
        })?;
        let img = image::load_from_memory_with_format(bytes, codec)
            .map_err(|err| ImageError::DecodeFailure(err.to_string()))?;

        let resized = img.resize_exact(w, h, FilterType::Lanczos3);
        let mut buf = Cursor::new(Vec::new());
        resized
            .write_to(&mut buf, codec)
            .map_err(|err| ImageError::DecodeFailure(format!("re-encode failed: {}", err)))?;
        Ok(buf.into_inner())
    }

    /// Fetch the metadata row for `(project, key)`.
    async fn get_record(&self, project: &str, key: &str) -> ImageResult<ImageRecord> {
        sqlx::query_as::<_, ImageRecord>(
            "SELECT project, key, format, width, height, size_bytes, s3_path, created_at
             FROM images WHERE project = ? AND key = ?",
        )
        .bind(project)
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => ImageError::NotFound {
                project: project.to_string(),
                key: key.to_string(),
            },
            other => ImageError::Sqlx(other),
        })
    }

    /// Store a base64-encoded image and upsert its metadata.
    ///
    /// - Decodes the payload and sniffs the format from magic bytes; the
    ///   capability table decides what is accepted.
    /// - Size-gates the accepted payload.
    /// - Decodes once to learn the natural dimensions.
    /// - Writes the original to storage (S3-like overwrite semantics) and
    ///   upserts the metadata row. Derivatives cached for a previous upload
    ///   at the same `(project, key)` are left in place and keep being
    ///   served; only external storage lifecycle rules evict them.
    pub async fn upload(
        &self,
        project: &str,
        key: &str,
        image_b64: &str,
    ) -> ImageResult<ImageRecord> {
        Self::ensure_name_safe(project)?;
        Self::ensure_name_safe(key)?;

        let bytes = general_purpose::STANDARD
            .decode(image_b64)
            .map_err(|_| ImageError::InvalidPayload("image is not valid base64".into()))?;

        // Format checks come before the size gate: oversized garbage is
        // still garbage, not a too-large image.
        let format = ImageFormat::sniff(&bytes)
            .ok_or_else(|| ImageError::UnsupportedFormat("unrecognized image bytes".into()))?;
        let codec = format.codec().ok_or_else(|| {
            ImageError::UnsupportedFormat(format!("no {} codec in this build", format.as_str()))
        })?;

        if bytes.len() > self.max_upload_bytes {
            return Err(ImageError::PayloadTooLarge {
                size: bytes.len(),
                max: self.max_upload_bytes,
            });
        }

        let img = image::load_from_memory_with_format(&bytes, codec)
            .map_err(|_| ImageError::InvalidPayload("image bytes do not decode".into()))?;
        let (width, height) = (img.width(), img.height());

        let s3_path = Self::original_key(project, key, format);
        let size_bytes = bytes.len() as i64;
        self.store.put(&s3_path, bytes, format.mime()).await?;

        debug!(project, key, format = format.as_str(), width, height, "stored original");

        let record = sqlx::query_as::<_, ImageRecord>(
            r#"
            INSERT INTO images (
                project, key, format, width, height, size_bytes, s3_path, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(project, key) DO UPDATE SET
                format = excluded.format,
                width = excluded.width,
                height = excluded.height,
                size_bytes = excluded.size_bytes,
                s3_path = excluded.s3_path,
                created_at = excluded.created_at
            RETURNING project, key, format, width, height, size_bytes, s3_path, created_at
            "#,
        )
        .bind(project)
        .bind(key)
        .bind(format)
        .bind(width as i64)
        .bind(height as i64)
        .bind(size_bytes)
        .bind(&s3_path)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;

        Ok(record)
    }

    /// The read path: original bytes, or a resized variant computed and
    /// cached on first request.
    ///
    /// One storage read on every call; one additional write only on a cache
    /// miss. No lock guards the miss path.
    pub async fn fetch(
        &self,
        project: &str,
        key: &str,
        width: Option<u32>,
        height: Option<u32>,
    ) -> ImageResult<FetchedImage> {
        Self::ensure_name_safe(project)?;
        Self::ensure_name_safe(key)?;

        let record = self.get_record(project, key).await?;
        let format = record.format;

        if width.is_none() && height.is_none() {
            let bytes = self.get_or_not_found(&record.s3_path, project, key).await?;
            return Ok(FetchedImage { bytes, format });
        }

        for dim in [width, height].into_iter().flatten() {
            if dim == 0 || dim > MAX_TARGET_DIMENSION {
                return Err(ImageError::InvalidDimensions(format!(
                    "requested dimension {} outside 1..={}",
                    dim, MAX_TARGET_DIMENSION
                )));
            }
        }

        let (orig_w, orig_h) = (record.width as u32, record.height as u32);
        let (w, h) = Self::target_dimensions(orig_w, orig_h, width, height);
        if w > MAX_TARGET_DIMENSION || h > MAX_TARGET_DIMENSION {
            return Err(ImageError::InvalidDimensions(format!(
                "computed dimensions {}x{} outside 1..={}",
                w, h, MAX_TARGET_DIMENSION
            )));
        }

        // A no-op resize serves the original; no point writing a copy.
        if (w, h) == (orig_w, orig_h) {
            let bytes = self.get_or_not_found(&record.s3_path, project, key).await?;
            return Ok(FetchedImage { bytes, format });
        }

        let derived = Self::derived_key(project, key, format, w, h);
        if self.store.exists(&derived).await? {
            debug!(project, key, w, h, "derived variant cache hit");
            let bytes = self.store.get(&derived).await?;
            return Ok(FetchedImage { bytes, format });
        }

        debug!(project, key, w, h, "derived variant cache miss, resizing");
        let original = self.get_or_not_found(&record.s3_path, project, key).await?;
        let resized = Self::resize_encoded(&original, format, w, h)?;
        self.store.put(&derived, resized.clone(), format.mime()).await?;

        Ok(FetchedImage {
            bytes: Bytes::from(resized),
            format,
        })
    }

    /// List metadata rows with keyset pagination over `(project, key)`.
    pub async fn list(&self, params: ListImagesParams) -> ImageResult<ListImagesResult> {
        let max_keys = params.max_keys.clamp(1, MAX_LIST_KEYS);

        // Fetch one extra row to detect truncation.
        let limit = (max_keys + 1) as i64;
        let mut records: Vec<ImageRecord> = match &params.after {
            Some((project, key)) => {
                sqlx::query_as::<_, ImageRecord>(
                    "SELECT project, key, format, width, height, size_bytes, s3_path, created_at
                     FROM images
                     WHERE project > ? OR (project = ? AND key > ?)
                     ORDER BY project, key
                     LIMIT ?",
                )
                .bind(project)
                .bind(project)
                .bind(key)
                .bind(limit)
                .fetch_all(&*self.db)
                .await?
            }
            None => {
                sqlx::query_as::<_, ImageRecord>(
                    "SELECT project, key, format, width, height, size_bytes, s3_path, created_at
                     FROM images
                     ORDER BY project, key
                     LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&*self.db)
                .await?
            }
        };

        let next = if records.len() > max_keys {
            records.truncate(max_keys);
            records
                .last()
                .map(|rec| (rec.project.clone(), rec.key.clone()))
        } else {
            None
        };

        Ok(ListImagesResult { records, next })
    }

    /// Read from storage, translating a missing object into NotFound for the
    /// record the caller asked about.
    async fn get_or_not_found(
        &self,
        storage_key: &str,
        project: &str,
        key: &str,
    ) -> ImageResult<Bytes> {
        self.store.get(storage_key).await.map_err(|err| match err {
            StoreError::NotFound(_) => ImageError::NotFound {
                project: project.to_string(),
                key: key.to_string(),
            },
            other => ImageError::Storage(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::object_store::StoreResult;
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    fn encode(img: &image::DynamicImage, format: image::ImageFormat) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    fn encode_b64(img: &image::DynamicImage, format: image::ImageFormat) -> String {
        general_purpose::STANDARD.encode(encode(img, format))
    }

    /// In-memory stand-in for the S3 store.
    #[derive(Default)]
    struct MemoryStore {
        objects: RwLock<HashMap<String, Bytes>>,
    }

    impl MemoryStore {
        async fn contains(&self, key: &str) -> bool {
            self.objects.read().await.contains_key(key)
        }

        async fn len(&self) -> usize {
            self.objects.read().await.len()
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> StoreResult<()> {
            self.objects
                .write()
                .await
                .insert(key.to_string(), Bytes::from(bytes));
            Ok(())
        }

        async fn get(&self, key: &str) -> StoreResult<Bytes> {
            self.objects
                .read()
                .await
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.to_string()))
        }

        async fn exists(&self, key: &str) -> StoreResult<bool> {
            Ok(self.objects.read().await.contains_key(key))
        }

        async fn ready(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    async fn test_service(max_upload_bytes: usize) -> (ImageService, Arc<MemoryStore>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE images (
                project TEXT NOT NULL,
                key TEXT NOT NULL,
                format TEXT NOT NULL,
                width INTEGER NOT NULL,
                height INTEGER NOT NULL,
                size_bytes INTEGER NOT NULL,
                s3_path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (project, key)
            )",
        )
        .execute(&pool)
        .await
        .unwrap();

        let store = Arc::new(MemoryStore::default());
        let service = ImageService::new(
            Arc::new(pool),
            store.clone(),
            max_upload_bytes,
            "http://localhost:3000",
        );
        (service, store)
    }

    #[tokio::test]
    async fn upload_then_plain_fetch_is_byte_identical() {
        let (service, _store) = test_service(5 * 1024 * 1024).await;
        let original = encode(
            &image::DynamicImage::new_rgb8(100, 200),
            image::ImageFormat::Png,
        );
        let b64 = general_purpose::STANDARD.encode(&original);

        let record = service.upload("p", "k", &b64).await.unwrap();
        assert_eq!((record.width, record.height), (100, 200));

        let fetched = service.fetch("p", "k", None, None).await.unwrap();
        assert_eq!(fetched.bytes.as_ref(), original.as_slice());
        assert_eq!(fetched.format, ImageFormat::Png);
    }

    #[tokio::test]
    async fn resized_fetch_is_cached_and_stable() {
        let (service, store) = test_service(5 * 1024 * 1024).await;
        let b64 = encode_b64(
            &image::DynamicImage::new_rgb8(100, 200),
            image::ImageFormat::Png,
        );
        service.upload("p", "k", &b64).await.unwrap();

        let first = service.fetch("p", "k", Some(50), None).await.unwrap();
        let out = image::load_from_memory(&first.bytes).unwrap();
        assert_eq!((out.width(), out.height()), (50, 100));
        assert!(store.contains("p/derived/k_50x100.png").await);

        // Second request hits the cached variant and serves the same bytes.
        let second = service.fetch("p", "k", Some(50), None).await.unwrap();
        assert_eq!(first.bytes, second.bytes);
    }

    #[tokio::test]
    async fn oversized_garbage_reports_unsupported_format() {
        let (service, _store) = test_service(10).await;
        let b64 = general_purpose::STANDARD.encode([0xAB_u8; 20]);

        // Not an image at all; the size limit is beside the point.
        let err = service.upload("p", "k", &b64).await.unwrap_err();
        assert!(matches!(err, ImageError::UnsupportedFormat(_)));
    }

    #[tokio::test]
    async fn oversized_image_reports_payload_too_large() {
        let (service, _store) = test_service(16).await;
        let b64 = encode_b64(
            &image::DynamicImage::new_rgb8(64, 64),
            image::ImageFormat::Png,
        );

        let err = service.upload("p", "k", &b64).await.unwrap_err();
        assert!(matches!(err, ImageError::PayloadTooLarge { max: 16, .. }));
    }

    #[tokio::test]
    async fn rejected_upload_stores_nothing() {
        let (service, store) = test_service(16).await;
        let b64 = encode_b64(
            &image::DynamicImage::new_rgb8(64, 64),
            image::ImageFormat::Png,
        );

        service.upload("p", "k", &b64).await.unwrap_err();
        assert_eq!(store.len().await, 0);
        let err = service.fetch("p", "k", None, None).await.unwrap_err();
        assert!(matches!(err, ImageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn fetch_unknown_key_is_not_found() {
        let (service, _store) = test_service(5 * 1024 * 1024).await;
        let err = service.fetch("p", "missing", None, None).await.unwrap_err();
        assert!(matches!(err, ImageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn reupload_keeps_previously_cached_derivatives() {
        let (service, _store) = test_service(5 * 1024 * 1024).await;
        let b64 = encode_b64(
            &image::DynamicImage::new_rgb8(100, 200),
            image::ImageFormat::Png,
        );
        service.upload("p", "k", &b64).await.unwrap();
        let stale = service.fetch("p", "k", Some(50), None).await.unwrap();

        // Overwrite the original with different content at the same key.
        let b64_v2 = encode_b64(
            &image::DynamicImage::new_rgb8(200, 400),
            image::ImageFormat::Png,
        );
        service.upload("p", "k", &b64_v2).await.unwrap();

        // The derived variant from the first upload is still served as-is.
        let after = service.fetch("p", "k", Some(50), None).await.unwrap();
        assert_eq!(stale.bytes, after.bytes);
    }

    #[test]
    fn width_only_scales_height() {
        assert_eq!(
            ImageService::target_dimensions(100, 200, Some(50), None),
            (50, 100)
        );
    }

    #[test]
    fn height_only_scales_width() {
        assert_eq!(
            ImageService::target_dimensions(100, 200, None, Some(100)),
            (50, 100)
        );
    }

    #[test]
    fn width_wins_when_both_given() {
        // Height is recomputed from the aspect ratio even when supplied.
        assert_eq!(
            ImageService::target_dimensions(100, 200, Some(50), Some(173)),
            (50, 100)
        );
    }

    #[test]
    fn derived_dimension_rounds() {
        // 200 * 75 / 100 = 150 exactly; 333 * 100 / 500 = 66.6 rounds to 67
        assert_eq!(
            ImageService::target_dimensions(100, 200, Some(75), None),
            (75, 150)
        );
        assert_eq!(
            ImageService::target_dimensions(500, 333, Some(100), None),
            (100, 67)
        );
    }

    #[test]
    fn derived_dimension_never_hits_zero() {
        assert_eq!(
            ImageService::target_dimensions(1000, 1, Some(10), None),
            (10, 1)
        );
    }

    #[test]
    fn storage_keys_are_deterministic() {
        assert_eq!(
            ImageService::original_key("p", "k", ImageFormat::Png),
            "p/k.png"
        );
        assert_eq!(
            ImageService::derived_key("p", "k", ImageFormat::Png, 50, 100),
            "p/derived/k_50x100.png"
        );
        // Same inputs, same key: a second computation overwrites the first.
        assert_eq!(
            ImageService::derived_key("p", "k", ImageFormat::Png, 50, 100),
            ImageService::derived_key("p", "k", ImageFormat::Png, 50, 100)
        );
    }

    #[test]
    fn names_must_be_plain_segments() {
        assert!(ImageService::ensure_name_safe("site-assets").is_ok());
        assert!(ImageService::ensure_name_safe("logo_v2").is_ok());
        assert!(ImageService::ensure_name_safe("").is_err());
        assert!(ImageService::ensure_name_safe("a/b").is_err());
        assert!(ImageService::ensure_name_safe("..").is_err());
        assert!(ImageService::ensure_name_safe("a\nb").is_err());
        assert!(ImageService::ensure_name_safe(&"x".repeat(300)).is_err());
    }

    #[test]
    fn resize_preserves_aspect_ratio_for_png() {
        let bytes = encode(
            &image::DynamicImage::new_rgb8(100, 200),
            image::ImageFormat::Png,
        );
        let resized = ImageService::resize_encoded(&bytes, ImageFormat::Png, 50, 100).unwrap();

        let out = image::load_from_memory(&resized).unwrap();
        assert_eq!((out.width(), out.height()), (50, 100));
        // Re-encoded in the original format
        assert_eq!(ImageFormat::sniff(&resized), Some(ImageFormat::Png));
    }

    #[test]
    fn resize_keeps_jpeg_as_jpeg() {
        let bytes = encode(
            &image::DynamicImage::new_rgb8(64, 64),
            image::ImageFormat::Jpeg,
        );
        let resized = ImageService::resize_encoded(&bytes, ImageFormat::Jpeg, 32, 32).unwrap();
        assert_eq!(ImageFormat::sniff(&resized), Some(ImageFormat::Jpeg));
    }

    #[test]
    fn resize_rejects_formats_without_codec() {
        let err = ImageService::resize_encoded(b"whatever", ImageFormat::Avif, 10, 10)
            .unwrap_err();
        assert!(matches!(err, ImageError::UnsupportedFormat(_)));
    }

    #[test]
    fn resize_rejects_corrupt_bytes() {
        let err = ImageService::resize_encoded(b"not a png", ImageFormat::Png, 10, 10)
            .unwrap_err();
        assert!(matches!(err, ImageError::DecodeFailure(_)));
    }
}
