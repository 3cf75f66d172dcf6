//! Core data models for the image storage service.
//!
//! These entities represent the logical structure of stored images and their
//! wire shapes. They map cleanly to database rows via `sqlx::FromRow` and
//! serialize naturally as JSON via `serde`.

pub mod image;
