//! The resumable pipeline core: manifests, unit discovery and the bounded
//! executor. The acquisition and OCR stages are built on top of these.

pub mod discovery;
pub mod executor;
pub mod manifest;
