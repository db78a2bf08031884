//! Shared message model and persistence codec for `ChatSync`.

pub mod codec;
pub mod event;
pub mod message;
