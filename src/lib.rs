// src/lib.rs

//! digestline: resumable stage pipeline from social posts to scored digests

pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
