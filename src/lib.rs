//! Content pipeline: ingest syndicated feed items, skip duplicates,
//! translate survivors into multiple locales through a quota-limited
//! backend, and publish them as linked locale documents to a headless CMS.

pub mod cms;
pub mod config;
pub mod error;
pub mod feed;
pub mod ledger;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod slug;
pub mod translator;
