//! Resumable photo album harvester.
//!
//! Walks an album listing in a WebDriver-controlled browser, visits every
//! photo's detail view, and stores `<id>.jpg` plus `<id>.json` (caption text
//! and hashtags) per item. Re-running skips whatever is already on disk.

pub mod app;
