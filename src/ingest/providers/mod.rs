// src/ingest/providers/mod.rs
pub mod rest;
pub mod rss;
