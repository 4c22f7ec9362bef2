#![forbid(unsafe_code)]

pub mod canonical;
pub mod cli;
pub mod config;
pub mod crawl;
pub mod document;
pub mod fetcher;
pub mod formats;
pub mod frontier;
pub mod localize;
pub mod logging;
pub mod mirror_path;
pub mod page;
pub mod scope;
pub mod session;
