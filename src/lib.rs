// * SnapCrawler
// * Download -> filter -> dedup -> store pipeline for web images

pub mod config;
pub mod engine;
pub mod network;
pub mod ops;
pub mod persistence;
pub mod refinery;
