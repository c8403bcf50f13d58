#![forbid(unsafe_code)]

pub mod anthropic;
pub mod cache;
pub mod cli;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod formats;
pub mod fsutil;
pub mod ledger;
pub mod logging;
pub mod metadata;
pub mod openai;
pub mod pipeline;
pub mod processor;
pub mod summarizer;
pub mod tools;
