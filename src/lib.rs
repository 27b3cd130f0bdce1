//! Crawls shop product pages, expands their variants into page states and
//! turns every state into one merged record from page markup and OCR.

pub mod browser;
pub mod capture;
pub mod cli;
pub mod crawler;
pub mod extraction;
pub mod storage;
pub mod utils;
pub mod variants;

#[cfg(test)]
mod testing;
