//! # iqx-rs
//!
//! This crate resolves playable streams and subtitle tracks from iQIYI play
//! pages, for catalog applications that let users browse and watch episodes.
//! It parses a page's embedded client-state, pulls the signed resolution
//! token out of it, exchanges the token for quality variants, selects the
//! best valid one, and derives subtitle URLs from the same response, so the
//! video and its subtitles always reference the same content identifier.
//! When the upstream format or access path changes, extraction falls back
//! through an ordered list of degraded strategies.
//!
//! ## Usage
//!
//! The `extract` module is the front door; everything below it (`page_state`,
//! `query`, `dash`, `quality`, `playlist`, `subtitle`) is public for callers
//! that need one stage on its own.
//!
//! ```rust,no_run
//! use iqx_rs::{extract::Extractor, session::SessionContext};
//!
//! #[tokio::main]
//! async fn main() {
//!     // One extractor per run: it owns the HTTP client, the page cache,
//!     // and the rate governor shared across episode resolutions.
//!     let extractor = Extractor::new(SessionContext::default()).unwrap();
//!
//!     // Resolve a single episode page.
//!     let report = extractor
//!         .extract_report("https://www.iq.com/play/super-cube-episode-1-11eihk07dr8")
//!         .await;
//!     println!("{}", serde_json::to_string_pretty(&report).unwrap());
//!
//!     // Or a whole album, a few episodes in flight at a time.
//!     let playlist = extractor
//!         .extract_playlist("https://www.iq.com/play/super-cube-episode-1-11eihk07dr8", 2)
//!         .await
//!         .unwrap();
//!     println!("{} episodes", playlist.episodes.len());
//! }
//! ```

#[forbid(unsafe_code)]
#[macro_use]
extern crate log;

pub mod dash;
pub mod extract;
pub mod page_state;
pub mod playlist;
pub mod quality;
pub mod query;
pub mod session;
pub mod subtitle;
pub mod util;
