//! Acquisition of Tor directory documents for a client.
//!
//! This crate parses the documents a Tor client downloads, as specified in
//! [dir-spec](https://gitlab.torproject.org/tpo/core/torspec/-/blob/main/dir-spec.txt):
//! the network-status consensus, full relay descriptors
//! (`@type server-descriptor`) and authority key certificates. On top of
//! the parsers it keeps a cache of the current documents and decides when
//! and from which mirror to fetch replacements.
//!
//! Transport, storage and signature checking are left to the caller
//! through the [`DocumentFetcher`], [`Store`] and [`Verifier`] traits.

pub mod consensus;
#[doc(inline)]
pub use consensus::Consensus;

pub mod descriptor;
#[doc(inline)]
pub use descriptor::RouterDescriptor;

pub mod certificate;
#[doc(inline)]
pub use certificate::{KeyCertificate, KeyCertificateSet};

pub mod cache;
pub use cache::DocumentCache;

pub mod config;
pub use config::{Authority, DirConfig, ParseOptions, ScheduleConfig, TrailingContent};

pub mod fetch;
pub use fetch::{AcceptAll, DocumentFamily, DocumentFetcher, FetchCoordinator, Store, Verifier};

pub mod schedule;
pub use schedule::{Mirror, Target, TargetState};

pub mod retry;

pub mod error;
pub use error::{DocumentParseError, Error, FetchError, StoreError};

mod dispatch;

mod meta;
pub use meta::block::{Block, BlockKind};
pub use meta::Fingerprint;

// Solely for private use
mod seeded_rand;
