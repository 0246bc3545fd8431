//! Source-facing stages: link discovery, spreadsheet ingestion and the
//! reference transform strategies.

pub mod discovery;
pub mod ingest;
pub mod transforms;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use discovery::{
    discover, find_candidate_links, select_link, Discovery, DiscoveryError, MatchPolicy,
    SelectionPolicy, DEFAULT_EXTENSIONS,
};
pub use ingest::{read_spreadsheet, IngestError};
pub use transforms::{known_transforms, transform_for_name, NationalitiesTransform, TransformContext};

pub const CRATE_NAME: &str = "regcat-adapters";
