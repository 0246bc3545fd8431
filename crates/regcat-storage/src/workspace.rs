//! Pipeline-scoped working directory: deterministic artifact paths,
//! download + archive extraction, and the cleanup ledger.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use regcat_core::{ArtifactKind, CandidateLink, DownloadedArtifact, SPREADSHEET_EXTENSIONS};
use regex::Regex;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::{sha256_hex, Fetch, FetchError};

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("download failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt archive {}: {message}", .path.display())]
    CorruptArchive { path: PathBuf, message: String },
    #[error("archive {} contains no spreadsheet member{}", .path.display(), pattern_suffix(.pattern))]
    NoSpreadsheetMember {
        path: PathBuf,
        pattern: Option<String>,
    },
    #[error("archive {} contains {} candidate spreadsheets: {}", .path.display(), .members.len(), .members.join(", "))]
    AmbiguousMembers { path: PathBuf, members: Vec<String> },
}

fn pattern_suffix(pattern: &Option<String>) -> String {
    pattern
        .as_deref()
        .map(|p| format!(" matching `{p}`"))
        .unwrap_or_default()
}

fn io_error(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> AcquisitionError {
    let path = path.to_path_buf();
    move |source| AcquisitionError::Io {
        action,
        path,
        source,
    }
}

/// Rule for picking the spreadsheet member out of an archive.
#[derive(Debug, Clone, Default)]
pub enum MemberSelection {
    /// Exactly one spreadsheet member must exist.
    #[default]
    RequireUnique,
    /// Exactly one spreadsheet member whose file name matches.
    Pattern(Regex),
    /// First spreadsheet member in archive order.
    FirstListed,
}

/// Paths created during one run. Everything registered here is removed at cleanup.
#[derive(Debug, Default)]
pub struct ArtifactLedger {
    paths: Vec<PathBuf>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

impl ArtifactLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Removes every registered path. Missing files are not an error.
    pub async fn cleanup(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for path in self.paths.drain(..).rev() {
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "removed artifact");
                    report.removed.push(path);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to remove artifact");
                    report
                        .warnings
                        .push(format!("removing {}: {err}", path.display()));
                }
            }
        }
        report
    }
}

#[derive(Debug, Clone)]
pub struct WorkingDir {
    root: PathBuf,
    slug: String,
}

impl WorkingDir {
    pub fn new(root: impl Into<PathBuf>, pipeline_id: &str) -> Self {
        Self {
            root: root.into(),
            slug: slugify(pipeline_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn download_path(&self, extension: &str) -> PathBuf {
        self.artifact_path("download", extension)
    }

    pub fn extracted_path(&self, extension: &str) -> PathBuf {
        self.artifact_path("extracted", extension)
    }

    fn artifact_path(&self, role: &str, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim().to_ascii_lowercase();
        let ext = if ext.is_empty() { "bin".to_string() } else { ext };
        self.root.join(format!("{}.{role}.{ext}", self.slug))
    }

    /// Downloads `link` into the working directory and, for archives, extracts
    /// the selected spreadsheet member next to it.
    pub async fn acquire(
        &self,
        fetcher: &dyn Fetch,
        link: &CandidateLink,
        selection: &MemberSelection,
        ledger: &mut ArtifactLedger,
    ) -> Result<DownloadedArtifact, AcquisitionError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(io_error("creating working directory", &self.root))?;

        let response = fetcher.fetch(&link.url).await?;
        let download_path = self.download_path(&link.extension);
        write_atomic(&download_path, &response.body, ledger).await?;
        let content_hash = sha256_hex(&response.body);
        info!(
            url = %link.url,
            path = %download_path.display(),
            bytes = response.body.len(),
            sha256 = %content_hash,
            "downloaded artifact"
        );

        let extracted = match link.kind {
            ArtifactKind::Spreadsheet => None,
            ArtifactKind::Archive => {
                let member = select_spreadsheet_member(&download_path, &response.body, selection)?;
                let extracted_path = self.extracted_path(&member.extension);
                write_atomic(&extracted_path, &member.bytes, ledger).await?;
                info!(
                    member = %member.name,
                    path = %extracted_path.display(),
                    "extracted spreadsheet from archive"
                );
                Some(extracted_path)
            }
        };

        Ok(DownloadedArtifact {
            path: download_path,
            kind: link.kind,
            extracted,
            content_hash,
            byte_size: response.body.len(),
        })
    }
}

fn slugify(input: &str) -> String {
    let slug = input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "pipeline".to_string()
    } else {
        slug
    }
}

/// Writes through a deterministic `.part` file and renames it into place.
/// Both paths are registered before anything touches the disk.
async fn write_atomic(
    path: &Path,
    bytes: &[u8],
    ledger: &mut ArtifactLedger,
) -> Result<(), AcquisitionError> {
    let mut part_name = path.as_os_str().to_owned();
    part_name.push(".part");
    let part_path = PathBuf::from(part_name);
    ledger.register(path);
    ledger.register(&part_path);

    let mut file = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&part_path)
        .await
        .map_err(io_error("opening", &part_path))?;
    file.write_all(bytes)
        .await
        .map_err(io_error("writing", &part_path))?;
    file.flush()
        .await
        .map_err(io_error("flushing", &part_path))?;
    drop(file);

    fs::rename(&part_path, path)
        .await
        .map_err(io_error("renaming into place", path))
}

#[derive(Debug)]
struct ArchiveMember {
    name: String,
    extension: String,
    bytes: Vec<u8>,
}

fn member_file_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn is_spreadsheet_member(name: &str) -> Option<String> {
    if name.starts_with("__MACOSX/") {
        return None;
    }
    let file_name = member_file_name(name);
    if file_name.starts_with("._") || file_name.starts_with("~$") {
        return None;
    }
    let (_, ext) = file_name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    SPREADSHEET_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// Upper bound on an extracted spreadsheet member.
pub const MAX_MEMBER_BYTES: u64 = 512 * 1024 * 1024;

fn select_spreadsheet_member(
    archive_path: &Path,
    bytes: &[u8],
    selection: &MemberSelection,
) -> Result<ArchiveMember, AcquisitionError> {
    let corrupt = |err: zip::result::ZipError| AcquisitionError::CorruptArchive {
        path: archive_path.to_path_buf(),
        message: err.to_string(),
    };
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(corrupt)?;

    let mut candidates = Vec::new();
    for index in 0..archive.len() {
        let entry = archive.by_index(index).map_err(corrupt)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if let Some(ext) = is_spreadsheet_member(&name) {
            candidates.push((index, name, ext));
        }
    }
    debug!(
        archive = %archive_path.display(),
        candidates = ?candidates.iter().map(|(_, n, _)| n.as_str()).collect::<Vec<_>>(),
        "archive spreadsheet members"
    );

    let (pattern, candidates) = match selection {
        MemberSelection::RequireUnique => (None, candidates),
        MemberSelection::FirstListed => (None, candidates.into_iter().take(1).collect()),
        MemberSelection::Pattern(re) => (
            Some(re.as_str().to_string()),
            candidates
                .into_iter()
                .filter(|(_, name, _)| re.is_match(member_file_name(name)))
                .collect(),
        ),
    };

    let (index, name, extension) = match candidates.len() {
        0 => {
            return Err(AcquisitionError::NoSpreadsheetMember {
                path: archive_path.to_path_buf(),
                pattern,
            })
        }
        1 => candidates.into_iter().next().ok_or_else(|| {
            AcquisitionError::NoSpreadsheetMember {
                path: archive_path.to_path_buf(),
                pattern: None,
            }
        })?,
        _ => {
            return Err(AcquisitionError::AmbiguousMembers {
                path: archive_path.to_path_buf(),
                members: candidates.into_iter().map(|(_, name, _)| name).collect(),
            })
        }
    };

    let entry = archive.by_index(index).map_err(corrupt)?;
    let declared = entry.size();
    if declared > MAX_MEMBER_BYTES {
        return Err(AcquisitionError::CorruptArchive {
            path: archive_path.to_path_buf(),
            message: format!(
                "member {name} declares {declared} bytes, limit is {MAX_MEMBER_BYTES}"
            ),
        });
    }

    // The declared size is untrusted; read at most one byte past the limit.
    let mut member_bytes = Vec::new();
    entry
        .take(MAX_MEMBER_BYTES + 1)
        .read_to_end(&mut member_bytes)
        .map_err(|err| AcquisitionError::CorruptArchive {
            path: archive_path.to_path_buf(),
            message: format!("reading member {name}: {err}"),
        })?;
    if member_bytes.len() as u64 > MAX_MEMBER_BYTES {
        return Err(AcquisitionError::CorruptArchive {
            path: archive_path.to_path_buf(),
            message: format!("member {name} inflates past {MAX_MEMBER_BYTES} bytes"),
        });
    }

    Ok(ArchiveMember {
        name,
        extension,
        bytes: member_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    use async_trait::async_trait;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    use crate::{FetchedResponse, StatusCode};

    struct MapFetcher(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl Fetch for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError> {
            match self.0.get(url) {
                Some(body) => Ok(FetchedResponse {
                    status: StatusCode::OK,
                    final_url: url.to_string(),
                    body: body.clone(),
                }),
                None => Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn zip_bytes(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in members {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn link(url: &str, extension: &str) -> CandidateLink {
        CandidateLink {
            url: url.to_string(),
            file_name: format!("file.{extension}"),
            extension: extension.to_string(),
            kind: ArtifactKind::from_extension(extension).unwrap(),
            anchor_text: None,
            position: 0,
        }
    }

    fn remaining_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn artifact_paths_are_deterministic_and_pipeline_scoped() {
        let wd = WorkingDir::new("/work", "Nacionalidades 2024");
        assert_eq!(
            wd.download_path(".ZIP"),
            PathBuf::from("/work/nacionalidades-2024.download.zip")
        );
        assert_eq!(
            wd.extracted_path("xlsx"),
            PathBuf::from("/work/nacionalidades-2024.extracted.xlsx")
        );
    }

    #[test]
    fn member_filter_skips_metadata_entries() {
        assert_eq!(is_spreadsheet_member("data/Catalogo.XLSX"), Some("xlsx".into()));
        assert_eq!(is_spreadsheet_member("__MACOSX/data/._Catalogo.xlsx"), None);
        assert_eq!(is_spreadsheet_member("data/~$Catalogo.xlsx"), None);
        assert_eq!(is_spreadsheet_member("readme.txt"), None);
    }

    #[tokio::test]
    async fn direct_spreadsheet_download_overwrites_previous_run() {
        let dir = tempdir().unwrap();
        let wd = WorkingDir::new(dir.path(), "cat");
        let url = "https://example.test/catalog.xlsx";

        for body in [b"first".as_slice(), b"second".as_slice()] {
            let fetcher = MapFetcher(HashMap::from([(url.to_string(), body.to_vec())]));
            let mut ledger = ArtifactLedger::new();
            let artifact = wd
                .acquire(&fetcher, &link(url, "xlsx"), &MemberSelection::default(), &mut ledger)
                .await
                .unwrap();
            assert_eq!(artifact.spreadsheet_path(), wd.download_path("xlsx"));
            assert_eq!(std::fs::read(&artifact.path).unwrap(), body);
        }
        assert_eq!(remaining_files(dir.path()), vec!["cat.download.xlsx".to_string()]);
    }

    #[tokio::test]
    async fn archive_with_one_member_is_extracted_and_cleaned() {
        let dir = tempdir().unwrap();
        let wd = WorkingDir::new(dir.path(), "cat");
        let url = "https://example.test/catalog.zip";
        let archive = zip_bytes(&[("docs/readme.txt", b"hi"), ("data/Catalogo.xlsx", b"sheet")]);
        let fetcher = MapFetcher(HashMap::from([(url.to_string(), archive)]));

        let mut ledger = ArtifactLedger::new();
        let artifact = wd
            .acquire(&fetcher, &link(url, "zip"), &MemberSelection::default(), &mut ledger)
            .await
            .unwrap();
        assert_eq!(artifact.kind, ArtifactKind::Archive);
        assert_eq!(artifact.spreadsheet_path(), wd.extracted_path("xlsx"));
        assert_eq!(std::fs::read(artifact.spreadsheet_path()).unwrap(), b"sheet");

        let report = ledger.cleanup().await;
        assert_eq!(report.removed.len(), 2);
        assert!(report.warnings.is_empty());
        assert!(remaining_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn ambiguous_archive_fails_unless_a_rule_is_given() {
        let dir = tempdir().unwrap();
        let wd = WorkingDir::new(dir.path(), "cat");
        let url = "https://example.test/catalog.zip";
        let archive = zip_bytes(&[("a.xlsx", b"a"), ("b.xls", b"b")]);
        let fetcher = MapFetcher(HashMap::from([(url.to_string(), archive)]));

        let mut ledger = ArtifactLedger::new();
        let err = wd
            .acquire(&fetcher, &link(url, "zip"), &MemberSelection::RequireUnique, &mut ledger)
            .await
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::AmbiguousMembers { ref members, .. } if members.len() == 2));
        ledger.cleanup().await;
        assert!(remaining_files(dir.path()).is_empty());

        let pattern = MemberSelection::Pattern(Regex::new(r"^b\.").unwrap());
        let artifact = wd
            .acquire(&fetcher, &link(url, "zip"), &pattern, &mut ledger)
            .await
            .unwrap();
        assert_eq!(artifact.spreadsheet_path(), wd.extracted_path("xls"));

        let first = wd
            .acquire(&fetcher, &link(url, "zip"), &MemberSelection::FirstListed, &mut ledger)
            .await
            .unwrap();
        assert_eq!(std::fs::read(first.spreadsheet_path()).unwrap(), b"a");
        ledger.cleanup().await;
    }

    fn with_declared_size(mut archive: Vec<u8>, declared: u32) -> Vec<u8> {
        let header = archive
            .windows(4)
            .position(|w| w == [0x50, 0x4b, 0x01, 0x02])
            .unwrap();
        archive[header + 24..header + 28].copy_from_slice(&declared.to_le_bytes());
        archive
    }

    #[tokio::test]
    async fn oversized_member_declaration_is_a_corrupt_archive() {
        let dir = tempdir().unwrap();
        let wd = WorkingDir::new(dir.path(), "cat");
        let url = "https://example.test/catalog.zip";
        let archive = with_declared_size(zip_bytes(&[("catalogo.xlsx", b"sheet")]), 0xFFFF_FFF0);
        let fetcher = MapFetcher(HashMap::from([(url.to_string(), archive)]));

        let mut ledger = ArtifactLedger::new();
        let err = wd
            .acquire(&fetcher, &link(url, "zip"), &MemberSelection::default(), &mut ledger)
            .await
            .unwrap_err();
        assert!(
            matches!(err, AcquisitionError::CorruptArchive { ref message, .. } if message.contains("declares")),
            "{err}"
        );
        assert!(!wd.extracted_path("xlsx").exists());

        ledger.cleanup().await;
        assert!(remaining_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn corrupt_archive_and_missing_member_are_reported() {
        let dir = tempdir().unwrap();
        let wd = WorkingDir::new(dir.path(), "cat");
        let bad_url = "https://example.test/bad.zip";
        let empty_url = "https://example.test/empty.zip";
        let fetcher = MapFetcher(HashMap::from([
            (bad_url.to_string(), b"not a zip".to_vec()),
            (empty_url.to_string(), zip_bytes(&[("notes.txt", b"x")])),
        ]));

        let mut ledger = ArtifactLedger::new();
        let err = wd
            .acquire(&fetcher, &link(bad_url, "zip"), &MemberSelection::default(), &mut ledger)
            .await
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::CorruptArchive { .. }));

        let err = wd
            .acquire(&fetcher, &link(empty_url, "zip"), &MemberSelection::default(), &mut ledger)
            .await
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::NoSpreadsheetMember { .. }));

        let err = wd
            .acquire(
                &fetcher,
                &link("https://example.test/missing.xlsx", "xlsx"),
                &MemberSelection::default(),
                &mut ledger,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::Fetch(FetchError::HttpStatus { status: 404, .. })));

        ledger.cleanup().await;
        assert!(remaining_files(dir.path()).is_empty());
    }
}
