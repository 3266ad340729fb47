use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::cast::ResolvedCast;
use crate::enclosure::{EnclosureMetadata, EnclosureResolver};
use crate::error::{Error, Result};
use crate::ipfs::ObjectStore;

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub done: u64,
    pub total: u64,
}

impl DownloadProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.done as f64 / self.total as f64 * 100.0).min(100.0)
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.done >= self.total
    }
}

/// Rate limits progress updates; the first update always passes.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn should_emit(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// What happens to each item of a batch, in order.
#[derive(Debug)]
pub enum BatchEvent<'a> {
    Started {
        cast: &'a ResolvedCast,
        meta: &'a EnclosureMetadata,
        path: &'a Path,
    },
    Progress {
        cast: &'a ResolvedCast,
        progress: DownloadProgress,
    },
    Finished {
        cast: &'a ResolvedCast,
        path: &'a Path,
    },
    Skipped {
        cast: &'a ResolvedCast,
        path: &'a Path,
    },
    Failed {
        cast: &'a ResolvedCast,
        error: &'a Error,
    },
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub downloaded: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    /// Cast hash and the reason it failed.
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// File name an enclosure is saved under, reduced to a single path component.
pub fn target_filename(meta: &EnclosureMetadata) -> String {
    let name = Path::new(meta.filename.trim())
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty() && name != "." && name != "..");
    name.unwrap_or_else(|| meta.file_cid().to_string())
}

#[derive(Clone)]
pub struct DownloadCoordinator {
    store: Arc<dyn ObjectStore>,
    resolver: EnclosureResolver,
    progress_interval: Duration,
}

impl DownloadCoordinator {
    pub fn new(store: Arc<dyn ObjectStore>, resolver: EnclosureResolver) -> Self {
        Self {
            store,
            resolver,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn destination(meta: &EnclosureMetadata, dest_dir: &Path) -> PathBuf {
        dest_dir.join(target_filename(meta))
    }

    /// Fetches the enclosed file into `dest_dir`.
    ///
    /// Bytes land in a temporary file that is renamed into place only after the
    /// transfer completes, so a failed or interrupted download leaves nothing
    /// under the final name.
    pub fn download_enclosure(
        &self,
        meta: &EnclosureMetadata,
        dest_dir: &Path,
        on_progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<PathBuf> {
        let path = Self::destination(meta, dest_dir);
        fs::create_dir_all(dest_dir).map_err(|err| {
            Error::local_state(format!("download: create {}", dest_dir.display()), err)
        })?;
        let tmp = NamedTempFile::new_in(dest_dir).map_err(|err| {
            Error::local_state(format!("download: temp file in {}", dest_dir.display()), err)
        })?;

        let total = meta.size;
        let mut throttle = ProgressThrottle::new(self.progress_interval);
        let mut relay = |done: u64, expected: u64| {
            if throttle.should_emit(Instant::now()) {
                on_progress(DownloadProgress {
                    done,
                    total: expected,
                });
            }
        };
        let written = self
            .store
            .get_object_to_file(meta.file_cid(), tmp.path(), total, &mut relay)?;

        tmp.persist(&path).map_err(|err| {
            Error::local_state(format!("download: save {}", path.display()), err.error)
        })?;
        on_progress(DownloadProgress {
            done: written,
            total: if total == 0 { written } else { total },
        });
        info!(path = %path.display(), bytes = written, "enclosure saved");
        Ok(path)
    }

    /// Downloads every cast's enclosure. Item failures are reported and skipped.
    pub fn download_batch(
        &self,
        casts: &[ResolvedCast],
        dest_dir: &Path,
        reporter: &mut dyn FnMut(BatchEvent<'_>),
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for cast in casts {
            let meta = match &cast.enclosure {
                Some(meta) => meta.clone(),
                None => match self.resolver.resolve(&cast.enclosure_cid) {
                    Ok(meta) => meta,
                    Err(error) => {
                        warn!(hash = %cast.hash, error = %error, "enclosure metadata unavailable");
                        reporter(BatchEvent::Failed { cast, error: &error });
                        report.failed.push((cast.hash.clone(), error.to_string()));
                        continue;
                    }
                },
            };

            let path = Self::destination(&meta, dest_dir);
            if already_downloaded(&path, meta.size) {
                reporter(BatchEvent::Skipped { cast, path: &path });
                report.skipped.push(path);
                continue;
            }

            reporter(BatchEvent::Started {
                cast,
                meta: &meta,
                path: &path,
            });
            let result = {
                let mut forward =
                    |progress: DownloadProgress| reporter(BatchEvent::Progress { cast, progress });
                self.download_enclosure(&meta, dest_dir, &mut forward)
            };
            match result {
                Ok(path) => {
                    reporter(BatchEvent::Finished { cast, path: &path });
                    report.downloaded.push(path);
                }
                Err(error) => {
                    warn!(hash = %cast.hash, error = %error, "download failed");
                    reporter(BatchEvent::Failed { cast, error: &error });
                    report.failed.push((cast.hash.clone(), error.to_string()));
                }
            }
        }
        report
    }
}

fn already_downloaded(path: &Path, size: u64) -> bool {
    size > 0 && fs::metadata(path).map_or(false, |meta| meta.is_file() && meta.len() == size)
}
