use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::GeofetchError;

/// How many times a failing prefetch call is retried before the run is
/// recorded as failed.
pub const NUM_RETRIES: u32 = 3;
/// Ceiling passed to `prefetch --max-size`, in kilobytes.
const PREFETCH_MAX_SIZE: &str = "50000000";

pub trait SraToolsClient: Send + Sync {
    /// One prefetch attempt for an SRR run.
    fn prefetch(&self, run: &str) -> Result<(), GeofetchError>;
    fn tool_status(&self) -> ToolStatus;
}

#[derive(Debug, Clone)]
pub enum ToolStatus {
    Ready,
    Missing { message: String },
}

#[derive(Clone, Default)]
pub struct SystemSraTools {
    prefetch: Option<PathBuf>,
}

impl SystemSraTools {
    pub fn new() -> Self {
        Self {
            prefetch: find_in_path("prefetch"),
        }
    }
}

impl SraToolsClient for SystemSraTools {
    fn prefetch(&self, run: &str) -> Result<(), GeofetchError> {
        let prefetch = self
            .prefetch
            .as_ref()
            .ok_or_else(|| GeofetchError::MissingTool("prefetch".to_string()))?;
        let status = Command::new(prefetch)
            .args([run, "--max-size", PREFETCH_MAX_SIZE])
            .status()
            .map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(GeofetchError::RunDownload(run.to_string()))
        }
    }

    fn tool_status(&self) -> ToolStatus {
        if self.prefetch.is_none() {
            return ToolStatus::Missing {
                message: "install the sratoolkit, with prefetch in your PATH".to_string(),
            };
        }
        ToolStatus::Ready
    }
}

/// Download one run, retrying up to [`NUM_RETRIES`] times with a linearly
/// growing pause between attempts. Exhausting the retries is fatal for
/// this run only; the caller records it and moves on.
pub fn download_run(client: &dyn SraToolsClient, run: &str) -> Result<(), GeofetchError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match client.prefetch(run) {
            Ok(()) => return Ok(()),
            Err(GeofetchError::MissingTool(tool)) => {
                return Err(GeofetchError::MissingTool(tool));
            }
            Err(_) if attempt < NUM_RETRIES => {
                info!(run, attempt, "prefetch attempt failed, waiting to retry");
                thread::sleep(Duration::from_secs(u64::from(attempt) * 2));
            }
            Err(_) => {
                warn!(run, "prefetch retries exhausted; try this sample later");
                return Err(GeofetchError::RunDownload(run.to_string()));
            }
        }
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

/// Existing BAM/FASTQ outputs make a run download redundant.
pub fn existing_output(run: &str, bam_folder: &str, fq_folder: &str) -> Option<PathBuf> {
    if !bam_folder.is_empty() {
        let bam = Path::new(bam_folder).join(format!("{run}.bam"));
        if bam.exists() {
            return Some(bam);
        }
    }
    if !fq_folder.is_empty() {
        let fq = Path::new(fq_folder).join(format!("{run}_1.fq"));
        if fq.exists() {
            return Some(fq);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;

    struct FlakyTools {
        failures_before_success: Mutex<u32>,
        calls: Mutex<u32>,
    }

    impl SraToolsClient for FlakyTools {
        fn prefetch(&self, run: &str) -> Result<(), GeofetchError> {
            *self.calls.lock().unwrap() += 1;
            let mut remaining = self.failures_before_success.lock().unwrap();
            if *remaining == 0 {
                Ok(())
            } else {
                *remaining -= 1;
                Err(GeofetchError::RunDownload(run.to_string()))
            }
        }

        fn tool_status(&self) -> ToolStatus {
            ToolStatus::Ready
        }
    }

    #[test]
    fn download_succeeds_after_retry() {
        let tools = FlakyTools {
            failures_before_success: Mutex::new(1),
            calls: Mutex::new(0),
        };
        download_run(&tools, "SRR000001").unwrap();
        assert_eq!(*tools.calls.lock().unwrap(), 2);
    }

    #[test]
    fn download_gives_up_after_retries() {
        let tools = FlakyTools {
            failures_before_success: Mutex::new(10),
            calls: Mutex::new(0),
        };
        let err = download_run(&tools, "SRR000001").unwrap_err();
        assert_matches!(err, GeofetchError::RunDownload(_));
        assert_eq!(*tools.calls.lock().unwrap(), NUM_RETRIES);
    }
}
