//! Built-in transfer engine driven by zsync control files.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use reportify::{bail, ResultExt};
use sha1::{Digest, Sha1};
use tracing::debug;
use url::Url;

use crate::control::ControlFile;
use crate::{TransferEngine, TransferResult};

/// Suffix of the seed backup created when old and new names collide.
pub const BACKUP_SUFFIX: &str = ".zs-old";

const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Transfer engine fetching the remote file described by a zsync
/// control file.
///
/// The engine transfers the payload as one coalesced range. Local
/// blocks are reused when the control file's checksum already matches
/// the seed, in which case no payload is transferred at all.
pub struct ZsyncClient {
    control_url: String,
    seed_path: PathBuf,
    overwrite: bool,
    ranges_optimization_threshold: u64,
    aborted: AtomicBool,
    // Published as raw f64 bits so pollers never touch the state
    // mutex while a transfer is running.
    progress: AtomicU64,
    state: Mutex<ClientState>,
}

#[derive(Default)]
struct ClientState {
    working_directory: Option<PathBuf>,
    control: Option<ControlFile>,
    new_file: Option<PathBuf>,
    messages: VecDeque<String>,
}

impl ZsyncClient {
    /// Create an engine for the given control file URL and seed.
    pub fn new(
        control_url: impl Into<String>,
        seed_path: impl Into<PathBuf>,
        overwrite: bool,
    ) -> Self {
        Self {
            control_url: control_url.into(),
            seed_path: seed_path.into(),
            overwrite,
            ranges_optimization_threshold: 0,
            aborted: AtomicBool::new(false),
            progress: AtomicU64::new(0f64.to_bits()),
            state: Mutex::new(ClientState::default()),
        }
    }

    /// Set the size up to which adjacent ranges are coalesced.
    pub fn with_ranges_optimization_threshold(mut self, threshold: u64) -> Self {
        self.ranges_optimization_threshold = threshold;
        self
    }

    fn push_status(&self, message: String) {
        self.state.lock().unwrap().messages.push_back(message);
    }

    fn set_progress(&self, progress: f64) {
        self.progress.store(progress.to_bits(), Ordering::Relaxed);
    }

    /// Fetch and cache the control file.
    fn control(&self) -> TransferResult<ControlFile> {
        if let Some(control) = self.state.lock().unwrap().control.clone() {
            return Ok(control);
        }
        self.push_status(format!("fetching control file from {}", self.control_url));
        let mut response = appup_http::agent()
            .get(&self.control_url)
            .call()
            .whatever_with(|error| format!("unable to fetch control file: {error}"))?;
        let mut body = Vec::new();
        response
            .body_mut()
            .as_reader()
            .read_to_end(&mut body)
            .whatever("unable to read control file")?;
        let control = ControlFile::parse(&body).whatever("unable to parse control file")?;
        self.push_status(format!(
            "control file describes {} ({} bytes)",
            control.filename, control.length,
        ));
        self.state.lock().unwrap().control = Some(control.clone());
        Ok(control)
    }

    /// URL of the remote payload.
    ///
    /// Relative `URL` headers are resolved against the control file's
    /// own URL; without a `URL` header the payload conventionally
    /// lives next to the control file, minus the `.zsync` suffix.
    fn payload_url(&self, control: &ControlFile) -> TransferResult<String> {
        if let Some(relative) = &control.url {
            let base = Url::parse(&self.control_url).whatever("invalid control file URL")?;
            Ok(base
                .join(relative)
                .whatever("invalid URL in control file")?
                .into())
        } else if let Some(stripped) = self.control_url.strip_suffix(".zsync") {
            Ok(stripped.to_owned())
        } else {
            bail!("control file does not specify a download URL");
        }
    }

    fn seed_sha1(&self) -> TransferResult<String> {
        let mut file = std::fs::File::open(&self.seed_path)
            .whatever_with(|_| format!("unable to open seed file {:?}", self.seed_path))?;
        let mut hasher = Sha1::new();
        let mut buffer = [0u8; DOWNLOAD_CHUNK_SIZE];
        loop {
            let read = file
                .read(&mut buffer)
                .whatever("unable to read seed file")?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    fn working_directory(&self) -> PathBuf {
        if let Some(directory) = &self.state.lock().unwrap().working_directory {
            return directory.clone();
        }
        match self.seed_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

impl TransferEngine for ZsyncClient {
    fn name(&self) -> &'static str {
        "zsync"
    }

    fn set_working_directory(&self, directory: &Path) {
        self.state.lock().unwrap().working_directory = Some(directory.to_path_buf());
    }

    fn check_for_changes(&self) -> TransferResult<bool> {
        let control = self.control()?;
        let changed = control.sha1 != self.seed_sha1()?;
        self.push_status(if changed {
            "remote file differs from the local file, an update is available".to_owned()
        } else {
            "local file is up to date".to_owned()
        });
        Ok(changed)
    }

    fn run(&self) -> TransferResult<()> {
        let control = self.control()?;
        let Some(file_name) = Path::new(&control.filename).file_name() else {
            bail!(
                "control file specifies an invalid file name: {:?}",
                control.filename
            );
        };
        let working_directory = self.working_directory();
        let target = working_directory.join(file_name);
        self.state.lock().unwrap().new_file = Some(target.clone());

        if self.seed_sha1()? == control.sha1 {
            // Every block can be reused from the seed.
            self.push_status("local file already matches the remote file, reusing it".to_owned());
            if absolute(&self.seed_path)? != absolute(&target)? {
                std::fs::copy(&self.seed_path, &target)
                    .whatever_with(|_| format!("unable to copy seed to {target:?}"))?;
            }
            self.set_progress(1.0);
            return Ok(());
        }

        debug!(
            threshold = self.ranges_optimization_threshold,
            "transferring the payload as a single coalesced range"
        );
        let payload_url = self.payload_url(&control)?;
        self.push_status(format!(
            "downloading {} ({} bytes)",
            control.filename, control.length,
        ));
        let mut response = appup_http::agent()
            .get(&payload_url)
            .call()
            .whatever_with(|error| format!("unable to download {payload_url}: {error}"))?;
        let mut reader = response.body_mut().as_reader();
        let mut temp = tempfile::NamedTempFile::new_in(&working_directory)
            .whatever("unable to create temporary download file")?;
        let mut hasher = Sha1::new();
        let mut downloaded = 0u64;
        let mut buffer = [0u8; DOWNLOAD_CHUNK_SIZE];
        loop {
            if self.aborted.load(Ordering::Relaxed) {
                bail!("transfer aborted");
            }
            let read = reader
                .read(&mut buffer)
                .whatever("unable to read from download stream")?;
            if read == 0 {
                break;
            }
            temp.write_all(&buffer[..read])
                .whatever("unable to write downloaded data")?;
            hasher.update(&buffer[..read]);
            downloaded += read as u64;
            if control.length > 0 {
                self.set_progress((downloaded as f64 / control.length as f64).min(1.0));
            }
        }
        if downloaded != control.length {
            bail!(
                "download ended prematurely: got {downloaded} of {} bytes",
                control.length
            );
        }
        let digest = hex::encode(hasher.finalize());
        if digest != control.sha1 {
            bail!(
                "checksum mismatch in downloaded file: expected {}, got {digest}",
                control.sha1
            );
        }

        if absolute(&self.seed_path)? == absolute(&target)? && !self.overwrite {
            let backup = backup_path(&self.seed_path);
            std::fs::rename(&self.seed_path, &backup)
                .whatever_with(|_| format!("unable to move the old file to {backup:?}"))?;
            self.push_status(format!("moved the old file to {backup:?}"));
        }
        temp.persist(&target)
            .whatever("unable to move the downloaded file into place")?;
        self.set_progress(1.0);
        self.push_status(format!("wrote new file {target:?}"));
        Ok(())
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Relaxed))
    }

    fn remote_file_size(&self) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .control
            .as_ref()
            .map(|control| control.length)
    }

    fn path_to_new_file(&self) -> Option<PathBuf> {
        self.state.lock().unwrap().new_file.clone()
    }

    fn next_status_message(&self) -> Option<String> {
        self.state.lock().unwrap().messages.pop_front()
    }
}

/// Derive the backup name for a seed file (`<path>.zs-old`).
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Absolute, symlink-resolved location a path refers to.
///
/// The path itself may not exist yet; its parent directory must.
fn absolute(path: &Path) -> TransferResult<PathBuf> {
    let Some(file_name) = path.file_name() else {
        bail!("path has no file name: {path:?}");
    };
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let parent = std::fs::canonicalize(parent)
        .whatever_with(|_| format!("unable to resolve directory {parent:?}"))?;
    Ok(parent.join(file_name))
}
