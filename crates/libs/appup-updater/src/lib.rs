#![forbid(unsafe_code)]

//! Delta updates for AppImage bundles.
//!
//! An [`Updater`] drives the update of a single AppImage: it reads the
//! embedded update information, resolves it to a transfer URL, runs
//! the delta transfer on a worker thread, and exposes state, progress,
//! and status messages to polling callers. After a successful update,
//! [`Updater::validate_signature`] compares the signatures of the old
//! and new bundles.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use reportify::{bail, Report, ResultExt};
use tracing::debug;

use appup_bundle::AppImage;
use appup_update_info::UpdateInfo;

pub use appup_transfer::{DeltaTransfer, TransferEngine};

mod validation;

pub use validation::{classify_bundle_pair, ValidationOutcome};

reportify::new_whatever_type! {
    /// Error driving an AppImage update.
    UpdaterError
}

/// Result with [`UpdaterError`] as error type.
pub type UpdaterResult<T> = Result<T, Report<UpdaterError>>;

/// Lifecycle states of an [`Updater`].
///
/// `Success` and `Error` are terminal; once reached, the state never
/// changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initialized,
    Running,
    Stopping,
    Success,
    Error,
}

/// Factory producing the transfer used for an update run.
///
/// The default factory creates the built-in zsync engine; callers can
/// substitute their own block-reuse engine.
pub type EngineFactory = dyn Fn(&str, &Path, bool) -> DeltaTransfer + Send + Sync;

/// Drives the update of a single AppImage.
pub struct Updater {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Updater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Updater")
            .field("path", &self.shared.path)
            .field("overwrite", &self.shared.overwrite)
            .finish_non_exhaustive()
    }
}

struct Shared {
    path: PathBuf,
    overwrite: bool,
    engine_factory: Box<EngineFactory>,
    inner: Mutex<Inner>,
}

struct Inner {
    state: State,
    raw_update_info: String,
    transfer: Option<DeltaTransfer>,
    messages: VecDeque<String>,
    worker: Option<JoinHandle<()>>,
}

impl Updater {
    /// Create an updater for the AppImage at the given path.
    ///
    /// The path must be readable and the file must be a recognizable
    /// AppImage. The raw update information is read eagerly so that
    /// [`Updater::update_information`] never blocks.
    pub fn new(path: impl Into<PathBuf>, overwrite: bool) -> UpdaterResult<Self> {
        Self::with_engine_factory(
            path,
            overwrite,
            Box::new(|url, seed, overwrite| DeltaTransfer::new(url, seed, overwrite)),
        )
    }

    /// Create an updater with a custom transfer engine factory.
    pub fn with_engine_factory(
        path: impl Into<PathBuf>,
        overwrite: bool,
        engine_factory: Box<EngineFactory>,
    ) -> UpdaterResult<Self> {
        let path = path.into();
        std::fs::File::open(&path)
            .whatever_with(|error| format!("invalid argument: cannot read {path:?}: {error}"))?;
        let bundle = AppImage::new(&path);
        let detection = bundle
            .detect_type()
            .whatever("unable to determine the AppImage type")?;
        let mut messages = VecDeque::new();
        if detection.legacy_magic {
            messages.push_back(
                "Warning: AppImage magic bytes are missing; continuing with the \
                 legacy type 1 fallback"
                    .to_owned(),
            );
        }
        let raw_update_info = bundle
            .raw_update_info()
            .whatever("unable to read update information from the AppImage")?;
        Ok(Self {
            shared: Arc::new(Shared {
                path,
                overwrite,
                engine_factory,
                inner: Mutex::new(Inner {
                    state: State::Initialized,
                    raw_update_info,
                    transfer: None,
                    messages,
                    worker: None,
                }),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap()
    }

    /// Path of the AppImage being updated.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Spawn the worker performing the update.
    ///
    /// Returns `true` iff a worker was spawned; repeated calls return
    /// `false`.
    pub fn start(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != State::Initialized || inner.worker.is_some() {
            return false;
        }
        let shared = self.shared.clone();
        inner.worker = Some(std::thread::spawn(move || run_update(&shared)));
        true
    }

    /// Ask the worker to stop at its next cancellation point.
    ///
    /// Cancellation is cooperative: the transfer engine decides how
    /// quickly, and whether, an abort takes effect. Returns `false` if
    /// the update can no longer be stopped; it is an error to stop an
    /// update that has not been started.
    pub fn stop(&self) -> UpdaterResult<bool> {
        let mut inner = self.lock();
        match inner.state {
            State::Initialized => bail!("cannot stop an update that has not been started"),
            State::Running => {
                inner.state = State::Stopping;
                if let Some(transfer) = &inner.transfer {
                    transfer.abort();
                }
                Ok(true)
            }
            State::Stopping | State::Success | State::Error => Ok(false),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Whether the updater has reached a terminal state.
    pub fn is_done(&self) -> bool {
        !matches!(
            self.state(),
            State::Initialized | State::Running | State::Stopping
        )
    }

    /// Whether the update failed.
    pub fn has_error(&self) -> bool {
        self.state() == State::Error
    }

    /// Progress in `[0.0, 1.0]`.
    ///
    /// Reads `0.0` before the update starts and `1.0` in both terminal
    /// states; while running, the transfer engine's progress snapshot
    /// is returned. `None` is only possible while running before the
    /// engine has been constructed.
    pub fn progress(&self) -> Option<f64> {
        let inner = self.lock();
        match inner.state {
            State::Initialized => Some(0.0),
            State::Success | State::Error => Some(1.0),
            State::Running | State::Stopping => {
                inner.transfer.as_ref().map(DeltaTransfer::progress)
            }
        }
    }

    /// Drain the next status message.
    ///
    /// The updater's own messages are drained first, then the transfer
    /// engine's, prefixed with the engine's name.
    pub fn next_status_message(&self) -> Option<String> {
        let mut inner = self.lock();
        if let Some(message) = inner.messages.pop_front() {
            return Some(message);
        }
        inner
            .transfer
            .as_ref()
            .and_then(DeltaTransfer::next_status_message)
    }

    /// Check whether an update is available without transferring data.
    ///
    /// Only valid before the update has been started. On failure the
    /// engine is discarded so a later [`Updater::start`] gets a fresh
    /// instance.
    pub fn check_for_changes(&self) -> UpdaterResult<bool> {
        let mut inner = self.lock();
        if inner.state != State::Initialized {
            bail!("update checks are only possible before the update has been started");
        }
        let transfer = match prepare_transfer(&self.shared, &mut inner) {
            Ok(transfer) => transfer,
            Err(report) => {
                inner
                    .messages
                    .push_back(format!("Update check failed: {report:?}"));
                return Err(report);
            }
        };
        inner.transfer = Some(transfer.clone());
        match transfer.check_for_changes() {
            Ok(changes_available) => Ok(changes_available),
            Err(report) => {
                inner.transfer = None;
                inner
                    .messages
                    .push_back(format!("Update check failed: {report:?}"));
                Err(report).whatever("update check failed")
            }
        }
    }

    /// Produce a human-readable multi-line report about the AppImage.
    ///
    /// Resolving the transfer URL may contact remote servers; failures
    /// are reported inside the description instead of failing the
    /// call. The updater's state is not touched.
    pub fn describe_bundle(&self) -> UpdaterResult<String> {
        let bundle = AppImage::new(&self.shared.path);
        let mut description = format!("Parsing file: {:?}\n", self.shared.path);
        let kind = bundle
            .image_type()
            .whatever("unable to determine the AppImage type")?;
        description.push_str(&format!("AppImage type: {kind}\n"));
        let raw = self.update_information();
        description.push_str(&format!(
            "Raw update information: {}\n",
            if raw.is_empty() { "<empty>" } else { raw.as_str() },
        ));
        match UpdateInfo::parse(&raw) {
            Ok(info) => {
                description.push_str(&format!(
                    "Update information type: {}\n",
                    info.description()
                ));
                match info.build_url(&mut |_| {}) {
                    Ok(url) => {
                        description.push_str(&format!("Assembled ZSync URL: {url}\n"));
                    }
                    Err(report) => {
                        description.push_str(&format!(
                            "Failed to assemble ZSync URL. The updater can not be used \
                             with this AppImage. See below for more information.\n{report:?}\n"
                        ));
                    }
                }
            }
            Err(report) => {
                description.push_str(&format!("Invalid update information:\n{report:?}\n"));
            }
        }
        Ok(description)
    }

    /// Path of the new file, once the transfer has begun.
    pub fn path_to_new_file(&self) -> Option<PathBuf> {
        self.lock()
            .transfer
            .as_ref()
            .and_then(DeltaTransfer::path_to_new_file)
    }

    /// Size of the remote file, once the control file is known.
    pub fn remote_file_size(&self) -> Option<u64> {
        self.lock()
            .transfer
            .as_ref()
            .and_then(DeltaTransfer::remote_file_size)
    }

    /// The raw update information used for subsequent operations.
    pub fn update_information(&self) -> String {
        self.lock().raw_update_info.clone()
    }

    /// Override the raw update information.
    ///
    /// This allows pointing an AppImage at a custom update server or
    /// release channel without re-embedding metadata.
    pub fn set_update_information(&self, raw_update_info: impl Into<String>) {
        self.lock().raw_update_info = raw_update_info.into();
    }

    /// Validate the signatures of the old and new bundles.
    pub fn validate_signature(&self) -> ValidationOutcome {
        let outcome = self.classify_signatures();
        self.lock()
            .messages
            .push_back(format!("Signature validation: {}", outcome.message()));
        outcome
    }

    fn classify_signatures(&self) -> ValidationOutcome {
        let Some(new_path) = self.path_to_new_file() else {
            return ValidationOutcome::Failed;
        };
        let Ok(new_path) = std::fs::canonicalize(&new_path) else {
            return ValidationOutcome::Failed;
        };
        let Ok(old_path) = std::fs::canonicalize(&self.shared.path) else {
            return ValidationOutcome::Failed;
        };
        let old_path = if old_path == new_path {
            // The new file took the seed's name; the original content
            // lives in the backup.
            appup_transfer::backup_path(&new_path)
        } else {
            old_path
        };
        classify_bundle_pair(&AppImage::new(old_path), &AppImage::new(new_path))
    }

    /// Delete the new file and restore the original one.
    ///
    /// When the transfer renamed the original to `<path>.zs-old`, the
    /// backup is moved back under its old name.
    pub fn restore_original_file(&self) -> UpdaterResult<()> {
        let Some(new_path) = self.path_to_new_file() else {
            bail!("failed to determine the path to the new file");
        };
        let new_path = std::fs::canonicalize(&new_path)
            .whatever_with(|_| format!("unable to resolve {new_path:?}"))?;
        let old_path = std::fs::canonicalize(&self.shared.path)
            .whatever_with(|_| format!("unable to resolve {:?}", self.shared.path))?;
        std::fs::remove_file(&new_path)
            .whatever_with(|_| format!("unable to delete {new_path:?}"))?;
        if old_path == new_path {
            let backup = appup_transfer::backup_path(&new_path);
            if backup.exists() {
                std::fs::rename(&backup, &new_path)
                    .whatever_with(|_| format!("unable to restore {backup:?}"))?;
            }
        }
        Ok(())
    }

    /// Apply the seed's permission bits to the new file.
    pub fn copy_permissions_to_new_file(&self) -> UpdaterResult<()> {
        let Some(new_path) = self.path_to_new_file() else {
            bail!("failed to determine the path to the new file");
        };
        let metadata = std::fs::metadata(&self.shared.path)
            .whatever_with(|_| format!("unable to read permissions of {:?}", self.shared.path))?;
        std::fs::set_permissions(&new_path, metadata.permissions())
            .whatever_with(|_| format!("unable to set permissions of {new_path:?}"))?;
        Ok(())
    }
}

/// Worker body performing a single update run.
fn run_update(shared: &Shared) {
    // Initialization happens under the lock; any failure turns into a
    // status message and the terminal error state.
    let transfer = {
        let mut inner = shared.inner.lock().unwrap();
        if inner.state != State::Initialized {
            return;
        }
        // Drop any engine left behind by an update check so the run
        // uses a fresh instance.
        inner.transfer = None;
        match prepare_transfer(shared, &mut inner) {
            Ok(transfer) => {
                inner.transfer = Some(transfer.clone());
                inner.state = State::Running;
                transfer
            }
            Err(report) => {
                inner
                    .messages
                    .push_back(format!("Error preparing the update: {report:?}"));
                inner.state = State::Error;
                return;
            }
        }
    };

    // The transfer blocks on network I/O; polling calls must stay
    // responsive, so the lock is released while it runs.
    let result = transfer.run();

    let mut inner = shared.inner.lock().unwrap();
    match result {
        Ok(()) => inner.state = State::Success,
        Err(report) => {
            inner
                .messages
                .push_back(format!("Update failed: {report:?}"));
            inner.state = State::Error;
        }
    }
}

/// Parse the raw hint, resolve the transfer URL, and construct the
/// transfer with the working directory set to the seed's directory.
fn prepare_transfer(shared: &Shared, inner: &mut Inner) -> UpdaterResult<DeltaTransfer> {
    let raw = inner.raw_update_info.trim().to_owned();
    if raw.is_empty() {
        bail!(
            "Could not find update information in the AppImage. Please contact the \
             author of the AppImage and ask them to embed update information."
        );
    }
    let info = UpdateInfo::parse(&raw).whatever("failed to parse the update information")?;
    inner.messages.push_back(
        match &info {
            UpdateInfo::GenericZsync { .. } => "Updating from generic server via ZSync",
            UpdateInfo::GitHubReleases { .. } => "Updating from GitHub Releases via ZSync",
            UpdateInfo::PlingV1 { .. } => "Updating from Pling v1 server via ZSync",
        }
        .to_owned(),
    );
    let mut statuses = Vec::new();
    let url = info.build_url(&mut |message| statuses.push(message));
    inner.messages.extend(statuses);
    let url = url.whatever("failed to resolve the transfer URL")?;
    debug!(url = %url, "resolved transfer URL");

    let transfer = (shared.engine_factory)(&url, &shared.path, shared.overwrite);
    // The new AppImage goes into the same directory as the old one.
    let working_directory = match shared.path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    transfer.set_working_directory(&working_directory);
    Ok(transfer)
}
