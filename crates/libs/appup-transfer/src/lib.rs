#![forbid(unsafe_code)]

//! Block-reuse delta transfer driver.
//!
//! The actual transfer is performed by an engine implementing
//! [`TransferEngine`]. The built-in [`ZsyncClient`] fetches a zsync
//! control file and downloads the remote file over HTTP; alternative
//! engines (for example a full zsync implementation with block-level
//! seed reuse) can be plugged into [`DeltaTransfer::with_engine`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reportify::Report;

pub mod control;

mod client;

pub use client::{backup_path, ZsyncClient, BACKUP_SUFFIX};

reportify::new_whatever_type! {
    /// Error performing a delta transfer.
    TransferError
}

/// Result with [`TransferError`] as error type.
pub type TransferResult<T> = Result<T, Report<TransferError>>;

/// Threshold up to which engines may coalesce short adjacent ranges
/// into a single request.
pub const RANGES_OPTIMIZATION_THRESHOLD: u64 = 64 * 4096;

/// Contract of a block-reuse transfer engine.
///
/// Engines are polled from the caller's thread while [`run`] blocks a
/// worker thread, so all methods take `&self` and implementations must
/// be internally synchronized.
///
/// [`run`]: TransferEngine::run
pub trait TransferEngine: Send + Sync {
    /// Short name identifying the engine in status messages.
    fn name(&self) -> &'static str;

    /// Set the directory the new file is created in.
    fn set_working_directory(&self, directory: &Path);

    /// Fetch only the control file and report whether the remote file
    /// differs from the seed. No data is transferred and no progress
    /// is published.
    fn check_for_changes(&self) -> TransferResult<bool>;

    /// Perform the full transfer.
    fn run(&self) -> TransferResult<()>;

    /// Ask the engine to abort cooperatively. The engine honors the
    /// request at its next range boundary; an aborted [`run`] returns
    /// an error.
    ///
    /// [`run`]: TransferEngine::run
    fn abort(&self);

    /// Progress in `[0.0, 1.0]`, monotonic within a single run.
    fn progress(&self) -> f64;

    /// Size of the remote file, once the control file is known.
    fn remote_file_size(&self) -> Option<u64>;

    /// Path of the new file, once the transfer has begun.
    fn path_to_new_file(&self) -> Option<PathBuf>;

    /// Drain one message from the engine's status FIFO.
    fn next_status_message(&self) -> Option<String>;
}

/// Driver owning a transfer engine.
///
/// Cloning is cheap and shares the engine, which lets a worker thread
/// run the transfer while other threads poll progress and drain status
/// messages.
#[derive(Clone)]
pub struct DeltaTransfer {
    engine: Arc<dyn TransferEngine>,
}

impl DeltaTransfer {
    /// Create a driver around the built-in [`ZsyncClient`].
    pub fn new(
        transfer_url: impl Into<String>,
        seed_path: impl Into<PathBuf>,
        overwrite: bool,
    ) -> Self {
        Self::with_engine(Arc::new(
            ZsyncClient::new(transfer_url, seed_path, overwrite)
                .with_ranges_optimization_threshold(RANGES_OPTIMIZATION_THRESHOLD),
        ))
    }

    /// Create a driver around a custom engine.
    pub fn with_engine(engine: Arc<dyn TransferEngine>) -> Self {
        Self { engine }
    }

    /// Set the directory the new file is created in.
    pub fn set_working_directory(&self, directory: &Path) {
        self.engine.set_working_directory(directory);
    }

    /// See [`TransferEngine::check_for_changes`].
    pub fn check_for_changes(&self) -> TransferResult<bool> {
        self.engine.check_for_changes()
    }

    /// See [`TransferEngine::run`].
    pub fn run(&self) -> TransferResult<()> {
        self.engine.run()
    }

    /// See [`TransferEngine::abort`].
    pub fn abort(&self) {
        self.engine.abort();
    }

    /// See [`TransferEngine::progress`].
    pub fn progress(&self) -> f64 {
        self.engine.progress()
    }

    /// See [`TransferEngine::remote_file_size`].
    pub fn remote_file_size(&self) -> Option<u64> {
        self.engine.remote_file_size()
    }

    /// See [`TransferEngine::path_to_new_file`].
    pub fn path_to_new_file(&self) -> Option<PathBuf> {
        self.engine.path_to_new_file()
    }

    /// Drain one engine status message, prefixed with the engine's
    /// name so the caller can identify its origin.
    pub fn next_status_message(&self) -> Option<String> {
        self.engine
            .next_status_message()
            .map(|message| format!("{}: {message}", self.engine.name()))
    }
}
