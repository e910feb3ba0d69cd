//! Batch coordination.
//!
//! [`BatchCoordinator::run`] signs a list of files with one credential and one anchor. Each
//! file walks its own state machine:
//!
//! ```text
//! Pending → Loading → Placing → Signing → Writing → Done(Success | Failure)
//! ```
//!
//! A failing file jumps straight to `Done(Failure)` and the batch carries on. Only an unusable
//! destination or credential stops the batch, and both are checked before any file is touched.
//!
//! Files run concurrently up to a limit. Results and [`BatchProgress`] events are recorded in
//! completion order under one lock, so `completed` counts up by one per event.

mod output;

pub use output::{check_destination_writable, output_path, plan_outputs, write_atomically};

use crate::config::SignerConfig;
use crate::document::{DocumentLoader, SourceDocument};
use crate::error::SignError;
use crate::placement::{PlacementRect, PlacementResolver, SignatureAnchor};
use crate::signatures::{Credential, CredentialProvider, PinSource, SignOptions, SigningEngine};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};

/// Everything one batch run needs. Immutable for the run.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Input PDFs, in the order the caller listed them
    pub files: Vec<PathBuf>,
    /// Where the visible signature goes on every document
    pub anchor: SignatureAnchor,
    /// Directory that receives `<stem>-signed.pdf` files
    pub destination: PathBuf,
    /// Identifier handed to the credential provider
    pub credential_id: String,
    /// Sign without a visible appearance; the anchor is ignored
    pub invisible: bool,
}

impl BatchRequest {
    /// A visible-signature request.
    pub fn new(
        files: Vec<PathBuf>,
        anchor: SignatureAnchor,
        destination: impl Into<PathBuf>,
        credential_id: impl Into<String>,
    ) -> Self {
        Self {
            files,
            anchor,
            destination: destination.into(),
            credential_id: credential_id.into(),
            invisible: false,
        }
    }

    /// Sign invisibly.
    pub fn with_invisible(mut self, invisible: bool) -> Self {
        self.invisible = invisible;
        self
    }
}

/// Where a file is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Waiting for a worker slot
    Pending,
    /// Reading and parsing
    Loading,
    /// Resolving the anchor against the document's pages
    Placing,
    /// Inside the signing engine
    Signing,
    /// Writing the output file
    Writing,
    /// Finished, one way or the other
    Done,
}

/// How a file ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Signed and written
    Success {
        /// The signed file
        output: PathBuf,
        /// Hex SHA-256 of the signed byte ranges
        signature_digest: String,
    },
    /// Not signed
    Failure(SignError),
}

impl Outcome {
    /// Whether the file was signed.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// The failure, if any.
    pub fn error(&self) -> Option<&SignError> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::Failure(e) => Some(e),
        }
    }
}

/// Result for one input file. Never changes once recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct SigningResult {
    /// Position of the file in [`BatchRequest::files`]
    pub index: usize,
    /// The input file
    pub source: PathBuf,
    /// What happened to it
    pub outcome: Outcome,
}

/// Emitted after each file reaches `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProgress {
    /// Files done so far, this one included
    pub completed: usize,
    /// Files in the batch
    pub total: usize,
    /// The file that just finished
    pub current_file: PathBuf,
}

/// All results of a run, in completion order.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// One entry per input file
    pub results: Vec<SigningResult>,
}

impl BatchReport {
    /// Number of input files.
    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Results that succeeded.
    pub fn succeeded(&self) -> impl Iterator<Item = &SigningResult> {
        self.results.iter().filter(|r| r.outcome.is_success())
    }

    /// Results that failed.
    pub fn failed(&self) -> impl Iterator<Item = &SigningResult> {
        self.results.iter().filter(|r| !r.outcome.is_success())
    }

    /// Whether every file was signed.
    pub fn all_succeeded(&self) -> bool {
        self.failed().next().is_none()
    }

    /// Results in input order.
    pub fn in_input_order(&self) -> Vec<&SigningResult> {
        let mut ordered: Vec<_> = self.results.iter().collect();
        ordered.sort_by_key(|r| r.index);
        ordered
    }

    /// Human-readable summary, e.g. `8 of 10 signed; 2 failed: a.pdf (…), b.pdf (…)`.
    pub fn summary(&self) -> String {
        let signed = self.succeeded().count();
        let mut line = format!("{} of {} signed", signed, self.total());
        let failures: Vec<String> = self
            .failed()
            .map(|r| {
                let name = r
                    .source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| r.source.display().to_string());
                let reason = r.outcome.error().map(ToString::to_string).unwrap_or_default();
                format!("{} ({})", name, reason)
            })
            .collect();
        if !failures.is_empty() {
            line.push_str(&format!("; {} failed: {}", failures.len(), failures.join(", ")));
        }
        line
    }
}

/// Batch-scoped cancellation signal.
///
/// Checked between pipeline steps. A file already inside the signing engine finishes signing and
/// is then reported as cancelled without writing anything.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    /// A handle that is not cancelled.
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Cancel the batch. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the batch is cancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as any handle, so `changed` only fails after every handle is gone
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Runs batches.
///
/// One coordinator can run any number of batches; nothing carries over from one run to the next.
pub struct BatchCoordinator {
    provider: Arc<dyn CredentialProvider>,
    engine: SigningEngine,
    loader: DocumentLoader,
    resolver: PlacementResolver,
    concurrency: usize,
    signing_timeout: Duration,
    output_suffix: String,
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("engine", &self.engine)
            .field("loader", &self.loader)
            .field("resolver", &self.resolver)
            .field("concurrency", &self.concurrency)
            .field("signing_timeout", &self.signing_timeout)
            .field("output_suffix", &self.output_suffix)
            .finish_non_exhaustive()
    }
}

impl BatchCoordinator {
    /// Coordinator with default settings.
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self::from_config(provider, &SignerConfig::default())
    }

    /// Coordinator built from a configuration.
    pub fn from_config(provider: Arc<dyn CredentialProvider>, config: &SignerConfig) -> Self {
        Self {
            provider,
            engine: SigningEngine::new(config.sign.clone()),
            loader: DocumentLoader::new().with_retry_backoff(config.read_retry_backoff()),
            resolver: PlacementResolver::new(config.box_width, config.box_height),
            concurrency: config.concurrency.max(1),
            signing_timeout: config.signing_timeout(),
            output_suffix: config.output_suffix.clone(),
        }
    }

    /// Set how many files are in flight at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the ceiling on each signing call.
    pub fn with_signing_timeout(mut self, timeout: Duration) -> Self {
        self.signing_timeout = timeout;
        self
    }

    /// Set the signature options.
    pub fn with_sign_options(mut self, options: SignOptions) -> Self {
        self.engine = SigningEngine::new(options);
        self
    }

    /// Set the placement resolver.
    pub fn with_resolver(mut self, resolver: PlacementResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Files in flight at once.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run one batch.
    ///
    /// `pin` is consulted at most once, while loading the credential. Progress events go to
    /// `progress` when given; a closed receiver is ignored.
    ///
    /// # Errors
    ///
    /// Only batch-fatal errors: [`SignError::DestinationUnavailable`] and the credential errors.
    /// Everything that goes wrong with a single file is in that file's [`SigningResult`].
    pub async fn run(
        &self,
        request: BatchRequest,
        pin: &dyn PinSource,
        progress: Option<mpsc::UnboundedSender<BatchProgress>>,
        cancel: Option<CancelHandle>,
    ) -> Result<BatchReport, SignError> {
        check_destination_writable(&request.destination)?;
        let credential = Arc::new(self.provider.load(&request.credential_id, pin)?);

        let total = request.files.len();
        log::info!(
            "signing {} file(s) as '{}' into {} ({} at a time)",
            total,
            credential.signer_name(),
            request.destination.display(),
            self.concurrency
        );

        let plan = plan_outputs(&request.destination, &request.files, &self.output_suffix);
        let shared = Arc::new(Shared {
            loader: self.loader.clone(),
            resolver: self.resolver,
            engine: self.engine.clone(),
            credential,
            anchor: request.anchor,
            invisible: request.invisible,
            signing_timeout: self.signing_timeout,
            cancel: cancel.unwrap_or_default(),
            progress,
            total,
            tally: Mutex::new(Vec::with_capacity(total)),
            session: Arc::new(tokio::sync::Mutex::new(())),
        });
        let limiter = Arc::new(Semaphore::new(self.concurrency));

        let mut handles = Vec::with_capacity(total);
        for (index, (source, (output, duplicate))) in request.files.into_iter().zip(plan).enumerate() {
            let job = Job {
                index,
                source,
                output,
                duplicate,
            };
            let shared = Arc::clone(&shared);
            let limiter = Arc::clone(&limiter);
            let source = job.source.clone();
            handles.push((
                index,
                source,
                tokio::spawn(async move {
                    log::debug!("{}: {:?}", job.source.display(), FileState::Pending);
                    let outcome = match acquire(&limiter, &shared.cancel).await {
                        Some(permit) => shared.process(&job, Arc::new(permit)).await,
                        None => Outcome::Failure(SignError::Cancelled),
                    };
                    shared.record(job.index, job.source, outcome);
                }),
            ));
        }

        for (index, source, handle) in handles {
            if let Err(e) = handle.await {
                log::error!("worker for {} died: {}", source.display(), e);
                shared.record(
                    index,
                    source,
                    Outcome::Failure(SignError::SigningBackendError(format!("worker failed: {}", e))),
                );
            }
        }

        let report = BatchReport {
            results: std::mem::take(&mut *shared.tally.lock()),
        };
        log::info!("{}", report.summary());
        Ok(report)
    }
}

/// Wait for a worker slot, or give up when the batch is cancelled first.
async fn acquire(limiter: &Arc<Semaphore>, cancel: &CancelHandle) -> Option<OwnedSemaphorePermit> {
    if cancel.is_cancelled() {
        return None;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = Arc::clone(limiter).acquire_owned() => permit.ok(),
    }
}

#[derive(Debug)]
struct Job {
    index: usize,
    source: PathBuf,
    output: PathBuf,
    duplicate: bool,
}

/// State shared by the workers of one run.
struct Shared {
    loader: DocumentLoader,
    resolver: PlacementResolver,
    engine: SigningEngine,
    credential: Arc<Credential>,
    anchor: SignatureAnchor,
    invisible: bool,
    signing_timeout: Duration,
    cancel: CancelHandle,
    progress: Option<mpsc::UnboundedSender<BatchProgress>>,
    total: usize,
    tally: Mutex<Vec<SigningResult>>,
    session: Arc<tokio::sync::Mutex<()>>,
}

impl Shared {
    async fn process(self: &Arc<Self>, job: &Job, permit: Arc<OwnedSemaphorePermit>) -> Outcome {
        match self.pipeline(job, permit).await {
            Ok((output, signature_digest)) => Outcome::Success {
                output,
                signature_digest,
            },
            Err(e) => {
                if e == SignError::Cancelled {
                    log::info!("{}: cancelled", job.source.display());
                } else {
                    log::error!("{}: {}", job.source.display(), e);
                }
                Outcome::Failure(e)
            },
        }
    }

    async fn pipeline(
        self: &Arc<Self>,
        job: &Job,
        permit: Arc<OwnedSemaphorePermit>,
    ) -> Result<(PathBuf, String), SignError> {
        let source = job.source.as_path();

        self.enter(source, FileState::Loading)?;
        let document = {
            let loader = self.loader.clone();
            let path = job.source.clone();
            Arc::new(blocking(move || loader.load(&path)).await?)
        };

        self.enter(source, FileState::Placing)?;
        let placement = if self.invisible {
            None
        } else {
            let (this, document) = (Arc::clone(self), Arc::clone(&document));
            Some(blocking(move || this.resolver.resolve(&this.anchor, document.pages())).await?)
        };

        // A single-session token signs one file at a time; waiting for it is not signing time
        let session = if self.credential.exclusive_session() {
            Some(Arc::clone(&self.session).lock_owned().await)
        } else {
            None
        };
        self.enter(source, FileState::Signing)?;
        let signed = {
            let this = Arc::clone(self);
            // The permit and the session stay with the signing call, so a call abandoned by the
            // timeout keeps its worker slot until it returns
            let held = (Arc::clone(&permit), session);
            let sign = blocking(move || {
                let _held = held;
                sign(&this.engine, &document, &this.credential, placement.as_ref())
            });
            match tokio::time::timeout(self.signing_timeout, sign).await {
                Ok(signed) => signed?,
                Err(_) => {
                    log::warn!(
                        "{}: signing exceeded {:?}; the call is abandoned but keeps its worker slot until it returns",
                        source.display(),
                        self.signing_timeout
                    );
                    return Err(SignError::SigningTimeout(self.signing_timeout));
                },
            }
        };

        self.enter(source, FileState::Writing)?;
        if job.duplicate {
            return Err(SignError::WriteFailure(format!(
                "{} is also the output of an earlier file in this batch",
                job.output.display()
            )));
        }
        let output = job.output.clone();
        let bytes = signed.bytes;
        blocking(move || write_atomically(&output, &bytes)).await?;

        log::info!(
            "{} -> {} ({})",
            source.display(),
            job.output.display(),
            signed.field_name
        );
        Ok((job.output.clone(), signed.signature_digest))
    }

    /// Log a transition; refuse it when the batch has been cancelled.
    fn enter(&self, source: &Path, state: FileState) -> Result<(), SignError> {
        if self.cancel.is_cancelled() {
            return Err(SignError::Cancelled);
        }
        log::debug!("{}: {:?}", source.display(), state);
        Ok(())
    }

    fn record(&self, index: usize, source: PathBuf, outcome: Outcome) {
        let mut tally = self.tally.lock();
        log::debug!("{}: {:?}", source.display(), FileState::Done);
        tally.push(SigningResult {
            index,
            source: source.clone(),
            outcome,
        });
        if let Some(progress) = &self.progress {
            // A dropped receiver just means nobody is watching
            let _ = progress.send(BatchProgress {
                completed: tally.len(),
                total: self.total,
                current_file: source,
            });
        }
    }
}

fn sign(
    engine: &SigningEngine,
    document: &SourceDocument,
    credential: &Credential,
    placement: Option<&PlacementRect>,
) -> Result<crate::signatures::SignedBytes, SignError> {
    engine.sign(document, credential, placement)
}

/// Run `f` on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, SignError>
where
    F: FnOnce() -> Result<T, SignError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SignError::SigningBackendError(format!("worker failed: {}", e)))?
}
