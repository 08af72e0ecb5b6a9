//! The build pipeline.
//!
//! [`Pipeline::start`] runs one build in the background and hands back a
//! [`BuildHandle`] right away. Stages run strictly in order:
//!
//! 1. lock the clone directory
//! 2. load the manifest and resolve the libraries
//! 3. clone or update the build tool
//! 4. download every archive
//! 5. extract every archive
//! 6. install the tool's dependencies, compile, verify the artifact
//!
//! Cancellation is checked before each stage and each library. Failures end
//! the run with a [`BuildResult::Failure`] and a final error event.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{Instrument, info_span};

use crate::config::{LibraryManifest, LibrarySpec, Settings};
use crate::error::BuildError;
use crate::extract::extract;
use crate::fetch::{Fetcher, fetch_repository};
use crate::invoke::{BuildInvoker, CommandRunner, PrivilegeStrategy, TokioRunner, check_tools};
use crate::job::{BuildJob, BuildResult, BuildSelection, CancelToken, FailureReason, LibraryStatus, Stage};
use crate::layout::BuildLayout;
use crate::lock::CloneDirLock;
use crate::log::{LogEvent, LogSink, Reporter};
use crate::platform::os::Os;
use crate::resolve::{php_extensions, resolve};

/// Where the pipeline gets its library manifest from.
#[derive(Debug, Clone)]
pub enum ManifestSource {
  /// Read and validate the file at the start of the run.
  Path(PathBuf),
  Loaded(Arc<LibraryManifest>),
}

impl From<LibraryManifest> for ManifestSource {
  fn from(manifest: LibraryManifest) -> Self {
    ManifestSource::Loaded(Arc::new(manifest))
  }
}

/// Forwards events to the observer and the job's own log tail.
struct Tee {
  sinks: Vec<Arc<dyn LogSink>>,
}

impl LogSink for Tee {
  fn emit(&self, event: LogEvent) {
    for sink in &self.sinks {
      sink.emit(event.clone());
    }
  }
}

/// A running build.
pub struct BuildHandle {
  cancel: CancelToken,
  task: JoinHandle<BuildJob>,
}

impl BuildHandle {
  /// Ask the build to stop. A running external process is killed.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  pub fn cancel_token(&self) -> CancelToken {
    self.cancel.clone()
  }

  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }

  /// Wait for the build to end.
  pub async fn wait(self) -> BuildResult {
    match self.wait_job().await {
      Ok(job) => job.result().cloned().unwrap_or(BuildResult::Failure {
        reason: FailureReason::Io,
        message: "build ended without a result".to_string(),
      }),
      Err(message) => BuildResult::Failure {
        reason: FailureReason::Io,
        message,
      },
    }
  }

  /// Wait for the build and return the whole job, including per-library
  /// status and the log tail.
  pub async fn wait_job(self) -> Result<BuildJob, String> {
    self.task.await.map_err(|e| format!("build task failed: {e}"))
  }
}

/// Sequences the build stages.
#[derive(Clone)]
pub struct Pipeline {
  settings: Settings,
  runner: Arc<dyn CommandRunner>,
  privilege: Arc<dyn PrivilegeStrategy>,
  os: Os,
}

impl Pipeline {
  pub fn new(settings: Settings, runner: Arc<dyn CommandRunner>, privilege: Arc<dyn PrivilegeStrategy>, os: Os) -> Self {
    Self {
      settings,
      runner,
      privilege,
      os,
    }
  }

  /// A pipeline that runs real processes with the privilege strategy of the
  /// host. `None` on an unsupported operating system.
  pub fn for_host(settings: Settings) -> Option<Self> {
    let os = Os::current()?;
    Some(Self::new(
      settings,
      Arc::new(TokioRunner),
      crate::invoke::for_os(os),
      os,
    ))
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  /// Start a build on the current tokio runtime and return immediately.
  pub fn start(&self, manifest: ManifestSource, selection: BuildSelection, sink: Arc<dyn LogSink>) -> BuildHandle {
    self.start_with(manifest, selection, sink, CancelToken::new())
  }

  /// Like [`start`](Self::start), with a caller-provided cancellation token.
  pub fn start_with(
    &self,
    manifest: ManifestSource,
    selection: BuildSelection,
    sink: Arc<dyn LogSink>,
    cancel: CancelToken,
  ) -> BuildHandle {
    let span = info_span!("build", php = %selection.php_version, dir = %selection.clone_directory.display());
    let mut job = BuildJob::new(selection, cancel.clone());
    let pipeline = self.clone();

    let task = tokio::spawn(
      async move {
        pipeline.run(&mut job, manifest, sink).await;
        job
      }
      .instrument(span),
    );
    BuildHandle { cancel, task }
  }

  /// Run every stage for `job` to completion, recording the result on it.
  pub async fn run(&self, job: &mut BuildJob, manifest: ManifestSource, sink: Arc<dyn LogSink>) -> BuildResult {
    let tee: Arc<dyn LogSink> = Arc::new(Tee {
      sinks: vec![sink, job.log_tail()],
    });
    let reporter = Reporter::new(tee);

    let result = match self.execute(job, manifest, &reporter).await {
      Ok(artifact) => {
        job.enter(Stage::Finished);
        reporter
          .for_stage(Stage::Finished)
          .info(format!("build finished: {}", artifact.display()));
        BuildResult::Success { artifact }
      }
      Err(err) => {
        let stage_reporter = reporter.for_stage(job.stage());
        let reason = err.reason();
        let message = err.to_string();
        stage_reporter.error(format!("{reason}: {message}"));
        if let Some(hint) = err.hint() {
          stage_reporter.info(format!("hint: {hint}"));
        }
        BuildResult::Failure { reason, message }
      }
    };
    job.finish(result.clone());
    result
  }

  async fn execute(&self, job: &mut BuildJob, manifest: ManifestSource, reporter: &Reporter) -> Result<PathBuf, BuildError> {
    let cancel = job.cancel_token().clone();
    let selection = job.selection().clone();
    let layout = BuildLayout::new(&selection.clone_directory, &self.settings.tool_dir_name);

    cancel.check()?;
    let _lock = CloneDirLock::acquire(layout.clone_dir(), &selection.php_version)?;

    job.enter(Stage::LoadConfig);
    let manifest = match manifest {
      ManifestSource::Loaded(manifest) => manifest,
      ManifestSource::Path(path) => {
        reporter
          .for_stage(Stage::LoadConfig)
          .info(format!("loading {}", path.display()));
        let loaded = tokio::task::spawn_blocking(move || LibraryManifest::load(&path))
          .await
          .map_err(join_error("manifest loader"))??;
        Arc::new(loaded)
      }
    };

    cancel.check()?;
    job.enter(Stage::Resolve);
    let resolved = resolve(&selection, &manifest)?;
    let extensions = php_extensions(&selection, &manifest);
    let resolve_reporter = reporter.for_stage(Stage::Resolve);
    resolve_reporter.info(format!("libraries: {}", resolved.names().join(", ")));
    resolve_reporter.info(format!("extensions: {}", extensions.join(",")));
    job.track_libraries(resolved.names());

    cancel.check()?;
    job.enter(Stage::Repository);
    check_tools(self.runner.as_ref(), &self.settings, &reporter.for_stage(Stage::Repository))?;
    fetch_repository(
      &self.settings.tool_repository,
      layout.tool_dir(),
      &self.settings.git_program,
      self.runner.as_ref(),
      &reporter.for_stage(Stage::Repository),
      &cancel,
    )
    .await?;

    cancel.check()?;
    job.enter(Stage::Download);
    let download_reporter = reporter.for_stage(Stage::Download);
    let fetcher = Fetcher::new(&self.settings)?;
    let downloads = layout.downloads_dir();
    let mut archives: Vec<(LibrarySpec, PathBuf)> = Vec::with_capacity(resolved.len());
    for spec in &resolved {
      cancel.check()?;
      let outcome = fetcher
        .fetch(spec, &downloads, selection.force_refresh, &download_reporter, &cancel)
        .await?;
      let status = if outcome.cached {
        LibraryStatus::Cached
      } else {
        LibraryStatus::Downloaded
      };
      job.set_library_status(&spec.name, status);
      archives.push((spec.clone(), outcome.path));
    }
    download_reporter.info(format!("all downloads complete ({} archives)", archives.len()));

    cancel.check()?;
    job.enter(Stage::Extract);
    let extract_reporter = reporter.for_stage(Stage::Extract);
    for (spec, archive) in archives {
      cancel.check()?;
      let dest = layout.library_source_dir(&spec);
      extract_reporter.info(format!("{}: extracting into {}", spec.name, dest.display()));

      let kind = spec.archive_kind;
      let task_archive = archive.clone();
      let summary = tokio::task::spawn_blocking(move || extract(&task_archive, kind, &dest))
        .await
        .map_err(join_error("extractor"))?
        .map_err(|source| BuildError::Extract { archive, source })?;

      extract_reporter.info(format!(
        "{}: {} files, {} directories, {} links",
        spec.name, summary.files, summary.dirs, summary.links
      ));
      job.set_library_status(&spec.name, LibraryStatus::Extracted);
    }

    cancel.check()?;
    let invoker = BuildInvoker::new(
      Arc::clone(&self.runner),
      Arc::clone(&self.privilege),
      self.settings.clone(),
      self.os,
    );
    Ok(invoker.run_build(job, &layout, &extensions, reporter).await?)
  }
}

fn join_error(what: &'static str) -> impl FnOnce(tokio::task::JoinError) -> BuildError {
  move |e| BuildError::Io {
    context: format!("{what} task failed"),
    source: std::io::Error::other(e),
  }
}
