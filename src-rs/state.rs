use std::fmt;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::InferenceBackend;
use crate::config::NormalizeSettings;
use crate::error::PipelineError;
use crate::normalize::{normalize_image_async, NormalizedImage};
use crate::request::{build_request, AnalysisRequest};
use crate::result::{normalize_response, AnalysisResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Home,
    Preview,
    Analyzing,
    Result,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(u64);

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "img-{}", self.0)
    }
}

impl Serialize for ImageId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone)]
pub struct RawFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl RawFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

/// Preview resources owned by the rendering layer. The controller asks for one
/// when an image is staged and hands it back when the image leaves the session.
/// Previews are built from the normalized JPEG; the raw file is not kept.
pub trait PreviewStore {
    type Handle;

    fn create(&mut self, id: ImageId, source_name: &str, image: &NormalizedImage)
        -> Self::Handle;
    fn release(&mut self, handle: Self::Handle);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoPreviews;

impl PreviewStore for NoPreviews {
    type Handle = ();

    fn create(&mut self, _id: ImageId, _source_name: &str, _image: &NormalizedImage) -> Self::Handle {}

    fn release(&mut self, _handle: Self::Handle) {}
}

#[derive(Debug)]
pub struct StagedImage<H> {
    pub id: ImageId,
    pub source_name: String,
    pub preview: H,
    pub image: NormalizedImage,
}

#[derive(Debug)]
pub struct PipelineState<H> {
    phase: Phase,
    staged: Vec<StagedImage<H>>,
    result: Option<AnalysisResult>,
    last_error: Option<String>,
}

impl<H> Default for PipelineState<H> {
    fn default() -> Self {
        Self {
            phase: Phase::Home,
            staged: Vec::new(),
            result: None,
            last_error: None,
        }
    }
}

impl<H> PipelineState<H> {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn staged(&self) -> &[StagedImage<H>] {
        &self.staged
    }

    pub fn result(&self) -> Option<&AnalysisResult> {
        self.result.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedSummary {
    pub id: ImageId,
    pub source_name: String,
    #[serde(flatten)]
    pub image: NormalizedImage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSnapshot {
    pub phase: Phase,
    pub staged_images: Vec<StagedSummary>,
    pub result: Option<AnalysisResult>,
    pub last_error: Option<String>,
    pub generation: u64,
}

impl Default for PipelineSnapshot {
    fn default() -> Self {
        Self {
            phase: Phase::Home,
            staged_images: Vec::new(),
            result: None,
            last_error: None,
            generation: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddOutcome {
    pub added: Vec<ImageId>,
    /// `(file name, user-facing message)` for every file that was not staged.
    pub failed: Vec<(String, String)>,
}

/// An in-flight analysis. Completing it after the session moved on is a no-op.
#[derive(Debug, Clone)]
pub struct AnalysisTicket {
    generation: u64,
    request: AnalysisRequest,
}

impl AnalysisTicket {
    pub fn request(&self) -> &AnalysisRequest {
        &self.request
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

pub struct ScanController<P: PreviewStore> {
    state: PipelineState<P::Handle>,
    previews: P,
    settings: NormalizeSettings,
    next_id: u64,
    generation: u64,
    updates: watch::Sender<PipelineSnapshot>,
}

impl<P: PreviewStore> ScanController<P> {
    pub fn new(previews: P, settings: NormalizeSettings) -> Self {
        let (updates, _) = watch::channel(PipelineSnapshot::default());
        Self {
            state: PipelineState::default(),
            previews,
            settings,
            next_id: 1,
            generation: 0,
            updates,
        }
    }

    pub fn state(&self) -> &PipelineState<P::Handle> {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn previews(&self) -> &P {
        &self.previews
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineSnapshot> {
        self.updates.subscribe()
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            phase: self.state.phase,
            staged_images: self
                .state
                .staged
                .iter()
                .map(|staged| StagedSummary {
                    id: staged.id,
                    source_name: staged.source_name.clone(),
                    image: staged.image.clone(),
                })
                .collect(),
            result: self.state.result.clone(),
            last_error: self.state.last_error.clone(),
            generation: self.generation,
        }
    }

    /// Normalize and stage files one at a time, in order. Files that fail to
    /// decode are reported and skipped; the rest are still staged.
    pub async fn add_images(&mut self, files: Vec<RawFile>) -> AddOutcome {
        let mut outcome = AddOutcome::default();
        if !matches!(self.state.phase, Phase::Home | Phase::Preview) {
            debug!(phase = ?self.state.phase, "ignoring add while not capturing");
            return outcome;
        }
        if files.is_empty() {
            return outcome;
        }

        for RawFile { name, bytes } in files {
            match normalize_image_async(bytes, self.settings).await {
                Ok(image) => {
                    let id = ImageId(self.next_id);
                    self.next_id += 1;
                    let preview = self.previews.create(id, &name, &image);
                    debug!(%id, %name, width = image.width, height = image.height, "staged image");
                    self.state.staged.push(StagedImage {
                        id,
                        source_name: name,
                        preview,
                        image,
                    });
                    outcome.added.push(id);
                }
                Err(err) => {
                    warn!(%name, error = %err, "could not stage image");
                    outcome.failed.push((name, err.user_message()));
                }
            }
        }

        self.state.last_error = summarize_failures(&outcome.failed);
        if !self.state.staged.is_empty() {
            self.state.phase = Phase::Preview;
        }
        self.publish();
        outcome
    }

    /// Drop one staged image. Removing the last one returns to HOME.
    pub fn remove_image(&mut self, id: ImageId) -> bool {
        if self.state.phase != Phase::Preview {
            debug!(%id, phase = ?self.state.phase, "ignoring remove outside preview");
            return false;
        }
        let Some(index) = self.state.staged.iter().position(|staged| staged.id == id) else {
            return false;
        };

        let removed = self.state.staged.remove(index);
        self.previews.release(removed.preview);
        if self.state.staged.is_empty() {
            self.go_home();
        }
        self.publish();
        true
    }

    /// PREVIEW -> ANALYZING. Returns `None` (and changes nothing) when there is
    /// nothing to analyze or an analysis is already running.
    pub fn begin_analysis(&mut self) -> Option<AnalysisTicket> {
        if self.state.phase == Phase::Analyzing {
            debug!("analysis already in flight");
            return None;
        }
        if self.state.phase != Phase::Preview {
            return None;
        }

        let request = match build_request(self.state.staged.iter().map(|staged| &staged.image)) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "nothing to analyze");
                return None;
            }
        };

        self.generation += 1;
        self.state.phase = Phase::Analyzing;
        self.state.result = None;
        self.state.last_error = None;
        info!(generation = self.generation, images = request.images().len(), "analysis started");
        self.publish();
        Some(AnalysisTicket {
            generation: self.generation,
            request,
        })
    }

    /// Apply a backend outcome. Returns `false` if the ticket is stale.
    pub fn complete_analysis(
        &mut self,
        ticket: AnalysisTicket,
        outcome: Result<String, PipelineError>,
    ) -> bool {
        if ticket.generation != self.generation || self.state.phase != Phase::Analyzing {
            info!(
                ticket = ticket.generation,
                current = self.generation,
                "dropping stale analysis response"
            );
            return false;
        }

        match outcome.and_then(|text| normalize_response(&text)) {
            Ok(result) => {
                info!(product = %result.product_name, ingredients = result.ingredients.len(), "analysis finished");
                self.state.result = Some(result);
                self.state.last_error = None;
                self.state.phase = Phase::Result;
            }
            Err(err) => {
                warn!(error = %err, "analysis failed");
                self.state.result = None;
                self.state.last_error = Some(err.user_message());
                self.state.phase = Phase::Preview;
            }
        }
        self.publish();
        true
    }

    pub async fn analyze<B: InferenceBackend>(&mut self, backend: &B) {
        let Some(ticket) = self.begin_analysis() else {
            return;
        };
        let outcome = backend.generate(ticket.request()).await;
        self.complete_analysis(ticket, outcome);
    }

    pub fn reset(&mut self) {
        self.generation += 1;
        self.go_home();
        self.publish();
    }

    fn go_home(&mut self) {
        for staged in self.state.staged.drain(..) {
            self.previews.release(staged.preview);
        }
        self.state.result = None;
        self.state.last_error = None;
        self.state.phase = Phase::Home;
    }

    fn publish(&self) {
        self.updates.send_replace(self.snapshot());
    }
}

fn summarize_failures(failed: &[(String, String)]) -> Option<String> {
    match failed {
        [] => None,
        [(name, message)] => Some(format!("{name}: {message}")),
        [(_, message), ..] => {
            let names: Vec<&str> = failed.iter().map(|(name, _)| name.as_str()).collect();
            Some(format!("{} files could not be added ({}). {message}", failed.len(), names.join(", ")))
        }
    }
}
