// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! engine: The MediaCore session façade.
//!
//! [`MediaCore`] owns the runtime every session runs on, the renderers created through it
//! and the transport/demuxer/decoder registries sessions resolve sources with. Hosts drive
//! playback through [`Player`] handles and observe it through a [`PlayerListener`].

use mediacore_core::{CodecId, CoreConfig, MediaCoreError, RendererId, Result, SessionId};
use mediacore_nodes::capture::{CameraEnumerator, CaptureBackend};
use mediacore_nodes::decode::{DecoderFactory, DecoderRegistry};
use mediacore_nodes::ingest::{DemuxerFactory, DemuxerRegistry, Transport, TransportRegistry};
use mediacore_nodes::render::{GpuContext, HeadlessGpuContext, Renderer};
use opentelemetry::{global, metrics::Counter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

// --- Public Modules ---

pub mod audio;
pub mod constants;
pub mod logging;
pub mod sync;

mod dispatcher;
mod player;
mod playout;
mod registry;
mod session;

// Re-exports
pub use audio::{AudioSink, NullAudioSink};
pub use dispatcher::PlayerListener;
pub use player::{Player, PlayerOptions};
pub use registry::RendererRegistry;
pub use session::PlayoutTotals;

use constants::{RUNTIME_SHUTDOWN_TIMEOUT, RUNTIME_THREAD_NAME};
use dispatcher::Dispatcher;
use playout::{PlayoutActor, Stages};
use session::SessionShared;

/// Supplies the GPU context each renderer's thread binds.
pub trait GpuProvider: Send + Sync {
    /// # Errors
    ///
    /// Any error fails renderer creation with `InitError`.
    fn create_context(&self) -> Result<Box<dyn GpuContext>>;
}

/// Contexts that render into [`HeadlessSurface`](mediacore_nodes::render::HeadlessSurface)s.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessGpuProvider;

impl GpuProvider for HeadlessGpuProvider {
    fn create_context(&self) -> Result<Box<dyn GpuContext>> {
        Ok(Box::new(HeadlessGpuContext::new()))
    }
}

/// Configures the registries before the core starts.
pub struct MediaCoreBuilder {
    config: CoreConfig,
    transports: TransportRegistry,
    demuxers: DemuxerRegistry,
    decoders: DecoderRegistry,
}

impl MediaCoreBuilder {
    /// Registers (or replaces) the transport for `scheme`.
    #[must_use]
    pub fn with_transport(mut self, scheme: &str, transport: Arc<dyn Transport>) -> Self {
        self.transports.register(scheme, transport);
        self
    }

    #[must_use]
    pub fn with_decoder(mut self, codec: CodecId, factory: DecoderFactory) -> Self {
        self.decoders.register(codec, factory);
        self
    }

    /// Registers a container recognized by its leading `magic` bytes.
    #[must_use]
    pub fn with_demuxer(
        mut self,
        container: &str,
        magic: &'static [u8],
        factory: DemuxerFactory,
    ) -> Self {
        self.demuxers.register(container, magic, factory);
        self
    }

    /// Validates the configuration and starts the core's runtime.
    ///
    /// # Errors
    ///
    /// `Configuration` for an invalid config, `InitError` if the runtime cannot start.
    pub fn build(self) -> Result<MediaCore> {
        self.config.validate()?;

        let mut runtime = tokio::runtime::Builder::new_multi_thread();
        runtime.enable_all().thread_name(RUNTIME_THREAD_NAME);
        if let Some(workers) = self.config.runtime_worker_threads {
            runtime.worker_threads(workers);
        }
        let runtime = runtime
            .build()
            .map_err(|e| MediaCoreError::InitError(format!("failed to start runtime: {e}")))?;

        let meter = global::meter("mediacore_engine");
        info!(
            schemes = ?self.transports.schemes(),
            worker_threads = self.config.runtime_worker_threads,
            "MediaCore created"
        );
        Ok(MediaCore {
            config: self.config,
            runtime: Some(runtime),
            stages: Stages {
                transports: Arc::new(self.transports),
                demuxers: Arc::new(self.demuxers),
                decoders: Arc::new(self.decoders),
            },
            renderers: RendererRegistry::new(),
            gpu: Mutex::new(None),
            log_guard: Mutex::new(None),
            logging_installed: AtomicBool::new(false),
            sessions_counter: meter
                .u64_counter("core.sessions.created")
                .with_description("Playback sessions created")
                .build(),
        })
    }
}

/// Process-wide entry point. See the crate docs.
pub struct MediaCore {
    config: CoreConfig,
    runtime: Option<Runtime>,
    stages: Stages,
    renderers: RendererRegistry,
    gpu: Mutex<Option<Arc<dyn GpuProvider>>>,
    log_guard: Mutex<Option<WorkerGuard>>,
    logging_installed: AtomicBool,
    sessions_counter: Counter<u64>,
}

impl MediaCore {
    pub fn builder(config: CoreConfig) -> MediaCoreBuilder {
        MediaCoreBuilder {
            config,
            transports: TransportRegistry::with_builtins(),
            demuxers: DemuxerRegistry::with_builtins(),
            decoders: DecoderRegistry::with_builtins(),
        }
    }

    /// A core with the built-in transports, demuxers and decoders.
    ///
    /// # Errors
    ///
    /// See [`MediaCoreBuilder::build`].
    pub fn new(config: CoreConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub const fn config(&self) -> &CoreConfig {
        &self.config
    }

    fn handle(&self) -> Result<&Handle> {
        self.runtime
            .as_ref()
            .map(Runtime::handle)
            .ok_or_else(|| MediaCoreError::Runtime("core has been shut down".to_string()))
    }

    /// Installs the GPU provider and, if configured, the core's logging. Idempotent: later
    /// calls may replace the provider or pass `None` to keep the current one.
    ///
    /// # Errors
    ///
    /// `InitError` when no provider has ever been supplied or the log sink cannot be opened.
    pub fn init(&self, gpu: Option<Arc<dyn GpuProvider>>) -> Result<()> {
        if self.config.log.install && !self.logging_installed.swap(true, Ordering::AcqRel) {
            match logging::init_logging(&self.config.log) {
                Ok(guard) => {
                    *self.log_guard.lock().unwrap_or_else(PoisonError::into_inner) = guard;
                },
                Err(e) => {
                    self.logging_installed.store(false, Ordering::Release);
                    return Err(e);
                },
            }
        }

        let mut current = self.gpu.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(gpu) = gpu {
            *current = Some(gpu);
        }
        if current.is_none() {
            return Err(MediaCoreError::InitError("no GPU context provider supplied".to_string()));
        }
        debug!("MediaCore initialised");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.gpu.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Starts a renderer on its own thread with a context from the GPU provider.
    ///
    /// # Errors
    ///
    /// `InitError` before a successful [`init`](Self::init) or when the context fails.
    pub fn create_renderer(&self) -> Result<Arc<Renderer>> {
        let provider = self
            .gpu
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| MediaCoreError::InitError("MediaCore::init has not run".to_string()))?;
        let context = provider.create_context().map_err(|e| match e {
            MediaCoreError::InitError(_) => e,
            other => MediaCoreError::InitError(other.to_string()),
        })?;
        let renderer = Arc::new(Renderer::spawn(context, &self.config.player.render)?);
        self.renderers.insert(renderer.clone());
        Ok(renderer)
    }

    pub fn renderer(&self, id: RendererId) -> Option<Arc<Renderer>> {
        self.renderers.get(id)
    }

    pub const fn renderers(&self) -> &RendererRegistry {
        &self.renderers
    }

    /// Stops a renderer. Sessions bound to it keep playing without video output.
    ///
    /// # Errors
    ///
    /// `NoRenderer` if `id` is not a live renderer of this core.
    pub fn destroy_renderer(&self, id: RendererId) -> Result<()> {
        let renderer = self.renderers.remove(id).ok_or(MediaCoreError::NoRenderer)?;
        renderer.shutdown();
        Ok(())
    }

    /// Creates an `Idle` session.
    ///
    /// # Errors
    ///
    /// `NoRenderer` if `renderer` is not a live renderer of this core.
    pub fn create_player(
        &self,
        renderer: Option<RendererId>,
        listener: Arc<dyn PlayerListener>,
    ) -> Result<Player> {
        self.create_player_with(listener, PlayerOptions { renderer, ..PlayerOptions::default() })
    }

    /// # Errors
    ///
    /// `NoRenderer` for an unknown renderer, `Configuration` for an invalid per-session
    /// config, `Runtime` if the core has been shut down.
    pub fn create_player_with(
        &self,
        listener: Arc<dyn PlayerListener>,
        options: PlayerOptions,
    ) -> Result<Player> {
        let PlayerOptions { renderer, audio_sink, config } = options;
        let config = config.unwrap_or_else(|| self.config.player.clone());
        config.validate()?;
        if let Some(id) = renderer {
            if !self.renderers.contains(id) {
                return Err(MediaCoreError::NoRenderer);
            }
        }
        let runtime = self.handle()?;

        let id = SessionId::next();
        let shared = Arc::new(SessionShared::new(id, renderer));
        let dispatcher = Dispatcher::spawn(id, listener)?;
        let (commands_tx, commands_rx) = mpsc::channel(config.playout.command_capacity.max(1));
        let (done_tx, done_rx) = std::sync::mpsc::sync_channel(1);
        let cancel = CancellationToken::new();

        let actor = PlayoutActor::new(
            shared.clone(),
            config,
            commands_rx,
            dispatcher.sender(),
            self.renderers.clone(),
            self.stages.clone(),
            audio_sink.unwrap_or_else(|| Box::new(NullAudioSink)),
            cancel.clone(),
        );
        drop(actor.spawn(runtime, done_tx));

        self.sessions_counter.add(1, &[]);
        info!(session = %id, renderer = ?renderer.map(RendererId::as_u64), "Session created");

        Ok(Player::new(
            shared,
            commands_tx,
            self.renderers.clone(),
            self.stages.transports.clone(),
            cancel,
            done_rx,
            dispatcher,
        ))
    }

    /// An enumerator over `backend`'s devices, running capture on this core's runtime.
    ///
    /// # Errors
    ///
    /// `Runtime` if the core has been shut down.
    pub fn camera_enumerator(&self, backend: Arc<dyn CaptureBackend>) -> Result<CameraEnumerator> {
        Ok(CameraEnumerator::new(backend, self.handle()?.clone()))
    }

    /// URI schemes `Player::start` accepts.
    pub fn schemes(&self) -> Vec<String> {
        self.stages.transports.schemes()
    }

    /// Stops every renderer and the runtime. Sessions not yet destroyed are cancelled.
    /// Must not be called from inside an async context.
    pub fn shutdown(mut self) {
        self.stop_renderers();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
        }
        info!("MediaCore shut down");
    }

    fn stop_renderers(&self) {
        for renderer in self.renderers.drain() {
            renderer.shutdown();
        }
    }
}

impl Drop for MediaCore {
    fn drop(&mut self) {
        self.stop_renderers();
        if let Some(runtime) = self.runtime.take() {
            warn!("MediaCore dropped without shutdown; stopping runtime in the background");
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mediacore_core::{ErrorCode, PlayerState};

    struct Quiet;
    impl PlayerListener for Quiet {}

    fn core() -> MediaCore {
        MediaCore::new(CoreConfig::default()).unwrap()
    }

    #[test]
    fn init_requires_a_gpu_provider() {
        let core = core();
        let err = core.init(None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InitError);
        assert!(!core.is_initialized());
        assert_eq!(core.create_renderer().err().map(|e| e.code()), Some(ErrorCode::InitError));

        core.init(Some(Arc::new(HeadlessGpuProvider))).unwrap();
        // Idempotent, and `None` keeps the installed provider.
        core.init(None).unwrap();
        let renderer = core.create_renderer().unwrap();
        assert!(core.renderer(renderer.id()).is_some());
        core.destroy_renderer(renderer.id()).unwrap();
        assert_eq!(core.destroy_renderer(renderer.id()).unwrap_err().code(), ErrorCode::NoRenderer);
        core.shutdown();
    }

    #[test]
    fn start_rejects_bad_uris_synchronously() {
        let core = core();
        let player = core.create_player(None, Arc::new(Quiet)).unwrap();
        for uri in ["", "   ", "not a uri", "gopher://example.com/a"] {
            let err = player.start(uri).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidArgument, "{uri}");
        }
        assert_eq!(player.state(), PlayerState::Idle);
        player.destroy().unwrap();
        core.shutdown();
    }

    #[test]
    fn second_destroy_is_reported() {
        let core = core();
        let player = core.create_player(None, Arc::new(Quiet)).unwrap();
        player.destroy().unwrap();
        assert_eq!(player.destroy().unwrap_err().code(), ErrorCode::DoubleDestroy);
        assert_eq!(player.pause().unwrap_err().code(), ErrorCode::Internal);
        core.shutdown();
    }

    #[test]
    fn unknown_renderer_is_rejected() {
        let core = core();
        core.init(Some(Arc::new(HeadlessGpuProvider))).unwrap();
        let renderer = core.create_renderer().unwrap();
        let id = renderer.id();
        core.destroy_renderer(id).unwrap();

        let err = core.create_player(Some(id), Arc::new(Quiet)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoRenderer);

        let player = core.create_player(None, Arc::new(Quiet)).unwrap();
        assert_eq!(player.set_renderer(Some(id)).unwrap_err().code(), ErrorCode::NoRenderer);
        assert_eq!(player.capture_snapshot().unwrap_err().code(), ErrorCode::NoRenderer);
        player.destroy().unwrap();
        core.shutdown();
    }
}
