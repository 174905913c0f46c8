// Shared ONNX Runtime session builder and session pool
//
// Both the product detector and the freshness classifier load their models
// through here so backend selection behaves identically for each.

use anyhow::{bail, Context, Result};
use crossbeam::channel::{bounded, Receiver, Sender};
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use ort::session::{builder::GraphOptimizationLevel, Session};
use rayon::prelude::*;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use tracing::{debug, info, warn};

#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

#[cfg(all(target_os = "macos", feature = "coreml"))]
use ort::execution_providers::CoreMLExecutionProvider;

#[cfg(all(target_os = "windows", feature = "directml"))]
use ort::execution_providers::DirectMLExecutionProvider;

#[cfg(feature = "openvino")]
use ort::execution_providers::OpenVINOExecutionProvider;

/// Thread count for CPU inference.
///
/// Windows loses throughput past ~6 intra-op threads to synchronization overhead.
fn optimal_intra_op_threads() -> usize {
    let total_cores = num_cpus::get();

    #[cfg(target_os = "windows")]
    let optimal = std::cmp::min(6, total_cores).max(1);

    #[cfg(not(target_os = "windows"))]
    let optimal = total_cores.max(1);

    debug!("CPU threads: {} total cores, using {} for inference", total_cores, optimal);
    optimal
}

/// Accelerated providers compiled into this build, in order of preference
fn accelerated_providers() -> Vec<(&'static str, ExecutionProviderDispatch)> {
    #[allow(unused_mut)]
    let mut providers = Vec::new();

    #[cfg(feature = "tensorrt")]
    providers.push(("TensorRT", TensorRTExecutionProvider::default().build()));

    #[cfg(feature = "cuda")]
    providers.push(("CUDA", CUDAExecutionProvider::default().build()));

    #[cfg(all(target_os = "macos", feature = "coreml"))]
    providers.push(("CoreML", CoreMLExecutionProvider::default().build()));

    #[cfg(all(target_os = "windows", feature = "directml"))]
    providers.push(("DirectML", DirectMLExecutionProvider::default().build()));

    #[cfg(feature = "openvino")]
    providers.push((
        "OpenVINO-CPU",
        OpenVINOExecutionProvider::default().with_device_type("CPU").build(),
    ));

    providers
}

fn commit(model_path: &Path, provider: ExecutionProviderDispatch) -> Result<Session> {
    let session = Session::builder()?
        .with_execution_providers([provider])?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(optimal_intra_op_threads())?
        .with_inter_threads(1)?
        .commit_from_file(model_path)?;
    Ok(session)
}

/// Build one session, returning (backend_name, Session)
///
/// `forced_backend` pins a provider by name (TENSORRT, CUDA, COREML, DIRECTML,
/// OPENVINO, CPU); `None` or `AUTO` tries every compiled-in accelerator before CPU.
pub fn build_session(
    model_path: &Path,
    model_name: &str,
    forced_backend: Option<&str>,
) -> Result<(String, Session)> {
    if !model_path.exists() {
        bail!(
            "{} model not found at {} (set the model path in the environment)",
            model_name,
            model_path.display()
        );
    }

    match forced_backend.map(|b| b.to_uppercase()) {
        Some(backend) if backend != "AUTO" => {
            info!("INFERENCE_BACKEND={}, forcing backend for {}", backend, model_name);
            if backend == "CPU" {
                let session = commit(model_path, CPUExecutionProvider::default().build())
                    .with_context(|| format!("Failed to load {} with CPU", model_name))?;
                return Ok(("CPU (forced)".to_string(), session));
            }

            let (name, provider) = accelerated_providers()
                .into_iter()
                .find(|(name, _)| name.to_uppercase().starts_with(&backend))
                .with_context(|| {
                    format!(
                        "Inference backend '{}' not available in this build. \
                        Rebuild with the matching cargo feature (tensorrt, cuda, coreml, directml, openvino)",
                        backend
                    )
                })?;
            let session = commit(model_path, provider)
                .with_context(|| format!("Failed to load {} with {}", model_name, name))?;
            info!("✓ Forced {} backend for {}", name, model_name);
            return Ok((format!("{} (forced)", name), session));
        }
        _ => {}
    }

    for (name, provider) in accelerated_providers() {
        match commit(model_path, provider) {
            Ok(session) => {
                info!("✓ Using {} acceleration for {}", name, model_name);
                return Ok((name.to_string(), session));
            }
            Err(e) => debug!("{} unavailable for {}: {:#}", name, model_name, e),
        }
    }

    let session = commit(model_path, CPUExecutionProvider::default().build()).with_context(|| {
        format!(
            "Failed to load {} ONNX model from {}",
            model_name,
            model_path.display()
        )
    })?;

    warn!("⚠️  Using CPU-only inference for {} (no GPU acceleration available)", model_name);
    Ok(("CPU".to_string(), session))
}

/// Fixed set of sessions for one model
///
/// Sessions need `&mut` access to run, so each inference checks one out.
pub struct OnnxSessionPool {
    sender: Sender<Session>,
    receiver: Receiver<Session>,
    backend: String,
    input_name: String,
    output_name: String,
}

impl OnnxSessionPool {
    /// Load `size` sessions of the model at `model_path`
    ///
    /// The first session picks the backend; the rest are built in parallel.
    pub fn load(
        model_path: &Path,
        model_name: &str,
        size: usize,
        forced_backend: Option<&str>,
    ) -> Result<Self> {
        let size = size.max(1);
        let (backend, first) = build_session(model_path, model_name, forced_backend)?;

        let input_name = first
            .inputs
            .first()
            .map(|input| input.name.clone())
            .with_context(|| format!("{} model declares no inputs", model_name))?;
        let output_name = first
            .outputs
            .first()
            .map(|output| output.name.clone())
            .with_context(|| format!("{} model declares no outputs", model_name))?;

        let rest: Vec<Session> = (1..size)
            .into_par_iter()
            .map(|i| {
                debug!("Creating {} session {} of {}", model_name, i + 1, size);
                build_session(model_path, model_name, forced_backend).map(|(_, session)| session)
            })
            .collect::<Result<_>>()?;

        let (sender, receiver) = bounded(size);
        for session in std::iter::once(first).chain(rest) {
            sender
                .send(session)
                .map_err(|_| anyhow::anyhow!("Failed to initialize {} session pool", model_name))?;
        }

        info!("✓ {}: {} ({} sessions)", model_name, backend, size);

        Ok(Self {
            sender,
            receiver,
            backend,
            input_name,
            output_name,
        })
    }

    /// Check out a session, blocking until one is free
    pub fn acquire(&self) -> PooledSession<'_> {
        let session = self.receiver.recv().expect("Session pool exhausted");
        PooledSession {
            session: Some(session),
            pool: self,
        }
    }

    fn release(&self, session: Session) {
        self.sender
            .send(session)
            .expect("Failed to return session to pool");
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    pub fn output_name(&self) -> &str {
        &self.output_name
    }
}

/// Session checked out of an [`OnnxSessionPool`]; returned on drop
pub struct PooledSession<'a> {
    session: Option<Session>,
    pool: &'a OnnxSessionPool,
}

impl Deref for PooledSession<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session.as_ref().expect("session present until drop")
    }
}

impl DerefMut for PooledSession<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().expect("session present until drop")
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session);
        }
    }
}
