//! # Carewise Core
//!
//! Orchestration engine for multi-module patient analyses.
//!
//! ## Overview
//!
//! A request to analyze one patient is admitted through a priority queue,
//! fanned out to independent analysis modules by a bounded worker pool, and
//! merged into a single synthesis artifact once its modules settle:
//!
//! - **Admission**: at most one in-flight job per patient, bounded backlog
//! - **Dispatch**: per-module timeouts, a per-job deadline, cooperative cancel
//! - **Synthesis**: deterministic merge of succeeded module payloads
//! - **Batches**: one request fanned out over many patients
//!
//! ## Architecture
//!
//! - [`analysis`]: job model, queue, store, dispatcher, synthesizer, facade
//! - [`api_types`]: response envelope and pagination shared with the server
//! - [`error`]: [`OrchestratorError`] and its coarse [`ErrorKind`]
//! - [`routes`]: HTTP route paths of the versioned API
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use carewise_core::analysis::{
//!     Actor, AnalysisOrchestrator, AnalysisRequest, InMemoryPatientDirectory,
//!     JobPriority, ModuleKind, ModuleRegistry, OrchestratorConfig, PatientId,
//! };
//!
//! async fn submit() -> carewise_core::Result<()> {
//!     let orchestrator = AnalysisOrchestrator::new(
//!         OrchestratorConfig::default(),
//!         Arc::new(InMemoryPatientDirectory::new()),
//!         ModuleRegistry::new(),
//!     );
//!     orchestrator.start().await?;
//!
//!     let job = orchestrator
//!         .request_analysis(AnalysisRequest {
//!             patient_id: PatientId::try_new("patient-42")?,
//!             modules: [ModuleKind::Cognitive, ModuleKind::Biometric].into(),
//!             requested_by: Actor::new("dr-lee"),
//!             priority: JobPriority::P1,
//!         })
//!         .await?;
//!     println!("queued {}", job.id);
//!
//!     orchestrator.shutdown().await
//! }
//! ```

pub mod analysis;
pub mod api_types;
pub mod error;
pub mod routes;

pub use error::{ErrorKind, OrchestratorError, Result};
