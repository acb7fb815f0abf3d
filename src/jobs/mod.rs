//! Job lifecycle: model, registry, strategies, runner and the submission engine.

pub mod engine;
pub mod lane;
pub mod model;
pub mod registry;
pub mod runner;
pub mod strategy;

pub use engine::{EngineHealth, JobEngine, JobTicket};
pub use model::{Job, JobId, JobInput, JobStatus};
pub use registry::{JobEvent, JobRegistry, spawn_sweeper};
pub use runner::JobRunner;
pub use strategy::{BirthYearRule, Candidate, Disambiguator, ExtractionStrategy, Extracted};
