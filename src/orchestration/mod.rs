pub mod aggregate;
pub mod batch_orchestrator;
pub mod dispatch;
pub mod router;

pub use batch_orchestrator::BatchOrchestrator;
pub use dispatch::DispatchEngine;
pub use router::AnalysisRouter;
