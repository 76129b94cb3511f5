mod analysis;
pub mod classifier;
pub mod dedup;
pub mod error;
pub mod extractor;
pub mod llm;
pub mod merger;
pub mod orchestrator;
pub mod parent;
pub mod propagator;
pub mod request;
pub mod schema;
pub mod session;
pub mod store;
pub mod traits;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;


pub use error::{IngestError, SchemaViolation};
pub use llm::OpenAiOracle;
pub use orchestrator::BatchOrchestrator;
pub use request::{IngestHints, IngestRequest, IngestResponse, ItemOutcome, ItemWarning};
pub use schema::{CompiledSchema, ExtractionSchema, TypeDescription};
pub use store::PgObjectStore;
pub use traits::{ObjectStore, Oracle, SessionTools, TextEmbedder};
