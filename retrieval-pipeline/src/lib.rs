pub mod answer;
pub mod pipeline;
pub mod reranking;
pub mod retriever;
pub mod scoring;
pub mod services;

pub use answer::{compose, Redactor, NO_INFORMATION_FOUND};
pub use pipeline::{answer_question, Answer, AnswerDiagnostics, RetrievalConfig, RetrievalTuning};
pub use reranking::{Evidence, RerankStrategy, Reranker};
pub use retriever::{RetrievalFilters, Retriever};
pub use services::Services;
