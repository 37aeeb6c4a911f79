pub mod api;
pub mod cache;
pub mod engine;
pub mod templates;

pub use api::{router, ApiError};
pub use cache::MemoryCache;
pub use engine::{ChunkReceipt, KnowledgeEngine};
pub use templates::{TemplateRenderer, TopicSnapshot};
