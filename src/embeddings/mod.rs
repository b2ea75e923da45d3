// Embeddings module
// Text preprocessing, the provider abstraction, and the vector and namespace helpers
// shared by storage and search.

pub mod namespace;
pub mod preprocess;
pub mod provider;
pub mod vector_math;

pub use namespace::{
    NamespaceParts, SCHEMA_VERSION, VectorIdParts, build_namespace, build_vector_id,
    canonicalize_namespace, model_prefix, parse_namespace, parse_vector_id,
};
pub use preprocess::{ChunkingConfig, ContentPreprocessor, PreparedChunk, ProcessedContent};
pub use provider::{
    CancellationFlag, Dialect, DialectPreference, EmbedOptions, EmbeddingsProvider,
    HttpEmbeddingsProvider, InputType, ProviderError, ProviderOptions,
};
