// Namespace and vector id codec.
//
// A namespace identifies one (provider, model, schema version, dimension)
// combination: `{provider}:{model}:v{schema}:{dimension}`. Vector ids embed the
// namespace so that differently shaped vectors never collide in one store.


/// Current on-disk record schema version
pub const SCHEMA_VERSION: u32 = 2;

/// Separator between the namespace and the path inside a vector id
const ID_SEPARATOR: &str = "::";

/// Separator between the path and the chunk index inside a vector id
const CHUNK_SEPARATOR: char = '#';

/// Decoded namespace components
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceParts {
    pub provider: String,
    pub model: String,
    pub schema_version: u32,
    pub dimension: usize,
}

/// Decoded vector id components
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorIdParts {
    pub namespace: String,
    pub path: String,
    pub chunk_id: u32,
}

/// Normalize a provider or model name into a namespace-safe segment.
///
/// Lowercases, drops an implicit `:latest` tag, and replaces anything outside
/// `[a-z0-9._/-]` with `-`.
#[inline]
pub fn normalize_segment(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    let untagged = lowered.strip_suffix(":latest").unwrap_or(&lowered);

    let mut normalized = String::with_capacity(untagged.len());
    for c in untagged.chars() {
        let mapped = if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/') {
            c
        } else {
            '-'
        };
        if mapped == '-' && normalized.ends_with('-') {
            continue;
        }
        normalized.push(mapped);
    }

    let trimmed = normalized.trim_matches('-');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Build the namespace key for a provider/model/schema/dimension combination
#[inline]
pub fn build_namespace(
    provider: &str,
    model: &str,
    schema_version: u32,
    dimension: usize,
) -> String {
    format!(
        "{}:{}:v{}:{}",
        normalize_segment(provider),
        normalize_segment(model),
        schema_version,
        dimension
    )
}

/// Prefix shared by every namespace of a provider/model pair, across schema versions and dimensions
#[inline]
pub fn model_prefix(provider: &str, model: &str) -> String {
    format!("{}:{}:", normalize_segment(provider), normalize_segment(model))
}

/// Parse a namespace key. Returns `None` for keys not produced by [`build_namespace`].
#[inline]
pub fn parse_namespace(namespace: &str) -> Option<NamespaceParts> {
    let parts: Vec<&str> = namespace.split(':').collect();
    let [provider, model, schema, dimension] = parts.as_slice() else {
        return None;
    };

    if provider.is_empty() || model.is_empty() {
        return None;
    }

    Some(NamespaceParts {
        provider: (*provider).to_string(),
        model: (*model).to_string(),
        schema_version: schema.strip_prefix('v')?.parse().ok()?,
        dimension: dimension.parse().ok()?,
    })
}

/// Rebuild a namespace with normalized provider/model segments and the given dimension
#[inline]
pub fn canonicalize_namespace(namespace: &str, dimension: usize) -> Option<String> {
    let parts = parse_namespace(namespace)?;
    Some(build_namespace(
        &parts.provider,
        &parts.model,
        parts.schema_version,
        dimension,
    ))
}

/// Build the primary key for one chunk vector
#[inline]
pub fn build_vector_id(namespace: &str, path: &str, chunk_id: u32) -> String {
    format!("{namespace}{ID_SEPARATOR}{path}{CHUNK_SEPARATOR}{chunk_id}")
}

/// Parse a vector id back into its components
#[inline]
pub fn parse_vector_id(id: &str) -> Option<VectorIdParts> {
    let (namespace, rest) = id.split_once(ID_SEPARATOR)?;
    let (path, chunk) = rest.rsplit_once(CHUNK_SEPARATOR)?;
    if namespace.is_empty() || path.is_empty() {
        return None;
    }

    Some(VectorIdParts {
        namespace: namespace.to_string(),
        path: path.to_string(),
        chunk_id: chunk.parse().ok()?,
    })
}

/// Half-open `[lower, upper)` string range covering every key that starts with `prefix`.
///
/// SQLite compares TEXT with memcmp, so appending the highest code point yields
/// an upper bound above every UTF-8 continuation of the prefix.
#[inline]
pub fn prefix_range(prefix: &str) -> (String, String) {
    let mut upper = String::with_capacity(prefix.len() + 4);
    upper.push_str(prefix);
    upper.push(char::MAX);
    (prefix.to_string(), upper)
}
