//! Row encodings and the data-format provider registry.
//!
//! The field portion of a row record is produced by a [`RowCodec`]. Codecs
//! are looked up by a format tag in a [`ProviderRegistry`] that is filled at
//! startup; the storage configuration names the tag used for a data file.

mod binary;
mod text;

use std::collections::BTreeMap;
use std::fmt;

use bytes::BytesMut;
use ember_common::config::StorageConfig;
use ember_common::{DataType, EmberError, EmberResult, Value};

pub use binary::BinaryCodec;
pub use text::TextCodec;

/// Encodes and decodes the field values of a row.
pub trait RowCodec: Send + Sync {
    /// Format tag this codec is registered under.
    fn tag(&self) -> &'static str;

    /// Appends the encoding of `values` to `out`.
    fn encode(&self, values: &[Value], types: &[DataType], out: &mut BytesMut) -> EmberResult<()>;

    /// Decodes one row of `types.len()` fields from `buf`.
    fn decode(&self, buf: &[u8], types: &[DataType]) -> EmberResult<Vec<Value>>;

    /// Returns the encoded length of `values` in bytes.
    fn encoded_len(&self, values: &[Value], types: &[DataType]) -> EmberResult<usize> {
        let mut out = BytesMut::new();
        self.encode(values, types, &mut out)?;
        Ok(out.len())
    }
}

/// Constructor stored in the registry.
pub type CodecConstructor = fn(&StorageConfig) -> Box<dyn RowCodec>;

/// Maps format tags to codec constructors.
///
/// # Example
///
/// ```rust
/// use ember_common::config::StorageConfig;
/// use ember_storage::codec::ProviderRegistry;
///
/// let registry = ProviderRegistry::with_defaults();
/// let codec = registry.create("text", &StorageConfig::default()).unwrap();
/// assert_eq!(codec.tag(), "text");
/// ```
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    constructors: BTreeMap<String, CodecConstructor>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in `binary` and `text` formats.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(BinaryCodec::TAG, |_| Box::new(BinaryCodec));
        registry.register(TextCodec::TAG, |_| Box::new(TextCodec::default()));
        registry
    }

    /// Registers `constructor` under `tag`, replacing any previous entry.
    pub fn register(&mut self, tag: impl Into<String>, constructor: CodecConstructor) {
        self.constructors.insert(tag.into(), constructor);
    }

    /// Returns true if `tag` is registered.
    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }

    /// Builds the codec registered under `tag`.
    pub fn create(&self, tag: &str, config: &StorageConfig) -> EmberResult<Box<dyn RowCodec>> {
        self.constructors
            .get(tag)
            .map(|ctor| ctor(config))
            .ok_or_else(|| EmberError::not_supported(format!("data format '{}'", tag)))
    }

    /// Registered tags in sorted order.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tags()).finish()
    }
}

fn corrupt(what: &str) -> EmberError {
    EmberError::corruption(format!("row data: {}", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tags() {
        let registry = ProviderRegistry::with_defaults();
        let tags: Vec<_> = registry.tags().collect();
        assert_eq!(tags, vec!["binary", "text"]);
    }

    #[test]
    fn test_unknown_tag() {
        let registry = ProviderRegistry::with_defaults();
        let err = registry
            .create("xls", &StorageConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.code(), ember_common::ErrorCode::NotSupported);
    }

    #[test]
    fn test_register_custom() {
        let mut registry = ProviderRegistry::new();
        assert!(!registry.contains("binary"));
        registry.register("raw", |_| Box::new(BinaryCodec));
        let codec = registry.create("raw", &StorageConfig::default()).unwrap();
        assert_eq!(codec.tag(), "binary");
    }
}
