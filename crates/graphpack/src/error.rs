//! Error types for serialization and deserialization.
//!
//! Every failure mode of the core maps to one variant of [`Error`]. No
//! error is recovered internally: any variant aborts the running call and
//! propagates to the caller, who discards the byte stream (on write) or
//! the partially constructed graph (on read).

use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The failure taxonomy of the serializer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A type on the scan path is registered with the serialization
    /// opt-out, or a custom instance carries no payload.
    #[error("type `{0}` is not serializable")]
    NotSerializable(String),

    /// A type declares 255 or more serializable fields; 255 is the wire
    /// sentinel for schema-less types and cannot be a real field count.
    #[error("type `{ty}` has {count} serializable fields, the limit is 254")]
    TooManyFields { ty: String, count: usize },

    /// A multi-dimensional array type was named; only rank-1 arrays are
    /// supported (jagged arrays are plain reference arrays).
    #[error("arrays of rank {rank} are not supported")]
    UnsupportedRank { rank: usize },

    /// A type name could not be resolved against the registry.
    #[error("unknown type `{0}`")]
    UnknownType(String),

    /// A type is registered under a name that is already taken.
    #[error("type `{0}` is already registered")]
    DuplicateType(String),

    /// A type is special (array, primitive, enum, string, custom) on one
    /// side of the stream but not on the other.
    #[error("schema mismatch for type `{0}`: special on one side only")]
    SchemaSpecialMismatch(String),

    /// Field count, field order, field name, or declared field type of a
    /// type differs between the stream and the registry.
    #[error("schema mismatch for type `{ty}`: {detail}")]
    SchemaFieldMismatch { ty: String, detail: String },

    /// A custom-serializable type in the stream has no deserialization
    /// constructor registered.
    #[error("custom type `{0}` has no deserialization constructor")]
    NoConstructor(String),

    /// The byte stream ended before a value completed.
    #[error("byte stream ended before a value completed")]
    Truncated,

    /// A registered type was used where its kind does not fit (for
    /// example allocating a value type as a heap object).
    #[error("type `{ty}` cannot be used as {wanted}")]
    InvalidKind { ty: String, wanted: &'static str },

    /// A composite type has no field with the given name.
    #[error("type `{ty}` has no field `{field}`")]
    UnknownField { ty: String, field: String },

    /// A value does not match the declared type of the field it is
    /// assigned to.
    #[error("value does not match the declared type of field `{field}` on `{ty}`")]
    FieldType { ty: String, field: String },

    /// Wire or model consistency violation: out-of-range ids, negative
    /// array lengths, cyclic type definitions, and similar.
    #[error("{0}")]
    Malformed(String),

    /// Any other I/O failure from the underlying stream.
    #[error(transparent)]
    Io(io::Error),
}

impl Error {
    /// Maps an I/O error from the byte stream, turning end-of-file into
    /// the dedicated truncation variant.
    pub(crate) fn from_io(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(err)
        }
    }

    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        Self::Malformed(detail.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eof_maps_to_truncated() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(Error::from_io(eof), Error::Truncated));
    }

    #[test]
    fn test_other_io_is_preserved() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(Error::from_io(denied), Error::Io(_)));
    }

    #[test]
    fn test_display_names_the_type() {
        let err = Error::UnknownType("demo::Gone".to_string());
        assert_eq!(err.to_string(), "unknown type `demo::Gone`");
    }
}
