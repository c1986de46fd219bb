//! Mapping between idents and engine resource names.

/// Prefix of every engine resource created by kvlayer.
pub const TABLE_PREFIX: &str = "table:";

/// Resource holding the persisted size statistics.
pub const SIZE_STORER_URI: &str = "table:sizeStorer";

/// Returns the engine resource name for an ident.
#[must_use]
pub fn resource_uri(ident: &str) -> String {
    format!("{TABLE_PREFIX}{ident}")
}

/// Returns the ident behind an engine resource name.
#[must_use]
pub fn ident_of(uri: &str) -> Option<&str> {
    uri.strip_prefix(TABLE_PREFIX)
}
