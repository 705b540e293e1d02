//! Small BSON helpers shared across the wire codec, handshake, and executor.

use bson::{Bson, Document, RawDocument, RawDocumentBuf};

use crate::error::{Error, ErrorKind, Result};

/// Returns the key of the first element of `doc`, which by the wire protocol's command-naming
/// rule (§4.1) is always the command name. Insertion order is preserved by `bson::Document`, so
/// this is just the first entry of the iterator.
pub(crate) fn first_key(doc: &Document) -> Result<&str> {
    doc.keys()
        .next()
        .map(String::as_str)
        .ok_or_else(|| ErrorKind::InvalidArgument {
            message: "command document must not be empty".into(),
        }
        .into())
}

/// Same as [`first_key`] but operating on a raw (already-encoded) document, used when parsing
/// the Type-0 section of an incoming `OP_MSG`.
pub(crate) fn first_key_raw(doc: &RawDocument) -> Result<String> {
    doc.into_iter()
        .next()
        .transpose()
        .map_err(Error::from)?
        .map(|(k, _)| k.to_string())
        .ok_or_else(|| {
            ErrorKind::InvalidResponse {
                message: "response document must not be empty".into(),
            }
            .into()
        })
}

/// Serializes `value` to a [`RawDocumentBuf`], mapping serialization failures onto
/// `ErrorKind::InvalidArgument`.
pub(crate) fn to_raw_document_buf<T: serde::Serialize>(value: &T) -> Result<RawDocumentBuf> {
    Ok(bson::to_raw_document_buf(value)?)
}

/// Merges `addition` into `target`, overwriting any keys the two share. Used when an operation's
/// command body is extended with the standard session/cluster-clock/read-preference fields
/// (§4.8 step 2).
pub(crate) fn extend_raw_document(
    target: &mut RawDocumentBuf,
    key: impl AsRef<str>,
    value: impl Into<Bson>,
) -> Result<()> {
    let bson: Bson = value.into();
    target.append(key.as_ref(), bson);
    Ok(())
}

/// Returns the serialized byte length of `value` without fully buffering it twice; used by the
/// client-metadata truncation logic (§4.4 step 2) to repeatedly check against the 512-byte cap.
pub(crate) fn document_byte_len<T: serde::Serialize>(value: &T) -> Result<usize> {
    Ok(to_raw_document_buf(value)?.as_bytes().len())
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    #[test]
    fn first_key_is_command_name() {
        let d = doc! { "find": "coll", "filter": {} };
        assert_eq!(first_key(&d).unwrap(), "find");
    }

    #[test]
    fn first_key_rejects_empty_document() {
        let d = Document::new();
        assert!(first_key(&d).is_err());
    }
}
