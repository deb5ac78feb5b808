use serde_json::Value;

use crate::encoding::index::{encode_fields, encode_value_into};
use crate::error::{EncodingError, Error};
use crate::kv::Subspace;
use crate::types::{DELETED_FIELD, Document, LWT_FIELD, RxSchema, get_path};

/// Fields of the implicit index that serves `get_changed_documents_since`.
pub fn changes_index_fields(primary_path: &str) -> Vec<String> {
    vec![LWT_FIELD.to_string(), primary_path.to_string()]
}

/// Fields of the implicit index that serves `cleanup`.
pub fn cleanup_index_fields() -> Vec<String> {
    vec![DELETED_FIELD.to_string(), LWT_FIELD.to_string()]
}

/// Deterministic store name for an index.
pub fn index_name(fields: &[String]) -> String {
    fields.join("|")
}

/// A secondary index: its field list and the subspace holding its entries.
///
/// Entries are `indexable_string(doc) -> primary key`. The primary key is
/// appended to the encoded string unless the field list already ends with it,
/// so two documents never share an entry.
#[derive(Debug, Clone)]
pub struct IndexMeta {
    pub name: String,
    pub fields: Vec<String>,
    pub(crate) subspace: Subspace,
    primary_path: String,
    append_primary: bool,
}

impl IndexMeta {
    pub(crate) fn new(
        fields: Vec<String>,
        primary_path: &str,
        root: &Subspace,
    ) -> Result<Self, Error> {
        if fields.iter().any(|f| f.contains('\u{0}')) {
            return Err(EncodingError::NullCharInName.into());
        }
        let name = index_name(&fields);
        let subspace = root.at(&name)?;
        let append_primary = fields.last().map(String::as_str) != Some(primary_path);
        Ok(Self {
            name,
            fields,
            subspace,
            primary_path: primary_path.to_string(),
            append_primary,
        })
    }

    pub fn indexable_string(&self, doc: &Document) -> Result<String, EncodingError> {
        let mut out = encode_fields(&self.fields, doc)?;
        if self.append_primary {
            let id = get_path(doc, &self.primary_path).unwrap_or(&Value::Null);
            encode_value_into(&self.primary_path, id, &mut out)?;
        }
        Ok(out)
    }

    pub(crate) fn entry_key(&self, doc: &Document) -> Result<Vec<u8>, EncodingError> {
        Ok(self.subspace.pack(self.indexable_string(doc)?.as_bytes()))
    }
}

/// Every index a storage instance maintains for `schema`:
/// the schema's indexes and the primary key, each prefixed by `_deleted`,
/// plus the changes index and the cleanup index.
pub(crate) fn build_index_metas(
    schema: &RxSchema,
    root: &Subspace,
) -> Result<Vec<IndexMeta>, Error> {
    let primary_path = schema.primary_key.as_str();

    let mut field_lists: Vec<Vec<String>> = schema
        .indexes
        .iter()
        .cloned()
        .chain(std::iter::once(vec![primary_path.to_string()]))
        .map(|mut fields| {
            fields.insert(0, DELETED_FIELD.to_string());
            fields
        })
        .collect();
    field_lists.push(changes_index_fields(primary_path));
    field_lists.push(cleanup_index_fields());

    let mut metas: Vec<IndexMeta> = Vec::with_capacity(field_lists.len());
    for fields in field_lists {
        if metas.iter().any(|m| m.fields == fields) {
            continue;
        }
        metas.push(IndexMeta::new(fields, primary_path, root)?);
    }
    Ok(metas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn root() -> Subspace {
        Subspace::new("rxdb::db::users::0").unwrap()
    }

    #[test]
    fn test_index_set() {
        let schema = RxSchema::new("id").with_index(["age"]);
        let metas = build_index_metas(&schema, &root()).unwrap();
        let names: Vec<&str> = metas.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["_deleted|age", "_deleted|id", "_meta.lwt|id", "_deleted|_meta.lwt"]
        );
    }

    #[test]
    fn test_duplicate_definitions_collapse() {
        let schema = RxSchema::new("id").with_index(["id"]);
        let metas = build_index_metas(&schema, &root()).unwrap();
        assert_eq!(metas.len(), 3);
    }

    #[test]
    fn test_primary_suffix_makes_entries_unique() {
        let meta = IndexMeta::new(cleanup_index_fields(), "id", &root()).unwrap();
        let a = json!({"id": "a", "_deleted": true, "_meta": {"lwt": 5}});
        let b = json!({"id": "b", "_deleted": true, "_meta": {"lwt": 5}});
        let sa = meta.indexable_string(&a).unwrap();
        let sb = meta.indexable_string(&b).unwrap();
        assert_ne!(sa, sb);
        assert!(sa < sb);
    }

    #[test]
    fn test_no_suffix_when_primary_is_last() {
        let meta = IndexMeta::new(changes_index_fields("id"), "id", &root()).unwrap();
        let doc = json!({"id": "a", "_meta": {"lwt": 5}});
        assert_eq!(
            meta.indexable_string(&doc).unwrap(),
            encode_fields(&meta.fields, &doc).unwrap()
        );
    }
}
