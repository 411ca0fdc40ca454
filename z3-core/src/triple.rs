//! Triple model for Z3 databases.
//!
//! A library is stored as `(subject, predicate, object)` facts. Subjects are
//! Zotero-style 8-character keys, predicates are either fields recognized by
//! the Zotero schema or local-only names, and objects are opaque values.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Prefix reserved for application-local predicates (never uploaded).
pub const LOCAL_MARKER: char = '.';

/// Alphabet used by Zotero for object keys (no 0/1/I/O).
const KEY_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Subject identifier: a Zotero item/collection key or the library key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemKey(String);

impl ItemKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Draw a fresh Zotero-compatible key.
    pub fn generate() -> Self {
        let bytes = *uuid::Uuid::new_v4().as_bytes();
        // bytes 6 and 8 carry the UUID version/variant bits
        let key = [0usize, 1, 2, 3, 4, 5, 10, 11]
            .iter()
            .map(|&i| KEY_ALPHABET[(bytes[i] & 0x1f) as usize] as char)
            .collect::<String>();
        Self(key)
    }

    /// Key of the library-level metadata subject (library id padded to 8).
    pub fn library(library_id: &str) -> Self {
        Self(format!("{:0>8}", library_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ItemKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for ItemKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ItemKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Remote object family a subject belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    Item,
    Collection,
    Library,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Item => "item",
            SubjectKind::Collection => "collection",
            SubjectKind::Library => "library",
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "item" => Ok(SubjectKind::Item),
            "collection" => Ok(SubjectKind::Collection),
            "library" => Ok(SubjectKind::Library),
            other => Err(format!("unknown subject kind: {}", other)),
        }
    }
}

/// A predicate recognized by the remote (Zotero) schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    /// Single-valued data field (`title`, `date`, `name`, ...).
    Scalar(String),
    /// Creator of the given creator type (`author`, `editor`, ...).
    Creator(String),
    Tag,
    /// Membership in a collection (object is the collection key).
    Collection,
    /// Zotero relation URI (`dc:relation`, `dc:replaces`, `owl:sameAs`).
    Relation(String),
}

impl Field {
    pub fn name(&self) -> &str {
        match self {
            Field::Scalar(n) | Field::Creator(n) | Field::Relation(n) => n,
            Field::Tag => "tag",
            Field::Collection => "collection",
        }
    }
}

/// Tagged predicate: recognized remote field or local-only name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Predicate {
    Remote(Field),
    Local(String),
}

impl Predicate {
    /// Classify a stored predicate name.
    pub fn parse(name: &str) -> Self {
        crate::schema::classify(name)
    }

    pub fn name(&self) -> &str {
        match self {
            Predicate::Remote(field) => field.name(),
            Predicate::Local(name) => name,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Predicate::Local(_))
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque object value of a triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Object {
    Text(String),
    Integer(i64),
    Blob(Vec<u8>),
}

impl Object {
    pub fn text(s: impl Into<String>) -> Self {
        Object::Text(s.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Object::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_blob(&self) -> bool {
        matches!(self, Object::Blob(_))
    }

    fn hash_into(&self, hasher: &mut Sha256) {
        match self {
            Object::Text(s) => {
                hasher.update([b't']);
                hasher.update(s.as_bytes());
            }
            Object::Integer(i) => {
                hasher.update([b'i']);
                hasher.update(i.to_be_bytes());
            }
            Object::Blob(b) => {
                hasher.update([b'b']);
                hasher.update((b.len() as u64).to_be_bytes());
                hasher.update(b);
            }
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Text(s) => f.write_str(s),
            Object::Integer(i) => write!(f, "{}", i),
            Object::Blob(b) => write!(f, "<blob {} bytes>", b.len()),
        }
    }
}

impl From<&str> for Object {
    fn from(s: &str) -> Self {
        Object::Text(s.to_string())
    }
}

impl From<String> for Object {
    fn from(s: String) -> Self {
        Object::Text(s)
    }
}

impl From<i64> for Object {
    fn from(i: i64) -> Self {
        Object::Integer(i)
    }
}

/// A stored fact, tagged with the store revision that wrote it.
#[derive(Debug, Clone, PartialEq)]
pub struct Triple {
    pub subject: ItemKey,
    pub predicate: Predicate,
    pub object: Object,
    pub version: u64,
}

/// Ordered predicate/object pairs of one subject.
///
/// Multi-valued predicates (creators, tags, collections) keep their order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields(Vec<(Predicate, Object)>);

impl Fields {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, predicate: Predicate, object: Object) {
        self.0.push((predicate, object));
    }

    /// Builder-style insert by predicate name.
    pub fn with(mut self, name: &str, object: impl Into<Object>) -> Self {
        self.push(Predicate::parse(name), object.into());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Predicate, Object)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All values stored under `name`, in order.
    pub fn values(&self, name: &str) -> Vec<&Object> {
        self.0
            .iter()
            .filter(|(p, _)| p.name() == name)
            .map(|(_, o)| o)
            .collect()
    }

    pub fn first_text(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(p, _)| p.name() == name)
            .and_then(|(_, o)| o.as_text())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(p, _)| p.name() == name)
    }

    pub fn predicate_names(&self) -> BTreeSet<&str> {
        self.0.iter().map(|(p, _)| p.name()).collect()
    }

    /// Group values by predicate, in order of first appearance.
    pub fn grouped(&self) -> Vec<(Predicate, Vec<Object>)> {
        let mut groups: Vec<(Predicate, Vec<Object>)> = Vec::new();
        for (p, o) in &self.0 {
            match groups.iter_mut().find(|(gp, _)| gp == p) {
                Some((_, values)) => values.push(o.clone()),
                None => groups.push((p.clone(), vec![o.clone()])),
            }
        }
        groups
    }

    pub fn from_groups(groups: Vec<(Predicate, Vec<Object>)>) -> Self {
        let mut fields = Fields::new();
        for (p, values) in groups {
            for o in values {
                fields.push(p.clone(), o);
            }
        }
        fields
    }

    /// The part of this subject that may be uploaded.
    pub fn remote_part(&self) -> RemoteFields {
        RemoteFields(
            self.0
                .iter()
                .filter_map(|(p, o)| match p {
                    Predicate::Remote(field) if !o.is_blob() => Some((field.clone(), o.clone())),
                    _ => None,
                })
                .collect(),
        )
    }

    /// Local-only predicates (never uploaded, never replaced by remote data).
    pub fn local_part(&self) -> Fields {
        Fields(
            self.0
                .iter()
                .filter(|(p, _)| p.is_local())
                .cloned()
                .collect(),
        )
    }

    /// Same facts regardless of predicate order (value order within a
    /// predicate still matters).
    pub fn same_content(&self, other: &Fields) -> bool {
        self.canonical() == other.canonical()
    }

    /// SHA-256 over the canonical form, hex encoded.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, object) in self.canonical() {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            object.hash_into(&mut hasher);
            hasher.update([0xffu8]);
        }
        hex::encode(hasher.finalize())
    }

    fn canonical(&self) -> Vec<(&str, &Object)> {
        let mut entries: Vec<(&str, &Object)> =
            self.0.iter().map(|(p, o)| (p.name(), o)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

impl FromIterator<(Predicate, Object)> for Fields {
    fn from_iter<I: IntoIterator<Item = (Predicate, Object)>>(iter: I) -> Self {
        Fields(iter.into_iter().collect())
    }
}

impl IntoIterator for Fields {
    type Item = (Predicate, Object);
    type IntoIter = std::vec::IntoIter<(Predicate, Object)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Fields recognized by the remote schema; the only thing that can be pushed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteFields(Vec<(Field, Object)>);

impl RemoteFields {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, field: Field, object: Object) {
        self.0.push((field, object));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Field, Object)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_fields(&self) -> Fields {
        self.0
            .iter()
            .map(|(f, o)| (Predicate::Remote(f.clone()), o.clone()))
            .collect()
    }

    pub fn digest(&self) -> String {
        self.to_fields().digest()
    }
}

impl FromIterator<(Field, Object)> for RemoteFields {
    fn from_iter<I: IntoIterator<Item = (Field, Object)>>(iter: I) -> Self {
        RemoteFields(iter.into_iter().collect())
    }
}
