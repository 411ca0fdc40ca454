//! Zotero schema awareness.
//!
//! Classifies predicate names and converts between Zotero Web API JSON and
//! triples. This is the only place that knows which fields the remote accepts;
//! anything it does not recognize is kept locally and never uploaded.

use crate::remote::{RemoteChange, RemoteEntry};
use crate::triple::{Field, ItemKey, Object, Predicate, RemoteFields, SubjectKind, LOCAL_MARKER};
use serde_json::{Map, Value};

/// Creator types accepted by the Zotero schema.
pub const CREATOR_TYPES: &[&str] = &[
    "artist", "attorneyAgent", "author", "bookAuthor", "cartographer", "castMember",
    "commenter", "composer", "contributor", "cosponsor", "counsel", "director", "editor",
    "guest", "interviewee", "interviewer", "inventor", "performer", "podcaster",
    "presenter", "producer", "programmer", "recipient", "reviewedAuthor", "scriptwriter",
    "seriesEditor", "sponsor", "translator", "wordsBy",
];

/// Single-valued data fields of items, attachments, notes, annotations and
/// collections.
pub const SCALAR_FIELDS: &[&str] = &[
    "abstractNote", "accessDate", "applicationNumber", "archive", "archiveID",
    "archiveLocation", "artworkMedium", "artworkSize", "assignee", "audioFileType",
    "audioRecordingFormat", "billNumber", "blogTitle", "bookTitle", "callNumber",
    "caseName", "citationKey", "code", "codeNumber", "codePages", "codeVolume",
    "committee", "company", "conferenceName", "country", "court", "date", "dateAdded",
    "dateDecided", "dateEnacted", "dateModified", "dictionaryTitle", "distributor",
    "docketNumber", "documentNumber", "DOI", "edition", "encyclopediaTitle",
    "episodeNumber", "extra", "filingDate", "firstPage", "forumTitle", "genre", "history",
    "institution", "interviewMedium", "ISBN", "ISSN", "issue", "issueDate",
    "issuingAuthority", "itemType", "journalAbbreviation", "label", "language",
    "legalStatus", "legislativeBody", "letterType", "libraryCatalog", "manuscriptType",
    "mapType", "meetingName", "nameOfAct", "network", "number", "numberOfVolumes",
    "numPages", "pages", "patentNumber", "place", "postType", "presentationType",
    "priorityNumbers", "proceedingsTitle", "programmingLanguage", "programTitle",
    "publicationTitle", "publicLawNumber", "publisher", "references", "reporter",
    "reporterVolume", "reportNumber", "reportType", "repository", "rights", "runningTime",
    "scale", "section", "series", "seriesNumber", "seriesText", "seriesTitle", "session",
    "shortTitle", "studio", "subject", "system", "thesisType", "title", "university",
    "url", "versionNumber", "videoRecordingFormat", "volume", "websiteTitle",
    "websiteType",
    // child items
    "parentItem", "note", "linkMode", "contentType", "charset", "filename", "md5",
    "mtime", "annotationType", "annotationAuthorName", "annotationText",
    "annotationComment", "annotationColor", "annotationPageLabel",
    "annotationSortIndex", "annotationPosition",
    // collections
    "name", "parentCollection",
];

/// Relation predicates carried in the `relations` object.
pub const RELATION_PREDICATES: &[&str] = &["dc:relation", "dc:replaces", "owl:sameAs"];

/// Errors raised while reading Zotero JSON.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Zotero object is not a JSON object")]
    NotAnObject,

    #[error("Zotero object has no key")]
    MissingKey,

    #[error("Zotero object {0} has no version")]
    MissingVersion(String),
}

/// Classify a predicate name.
pub fn classify(name: &str) -> Predicate {
    if name.starts_with(LOCAL_MARKER) {
        return Predicate::Local(name.to_string());
    }
    let field = match name {
        "tag" => Field::Tag,
        "collection" => Field::Collection,
        n if CREATOR_TYPES.contains(&n) => Field::Creator(n.to_string()),
        n if RELATION_PREDICATES.contains(&n) => Field::Relation(n.to_string()),
        n if SCALAR_FIELDS.contains(&n) => Field::Scalar(n.to_string()),
        _ => return Predicate::Local(name.to_string()),
    };
    Predicate::Remote(field)
}

/// Parse one Zotero object (either the API envelope or its `data` member).
pub fn parse_object(value: &Value, kind: SubjectKind) -> Result<RemoteEntry, SchemaError> {
    let envelope = value.as_object().ok_or(SchemaError::NotAnObject)?;
    let data = envelope
        .get("data")
        .and_then(Value::as_object)
        .unwrap_or(envelope);

    let key = data
        .get("key")
        .or_else(|| envelope.get("key"))
        .and_then(Value::as_str)
        .ok_or(SchemaError::MissingKey)?;
    let version = data
        .get("version")
        .or_else(|| envelope.get("version"))
        .and_then(Value::as_u64)
        .ok_or_else(|| SchemaError::MissingVersion(key.to_string()))?;

    Ok(RemoteEntry {
        key: ItemKey::new(key),
        kind,
        version,
        change: RemoteChange::Fields(fields_from_json(data)),
    })
}

/// Convert a Zotero `data` object into remote fields.
///
/// `key` and `version` are tracked outside the triples; empty strings and
/// unknown members are dropped.
pub fn fields_from_json(data: &Map<String, Value>) -> RemoteFields {
    let mut fields = RemoteFields::new();
    for (name, value) in data {
        match name.as_str() {
            "key" | "version" => {}
            "creators" => {
                for creator in value.as_array().into_iter().flatten() {
                    if let Some((creator_type, display)) = creator_from_json(creator) {
                        fields.push(Field::Creator(creator_type), Object::Text(display));
                    }
                }
            }
            "tags" => {
                for tag in value.as_array().into_iter().flatten() {
                    if let Some(t) = tag.get("tag").and_then(Value::as_str) {
                        fields.push(Field::Tag, Object::text(t));
                    }
                }
            }
            "collections" => {
                for key in value.as_array().into_iter().flatten() {
                    if let Some(k) = key.as_str() {
                        fields.push(Field::Collection, Object::text(k));
                    }
                }
            }
            "relations" => {
                for (predicate, uris) in value.as_object().into_iter().flatten() {
                    if !RELATION_PREDICATES.contains(&predicate.as_str()) {
                        continue;
                    }
                    let uris: Vec<&str> = match uris {
                        Value::String(s) => vec![s.as_str()],
                        Value::Array(list) => list.iter().filter_map(Value::as_str).collect(),
                        _ => Vec::new(),
                    };
                    for uri in uris {
                        fields.push(Field::Relation(predicate.clone()), Object::text(uri));
                    }
                }
            }
            other => {
                if !SCALAR_FIELDS.contains(&other) {
                    tracing::trace!(field = other, "dropping unrecognized Zotero field");
                    continue;
                }
                let object = match value {
                    Value::String(s) if !s.is_empty() => Object::text(s.as_str()),
                    Value::Number(n) => match n.as_i64() {
                        Some(i) => Object::Integer(i),
                        None => Object::Text(n.to_string()),
                    },
                    // parentCollection is `false` for top-level collections
                    _ => continue,
                };
                fields.push(Field::Scalar(other.to_string()), object);
            }
        }
    }
    fields
}

fn creator_from_json(creator: &Value) -> Option<(String, String)> {
    let creator_type = creator.get("creatorType")?.as_str()?;
    if !CREATOR_TYPES.contains(&creator_type) {
        return None;
    }
    let display = match creator.get("name").and_then(Value::as_str) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!(
            "{}, {}",
            creator.get("lastName").and_then(Value::as_str).unwrap_or(""),
            creator.get("firstName").and_then(Value::as_str).unwrap_or(""),
        ),
    };
    Some((creator_type.to_string(), display))
}

/// Build the Zotero `data` object for an upload.
///
/// Only members with at least one value are emitted, so a partial update
/// leaves remote-only fields alone.
pub fn fields_to_json(kind: SubjectKind, fields: &RemoteFields) -> Value {
    let mut data = Map::new();
    let mut creators = Vec::new();
    let mut tags = Vec::new();
    let mut collections = Vec::new();
    let mut relations: Map<String, Value> = Map::new();

    for (field, object) in fields.iter() {
        let text = match object {
            Object::Text(s) => Value::String(s.clone()),
            Object::Integer(i) => Value::from(*i),
            Object::Blob(_) => continue,
        };
        match field {
            Field::Scalar(name) => {
                if kind == SubjectKind::Collection && !matches!(name.as_str(), "name" | "parentCollection") {
                    continue;
                }
                data.insert(name.clone(), text);
            }
            Field::Creator(creator_type) => {
                let display = object.to_string();
                creators.push(match display.split_once(", ") {
                    Some((last, first)) => serde_json::json!({
                        "creatorType": creator_type,
                        "lastName": last,
                        "firstName": first,
                    }),
                    None => serde_json::json!({
                        "creatorType": creator_type,
                        "name": display,
                    }),
                });
            }
            Field::Tag => tags.push(serde_json::json!({ "tag": text })),
            Field::Collection => collections.push(text),
            Field::Relation(predicate) => match relations.get_mut(predicate) {
                Some(Value::Array(list)) => list.push(text),
                _ => {
                    relations.insert(predicate.clone(), Value::Array(vec![text]));
                }
            },
        }
    }

    if kind == SubjectKind::Item {
        if !creators.is_empty() {
            data.insert("creators".into(), Value::Array(creators));
        }
        if !tags.is_empty() {
            data.insert("tags".into(), Value::Array(tags));
        }
        if !collections.is_empty() {
            data.insert("collections".into(), Value::Array(collections));
        }
    }
    if !relations.is_empty() {
        data.insert("relations".into(), Value::Object(relations));
    }
    Value::Object(data)
}
