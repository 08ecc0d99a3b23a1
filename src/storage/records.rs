//! Record transformations shared by both backends
//!
//! Backends persist the *stored* form of a record (sealed content, envelope in
//! metadata) and hand out the *revealed* form. Everything that moves a record
//! between the two lives here so the SQLite and PostgreSQL adapters cannot
//! drift apart.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::crypto::{reveal_content, seal_content, EnvelopeService};
use crate::error::Result;
use crate::types::{
    merge_metadata, ClusterChanges, DetailChanges, DetailsCluster, ClusterDetail, DocEntry,
    DocFilter, DocPatch, Importance, MemoryEntry, MemoryFilter, MemoryPatch, NewDoc, NewMemory,
    ENCRYPTED_FLAG, ENVELOPE_KEY,
};

/// Timestamps are stored as fixed-width RFC 3339 strings so they sort lexically
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            tracing::warn!("Unparseable timestamp '{}' in storage: {}", raw, e);
            DateTime::<Utc>::UNIX_EPOCH
        })
}

/// Current time at storage precision
pub(crate) fn now() -> DateTime<Utc> {
    parse_ts(&format_ts(&Utc::now()))
}

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Stored form of a new memory
pub(crate) fn memory_record(
    memory: NewMemory,
    envelope: Option<&EnvelopeService>,
    embedding: Option<Vec<f32>>,
) -> Result<MemoryEntry> {
    let now = now();
    let mut metadata = memory.metadata;
    let content = seal_content(envelope, &memory.content, &mut metadata)?;
    Ok(MemoryEntry {
        id: new_id(),
        content,
        tags: memory.tags,
        context: memory.context,
        importance: memory.importance,
        timestamp: now,
        last_accessed: now,
        access_count: 0,
        metadata,
        cluster_id: memory.cluster_id,
        embedding,
    })
}

/// Stored form of a new doc
pub(crate) fn doc_record(
    doc: NewDoc,
    envelope: Option<&EnvelopeService>,
    embedding: Option<Vec<f32>>,
) -> Result<DocEntry> {
    let now = now();
    let mut metadata = doc.metadata;
    let content = seal_content(envelope, &doc.content, &mut metadata)?;
    Ok(DocEntry {
        id: new_id(),
        url: doc.url,
        title: doc.title,
        content,
        tags: doc.tags,
        timestamp: now,
        last_fetched: now,
        access_count: 0,
        metadata,
        embedding,
    })
}

pub(crate) fn reveal_memory(envelope: Option<&EnvelopeService>, mut entry: MemoryEntry) -> MemoryEntry {
    entry.content = reveal_content(envelope, entry.content, &mut entry.metadata);
    entry
}

pub(crate) fn reveal_doc(envelope: Option<&EnvelopeService>, mut entry: DocEntry) -> DocEntry {
    entry.content = reveal_content(envelope, entry.content, &mut entry.metadata);
    entry
}

/// Revealed view of a memory that was just written, without decrypting it again
pub(crate) fn written_memory(mut stored: MemoryEntry, plaintext: String) -> MemoryEntry {
    stored.content = plaintext;
    stored.metadata.remove(ENVELOPE_KEY);
    stored
}

pub(crate) fn written_doc(mut stored: DocEntry, plaintext: String) -> DocEntry {
    stored.content = plaintext;
    stored.metadata.remove(ENVELOPE_KEY);
    stored
}

/// Replace the content of a stored record, resealing it when encryption is on.
///
/// Any previous envelope is discarded first so a record never carries stale
/// key material, and an unencrypted write clears the flag.
fn replace_content(
    envelope: Option<&EnvelopeService>,
    content: &str,
    metadata: &mut crate::types::Metadata,
) -> Result<String> {
    metadata.remove(ENCRYPTED_FLAG);
    metadata.remove(ENVELOPE_KEY);
    seal_content(envelope, content, metadata)
}

/// New content together with its recomputed vector
#[derive(Debug, Clone)]
pub(crate) struct ContentChange {
    pub content: String,
    /// `None` when the embedder was unavailable; the backfill fills it in later
    pub embedding: Option<Vec<f32>>,
}

/// Apply a validated patch to a stored memory
pub(crate) fn patch_memory(
    stored: &mut MemoryEntry,
    patch: &MemoryPatch,
    content: Option<&ContentChange>,
    envelope: Option<&EnvelopeService>,
) -> Result<()> {
    if let Some(changes) = &patch.metadata {
        merge_metadata(&mut stored.metadata, changes.clone());
    }
    if let Some(change) = content {
        stored.content = replace_content(envelope, &change.content, &mut stored.metadata)?;
        stored.embedding = change.embedding.clone();
    }
    if let Some(tags) = &patch.tags {
        stored.tags = tags.clone();
    }
    if let Some(context) = &patch.context {
        stored.context = context.clone();
    }
    if let Some(importance) = patch.importance {
        stored.importance = importance;
    }
    if let Some(cluster_id) = &patch.cluster_id {
        stored.cluster_id = cluster_id.clone();
    }
    Ok(())
}

/// Apply a validated patch to a stored doc
pub(crate) fn patch_doc(
    stored: &mut DocEntry,
    patch: &DocPatch,
    content: Option<&ContentChange>,
    envelope: Option<&EnvelopeService>,
) -> Result<()> {
    if let Some(changes) = &patch.metadata {
        merge_metadata(&mut stored.metadata, changes.clone());
    }
    if let Some(change) = content {
        stored.content = replace_content(envelope, &change.content, &mut stored.metadata)?;
        stored.embedding = change.embedding.clone();
    }
    if let Some(url) = &patch.url {
        stored.url = Some(url.clone()).filter(|u| !u.trim().is_empty());
    }
    if let Some(title) = &patch.title {
        stored.title = Some(title.clone()).filter(|t| !t.trim().is_empty());
    }
    if let Some(tags) = &patch.tags {
        stored.tags = tags.clone();
    }
    if patch.refreshes_fetch() {
        stored.last_fetched = now();
    }
    Ok(())
}

pub(crate) fn patch_cluster(cluster: &mut DetailsCluster, changes: ClusterChanges) {
    if let Some(name) = changes.name {
        cluster.name = name.trim().to_string();
    }
    if let Some(description) = changes.description {
        cluster.description = description;
    }
    if let Some(tags) = changes.tags {
        cluster.tags = crate::types::normalize_tags(tags);
    }
    if let Some(metadata) = changes.metadata {
        merge_metadata(&mut cluster.metadata, metadata);
    }
    cluster.updated_at = now();
}

pub(crate) fn patch_detail(detail: &mut ClusterDetail, changes: DetailChanges) -> Result<()> {
    if let Some(key) = changes.key {
        detail.key = key.trim().to_string();
    }
    if let Some(value) = changes.value {
        detail.value = value;
    }
    if let Some(detail_type) = changes.detail_type {
        detail.detail_type = detail_type;
    }
    if let Some(raw) = changes.importance {
        detail.importance = Importance::new(raw)?;
    }
    detail.updated_at = now();
    Ok(())
}

/// Case-insensitive substring test used once content has been decrypted
pub(crate) fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Whether a revealed memory matches the filter's content substring
pub(crate) fn memory_matches_query(entry: &MemoryEntry, query: Option<&str>) -> bool {
    query.map_or(true, |q| contains_ci(&entry.content, q))
}

/// Whether a revealed doc matches the filter's substring on content, title or url
pub(crate) fn doc_matches_query(entry: &DocEntry, query: Option<&str>) -> bool {
    query.map_or(true, |q| {
        contains_ci(&entry.content, q)
            || entry.title.as_deref().map_or(false, |t| contains_ci(t, q))
            || entry.url.as_deref().map_or(false, |u| contains_ci(u, q))
    })
}

/// Content substring of a memory selector, if any
pub(crate) fn memory_query(filter: Option<&MemoryFilter>) -> Option<&str> {
    filter.and_then(|f| f.query.as_deref())
}

pub(crate) fn doc_query(filter: Option<&DocFilter>) -> Option<&str> {
    filter.and_then(|f| f.query.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::types::{is_sealed, AddMemoryInput, MemoryChanges, Metadata};
    use serde_json::json;

    fn new_memory(content: &str) -> NewMemory {
        NewMemory::try_from(AddMemoryInput {
            content: content.to_string(),
            metadata: Metadata::from([("source".to_string(), json!("chat"))]),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = parse_ts("2026-03-01T10:00:00.000001Z");
        let later = parse_ts("2026-03-01T10:00:00.5Z");
        assert!(format_ts(&earlier) < format_ts(&later));
        assert_eq!(format_ts(&earlier), "2026-03-01T10:00:00.000001Z");
    }

    #[test]
    fn test_sealed_record_reveals_plaintext() {
        let service = EnvelopeService::new(KeyPair::generate());
        let stored = memory_record(new_memory("hello world"), Some(&service), None).unwrap();
        assert_ne!(stored.content, "hello world");
        assert!(stored.metadata.contains_key(ENVELOPE_KEY));

        let revealed = reveal_memory(Some(&service), stored);
        assert_eq!(revealed.content, "hello world");
        assert!(revealed.is_encrypted());
        assert!(!revealed.metadata.contains_key(ENVELOPE_KEY));
        assert_eq!(revealed.metadata["source"], json!("chat"));
    }

    #[test]
    fn test_content_patch_reseals() {
        let service = EnvelopeService::new(KeyPair::generate());
        let mut stored = memory_record(new_memory("first"), Some(&service), None).unwrap();
        let old_envelope = stored.metadata[ENVELOPE_KEY].clone();

        let patch = MemoryPatch::try_from(MemoryChanges {
            content: Some("second".into()),
            metadata: Some(Metadata::from([("reviewed".to_string(), json!(true))])),
            ..Default::default()
        })
        .unwrap();
        let change = ContentChange {
            content: "second".into(),
            embedding: Some(vec![0.5, 0.5]),
        };
        patch_memory(&mut stored, &patch, Some(&change), Some(&service)).unwrap();

        assert!(is_sealed(&stored.metadata));
        assert_ne!(stored.metadata[ENVELOPE_KEY], old_envelope);
        assert_eq!(stored.metadata["reviewed"], json!(true));
        assert_eq!(stored.embedding, Some(vec![0.5, 0.5]));
        assert_eq!(reveal_memory(Some(&service), stored).content, "second");
    }

    #[test]
    fn test_metadata_patch_keeps_envelope() {
        let service = EnvelopeService::new(KeyPair::generate());
        let mut stored = memory_record(new_memory("keep me"), Some(&service), None).unwrap();
        let patch = MemoryPatch::try_from(MemoryChanges {
            metadata: Some(Metadata::from([("source".to_string(), json!("email"))])),
            ..Default::default()
        })
        .unwrap();
        patch_memory(&mut stored, &patch, None, Some(&service)).unwrap();

        let revealed = reveal_memory(Some(&service), stored);
        assert_eq!(revealed.content, "keep me");
        assert_eq!(revealed.metadata["source"], json!("email"));
    }

    #[test]
    fn test_doc_query_matches_title_and_url() {
        let doc = DocEntry {
            id: "d1".into(),
            url: Some("https://docs.rs/tokio".into()),
            title: Some("Tokio Guide".into()),
            content: "runtime internals".into(),
            tags: vec![],
            timestamp: now(),
            last_fetched: now(),
            access_count: 0,
            metadata: Metadata::new(),
            embedding: None,
        };
        assert!(doc_matches_query(&doc, Some("guide")));
        assert!(doc_matches_query(&doc, Some("docs.rs")));
        assert!(doc_matches_query(&doc, Some("INTERNALS")));
        assert!(!doc_matches_query(&doc, Some("axum")));
        assert!(doc_matches_query(&doc, None));
    }
}
