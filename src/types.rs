//! Core types for memvault

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{Result, VaultError};

/// Unique identifier for a memory (UUID v4 string)
pub type MemoryId = String;
/// Unique identifier for a doc
pub type DocId = String;
/// Unique identifier for a details cluster
pub type ClusterId = String;
/// Unique identifier for a cluster detail
pub type DetailId = String;

/// Open key/value metadata attached to records
pub type Metadata = HashMap<String, serde_json::Value>;

/// Metadata key holding the at-rest encryption flag
pub const ENCRYPTED_FLAG: &str = "encrypted";
/// Metadata key holding the wrapped-key material of a sealed record
pub const ENVELOPE_KEY: &str = "envelope";

const RESERVED_METADATA_KEYS: [&str; 2] = [ENCRYPTED_FLAG, ENVELOPE_KEY];

/// Importance score, always within 1..=10
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Importance(u8);

impl Importance {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;

    /// Validate a raw importance value. Out-of-range values are rejected, not clamped.
    pub fn new(value: i64) -> Result<Self> {
        if (Self::MIN as i64..=Self::MAX as i64).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(VaultError::InvalidInput(format!(
                "importance must be between {} and {}, got {}",
                Self::MIN,
                Self::MAX,
                value
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Importance {
    fn default() -> Self {
        Self(5)
    }
}

impl TryFrom<i64> for Importance {
    type Error = VaultError;

    fn try_from(value: i64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Importance> for i64 {
    fn from(value: Importance) -> Self {
        value.0 as i64
    }
}

/// A memory entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub id: MemoryId,
    /// Plaintext content (sealed content never leaves a backend)
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub importance: Importance,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub access_count: i64,
    #[serde(default)]
    pub metadata: Metadata,
    /// Weak reference to a details cluster
    pub cluster_id: Option<ClusterId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryEntry {
    /// Whether the stored form of this record is sealed
    pub fn is_encrypted(&self) -> bool {
        is_sealed(&self.metadata)
    }
}

/// A development documentation entry, kept apart from memories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocEntry {
    pub id: DocId,
    pub url: Option<String>,
    pub title: Option<String>,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub last_fetched: DateTime<Utc>,
    #[serde(default)]
    pub access_count: i64,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl DocEntry {
    pub fn is_encrypted(&self) -> bool {
        is_sealed(&self.metadata)
    }
}

/// Declared type of a cluster detail value. Advisory only: values are never parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DetailType {
    #[default]
    Text,
    Number,
    Date,
    List,
    Json,
}

impl DetailType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetailType::Text => "text",
            DetailType::Number => "number",
            DetailType::Date => "date",
            DetailType::List => "list",
            DetailType::Json => "json",
        }
    }
}

impl std::str::FromStr for DetailType {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" => Ok(DetailType::Text),
            "number" => Ok(DetailType::Number),
            "date" => Ok(DetailType::Date),
            "list" => Ok(DetailType::List),
            "json" => Ok(DetailType::Json),
            other => Err(VaultError::InvalidInput(format!(
                "unknown detail type: {}",
                other
            ))),
        }
    }
}

/// A key/value detail owned by a cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetail {
    pub id: DetailId,
    pub cluster_id: ClusterId,
    pub key: String,
    pub value: String,
    #[serde(rename = "type")]
    pub detail_type: DetailType,
    pub importance: Importance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named grouping of details that memories may reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailsCluster {
    pub id: ClusterId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Ordered by creation
    #[serde(default)]
    pub details: Vec<ClusterDetail>,
}

/// A memory with its similarity to a query vector
#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    pub entry: MemoryEntry,
    pub score: f32,
}

/// A doc with its similarity to a query vector
#[derive(Debug, Clone, Serialize)]
pub struct ScoredDoc {
    pub entry: DocEntry,
    pub score: f32,
}

/// Result of an `add_memory` call through the readiness gate
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AddMemoryOutcome {
    /// Written to the backend
    Stored(MemoryEntry),
    /// Appended to the write-ahead log; applied once the backend is ready
    Queued {
        #[serde(rename = "queuedAt")]
        queued_at: DateTime<Utc>,
    },
}

// ============================================================================
// Inputs
// ============================================================================

/// Input for creating a new memory, as received from callers and queued on disk
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddMemoryInput {
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub context: Option<String>,
    /// Raw importance, validated into [`Importance`] (default 5)
    #[serde(default)]
    pub importance: Option<i64>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub cluster_id: Option<ClusterId>,
}

/// A validated memory ready to be persisted
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub content: String,
    pub tags: Vec<String>,
    pub context: String,
    pub importance: Importance,
    pub metadata: Metadata,
    pub cluster_id: Option<ClusterId>,
}

impl TryFrom<AddMemoryInput> for NewMemory {
    type Error = VaultError;

    fn try_from(input: AddMemoryInput) -> Result<Self> {
        let content = require_content(input.content)?;
        let importance = match input.importance {
            Some(raw) => Importance::new(raw)?,
            None => Importance::default(),
        };
        Ok(Self {
            content,
            tags: normalize_tags(input.tags),
            context: input.context.unwrap_or_default().trim().to_string(),
            importance,
            metadata: sanitize_metadata(input.metadata),
            cluster_id: input.cluster_id.filter(|c| !c.trim().is_empty()),
        })
    }
}

/// Input for creating a doc
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AddDocInput {
    pub url: Option<String>,
    pub title: Option<String>,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A validated doc ready to be persisted
#[derive(Debug, Clone)]
pub struct NewDoc {
    pub url: Option<String>,
    pub title: Option<String>,
    pub content: String,
    pub tags: Vec<String>,
    pub metadata: Metadata,
}

impl TryFrom<AddDocInput> for NewDoc {
    type Error = VaultError;

    fn try_from(input: AddDocInput) -> Result<Self> {
        Ok(Self {
            url: non_blank(input.url),
            title: non_blank(input.title),
            content: require_content(input.content)?,
            tags: normalize_tags(input.tags),
            metadata: sanitize_metadata(input.metadata),
        })
    }
}

/// Requested changes to matching memories
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MemoryChanges {
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub context: Option<String>,
    pub importance: Option<i64>,
    /// Shallow-merged into existing metadata
    pub metadata: Option<Metadata>,
    /// `Some(None)` clears the cluster link
    #[serde(default, deserialize_with = "deserialize_some")]
    pub cluster_id: Option<Option<ClusterId>>,
}

/// Validated form of [`MemoryChanges`]
#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub context: Option<String>,
    pub importance: Option<Importance>,
    pub metadata: Option<Metadata>,
    pub cluster_id: Option<Option<ClusterId>>,
}

impl TryFrom<MemoryChanges> for MemoryPatch {
    type Error = VaultError;

    fn try_from(changes: MemoryChanges) -> Result<Self> {
        let patch = Self {
            content: changes.content.map(require_content).transpose()?,
            tags: changes.tags.map(normalize_tags),
            context: changes.context.map(|c| c.trim().to_string()),
            importance: changes.importance.map(Importance::new).transpose()?,
            metadata: changes.metadata.map(sanitize_metadata),
            cluster_id: changes.cluster_id,
        };
        if patch.content.is_none()
            && patch.tags.is_none()
            && patch.context.is_none()
            && patch.importance.is_none()
            && patch.metadata.is_none()
            && patch.cluster_id.is_none()
        {
            return Err(VaultError::InvalidInput(
                "update requires at least one change".to_string(),
            ));
        }
        Ok(patch)
    }
}

/// Requested changes to matching docs
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DocChanges {
    pub url: Option<String>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<Metadata>,
}

/// Validated form of [`DocChanges`]
#[derive(Debug, Clone, Default)]
pub struct DocPatch {
    pub url: Option<String>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<Metadata>,
}

impl DocPatch {
    /// Whether this patch counts as a re-fetch of the document
    pub fn refreshes_fetch(&self) -> bool {
        self.content.is_some() || self.url.is_some()
    }
}

impl TryFrom<DocChanges> for DocPatch {
    type Error = VaultError;

    fn try_from(changes: DocChanges) -> Result<Self> {
        let patch = Self {
            url: changes.url,
            title: changes.title,
            content: changes.content.map(require_content).transpose()?,
            tags: changes.tags.map(normalize_tags),
            metadata: changes.metadata.map(sanitize_metadata),
        };
        if patch.url.is_none()
            && patch.title.is_none()
            && patch.content.is_none()
            && patch.tags.is_none()
            && patch.metadata.is_none()
        {
            return Err(VaultError::InvalidInput(
                "update requires at least one change".to_string(),
            ));
        }
        Ok(patch)
    }
}

// ============================================================================
// Filters and selectors
// ============================================================================

/// Narrows a bulk update or delete
pub trait FilterSpec {
    /// Drop blank strings and tags so they do not count as criteria
    fn normalized(self) -> Self;

    /// True when no criterion is set
    fn is_empty(&self) -> bool;

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Filter over memories. Criteria are ANDed; tags are ORed among themselves.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MemoryFilter {
    pub id: Option<MemoryId>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub context: Option<String>,
    /// Substring of content
    pub query: Option<String>,
    pub min_importance: Option<i64>,
    /// Only records created strictly before this instant
    pub before: Option<DateTime<Utc>>,
}

impl FilterSpec for MemoryFilter {
    fn normalized(self) -> Self {
        Self {
            id: non_blank(self.id),
            tags: normalize_tags(self.tags),
            context: non_blank(self.context),
            query: non_blank(self.query),
            ..self
        }
    }

    fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.tags.is_empty()
            && self.context.is_none()
            && self.query.is_none()
            && self.min_importance.is_none()
            && self.before.is_none()
    }

    fn validate(&self) -> Result<()> {
        if let Some(raw) = self.min_importance {
            Importance::new(raw)?;
        }
        Ok(())
    }
}

/// Filter over docs
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DocFilter {
    pub id: Option<DocId>,
    pub url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Substring of content, title or url
    pub query: Option<String>,
    pub before: Option<DateTime<Utc>>,
}

impl FilterSpec for DocFilter {
    fn normalized(self) -> Self {
        Self {
            id: non_blank(self.id),
            url: non_blank(self.url),
            tags: normalize_tags(self.tags),
            query: non_blank(self.query),
            ..self
        }
    }

    fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.url.is_none()
            && self.tags.is_empty()
            && self.query.is_none()
            && self.before.is_none()
    }
}

/// Target of a bulk update or delete.
///
/// `Everything` can only be obtained with an explicit force flag, so backends
/// never see an accidental unfiltered request.
#[derive(Debug, Clone)]
pub enum Selector<F> {
    Everything,
    Matching(F),
}

impl<F: FilterSpec> Selector<F> {
    pub fn new(filter: F, force: bool, operation: &'static str) -> Result<Self> {
        let filter = filter.normalized();
        filter.validate()?;
        if !filter.is_empty() {
            Ok(Selector::Matching(filter))
        } else if force {
            Ok(Selector::Everything)
        } else {
            Err(VaultError::UnfilteredOperation(operation))
        }
    }

    pub fn filter(&self) -> Option<&F> {
        match self {
            Selector::Everything => None,
            Selector::Matching(filter) => Some(filter),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMemoriesInput {
    #[serde(flatten)]
    pub filter: MemoryFilter,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMemoriesInput {
    #[serde(flatten)]
    pub filter: MemoryFilter,
    pub changes: MemoryChanges,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDocsInput {
    #[serde(flatten)]
    pub filter: DocFilter,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDocsInput {
    #[serde(flatten)]
    pub filter: DocFilter,
    pub changes: DocChanges,
    #[serde(default)]
    pub force: bool,
}

// ============================================================================
// Queries
// ============================================================================

/// Memory fields to sort by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum MemorySortField {
    #[default]
    Timestamp,
    Importance,
    LastAccessed,
    AccessCount,
}

impl MemorySortField {
    /// Column name, shared by both backends
    pub fn column(&self) -> &'static str {
        match self {
            MemorySortField::Timestamp => "timestamp",
            MemorySortField::Importance => "importance",
            MemorySortField::LastAccessed => "lastAccessed",
            MemorySortField::AccessCount => "accessCount",
        }
    }
}

/// Doc fields to sort by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum DocSortField {
    #[default]
    Timestamp,
    LastFetched,
    AccessCount,
}

impl DocSortField {
    pub fn column(&self) -> &'static str {
        match self {
            DocSortField::Timestamp => "timestamp",
            DocSortField::LastFetched => "lastFetched",
            DocSortField::AccessCount => "accessCount",
        }
    }
}

/// Sort order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Options for searching memories
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MemoryQuery {
    pub query: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub context: Option<String>,
    pub min_importance: Option<i64>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub sort_by: MemorySortField,
    #[serde(default)]
    pub sort_order: SortOrder,
}

impl MemoryQuery {
    pub fn validate(&self) -> Result<()> {
        if let Some(raw) = self.min_importance {
            Importance::new(raw)?;
        }
        validate_limit(self.limit)
    }

    /// The equivalent filter, used to share SQL between search and bulk ops
    pub fn as_filter(&self) -> MemoryFilter {
        MemoryFilter {
            id: None,
            tags: self.tags.clone(),
            context: self.context.clone(),
            query: self.query.clone(),
            min_importance: self.min_importance,
            before: None,
        }
    }
}

/// Options for searching docs
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DocQuery {
    pub query: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub sort_by: DocSortField,
    #[serde(default)]
    pub sort_order: SortOrder,
}

impl DocQuery {
    pub fn validate(&self) -> Result<()> {
        validate_limit(self.limit)
    }

    pub fn as_filter(&self) -> DocFilter {
        DocFilter {
            tags: self.tags.clone(),
            query: self.query.clone(),
            ..Default::default()
        }
    }
}

/// Options for listing clusters
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterQuery {
    /// Substring of name or description
    pub query: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub limit: Option<usize>,
}

/// Similarity search against a precomputed query vector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticQuery {
    pub vector: Vec<f32>,
    #[serde(default = "default_semantic_limit")]
    pub limit: usize,
    pub min_score: Option<f32>,
}

fn default_semantic_limit() -> usize {
    10
}

impl SemanticQuery {
    pub fn new(vector: Vec<f32>, limit: usize) -> Self {
        Self {
            vector,
            limit,
            min_score: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.vector.is_empty() {
            return Err(VaultError::InvalidInput(
                "query vector must not be empty".to_string(),
            ));
        }
        validate_limit(Some(self.limit))
    }
}

// ============================================================================
// Cluster inputs
// ============================================================================

/// Input for a new cluster detail
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DetailInput {
    pub key: String,
    pub value: String,
    #[serde(rename = "type", default)]
    pub detail_type: DetailType,
    pub importance: Option<i64>,
}

/// Input for creating a cluster, optionally with initial details
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateClusterInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub details: Vec<DetailInput>,
}

/// Requested changes to a cluster
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    /// Shallow-merged into existing metadata
    pub metadata: Option<Metadata>,
}

/// Requested changes to a cluster detail
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DetailChanges {
    pub key: Option<String>,
    pub value: Option<String>,
    #[serde(rename = "type")]
    pub detail_type: Option<DetailType>,
    pub importance: Option<i64>,
}

/// Outcome of deleting a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDeletion {
    pub cluster_id: ClusterId,
    pub detached_memories: usize,
    pub deleted_details: usize,
}

impl CreateClusterInput {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(VaultError::InvalidInput(
                "cluster name must not be empty".to_string(),
            ));
        }
        self.details.iter().try_for_each(DetailInput::validate)
    }
}

impl DetailInput {
    pub fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(VaultError::InvalidInput(
                "detail key must not be empty".to_string(),
            ));
        }
        if let Some(raw) = self.importance {
            Importance::new(raw)?;
        }
        Ok(())
    }

    pub fn importance(&self) -> Importance {
        self.importance
            .and_then(|raw| Importance::new(raw).ok())
            .unwrap_or_default()
    }
}

impl ClusterChanges {
    pub fn validate(&self) -> Result<()> {
        if matches!(&self.name, Some(name) if name.trim().is_empty()) {
            return Err(VaultError::InvalidInput(
                "cluster name must not be empty".to_string(),
            ));
        }
        if self.name.is_none()
            && self.description.is_none()
            && self.tags.is_none()
            && self.metadata.is_none()
        {
            return Err(VaultError::InvalidInput(
                "update requires at least one change".to_string(),
            ));
        }
        Ok(())
    }
}

impl DetailChanges {
    pub fn validate(&self) -> Result<()> {
        if matches!(&self.key, Some(key) if key.trim().is_empty()) {
            return Err(VaultError::InvalidInput(
                "detail key must not be empty".to_string(),
            ));
        }
        if let Some(raw) = self.importance {
            Importance::new(raw)?;
        }
        if self.key.is_none()
            && self.value.is_none()
            && self.detail_type.is_none()
            && self.importance.is_none()
        {
            return Err(VaultError::InvalidInput(
                "update requires at least one change".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Trim, drop blanks and de-duplicate tags, keeping first-seen order
pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

/// Remove keys that only the encryption envelope may write
pub fn sanitize_metadata(mut metadata: Metadata) -> Metadata {
    for key in RESERVED_METADATA_KEYS {
        if metadata.remove(key).is_some() {
            tracing::debug!("Dropped reserved metadata key '{}' from caller input", key);
        }
    }
    metadata
}

/// Whether metadata carries a true encryption flag
pub fn is_sealed(metadata: &Metadata) -> bool {
    metadata
        .get(ENCRYPTED_FLAG)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Shallow-merge `changes` into `base`
pub fn merge_metadata(base: &mut Metadata, changes: Metadata) {
    base.extend(changes);
}

fn require_content(content: String) -> Result<String> {
    if content.trim().is_empty() {
        return Err(VaultError::InvalidInput(
            "content must not be empty".to_string(),
        ));
    }
    Ok(content)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn validate_limit(limit: Option<usize>) -> Result<()> {
    if limit == Some(0) {
        return Err(VaultError::InvalidInput(
            "limit must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

/// Distinguish an absent field (`None`) from an explicit null (`Some(None)`)
fn deserialize_some<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_importance_rejects_out_of_range() {
        assert!(Importance::new(15).is_err());
        assert!(Importance::new(0).is_err());
        assert!(Importance::new(-3).is_err());
        assert_eq!(Importance::new(10).unwrap().get(), 10);
        assert_eq!(Importance::default().get(), 5);
    }

    #[test]
    fn test_importance_deserialization_validates() {
        let ok: Importance = serde_json::from_value(json!(7)).unwrap();
        assert_eq!(ok.get(), 7);
        assert!(serde_json::from_value::<Importance>(json!(15)).is_err());
        assert!(serde_json::from_value::<Importance>(json!("high")).is_err());
    }

    #[test]
    fn test_new_memory_validation() {
        let input = AddMemoryInput {
            content: "remember the milk".to_string(),
            tags: vec![" a ".into(), "b".into(), "a".into(), "".into()],
            metadata: Metadata::from([
                ("encrypted".to_string(), json!(true)),
                ("source".to_string(), json!("chat")),
            ]),
            ..Default::default()
        };
        let memory = NewMemory::try_from(input).unwrap();
        assert_eq!(memory.tags, vec!["a", "b"]);
        assert_eq!(memory.importance.get(), 5);
        assert!(!memory.metadata.contains_key("encrypted"));
        assert_eq!(memory.metadata["source"], json!("chat"));

        let blank = AddMemoryInput {
            content: "   ".to_string(),
            ..Default::default()
        };
        assert!(NewMemory::try_from(blank).is_err());

        let too_important = AddMemoryInput {
            content: "x".to_string(),
            importance: Some(15),
            ..Default::default()
        };
        assert!(matches!(
            NewMemory::try_from(too_important),
            Err(VaultError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_selector_requires_filter_or_force() {
        let err = Selector::new(MemoryFilter::default(), false, "delete_memories").unwrap_err();
        assert!(matches!(err, VaultError::UnfilteredOperation("delete_memories")));

        assert!(matches!(
            Selector::new(MemoryFilter::default(), true, "delete_memories").unwrap(),
            Selector::Everything
        ));

        let filter = MemoryFilter {
            context: Some("work".into()),
            ..Default::default()
        };
        assert!(matches!(
            Selector::new(filter, false, "delete_memories").unwrap(),
            Selector::Matching(_)
        ));
    }

    #[test]
    fn test_blank_criteria_do_not_count_as_a_filter() {
        let blank = MemoryFilter {
            id: Some(String::new()),
            query: Some("".into()),
            context: Some("   ".into()),
            tags: vec!["".into(), " ".into()],
            ..Default::default()
        };
        let err = Selector::new(blank.clone(), false, "update_memories").unwrap_err();
        assert!(matches!(err, VaultError::UnfilteredOperation("update_memories")));
        assert!(matches!(
            Selector::new(blank, true, "update_memories").unwrap(),
            Selector::Everything
        ));

        let blank_doc = DocFilter {
            url: Some(" ".into()),
            query: Some(String::new()),
            ..Default::default()
        };
        assert!(Selector::new(blank_doc, false, "delete_docs").is_err());

        let padded = MemoryFilter {
            query: Some("".into()),
            tags: vec![" work ".into()],
            ..Default::default()
        };
        match Selector::new(padded, false, "delete_memories").unwrap() {
            Selector::Matching(filter) => {
                assert_eq!(filter.query, None);
                assert_eq!(filter.tags, vec!["work".to_string()]);
            }
            Selector::Everything => panic!("tag filter should be kept"),
        }
    }

    #[test]
    fn test_cluster_id_patch_distinguishes_null() {
        let absent: MemoryChanges = serde_json::from_value(json!({"context": "x"})).unwrap();
        assert_eq!(absent.cluster_id, None);

        let cleared: MemoryChanges = serde_json::from_value(json!({"clusterId": null})).unwrap();
        assert_eq!(cleared.cluster_id, Some(None));

        let set: MemoryChanges = serde_json::from_value(json!({"clusterId": "c1"})).unwrap();
        assert_eq!(set.cluster_id, Some(Some("c1".to_string())));
    }

    #[test]
    fn test_empty_patch_rejected() {
        assert!(MemoryPatch::try_from(MemoryChanges::default()).is_err());
        assert!(DocPatch::try_from(DocChanges::default()).is_err());
    }
}
