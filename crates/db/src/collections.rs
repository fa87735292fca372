//! Collections and framesets.
//!
//! A collection is a `collection_header` record plus `member_of` edges from
//! each member. The edge is authoritative; the scalar `collection_id` column
//! is a materialized join key the membership scan pushes down. `contains` is
//! the derived inverse and is never required on both ends. Traversal is
//! one-hop by design.

use frame_core::validation::ValidationError;
use frame_core::{Filter, Record, RecordType, Relationship, RelationshipType, escape_value};
use serde::Serialize;
use tracing::debug;

use crate::dataset::{Dataset, DbError, Result};
use crate::scan::ScanOptions;

/// Summary of one collection
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
  pub header_uuid: String,
  pub collection: String,
  pub member_count: usize,
}

impl Dataset {
  /// Insert a collection-header record
  pub async fn create_collection(&self, header: &Record) -> Result<()> {
    if header.record_type != RecordType::CollectionHeader {
      return Err(ValidationError::new("record_type", "collection header must have record_type = collection_header").into());
    }
    self.add(header).await
  }

  /// Collection headers present in the dataset
  pub async fn list_collections(&self) -> Result<Vec<Record>> {
    let filter = Filter::parse("record_type = 'collection_header'")?;
    self.scan_records(&ScanOptions::filtered(filter)).await
  }

  /// Link `member_uuid` into the collection under `header_uuid`.
  ///
  /// Writes a `member_of` edge on the member and copies the header's
  /// collection name onto it, so membership scans can push down on the
  /// `collection_id` column.
  pub async fn add_to_collection(&self, member_uuid: &str, header_uuid: &str, position: Option<i32>) -> Result<()> {
    let header = self
      .get(header_uuid, false)
      .await?
      .ok_or_else(|| DbError::NotFound(format!("collection header {}", header_uuid)))?;
    if header.record_type != RecordType::CollectionHeader {
      return Err(ValidationError::new("collection_id", format!("{} is not a collection header", header_uuid)).into());
    }

    let mut member = self
      .get(member_uuid, false)
      .await?
      .ok_or_else(|| DbError::NotFound(format!("record {}", member_uuid)))?;

    // Re-linking is idempotent: drop any existing edge to this header first
    member
      .relationships
      .retain(|r| !(r.rel_type == RelationshipType::MemberOf && r.id.as_deref() == Some(header_uuid)));
    member.relationships.push(Relationship::member_of(header_uuid));
    member.collection = header.collection.clone();
    member.collection_id = Some(header_uuid.to_string());
    member.collection_id_type = Some("uuid".to_string());
    if position.is_some() {
      member.position = position;
    }

    debug!("Linking {} into collection {}", member_uuid, header_uuid);
    self.upsert(&member).await
  }

  /// Remove `member_uuid` from the collection under `header_uuid`.
  /// Idempotent: succeeds when no edge exists.
  pub async fn remove_from_collection(&self, member_uuid: &str, header_uuid: &str) -> Result<()> {
    let Some(mut member) = self.get(member_uuid, false).await? else {
      return Ok(());
    };

    let before = member.relationships.len();
    member
      .relationships
      .retain(|r| !(r.rel_type == RelationshipType::MemberOf && r.id.as_deref() == Some(header_uuid)));
    if member.relationships.len() == before {
      return Ok(());
    }

    if member.collection_id.as_deref() == Some(header_uuid) {
      member.collection = None;
      member.collection_id = None;
      member.collection_id_type = None;
      member.position = None;
    }
    self.upsert(&member).await
  }

  /// Members of a collection: positioned members first by `position`, the
  /// rest in insertion order.
  pub async fn collection_members(&self, header_uuid: &str) -> Result<Vec<Record>> {
    if !self.exists(header_uuid).await? {
      return Err(DbError::NotFound(format!("collection header {}", header_uuid)));
    }

    let filter = Filter::parse(&format!(
      "collection_id = '{}' AND uuid != '{}'",
      escape_value(header_uuid),
      escape_value(header_uuid)
    ))?;
    let mut members: Vec<Record> = self
      .scan_records(&ScanOptions::filtered(filter))
      .await?
      .into_iter()
      // The member_of edge is authoritative; the scalar column is only a hint
      .filter(|r| r.member_of_ids().any(|id| id == header_uuid))
      .collect();
    members.sort_by_key(|r| r.position.unwrap_or(i32::MAX));
    Ok(members)
  }

  /// Header plus member count
  pub async fn collection_stats(&self, header_uuid: &str) -> Result<CollectionStats> {
    let header = self
      .get(header_uuid, false)
      .await?
      .ok_or_else(|| DbError::NotFound(format!("collection header {}", header_uuid)))?;
    let members = self.collection_members(header_uuid).await?;
    Ok(CollectionStats {
      header_uuid: header_uuid.to_string(),
      collection: header.collection.unwrap_or_default(),
      member_count: members.len(),
    })
  }

  /// Create a frameset: a synthesized answer whose `member_of` edges cite the
  /// source records, each with a short excerpt in the edge description.
  pub async fn create_frameset(
    &self,
    record: &mut Record,
    sources: &[(String, Option<String>)],
  ) -> Result<()> {
    record.record_type = RecordType::Frameset;
    for (uuid, excerpt) in sources {
      let mut edge = Relationship::member_of(uuid.clone());
      if let Some(excerpt) = excerpt {
        edge = edge.with_description(excerpt.clone());
      }
      record.relationships.push(edge);
    }
    self.add(record).await
  }

  /// Scope a filter to a collection: `collection_id = :header AND (filter)`
  pub fn collection_scope(header_uuid: &str, filter: Option<&Filter>) -> Result<Filter> {
    let scoped = match filter {
      Some(filter) => format!(
        "collection_id = '{}' AND ({})",
        escape_value(header_uuid),
        filter.as_sql()
      ),
      None => format!("collection_id = '{}'", escape_value(header_uuid)),
    };
    Ok(Filter::parse(&scoped)?)
  }
}
