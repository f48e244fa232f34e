use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use uuid::Uuid;
use zlv_core::{
    address_tokens, normalize_text, HousingOwnerConflict, HousingOwnerLink, OwnerConflict,
    OwnerIdentity, OwnerPatch, OwnerRecord, OWNER_NAMESPACE,
};

use crate::similarity::blocking_key;

/// Which side wins when a persisted field and an incoming field disagree.
/// Empty persisted fields are filled either way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPriority {
    #[default]
    KeepExisting,
    PreferIncoming,
}

/// Patch to apply to the matched owner plus the divergence to record, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerMerge {
    pub patch: OwnerPatch,
    pub conflict: Option<OwnerConflict>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkDecision {
    Unchanged,
    /// Non-sensitive columns changed; safe to overwrite.
    Update(HousingOwnerLink),
    Conflict {
        conflict: HousingOwnerConflict,
        update: Option<HousingOwnerLink>,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector {
    priority: FieldPriority,
}

impl ConflictDetector {
    pub fn new(priority: FieldPriority) -> Self {
        Self { priority }
    }

    pub fn merge_owner(
        &self,
        existing: &OwnerIdentity,
        incoming: &OwnerRecord,
        now: DateTime<Utc>,
    ) -> OwnerMerge {
        let prefer_incoming = self.priority == FieldPriority::PreferIncoming;
        let mut patch = OwnerPatch::default();
        let mut divergent = Vec::new();
        let mut existing_values = Map::new();
        let mut incoming_values = Map::new();

        let name_differs = normalize_text(&existing.full_name) != normalize_text(&incoming.full_name);
        if existing.full_name.trim().is_empty() {
            patch.full_name = Some(incoming.full_name.clone());
        } else if name_differs {
            divergent.push("full_name");
            existing_values.insert("full_name".into(), json!(existing.full_name));
            incoming_values.insert("full_name".into(), json!(incoming.full_name));
            if prefer_incoming {
                patch.full_name = Some(incoming.full_name.clone());
            }
        }

        if !incoming.raw_address.is_empty() {
            if existing.raw_address.is_empty() {
                patch.raw_address = Some(incoming.raw_address.clone());
            } else if address_tokens(&existing.raw_address) != address_tokens(&incoming.raw_address) {
                divergent.push("raw_address");
                existing_values.insert("raw_address".into(), json!(existing.raw_address));
                incoming_values.insert("raw_address".into(), json!(incoming.raw_address));
                if prefer_incoming {
                    patch.raw_address = Some(incoming.raw_address.clone());
                }
            }
        }

        match (existing.birth_date, incoming.birth_date) {
            (None, Some(date)) => patch.birth_date = Some(date),
            (Some(old), Some(new)) if old != new => {
                divergent.push("birth_date");
                existing_values.insert("birth_date".into(), json!(old));
                incoming_values.insert("birth_date".into(), json!(new));
                if prefer_incoming {
                    patch.birth_date = Some(new);
                }
            }
            _ => {}
        }

        match (existing.kind, incoming.kind) {
            (None, Some(kind)) => patch.kind = Some(kind),
            (Some(old), Some(new)) if old != new => {
                divergent.push("kind");
                existing_values.insert("kind".into(), json!(old));
                incoming_values.insert("kind".into(), json!(new));
                if prefer_incoming {
                    patch.kind = Some(new);
                }
            }
            _ => {}
        }

        match (&existing.siren, &incoming.siren) {
            (None, Some(siren)) => patch.siren = Some(siren.clone()),
            (Some(old), Some(new)) if normalize_text(old) != normalize_text(new) => {
                divergent.push("siren");
                existing_values.insert("siren".into(), json!(old));
                incoming_values.insert("siren".into(), json!(new));
                if prefer_incoming {
                    patch.siren = Some(new.clone());
                }
            }
            _ => {}
        }

        if existing.idpersonne.is_none() {
            patch.idpersonne = incoming.idpersonne.clone();
        }
        // the bucket follows the stored name and address
        let merged = OwnerRecord {
            idpersonne: patch.idpersonne.clone().or_else(|| existing.idpersonne.clone()),
            full_name: patch
                .full_name
                .clone()
                .unwrap_or_else(|| existing.full_name.clone()),
            raw_address: patch
                .raw_address
                .clone()
                .unwrap_or_else(|| existing.raw_address.clone()),
            birth_date: None,
            kind: None,
            siren: None,
            data_source: None,
        };
        let merged_key = blocking_key(&merged);
        if merged_key.is_some() && merged_key != existing.blocking_key {
            patch.blocking_key = merged_key;
        }
        let take_source =
            existing.data_source.is_none() || (prefer_incoming && incoming.data_source.is_some());
        if take_source && incoming.data_source != existing.data_source {
            patch.data_source = incoming.data_source.clone();
        }

        let conflict = (!divergent.is_empty()).then(|| {
            let replacement = serde_json::to_value(incoming).unwrap_or_default();
            OwnerConflict {
                id: conflict_id("owner", existing.id, &replacement),
                existing_owner_id: existing.id,
                fields: divergent.iter().map(ToString::to_string).collect(),
                existing: json!({
                    "owner": serde_json::to_value(existing).unwrap_or_default(),
                    "fields": existing_values,
                }),
                replacement: json!({
                    "record": replacement,
                    "fields": incoming_values,
                }),
                created_at: now,
            }
        });

        OwnerMerge { patch, conflict }
    }

    /// Rank and property right are authoritative; a change to either is
    /// recorded instead of applied unless incoming data is preferred.
    pub fn compare_link(
        &self,
        existing: &HousingOwnerLink,
        incoming: &HousingOwnerLink,
        now: DateTime<Utc>,
    ) -> LinkDecision {
        if existing == incoming {
            return LinkDecision::Unchanged;
        }
        if existing.rank == incoming.rank && existing.property_right == incoming.property_right {
            return LinkDecision::Update(incoming.clone());
        }
        let replacement = serde_json::to_value(incoming).unwrap_or_default();
        let conflict = HousingOwnerConflict {
            id: conflict_id("housing_owner", existing.owner_id, &replacement),
            owner_id: existing.owner_id,
            geo_code: existing.geo_code.clone(),
            local_id: existing.local_id.clone(),
            existing: serde_json::to_value(existing).unwrap_or_default(),
            replacement,
            created_at: now,
        };
        let update = (self.priority == FieldPriority::PreferIncoming).then(|| incoming.clone());
        LinkDecision::Conflict { conflict, update }
    }
}

/// Same divergence replayed yields the same id, so conflict inserts stay idempotent.
fn conflict_id(scope: &str, owner_id: Uuid, replacement: &JsonValue) -> Uuid {
    Uuid::new_v5(
        &OWNER_NAMESPACE,
        format!("conflict:{scope}:{owner_id}:{replacement}").as_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use zlv_core::{OwnerKind, PropertyRight};

    fn existing() -> OwnerIdentity {
        let record = OwnerRecord {
            idpersonne: Some("01234567".into()),
            full_name: "DUPONT JEAN".into(),
            raw_address: vec!["1 rue A".into(), "01000 BOURG".into()],
            birth_date: None,
            kind: Some(OwnerKind::Natural),
            siren: None,
            data_source: Some("lovac-2023".into()),
        };
        OwnerIdentity::from_record(&record, blocking_key(&record), Utc::now())
    }

    fn incoming(address: &[&str]) -> OwnerRecord {
        OwnerRecord {
            idpersonne: Some("01234567".into()),
            full_name: "Dupont, Jean".into(),
            raw_address: address.iter().map(|s| s.to_string()).collect(),
            birth_date: chrono::NaiveDate::from_ymd_opt(1950, 2, 3),
            kind: Some(OwnerKind::Natural),
            siren: None,
            data_source: Some("lovac-2024".into()),
        }
    }

    #[test]
    fn formatting_only_changes_fill_without_conflict() {
        let merge = ConflictDetector::default().merge_owner(
            &existing(),
            &incoming(&["1 RUE A", "01000 Bourg"]),
            Utc::now(),
        );
        assert!(merge.conflict.is_none());
        assert_eq!(merge.patch.birth_date, chrono::NaiveDate::from_ymd_opt(1950, 2, 3));
        assert_eq!(merge.patch.full_name, None);
        assert_eq!(merge.patch.data_source, None);
    }

    #[test]
    fn divergent_address_keeps_existing_value_and_records_replacement() {
        let owner = existing();
        let record = incoming(&["9 avenue B", "01000 BOURG"]);
        let merge = ConflictDetector::default().merge_owner(&owner, &record, Utc::now());
        let conflict = merge.conflict.expect("conflict");
        assert_eq!(conflict.existing_owner_id, owner.id);
        assert_eq!(conflict.fields, vec!["raw_address".to_string()]);
        assert_eq!(conflict.existing["fields"]["raw_address"], json!(["1 rue A", "01000 BOURG"]));
        assert_eq!(conflict.replacement["record"]["raw_address"][0], json!("9 avenue B"));
        assert_eq!(merge.patch.raw_address, None);

        let again = ConflictDetector::default().merge_owner(&owner, &record, Utc::now());
        assert_eq!(again.conflict.map(|c| c.id), Some(conflict.id));
    }

    #[test]
    fn prefer_incoming_applies_divergent_values() {
        let merge = ConflictDetector::new(FieldPriority::PreferIncoming).merge_owner(
            &existing(),
            &incoming(&["9 avenue B", "01000 BOURG"]),
            Utc::now(),
        );
        assert!(merge.conflict.is_some());
        assert_eq!(
            merge.patch.raw_address,
            Some(vec!["9 avenue B".to_string(), "01000 BOURG".to_string()])
        );
        assert_eq!(merge.patch.data_source.as_deref(), Some("lovac-2024"));
    }

    #[test]
    fn replaced_address_moves_the_identity_to_its_new_bucket() {
        let owner = existing();
        let moved = incoming(&["1 rue A", "75002 PARIS"]);

        let kept = ConflictDetector::default().merge_owner(&owner, &moved, Utc::now());
        assert_eq!(kept.patch.blocking_key, None);

        let replaced =
            ConflictDetector::new(FieldPriority::PreferIncoming).merge_owner(&owner, &moved, Utc::now());
        assert_eq!(replaced.patch.blocking_key, blocking_key(&moved));
        assert_ne!(replaced.patch.blocking_key, owner.blocking_key);
    }

    fn link(rank: i64, right: PropertyRight) -> HousingOwnerLink {
        HousingOwnerLink {
            owner_id: Uuid::from_u128(1),
            geo_code: "01234".into(),
            local_id: "012340000001".into(),
            idprocpte: "01234000001".into(),
            idprodroit: "0123400000101".into(),
            rank,
            property_right: right,
        }
    }

    #[test]
    fn rank_divergence_is_a_link_conflict() {
        let detector = ConflictDetector::default();
        let now = Utc::now();
        let base = link(1, PropertyRight::Proprietaire);
        assert_eq!(detector.compare_link(&base, &base, now), LinkDecision::Unchanged);

        let mut renumbered = base.clone();
        renumbered.idprodroit = "0123400000102".into();
        assert_eq!(
            detector.compare_link(&base, &renumbered, now),
            LinkDecision::Update(renumbered.clone())
        );

        match detector.compare_link(&base, &link(2, PropertyRight::Proprietaire), now) {
            LinkDecision::Conflict { conflict, update } => {
                assert_eq!(conflict.owner_id, base.owner_id);
                assert_eq!(conflict.local_id, "012340000001");
                assert_eq!(conflict.existing["rank"], json!(1));
                assert_eq!(conflict.replacement["rank"], json!(2));
                assert!(update.is_none());
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }
}
