//! Core domain model for housing-stock imports: raw rows, typed records,
//! owner identities and the conflicts recorded against them.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

pub const CRATE_NAME: &str = "zlv-core";

/// Namespace for deterministic owner identity ids.
pub const OWNER_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b7e_9d4a_4e21_8a3f_5c0d_e7b9_1a42);

pub type RawFields = Map<String, JsonValue>;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {what}: {value}")]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

/// Extract kind. Each kind designates the column used for department filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Owner,
    Housing,
    HousingOwner,
    Building,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Owner => "owner",
            RecordKind::Housing => "housing",
            RecordKind::HousingOwner => "housing_owner",
            RecordKind::Building => "building",
        }
    }

    /// Column whose leading characters carry the department code.
    pub fn department_column(&self) -> &'static str {
        match self {
            RecordKind::Owner => "idpersonne",
            RecordKind::Housing | RecordKind::Building => "geo_code",
            RecordKind::HousingOwner => "local_id",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "owner" | "owners" => Ok(RecordKind::Owner),
            "housing" => Ok(RecordKind::Housing),
            "housing_owner" | "housing_owners" => Ok(RecordKind::HousingOwner),
            "building" | "buildings" => Ok(RecordKind::Building),
            _ => Err(ParseEnumError::new("record kind", s)),
        }
    }
}

/// Untyped row read from an extract. `line` is 1-based within the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub line: u64,
    pub fields: RawFields,
}

impl SourceRecord {
    pub fn new(line: u64, fields: RawFields) -> Self {
        Self { line, fields }
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name).filter(|v| !is_blank(v))
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(JsonValue::as_str).map(str::trim)
    }

    /// Value rendered as text, whatever its JSON type.
    pub fn get_text(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            JsonValue::String(s) => Some(s.trim().to_string()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.fields.clone())
    }
}

fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.trim().is_empty(),
        JsonValue::Array(a) => a.is_empty(),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    Natural,
    Legal,
}

impl OwnerKind {
    pub const VALUES: [&'static str; 2] = ["natural", "legal"];

    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::Natural => "natural",
            OwnerKind::Legal => "legal",
        }
    }
}

impl FromStr for OwnerKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "natural" => Ok(OwnerKind::Natural),
            "legal" => Ok(OwnerKind::Legal),
            _ => Err(ParseEnumError::new("owner kind", s)),
        }
    }
}

/// Property right held by an owner over a housing unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyRight {
    Proprietaire,
    Usufruitier,
    NuProprietaire,
    Preneur,
    Gerant,
    Administrateur,
    Autre,
}

impl PropertyRight {
    pub const VALUES: [&'static str; 7] = [
        "proprietaire",
        "usufruitier",
        "nu_proprietaire",
        "preneur",
        "gerant",
        "administrateur",
        "autre",
    ];

    pub fn as_str(&self) -> &'static str {
        Self::VALUES[*self as usize]
    }
}

impl FromStr for PropertyRight {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proprietaire" => Ok(PropertyRight::Proprietaire),
            "usufruitier" => Ok(PropertyRight::Usufruitier),
            "nu_proprietaire" => Ok(PropertyRight::NuProprietaire),
            "preneur" => Ok(PropertyRight::Preneur),
            "gerant" => Ok(PropertyRight::Gerant),
            "administrateur" => Ok(PropertyRight::Administrateur),
            "autre" => Ok(PropertyRight::Autre),
            _ => Err(ParseEnumError::new("property right", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Occupancy {
    #[serde(rename = "V")]
    Vacant,
    #[serde(rename = "L")]
    Rented,
    #[serde(rename = "P")]
    OwnerOccupied,
    #[serde(rename = "RS")]
    SecondaryResidence,
    #[serde(rename = "A")]
    Other,
    #[serde(rename = "inconnu")]
    Unknown,
}

impl Occupancy {
    pub const VALUES: [&'static str; 6] = ["V", "L", "P", "RS", "A", "inconnu"];

    pub fn as_str(&self) -> &'static str {
        Self::VALUES[*self as usize]
    }
}

impl FromStr for Occupancy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "V" => Ok(Occupancy::Vacant),
            "L" => Ok(Occupancy::Rented),
            "P" => Ok(Occupancy::OwnerOccupied),
            "RS" => Ok(Occupancy::SecondaryResidence),
            "A" => Ok(Occupancy::Other),
            "inconnu" => Ok(Occupancy::Unknown),
            _ => Err(ParseEnumError::new("occupancy", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DpeClass {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
}

impl DpeClass {
    pub const VALUES: [&'static str; 7] = ["A", "B", "C", "D", "E", "F", "G"];

    pub fn as_str(&self) -> &'static str {
        Self::VALUES[*self as usize]
    }
}

impl FromStr for DpeClass {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(DpeClass::A),
            "B" => Ok(DpeClass::B),
            "C" => Ok(DpeClass::C),
            "D" => Ok(DpeClass::D),
            "E" => Ok(DpeClass::E),
            "F" => Ok(DpeClass::F),
            "G" => Ok(DpeClass::G),
            _ => Err(ParseEnumError::new("dpe class", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub idpersonne: Option<String>,
    pub full_name: String,
    pub raw_address: Vec<String>,
    pub birth_date: Option<NaiveDate>,
    pub kind: Option<OwnerKind>,
    pub siren: Option<String>,
    pub data_source: Option<String>,
}

impl OwnerRecord {
    /// Stable key of the incoming record: the external id when present,
    /// otherwise a digest of its normalized identifying fields.
    pub fn record_key(&self) -> String {
        match &self.idpersonne {
            Some(id) => format!("idpersonne:{id}"),
            None => format!(
                "owner:{}|{}|{}",
                normalize_text(&self.full_name),
                address_tokens(&self.raw_address)
                    .into_iter()
                    .collect::<Vec<_>>()
                    .join(" "),
                self.birth_date.map(|d| d.to_string()).unwrap_or_default()
            ),
        }
    }

    /// Deterministic surrogate id used when this record creates an identity.
    pub fn surrogate_id(&self) -> Uuid {
        Uuid::new_v5(&OWNER_NAMESPACE, self.record_key().as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HousingRecord {
    pub geo_code: String,
    pub local_id: String,
    pub invariant: Option<String>,
    pub building_id: Option<String>,
    pub raw_address: Vec<String>,
    pub living_area: Option<f64>,
    pub rooms_count: Option<i64>,
    pub vacancy_start_year: Option<i64>,
    pub occupancy: Occupancy,
    pub data_source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HousingOwnerRecord {
    pub idpersonne: String,
    pub idprocpte: String,
    pub idprodroit: String,
    pub local_id: String,
    pub geo_code: String,
    pub rank: i64,
    pub property_right: PropertyRight,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingRecord {
    pub building_id: String,
    pub geo_code: String,
    pub housing_count: Option<i64>,
    pub vacant_housing_count: Option<i64>,
    pub dpe_class: Option<DpeClass>,
    pub dpe_date: Option<NaiveDate>,
}

/// Schema-checked, typed projection of a [`SourceRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidatedRecord {
    Owner(OwnerRecord),
    Housing(HousingRecord),
    HousingOwner(HousingOwnerRecord),
    Building(BuildingRecord),
}

impl ValidatedRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            ValidatedRecord::Owner(_) => RecordKind::Owner,
            ValidatedRecord::Housing(_) => RecordKind::Housing,
            ValidatedRecord::HousingOwner(_) => RecordKind::HousingOwner,
            ValidatedRecord::Building(_) => RecordKind::Building,
        }
    }
}

/// Canonical persisted owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerIdentity {
    pub id: Uuid,
    pub idpersonne: Option<String>,
    pub full_name: String,
    pub raw_address: Vec<String>,
    pub birth_date: Option<NaiveDate>,
    pub kind: Option<OwnerKind>,
    pub siren: Option<String>,
    pub blocking_key: Option<String>,
    pub data_source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OwnerIdentity {
    pub fn from_record(
        record: &OwnerRecord,
        blocking_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: record.surrogate_id(),
            idpersonne: record.idpersonne.clone(),
            full_name: record.full_name.clone(),
            raw_address: record.raw_address.clone(),
            birth_date: record.birth_date,
            kind: record.kind,
            siren: record.siren.clone(),
            blocking_key,
            data_source: record.data_source.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, patch: &OwnerPatch, now: DateTime<Utc>) {
        if let Some(v) = &patch.idpersonne {
            self.idpersonne = Some(v.clone());
        }
        if let Some(v) = &patch.full_name {
            self.full_name = v.clone();
        }
        if let Some(v) = &patch.raw_address {
            self.raw_address = v.clone();
        }
        if let Some(v) = patch.birth_date {
            self.birth_date = Some(v);
        }
        if let Some(v) = patch.kind {
            self.kind = Some(v);
        }
        if let Some(v) = &patch.siren {
            self.siren = Some(v.clone());
        }
        if let Some(v) = &patch.blocking_key {
            self.blocking_key = Some(v.clone());
        }
        if let Some(v) = &patch.data_source {
            self.data_source = Some(v.clone());
        }
        self.updated_at = now;
    }
}

/// Partial update of an [`OwnerIdentity`]; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerPatch {
    pub idpersonne: Option<String>,
    pub full_name: Option<String>,
    pub raw_address: Option<Vec<String>>,
    pub birth_date: Option<NaiveDate>,
    pub kind: Option<OwnerKind>,
    pub siren: Option<String>,
    pub blocking_key: Option<String>,
    pub data_source: Option<String>,
}

impl OwnerPatch {
    pub fn is_empty(&self) -> bool {
        self == &OwnerPatch::default()
    }
}

/// Divergence between a persisted owner and an incoming replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerConflict {
    pub id: Uuid,
    pub existing_owner_id: Uuid,
    pub fields: Vec<String>,
    pub existing: JsonValue,
    pub replacement: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HousingOwnerLink {
    pub owner_id: Uuid,
    pub geo_code: String,
    pub local_id: String,
    pub idprocpte: String,
    pub idprodroit: String,
    pub rank: i64,
    pub property_right: PropertyRight,
}

/// Divergence on an (owner, housing) link, keyed by the composite pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HousingOwnerConflict {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub geo_code: String,
    pub local_id: String,
    pub existing: JsonValue,
    pub replacement: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// Uppercase, accent-free, punctuation-free form with collapsed whitespace.
pub fn normalize_text(input: &str) -> String {
    input
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(fold_char)
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// Letters compatibility decomposition leaves whole.
fn fold_char(c: char) -> Vec<char> {
    let folded = match c {
        'ß' | 'ẞ' => "SS",
        'œ' | 'Œ' => "OE",
        'æ' | 'Æ' => "AE",
        'ø' | 'Ø' => "O",
        'ł' | 'Ł' => "L",
        'đ' | 'Đ' => "D",
        'ħ' | 'Ħ' => "H",
        'ı' => "I",
        'þ' | 'Þ' => "TH",
        _ => return c.to_uppercase().collect(),
    };
    folded.chars().collect()
}

/// Normalized, de-duplicated address tokens across every address line.
pub fn address_tokens(lines: &[String]) -> BTreeSet<String> {
    lines
        .iter()
        .flat_map(|line| {
            normalize_text(line)
                .split(' ')
                .filter(|t| !t.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Five-digit token from the last address line that has one; the postal
/// line closes the address.
pub fn postal_code(lines: &[String]) -> Option<String> {
    lines.iter().rev().find_map(|line| {
        normalize_text(line)
            .split(' ')
            .find(|t| t.len() == 5 && t.chars().all(|c| c.is_ascii_digit()))
            .map(ToString::to_string)
    })
}

/// Leading alphabetic token of a normalized name; cadastral extracts put the
/// surname first.
pub fn surname(full_name: &str) -> Option<String> {
    normalize_text(full_name)
        .split(' ')
        .find(|t| t.chars().any(|c| c.is_ascii_alphabetic()))
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalization_folds_case_accents_and_punctuation() {
        assert_eq!(normalize_text("  Lefèvre-Dupont,  Hélène "), "LEFEVRE DUPONT HELENE");
        assert_eq!(normalize_text("Œuvre"), "OEUVRE");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn normalization_folds_letters_beyond_french() {
        assert_eq!(normalize_text("Dvořák"), "DVORAK");
        assert_eq!(normalize_text("Łukasz Wałęsa"), "LUKASZ WALESA");
        assert_eq!(normalize_text("Østergaard"), "OSTERGAARD");
        assert_eq!(normalize_text("Ýves Straße"), "YVES STRASSE");
        assert_eq!(surname("Dvořák Antonín").as_deref(), Some("DVORAK"));
    }

    #[test]
    fn postal_code_prefers_the_closing_line() {
        let lines = vec!["12345 chemin des Vignes".to_string(), "01000 BOURG".to_string()];
        assert_eq!(postal_code(&lines).as_deref(), Some("01000"));
    }

    #[test]
    fn address_helpers_extract_tokens_and_postal_code() {
        let lines = vec!["12 rue de la Paix".to_string(), "75002 PARIS".to_string()];
        let tokens = address_tokens(&lines);
        assert!(tokens.contains("PAIX"));
        assert!(tokens.contains("75002"));
        assert_eq!(postal_code(&lines).as_deref(), Some("75002"));
        assert_eq!(postal_code(&["sans code".to_string()]), None);
    }

    #[test]
    fn surname_skips_numeric_tokens() {
        assert_eq!(surname("DUPONT Jean").as_deref(), Some("DUPONT"));
        assert_eq!(surname("123 Martin").as_deref(), Some("MARTIN"));
        assert_eq!(surname(" -- "), None);
    }

    #[test]
    fn surrogate_id_is_stable_for_equivalent_records() {
        let a = OwnerRecord {
            idpersonne: None,
            full_name: "Dupont Jean".into(),
            raw_address: vec!["1 rue A".into()],
            birth_date: None,
            kind: None,
            siren: None,
            data_source: None,
        };
        let mut b = a.clone();
        b.full_name = "DUPONT  jean".into();
        assert_eq!(a.surrogate_id(), b.surrogate_id());

        b.idpersonne = Some("01234567".into());
        assert_ne!(a.surrogate_id(), b.surrogate_id());
    }

    #[test]
    fn blank_values_read_as_absent() {
        let mut fields = RawFields::new();
        fields.insert("a".into(), json!("  "));
        fields.insert("b".into(), json!(42));
        fields.insert("c".into(), JsonValue::Null);
        let record = SourceRecord::new(1, fields);
        assert_eq!(record.get_str("a"), None);
        assert_eq!(record.get_text("b").as_deref(), Some("42"));
        assert!(record.get("c").is_none());
    }

    #[test]
    fn record_kinds_parse_and_name_department_columns() {
        assert_eq!("housing-owner".parse::<RecordKind>(), Ok(RecordKind::HousingOwner));
        assert_eq!(RecordKind::Owner.department_column(), "idpersonne");
        assert_eq!(RecordKind::Building.department_column(), "geo_code");
        assert!("flat".parse::<RecordKind>().is_err());
        assert_eq!(PropertyRight::NuProprietaire.as_str(), "nu_proprietaire");
        assert_eq!(Occupancy::SecondaryResidence.as_str(), "RS");
    }
}
