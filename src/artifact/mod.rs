//! Extraction artifact model: a tagged union over the reporting indicators.
//!
//! Artifacts are produced by parsing LLM output and must round-trip with test
//! fixtures, so optional fields are omitted when absent (never serialized as
//! null) and a dedicated unparsed variant carries raw text flagged with
//! `parsing_error: true`. Field-level coercions accept the looser shapes the
//! generator occasionally emits (digit strings for counts, a bare string for
//! keyword lists, the legacy `{country_code, areas}` geoscope form) and
//! canonicalize them on the way in.

mod validate;

pub use validate::{parse_llm_results, validate_extraction};

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Indicator names accepted by the extraction schema.
pub const INDICATORS: [&str; 3] = [
    "Capacity Sharing for Development",
    "Policy Change",
    "Innovation Development",
];

/// Complete mining response returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MiningResponse {
    /// Extracted results, in batch order for bulk uploads.
    pub results: Vec<ResultRecord>,
}

/// One entry of a mining response: either a schema-conformant result or the
/// raw text the model produced when parsing failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ResultRecord {
    /// A validated, indicator-tagged extraction result.
    Parsed(ExtractionResult),
    /// Raw output retained when parsing or validation failed.
    Unparsed(UnparsedResult),
}

impl ResultRecord {
    /// Batch number of the record, when it came from a bulk upload.
    pub fn batch_number(&self) -> Option<u32> {
        match self {
            ResultRecord::Parsed(result) => result.base().batch_number,
            ResultRecord::Unparsed(unparsed) => unparsed.batch_number,
        }
    }

    /// Tag the record with its originating batch.
    pub fn set_batch_number(&mut self, batch_number: u32) {
        match self {
            ResultRecord::Parsed(result) => result.base_mut().batch_number = Some(batch_number),
            ResultRecord::Unparsed(unparsed) => unparsed.batch_number = Some(batch_number),
        }
    }
}

/// Raw model output kept when a result could not be parsed or validated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnparsedResult {
    /// The text the model produced for this slot.
    pub text: String,
    /// Originating batch, for bulk uploads.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub batch_number: Option<u32>,
    /// Always `true`; marks the record as recoverable rather than valid.
    pub parsing_error: bool,
}

impl UnparsedResult {
    /// Wrap raw text as an unparsed record.
    pub fn new(text: impl Into<String>, batch_number: Option<u32>) -> Self {
        Self {
            text: text.into(),
            batch_number,
            parsing_error: true,
        }
    }
}

/// A schema-conformant extraction result, tagged by indicator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "indicator")]
pub enum ExtractionResult {
    /// Training and capacity development activities.
    #[serde(rename = "Capacity Sharing for Development")]
    CapacitySharing(CapacitySharingResult),
    /// Introduction or modification of policies and strategies.
    #[serde(rename = "Policy Change")]
    PolicyChange(PolicyChangeResult),
    /// New, improved or adapted outputs with scaling potential.
    #[serde(rename = "Innovation Development")]
    InnovationDevelopment(InnovationDevelopmentResult),
}

impl ExtractionResult {
    /// Indicator name carried by the serialized tag.
    pub fn indicator(&self) -> &'static str {
        match self {
            ExtractionResult::CapacitySharing(_) => "Capacity Sharing for Development",
            ExtractionResult::PolicyChange(_) => "Policy Change",
            ExtractionResult::InnovationDevelopment(_) => "Innovation Development",
        }
    }

    /// Shared base fields of the result.
    pub fn base(&self) -> &BaseResult {
        match self {
            ExtractionResult::CapacitySharing(result) => &result.base,
            ExtractionResult::PolicyChange(result) => &result.base,
            ExtractionResult::InnovationDevelopment(result) => &result.base,
        }
    }

    /// Mutable access to the shared base fields.
    pub fn base_mut(&mut self) -> &mut BaseResult {
        match self {
            ExtractionResult::CapacitySharing(result) => &mut result.base,
            ExtractionResult::PolicyChange(result) => &mut result.base,
            ExtractionResult::InnovationDevelopment(result) => &mut result.base,
        }
    }
}

/// Fields shared by every indicator variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BaseResult {
    /// Result title.
    pub title: String,
    /// Result description.
    pub description: String,
    /// Relevant keywords, lowercased.
    #[serde(deserialize_with = "de_keywords")]
    pub keywords: Vec<String>,
    /// Geographical scope of the result.
    pub geoscope: Geoscope,
    /// Named main contact, when the document provides one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub main_contact_person: Option<PersonRef>,
    /// Originating batch for bulk uploads.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub batch_number: Option<u32>,
}

/// Capacity Sharing for Development specific fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapacitySharingResult {
    /// Shared base fields.
    #[serde(flatten)]
    pub base: BaseResult,
    /// `Individual training` or `Group training`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub training_type: Option<String>,
    /// Total participant count.
    #[serde(skip_serializing_if = "Option::is_none", default, deserialize_with = "de_count")]
    pub total_participants: Option<i64>,
    /// Male participant count.
    #[serde(skip_serializing_if = "Option::is_none", default, deserialize_with = "de_count")]
    pub male_participants: Option<i64>,
    /// Female participant count.
    #[serde(skip_serializing_if = "Option::is_none", default, deserialize_with = "de_count")]
    pub female_participants: Option<i64>,
    /// Non-binary participant count.
    #[serde(skip_serializing_if = "Option::is_none", default, deserialize_with = "de_count")]
    pub non_binary_participants: Option<i64>,
    /// Stated delivery modality.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub delivery_modality: Option<String>,
    /// Training start date, `YYYY-MM-DD`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub start_date: Option<String>,
    /// Training end date, `YYYY-MM-DD`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub end_date: Option<String>,
    /// `Short-term` or `Long-term`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub length_of_training: Option<String>,
    /// Degree the training leads to, for long-term or individual training.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub degree: Option<String>,
    /// Named training supervisor.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub training_supervisor: Option<PersonRef>,
    /// Affiliation of the trainees.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub trainee_affiliation: Option<InstitutionRef>,
    /// Partner institutions named in the document.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub partners: Option<Vec<InstitutionRef>>,
}

/// Policy Change specific fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyChangeResult {
    /// Shared base fields.
    #[serde(flatten)]
    pub base: BaseResult,
    /// Controlled policy type.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub policy_type: Option<String>,
    /// Controlled policy stage.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stage_in_policy_process: Option<String>,
    /// Evidence supporting the stated stage.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub evidence_for_stage: Option<String>,
    /// Partner institutions named in the document.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub partners: Option<Vec<InstitutionRef>>,
}

/// Innovation Development specific fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InnovationDevelopmentResult {
    /// Shared base fields.
    #[serde(flatten)]
    pub base: BaseResult,
    /// Plain-language short name.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub short_title: Option<String>,
    /// Controlled innovation nature.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub innovation_nature: Option<String>,
    /// Controlled innovation type.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub innovation_type: Option<String>,
    /// Scaling readiness level, 0 through 9.
    #[serde(skip_serializing_if = "Option::is_none", default, deserialize_with = "de_count")]
    pub assess_readiness: Option<i64>,
    /// Whether anticipated users have been determined.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub anticipated_users: Option<String>,
    /// Individual actors involved in the innovation.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub innovation_actors: Option<Vec<InnovationActor>>,
    /// Names of involved organizations.
    #[serde(skip_serializing_if = "Option::is_none", default, deserialize_with = "de_string_list")]
    pub organizations: Option<Vec<String>>,
    /// Types of the involved organizations.
    #[serde(skip_serializing_if = "Option::is_none", default, deserialize_with = "de_string_list")]
    pub organization_type: Option<Vec<String>>,
    /// Organization subtype, when stated.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub organization_sub_type: Option<String>,
    /// Free-text type when `organization_type` contains `Other`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub other_organization_type: Option<String>,
}

/// An individual actor involved in an innovation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InnovationActor {
    /// Actor name.
    pub name: String,
    /// Actor type.
    #[serde(rename = "type")]
    pub actor_type: String,
    /// Gender and age bands; restricted vocabulary.
    #[serde(default, deserialize_with = "de_gender_age")]
    pub gender_age: Vec<String>,
    /// Free-text type when `actor_type` is `Other`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub other_actor_type: Option<String>,
}

/// A person reference, enriched with a canonical id by the mapping service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersonRef {
    /// Free-text name from the document.
    pub name: String,
    /// Canonical staff id assigned by mapping.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<String>,
    /// Lexical similarity of the mapping candidate.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub similarity_score: Option<f64>,
}

/// An institution reference, enriched with a canonical id by the mapping
/// service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstitutionRef {
    /// Free-text institution name from the document.
    pub institution_name: String,
    /// Canonical institution id assigned by mapping.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub institution_id: Option<String>,
    /// Lexical similarity of the mapping candidate.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub similarity_score: Option<f64>,
}

/// Geographical scope of a result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Geoscope {
    /// Scope level.
    #[serde(deserialize_with = "de_level")]
    pub level: GeoscopeLevel,
    /// Region or country list, present iff the level requires it.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sub_list: Option<Vec<GeoscopeArea>>,
}

/// Allowed geoscope levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GeoscopeLevel {
    /// No region or country named.
    Global,
    /// Regions named, no countries.
    Regional,
    /// One or more countries named.
    National,
    /// Locations inside a country named.
    #[serde(rename = "Sub-national")]
    SubNational,
    /// Scope could not be determined.
    Undetermined,
}

impl GeoscopeLevel {
    /// Whether the level requires an accompanying region/country list.
    pub fn requires_sub_list(self) -> bool {
        matches!(
            self,
            GeoscopeLevel::Regional | GeoscopeLevel::National | GeoscopeLevel::SubNational
        )
    }

    fn parse(raw: &str) -> Self {
        match raw.trim() {
            "Global" => GeoscopeLevel::Global,
            "Regional" => GeoscopeLevel::Regional,
            "National" => GeoscopeLevel::National,
            "Sub-national" | "Subnational" => GeoscopeLevel::SubNational,
            // Unknown values and the legacy sentinel degrade to undetermined.
            _ => GeoscopeLevel::Undetermined,
        }
    }
}

/// One entry of a geoscope list, canonicalized to `{ "code": … }`.
///
/// Regional lists carry UN M49 codes (numbers), national lists ISO alpha-2
/// codes; the legacy `{country_code, areas}` form is accepted on input only.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GeoscopeArea {
    /// Region or country code.
    pub code: String,
}

impl<'de> Deserialize<'de> for GeoscopeArea {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Compat {
            Canonical {
                code: Value,
            },
            Legacy {
                country_code: Value,
                #[serde(default)]
                #[allow(dead_code)]
                areas: Option<Vec<String>>,
            },
            Bare(Value),
        }

        let code = match Compat::deserialize(deserializer)? {
            Compat::Canonical { code } => code,
            Compat::Legacy { country_code, .. } => country_code,
            Compat::Bare(value) => value,
        };
        Ok(GeoscopeArea {
            code: stringify_code(code),
        })
    }
}

fn stringify_code(value: Value) -> String {
    match value {
        Value::String(code) => code,
        Value::Number(code) => code.to_string(),
        other => other.to_string(),
    }
}

fn de_level<'de, D>(deserializer: D) -> Result<GeoscopeLevel, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(GeoscopeLevel::parse(&raw))
}

/// Accept numeric counts, digit strings and the `Not collected` sentinel;
/// negative or non-numeric values are dropped.
fn de_count<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| {
                number
                    .as_f64()
                    .filter(|v| v.fract() == 0.0)
                    .map(|v| v as i64)
            })
            .filter(|v| *v >= 0),
        Some(Value::String(text)) => {
            let trimmed = text.trim();
            if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
                trimmed.parse().ok()
            } else {
                None
            }
        }
        _ => None,
    })
}

/// Keywords arrive as a list or a bare string; both are lowercased.
fn de_keywords<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(keyword) => vec![keyword.to_lowercase()],
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(keyword) => Some(keyword.to_lowercase()),
                other => Some(other.to_string().to_lowercase()),
            })
            .filter(|keyword| !keyword.trim().is_empty())
            .collect(),
        _ => Vec::new(),
    })
}

fn de_string_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(item)) => Some(vec![item]),
        Some(Value::Array(items)) => Some(
            items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(text) if !text.trim().is_empty() => Some(text),
                    _ => None,
                })
                .collect(),
        ),
        _ => None,
    })
}

const VALID_GENDER_AGE: [&str; 4] = [
    "Women: Youth",
    "Women: Non-youth",
    "Men: Youth",
    "Men: Non-youth",
];

fn de_gender_age<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let candidates: Vec<String> = match value {
        Value::String(item) => vec![item],
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(text),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    Ok(candidates
        .into_iter()
        .filter(|candidate| VALID_GENDER_AGE.contains(&candidate.as_str()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn indicator_tag_routes_to_the_right_variant() {
        let value = json!({
            "indicator": "Policy Change",
            "title": "National seed strategy",
            "description": "Strategy adopted by the ministry",
            "keywords": ["Seed", "POLICY"],
            "geoscope": { "level": "National", "sub_list": [ { "code": "KE" } ] },
            "policy_type": "Policy or Strategy"
        });
        let result: ExtractionResult = serde_json::from_value(value).expect("parse");
        assert!(matches!(result, ExtractionResult::PolicyChange(_)));
        assert_eq!(result.indicator(), "Policy Change");
        assert_eq!(result.base().keywords, vec!["seed", "policy"]);
    }

    #[test]
    fn counts_accept_digit_strings_and_drop_sentinels() {
        let value = json!({
            "indicator": "Capacity Sharing for Development",
            "title": "Training",
            "description": "A training",
            "keywords": ["training"],
            "geoscope": { "level": "Global" },
            "total_participants": "42",
            "male_participants": 16,
            "female_participants": "Not collected",
            "non_binary_participants": -3
        });
        let result: ExtractionResult = serde_json::from_value(value).expect("parse");
        let ExtractionResult::CapacitySharing(capdev) = result else {
            panic!("wrong variant");
        };
        assert_eq!(capdev.total_participants, Some(42));
        assert_eq!(capdev.male_participants, Some(16));
        assert_eq!(capdev.female_participants, None);
        assert_eq!(capdev.non_binary_participants, None);
    }

    #[test]
    fn legacy_geoscope_form_is_canonicalized() {
        let geoscope: Geoscope = serde_json::from_value(json!({
            "level": "Sub-national",
            "sub_list": [ { "country_code": "CO", "areas": ["CO-CUN"] } ]
        }))
        .expect("parse");
        assert_eq!(geoscope.level, GeoscopeLevel::SubNational);
        assert_eq!(
            geoscope.sub_list,
            Some(vec![GeoscopeArea { code: "CO".into() }])
        );
        // Canonical output form.
        let serialized = serde_json::to_value(&geoscope).expect("serialize");
        assert_eq!(serialized["sub_list"], json!([ { "code": "CO" } ]));
    }

    #[test]
    fn regional_codes_accept_numbers() {
        let geoscope: Geoscope = serde_json::from_value(json!({
            "level": "Regional",
            "sub_list": [150, 2]
        }))
        .expect("parse");
        let codes: Vec<&str> = geoscope
            .sub_list
            .as_ref()
            .expect("sub list")
            .iter()
            .map(|area| area.code.as_str())
            .collect();
        assert_eq!(codes, vec!["150", "2"]);
    }

    #[test]
    fn unknown_level_degrades_to_undetermined() {
        let geoscope: Geoscope =
            serde_json::from_value(json!({ "level": "This is yet to be determined" }))
                .expect("parse");
        assert_eq!(geoscope.level, GeoscopeLevel::Undetermined);
    }

    #[test]
    fn optional_fields_are_omitted_when_absent() {
        let result = ExtractionResult::CapacitySharing(CapacitySharingResult {
            base: BaseResult {
                title: "Training".into(),
                description: "Desc".into(),
                keywords: vec!["training".into()],
                geoscope: Geoscope {
                    level: GeoscopeLevel::Global,
                    sub_list: None,
                },
                main_contact_person: None,
                batch_number: None,
            },
            training_type: None,
            total_participants: Some(10),
            male_participants: None,
            female_participants: None,
            non_binary_participants: None,
            delivery_modality: None,
            start_date: None,
            end_date: None,
            length_of_training: None,
            degree: None,
            training_supervisor: None,
            trainee_affiliation: None,
            partners: None,
        });
        let serialized = serde_json::to_value(&result).expect("serialize");
        let object = serialized.as_object().expect("object");
        assert!(!object.contains_key("training_type"));
        assert!(!object.contains_key("male_participants"));
        assert_eq!(object["total_participants"], json!(10));
        assert_eq!(object["indicator"], json!("Capacity Sharing for Development"));
    }

    #[test]
    fn unparsed_records_round_trip() {
        let record = ResultRecord::Unparsed(UnparsedResult::new("raw model text", Some(3)));
        let serialized = serde_json::to_value(&record).expect("serialize");
        assert_eq!(serialized["parsing_error"], json!(true));
        assert_eq!(serialized["batch_number"], json!(3));
        let restored: ResultRecord = serde_json::from_value(serialized).expect("parse");
        assert_eq!(restored, record);
    }

    #[test]
    fn gender_age_outside_vocabulary_is_dropped() {
        let actor: InnovationActor = serde_json::from_value(json!({
            "name": "Ana",
            "type": "Farmer",
            "gender_age": ["Women: Youth", "Robots"]
        }))
        .expect("parse");
        assert_eq!(actor.gender_age, vec!["Women: Youth"]);
    }
}
