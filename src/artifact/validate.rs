//! Parsing and schema validation of generated artifacts.
//!
//! The generator returns JSON, sometimes wrapped in code fences and sometimes
//! malformed. Parsing is tolerant: whatever cannot be coerced into a valid
//! indicator result is retained as an unparsed record flagged with
//! `parsing_error: true`, never silently discarded. Validation normalizes
//! controlled vocabularies and enforces the numeric invariants, adjusting
//! participant totals down to the stated gender counts rather than inventing
//! participants.

use serde_json::Value;

use super::{
    CapacitySharingResult, ExtractionResult, GeoscopeLevel, InnovationDevelopmentResult,
    PolicyChangeResult, ResultRecord, UnparsedResult,
};

const TRAINING_TYPES: [&str; 2] = ["Individual training", "Group training"];
const TRAINING_LENGTHS: [&str; 2] = ["Short-term", "Long-term"];
const POLICY_TYPES: [&str; 3] = [
    "Policy or Strategy",
    "Legal instrument",
    "Program, Budget, or Investment",
];
const POLICY_STAGES: [&str; 3] = [
    "Stage 1: Research taken up by next user, policy change not yet enacted.",
    "Stage 2: Policy enacted.",
    "Stage 3: Evidence of impact of policy.",
];
const ANTICIPATED_USERS: [&str; 2] = ["This is yet to be determined", "Users have been determined"];

/// Parse raw generator output into result records.
///
/// Accepts `{"results": [...]}` objects and bare arrays, with or without
/// ```` ```json ```` fences. Output that is not valid JSON at all becomes a
/// single unparsed record.
pub fn parse_llm_results(raw: &str, batch_number: Option<u32>) -> Vec<ResultRecord> {
    let cleaned = strip_code_fences(raw);
    let parsed: Value = match serde_json::from_str(cleaned) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(error = %error, "Generator returned invalid JSON");
            return vec![ResultRecord::Unparsed(UnparsedResult::new(
                raw.to_string(),
                batch_number,
            ))];
        }
    };

    let items: Vec<Value> = match parsed {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("results") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    items
        .into_iter()
        .map(|item| normalize_value(item, batch_number))
        .collect()
}

/// Coerce one JSON value into a validated record.
fn normalize_value(value: Value, batch_number: Option<u32>) -> ResultRecord {
    let raw = value.to_string();
    match serde_json::from_value::<ExtractionResult>(value) {
        Ok(mut result) => match validate_extraction(&mut result) {
            Ok(()) => {
                if let Some(batch_number) = batch_number {
                    result.base_mut().batch_number = Some(batch_number);
                }
                ResultRecord::Parsed(result)
            }
            Err(reason) => {
                tracing::warn!(%reason, "Result failed validation; retaining as unparsed");
                ResultRecord::Unparsed(UnparsedResult::new(raw, batch_number))
            }
        },
        Err(error) => {
            tracing::warn!(error = %error, "Result did not match the indicator schema");
            ResultRecord::Unparsed(UnparsedResult::new(raw, batch_number))
        }
    }
}

/// Validate and normalize one extraction result in place.
///
/// Returns an error only for violations of the required base fields; every
/// other deviation is repaired by dropping or adjusting the offending value.
pub fn validate_extraction(result: &mut ExtractionResult) -> Result<(), String> {
    {
        let base = result.base_mut();
        if base.title.trim().is_empty() {
            return Err("title is required and must be non-empty".into());
        }
        if base.description.trim().is_empty() {
            return Err("description is required and must be non-empty".into());
        }
        if base.keywords.is_empty() {
            return Err("keywords are required and must be non-empty".into());
        }

        let geoscope = &mut base.geoscope;
        if geoscope.level.requires_sub_list() {
            let populated = geoscope
                .sub_list
                .as_ref()
                .map(|list| !list.is_empty())
                .unwrap_or(false);
            if !populated {
                geoscope.level = GeoscopeLevel::Undetermined;
                geoscope.sub_list = None;
            }
        } else {
            geoscope.sub_list = None;
        }
    }

    match result {
        ExtractionResult::CapacitySharing(capdev) => validate_capacity(capdev),
        ExtractionResult::PolicyChange(policy) => validate_policy(policy),
        ExtractionResult::InnovationDevelopment(innovation) => validate_innovation(innovation),
    }
    Ok(())
}

fn validate_capacity(capdev: &mut CapacitySharingResult) {
    restrict(&mut capdev.training_type, &TRAINING_TYPES);
    restrict(&mut capdev.length_of_training, &TRAINING_LENGTHS);
    normalize_date(&mut capdev.start_date);
    normalize_date(&mut capdev.end_date);

    // A degree only makes sense for long-term or individual training.
    let degree_applies = capdev.length_of_training.as_deref() == Some("Long-term")
        || capdev.training_type.as_deref() == Some("Individual training");
    if !degree_applies {
        capdev.degree = None;
    }

    // When every gender count is stated, the total is their sum. Stated
    // totals that disagree are adjusted, never the other way around.
    if let (Some(male), Some(female), Some(non_binary)) = (
        capdev.male_participants,
        capdev.female_participants,
        capdev.non_binary_participants,
    ) {
        let sum = male + female + non_binary;
        if capdev.total_participants != Some(sum) {
            tracing::debug!(
                stated = ?capdev.total_participants,
                sum,
                "Adjusting participant total to the gender count sum"
            );
            capdev.total_participants = Some(sum);
        }
    }
}

fn validate_policy(policy: &mut PolicyChangeResult) {
    restrict(&mut policy.policy_type, &POLICY_TYPES);
    restrict(&mut policy.stage_in_policy_process, &POLICY_STAGES);
}

fn validate_innovation(innovation: &mut InnovationDevelopmentResult) {
    if let Some(readiness) = innovation.assess_readiness
        && !(0..=9).contains(&readiness)
    {
        innovation.assess_readiness = None;
    }
    restrict(&mut innovation.anticipated_users, &ANTICIPATED_USERS);
}

/// Drop a value that falls outside its controlled vocabulary.
fn restrict(value: &mut Option<String>, allowed: &[&str]) {
    if let Some(current) = value.as_deref()
        && !allowed.contains(&current)
    {
        *value = None;
    }
}

/// Keep only `YYYY-MM-DD` dates.
fn normalize_date(value: &mut Option<String>) {
    if let Some(date) = value.as_deref()
        && !is_iso_date(date)
    {
        *value = None;
    }
}

fn is_iso_date(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| matches!(i, 4 | 7) || b.is_ascii_digit())
}

/// Strip a surrounding markdown code fence, if any.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}
