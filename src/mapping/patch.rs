//! Extraction of mapping candidates from artifacts and in-place enrichment.

use std::collections::HashMap;

use crate::artifact::{ExtractionResult, InstitutionRef, PersonRef, ResultRecord};

use super::{EntryKind, MappingEntry, MappingRequestEntry};

/// Collect every resolvable name from a batch of results, in encounter order
/// and without duplicates.
pub fn collect_entries(results: &[ResultRecord]) -> Vec<MappingRequestEntry> {
    let mut entries = Vec::new();
    let mut seen = HashMap::new();

    let mut push = |value: &str, kind: EntryKind| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return;
        }
        if seen.insert((trimmed.to_string(), kind), ()).is_none() {
            entries.push(MappingRequestEntry {
                value: trimmed.to_string(),
                kind,
            });
        }
    };

    for record in results {
        let ResultRecord::Parsed(result) = record else {
            continue;
        };
        if let Some(contact) = &result.base().main_contact_person {
            push(&contact.name, EntryKind::Staff);
        }
        match result {
            ExtractionResult::CapacitySharing(capdev) => {
                if let Some(supervisor) = &capdev.training_supervisor {
                    push(&supervisor.name, EntryKind::Staff);
                }
                if let Some(affiliation) = &capdev.trainee_affiliation {
                    push(&affiliation.institution_name, EntryKind::Institution);
                }
                for partner in capdev.partners.iter().flatten() {
                    push(&partner.institution_name, EntryKind::Institution);
                }
            }
            ExtractionResult::PolicyChange(policy) => {
                for partner in policy.partners.iter().flatten() {
                    push(&partner.institution_name, EntryKind::Institution);
                }
            }
            ExtractionResult::InnovationDevelopment(_) => {}
        }
    }

    entries
}

/// Patch resolved ids and similarity scores into a batch of results.
///
/// Entries the resolver could not map (or that are absent from `mapped`)
/// degrade to a null id and a zero score, so enrichable fields are always
/// populated after this call.
pub fn apply_mapping(results: &mut [ResultRecord], mapped: &[MappingEntry]) {
    let lookup: HashMap<(String, EntryKind), &MappingEntry> = mapped
        .iter()
        .map(|entry| ((entry.original_value.clone(), entry.kind), entry))
        .collect();

    let patch_person = |person: &mut PersonRef| {
        let entry = lookup.get(&(person.name.trim().to_string(), EntryKind::Staff));
        person.code = entry.and_then(|entry| entry.mapped_id.clone());
        person.similarity_score = Some(entry.and_then(|entry| entry.score).unwrap_or(0.0));
    };
    let patch_institution = |institution: &mut InstitutionRef| {
        let entry = lookup.get(&(
            institution.institution_name.trim().to_string(),
            EntryKind::Institution,
        ));
        institution.institution_id = entry.and_then(|entry| entry.mapped_id.clone());
        institution.similarity_score = Some(entry.and_then(|entry| entry.score).unwrap_or(0.0));
    };

    for record in results {
        let ResultRecord::Parsed(result) = record else {
            continue;
        };
        if let Some(contact) = &mut result.base_mut().main_contact_person {
            patch_person(contact);
        }
        match result {
            ExtractionResult::CapacitySharing(capdev) => {
                if let Some(supervisor) = &mut capdev.training_supervisor {
                    patch_person(supervisor);
                }
                if let Some(affiliation) = &mut capdev.trainee_affiliation {
                    patch_institution(affiliation);
                }
                for partner in capdev.partners.iter_mut().flatten() {
                    patch_institution(partner);
                }
            }
            ExtractionResult::PolicyChange(policy) => {
                for partner in policy.partners.iter_mut().flatten() {
                    patch_institution(partner);
                }
            }
            ExtractionResult::InnovationDevelopment(_) => {}
        }
    }
}
