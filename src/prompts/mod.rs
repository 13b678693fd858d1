//! Prompt composition for the mining, report and chat tasks.
//!
//! The composer is stateless: every function renders a template from its
//! arguments and returns a `String`. Aggregates are computed by the pipelines
//! and passed in as literals; nothing here reads records.

use crate::config::Project;

/// Envelope used when the model should answer a question against context.
pub fn answer_with_context(context: &str, question: &str) -> String {
    format!("Based on this context:\n{context}\n\nAnswer the question:\n{question}\n")
}

/// Envelope used when the model should execute an instruction against context.
pub fn instruct_with_context(context: &str, instruction: &str) -> String {
    format!("Based on this context:\n{context}\n\nDo the following:\n{instruction}\n")
}

/// Extraction prompt for single-document mining.
pub fn mining_prompt(project: Project) -> String {
    let platform_note = match project {
        Project::Star => {
            "Results are reported to the STAR platform; follow its indicator definitions."
        }
        Project::Prms => {
            "Results are reported to the PRMS platform; follow its indicator definitions."
        }
    };

    format!(
        r#"Analyze the provided document(s) and extract all results related only to these indicators:
    - "Capacity Sharing for Development"
    - "Policy Change"
    - "Innovation Development"

{platform_note}

If no relevant information for any indicator is found, do not assume or invent data. Return:

{{
    "results": []
}}

For each identified result return an object inside the "results" array with:

General fields
    - indicator: one of the three indicator names above, verbatim.
    - title: the exact result title, or a concise inferred title.
    - description: a brief description of the result.
    - keywords: relevant keywords in lowercase, as an array of strings.
    - main_contact_person: {{"name": "..."}} when the document names a focal point or
      main contact; omit the field entirely when nobody is named.
    - geoscope: an object with
        - level: "Global", "Regional", "National", "Sub-national" or "Undetermined".
          Use "Regional" only when no countries are named; one or more named countries
          means "National"; named locations inside a country mean "Sub-national".
        - sub_list: for "Regional", UN M49 region codes; for "National", objects with
          the ISO alpha-2 country code, e.g. [{{"code": "KE"}}, {{"code": "UG"}}]; for
          "Sub-national", objects carrying the country code and ISO 3166-2 area codes.
          Omit sub_list for "Global" and "Undetermined".

Additional fields for "Capacity Sharing for Development"
    - training_type: "Individual training" or "Group training".
    - total_participants, male_participants, female_participants, non_binary_participants:
      non-negative integers. Use explicit counts from the document. When the stated total
      disagrees with the sum of the stated gender counts, keep the gender counts and set
      total_participants to their sum. Never invent participants. Omit any count the
      document does not support.
    - delivery_modality: the stated modality ("virtual", "in-person", "hybrid").
    - start_date, end_date: YYYY-MM-DD.
    - length_of_training: "Long-term" for 3 months or more, otherwise "Short-term".
    - degree: "PhD", "MSc", "BSc" or "Other"; include only for long-term or individual
      training that explicitly leads to a degree.
    - training_supervisor: {{"name": "..."}} when a supervisor is named.
    - trainee_affiliation: {{"institution_name": "..."}} when stated.
    - partners: array of {{"institution_name": "..."}} for named partner institutions.

Additional fields for "Policy Change"
    - policy_type: "Policy or Strategy", "Legal instrument" or
      "Program, Budget, or Investment".
    - stage_in_policy_process: "Stage 1: Research taken up by next user, policy change
      not yet enacted.", "Stage 2: Policy enacted." or "Stage 3: Evidence of impact of
      policy." Map bare stage ids to the full label.
    - evidence_for_stage: a short explanation (at most 200 words) of how the stage is
      supported by the document.

Additional fields for "Innovation Development"
    - short_title: a plain-language name, at most 10 words, no acronyms.
    - innovation_nature: "Incremental innovation", "Radical innovation",
      "Disruptive innovation" or "Other".
    - innovation_type: "Technological innovation", "Capacity development innovation",
      "Policy, organizational or institutional innovation" or "Other".
    - assess_readiness: an integer from 0 (idea) to 9 (proven innovation) on the scaling
      readiness scale. When several locations carry different levels, report the highest.
    - anticipated_users: "This is yet to be determined" or "Users have been determined".
    - organizations: array of involved organization names.

Omit every field the document does not support. Respond with the JSON object only, no
surrounding prose and no code fences."#
    )
}

/// Extraction prompt for the bulk capacity-development upload.
pub fn bulk_capdev_prompt() -> &'static str {
    r#"Each line under "Batch Data to Process" is one training record exported from a
spreadsheet, serialized as "column: value" pairs. For every line produce one result
object with indicator "Capacity Sharing for Development", mapping the columns onto the
extraction schema: title, description, keywords, geoscope, training_type, participant
counts, delivery_modality, start_date, end_date, length_of_training, degree,
main_contact_person, training_supervisor, trainee_affiliation and partners.

Use the reference region and country tables in the context to resolve geoscope codes.
Apply the participant reconciliation rule: when a stated total disagrees with the sum of
the stated gender counts, keep the gender counts and adjust the total down to their sum.
Never invent data for columns that are empty.

Return exactly one JSON object of the form {"results": [...]} with one entry per input
line, in input order. Respond with the JSON object only, no code fences."#
}

/// Report generation prompt with the precomputed aggregate literals.
pub fn report_prompt(
    indicator: &str,
    year: &str,
    total_expected: f64,
    total_achieved: f64,
    progress: f64,
) -> String {
    format!(
        r#"You are a reporting assistant for a multi-country agricultural research
program. Write the mid-year progress narrative for indicator {indicator} in {year},
using only the structured records provided as context.

Requirements:
    - Describe, per cluster_acronym and in separate paragraphs, the activities planned
      under the indicator and their current status.
    - State achieved values against annual targets with percentages where helpful.
    - Include every deliverable link from the context: format each doi field as a
      markdown link, never repeating the same link for one cluster, and never altering
      or guessing links.
    - Highlight innovations, tools, trainings and policy actions, plus gender, youth
      and social inclusion where the records support it.
    - Close with a summary paragraph of the form: "By mid-year {year}, the program had
      achieved {total_achieved} out of {total_expected}, representing {progress}%
      progress for indicator {indicator}."
    - Tone: formal, fluent, cohesive paragraphs, no bullet points. Report only what the
      records support; never cite table names or raw schema.

Return the narrative as markdown."#
    )
}

/// Prompt for the disaggregated-targets section of a report.
pub fn targets_prompt(indicator: &str) -> String {
    format!(
        r#"The context contains planned questions and contribution rows for indicator
{indicator}. Produce a short markdown section describing the disaggregated targets:
for each target dimension present in the questions, state the expected and reported
values and any narrative the rows carry. Use only the provided rows, keep the original
numbering of the questions, and do not invent values."#
    )
}

/// Prompt for the challenges and lessons-learned report.
pub fn challenges_prompt(year: &str) -> String {
    format!(
        r#"The context contains challenge and lessons-learned records reported by
clusters during {year}. Write a markdown report titled "Challenges and Lessons
Learned - {year}" that groups recurring themes, names the clusters affected and
summarizes the mitigation actions described. Use only the provided records."#
    )
}

/// System prompt for the conversational pipeline, parameterized by the active
/// filters.
pub fn chatbot_prompt(phase: &str, indicator: &str, section: &str) -> String {
    format!(
        r#"You are an AI assistant specialized in a multi-country agricultural research
program's reporting data. Answer using only the retrieved context.

Active filters: phase = {phase}; indicator = {indicator}; section = {section}.
If a filter is set to an "All ..." value, choose the most relevant and representative
records across that dimension.

The knowledge base contains these table types:
    - deliverables: outputs with titles, descriptions, links and completion status.
    - contributions: cluster-submitted milestone targets, narratives and progress.
    - innovations: tools, platforms and practices with readiness levels.
    - oicrs: outcome impact case reports.
    - questions: planned questions for reporting and planning phases.
Each record carries year, indicator_acronym, phase_name and table_type metadata.

Rules:
    - Never fabricate data; say clearly when the context is insufficient and suggest
      broadening the filters.
    - Format links as markdown, bold cluster names, and explain numeric values.
    - Never mention internal table names, JSON or raw schema in the answer.
    - Tone: conversational, professional, concise."#
    )
}

/// User message for the conversational pipeline, carrying the raw question and
/// the selected filters.
pub fn chat_input_with_filters(
    message: &str,
    phase: &str,
    indicator: &str,
    section: &str,
) -> String {
    format!(
        r#"{message}

[User-selected filters]
- Phase: {phase}
- Indicator: {indicator}
- Section: {section}

Instructions:
If these filters are not "All", you must strictly focus on them. If any of these are
set to "All", interpret the question contextually and include the most relevant records
dynamically across phases, indicators and sections."#
    )
}
