//! Report pipeline: indicator/year narratives over the reference corpus.
//!
//! Aggregates come straight from the record source (sum per indicator, mean
//! for the percentage indicators), the narrative from the LLM over the merged
//! retrieval context, and a final pass appends every bibliographic link that
//! was available as evidence but never cited ("Missed links"). Output is one
//! markdown artifact, returned whole or streamed fragment by fragment.

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use regex::Regex;
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use crate::embedding::EmbeddingClient;
use crate::ingest::{IngestionScheduler, RecordSource, physical_table};
use crate::llm::{DEFAULT_TEMPERATURE, LlmClient, LlmError};
use crate::prompts;
use crate::tracker::{InteractionTracker, TrackRequest};
use crate::vector::{
    Chunk, Corpus, RetrievalFilterArgs, VectorStore, filter_question_chunks, filter_report_chunks,
    semantic_with_structural,
};

use super::PipelineError;

/// Token budget for report generation calls.
const REPORT_MAX_TOKENS: u32 = 8_000;

/// Indicators whose aggregates are means of percentages, not sums.
const PERCENT_INDICATORS: [&str; 2] = ["IPI 2.2", "IPI 3.3"];

/// Indicators that receive a disaggregated-targets section.
const TARGET_INDICATORS: [&str; 4] = [
    "PDO Indicator 1",
    "PDO Indicator 2",
    "PDO Indicator 3",
    "IPI 2.3",
];

/// One report request.
#[derive(Debug, Clone)]
pub struct ReportRequest {
    /// Indicator acronym the narrative covers.
    pub indicator: String,
    /// Reporting year.
    pub year: String,
    /// Rebuild the reference corpus before retrieval.
    pub insert_data: bool,
    /// User on whose behalf the request runs.
    pub user_id: Option<String>,
}

/// Result of one report request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReportOutcome {
    /// Generated markdown narrative.
    pub report: String,
    /// Wall-clock processing time in seconds.
    pub time_taken: f64,
    /// Interaction id assigned by the tracker, when tracking succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
}

/// Milestone aggregates computed from the contribution rows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MilestoneSummary {
    /// Total (or mean) expected value.
    pub expected: f64,
    /// Total (or mean) reported value.
    pub achieved: f64,
    /// Achieved share of expected, as a percentage rounded to 2 decimals.
    pub progress: f64,
}

/// One row of an indicator overview table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndicatorTableRow {
    /// Full indicator statement, or the acronym when no title is recorded.
    pub indicator_statement: String,
    /// End-year target aggregated across clusters.
    pub end_year_target: f64,
    /// Value achieved so far, aggregated across clusters.
    pub achieved: f64,
    /// Cluster-by-cluster narrative summary.
    pub brief_overview: String,
}

/// Orchestrates report generation for one indicator and year.
pub struct ReportService {
    store: Arc<VectorStore>,
    embedding: Arc<dyn EmbeddingClient>,
    llm: Arc<dyn LlmClient>,
    source: Arc<dyn RecordSource>,
    scheduler: Arc<IngestionScheduler>,
    tracker: Arc<InteractionTracker>,
}

impl ReportService {
    /// Assemble the service from its collaborators.
    pub fn new(
        store: Arc<VectorStore>,
        embedding: Arc<dyn EmbeddingClient>,
        llm: Arc<dyn LlmClient>,
        source: Arc<dyn RecordSource>,
        scheduler: Arc<IngestionScheduler>,
        tracker: Arc<InteractionTracker>,
    ) -> Self {
        Self {
            store,
            embedding,
            llm,
            source,
            scheduler,
            tracker,
        }
    }

    /// Generate the full report in one call.
    pub async fn generate(&self, request: ReportRequest) -> Result<ReportOutcome, PipelineError> {
        let started = Instant::now();
        let (prompt, context, questions) = self.prepare(&request).await?;

        let context_text = join_chunks(&context);
        let mut report = self
            .llm
            .invoke(
                &prompts::instruct_with_context(&context_text, &prompt),
                REPORT_MAX_TOKENS,
                DEFAULT_TEMPERATURE,
            )
            .await?;

        if let Some(targets) = self.targets_section(&request, &questions).await? {
            report.push_str("\n\n## Disaggregated targets\n");
            report.push_str(&targets);
        }

        let report = add_missed_links(report, &context);
        let time_taken = started.elapsed().as_secs_f64();
        let interaction_id = self.track(&request, &report, time_taken).await;
        tracing::info!(
            indicator = %request.indicator,
            year = %request.year,
            time_taken,
            "Report generation completed"
        );

        Ok(ReportOutcome {
            report,
            time_taken,
            interaction_id,
        })
    }

    /// Generate the report as a fragment stream.
    ///
    /// The main narrative streams as it is produced; the targets section and
    /// missed links are computed when the narrative finishes and yielded as
    /// trailing fragments.
    pub async fn stream(
        &self,
        request: ReportRequest,
    ) -> Result<BoxStream<'static, Result<String, LlmError>>, PipelineError> {
        let (prompt, context, questions) = self.prepare(&request).await?;
        let context_text = join_chunks(&context);

        let mut inner = self
            .llm
            .stream(
                &prompts::instruct_with_context(&context_text, &prompt),
                REPORT_MAX_TOKENS,
                DEFAULT_TEMPERATURE,
            )
            .await?;

        let llm = self.llm.clone();
        let tracker = self.tracker.clone();
        let stream = async_stream::stream! {
            let mut narrative = String::new();
            while let Some(fragment) = inner.next().await {
                match fragment {
                    Ok(text) => {
                        narrative.push_str(&text);
                        yield Ok(text);
                    }
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                }
            }

            if TARGET_INDICATORS.contains(&request.indicator.as_str()) && !questions.is_empty() {
                let targets_prompt = prompts::targets_prompt(&request.indicator);
                let questions_text = join_chunks(&questions);
                match llm
                    .invoke(
                        &prompts::instruct_with_context(&questions_text, &targets_prompt),
                        REPORT_MAX_TOKENS,
                        DEFAULT_TEMPERATURE,
                    )
                    .await
                {
                    Ok(targets) => {
                        let section = format!("\n\n## Disaggregated targets\n{targets}");
                        narrative.push_str(&section);
                        yield Ok(section);
                    }
                    Err(error) => yield Err(error),
                }
            }

            let with_links = add_missed_links(narrative.clone(), &context);
            if with_links.len() > narrative.len() {
                yield Ok(with_links[narrative.len()..].to_string());
            }

            let track_request = TrackRequest {
                user_id: request.user_id.clone().unwrap_or_else(|| "anonymous".into()),
                service_name: "report-generator".into(),
                user_input: Some(format!("{} {}", request.indicator, request.year)),
                ai_output: with_links,
                context: json!({ "indicator": request.indicator, "year": request.year }),
                ..Default::default()
            };
            if let Err(error) = tracker.track(track_request).await {
                tracing::error!(error = %error, "Interaction tracking failed");
            }
        };

        Ok(Box::pin(stream))
    }

    /// Generate the challenges and lessons-learned report for one year.
    pub async fn challenges(&self, year: &str) -> Result<String, PipelineError> {
        let filters = RetrievalFilterArgs {
            source_tables: Some(vec![
                physical_table("challenges").unwrap_or("challenges").to_string(),
            ]),
            ..Default::default()
        };
        let chunks = self
            .store
            .filter_only(Corpus::Reference, &filters, None)
            .await?;
        if chunks.is_empty() {
            tracing::warn!(year, "No challenges data found");
            return Ok(format!(
                "# Challenges and Lessons Learned - {year}\n\nNo challenges and lessons learned data available for {year}."
            ));
        }

        let report = self
            .llm
            .invoke(
                &prompts::instruct_with_context(
                    &join_chunks(&chunks),
                    &prompts::challenges_prompt(year),
                ),
                REPORT_MAX_TOKENS,
                DEFAULT_TEMPERATURE,
            )
            .await?;
        Ok(report)
    }

    /// Build the indicator overview tables for one year, grouped by
    /// indicator family (PDO, IPI 1.x, IPI 2.x, IPI 3.x).
    ///
    /// Each row aggregates the milestone targets across clusters and carries
    /// a short model-written summary of the cluster narratives.
    pub async fn indicator_tables(
        &self,
        year: &str,
    ) -> Result<std::collections::BTreeMap<String, Vec<IndicatorTableRow>>, PipelineError> {
        let table = physical_table("contributions").unwrap_or("contributions");
        let rows = self.source.load(table).await?;
        let rows: Vec<_> = rows
            .into_iter()
            .filter(|row| {
                row.get("year")
                    .map(|v| match v {
                        serde_json::Value::String(y) => y == year,
                        serde_json::Value::Number(y) => y.to_string() == year,
                        _ => false,
                    })
                    .unwrap_or(false)
            })
            .collect();

        let groups: [(&str, &str); 4] = [
            ("PDO", "PDO"),
            ("IPI 1.x", "IPI 1."),
            ("IPI 2.x", "IPI 2."),
            ("IPI 3.x", "IPI 3."),
        ];

        let mut tables = std::collections::BTreeMap::new();
        for (group_name, prefix) in groups {
            let mut indicators: Vec<String> = rows
                .iter()
                .filter_map(|row| row.get("indicator_acronym").and_then(|v| v.as_str()))
                .filter(|acronym| acronym.starts_with(prefix))
                .map(str::to_string)
                .collect();
            indicators.sort();
            indicators.dedup();

            let mut table_rows = Vec::new();
            for indicator in indicators {
                let indicator_rows: Vec<_> = rows
                    .iter()
                    .filter(|row| {
                        row.get("indicator_acronym").and_then(|v| v.as_str())
                            == Some(indicator.as_str())
                    })
                    .collect();

                let values: Vec<(f64, f64)> = indicator_rows
                    .iter()
                    .map(|row| {
                        (
                            numeric(row.get("Milestone expected value")),
                            numeric(row.get("Milestone reported value")),
                        )
                    })
                    .collect();
                let summary = summarize_milestones(&indicator, &values);

                let statement = indicator_rows
                    .iter()
                    .find_map(|row| row.get("indicator_title").and_then(|v| v.as_str()))
                    .unwrap_or(&indicator)
                    .to_string();

                let narratives: Vec<String> = indicator_rows
                    .iter()
                    .filter_map(|row| {
                        let cluster = row.get("cluster_acronym").and_then(|v| v.as_str())?;
                        let narrative = row
                            .get("Milestone achieved narrative")
                            .and_then(|v| v.as_str())
                            .filter(|text| !text.trim().is_empty())?;
                        Some(format!("{cluster}: {narrative}"))
                    })
                    .collect();

                let brief_overview = if narratives.is_empty() {
                    "No narratives available.".to_string()
                } else {
                    self.llm
                        .invoke(
                            &format!(
                                "Summarize these contribution narratives by cluster in 2-3 \
                                 sentences, highlighting key achievements. Omit clusters with no \
                                 contributions, return only the summary, no title, no markdown:\n{}",
                                narratives.join("\n")
                            ),
                            1_000,
                            DEFAULT_TEMPERATURE,
                        )
                        .await?
                };

                table_rows.push(IndicatorTableRow {
                    indicator_statement: statement,
                    end_year_target: summary.expected,
                    achieved: summary.achieved,
                    brief_overview,
                });
            }
            if !table_rows.is_empty() {
                tables.insert(group_name.to_string(), table_rows);
            }
        }
        Ok(tables)
    }

    /// Shared preamble: optional rebuild, aggregates, prompt, retrieval.
    async fn prepare(
        &self,
        request: &ReportRequest,
    ) -> Result<(String, Vec<Chunk>, Vec<Chunk>), PipelineError> {
        if request.indicator.trim().is_empty() || request.year.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "indicator and year are required".into(),
            ));
        }

        if request.insert_data {
            self.scheduler.rebuild(Corpus::Reference, true).await?;
        }

        let summary = self.milestone_summary(&request.indicator, &request.year).await?;
        let prompt = prompts::report_prompt(
            &request.indicator,
            &request.year,
            summary.expected,
            summary.achieved,
            summary.progress,
        );

        let filters = RetrievalFilterArgs {
            indicator: Some(request.indicator.clone()),
            year: Some(request.year.clone()),
            source_tables: Some(
                ["deliverables", "contributions", "oicrs", "innovations"]
                    .into_iter()
                    .filter_map(physical_table)
                    .map(str::to_string)
                    .collect(),
            ),
            document_name: None,
        };
        let context = filter_report_chunks(
            semantic_with_structural(
                &self.store,
                self.embedding.as_ref(),
                &prompt,
                &filters,
                Corpus::Reference,
            )
            .await?,
        );

        let question_filters = RetrievalFilterArgs {
            indicator: Some(request.indicator.clone()),
            year: Some(request.year.clone()),
            source_tables: Some(
                ["questions", "contributions"]
                    .into_iter()
                    .filter_map(physical_table)
                    .map(str::to_string)
                    .collect(),
            ),
            document_name: None,
        };
        let questions = filter_question_chunks(
            self.store
                .filter_only(Corpus::Reference, &question_filters, None)
                .await?,
        );

        tracing::info!(
            indicator = %request.indicator,
            year = %request.year,
            context = context.len(),
            questions = questions.len(),
            "Report context assembled"
        );
        Ok((prompt, context, questions))
    }

    /// Milestone aggregates for one indicator and year.
    async fn milestone_summary(
        &self,
        indicator: &str,
        year: &str,
    ) -> Result<MilestoneSummary, PipelineError> {
        let table = physical_table("contributions").unwrap_or("contributions");
        let rows = self.source.load(table).await?;
        let values: Vec<(f64, f64)> = rows
            .iter()
            .filter(|row| {
                row.get("indicator_acronym").and_then(|v| v.as_str()) == Some(indicator)
                    && row
                        .get("year")
                        .map(|v| match v {
                            serde_json::Value::String(y) => y == year,
                            serde_json::Value::Number(y) => y.to_string() == year,
                            _ => false,
                        })
                        .unwrap_or(false)
            })
            .map(|row| {
                (
                    numeric(row.get("Milestone expected value")),
                    numeric(row.get("Milestone reported value")),
                )
            })
            .collect();

        Ok(summarize_milestones(indicator, &values))
    }

    async fn targets_section(
        &self,
        request: &ReportRequest,
        questions: &[Chunk],
    ) -> Result<Option<String>, PipelineError> {
        if !TARGET_INDICATORS.contains(&request.indicator.as_str()) || questions.is_empty() {
            return Ok(None);
        }
        tracing::info!(indicator = %request.indicator, "Generating disaggregated targets section");
        let targets = self
            .llm
            .invoke(
                &prompts::instruct_with_context(
                    &join_chunks(questions),
                    &prompts::targets_prompt(&request.indicator),
                ),
                REPORT_MAX_TOKENS,
                DEFAULT_TEMPERATURE,
            )
            .await?;
        Ok(Some(targets))
    }

    async fn track(&self, request: &ReportRequest, report: &str, time_taken: f64) -> Option<String> {
        let track_request = TrackRequest {
            user_id: request
                .user_id
                .clone()
                .unwrap_or_else(|| "anonymous".to_string()),
            service_name: "report-generator".into(),
            user_input: Some(format!("{} {}", request.indicator, request.year)),
            ai_output: report.to_string(),
            context: json!({ "indicator": request.indicator, "year": request.year }),
            response_time_seconds: Some(time_taken),
            ..Default::default()
        };
        match self.tracker.track(track_request).await {
            Ok(interaction_id) => Some(interaction_id),
            Err(error) => {
                tracing::error!(error = %error, "Interaction tracking failed");
                None
            }
        }
    }
}

/// Compute milestone aggregates: means for percentage indicators, sums for
/// everything else.
pub fn summarize_milestones(indicator: &str, values: &[(f64, f64)]) -> MilestoneSummary {
    let (expected, achieved) = if values.is_empty() {
        (0.0, 0.0)
    } else if PERCENT_INDICATORS.contains(&indicator) {
        let count = values.len() as f64;
        (
            values.iter().map(|(expected, _)| expected).sum::<f64>() / count,
            values.iter().map(|(_, achieved)| achieved).sum::<f64>() / count,
        )
    } else {
        (
            values.iter().map(|(expected, _)| expected).sum(),
            values.iter().map(|(_, achieved)| achieved).sum(),
        )
    };

    let progress = if expected > 0.0 {
        (achieved / expected * 100.0 * 100.0).round() / 100.0
    } else {
        0.0
    };
    MilestoneSummary {
        expected: clean_number(expected),
        achieved: clean_number(achieved),
        progress,
    }
}

fn clean_number(value: f64) -> f64 {
    if value.fract() == 0.0 {
        value
    } else {
        (value * 100.0).round() / 100.0
    }
}

fn numeric(value: Option<&serde_json::Value>) -> f64 {
    match value {
        Some(serde_json::Value::Number(number)) => number.as_f64().unwrap_or(0.0),
        Some(serde_json::Value::String(text)) => text.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn join_chunks(chunks: &[Chunk]) -> String {
    chunks
        .iter()
        .map(|chunk| chunk.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Append a "Missed links" section listing every context DOI the narrative
/// did not cite, with its cluster attribution. Confidential entries are
/// excluded.
pub fn add_missed_links(report: String, context: &[Chunk]) -> String {
    let link_pattern = Regex::new(r"https?://[^\s\)\]]+").expect("static link pattern");
    let used: HashSet<&str> = link_pattern
        .find_iter(&report)
        .map(|m| m.as_str())
        .collect();

    let mut missed: BTreeSet<(&str, &str)> = BTreeSet::new();
    for chunk in context {
        let Some(doi) = chunk.attribute("doi") else {
            continue;
        };
        let doi = doi.trim();
        if doi.is_empty() || doi.eq_ignore_ascii_case("confidential") || used.contains(doi) {
            continue;
        }
        missed.insert((doi, chunk.attribute("cluster_acronym").unwrap_or("N/A")));
    }

    if missed.is_empty() {
        return report;
    }

    tracing::info!(count = missed.len(), "Appending missed links to the report");
    let mut out = report;
    out.push_str(
        "\n\n## Missed links\nThe following references were part of the context but not explicitly included:\n",
    );
    for (doi, cluster) in missed {
        out.push_str(&format!("- [{doi}]({doi}) (Cluster: {cluster})\n"));
    }
    out
}
