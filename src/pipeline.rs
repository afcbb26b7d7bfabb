//! Sequential run of the fetch, extract, store and report stages

use std::fmt;
use tracing::{error, info, warn};

use crate::extract::{raw_record, Extractor};
use crate::fetch::ListingSource;
use crate::llm::CompletionClient;
use crate::report::{Report, Reporter};
use crate::store::Store;
use crate::types::{ItemBlock, MovieRecord, RecordStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Store,
    Report,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Store => "store",
            Stage::Report => "report",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    CompletedWithWarnings { warnings: u32 },
    Aborted { stage: Stage, reason: String },
}

impl Outcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::Completed | Outcome::CompletedWithWarnings { .. } => 0,
            Outcome::Aborted { .. } => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub pages: u32,
    pub skip_fetch: bool,
    pub skip_ai: bool,
    pub skip_report: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub outcome: Outcome,
    pub blocks_fetched: u32,
    pub failed_pages: Vec<u32>,
    pub records_extracted: u32,
    pub partial_records: u32,
    pub inserted: u32,
    pub rejected: u32,
    pub report: Option<Report>,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            outcome: Outcome::Completed,
            blocks_fetched: 0,
            failed_pages: Vec::new(),
            records_extracted: 0,
            partial_records: 0,
            inserted: 0,
            rejected: 0,
            report: None,
        }
    }

    fn abort(mut self, stage: Stage, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        error!("Run aborted at {} stage: {}", stage, reason);
        self.outcome = Outcome::Aborted { stage, reason };
        self
    }

    fn warnings(&self) -> u32 {
        self.failed_pages.len() as u32 + self.partial_records + self.rejected
    }
}

pub struct Pipeline<'a, S, C> {
    source: &'a mut S,
    extractor: Option<&'a mut Extractor<C>>,
    store: &'a mut Store,
    reporter: &'a Reporter,
}

impl<'a, S, C> Pipeline<'a, S, C>
where
    S: ListingSource,
    C: CompletionClient,
{
    /// `extractor` may be `None` only for runs that skip AI parsing
    pub fn new(
        source: &'a mut S,
        extractor: Option<&'a mut Extractor<C>>,
        store: &'a mut Store,
        reporter: &'a Reporter,
    ) -> Self {
        Self {
            source,
            extractor,
            store,
            reporter,
        }
    }

    fn extract(&mut self, blocks: &[ItemBlock], skip_ai: bool) -> Vec<MovieRecord> {
        match self.extractor.as_deref_mut() {
            Some(extractor) if !skip_ai => extractor.extract_all(blocks),
            other => {
                if other.is_none() && !skip_ai {
                    warn!("No completion client configured; storing listing text only");
                }
                info!("AI parsing skipped for {} movies", blocks.len());
                blocks.iter().map(raw_record).collect()
            }
        }
    }

    pub fn run(&mut self, options: &RunOptions) -> RunSummary {
        let mut summary = RunSummary::new();

        if options.skip_fetch {
            info!("Skipping fetch; reporting from the existing database");
        } else {
            info!("STEP 1: fetching {} listing page(s)", options.pages);
            let fetched = self.source.fetch_all(options.pages);
            summary.blocks_fetched = fetched.blocks.len() as u32;
            summary.failed_pages = fetched.failed_pages.iter().map(|(page, _)| *page).collect();
            if fetched.blocks.is_empty() {
                return summary.abort(Stage::Fetch, "no movies were fetched");
            }

            info!("STEP 2: extracting {} movies", fetched.blocks.len());
            let records = self.extract(&fetched.blocks, options.skip_ai);
            summary.records_extracted = records.len() as u32;
            summary.partial_records = records
                .iter()
                .filter(|r| r.status == RecordStatus::Partial)
                .count() as u32;

            info!("STEP 3: saving {} movies", records.len());
            match self.store.insert_batch(&records) {
                Ok(outcome) => {
                    summary.inserted = outcome.inserted;
                    summary.rejected = outcome.rejected.len() as u32;
                }
                Err(e) => return summary.abort(Stage::Store, e.to_string()),
            }
            if summary.inserted == 0 {
                return summary.abort(Stage::Store, "no records were stored");
            }
        }

        if options.skip_report {
            info!("Skipping report generation");
        } else {
            info!("STEP 4: generating report");
            let records = match self.store.get_all() {
                Ok(records) => records,
                Err(e) => return summary.abort(Stage::Report, e.to_string()),
            };
            if records.is_empty() {
                return summary.abort(Stage::Report, "the database is empty");
            }
            match self.reporter.render(&records) {
                Ok(report) => summary.report = Some(report),
                Err(e) => return summary.abort(Stage::Report, format!("{:#}", e)),
            }
        }

        let warnings = summary.warnings();
        if warnings > 0 {
            warn!("Run completed with {} warning(s)", warnings);
            summary.outcome = Outcome::CompletedWithWarnings { warnings };
        } else {
            info!("Run completed");
        }
        summary
    }
}
