//! Charts, text summary and CSV export rendered from stored records

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::types::MovieRecord;

pub const YEAR_CHART: &str = "year_distribution.svg";
pub const DIRECTOR_CHART: &str = "top_directors.svg";
pub const GENRE_CHART: &str = "genre_distribution.svg";
pub const RATING_CHART: &str = "rating_distribution.svg";
pub const COUNTRY_CHART: &str = "country_distribution.svg";
pub const SUMMARY_FILE: &str = "summary_report.txt";
pub const CSV_FILE: &str = "movies.csv";

const TOP_N: usize = 10;
const WIDTH: f64 = 1200.0;
const HEIGHT: f64 = 800.0;
const FONT_FAMILY: &str = "'Noto Sans CJK SC', 'PingFang SC', 'Microsoft YaHei', sans-serif";

/// Artifacts produced by one render
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Report {
    pub written: Vec<PathBuf>,
    /// (artifact, reason) for artifacts that were not produced
    pub skipped: Vec<(String, String)>,
}

impl Report {
    fn skip(&mut self, artifact: &str, reason: impl Into<String>) {
        let reason = reason.into();
        info!("Skipping {}: {}", artifact, reason);
        self.skipped.push((artifact.to_string(), reason));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Orientation {
    Vertical,
    Horizontal,
}

struct BarChart {
    title: String,
    x_label: &'static str,
    y_label: &'static str,
    bars: Vec<(String, u32)>,
    orientation: Orientation,
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Round the axis maximum up to a value that divides into 5 integer ticks
fn axis_max(max: u32) -> u32 {
    let max = max.max(1);
    let step = max.div_ceil(5);
    step * 5
}

impl BarChart {
    fn to_svg(&self) -> String {
        let mut svg = String::new();
        svg.push_str(&format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}" font-family="{font}">"#,
            w = WIDTH,
            h = HEIGHT,
            font = FONT_FAMILY
        ));
        svg.push('\n');
        svg.push_str(&format!(
            r#"<rect width="{}" height="{}" fill="white"/>"#,
            WIDTH, HEIGHT
        ));
        svg.push('\n');
        svg.push_str(&format!(
            r#"<text x="{}" y="44" text-anchor="middle" font-size="24" font-weight="bold">{}</text>"#,
            WIDTH / 2.0,
            xml_escape(&self.title)
        ));
        svg.push('\n');

        match self.orientation {
            Orientation::Vertical => self.vertical_bars(&mut svg),
            Orientation::Horizontal => self.horizontal_bars(&mut svg),
        }

        svg.push_str("</svg>\n");
        svg
    }

    fn vertical_bars(&self, svg: &mut String) {
        let (left, right, top, bottom) = (100.0, WIDTH - 40.0, 80.0, HEIGHT - 140.0);
        let plot_w = right - left;
        let plot_h = bottom - top;
        let max = axis_max(self.bars.iter().map(|(_, v)| *v).max().unwrap_or(0));
        let slot = plot_w / self.bars.len().max(1) as f64;
        let rotate = self.bars.len() > 12;
        // Label every n-th bar so dense histograms stay legible
        let label_every = (self.bars.len() / 40).max(1);

        for tick in 0..=5 {
            let value = max / 5 * tick;
            let y = bottom - plot_h * value as f64 / max as f64;
            svg.push_str(&format!(
                r##"<line x1="{left}" y1="{y:.1}" x2="{right}" y2="{y:.1}" stroke="#e0e0e0"/>"##
            ));
            svg.push_str(&format!(
                r#"<text x="{:.1}" y="{:.1}" text-anchor="end" font-size="14">{}</text>"#,
                left - 8.0,
                y + 5.0,
                value
            ));
            svg.push('\n');
        }

        for (idx, (label, value)) in self.bars.iter().enumerate() {
            let bar_h = plot_h * *value as f64 / max as f64;
            let x = left + slot * idx as f64 + slot * 0.1;
            svg.push_str(&format!(
                r##"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" fill="#4c72b0"><title>{}: {}</title></rect>"##,
                x,
                bottom - bar_h,
                slot * 0.8,
                bar_h,
                xml_escape(label),
                value
            ));
            svg.push('\n');

            if idx % label_every != 0 {
                continue;
            }
            let cx = left + slot * (idx as f64 + 0.5);
            if rotate {
                svg.push_str(&format!(
                    r#"<text x="{cx:.1}" y="{y:.1}" text-anchor="end" font-size="12" transform="rotate(-45 {cx:.1} {y:.1})">{label}</text>"#,
                    cx = cx,
                    y = bottom + 16.0,
                    label = xml_escape(label)
                ));
            } else {
                svg.push_str(&format!(
                    r#"<text x="{:.1}" y="{:.1}" text-anchor="middle" font-size="14">{}</text>"#,
                    cx,
                    bottom + 22.0,
                    xml_escape(label)
                ));
            }
            svg.push('\n');
        }

        svg.push_str(&format!(
            r##"<line x1="{left}" y1="{bottom}" x2="{right}" y2="{bottom}" stroke="#333"/>"##
        ));
        svg.push('\n');
        self.axis_labels(svg, (left + right) / 2.0, HEIGHT - 30.0, (top + bottom) / 2.0);
    }

    fn horizontal_bars(&self, svg: &mut String) {
        let (left, right, top, bottom) = (280.0, WIDTH - 80.0, 80.0, HEIGHT - 90.0);
        let plot_w = right - left;
        let plot_h = bottom - top;
        let max = axis_max(self.bars.iter().map(|(_, v)| *v).max().unwrap_or(0));
        let slot = plot_h / self.bars.len().max(1) as f64;

        for tick in 0..=5 {
            let value = max / 5 * tick;
            let x = left + plot_w * value as f64 / max as f64;
            svg.push_str(&format!(
                r##"<line x1="{x:.1}" y1="{top}" x2="{x:.1}" y2="{bottom}" stroke="#e0e0e0"/>"##
            ));
            svg.push_str(&format!(
                r#"<text x="{:.1}" y="{:.1}" text-anchor="middle" font-size="14">{}</text>"#,
                x,
                bottom + 22.0,
                value
            ));
            svg.push('\n');
        }

        // Largest bar on top
        for (idx, (label, value)) in self.bars.iter().enumerate() {
            let bar_w = plot_w * *value as f64 / max as f64;
            let y = top + slot * idx as f64 + slot * 0.15;
            let cy = top + slot * (idx as f64 + 0.5);
            svg.push_str(&format!(
                r##"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" fill="#55a868"/>"##,
                left,
                y,
                bar_w,
                slot * 0.7
            ));
            svg.push_str(&format!(
                r#"<text x="{:.1}" y="{:.1}" text-anchor="end" font-size="14">{}</text>"#,
                left - 10.0,
                cy + 5.0,
                xml_escape(label)
            ));
            svg.push_str(&format!(
                r#"<text x="{:.1}" y="{:.1}" font-size="13">{}</text>"#,
                left + bar_w + 6.0,
                cy + 5.0,
                value
            ));
            svg.push('\n');
        }

        svg.push_str(&format!(
            r##"<line x1="{left}" y1="{top}" x2="{left}" y2="{bottom}" stroke="#333"/>"##
        ));
        svg.push('\n');
        self.axis_labels(svg, (left + right) / 2.0, HEIGHT - 30.0, (top + bottom) / 2.0);
    }

    fn axis_labels(&self, svg: &mut String, x_center: f64, x_baseline: f64, y_center: f64) {
        svg.push_str(&format!(
            r#"<text x="{:.1}" y="{:.1}" text-anchor="middle" font-size="16">{}</text>"#,
            x_center,
            x_baseline,
            xml_escape(self.x_label)
        ));
        svg.push('\n');
        svg.push_str(&format!(
            r#"<text x="30" y="{y:.1}" text-anchor="middle" font-size="16" transform="rotate(-90 30 {y:.1})">{label}</text>"#,
            y = y_center,
            label = xml_escape(self.y_label)
        ));
        svg.push('\n');
    }
}

/// Count occurrences, ordered by count desc then label asc
fn frequencies<I, S>(items: I) -> Vec<(String, u32)>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut counts: BTreeMap<String, u32> = BTreeMap::new();
    for item in items {
        let item = item.as_ref().trim();
        if !item.is_empty() {
            *counts.entry(item.to_string()).or_default() += 1;
        }
    }
    let mut sorted: Vec<(String, u32)> = counts.into_iter().collect();
    // Stable sort keeps the BTreeMap's label order within equal counts
    sorted.sort_by(|a, b| b.1.cmp(&a.1));
    sorted
}

fn countries(records: &[MovieRecord]) -> Vec<(String, u32)> {
    frequencies(
        records
            .iter()
            .filter_map(|r| r.country.as_deref())
            .flat_map(|c| c.split([',', '/'])),
    )
}

fn genres(records: &[MovieRecord]) -> Vec<(String, u32)> {
    frequencies(records.iter().flat_map(|r| r.genres.iter()))
}

fn directors(records: &[MovieRecord]) -> Vec<(String, u32)> {
    frequencies(records.iter().filter_map(|r| r.director.as_deref()))
}

fn year_chart(records: &[MovieRecord]) -> Option<BarChart> {
    let mut per_year: BTreeMap<i32, u32> = BTreeMap::new();
    for year in records.iter().filter_map(|r| r.year) {
        *per_year.entry(year).or_default() += 1;
    }
    if per_year.is_empty() {
        return None;
    }
    Some(BarChart {
        title: "Douban Top 250: Movie Distribution by Year".to_string(),
        x_label: "Release Year",
        y_label: "Number of Movies",
        bars: per_year
            .into_iter()
            .map(|(year, count)| (year.to_string(), count))
            .collect(),
        orientation: Orientation::Vertical,
    })
}

fn director_chart(records: &[MovieRecord]) -> Option<BarChart> {
    let mut top = directors(records);
    if top.is_empty() {
        return None;
    }
    top.truncate(TOP_N);
    Some(BarChart {
        title: format!("Top {} Directors in Douban Top 250", top.len()),
        x_label: "Number of Movies",
        y_label: "Director",
        bars: top,
        orientation: Orientation::Horizontal,
    })
}

fn genre_chart(records: &[MovieRecord]) -> Option<BarChart> {
    let all = genres(records);
    if all.is_empty() {
        return None;
    }
    Some(BarChart {
        title: "Genre Distribution in Douban Top 250".to_string(),
        x_label: "Genre",
        y_label: "Number of Movies",
        bars: all,
        orientation: Orientation::Vertical,
    })
}

/// Ratings bucketed to one decimal, every bucket between the extremes shown
fn rating_chart(records: &[MovieRecord]) -> Option<BarChart> {
    let mut buckets: BTreeMap<i64, u32> = BTreeMap::new();
    for record in records {
        *buckets.entry((record.rating * 10.0).round() as i64).or_default() += 1;
    }
    let (&low, _) = buckets.first_key_value()?;
    let (&high, _) = buckets.last_key_value()?;
    let bars = (low..=high)
        .map(|bucket| {
            (
                format!("{:.1}", bucket as f64 / 10.0),
                buckets.get(&bucket).copied().unwrap_or(0),
            )
        })
        .collect();
    Some(BarChart {
        title: "Distribution of Movie Ratings in Douban Top 250".to_string(),
        x_label: "Rating",
        y_label: "Number of Movies",
        bars,
        orientation: Orientation::Vertical,
    })
}

fn country_chart(records: &[MovieRecord]) -> Option<BarChart> {
    let mut top = countries(records);
    if top.is_empty() {
        return None;
    }
    top.truncate(TOP_N);
    Some(BarChart {
        title: format!("Top {} Countries in Douban Top 250", top.len()),
        x_label: "Number of Movies",
        y_label: "Country",
        bars: top,
        orientation: Orientation::Horizontal,
    })
}

fn section(text: &mut String, heading: &str, rows: &[(String, u32)]) {
    text.push_str(&format!("\n{}\n{}\n", heading, "-".repeat(40)));
    if rows.is_empty() {
        text.push_str("(none)\n");
    }
    for (label, count) in rows.iter().take(TOP_N) {
        text.push_str(&format!("{}: {}\n", label, count));
    }
}

/// Plain-text statistics; contains nothing time-dependent
pub fn summary_text(records: &[MovieRecord]) -> String {
    let mut text = String::new();
    let rule = "=".repeat(60);
    text.push_str(&format!(
        "{}\nDOUBAN TOP 250 MOVIES - SUMMARY REPORT\n{}\n\n",
        rule, rule
    ));

    text.push_str(&format!("BASIC STATISTICS\n{}\n", "-".repeat(40)));
    text.push_str(&format!("Total Movies: {}\n", records.len()));
    let structured = records.iter().filter(|r| r.is_structured()).count();
    text.push_str(&format!(
        "AI-structured Records: {} of {}\n",
        structured,
        records.len()
    ));

    if !records.is_empty() {
        let ratings: Vec<f64> = records.iter().map(|r| r.rating).collect();
        let average = ratings.iter().sum::<f64>() / ratings.len() as f64;
        let highest = ratings.iter().copied().fold(f64::MIN, f64::max);
        let lowest = ratings.iter().copied().fold(f64::MAX, f64::min);
        text.push_str(&format!("Average Rating: {:.2}\n", average));
        text.push_str(&format!("Highest Rating: {:.1}\n", highest));
        text.push_str(&format!("Lowest Rating: {:.1}\n", lowest));
        let votes: u64 = records.iter().map(|r| r.vote_count).sum();
        text.push_str(&format!("Total Votes: {}\n", votes));
    }

    let years: Vec<i32> = records.iter().filter_map(|r| r.year).collect();
    if let (Some(first), Some(last)) = (years.iter().min(), years.iter().max()) {
        text.push_str(&format!("Year Range: {} - {}\n", first, last));
    }

    let mut top_rated: Vec<&MovieRecord> = records.iter().collect();
    top_rated.sort_by(|a, b| b.rating.total_cmp(&a.rating).then(a.rank.cmp(&b.rank)));
    text.push_str(&format!("\nTOP RATED\n{}\n", "-".repeat(40)));
    for record in top_rated.iter().take(TOP_N) {
        text.push_str(&format!(
            "#{} {} ({:.1})\n",
            record.rank, record.title, record.rating
        ));
    }

    section(&mut text, "TOP GENRES", &genres(records));
    section(&mut text, "TOP DIRECTORS", &directors(records));
    section(&mut text, "TOP COUNTRIES", &countries(records));

    text.push_str(&format!("\n{}\nEND OF REPORT\n{}\n", rule, rule));
    text
}

#[derive(Serialize)]
struct CsvRow<'a> {
    rank: u32,
    title: &'a str,
    director: Option<&'a str>,
    actors: String,
    year: Option<i32>,
    country: Option<&'a str>,
    genres: String,
    rating: f64,
    vote_count: u64,
    quote: Option<&'a str>,
    ai_summary: Option<&'a str>,
    status: &'static str,
}

fn write_csv(path: &Path, records: &[MovieRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for record in records {
        writer.serialize(CsvRow {
            rank: record.rank,
            title: &record.title,
            director: record.director.as_deref(),
            actors: record.actors.join(" / "),
            year: record.year,
            country: record.country.as_deref(),
            genres: record.genres.join(" / "),
            rating: record.rating,
            vote_count: record.vote_count,
            quote: record.quote.as_deref(),
            ai_summary: record.ai_summary.as_deref(),
            status: record.status.as_str(),
        })?;
    }
    writer.flush()?;
    Ok(())
}

pub struct Reporter {
    output_dir: PathBuf,
}

impl Reporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    fn write_artifact(&self, name: &str, content: &str, report: &mut Report) {
        let path = self.output_dir.join(name);
        match fs::write(&path, content) {
            Ok(()) => {
                info!("Saved {}", path.display());
                report.written.push(path);
            }
            Err(e) => {
                warn!("Failed to write {}: {}", path.display(), e);
                report.skip(name, format!("write failed: {}", e));
            }
        }
    }

    /// Write every artifact the records support.
    ///
    /// Only an unusable output directory is an error; a single artifact that
    /// cannot be written is recorded in `Report::skipped`.
    pub fn render(&self, records: &[MovieRecord]) -> Result<Report> {
        fs::create_dir_all(&self.output_dir).with_context(|| {
            format!(
                "Failed to create output directory {}",
                self.output_dir.display()
            )
        })?;
        let mut report = Report::default();

        let charts = [
            (YEAR_CHART, year_chart(records), "no release years"),
            (DIRECTOR_CHART, director_chart(records), "no directors"),
            (GENRE_CHART, genre_chart(records), "no genres"),
            (RATING_CHART, rating_chart(records), "no records"),
            (COUNTRY_CHART, country_chart(records), "no countries"),
        ];
        for (name, chart, reason) in charts {
            match chart {
                Some(chart) => self.write_artifact(name, &chart.to_svg(), &mut report),
                None => report.skip(name, reason),
            }
        }

        self.write_artifact(SUMMARY_FILE, &summary_text(records), &mut report);

        let csv_path = self.output_dir.join(CSV_FILE);
        match write_csv(&csv_path, records) {
            Ok(()) => {
                info!("Saved {}", csv_path.display());
                report.written.push(csv_path);
            }
            Err(e) => {
                warn!("Failed to write {}: {:#}", csv_path.display(), e);
                report.skip(CSV_FILE, format!("write failed: {:#}", e));
            }
        }

        info!(
            "Generated {} artifact(s) in {}",
            report.written.len(),
            self.output_dir.display()
        );
        Ok(report)
    }
}
