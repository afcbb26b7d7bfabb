//! Rate-limited listing fetcher
//!
//! One blocking GET per listing page, a randomized politeness delay before
//! every request, and a rotating user-agent. Requests are never issued
//! concurrently.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use scraper::{ElementRef, Html, Selector};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::FetchError;
use crate::types::{
    ItemBlock, LABEL_INFO, LABEL_LINK, LABEL_OTHER_TITLES, LABEL_QUOTE, LABEL_RATING, LABEL_TITLE,
    LABEL_VOTES,
};
use crate::utils::{backoff_delay, collapse_whitespace};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
];

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
const ACCEPT_LANGUAGES: &str = "en-US,en;q=0.9,zh-CN;q=0.8,zh;q=0.7";

/// Politeness delay and request identity, driven by an injectable RNG.
pub struct RateLimiter<R = StdRng> {
    min: Duration,
    max: Duration,
    rng: R,
}

impl RateLimiter<StdRng> {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self::with_rng(min, max, StdRng::from_entropy())
    }

    /// No delay at all; user-agents still rotate deterministically
    #[cfg(test)]
    pub fn disabled() -> Self {
        Self::with_rng(Duration::ZERO, Duration::ZERO, StdRng::seed_from_u64(0))
    }
}

impl<R: Rng> RateLimiter<R> {
    pub fn with_rng(min: Duration, max: Duration, rng: R) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self { min, max, rng }
    }

    /// Draw the next delay uniformly from `[min, max]`
    pub fn next_delay(&mut self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let secs = self
            .rng
            .gen_range(self.min.as_secs_f64()..=self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Sleep for the next delay and return how long it was
    pub fn wait(&mut self) -> Duration {
        let delay = self.next_delay();
        if !delay.is_zero() {
            debug!("Delaying for {:.2} seconds", delay.as_secs_f64());
            thread::sleep(delay);
        }
        delay
    }

    pub fn user_agent(&mut self) -> &'static str {
        USER_AGENTS
            .choose(&mut self.rng)
            .copied()
            .unwrap_or(USER_AGENTS[0])
    }
}

/// Something that can produce the item blocks of one listing page.
pub trait ListingSource {
    fn fetch_page(&mut self, page: u32) -> Result<Vec<ItemBlock>, FetchError>;

    /// Fetch pages `1..=pages` in order, isolating failures to their page
    fn fetch_all(&mut self, pages: u32) -> FetchReport {
        collect_pages(self, pages)
    }
}

fn collect_pages<S: ListingSource + ?Sized>(source: &mut S, pages: u32) -> FetchReport {
    let mut report = FetchReport::default();
    info!("Starting to fetch {} page(s)", pages);
    for page in 1..=pages {
        match source.fetch_page(page) {
            Ok(blocks) => {
                info!("Collected {} movies from page {}", blocks.len(), page);
                report.blocks.extend(blocks);
            }
            Err(e) => {
                warn!("Skipping page {}: {}", page, e);
                report.failed_pages.push((page, e.to_string()));
            }
        }
    }
    info!(
        "Fetch finished: {} movies, {} failed page(s)",
        report.blocks.len(),
        report.failed_pages.len()
    );
    report
}

/// Result of fetching a range of pages
#[derive(Debug, Default)]
pub struct FetchReport {
    pub blocks: Vec<ItemBlock>,
    /// (page, reason) for pages that exhausted their retries
    pub failed_pages: Vec<(u32, String)>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchStats {
    pub pages_fetched: u32,
    pub pages_failed: u32,
    pub movies_extracted: u32,
    pub retries: u32,
}

/// CSS selectors for one listing entry
struct ListingSelectors {
    item: Selector,
    title: Selector,
    other: Selector,
    info: Selector,
    rating: Selector,
    star_spans: Selector,
    quote: Selector,
    link: Selector,
}

fn selector(css: &'static str) -> Selector {
    Selector::parse(css).unwrap_or_else(|e| panic!("invalid selector {:?}: {}", css, e))
}

impl ListingSelectors {
    fn new() -> Self {
        Self {
            item: selector("div.item"),
            title: selector("div.hd span.title"),
            other: selector("div.hd span.other"),
            info: selector("div.bd > p"),
            rating: selector("span.rating_num"),
            star_spans: selector("div.star > span"),
            quote: selector("span.inq"),
            link: selector("div.hd a"),
        }
    }
}

fn element_text(element: ElementRef) -> String {
    collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "))
}

/// Alternate titles are rendered as " / Name"; drop the leading separator
fn strip_separator(text: &str) -> &str {
    text.trim().trim_start_matches('/').trim()
}

fn parse_item(item: ElementRef, rank: u32, selectors: &ListingSelectors) -> ItemBlock {
    let mut block = ItemBlock::new(rank);

    let mut titles = item.select(&selectors.title).map(element_text);
    if let Some(title) = titles.next() {
        block.push_field(LABEL_TITLE, &title);
    }
    let other_titles: Vec<String> = titles
        .chain(item.select(&selectors.other).map(element_text))
        .flat_map(|t| {
            t.split('/')
                .map(|part| strip_separator(part).to_string())
                .collect::<Vec<_>>()
        })
        .filter(|t| !t.is_empty())
        .collect();
    block.push_field(LABEL_OTHER_TITLES, &other_titles.join(" / "));

    // The info paragraph is the one without a class ("quote" holds the tagline)
    if let Some(info) = item
        .select(&selectors.info)
        .find(|p| p.value().classes().all(|c| c != "quote"))
    {
        block.push_field(LABEL_INFO, &element_text(info));
    }

    if let Some(rating) = item.select(&selectors.rating).next() {
        block.push_field(LABEL_RATING, &element_text(rating));
    }
    if let Some(votes) = item
        .select(&selectors.star_spans)
        .map(element_text)
        .filter(|t| !t.is_empty())
        .last()
    {
        block.push_field(LABEL_VOTES, &votes);
    }
    if let Some(quote) = item.select(&selectors.quote).next() {
        block.push_field(LABEL_QUOTE, &element_text(quote));
    }
    if let Some(href) = item
        .select(&selectors.link)
        .next()
        .and_then(|a| a.value().attr("href"))
    {
        block.push_field(LABEL_LINK, href);
    }

    block
}

/// Split a listing page into one item block per entry.
///
/// `page` is 1-based; ranks continue from the previous pages.
pub fn parse_listing(html: &str, page: u32, per_page: u32) -> Vec<ItemBlock> {
    let selectors = ListingSelectors::new();
    let document = Html::parse_document(html);
    let first_rank = page.saturating_sub(1) * per_page + 1;

    document
        .select(&selectors.item)
        .enumerate()
        .map(|(idx, item)| parse_item(item, first_rank + idx as u32, &selectors))
        .collect()
}

pub struct Fetcher<R = StdRng> {
    client: Client,
    base_url: String,
    per_page: u32,
    retries: u32,
    backoff: Duration,
    limiter: RateLimiter<R>,
    stats: FetchStats,
}

impl Fetcher<StdRng> {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let limiter = RateLimiter::new(config.delay_min(), config.delay_max());
        Self::with_limiter(config, limiter)
    }
}

impl<R: Rng> Fetcher<R> {
    pub fn with_limiter(config: &Config, limiter: RateLimiter<R>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            per_page: config.per_page,
            retries: config.fetch_retries,
            backoff: config.retry_backoff(),
            limiter,
            stats: FetchStats::default(),
        })
    }

    pub fn page_url(&self, page: u32) -> String {
        let start = page.saturating_sub(1) * self.per_page;
        format!("{}?start={}", self.base_url, start)
    }

    fn get_with_retries(&mut self, page: u32, url: &str) -> Result<String, FetchError> {
        let attempts = self.retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = backoff_delay(self.backoff, attempt - 1);
                warn!(
                    "Retrying page {} (attempt {}/{}) after {:?}",
                    page, attempt, attempts, delay
                );
                thread::sleep(delay);
                self.stats.retries += 1;
            }

            self.limiter.wait();
            let user_agent = self.limiter.user_agent();

            let result = self
                .client
                .get(url)
                .header(USER_AGENT, user_agent)
                .header(ACCEPT, ACCEPT_HTML)
                .header(ACCEPT_LANGUAGE, ACCEPT_LANGUAGES)
                .send();

            match result {
                Ok(response) if response.status().is_success() => match response.text() {
                    Ok(body) => return Ok(body),
                    Err(e) => last_error = format!("failed to read body: {}", e),
                },
                Ok(response) => {
                    let status = response.status();
                    if status.as_u16() == 403 {
                        warn!("Access forbidden (403) for {}; the IP may be blocked", url);
                    }
                    last_error = format!("HTTP {}", status);
                }
                Err(e) if e.is_timeout() => last_error = format!("request timed out: {}", e),
                Err(e) => last_error = format!("request error: {}", e),
            }
            warn!("Request for page {} failed: {}", page, last_error);
        }

        Err(FetchError::Network {
            page,
            attempts,
            reason: last_error,
        })
    }
}

impl<R: Rng> ListingSource for Fetcher<R> {
    fn fetch_page(&mut self, page: u32) -> Result<Vec<ItemBlock>, FetchError> {
        let url = self.page_url(page);
        info!("Fetching page {}: {}", page, url);

        let html = match self.get_with_retries(page, &url) {
            Ok(html) => html,
            Err(e) => {
                self.stats.pages_failed += 1;
                return Err(e);
            }
        };
        self.stats.pages_fetched += 1;

        let blocks = parse_listing(&html, page, self.per_page);
        if blocks.is_empty() {
            warn!("Page {} contained no listing entries", page);
        }
        self.stats.movies_extracted += blocks.len() as u32;
        Ok(blocks)
    }

    fn fetch_all(&mut self, pages: u32) -> FetchReport {
        debug!("Listing source: {}", self.base_url);
        let report = collect_pages(self, pages);
        info!(
            pages_fetched = self.stats.pages_fetched,
            pages_failed = self.stats.pages_failed,
            movies = self.stats.movies_extracted,
            retries = self.stats.retries,
            "Scraping statistics"
        );
        report
    }
}
