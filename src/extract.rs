//! Turns item blocks into movie records with one completion call per item.
//!
//! The completion's answer is decoded strictly; any failure falls back to a
//! partial record recovered from the listing text, so extraction never fails.

use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ExtractError, SchemaError};
use crate::llm::{ChatRequest, CompletionClient, Usage};
use crate::types::{
    max_plausible_year, ItemBlock, MovieRecord, RecordStatus, LABEL_INFO, LABEL_QUOTE,
    LABEL_RATING, LABEL_TITLE, LABEL_VOTES, MIN_YEAR,
};
use crate::utils::truncate;

const SYSTEM_PROMPT: &str = "You are a precise data extraction assistant for a film catalogue. \
You read the text of one entry from the Douban Top 250 movie listing and answer with a single JSON object. \
Use only information present in the text. Names keep the spelling used in the text. \
Never add commentary outside the JSON object.";

const RESPONSE_SCHEMA: &str = r#"{
  "title": "primary title (string)",
  "director": "director name(s) (string)",
  "actors": ["main cast (array of strings, may be empty)"],
  "year": 1994,
  "country": "production country; join several with \", \" (string)",
  "genres": ["genre (array of strings)"],
  "rating": 9.7,
  "vote_count": 3000000,
  "quote": "tagline (string or null)",
  "summary": "one or two sentence synopsis (string)"
}"#;

fn user_prompt(text: &str) -> String {
    format!(
        "Extract the movie described below.\n\n\
         Listing entry:\n{}\n\n\
         Answer with a JSON object using exactly these keys:\n{}\n\n\
         Rules:\n\
         - year is a 4-digit integer\n\
         - rating is a number between 0 and 10, vote_count a non-negative integer\n\
         - genres and actors are arrays even when there is a single value",
        text, RESPONSE_SCHEMA
    )
}

fn required_string(obj: &Map<String, Value>, key: &str, violations: &mut Vec<String>) -> Option<String> {
    match obj.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::String(_)) => {
            violations.push(format!("{} is empty", key));
            None
        }
        Some(other) => {
            violations.push(format!("{} must be a string, got {}", key, type_name(other)));
            None
        }
        None => {
            violations.push(format!("{} is missing", key));
            None
        }
    }
}

fn string_list(obj: &Map<String, Value>, key: &str, violations: &mut Vec<String>) -> Option<Vec<String>> {
    let Some(value) = obj.get(key) else {
        violations.push(format!("{} is missing", key));
        return None;
    };
    let Value::Array(items) = value else {
        violations.push(format!("{} must be an array, got {}", key, type_name(value)));
        return None;
    };

    let mut list = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        match item {
            Value::String(s) if !s.trim().is_empty() => list.push(s.trim().to_string()),
            _ => {
                violations.push(format!("{}[{}] must be a non-empty string", key, idx));
                return None;
            }
        }
    }
    Some(list)
}

fn year_field(obj: &Map<String, Value>, violations: &mut Vec<String>) -> Option<i32> {
    let max_year = max_plausible_year();
    match obj.get("year") {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(year) if (MIN_YEAR as i64..=max_year as i64).contains(&year) => Some(year as i32),
            Some(year) => {
                violations.push(format!(
                    "year {} is outside {}..={}",
                    year, MIN_YEAR, max_year
                ));
                None
            }
            None => {
                violations.push(format!("year must be an integer, got {}", n));
                None
            }
        },
        Some(other) => {
            violations.push(format!("year must be an integer, got {}", type_name(other)));
            None
        }
        None => {
            violations.push("year is missing".to_string());
            None
        }
    }
}

fn country_field(obj: &Map<String, Value>, violations: &mut Vec<String>) -> Option<String> {
    match obj.get("country") {
        Some(Value::Array(_)) => {
            let countries = string_list(obj, "country", violations)?;
            if countries.is_empty() {
                violations.push("country is empty".to_string());
                return None;
            }
            Some(countries.join(", "))
        }
        _ => required_string(obj, "country", violations),
    }
}

fn rating_field(obj: &Map<String, Value>, violations: &mut Vec<String>) -> Option<f64> {
    match obj.get("rating") {
        Some(Value::Number(n)) => match n.as_f64() {
            Some(rating) if (0.0..=10.0).contains(&rating) => Some(rating),
            _ => {
                violations.push(format!("rating {} is outside 0..=10", n));
                None
            }
        },
        Some(other) => {
            violations.push(format!("rating must be a number, got {}", type_name(other)));
            None
        }
        None => {
            violations.push("rating is missing".to_string());
            None
        }
    }
}

fn vote_count_field(obj: &Map<String, Value>, violations: &mut Vec<String>) -> Option<u64> {
    match obj.get("vote_count") {
        // Stored as a SQLite INTEGER, so it must fit in an i64
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|v| u64::try_from(v).ok())
            .or_else(|| {
                violations.push(format!("vote_count must be a non-negative integer, got {}", n));
                None
            }),
        Some(other) => {
            violations.push(format!(
                "vote_count must be a non-negative integer, got {}",
                type_name(other)
            ));
            None
        }
        None => {
            violations.push("vote_count is missing".to_string());
            None
        }
    }
}

/// `Some(None)` for an absent or null quote, `None` on a violation
fn quote_field(obj: &Map<String, Value>, violations: &mut Vec<String>) -> Option<Option<String>> {
    match obj.get("quote") {
        None | Some(Value::Null) => Some(None),
        Some(Value::String(s)) => Some(Some(s.trim().to_string()).filter(|s| !s.is_empty())),
        Some(other) => {
            violations.push(format!("quote must be a string or null, got {}", type_name(other)));
            None
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|item| seen.insert(item.clone())).collect()
}

/// Decode a completion answer into a structured record.
///
/// Every field is checked and all violations are reported together.
pub fn decode_response(rank: u32, content: &str) -> Result<MovieRecord, SchemaError> {
    let value: Value = serde_json::from_str(content.trim())
        .map_err(|e| SchemaError::single(format!("response is not valid JSON: {}", e)))?;
    let Value::Object(obj) = value else {
        return Err(SchemaError::single(format!(
            "response must be a JSON object, got {}",
            type_name(&value)
        )));
    };

    let mut violations = Vec::new();
    let fields = (
        required_string(&obj, "title", &mut violations),
        required_string(&obj, "director", &mut violations),
        string_list(&obj, "actors", &mut violations),
        year_field(&obj, &mut violations),
        country_field(&obj, &mut violations),
        string_list(&obj, "genres", &mut violations),
        rating_field(&obj, &mut violations),
        vote_count_field(&obj, &mut violations),
        quote_field(&obj, &mut violations),
        required_string(&obj, "summary", &mut violations),
    );

    let (
        Some(title),
        Some(director),
        Some(actors),
        Some(year),
        Some(country),
        Some(genres),
        Some(rating),
        Some(vote_count),
        Some(quote),
        Some(summary),
    ) = fields
    else {
        return Err(SchemaError { violations });
    };

    Ok(MovieRecord {
        rank,
        title,
        director: Some(director),
        actors,
        year: Some(year),
        country: Some(country),
        genres: dedup(genres),
        rating,
        vote_count,
        quote,
        ai_summary: Some(summary),
        status: RecordStatus::Structured,
        created_at: None,
    })
}

/// First standalone 4-digit number in the text that is a plausible release year
fn find_year(text: &str) -> Option<i32> {
    let max_year = max_plausible_year();
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|run| run.len() == 4)
        .filter_map(|run| run.parse::<i32>().ok())
        .find(|year| (MIN_YEAR..=max_year).contains(year))
}

fn parse_votes(text: &str) -> Option<u64> {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse::<i64>().ok().and_then(|v| u64::try_from(v).ok())
}

fn listing_rating(block: &ItemBlock) -> Option<f64> {
    block
        .field(LABEL_RATING)
        .and_then(|r| r.parse::<f64>().ok())
        .filter(|r| (0.0..=10.0).contains(r))
}

fn listing_votes(block: &ItemBlock) -> Option<u64> {
    block.field(LABEL_VOTES).and_then(parse_votes)
}

/// Replace decoded title, rating, votes and quote with the values the listing shows.
///
/// The completion only contributes what the page does not state directly.
fn overlay_listing(mut record: MovieRecord, block: &ItemBlock) -> MovieRecord {
    if let Some(title) = block.field(LABEL_TITLE) {
        record.title = title.to_string();
    }
    if let Some(rating) = listing_rating(block) {
        if rating != record.rating {
            debug!(
                "Rank {}: keeping listing rating {} over decoded {}",
                block.rank, rating, record.rating
            );
        }
        record.rating = rating;
    }
    if let Some(votes) = listing_votes(block) {
        record.vote_count = votes;
    }
    if let Some(quote) = block.field(LABEL_QUOTE) {
        record.quote = Some(quote.to_string());
    }
    record
}

/// Record built from the listing text alone
pub fn fallback_record(block: &ItemBlock, status: RecordStatus) -> MovieRecord {
    let title = block.field(LABEL_TITLE)
        .map(str::to_string)
        .unwrap_or_else(|| MovieRecord::placeholder_title(block.rank));
    let rating = listing_rating(block).unwrap_or(0.0);

    MovieRecord {
        rank: block.rank,
        title,
        director: None,
        actors: Vec::new(),
        year: block.field(LABEL_INFO).and_then(find_year),
        country: None,
        genres: Vec::new(),
        rating,
        vote_count: listing_votes(block).unwrap_or(0),
        quote: block.field(LABEL_QUOTE).map(str::to_string),
        ai_summary: None,
        status,
        created_at: None,
    }
}

/// Record for a run that skips AI parsing
pub fn raw_record(block: &ItemBlock) -> MovieRecord {
    fallback_record(block, RecordStatus::Raw)
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExtractStats {
    pub attempted: u32,
    pub structured: u32,
    pub partial: u32,
    pub usage: Usage,
}

pub struct Extractor<C> {
    client: C,
    model: String,
    temperature: f32,
    stats: ExtractStats,
}

impl<C: CompletionClient> Extractor<C> {
    pub fn new(client: C, config: &Config) -> Self {
        Self {
            client,
            model: config.model.clone(),
            temperature: config.temperature,
            stats: ExtractStats::default(),
        }
    }

    pub fn stats(&self) -> &ExtractStats {
        &self.stats
    }

    fn try_extract(&mut self, block: &ItemBlock) -> Result<MovieRecord, ExtractError> {
        if block.text.trim().is_empty() {
            return Err(ExtractError::EmptyInput);
        }

        let request = ChatRequest::json(
            &self.model,
            self.temperature,
            SYSTEM_PROMPT,
            &user_prompt(&block.text),
        );
        let completion = self.client.complete(&request)?;
        self.stats.usage.add(&completion.usage);
        debug!(
            "Rank {} response: {}",
            block.rank,
            truncate(&completion.content, 200)
        );

        let record = decode_response(block.rank, &completion.content)?;
        Ok(overlay_listing(record, block))
    }

    /// Always yields a record; failures degrade to a partial one
    pub fn extract(&mut self, block: &ItemBlock) -> MovieRecord {
        self.stats.attempted += 1;
        match self.try_extract(block) {
            Ok(record) => {
                self.stats.structured += 1;
                record
            }
            Err(e) => {
                warn!("Extraction for rank {} fell back to listing text: {}", block.rank, e);
                self.stats.partial += 1;
                fallback_record(block, RecordStatus::Partial)
            }
        }
    }

    pub fn extract_all(&mut self, blocks: &[ItemBlock]) -> Vec<MovieRecord> {
        let total = blocks.len();
        let records = blocks
            .iter()
            .enumerate()
            .map(|(idx, block)| {
                info!("Parsing movie {}/{} (rank {})", idx + 1, total, block.rank);
                self.extract(block)
            })
            .collect();

        info!(
            attempted = self.stats.attempted,
            structured = self.stats.structured,
            partial = self.stats.partial,
            total_tokens = self.stats.usage.total_tokens,
            "Extraction statistics"
        );
        records
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::Completion;
    use std::cell::Cell;

    /// Completion client answering from a closure
    pub(crate) struct FnClient<F> {
        pub respond: F,
        pub calls: Cell<u32>,
    }

    impl<F> FnClient<F>
    where
        F: Fn(&ChatRequest) -> Result<Completion, LlmError>,
    {
        pub fn new(respond: F) -> Self {
            Self {
                respond,
                calls: Cell::new(0),
            }
        }
    }

    impl<F> CompletionClient for FnClient<F>
    where
        F: Fn(&ChatRequest) -> Result<Completion, LlmError>,
    {
        fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
            self.calls.set(self.calls.get() + 1);
            (self.respond)(request)
        }
    }

    pub(crate) fn completion(content: &str) -> Result<Completion, LlmError> {
        Ok(Completion {
            content: content.to_string(),
            usage: Usage {
                prompt_tokens: 300,
                completion_tokens: 100,
                total_tokens: 400,
            },
        })
    }

    pub(crate) const SHAWSHANK_JSON: &str = r#"{
        "title": "肖申克的救赎",
        "director": "弗兰克·德拉邦特",
        "actors": ["蒂姆·罗宾斯", "摩根·弗里曼"],
        "year": 1994,
        "country": "美国",
        "genres": ["犯罪", "剧情"],
        "rating": 9.7,
        "vote_count": 3173245,
        "quote": "希望让人自由。",
        "summary": "A banker sentenced to life finds hope and friendship in Shawshank prison."
    }"#;

    pub(crate) fn shawshank_block() -> ItemBlock {
        let mut block = ItemBlock::new(1);
        block.push_field(LABEL_TITLE, "肖申克的救赎");
        block.push_field(
            LABEL_INFO,
            "导演: 弗兰克·德拉邦特 Frank Darabont 主演: 蒂姆·罗宾斯 Tim Robbins /... 1994 / 美国 / 犯罪 剧情",
        );
        block.push_field(LABEL_RATING, "9.7");
        block.push_field(LABEL_VOTES, "3173245人评价");
        block.push_field(LABEL_QUOTE, "希望让人自由。");
        block
    }

    #[test]
    fn test_decode_well_formed_response() {
        let record = decode_response(1, SHAWSHANK_JSON).unwrap();
        assert_eq!(record.title, "肖申克的救赎");
        assert_eq!(record.director.as_deref(), Some("弗兰克·德拉邦特"));
        assert_eq!(record.actors.len(), 2);
        assert_eq!(record.year, Some(1994));
        assert_eq!(record.genres, vec!["犯罪", "剧情"]);
        assert_eq!(record.rating, 9.7);
        assert_eq!(record.vote_count, 3173245);
        assert_eq!(record.status, RecordStatus::Structured);
        assert!(record.ai_summary.is_some());
    }

    #[test]
    fn test_decode_joins_country_arrays() {
        let content = SHAWSHANK_JSON.replace(r#""country": "美国""#, r#""country": ["中国大陆", "中国香港"]"#);
        let record = decode_response(2, &content).unwrap();
        assert_eq!(record.country.as_deref(), Some("中国大陆, 中国香港"));
    }

    #[test]
    fn test_decode_drops_duplicate_genres() {
        let content = SHAWSHANK_JSON.replace(r#"["犯罪", "剧情"]"#, r#"["犯罪", "剧情", "犯罪"]"#);
        assert_eq!(decode_response(1, &content).unwrap().genres, vec!["犯罪", "剧情"]);
    }

    #[test]
    fn test_decode_accepts_null_quote() {
        let content = SHAWSHANK_JSON.replace(r#""quote": "希望让人自由。""#, r#""quote": null"#);
        assert_eq!(decode_response(1, &content).unwrap().quote, None);
    }

    #[test]
    fn test_decode_collects_every_violation() {
        let content = r#"{
            "title": "",
            "director": "某人",
            "actors": "not a list",
            "year": "1994",
            "country": "美国",
            "genres": ["剧情"],
            "rating": "9.7",
            "vote_count": -5,
            "summary": "ok"
        }"#;
        let err = decode_response(1, content).unwrap_err();
        assert_eq!(
            err.violations,
            vec![
                "title is empty".to_string(),
                "actors must be an array, got string".to_string(),
                "year must be an integer, got string".to_string(),
                "rating must be a number, got string".to_string(),
                "vote_count must be a non-negative integer, got -5".to_string(),
            ]
        );
    }

    #[test]
    fn test_decode_rejects_out_of_range_values() {
        let content = SHAWSHANK_JSON
            .replace("\"year\": 1994", "\"year\": 1700")
            .replace("\"rating\": 9.7", "\"rating\": 11");
        let err = decode_response(1, &content).unwrap_err();
        assert_eq!(err.violations.len(), 2);
        assert!(err.violations[0].starts_with("year 1700 is outside"));
        assert!(err.violations[1].starts_with("rating 11 is outside"));
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        assert!(decode_response(1, "[1, 2]").is_err());
        assert!(decode_response(1, "not json").is_err());
        assert!(decode_response(1, "").is_err());
    }

    #[test]
    fn test_extract_structured() {
        let client = FnClient::new(|request: &ChatRequest| {
            assert_eq!(request.messages.len(), 2);
            assert!(request.messages[1].content.contains("肖申克的救赎"));
            completion(SHAWSHANK_JSON)
        });
        let mut extractor = Extractor::new(client, &Config::default());
        let record = extractor.extract(&shawshank_block());

        assert!(record.is_structured());
        assert_eq!(extractor.stats().structured, 1);
        assert_eq!(extractor.stats().usage.total_tokens, 400);
    }

    #[test]
    fn test_decode_rejects_vote_counts_beyond_i64() {
        let content = SHAWSHANK_JSON.replace("3173245", "18446744073709551615");
        let err = decode_response(2, &content).unwrap_err();
        assert_eq!(
            err.violations,
            vec!["vote_count must be a non-negative integer, got 18446744073709551615".to_string()]
        );
        assert_eq!(parse_votes("18446744073709551615人评价"), None);
    }

    #[test]
    fn test_listing_values_win_over_completion() {
        let content = SHAWSHANK_JSON
            .replace("\"rating\": 9.7", "\"rating\": 6.1")
            .replace("\"title\": \"肖申克的救赎\"", "\"title\": \"The Shawshank Redemption\"")
            .replace("3173245", "12")
            .replace("希望让人自由。", "Fear can hold you prisoner.");
        let client = FnClient::new(move |_: &ChatRequest| completion(&content));
        let mut extractor = Extractor::new(client, &Config::default());
        let record = extractor.extract(&shawshank_block());

        assert!(record.is_structured());
        assert_eq!(record.title, "肖申克的救赎");
        assert_eq!(record.rating, 9.7);
        assert_eq!(record.vote_count, 3173245);
        assert_eq!(record.quote.as_deref(), Some("希望让人自由。"));
        // Fields the listing does not state come from the completion
        assert_eq!(record.director.as_deref(), Some("弗兰克·德拉邦特"));
        assert_eq!(record.genres, vec!["犯罪", "剧情"]);
    }

    #[test]
    fn test_decoded_values_kept_when_listing_lacks_them() {
        let mut block = ItemBlock::new(3);
        block.push_field(LABEL_INFO, "1994 / 美国 / 犯罪 剧情");
        let client = FnClient::new(|_: &ChatRequest| completion(SHAWSHANK_JSON));
        let mut extractor = Extractor::new(client, &Config::default());
        let record = extractor.extract(&block);

        assert!(record.is_structured());
        assert_eq!(record.title, "肖申克的救赎");
        assert_eq!(record.rating, 9.7);
        assert_eq!(record.vote_count, 3173245);
    }

    #[test]
    fn test_missing_year_gives_partial_record() {
        let content = SHAWSHANK_JSON.replace("\"year\": 1994,", "");
        let client = FnClient::new(move |_: &ChatRequest| completion(&content));
        let mut extractor = Extractor::new(client, &Config::default());
        let record = extractor.extract(&shawshank_block());

        assert_eq!(record.status, RecordStatus::Partial);
        assert_eq!(record.ai_summary, None);
        // Listing fields survive the fallback
        assert_eq!(record.title, "肖申克的救赎");
        assert_eq!(record.year, Some(1994));
        assert_eq!(record.rating, 9.7);
        assert_eq!(record.vote_count, 3173245);
        assert_eq!(record.quote.as_deref(), Some("希望让人自由。"));
        assert_eq!(extractor.stats().partial, 1);
    }

    #[test]
    fn test_endpoint_failure_gives_partial_record() {
        let client = FnClient::new(|_: &ChatRequest| {
            Err(LlmError::HttpStatus {
                code: 401,
                body: "unauthorized".to_string(),
            })
        });
        let mut extractor = Extractor::new(client, &Config::default());
        let record = extractor.extract(&shawshank_block());
        assert_eq!(record.status, RecordStatus::Partial);
        assert_eq!(record.director, None);
    }

    #[test]
    fn test_empty_text_still_yields_record() {
        let client = FnClient::new(|_: &ChatRequest| completion(SHAWSHANK_JSON));
        let mut extractor = Extractor::new(client, &Config::default());
        let record = extractor.extract(&ItemBlock::new(42));

        assert_eq!(record.rank, 42);
        assert_eq!(record.title, "Unknown #42");
        assert_eq!(record.status, RecordStatus::Partial);
        assert_eq!(record.rating, 0.0);
        assert_eq!(extractor.client.calls.get(), 0);
    }

    #[test]
    fn test_raw_record_skips_endpoint() {
        let record = raw_record(&shawshank_block());
        assert_eq!(record.status, RecordStatus::Raw);
        assert_eq!(record.title, "肖申克的救赎");
        assert_eq!(record.year, Some(1994));
        assert_eq!(record.ai_summary, None);
    }

    #[test]
    fn test_find_year_ignores_other_numbers() {
        assert_eq!(find_year("刺激1995(台) / 12345 / 2001 / 日本"), Some(1995));
        assert_eq!(find_year("0042 / 9999"), None);
        assert_eq!(find_year(""), None);
    }

    #[test]
    fn test_extract_all_keeps_order() {
        let client = FnClient::new(|_: &ChatRequest| completion("{}"));
        let mut extractor = Extractor::new(client, &Config::default());
        let blocks: Vec<ItemBlock> = (1..=3)
            .map(|rank| {
                let mut block = ItemBlock::new(rank);
                block.push_field(LABEL_TITLE, &format!("Movie {}", rank));
                block
            })
            .collect();

        let records = extractor.extract_all(&blocks);
        assert_eq!(
            records.iter().map(|r| r.rank).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(extractor.stats().attempted, 3);
        assert_eq!(extractor.stats().partial, 3);
    }
}
