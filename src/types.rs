//! Movie record types shared by every pipeline stage

use chrono::{DateTime, Datelike, Utc};

/// Earliest release year accepted as plausible
pub const MIN_YEAR: i32 = 1870;

/// Latest release year accepted as plausible (next year, for announced titles)
pub fn max_plausible_year() -> i32 {
    Utc::now().year() + 1
}

/// How a record's fields were obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordStatus {
    /// Completion endpoint answered and the answer passed schema validation
    Structured,
    /// Extraction was attempted and failed; only listing fields are filled in
    Partial,
    /// AI parsing was skipped; only listing fields are filled in
    Raw,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Structured => "structured",
            RecordStatus::Partial => "partial",
            RecordStatus::Raw => "raw",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "structured" => RecordStatus::Structured,
            "raw" => RecordStatus::Raw,
            _ => RecordStatus::Partial,
        }
    }
}

/// One entry of the Top 250 listing
#[derive(Debug, Clone, PartialEq)]
pub struct MovieRecord {
    pub rank: u32,
    pub title: String,
    pub director: Option<String>,
    pub actors: Vec<String>,
    pub year: Option<i32>,
    /// Comma-joined when a film has several production countries
    pub country: Option<String>,
    pub genres: Vec<String>,
    pub rating: f64,
    pub vote_count: u64,
    pub quote: Option<String>,
    pub ai_summary: Option<String>,
    pub status: RecordStatus,
    /// Assigned by the store on insert
    pub created_at: Option<DateTime<Utc>>,
}

impl MovieRecord {
    pub fn is_structured(&self) -> bool {
        self.status == RecordStatus::Structured
    }

    /// Title used when nothing better can be recovered for a rank
    pub fn placeholder_title(rank: u32) -> String {
        format!("Unknown #{}", rank)
    }
}

// Labels used in item block text, one `label: value` pair per line
pub const LABEL_TITLE: &str = "title";
pub const LABEL_OTHER_TITLES: &str = "other titles";
pub const LABEL_INFO: &str = "info";
pub const LABEL_RATING: &str = "rating";
pub const LABEL_VOTES: &str = "votes";
pub const LABEL_QUOTE: &str = "quote";
pub const LABEL_LINK: &str = "link";

/// Raw text of a single listing entry, plus its position in the listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemBlock {
    pub rank: u32,
    pub text: String,
}

impl ItemBlock {
    pub fn new(rank: u32) -> Self {
        Self {
            rank,
            text: String::new(),
        }
    }

    /// Append a labeled line; empty values are dropped
    pub fn push_field(&mut self, label: &str, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(label);
        self.text.push_str(": ");
        self.text.push_str(value);
    }

    /// Look up the first line carrying `label`
    pub fn field(&self, label: &str) -> Option<&str> {
        self.text.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim() == label {
                Some(value.trim()).filter(|v| !v.is_empty())
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_block_fields() {
        let mut block = ItemBlock::new(3);
        block.push_field(LABEL_TITLE, " 霸王别姬 ");
        block.push_field(LABEL_QUOTE, "");
        block.push_field(LABEL_INFO, "导演: 陈凯歌 Kaige Chen / 1993 / 中国大陆 / 剧情 爱情");

        assert_eq!(block.field(LABEL_TITLE), Some("霸王别姬"));
        assert_eq!(block.field(LABEL_QUOTE), None);
        // Values containing ':' keep everything after the first separator
        assert_eq!(
            block.field(LABEL_INFO),
            Some("导演: 陈凯歌 Kaige Chen / 1993 / 中国大陆 / 剧情 爱情")
        );
        assert_eq!(block.text.lines().count(), 2);
    }

    #[test]
    fn test_field_on_unlabeled_text() {
        let block = ItemBlock {
            rank: 1,
            text: "just some words\nwithout labels".to_string(),
        };
        assert_eq!(block.field(LABEL_TITLE), None);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            RecordStatus::Structured,
            RecordStatus::Partial,
            RecordStatus::Raw,
        ] {
            assert_eq!(RecordStatus::from_db(status.as_str()), status);
        }
        assert_eq!(RecordStatus::from_db("bogus"), RecordStatus::Partial);
    }
}
