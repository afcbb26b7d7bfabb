//! SQLite persistence for movie records

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::types::{MovieRecord, RecordStatus};

/// Length of the ranked lists in `StoreStats`
pub const STATS_TOP_N: usize = 5;

const SELECT_COLUMNS: &str = "SELECT rank, title, director, actors, year, country, genres, rating, \
     vote_count, quote, ai_summary, status, created_at FROM movies";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: u32,
    /// (rank, reason) for records the database refused
    pub rejected: Vec<(u32, String)>,
}

/// Aggregates over the stored records, computed on read
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StoreStats {
    pub total: u32,
    /// Rounded to two decimals; `None` when the table is empty
    pub average_rating: Option<f64>,
    pub year_range: Option<(i32, i32)>,
    pub total_votes: u64,
    pub structured: u32,
    pub partial: u32,
    pub raw: u32,
    /// (director, movies) by frequency, ties by name
    pub top_directors: Vec<(String, u32)>,
    /// Highest rated first, ties by rank
    pub top_rated: Vec<MovieRecord>,
}

fn write_record(conn: &Connection, record: &MovieRecord) -> Result<(), StoreError> {
    let actors = serde_json::to_string(&record.actors)?;
    let genres = serde_json::to_string(&record.genres)?;
    let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

    conn.execute(
        "INSERT OR REPLACE INTO movies
         (rank, title, director, actors, year, country, genres, rating, vote_count,
          quote, ai_summary, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            record.rank,
            record.title,
            record.director,
            actors,
            record.year,
            record.country,
            genres,
            record.rating,
            record.vote_count,
            record.quote,
            record.ai_summary,
            record.status.as_str(),
            created_at,
        ],
    )
    .map_err(|e| StoreError::from_write(record.rank, e))?;
    Ok(())
}

pub struct Store {
    conn: Connection,
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn json_list(row: &Row, idx: usize) -> rusqlite::Result<Vec<String>> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn row_to_record(row: &Row) -> rusqlite::Result<MovieRecord> {
    let status: String = row.get(11)?;
    let created_at: String = row.get(12)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| conversion_error(12, e))?
        .with_timezone(&Utc);

    Ok(MovieRecord {
        rank: row.get(0)?,
        title: row.get(1)?,
        director: row.get(2)?,
        actors: json_list(row, 3)?,
        year: row.get(4)?,
        country: row.get(5)?,
        genres: json_list(row, 6)?,
        rating: row.get(7)?,
        vote_count: row.get(8)?,
        quote: row.get(9)?,
        ai_summary: row.get(10)?,
        status: RecordStatus::from_db(&status),
        created_at: Some(created_at),
    })
}

impl Store {
    /// Open (or create) the database file, creating parent directories
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        debug!("Opened database {}", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        let schema = include_str!("../schema.sql");
        conn.execute_batch(schema)?;
        Ok(Self { conn })
    }

    /// Insert a record; a record with an existing rank replaces it
    pub fn insert(&self, record: &MovieRecord) -> Result<(), StoreError> {
        write_record(&self.conn, record)
    }

    /// Insert records in one transaction, collecting per-record rejections
    pub fn insert_batch(&mut self, records: &[MovieRecord]) -> Result<BatchOutcome, StoreError> {
        let tx = self.conn.transaction()?;
        let mut outcome = BatchOutcome::default();
        for record in records {
            match write_record(&tx, record) {
                Ok(()) => outcome.inserted += 1,
                Err(StoreError::Constraint { rank, message }) => {
                    warn!("Rejected record for rank {}: {}", rank, message);
                    outcome.rejected.push((rank, message));
                }
                Err(e) => return Err(e),
            }
        }
        tx.commit()?;
        info!(
            "Saved {} movies ({} rejected)",
            outcome.inserted,
            outcome.rejected.len()
        );
        Ok(outcome)
    }

    /// All records ordered by rank
    pub fn get_all(&self) -> Result<Vec<MovieRecord>, StoreError> {
        self.query(&format!("{} ORDER BY rank", SELECT_COLUMNS), [])
    }

    pub fn get_by_rank(&self, rank: u32) -> Result<Option<MovieRecord>, StoreError> {
        let mut records = self.query(&format!("{} WHERE rank = ?1", SELECT_COLUMNS), [rank])?;
        Ok(records.pop())
    }

    /// Records released in `year`, best rated first
    pub fn get_by_year(&self, year: i32) -> Result<Vec<MovieRecord>, StoreError> {
        self.query(
            &format!(
                "{} WHERE year = ?1 ORDER BY rating DESC, rank ASC",
                SELECT_COLUMNS
            ),
            [year],
        )
    }

    fn query<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<MovieRecord>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let records = stmt
            .query_map(params, row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn count(&self) -> Result<u32, StoreError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM movies", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Directors by number of listed movies, ties broken by name
    pub fn top_directors(&self, limit: usize) -> Result<Vec<(String, u32)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT director, COUNT(*) AS movies FROM movies
             WHERE director IS NOT NULL AND director != ''
             GROUP BY director
             ORDER BY movies DESC, director ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Genre frequencies across all records
    pub fn genre_distribution(&self) -> Result<Vec<(String, u32)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT genre.value, COUNT(*) AS movies
             FROM movies, json_each(movies.genres) AS genre
             GROUP BY genre.value
             ORDER BY movies DESC, genre.value ASC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Movies per release year, oldest first
    pub fn year_distribution(&self) -> Result<Vec<(i32, u32)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT year, COUNT(*) FROM movies
             WHERE year IS NOT NULL
             GROUP BY year
             ORDER BY year",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_stats(&self) -> Result<StoreStats, StoreError> {
        let (total, average, min_year, max_year, total_votes): (
            u32,
            Option<f64>,
            Option<i32>,
            Option<i32>,
            i64,
        ) = self.conn.query_row(
            "SELECT COUNT(*), AVG(rating), MIN(year), MAX(year), COALESCE(SUM(vote_count), 0)
             FROM movies",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;

        let mut stats = StoreStats {
            total,
            average_rating: average.map(|avg| (avg * 100.0).round() / 100.0),
            year_range: min_year.zip(max_year),
            total_votes: total_votes.max(0) as u64,
            ..StoreStats::default()
        };

        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM movies GROUP BY status")?;
        let status_counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (status, count) in status_counts {
            match RecordStatus::from_db(&status) {
                RecordStatus::Structured => stats.structured += count,
                RecordStatus::Partial => stats.partial += count,
                RecordStatus::Raw => stats.raw += count,
            }
        }

        stats.top_directors = self.top_directors(STATS_TOP_N)?;
        stats.top_rated = self.query(
            &format!("{} ORDER BY rating DESC, rank ASC LIMIT ?1", SELECT_COLUMNS),
            [STATS_TOP_N as i64],
        )?;
        Ok(stats)
    }

    /// Delete every record, returning how many were removed
    pub fn clear(&self) -> Result<usize, StoreError> {
        let removed = self.conn.execute("DELETE FROM movies", [])?;
        info!("Deleted {} movies from the database", removed);
        Ok(removed)
    }
}
