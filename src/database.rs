use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::dispatcher::{AuditLog, ScrobbleRecord};

/// A scrobble as stored in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredScrobble {
    pub id: i64,
    #[serde(flatten)]
    pub record: ScrobbleRecord,
    pub recorded_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrobbleStats {
    pub total_scrobbles: i64,
    pub top_tracks: Vec<TrackStats>,
    pub top_artists: Vec<ArtistStats>,
    pub recent: Vec<StoredScrobble>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackStats {
    pub artist: String,
    pub track: String,
    pub album: Option<String>,
    pub play_count: i64,
    pub last_played: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtistStats {
    pub artist: String,
    pub play_count: i64,
    pub track_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub total_scrobbles: i64,
    pub distinct_tracks: i64,
    pub distinct_artists: i64,
    pub first_scrobble: Option<i64>,
    pub last_scrobble: Option<i64>,
}

pub struct Database {
    conn: Connection,
}

fn time_filter(start_time: Option<i64>, end_time: Option<i64>) -> String {
    match (start_time, end_time) {
        (Some(start), Some(end)) => format!("WHERE timestamp >= {} AND timestamp <= {}", start, end),
        (Some(start), None) => format!("WHERE timestamp >= {}", start),
        (None, Some(end)) => format!("WHERE timestamp <= {}", end),
        (None, None) => String::new(),
    }
}

fn row_to_scrobble(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredScrobble> {
    Ok(StoredScrobble {
        id: row.get(0)?,
        record: ScrobbleRecord {
            artist: row.get(1)?,
            track: row.get(2)?,
            album: row.get(3)?,
            album_artist: row.get(4)?,
            timestamp: row.get(5)?,
        },
        recorded_at: row.get(6)?,
    })
}

impl Database {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)
            .context("Failed to open database connection")?;

        let db = Database { conn };
        db.initialize_schema()?;
        Ok(db)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS scrobbles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                artist TEXT NOT NULL,
                track TEXT NOT NULL,
                album TEXT,
                album_artist TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                recorded_at INTEGER NOT NULL
            )",
            [],
        ).context("Failed to create scrobbles table")?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_scrobbles_timestamp ON scrobbles (timestamp)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_scrobbles_artist ON scrobbles (artist)",
            [],
        )?;

        Ok(())
    }

    pub fn append_scrobble(&self, record: &ScrobbleRecord, recorded_at: i64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO scrobbles (artist, track, album, album_artist, timestamp, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.artist,
                record.track,
                record.album,
                record.album_artist,
                record.timestamp,
                recorded_at
            ],
        ).context("Failed to append scrobble")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent scrobbles first.
    pub fn recent_scrobbles(
        &self,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> Result<Vec<StoredScrobble>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, artist, track, album, album_artist, timestamp, recorded_at
             FROM scrobbles
             {}
             ORDER BY timestamp DESC, id DESC
             LIMIT ?1",
            time_filter(start_time, end_time)
        ))?;

        let scrobbles = stmt
            .query_map(params![limit as i64], row_to_scrobble)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(scrobbles)
    }

    /// Every scrobble in insertion order.
    pub fn all_scrobbles(&self) -> Result<Vec<ScrobbleRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, artist, track, album, album_artist, timestamp, recorded_at
             FROM scrobbles
             ORDER BY id ASC",
        )?;

        let records = stmt
            .query_map([], row_to_scrobble)?
            .map(|row| row.map(|stored| stored.record))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Totals plus the top `limit` tracks and artists and the `limit` most recent scrobbles.
    pub fn get_scrobble_stats(
        &self,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> Result<ScrobbleStats> {
        let filter = time_filter(start_time, end_time);

        let total_scrobbles: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM scrobbles {}", filter),
            [],
            |row| row.get(0),
        )?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT artist, track, MAX(album), COUNT(*) as play_count, MAX(timestamp)
             FROM scrobbles
             {}
             GROUP BY artist, track
             ORDER BY play_count DESC, MAX(timestamp) DESC
             LIMIT ?1",
            filter
        ))?;

        let top_tracks: Vec<TrackStats> = stmt.query_map(params![limit as i64], |row| {
            Ok(TrackStats {
                artist: row.get(0)?,
                track: row.get(1)?,
                album: row.get(2)?,
                play_count: row.get(3)?,
                last_played: row.get(4)?,
            })
        })?.collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT artist, COUNT(*) as play_count, COUNT(DISTINCT track) as track_count
             FROM scrobbles
             {}
             GROUP BY artist
             ORDER BY play_count DESC, artist ASC
             LIMIT ?1",
            filter
        ))?;

        let top_artists: Vec<ArtistStats> = stmt.query_map(params![limit as i64], |row| {
            Ok(ArtistStats {
                artist: row.get(0)?,
                play_count: row.get(1)?,
                track_count: row.get(2)?,
            })
        })?.collect::<Result<Vec<_>, _>>()?;

        let recent = self.recent_scrobbles(start_time, end_time, limit)?;

        Ok(ScrobbleStats {
            total_scrobbles,
            top_tracks,
            top_artists,
            recent,
        })
    }

    pub fn get_database_stats(&self) -> Result<DatabaseStats> {
        let (total_scrobbles, first_scrobble, last_scrobble): (i64, Option<i64>, Option<i64>) = self.conn.query_row(
            "SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM scrobbles",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let distinct_tracks: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM (SELECT DISTINCT artist, track FROM scrobbles)",
            [],
            |row| row.get(0),
        )?;

        let distinct_artists: i64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT artist) FROM scrobbles",
            [],
            |row| row.get(0),
        )?;

        Ok(DatabaseStats {
            total_scrobbles,
            distinct_tracks,
            distinct_artists,
            first_scrobble,
            last_scrobble,
        })
    }

    pub fn last_scrobble(&self) -> Result<Option<StoredScrobble>> {
        let scrobble = self.conn.query_row(
            "SELECT id, artist, track, album, album_artist, timestamp, recorded_at
             FROM scrobbles
             ORDER BY id DESC
             LIMIT 1",
            [],
            row_to_scrobble,
        ).optional()?;
        Ok(scrobble)
    }
}

impl AuditLog for Database {
    fn record(&self, scrobble: &ScrobbleRecord, recorded_at: DateTime<Utc>) -> Result<()> {
        self.append_scrobble(scrobble, recorded_at.timestamp())?;
        Ok(())
    }
}
