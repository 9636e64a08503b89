use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;

use plexfm::database::{ArtistStats, Database, StoredScrobble, TrackStats};
use plexfm::ScrobbleRecord;

#[derive(Parser)]
#[command(name = "plexfm-cli")]
#[command(about = "Query the Plex scrobble history")]
#[command(version)]
struct Args {
    /// Path to the SQLite scrobble history
    #[arg(short, long, default_value = plexfm::DEFAULT_DB_PATH)]
    database: String,

    /// Output format
    #[arg(short, long, default_value = "human")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Csv,
}

#[derive(Subcommand)]
enum Commands {
    /// Show submitted scrobbles, newest first
    History {
        /// Time period to show
        #[arg(short, long, default_value = "today")]
        period: TimePeriod,

        /// Custom start date (YYYY-MM-DD format, used with 'custom' period)
        #[arg(long)]
        start_date: Option<String>,

        /// Custom end date (YYYY-MM-DD format, used with 'custom' period)
        #[arg(long)]
        end_date: Option<String>,

        /// Number of scrobbles to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Show the most scrobbled tracks
    TopTracks {
        /// Time period to analyze
        #[arg(short, long, default_value = "week")]
        period: TimePeriod,

        /// Number of tracks to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show the most scrobbled artists
    TopArtists {
        /// Time period to analyze
        #[arg(short, long, default_value = "week")]
        period: TimePeriod,

        /// Number of artists to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Dump every scrobble (JSON array unless --format csv)
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show history database status
    Status,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum TimePeriod {
    Today,
    Week,
    Month,
    Year,
    AllTime,
    Custom,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let db_path = expand_path(&args.database)?;

    if !db_path.exists() {
        eprintln!("Database not found at: {}", db_path.display());
        eprintln!("Make sure plexfmd has been running to record scrobbles.");
        std::process::exit(1);
    }

    let database = Database::new(&db_path)
        .context("Failed to open database")?;

    match args.command {
        Commands::History { period, start_date, end_date, limit } => {
            let (start_time, end_time) = parse_time_period(period, start_date, end_date)?;
            let history = database.recent_scrobbles(start_time, end_time, limit)?;

            match args.format {
                OutputFormat::Human => print_history_human(&history),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&history)?),
                OutputFormat::Csv => print_history_csv(&history),
            }
        }

        Commands::TopTracks { period, limit } => {
            let (start_time, end_time) = parse_time_period(period, None, None)?;
            let tracks = database.get_scrobble_stats(start_time, end_time, limit)?.top_tracks;

            match args.format {
                OutputFormat::Human => print_top_tracks_human(&tracks),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&tracks)?),
                OutputFormat::Csv => print_top_tracks_csv(&tracks),
            }
        }

        Commands::TopArtists { period, limit } => {
            let (start_time, end_time) = parse_time_period(period, None, None)?;
            let artists = database.get_scrobble_stats(start_time, end_time, limit)?.top_artists;

            match args.format {
                OutputFormat::Human => print_top_artists_human(&artists),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&artists)?),
                OutputFormat::Csv => print_top_artists_csv(&artists),
            }
        }

        Commands::Export { output } => {
            let records = database.all_scrobbles()?;
            let content = match args.format {
                OutputFormat::Csv => export_csv(&records),
                OutputFormat::Human | OutputFormat::Json => serde_json::to_string_pretty(&records)?,
            };

            match output {
                Some(path) => {
                    let mut file = std::fs::File::create(&path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    writeln!(file, "{}", content)?;
                    eprintln!("Exported {} scrobbles to {}", records.len(), path.display());
                }
                None => println!("{}", content),
            }
        }

        Commands::Status => {
            print_status(&database, &db_path)?;
        }
    }

    Ok(())
}

fn local_timestamp(datetime: NaiveDateTime) -> Result<i64> {
    Local
        .from_local_datetime(&datetime)
        .earliest()
        .map(|dt| dt.timestamp())
        .context("Local time does not exist")
}

fn parse_date(date: &str, hour: u32, min: u32, sec: u32) -> Result<i64> {
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .context("Invalid date format. Use YYYY-MM-DD")?;
    let datetime = date
        .and_hms_opt(hour, min, sec)
        .context("Invalid time of day")?;
    local_timestamp(datetime)
}

fn parse_time_period(
    period: TimePeriod,
    start_date: Option<String>,
    end_date: Option<String>,
) -> Result<(Option<i64>, Option<i64>)> {
    let now = Local::now();

    match period {
        TimePeriod::Today => {
            let start_of_day = now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .context("Invalid start of day")?;
            Ok((Some(local_timestamp(start_of_day)?), None))
        }

        TimePeriod::Week => Ok((Some((now - Duration::days(7)).timestamp()), None)),

        TimePeriod::Month => Ok((Some((now - Duration::days(30)).timestamp()), None)),

        TimePeriod::Year => Ok((Some((now - Duration::days(365)).timestamp()), None)),

        TimePeriod::AllTime => Ok((None, None)),

        TimePeriod::Custom => {
            let start_timestamp = start_date
                .map(|date| parse_date(&date, 0, 0, 0))
                .transpose()?;
            let end_timestamp = end_date
                .map(|date| parse_date(&date, 23, 59, 59))
                .transpose()?;
            Ok((start_timestamp, end_timestamp))
        }
    }
}

fn format_timestamp(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

fn csv_field(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn print_history_human(history: &[StoredScrobble]) {
    println!("🕒 Scrobble History:");
    println!("═══════════════════");

    if history.is_empty() {
        println!("No scrobbles in this period.");
        return;
    }

    for scrobble in history {
        let record = &scrobble.record;
        println!("{} - {}", record.artist, record.track);
        match &record.album {
            Some(album) => println!("   {} [{}]", album, format_timestamp(record.timestamp)),
            None => println!("   [{}]", format_timestamp(record.timestamp)),
        }
        println!();
    }
}

fn print_history_csv(history: &[StoredScrobble]) {
    println!("timestamp,artist,track,album,album_artist");
    for scrobble in history {
        let record = &scrobble.record;
        println!("{},{},{},{},{}",
                 record.timestamp,
                 csv_field(&record.artist),
                 csv_field(&record.track),
                 csv_field(record.album.as_deref().unwrap_or("")),
                 csv_field(&record.album_artist));
    }
}

fn print_top_tracks_human(tracks: &[TrackStats]) {
    println!("🎵 Top Tracks:");
    println!("═════════════");

    for (i, track_stat) in tracks.iter().enumerate() {
        println!("{}. {} - {}", i + 1, track_stat.artist, track_stat.track);
        println!("   {} scrobbles, last {}",
                 track_stat.play_count,
                 format_timestamp(track_stat.last_played));
        println!();
    }
}

fn print_top_tracks_csv(tracks: &[TrackStats]) {
    println!("rank,artist,track,album,play_count,last_played");
    for (i, track_stat) in tracks.iter().enumerate() {
        println!("{},{},{},{},{},{}",
                 i + 1,
                 csv_field(&track_stat.artist),
                 csv_field(&track_stat.track),
                 csv_field(track_stat.album.as_deref().unwrap_or("")),
                 track_stat.play_count,
                 track_stat.last_played);
    }
}

fn print_top_artists_human(artists: &[ArtistStats]) {
    println!("🎤 Top Artists:");
    println!("═══════════════");

    for (i, artist_stat) in artists.iter().enumerate() {
        println!("{}. {}", i + 1, artist_stat.artist);
        println!("   {} scrobbles, {} tracks", artist_stat.play_count, artist_stat.track_count);
        println!();
    }
}

fn print_top_artists_csv(artists: &[ArtistStats]) {
    println!("rank,artist,play_count,track_count");
    for (i, artist_stat) in artists.iter().enumerate() {
        println!("{},{},{},{}",
                 i + 1,
                 csv_field(&artist_stat.artist),
                 artist_stat.play_count,
                 artist_stat.track_count);
    }
}

fn export_csv(records: &[ScrobbleRecord]) -> String {
    let mut out = String::from("artist,track,album,albumArtist,timestamp");
    for record in records {
        out.push('\n');
        out.push_str(&format!("{},{},{},{},{}",
                              csv_field(&record.artist),
                              csv_field(&record.track),
                              csv_field(record.album.as_deref().unwrap_or("")),
                              csv_field(&record.album_artist),
                              record.timestamp));
    }
    out
}

fn print_status(database: &Database, db_path: &std::path::Path) -> Result<()> {
    println!("📊 Scrobble History Status:");
    println!("═══════════════════════════");
    println!("Database file: {}", db_path.display());

    match database.get_database_stats() {
        Ok(stats) => {
            println!("Total scrobbles: {}", stats.total_scrobbles);
            println!("Distinct tracks: {}", stats.distinct_tracks);
            println!("Distinct artists: {}", stats.distinct_artists);

            if let Some(first) = stats.first_scrobble {
                println!("First scrobble: {}", format_timestamp(first));
            }
        }
        Err(e) => {
            println!("Error reading database stats: {}", e);
        }
    }

    if let Some(last) = database.last_scrobble()? {
        let ago = Utc::now().timestamp() - last.record.timestamp;
        println!("Last scrobble: {} ({} ago)",
                 last.record.display_name(),
                 format_duration(ago.max(0)));
    }

    println!();
    println!("Use 'plexfm-cli history' to view recent scrobbles.");
    Ok(())
}

fn expand_path(path: &str) -> Result<PathBuf> {
    if path.starts_with('~') {
        let home = std::env::var("HOME")
            .context("HOME environment variable not set")?;
        Ok(PathBuf::from(path.replacen('~', &home, 1)))
    } else {
        Ok(PathBuf::from(path))
    }
}

fn format_duration(seconds: i64) -> String {
    if seconds < 60 {
        format!("{} sec", seconds)
    } else if seconds < 3600 {
        format!("{} min", seconds / 60)
    } else if seconds < 86400 {
        let hours = seconds / 3600;
        let minutes = (seconds % 3600) / 60;
        if minutes == 0 {
            format!("{} h", hours)
        } else {
            format!("{} h {} min", hours, minutes)
        }
    } else {
        format!("{} days", seconds / 86400)
    }
}
