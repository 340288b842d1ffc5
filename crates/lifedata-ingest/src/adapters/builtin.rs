//! Adapters shipped with the crate
//!
//! Field names follow the payloads the upstream fetchers write: Spotify Web
//! API objects, Strava `SummaryActivity`, and chess.com archive games.

use super::{Adapter, DataTypeSpec};

pub fn spotify() -> Adapter {
    Adapter::new("spotify")
        .with_data_type(
            "recently_played",
            DataTypeSpec::new(
                &["played_at", "track.id"],
                &["played_at", "track.id"],
                "spotify_recently_played",
            ),
        )
        .with_data_type(
            "saved_tracks",
            DataTypeSpec::new(&["track.id"], &["added_at", "track.id"], "spotify_saved_tracks"),
        )
        .with_data_type(
            "top_artists",
            DataTypeSpec::new(&["id", "time_range"], &["id", "name", "time_range"], "spotify_top_artists"),
        )
}

pub fn strava() -> Adapter {
    Adapter::new("strava")
        .with_data_type(
            "activities",
            DataTypeSpec::new(&["id"], &["id", "sport_type", "start_date"], "strava_activities"),
        )
        .with_data_type(
            "athlete_stats",
            DataTypeSpec::new(&["athlete_id", "captured_on"], &["athlete_id", "captured_on"], "strava_athlete_stats"),
        )
}

pub fn chess() -> Adapter {
    Adapter::new("chess")
        .with_data_type(
            "games",
            DataTypeSpec::new(&["uuid"], &["uuid", "end_time", "white.username", "black.username"], "chess_games")
                .with_inserted_at_field("end_time"),
        )
        .with_data_type(
            "stats",
            DataTypeSpec::new(&["username", "captured_on"], &["username", "captured_on"], "chess_stats"),
        )
}

pub fn adapters() -> Vec<Adapter> {
    vec![spotify(), strava(), chess()]
}
