pub mod client;
pub mod refresh;

pub use client::{IgdbApi, IgdbClient, IgdbConfig, IgdbGame};
pub use refresh::{refresh_game, RefreshOutcome};
