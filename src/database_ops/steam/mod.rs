pub mod steamspy;

pub use steamspy::{SteamDataClient, SteamSpyApp, SteamSpyClient, SteamSpyConfig};
