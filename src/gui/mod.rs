//! Terminal rendering of the live feed.

mod error;
mod hud;

pub use error::HudError;
pub use hud::{chart_bounds, engage_hud, CommandHandler, HudState, UpdateSource};
