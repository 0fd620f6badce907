pub mod config;
pub mod driver;
pub mod error;
pub mod histogram;
pub mod mix;
pub mod pacing;
pub mod phase;
pub mod recorder;
pub mod schedule;
pub mod stats;
pub mod transport;

pub use config::*;
pub use driver::*;
pub use error::*;
pub use histogram::{LatencyHistogram, union};
pub use mix::*;
pub use pacing::*;
pub use phase::*;
pub use recorder::*;
pub use schedule::*;
pub use stats::*;
pub use transport::*;
pub use url::Url;
