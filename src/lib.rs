#![warn(clippy::pedantic)]
// Noisy doc/signature lints, would require annotating every pub function
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
// Style preference: keeping format!("{}", x) over format!("{x}") for readability with complex exprs
#![allow(clippy::uninlined_format_args)]
// Intentional casts between unix-ms timestamps, durations and counters
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::too_many_lines)]
// Module structure: store::BufferStore, notify::Notifier and friends
#![allow(clippy::module_name_repetitions)]

pub mod aggregator;
pub mod bus;
pub mod channels;
pub mod cli;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod gateway;
pub mod ingest;
pub mod media;
pub mod notify;
pub(crate) mod utils;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
