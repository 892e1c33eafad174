pub mod error;
pub mod config;
pub mod annotations;
pub mod objects;
pub mod preprocessing;
pub mod backend;
pub mod features;
pub mod fanout;
pub mod clustering;
pub mod strategy;
pub mod split;
pub mod pipeline;

pub use error::{Error, Result};
pub use config::SplitConfig;
pub use pipeline::{run_pipeline, split_data};
pub use split::SplitResult;
