//! Building and running external tools (`pg_dump`, `tar`, compressors).

mod command;
mod pipeline;

pub use command::{CommandOutput, ShellCommand};
pub use pipeline::{Pipeline, PipelineResult};
