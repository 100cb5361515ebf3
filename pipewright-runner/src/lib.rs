pub mod channel;
pub mod executor;
pub mod process;

pub use channel::{InputChannel, OutputChannel, StreamChannel};
pub use executor::execute;
pub use process::{ProcessRunner, RunnerState};
