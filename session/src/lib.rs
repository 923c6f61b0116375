mod config;
mod error;
mod queue;
mod record;
mod result;
mod schedule;
mod session;
mod viz;

pub use config::*;
pub use error::*;
pub use queue::*;
pub use record::*;
pub use result::*;
pub use schedule::*;
pub use session::*;
pub use viz::*;
