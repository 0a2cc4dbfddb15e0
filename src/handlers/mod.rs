mod echo;
mod health;

pub use echo::echo;
pub use health::{healthz, stats};
