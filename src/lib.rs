pub mod config;
pub mod diagnostics;
pub mod logging;
pub mod runtime;
pub mod supervisor;
pub mod system;
pub mod upgrade;
