use env_logger::Env;
use palantiri::Observer;

pub mod command;
pub mod config;
pub mod console;

use config::Destination;

/// Initializes the global logger.
///
/// Call this first!
///
/// # Example
///
/// ```
/// use palantiri_agent::init_logger;
///
/// fn main() {
///     init_logger();
///     log::info!("I can log now!");
/// }
/// ```
pub fn init_logger() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    // Print a warning if we are running in debug mode.
    #[cfg(debug_assertions)]
    {
        log::warn!("DEBUG assertions are enabled, this build of Palantiri is fine for debugging, but not for production.");
    }
}

/// Creates the observers that write to the configured destinations.
pub fn build_observers(destinations: &[Destination]) -> anyhow::Result<Vec<Box<dyn Observer>>> {
    let mut observers: Vec<Box<dyn Observer>> = Vec::with_capacity(destinations.len());
    for d in destinations {
        match d {
            Destination::Console => observers.push(Box::new(console::ConsoleObserver::stdout())),
            Destination::Csv(csv) => observers.push(Box::new(csv.build()?)),
        }
        log::debug!("Destination enabled: {d}");
    }
    Ok(observers)
}
