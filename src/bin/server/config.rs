//! Command-line configuration.

use clap::Parser;

/// Read-through metadata proxy for book-library clients.
#[derive(Parser, Debug, Clone)]
#[command(name = "spines", version, about)]
pub struct ServerConfig {
    /// Port to serve traffic on.
    #[arg(long, default_value_t = 8788)]
    pub port: u16,

    /// Increase log verbosity.
    #[arg(long, short)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::parse_from(["spines"]);
        assert_eq!(config.port, 8788);
        assert!(!config.verbose);
    }

    #[test]
    fn test_flags() {
        let config = ServerConfig::parse_from(["spines", "--port", "9000", "-v"]);
        assert_eq!(config.port, 9000);
        assert!(config.verbose);
    }
}
