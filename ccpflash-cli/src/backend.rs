//! Bus backends and session setup.

use anyhow::{Result, bail};
use ccpflash::transport::sim::DEFAULT_MEMORY_SIZE;
use ccpflash::{Session, SimTransport, SimulatedTarget};
use clap::ValueEnum;
use log::debug;

use crate::Cli;
use crate::config::Config;

/// Supported bus backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum Backend {
    /// In-process simulated bootloader.
    Sim,
}

/// Station address from the command line, then the config file.
pub(crate) fn station(cli: &Cli, config: &Config) -> u8 {
    cli.station.or(config.bus.station).unwrap_or(0)
}

/// Open a session on the selected backend.
pub(crate) fn open_session(cli: &Cli, config: &Config) -> Result<Session<SimTransport>> {
    let handler_config = config.handler_config();
    match cli.backend {
        Backend::Sim => {
            let memory_size = config.sim.memory_size.unwrap_or(DEFAULT_MEMORY_SIZE);
            if memory_size == 0 {
                bail!("Simulated memory size must be greater than zero");
            }

            let target = SimulatedTarget::new(station(cli, config), memory_size)
                .with_password(config.password())
                .with_ids(handler_config.host_id, handler_config.reply_id);
            debug!(
                "Simulated bootloader: station {}, {} bytes per region",
                station(cli, config),
                memory_size
            );
            Ok(Session::new(SimTransport::new(target), handler_config))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_station_priority() {
        let mut config = Config::default();
        let cli = Cli::try_parse_from(["ccpflash", "erase"]).unwrap();
        assert_eq!(station(&cli, &config), 0);

        config.bus.station = Some(5);
        assert_eq!(station(&cli, &config), 5);

        let cli = Cli::try_parse_from(["ccpflash", "--station", "9", "erase"]).unwrap();
        assert_eq!(station(&cli, &config), 9);
    }

    #[test]
    fn test_open_sim_session() {
        let mut config = Config::default();
        config.sim.memory_size = Some(128);
        let cli = Cli::try_parse_from(["ccpflash", "--station", "3", "erase"]).unwrap();

        let mut session = open_session(&cli, &config).unwrap();
        session.connect(3).unwrap();
        assert!(session.transport().target().is_connected());
        assert_eq!(
            session
                .transport()
                .target()
                .memory(ccpflash::AddressExtension::FlashMemory)
                .len(),
            128
        );
    }

    #[test]
    fn test_open_sim_session_rejects_empty_memory() {
        let mut config = Config::default();
        config.sim.memory_size = Some(0);
        let cli = Cli::try_parse_from(["ccpflash", "erase"]).unwrap();
        assert!(open_session(&cli, &config).is_err());
    }
}
