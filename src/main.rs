use anyhow::{Context, Result, bail};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::rc::Rc;

use pulse_uplink::clock::{Clock, SystemClock};
use pulse_uplink::config::NodeConfig;
use pulse_uplink::pulse::{MAX_SYNTHETIC_BPM, PulseSource, SerialPulseSource, SyntheticPulse};
use pulse_uplink::scheduler::UplinkScheduler;
use pulse_uplink::uart;

#[derive(Parser, Debug)]
#[command(name = "pulse-uplink", version, about = "NB-IoT heart-rate uplink node")]
struct Cli {
    /// JSON config file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port wired to the SIM7020 modem
    #[arg(long)]
    modem_port: Option<String>,

    /// Serial port streaming raw pulse-sensor samples
    #[arg(long, conflicts_with = "simulate_bpm")]
    sensor_port: Option<String>,

    /// Feed a synthetic pulse at this rate instead of a sensor
    #[arg(
        long,
        value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_SYNTHETIC_BPM))
    )]
    simulate_bpm: Option<u32>,

    /// Write the default config to this path and exit
    #[arg(long)]
    write_default_config: Option<PathBuf>,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Log every AT command and response
    #[arg(long)]
    dump_at: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.list_ports {
        for port in uart::available_ports() {
            println!("{port}");
        }
        return Ok(());
    }

    if let Some(path) = &cli.write_default_config {
        NodeConfig::default()
            .save_to_file(path)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Default config written to {}", path.display());
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => NodeConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if cli.dump_at {
        config.modem.dump_at_commands = true;
    }
    init_logging(&config);

    let Some(modem_path) = cli.modem_port.clone().or_else(first_port) else {
        bail!("no serial port found for the modem; pass --modem-port");
    };
    let modem = uart::open_port(&modem_path, config.modem.baud_rate)?;
    info!("Modem on {modem_path} at {} baud", config.modem.baud_rate);

    let clock: Rc<dyn Clock> = Rc::new(SystemClock::new());
    let source: Box<dyn PulseSource> = match (cli.simulate_bpm, &cli.sensor_port) {
        (Some(bpm), _) => {
            info!("Simulating a {bpm} bpm pulse");
            Box::new(SyntheticPulse::new(clock.clone(), bpm))
        }
        (None, Some(path)) => {
            let port = uart::open_port(path, config.sampling.sensor_baud_rate)?;
            info!("Pulse sensor on {path}");
            Box::new(SerialPulseSource::new(port))
        }
        (None, None) => bail!("pass --sensor-port or --simulate-bpm"),
    };

    UplinkScheduler::new(&config, modem, source, clock).run()
}

fn init_logging(config: &NodeConfig) {
    let default_level = if config.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}

fn first_port() -> Option<String> {
    uart::available_ports().into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simulated_run() {
        let cli = Cli::parse_from([
            "pulse-uplink",
            "--modem-port",
            "/dev/ttyUSB0",
            "--simulate-bpm",
            "72",
        ]);
        assert_eq!(cli.modem_port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.simulate_bpm, Some(72));
        assert!(cli.sensor_port.is_none());
    }

    #[test]
    fn test_sensor_and_simulation_conflict() {
        let result = Cli::try_parse_from([
            "pulse-uplink",
            "--sensor-port",
            "/dev/ttyACM0",
            "--simulate-bpm",
            "72",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_simulated_rate_out_of_range() {
        for bpm in ["0", "70000"] {
            let result = Cli::try_parse_from(["pulse-uplink", "--simulate-bpm", bpm]);
            assert!(result.is_err(), "{bpm} bpm accepted");
        }
    }
}
