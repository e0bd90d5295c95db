use bubble_io::{CsvLayout, DEFAULT_BAUD};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for {flag}")]
    InvalidValue { flag: &'static str, value: String },
    #[error("{0} requires a value")]
    MissingValue(&'static str),
}

/// How the valve controller is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    #[default]
    Manual,
    #[serde(alias = "auto")]
    Automatic,
    Ttl,
}

impl FromStr for OperatingMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "auto" | "automatic" => Ok(Self::Automatic),
            "ttl" => Ok(Self::Ttl),
            _ => Err(()),
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Manual => "manual",
            Self::Automatic => "automatic",
            Self::Ttl => "ttl",
        })
    }
}

/// One-shot manual valve action applied after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    QuickVent,
    SlowVent,
    BuildPressure,
    SwitchGas,
    Reset,
}

impl FromStr for Preset {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "quick-vent" => Ok(Self::QuickVent),
            "slow-vent" => Ok(Self::SlowVent),
            "build-pressure" => Ok(Self::BuildPressure),
            "switch-gas" => Ok(Self::SwitchGas),
            "reset" => Ok(Self::Reset),
            _ => Err(()),
        }
    }
}

/// Keys accepted in the `--config` JSON file. Flags given on the command
/// line win over the file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    valve_port: Option<String>,
    motor_port: Option<String>,
    baud: Option<u32>,
    mode: Option<OperatingMode>,
    sequence_dir: Option<PathBuf>,
    save_dir: Option<PathBuf>,
    macros: Option<PathBuf>,
    simulate: Option<bool>,
    calibrate: Option<bool>,
    full_csv: Option<bool>,
    json_logs: Option<bool>,
    log_dir: Option<PathBuf>,
    metrics_addr: Option<String>,
    journal: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub valve_port: Option<String>,
    pub motor_port: Option<String>,
    pub baud: u32,
    pub mode: OperatingMode,
    pub sequence_dir: PathBuf,
    pub save_dir: PathBuf,
    pub macros_dir: Option<PathBuf>,
    pub simulate: bool,
    pub calibrate: bool,
    pub csv_layout: CsvLayout,
    pub valve_macro: Option<String>,
    pub motor_macro: Option<String>,
    pub quick_bubble_secs: Option<f64>,
    pub preset: Option<Preset>,
    pub run_seconds: Option<u64>,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub journal_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            valve_port: None,
            motor_port: None,
            baud: DEFAULT_BAUD,
            mode: OperatingMode::Manual,
            sequence_dir: PathBuf::from("./ssbubble"),
            save_dir: PathBuf::from("./data"),
            macros_dir: None,
            simulate: false,
            calibrate: false,
            csv_layout: CsvLayout::Pressure,
            valve_macro: None,
            motor_macro: None,
            quick_bubble_secs: None,
            preset: None,
            run_seconds: None,
            json_logs: false,
            log_dir: None,
            metrics_addr: None,
            journal_path: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    /// Parses `args` (program name first). A `--config` file anywhere on the
    /// line is applied before the other flags.
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut cfg = RuntimeConfig::default();

        if let Some(pos) = args.iter().position(|a| a == "--config") {
            let path = args
                .get(pos + 1)
                .ok_or(ConfigError::MissingValue("--config"))?;
            cfg.apply_file(Path::new(path))?;
        }

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--config" => {
                    i += 1;
                }
                "--valve-port" => {
                    cfg.valve_port = Some(value(args, i, "--valve-port")?.to_string());
                    i += 1;
                }
                "--motor-port" => {
                    cfg.motor_port = Some(value(args, i, "--motor-port")?.to_string());
                    i += 1;
                }
                "--baud" => {
                    cfg.baud = parsed(args, i, "--baud")?;
                    i += 1;
                }
                "--mode" => {
                    cfg.mode = parsed(args, i, "--mode")?;
                    i += 1;
                }
                "--sequence-dir" => {
                    cfg.sequence_dir = PathBuf::from(value(args, i, "--sequence-dir")?);
                    i += 1;
                }
                "--save-dir" => {
                    cfg.save_dir = PathBuf::from(value(args, i, "--save-dir")?);
                    i += 1;
                }
                "--macros" => {
                    cfg.macros_dir = Some(PathBuf::from(value(args, i, "--macros")?));
                    i += 1;
                }
                "--simulate" => {
                    cfg.simulate = true;
                }
                "--calibrate" => {
                    cfg.calibrate = true;
                }
                "--full-csv" => {
                    cfg.csv_layout = CsvLayout::Full;
                }
                "--macro" => {
                    cfg.valve_macro = Some(value(args, i, "--macro")?.to_string());
                    i += 1;
                }
                "--motor-macro" => {
                    cfg.motor_macro = Some(value(args, i, "--motor-macro")?.to_string());
                    i += 1;
                }
                "--quick-bubble" => {
                    let secs: f64 = parsed(args, i, "--quick-bubble")?;
                    if !(secs.is_finite() && secs > 0.0) {
                        return Err(ConfigError::InvalidValue {
                            flag: "--quick-bubble",
                            value: args[i + 1].clone(),
                        });
                    }
                    cfg.quick_bubble_secs = Some(secs);
                    i += 1;
                }
                "--preset" => {
                    cfg.preset = Some(parsed(args, i, "--preset")?);
                    i += 1;
                }
                "--run-seconds" => {
                    cfg.run_seconds = Some(parsed(args, i, "--run-seconds")?);
                    i += 1;
                }
                "--json-logs" => {
                    cfg.json_logs = true;
                }
                "--log-dir" => {
                    cfg.log_dir = Some(PathBuf::from(value(args, i, "--log-dir")?));
                    i += 1;
                }
                "--metrics-addr" => {
                    cfg.metrics_addr = Some(value(args, i, "--metrics-addr")?.to_string());
                    i += 1;
                }
                "--journal" => {
                    cfg.journal_path = Some(PathBuf::from(value(args, i, "--journal")?));
                    i += 1;
                }
                "--help" | "-h" => {
                    cfg.show_help = true;
                    break;
                }
                _ => {}
            }
            i += 1;
        }
        Ok(cfg)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if file.valve_port.is_some() {
            self.valve_port = file.valve_port;
        }
        if file.motor_port.is_some() {
            self.motor_port = file.motor_port;
        }
        if let Some(baud) = file.baud {
            self.baud = baud;
        }
        if let Some(mode) = file.mode {
            self.mode = mode;
        }
        if let Some(dir) = file.sequence_dir {
            self.sequence_dir = dir;
        }
        if let Some(dir) = file.save_dir {
            self.save_dir = dir;
        }
        if file.macros.is_some() {
            self.macros_dir = file.macros;
        }
        self.simulate |= file.simulate.unwrap_or(false);
        self.calibrate |= file.calibrate.unwrap_or(false);
        if file.full_csv == Some(true) {
            self.csv_layout = CsvLayout::Full;
        }
        self.json_logs |= file.json_logs.unwrap_or(false);
        if file.log_dir.is_some() {
            self.log_dir = file.log_dir;
        }
        if file.metrics_addr.is_some() {
            self.metrics_addr = file.metrics_addr;
        }
        if file.journal.is_some() {
            self.journal_path = file.journal;
        }
        Ok(())
    }

    pub fn print_help() {
        println!(
            r#"bubble-ctl - Valve, pressure and motor controller for bubble experiments

USAGE:
    bubble-ctl [OPTIONS]

OPTIONS:
    --valve-port <NAME>     Serial port of the valve controller (required unless --simulate)
    --motor-port <NAME>     Serial port of the motor controller (optional)
    --baud <N>              Baud rate for both ports [default: 9600]
    --mode <MODE>           manual | auto | ttl [default: manual]
    --sequence-dir <PATH>   Directory watched for sequence.txt in auto mode [default: ./ssbubble]
    --save-dir <PATH>       Default directory for pressure CSV files [default: ./data]
    --full-csv              Log raw pressures and all valve bits instead of calibrated pressures
    --macros <PATH>         Directory holding valve_macro_data.json / motor_macro_data.json
    --macro <N>             Run valve macro N once after connecting
    --motor-macro <N>       Move the motor to macro N's position after calibration
    --quick-bubble <SECS>   Run a quick bubble for SECS seconds after connecting
    --preset <NAME>         quick-vent | slow-vent | build-pressure | switch-gas | reset
    --calibrate             Calibrate the motor after connecting
    --config <PATH>         JSON file with the same keys (snake_case), applied before flags
    --simulate              Use in-process simulated controllers instead of serial ports
    --run-seconds <SECS>    Run for a fixed duration then exit
    --json-logs             Output logs in JSON format (for log aggregation)
    --log-dir <PATH>        Also write JSON logs to a daily rolling file in PATH
    --metrics-addr <ADDR>   Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --journal <PATH>        Record the session journal to a JSONL file
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log filter (e.g., RUST_LOG=debug,bubble_io=trace)

EXAMPLES:
    # Automatic mode against real hardware
    bubble-ctl --valve-port /dev/ttyACM0 --motor-port /dev/ttyACM1 --mode auto --calibrate

    # Short simulated run with metrics
    bubble-ctl --simulate --mode auto --run-seconds 10 --metrics-addr 127.0.0.1:9090
"#
        );
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &'static str) -> Result<&'a str, ConfigError> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or(ConfigError::MissingValue(flag))
}

fn parsed<T: FromStr>(args: &[String], i: usize, flag: &'static str) -> Result<T, ConfigError> {
    parsed_with(args, i, flag, |v| v.parse().ok())
}

fn parsed_with<T>(
    args: &[String],
    i: usize,
    flag: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, ConfigError> {
    let raw = value(args, i, flag)?;
    parse(raw).ok_or_else(|| ConfigError::InvalidValue {
        flag,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn args(line: &str) -> Vec<String> {
        std::iter::once("bubble-ctl")
            .chain(line.split_whitespace())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults() {
        let cfg = RuntimeConfig::from_args(&args("")).unwrap();
        assert_eq!(cfg.baud, 9600);
        assert_eq!(cfg.mode, OperatingMode::Manual);
        assert_eq!(cfg.sequence_dir, PathBuf::from("./ssbubble"));
        assert!(!cfg.simulate);
        assert!(cfg.valve_port.is_none());
    }

    #[test]
    fn parses_flags() {
        let cfg = RuntimeConfig::from_args(&args(
            "--valve-port COM3 --motor-port COM4 --baud 115200 --mode auto \
             --sequence-dir /tmp/seq --run-seconds 5 --preset quick_vent --full-csv --calibrate",
        ))
        .unwrap();
        assert_eq!(cfg.valve_port.as_deref(), Some("COM3"));
        assert_eq!(cfg.motor_port.as_deref(), Some("COM4"));
        assert_eq!(cfg.baud, 115200);
        assert_eq!(cfg.mode, OperatingMode::Automatic);
        assert_eq!(cfg.sequence_dir, PathBuf::from("/tmp/seq"));
        assert_eq!(cfg.run_seconds, Some(5));
        assert_eq!(cfg.preset, Some(Preset::QuickVent));
        assert_eq!(cfg.csv_layout, CsvLayout::Full);
        assert!(cfg.calibrate);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            RuntimeConfig::from_args(&args("--mode turbo")),
            Err(ConfigError::InvalidValue { flag: "--mode", .. })
        ));
        assert!(matches!(
            RuntimeConfig::from_args(&args("--quick-bubble -1")),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            RuntimeConfig::from_args(&args("--baud")),
            Err(ConfigError::MissingValue("--baud"))
        ));
    }

    #[test]
    fn file_is_applied_before_flags() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bubble.json");
        std::fs::write(
            &path,
            r#"{ "valve_port": "/dev/ttyACM0", "mode": "ttl", "baud": 19200, "simulate": true }"#,
        )
        .unwrap();

        let line = format!("--mode auto --config {}", path.display());
        let cfg = RuntimeConfig::from_args(&args(&line)).unwrap();
        assert_eq!(cfg.valve_port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(cfg.baud, 19200);
        assert!(cfg.simulate);
        assert_eq!(cfg.mode, OperatingMode::Automatic);
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bubble.json");
        std::fs::write(&path, r#"{ "valve_prot": "COM3" }"#).unwrap();
        let line = format!("--config {}", path.display());
        assert!(matches!(
            RuntimeConfig::from_args(&args(&line)),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn help_stops_parsing() {
        let cfg = RuntimeConfig::from_args(&args("-h --mode turbo")).unwrap();
        assert!(cfg.show_help);
    }
}
