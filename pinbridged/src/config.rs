use pinbridge_api::{Error, Result};
use serde_derive::Deserialize;
use std::env;
use tokio::time;
use tracing::Level;

fn def_log_level() -> String {
    String::from("warn")
}

fn def_pin_read_interval() -> u64 {
    5_000
}

fn def_sync_write_interval() -> u64 {
    30_000
}

fn def_heartbeat_interval() -> u64 {
    30_000
}

fn def_reevaluate_interval() -> u64 {
    60_000
}

fn def_pwm_frequency() -> u32 {
    1_000
}

fn def_rpc_timeout() -> u64 {
    10_000
}

#[derive(Deserialize, Clone)]
pub struct Config {
    #[serde(default = "def_log_level")]
    log_level: String,

    /// Bypasses the identity provider when present.
    pub hardware_serial: Option<String>,

    /// Selects the simulator HAL instead of real hardware.
    #[serde(default)]
    pub simulate_hardware: bool,

    #[serde(default = "def_pin_read_interval")]
    pin_read_interval_ms: u64,

    #[serde(default = "def_sync_write_interval")]
    hardware_sync_write_interval_ms: u64,

    #[serde(default = "def_heartbeat_interval")]
    heartbeat_interval_ms: u64,

    #[serde(default = "def_reevaluate_interval")]
    schedule_reevaluate_interval_ms: u64,

    #[serde(default = "def_pwm_frequency")]
    pub pwm_default_frequency_hz: u32,

    #[serde(default = "def_rpc_timeout")]
    rpc_timeout_ms: u64,
}

impl Config {
    pub fn get_log_level(&self) -> Level {
        match self.log_level.as_str() {
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::WARN,
        }
    }

    pub fn pin_read_interval(&self) -> time::Duration {
        time::Duration::from_millis(self.pin_read_interval_ms)
    }

    pub fn sync_write_interval(&self) -> time::Duration {
        time::Duration::from_millis(self.hardware_sync_write_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> time::Duration {
        time::Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reevaluate_interval(&self) -> time::Duration {
        time::Duration::from_millis(self.schedule_reevaluate_interval_ms)
    }

    pub fn rpc_timeout(&self) -> time::Duration {
        time::Duration::from_millis(self.rpc_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: def_log_level(),
            hardware_serial: None,
            simulate_hardware: false,
            pin_read_interval_ms: def_pin_read_interval(),
            hardware_sync_write_interval_ms: def_sync_write_interval(),
            heartbeat_interval_ms: def_heartbeat_interval(),
            schedule_reevaluate_interval_ms: def_reevaluate_interval(),
            pwm_default_frequency_hz: def_pwm_frequency(),
            rpc_timeout_ms: def_rpc_timeout(),
        }
    }
}

fn from_cmdline(mut cfg: Config) -> (bool, Config) {
    use clap::{crate_version, Arg, ArgAction, Command};

    // Define the command line arguments.

    let matches = Command::new("PinBridge GPIO Controller")
        .version(crate_version!())
        .about("Bridges a cloud document store to GPIO hardware.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .action(ArgAction::Set)
                .value_name("FILE")
                .help("Specifies the configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Sets verbosity of log; can be used more than once"),
        )
        .arg(
            Arg::new("simulate")
                .long("simulate")
                .action(ArgAction::SetTrue)
                .help("Uses the simulator HAL instead of real hardware"),
        )
        .arg(
            Arg::new("print_cfg")
                .long("print-config")
                .action(ArgAction::SetTrue)
                .help("Displays the configuration and exits"),
        )
        .get_matches();

    // The number of '-v' options determines the log level.

    match matches.get_count("verbose") {
        0 => (),
        1 => cfg.log_level = String::from("info"),
        2 => cfg.log_level = String::from("debug"),
        _ => cfg.log_level = String::from("trace"),
    };

    if matches.get_flag("simulate") {
        cfg.simulate_hardware = true
    }

    // Return the config built from the command line and a flag
    // indicating the user wants the final configuration displayed.

    (matches.get_flag("print_cfg"), cfg)
}

// The serial override can also come from the environment, which is
// how the provisioning scripts pass it to the service unit.

fn from_env(mut cfg: Config) -> Config {
    if let Ok(serial) = env::var("PINBRIDGE_SERIAL") {
        if !serial.is_empty() {
            cfg.hardware_serial = Some(serial)
        }
    }
    cfg
}

fn parse_config(contents: &str) -> Result<Config> {
    toml::from_str(contents)
        .map_err(|e| Error::Config(format!("{}", e)))
        .and_then(|cfg: Config| {
            // The sync loop cadences have floors so a typo can't spin
            // the process against the store.

            if cfg.pin_read_interval_ms < 100 {
                return Err(Error::Config(
                    "'pin_read_interval_ms' is too small".into(),
                ));
            }

            if cfg.hardware_sync_write_interval_ms < 1_000 {
                return Err(Error::Config(
                    "'hardware_sync_write_interval_ms' is too small".into(),
                ));
            }

            if cfg.schedule_reevaluate_interval_ms < 1_000 {
                return Err(Error::Config(
                    "'schedule_reevaluate_interval_ms' is too small".into(),
                ));
            }

            if !(1..=20_000).contains(&cfg.pwm_default_frequency_hz) {
                return Err(Error::Config(
                    "'pwm_default_frequency_hz' is out of range".into(),
                ));
            }

            if cfg.rpc_timeout_ms < 1_000 {
                return Err(Error::Config(
                    "'rpc_timeout_ms' is too small".into(),
                ));
            }
            Ok(cfg)
        })
}

async fn from_file(path: &str) -> Option<Result<Config>> {
    use tokio::fs;

    if let Ok(contents) = fs::read(path).await {
        let contents = String::from_utf8_lossy(&contents);

        Some(parse_config(&contents))
    } else {
        None
    }
}

async fn find_cfg() -> Result<Config> {
    const CFG_FILE: &str = "pinbridge.toml";

    // Create a vector of directories that could contain a
    // configuration file. The directories will be searched in their
    // order within the vector.

    let mut dirs = vec![String::from("./")];

    // If the user has `HOME` defined, append their home directory to
    // the search path. Note the end of the path has a period. This is
    // done so the file will be named `.pinbridge.toml` in the home
    // directory.

    if let Ok(home) = env::var("HOME") {
        dirs.push(format!("{}/.", home))
    }

    // Add other, common configuration areas.

    dirs.push(String::from("/usr/local/etc/"));
    dirs.push(String::from("/etc/"));

    // Iterate through the directories. The first file that is found
    // and can be parsed is used as the configuration.

    for dir in dirs {
        let file = format!("{}{}", &dir, CFG_FILE);

        if let Some(cfg) = from_file(&file).await {
            return cfg;
        }
    }
    Ok(Config::default())
}

fn dump_config(cfg: &Config) {
    println!("Configuration:");
    println!("    log level: {}", cfg.get_log_level());
    println!(
        "    hardware serial: {}",
        cfg.hardware_serial.as_deref().unwrap_or("(from device)")
    );
    println!("    simulate hardware: {}", cfg.simulate_hardware);
    println!("    pin read interval: {} ms", cfg.pin_read_interval_ms);
    println!(
        "    sync write interval: {} ms",
        cfg.hardware_sync_write_interval_ms
    );
    println!("    heartbeat interval: {} ms", cfg.heartbeat_interval_ms);
    println!(
        "    schedule re-evaluation: {} ms",
        cfg.schedule_reevaluate_interval_ms
    );
    println!(
        "    default PWM frequency: {} Hz",
        cfg.pwm_default_frequency_hz
    );
    println!("    RPC timeout: {} ms", cfg.rpc_timeout_ms);
}

#[tracing::instrument(name = "loading config")]
pub async fn get() -> Option<Config> {
    match find_cfg().await {
        Ok(cfg) => {
            let (print_cfg, cfg) = from_cmdline(from_env(cfg));

            if print_cfg {
                dump_config(&cfg);
                None
            } else {
                Some(cfg)
            }
        }
        Err(e) => {
            println!("{}", e);
            None
        }
    }
}
