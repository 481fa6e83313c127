use std::io;

use clap::ArgMatches;
use log::{info, warn};

use epiphany_hal::drivers::{DevMemDriver, SimDriver};
use epiphany_hal::platform::{Platform, PlatformError};
use epiphany_hal::{Mesh, MeshError};

#[derive(Debug)]
pub enum ConfigError {
    /// Couldn't parse string as number
    NumberParseError(String, std::num::ParseIntError),

    /// The platform descriptor was unusable
    PlatformError(PlatformError),

    /// Generic IO Error
    IoError(io::Error),

    /// The configuration doesn't make sense
    InvalidConfig(String),
}

impl std::convert::From<io::Error> for ConfigError {
    fn from(e: io::Error) -> ConfigError {
        ConfigError::IoError(e)
    }
}

impl std::convert::From<PlatformError> for ConfigError {
    fn from(e: PlatformError) -> ConfigError {
        ConfigError::PlatformError(e)
    }
}

impl std::convert::From<MeshError> for ConfigError {
    fn from(e: MeshError) -> ConfigError {
        ConfigError::InvalidConfig(format!("unable to open the target device: {}", e))
    }
}

pub fn get_base(value: &str) -> (&str, u32) {
    if value.starts_with("0x") {
        (value.trim_start_matches("0x"), 16)
    } else if value.starts_with("0X") {
        (value.trim_start_matches("0X"), 16)
    } else if value.starts_with("0b") {
        (value.trim_start_matches("0b"), 2)
    } else if value.starts_with("0B") {
        (value.trim_start_matches("0B"), 2)
    } else if value.starts_with('0') && value != "0" {
        (value.trim_start_matches('0'), 8)
    } else {
        (value, 10)
    }
}

pub fn parse_u16(value: &str) -> Result<u16, ConfigError> {
    let (value, base) = get_base(value);
    match u16::from_str_radix(value, base) {
        Ok(o) => Ok(o),
        Err(e) => Err(ConfigError::NumberParseError(value.to_owned(), e)),
    }
}

pub fn parse_u32(value: &str) -> Result<u32, ConfigError> {
    let (value, base) = get_base(value);
    match u32::from_str_radix(value, base) {
        Ok(o) => Ok(o),
        Err(e) => Err(ConfigError::NumberParseError(value.to_owned(), e)),
    }
}

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub bind_addr: String,
    pub tty_path: Option<String>,
    pub halt_on_attach: bool,
    pub skip_platform_reset: bool,
    pub show_memory_map: bool,
    pub memory_address: Option<u32>,
    pub memory_value: Option<u32>,
}

impl Config {
    pub fn parse(matches: ArgMatches) -> Result<(Self, Mesh), ConfigError> {
        // unwrap() is safe because there is a default value
        let port = parse_u16(matches.value_of("port").unwrap())?;
        let bind_addr = matches
            .value_of("bind-addr")
            .map(|addr| addr.to_owned())
            .unwrap_or_else(|| "127.0.0.1".to_owned());

        let platform = match matches.value_of("hdf") {
            Some(path) => Platform::from_descriptor(path)?,
            None => {
                info!("no platform descriptor given: assuming a single chip");
                Platform::single_chip()
            }
        };

        let mesh = match matches.value_of("dev") {
            Some(path) => {
                let base = parse_u32(matches.value_of("dev-base").unwrap())?;
                let size = parse_u32(matches.value_of("dev-size").unwrap())? as usize;
                let driver = DevMemDriver::new(path, base, size)?;
                Mesh::new(Box::new(driver), platform)
            }
            None => {
                warn!("no target device specified: using the built-in simulator");
                Mesh::new(Box::new(SimDriver::new()), platform)
            }
        };

        let memory_address = matches
            .value_of("address")
            .map(parse_u32)
            .transpose()?;
        let memory_value = matches.value_of("value").map(parse_u32).transpose()?;

        if memory_value.is_some() && memory_address.is_none() {
            return Err(ConfigError::InvalidConfig(
                "a value to write requires an address".to_owned(),
            ));
        }

        Ok((
            Config {
                port,
                bind_addr,
                tty_path: matches.value_of("tty").map(|t| t.to_owned()),
                halt_on_attach: !matches.is_present("dont-halt-on-attach"),
                skip_platform_reset: matches.is_present("skip-platform-reset"),
                show_memory_map: matches.is_present("show-memory-map"),
                memory_address,
                memory_value,
            },
            mesh,
        ))
    }
}
