use anyhow::Result;
pub use clap::StructOpt;
use clap::{Parser, Subcommand};
use lazy_static::lazy_static;
use regex::Regex;
use std::cmp;
use std::ops::Deref;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RangeError {
    #[error("invalid register list '{0}'")]
    BadRange(String),
}

/// Comma-separated register addresses with ranges, e.g.
/// `0x0100,0x0102-0x0104,260`.
#[derive(Debug)]
pub struct RegisterList(Vec<u16>);

impl Deref for RegisterList {
    type Target = Vec<u16>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for RegisterList {
    type Err = RangeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        lazy_static! {
            static ref RE: Regex =
                Regex::new(r"^(0x[0-9A-Fa-f]+|0b[01]+|\d+)(?:-(0x[0-9A-Fa-f]+|0b[01]+|\d+))?$")
                    .unwrap();
        }

        let mut result: Vec<u16> = Vec::new();

        for s in input.split(',') {
            let c = RE
                .captures(s)
                .ok_or_else(|| RangeError::BadRange(s.to_string()))?;

            let first = parse_with_radix::<u16>(c.get(1).unwrap().as_str())
                .map_err(|_| RangeError::BadRange(s.to_string()))?;

            match c.get(2) {
                None => result.push(first),
                Some(m) => {
                    let second = parse_with_radix::<u16>(m.as_str())
                        .map_err(|_| RangeError::BadRange(s.to_string()))?;
                    result.extend(cmp::min(first, second)..=cmp::max(first, second));
                }
            }
        }

        Ok(RegisterList(result))
    }
}

#[derive(Error, Debug)]
pub enum AssignmentError {
    #[error("invalid register assignment '{0}', expected ADDR=VALUE")]
    BadAssignment(String),
}

/// `ADDR=VALUE` pair used to preload the simulated device.
#[derive(Debug, Clone)]
pub struct RegisterAssignment {
    pub address: u16,
    pub value: u16,
}

impl FromStr for RegisterAssignment {
    type Err = AssignmentError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (address, value) = input
            .split_once('=')
            .ok_or_else(|| AssignmentError::BadAssignment(input.to_string()))?;

        Ok(RegisterAssignment {
            address: parse_with_radix(address)
                .map_err(|_| AssignmentError::BadAssignment(input.to_string()))?,
            value: parse_with_radix(value)
                .map_err(|_| AssignmentError::BadAssignment(input.to_string()))?,
        })
    }
}

fn parse_with_radix<T>(input: &str) -> Result<T, T::FromStrRadixErr>
where
    T: num::Num,
    <T as num::Num>::FromStrRadixErr: std::error::Error + Send + Sync,
{
    if input.starts_with("0x") {
        T::from_str_radix(input.trim_start_matches("0x"), 16)
    } else if input.starts_with("0b") {
        T::from_str_radix(input.trim_start_matches("0b"), 2)
    } else {
        T::from_str_radix(input, 10)
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Skip sanity checks
    #[clap(long, short)]
    pub force: bool,

    /// enable debug output
    #[clap(long, short)]
    pub debug: bool,

    /// Serial device
    #[clap(long, short, default_value = "/dev/ttyUSB0")]
    pub port: String,

    /// Serial baud rate
    #[clap(long, short, default_value_t = 9600)]
    pub baudrate: u32,

    /// Slave address of the target device
    #[clap(long, short, default_value_t = 1, parse(try_from_str=parse_with_radix))]
    pub slave: u8,

    /// Use json-formatted output
    #[clap(long, short)]
    pub json: bool,

    /// Talk to an in-memory simulated device instead of a serial port
    #[clap(long)]
    pub sim: bool,

    /// Preload a simulated register, ADDR=VALUE (repeatable)
    #[clap(long = "sim-register", requires = "sim")]
    pub sim_register: Vec<RegisterAssignment>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Read registers, one request each
    Read { registers: RegisterList },

    /// Read a block of consecutive registers in one request
    #[clap(visible_alias = "readblk")]
    ReadBlock {
        #[clap(parse(try_from_str=parse_with_radix))]
        address: u16,
        #[clap(default_value_t = 1, parse(try_from_str=parse_with_radix))]
        count: u16,
    },

    /// Write a single register
    Write {
        #[clap(parse(try_from_str=parse_with_radix))]
        address: u16,
        #[clap(parse(try_from_str=parse_with_radix))]
        value: u16,
    },

    /// Read a temperature sensor register, scaled to degrees Celsius
    #[clap(visible_alias = "temp")]
    ReadTemperature {
        #[clap(parse(try_from_str=parse_with_radix))]
        address: u16,
    },

    /// Read a pressure sensor register, scaled to bar
    #[clap(visible_alias = "press")]
    ReadPressure {
        #[clap(parse(try_from_str=parse_with_radix))]
        address: u16,
    },
}
