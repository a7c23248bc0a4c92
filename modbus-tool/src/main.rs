mod cli;

use std::fmt::Display;
use std::io;

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{generate, shells::Bash};
use log::error;

use modbus_lib::port::SimulatedTransport;
use modbus_lib::sensor::{self, SensorKind};
use modbus_lib::session::Session;

use cli::{Cli, StructOpt};

enum OutputFormat {
    Plain,
    Json,
}

fn slice_to_line<T>(data: &[T]) -> String
where
    T: Display,
{
    data.iter()
        .map(|value| value.to_string())
        .collect::<Vec<String>>()
        .join(" ")
}

fn cmd_read(session: &mut Session, registers: &[u16], fmt: OutputFormat) -> Result<String> {
    let res = registers
        .iter()
        .map(|&address| {
            session
                .read_register(address)
                .with_context(|| format!("Failed to read register 0x{:04X}", address))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(match fmt {
        OutputFormat::Plain => slice_to_line(res.as_slice()),
        OutputFormat::Json => {
            if res.len() > 1 {
                json::stringify(res)
            } else {
                res[0].to_string()
            }
        }
    })
}

fn cmd_read_block(
    session: &mut Session,
    address: u16,
    count: u16,
    fmt: OutputFormat,
) -> Result<String> {
    let res = session
        .read_registers(address, count)
        .with_context(|| format!("Failed to read {} registers at 0x{:04X}", count, address))?;

    Ok(match fmt {
        OutputFormat::Plain => slice_to_line(res.as_slice()),
        OutputFormat::Json => json::stringify(res),
    })
}

fn cmd_write(session: &mut Session, address: u16, value: u16) -> Result<String> {
    session
        .write_register(address, value)
        .with_context(|| format!("Failed to write register 0x{:04X}", address))?;
    Ok(String::new())
}

fn cmd_read_sensor(
    session: &mut Session,
    kind: SensorKind,
    address: u16,
    fmt: OutputFormat,
) -> Result<String> {
    let value = sensor::read_sensor(session, kind, address)
        .with_context(|| format!("Failed to read {} at 0x{:04X}", kind, address))?;

    Ok(match fmt {
        OutputFormat::Plain => format!("{:.*} {}", kind.decimals(), value, kind.unit()),
        OutputFormat::Json => json::stringify(value),
    })
}

fn do_main() -> Result<String> {
    if std::env::var("GENERATE_COMPLETION").is_ok() {
        generate(
            Bash,
            &mut cli::Cli::command(),
            "modbus-tool",
            &mut io::stdout(),
        );

        return Ok(String::default());
    }

    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if cli.debug {
        "debug"
    } else {
        "info"
    }))
    .format_timestamp(None)
    .format_target(false)
    .init();

    let fmt = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Plain
    };

    let mut session = Session::new(&cli.port, cli.baudrate, cli.slave);
    if cli.sim {
        let registers = cli.sim_register.iter().map(|r| (r.address, r.value));
        session.connect_with(Box::new(SimulatedTransport::with_registers(
            cli.slave, registers,
        )));
    } else {
        session.connect(cli.force)?;
    }

    match cli.command {
        cli::Commands::Read { registers } => cmd_read(&mut session, &registers, fmt),
        cli::Commands::ReadBlock { address, count } => {
            cmd_read_block(&mut session, address, count, fmt)
        }
        cli::Commands::Write { address, value } => cmd_write(&mut session, address, value),
        cli::Commands::ReadTemperature { address } => {
            cmd_read_sensor(&mut session, SensorKind::Temperature, address, fmt)
        }
        cli::Commands::ReadPressure { address } => {
            cmd_read_sensor(&mut session, SensorKind::Pressure, address, fmt)
        }
    }
}

fn main() {
    match do_main() {
        Ok(s) => println!("{}", s),
        Err(e) => error!("{:#}", e),
    }
}
