use std::path::PathBuf;
use std::{thread::sleep, time::Duration};

use anyhow::{Context, Result, bail};
use clap::Parser;

use arm7bot::registers;
use arm7bot::transport::SerialTransport;
use arm7bot::{Arm, ArmConfig, MotorStatus, TransportConfig};

#[derive(clap::Parser)]
#[command(
    name = "arm7bot",
    version,
    about = "Command-line control of a 7Bot robotic arm over serial or WebSocket"
)]
struct Cli {
    /// YAML config file, overrides the connection flags
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Link to use: serial or websocket
    #[arg(long, global = true, default_value = "serial")]
    protocol: String,

    /// Serial port, defaults to the first one found
    #[arg(long, global = true)]
    port: Option<String>,

    /// WebSocket host
    #[arg(long, global = true)]
    host: Option<String>,

    /// WebSocket port
    #[arg(long = "ws-port", global = true)]
    ws_port: Option<u16>,

    /// More output, repeat for trace
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// List serial ports
    Ports,
    /// Device code, firmware version, MAC and id
    Info,
    /// Full status report as JSON
    Status,
    /// Check the link
    Ping,
    /// Get or set the device id (needs the EEPROM unlocked)
    Id { value: Option<u8> },
    /// Get or set the EEPROM write lock
    Lock { locked: Option<bool> },
    /// Get or set the motor mode
    Motor {
        #[arg(value_enum)]
        status: Option<MotorMode>,
    },
    /// Get all joint angles, or set all 7
    Angles { values: Vec<u8> },
    /// Get or set one joint angle
    Angle { joint: usize, value: Option<u8> },
    /// Get all joint loads
    Loads,
    /// Get or set the vacuum pump
    Vacuum { on: Option<bool> },
    /// Set joint speed (0 = maximum)
    Speed { value: u8 },
    /// Set motion time, in 100 ms units
    Time { value: u8 },
    /// Get or set joint offsets
    Offsets {
        #[arg(allow_negative_numbers = true)]
        values: Vec<i8>,
        /// Reset all offsets to zero
        #[arg(long, conflicts_with = "values")]
        clear: bool,
    },
    /// Set auto feedback rates in Hz (0 = off)
    FeedbackFreq {
        #[arg(long)]
        angle: Option<u8>,
        #[arg(long)]
        load: Option<u8>,
    },
    /// Print angle feedback reports as they arrive
    Watch {
        /// Feedback rate in Hz
        #[arg(long, default_value_t = 10)]
        freq: u8,
        /// Reports to print before stopping
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
    },
    /// Move joint 5 to a position (mm)
    Ik5 {
        #[arg(long, required = true, num_args = 3, allow_negative_numbers = true)]
        pos: Vec<i16>,
    },
    /// Move joint 6 to a position (mm) with an approach direction
    Ik6 {
        #[arg(long, required = true, num_args = 3, allow_negative_numbers = true)]
        pos: Vec<i16>,
        #[arg(long, required = true, num_args = 3, allow_negative_numbers = true)]
        vec56: Vec<i8>,
    },
    /// IK6 plus the joint 6 to 7 direction
    Ik7 {
        #[arg(long, required = true, num_args = 3, allow_negative_numbers = true)]
        pos: Vec<i16>,
        #[arg(long, required = true, num_args = 3, allow_negative_numbers = true)]
        vec56: Vec<i8>,
        #[arg(long, required = true, num_args = 3, allow_negative_numbers = true)]
        vec67: Vec<i8>,
    },
    /// Read or write a register run by name, e.g. `end_length`
    Reg {
        name: String,
        /// Raw bytes to write, the full run
        values: Vec<u8>,
    },
    /// Restore factory EEPROM values, erasing calibration
    EepromInit,
    /// Servo mode, boot pose
    Home,
    /// Protection mode, all joints to 90°, vacuum off
    Reset,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum MotorMode {
    Protection,
    Servo,
    Forceless,
}

impl From<MotorMode> for MotorStatus {
    fn from(mode: MotorMode) -> Self {
        match mode {
            MotorMode::Protection => MotorStatus::Protection,
            MotorMode::Servo => MotorStatus::Servo,
            MotorMode::Forceless => MotorStatus::Forceless,
        }
    }
}

fn triple<T: Copy>(values: &[T]) -> Result<[T; 3]> {
    <[T; 3]>::try_from(values).context("expected 3 values")
}

fn load_config(cli: &Cli) -> Result<ArmConfig> {
    if let Some(path) = &cli.config {
        return Ok(ArmConfig::load(path)?);
    }
    let port = match (&cli.port, cli.protocol.eq_ignore_ascii_case("serial")) {
        (None, true) => SerialTransport::scan_ports()?.into_iter().next(),
        (port, _) => port.clone(),
    };
    let transport = TransportConfig::from_selector(
        &cli.protocol,
        port.as_deref(),
        cli.host.as_deref(),
        cli.ws_port,
    )?;
    Ok(ArmConfig::new(transport))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    if let Command::Ports = cli.command {
        for port in SerialTransport::scan_ports()? {
            println!("{}", port);
        }
        return Ok(());
    }

    let config = load_config(&cli)?;
    let mut arm = Arm::connect(&config)?;

    match cli.command {
        Command::Ports => unreachable!(),
        Command::Info => {
            let info = arm.system_info()?;
            log::info!("Device code: {}", info.device_code);
            log::info!("Firmware version: {:.1}", info.version);
            log::info!("MAC: {}", info.mac);
            log::info!("Device id: {}", info.device_id);
            log::info!("Protocol: {}", info.protocol);
        }
        Command::Status => {
            let report = arm.status_report()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Ping => {
            let ack = arm.ping()?;
            log::info!("Ping: {:?} ({:?})", ack, arm.connection_state());
        }
        Command::Id { value: None } => println!("{}", arm.id()?),
        Command::Id { value: Some(id) } => {
            arm.set_id(id)?;
        }
        Command::Lock { locked: None } => println!("{}", arm.eeprom_lock()?),
        Command::Lock { locked: Some(locked) } => {
            arm.set_eeprom_lock(locked)?;
        }
        Command::Motor { status: None } => println!("{}", arm.motor_status()?),
        Command::Motor { status: Some(mode) } => {
            arm.set_motor_status(mode.into())?;
        }
        Command::Angles { values } if values.is_empty() => println!("{:?}", arm.angles()?),
        Command::Angles { values } => {
            arm.set_angles(&values)?;
        }
        Command::Angle { joint, value: None } => println!("{}", arm.angle(joint)?),
        Command::Angle {
            joint,
            value: Some(angle),
        } => {
            arm.set_angle(joint, angle)?;
        }
        Command::Loads => println!("{:?}", arm.loads()?),
        Command::Vacuum { on: None } => println!("{}", arm.vacuum()?),
        Command::Vacuum { on: Some(on) } => {
            arm.set_vacuum(on)?;
        }
        Command::Speed { value } => {
            arm.set_speed(value)?;
        }
        Command::Time { value } => {
            arm.set_time(value)?;
        }
        Command::Offsets { clear: true, .. } => {
            arm.clear_offsets()?;
            log::info!("Offsets cleared");
        }
        Command::Offsets { values, .. } if values.is_empty() => {
            println!("{:?}", arm.offsets()?)
        }
        Command::Offsets { values, .. } => {
            arm.set_offsets(&values)?;
        }
        Command::FeedbackFreq { angle, load } => {
            if angle.is_none() && load.is_none() {
                bail!("nothing to set, pass --angle and/or --load");
            }
            if let Some(hz) = angle {
                arm.set_angle_feedback_freq(hz)?;
            }
            if let Some(hz) = load {
                arm.set_load_feedback_freq(hz)?;
            }
        }
        Command::Watch { freq, count } => {
            arm.set_angle_feedback_freq(freq)?;
            for _ in 0..count {
                match arm.read_angles_feedback() {
                    Ok(angles) => println!("{:?}", angles),
                    Err(e) => {
                        log::error!("{}", e);
                        break;
                    }
                }
            }
            arm.set_angle_feedback_freq(0)?;
        }
        Command::Ik5 { pos } => {
            arm.set_ik5(triple(&pos)?)?;
        }
        Command::Ik6 { pos, vec56 } => {
            arm.set_ik6(triple(&pos)?, triple(&vec56)?)?;
        }
        Command::Ik7 { pos, vec56, vec67 } => {
            arm.set_ik7(triple(&pos)?, triple(&vec56)?, triple(&vec67)?)?;
        }
        Command::Reg { name, values } => {
            let register = registers::lookup(&name)
                .with_context(|| format!("unknown register {:?}", name))?;
            if values.is_empty() {
                let raw = arm.read_register(register)?;
                println!("{} = {}", register.name, register.render(&raw)?);
            } else {
                arm.write_register(register, &values)?;
            }
        }
        Command::EepromInit => {
            arm.eeprom_init()?;
        }
        Command::Home => {
            arm.home()?;
        }
        Command::Reset => {
            arm.reset()?;
            // let the last frames drain before the port closes
            sleep(Duration::from_millis(200));
        }
    }

    Ok(())
}
