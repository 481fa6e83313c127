#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate clap;

use log::{info, warn};
use std::io::Write;

mod config;
mod epiphany;
mod gdb;
mod server;

use clap::{App, Arg};
use config::Config;

fn clap_app<'a, 'b>() -> App<'a, 'b> {
    App::new("Epiphany Server")
        .version(crate_version!())
        .about("GDB Remote Serial Protocol server for the Epiphany many-core coprocessor")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Port to listen on for GDB connections")
                .default_value("51000")
                .display_order(1)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("bind-addr")
                .short("a")
                .long("bind-addr")
                .value_name("IP_ADDRESS")
                .help("IP address to bind to")
                .default_value("127.0.0.1")
                .display_order(2)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("hdf")
                .long("hdf")
                .value_name("FILE")
                .help("Platform description file (flattened records; see the docs)")
                .display_order(3)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("dev")
                .long("dev")
                .value_name("FILE")
                .help("Memory-mapped device window exposing the mesh (omit to simulate)")
                .display_order(4)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("dev-base")
                .long("dev-base")
                .value_name("ADDRESS")
                .help("Global address of the first byte of the device window")
                .default_value("0x80800000")
                .display_order(5)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("dev-size")
                .long("dev-size")
                .value_name("BYTES")
                .help("Size of the device window")
                .default_value("0x10000000")
                .display_order(6)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("tty")
                .long("tty")
                .value_name("TERMINAL")
                .help("Redirect the target's printf output to this terminal")
                .display_order(7)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("dont-halt-on-attach")
                .long("dont-halt-on-attach")
                .help("Don't stall the target when a debugger attaches")
                .display_order(8),
        )
        .arg(
            Arg::with_name("skip-platform-reset")
                .long("skip-platform-reset")
                .help("Don't reset the platform on startup")
                .display_order(9),
        )
        .arg(
            Arg::with_name("show-memory-map")
                .long("show-memory-map")
                .help("Print the supported memory map and exit")
                .display_order(10),
        )
        .arg(
            Arg::with_name("address")
                .index(1)
                .help("address to read or write, instead of serving GDB"),
        )
        .arg(
            Arg::with_name("value")
                .value_name("value")
                .index(2)
                .required(false)
                .help("value to write"),
        )
}

fn main() -> Result<(), String> {
    flexi_logger::Logger::with_env_or_str("epiphany_server=info")
        .format_for_stderr(|write, now, record| {
            flexi_logger::colored_default_format(write, now, record)?;
            write!(write, "\r")
        })
        .start()
        .unwrap();

    let matches = clap_app().get_matches();

    let (cfg, mesh) = Config::parse(matches).map_err(|e| match e {
        config::ConfigError::NumberParseError(num, e) => {
            format!("unable to parse the number \"{}\": {}", num, e)
        }
        config::ConfigError::PlatformError(e) => format!("bad platform description: {}", e),
        config::ConfigError::IoError(e) => format!("file error: {}", e),
        config::ConfigError::InvalidConfig(s) => format!("invalid configuration: {}", s),
    })?;

    if cfg.show_memory_map {
        println!("Supported memory map:");
        for (range, core) in mesh.platform().core_ranges() {
            println!(
                "  core 0x{:03x}: 0x{:08x}-0x{:08x} (regs 0x{:08x}-0x{:08x})",
                core, range.min_addr, range.max_addr, range.min_reg_addr, range.max_reg_addr
            );
        }
        for ext in mesh.platform().ext_ranges() {
            println!(
                "  external:   0x{:08x}-0x{:08x}",
                ext.base,
                ext.base + ext.size - 1
            );
        }
        return Ok(());
    }

    if cfg.skip_platform_reset {
        warn!("no hardware reset sent to target");
    } else if let Err(e) = mesh.platform_reset() {
        return Err(format!("cannot reset the platform: {}", e));
    }

    if cfg.memory_address.is_some() {
        server::memory_access(&cfg, &mesh)
            .map_err(|e| format!("memory access failed: {:?}", e))
    } else {
        info!("listening for gdb on port {}", cfg.port);
        server::gdb_server(&cfg, &mesh).map_err(|e| format!("server failed: {:?}", e))
    }
}
