//! The server entry points: the GDB server accept loop and the one-shot
//! peek/poke utility mode.

use crate::config::Config;
use crate::epiphany::{CpuError, EpiphanyCpu};
use crate::gdb;

use log::{error, info};
use epiphany_hal::{Mesh, MeshError};

use std::fs::OpenOptions;
use std::io;
use std::net::TcpListener;

#[derive(Debug)]
pub enum ServerError {
    IoError(io::Error),
    GdbError(gdb::GdbServerError),
    MeshError(MeshError),
    CpuError(CpuError),
}

impl std::convert::From<io::Error> for ServerError {
    fn from(e: io::Error) -> ServerError {
        ServerError::IoError(e)
    }
}
impl std::convert::From<gdb::GdbServerError> for ServerError {
    fn from(e: gdb::GdbServerError) -> ServerError {
        ServerError::GdbError(e)
    }
}
impl std::convert::From<MeshError> for ServerError {
    fn from(e: MeshError) -> ServerError {
        ServerError::MeshError(e)
    }
}
impl std::convert::From<CpuError> for ServerError {
    fn from(e: CpuError) -> ServerError {
        ServerError::CpuError(e)
    }
}

/// The RSP server proper: accept one client at a time, dispatch its packets,
/// and poll the target whenever it runs. Matchpoints live in the CPU
/// controller and survive reconnects.
pub fn gdb_server(cfg: &Config, mesh: &Mesh) -> Result<(), ServerError> {
    let cpu = EpiphanyCpu::new();

    loop {
        let listener = match TcpListener::bind((cfg.bind_addr.as_str(), cfg.port)) {
            Ok(o) => o,
            Err(e) => {
                error!("couldn't bind to address: {:?}", e);
                return Err(ServerError::IoError(e));
            }
        };

        // Accept connections and process them serially.
        info!("accepting gdb connections on {}:{}", cfg.bind_addr, cfg.port);
        let (connection, _sockaddr) = match listener.accept() {
            Ok(o) => o,
            Err(e) => {
                error!("couldn't accept connection: {:?}", e);
                return Err(ServerError::IoError(e));
            }
        };
        match connection.peer_addr() {
            Ok(peer) => info!("connection from {}", peer),
            Err(e) => {
                error!("couldn't get remote address: {:?}", e);
                return Err(ServerError::IoError(e));
            }
        }

        let tty_out = match &cfg.tty_path {
            None => None,
            Some(path) => match OpenOptions::new().write(true).open(path) {
                Ok(f) => Some(f),
                Err(e) => {
                    error!("couldn't open tty {}: {}", path, e);
                    None
                }
            },
        };

        let mut server = gdb::GdbServer::new(connection, tty_out);

        if cfg.halt_on_attach {
            if let Err(e) = server.attach(&cpu, mesh) {
                error!("couldn't attach to target: {:?}", e);
                continue;
            }
        }

        loop {
            // While the target runs, the only inbound traffic honored is
            // the out-of-band break byte; everything else waits for the
            // stop reply.
            if server.is_target_running() {
                let broke = match server.poll_break() {
                    Ok(b) => b,
                    Err(e) => {
                        error!("client went away while the target ran: {:?}", e);
                        break;
                    }
                };
                let result = if broke {
                    server.suspend(&cpu, mesh)
                } else {
                    server.continue_poll(&cpu, mesh)
                };
                if let Err(e) = result {
                    if is_fatal(&e) {
                        return Err(ServerError::GdbError(e));
                    }
                    error!("error while the target ran: {:?}", e);
                    break;
                }
                continue;
            }

            let cmd = match server.get_command() {
                Err(gdb::GdbServerError::ConnectionClosed) => {
                    info!("client disconnected");
                    break;
                }
                Err(e) => {
                    error!("unable to read command from client: {:?}", e);
                    break;
                }
                Ok(o) => o,
            };

            if let Err(e) = server.process(cmd, &cpu, mesh) {
                match e {
                    gdb::GdbServerError::ConnectionClosed => (),
                    e if is_fatal(&e) => return Err(ServerError::GdbError(e)),
                    e => error!("error in GDB server: {:?}", e),
                }
                break;
            }
        }
    }
}

/// A state desync means we can no longer trust anything about the target;
/// abort rather than limp on.
fn is_fatal(e: &gdb::GdbServerError) -> bool {
    matches!(
        e,
        gdb::GdbServerError::CpuError(CpuError::StateDesync(_))
    )
}

/// devmem2-style one-shot access: read or write a single word and exit.
pub fn memory_access(cfg: &Config, mesh: &Mesh) -> Result<(), ServerError> {
    if let Some(addr) = cfg.memory_address {
        if let Some(value) = cfg.memory_value {
            mesh.write_word(addr, value)?;
        } else {
            let value = mesh.read_word(addr)?;
            println!("Value at {:08x}: {:08x}", addr, value);
        }
    } else {
        println!("No operation and no address specified!");
        println!("Try specifying an address such as \"0x80802000\". See --help for more information");
    }
    Ok(())
}
