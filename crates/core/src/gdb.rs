//! The GDB Remote Serial Protocol server: packet framing, command decode,
//! and the dispatcher that turns client requests into target operations.
//!
//! Protocol decode is kept apart from target control: every packet is parsed
//! into a [`GdbCommand`] variant first, and [`GdbServer::process`] maps
//! variants to handlers. The handlers talk to the target only through
//! [`EpiphanyCpu`] and [`Mesh`].

use std::fs::File;
use std::io;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info, warn};

use crate::epiphany::exception::TargetSignal;
use crate::epiphany::isa;
use crate::epiphany::{CpuError, EpiphanyCpu, MpKind, StopEvent};
use epiphany_hal::{Mesh, MeshError};

/// Packet buffer capacity, advertised to the client in `qSupported`.
pub const RSP_PKT_MAX: usize = 0x1000;

/// The one thread ID we report; the target has no scheduler, a "thread" is
/// a core.
const THREAD_ID: u32 = 1;

/// Longest pathname walked out of target memory for open-like traps.
const MAX_FILE_NAME_LENGTH: u32 = 1024;

// Semihosting trap numbers, from the instruction's dispatch field.
const TRAP_WRITE: u8 = 0;
const TRAP_READ: u8 = 1;
const TRAP_OPEN: u8 = 2;
const TRAP_EXIT: u8 = 3;
const TRAP_PASS: u8 = 4;
const TRAP_FAIL: u8 = 5;
const TRAP_CLOSE: u8 = 6;
const TRAP_OTHER: u8 = 7;

// Newlib sub-function numbers carried in r3 by trap 7.
const SYS_OPEN: u32 = 2;
const SYS_CLOSE: u32 = 3;
const SYS_READ: u32 = 4;
const SYS_WRITE: u32 = 5;
const SYS_LSEEK: u32 = 6;
const SYS_UNLINK: u32 = 7;
const SYS_FSTAT: u32 = 10;
const SYS_STAT: u32 = 15;

#[derive(Debug)]
pub enum GdbServerError {
    /// Rust standard IO error
    IoError(io::Error),

    /// The network connection has closed
    ConnectionClosed,

    /// We were unable to parse an integer
    NumberParseError(String, std::num::ParseIntError),

    /// Something happened with the target
    CpuError(CpuError),

    /// The target bus failed
    MeshError(MeshError),

    /// Something strange was received
    ProtocolError,
}

impl std::convert::From<CpuError> for GdbServerError {
    fn from(e: CpuError) -> Self {
        GdbServerError::CpuError(e)
    }
}

impl std::convert::From<MeshError> for GdbServerError {
    fn from(e: MeshError) -> Self {
        GdbServerError::MeshError(e)
    }
}

impl std::convert::From<io::Error> for GdbServerError {
    fn from(e: io::Error) -> Self {
        GdbServerError::IoError(e)
    }
}

pub fn parse_u32(value: &str) -> Result<u32, GdbServerError> {
    match u32::from_str_radix(value, 16) {
        Ok(o) => Ok(o),
        Err(e) => Err(GdbServerError::NumberParseError(value.to_owned(), e)),
    }
}

/// Thread IDs are hex but may be -1 ("all threads").
fn parse_thread_id(value: &str) -> Result<i32, GdbServerError> {
    if value.starts_with('-') {
        let magnitude = parse_u32(value.trim_start_matches('-'))?;
        Ok(-(magnitude as i32))
    } else {
        Ok(parse_u32(value)? as i32)
    }
}

/// File-I/O reply values are hex and may be negative.
fn parse_fileio_int(value: &str) -> Result<i64, GdbServerError> {
    if value.starts_with('-') {
        let rest = value.trim_start_matches('-');
        match i64::from_str_radix(rest, 16) {
            Ok(o) => Ok(-o),
            Err(e) => Err(GdbServerError::NumberParseError(value.to_owned(), e)),
        }
    } else {
        match i64::from_str_radix(value, 16) {
            Ok(o) => Ok(o),
            Err(e) => Err(GdbServerError::NumberParseError(value.to_owned(), e)),
        }
    }
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn hex_to_bytes(s: &str) -> Option<Vec<u8>> {
    let raw = s.as_bytes();
    if raw.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(raw.len() / 2);
    for pair in raw.chunks_exact(2) {
        out.push((hex_nibble(pair[0])? << 4) | hex_nibble(pair[1])?);
    }
    Some(out)
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// A register travels as its four bytes in target (little-endian) order,
/// hex encoded.
fn reg_to_hex(value: u32) -> String {
    bytes_to_hex(&value.to_le_bytes())
}

fn hex_to_reg(s: &str) -> Option<u32> {
    let bytes = hex_to_bytes(s)?;
    if bytes.len() != 4 {
        return None;
    }
    Some(LittleEndian::read_u32(&bytes))
}

/// Undo the wire transforms of a received payload: `}x` unescapes to
/// `x ^ 0x20`, and `c*n` repeats `c` a further `n - 28` times.
fn expand_packet(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'}' if i + 1 < input.len() => {
                out.push(input[i + 1] ^ 0x20);
                i += 2;
            }
            b'*' if i + 1 < input.len() && !out.is_empty() => {
                let count = input[i + 1].saturating_sub(28);
                let repeated = *out.last().unwrap();
                for _ in 0..count {
                    out.push(repeated);
                }
                i += 2;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

/// Frame a payload for the wire: escape the reserved bytes, then wrap in
/// `$`...`#` with the additive checksum of what was actually sent.
fn frame_packet(payload: &[u8]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(payload.len() + 5);
    buffer.push(b'$');
    let mut checksum: u8 = 0;
    for &b in payload {
        match b {
            b'$' | b'#' | b'}' | b'*' => {
                buffer.push(b'}');
                checksum = checksum.wrapping_add(b'}');
                let escaped = b ^ 0x20;
                buffer.push(escaped);
                checksum = checksum.wrapping_add(escaped);
            }
            b => {
                buffer.push(b);
                checksum = checksum.wrapping_add(b);
            }
        }
    }
    buffer.push(b'#');
    buffer.extend_from_slice(format!("{:02x}", checksum).as_bytes());
    buffer
}

/// Slice a paged `qXfer` reply out of the full document: `m` + chunk while
/// more follows, `l` + chunk for the last one.
fn page_of(data: &[u8], offset: usize, length: usize) -> Vec<u8> {
    if offset >= data.len() {
        return vec![b'l'];
    }
    let remaining = data.len() - offset;
    let (pktlen, prefix) = if remaining > length {
        (length, b'm')
    } else {
        (remaining, b'l')
    };
    let mut reply = Vec::with_capacity(pktlen + 1);
    reply.push(prefix);
    reply.extend_from_slice(&data[offset..offset + pktlen]);
    reply
}

/// Host-side rendering of the target's printf records: a format string and
/// a packed argument buffer, strings nul-terminated, numbers four bytes.
fn printf_wrapper(fmt: &str, args: &[u8]) -> String {
    let mut out = String::new();
    let bytes = fmt.as_bytes();
    let mut args = args;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 1 < bytes.len() {
            let conv = bytes[i + 1];
            match conv {
                b'%' => {
                    out.push('%');
                    i += 2;
                }
                b's' => {
                    let end = args.iter().position(|&b| b == 0).unwrap_or(args.len());
                    out.push_str(&String::from_utf8_lossy(&args[..end]));
                    args = if end < args.len() {
                        &args[end + 1..]
                    } else {
                        &args[end..]
                    };
                    i += 2;
                }
                b'd' | b'i' | b'u' | b'x' | b'X' | b'p' | b'f' => {
                    let mut raw = [0u8; 4];
                    let n = args.len().min(4);
                    raw[..n].copy_from_slice(&args[..n]);
                    let value = u32::from_le_bytes(raw);
                    args = &args[n..];
                    match conv {
                        b'd' | b'i' => out.push_str(&format!("{}", value as i32)),
                        b'u' => out.push_str(&format!("{}", value)),
                        b'x' => out.push_str(&format!("{:x}", value)),
                        b'X' => out.push_str(&format!("{:X}", value)),
                        b'p' => out.push_str(&format!("0x{:x}", value)),
                        _ => out.push_str(&format!("{}", f32::from_bits(value))),
                    }
                    i += 2;
                }
                _ => {
                    out.push('%');
                    i += 1;
                }
            }
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    out
}

#[derive(Debug, PartialEq)]
pub enum GdbCommand {
    /// Client gave an unrecognized command; per convention it gets no reply
    Unknown(String),

    /// A recognized command with fields we could not parse; replies E01
    Malformed(String),

    /// vMustReplyEmpty, sent by the client to probe unknown-packet handling
    MustReplyEmpty,

    /// Raw 0x03, out of band
    Interrupt,

    /// ?
    LastSignal,

    /// g
    ReadAllRegs,

    /// G
    WriteAllRegs(Vec<u32>),

    /// p#
    ReadReg(u32),

    /// P#=#
    WriteReg(u32, u32),

    /// m#,#
    ReadMem(u32 /* addr */, u32 /* length */),

    /// M#,#:hex
    WriteMem(u32, u32, Vec<u8>),

    /// X#,#:binary
    WriteMemBin(u32, u32, Vec<u8>),

    /// c[addr]
    Continue(Option<u32>),

    /// Csig[;addr]
    ContinueSignal(u8, Option<u32>),

    /// s[addr]
    Step(Option<u32>),

    /// Ssig[;addr]
    StepSignal(u8, Option<u32>),

    /// Hc# / Hg#
    SetThread(char, i32),

    /// Z#,addr,kind
    InsertMatchpoint(MpKind, u32, u32),

    /// z#,addr,kind
    RemoveMatchpoint(MpKind, u32, u32),

    /// Fretcode[,errno[,C]]
    FileIoReply(i64, Option<i64>, bool),

    /// R (and the deprecated r)
    Restart,

    /// D
    Detach,

    /// k
    Kill,

    /// T#
    IsThreadAlive(u32),

    /// !
    ExtendedMode,

    /// A
    SetProgramArgs,

    /// b, B, d, i, I, t: deprecated or unsupported, warned and ignored
    Deprecated(char),

    /// qC
    QueryCurrentThread,

    /// qCRC
    QueryCrc,

    /// qfThreadInfo
    QueryThreadInfoFirst,

    /// qsThreadInfo
    QueryThreadInfoNext,

    /// qGetTLSAddr:
    QueryGetTlsAddr,

    /// qL (deprecated)
    QueryL,

    /// qOffsets
    QueryOffsets,

    /// qP (deprecated)
    QueryP,

    /// qRcmd,<hex>
    MonitorCommand(String),

    /// qSupported
    QuerySupported(String),

    /// qSymbol:
    QuerySymbol,

    /// qThreadExtraInfo
    QueryThreadExtraInfo,

    /// qAttached
    QueryAttached,

    /// qTStatus
    QueryTraceStatus,

    /// qXfer:osdata:read:<annex>:<offset>,<length>
    OsDataRead(String, u32, u32),

    /// Any other qXfer
    XferUnsupported,

    /// Any other query
    QueryUnknown(String),

    /// QPassSignals
    PassSignals,

    /// QTStart
    TraceStart,

    /// QTStop
    TraceStop,

    /// QTinit
    TraceInit,

    /// QTDP / QFrame / QTro
    TraceStub(String),

    /// Any other set
    SetUnknown(String),

    /// vAttach
    VAttach,

    /// vCont?
    VContQuery,

    /// vCont;...
    VCont(String),

    /// vFile:...
    VFile,

    /// vFlashErase / vFlashWrite / vFlashDone
    VFlash(String),

    /// vRun
    VRun,

    /// Any other v packet
    VUnknown(String),
}

pub struct GdbServer {
    connection: TcpStream,

    /// True between a resume and the stop reply that ends it.
    is_target_running: bool,

    /// Destination of trap-7 printf records, when redirected.
    tty_out: Option<File>,
}

impl GdbServer {
    pub fn new(connection: TcpStream, tty_out: Option<File>) -> GdbServer {
        GdbServer {
            connection,
            is_target_running: false,
            tty_out,
        }
    }

    pub fn is_target_running(&self) -> bool {
        self.is_target_running
    }

    // ------------------------------------------------------------------
    // Wire handling
    // ------------------------------------------------------------------

    fn read_byte(&mut self) -> Result<u8, GdbServerError> {
        let mut byte = [0; 1];
        let len = self.connection.read(&mut byte)?;
        if len == 0 {
            return Err(GdbServerError::ConnectionClosed);
        }
        Ok(byte[0])
    }

    /// Read one packet payload, fully expanded. `None` means an out-of-band
    /// break byte arrived instead.
    fn do_get_packet(&mut self) -> Result<Option<Vec<u8>>, GdbServerError> {
        loop {
            match self.read_byte()? {
                b'$' => {
                    let mut payload = Vec::new();
                    let mut checksum: u8 = 0;
                    loop {
                        let b = self.read_byte()?;
                        if b == b'#' {
                            break;
                        }
                        payload.push(b);
                        checksum = checksum.wrapping_add(b);
                    }
                    let mut remote = [0u8; 2];
                    remote[0] = self.read_byte()?;
                    remote[1] = self.read_byte()?;
                    let expected = format!("{:02x}", checksum);
                    if expected.as_bytes() != remote {
                        info!(
                            "checksum mismatch: calculated {} vs {}",
                            expected,
                            String::from_utf8_lossy(&remote)
                        );
                        self.connection.write_all(b"-")?;
                        continue;
                    }
                    self.connection.write_all(b"+")?;
                    return Ok(Some(expand_packet(&payload)));
                }
                b'+' | b'-' => {}
                0x03 => return Ok(None),
                // Framing noise; discard until the next '$'.
                other => warn!("unrecognized byte received: 0x{:02x}", other),
            }
        }
    }

    pub fn get_command(&mut self) -> Result<GdbCommand, GdbServerError> {
        let cmd = match self.do_get_packet()? {
            None => GdbCommand::Interrupt,
            Some(payload) => packet_to_command(&payload),
        };
        debug!("<  GDB packet: {:?}", cmd);
        Ok(cmd)
    }

    /// Look for an out-of-band break byte without blocking; used while the
    /// target runs.
    pub fn poll_break(&mut self) -> Result<bool, GdbServerError> {
        self.connection.set_nonblocking(true)?;
        let mut byte = [0u8; 1];
        let result = match self.connection.peek(&mut byte) {
            Ok(0) => Err(GdbServerError::ConnectionClosed),
            Ok(_) => {
                if byte[0] == 0x03 {
                    self.connection.read_exact(&mut byte)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(GdbServerError::IoError(e)),
        };
        self.connection.set_nonblocking(false)?;
        result
    }

    fn gdb_send(&mut self, payload: &[u8]) -> Result<(), GdbServerError> {
        let frame = frame_packet(payload);
        debug!(" > {}", String::from_utf8_lossy(&frame));
        self.connection.write_all(&frame)?;
        Ok(())
    }

    fn gdb_send_str(&mut self, payload: &str) -> Result<(), GdbServerError> {
        self.gdb_send(payload.as_bytes())
    }

    fn gdb_send_paged(&mut self, data: &[u8], offset: u32, length: u32) -> Result<(), GdbServerError> {
        self.gdb_send(&page_of(data, offset as usize, length as usize))
    }

    /// Send a stop reply. Every stop reply drops the running flag.
    fn report_stop(&mut self, signal: TargetSignal) -> Result<(), GdbServerError> {
        self.gdb_send_str(&format!("S{:02x}", signal.number()))?;
        self.is_target_running = false;
        Ok(())
    }

    /// Run a target operation for a request handler. A bus failure replies
    /// E01 and keeps the session; a state desync aborts the server.
    fn target_result<T, E: Into<CpuError>>(
        &mut self,
        r: Result<T, E>,
    ) -> Result<Option<T>, GdbServerError> {
        match r.map_err(Into::into) {
            Ok(v) => Ok(Some(v)),
            Err(CpuError::StateDesync(s)) => Err(GdbServerError::CpuError(CpuError::StateDesync(s))),
            Err(e) => {
                error!("target access failed: {}", e);
                self.gdb_send(b"E01")?;
                Ok(None)
            }
        }
    }

    // ------------------------------------------------------------------
    // Session control
    // ------------------------------------------------------------------

    /// Called on a fresh connection: stall the target so the client finds
    /// it stopped.
    pub fn attach(&mut self, cpu: &EpiphanyCpu, mesh: &Mesh) -> Result<(), GdbServerError> {
        match cpu.halt(mesh) {
            Ok(true) => Ok(()),
            Ok(false) => self.report_stop(TargetSignal::Hup),
            Err(e) => {
                error!("couldn't halt target on attach: {}", e);
                self.report_stop(TargetSignal::Hup)
            }
        }
    }

    /// One continue-poll slice; the caller interleaves break polling.
    pub fn continue_poll(&mut self, cpu: &EpiphanyCpu, mesh: &Mesh) -> Result<(), GdbServerError> {
        match cpu.poll_halt(mesh) {
            Ok(ev) => self.handle_stop_event(cpu, mesh, ev),
            Err(CpuError::StateDesync(s)) => {
                Err(GdbServerError::CpuError(CpuError::StateDesync(s)))
            }
            Err(e) => {
                error!("target poll failed: {}", e);
                self.report_stop(TargetSignal::Hup)
            }
        }
    }

    /// The client pressed Ctrl-C while the target was running.
    pub fn suspend(&mut self, cpu: &EpiphanyCpu, mesh: &Mesh) -> Result<(), GdbServerError> {
        info!("break request from the client");
        match cpu.suspend(mesh) {
            Ok(ev) => self.handle_stop_event(cpu, mesh, ev),
            Err(CpuError::StateDesync(s)) => {
                Err(GdbServerError::CpuError(CpuError::StateDesync(s)))
            }
            Err(e) => {
                error!("suspend failed: {}", e);
                self.report_stop(TargetSignal::Hup)
            }
        }
    }

    fn handle_stop_event(
        &mut self,
        cpu: &EpiphanyCpu,
        mesh: &Mesh,
        ev: StopEvent,
    ) -> Result<(), GdbServerError> {
        match ev {
            StopEvent::Running => Ok(()),
            StopEvent::Stopped { pc, signal } => {
                debug!("stopped at pc 0x{:08x} with signal {}", pc, signal.number());
                self.report_stop(signal)
            }
            StopEvent::Trap { pc, trap } => {
                debug!("semihosting trap {} at pc 0x{:08x}", trap, pc);
                self.is_target_running = false;
                match self.redirect_trap(cpu, mesh, trap) {
                    Err(GdbServerError::CpuError(CpuError::Mesh(e))) => {
                        error!("target access failed during trap redirection: {}", e);
                        self.report_stop(TargetSignal::Hup)
                    }
                    Err(GdbServerError::MeshError(e)) => {
                        error!("target access failed during trap redirection: {}", e);
                        self.report_stop(TargetSignal::Hup)
                    }
                    other => other,
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Semihosting
    // ------------------------------------------------------------------

    /// Scan a nul-terminated pathname out of target memory, bounded.
    fn target_strlen(&self, mesh: &Mesh, addr: u32) -> Result<u32, MeshError> {
        for k in 0..MAX_FILE_NAME_LENGTH - 1 {
            if mesh.read_u8(addr + k)? == 0 {
                return Ok(k);
            }
        }
        Ok(MAX_FILE_NAME_LENGTH - 1)
    }

    /// Turn a semihosting trap into a File-I/O request (or handle it host
    /// side). The target stays halted until the `F` reply resumes it.
    fn redirect_trap(
        &mut self,
        cpu: &EpiphanyCpu,
        mesh: &Mesh,
        trap: u8,
    ) -> Result<(), GdbServerError> {
        match trap {
            TRAP_WRITE => {
                let chan = cpu.read_gpr(mesh, 0)?;
                let addr = cpu.read_gpr(mesh, 1)?;
                let len = cpu.read_gpr(mesh, 2)?;
                debug!("trap write: chan {}, {} bytes", chan, len);
                self.gdb_send_str(&format!("Fwrite,{:x},{:x},{:x}", chan, addr, len))
            }
            TRAP_READ => {
                let chan = cpu.read_gpr(mesh, 0)?;
                let addr = cpu.read_gpr(mesh, 1)?;
                let len = cpu.read_gpr(mesh, 2)?;
                debug!("trap read: chan {}, {} bytes", chan, len);
                self.gdb_send_str(&format!("Fread,{:x},{:x},{:x}", chan, addr, len))
            }
            TRAP_OPEN => {
                let path = cpu.read_gpr(mesh, 0)?;
                let flags = cpu.read_gpr(mesh, 1)?;
                let len = self.target_strlen(mesh, path)?;
                debug!("trap open: path at 0x{:08x} ({} bytes), flags 0x{:x}", path, len, flags);
                // Mode is fixed: owner read/write.
                self.gdb_send_str(&format!("Fopen,{:x}/{:x},{:x},{:x}", path, len, flags, 0o600))
            }
            TRAP_EXIT => {
                info!("target exited");
                self.report_stop(TargetSignal::Quit)
            }
            TRAP_PASS => {
                info!("target reports PASS");
                self.report_stop(TargetSignal::Trap)
            }
            TRAP_FAIL => {
                info!("target reports FAIL");
                self.report_stop(TargetSignal::Quit)
            }
            TRAP_CLOSE => {
                let chan = cpu.read_gpr(mesh, 0)?;
                debug!("trap close: chan {}", chan);
                self.gdb_send_str(&format!("Fclose,{:x}", chan))
            }
            TRAP_OTHER => self.redirect_trap_other(cpu, mesh),
            other => {
                warn!("unknown trap number {}: ignored", other);
                Ok(())
            }
        }
    }

    /// Trap 7 carries either a printf record (rendered host side when a tty
    /// redirection is configured) or a newlib syscall selected by r3.
    fn redirect_trap_other(&mut self, cpu: &EpiphanyCpu, mesh: &Mesh) -> Result<(), GdbServerError> {
        if self.tty_out.is_some() {
            let buf_addr = cpu.read_gpr(mesh, 0)?;
            let fmt_len = cpu.read_gpr(mesh, 1)? as usize;
            let total_len = cpu.read_gpr(mesh, 2)? as usize;

            let mut buf = vec![0u8; total_len];
            mesh.read_burst(buf_addr, &mut buf)?;

            let fmt_end = buf
                .iter()
                .take(fmt_len)
                .position(|&b| b == 0)
                .unwrap_or(fmt_len.min(buf.len()));
            let fmt = String::from_utf8_lossy(&buf[..fmt_end]).into_owned();
            let args = if fmt_len + 1 < buf.len() {
                &buf[fmt_len + 1..]
            } else {
                &[][..]
            };
            let record = printf_wrapper(&fmt, args);

            if let Some(tty) = self.tty_out.as_mut() {
                tty.write_all(record.as_bytes())?;
                tty.flush()?;
            }

            cpu.resume(mesh)?;
            self.is_target_running = true;
            return Ok(());
        }

        let r0 = cpu.read_gpr(mesh, 0)?;
        let r1 = cpu.read_gpr(mesh, 1)?;
        let r2 = cpu.read_gpr(mesh, 2)?;
        let subfun = cpu.read_gpr(mesh, 3)?;

        let request = match subfun {
            SYS_CLOSE => format!("Fclose,{:x}", r0),
            SYS_OPEN => {
                let len = self.target_strlen(mesh, r0)?;
                format!("Fopen,{:x}/{:x},{:x},{:x}", r0, len, r1, r2)
            }
            SYS_READ => format!("Fread,{:x},{:x},{:x}", r0, r1, r2),
            SYS_WRITE => format!("Fwrite,{:x},{:x},{:x}", r0, r1, r2),
            SYS_LSEEK => format!("Flseek,{:x},{:x},{:x}", r0, r1, r2),
            SYS_UNLINK => {
                let len = self.target_strlen(mesh, r0)?;
                format!("Funlink,{:x}/{:x}", r0, len)
            }
            SYS_STAT => {
                let len = self.target_strlen(mesh, r0)?;
                format!("Fstat,{:x}/{:x},{:x}", r0, len, r1)
            }
            SYS_FSTAT => format!("Ffstat,{:x},{:x}", r0, r1),
            other => {
                error!("trap 7 with unknown sub-function {}: ignored", other);
                return Ok(());
            }
        };
        debug!("trap 7: {}", request);
        self.gdb_send_str(&request)
    }

    /// The client answered a File-I/O request: write the return value and
    /// errno back and let the target continue.
    fn handle_fileio_reply(
        &mut self,
        cpu: &EpiphanyCpu,
        mesh: &Mesh,
        result: i64,
        errno: Option<i64>,
        ctrl_c: bool,
    ) -> Result<(), GdbServerError> {
        if self
            .target_result(cpu.write_gpr(mesh, 0, result as u32))?
            .is_none()
        {
            return Ok(());
        }
        if let Some(e) = errno {
            if self.target_result(cpu.write_gpr(mesh, 3, e as u32))?.is_none() {
                return Ok(());
            }
        }
        debug!("remote io done: result {}, errno {:?}", result, errno);

        if ctrl_c {
            // The user broke in during the host call.
            return self.report_stop(TargetSignal::Int);
        }

        if self.target_result(cpu.resume(mesh))?.is_some() {
            self.is_target_running = true;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    #[allow(clippy::cognitive_complexity)]
    pub fn process(
        &mut self,
        cmd: GdbCommand,
        cpu: &EpiphanyCpu,
        mesh: &Mesh,
    ) -> Result<(), GdbServerError> {
        match cmd {
            GdbCommand::LastSignal => self.report_stop(TargetSignal::Trap)?,

            GdbCommand::ReadAllRegs => {
                if let Some(values) = self.target_result(cpu.read_all_regs(mesh))? {
                    let mut reply = String::with_capacity(values.len() * 8);
                    for v in values {
                        reply.push_str(&reg_to_hex(v));
                    }
                    self.gdb_send_str(&reply)?;
                }
            }

            GdbCommand::WriteAllRegs(values) => {
                let mut ok = true;
                for (i, v) in values.iter().enumerate() {
                    if self
                        .target_result(cpu.write_reg(mesh, i as u32, *v))?
                        .is_none()
                    {
                        ok = false;
                        break;
                    }
                }
                if ok {
                    self.gdb_send(b"OK")?;
                }
            }

            GdbCommand::ReadReg(regnum) => {
                if let Some(v) = self.target_result(cpu.read_reg(mesh, regnum))? {
                    self.gdb_send_str(&reg_to_hex(v))?;
                }
            }

            GdbCommand::WriteReg(regnum, value) => {
                if self
                    .target_result(cpu.write_reg(mesh, regnum, value))?
                    .is_some()
                {
                    self.gdb_send(b"OK")?;
                }
            }

            GdbCommand::ReadMem(addr, len) => {
                // Two hex chars per byte must fit in the packet.
                let mut len = len as usize;
                if len * 2 >= RSP_PKT_MAX {
                    warn!("memory read of {} bytes too large for a packet: truncated", len);
                    len = (RSP_PKT_MAX - 1) / 2;
                }
                let mut buf = vec![0u8; len];
                if self
                    .target_result(mesh.read_burst(addr, &mut buf))?
                    .is_some()
                {
                    self.gdb_send_str(&bytes_to_hex(&buf))?;
                }
            }

            GdbCommand::WriteMem(addr, len, data) => {
                if data.len() != len as usize {
                    warn!(
                        "write of {} bytes requested, but {} supplied: packet ignored",
                        len,
                        data.len()
                    );
                    self.gdb_send(b"E01")?;
                } else if self
                    .target_result(mesh.write_burst(addr, &data))?
                    .is_some()
                {
                    self.gdb_send(b"OK")?;
                }
            }

            GdbCommand::WriteMemBin(addr, len, mut data) => {
                if data.len() != len as usize {
                    warn!(
                        "binary write of {} bytes requested, but {} supplied: writing {}",
                        len,
                        data.len(),
                        len.min(data.len() as u32)
                    );
                    data.truncate(len as usize);
                }
                if self
                    .target_result(mesh.write_burst(addr, &data))?
                    .is_some()
                {
                    self.gdb_send(b"OK")?;
                }
            }

            GdbCommand::Continue(addr) => self.handle_continue(cpu, mesh, addr)?,
            GdbCommand::ContinueSignal(sig, addr) => {
                debug!("continue with signal {}: signal ignored", sig);
                self.handle_continue(cpu, mesh, addr)?;
            }

            GdbCommand::Step(addr) => {
                if let Some(ev) = self.target_result(cpu.step(mesh, addr))? {
                    self.handle_stop_event(cpu, mesh, ev)?;
                }
            }
            GdbCommand::StepSignal(sig, addr) => {
                debug!("step with signal {}: signal ignored", sig);
                if let Some(ev) = self.target_result(cpu.step(mesh, addr))? {
                    self.handle_stop_event(cpu, mesh, ev)?;
                }
            }

            GdbCommand::SetThread(op, id) => {
                let accepted = match op {
                    'c' => mesh.set_thread_execute(id),
                    'g' => mesh.set_thread_general(id),
                    _ => false,
                };
                if accepted {
                    self.gdb_send(b"OK")?;
                } else {
                    warn!("failed to set thread {} for '{}' operations", id, op);
                    self.gdb_send(b"E01")?;
                }
            }

            GdbCommand::InsertMatchpoint(kind, addr, len) => {
                if kind != MpKind::Memory {
                    // Hardware breakpoints and watchpoints are not
                    // implemented; an empty reply advertises that.
                    self.gdb_send(b"")?;
                } else {
                    if len != isa::BKPT_INSTLEN {
                        warn!("matchpoint length {} unexpected: {} assumed", len, isa::BKPT_INSTLEN);
                    }
                    if self
                        .target_result(cpu.insert_breakpoint(mesh, addr))?
                        .is_some()
                    {
                        self.gdb_send(b"OK")?;
                    }
                }
            }

            GdbCommand::RemoveMatchpoint(kind, addr, len) => {
                if kind != MpKind::Memory {
                    self.gdb_send(b"")?;
                } else {
                    if len != isa::BKPT_INSTLEN {
                        warn!("matchpoint length {} unexpected: {} assumed", len, isa::BKPT_INSTLEN);
                    }
                    if self
                        .target_result(cpu.remove_breakpoint(mesh, addr))?
                        .is_some()
                    {
                        self.gdb_send(b"OK")?;
                    }
                }
            }

            GdbCommand::FileIoReply(result, errno, ctrl_c) => {
                self.handle_fileio_reply(cpu, mesh, result, errno, ctrl_c)?;
            }

            GdbCommand::Restart => {
                // Restart puts the program counter back to the reset vector;
                // there is no reply.
                self.target_result(cpu.write_pc(mesh, 0))?;
            }

            GdbCommand::Detach => {
                self.gdb_send(b"OK")?;
                self.connection.shutdown(Shutdown::Both).ok();
            }

            GdbCommand::Kill => {
                info!(
                    "kill request: the server detaches from this client; \
                     use 'target remote' to connect again"
                );
                self.is_target_running = false;
            }

            GdbCommand::IsThreadAlive(_) => self.gdb_send(b"OK")?,

            GdbCommand::ExtendedMode => self.gdb_send(b"")?,

            GdbCommand::SetProgramArgs => {
                warn!("'A' packet not supported: ignored");
                self.gdb_send(b"E01")?;
            }

            GdbCommand::Deprecated(c) => {
                warn!("'{}' packet is deprecated or unsupported: ignored", c);
            }

            GdbCommand::QueryCurrentThread => {
                self.gdb_send_str(&format!("QC{:x}", THREAD_ID))?
            }

            GdbCommand::QueryCrc => {
                warn!("CRC query not supported");
                self.gdb_send(b"E01")?;
            }

            GdbCommand::QueryThreadInfoFirst => {
                self.gdb_send_str(&format!("m{:x}", THREAD_ID))?
            }

            GdbCommand::QueryThreadInfoNext => self.gdb_send(b"l")?,

            GdbCommand::QueryGetTlsAddr => self.gdb_send(b"")?,

            GdbCommand::QueryL => {
                warn!("qL is deprecated: no info returned");
                self.gdb_send(b"qM001")?;
            }

            GdbCommand::QueryOffsets => self.gdb_send(b"Text=0;Data=0;Bss=0")?,

            GdbCommand::QueryP => {
                warn!("qP is deprecated: no info returned");
                self.gdb_send(b"")?;
            }

            GdbCommand::MonitorCommand(cmd) => self.monitor_command(cpu, mesh, &cmd)?,

            GdbCommand::QuerySupported(_) => {
                self.gdb_send_str(&format!(
                    "PacketSize={:x};qXfer:osdata:read+",
                    RSP_PKT_MAX
                ))?;
            }

            // We never ask for symbol lookups, so acknowledging is enough.
            GdbCommand::QuerySymbol => self.gdb_send(b"OK")?,

            GdbCommand::QueryThreadExtraInfo => {
                self.gdb_send_str(&bytes_to_hex(b"Runnable\0"))?
            }

            GdbCommand::QueryAttached => self.gdb_send(b"")?,

            GdbCommand::QueryTraceStatus => self.gdb_send(b"")?,

            GdbCommand::OsDataRead(annex, offset, length) => {
                let document = match annex.as_str() {
                    "process" => Some(osdata_processes(mesh)),
                    "load" => Some(osdata_load(mesh)),
                    "traffic" => Some(osdata_traffic(mesh)),
                    _ => None,
                };
                match document {
                    Some(doc) => self.gdb_send_paged(doc.as_bytes(), offset, length)?,
                    None => self.gdb_send(b"")?,
                }
            }

            GdbCommand::XferUnsupported => self.gdb_send(b"")?,

            GdbCommand::QueryUnknown(q) => {
                debug!("unsupported query {}: empty reply", q);
                self.gdb_send(b"")?;
            }

            GdbCommand::PassSignals => self.gdb_send(b"")?,

            GdbCommand::TraceStart => {
                let reply: &[u8] = if mesh.start_trace() { b"OK" } else { b"" };
                self.gdb_send(reply)?;
            }
            GdbCommand::TraceStop => {
                let reply: &[u8] = if mesh.stop_trace() { b"OK" } else { b"" };
                self.gdb_send(reply)?;
            }
            GdbCommand::TraceInit => {
                let reply: &[u8] = if mesh.init_trace() { b"OK" } else { b"" };
                self.gdb_send(reply)?;
            }
            GdbCommand::TraceStub(_) => self.gdb_send(b"OK")?,

            GdbCommand::SetUnknown(q) => {
                warn!("unrecognized set request {}: ignored", q);
                self.gdb_send(b"")?;
            }

            GdbCommand::VAttach => {
                // Attaching is a null action: there is no other process.
                // Report a stop so the client knows where it stands.
                self.report_stop(TargetSignal::Trap)?;
            }

            GdbCommand::VContQuery => {
                // Advertise no vCont support; see the warning below.
                self.gdb_send(b"")?;
            }

            GdbCommand::VCont(pkt) => {
                // Shouldn't happen: we advertised no support via vCont?.
                warn!("vCont not supported: {} ignored", pkt);
            }

            GdbCommand::VFile => {
                warn!("vFile not supported: ignored");
                self.gdb_send(b"")?;
            }

            GdbCommand::VFlash(pkt) => {
                warn!("{} not supported: ignored", pkt);
                self.gdb_send(b"E01")?;
            }

            GdbCommand::VRun => {
                // Unlike 'R', vRun reports as though the program just
                // stopped at its entry.
                if self.target_result(cpu.write_pc(mesh, 0))?.is_some() {
                    self.report_stop(TargetSignal::Trap)?;
                }
            }

            GdbCommand::VUnknown(pkt) => {
                warn!("unknown 'v' packet {}: ignored", pkt);
                self.gdb_send(b"E01")?;
            }

            GdbCommand::MustReplyEmpty => self.gdb_send(b"")?,

            GdbCommand::Interrupt => {
                // A break byte with the target already stopped; report where
                // it is.
                self.suspend(cpu, mesh)?;
            }

            GdbCommand::Malformed(pkt) => {
                warn!("malformed packet {}: error reply", pkt);
                self.gdb_send(b"E01")?;
            }

            GdbCommand::Unknown(pkt) => {
                // Unknown first bytes get no reply at all.
                warn!("unknown RSP request {}: ignored", pkt);
            }
        }
        Ok(())
    }

    fn handle_continue(
        &mut self,
        cpu: &EpiphanyCpu,
        mesh: &Mesh,
        addr: Option<u32>,
    ) -> Result<(), GdbServerError> {
        if self.is_target_running {
            return Ok(());
        }
        match cpu.in_debug_state(mesh) {
            Ok(true) => {
                if let Some(a) = addr {
                    if self.target_result(cpu.write_pc(mesh, a))?.is_none() {
                        return Ok(());
                    }
                }
                if self.target_result(cpu.resume(mesh))?.is_none() {
                    return Ok(());
                }
            }
            Ok(false) => {
                // Already running behind our back; just track it.
                debug!("continue requested while the core is already running");
            }
            Err(e) => {
                error!("couldn't inspect halt state: {}", e);
                self.gdb_send(b"E01")?;
                return Ok(());
            }
        }
        self.is_target_running = true;
        Ok(())
    }

    fn monitor_command(
        &mut self,
        cpu: &EpiphanyCpu,
        mesh: &Mesh,
        cmd: &str,
    ) -> Result<(), GdbServerError> {
        match cmd {
            "swreset" => {
                info!("the debugger sent a software reset request");
                if self.target_result(cpu.sw_reset(mesh))?.is_some() {
                    self.gdb_send(b"OK")?;
                }
            }
            "hwreset" => {
                let message = "The debugger sent a platform reset request, \
                               please restart other debug clients.\n";
                info!("{}", message.trim_end());
                if self.target_result(mesh.platform_reset())?.is_some() {
                    self.gdb_send_str(&bytes_to_hex(message.as_bytes()))?;
                }
            }
            "halt" => {
                info!("the debugger sent a halt request");
                match cpu.halt(mesh) {
                    Ok(true) => self.gdb_send(b"OK")?,
                    Ok(false) => {
                        self.gdb_send_str(&bytes_to_hex(b"target did not halt\n"))?
                    }
                    Err(e) => {
                        error!("halt failed: {}", e);
                        self.gdb_send(b"E01")?;
                    }
                }
            }
            "run" => {
                info!("the debugger sent a start request");
                if self.target_result(cpu.start_run(mesh))?.is_some() {
                    self.gdb_send(b"OK")?;
                }
            }
            "coreid" => {
                if let Some(id) = self.target_result(cpu.read_core_id(mesh))? {
                    self.gdb_send_str(&bytes_to_hex(format!("0x{:x}\n", id).as_bytes()))?;
                }
            }
            "help" => {
                self.gdb_send_str(&bytes_to_hex(
                    b"monitor commands: hwreset, coreid, swreset, halt, run, help\n",
                ))?;
            }
            other => {
                warn!("received remote command {}: ignored", other);
                self.gdb_send(b"OK")?;
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Packet decode
// ----------------------------------------------------------------------

/// Decode a fully-expanded payload. Unparseable fields of a recognized
/// command become `Malformed`; unknown commands become `Unknown`.
pub fn packet_to_command(raw_pkt: &[u8]) -> GdbCommand {
    match parse_command(raw_pkt) {
        Ok(cmd) => cmd,
        Err(_) => GdbCommand::Malformed(String::from_utf8_lossy(raw_pkt).into_owned()),
    }
}

fn parse_command(raw_pkt: &[u8]) -> Result<GdbCommand, GdbServerError> {
    use GdbCommand::*;

    if raw_pkt.is_empty() {
        return Ok(Unknown(String::new()));
    }
    let pkt = String::from_utf8_lossy(raw_pkt).to_string();

    match raw_pkt[0] {
        b'!' => Ok(ExtendedMode),
        b'?' => Ok(LastSignal),
        b'A' => Ok(SetProgramArgs),
        b'b' | b'B' | b'd' | b'i' | b'I' | b't' => Ok(Deprecated(raw_pkt[0] as char)),

        b'c' => Ok(Continue(parse_optional_addr(&pkt[1..])?)),
        b'C' => {
            let (sig, addr) = parse_signal_and_addr(&pkt[1..])?;
            Ok(ContinueSignal(sig, addr))
        }
        b's' => Ok(Step(parse_optional_addr(&pkt[1..])?)),
        b'S' => {
            let (sig, addr) = parse_signal_and_addr(&pkt[1..])?;
            Ok(StepSignal(sig, addr))
        }

        b'D' => Ok(Detach),
        b'k' => Ok(Kill),

        b'F' => parse_fileio_reply(&pkt[1..]),

        b'g' => Ok(ReadAllRegs),
        b'G' => {
            let hex = &pkt[1..];
            if hex.len() % 8 != 0 {
                return Err(GdbServerError::ProtocolError);
            }
            let mut values = Vec::with_capacity(hex.len() / 8);
            for i in (0..hex.len()).step_by(8) {
                values.push(hex_to_reg(&hex[i..i + 8]).ok_or(GdbServerError::ProtocolError)?);
            }
            Ok(WriteAllRegs(values))
        }

        b'H' => {
            if raw_pkt.len() < 3 {
                return Err(GdbServerError::ProtocolError);
            }
            let op = raw_pkt[1] as char;
            Ok(SetThread(op, parse_thread_id(&pkt[2..])?))
        }

        b'm' => {
            let fields: Vec<&str> = pkt[1..].split(',').collect();
            if fields.len() != 2 {
                return Err(GdbServerError::ProtocolError);
            }
            Ok(ReadMem(parse_u32(fields[0])?, parse_u32(fields[1])?))
        }

        b'M' => {
            let colon = pkt.find(':').ok_or(GdbServerError::ProtocolError)?;
            let fields: Vec<&str> = pkt[1..colon].split(',').collect();
            if fields.len() != 2 {
                return Err(GdbServerError::ProtocolError);
            }
            let addr = parse_u32(fields[0])?;
            let len = parse_u32(fields[1])?;
            let data = hex_to_bytes(&pkt[colon + 1..]).ok_or(GdbServerError::ProtocolError)?;
            Ok(WriteMem(addr, len, data))
        }

        b'X' => {
            // The data part is binary; work on raw bytes.
            let colon = raw_pkt
                .iter()
                .position(|&c| c == b':')
                .ok_or(GdbServerError::ProtocolError)?;
            let desc = std::str::from_utf8(&raw_pkt[1..colon])
                .map_err(|_| GdbServerError::ProtocolError)?;
            let fields: Vec<&str> = desc.split(',').collect();
            if fields.len() != 2 {
                return Err(GdbServerError::ProtocolError);
            }
            Ok(WriteMemBin(
                parse_u32(fields[0])?,
                parse_u32(fields[1])?,
                raw_pkt[colon + 1..].to_vec(),
            ))
        }

        b'p' => Ok(ReadReg(parse_u32(&pkt[1..])?)),
        b'P' => {
            let fields: Vec<&str> = pkt[1..].split('=').collect();
            if fields.len() != 2 {
                return Err(GdbServerError::ProtocolError);
            }
            Ok(WriteReg(
                parse_u32(fields[0])?,
                hex_to_reg(fields[1]).ok_or(GdbServerError::ProtocolError)?,
            ))
        }

        b'q' => Ok(parse_query(&pkt)),
        b'Q' => Ok(parse_set(&pkt)),

        b'r' | b'R' => Ok(Restart),

        b'T' => Ok(IsThreadAlive(parse_u32(&pkt[1..]).unwrap_or(THREAD_ID))),

        b'v' => Ok(parse_v(&pkt)),

        b'z' => parse_matchpoint(&pkt[1..]).map(|(k, a, l)| RemoveMatchpoint(k, a, l)),
        b'Z' => parse_matchpoint(&pkt[1..]).map(|(k, a, l)| InsertMatchpoint(k, a, l)),

        _ => Ok(Unknown(pkt)),
    }
}

fn parse_optional_addr(rest: &str) -> Result<Option<u32>, GdbServerError> {
    if rest.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parse_u32(rest)?))
    }
}

fn parse_signal_and_addr(rest: &str) -> Result<(u8, Option<u32>), GdbServerError> {
    let mut parts = rest.splitn(2, ';');
    let sig = parse_u32(parts.next().ok_or(GdbServerError::ProtocolError)?)? as u8;
    let addr = match parts.next() {
        Some(a) => Some(parse_u32(a)?),
        None => None,
    };
    Ok((sig, addr))
}

fn parse_fileio_reply(rest: &str) -> Result<GdbCommand, GdbServerError> {
    let mut parts = rest.split(',');
    let result = parse_fileio_int(parts.next().ok_or(GdbServerError::ProtocolError)?)?;
    let errno = match parts.next() {
        Some(e) => Some(parse_fileio_int(e)?),
        None => None,
    };
    let ctrl_c = parts.next() == Some("C");
    Ok(GdbCommand::FileIoReply(result, errno, ctrl_c))
}

fn parse_matchpoint(rest: &str) -> Result<(MpKind, u32, u32), GdbServerError> {
    let fields: Vec<&str> = rest.split(',').collect();
    if fields.len() != 3 {
        return Err(GdbServerError::ProtocolError);
    }
    let kind = MpKind::from_str(fields[0]).ok_or(GdbServerError::ProtocolError)?;
    Ok((kind, parse_u32(fields[1])?, parse_u32(fields[2])?))
}

fn parse_query(pkt: &str) -> GdbCommand {
    use GdbCommand::*;

    if pkt == "qC" {
        QueryCurrentThread
    } else if pkt.starts_with("qCRC") {
        QueryCrc
    } else if pkt == "qfThreadInfo" {
        QueryThreadInfoFirst
    } else if pkt == "qsThreadInfo" {
        QueryThreadInfoNext
    } else if pkt.starts_with("qGetTLSAddr:") {
        QueryGetTlsAddr
    } else if pkt.starts_with("qL") {
        QueryL
    } else if pkt == "qOffsets" {
        QueryOffsets
    } else if pkt.starts_with("qP") {
        QueryP
    } else if pkt.starts_with("qRcmd,") {
        match hex_to_bytes(pkt.trim_start_matches("qRcmd,")) {
            Some(decoded) => MonitorCommand(String::from_utf8_lossy(&decoded).into_owned()),
            None => Malformed(pkt.to_owned()),
        }
    } else if pkt.starts_with("qSupported") {
        QuerySupported(pkt.to_owned())
    } else if pkt.starts_with("qSymbol:") {
        QuerySymbol
    } else if pkt.starts_with("qThreadExtraInfo") {
        QueryThreadExtraInfo
    } else if pkt.starts_with("qXfer:") {
        parse_xfer(pkt)
    } else if pkt.starts_with("qTStatus") {
        QueryTraceStatus
    } else if pkt.starts_with("qAttached") {
        QueryAttached
    } else {
        QueryUnknown(pkt.to_owned())
    }
}

/// `qXfer:<object>:read:<annex>:<offset>,<length>`; only osdata reads are
/// recognized.
fn parse_xfer(pkt: &str) -> GdbCommand {
    let tokens: Vec<&str> = pkt.split(':').collect();
    if tokens.len() != 5 || tokens[1] != "osdata" || tokens[2] != "read" {
        return GdbCommand::XferUnsupported;
    }
    let offsets: Vec<&str> = tokens[4].split(',').collect();
    if offsets.len() != 2 {
        return GdbCommand::XferUnsupported;
    }
    match (parse_u32(offsets[0]), parse_u32(offsets[1])) {
        (Ok(offset), Ok(length)) => {
            GdbCommand::OsDataRead(tokens[3].to_owned(), offset, length)
        }
        _ => GdbCommand::Malformed(pkt.to_owned()),
    }
}

fn parse_set(pkt: &str) -> GdbCommand {
    use GdbCommand::*;

    if pkt.starts_with("QPassSignals:") {
        PassSignals
    } else if pkt == "QTStart" {
        TraceStart
    } else if pkt == "QTStop" {
        TraceStop
    } else if pkt == "QTinit" {
        TraceInit
    } else if pkt.starts_with("QTDP") || pkt.starts_with("QFrame") || pkt.starts_with("QTro") {
        TraceStub(pkt.to_owned())
    } else {
        SetUnknown(pkt.to_owned())
    }
}

fn parse_v(pkt: &str) -> GdbCommand {
    use GdbCommand::*;

    if pkt.starts_with("vAttach;") {
        VAttach
    } else if pkt == "vCont?" {
        VContQuery
    } else if pkt.starts_with("vCont") {
        VCont(pkt.to_owned())
    } else if pkt.starts_with("vFile:") {
        VFile
    } else if pkt.starts_with("vFlashErase:")
        || pkt.starts_with("vFlashWrite:")
        || pkt == "vFlashDone"
    {
        VFlash(pkt.to_owned())
    } else if pkt.starts_with("vRun") {
        if pkt.len() > "vRun;".len() {
            warn!("unexpected arguments to vRun: ignored");
        }
        VRun
    } else if pkt == "vMustReplyEmpty" {
        MustReplyEmpty
    } else {
        VUnknown(pkt.to_owned())
    }
}

// ----------------------------------------------------------------------
// osdata documents
// ----------------------------------------------------------------------

const OSDATA_HEADER: &str = "<?xml version=\"1.0\"?>\n\
                             <!DOCTYPE target SYSTEM \"osdata.dtd\">\n";

fn osdata_processes(mesh: &Mesh) -> String {
    let cores = mesh
        .list_cores()
        .iter()
        .map(|c| format!("{}", c))
        .collect::<Vec<String>>()
        .join(", ");

    format!(
        "{}<osdata type=\"processes\">\n\
         \x20 <item>\n\
         \x20   <column name=\"pid\">1</column>\n\
         \x20   <column name=\"user\">root</column>\n\
         \x20   <column name=\"command\"></column>\n\
         \x20   <column name=\"cores\">\n\
         \x20     {}\n\
         \x20   </column>\n\
         \x20 </item>\n\
         \x20 </osdata>",
        OSDATA_HEADER, cores
    )
}

fn osdata_load(mesh: &Mesh) -> String {
    let mut reply = format!("{}<osdata type=\"load\">\n", OSDATA_HEADER);
    for core in mesh.list_cores() {
        reply.push_str(&format!(
            "  <item>\n\
             \x20   <column name=\"coreid\">{:08}</column>\n\
             \x20   <column name=\"load\">{:02}</column>\n\
             \x20 </item>\n",
            core,
            rand::random::<u32>() % 100
        ));
    }
    reply.push_str("</osdata>");
    reply
}

fn osdata_traffic(mesh: &Mesh) -> String {
    let max_row = mesh.platform().num_rows().saturating_sub(1);
    let max_col = mesh.platform().num_cols().saturating_sub(1);

    // Sample or "--" at a mesh edge; empty columns confuse the client.
    let sample = |open: bool| -> String {
        if open {
            format!("{:02}", rand::random::<u32>() % 100)
        } else {
            "--".to_string()
        }
    };

    let mut reply = format!("{}<osdata type=\"traffic\">\n", OSDATA_HEADER);
    for core in mesh.list_cores() {
        let row = u32::from((core >> 6) & 0x3f);
        let col = u32::from(core & 0x3f);

        reply.push_str(&format!(
            "  <item>\n    <column name=\"coreid\">{:08}</column>\n",
            core
        ));
        for (name, open) in &[
            ("North", row > 0),
            ("South", row < max_row),
            ("East", col < max_col),
            ("West", col > 0),
        ] {
            reply.push_str(&format!(
                "    <column name=\"{} In\">{}</column>\n\
                 \x20   <column name=\"{} Out\">{}</column>\n",
                name,
                sample(*open),
                name,
                sample(*open)
            ));
        }
        reply.push_str("  </item>\n");
    }
    reply.push_str("</osdata>");
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epiphany::EpiphanyCpu;
    use epiphany_hal::drivers::SimDriver;
    use epiphany_hal::platform::Platform;
    use epiphany_hal::regs;
    use std::net::TcpListener;

    #[test]
    fn expansion_undoes_escapes() {
        assert_eq!(expand_packet(b"ab}\x03c"), b"ab#c".to_vec());
        assert_eq!(expand_packet(b"}\x04"), b"$".to_vec());
        assert_eq!(expand_packet(b"}]"), b"}".to_vec());
    }

    #[test]
    fn expansion_undoes_run_length() {
        // '!' is 33: the preceding byte repeats five more times.
        assert_eq!(expand_packet(b"x*!"), b"xxxxxx".to_vec());
        assert_eq!(expand_packet(b"ab*\x1dc"), b"abbc".to_vec());
    }

    #[test]
    fn frame_then_expand_is_identity() {
        let payloads: &[&[u8]] = &[
            b"OK",
            b"S05",
            b"m1234,20",
            b"binary $ # } * data",
            &[0u8, 1, 2, 0x03, 0x7d, 0x24],
        ];
        for payload in payloads {
            let frame = frame_packet(payload);
            assert_eq!(frame[0], b'$');
            let hash = frame.len() - 3;
            assert_eq!(frame[hash], b'#');

            // The checksum covers the escaped bytes.
            let escaped = &frame[1..hash];
            let sum = escaped
                .iter()
                .fold(0u8, |acc, &b| acc.wrapping_add(b));
            assert_eq!(
                std::str::from_utf8(&frame[hash + 1..]).unwrap(),
                format!("{:02x}", sum)
            );

            assert_eq!(&expand_packet(escaped)[..], *payload);
        }
    }

    #[test]
    fn register_hex_is_little_endian() {
        assert_eq!(reg_to_hex(0x1234_5678), "78563412");
        assert_eq!(hex_to_reg("78563412"), Some(0x1234_5678));
        assert_eq!(hex_to_reg("785634"), None);
    }

    #[test]
    fn commands_parse() {
        use GdbCommand::*;

        assert_eq!(packet_to_command(b"?"), LastSignal);
        assert_eq!(packet_to_command(b"g"), ReadAllRegs);
        assert_eq!(packet_to_command(b"p42"), ReadReg(0x42));
        assert_eq!(
            packet_to_command(b"P1a=78563412"),
            WriteReg(0x1a, 0x1234_5678)
        );
        assert_eq!(packet_to_command(b"m100,20"), ReadMem(0x100, 0x20));
        assert_eq!(
            packet_to_command(b"M100,2:abcd"),
            WriteMem(0x100, 2, vec![0xab, 0xcd])
        );
        assert_eq!(
            packet_to_command(b"X100,3:\x01\x02\x03"),
            WriteMemBin(0x100, 3, vec![1, 2, 3])
        );
        assert_eq!(packet_to_command(b"c"), Continue(None));
        assert_eq!(packet_to_command(b"c2000"), Continue(Some(0x2000)));
        assert_eq!(packet_to_command(b"C05;2000"), ContinueSignal(5, Some(0x2000)));
        assert_eq!(packet_to_command(b"s"), Step(None));
        assert_eq!(packet_to_command(b"Hg0"), SetThread('g', 0));
        assert_eq!(packet_to_command(b"Hc-1"), SetThread('c', -1));
        assert_eq!(
            packet_to_command(b"Z0,100,2"),
            InsertMatchpoint(MpKind::Memory, 0x100, 2)
        );
        assert_eq!(
            packet_to_command(b"z1,100,2"),
            RemoveMatchpoint(MpKind::Hardware, 0x100, 2)
        );
        assert_eq!(packet_to_command(b"F5"), FileIoReply(5, None, false));
        assert_eq!(
            packet_to_command(b"F-1,4"),
            FileIoReply(-1, Some(4), false)
        );
        assert_eq!(
            packet_to_command(b"F0,0,C"),
            FileIoReply(0, Some(0), true)
        );
        assert_eq!(packet_to_command(b"D"), Detach);
        assert_eq!(packet_to_command(b"k"), Kill);
        assert_eq!(packet_to_command(b"T1"), IsThreadAlive(1));
        assert_eq!(packet_to_command(b"R00"), Restart);
        assert_eq!(packet_to_command(b"!"), ExtendedMode);
        assert_eq!(packet_to_command(b"vMustReplyEmpty"), MustReplyEmpty);
        assert_eq!(packet_to_command(b"vCont?"), VContQuery);
        assert_eq!(packet_to_command(b"qC"), QueryCurrentThread);
        assert_eq!(packet_to_command(b"qfThreadInfo"), QueryThreadInfoFirst);
        assert_eq!(packet_to_command(b"qOffsets"), QueryOffsets);
        assert_eq!(
            packet_to_command(b"qRcmd,68616c74"),
            MonitorCommand("halt".to_string())
        );
        assert_eq!(
            packet_to_command(b"qXfer:osdata:read:process:0,20"),
            OsDataRead("process".to_string(), 0, 0x20)
        );
        assert_eq!(
            packet_to_command(b"qXfer:features:read:target.xml:0,1000"),
            XferUnsupported
        );
        assert_eq!(packet_to_command(b"QTStart"), TraceStart);
        assert_eq!(
            packet_to_command(b"QTDP:1:0:0"),
            TraceStub("QTDP:1:0:0".to_string())
        );
        assert_eq!(packet_to_command(b"@bogus"), Unknown("@bogus".to_string()));
        assert!(matches!(packet_to_command(b"mzz,2"), Malformed(_)));
    }

    #[test]
    fn paging_splits_at_the_requested_length() {
        let data = b"0123456789".to_vec();
        assert_eq!(page_of(&data, 0, 4), b"m0123".to_vec());
        assert_eq!(page_of(&data, 4, 4), b"m4567".to_vec());
        assert_eq!(page_of(&data, 8, 4), b"l89".to_vec());
        assert_eq!(page_of(&data, 0, 10), b"l0123456789".to_vec());
        assert_eq!(page_of(&data, 10, 4), b"l".to_vec());
        assert_eq!(page_of(&data, 20, 4), b"l".to_vec());
    }

    #[test]
    fn printf_records_render() {
        assert_eq!(printf_wrapper("plain text\n", &[]), "plain text\n");
        assert_eq!(
            printf_wrapper("value %d!\n", &42u32.to_le_bytes()),
            "value 42!\n"
        );
        assert_eq!(
            printf_wrapper("%x", &0xbeefu32.to_le_bytes()),
            "beef"
        );
        let mut args = b"mesh\0".to_vec();
        args.extend_from_slice(&7u32.to_le_bytes());
        assert_eq!(
            printf_wrapper("%s core %d\n", &args),
            "mesh core 7\n"
        );
        assert_eq!(printf_wrapper("100%%\n", &[]), "100%\n");
    }

    fn wire_pair() -> (GdbServer, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        (GdbServer::new(server_side, None), client)
    }

    fn client_send(client: &mut TcpStream, payload: &[u8]) {
        client.write_all(&frame_packet(payload)).unwrap();
    }

    /// Read the `+` ack and the following reply frame, returning the
    /// payload.
    fn client_recv(client: &mut TcpStream) -> Vec<u8> {
        let mut one = [0u8; 1];
        loop {
            client.read_exact(&mut one).unwrap();
            if one[0] == b'$' {
                break;
            }
            assert!(one[0] == b'+', "unexpected byte 0x{:02x}", one[0]);
        }
        let mut payload = Vec::new();
        loop {
            client.read_exact(&mut one).unwrap();
            if one[0] == b'#' {
                break;
            }
            payload.push(one[0]);
        }
        let mut cksum = [0u8; 2];
        client.read_exact(&mut cksum).unwrap();
        expand_packet(&payload)
    }

    fn test_target() -> (SimDriver, Mesh, EpiphanyCpu) {
        let sim = SimDriver::new();
        let mesh = Mesh::new(Box::new(sim.clone()), Platform::single_chip());
        mesh.write_word(regs::CORE_DEBUGSTATUS, regs::DEBUGSTATUS_HALT)
            .unwrap();
        mesh.write_word(regs::CORE_STATUS, regs::STATUS_ACTIVE | regs::STATUS_GID)
            .unwrap();
        (sim, mesh, EpiphanyCpu::new())
    }

    #[test]
    fn breakpoint_round_trip_over_the_wire() {
        let (mut gdb, mut client) = wire_pair();
        let (_sim, mesh, cpu) = test_target();
        mesh.write_u16(0x100, 0x1234).unwrap();

        client_send(&mut client, b"Z0,100,2");
        let cmd = gdb.get_command().unwrap();
        gdb.process(cmd, &cpu, &mesh).unwrap();
        assert_eq!(client_recv(&mut client), b"OK".to_vec());
        assert_eq!(mesh.read_u16(0x100).unwrap(), isa::BKPT_INSTR);

        client_send(&mut client, b"z0,100,2");
        let cmd = gdb.get_command().unwrap();
        gdb.process(cmd, &cpu, &mesh).unwrap();
        assert_eq!(client_recv(&mut client), b"OK".to_vec());
        assert_eq!(mesh.read_u16(0x100).unwrap(), 0x1234);
    }

    #[test]
    fn register_write_read_round_trip_over_the_wire() {
        let (mut gdb, mut client) = wire_pair();
        let (_sim, mesh, cpu) = test_target();

        client_send(&mut client, b"P07=78563412");
        let cmd = gdb.get_command().unwrap();
        gdb.process(cmd, &cpu, &mesh).unwrap();
        assert_eq!(client_recv(&mut client), b"OK".to_vec());

        client_send(&mut client, b"p07");
        let cmd = gdb.get_command().unwrap();
        gdb.process(cmd, &cpu, &mesh).unwrap();
        assert_eq!(client_recv(&mut client), b"78563412".to_vec());
    }

    #[test]
    fn memory_reads_truncate_to_the_packet_size() {
        let (mut gdb, mut client) = wire_pair();
        let (_sim, mesh, cpu) = test_target();

        client_send(&mut client, b"m0,4000");
        let cmd = gdb.get_command().unwrap();
        gdb.process(cmd, &cpu, &mesh).unwrap();
        let reply = client_recv(&mut client);
        assert_eq!(reply.len(), ((RSP_PKT_MAX - 1) / 2) * 2);
    }

    #[test]
    fn unsupported_matchpoints_reply_empty() {
        let (mut gdb, mut client) = wire_pair();
        let (_sim, mesh, cpu) = test_target();

        client_send(&mut client, b"Z2,100,4");
        let cmd = gdb.get_command().unwrap();
        gdb.process(cmd, &cpu, &mesh).unwrap();
        assert_eq!(client_recv(&mut client), Vec::<u8>::new());
    }

    #[test]
    fn qsupported_advertises_the_packet_size() {
        let (mut gdb, mut client) = wire_pair();
        let (_sim, mesh, cpu) = test_target();

        client_send(&mut client, b"qSupported:multiprocess+");
        let cmd = gdb.get_command().unwrap();
        gdb.process(cmd, &cpu, &mesh).unwrap();
        let reply = String::from_utf8(client_recv(&mut client)).unwrap();
        assert_eq!(
            reply,
            format!("PacketSize={:x};qXfer:osdata:read+", RSP_PKT_MAX)
        );
    }

    #[test]
    fn osdata_process_paginates() {
        let (mut gdb, mut client) = wire_pair();
        let (_sim, mesh, cpu) = test_target();

        client_send(&mut client, b"qXfer:osdata:read:process:0,20");
        let cmd = gdb.get_command().unwrap();
        gdb.process(cmd, &cpu, &mesh).unwrap();
        let first = client_recv(&mut client);
        assert_eq!(first[0], b'm');
        assert_eq!(first.len(), 0x21);

        client_send(&mut client, b"qXfer:osdata:read:process:20,10000");
        let cmd = gdb.get_command().unwrap();
        gdb.process(cmd, &cpu, &mesh).unwrap();
        let rest = client_recv(&mut client);
        assert_eq!(rest[0], b'l');

        let mut document = first[1..].to_vec();
        document.extend_from_slice(&rest[1..]);
        let document = String::from_utf8(document).unwrap();
        assert!(document.contains("<osdata type=\"processes\">"));
        assert!(document.contains("<column name=\"user\">root</column>"));
    }

    #[test]
    fn fileio_reply_writes_result_and_errno() {
        let (mut gdb, mut client) = wire_pair();
        let (sim, mesh, cpu) = test_target();

        // The reply resumes the target; give the sim a scripted halt so a
        // later poll would find it stopped again.
        sim.push_halt(0x0);

        client_send(&mut client, b"F-1,4");
        let cmd = gdb.get_command().unwrap();
        gdb.process(cmd, &cpu, &mesh).unwrap();

        assert_eq!(cpu.read_gpr(&mesh, 0).unwrap(), 0xffff_ffff);
        assert_eq!(cpu.read_gpr(&mesh, 3).unwrap(), 4);
        assert!(gdb.is_target_running());
    }

    #[test]
    fn semihosted_write_emits_a_fileio_request() {
        let (mut gdb, mut client) = wire_pair();
        let (_sim, mesh, cpu) = test_target();

        // TRAP 0 at the PC with write(1, 0x3000, 5).
        mesh.write_word(regs::CORE_PC, 0x500).unwrap();
        mesh.write_u16(0x500, isa::TRAP_INSTR).unwrap();
        cpu.write_gpr(&mesh, 0, 1).unwrap();
        cpu.write_gpr(&mesh, 1, 0x3000).unwrap();
        cpu.write_gpr(&mesh, 2, 5).unwrap();

        client_send(&mut client, b"s");
        let cmd = gdb.get_command().unwrap();
        gdb.process(cmd, &cpu, &mesh).unwrap();

        assert_eq!(client_recv(&mut client), b"Fwrite,1,3000,5".to_vec());
        assert!(!gdb.is_target_running());
    }

    #[test]
    fn detach_closes_the_connection() {
        let (mut gdb, mut client) = wire_pair();
        let (_sim, mesh, cpu) = test_target();

        client_send(&mut client, b"D");
        let cmd = gdb.get_command().unwrap();
        gdb.process(cmd, &cpu, &mesh).unwrap();
        assert_eq!(client_recv(&mut client), b"OK".to_vec());

        // The next read on the server side reports the close.
        assert!(matches!(
            gdb.get_command(),
            Err(GdbServerError::ConnectionClosed) | Err(GdbServerError::IoError(_))
        ));
    }
}
