//! Shared helpers for integration tests.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Timeout for node startup.
pub const IO_TIMEOUT: Duration = Duration::from_secs(20);
/// Timeout for individual RESP read/write operations.
pub const RESP_TIMEOUT: Duration = Duration::from_secs(5);

/// Simple wrapper around a spawned node process and its log paths.
pub struct NodeProcess {
    pub child: Child,
    stderr_path: PathBuf,
    stdout_path: PathBuf,
}

impl NodeProcess {
    /// Best-effort read of the captured stderr log.
    pub fn read_stderr(&self) -> String {
        std::fs::read_to_string(&self.stderr_path).unwrap_or_default()
    }

    /// Panic if the process has already exited.
    pub fn assert_running(&mut self, context: &str) {
        if let Ok(Some(status)) = self.child.try_wait() {
            let stdout = std::fs::read_to_string(&self.stdout_path).unwrap_or_default();
            let stderr = self.read_stderr();
            panic!(
                "keel-store exited early ({context}) with status {status}\nstdout:\n{stdout}\nstderr:\n{stderr}"
            );
        }
    }
}

impl Drop for NodeProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// Spawn a keel-store node for testing and capture its output to log files.
pub fn spawn_node(data_dir: &Path, listen: SocketAddr) -> NodeProcess {
    let bin = keel_store_bin();
    let log_dir = data_dir.join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let stdout_path = log_dir.join("keel-store.out.log");
    let stderr_path = log_dir.join("keel-store.err.log");
    let stdout_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&stdout_path)
        .expect("open stdout log");
    let stderr_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&stderr_path)
        .expect("open stderr log");

    let child = Command::new(bin)
        .arg("node")
        .arg("--listen")
        .arg(listen.to_string())
        .arg("--data-dir")
        .arg(data_dir.to_string_lossy().to_string())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file))
        .spawn()
        .expect("failed to spawn keel-store");

    NodeProcess {
        child,
        stderr_path,
        stdout_path,
    }
}

/// Locate the keel-store binary built by cargo.
pub fn keel_store_bin() -> PathBuf {
    if let Some(bin) = std::env::var_os("CARGO_BIN_EXE_keel-store") {
        return PathBuf::from(bin);
    }
    panic!("keel-store binary not found; run under `cargo test -p keel_store`");
}

/// Wait for the RESP port to answer a PING.
pub fn wait_for_resp_ready(addr: SocketAddr, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if try_ping(addr, Duration::from_millis(250)).unwrap_or(false) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

/// Pick an available local port by binding to port 0.
pub fn pick_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Build a per-test data directory under the temp folder.
pub fn test_dir(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let pid = std::process::id();
    std::env::temp_dir()
        .join("keel-tests")
        .join(format!("{name}-{pid}-{ts}"))
}

/// Best-effort cleanup of a test directory.
pub fn cleanup_dir(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

/// RESP connection wrapper that preserves buffered reads between commands.
pub struct RespConn {
    reader: BufReader<TcpStream>,
}

impl RespConn {
    /// Connect to the RESP port with read/write timeouts.
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect resp");
        stream.set_read_timeout(Some(RESP_TIMEOUT)).ok();
        stream.set_write_timeout(Some(RESP_TIMEOUT)).ok();
        Self {
            reader: BufReader::new(stream),
        }
    }

    /// Send a RESP command with bulk string arguments and return the raw response.
    pub fn send_command(&mut self, parts: &[&str]) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
        for part in parts {
            buf.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
            buf.extend_from_slice(part.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        let stream = self.reader.get_mut();
        stream.write_all(&buf).expect("write resp command");
        stream.flush().ok();

        read_resp(&mut self.reader)
    }
}

/// Parse one complete RESP response into raw bytes.
fn read_resp(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<u8>> {
    let mut first = [0u8; 1];
    read_exact_with_timeout(reader, &mut first)?;
    match first[0] {
        b'+' | b'-' | b':' => {
            // Simple string, error, or integer: read line.
            let mut line = Vec::new();
            read_until_with_timeout(reader, b'\n', &mut line)?;
            let mut out = vec![first[0]];
            out.extend_from_slice(&line);
            Ok(out)
        }
        b'$' => {
            let mut line = Vec::new();
            read_until_with_timeout(reader, b'\n', &mut line)?;
            let len = parse_len(&line);
            let mut out = vec![first[0]];
            out.extend_from_slice(&line);
            if len >= 0 {
                let mut data = vec![0u8; len as usize + 2];
                read_exact_with_timeout(reader, &mut data)?;
                out.extend_from_slice(&data);
            }
            Ok(out)
        }
        b'*' => {
            let mut line = Vec::new();
            read_until_with_timeout(reader, b'\n', &mut line)?;
            let len = parse_len(&line);
            let mut out = vec![first[0]];
            out.extend_from_slice(&line);
            for _ in 0..len.max(0) {
                out.extend_from_slice(&read_resp(reader)?);
            }
            Ok(out)
        }
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected resp prefix {other}"),
        )),
    }
}

fn try_ping(addr: SocketAddr, timeout: Duration) -> std::io::Result<bool> {
    let stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(timeout)).ok();
    stream.set_write_timeout(Some(timeout)).ok();
    let mut reader = BufReader::new(stream);
    let cmd = b"*1\r\n$4\r\nping\r\n";
    reader.get_mut().write_all(cmd)?;
    reader.get_mut().flush().ok();

    let mut line = Vec::new();
    match reader.read_until(b'\n', &mut line) {
        Ok(0) => return Ok(false),
        Ok(_) => {}
        Err(err)
            if err.kind() == std::io::ErrorKind::WouldBlock
                || err.kind() == std::io::ErrorKind::TimedOut =>
        {
            return Ok(false);
        }
        Err(err) => return Err(err),
    }
    let text = String::from_utf8_lossy(&line);
    Ok(text.trim_end() == "+PONG")
}

/// Parse a length line ("<len>\r\n").
fn parse_len(line: &[u8]) -> i64 {
    let text = std::str::from_utf8(line).expect("len utf8");
    text.trim().parse::<i64>().expect("parse resp len")
}

fn read_exact_with_timeout(
    reader: &mut BufReader<TcpStream>,
    buf: &mut [u8],
) -> std::io::Result<()> {
    let start = std::time::Instant::now();
    let mut offset = 0usize;
    while offset < buf.len() {
        match reader.read(&mut buf[offset..]) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed",
                ));
            }
            Ok(n) => {
                offset += n;
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                if start.elapsed() >= RESP_TIMEOUT {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "resp read timed out",
                    ));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn read_until_with_timeout(
    reader: &mut BufReader<TcpStream>,
    byte: u8,
    buf: &mut Vec<u8>,
) -> std::io::Result<usize> {
    let start = std::time::Instant::now();
    loop {
        match reader.read_until(byte, buf) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed",
                ));
            }
            Ok(n) => return Ok(n),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                if start.elapsed() >= RESP_TIMEOUT {
                    return Err(err);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(err) => return Err(err),
        }
    }
}

/// Decode a RESP bulk string response into an Option<String>.
pub fn parse_bulk_string(resp: &[u8]) -> Option<String> {
    if resp.first() != Some(&b'$') {
        return None;
    }
    let mut idx = 1usize;
    let mut len_line = Vec::new();
    while idx < resp.len() {
        let b = resp[idx];
        idx += 1;
        len_line.push(b);
        if b == b'\n' {
            break;
        }
    }
    let len = parse_len(&len_line);
    if len < 0 {
        return None;
    }
    let len = len as usize;
    if idx + len > resp.len() {
        return None;
    }
    Some(String::from_utf8_lossy(&resp[idx..idx + len]).to_string())
}

/// Decode a RESP integer response.
pub fn parse_integer(resp: &[u8]) -> Option<i64> {
    if resp.first() != Some(&b':') {
        return None;
    }
    let text = std::str::from_utf8(&resp[1..]).ok()?;
    text.trim().parse::<i64>().ok()
}

/// Decode a RESP multi-bulk response of bulk strings.
pub fn parse_multi_bulk(resp: &[u8]) -> Option<Vec<String>> {
    if resp.first() != Some(&b'*') {
        return None;
    }
    let mut idx = 1usize;
    let mut len_line = Vec::new();
    while idx < resp.len() {
        let b = resp[idx];
        idx += 1;
        len_line.push(b);
        if b == b'\n' {
            break;
        }
    }
    let count = parse_len(&len_line);
    if count < 0 {
        return None;
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let item = parse_bulk_string(&resp[idx..])?;
        // Advance past "$<len>\r\n<data>\r\n".
        let mut line_end = idx;
        while line_end < resp.len() && resp[line_end] != b'\n' {
            line_end += 1;
        }
        if line_end >= resp.len() {
            return None;
        }
        idx = line_end + 1 + item.len() + 2;
        items.push(item);
    }
    Some(items)
}

/// Write a set of key/value pairs over RESP, asserting each +OK.
pub fn write_keys(conn: &mut RespConn, keys: &[(String, String)]) {
    for (k, v) in keys {
        let resp = conn.send_command(&["set", k, v]).expect("set");
        assert!(
            resp.starts_with(b"+OK"),
            "SET failed: {:?}",
            String::from_utf8_lossy(&resp)
        );
    }
}
