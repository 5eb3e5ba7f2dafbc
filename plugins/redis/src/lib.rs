//! Input plugin gathering `INFO` statistics from redis servers.
//!
//! Polls every configured server concurrently (one worker per server) and
//! publishes one `redis` metric per server, plus one `redis_keyspace` metric
//! per database. Servers are dialed at every pass: the protocol is a single
//! request/reply exchange, holding connections open buys nothing.

use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::Deserialize;

use rackmon::accumulator::Accumulator;
use rackmon::gather::gather_targets;
use rackmon::metric::{FieldValue, Fields, Tags};
use rackmon::plugin::Input;

/// Dial and I/O timeout, per server.
const TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_SERVER: &str = "tcp://localhost:6379";

/// INFO keys reported under a different field name.
fn rename(name: &str) -> &str {
    match name {
        "uptime_in_seconds" => "uptime",
        "connected_clients" => "clients",
        other => other,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Addresses of the servers to poll: `tcp://[:password@]host[:port]` or
    /// `unix://[:password@]/path/to/socket`. A bare `host:port` is accepted.
    /// When empty, one local server on the default port is assumed.
    pub servers: Vec<String>,
}

pub struct RedisInput {
    config: Config,
}

impl RedisInput {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn gather_server(&self, target: &Target, acc: &Accumulator) -> anyhow::Result<()> {
        let conn = target
            .connect()
            .with_context(|| format!("unable to connect to redis server '{target}'"))?;
        let mut reader = BufReader::new(conn);

        if let Some(password) = &target.password {
            write!(reader.get_mut(), "AUTH {password}\r\n")?;
            let mut reply = String::new();
            reader.read_line(&mut reply)?;
            if reply.starts_with('-') {
                anyhow::bail!("authentication to '{target}' failed: {}", reply.trim_end());
            }
        }

        write!(reader.get_mut(), "INFO\r\n")?;
        let payload = read_bulk_reply(&mut reader).with_context(|| format!("bad INFO reply from '{target}'"))?;

        gather_info(&payload, acc, target.tags());
        Ok(())
    }
}

impl Input for RedisInput {
    fn description(&self) -> &'static str {
        "reads server statistics from one or more redis servers"
    }

    fn gather(&mut self, acc: &Accumulator) -> anyhow::Result<()> {
        let default = [DEFAULT_SERVER.to_owned()];
        let servers: &[String] = if self.config.servers.is_empty() {
            &default
        } else {
            &self.config.servers
        };
        // A malformed address is a configuration mistake: fail the whole
        // pass before dialing anything.
        let targets = servers
            .iter()
            .map(|s| parse_server(s))
            .collect::<anyhow::Result<Vec<Target>>>()?;

        gather_targets(&targets, |target| self.gather_server(target, acc))?;
        Ok(())
    }
}

/// One resolved server address.
#[derive(Debug, Clone, PartialEq)]
struct Target {
    addr: Addr,
    password: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Addr {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix(String),
}

impl Target {
    fn connect(&self) -> anyhow::Result<Connection> {
        match &self.addr {
            Addr::Tcp { host, port } => {
                let sock = (host.as_str(), *port)
                    .to_socket_addrs()?
                    .next()
                    .with_context(|| format!("cannot resolve {host}:{port}"))?;
                let stream = TcpStream::connect_timeout(&sock, TIMEOUT)?;
                stream.set_read_timeout(Some(TIMEOUT))?;
                stream.set_write_timeout(Some(TIMEOUT))?;
                Ok(Connection::Tcp(stream))
            }
            #[cfg(unix)]
            Addr::Unix(path) => {
                let stream = UnixStream::connect(path)?;
                stream.set_read_timeout(Some(TIMEOUT))?;
                stream.set_write_timeout(Some(TIMEOUT))?;
                Ok(Connection::Unix(stream))
            }
        }
    }

    fn tags(&self) -> Tags {
        match &self.addr {
            Addr::Tcp { host, port } => rackmon::tags! { "server" => host.as_str(), "port" => port.to_string() },
            #[cfg(unix)]
            Addr::Unix(path) => rackmon::tags! { "socket" => path.as_str() },
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            Addr::Tcp { host, port } => write!(f, "{host}:{port}"),
            #[cfg(unix)]
            Addr::Unix(path) => f.write_str(path),
        }
    }
}

enum Connection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Connection::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Connection::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Connection::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Connection::Unix(s) => s.flush(),
        }
    }
}

/// Parses one configured server address.
fn parse_server(server: &str) -> anyhow::Result<Target> {
    let (scheme, rest) = match server.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("tcp", server),
    };

    // `:password@` before the address, like in a URL.
    let (password, rest) = match rest.split_once('@') {
        Some((creds, rest)) => {
            let password = creds.strip_prefix(':').unwrap_or(creds);
            (Some(password.to_owned()), rest)
        }
        None => (None, rest),
    };

    let addr = match scheme {
        "tcp" => {
            let (host, port) = match rest.rsplit_once(':') {
                Some((host, port)) => {
                    let port: u16 = port
                        .parse()
                        .with_context(|| format!("invalid port in redis address '{server}'"))?;
                    (host, port)
                }
                None => (rest, 6379),
            };
            anyhow::ensure!(!host.is_empty(), "missing host in redis address '{server}'");
            Addr::Tcp {
                host: host.to_owned(),
                port,
            }
        }
        #[cfg(unix)]
        "unix" => Addr::Unix(rest.to_owned()),
        other => anyhow::bail!("unsupported scheme '{other}' in redis address '{server}'"),
    };
    Ok(Target { addr, password })
}

/// Reads one RESP bulk-string reply (`$<len>\r\n<payload>\r\n`).
fn read_bulk_reply(reader: &mut impl BufRead) -> anyhow::Result<String> {
    let mut header = String::new();
    reader.read_line(&mut header)?;
    let header = header.trim_end();
    match header.as_bytes().first() {
        Some(b'$') => {
            let len: usize = header[1..].parse().context("invalid bulk reply length")?;
            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload)?;
            Ok(String::from_utf8_lossy(&payload).into_owned())
        }
        Some(b'-') => anyhow::bail!("server replied with an error: {}", &header[1..]),
        _ => anyhow::bail!("unexpected reply: {header:?}"),
    }
}

/// Parses one INFO payload and publishes the `redis` metric (and one
/// `redis_keyspace` metric per database).
fn gather_info(payload: &str, acc: &Accumulator, mut tags: Tags) {
    let mut fields = Fields::new();
    let mut section = "";
    let mut keyspace_hits: u64 = 0;
    let mut keyspace_misses: u64 = 0;

    for line in payload.lines() {
        let line = line.trim_end();
        if let Some(header) = line.strip_prefix('#') {
            section = header.trim();
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        // The Server section is mostly build metadata.
        if section == "Server" && name != "lru_clock" && name != "uptime_in_seconds" {
            continue;
        }
        if name.ends_with("_human") || name == "mem_allocator" {
            continue;
        }
        if section == "Keyspace" {
            if value.contains("keys=") {
                gather_keyspace_line(name, value, acc, &tags);
            }
            continue;
        }

        if let Ok(uint) = value.parse::<u64>() {
            match name {
                "keyspace_hits" => keyspace_hits = uint,
                "keyspace_misses" => keyspace_misses = uint,
                "rdb_last_save_time" => {
                    let now = unix_seconds();
                    fields.insert(
                        "rdb_last_save_time_elapsed".to_owned(),
                        FieldValue::UInt(now.saturating_sub(uint)),
                    );
                }
                _ => {}
            }
            fields.insert(rename(name).to_owned(), FieldValue::UInt(uint));
        } else if let Ok(int) = value.parse::<i64>() {
            fields.insert(rename(name).to_owned(), FieldValue::Int(int));
        } else if let Ok(float) = value.parse::<f64>() {
            fields.insert(rename(name).to_owned(), FieldValue::Float(float));
        } else if name == "role" {
            tags.insert("replication_role".to_owned(), value.to_owned());
        } else {
            fields.insert(rename(name).to_owned(), FieldValue::Str(value.to_owned()));
        }
    }

    let total = keyspace_hits + keyspace_misses;
    let hitrate = if total > 0 {
        keyspace_hits as f64 / total as f64
    } else {
        0.0
    };
    fields.insert("keyspace_hitrate".to_owned(), FieldValue::Float(hitrate));

    acc.add_fields("redis", fields, tags, None);
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Parses one keyspace line (`db0:keys=2,expires=0,avg_ttl=0`).
fn gather_keyspace_line(database: &str, line: &str, acc: &Accumulator, tags: &Tags) {
    let mut fields = Fields::new();
    for pair in line.split(',') {
        if let Some((key, value)) = pair.split_once('=')
            && let Ok(uint) = value.parse::<u64>()
        {
            fields.insert(key.to_owned(), FieldValue::UInt(uint));
        }
    }
    let mut tags = tags.clone();
    tags.insert("database".to_owned(), database.to_owned());
    acc.add_fields("redis_keyspace", fields, tags, None);
}
