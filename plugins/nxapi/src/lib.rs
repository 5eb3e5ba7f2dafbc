//! Input plugin polling port counters from a switch management API.
//!
//! Talks JSON-RPC over HTTP (NX-API style): one `cli` call running
//! `show interface` per gather pass, over a client that is built on the
//! first pass and reused afterwards.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use rackmon::accumulator::Accumulator;
use rackmon::metric::Timestamp;
use rackmon::plugin::Input;
use rackmon::{fields, tags};

/// Front-panel ports all share this prefix; it carries no information.
const ETH_PREFIX: &str = "Ethernet1/";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Management address of the switch (host or host:port).
    pub mgmt_address: String,
    pub username: String,
    pub password: String,
    /// Deadline for one whole request/reply exchange.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mgmt_address: String::new(),
            username: String::new(),
            password: String::new(),
            timeout: Duration::from_secs(5),
        }
    }
}

pub struct NxapiInput {
    config: Config,
    endpoint: String,
    client: Option<reqwest::blocking::Client>,
}

impl NxapiInput {
    pub fn new(config: Config) -> Self {
        let endpoint = format!("http://{}/ins", config.mgmt_address);
        Self {
            config,
            endpoint,
            client: None,
        }
    }

    /// Returns the shared client, building it on the first call. Clones are
    /// cheap (the client is reference-counted) and sidestep holding a borrow
    /// of `self` across the request.
    fn connect(&mut self) -> anyhow::Result<reqwest::blocking::Client> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        anyhow::ensure!(
            !self.config.mgmt_address.is_empty(),
            "the nxapi input needs a mgmt_address"
        );
        let client = reqwest::blocking::Client::builder()
            .timeout(self.config.timeout)
            .build()
            .context("cannot build the http client")?;
        self.client = Some(client.clone());
        Ok(client)
    }

    fn exec_cli(&self, client: &reqwest::blocking::Client, cmd: &str) -> anyhow::Result<Value> {
        let request = [RpcRequest {
            jsonrpc: "2.0",
            method: "cli",
            params: RpcParams { cmd, version: 1 },
            id: 1,
        }];
        let reply = client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json-rpc")
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(&request)
            .send()
            .context("request failed")?
            .error_for_status()?;

        // Single-command replies come back as one object, batches as an
        // array; accept both.
        let parsed: OneOrMany = reply.json().context("invalid JSON-RPC reply")?;
        let mut responses = match parsed {
            OneOrMany::One(response) => vec![response],
            OneOrMany::Many(responses) => responses,
        };
        anyhow::ensure!(!responses.is_empty(), "empty JSON-RPC reply");

        let first = responses.swap_remove(0);
        if let Some(error) = first.error {
            anyhow::bail!("switch returned JSON-RPC error {}: {}", error.code, error.message);
        }
        Ok(first.result.map(|r| r.body).unwrap_or(Value::Null))
    }
}

impl Input for NxapiInput {
    fn description(&self) -> &'static str {
        "reads per-port packet counters from a switch management API"
    }

    fn gather(&mut self, acc: &Accumulator) -> anyhow::Result<()> {
        let client = self.connect()?;
        let now = Timestamp::now();
        let body = self
            .exec_cli(&client, "show interface")
            .with_context(|| format!("'show interface' on {} failed", self.config.mgmt_address))?;
        gather_interfaces(&body, acc, now);
        Ok(())
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'static str,
    params: RpcParams<'a>,
    id: u32,
}

#[derive(Serialize)]
struct RpcParams<'a> {
    cmd: &'a str,
    version: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<RpcResponse>),
    One(RpcResponse),
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<RpcResult>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcResult {
    #[serde(default)]
    body: Value,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Publishes one `port_stats` metric per linked front-panel port of a
/// `show interface` reply body.
fn gather_interfaces(body: &Value, acc: &Accumulator, now: Timestamp) {
    for row in normalize_rows(&body["TABLE_interface"]["ROW_interface"]) {
        let Some(name) = row["interface"].as_str() else {
            continue;
        };
        // The management port and unlinked ports are not reported.
        if name == "mgmt0" || row["state"].as_str() != Some("up") {
            continue;
        }
        let port = name.strip_prefix(ETH_PREFIX).unwrap_or(name);
        let role = row["desc"].as_str().map(parse_role).unwrap_or_default();

        let fields = fields! {
            "rx_packets" => counter(&row["eth_inpkts"]),
            "rx_bytes" => counter(&row["eth_inbytes"]),
            "rx_errors" => counter(&row["eth_inerr"]),
            "tx_packets" => counter(&row["eth_outpkts"]),
            "tx_bytes" => counter(&row["eth_outbytes"]),
            "tx_errors" => counter(&row["eth_outerr"]),
        };
        acc.add_counter("port_stats", fields, tags! { "port" => port, "role" => role }, Some(now));
    }
}

/// One-port replies carry a bare row object where multi-port replies carry
/// an array.
fn normalize_rows(rows: &Value) -> &[Value] {
    match rows {
        Value::Array(rows) => rows,
        Value::Object(_) => std::slice::from_ref(rows),
        _ => &[],
    }
}

/// Counter columns are inconsistently typed: most arrive as JSON numbers
/// but some are quoted. Absent or garbage values count as zero.
fn counter(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse::<i64>().map(|i| i as f64).unwrap_or(0.0),
        _ => 0.0,
    }
}

#[derive(Deserialize)]
struct Desc {
    #[serde(default)]
    role: String,
}

/// The `desc` column is itself a small JSON document, e.g.
/// `{"role":"local","svid":889,"conn_type":"none"}`.
fn parse_role(desc: &str) -> String {
    serde_json::from_str::<Desc>(desc).map(|d| d.role).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use pretty_assertions::assert_eq;
    use rackmon::metric::ValueType;
    use rackmon::test::CapturingAccumulator;
    use serde_json::json;

    use super::*;

    #[test]
    fn counters_accept_numbers_and_quoted_integers() {
        assert_eq!(counter(&json!(79929)), 79929.0);
        assert_eq!(counter(&json!("42")), 42.0);
        assert_eq!(counter(&json!("garbage")), 0.0);
        assert_eq!(counter(&json!(null)), 0.0);
    }

    #[test]
    fn role_comes_from_the_embedded_document() {
        assert_eq!(parse_role(r#"{"role":"local","svid":889}"#), "local");
        assert_eq!(parse_role("not json"), "");
        assert_eq!(parse_role("{}"), "");
    }

    #[test]
    fn single_row_and_array_both_normalize() {
        let one = json!({"interface": "Ethernet1/1"});
        assert_eq!(normalize_rows(&one).len(), 1);
        let many = json!([{"interface": "Ethernet1/1"}, {"interface": "Ethernet1/2"}]);
        assert_eq!(normalize_rows(&many).len(), 2);
        assert_eq!(normalize_rows(&json!(null)).len(), 0);
    }

    #[test]
    fn linked_ports_become_metrics() {
        let body = json!({
            "TABLE_interface": {
                "ROW_interface": [
                    {
                        "interface": "Ethernet1/3",
                        "state": "up",
                        "desc": "{\"role\":\"local\",\"svid\":889,\"conn_type\":\"none\"}",
                        "eth_inpkts": 79929,
                        "eth_inbytes": 5152022,
                        "eth_inerr": "1",
                        "eth_outpkts": 2084,
                        "eth_outbytes": 311569,
                        "eth_outerr": 0,
                    },
                    { "interface": "mgmt0", "state": "up", "eth_inpkts": 1 },
                    { "interface": "Ethernet1/4", "state": "down", "eth_inpkts": 1 },
                ],
            },
        });
        let mut capture = CapturingAccumulator::new();
        gather_interfaces(&body, capture.accumulator(), Timestamp::now());

        capture.assert_contains_tagged_fields(
            "port_stats",
            &fields! {
                "rx_packets" => 79929.0,
                "rx_bytes" => 5152022.0,
                "rx_errors" => 1.0,
                "tx_packets" => 2084.0,
                "tx_bytes" => 311569.0,
                "tx_errors" => 0.0,
            },
            &tags! { "port" => "3", "role" => "local" },
        );
        assert_eq!(capture.n_metrics(), 1);
        assert_eq!(capture.metrics()[0].value_type(), ValueType::Counter);
    }

    #[test]
    fn missing_desc_leaves_the_role_empty() {
        let body = json!({
            "TABLE_interface": {
                "ROW_interface": { "interface": "Ethernet1/7", "state": "up", "eth_inpkts": 5 },
            },
        });
        let mut capture = CapturingAccumulator::new();
        gather_interfaces(&body, capture.accumulator(), Timestamp::now());

        let metrics = capture.metrics();
        assert_eq!(metrics[0].tags()["port"], "7");
        assert_eq!(metrics[0].tags()["role"], "");
    }

    /// Answers one HTTP request with a canned JSON-RPC reply.
    fn spawn_fake_switch(reply: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            let mut content_length = 0;
            let mut authorized = false;
            loop {
                line.clear();
                reader.read_line(&mut line).unwrap();
                let header = line.trim_end().to_ascii_lowercase();
                if let Some(len) = header.strip_prefix("content-length: ") {
                    content_length = len.parse().unwrap();
                }
                authorized |= header.starts_with("authorization: basic ");
                if line == "\r\n" {
                    break;
                }
            }
            assert!(authorized, "no basic auth header");
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();
            assert!(String::from_utf8_lossy(&body).contains("show interface"));

            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json-rpc\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reply}",
                reply.len()
            );
            reader.get_mut().write_all(response.as_bytes()).unwrap();
        });
        port
    }

    fn input_for(port: u16) -> NxapiInput {
        NxapiInput::new(Config {
            mgmt_address: format!("127.0.0.1:{port}"),
            username: "admin".to_owned(),
            password: "admin123".to_owned(),
            timeout: Duration::from_secs(5),
        })
    }

    #[test]
    fn gathers_from_a_live_endpoint() {
        let port = spawn_fake_switch(
            r#"{"jsonrpc":"2.0","result":{"body":{"TABLE_interface":{"ROW_interface":
                {"interface":"Ethernet1/1","state":"up","eth_inpkts":10,"eth_inbytes":100,
                 "eth_inerr":0,"eth_outpkts":20,"eth_outbytes":200,"eth_outerr":0}}}},"id":1}"#,
        );
        let mut capture = CapturingAccumulator::new();
        let mut input = input_for(port);

        input.gather(capture.accumulator()).unwrap();

        capture.assert_contains_tagged_fields(
            "port_stats",
            &fields! {
                "rx_packets" => 10.0,
                "rx_bytes" => 100.0,
                "rx_errors" => 0.0,
                "tx_packets" => 20.0,
                "tx_bytes" => 200.0,
                "tx_errors" => 0.0,
            },
            &tags! { "port" => "1", "role" => "" },
        );
    }

    #[test]
    fn rpc_errors_fail_the_pass() {
        let port = spawn_fake_switch(
            r#"{"jsonrpc":"2.0","error":{"code":-32602,"message":"Invalid params"},"id":1}"#,
        );
        let mut capture = CapturingAccumulator::new();
        let mut input = input_for(port);

        let err = input.gather(capture.accumulator()).unwrap_err();
        assert!(format!("{err:#}").contains("Invalid params"));
        assert_eq!(capture.n_metrics(), 0);
    }

    #[test]
    fn a_missing_address_is_reported() {
        let mut capture = CapturingAccumulator::new();
        let mut input = NxapiInput::new(Config::default());
        assert!(input.gather(capture.accumulator()).is_err());
    }

    #[test]
    fn config_defaults() {
        let config: Config = toml::from_str(r#"mgmt_address = "10.0.0.5""#).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(5));

        let config: Config = toml::from_str(
            r#"
            mgmt_address = "10.0.0.5"
            username = "admin"
            password = "admin123"
            timeout = "30s"
            "#,
        )
        .unwrap();
        assert_eq!(config.timeout, Duration::from_secs(30));
    }
}
