//! Configuration file of the agent.
//!
//! The file is TOML, split into four kinds of sections:
//!
//! ```toml
//! [agent]          # scheduler settings, see [`AgentConfig`]
//! [global_tags]    # tags applied to every metric (lowest precedence)
//! [[inputs.redis]] # one table per input instance, keyed by kind
//! [[outputs.file]] # one table per output instance, keyed by kind
//! ```
//!
//! Inside an input table, the reserved keys (`name_override`, `name_prefix`,
//! `name_suffix`, `tags`, `interval`, `filter`) configure the scope of the
//! instance; every other key belongs to the plugin itself.

use std::io;

use anyhow::Context;

use rackmon::agent::{AgentConfig, ConfiguredInput};
use rackmon::metric::{Metric, Tags};
use rackmon::plugin::{Input, InputScope, Output, deserialize_config};

/// Content written to the configuration file when it does not exist.
pub const DEFAULT_CONFIG: &str = r#"# rackmon agent configuration.

[agent]
# How often to gather from the inputs. Each input can override this with
# its own `interval` key.
interval = "10s"
# How many metrics the collection channel can hold before gathers block.
metric_buffer_limit = 10000

# Tags applied to every metric (lowest precedence).
[global_tags]

[[inputs.redis]]
# One url per server: tcp://[:password@]host[:port] or unix:///path.
servers = ["tcp://localhost:6379"]

[[outputs.file]]
# "stdout", or paths opened in append mode.
files = ["stdout"]
"#;

/// Reserved keys of an input table, consumed by the agent rather than the
/// plugin.
const SCOPE_KEYS: [&str; 6] = ["name_override", "name_prefix", "name_suffix", "tags", "interval", "filter"];

/// The whole parsed configuration.
pub struct Settings {
    pub agent: AgentConfig,
    pub global_tags: Tags,
    pub inputs: Vec<ConfiguredInput>,
    pub outputs: Vec<Box<dyn Output>>,
}

// Not derived: the boxed plugins have no `Debug`.
impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("agent", &self.agent)
            .field("global_tags", &self.global_tags)
            .finish_non_exhaustive()
    }
}

/// Reads and parses the configuration file.
///
/// A missing file is written from [`DEFAULT_CONFIG`] first, unless
/// `default_if_missing` is false (then it is an error).
pub fn load(path: &str, default_if_missing: bool) -> anyhow::Result<Settings> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound && default_if_missing => {
            std::fs::write(path, DEFAULT_CONFIG).with_context(|| format!("cannot write {path}"))?;
            log::info!("No configuration file found, wrote a default one to: {path}");
            DEFAULT_CONFIG.to_owned()
        }
        Err(e) => return Err(e).with_context(|| format!("cannot read {path}")),
    };
    parse(&raw)
}

/// Parses one configuration document.
pub fn parse(raw: &str) -> anyhow::Result<Settings> {
    let raw = substitute_env_variables(raw)?;
    let mut table: toml::Table = raw.parse().context("invalid TOML")?;

    let agent: AgentConfig = match table.remove("agent") {
        Some(value) => value.try_into().context("invalid [agent] section")?,
        None => AgentConfig::default(),
    };
    let global_tags: Tags = match table.remove("global_tags") {
        Some(value) => value.try_into().context("invalid [global_tags] section")?,
        None => Tags::new(),
    };
    let inputs = match table.remove("inputs") {
        Some(toml::Value::Table(kinds)) => build_inputs(kinds)?,
        Some(_) => anyhow::bail!("[inputs] must be a table of input kinds"),
        None => Vec::new(),
    };
    let outputs = match table.remove("outputs") {
        Some(toml::Value::Table(kinds)) => build_outputs(kinds)?,
        Some(_) => anyhow::bail!("[outputs] must be a table of output kinds"),
        None => Vec::new(),
    };
    if let Some((section, _)) = table.into_iter().next() {
        anyhow::bail!("unknown configuration section [{section}]");
    }

    Ok(Settings {
        agent,
        global_tags,
        inputs,
        outputs,
    })
}

/// Replaces `${VAR}` references by the value of the environment variable.
/// Referencing an unset variable is an error.
fn substitute_env_variables(raw: &str) -> anyhow::Result<String> {
    substitute_variables(raw, |name| std::env::var(name).ok())
}

fn substitute_variables(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let reference = &rest[start + 2..];
        let end = reference
            .find('}')
            .with_context(|| format!("unclosed variable reference near '{}'", &rest[start..]))?;
        let name = &reference[..end];
        let value = lookup(name).with_context(|| format!("environment variable '{name}' is not set"))?;
        out.push_str(&value);
        rest = &reference[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn build_inputs(kinds: toml::Table) -> anyhow::Result<Vec<ConfiguredInput>> {
    let mut inputs = Vec::new();
    for (kind, value) in kinds {
        for instance in instances_of(&kind, value)? {
            let toml::Value::Table(mut instance) = instance else {
                anyhow::bail!("input [{kind}] must be a table");
            };
            let scope = split_scope(&kind, &mut instance)?;
            let input = build_input(&kind, instance)
                .with_context(|| format!("invalid configuration of input [{kind}]"))?;
            inputs.push(ConfiguredInput { input, scope });
        }
    }
    Ok(inputs)
}

fn build_outputs(kinds: toml::Table) -> anyhow::Result<Vec<Box<dyn Output>>> {
    let mut outputs = Vec::new();
    for (kind, value) in kinds {
        for instance in instances_of(&kind, value)? {
            let toml::Value::Table(instance) = instance else {
                anyhow::bail!("output [{kind}] must be a table");
            };
            let output = build_output(&kind, instance)
                .with_context(|| format!("invalid configuration of output [{kind}]"))?;
            outputs.push(output);
        }
    }
    Ok(outputs)
}

/// Both `[[inputs.kind]]` (an array of instances) and `[inputs.kind]` (a
/// single instance) are accepted.
fn instances_of(kind: &str, value: toml::Value) -> anyhow::Result<Vec<toml::Value>> {
    match value {
        toml::Value::Array(instances) => Ok(instances),
        table @ toml::Value::Table(_) => Ok(vec![table]),
        _ => anyhow::bail!("[{kind}] must be a table or an array of tables"),
    }
}

/// Extracts the reserved scope keys from an input table, leaving the
/// plugin-specific keys in place.
fn split_scope(kind: &str, instance: &mut toml::Table) -> anyhow::Result<InputScope> {
    let mut scope_table = toml::Table::new();
    for key in SCOPE_KEYS {
        if let Some(value) = instance.remove(key) {
            scope_table.insert(key.to_owned(), value);
        }
    }
    let mut scope: InputScope = scope_table
        .try_into()
        .with_context(|| format!("invalid scope configuration of input [{kind}]"))?;
    scope.name = kind.to_owned();
    Ok(scope)
}

fn build_input(kind: &str, config: toml::Table) -> anyhow::Result<Box<dyn Input>> {
    let input: Box<dyn Input> = match kind {
        "redis" => Box::new(plugin_redis::RedisInput::new(deserialize_config(config)?)),
        "nxapi" => Box::new(plugin_nxapi::NxapiInput::new(deserialize_config(config)?)),
        #[cfg(target_os = "linux")]
        "netdev" => Box::new(plugin_netdev::NetdevInput::new(deserialize_config(config)?)),
        other => anyhow::bail!("unknown input kind [{other}]"),
    };
    Ok(input)
}

fn build_output(kind: &str, config: toml::Table) -> anyhow::Result<Box<dyn Output>> {
    let output: Box<dyn Output> = match kind {
        "file" => Box::new(plugin_file::FileOutput::new(deserialize_config(config)?)?),
        other => anyhow::bail!("unknown output kind [{other}]"),
    };
    Ok(output)
}

/// Collapses the configured outputs into the single output the scheduler
/// drives: the output itself when there is one, a fan-out otherwise.
pub fn combine_outputs(mut outputs: Vec<Box<dyn Output>>) -> Box<dyn Output> {
    if outputs.len() == 1 {
        outputs.remove(0)
    } else {
        Box::new(FanOutput { outputs })
    }
}

/// Hands every batch to every configured output. One output's failure does
/// not keep a batch from the others.
struct FanOutput {
    outputs: Vec<Box<dyn Output>>,
}

impl Output for FanOutput {
    fn description(&self) -> &'static str {
        "fans batches out to every configured output"
    }

    fn write(&mut self, metrics: &[Metric]) -> anyhow::Result<()> {
        let mut failures = Vec::new();
        for output in &mut self.outputs {
            if let Err(e) = output.write(metrics) {
                failures.push(e);
            }
        }
        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.swap_remove(0)),
            n => {
                let joined: Vec<String> = failures.iter().map(|e| format!("{e:#}")).collect();
                anyhow::bail!("{n} outputs failed: {}", joined.join("; "))
            }
        }
    }
}
