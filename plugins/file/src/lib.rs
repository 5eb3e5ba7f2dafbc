//! Output plugin writing metrics as line protocol to files or stdout.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};

use anyhow::Context;
use serde::Deserialize;

use rackmon::metric::Metric;
use rackmon::plugin::Output;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Destinations: `stdout` for the standard output stream, anything else
    /// is a path opened in append mode (created if missing).
    pub files: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            files: vec!["stdout".to_owned()],
        }
    }
}

pub struct FileOutput {
    writers: Vec<Writer>,
}

enum Writer {
    Stdout(io::Stdout),
    File { path: String, file: BufWriter<File> },
}

impl FileOutput {
    /// Opens every destination. Fails if one of them cannot be opened, so a
    /// bad path is reported at startup rather than at the first batch.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let files = if config.files.is_empty() {
            Config::default().files
        } else {
            config.files
        };
        let mut writers = Vec::with_capacity(files.len());
        for file in files {
            let writer = if file == "stdout" {
                Writer::Stdout(io::stdout())
            } else {
                let handle = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&file)
                    .with_context(|| format!("cannot open {file}"))?;
                Writer::File {
                    path: file,
                    file: BufWriter::new(handle),
                }
            };
            writers.push(writer);
        }
        Ok(Self { writers })
    }
}

impl Output for FileOutput {
    fn description(&self) -> &'static str {
        "writes metrics as line protocol to files or stdout"
    }

    fn write(&mut self, metrics: &[Metric]) -> anyhow::Result<()> {
        for writer in &mut self.writers {
            writer.write_batch(metrics)?;
        }
        Ok(())
    }
}

impl Writer {
    fn write_batch(&mut self, metrics: &[Metric]) -> anyhow::Result<()> {
        match self {
            Writer::Stdout(out) => {
                let mut lock = out.lock();
                for metric in metrics {
                    writeln!(lock, "{metric}")?;
                }
                lock.flush()?;
            }
            Writer::File { path, file } => {
                for metric in metrics {
                    writeln!(file, "{metric}").with_context(|| format!("cannot write to {path}"))?;
                }
                file.flush().with_context(|| format!("cannot flush {path}"))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use pretty_assertions::assert_eq;
    use rackmon::metric::{Timestamp, ValueType};
    use rackmon::{fields, tags};

    use super::*;

    fn sample(name: &str, value: i64) -> Metric {
        let ts = Timestamp::from(UNIX_EPOCH + Duration::from_nanos(1465839830100400200));
        Metric::new(name, tags! { "host" => "rack1" }, fields! { "value" => value }, ts, ValueType::Gauge).unwrap()
    }

    #[test]
    fn writes_one_line_per_metric() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.out");
        let mut output = FileOutput::new(Config {
            files: vec![path.to_str().unwrap().to_owned()],
        })
        .unwrap();

        output.write(&[sample("cpu", 1), sample("mem", 2)]).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            "cpu,host=rack1 value=1i 1465839830100400200\nmem,host=rack1 value=2i 1465839830100400200\n"
        );
    }

    #[test]
    fn batches_append_to_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.out");
        let config = Config {
            files: vec![path.to_str().unwrap().to_owned()],
        };

        let mut output = FileOutput::new(config.clone()).unwrap();
        output.write(&[sample("cpu", 1)]).unwrap();
        // A new instance over the same path must not truncate it.
        let mut output = FileOutput::new(config).unwrap();
        output.write(&[sample("cpu", 2)]).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 2);
    }

    #[test]
    fn an_unwritable_path_fails_at_construction() {
        let result = FileOutput::new(Config {
            files: vec!["/nonexistent/dir/metrics.out".to_owned()],
        });
        assert!(result.is_err());
    }

    #[test]
    fn defaults_to_stdout() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.files, vec!["stdout".to_owned()]);
        // Writing to stdout must not fail.
        let mut output = FileOutput::new(config).unwrap();
        output.write(&[sample("cpu", 1)]).unwrap();
    }
}
