// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Render host configuration, read from a line-based file of
//! whitespace-separated commands. There is no comment syntax; unknown
//! commands are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;

/// Default payload memory limit, in MiB.
pub const DEFAULT_MEMORY_LIMIT: usize = 1024;

const DEFAULT_PORT: u16 = 6666;
const DEFAULT_MAX_CLIENTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDesc {
    pub host_name: String,
    pub port_number: u16,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Local worker thread count; 0 means one per logical cpu.
    pub nthreads: usize,
    /// Payload memory limit in MiB.
    pub memlimit: usize,
    pub distributed: bool,
    pub port: u16,
    pub maxclients: usize,
    pub servers: Vec<HostDesc>,
    pub searchpaths: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            nthreads: 0,
            memlimit: DEFAULT_MEMORY_LIMIT,
            distributed: true,
            port: DEFAULT_PORT,
            maxclients: DEFAULT_MAX_CLIENTS,
            servers: vec![],
            searchpaths: vec![],
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let mut config = Config::default();
        let reader = BufReader::new(File::open(path)?);

        for line in reader.lines() {
            let line = line?;
            let mut words = line.split_whitespace();
            let Some(command) = words.next() else {
                continue;
            };

            match command {
                "nthreads" => {
                    if let Some(sval) = words.next() {
                        config.nthreads = if sval == "auto" {
                            0
                        } else {
                            sval.parse().unwrap_or(0)
                        };
                    }
                }
                "memlimit" => {
                    if let Some(ival) = words.next().and_then(|s| s.parse::<i64>().ok()) {
                        config.memlimit = ival.max(0) as usize;
                    }
                }
                "distributed" => {
                    if let Some(sval) = words.next() {
                        config.distributed = sval == "on";
                    }
                }
                "port" => {
                    if let Some(ival) = words.next().and_then(|s| s.parse().ok()) {
                        config.port = ival;
                    }
                }
                "maxclients" => {
                    if let Some(ival) = words.next().and_then(|s| s.parse().ok()) {
                        config.maxclients = ival;
                    }
                }
                "server" => {
                    if let Some(sval) = words.next() {
                        let (host_name, port_str) = match sval.split_once(':') {
                            Some((h, p)) => (h, p),
                            None => (sval, ""),
                        };
                        if !host_name.is_empty() {
                            config.servers.push(HostDesc {
                                host_name: host_name.to_owned(),
                                port_number: port_str.parse().unwrap_or(DEFAULT_PORT),
                            });
                        }
                    }
                }
                "searchpath" => {
                    // The remainder of the line, inner whitespace kept.
                    let rest = line["searchpath".len()..].trim();
                    if !rest.is_empty() {
                        config.searchpaths.push(PathBuf::from(rest));
                    }
                }
                _ => {}
            }
        }

        config.echo();

        Ok(config)
    }

    /// Resolved local worker thread count.
    pub fn num_threads(&self) -> usize {
        if self.nthreads == 0 {
            num_cpus::get()
        } else {
            self.nthreads
        }
    }

    /// Memory limit in bytes.
    pub fn memlimit_bytes(&self) -> usize {
        self.memlimit.saturating_mul(1024 * 1024)
    }

    fn echo(&self) {
        info!(nthreads = self.nthreads, memlimit = self.memlimit, distributed = self.distributed);
        for host_desc in &self.servers {
            info!(server = %host_desc.host_name, port = host_desc.port_number);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        f.write_all(content.as_bytes()).expect("write");
        f
    }

    #[test]
    fn test_load_full() {
        let f = write_config(
            "nthreads 4\n\
             memlimit 512\n\
             distributed on\n\
             port 7000\n\
             maxclients 3\n\
             server farm01:7000\n\
             server farm02:7001\n\
             searchpath /opt/helios/shaders\n",
        );

        let c = Config::load(f.path()).expect("config should load");
        assert_eq!(c.nthreads, 4);
        assert_eq!(c.memlimit, 512);
        assert!(c.distributed);
        assert_eq!(c.port, 7000);
        assert_eq!(c.maxclients, 3);
        assert_eq!(c.servers.len(), 2);
        assert_eq!(c.servers[1].host_name, "farm02");
        assert_eq!(c.servers[1].port_number, 7001);
        assert_eq!(c.searchpaths, vec![PathBuf::from("/opt/helios/shaders")]);
    }

    #[test]
    fn test_auto_threads_and_unknown_commands() {
        let f = write_config("nthreads auto\nfrobnicate 12\ndistributed off\n");
        let c = Config::load(f.path()).expect("config should load");
        assert_eq!(c.nthreads, 0);
        assert!(c.num_threads() >= 1);
        assert!(!c.distributed);
    }

    #[test]
    fn test_searchpath_keeps_inner_spaces() {
        let f = write_config("searchpath /render farm/shaders\n");
        let c = Config::load(f.path()).expect("config should load");
        assert_eq!(c.searchpaths, vec![PathBuf::from("/render farm/shaders")]);
    }

    #[test]
    fn test_missing_file() {
        assert!(Config::load("/nonexistent/helios.cfg").is_err());
    }
}
