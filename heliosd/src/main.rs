// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

use std::sync::Arc;

use clap::{Arg, ArgMatches, Command};

use helios_engine::render::Renderer;
use helios_runtime::plugin::PluginSystem;
use helios_runtime::transport::server::{NoHooks, ServerSrv};
use helios_runtime::{Config, Database};

mod demo;
mod ppm;

fn main() -> anyhow::Result<()> {
    let args = args();
    configure_log(&args)?;

    let config = match args.get_one::<String>("config") {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match args.subcommand() {
        Some(("serve", _)) => serve(config),
        Some(("render", sub)) => {
            let out = sub
                .get_one::<String>("output")
                .cloned()
                .unwrap_or_else(|| "out.ppm".into());
            render_demo(config, &out)
        }
        _ => {
            // No subcommand behaves like a render server, the common
            // farm deployment.
            serve(config)
        }
    }
}

fn args() -> ArgMatches {
    Command::new("heliosd")
        .about("helios render host")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .env("HELIOS_CONFIG")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("log")
                .long("log")
                .value_name("LEVEL")
                .default_value("info")
                .help("Log level: trace, debug, info, warn, error"),
        )
        .subcommand(Command::new("serve").about("Run as a render server"))
        .subcommand(
            Command::new("render")
                .about("Render the built-in demo scene")
                .arg(
                    Arg::new("output")
                        .long("output")
                        .short('o')
                        .value_name("FILE")
                        .help("Output image path (ppm)"),
                ),
        )
        .get_matches()
}

fn configure_log(args: &ArgMatches) -> anyhow::Result<()> {
    let level: tracing::Level = args
        .get_one::<String>("log")
        .map(|s| s.as_str())
        .unwrap_or("info")
        .parse()
        .unwrap_or(tracing::Level::INFO);

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn serve(config: Config) -> anyhow::Result<()> {
    let db = Arc::new(Database::new(config.memlimit_bytes()));
    helios_engine::register_types(&db);
    helios_engine::init_env();

    let plugins = PluginSystem::new(config.searchpaths.clone());
    let server = ServerSrv::new(config.port, db, plugins, Arc::new(NoHooks));

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?
        .block_on(server.run())
}

fn render_demo(config: Config, output: &str) -> anyhow::Result<()> {
    let mut renderer = Renderer::new(config)?;
    let (root, options, camera) = demo::build(renderer.scene())?;
    renderer.set_scene(root);

    let driver = ppm::PpmDriver::new(output);
    renderer.render(options, camera, &driver)?;
    tracing::info!(output, "demo image written");
    Ok(())
}
