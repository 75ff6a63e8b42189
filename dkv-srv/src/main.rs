#![allow(unused)]

mod config;
mod node;
mod trace;

use std::env;

use anyhow::Result;
use clap::Parser;
use log::info;
use tokio::sync::watch;

use crate::config::ConfigLoad;

#[derive(Debug, Parser, PartialEq)]
#[command(version)]
#[command(author, about)]
pub struct Args {
    #[clap(short, long, help = "debug model")]
    debug: bool,

    /// Configuration file path, default 'config/dkv.toml'
    #[clap(
        short = 'c',
        long = "config",
        help = "Configuration file path",
        default_value = "config/dkv.toml"
    )]
    config: String,

    #[clap(short = 'r', long, help = "Override the configured role: master, slave or discovery")]
    role: Option<String>,

    #[clap(long = "listen-addr", help = "Override the configured RPC bind address")]
    listen_addr: Option<String>,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,
}

/// CMD like:
///     dkv-srv                       ==>  the configured role, default master
///     dkv-srv -r slave -c s1.toml   ==>  an async slave
///
#[tokio::main]
pub async fn main() -> Result<()> {
    eprintln!();
    eprintln!("███     ██  ██  ██    ██");
    eprintln!("██ ██   ██ ██    ██  ██");
    eprintln!("██  ██  ████      ████");
    eprintln!("██ ██   ██ ██      ██");
    eprintln!("███     ██  ██     ██  KV Storage Server");
    eprintln!();

    let args = Args::parse();
    if args.debug {
        println!("{:?}", args);
    }

    let log_dir = format!(
        "{}/.dkv",
        env::var("HOME").unwrap_or_else(|_| ".".to_string())
    );
    let _guards = trace::init_logging(&log_dir, &args.log_level)?;
    info!("dkv-srv start args: {:?}", &args);

    let mut cfg = match ConfigLoad::new(args.config.as_ref()) {
        Ok(c) => c,
        Err(err) => {
            log::warn!("Config {} not loaded ({}), using defaults", &args.config, err);
            ConfigLoad::default()
        }
    };
    if let Some(role) = args.role {
        cfg.set_role(role);
    }
    if let Some(addr) = args.listen_addr {
        cfg.set_listen_addr(addr);
    }
    if args.debug {
        println!("{:?}", &cfg);
        eprintln!();
    }
    info!("dkv-srv start config: {:?}", &cfg);

    let (tx, rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        println!("received Ctrl+C!");
        let _ = tx.send(true);
    })
    .expect("Error setting Ctrl-C handler");

    node::run(cfg, rx).await
}
