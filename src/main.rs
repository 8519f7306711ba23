use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::thread;

use clap::Parser;
use env_logger::Env;
use log::{error, info, trace};

use rusty_interceptor::{ConfigError, Proxy, ProxyConfig, RouteTarget};

#[derive(Debug, Parser)]
#[command(name = "rusty-interceptor", version, about = "HTTP intercepting proxy")]
struct Args {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Upstream as host:port, http://host[:port] or https://host[:port]
    #[arg(short, long = "upstream")]
    upstreams: Vec<RouteTarget>,

    /// Number of worker threads
    #[arg(short, long)]
    workers: Option<usize>,
}

fn load_config(args: &Args) -> Result<ProxyConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => ProxyConfig::load(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if !args.upstreams.is_empty() {
        config.upstreams = args.upstreams.clone();
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

fn run_worker(id: usize, config: ProxyConfig) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("worker {}: error building runtime: {}", id, e);
            return;
        }
    };
    runtime.block_on(async move {
        let proxy = match Proxy::new(config) {
            Ok(p) => p,
            Err(e) => {
                error!("worker {}: error creating proxy: {}", id, e);
                return;
            }
        };
        trace!("worker {} running", id);
        if let Err(e) = proxy.run().await {
            error!("worker {} stopped: {}", id, e);
        }
    });
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };
    if config.upstreams.is_empty() {
        info!("no upstreams configured; every request will get a 503");
    }
    info!("{} worker(s), upstreams: {:?}", config.workers, config.upstreams);

    let mut workers = Vec::with_capacity(config.workers);
    for id in 0..config.workers {
        let config = config.clone();
        let spawned = thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || run_worker(id, config));
        match spawned {
            Ok(handle) => workers.push(handle),
            Err(e) => error!("error spawning worker {}: {}", id, e),
        }
    }
    for handle in workers {
        if handle.join().is_err() {
            error!("worker thread panicked");
        }
    }
}
