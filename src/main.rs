use devhost::certs::{CertCache, LocalAuthority};
use devhost::config::Config;
use devhost::daemon::Daemonizer;
use devhost::domains::DomainRegistry;
use devhost::error::Error;
use devhost::pool::PoolConfig;
use devhost::process::SignalListener;
use devhost::proxy::ProxyServer;
use devhost::record::RecordStore;
use devhost::supervisor::{RunOutcome, Runner, RunnerMode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Flags taking a value; everything else starting with `-` is a switch
const VALUE_FLAGS: [&str; 5] = ["dir", "port", "scheme", "watch", "name"];

/// First port tried when `server:start` is given none
const DEFAULT_SERVER_PORT: u16 = 8000;

const USAGE: &str = "\
Usage: devhost <command> [options] [-- <command line>]

Commands:
  proxy:start [--foreground]                 Start the proxy (in the background by default)
  proxy:stop                                 Stop the proxy
  proxy:status                               Show the proxy state and attached domains
  proxy:domain:attach <domain>... [--dir D]  Attach domains to a project directory
  proxy:domain:detach <domain>...            Detach domains
  server:start [--daemon] [--dir D] [--port P] [--scheme S] [--watch P]... -- <cmd>
                                             Run the project's web server
  server:stop [--dir D]                      Stop the web server and workers of a project
  server:list                                List running web servers
  server:log [--dir D]                       Print the web server log
  run [--daemon] [--dir D] [--name N] [--watch P]... -- <cmd>
                                             Run a worker command";

/// Parsed command line
#[derive(Debug, Default)]
struct Args {
    command: String,
    positional: Vec<String>,
    flags: HashMap<String, Vec<String>>,
    switches: Vec<String>,
    /// Everything after `--`
    trailing: Vec<String>,
}

impl Args {
    fn parse(raw: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut args = Args::default();
        let mut iter = raw.into_iter();

        while let Some(arg) = iter.next() {
            if arg == "--" {
                args.trailing = iter.by_ref().collect();
                break;
            }
            let Some(flag) = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-')) else {
                if args.command.is_empty() {
                    args.command = arg;
                } else {
                    args.positional.push(arg);
                }
                continue;
            };

            let (name, inline) = match flag.split_once('=') {
                Some((name, value)) => (name.to_string(), Some(value.to_string())),
                None => (flag.to_string(), None),
            };
            if VALUE_FLAGS.contains(&name.as_str()) {
                let value = match inline {
                    Some(value) => value,
                    None => iter
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--{} requires a value", name))?,
                };
                args.flags.entry(name).or_default().push(value);
            } else {
                args.switches.push(name);
            }
        }

        Ok(args)
    }

    fn value(&self, name: &str) -> Option<&str> {
        self.flags.get(name).and_then(|v| v.last()).map(|s| s.as_str())
    }

    fn values(&self, name: &str) -> Vec<String> {
        self.flags.get(name).cloned().unwrap_or_default()
    }

    fn has(&self, switch: &str) -> bool {
        self.switches.iter().any(|s| s == switch)
    }

    /// Project directory: `--dir` made absolute, or the current directory
    fn dir(&self) -> anyhow::Result<String> {
        let cwd = std::env::current_dir()?;
        let dir = match self.value("dir") {
            Some(dir) => cwd.join(dir),
            None => cwd,
        };
        let dir = dir.canonicalize().unwrap_or(dir);
        Ok(dir.to_string_lossy().into_owned())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devhost=info".parse()?),
        )
        .init();

    let args = Args::parse(std::env::args().skip(1))?;

    let home = Config::default_home()?;
    let config = Config::load_or_default(&home).map_err(|e| {
        error!(home = %home.display(), error = %e, "Failed to load configuration");
        e
    })?;

    let result = match args.command.as_str() {
        "proxy:start" => proxy_start(&config, &args).await,
        "proxy:stop" => proxy_stop(&config).await,
        "proxy:status" => proxy_status(&config),
        "proxy:domain:attach" => domain_attach(&config, &args),
        "proxy:domain:detach" => domain_detach(&config, &args),
        "server:start" => server_start(&config, &args).await,
        "server:stop" => server_stop(&config, &args).await,
        "server:list" => server_list(&config),
        "server:log" => server_log(&config, &args),
        "run" => run_worker(&config, &args).await,
        "version" => {
            println!("{} {}", PKG_NAME, VERSION);
            Ok(())
        }
        "" if args.has("version") => {
            println!("{} {}", PKG_NAME, VERSION);
            Ok(())
        }
        "" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("{}", USAGE);
            anyhow::bail!("Unknown command \"{}\"", other)
        }
    };

    if let Err(e) = result {
        // propagate the command's own exit code
        if let Some(Error::CommandFailed { status, .. }) = e.downcast_ref::<Error>() {
            std::process::exit(status.code().unwrap_or(1));
        }
        return Err(e);
    }
    Ok(())
}

fn load_registry(config: &Config) -> anyhow::Result<Arc<DomainRegistry>> {
    Ok(Arc::new(DomainRegistry::load(
        config.registry_path(),
        &config.proxy,
    )?))
}

async fn proxy_start(config: &Config, args: &Args) -> anyhow::Result<()> {
    let records = RecordStore::from_config(config);
    let registry = load_registry(config)?;

    let mut record = records.proxy_record();
    if record.is_running() {
        println!("The proxy server is already running at port {}", record.port);
        return Ok(());
    }

    if !args.has("foreground") && !Daemonizer::is_child() {
        let daemonizer = Daemonizer::new(config.daemon.clone(), config.var_dir());
        match daemonizer.background().await {
            Ok(()) => {
                println!("The proxy server is now running at port {}", registry.port());
                println!("Configure your browser with http://127.0.0.1:{}/proxy.pac", registry.port());
                return Ok(());
            }
            Err(e @ Error::DaemonExited(_)) => return Err(e.into()),
            Err(e) => warn!(error = %e, "Unable to go to the background, running in the foreground"),
        }
    }
    Daemonizer::notify_foreground("boot")?;

    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");

    let certs = match LocalAuthority::load_or_create(&config.certs_dir()) {
        Ok(ca) => Some(Arc::new(CertCache::new(
            Arc::clone(&registry),
            Arc::new(ca),
            config.proxy.cert_cache_capacity,
        ))),
        Err(e) => {
            warn!(error = %e, "Local certificate authority unavailable, TLS interception disabled");
            None
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server = ProxyServer::new(Arc::clone(&registry), records.clone(), shutdown_rx)
        .with_pool_config(PoolConfig::from(&config.proxy))
        .with_home_dir(dirs_next::home_dir());
    if let Some(certs) = certs {
        server = server.with_certs(certs);
    }

    let listener = TcpListener::bind(server.bind_addr()).await?;
    record.write(std::process::id(), registry.port(), "http")?;
    Daemonizer::notify_up(Some(&config.proxy_log_path()))?;

    let handle = tokio::spawn(server.run_with_listener(listener));

    let mut signals = SignalListener::new()?;
    if let Some(signal) = signals.recv().await {
        info!(?signal, "Signal received, shutting down...");
    }
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(Duration::from_secs(5), handle).await {
        Ok(Ok(Err(e))) => error!(error = %e, "Proxy server error"),
        Ok(Err(e)) => error!(error = %e, "Proxy server task failed"),
        Err(_) => warn!("Proxy server did not stop in time"),
        Ok(Ok(Ok(()))) => {}
    }

    record.remove()?;
    info!("Shutdown complete");
    Ok(())
}

async fn proxy_stop(config: &Config) -> anyhow::Result<()> {
    let mut record = RecordStore::from_config(config).proxy_record();
    if !record.is_running() {
        println!("The proxy server is not running");
        return Ok(());
    }
    record.stop().await?;
    println!("Stopped the proxy server");
    Ok(())
}

fn proxy_status(config: &Config) -> anyhow::Result<()> {
    let records = RecordStore::from_config(config);
    let registry = load_registry(config)?;

    let record = records.proxy_record();
    if record.is_running() {
        println!("Local proxy server running on port {} (pid {})", record.port, record.pid);
    } else {
        println!("Local proxy server stopped");
    }

    let dirs = registry.dirs();
    if dirs.is_empty() {
        println!("No domains attached. Attach one with: devhost proxy:domain:attach <domain>");
        return Ok(());
    }
    for dir in dirs {
        let domains = registry.domains_for_dir(&dir);
        let port = records.locate(&dir, &[]);
        let state = if port.is_running() {
            format!("{}://127.0.0.1:{}", port.scheme, port.port)
        } else {
            "not running".to_string()
        };
        println!("{}  [{}]", dir, state);
        for domain in domains {
            println!("    {}", domain);
        }
    }
    Ok(())
}

fn domain_attach(config: &Config, args: &Args) -> anyhow::Result<()> {
    if args.positional.is_empty() {
        anyhow::bail!("proxy:domain:attach requires at least one domain");
    }
    let registry = load_registry(config)?;
    let dir = args.dir()?;
    registry.add_dir_domains(&dir, &args.positional)?;

    println!("The proxy is now configured with the following domains for {}:", dir);
    for domain in registry.domains_for_dir(&dir) {
        println!("    http://{}", domain);
    }
    Ok(())
}

fn domain_detach(config: &Config, args: &Args) -> anyhow::Result<()> {
    if args.positional.is_empty() {
        anyhow::bail!("proxy:domain:detach requires at least one domain");
    }
    let registry = load_registry(config)?;
    registry.remove_dir_domains(&args.positional)?;
    println!("Detached {}", args.positional.join(", "));
    Ok(())
}

async fn server_start(config: &Config, args: &Args) -> anyhow::Result<()> {
    if args.trailing.is_empty() {
        anyhow::bail!("server:start requires the web server command after --");
    }
    let records = RecordStore::from_config(config);
    let dir = args.dir()?;

    let mut record = records.locate(&dir, &[]);
    if record.is_running() && record.pid != std::process::id() {
        println!("The web server is already running (pid {}) for {}", record.pid, dir);
        println!("    {}://127.0.0.1:{}", record.scheme, record.port);
        return Ok(());
    }
    record.set_watched(args.values("watch"));

    let port = match args.value("port") {
        Some(port) => port.parse::<u16>()?,
        None => find_free_port(DEFAULT_SERVER_PORT)?,
    };
    let scheme = args.value("scheme").unwrap_or("http").to_string();
    let mode = if args.has("daemon") || args.has("d") {
        RunnerMode::LoopDetached
    } else {
        RunnerMode::LoopAttached
    };

    let mut runner = Runner::new(record, args.trailing.clone(), mode, config)?
        .with_listen(port, scheme)
        .with_parent_watch(mode == RunnerMode::LoopDetached)
        .with_build_command_hook(Box::new(move |cmd| {
            cmd.env("PORT", port.to_string());
            Ok(())
        }));

    if runner.run().await? == RunOutcome::Backgrounded {
        // the background copy wrote the record before reporting up
        let record = records.locate(&dir, &[]);
        println!("Web server listening on {}://127.0.0.1:{}", record.scheme, record.port);
        println!("Stream the logs via: devhost server:log --dir={}", dir);
    }
    Ok(())
}

async fn server_stop(config: &Config, args: &Args) -> anyhow::Result<()> {
    let records = RecordStore::from_config(config);
    let dir = args.dir()?;

    let mut stopped = 0;
    for mut worker in records.workers(&dir) {
        info!(name = %worker.short_name(), pid = worker.pid, "Stopping worker");
        worker.stop().await?;
        stopped += 1;
    }

    let mut record = records.locate(&dir, &[]);
    if record.is_running() {
        record.stop().await?;
        stopped += 1;
    }

    if stopped == 0 {
        println!("No web server is running for {}", dir);
    } else {
        println!("Stopped {} process(es) for {}", stopped, dir);
    }
    Ok(())
}

fn server_list(config: &Config) -> anyhow::Result<()> {
    let records = RecordStore::from_config(config);
    let running = records.all_running();
    if running.is_empty() {
        println!("No web servers are running");
        return Ok(());
    }

    println!("{:<48} {:>6} {:<6} {:>8}", "Directory", "Port", "Scheme", "PID");
    for record in &running {
        println!(
            "{:<48} {:>6} {:<6} {:>8}",
            record.dir, record.port, record.scheme, record.pid
        );
    }
    Ok(())
}

fn server_log(config: &Config, args: &Args) -> anyhow::Result<()> {
    let records = RecordStore::from_config(config);
    let record = records.locate(&args.dir()?, &[]);
    let path = record.log_path();
    match std::fs::read_to_string(&path) {
        Ok(content) => {
            print!("{}", content);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("No logs yet for {}", record.dir);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_worker(config: &Config, args: &Args) -> anyhow::Result<()> {
    if args.trailing.is_empty() {
        anyhow::bail!("run requires a command after --");
    }
    let records = RecordStore::from_config(config);
    let dir = args.dir()?;

    let watched = args.values("watch");
    let mode = if args.has("daemon") || args.has("d") {
        RunnerMode::LoopDetached
    } else if !watched.is_empty() {
        RunnerMode::LoopAttached
    } else {
        RunnerMode::Once
    };

    let mut record = records.locate(&dir, &args.trailing);
    record.set_watched(watched);
    record.set_name(args.value("name").map(str::to_string));

    let mut runner = Runner::new(record, args.trailing.clone(), mode, config)?
        .with_parent_watch(mode == RunnerMode::LoopDetached);
    if runner.run().await? == RunOutcome::Backgrounded {
        println!("Started \"{}\" in the background", runner.record().short_name());
    }
    Ok(())
}

/// First port at or after `start` that can be bound on localhost
fn find_free_port(start: u16) -> anyhow::Result<u16> {
    for port in start..=u16::MAX {
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    anyhow::bail!("No free port available from {}", start)
}
