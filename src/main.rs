//! Binary entrypoint for the fidobbs CLI.
//!
//! Commands:
//! - `start [--daemon] [--pid-file <path>]` - run the BBS and mailer
//! - `init` - write a default config and create the data tree
//! - `status` - print call/user/message counters
//! - `toss` - process inbound mail once and exit
//! - `scan` - export and pack outbound mail once and exit
//! - `poll <address>` - dial one configured uplink now
//! - `compile-nodelist <network> <file>` - rebuild a binary nodelist index
//! - `useradd <name>` - create a user from the console

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::sync::Mutex;

use fidobbs::bbs::BbsServer;
use fidobbs::config::Config;
use fidobbs::ftn::addr::FtnAddress;
use fidobbs::ftn::mailer::Mailer;
use fidobbs::ftn::nodelist;
use fidobbs::storage::Storage;

#[derive(Parser)]
#[command(name = "fidobbs")]
#[command(about = "A multi-line BBS with FidoNet mail over BinkP")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "fidobbs.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the BBS server and the FTN mailer
    Start {
        /// Run as a background daemon (Unix only)
        #[arg(short, long)]
        daemon: bool,

        /// PID file location (for daemon mode)
        #[arg(long, default_value = "/tmp/fidobbs.pid")]
        pid_file: String,
    },
    /// Write a default configuration and create the data tree
    Init,
    /// Show counters and exit
    Status,
    /// Process inbound mail once
    Toss,
    /// Export and pack outbound mail once
    Scan,
    /// Dial one uplink now
    Poll {
        /// Uplink FTN address, e.g. 2:250/0
        address: String,
    },
    /// Compile a raw nodelist into the binary index
    CompileNodelist {
        /// Network (domain) name, e.g. fidonet
        network: String,
        /// Path to the raw FTS-0005 nodelist file
        file: PathBuf,
        /// Zone hint for lists that open without a Zone line
        #[arg(short, long, default_value_t = 2)]
        zone: u16,
    },
    /// Create a user account from the console
    Useradd {
        name: String,
        /// Real name shown to other users
        #[arg(long, default_value = "")]
        real_name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let pre_config = Config::load(&cli.config).await.ok();
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init => {
            if Path::new(&cli.config).exists() {
                return Err(anyhow!("{} already exists; refusing to overwrite", cli.config));
            }
            Config::create_default(&cli.config).await?;
            let config = Config::load(&cli.config).await?;
            open_storage(&config)?;
            write_sample_scripts(&config)?;
            println!("Wrote {} and created the data tree under {}.", cli.config, config.storage.root);
            println!("Edit the config (lines, FTN links, areas), then run: fidobbs start");
        }
        Commands::Start { daemon, pid_file } => {
            let config = pre_config.ok_or_else(|| anyhow!("cannot read {}", cli.config))?;

            #[cfg(all(unix, feature = "daemon"))]
            if daemon {
                daemonize_process(&config, &pid_file)?;
            }
            #[cfg(not(all(unix, feature = "daemon")))]
            if daemon {
                let _ = pid_file;
                return Err(anyhow!(
                    "daemon mode needs a Unix build with the 'daemon' feature"
                ));
            }

            info!("Starting fidobbs v{}", env!("CARGO_PKG_VERSION"));
            let storage = Arc::new(Mutex::new(open_storage(&config)?));
            let config = Arc::new(config);
            let (server, _ui) = BbsServer::new(config.clone(), storage.clone());

            if config.ftn.enabled {
                let root = PathBuf::from(&config.storage.root);
                let mailer = Mailer::new(config.clone(), storage.clone(), &root)?;
                tokio::select! {
                    r = server.run() => r?,
                    r = mailer.run() => r?,
                }
            } else {
                server.run().await?;
            }
        }
        Commands::Status => {
            let config = pre_config.ok_or_else(|| anyhow!("cannot read {}", cli.config))?;
            let storage = open_storage(&config)?;
            println!("{}", config.bbs.name);
            println!("  calls answered : {}", storage.call_count());
            println!("  users          : {}", storage.users().len());
            println!("  messages       : {}", storage.messages().len());
            println!("  files          : {}", storage.files().len());
            println!("  message areas  : {}", storage.message_areas().len());
            println!("  file areas     : {}", storage.file_areas().len());
        }
        Commands::Toss | Commands::Scan => {
            // Both run the same maintenance pass; toss happens before scan
            // inside it, so either verb leaves the spools consistent.
            let config = pre_config.ok_or_else(|| anyhow!("cannot read {}", cli.config))?;
            if !config.ftn.enabled {
                return Err(anyhow!("[ftn] is not enabled in {}", cli.config));
            }
            let root = PathBuf::from(&config.storage.root);
            let storage = Arc::new(Mutex::new(open_storage(&config)?));
            let mut mailer = Mailer::new(Arc::new(config), storage, &root)?;
            mailer.run_once().await?;
            println!("Done.");
        }
        Commands::Poll { address } => {
            let config = pre_config.ok_or_else(|| anyhow!("cannot read {}", cli.config))?;
            let addr = FtnAddress::from_str(&address).map_err(|e| anyhow!("{e}"))?;
            let uplink = config
                .ftn
                .uplinks
                .iter()
                .find(|u| {
                    FtnAddress::from_str(&u.address)
                        .map(|a| a.same_node(&addr))
                        .unwrap_or(false)
                })
                .cloned()
                .ok_or_else(|| anyhow!("{} is not a configured uplink", address))?;
            let root = PathBuf::from(&config.storage.root);
            let storage = Arc::new(Mutex::new(open_storage(&config)?));
            let mut mailer = Mailer::new(Arc::new(config), storage, &root)?;
            mailer.run_once().await?;
            mailer.poll(&uplink).await?;
            println!("Poll complete.");
        }
        Commands::CompileNodelist { network, file, zone } => {
            let config = pre_config.ok_or_else(|| anyhow!("cannot read {}", cli.config))?;
            let storage = open_storage(&config)?;
            let text = std::fs::read_to_string(&file)
                .map_err(|e| anyhow!("cannot read {}: {}", file.display(), e))?;
            let dir = storage.nodelist_dir(&network);
            std::fs::create_dir_all(&dir)?;
            let count = nodelist::compile_index(&text, zone, &dir.join("NodeIDX"))?;
            println!("Compiled {} entries into {}/NodeIDX", count, dir.display());
        }
        Commands::Useradd { name, real_name } => {
            let config = pre_config.ok_or_else(|| anyhow!("cannot read {}", cli.config))?;
            let mut storage = open_storage(&config)?;
            // Read the password from stdin so it stays out of shell history.
            println!("Password for {} (echoed):", name);
            let mut password = String::new();
            std::io::stdin().read_line(&mut password)?;
            let password = password.trim_end();
            if password.len() < 4 {
                return Err(anyhow!("password too short (minimum 4)"));
            }
            let user = storage.add_user(&name, password, &real_name, "")?;
            println!("Created user #{} '{}'.", user.id, user.username);
        }
    }

    Ok(())
}

/// A minimal working menu tree so a fresh system answers calls usefully.
fn write_sample_scripts(config: &Config) -> Result<()> {
    let dir = Path::new(&config.script.dir);
    std::fs::create_dir_all(dir)?;
    let main_path = dir.join(format!("{}.bbs", config.script.main));
    if main_path.exists() {
        return Ok(());
    }
    std::fs::write(
        &main_path,
        concat!(
            "/* Entry script: ANSI probe, logon, main menu. */\n",
            "detectansi a\n",
            "cls\n",
            "print `Welcome!\\r\\n\\r\\n`\n",
            "login:\n",
            "logon\n",
            "if %{registered} == 0 then\n",
            "print `No luck. N to register, anything else retries.\\r\\n`\n",
            "prompt c char echo\n",
            "if %{c} == N || %{c} == n then newuser end if\n",
            "if %{registered} == 0 then goto login end if\n",
            "end if\n",
            "loginscan\n",
            "menu:\n",
            "print `\\r\\n[O]nline  [M]essage areas  [F]ile areas  [G]oodbye\\r\\n> `\n",
            "prompt choice char echo\n",
            "if %{choice} == o || %{choice} == O then online end if\n",
            "if %{choice} == m || %{choice} == M then messagebase list end if\n",
            "if %{choice} == f || %{choice} == F then filebase list end if\n",
            "if %{choice} == g || %{choice} == G then stop end if\n",
            "goto menu\n",
        ),
    )?;
    Ok(())
}

fn open_storage(config: &Config) -> Result<Storage> {
    Storage::open(
        Path::new(&config.storage.root),
        &config.ftn.message_areas,
        &config.ftn.file_areas,
    )
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let base_level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let (file_path, security_path) = match config {
        Some(cfg) => (cfg.logging.file.clone(), cfg.logging.security_file.clone()),
        None => (None, None),
    };
    if let Some(path) = file_path {
        if let Ok(f) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            let mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if record.target() == "security" {
                    if let Some(ref sec) = security_path {
                        if let Ok(mut sf) =
                            std::fs::OpenOptions::new().create(true).append(true).open(sec)
                        {
                            let _ = writeln!(sf, "{}", line);
                        }
                    }
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    if builder.try_init().is_err() {
        error!("logger already initialised");
    }
}

/// Re-exec detached, write the PID file, and let the parent exit.
#[cfg(all(unix, feature = "daemon"))]
fn daemonize_process(config: &Config, pid_file: &str) -> Result<()> {
    use std::process::{Command, Stdio};

    let log_path = config.logging.file.as_deref().unwrap_or("fidobbs.log");
    let current_exe = std::env::current_exe()?;
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if let Some(pos) = args.iter().position(|a| a == "--daemon" || a == "-d") {
        args.remove(pos);
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    let child = Command::new(&current_exe)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(log_file.try_clone()?)
        .stderr(log_file)
        .spawn()?;
    std::fs::write(pid_file, child.id().to_string())?;
    std::process::exit(0);
}
