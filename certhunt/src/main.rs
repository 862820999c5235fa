use anyhow::{anyhow, Context, Result};
use certhunt_core::cert_verify::is_valid_hostname;
use certhunt_core::{
    get_current_hunting_task_list, CertVerifyRequest, HuntingTaskReply, Message, PublicIpNotification, SystemClock,
    TaskStore, TaskTarget,
};
use certhunt_sqlite::Db;
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use time::OffsetDateTime;

mod config;

#[derive(Debug, Parser)]
#[command(name = "certhunt", version, about = "Certificate hunting server: message decoding and task list tools")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./certhunt.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// More log output (-v debug, -vv trace); overrides logging.level
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Create the database and its schema
    InitDb,
    /// Add an active hunting task with a fresh HMAC key
    AddTask {
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 443)]
        port: u16,
        #[arg(long)]
        ip: IpAddr,
    },
    /// Stop accepting replies for a task
    CloseTask { task_id: u32 },
    /// List hunting tasks (JSON lines)
    Tasks {
        /// Include closed tasks
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// Produce the current hunting task list, from cache if still valid
    TaskList {
        /// Write the raw message stream here
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Issue a public IP notification (hex) for a client, keyed by a task
    PublicIp {
        #[arg(long)]
        task: u32,
        #[arg(long)]
        ip: IpAddr,
    },
    /// Decode a raw certificate verify request
    VerifyRequest {
        #[arg(long, value_name = "FILE")]
        file: PathBuf,
        #[arg(long)]
        remote: IpAddr,
        #[arg(long)]
        local: IpAddr,
    },
    /// Validate a raw known-cert hunting task reply and store it
    SubmitReply {
        #[arg(long, value_name = "FILE")]
        file: PathBuf,
        /// Address the reply came from
        #[arg(long)]
        observer: IpAddr,
    },
}

fn init_logging(verbose: u8, configured: Option<tracing::Level>) {
    let level = match verbose {
        0 => configured.unwrap_or(tracing::Level::INFO),
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;
    init_logging(cli.verbose, cfg.log_level()?);
    let open_db = || Db::open_or_create(cfg.db_path()).with_context(|| format!("opening {}", cfg.db_path().display()));
    match cli.command {
        Commands::Version => {
            println!("certhunt {} (core {})", env!("CARGO_PKG_VERSION"), certhunt_core::version());
        }
        Commands::InitDb => {
            open_db()?;
            tracing::info!(path = %cfg.db_path().display(), "database ready");
        }
        Commands::AddTask { host, port, ip } => {
            if !is_valid_hostname(&host) {
                return Err(anyhow!("invalid hostname: {}", host));
            }
            let db = open_db()?;
            let key: [u8; 32] = rand::random();
            let target = TaskTarget { host, port, ip };
            let task_id = db.insert_task(&target, &key, OffsetDateTime::now_utc())?;
            let obj = serde_json::json!({ "task_id": task_id, "target": target.host_port(), "ip": ip.to_string() });
            println!("{}", serde_json::to_string(&obj)?);
        }
        Commands::CloseTask { task_id } => {
            let db = open_db()?;
            if !db.set_task_active(task_id, false)? {
                return Err(anyhow!("no hunting task {}", task_id));
            }
        }
        Commands::Tasks { all } => {
            let db = open_db()?;
            for row in db.task_rows(!all)? {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        Commands::TaskList { out } => {
            let db = open_db()?;
            let list = get_current_hunting_task_list(cfg.task_list_validity(), &db, &SystemClock)?;
            let bytes = list.to_bytes()?;
            if let Some(p) = out {
                std::fs::write(&p, &bytes)?;
            }
            let obj = serde_json::json!({ "bytes": bytes.len(), "fresh_messages": list.messages().len() });
            println!("{}", serde_json::to_string(&obj)?);
        }
        Commands::PublicIp { task, ip } => {
            let db = open_db()?;
            let record = db.lookup_task(task)?.ok_or_else(|| anyhow!("no hunting task {}", task))?;
            let note = PublicIpNotification::issue(&record.hmac_key, ip);
            println!("{}", hex::encode(Message::PublicIpNotification(note).encode()?));
        }
        Commands::VerifyRequest { file, remote, local } => {
            let bytes = std::fs::read(&file)?;
            let cvr = CertVerifyRequest::decode(&mut &bytes[..], remote, local)?;
            let cert = cvr.certificate()?;
            let obj = serde_json::json!({
                "host": cvr.host_name(),
                "ip": cvr.host_ip().to_string(),
                "port": cvr.host_port(),
                "subject": cert.subject().to_string(),
                "issuer": cert.issuer().to_string(),
                "request_hash": hex::encode(cvr.hash()),
            });
            println!("{}", serde_json::to_string(&obj)?);
        }
        Commands::SubmitReply { file, observer } => {
            let bytes = std::fs::read(&file)?;
            let db = open_db()?;
            let policy = cfg.reply_policy();
            let reply = HuntingTaskReply::read_from(&mut &bytes[..], observer, &db, &SystemClock, &policy)?;
            let observation = reply.store(&db)?;
            let obj = serde_json::json!({
                "task_id": reply.task_id(),
                "stored": observation.is_some(),
                "observation_id": observation,
            });
            println!("{}", serde_json::to_string(&obj)?);
        }
    }
    Ok(())
}
