use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use index_lifecycle::cleaner::KeyedRetention;
use index_lifecycle::cluster::LocalElection;
use index_lifecycle::config::Config;
use index_lifecycle::creator::Creator;
use index_lifecycle::index::{IndexEntry, IndexFilter};
use index_lifecycle::loader::Loader;
use index_lifecycle::pattern::Pattern;
use index_lifecycle::service::Service;
use index_lifecycle::store::{ClusterState, KvCache, MemoryCache, MemoryStore};
use tracing::info;
use tracing_subscriber::EnvFilter;
use wildmatch::WildMatch;

/// 时间分区索引的生命周期管理
#[derive(Parser)]
#[command(name = "index-lifecycle")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// 配置文件路径（默认 <config_dir>/index-lifecycle/config.toml）
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 校验配置并打印编译后的模板
    Check,

    /// 把物理索引名反查成 key 与变量
    Match {
        name: String,
    },

    /// 打印 keys 对应的首个索引、alias 与 fixed 索引
    Fill {
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// 在内存集群上运行全部后台循环，Ctrl-C 退出
    Simulate {
        /// 集群描述（JSON：nodes + indices）
        #[arg(short, long)]
        state: PathBuf,

        /// 报告间隔（秒）
        #[arg(long, default_value_t = 30)]
        report_interval: u64,

        /// 启动时按 glob 手动清理一次过期索引，例如 `spot-cpu-*`
        #[arg(long)]
        only: Option<String>,
    },
}

fn config_path(arg: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(p) = arg {
        return Ok(p);
    }
    let dir = dirs::config_dir().context("cannot determine config directory, use --config")?;
    Ok(dir.join("index-lifecycle").join("config.toml"))
}

fn print_pattern(text: &str) -> anyhow::Result<()> {
    let p = Pattern::build(text)?;
    println!("  {}  keys={} vars={}", p, p.key_num(), p.var_num());
    Ok(())
}

fn check(cfg: &Config) -> anyhow::Result<()> {
    println!("[loader]");
    for g in &cfg.loader.indices {
        println!(" prefix {:?}", g.prefix);
        for p in &g.patterns {
            print_pattern(p)?;
        }
    }
    println!("[creator]");
    for p in &cfg.creator.patterns {
        print_pattern(&p.first_index)?;
        print_pattern(&p.alias)?;
    }
    for p in &cfg.creator.fixed_patterns {
        print_pattern(p)?;
    }
    println!("[rollover]");
    for p in &cfg.rollover.patterns {
        print_pattern(&p.index)?;
        print_pattern(&p.alias)?;
    }
    println!("config ok");
    Ok(())
}

async fn simulate(
    cfg: Config,
    state: PathBuf,
    report_interval: u64,
    only: Option<String>,
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&state)
        .with_context(|| format!("read cluster state {}", state.display()))?;
    let cluster: ClusterState = serde_json::from_str(&text).context("parse cluster state")?;
    info!(
        "Simulating {} nodes, {} indices",
        cluster.nodes.len(),
        cluster.indices.len()
    );

    let store = Arc::new(MemoryStore::from_state(cluster));
    let cache = cfg
        .loader
        .cache
        .is_some()
        .then(|| Arc::new(MemoryCache::new()) as Arc<dyn KvCache>);
    let retention = Arc::new(KeyedRetention::new(&cfg.cleaner.retention));
    let svc = Arc::new(Service::build(cfg, store, cache, retention)?);
    let election = LocalElection::new(svc.shutdown_token());
    svc.start(&election);

    if let Some(glob) = only {
        let wm = WildMatch::new(&glob);
        let filter: IndexFilter = Arc::new(move |e: &IndexEntry| wm.matches(&e.index));
        svc.cleaner
            .clean_indices(&svc.shutdown_token(), Some(filter))
            .await
            .with_context(|| format!("clean indices matching {glob:?}"))?;
    }

    tokio::spawn(svc.clone().report_loop(Duration::from_secs(report_interval.max(1))));

    info!("index-lifecycle simulation running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    svc.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let path = config_path(cli.config)?;
    let cfg = Config::load(&path).with_context(|| format!("load config {}", path.display()))?;

    match cli.command {
        Commands::Check => check(&cfg)?,
        Commands::Match { name } => {
            let loader = Loader::new(cfg.loader, Arc::new(MemoryStore::new()))?;
            match loader.match_index(&name) {
                Some(m) => {
                    println!("prefix:    {}", m.prefix);
                    println!("pattern:   {}", m.pattern);
                    println!("keys:      {:?}", m.keys);
                    println!("num:       {}", m.num);
                    println!("timestamp: {:?}", m.timestamp);
                    println!("fixed:     {}", m.fixed);
                }
                None => anyhow::bail!("{name:?} matches no configured pattern"),
            }
        }
        Commands::Fill { keys } => {
            let loader = Arc::new(Loader::new(cfg.loader, Arc::new(MemoryStore::new()))?);
            let creator = Creator::new(cfg.creator, loader)?;
            match creator.target_of(&keys) {
                Ok((index, alias)) => {
                    println!("first index: {index}");
                    println!("alias:       {alias}");
                }
                Err(e) => println!("alias:       {e}"),
            }
            match creator.fixed_index(&keys) {
                Ok(fixed) => println!("fixed index: {fixed}"),
                Err(e) => println!("fixed index: {e}"),
            }
        }
        Commands::Simulate {
            state,
            report_interval,
            only,
        } => simulate(cfg, state, report_interval, only).await?,
    }
    Ok(())
}
