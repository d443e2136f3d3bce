use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};
use crate::pattern::Pattern;

/// 完整配置（TOML）。
///
/// 所有字段都有默认值；时间统一以 `*_secs` 整数表示，字节大小接受 `"10gb"` 形式。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub loader: LoaderConfig,
    pub creator: CreatorConfig,
    pub cleaner: CleanerConfig,
    pub rollover: RolloverConfig,
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// 启动期校验：所有模板必须可构建，否则直接失败
    pub fn validate(&self) -> Result<()> {
        if self.loader.indices.is_empty() {
            return Err(Error::Config("loader.indices is empty".into()));
        }
        for group in &self.loader.indices {
            for p in &group.patterns {
                Pattern::build(p)?.check_vars()?;
            }
        }
        for p in &self.creator.patterns {
            Pattern::build(&p.first_index)?;
            Pattern::build(&p.alias)?;
        }
        for p in &self.creator.fixed_patterns {
            Pattern::build(p)?;
        }
        for p in &self.rollover.patterns {
            Pattern::build(&p.index)?.check_vars()?;
            Pattern::build(&p.alias)?;
        }
        let c = &self.cleaner.disk;
        if c.enable && c.low_disk_usage_percent > c.high_disk_usage_percent {
            return Err(Error::Config(format!(
                "cleaner.disk: low_disk_usage_percent {} > high_disk_usage_percent {}",
                c.low_disk_usage_percent, c.high_disk_usage_percent
            )));
        }
        Ok(())
    }
}

/// 一个前缀下按顺序尝试的模板
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IndexPatterns {
    pub prefix: String,
    pub patterns: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub indices: Vec<IndexPatterns>,
    pub reload_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// 对非 active 的滚动索引查询 min/max 时间
    pub query_index_time_range: bool,
    pub timestamp_field: String,
    /// 找不到任何索引时返回的占位索引
    pub default_index: String,
    /// 捕获值中不允许出现的字符
    pub invalid_chars: String,
    pub wait_interval_ms: u64,
    /// 设置后启用共享缓存模式
    pub cache: Option<LoaderCacheConfig>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            indices: Vec::new(),
            reload_interval_secs: 120,
            request_timeout_secs: 60,
            query_index_time_range: true,
            timestamp_field: "timestamp".into(),
            default_index: "spot-empty".into(),
            invalid_chars: "-.".into(),
            wait_interval_ms: 1000,
            cache: None,
        }
    }
}

impl LoaderConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderCacheConfig {
    pub key: String,
    pub sync_interval_secs: u64,
    pub expiration_secs: u64,
}

impl Default for LoaderCacheConfig {
    fn default() -> Self {
        Self {
            key: "index-lifecycle-indices".into(),
            sync_interval_secs: 60,
            expiration_secs: 600,
        }
    }
}

/// 首个索引与 alias 的模板对（key 数必须一致）
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreatePatterns {
    pub first_index: String,
    pub alias: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CreatorConfig {
    pub patterns: Vec<CreatePatterns>,
    pub fixed_patterns: Vec<String>,
    pub retry_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// alias 名与某个物理索引重名时先删掉该索引
    pub remove_conflicting_indices: bool,
}

impl Default for CreatorConfig {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            fixed_patterns: Vec::new(),
            retry_interval_secs: 3,
            request_timeout_secs: 60,
            remove_conflicting_indices: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    pub enable: bool,
    pub check_interval_secs: u64,
    pub delete_batch_size: usize,
    pub request_timeout_secs: u64,
    pub retention: RetentionConfig,
    pub disk: DiskCleanConfig,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            enable: true,
            check_interval_secs: 3600,
            delete_batch_size: 10,
            request_timeout_secs: 60,
            retention: RetentionConfig::default(),
            disk: DiskCleanConfig::default(),
        }
    }
}

/// 默认 TTL + 按 key 前缀覆盖
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub default_ttl_secs: u64,
    pub rules: Vec<RetentionRule>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 7 * 24 * 3600,
            rules: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetentionRule {
    pub keys: Vec<String>,
    pub ttl_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskCleanConfig {
    pub enable: bool,
    pub check_interval_secs: u64,
    pub high_disk_usage_percent: f64,
    pub low_disk_usage_percent: f64,
    /// 节点上可淘汰索引占比低于该值时不参与淘汰
    pub min_indices_store_percent: f64,
    /// 每个节点至少保留的索引数据量
    #[serde(deserialize_with = "de_bytes")]
    pub min_indices_store: u64,
    /// 纯删除达不到目标时，用该 body 强制滚动 active 索引
    pub rollover_body_for_disk_clean: Option<String>,
    pub max_rounds: usize,
}

impl Default for DiskCleanConfig {
    fn default() -> Self {
        Self {
            enable: false,
            check_interval_secs: 300,
            high_disk_usage_percent: 85.0,
            low_disk_usage_percent: 70.0,
            min_indices_store_percent: 10.0,
            min_indices_store: 10 << 30,
            rollover_body_for_disk_clean: None,
            max_rounds: 8,
        }
    }
}

/// 物理索引模板与 alias 模板的对应关系
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RolloverPatterns {
    pub index: String,
    pub alias: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloverConfig {
    pub enable: bool,
    pub patterns: Vec<RolloverPatterns>,
    /// JSON，例如 `{"conditions": {"max_size": "20gb"}}`
    pub body: String,
    pub interval_secs: u64,
    pub initial_delay_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for RolloverConfig {
    fn default() -> Self {
        Self {
            enable: false,
            patterns: Vec::new(),
            body: r#"{"conditions":{"max_size":"20gb"}}"#.into(),
            interval_secs: 30 * 60,
            initial_delay_secs: 60,
            request_timeout_secs: 60,
        }
    }
}

/// 解析 `"512"`、`"10kb"`、`"20gb"`、`"1.5tb"`（1024 进制，大小写不敏感）
pub fn parse_bytes(s: &str) -> Result<u64> {
    let t = s.trim().to_ascii_lowercase();
    let split = t
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(t.len());
    let (num, unit) = t.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| Error::Config(format!("invalid byte size {s:?}")))?;
    let mul: u64 = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        "t" | "tb" => 1 << 40,
        "p" | "pb" => 1 << 50,
        other => return Err(Error::Config(format!("invalid byte unit {other:?} in {s:?}"))),
    };
    Ok((value * mul as f64) as u64)
}

fn de_bytes<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
    }
    match Raw::deserialize(d)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(s) => parse_bytes(&s).map_err(serde::de::Error::custom),
    }
}
