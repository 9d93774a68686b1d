use std::fs;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: GlobalSettings,
    /// 多维优先级的 pipeline 选择规则（按顺序评估）。
    #[serde(default)]
    pub pipeline_select: Vec<PipelineSelectRule>,
    #[serde(default)]
    pub pipelines: Vec<Pipeline>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheBackend {
    Memory,
    Redis { url: String },
}

impl Default for CacheBackend {
    fn default() -> Self {
        CacheBackend::Memory
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSettings {
    /// UDP监听地址，缺省0.0.0.0:5353，避免1024以下端口权限问题。
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    /// TCP监听地址，缺省0.0.0.0:5353。
    #[serde(default = "default_bind_tcp")]
    pub bind_tcp: String,
    /// DoT (DNS-over-TLS) 监听地址；缺省不启用。
    #[serde(default)]
    pub bind_dot: Option<String>,
    /// DoH (DNS-over-HTTPS) 监听地址；缺省不启用。
    #[serde(default)]
    pub bind_doh: Option<String>,
    /// DoT/DoH 证书与私钥路径（PEM），两者均需配置才会启用对应监听器。
    #[serde(default)]
    pub tls_cert_path: Option<String>,
    #[serde(default)]
    pub tls_key_path: Option<String>,
    /// 默认上游，必须带 scheme（udp/tcp/tls/https://host[:port][/path]）。
    #[serde(default = "default_upstream")]
    pub default_upstream: String,
    /// 每条查询的总超时（毫秒），对应 query-timeout（默认 5s）。
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// 响应阶段 Pipeline 跳转上限。
    #[serde(default = "default_response_jump_limit")]
    pub response_jump_limit: u32,
    /// UDP 上游连接池大小（每个上游地址）。
    #[serde(default = "default_udp_pool_size")]
    pub udp_pool_size: usize,
    /// TCP 上游连接池大小（仅 pipelined 模式下的最大并发连接数）。
    #[serde(default = "default_tcp_pool_size")]
    pub tcp_pool_size: usize,
    /// 上游空闲超时（毫秒）。<=0 表示不复用连接（no-reuse 模式）。
    #[serde(default = "default_upstream_idle_timeout_ms")]
    pub upstream_idle_timeout_ms: i64,
    /// 空闲超时>0 时，是否启用单连接多路复用（pipelined）；false 则为顺序复用（sequential）。
    #[serde(default = "default_true")]
    pub upstream_pipeline_enabled: bool,
    /// 响应缓存后端：内存分片 LRU 或 Redis。
    #[serde(default)]
    pub cache_backend: CacheBackend,
    /// 内存缓存总容量（条目数）。
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// 内存缓存分片数。
    #[serde(default = "default_cache_shards")]
    pub cache_shards: usize,
    /// 是否启用懒刷新（过期后先返回 TTL=1 响应，后台单飞刷新）。
    #[serde(default)]
    pub lazy_refresh: bool,
    /// 懒刷新模式下的缓存过期时间（秒），远大于记录本身的 TTL。
    #[serde(default = "default_lazy_ttl_secs")]
    pub lazy_ttl_secs: u64,
    /// 缓存过期清扫周期（秒）；负数表示关闭后台清扫。
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: i64,
    /// 并发限流：同时运行的最大查询数。
    #[serde(default = "default_limiter_max_running")]
    pub limiter_max_running: usize,
    /// 并发限流：等待队列上限，超出则静默丢弃。
    #[serde(default = "default_limiter_max_waiting")]
    pub limiter_max_waiting: usize,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            bind_udp: default_bind_udp(),
            bind_tcp: default_bind_tcp(),
            bind_dot: None,
            bind_doh: None,
            tls_cert_path: None,
            tls_key_path: None,
            default_upstream: default_upstream(),
            query_timeout_ms: default_query_timeout_ms(),
            response_jump_limit: default_response_jump_limit(),
            udp_pool_size: default_udp_pool_size(),
            tcp_pool_size: default_tcp_pool_size(),
            upstream_idle_timeout_ms: default_upstream_idle_timeout_ms(),
            upstream_pipeline_enabled: true,
            cache_backend: CacheBackend::default(),
            cache_capacity: default_cache_capacity(),
            cache_shards: default_cache_shards(),
            lazy_refresh: false,
            lazy_ttl_secs: default_lazy_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            limiter_max_running: default_limiter_max_running(),
            limiter_max_waiting: default_limiter_max_waiting(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pipeline {
    pub id: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub matchers: Vec<MatcherWithOp>,
    #[serde(default = "default_match_operator")]
    pub matcher_operator: MatchOperator,
    #[serde(default)]
    pub actions: Vec<Action>,
    /// 响应阶段匹配器，可根据上游、响应类型、rcode等进行判断。
    #[serde(default)]
    pub response_matchers: Vec<MatcherWithOp>,
    #[serde(default = "default_match_operator")]
    pub response_matcher_operator: MatchOperator,
    /// 响应匹配成功后执行的动作序列。
    #[serde(default)]
    pub response_actions_on_match: Vec<Action>,
    /// 响应匹配失败后执行的动作序列。
    #[serde(default)]
    pub response_actions_on_miss: Vec<Action>,
}

/// A single matcher entry, shared across the request phase, the response
/// phase, and pipeline selection. Which fields a given variant can observe
/// depends on the phase it's evaluated in (see `matcher::FieldMatcher`);
/// response-only variants simply never match during the request phase.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Matcher {
    /// Always matches.
    Any,
    /// Entry-point label matching (from the CLI `--listener-label` flag).
    /// Only meaningful in `pipeline_select`.
    ListenerLabel { value: String },
    /// Query name, matched through the full/domain/keyword/regexp mixer.
    /// A bare pattern (no `full:`/`domain:`/`keyword:`/`regexp:` prefix)
    /// defaults to domain-suffix matching.
    Qname { pattern: String },
    /// Query type mnemonics (A, AAAA, CNAME, ...).
    Qtype { values: Vec<String> },
    /// Query class (IN/CH/HS).
    Qclass { value: String },
    /// Client source IP; comma-separated CIDR list.
    ClientIp { cidr: String },
    /// EDNS client-subnet IP; comma-separated CIDR list.
    EdnsEcsIp { cidr: String },
    /// Whether the query carries an EDNS0 OPT record.
    EdnsPresent { expect: bool },
    /// Response RCODE mnemonics (response phase only).
    Rcode { values: Vec<String> },
    /// Response CNAME target, matched through the domain mixer (response
    /// phase only).
    ResponseCname { pattern: String },
    /// Response A/AAAA answer IPs; comma-separated CIDR list (response
    /// phase only).
    ResponseIp { cidr: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatcherWithOp {
    #[serde(default = "default_match_operator")]
    pub operator: MatchOperator,
    #[serde(flatten)]
    pub matcher: Matcher,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSelectRule {
    pub pipeline: String,
    #[serde(default)]
    pub matchers: Vec<MatcherWithOp>,
    #[serde(default = "default_match_operator")]
    pub matcher_operator: MatchOperator,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// 记录日志，level可选：trace/debug/info/warn/error
    Log { level: Option<String> },
    /// 固定响应rcode（如 NXDOMAIN/NOERROR）。
    StaticResponse { rcode: String },
    /// 返回固定 IP (A/AAAA)。
    StaticIpResponse { ip: String },
    /// 跳转到指定 Pipeline 继续处理。
    JumpToPipeline { pipeline: String },
    /// 终止匹配。请求阶段使用默认上游，响应阶段使用当前响应。
    Allow,
    /// 终止并丢弃（返回 REFUSED）。
    Deny,
    /// 透传上游；upstream为空则使用全局默认；地址必须带 scheme。
    Forward { upstream: Option<String> },
    /// 继续匹配后续规则。响应阶段会复用当前响应结果。
    Continue,
}

#[derive(Debug, Clone, Deserialize, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchOperator {
    And,
    Or,
    #[serde(alias = "not", alias = "and_not", alias = "and-not", alias = "andnot")]
    AndNot,
    #[serde(alias = "or_not", alias = "or-not", alias = "ornot")]
    OrNot,
}

fn default_match_operator() -> MatchOperator {
    MatchOperator::And
}

pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: PipelineConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    crate::engine::validate_config(&cfg)?;

    Ok(cfg)
}

fn default_true() -> bool {
    true
}

fn default_bind_udp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_bind_tcp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_upstream() -> String {
    "udp://1.1.1.1:53".to_string()
}

fn default_query_timeout_ms() -> u64 {
    5_000
}

fn default_response_jump_limit() -> u32 {
    10
}

fn default_udp_pool_size() -> usize {
    4
}

fn default_tcp_pool_size() -> usize {
    16
}

fn default_upstream_idle_timeout_ms() -> i64 {
    10_000
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_cache_shards() -> usize {
    256
}

fn default_lazy_ttl_secs() -> u64 {
    86_400
}

fn default_sweep_interval_secs() -> i64 {
    60
}

fn default_limiter_max_running() -> usize {
    512
}

fn default_limiter_max_waiting() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_action_fields_default_to_empty() {
        let raw = json!({
            "pipelines": [
                {
                    "id": "p1",
                    "rules": [
                        {
                            "name": "rule",
                            "actions": [ { "type": "log", "level": "info" } ]
                        }
                    ]
                }
            ]
        });
        let cfg: PipelineConfig = serde_json::from_value(raw).expect("parse config");
        let rule = &cfg.pipelines[0].rules[0];
        assert!(rule.response_actions_on_match.is_empty());
        assert!(rule.response_actions_on_miss.is_empty());
    }

    #[test]
    fn rule_operator_defaults_to_and_when_omitted() {
        let raw = serde_json::json!({
            "pipelines": [
                {
                    "id": "p1",
                    "rules": [
                        {
                            "name": "rule",
                            "matchers": [ { "type": "any" } ],
                            "actions": [ { "type": "log", "level": "info" } ]
                        }
                    ]
                }
            ]
        });

        let cfg: PipelineConfig = serde_json::from_value(raw).expect("parse config");
        let rule = &cfg.pipelines[0].rules[0];
        assert_eq!(rule.matcher_operator, MatchOperator::And);
        assert_eq!(rule.response_matcher_operator, MatchOperator::And);
    }

    #[test]
    fn settings_fall_back_to_defaults() {
        let cfg: PipelineConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(cfg.settings.bind_udp, "0.0.0.0:5353");
        assert_eq!(cfg.settings.default_upstream, "udp://1.1.1.1:53");
        assert!(matches!(cfg.settings.cache_backend, CacheBackend::Memory));
        assert_eq!(cfg.settings.cache_shards, 256);
    }

    #[test]
    fn redis_backend_parses_url() {
        let raw = json!({ "settings": { "cache_backend": { "type": "redis", "url": "redis://127.0.0.1/" } } });
        let cfg: PipelineConfig = serde_json::from_value(raw).unwrap();
        match cfg.settings.cache_backend {
            CacheBackend::Redis { url } => assert_eq!(url, "redis://127.0.0.1/"),
            _ => panic!("expected redis backend"),
        }
    }
}
