//! The glue: binds the compiled pipeline configuration, response cache,
//! upstream registry and admission limiter into the single `Engine` entry
//! point every server front-end calls, mirroring the teacher's `Engine`
//! (formerly `engine.rs`'s `handle_packet`/`handle_packet_fast`) but built
//! on the new matcher/cache/transport/pipeline subsystems instead of
//! `moka` + the ad hoc `Decision` types that lived here before.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use bytes::Bytes;
use hickory_proto::op::{DNSClass, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tracing::{info, warn};

use crate::cache::redis::RedisCache;
use crate::cache::ResponseCache;
use crate::config::{self, CacheBackend, GlobalSettings, PipelineConfig};
use crate::limiter::ConcurrentLimiter;
use crate::matcher::{
    domain::DomainMixer, eval_match_chain, ip::IpList, FieldMatcher, MatchOperator, QueryFields, ResponseFields,
};
use crate::pipeline::{ClientMeta, DeferredAction, QueryContext, QueryStatus};
use crate::transport::TransportCtx;
use crate::upstreams::UpstreamRegistry;

/// Default TTL handed to a synthetic `StaticIpResponse` answer: there is no
/// upstream record to copy a TTL from.
const STATIC_ANSWER_TTL: u32 = 60;

// ---------------------------------------------------------------------
// Compiled configuration
// ---------------------------------------------------------------------

enum CompiledMatcherKind {
    Field(FieldMatcher),
    ListenerLabel(String),
}

struct CompiledSelectRule {
    pipeline: String,
    matchers: Vec<(MatchOperator, CompiledMatcherKind)>,
}

struct CompiledRule {
    name: String,
    matchers: Vec<(MatchOperator, FieldMatcher)>,
    actions: Vec<config::Action>,
    response_matchers: Vec<(MatchOperator, FieldMatcher)>,
    response_actions_on_match: Vec<config::Action>,
    response_actions_on_miss: Vec<config::Action>,
}

struct CompiledPipeline {
    id: String,
    rules: Vec<CompiledRule>,
}

pub struct CompiledConfig {
    pub settings: GlobalSettings,
    select_rules: Vec<CompiledSelectRule>,
    pipelines: HashMap<String, CompiledPipeline>,
}

impl CompiledConfig {
    pub fn compile(cfg: PipelineConfig) -> Result<Self> {
        let mut pipelines = HashMap::new();
        for p in cfg.pipelines {
            let mut rules = Vec::with_capacity(p.rules.len());
            for r in p.rules {
                rules.push(compile_rule(r)?);
            }
            pipelines.insert(p.id.clone(), CompiledPipeline { id: p.id, rules });
        }

        let mut select_rules = Vec::with_capacity(cfg.pipeline_select.len());
        for s in cfg.pipeline_select {
            let matchers = fold_operator(s.matchers, s.matcher_operator)
                .into_iter()
                .map(|(op, m)| Ok((op, compile_matcher_kind(m)?)))
                .collect::<Result<Vec<_>>>()?;
            select_rules.push(CompiledSelectRule {
                pipeline: s.pipeline,
                matchers,
            });
        }

        // Fatal-at-load validation (spec.md §7): the default upstream must
        // parse even if no query ever falls through to it.
        crate::transport::UpstreamAddr::parse(&cfg.settings.default_upstream)
            .context("settings.default_upstream")?;

        Ok(Self {
            settings: cfg.settings,
            select_rules,
            pipelines,
        })
    }

    /// Picks the first pipeline whose selector matches, falling back to a
    /// pipeline literally named `"default"`, and finally to the first
    /// pipeline declared, so a config with no `pipeline_select` entries
    /// still has somewhere to route queries.
    fn select_pipeline(&self, fields: &QueryFields, listener_label: &str) -> Option<&CompiledPipeline> {
        for rule in &self.select_rules {
            let matched = eval_match_chain(&rule.matchers, |m: &CompiledMatcherKind| match m {
                CompiledMatcherKind::ListenerLabel(value) => value == listener_label,
                CompiledMatcherKind::Field(fm) => fm.matches_query(fields),
            });
            if matched {
                if let Some(p) = self.pipelines.get(&rule.pipeline) {
                    return Some(p);
                }
            }
        }
        self.pipelines
            .get("default")
            .or_else(|| self.pipelines.values().next())
    }
}

trait HasOperator {
    type Inner;
    fn operator(&self) -> config::MatchOperator;
    fn set_operator(&mut self, op: config::MatchOperator);
    fn into_inner(self) -> Self::Inner;
}

impl HasOperator for config::MatcherWithOp {
    type Inner = config::Matcher;
    fn operator(&self) -> config::MatchOperator {
        self.operator
    }
    fn set_operator(&mut self, op: config::MatchOperator) {
        self.operator = op;
    }
    fn into_inner(self) -> config::Matcher {
        self.matcher
    }
}

/// If every entry in `entries` left its own operator at the default `And`,
/// a non-default rule-level operator is applied to all of them uniformly;
/// otherwise per-entry operators win. Lets a rule express either "one
/// shared operator for the whole chain" or "a mixed chain" without two
/// separate config shapes. Converts from the deserialized config's
/// operator enum to the matcher engine's own (structurally identical but
/// distinct) enum as the final step.
fn fold_operator<T>(mut entries: Vec<T>, rule_operator: config::MatchOperator) -> Vec<(MatchOperator, T::Inner)>
where
    T: HasOperator,
{
    let all_default = entries.iter().all(|e| e.operator() == config::MatchOperator::And);
    if all_default && rule_operator != config::MatchOperator::And {
        for e in &mut entries {
            e.set_operator(rule_operator);
        }
    }
    entries
        .into_iter()
        .map(|e| (conv_op(e.operator()), e.into_inner()))
        .collect()
}

fn conv_op(op: config::MatchOperator) -> MatchOperator {
    match op {
        config::MatchOperator::And => MatchOperator::And,
        config::MatchOperator::Or => MatchOperator::Or,
        config::MatchOperator::AndNot => MatchOperator::AndNot,
        config::MatchOperator::OrNot => MatchOperator::OrNot,
    }
}

fn compile_rule(r: config::Rule) -> Result<CompiledRule> {
    let matchers = fold_operator(r.matchers, r.matcher_operator)
        .into_iter()
        .map(|(op, m)| Ok((op, compile_field_matcher(m)?)))
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("rule {}", r.name))?;

    let response_matchers = fold_operator(r.response_matchers, r.response_matcher_operator)
        .into_iter()
        .map(|(op, m)| Ok((op, compile_field_matcher(m)?)))
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("rule {} (response)", r.name))?;

    Ok(CompiledRule {
        name: r.name,
        matchers,
        actions: r.actions,
        response_matchers,
        response_actions_on_match: r.response_actions_on_match,
        response_actions_on_miss: r.response_actions_on_miss,
    })
}

fn compile_matcher_kind(m: config::Matcher) -> Result<CompiledMatcherKind> {
    if let config::Matcher::ListenerLabel { value } = m {
        return Ok(CompiledMatcherKind::ListenerLabel(value));
    }
    Ok(CompiledMatcherKind::Field(compile_field_matcher(m)?))
}

fn compile_field_matcher(m: config::Matcher) -> Result<FieldMatcher> {
    Ok(match m {
        config::Matcher::Any => FieldMatcher::Any,
        // Only meaningful inside pipeline_select; compile_matcher_kind
        // intercepts it before it reaches here. Elsewhere, never match.
        config::Matcher::ListenerLabel { .. } => FieldMatcher::Qname(DomainMixer::new()),
        config::Matcher::Qname { pattern } => {
            let mut mixer = DomainMixer::new();
            mixer.push_pattern(&pattern)?;
            FieldMatcher::Qname(mixer)
        }
        config::Matcher::Qtype { values } => {
            let types = values
                .iter()
                .map(|v| {
                    RecordType::from_str(&v.to_ascii_uppercase())
                        .map_err(|e| anyhow!("unknown qtype {v}: {e}"))
                })
                .collect::<Result<Vec<_>>>()?;
            FieldMatcher::Qtype(types)
        }
        config::Matcher::Qclass { value } => {
            let classes = value
                .split(',')
                .map(|v| crate::matcher::parse_dns_class(v.trim()))
                .collect::<Result<Vec<_>>>()?;
            FieldMatcher::Qclass(classes)
        }
        config::Matcher::ClientIp { cidr } => FieldMatcher::ClientIp(compile_ip_list(&cidr)?),
        config::Matcher::EdnsEcsIp { cidr } => FieldMatcher::EdnsEcsIp(compile_ip_list(&cidr)?),
        config::Matcher::EdnsPresent { expect } => FieldMatcher::EdnsPresent(expect),
        config::Matcher::Rcode { values } => {
            let codes = values
                .iter()
                .map(|v| crate::matcher::parse_rcode(v).ok_or_else(|| anyhow!("unknown rcode {v}")))
                .collect::<Result<Vec<_>>>()?;
            FieldMatcher::ResponseRcode(codes)
        }
        config::Matcher::ResponseCname { pattern } => {
            let mut mixer = DomainMixer::new();
            mixer.push_pattern(&pattern)?;
            FieldMatcher::ResponseCname(mixer)
        }
        config::Matcher::ResponseIp { cidr } => FieldMatcher::ResponseIp(compile_ip_list(&cidr)?),
    })
}

fn compile_ip_list(cidr: &str) -> Result<IpList> {
    let mut list = IpList::new();
    for part in cidr.split(',') {
        let part = part.trim();
        if !part.is_empty() {
            list.push_str(part)?;
        }
    }
    list.sort();
    Ok(list)
}

/// Re-runs the same compile step purely for validation, surfacing fatal
/// configuration errors (spec.md §7) at load time rather than at first use.
pub fn validate_config(cfg: &PipelineConfig) -> Result<()> {
    CompiledConfig::compile(cfg.clone())?;
    Ok(())
}

// ---------------------------------------------------------------------
// Cache backend indirection
// ---------------------------------------------------------------------

pub enum CacheImpl {
    Memory(ResponseCache),
    Redis(RedisCache),
}

impl CacheImpl {
    pub fn new(settings: &GlobalSettings) -> Result<Self> {
        Ok(match &settings.cache_backend {
            CacheBackend::Memory => {
                CacheImpl::Memory(ResponseCache::new(settings.cache_capacity, settings.cache_shards))
            }
            CacheBackend::Redis { url } => CacheImpl::Redis(RedisCache::new(url)?),
        })
    }

    pub fn fingerprint(question: &Message, branch: &str) -> String {
        ResponseCache::fingerprint(question, branch)
    }

    /// Returns `(bytes, was_stale)`. The Redis backend never reports
    /// staleness: its own key TTL already enforces expiration, so a hit
    /// there is fresh by construction.
    pub async fn get_with_staleness(&self, key: &str, allow_expired: bool) -> Option<(Bytes, bool)> {
        match self {
            CacheImpl::Memory(c) => c.get_with_staleness(key, allow_expired),
            CacheImpl::Redis(c) => c.get(key).await.map(|b| (b, false)),
        }
    }

    pub fn try_begin_refresh(&self, key: &str) -> bool {
        match self {
            CacheImpl::Memory(c) => c.try_begin_refresh(key),
            // Lazy refresh is an in-process single-flight concept; the
            // Redis backend relies on its own key TTL instead.
            CacheImpl::Redis(_) => false,
        }
    }

    pub fn end_refresh(&self, key: &str) {
        if let CacheImpl::Memory(c) = self {
            c.end_refresh(key);
        }
    }

    pub fn clean_expired(&self) -> usize {
        match self {
            CacheImpl::Memory(c) => c.clean_expired(),
            CacheImpl::Redis(_) => 0,
        }
    }
}

fn min_ttl(msg: &Message) -> u32 {
    msg.answers().iter().map(|r| r.ttl()).min().unwrap_or(0)
}

/// Builds the deferred action that stores a freshly fetched/produced
/// response in the cache. Runs inline for the in-memory backend; fires a
/// detached task for Redis so a network round trip doesn't hold up the
/// client's response.
fn store_deferred(
    cache: Arc<CacheImpl>,
    key: String,
    msg: Message,
    stored_at: SystemTime,
    lazy: bool,
    lazy_ttl_secs: u64,
) -> DeferredAction {
    Box::new(move |_qctx: &QueryContext| {
        if msg.response_code() != ResponseCode::NoError || msg.truncated() || msg.answers().is_empty() {
            return;
        }
        let ttl_secs = if lazy { lazy_ttl_secs } else { min_ttl(&msg) as u64 };
        let expires_at = stored_at + Duration::from_secs(ttl_secs.max(1));
        match cache.as_ref() {
            CacheImpl::Memory(c) => c.store(&key, &msg, stored_at, expires_at),
            CacheImpl::Redis(_) => {
                tokio::spawn(async move {
                    if let CacheImpl::Redis(c) = cache.as_ref() {
                        if let Ok(wire) = msg.to_bytes() {
                            c.set(&key, stored_at, expires_at, &wire).await;
                        }
                    }
                });
            }
        }
    })
}

// ---------------------------------------------------------------------
// Request/response phase evaluation
// ---------------------------------------------------------------------

enum Decision {
    /// `upstream.is_empty()` means "use the global default upstream".
    Forward { upstream: String },
    Static { rcode: ResponseCode, answers: Vec<Record> },
}

/// Per-query fields, owned: `matcher::QueryFields` borrows its qname, so
/// this holds the backing `String` alive for exactly as long as the
/// `QueryFields` view into it is needed.
struct OwnedQueryFields {
    qname: String,
    qtype: RecordType,
    qclass: DNSClass,
    client_ip: IpAddr,
    edns_present: bool,
}

impl OwnedQueryFields {
    fn as_fields(&self) -> QueryFields<'_> {
        QueryFields {
            qname: &self.qname,
            qtype: self.qtype,
            qclass: self.qclass,
            client_ip: self.client_ip,
            // EDNS client-subnet option parsing isn't implemented yet
            // (see DESIGN.md); EdnsEcsIp matchers never match as a result.
            ecs_ip: None,
            edns_present: self.edns_present,
        }
    }
}

fn build_owned_fields(question: &Message, client_ip: IpAddr) -> Option<OwnedQueryFields> {
    let query = question.queries().first()?;
    Some(OwnedQueryFields {
        qname: query.name().to_utf8(),
        qtype: query.query_type(),
        qclass: DNSClass::from(query.query_class()),
        client_ip,
        edns_present: question.edns().is_some(),
    })
}

/// Walks `pipeline`'s rules in order, executing each matched rule's
/// actions; `JumpToPipeline` switches to another compiled pipeline's rule
/// list (bounded by `settings.response_jump_limit`), `Continue` moves on
/// to the next rule, and every other action is terminal. Falling off the
/// end of a pipeline with no terminal action is the same as an explicit
/// `Allow`: forward to the default upstream.
fn apply_rules(cfg: &CompiledConfig, start: &CompiledPipeline, fields: &QueryFields) -> Decision {
    let mut pipeline = start;
    let mut jumps = 0u32;
    loop {
        let mut decision = None;
        let mut jump_target = None;
        for rule in &pipeline.rules {
            let matched = eval_match_chain(&rule.matchers, |fm: &FieldMatcher| fm.matches_query(fields));
            if !matched {
                continue;
            }
            let mut terminated = false;
            for action in &rule.actions {
                match action {
                    config::Action::Log { level } => log_action(level.as_deref(), &rule.name, fields.qname),
                    config::Action::StaticResponse { rcode } => {
                        let rc = crate::matcher::parse_rcode(rcode).unwrap_or(ResponseCode::ServFail);
                        decision = Some(Decision::Static { rcode: rc, answers: Vec::new() });
                        terminated = true;
                    }
                    config::Action::StaticIpResponse { ip } => {
                        decision = Some(make_static_ip_decision(fields.qname, ip));
                        terminated = true;
                    }
                    config::Action::Deny => {
                        decision = Some(Decision::Static { rcode: ResponseCode::Refused, answers: Vec::new() });
                        terminated = true;
                    }
                    config::Action::Allow => {
                        decision = Some(Decision::Forward { upstream: String::new() });
                        terminated = true;
                    }
                    config::Action::Forward { upstream } => {
                        decision = Some(Decision::Forward { upstream: upstream.clone().unwrap_or_default() });
                        terminated = true;
                    }
                    config::Action::JumpToPipeline { pipeline: target } => {
                        jump_target = Some(target.clone());
                        terminated = true;
                    }
                    config::Action::Continue => {}
                }
                if terminated {
                    break;
                }
            }
            if terminated {
                break;
            }
        }

        if let Some(decision) = decision {
            return decision;
        }
        if let Some(target) = jump_target {
            jumps += 1;
            if jumps > cfg.settings.response_jump_limit {
                warn!(event = "jump_limit_exceeded", qname = fields.qname, "pipeline jump limit exceeded");
                return Decision::Static { rcode: ResponseCode::ServFail, answers: Vec::new() };
            }
            match cfg.pipelines.get(&target) {
                Some(next) => {
                    pipeline = next;
                    continue;
                }
                None => {
                    warn!(event = "jump_target_missing", pipeline = %target, "jump target pipeline not found");
                    return Decision::Static { rcode: ResponseCode::ServFail, answers: Vec::new() };
                }
            }
        }
        return Decision::Forward { upstream: String::new() };
    }
}

fn make_static_ip_decision(qname: &str, ip: &str) -> Decision {
    let name = match Name::from_str(qname) {
        Ok(n) => n,
        Err(_) => return Decision::Static { rcode: ResponseCode::FormErr, answers: Vec::new() },
    };
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let rec = Record::from_rdata(name, STATIC_ANSWER_TTL, RData::A(A(v4)));
            Decision::Static { rcode: ResponseCode::NoError, answers: vec![rec] }
        }
        Ok(IpAddr::V6(v6)) => {
            let rec = Record::from_rdata(name, STATIC_ANSWER_TTL, RData::AAAA(AAAA(v6)));
            Decision::Static { rcode: ResponseCode::NoError, answers: vec![rec] }
        }
        Err(_) => Decision::Static { rcode: ResponseCode::ServFail, answers: Vec::new() },
    }
}

fn log_action(level: Option<&str>, rule: &str, qname: &str) {
    match level.unwrap_or("info") {
        "trace" => tracing::trace!(rule, qname, "rule matched"),
        "debug" => tracing::debug!(rule, qname, "rule matched"),
        "warn" => tracing::warn!(rule, qname, "rule matched"),
        "error" => tracing::error!(rule, qname, "rule matched"),
        _ => tracing::info!(rule, qname, "rule matched"),
    }
}

/// Response-phase rule sweep: every rule with response matchers gets
/// evaluated against the fetched message, running its on-match or on-miss
/// action list. Only `Log` has an observable effect today — response-phase
/// `Forward`/`JumpToPipeline` re-routing would require re-encoding the
/// already-fetched message and is left for a future iteration.
fn apply_response_actions(pipeline: &CompiledPipeline, response: &Message, fields: &QueryFields) {
    let resp_fields = ResponseFields { query: fields, message: response };
    for rule in &pipeline.rules {
        if rule.response_matchers.is_empty() {
            continue;
        }
        let matched =
            eval_match_chain(&rule.response_matchers, |fm: &FieldMatcher| fm.matches_response(&resp_fields));
        let actions = if matched {
            &rule.response_actions_on_match
        } else {
            &rule.response_actions_on_miss
        };
        for action in actions {
            if let config::Action::Log { level } = action {
                log_action(level.as_deref(), &rule.name, fields.qname);
            }
        }
    }
}

// ---------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct Engine {
    config: Arc<ArcSwap<CompiledConfig>>,
    cache: Arc<CacheImpl>,
    upstreams: Arc<UpstreamRegistry>,
    pub limiter: Arc<ConcurrentLimiter>,
    listener_label: Arc<str>,
}

impl Engine {
    pub fn new(config: Arc<ArcSwap<CompiledConfig>>, listener_label: String) -> Result<Self> {
        let settings = config.load().settings.clone();
        let cache = Arc::new(CacheImpl::new(&settings)?);
        let limiter = Arc::new(ConcurrentLimiter::new(
            settings.limiter_max_running,
            settings.limiter_max_waiting,
        ));
        Ok(Self {
            config,
            cache,
            upstreams: Arc::new(UpstreamRegistry::new()),
            limiter,
            listener_label: Arc::from(listener_label),
        })
    }

    /// Clones this engine's shared config/cache/upstreams/limiter under a
    /// different listener label, so every protocol front-end (UDP, TCP,
    /// DoT, DoH) can route through `pipeline_select`'s `ListenerLabel`
    /// matcher while sharing one cache and one admission limiter process-wide.
    pub fn with_listener_label(&self, label: impl Into<Arc<str>>) -> Self {
        Self {
            config: self.config.clone(),
            cache: self.cache.clone(),
            upstreams: self.upstreams.clone(),
            limiter: self.limiter.clone(),
            listener_label: label.into(),
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.config.load().settings.query_timeout_ms)
    }

    pub fn cache_sweep_interval_secs(&self) -> i64 {
        self.config.load().settings.sweep_interval_secs
    }

    pub fn sweep_cache(&self) -> usize {
        self.cache.clean_expired()
    }

    /// Parses, routes, and answers one query, returning the wire-format
    /// response bytes. Callers treat a decode failure as a protocol error
    /// (spec.md §7): drop the packet / close the connection rather than
    /// calling this at all for unparseable bytes.
    pub async fn handle_query(&self, packet: &[u8], client_ip: IpAddr, over_stream: bool) -> Result<Bytes> {
        let question = Message::from_bytes(packet).context("decode dns message")?;
        let cfg = self.config.load_full();

        let owned_fields =
            build_owned_fields(&question, client_ip).ok_or_else(|| anyhow!("query missing question section"))?;
        let fields = owned_fields.as_fields();
        let pipeline = cfg
            .select_pipeline(&fields, &self.listener_label)
            .ok_or_else(|| anyhow!("no pipeline configured"))?;

        let fingerprint = CacheImpl::fingerprint(&question, &pipeline.id);
        let mut qctx = QueryContext::new(question.clone(), ClientMeta { addr: client_ip, over_stream });

        if let Some((bytes, stale)) = self
            .cache
            .get_with_staleness(&fingerprint, cfg.settings.lazy_refresh)
            .await
        {
            let bytes = with_restored_id(bytes, question.id());
            if stale {
                self.maybe_spawn_lazy_refresh(fingerprint.clone(), cfg.clone(), pipeline.id.clone(), qctx.fork());
                let bytes = rewrite_ttl_to_one(bytes);
                qctx.response = Some(bytes.clone());
                qctx.status = QueryStatus::Responded;
                qctx.run_deferred();
                return Ok(bytes);
            }
            qctx.response = Some(bytes.clone());
            qctx.status = QueryStatus::Responded;
            qctx.run_deferred();
            return Ok(bytes);
        }

        let bytes = self.resolve_miss(&cfg, pipeline, &fields, &question, &mut qctx).await?;
        qctx.defer(store_deferred(
            self.cache.clone(),
            fingerprint,
            Message::from_bytes(&bytes).unwrap_or_else(|_| question.clone()),
            SystemTime::now(),
            cfg.settings.lazy_refresh,
            cfg.settings.lazy_ttl_secs,
        ));
        qctx.run_deferred();
        Ok(bytes)
    }

    /// Executes the cache-miss branch: request-phase rules -> forward (or
    /// static answer) -> response-phase rules. Shared by the main query
    /// path and the lazy-refresh background task.
    async fn resolve_miss(
        &self,
        cfg: &CompiledConfig,
        pipeline: &CompiledPipeline,
        fields: &QueryFields<'_>,
        question: &Message,
        qctx: &mut QueryContext,
    ) -> Result<Bytes> {
        let decision = apply_rules(cfg, pipeline, fields);
        let bytes = match decision {
            Decision::Static { rcode, answers } => build_response(question, rcode, answers),
            Decision::Forward { upstream } => {
                let upstream = if upstream.is_empty() {
                    cfg.settings.default_upstream.clone()
                } else {
                    upstream
                };
                self.forward(&cfg.settings, &upstream, question, pipeline, fields).await?
            }
        };
        qctx.status = QueryStatus::Responded;
        qctx.response = Some(bytes.clone());
        Ok(bytes)
    }

    async fn forward(
        &self,
        settings: &GlobalSettings,
        upstream_addr: &str,
        question: &Message,
        pipeline: &CompiledPipeline,
        fields: &QueryFields<'_>,
    ) -> Result<Bytes> {
        let transport = self
            .upstreams
            .get_or_build(upstream_addr, settings)
            .await
            .with_context(|| format!("build upstream transport for {upstream_addr}"))?;
        let wire = question.to_bytes().context("encode query")?;
        let ctx = TransportCtx { timeout: Duration::from_millis(settings.query_timeout_ms) };
        let resp_bytes = transport
            .exchange(&ctx, &wire)
            .await
            .map_err(|e| anyhow!("upstream exchange failed: {e}"))?;

        if let Ok(resp_msg) = Message::from_bytes(&resp_bytes) {
            apply_response_actions(pipeline, &resp_msg, fields);
            info!(
                event = "dns_response",
                qname = fields.qname,
                upstream = upstream_addr,
                rcode = ?resp_msg.response_code(),
                "forwarded query"
            );
        } else {
            warn!(event = "dns_response", qname = fields.qname, upstream = upstream_addr, "upstream returned unparsable response");
        }
        Ok(resp_bytes)
    }

    fn maybe_spawn_lazy_refresh(
        &self,
        fingerprint: String,
        cfg: Arc<CompiledConfig>,
        pipeline_id: String,
        forked_ctx: QueryContext,
    ) {
        if !self.cache.try_begin_refresh(&fingerprint) {
            return; // another caller is already refreshing this key
        }
        let engine = self.clone();
        tokio::spawn(async move {
            let deadline = crate::cache::LAZY_REFRESH_DEADLINE;
            let pipeline = match cfg.pipelines.get(&pipeline_id) {
                Some(p) => p,
                None => {
                    engine.cache.end_refresh(&fingerprint);
                    return;
                }
            };
            let question = forked_ctx.question.clone();
            let owned_fields = match build_owned_fields(&question, forked_ctx.client_meta.addr) {
                Some(f) => f,
                None => {
                    engine.cache.end_refresh(&fingerprint);
                    return;
                }
            };
            let fields = owned_fields.as_fields();
            let mut ctx = forked_ctx;
            let result =
                tokio::time::timeout(deadline, engine.resolve_miss(&cfg, pipeline, &fields, &question, &mut ctx))
                    .await;
            if let Ok(Ok(bytes)) = result {
                if let Ok(msg) = Message::from_bytes(&bytes) {
                    let deferred = store_deferred(
                        engine.cache.clone(),
                        fingerprint.clone(),
                        msg,
                        SystemTime::now(),
                        cfg.settings.lazy_refresh,
                        cfg.settings.lazy_ttl_secs,
                    );
                    deferred(&ctx);
                }
            }
            engine.cache.end_refresh(&fingerprint);
        });
    }
}

fn with_restored_id(bytes: Bytes, id: u16) -> Bytes {
    if bytes.len() < 2 {
        return bytes;
    }
    let mut out = bytes.to_vec();
    out[0] = (id >> 8) as u8;
    out[1] = (id & 0xff) as u8;
    Bytes::from(out)
}

fn rewrite_ttl_to_one(bytes: Bytes) -> Bytes {
    let Ok(mut msg) = Message::from_bytes(&bytes) else { return bytes };
    for rec in msg.answers_mut() {
        rec.set_ttl(1);
    }
    for rec in msg.name_servers_mut() {
        rec.set_ttl(1);
    }
    for rec in msg.additionals_mut() {
        rec.set_ttl(1);
    }
    msg.to_bytes().map(Bytes::from).unwrap_or(bytes)
}

fn build_response(question: &Message, rcode: ResponseCode, answers: Vec<Record>) -> Bytes {
    let mut resp = Message::new();
    resp.set_id(question.id());
    resp.set_message_type(MessageType::Response);
    resp.set_op_code(OpCode::Query);
    resp.set_response_code(rcode);
    resp.set_recursion_desired(question.recursion_desired());
    resp.set_recursion_available(true);
    for q in question.queries() {
        resp.add_query(q.clone());
    }
    for a in answers {
        resp.add_answer(a);
    }
    Bytes::from(resp.to_bytes().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compiled(settings_extra: serde_json::Value) -> Arc<CompiledConfig> {
        let mut base = json!({
            "settings": { "default_upstream": "udp://127.0.0.1:5300" },
            "pipelines": [
                { "id": "default", "rules": [] }
            ]
        });
        if let Some(obj) = settings_extra.as_object() {
            let settings = base.get_mut("settings").unwrap().as_object_mut().unwrap();
            for (k, v) in obj {
                settings.insert(k.clone(), v.clone());
            }
        }
        let cfg: PipelineConfig = serde_json::from_value(base).unwrap();
        Arc::new(CompiledConfig::compile(cfg).unwrap())
    }

    #[test]
    fn compile_rejects_bad_default_upstream() {
        let cfg: PipelineConfig = serde_json::from_value(json!({
            "settings": { "default_upstream": "not-a-url" }
        }))
        .unwrap();
        assert!(CompiledConfig::compile(cfg).is_err());
    }

    #[test]
    fn select_pipeline_falls_back_to_default_name() {
        let cfg = compiled(json!({}));
        let question = tests_support::sample_query();
        let owned = build_owned_fields(&question, "127.0.0.1".parse().unwrap()).unwrap();
        let picked = cfg.select_pipeline(&owned.as_fields(), "default");
        assert!(picked.is_some());
    }

    #[test]
    fn apply_rules_falls_through_to_forward_default() {
        let cfg = compiled(json!({}));
        let question = tests_support::sample_query();
        let owned = build_owned_fields(&question, "127.0.0.1".parse().unwrap()).unwrap();
        let pipeline = cfg.pipelines.get("default").unwrap();
        match apply_rules(&cfg, pipeline, &owned.as_fields()) {
            Decision::Forward { upstream } => assert!(upstream.is_empty()),
            Decision::Static { .. } => panic!("expected forward fallback"),
        }
    }

    #[test]
    fn jump_to_missing_pipeline_returns_servfail() {
        let raw = json!({
            "settings": { "default_upstream": "udp://127.0.0.1:5300" },
            "pipelines": [
                {
                    "id": "default",
                    "rules": [
                        {
                            "name": "jump",
                            "matchers": [ { "type": "any" } ],
                            "actions": [ { "type": "jump_to_pipeline", "pipeline": "missing" } ]
                        }
                    ]
                }
            ]
        });
        let cfg: PipelineConfig = serde_json::from_value(raw).unwrap();
        let cfg = CompiledConfig::compile(cfg).unwrap();
        let question = tests_support::sample_query();
        let owned = build_owned_fields(&question, "127.0.0.1".parse().unwrap()).unwrap();
        let pipeline = cfg.pipelines.get("default").unwrap();
        match apply_rules(&cfg, pipeline, &owned.as_fields()) {
            Decision::Static { rcode, .. } => assert_eq!(rcode, ResponseCode::ServFail),
            Decision::Forward { .. } => panic!("expected servfail on missing jump target"),
        }
    }

    #[test]
    fn make_static_ip_decision_builds_a_record() {
        match make_static_ip_decision("example.com.", "198.51.100.7") {
            Decision::Static { rcode, answers } => {
                assert_eq!(rcode, ResponseCode::NoError);
                assert_eq!(answers.len(), 1);
            }
            Decision::Forward { .. } => panic!("expected static decision"),
        }
    }

    #[test]
    fn build_response_copies_question_and_id() {
        let question = tests_support::sample_query();
        let bytes = build_response(&question, ResponseCode::NXDomain, Vec::new());
        let parsed = Message::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.id(), question.id());
        assert_eq!(parsed.response_code(), ResponseCode::NXDomain);
    }

    #[test]
    fn rewrite_ttl_to_one_caps_every_answer() {
        let mut msg = tests_support::sample_query();
        msg.set_message_type(MessageType::Response);
        let name = Name::from_str("example.com.").unwrap();
        msg.add_answer(Record::from_rdata(name, 300, RData::A(A::new(1, 2, 3, 4))));
        let bytes = Bytes::from(msg.to_bytes().unwrap());
        let rewritten = rewrite_ttl_to_one(bytes);
        let parsed = Message::from_bytes(&rewritten).unwrap();
        assert_eq!(parsed.answers()[0].ttl(), 1);
    }
}

#[cfg(test)]
mod tests_support {
    use hickory_proto::op::{Message, MessageType, OpCode, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    pub fn sample_query() -> Message {
        let mut msg = Message::new();
        msg.set_id(7);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_str("example.com.").unwrap(), RecordType::A));
        msg
    }
}
