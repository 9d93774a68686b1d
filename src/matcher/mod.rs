pub mod domain;
pub mod fileformat;
pub mod ip;
pub mod loadcache;

use anyhow::Result;
use hickory_proto::op::{DNSClass, Message, ResponseCode};
use hickory_proto::rr::{RData, RecordType};
use std::net::IpAddr;

use domain::DomainMixer;
use ip::IpList;

/// A single query-phase field matcher, generalizing kixdns's
/// `RuntimeMatcher` enum to the full set described for the query-field
/// matcher family: qname, qtype/qclass, client-ip/edns-ecs-ip, and the
/// response-phase rcode/cname/ip fields evaluated against a fetched answer.
#[derive(Debug)]
pub enum FieldMatcher {
    Any,
    Qname(DomainMixer),
    Qtype(Vec<RecordType>),
    Qclass(Vec<DNSClass>),
    ClientIp(IpList),
    EdnsEcsIp(IpList),
    EdnsPresent(bool),
    ResponseRcode(Vec<ResponseCode>),
    ResponseCname(DomainMixer),
    ResponseIp(IpList),
}

/// Inputs available when evaluating a query-phase matcher.
pub struct QueryFields<'a> {
    pub qname: &'a str,
    pub qtype: RecordType,
    pub qclass: DNSClass,
    pub client_ip: IpAddr,
    pub ecs_ip: Option<IpAddr>,
    pub edns_present: bool,
}

/// Inputs available when evaluating a response-phase matcher: the query
/// fields plus the fetched message.
pub struct ResponseFields<'a> {
    pub query: &'a QueryFields<'a>,
    pub message: &'a Message,
}

impl FieldMatcher {
    pub fn matches_query(&self, f: &QueryFields) -> bool {
        match self {
            FieldMatcher::Any => true,
            FieldMatcher::Qname(mixer) => mixer.matches(f.qname),
            FieldMatcher::Qtype(types) => types.contains(&f.qtype),
            FieldMatcher::Qclass(classes) => classes.contains(&f.qclass),
            FieldMatcher::ClientIp(list) => list.contains(f.client_ip).unwrap_or(false),
            FieldMatcher::EdnsEcsIp(list) => f
                .ecs_ip
                .map(|ip| list.contains(ip).unwrap_or(false))
                .unwrap_or(false),
            FieldMatcher::EdnsPresent(expect) => f.edns_present == *expect,
            // Response-only matchers never match in the query phase.
            FieldMatcher::ResponseRcode(_)
            | FieldMatcher::ResponseCname(_)
            | FieldMatcher::ResponseIp(_) => false,
        }
    }

    pub fn matches_response(&self, r: &ResponseFields) -> bool {
        match self {
            FieldMatcher::ResponseRcode(codes) => codes.contains(&r.message.response_code()),
            FieldMatcher::ResponseCname(mixer) => r.message.answers().iter().any(|rec| {
                if let Some(RData::CNAME(name)) = rec.data() {
                    mixer.matches(&name.to_utf8())
                } else {
                    false
                }
            }),
            FieldMatcher::ResponseIp(list) => r.message.answers().iter().any(|rec| match rec.data() {
                Some(RData::A(a)) => list.contains(IpAddr::V4(a.0)).unwrap_or(false),
                Some(RData::AAAA(aaaa)) => list.contains(IpAddr::V6(aaaa.0)).unwrap_or(false),
                _ => false,
            }),
            other => other.matches_query(r.query),
        }
    }
}

/// Boolean combination applied across a chain of matcher results, mirroring
/// the left-to-right And/Or/AndNot/OrNot chain evaluation used throughout
/// the pipeline configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOperator {
    And,
    Or,
    AndNot,
    OrNot,
}

pub fn apply_match_operator(op: MatchOperator, mut results: impl Iterator<Item = bool>) -> bool {
    match op {
        MatchOperator::And => results.all(|r| r),
        MatchOperator::Or => results.any(|r| r),
        MatchOperator::AndNot => !results.any(|r| r),
        MatchOperator::OrNot => !results.all(|r| r),
    }
}

/// Evaluates a chain of `(operator, predicate)` entries left to right,
/// seeded by the first entry's predicate; an empty chain evaluates to
/// `true`.
pub fn eval_match_chain<T>(entries: &[(MatchOperator, T)], pred: impl Fn(&T) -> bool) -> bool {
    let mut iter = entries.iter();
    let first = match iter.next() {
        Some((_, item)) => pred(item),
        None => return true,
    };
    let mut acc = first;
    for (op, item) in iter {
        let r = pred(item);
        acc = match op {
            MatchOperator::And => acc && r,
            MatchOperator::Or => acc || r,
            MatchOperator::AndNot => acc && !r,
            MatchOperator::OrNot => acc || !r,
        };
    }
    acc
}

pub fn parse_dns_class(s: &str) -> Result<DNSClass> {
    match s.to_ascii_uppercase().as_str() {
        "IN" => Ok(DNSClass::IN),
        "CH" | "CHAOS" => Ok(DNSClass::CH),
        "HS" => Ok(DNSClass::HS),
        other => Err(anyhow::anyhow!("unknown dns class: {other}")),
    }
}

pub fn parse_rcode(s: &str) -> Option<ResponseCode> {
    match s.to_ascii_uppercase().as_str() {
        "NOERROR" => Some(ResponseCode::NoError),
        "FORMERR" => Some(ResponseCode::FormErr),
        "SERVFAIL" => Some(ResponseCode::ServFail),
        "NXDOMAIN" => Some(ResponseCode::NXDomain),
        "NOTIMP" => Some(ResponseCode::NotImp),
        "REFUSED" => Some(ResponseCode::Refused),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_semantics() {
        assert!(apply_match_operator(MatchOperator::And, vec![true, true].into_iter()));
        assert!(!apply_match_operator(MatchOperator::And, vec![true, false].into_iter()));
        assert!(apply_match_operator(MatchOperator::Or, vec![false, true].into_iter()));
        assert!(apply_match_operator(MatchOperator::AndNot, vec![false, false].into_iter()));
        assert!(!apply_match_operator(MatchOperator::AndNot, vec![true, false].into_iter()));
        assert!(apply_match_operator(MatchOperator::OrNot, vec![false, false].into_iter()));
    }

    #[test]
    fn operator_empty_iterator_boundaries() {
        assert!(apply_match_operator(MatchOperator::And, std::iter::empty()));
        assert!(!apply_match_operator(MatchOperator::Or, std::iter::empty()));
        assert!(apply_match_operator(MatchOperator::AndNot, std::iter::empty()));
        assert!(!apply_match_operator(MatchOperator::OrNot, std::iter::empty()));
    }

    #[test]
    fn eval_match_chain_seeds_from_first_entry() {
        let entries = vec![
            (MatchOperator::And, true),
            (MatchOperator::Or, false),
            (MatchOperator::And, true),
        ];
        assert!(eval_match_chain(&entries, |b| *b));
    }

    #[test]
    fn eval_match_chain_empty_is_true() {
        let entries: Vec<(MatchOperator, bool)> = Vec::new();
        assert!(eval_match_chain(&entries, |b| *b));
    }

    #[test]
    fn dns_class_parsing_accepts_chaos_alias() {
        assert_eq!(parse_dns_class("chaos").unwrap(), DNSClass::CH);
        assert_eq!(parse_dns_class("IN").unwrap(), DNSClass::IN);
        assert!(parse_dns_class("bogus").is_err());
    }
}
