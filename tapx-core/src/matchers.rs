//! Compiled forms of the modifier rule strings.
//!
//! Rules arrive from config as plain strings (`Header:pattern`,
//! `pattern:replacement`, `name:percent`) and are compiled exactly once, at
//! startup, so a bad pattern fails the process instead of a packet.

use anyhow::{anyhow, Context, Result};
use regex::bytes::Regex;

use crate::config::ModifierConfig;

#[derive(Debug)]
pub struct NameMatcher {
    pub name: String,
    pub regex: Regex,
}

#[derive(Debug)]
pub struct RewriteRule {
    pub regex: Regex,
    pub target: Vec<u8>,
}

#[derive(Debug)]
pub struct HeaderRewriteRule {
    pub header: String,
    pub regex: Regex,
    pub target: Vec<u8>,
}

#[derive(Debug)]
pub struct HashFilter {
    pub name: String,
    pub percent: u32,
}

/// All modifier rules in compiled form.
#[derive(Debug, Default)]
pub struct CompiledRules {
    pub headers: Vec<(String, Vec<u8>)>,
    pub params: Vec<(String, Vec<u8>)>,
    pub methods: Vec<Vec<u8>>,
    pub url_regexp: Vec<Regex>,
    pub url_negative_regexp: Vec<Regex>,
    pub url_rewrite: Vec<RewriteRule>,
    pub header_rewrite: Vec<HeaderRewriteRule>,
    pub header_filters: Vec<NameMatcher>,
    pub header_negative_filters: Vec<NameMatcher>,
    pub header_basic_auth_filters: Vec<Regex>,
    pub header_hash_filters: Vec<HashFilter>,
    pub param_hash_filters: Vec<HashFilter>,
}

pub fn compile(config: &ModifierConfig) -> Result<CompiledRules> {
    let mut rules = CompiledRules {
        headers: config
            .headers
            .iter()
            .map(|h| (h.name.clone(), h.value.clone().into_bytes()))
            .collect(),
        params: config
            .params
            .iter()
            .map(|p| (p.name.clone(), p.value.clone().into_bytes()))
            .collect(),
        methods: config
            .methods
            .iter()
            .map(|m| m.clone().into_bytes())
            .collect(),
        ..Default::default()
    };

    for raw in &config.url_regexp {
        rules.url_regexp.push(compile_regex(raw)?);
    }
    for raw in &config.url_negative_regexp {
        rules.url_negative_regexp.push(compile_regex(raw)?);
    }
    for raw in &config.url_rewrite {
        rules.url_rewrite.push(parse_rewrite(raw)?);
    }
    for raw in &config.header_rewrite {
        rules.header_rewrite.push(parse_header_rewrite(raw)?);
    }
    for raw in &config.header_filters {
        rules.header_filters.push(parse_name_matcher(raw)?);
    }
    for raw in &config.header_negative_filters {
        rules.header_negative_filters.push(parse_name_matcher(raw)?);
    }
    for raw in &config.header_basic_auth_filters {
        rules.header_basic_auth_filters.push(compile_regex(raw)?);
    }
    for raw in &config.header_hash_filters {
        rules.header_hash_filters.push(parse_hash_filter(raw)?);
    }
    for raw in &config.param_hash_filters {
        rules.param_hash_filters.push(parse_hash_filter(raw)?);
    }

    Ok(rules)
}

fn compile_regex(raw: &str) -> Result<Regex> {
    Regex::new(raw).with_context(|| format!("invalid regexp: {raw}"))
}

/// `pattern:replacement`, split on the last colon so patterns may contain
/// colons of their own.
fn parse_rewrite(raw: &str) -> Result<RewriteRule> {
    let idx = raw
        .rfind(':')
        .ok_or_else(|| anyhow!("rewrite rule must be pattern:replacement, got {raw}"))?;
    Ok(RewriteRule {
        regex: compile_regex(&raw[..idx])?,
        target: raw[idx + 1..].as_bytes().to_vec(),
    })
}

/// `Header:pattern:replacement`; the header name ends at the first colon,
/// the replacement starts at the last.
fn parse_header_rewrite(raw: &str) -> Result<HeaderRewriteRule> {
    let first = raw
        .find(':')
        .ok_or_else(|| anyhow!("header rewrite must be Header:pattern:replacement, got {raw}"))?;
    let last = raw.rfind(':').unwrap();
    if first == last {
        return Err(anyhow!(
            "header rewrite must be Header:pattern:replacement, got {raw}"
        ));
    }
    Ok(HeaderRewriteRule {
        header: raw[..first].to_string(),
        regex: compile_regex(&raw[first + 1..last])?,
        target: raw[last + 1..].as_bytes().to_vec(),
    })
}

fn parse_name_matcher(raw: &str) -> Result<NameMatcher> {
    let idx = raw
        .find(':')
        .ok_or_else(|| anyhow!("filter must be Name:pattern, got {raw}"))?;
    Ok(NameMatcher {
        name: raw[..idx].to_string(),
        regex: compile_regex(&raw[idx + 1..])?,
    })
}

fn parse_hash_filter(raw: &str) -> Result<HashFilter> {
    let idx = raw
        .rfind(':')
        .ok_or_else(|| anyhow!("hash filter must be name:percent, got {raw}"))?;
    let percent: u32 = raw[idx + 1..]
        .trim_end_matches('%')
        .parse()
        .with_context(|| format!("invalid hash filter percent in {raw}"))?;
    if percent > 100 {
        return Err(anyhow!("hash filter percent must be <= 100, got {percent}"));
    }
    Ok(HashFilter {
        name: raw[..idx].to_string(),
        percent,
    })
}
