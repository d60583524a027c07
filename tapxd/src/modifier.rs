//! Stateless HTTP request rewriter.
//!
//! Order matters: configured headers and params are applied first, then the
//! matcher filters may drop the request, then the method/URL allow lists,
//! and finally URL and header rewrites. An empty return means "drop this
//! message".

use base64::Engine as _;

use tapx_core::config::ModifierConfig;
use tapx_core::matchers::{self, CompiledRules};

use crate::proto;

pub struct HttpModifier {
    rules: CompiledRules,
}

impl HttpModifier {
    /// `None` when no rule is configured, so the emitter can skip the
    /// rewrite pass entirely.
    pub fn new(config: &ModifierConfig) -> anyhow::Result<Option<HttpModifier>> {
        if config.is_empty() {
            return Ok(None);
        }
        Ok(Some(HttpModifier {
            rules: matchers::compile(config)?,
        }))
    }

    pub fn rewrite(&self, payload: Vec<u8>) -> Vec<u8> {
        if !proto::has_request_title(&payload) {
            return payload;
        }

        let payload = self.apply_headers_and_params(payload);
        let payload = match self.matcher_filter(payload) {
            Some(payload) => payload,
            None => return Vec::new(),
        };
        let payload = match self.apply_allow_lists(payload) {
            Some(payload) => payload,
            None => return Vec::new(),
        };
        let payload = self.apply_url_rewrite(payload);
        self.apply_header_rewrite(payload)
    }

    fn apply_headers_and_params(&self, mut payload: Vec<u8>) -> Vec<u8> {
        for (name, value) in &self.rules.headers {
            payload = proto::set_header(&payload, name.as_bytes(), value);
        }
        for (name, value) in &self.rules.params {
            payload = proto::set_path_param(&payload, name, value);
        }
        payload
    }

    /// `None` drops the request.
    fn matcher_filter(&self, payload: Vec<u8>) -> Option<Vec<u8>> {
        if self.url_negative_matches(&payload)
            || self.header_filters_reject(&payload)
            || self.header_negative_matches(&payload)
            || self.basic_auth_rejects(&payload)
            || self.header_hash_rejects(&payload)
            || self.param_hash_rejects(&payload)
        {
            return None;
        }
        Some(payload)
    }

    fn apply_allow_lists(&self, payload: Vec<u8>) -> Option<Vec<u8>> {
        if !self.rules.methods.is_empty() {
            let method = proto::method(&payload);
            if !self.rules.methods.iter().any(|m| m == method) {
                return None;
            }
        }
        if !self.rules.url_regexp.is_empty() {
            let path = proto::path(&payload);
            if !self.rules.url_regexp.iter().any(|re| re.is_match(path)) {
                return None;
            }
        }
        Some(payload)
    }

    fn apply_url_rewrite(&self, payload: Vec<u8>) -> Vec<u8> {
        let path = proto::path(&payload);
        for rule in &self.rules.url_rewrite {
            if rule.regex.is_match(path) {
                let rewritten = rule.regex.replace_all(path, rule.target.as_slice());
                return proto::set_path(&payload, &rewritten);
            }
        }
        payload
    }

    fn apply_header_rewrite(&self, mut payload: Vec<u8>) -> Vec<u8> {
        for rule in &self.rules.header_rewrite {
            let value = proto::header(&payload, rule.header.as_bytes());
            if value.is_empty() {
                break;
            }
            if rule.regex.is_match(value) {
                let rewritten = rule.regex.replace_all(value, rule.target.as_slice());
                let rewritten = rewritten.into_owned();
                payload = proto::set_header(&payload, rule.header.as_bytes(), &rewritten);
            }
        }
        payload
    }

    fn url_negative_matches(&self, payload: &[u8]) -> bool {
        if self.rules.url_negative_regexp.is_empty() {
            return false;
        }
        let path = proto::path(payload);
        self.rules
            .url_negative_regexp
            .iter()
            .any(|re| re.is_match(path))
    }

    /// Required-header filters: reject when a header is missing or fails to
    /// match.
    fn header_filters_reject(&self, payload: &[u8]) -> bool {
        self.rules.header_filters.iter().any(|filter| {
            let value = proto::header(payload, filter.name.as_bytes());
            value.is_empty() || !filter.regex.is_match(value)
        })
    }

    fn header_negative_matches(&self, payload: &[u8]) -> bool {
        self.rules.header_negative_filters.iter().any(|filter| {
            let value = proto::header(payload, filter.name.as_bytes());
            !value.is_empty() && filter.regex.is_match(value)
        })
    }

    fn basic_auth_rejects(&self, payload: &[u8]) -> bool {
        if self.rules.header_basic_auth_filters.is_empty() {
            return false;
        }
        let value = proto::header(payload, b"Authorization");
        if value.is_empty() {
            return false;
        }
        let Some(encoded) = value.strip_prefix(b"Basic ") else {
            return false;
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
            return true;
        };
        self.rules
            .header_basic_auth_filters
            .iter()
            .any(|re| !re.is_match(&decoded))
    }

    /// Keeps a value when `fnv32a(value) % 100 < percent`.
    fn header_hash_rejects(&self, payload: &[u8]) -> bool {
        self.rules.header_hash_filters.iter().any(|filter| {
            let value = proto::header(payload, filter.name.as_bytes());
            !value.is_empty() && proto::fnv32a(value) % 100 >= filter.percent
        })
    }

    fn param_hash_rejects(&self, payload: &[u8]) -> bool {
        self.rules.param_hash_filters.iter().any(|filter| {
            let (value, start, _) = proto::path_param(payload, &filter.name);
            start != -1 && proto::fnv32a(value) % 100 >= filter.percent
        })
    }
}
